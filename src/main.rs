use clap::error::ErrorKind;
use clap::{CommandFactory, Parser};
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::{Command, ExitCode, Stdio};
use tracing::{debug, error, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};
use vpn_slice::platform::get_providers;
use vpn_slice::vpnc::dump;
use vpn_slice::vpnc::env::{process_vars, Reason};
use vpn_slice::vpnc::intent::{parse_routes, RouteSpecError};
use vpn_slice::vpnc::script::{do_post_connect, ScriptError};
use vpn_slice::{handle_script_mode, Config, ConnectMode, Intent, Options, SessionEnv};

#[derive(Parser, Debug)]
#[command(name = "vpn-slice")]
#[command(about = "Easy and secure split-tunnel VPN setup, as a vpnc-script replacement")]
#[command(version)]
struct Cli {
    /// Subnets, hostnames, or aliases (NAME[=NAME...]=ADDR) to route through the VPN
    routes: Vec<String>,

    /// File containing the PID of a process to kill on disconnect (repeatable)
    #[arg(short, long, value_name = "PIDFILE")]
    kill: Vec<PathBuf>,

    /// Print the VPN's connect banner
    #[arg(long)]
    banner: bool,

    /// Allow incoming traffic from the VPN (default is to block it)
    #[arg(short, long)]
    incoming: bool,

    /// Name of this VPN, used to tag /etc/hosts entries (default is $TUNDEV)
    #[arg(short, long)]
    name: Option<String>,

    /// Search domain for unqualified hostnames (repeatable, default is $CISCO_DEF_DOMAIN)
    #[arg(short, long, value_name = "DOMAIN")]
    domain: Vec<String>,

    /// Route the VPN's internal network through the tunnel
    #[arg(short = 'I', long)]
    route_internal: bool,

    /// Route split-include subnets given by the VPN, and keep split-exclude
    /// subnets on their existing routes
    #[arg(short = 'S', long)]
    route_splits: bool,

    /// Do not add looked-up hostnames to /etc/hosts
    #[arg(long)]
    no_host_names: bool,

    /// Only add fully-qualified hostnames to /etc/hosts
    #[arg(long)]
    no_short_names: bool,

    /// Do not add the VPN's nameservers to /etc/hosts
    #[arg(long)]
    no_ns_hosts: bool,

    /// Also route and name the VPN's NBNS (WINS) servers
    #[arg(long)]
    nbns: bool,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Dump the environment variables passed by the caller
    #[arg(short = 'D', long)]
    dump: bool,

    /// Run hostname lookups in the foreground after connect
    #[arg(long)]
    no_fork: bool,

    /// Config file with default options
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Background half of a connect
    #[arg(long, hide = true)]
    post_connect: bool,
}

impl Cli {
    /// Layer the command line over the config file's options
    fn merge_into(&self, mut options: Options) -> Result<Options, RouteSpecError> {
        options.routes.extend(parse_routes(self.routes.as_slice())?);
        options.kill.extend(self.kill.iter().cloned());
        if self.name.is_some() {
            options.name = self.name.clone();
        }
        if !self.domain.is_empty() {
            options
                .domains
                .get_or_insert_with(Vec::new)
                .extend(self.domain.iter().cloned());
        }

        options.banner |= self.banner;
        options.incoming |= self.incoming;
        options.route_internal |= self.route_internal;
        options.route_splits |= self.route_splits;
        options.nbns |= self.nbns;
        options.host_names &= !self.no_host_names;
        options.short_names &= !self.no_short_names;
        options.ns_hosts &= !self.no_ns_hosts;

        Ok(options)
    }

    /// The background post-connect process shares stderr with the
    /// foreground one, which has already shown the dump and warnings
    fn reports_environment(&self) -> bool {
        !self.post_connect
    }

    fn connect_mode(&self, config: &Config) -> ConnectMode {
        if self.post_connect {
            ConnectMode::PostConnectOnly
        } else if config.fork && !self.no_fork {
            ConnectMode::Foreground
        } else {
            ConnectMode::Full
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    // Log to stderr; stdout belongs to the VPN client
    let default_level = if cli.verbose { "debug" } else { "warn" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set up logging: {}", e);
    }

    let vars = process_vars();
    let session = match SessionEnv::from_vars(vars.clone()) {
        Ok(session) => session,
        Err(e) if e.is_usage_error() => {
            Cli::command().error(ErrorKind::ValueValidation, e).exit()
        }
        Err(e) => {
            error!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    match run(&cli, &vars, &session) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli, vars: &HashMap<String, String>, session: &SessionEnv) -> Result<(), ScriptError> {
    let config = Config::discover(cli.config.as_deref())?;
    let options = cli.merge_into(config.to_options()?)?;
    let mode = cli.connect_mode(&config);
    let providers = get_providers()?;

    if cli.reports_environment() {
        if cli.dump {
            dump::dump(vars, session, providers.process.as_ref());
        }
        for warning in session.warnings() {
            warn!("{}", warning);
        }
    }

    let intent = Intent::new(options, session);
    handle_script_mode(session, &intent, &providers, mode)?;

    // Lookups need traffic to flow through the tunnel, which only happens
    // once the VPN client gets control back
    if mode == ConnectMode::Foreground && session.reason == Reason::Connect {
        if let Err(e) = spawn_post_connect() {
            warn!("Could not start background post-connect ({}), running it now", e);
            do_post_connect(session, &intent, &providers)?;
        }
    }

    Ok(())
}

/// Re-run ourselves with the same arguments and environment to do the
/// post-connect work, without waiting for it
fn spawn_post_connect() -> std::io::Result<()> {
    let exe = std::env::current_exe()?;
    let mut command = Command::new(exe);
    command
        .arg("--post-connect")
        .args(std::env::args_os().skip(1))
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::inherit());

    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        command.process_group(0);
    }

    let child = command.spawn()?;
    debug!("Post-connect continues in background process {}", child.id());
    Ok(())
}
