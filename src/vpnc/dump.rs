//! `--dump`: show who called us and with which vpnc-script variables

use crate::platform::ProcessProvider;
use crate::vpnc::env::{SessionEnv, VARIABLES};
use std::collections::HashMap;
use std::path::Path;
use tracing::debug;

const SHELLS: &[&str] = &["dash", "bash", "sh", "tcsh", "csh", "ksh", "zsh"];

/// Describe the process that invoked us, looking through one shell wrapper
/// (VPN clients often run the script via `sh -c`).
pub fn describe_caller(process: &dyn ProcessProvider) -> String {
    let exe_of = |pid: i32| match process.pid2exe(pid) {
        Ok(exe) => exe,
        Err(e) => {
            debug!("Could not find executable of PID {}: {}", pid, e);
            None
        }
    };
    let parent_of = |pid: Option<i32>| match process.ppid_of(pid) {
        Ok(ppid) => ppid,
        Err(e) => {
            debug!("Could not find parent of {:?}: {}", pid, e);
            None
        }
    };

    let Some(mut ppid) = parent_of(None) else {
        return "an unknown process".to_string();
    };
    let mut exe = exe_of(ppid);

    if exe.as_deref().is_some_and(|exe| is_shell(exe)) {
        if let Some(grandparent) = parent_of(Some(ppid)) {
            ppid = grandparent;
            exe = exe_of(ppid);
        }
    }

    match exe {
        Some(exe) => format!("{} (PID {})", exe.display(), ppid),
        None => format!("PID {}", ppid),
    }
}

fn is_shell(exe: &Path) -> bool {
    exe.file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| SHELLS.contains(&name))
}

/// The variable table: each recognized variable that is set, the field it
/// feeds and its raw value, then the reconstructed split lists
pub fn dump_lines(vars: &HashMap<String, String>, env: &SessionEnv) -> Vec<String> {
    let present: Vec<(&str, &str, &str)> = VARIABLES
        .iter()
        .filter_map(|(var, field)| vars.get(*var).map(|value| (*var, *field, value.as_str())))
        .collect();

    let splits = [
        ("CISCO_SPLIT_INC_*", "split_include", &env.split_include),
        ("CISCO_SPLIT_EXC_*", "split_exclude", &env.split_exclude),
    ];

    let width = present
        .iter()
        .map(|(var, _, _)| var.len())
        .chain(
            splits
                .iter()
                .filter(|(_, _, nets)| !nets.is_empty())
                .map(|(var, _, _)| var.len()),
        )
        .max()
        .unwrap_or(0);

    let mut lines: Vec<String> = present
        .iter()
        .map(|(var, field, value)| format!("  {:<width$} => {}={:?}", var, field, value))
        .collect();

    for (var, field, nets) in splits {
        if !nets.is_empty() {
            let nets: Vec<String> = nets.iter().map(ToString::to_string).collect();
            lines.push(format!("  {:<width$} => {}=[{}]", var, field, nets.join(", ")));
        }
    }

    lines
}

/// Print the caller and the variable table to stderr
pub fn dump(vars: &HashMap<String, String>, env: &SessionEnv, process: &dyn ProcessProvider) {
    eprintln!(
        "Called by {} with environment variables for vpnc-script:",
        describe_caller(process)
    );
    for line in dump_lines(vars, env) {
        eprintln!("{}", line);
    }
}
