//! Descendant enumeration and signalling.
//!
//! Timeouts and cancellations terminate every process below the shell while
//! leaving the shell itself running, so its working directory and
//! environment survive for the next command. Descendants are found by
//! walking the parent-pid table reported by `ps`.

use std::collections::{HashMap, HashSet};
use std::process::Stdio;

use tokio::process::Command;
use tracing::{debug, warn};

use crate::{AppError, Result};

/// Enumerate all transitive descendants of `root` (excluding `root` itself).
///
/// # Errors
///
/// Returns `AppError::Shell` if `ps` cannot be run or exits unsuccessfully.
pub async fn descendants(root: u32) -> Result<Vec<u32>> {
    let output = Command::new("ps")
        .args(["-A", "-o", "pid=,ppid="])
        .stdin(Stdio::null())
        .stderr(Stdio::null())
        .output()
        .await
        .map_err(|err| AppError::Shell(format!("failed to list processes: {err}")))?;

    if !output.status.success() {
        return Err(AppError::Shell(format!(
            "process listing exited with {}",
            output.status
        )));
    }

    let table = parse_process_table(&String::from_utf8_lossy(&output.stdout));
    Ok(collect_descendants(root, &table))
}

/// Send `SIGTERM` to every descendant of `root`; returns how many were signalled.
///
/// # Errors
///
/// Returns `AppError::Shell` if the process table cannot be read.
pub async fn kill_descendants(root: u32) -> Result<usize> {
    let pids = descendants(root).await?;
    let mut signalled = 0;

    for pid in &pids {
        if terminate(*pid) {
            signalled += 1;
        }
    }

    debug!(root, found = pids.len(), signalled, "descendant kill complete");
    Ok(signalled)
}

/// Send `SIGTERM` to a single process. Returns `false` if it was already gone.
#[cfg(unix)]
pub fn terminate(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        warn!(pid, "pid out of range, not signalling");
        return false;
    };

    match kill(Pid::from_raw(raw), Signal::SIGTERM) {
        Ok(()) => true,
        Err(Errno::ESRCH) => false,
        Err(err) => {
            warn!(pid, %err, "failed to signal process");
            false
        }
    }
}

/// Signalling is unsupported off Unix; the timeout path still completes.
#[cfg(not(unix))]
pub fn terminate(pid: u32) -> bool {
    warn!(pid, "process signalling is not supported on this platform");
    false
}

/// Parse `pid ppid` rows into a parent → children map.
fn parse_process_table(raw: &str) -> HashMap<u32, Vec<u32>> {
    let mut children: HashMap<u32, Vec<u32>> = HashMap::new();

    for line in raw.lines() {
        let mut fields = line.split_whitespace();
        let (Some(pid), Some(ppid)) = (fields.next(), fields.next()) else {
            continue;
        };
        if let (Ok(pid), Ok(ppid)) = (pid.parse::<u32>(), ppid.parse::<u32>()) {
            children.entry(ppid).or_default().push(pid);
        }
    }

    children
}

fn collect_descendants(root: u32, children: &HashMap<u32, Vec<u32>>) -> Vec<u32> {
    let mut stack = vec![root];
    let mut seen: HashSet<u32> = HashSet::new();
    let mut found = Vec::new();

    while let Some(current) = stack.pop() {
        let Some(kids) = children.get(&current) else {
            continue;
        };
        for &kid in kids {
            if kid != root && seen.insert(kid) {
                found.push(kid);
                stack.push(kid);
            }
        }
    }

    found
}
