//! Detached re-execution for `tunnel expose --background`

use anyhow::{Context, Result};
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

pub const BACKGROUND_FLAG: &str = "--background";

/// Log file used by a background tunnel for `port`
pub fn log_path(logs_dir: &Path, port: u16) -> PathBuf {
    logs_dir.join(format!("tunnel-{}.log", port))
}

/// Arguments for the child: the same command line without the background
/// flag, plus a port that was asked for interactively.
pub fn child_args<I>(args: I, prompted_port: Option<u16>) -> Vec<String>
where
    I: IntoIterator<Item = String>,
{
    let mut args: Vec<String> = args
        .into_iter()
        .skip(1)
        .filter(|arg| arg != BACKGROUND_FLAG)
        .collect();
    if let Some(port) = prompted_port {
        args.push(port.to_string());
    }
    args
}

/// Re-run the current command detached, with output appended to `log_file`.
/// Returns the child's PID.
pub fn spawn_detached(log_file: &Path, prompted_port: Option<u16>) -> Result<u32> {
    let exe = std::env::current_exe().context("Failed to get current executable path")?;

    if let Some(parent) = log_file.parent() {
        fs::create_dir_all(parent)
            .context(format!("Failed to create log directory: {:?}", parent))?;
    }
    let stdout = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_file)
        .context(format!("Failed to open log file: {:?}", log_file))?;
    let stderr = stdout
        .try_clone()
        .context("Failed to duplicate log file handle")?;

    let mut command = Command::new(exe);
    command
        .args(child_args(std::env::args(), prompted_port))
        .stdin(Stdio::null())
        .stdout(Stdio::from(stdout))
        .stderr(Stdio::from(stderr));

    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        // Own process group, so the terminal's Ctrl-C does not reach it
        command.process_group(0);
    }

    let child = command.spawn().context("Failed to start background tunnel")?;
    Ok(child.id())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_child_args_drop_background_flag() {
        let args = ["ztmesh", "tunnel", "expose", "8080", "--background", "--verbose"]
            .iter()
            .map(|s| s.to_string());

        assert_eq!(
            child_args(args, None),
            vec!["tunnel", "expose", "8080", "--verbose"]
        );
    }

    #[test]
    fn test_child_args_add_prompted_port() {
        let args = ["ztmesh", "tunnel", "expose", "--background", "--to-peer", "laptop"]
            .iter()
            .map(|s| s.to_string());

        assert_eq!(
            child_args(args, Some(5432)),
            vec!["tunnel", "expose", "--to-peer", "laptop", "5432"]
        );
    }

    #[test]
    fn test_log_path() {
        let path = log_path(Path::new("/home/me/.ztmesh/logs"), 5432);
        assert_eq!(path, PathBuf::from("/home/me/.ztmesh/logs/tunnel-5432.log"));
    }
}
