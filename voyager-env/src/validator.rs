//! # Validator Process
//!
//! Owns the lifecycle of the external chain simulator:
//! - spawned in its own process group so the whole tree can be signalled
//! - stdout and stderr are read concurrently as one line stream
//! - ready once a line contains the configured marker
//! - stopped with SIGTERM to the group, then SIGKILL after the grace period
//!
//! Every failure path after a successful spawn stops the process group
//! before the error is returned, and `Drop` kills the group if `stop` was
//! never awaited.

use crate::config::ValidatorConfig;
use crate::error::{self, Result};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// A running validator subprocess
pub struct ValidatorProcess {
    binary: String,
    child: Option<Child>,
    pgid: Option<Pid>,
    grace: Duration,
}

impl ValidatorProcess {
    /// Spawn the validator and wait until it prints the ready marker
    pub async fn start(config: &ValidatorConfig) -> Result<Self> {
        if resolve_binary(&config.binary).is_none() {
            return Err(error::launch_failed(
                &config.binary,
                format!("'{}' not found in PATH; install it or adjust PATH", config.binary),
            ));
        }

        let mut cmd = Command::new(&config.binary);
        cmd.args(config.command_args())
            .envs(&config.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            error::launch_failed(&config.binary, format!("spawn failed: {}", e)).set_source(e)
        })?;

        let pid = child.id();
        info!(binary = %config.binary, pid, "validator launched");

        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        if let Some(stdout) = child.stdout.take() {
            spawn_line_pump(stdout, "stdout", tx.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_line_pump(stderr, "stderr", tx);
        }

        let mut process = Self {
            binary: config.binary.clone(),
            child: Some(child),
            pgid: pid.map(|p| Pid::from_raw(p as i32)),
            grace: config.shutdown_grace(),
        };

        let marker = config.ready_marker.as_str();
        let wait_ready = async {
            while let Some(line) = rx.recv().await {
                if line.contains(marker) {
                    return true;
                }
            }
            false
        };

        match tokio::time::timeout(config.ready_timeout(), wait_ready).await {
            Ok(true) => {
                info!(pid, "validator ready");
                Ok(process)
            }
            Ok(false) => {
                warn!(pid, "validator exited before becoming ready");
                process.stop_quietly().await;
                Err(error::premature_exit(&config.binary))
            }
            Err(_) => {
                warn!(pid, timeout_secs = config.ready_timeout_secs, "validator readiness timed out");
                process.stop_quietly().await;
                Err(error::launch_timeout(&config.binary, config.ready_timeout_secs))
            }
        }
    }

    /// OS process id (also the process group id) while the child is held
    pub fn pid(&self) -> Option<u32> {
        self.pgid.map(|p| p.as_raw() as u32)
    }

    /// Whether the validator process is still alive
    pub fn is_running(&mut self) -> bool {
        match self.child.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    /// Stop the validator. Calling it again is a no-op.
    pub async fn stop(&mut self) -> Result<()> {
        let Some(mut child) = self.child.take() else {
            return Ok(());
        };
        let pgid = self.pgid.take();
        let pid = pgid.map(|p| p.as_raw());

        info!(binary = %self.binary, pid, "stopping validator");
        if let Some(pgid) = pgid {
            // ESRCH just means the group is already gone
            let _ = killpg(pgid, Signal::SIGTERM);
        }

        match tokio::time::timeout(self.grace, child.wait()).await {
            Ok(Ok(status)) => {
                info!(pid, %status, "validator shut down");
            }
            Ok(Err(e)) => {
                return Err(error::shutdown_failed(format!("wait failed: {}", e)).set_source(e));
            }
            Err(_) => {
                warn!(pid, grace_secs = self.grace.as_secs(), "validator unresponsive; killing");
                if let Some(pgid) = pgid {
                    let _ = killpg(pgid, Signal::SIGKILL);
                }
                let _ = child.start_kill();
                child.wait().await.map_err(|e| {
                    error::shutdown_failed(format!("wait after kill failed: {}", e)).set_source(e)
                })?;
                info!(pid, "validator killed");
            }
        }

        // Reap anything left in the group
        if let Some(pgid) = pgid {
            let _ = killpg(pgid, Signal::SIGKILL);
        }
        Ok(())
    }

    async fn stop_quietly(&mut self) {
        if let Err(e) = self.stop().await {
            warn!(error = %e, "validator cleanup failed");
        }
    }
}

impl Drop for ValidatorProcess {
    fn drop(&mut self) {
        if self.child.is_some() {
            if let Some(pgid) = self.pgid {
                warn!(pid = pgid.as_raw(), "validator dropped without stop; killing group");
                let _ = killpg(pgid, Signal::SIGKILL);
            }
        }
    }
}

/// Forward every line of a child stream to the readiness channel
fn spawn_line_pump<R>(reader: R, stream: &'static str, tx: mpsc::UnboundedSender<String>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!(target: "voyager_env::validator", stream, "{}", line);
            // Receiver is gone once the validator is ready; keep draining the pipe
            let _ = tx.send(line);
        }
    });
}

/// Locate an executable the way a shell would
fn resolve_binary(binary: &str) -> Option<PathBuf> {
    let candidate = Path::new(binary);
    if candidate.components().count() > 1 {
        return candidate.is_file().then(|| candidate.to_path_buf());
    }
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(binary))
        .find(|full| full.is_file())
}

/// Members of process group `pgid` that are still running; zombies count
/// as stopped
#[cfg(test)]
pub(crate) fn live_group_members(pgid: i32) -> Vec<i32> {
    let Ok(entries) = std::fs::read_dir("/proc") else {
        return Vec::new();
    };
    entries
        .flatten()
        .filter_map(|entry| {
            let pid: i32 = entry.file_name().to_str()?.parse().ok()?;
            let stat = std::fs::read_to_string(entry.path().join("stat")).ok()?;
            // fields after the parenthesized command: state ppid pgrp ...
            let mut fields = stat[stat.rfind(')')? + 1..].split_whitespace();
            let state = fields.next()?;
            let pgrp: i32 = fields.nth(1)?.parse().ok()?;
            (pgrp == pgid && state != "Z").then_some(pid)
        })
        .collect()
}

/// Wait briefly for a signalled group to die, returning whatever is left
#[cfg(test)]
pub(crate) async fn wait_group_gone(pgid: i32) -> Vec<i32> {
    for _ in 0..40 {
        let live = live_group_members(pgid);
        if live.is_empty() {
            return live;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    live_group_members(pgid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn script(body: &str, ready_timeout_secs: u64) -> ValidatorConfig {
        ValidatorConfig {
            binary: "sh".into(),
            args: vec!["-c".into(), body.into()],
            ready_timeout_secs,
            shutdown_grace_secs: 1,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_ready_marker_on_stdout() {
        let config = script("echo booting; echo 'Connection established.'; sleep 30", 5);
        let mut validator = ValidatorProcess::start(&config).await.unwrap();
        assert!(validator.pid().is_some());
        assert!(validator.is_running());

        tokio_test::assert_ok!(validator.stop().await);
        assert!(!validator.is_running());
        // idempotent
        tokio_test::assert_ok!(validator.stop().await);
    }

    #[tokio::test]
    async fn test_ready_marker_on_stderr() {
        let config = script("echo 'Connection established.' >&2; sleep 30", 5);
        let mut validator = ValidatorProcess::start(&config).await.unwrap();
        validator.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_launch_timeout() {
        let dir = tempfile::TempDir::new().unwrap();
        let pidfile = dir.path().join("validator.pid");
        let body = format!("echo $$ > {}; echo starting; sleep 30", pidfile.display());
        let err = ValidatorProcess::start(&script(&body, 1)).await.err().unwrap();
        assert_eq!(err.kind(), ErrorKind::LaunchTimeout);
        assert!(err.is_episode_fatal());

        // the group was stopped before the error came back
        let pgid: i32 = std::fs::read_to_string(&pidfile).unwrap().trim().parse().unwrap();
        assert_eq!(wait_group_gone(pgid).await, Vec::<i32>::new());
    }

    #[tokio::test]
    async fn test_stop_leaves_no_live_group_member() {
        let config = script("echo 'Connection established.'; sleep 30 & wait", 5);
        let mut validator = ValidatorProcess::start(&config).await.unwrap();
        let pgid = validator.pid().unwrap() as i32;
        assert!(!live_group_members(pgid).is_empty());

        validator.stop().await.unwrap();
        assert_eq!(wait_group_gone(pgid).await, Vec::<i32>::new());
    }

    #[tokio::test]
    async fn test_premature_exit() {
        let config = script("echo 'panic: port in use'; exit 1", 5);
        let err = ValidatorProcess::start(&config).await.err().unwrap();
        assert_eq!(err.kind(), ErrorKind::PrematureExit);
    }

    #[tokio::test]
    async fn test_missing_binary() {
        let config = ValidatorConfig {
            binary: "voyager-no-such-validator".into(),
            ..Default::default()
        };
        let err = ValidatorProcess::start(&config).await.err().unwrap();
        assert_eq!(err.kind(), ErrorKind::LaunchFailed);
        assert!(err.message().contains("not found in PATH"));
    }

    #[tokio::test]
    async fn test_stop_escalates_to_kill() {
        let config = script("trap '' TERM; echo 'Connection established.'; sleep 30", 5);
        let mut validator = ValidatorProcess::start(&config).await.unwrap();

        let started = std::time::Instant::now();
        validator.stop().await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(!validator.is_running());
    }

    #[test]
    fn test_resolve_binary() {
        assert!(resolve_binary("sh").is_some());
        assert!(resolve_binary("voyager-no-such-validator").is_none());
        assert!(resolve_binary("/definitely/not/here").is_none());
    }
}
