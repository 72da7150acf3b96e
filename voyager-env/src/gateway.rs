//! # Skill Execution Gateway
//!
//! Runs a skill through the external script runtime and normalizes whatever
//! comes back into an [`ExecutionOutcome`]. Interpreter failures, timeouts
//! and unexpected output shapes are values, never errors.

use crate::config::RunnerConfig;
use crate::error::{self, Error, ErrorKind};
use crate::registry::free_path;
use base64::Engine as _;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, warn};

/// Values the environment injects into every execution
#[derive(Debug, Clone, Default)]
pub struct ExecutionBindings {
    pub agent_pubkey: Option<String>,
    /// Freshly fetched; skills never supply their own
    pub blockhash: Option<String>,
}

impl ExecutionBindings {
    pub fn new(agent_pubkey: impl Into<String>, blockhash: impl Into<String>) -> Self {
        Self {
            agent_pubkey: Some(agent_pubkey.into()),
            blockhash: Some(blockhash.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionErrorKind {
    Timeout,
    MalformedOutput,
    RuntimeError,
    RuntimeUnavailable,
}

impl ExecutionErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionErrorKind::Timeout => "timeout",
            ExecutionErrorKind::MalformedOutput => "malformedOutput",
            ExecutionErrorKind::RuntimeError => "runtimeError",
            ExecutionErrorKind::RuntimeUnavailable => "runtimeUnavailable",
        }
    }
}

impl std::fmt::Display for ExecutionErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Normalized result of one skill execution
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome {
    Ok {
        /// Base64 as printed by the runner
        serialized_tx: String,
        /// Decoded wire bytes
        tx_bytes: Vec<u8>,
        stdout: String,
    },
    Err {
        kind: ExecutionErrorKind,
        detail: String,
    },
}

impl ExecutionOutcome {
    fn err(kind: ExecutionErrorKind, detail: impl Into<String>) -> Self {
        ExecutionOutcome::Err {
            kind,
            detail: detail.into(),
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, ExecutionOutcome::Ok { .. })
    }

    /// Convert a failed outcome into an Error for feedback and logging
    pub fn to_error(&self) -> Option<Error> {
        match self {
            ExecutionOutcome::Ok { .. } => None,
            ExecutionOutcome::Err { kind, detail } => Some(
                match kind {
                    ExecutionErrorKind::Timeout => Error::new(ErrorKind::ExecutionTimeout, detail.clone()),
                    ExecutionErrorKind::MalformedOutput => error::malformed_output(detail.clone()),
                    ExecutionErrorKind::RuntimeError => error::execution_failed(detail.clone()),
                    ExecutionErrorKind::RuntimeUnavailable => {
                        Error::new(ErrorKind::RuntimeUnavailable, detail.clone())
                    }
                }
                .with_operation("gateway::execute")
                .with_context("error_kind", kind.as_str()),
            ),
        }
    }
}

/// Anything that turns a skill into exactly one unsigned transaction
#[allow(async_fn_in_trait)]
pub trait SkillExecutor {
    /// Execute a skill file already on disk
    async fn execute(&self, skill_path: &Path, bindings: &ExecutionBindings) -> ExecutionOutcome;

    /// Stage `source` into a scratch file and execute it
    async fn execute_source(&self, source: &str, bindings: &ExecutionBindings) -> ExecutionOutcome;
}

/// Runs skills through an external runtime process
pub struct SkillRunner {
    config: RunnerConfig,
    extension: String,
}

impl SkillRunner {
    pub fn new(config: RunnerConfig, extension: impl Into<String>) -> Self {
        Self {
            config,
            extension: extension.into(),
        }
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// Write `source` to the first free `candidate*.<ext>` path in the scratch dir
    fn stage(&self, source: &str) -> std::io::Result<PathBuf> {
        std::fs::create_dir_all(&self.config.scratch_dir)?;
        loop {
            let path = free_path(&self.config.scratch_dir, "candidate", &self.extension);
            match std::fs::OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    use std::io::Write;
                    file.write_all(source.as_bytes())?;
                    return Ok(path);
                }
                // lost a race with another stager, pick the next name
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e),
            }
        }
    }
}

impl SkillExecutor for SkillRunner {
    async fn execute(&self, skill_path: &Path, bindings: &ExecutionBindings) -> ExecutionOutcome {
        let args = self.config.command_args(
            skill_path,
            bindings.agent_pubkey.as_deref(),
            bindings.blockhash.as_deref(),
        );
        debug!(runtime = %self.config.runtime, ?args, "executing skill");

        let mut cmd = Command::new(&self.config.runtime);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return ExecutionOutcome::err(
                    ExecutionErrorKind::RuntimeUnavailable,
                    format!("runtime '{}' not found: {}", self.config.runtime, e),
                );
            }
            Err(e) => {
                return ExecutionOutcome::err(
                    ExecutionErrorKind::RuntimeError,
                    format!("failed to start runtime '{}': {}", self.config.runtime, e),
                );
            }
        };

        let output = match tokio::time::timeout(self.config.wall_clock(), child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return ExecutionOutcome::err(
                    ExecutionErrorKind::RuntimeError,
                    format!("runner wait failed: {}", e),
                );
            }
            Err(_) => {
                warn!(skill = %skill_path.display(), timeout_ms = self.config.timeout_ms, "skill execution timed out");
                return ExecutionOutcome::err(
                    ExecutionErrorKind::Timeout,
                    format!("skill did not finish within {}ms", self.config.timeout_ms),
                );
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        normalize_output(output.status.success(), &stdout, &stderr)
    }

    async fn execute_source(&self, source: &str, bindings: &ExecutionBindings) -> ExecutionOutcome {
        let path = match self.stage(source) {
            Ok(path) => path,
            Err(e) => {
                return ExecutionOutcome::err(
                    ExecutionErrorKind::RuntimeError,
                    format!("failed to stage skill source: {}", e),
                );
            }
        };
        let outcome = self.execute(&path, bindings).await;
        if let Err(e) = std::fs::remove_file(&path) {
            debug!(path = %path.display(), error = %e, "could not remove staged skill");
        }
        outcome
    }
}

/// Turn raw runner output into an outcome.
///
/// Every JSON object on stdout, then stderr, is inspected. A reported error
/// wins; otherwise a non-zero exit is a runtime error; otherwise exactly one
/// transaction must be present across `serialized_tx`, `serialized_txs` and
/// `transactions`.
pub fn normalize_output(exit_ok: bool, stdout: &str, stderr: &str) -> ExecutionOutcome {
    let objects: Vec<Map<String, Value>> = json_objects(stdout)
        .into_iter()
        .chain(json_objects(stderr))
        .collect();

    let mut transactions: Vec<String> = Vec::new();
    let mut failure: Option<String> = None;

    for obj in &objects {
        if let Some(tx) = obj.get("serialized_tx") {
            match tx.as_str() {
                Some(s) => transactions.push(s.to_string()),
                None => {
                    return ExecutionOutcome::err(
                        ExecutionErrorKind::MalformedOutput,
                        "serialized_tx is not a string",
                    )
                }
            }
        }
        for key in ["serialized_txs", "transactions"] {
            if let Some(list) = obj.get(key).and_then(Value::as_array) {
                for tx in list {
                    match tx.as_str() {
                        Some(s) => transactions.push(s.to_string()),
                        None => {
                            return ExecutionOutcome::err(
                                ExecutionErrorKind::MalformedOutput,
                                format!("{} contains a non-string entry", key),
                            )
                        }
                    }
                }
            }
        }

        if failure.is_none() {
            if let Some(err) = obj.get("error").filter(|e| !e.is_null()) {
                let mut detail = value_text(err);
                if let Some(trace) = obj.get("trace").filter(|t| !t.is_null()) {
                    detail.push('\n');
                    detail.push_str(&value_text(trace));
                }
                failure = Some(detail);
            } else if obj.get("success") == Some(&Value::Bool(false)) {
                let reason = obj
                    .get("reason")
                    .map(value_text)
                    .unwrap_or_else(|| "skill reported failure".to_string());
                failure = Some(reason);
            }
        }
    }

    if let Some(detail) = failure {
        return ExecutionOutcome::err(ExecutionErrorKind::RuntimeError, detail);
    }

    if !exit_ok {
        return ExecutionOutcome::err(
            ExecutionErrorKind::RuntimeError,
            format!("runner exited with failure: {}", tail(stderr, stdout)),
        );
    }

    match transactions.len() {
        0 => ExecutionOutcome::err(
            ExecutionErrorKind::MalformedOutput,
            format!("no transaction in runner output: {}", tail(stdout, stderr)),
        ),
        1 => {
            let serialized_tx = transactions.remove(0);
            match base64::engine::general_purpose::STANDARD.decode(serialized_tx.trim()) {
                Ok(tx_bytes) if !tx_bytes.is_empty() => ExecutionOutcome::Ok {
                    serialized_tx,
                    tx_bytes,
                    stdout: stdout.to_string(),
                },
                Ok(_) => ExecutionOutcome::err(ExecutionErrorKind::MalformedOutput, "transaction is empty"),
                Err(e) => ExecutionOutcome::err(
                    ExecutionErrorKind::MalformedOutput,
                    format!("transaction is not valid base64: {}", e),
                ),
            }
        }
        n => ExecutionOutcome::err(
            ExecutionErrorKind::MalformedOutput,
            format!("skill produced {} transactions, expected exactly one", n),
        ),
    }
}

/// Whole-stream JSON object, or else every line that is one
fn json_objects(stream: &str) -> Vec<Map<String, Value>> {
    let trimmed = stream.trim();
    if let Ok(Value::Object(obj)) = serde_json::from_str::<Value>(trimmed) {
        return vec![obj];
    }
    stream
        .lines()
        .map(str::trim)
        .filter(|line| line.starts_with('{'))
        .filter_map(|line| match serde_json::from_str::<Value>(line) {
            Ok(Value::Object(obj)) => Some(obj),
            _ => None,
        })
        .collect()
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Last few lines of the first non-empty stream
fn tail(primary: &str, secondary: &str) -> String {
    let source = if primary.trim().is_empty() { secondary } else { primary };
    let lines: Vec<&str> = source.lines().filter(|l| !l.trim().is_empty()).collect();
    let start = lines.len().saturating_sub(5);
    let text = lines[start..].join(" | ");
    if text.is_empty() {
        "(no output)".to_string()
    } else {
        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const ONE_TX: &str = r#"{"serialized_tx": "AQIDBA=="}"#;

    #[test]
    fn test_single_transaction() {
        match normalize_output(true, ONE_TX, "") {
            ExecutionOutcome::Ok { tx_bytes, .. } => assert_eq!(tx_bytes, vec![1, 2, 3, 4]),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn test_log_noise_around_result() {
        let stdout = format!("compiling skill...\n{}\ndone\n", ONE_TX);
        assert!(normalize_output(true, &stdout, "warning: deprecated").is_ok());
    }

    #[test]
    fn test_two_transactions_is_malformed() {
        let stdout = format!("{}\n{}\n", ONE_TX, ONE_TX);
        assert_eq!(
            normalize_output(true, &stdout, ""),
            ExecutionOutcome::err(
                ExecutionErrorKind::MalformedOutput,
                "skill produced 2 transactions, expected exactly one"
            )
        );

        let batch = r#"{"serialized_txs": ["AQID", "BAUG"]}"#;
        assert!(matches!(
            normalize_output(true, batch, ""),
            ExecutionOutcome::Err { kind: ExecutionErrorKind::MalformedOutput, .. }
        ));
    }

    #[test]
    fn test_single_entry_batch_is_accepted() {
        assert!(normalize_output(true, r#"{"transactions": ["AQID"]}"#, "").is_ok());
    }

    #[test]
    fn test_reported_error_with_trace() {
        let stdout = r#"{"error": "TypeError: x is undefined", "trace": "at executeSkill (skill.ts:4)"}"#;
        match normalize_output(false, stdout, "") {
            ExecutionOutcome::Err { kind, detail } => {
                assert_eq!(kind, ExecutionErrorKind::RuntimeError);
                assert!(detail.contains("TypeError"));
                assert!(detail.contains("skill.ts:4"));
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn test_success_false_reason() {
        let stdout = r#"{"success": false, "reason": "pool not found"}"#;
        assert_eq!(
            normalize_output(true, stdout, ""),
            ExecutionOutcome::err(ExecutionErrorKind::RuntimeError, "pool not found")
        );
    }

    #[test]
    fn test_non_zero_exit_without_json() {
        let outcome = normalize_output(false, "", "SyntaxError: Unexpected token\n");
        match outcome {
            ExecutionOutcome::Err { kind, detail } => {
                assert_eq!(kind, ExecutionErrorKind::RuntimeError);
                assert!(detail.contains("SyntaxError"));
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn test_nothing_recognizable() {
        assert!(matches!(
            normalize_output(true, "hello world", ""),
            ExecutionOutcome::Err { kind: ExecutionErrorKind::MalformedOutput, .. }
        ));
        assert!(matches!(
            normalize_output(true, r#"{"serialized_tx": "%%%"}"#, ""),
            ExecutionOutcome::Err { kind: ExecutionErrorKind::MalformedOutput, .. }
        ));
    }

    fn sh_runner(dir: &TempDir, timeout_ms: u64) -> SkillRunner {
        let config = RunnerConfig {
            runtime: "sh".into(),
            args: vec!["{skill}".into(), "{agent_pubkey}".into(), "{blockhash}".into()],
            timeout_ms,
            kill_grace_ms: 100,
            scratch_dir: dir.path().join("scratch"),
            ..Default::default()
        };
        SkillRunner::new(config, "sh")
    }

    #[tokio::test]
    async fn test_execute_source_receives_bindings() {
        let dir = TempDir::new().unwrap();
        let runner = sh_runner(&dir, 5_000);
        let source = r#"echo "{\"serialized_tx\": \"AQID\", \"payer\": \"$1\", \"blockhash\": \"$2\"}""#;

        let outcome = runner
            .execute_source(source, &ExecutionBindings::new("AgentKey", "FreshHash"))
            .await;
        match outcome {
            ExecutionOutcome::Ok { stdout, tx_bytes, .. } => {
                assert_eq!(tx_bytes, vec![1, 2, 3]);
                assert!(stdout.contains("AgentKey"));
                assert!(stdout.contains("FreshHash"));
            }
            other => panic!("unexpected outcome: {:?}", other),
        }

        // staged file is cleaned up
        let leftovers = std::fs::read_dir(dir.path().join("scratch")).unwrap().count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn test_execute_timeout() {
        let dir = TempDir::new().unwrap();
        let runner = sh_runner(&dir, 200);
        let outcome = runner.execute_source("sleep 5", &ExecutionBindings::default()).await;
        assert!(matches!(outcome, ExecutionOutcome::Err { kind: ExecutionErrorKind::Timeout, .. }));
        assert!(outcome.to_error().unwrap().is_retryable());
    }

    #[tokio::test]
    async fn test_execute_runtime_unavailable() {
        let dir = TempDir::new().unwrap();
        let config = RunnerConfig {
            runtime: "voyager-no-such-runtime".into(),
            scratch_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        let runner = SkillRunner::new(config, "ts");
        let outcome = runner.execute_source("export {}", &ExecutionBindings::default()).await;
        assert!(matches!(
            outcome,
            ExecutionOutcome::Err { kind: ExecutionErrorKind::RuntimeUnavailable, .. }
        ));
    }

    #[tokio::test]
    async fn test_execute_crash() {
        let dir = TempDir::new().unwrap();
        let runner = sh_runner(&dir, 5_000);
        let outcome = runner
            .execute_source("echo 'ReferenceError: web3 is not defined' >&2; exit 3", &ExecutionBindings::default())
            .await;
        let err = outcome.to_error().unwrap();
        assert_eq!(err.kind(), ErrorKind::ExecutionFailed);
        assert!(err.message().contains("ReferenceError"));
    }
}
