//! # Environment configuration
//!
//! One serde struct per component, grouped under [`EnvConfig`]. Every field has
//! a default so a config file only needs to name what it changes.

use crate::discovery::RewardPolicy;
use crate::error::{self, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Placeholder substituted with the upstream RPC url in validator args
pub const UPSTREAM_PLACEHOLDER: &str = "{upstream}";

/// Lamports per SOL
pub const LAMPORTS_PER_SOL: u64 = 1_000_000_000;

/// Top-level configuration for the environment and the agent driving it
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvConfig {
    pub validator: ValidatorConfig,
    pub rpc: RpcConfig,
    pub runner: RunnerConfig,
    pub registry: RegistryConfig,
    pub reward: RewardPolicy,
    pub planner: PlannerConfig,
    pub agent: AgentSettings,
}

impl EnvConfig {
    /// Load a configuration from a JSON file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| error::config_invalid(format!("Failed to read config: {}", e))
                .with_context("path", path.display().to_string()))?;
        let config: EnvConfig = serde_json::from_str(&content)
            .map_err(|e| error::config_invalid(format!("Failed to parse config: {}", e))
                .with_context("path", path.display().to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Save the configuration as pretty JSON
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| error::serialization_error(e.to_string()))?;
        std::fs::write(path.as_ref(), json)
            .map_err(|e| error::io_error(format!("Failed to write config: {}", e)))?;
        Ok(())
    }

    /// Overlay values taken from the process environment
    ///
    /// - `OPENROUTER_API_KEY` sets the planner api key
    /// - `SOLANA_TX_FETCH_RPC_URL` sets the upstream used for example transactions
    /// - `VOYAGER_UPSTREAM_RPC_URL` sets the url the validator forks from
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(key) = lookup("OPENROUTER_API_KEY").filter(|v| !v.is_empty()) {
            self.planner.api_key = Some(key);
        }
        if let Some(url) = lookup("SOLANA_TX_FETCH_RPC_URL").filter(|v| !v.is_empty()) {
            self.rpc.fetch_url = url;
        }
        if let Some(url) = lookup("VOYAGER_UPSTREAM_RPC_URL").filter(|v| !v.is_empty()) {
            self.validator.upstream_rpc_url = url;
        }
        self
    }

    /// Reject values that would make the harness hang or loop forever
    pub fn validate(&self) -> Result<()> {
        if self.validator.binary.trim().is_empty() {
            return Err(error::config_invalid("validator.binary must not be empty"));
        }
        if self.validator.ready_timeout_secs == 0 {
            return Err(error::config_invalid("validator.ready_timeout_secs must be > 0"));
        }
        if self.rpc.confirm_timeout_secs == 0 || self.rpc.poll_interval_ms == 0 {
            return Err(error::config_invalid(
                "rpc.confirm_timeout_secs and rpc.poll_interval_ms must be > 0",
            ));
        }
        if self.runner.timeout_ms == 0 {
            return Err(error::config_invalid("runner.timeout_ms must be > 0"));
        }
        if self.agent.max_skill_tries == 0 {
            return Err(error::config_invalid("agent.max_skill_tries must be >= 1"));
        }
        if !matches!(self.rpc.commitment.as_str(), "processed" | "confirmed" | "finalized") {
            return Err(error::config_invalid(format!(
                "unknown commitment '{}'",
                self.rpc.commitment
            )));
        }
        Ok(())
    }
}

// =============================================================================
// Validator
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidatorConfig {
    /// Executable to launch
    pub binary: String,
    /// Arguments; `{upstream}` is replaced with `upstream_rpc_url`
    pub args: Vec<String>,
    /// RPC url the simulated validator forks state from
    pub upstream_rpc_url: String,
    /// Literal text that signals readiness on stdout or stderr
    pub ready_marker: String,
    pub ready_timeout_secs: u64,
    /// Time between SIGTERM and SIGKILL on shutdown
    pub shutdown_grace_secs: u64,
    /// Extra environment for the child process
    pub env: BTreeMap<String, String>,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        let mut env = BTreeMap::new();
        env.insert("RUST_BACKTRACE".into(), "1".into());
        env.insert("CROSSTERM_DISABLE_RAW_MODE".into(), "1".into());

        Self {
            binary: "surfpool".into(),
            args: vec![
                "start".into(),
                "--no-tui".into(),
                "-u".into(),
                UPSTREAM_PLACEHOLDER.into(),
            ],
            upstream_rpc_url: "https://api.mainnet-beta.solana.com".into(),
            ready_marker: "Connection established.".into(),
            ready_timeout_secs: 60,
            shutdown_grace_secs: 8,
            env,
        }
    }
}

impl ValidatorConfig {
    /// Arguments with the upstream placeholder substituted
    pub fn command_args(&self) -> Vec<String> {
        self.args
            .iter()
            .map(|arg| arg.replace(UPSTREAM_PLACEHOLDER, &self.upstream_rpc_url))
            .collect()
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.ready_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

// =============================================================================
// RPC
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    /// JSON-RPC endpoint of the local validator
    pub local_url: String,
    /// Live-network endpoint used to fetch example transactions
    pub fetch_url: String,
    pub request_timeout_secs: u64,
    pub confirm_timeout_secs: u64,
    pub poll_interval_ms: u64,
    /// processed | confirmed | finalized
    pub commitment: String,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            local_url: "http://127.0.0.1:8899".into(),
            fetch_url: "https://api.mainnet-beta.solana.com".into(),
            request_timeout_secs: 30,
            confirm_timeout_secs: 30,
            poll_interval_ms: 500,
            commitment: "confirmed".into(),
        }
    }
}

impl RpcConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn confirm_timeout(&self) -> Duration {
        Duration::from_secs(self.confirm_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

// =============================================================================
// Skill runner
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Script runtime
    pub runtime: String,
    /// Argument template. `{entry_point}`, `{skill}` and `{timeout_ms}` are
    /// always substituted; an argument naming `{agent_pubkey}` or
    /// `{blockhash}` is dropped when that binding is absent.
    pub args: Vec<String>,
    pub entry_point: PathBuf,
    /// Budget handed to the runner script
    pub timeout_ms: u64,
    /// Extra wall-clock allowance before the runner process is killed
    pub kill_grace_ms: u64,
    /// Where candidate skills are staged before they are accepted
    pub scratch_dir: PathBuf,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            runtime: "bun".into(),
            args: vec![
                "run".into(),
                "{entry_point}".into(),
                "{skill}".into(),
                "{timeout_ms}".into(),
                "{agent_pubkey}".into(),
                "{blockhash}".into(),
            ],
            entry_point: PathBuf::from("skill_runner/runSkill.ts"),
            timeout_ms: 10_000,
            kill_grace_ms: 2_000,
            scratch_dir: std::env::temp_dir().join("voyager_candidates"),
        }
    }
}

impl RunnerConfig {
    /// Expand the argument template for one execution
    pub fn command_args(
        &self,
        skill: &Path,
        agent_pubkey: Option<&str>,
        blockhash: Option<&str>,
    ) -> Vec<String> {
        let entry = self.entry_point.display().to_string();
        let skill = skill.display().to_string();
        let timeout = self.timeout_ms.to_string();

        self.args
            .iter()
            .filter_map(|arg| {
                let mut out = arg
                    .replace("{entry_point}", &entry)
                    .replace("{skill}", &skill)
                    .replace("{timeout_ms}", &timeout);
                for (placeholder, value) in [("{agent_pubkey}", agent_pubkey), ("{blockhash}", blockhash)] {
                    if out.contains(placeholder) {
                        out = out.replace(placeholder, value?);
                    }
                }
                Some(out)
            })
            .collect()
    }

    /// Hard bound on the runner process
    pub fn wall_clock(&self) -> Duration {
        Duration::from_millis(self.timeout_ms + self.kill_grace_ms)
    }
}

// =============================================================================
// Registries
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// CSV of known programs (`program_address`, `project_name`, optional `program_name`)
    pub programs_csv: PathBuf,
    /// Directory holding accepted skills
    pub skill_root: PathBuf,
    /// File extension of skill sources
    pub extension: String,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            programs_csv: PathBuf::from("data/program_ids.csv"),
            skill_root: PathBuf::from("skills"),
            extension: "ts".into(),
        }
    }
}

// =============================================================================
// Planner
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlannerConfig {
    /// OpenAI-compatible endpoint
    pub base_url: String,
    pub model: String,
    /// Usually supplied through `OPENROUTER_API_KEY`
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    pub temperature: f32,
    pub timeout_secs: u64,
    pub max_tokens: usize,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            base_url: "https://openrouter.ai/api/v1".into(),
            model: "openai/gpt-4o-mini".into(),
            api_key: None,
            temperature: 0.0,
            timeout_secs: 120,
            max_tokens: 4096,
        }
    }
}

// =============================================================================
// Agent
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSettings {
    /// Steps per episode before it is truncated
    pub max_steps: usize,
    /// Proposals per growth loop
    pub max_skill_tries: usize,
    /// Only accept candidates whose transaction discovered something
    pub require_discovery: bool,
    pub airdrop_lamports: u64,
    /// Where the trajectory log is written on close
    pub trajectory_path: Option<PathBuf>,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            max_steps: 128,
            max_skill_tries: 3,
            require_discovery: false,
            airdrop_lamports: 2 * LAMPORTS_PER_SOL,
            trajectory_path: Some(PathBuf::from("trajectories/trajectory.json")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::DiscoveryScope;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = EnvConfig::default();
        assert_eq!(config.validator.binary, "surfpool");
        assert_eq!(config.rpc.local_url, "http://127.0.0.1:8899");
        assert_eq!(config.agent.max_skill_tries, 3);
        assert_eq!(config.agent.airdrop_lamports, 2_000_000_000);
        assert_eq!(config.reward.scope, DiscoveryScope::Episode);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_command_args_substitute_upstream() {
        let config = ValidatorConfig {
            upstream_rpc_url: "https://rpc.example".into(),
            ..Default::default()
        };
        assert_eq!(
            config.command_args(),
            vec!["start", "--no-tui", "-u", "https://rpc.example"]
        );
    }

    #[test]
    fn test_runner_args() {
        let config = RunnerConfig::default();
        let args = config.command_args(Path::new("skills/skill_000001.ts"), Some("Agent1"), Some("Hash1"));
        assert_eq!(
            args,
            vec!["run", "skill_runner/runSkill.ts", "skills/skill_000001.ts", "10000", "Agent1", "Hash1"]
        );

        // missing bindings drop their arguments
        let args = config.command_args(Path::new("s.ts"), None, None);
        assert_eq!(args.len(), 4);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("voyager.json");
        std::fs::write(
            &path,
            r#"{"runner": {"runtime": "node"}, "agent": {"max_steps": 5}}"#,
        )
        .unwrap();

        let config = EnvConfig::load(&path).unwrap();
        assert_eq!(config.runner.runtime, "node");
        assert_eq!(config.runner.timeout_ms, 10_000);
        assert_eq!(config.agent.max_steps, 5);
        assert_eq!(config.validator.ready_marker, "Connection established.");
    }

    #[test]
    fn test_load_rejects_bad_json() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("broken.json");
        std::fs::write(&path, "{ not json").unwrap();

        let err = EnvConfig::load(&path).unwrap_err();
        assert_eq!(err.kind(), error::ErrorKind::ConfigInvalid);
    }

    #[test]
    fn test_validate_rejects_zero_tries() {
        let mut config = EnvConfig::default();
        config.agent.max_skill_tries = 0;
        assert!(config.validate().is_err());

        let mut config = EnvConfig::default();
        config.rpc.commitment = "eventually".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_overrides() {
        let config = EnvConfig::default().with_overrides(|key| match key {
            "OPENROUTER_API_KEY" => Some("sk-or-test".into()),
            "SOLANA_TX_FETCH_RPC_URL" => Some("https://fetch.example".into()),
            _ => None,
        });
        assert_eq!(config.planner.api_key.as_deref(), Some("sk-or-test"));
        assert_eq!(config.rpc.fetch_url, "https://fetch.example");
        assert_eq!(
            config.validator.upstream_rpc_url,
            "https://api.mainnet-beta.solana.com"
        );
    }

    #[test]
    fn test_api_key_not_saved() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out.json");
        let mut config = EnvConfig::default();
        config.planner.api_key = Some("secret".into());
        config.save(&path).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(!text.contains("secret"));
    }
}
