//! # Trajectory accounting
//!
//! Append-only record of what happened in each episode: every attempt with
//! its reward and discoveries, every planner call, every skill created.
//! Nothing here gates behavior; it exists for later analysis and export.

use crate::error::{self, Result};
use crate::discovery::InstructionKey;
use crate::record::TransactionSummary;
use crate::registry::{current_timestamp, SkillId};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{info, warn};

/// One executed attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptEntry {
    pub timestamp_ms: u64,
    pub skill_id: Option<SkillId>,
    pub reward: f64,
    /// Confirmed and not failed on chain
    pub success: bool,
    pub done_reason: String,
    #[serde(default)]
    pub new_protocols: Vec<String>,
    #[serde(default)]
    pub new_instructions: Vec<InstructionKey>,
    pub error_kind: Option<String>,
    pub error: Option<String>,
    pub transaction: Option<TransactionSummary>,
}

impl AttemptEntry {
    pub fn new(skill_id: Option<SkillId>, reward: f64, done_reason: impl Into<String>) -> Self {
        Self {
            timestamp_ms: current_timestamp(),
            skill_id,
            reward,
            success: false,
            done_reason: done_reason.into(),
            new_protocols: Vec::new(),
            new_instructions: Vec::new(),
            error_kind: None,
            error: None,
            transaction: None,
        }
    }

    pub fn with_success(mut self, success: bool) -> Self {
        self.success = success;
        self
    }

    pub fn with_discoveries(mut self, protocols: Vec<String>, instructions: Vec<InstructionKey>) -> Self {
        self.new_protocols = protocols;
        self.new_instructions = instructions;
        self
    }

    pub fn with_error(mut self, err: &error::Error) -> Self {
        self.error_kind = Some(err.kind().to_string());
        self.error = Some(err.message().to_string());
        self
    }

    pub fn with_transaction(mut self, summary: TransactionSummary) -> Self {
        self.transaction = Some(summary);
        self
    }
}

/// One call to the planner
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannerCall {
    pub timestamp_ms: u64,
    pub objective: String,
    /// The planner answered
    pub success: bool,
    /// The answer became a registered skill
    pub skill_generated: bool,
    pub error: Option<String>,
    pub retry_count: usize,
}

impl PlannerCall {
    pub fn new(objective: impl Into<String>, retry_count: usize) -> Self {
        Self {
            timestamp_ms: current_timestamp(),
            objective: objective.into(),
            success: false,
            skill_generated: false,
            error: None,
            retry_count,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Episode {
    pub id: u64,
    pub start_ms: u64,
    pub end_ms: Option<u64>,
    pub total_reward: f64,
    #[serde(default)]
    pub attempts: Vec<AttemptEntry>,
    #[serde(default)]
    pub planner_calls: Vec<PlannerCall>,
    /// Distinct, in discovery order
    #[serde(default)]
    pub protocols_discovered: Vec<String>,
    #[serde(default)]
    pub skills_created: Vec<String>,
}

impl Episode {
    pub fn is_open(&self) -> bool {
        self.end_ms.is_none()
    }

    pub fn duration_ms(&self) -> u64 {
        self.end_ms
            .unwrap_or_else(current_timestamp)
            .saturating_sub(self.start_ms)
    }

    /// Share of planner calls that produced a registered skill
    pub fn planner_efficiency(&self) -> f64 {
        if self.planner_calls.is_empty() {
            return 0.0;
        }
        let generated = self.planner_calls.iter().filter(|c| c.skill_generated).count();
        generated as f64 / self.planner_calls.len() as f64
    }
}

/// Aggregates across every recorded episode
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TrajectoryMetrics {
    pub total_episodes: usize,
    pub total_planner_calls: usize,
    pub total_attempts: usize,
    pub total_protocols_discovered: usize,
    pub success_rate: f64,
    pub avg_planner_calls_per_episode: f64,
    pub avg_reward_per_episode: f64,
    pub planner_efficiency: f64,
}

impl std::fmt::Display for TrajectoryMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "episodes:              {}", self.total_episodes)?;
        writeln!(f, "attempts:              {}", self.total_attempts)?;
        writeln!(f, "planner calls:         {}", self.total_planner_calls)?;
        writeln!(f, "protocols discovered:  {}", self.total_protocols_discovered)?;
        writeln!(f, "success rate:          {:.1}%", self.success_rate * 100.0)?;
        writeln!(f, "avg reward / episode:  {:.2}", self.avg_reward_per_episode)?;
        writeln!(f, "avg planner / episode: {:.2}", self.avg_planner_calls_per_episode)?;
        write!(f, "planner efficiency:    {:.1}%", self.planner_efficiency * 100.0)
    }
}

/// How long it took to first find a protocol in one episode
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FirstDiscovery {
    pub episode_id: u64,
    pub planner_calls: usize,
    /// 1-based index of the discovering attempt
    pub attempts: usize,
    pub elapsed_ms: u64,
    pub protocols_before: Vec<String>,
}

/// CSV row, one per attempt
#[derive(Debug, Serialize)]
struct AttemptRow<'a> {
    episode: u64,
    timestamp_ms: u64,
    skill_id: Option<SkillId>,
    reward: f64,
    cumulative_reward: f64,
    success: bool,
    done_reason: &'a str,
    new_protocols: String,
    new_instructions: usize,
    error_kind: Option<&'a str>,
    signature: Option<&'a str>,
    complexity: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrajectoryLog {
    pub episodes: Vec<Episode>,
}

impl TrajectoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a new episode, closing any that was left open
    pub fn start_episode(&mut self) -> u64 {
        if self.current().is_some() {
            warn!("previous episode was not ended, closing it");
            self.end_episode();
        }
        let id = self.episodes.last().map(|e| e.id + 1).unwrap_or(1);
        self.episodes.push(Episode {
            id,
            start_ms: current_timestamp(),
            end_ms: None,
            total_reward: 0.0,
            attempts: Vec::new(),
            planner_calls: Vec::new(),
            protocols_discovered: Vec::new(),
            skills_created: Vec::new(),
        });
        info!(episode = id, "episode started");
        id
    }

    pub fn end_episode(&mut self) {
        if let Some(episode) = self.current_mut() {
            episode.end_ms = Some(current_timestamp());
            info!(
                episode = episode.id,
                duration_ms = episode.duration_ms(),
                total_reward = episode.total_reward,
                "episode ended"
            );
        }
    }

    /// The open episode, if any
    pub fn current(&self) -> Option<&Episode> {
        self.episodes.last().filter(|e| e.is_open())
    }

    fn current_mut(&mut self) -> Option<&mut Episode> {
        self.episodes.last_mut().filter(|e| e.is_open())
    }

    fn require_current(&mut self) -> Result<&mut Episode> {
        self.current_mut()
            .ok_or_else(|| error::invalid_argument("no active episode"))
    }

    pub fn record_attempt(&mut self, entry: AttemptEntry) -> Result<()> {
        let episode = self.require_current()?;
        episode.total_reward += entry.reward;
        for protocol in &entry.new_protocols {
            if !episode.protocols_discovered.contains(protocol) {
                episode.protocols_discovered.push(protocol.clone());
            }
        }
        episode.attempts.push(entry);
        Ok(())
    }

    pub fn record_planner_call(&mut self, call: PlannerCall) -> Result<()> {
        self.require_current()?.planner_calls.push(call);
        Ok(())
    }

    pub fn record_skill_created(&mut self, name: impl Into<String>) -> Result<()> {
        self.require_current()?.skills_created.push(name.into());
        Ok(())
    }

    pub fn metrics(&self) -> TrajectoryMetrics {
        if self.episodes.is_empty() {
            return TrajectoryMetrics::default();
        }
        let episodes = self.episodes.len() as f64;
        let total_planner_calls: usize = self.episodes.iter().map(|e| e.planner_calls.len()).sum();
        let total_attempts: usize = self.episodes.iter().map(|e| e.attempts.len()).sum();
        let successes = self
            .episodes
            .iter()
            .flat_map(|e| &e.attempts)
            .filter(|a| a.success)
            .count();
        let generated = self
            .episodes
            .iter()
            .flat_map(|e| &e.planner_calls)
            .filter(|c| c.skill_generated)
            .count();
        let mut protocols: Vec<&str> = self
            .episodes
            .iter()
            .flat_map(|e| e.protocols_discovered.iter().map(String::as_str))
            .collect();
        protocols.sort_unstable();
        protocols.dedup();

        let ratio = |num: usize, den: usize| if den == 0 { 0.0 } else { num as f64 / den as f64 };
        TrajectoryMetrics {
            total_episodes: self.episodes.len(),
            total_planner_calls,
            total_attempts,
            total_protocols_discovered: protocols.len(),
            success_rate: ratio(successes, total_attempts),
            avg_planner_calls_per_episode: total_planner_calls as f64 / episodes,
            avg_reward_per_episode: self.episodes.iter().map(|e| e.total_reward).sum::<f64>() / episodes,
            planner_efficiency: ratio(generated, total_planner_calls),
        }
    }

    /// For each episode that found `protocol`, the effort it took
    pub fn first_discovery(&self, protocol: &str) -> Vec<FirstDiscovery> {
        self.episodes
            .iter()
            .filter_map(|ep| {
                let (i, attempt) = ep
                    .attempts
                    .iter()
                    .enumerate()
                    .find(|(_, a)| a.new_protocols.iter().any(|p| p == protocol))?;
                Some(FirstDiscovery {
                    episode_id: ep.id,
                    planner_calls: ep
                        .planner_calls
                        .iter()
                        .filter(|c| c.timestamp_ms <= attempt.timestamp_ms)
                        .count(),
                    attempts: i + 1,
                    elapsed_ms: attempt.timestamp_ms.saturating_sub(ep.start_ms),
                    protocols_before: ep.attempts[..i]
                        .iter()
                        .flat_map(|a| a.new_protocols.iter().cloned())
                        .collect(),
                })
            })
            .collect()
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| error::io_error(format!("Failed to read {}: {}", path.display(), e)))?;
        serde_json::from_str(&content).map_err(|e| {
            error::serialization_error(format!("Invalid trajectory {}: {}", path.display(), e))
        })
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| error::io_error(format!("Failed to create {}: {}", parent.display(), e)))?;
        }
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| error::serialization_error(e.to_string()))?;
        std::fs::write(path, json)
            .map_err(|e| error::io_error(format!("Failed to write {}: {}", path.display(), e)))
    }

    /// One CSV row per attempt, for plotting
    pub fn export_csv<W: std::io::Write>(&self, writer: W) -> Result<()> {
        let mut wtr = csv::Writer::from_writer(writer);
        for episode in &self.episodes {
            let mut cumulative = 0.0;
            for attempt in &episode.attempts {
                cumulative += attempt.reward;
                wtr.serialize(AttemptRow {
                    episode: episode.id,
                    timestamp_ms: attempt.timestamp_ms,
                    skill_id: attempt.skill_id,
                    reward: attempt.reward,
                    cumulative_reward: cumulative,
                    success: attempt.success,
                    done_reason: &attempt.done_reason,
                    new_protocols: attempt.new_protocols.join(";"),
                    new_instructions: attempt.new_instructions.len(),
                    error_kind: attempt.error_kind.as_deref(),
                    signature: attempt.transaction.as_ref().map(|t| t.signature.as_str()),
                    complexity: attempt.transaction.as_ref().map(|t| t.complexity),
                })
                .map_err(|e| error::serialization_error(format!("CSV export failed: {}", e)))?;
            }
        }
        wtr.flush()
            .map_err(|e| error::io_error(format!("CSV export failed: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use tempfile::TempDir;

    fn attempt_at(ts: u64, reward: f64, protocols: &[&str]) -> AttemptEntry {
        let mut entry = AttemptEntry::new(Some(0), reward, "skill_executed")
            .with_success(reward > 0.0)
            .with_discoveries(protocols.iter().map(|p| p.to_string()).collect(), vec![]);
        entry.timestamp_ms = ts;
        entry
    }

    fn call_at(ts: u64, generated: bool) -> PlannerCall {
        let mut call = PlannerCall::new("find a new protocol", 0);
        call.timestamp_ms = ts;
        call.success = true;
        call.skill_generated = generated;
        call
    }

    #[test]
    fn test_requires_open_episode() {
        let mut log = TrajectoryLog::new();
        let err = log.record_attempt(attempt_at(1, 0.0, &[])).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);

        log.start_episode();
        log.end_episode();
        assert!(log.record_skill_created("x").is_err());
    }

    #[test]
    fn test_totals_and_distinct_protocols() {
        let mut log = TrajectoryLog::new();
        assert_eq!(log.start_episode(), 1);
        log.record_attempt(attempt_at(10, 1.5, &["Jupiter"])).unwrap();
        log.record_attempt(attempt_at(20, 0.0, &[])).unwrap();
        log.record_attempt(attempt_at(30, 1.0, &["Orca", "Jupiter"])).unwrap();

        let episode = log.current().unwrap();
        assert_eq!(episode.total_reward, 2.5);
        assert_eq!(episode.protocols_discovered, vec!["Jupiter", "Orca"]);
    }

    #[test]
    fn test_metrics() {
        let mut log = TrajectoryLog::new();
        log.start_episode();
        log.record_planner_call(call_at(1, true)).unwrap();
        log.record_planner_call(call_at(2, false)).unwrap();
        log.record_attempt(attempt_at(3, 1.0, &["Jupiter"])).unwrap();
        log.record_attempt(attempt_at(4, 0.0, &[])).unwrap();
        log.end_episode();

        log.start_episode();
        log.record_attempt(attempt_at(5, 1.0, &["Orca"])).unwrap();
        log.end_episode();

        let m = log.metrics();
        assert_eq!(m.total_episodes, 2);
        assert_eq!(m.total_attempts, 3);
        assert_eq!(m.total_protocols_discovered, 2);
        assert_eq!(m.total_planner_calls, 2);
        assert!((m.success_rate - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(m.avg_reward_per_episode, 1.0);
        assert_eq!(m.planner_efficiency, 0.5);
        assert_eq!(TrajectoryLog::new().metrics(), TrajectoryMetrics::default());
    }

    #[test]
    fn test_first_discovery() {
        let mut log = TrajectoryLog::new();
        log.start_episode();
        let start = log.current().unwrap().start_ms;
        log.record_planner_call(call_at(start + 1, true)).unwrap();
        log.record_attempt(attempt_at(start + 2, 1.0, &["Orca"])).unwrap();
        log.record_planner_call(call_at(start + 3, true)).unwrap();
        log.record_attempt(attempt_at(start + 4, 1.0, &["Jupiter"])).unwrap();
        log.record_planner_call(call_at(start + 5, false)).unwrap();
        log.end_episode();

        let found = log.first_discovery("Jupiter");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].planner_calls, 2);
        assert_eq!(found[0].attempts, 2);
        assert_eq!(found[0].elapsed_ms, 4);
        assert_eq!(found[0].protocols_before, vec!["Orca"]);
        assert!(log.first_discovery("Raydium").is_empty());
    }

    #[test]
    fn test_save_load_and_csv() {
        let dir = TempDir::new().unwrap();
        let mut log = TrajectoryLog::new();
        log.start_episode();
        log.record_attempt(attempt_at(1, 1.0, &["Jupiter", "Orca"])).unwrap();
        let failed = AttemptEntry::new(None, 0.0, "execution_failed")
            .with_error(&error::malformed_output("two transactions"));
        log.record_attempt(failed).unwrap();
        log.end_episode();

        let path = dir.path().join("runs/trajectory.json");
        log.save(&path).unwrap();
        assert_eq!(TrajectoryLog::load(&path).unwrap(), log);

        let mut buf = Vec::new();
        log.export_csv(&mut buf).unwrap();
        let text = String::from_utf8(buf).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("episode,timestamp_ms,skill_id,reward"));
        assert!(lines[1].contains("Jupiter;Orca"));
        assert!(lines[2].contains("MalformedOutput"));
    }
}
