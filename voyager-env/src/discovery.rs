//! # Discovery & Reward Engine
//!
//! Derives the reward for a confirmed transaction from what it touched for
//! the first time, and records those first sightings in a [`DiscoveryState`].
//!
//! Two tables are kept:
//! - protocols, keyed by the project's display name
//! - instructions, keyed by `(program id, first payload byte)`
//!
//! Both only ever grow. An update is all-or-nothing: a record that cannot be
//! interpreted leaves the state untouched and earns nothing.

use crate::error::{self, Error};
use crate::programs::ProgramRegistry;
use crate::record::TransactionRecord;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// How long discoveries are remembered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiscoveryScope {
    /// Cleared on every episode reset
    #[default]
    Episode,
    /// Kept for the whole run and persisted between runs
    Run,
}

/// Reward weights
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RewardPolicy {
    /// Per newly discovered protocol
    pub protocol_bonus: f64,
    /// Per newly discovered (program, discriminator) pair
    pub instruction_bonus: f64,
    /// Flat bonus for a successful transaction; 0 rewards discovery only
    pub success_bonus: f64,
    pub scope: DiscoveryScope,
}

impl Default for RewardPolicy {
    fn default() -> Self {
        Self {
            protocol_bonus: 1.0,
            instruction_bonus: 0.5,
            success_bonus: 0.0,
            scope: DiscoveryScope::Episode,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InstructionKey {
    pub program_id: String,
    pub discriminator: u8,
}

impl std::fmt::Display for InstructionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.program_id, self.discriminator)
    }
}

/// Everything discovered so far
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryState {
    /// Display name -> program id it was first seen through
    pub protocols: BTreeMap<String, String>,
    pub instructions: BTreeSet<InstructionKey>,
}

/// Counts handed to observers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoverySnapshot {
    pub protocols: usize,
    pub instructions: usize,
}

impl DiscoveryState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> DiscoverySnapshot {
        DiscoverySnapshot {
            protocols: self.protocols.len(),
            instructions: self.instructions.len(),
        }
    }

    pub fn has_protocol(&self, name: &str) -> bool {
        self.protocols.contains_key(name)
    }

    pub fn clear(&mut self) {
        self.protocols.clear();
        self.instructions.clear();
    }

    pub fn load(path: impl AsRef<std::path::Path>) -> crate::error::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| error::io_error(format!("Failed to read {}: {}", path.display(), e)))?;
        serde_json::from_str(&content).map_err(|e| error::serialization_error(e.to_string()))
    }

    pub fn save(&self, path: impl AsRef<std::path::Path>) -> crate::error::Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| error::io_error(format!("Failed to create {}: {}", parent.display(), e)))?;
        }
        let json = serde_json::to_string_pretty(self).map_err(|e| error::serialization_error(e.to_string()))?;
        std::fs::write(path, json)
            .map_err(|e| error::io_error(format!("Failed to write {}: {}", path.display(), e)))
    }
}

/// Result of scoring one transaction. Never an error: parse problems are
/// reported through `diagnostic` with a zero reward.
#[derive(Debug, Default)]
pub struct RewardOutcome {
    pub reward: f64,
    /// Display names, in discovery order
    pub new_protocols: Vec<String>,
    pub new_instructions: Vec<InstructionKey>,
    pub diagnostic: Option<Error>,
}

impl RewardOutcome {
    pub fn discovered_anything(&self) -> bool {
        !self.new_protocols.is_empty() || !self.new_instructions.is_empty()
    }
}

pub struct DiscoveryEngine {
    registry: Arc<ProgramRegistry>,
    policy: RewardPolicy,
}

impl DiscoveryEngine {
    pub fn new(registry: Arc<ProgramRegistry>, policy: RewardPolicy) -> Self {
        Self { registry, policy }
    }

    pub fn registry(&self) -> &ProgramRegistry {
        &self.registry
    }

    pub fn policy(&self) -> &RewardPolicy {
        &self.policy
    }

    /// Score `record` against `state` and commit what it discovered.
    pub fn compute_reward_and_update(
        &self,
        record: Option<&TransactionRecord>,
        state: &mut DiscoveryState,
    ) -> RewardOutcome {
        let Some(record) = record else {
            return RewardOutcome::default();
        };

        let (new_protocols, new_instructions) = match self.candidates(record, state) {
            Ok(found) => found,
            Err(e) => {
                warn!(signature = %record.signature, error = %e, "discovery skipped for malformed record");
                return RewardOutcome {
                    diagnostic: Some(e),
                    ..Default::default()
                };
            }
        };

        let mut reward = new_protocols.len() as f64 * self.policy.protocol_bonus
            + new_instructions.len() as f64 * self.policy.instruction_bonus;
        if record.succeeded {
            reward += self.policy.success_bonus;
        }

        for (name, program_id) in &new_protocols {
            info!(protocol = %name, %program_id, "new protocol discovered");
            state.protocols.insert(name.clone(), program_id.clone());
        }
        for key in &new_instructions {
            debug!(program_id = %key.program_id, discriminator = key.discriminator, "new instruction discovered");
            state.instructions.insert(key.clone());
        }

        RewardOutcome {
            reward,
            new_protocols: new_protocols.into_iter().map(|(name, _)| name).collect(),
            new_instructions,
            diagnostic: None,
        }
    }

    /// Work out what is new without touching `state`
    fn candidates(
        &self,
        record: &TransactionRecord,
        state: &DiscoveryState,
    ) -> crate::error::Result<(Vec<(String, String)>, Vec<InstructionKey>)> {
        let flat = record.flatten()?;

        let mut programs: Vec<&str> = Vec::with_capacity(flat.len() + record.account_keys.len());
        let mut keys: Vec<(&str, Option<u8>)> = Vec::with_capacity(flat.len());
        for f in &flat {
            let program_id = record.program_id(f.instruction)?;
            if let Some(bad) = f.instruction.accounts.iter().find(|&&i| i >= record.account_keys.len()) {
                return Err(error::parse_error(format!(
                    "instruction {} references account {} ({} account keys)",
                    f.label,
                    bad,
                    record.account_keys.len()
                )));
            }
            programs.push(program_id);
            keys.push((program_id, f.instruction.discriminator()));
        }
        // bare account references count for protocol discovery too
        programs.extend(record.account_keys.iter().map(String::as_str));

        let mut new_protocols: Vec<(String, String)> = Vec::new();
        for program_id in programs {
            let Some(name) = self.registry.display_name(program_id) else {
                continue;
            };
            if state.has_protocol(name) || new_protocols.iter().any(|(n, _)| n == name) {
                continue;
            }
            new_protocols.push((name.to_string(), program_id.to_string()));
        }

        let mut new_instructions: Vec<InstructionKey> = Vec::new();
        for (program_id, discriminator) in keys {
            let Some(discriminator) = discriminator else {
                continue;
            };
            if !self.registry.contains(program_id) {
                continue;
            }
            let key = InstructionKey {
                program_id: program_id.to_string(),
                discriminator,
            };
            if !state.instructions.contains(&key) && !new_instructions.contains(&key) {
                new_instructions.push(key);
            }
        }

        Ok((new_protocols, new_instructions))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::record::InstructionRecord;

    const JUP: &str = "JUP6LkbZbjS1jKKwapdHNy74zcZ3tLUZoi5QNyVTaV4";
    const ORCA: &str = "whirLbMiicVdio4qvUfM5KAg6Ct8VwpYzGff3uctyCc";
    const TOKEN: &str = "TokenkegQfeZyiNwAJbNbGQPxJ7WFtqTwDy5JT6uLiU4";
    const PAYER: &str = "Agent1111111111111111111111111111111111111";

    fn engine() -> DiscoveryEngine {
        let registry = ProgramRegistry::from_pairs([(JUP, "Jupiter"), (ORCA, "Orca"), (TOKEN, "SPL Token")]);
        DiscoveryEngine::new(Arc::new(registry), RewardPolicy::default())
    }

    fn data(bytes: &[u8]) -> String {
        bs58::encode(bytes).into_string()
    }

    fn keys(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_absent_record() {
        let mut state = DiscoveryState::new();
        let outcome = engine().compute_reward_and_update(None, &mut state);
        assert_eq!(outcome.reward, 0.0);
        assert_eq!(state, DiscoveryState::new());
    }

    #[test]
    fn test_first_jupiter_interaction() {
        let engine = engine();
        let mut state = DiscoveryState::new();
        let record = TransactionRecord::new(keys(&[PAYER, JUP]), vec![InstructionRecord::new(1, vec![0], "")]);

        let outcome = engine.compute_reward_and_update(Some(&record), &mut state);
        assert_eq!(outcome.reward, 1.0);
        assert_eq!(outcome.new_protocols, vec!["Jupiter".to_string()]);
        assert!(outcome.new_instructions.is_empty());
        assert!(state.has_protocol("Jupiter"));

        // same transaction again
        let again = engine.compute_reward_and_update(Some(&record), &mut state);
        assert_eq!(again.reward, 0.0);
        assert!(!again.discovered_anything());
    }

    #[test]
    fn test_new_instruction_on_known_program() {
        let engine = engine();
        let mut state = DiscoveryState::new();
        let first = TransactionRecord::new(keys(&[PAYER, JUP]), vec![InstructionRecord::new(1, vec![0], data(&[7, 1]))]);
        assert_eq!(engine.compute_reward_and_update(Some(&first), &mut state).reward, 1.5);

        let second = TransactionRecord::new(keys(&[PAYER, JUP]), vec![InstructionRecord::new(1, vec![0], data(&[9]))]);
        let before = state.instructions.len();
        let outcome = engine.compute_reward_and_update(Some(&second), &mut state);
        assert_eq!(outcome.reward, 0.5);
        assert_eq!(state.instructions.len(), before + 1);
        assert_eq!(
            outcome.new_instructions,
            vec![InstructionKey { program_id: JUP.into(), discriminator: 9 }]
        );
    }

    #[test]
    fn test_protocol_counted_once_per_transaction() {
        let engine = engine();
        let mut state = DiscoveryState::new();
        let record = TransactionRecord::new(
            keys(&[PAYER, JUP]),
            vec![
                InstructionRecord::new(1, vec![0], data(&[1])),
                InstructionRecord::new(1, vec![0], data(&[1])),
                InstructionRecord::new(1, vec![0], data(&[2])),
            ],
        );
        let outcome = engine.compute_reward_and_update(Some(&record), &mut state);
        // one protocol, two distinct discriminators
        assert_eq!(outcome.reward, 1.0 + 2.0 * 0.5);
    }

    #[test]
    fn test_discovery_follows_execution_order() {
        let engine = engine();
        let mut state = DiscoveryState::new();
        // top-level 0 = Jupiter, its inner ixs hit Orca then Token; top-level 1 = Token
        let record = TransactionRecord::new(
            keys(&[PAYER, TOKEN, ORCA, JUP]),
            vec![
                InstructionRecord::new(3, vec![0], data(&[1])),
                InstructionRecord::new(1, vec![0], data(&[3])),
            ],
        )
        .with_inner(0, vec![
            InstructionRecord::new(2, vec![0], data(&[4])),
            InstructionRecord::new(1, vec![0], data(&[12])),
        ]);

        let labels: Vec<String> = record.flatten().unwrap().into_iter().map(|f| f.label).collect();
        assert_eq!(labels, vec!["0", "0.0", "0.1", "1"]);

        let outcome = engine.compute_reward_and_update(Some(&record), &mut state);
        assert_eq!(outcome.new_protocols, vec!["Jupiter", "Orca", "SPL Token"]);
        let order: Vec<u8> = outcome.new_instructions.iter().map(|k| k.discriminator).collect();
        assert_eq!(order, vec![1, 4, 12, 3]);
    }

    #[test]
    fn test_failed_transaction_still_discovers_by_account_key() {
        let engine = engine();
        let mut state = DiscoveryState::new();
        let record = TransactionRecord::new(keys(&[PAYER, ORCA, TOKEN]), vec![InstructionRecord::new(2, vec![0, 1], "")])
            .with_failure("InstructionError(0, Custom(1))");

        let outcome = engine.compute_reward_and_update(Some(&record), &mut state);
        assert_eq!(outcome.new_protocols, vec!["SPL Token", "Orca"]);
        assert_eq!(outcome.reward, 2.0);
    }

    #[test]
    fn test_unknown_programs_earn_nothing() {
        let engine = engine();
        let mut state = DiscoveryState::new();
        let record = TransactionRecord::new(
            keys(&[PAYER, "11111111111111111111111111111111"]),
            vec![InstructionRecord::new(1, vec![0], data(&[2, 0, 0, 0]))],
        );
        let outcome = engine.compute_reward_and_update(Some(&record), &mut state);
        assert_eq!(outcome.reward, 0.0);
        assert!(state.instructions.is_empty());
    }

    #[test]
    fn test_out_of_range_index_is_a_no_op() {
        let engine = engine();
        let mut state = DiscoveryState::new();
        // JUP is referenced by key, but the instruction's program index is bogus
        let record = TransactionRecord::new(keys(&[PAYER, JUP]), vec![InstructionRecord::new(5, vec![0], data(&[1]))]);

        let outcome = engine.compute_reward_and_update(Some(&record), &mut state);
        assert_eq!(outcome.reward, 0.0);
        assert!(outcome.new_protocols.is_empty());
        assert_eq!(outcome.diagnostic.map(|e| e.kind()), Some(ErrorKind::ParseFailed));
        assert_eq!(state, DiscoveryState::new());

        let bad_account = TransactionRecord::new(keys(&[PAYER, JUP]), vec![InstructionRecord::new(1, vec![9], "")]);
        let outcome = engine.compute_reward_and_update(Some(&bad_account), &mut state);
        let diagnostic = outcome.diagnostic.unwrap();
        assert_eq!(diagnostic.kind(), ErrorKind::ParseFailed);
        assert!(diagnostic.message().contains("references account 9"));
        assert_eq!(state, DiscoveryState::new());

        let orphan = TransactionRecord::new(keys(&[PAYER, JUP]), vec![]).with_inner(0, vec![]);
        assert!(engine.compute_reward_and_update(Some(&orphan), &mut state).diagnostic.is_some());
    }

    #[test]
    fn test_order_decides_reward_not_final_state() {
        let engine = engine();
        let a = TransactionRecord::new(keys(&[PAYER, ORCA]), vec![InstructionRecord::new(1, vec![0], data(&[5]))]);
        let b = TransactionRecord::new(keys(&[PAYER, ORCA]), vec![InstructionRecord::new(1, vec![0], data(&[5]))]);

        let mut ab = DiscoveryState::new();
        let ra = engine.compute_reward_and_update(Some(&a), &mut ab).reward;
        let rb = engine.compute_reward_and_update(Some(&b), &mut ab).reward;

        let mut ba = DiscoveryState::new();
        let rb2 = engine.compute_reward_and_update(Some(&b), &mut ba).reward;
        let ra2 = engine.compute_reward_and_update(Some(&a), &mut ba).reward;

        assert_eq!(ab, ba);
        assert_eq!((ra, rb), (1.5, 0.0));
        assert_eq!((rb2, ra2), (1.5, 0.0));
    }

    #[test]
    fn test_monotonic_growth() {
        let engine = engine();
        let mut state = DiscoveryState::new();
        let records = vec![
            Some(TransactionRecord::new(keys(&[PAYER, JUP]), vec![InstructionRecord::new(1, vec![], data(&[1]))])),
            None,
            Some(TransactionRecord::new(keys(&[PAYER]), vec![InstructionRecord::new(4, vec![], "")])),
            Some(TransactionRecord::new(keys(&[PAYER, TOKEN]), vec![InstructionRecord::new(1, vec![], data(&[3]))])),
            Some(TransactionRecord::new(keys(&[PAYER, JUP]), vec![InstructionRecord::new(1, vec![], data(&[1]))])),
        ];

        let mut previous = state.clone();
        for record in &records {
            engine.compute_reward_and_update(record.as_ref(), &mut state);
            assert!(previous.protocols.keys().all(|k| state.protocols.contains_key(k)));
            assert!(previous.instructions.is_subset(&state.instructions));
            previous = state.clone();
        }
        assert_eq!(state.snapshot(), DiscoverySnapshot { protocols: 2, instructions: 2 });
    }

    #[test]
    fn test_success_bonus_policy() {
        let registry = ProgramRegistry::from_pairs([(JUP, "Jupiter")]);
        let policy = RewardPolicy { success_bonus: 1.0, ..Default::default() };
        let engine = DiscoveryEngine::new(Arc::new(registry), policy);
        let mut state = DiscoveryState::new();

        let ok = TransactionRecord::new(keys(&[PAYER]), vec![]);
        assert_eq!(engine.compute_reward_and_update(Some(&ok), &mut state).reward, 1.0);
        let failed = ok.with_failure("boom");
        assert_eq!(engine.compute_reward_and_update(Some(&failed), &mut state).reward, 0.0);
    }

    #[test]
    fn test_shared_display_name_counts_once() {
        let registry = ProgramRegistry::from_pairs([(JUP, "Jupiter"), (ORCA, "Jupiter")]);
        let engine = DiscoveryEngine::new(Arc::new(registry), RewardPolicy::default());
        let mut state = DiscoveryState::new();
        let record = TransactionRecord::new(keys(&[PAYER, JUP, ORCA]), vec![]);
        let outcome = engine.compute_reward_and_update(Some(&record), &mut state);
        assert_eq!(outcome.reward, 1.0);
        assert_eq!(state.protocols.get("Jupiter").map(String::as_str), Some(JUP));
    }

    #[test]
    fn test_state_persistence() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("nested/discovery.json");
        let mut state = DiscoveryState::new();
        state.protocols.insert("Orca".into(), ORCA.into());
        state.instructions.insert(InstructionKey { program_id: ORCA.into(), discriminator: 2 });
        state.save(&path).unwrap();
        assert_eq!(DiscoveryState::load(&path).unwrap(), state);
    }

    #[test]
    fn test_policy_scope_serde() {
        let policy: RewardPolicy = serde_json::from_str(r#"{"scope": "run"}"#).unwrap();
        assert_eq!(policy.scope, DiscoveryScope::Run);
        assert_eq!(policy.protocol_bonus, 1.0);
    }
}
