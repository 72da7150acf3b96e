//! In-memory stand-ins for the planner, the skill runtime and the chain

use crate::agent::{Environment, EnvironmentLauncher, ExampleSource};
use serde_json::Value;
use solana_sdk::hash::Hash;
use solana_sdk::pubkey::Pubkey;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use voyager_env::discovery::{DiscoveryEngine, RewardPolicy};
use voyager_env::error::{self, Result};
use voyager_env::fetch::ExampleTransaction;
use voyager_env::gateway::{ExecutionBindings, ExecutionErrorKind, ExecutionOutcome, SkillExecutor};
use voyager_env::planner::{ContextUpdate, SkillPlanner};
use voyager_env::programs::ProgramRegistry;
use voyager_env::record::{InstructionRecord, TransactionRecord};
use voyager_env::session::Observation;
use voyager_env::submission::{SubmitOutcome, TransactionSubmitter};

pub const JUPITER: &str = "JUP6LkbZbjS1jKKwapdHNy74zcZ3tLUZoi5QNyVTaV4";
pub const ORCA: &str = "whirLbMiicVdio4qvUfM5KAg6Ct8VwpYzGff3uctyCc";
pub const SYSTEM: &str = "11111111111111111111111111111111";

pub fn engine() -> DiscoveryEngine {
    DiscoveryEngine::new(
        Arc::new(ProgramRegistry::from_pairs([(JUPITER, "Jupiter"), (ORCA, "Orca")])),
        RewardPolicy::default(),
    )
}

// ============================================================================
// Planner
// ============================================================================

/// Replays canned proposals and remembers the error each call was given
#[derive(Default)]
pub struct ScriptedPlanner {
    replies: Mutex<VecDeque<Result<String>>>,
    pub errors_seen: Mutex<Vec<Option<String>>>,
    pub updates: Mutex<Vec<&'static str>>,
}

impl ScriptedPlanner {
    pub fn new<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            replies: Mutex::new(replies.into_iter().map(|s| Ok(s.into())).collect()),
            ..Default::default()
        }
    }

    pub fn push_error(&self, err: error::Error) {
        self.replies.lock().unwrap().push_back(Err(err));
    }

    pub fn calls(&self) -> usize {
        self.errors_seen.lock().unwrap().len()
    }
}

impl SkillPlanner for ScriptedPlanner {
    async fn propose(&self, _observation: &Value, _objective: &str, error: Option<&str>) -> Result<String> {
        self.errors_seen.lock().unwrap().push(error.map(str::to_string));
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(error::inference_failed("script exhausted")))
    }

    fn update_context(&self, update: ContextUpdate) {
        let label = match update {
            ContextUpdate::Discovered(_) => "discovered",
            ContextUpdate::Skills(_) => "skills",
            ContextUpdate::Examples { .. } => "examples",
            ContextUpdate::Reset => "reset",
        };
        self.updates.lock().unwrap().push(label);
    }
}

// ============================================================================
// Skill runtime
// ============================================================================

/// Sources of the form `tx:<key>` build the transaction `<key>`;
/// `timeout` times out; anything else throws.
#[derive(Default)]
pub struct FakeRuntime {
    pub bindings_seen: Mutex<Vec<ExecutionBindings>>,
}

impl SkillExecutor for FakeRuntime {
    async fn execute(&self, skill_path: &Path, bindings: &ExecutionBindings) -> ExecutionOutcome {
        match std::fs::read_to_string(skill_path) {
            Ok(source) => self.execute_source(&source, bindings).await,
            Err(e) => ExecutionOutcome::Err {
                kind: ExecutionErrorKind::RuntimeError,
                detail: e.to_string(),
            },
        }
    }

    async fn execute_source(&self, source: &str, bindings: &ExecutionBindings) -> ExecutionOutcome {
        self.bindings_seen.lock().unwrap().push(bindings.clone());
        if let Some(key) = source.strip_prefix("tx:") {
            return ExecutionOutcome::Ok {
                serialized_tx: key.to_string(),
                tx_bytes: key.as_bytes().to_vec(),
                stdout: String::new(),
            };
        }
        if source == "timeout" {
            return ExecutionOutcome::Err {
                kind: ExecutionErrorKind::Timeout,
                detail: "skill timed out after 10000ms".into(),
            };
        }
        ExecutionOutcome::Err {
            kind: ExecutionErrorKind::RuntimeError,
            detail: format!("SyntaxError: Unexpected token in '{}'", source),
        }
    }
}

// ============================================================================
// Chain
// ============================================================================

/// Transactions the fake chain understands, keyed by their wire bytes:
/// - `jup`: touches Jupiter with empty data
/// - `jup-swap`: Jupiter instruction with discriminator 7
/// - `orca`: touches Orca with empty data
/// - `system`: System Program only
/// - `fail`: Jupiter instruction that fails on chain
/// - `maybe`: the validator's malformed error response
/// - anything else is rejected by the RPC
pub fn canned_outcome(key: &str) -> SubmitOutcome {
    let touch = |program: &str, data: &str| {
        TransactionRecord::new(
            vec!["Agent".into(), program.into()],
            vec![InstructionRecord::new(1, vec![0], data)],
        )
    };
    let mut outcome = match key {
        "jup" => touch(JUPITER, ""),
        // base58 "8" is the single byte 7
        "jup-swap" => touch(JUPITER, "8"),
        "orca" => touch(ORCA, ""),
        "system" => touch(SYSTEM, ""),
        "fail" => {
            let mut record = touch(JUPITER, "").with_failure("custom program error: 0x1771");
            record.log_lines = vec![
                format!("Program {} invoke [1]", JUPITER),
                "Program log: Error: SlippageToleranceExceeded".into(),
            ];
            record
        }
        "maybe" => {
            return SubmitOutcome::PossiblySucceeded {
                signature: None,
                detail: "error response without data field".into(),
            }
        }
        other => return SubmitOutcome::Failed(error::submission_failed(format!("rejected '{}'", other))),
    };
    outcome.signature = format!("sig-{}", key);
    SubmitOutcome::Confirmed(outcome)
}

/// Submitter and environment backed by [`canned_outcome`]
#[derive(Default)]
pub struct FakeChain {
    pub submitted: Mutex<Vec<String>>,
    pub closes: Arc<AtomicUsize>,
}

impl TransactionSubmitter for FakeChain {
    fn agent_pubkey(&self) -> Pubkey {
        Pubkey::default()
    }

    async fn latest_blockhash(&self) -> Result<Hash> {
        Ok(Hash::new_from_array([7; 32]))
    }

    async fn submit(&self, unsigned: &[u8], _blockhash: Hash) -> SubmitOutcome {
        let key = String::from_utf8_lossy(unsigned).to_string();
        self.submitted.lock().unwrap().push(key.clone());
        canned_outcome(&key)
    }
}

impl Environment for FakeChain {
    async fn observe(&self) -> Observation {
        Observation {
            agent_pubkey: self.agent_pubkey().to_string(),
            sol_balance: 2.0,
            block_height: 100,
            ..Default::default()
        }
    }

    async fn close(&mut self) -> Result<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Hands out fresh [`FakeChain`]s, or fails like a validator that never got ready
#[derive(Default)]
pub struct FakeLauncher {
    pub fail: bool,
    pub launches: AtomicUsize,
    pub closes: Arc<AtomicUsize>,
}

impl FakeLauncher {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

impl EnvironmentLauncher for FakeLauncher {
    type Env = FakeChain;

    async fn launch(&self) -> Result<FakeChain> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(error::launch_timeout("surfpool", 60));
        }
        Ok(FakeChain {
            closes: self.closes.clone(),
            ..Default::default()
        })
    }
}

/// Example transactions without a network
#[derive(Default)]
pub struct FakeExamples;

impl ExampleSource for FakeExamples {
    async fn fetch_examples(&self, program_id: &str, limit: usize) -> Result<Vec<ExampleTransaction>> {
        Ok((0..limit.min(3))
            .map(|i| ExampleTransaction {
                signature: format!("{}-{}", program_id, i),
                success: true,
                error: None,
                instructions: Vec::new(),
                logs: Vec::new(),
            })
            .collect())
    }
}
