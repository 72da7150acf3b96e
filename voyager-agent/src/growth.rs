//! Skill growth loop
//!
//! `Proposing -> Testing -> {Accepted, Retrying -> Proposing, ExhaustedFailed}`
//!
//! A candidate is run exactly once per proposal. Registration is the only
//! side effect of `Accepted`; a rejected candidate leaves the registry and the
//! discovery state untouched.

use serde_json::Value;
use tracing::{debug, info, warn};
use voyager_env::discovery::{DiscoveryEngine, DiscoveryState, RewardOutcome};
use voyager_env::error::{self, Error, ErrorKind, Result};
use voyager_env::gateway::{ExecutionBindings, ExecutionOutcome, SkillExecutor};
use voyager_env::planner::SkillPlanner;
use voyager_env::record::TransactionRecord;
use voyager_env::registry::{SkillId, SkillRegistry};
use voyager_env::submission::{SubmitOutcome, TransactionSubmitter};
use voyager_env::trajectory::{AttemptEntry, PlannerCall, TrajectoryLog};

/// Proposals per loop unless configured otherwise
pub const DEFAULT_MAX_TRIES: usize = 3;

/// Log lines appended to on-chain failure feedback
const FEEDBACK_LOG_LINES: usize = 8;

#[derive(Debug, Clone, PartialEq)]
pub enum GrowthState {
    Proposing { attempt: usize },
    Testing { attempt: usize, source: String },
    Retrying { attempt: usize, error: String },
    Accepted { skill_id: SkillId },
    ExhaustedFailed { last_error: String },
}

impl GrowthState {
    pub fn name(&self) -> &'static str {
        match self {
            GrowthState::Proposing { .. } => "proposing",
            GrowthState::Testing { .. } => "testing",
            GrowthState::Retrying { .. } => "retrying",
            GrowthState::Accepted { .. } => "accepted",
            GrowthState::ExhaustedFailed { .. } => "exhausted_failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, GrowthState::Accepted { .. } | GrowthState::ExhaustedFailed { .. })
    }
}

/// How a loop ended
#[derive(Debug)]
pub struct GrowthReport {
    pub final_state: GrowthState,
    /// State names in the order they were entered
    pub history: Vec<&'static str>,
    /// Proposals made
    pub attempts: usize,
    /// Discovery reward of the accepted candidate
    pub reward: f64,
    pub discovery: Option<RewardOutcome>,
    /// Set when the accepted candidate's submission was only possibly successful
    pub optimistic: bool,
}

impl GrowthReport {
    pub fn skill_id(&self) -> Option<SkillId> {
        match self.final_state {
            GrowthState::Accepted { skill_id } => Some(skill_id),
            _ => None,
        }
    }

    pub fn accepted(&self) -> bool {
        self.skill_id().is_some()
    }

    pub fn last_error(&self) -> Option<&str> {
        match &self.final_state {
            GrowthState::ExhaustedFailed { last_error } => Some(last_error),
            _ => None,
        }
    }
}

/// What a successful test produced
enum Verdict {
    Confirmed {
        record: TransactionRecord,
        trial: DiscoveryState,
        outcome: RewardOutcome,
    },
    Optimistic {
        signature: Option<String>,
        detail: String,
    },
}

/// Drives one skill from proposal to acceptance or exhaustion
pub struct GrowthLoop<'a, P, E, S> {
    planner: &'a P,
    executor: &'a E,
    submitter: &'a S,
    engine: &'a DiscoveryEngine,
    max_tries: usize,
    require_discovery: bool,
}

impl<'a, P, E, S> GrowthLoop<'a, P, E, S>
where
    P: SkillPlanner,
    E: SkillExecutor,
    S: TransactionSubmitter,
{
    pub fn new(planner: &'a P, executor: &'a E, submitter: &'a S, engine: &'a DiscoveryEngine) -> Self {
        Self {
            planner,
            executor,
            submitter,
            engine,
            max_tries: DEFAULT_MAX_TRIES,
            require_discovery: false,
        }
    }

    pub fn with_max_tries(mut self, max_tries: usize) -> Self {
        self.max_tries = max_tries.max(1);
        self
    }

    /// Treat a confirmed transaction that discovered nothing as a failure
    pub fn with_require_discovery(mut self, require: bool) -> Self {
        self.require_discovery = require;
        self
    }

    /// Run the loop to a terminal state.
    ///
    /// Only storage failures while registering an accepted skill are
    /// returned as errors; everything else ends in a report.
    pub async fn run(
        &self,
        registry: &mut SkillRegistry,
        discovery: &mut DiscoveryState,
        log: &mut TrajectoryLog,
        observation: &Value,
        objective: &str,
    ) -> Result<GrowthReport> {
        let mut state = GrowthState::Proposing { attempt: 1 };
        let mut history = vec![state.name()];
        let mut last_error: Option<String> = None;
        let mut pending_call: Option<PlannerCall> = None;
        let mut reward = 0.0;
        let mut accepted_outcome = None;
        let mut optimistic = false;

        while !state.is_terminal() {
            state = match state {
                GrowthState::Proposing { attempt } => {
                    debug!(attempt, "proposing skill");
                    let mut call = PlannerCall::new(objective, attempt - 1);
                    match registry
                        .propose(self.planner, observation, objective, last_error.as_deref())
                        .await
                    {
                        Ok(source) => {
                            call.success = true;
                            pending_call = Some(call);
                            GrowthState::Testing { attempt, source }
                        }
                        Err(e) => {
                            warn!(attempt, error = %e, "planner failed");
                            call.error = Some(e.to_string());
                            note(log.record_planner_call(call));
                            GrowthState::Retrying {
                                attempt,
                                error: feedback(&e),
                            }
                        }
                    }
                }
                GrowthState::Testing { attempt, source } => {
                    let mut call = pending_call.take();
                    let next = match self.test(&source, discovery).await {
                        Ok(verdict) => {
                            let (outcome, trial, mut entry) = match verdict {
                                Verdict::Confirmed { record, trial, outcome } => {
                                    let entry = AttemptEntry::new(None, outcome.reward, "skill_accepted")
                                        .with_success(true)
                                        .with_discoveries(
                                            outcome.new_protocols.clone(),
                                            outcome.new_instructions.clone(),
                                        )
                                        .with_transaction(record.summary());
                                    (Some(outcome), Some(trial), entry)
                                }
                                Verdict::Optimistic { signature, detail } => {
                                    info!(?signature, detail = %detail, "accepting possibly-succeeded candidate without discovery update");
                                    optimistic = true;
                                    let entry = AttemptEntry::new(None, 0.0, "skill_accepted_possibly_succeeded")
                                        .with_error(&error::possibly_succeeded(detail));
                                    (None, None, entry)
                                }
                            };

                            let skill_id = registry.register(source, None, Some(objective))?;
                            if let Some(trial) = trial {
                                *discovery = trial;
                            }
                            entry.skill_id = Some(skill_id);
                            reward = entry.reward;
                            accepted_outcome = outcome;
                            if let Some(call) = call.as_mut() {
                                call.skill_generated = true;
                            }
                            note(log.record_attempt(entry));
                            let name = registry.get(skill_id).map(|s| s.display_name()).unwrap_or_default();
                            note(log.record_skill_created(name));
                            GrowthState::Accepted { skill_id }
                        }
                        Err(e) => {
                            warn!(attempt, error = %e, "candidate rejected");
                            note(log.record_attempt(
                                AttemptEntry::new(None, 0.0, "candidate_failed").with_error(&e),
                            ));
                            if let Some(call) = call.as_mut() {
                                call.error = Some(e.to_string());
                            }
                            GrowthState::Retrying {
                                attempt,
                                error: feedback(&e),
                            }
                        }
                    };
                    if let Some(call) = call {
                        note(log.record_planner_call(call));
                    }
                    next
                }
                GrowthState::Retrying { attempt, error } => {
                    if attempt >= self.max_tries {
                        GrowthState::ExhaustedFailed { last_error: error }
                    } else {
                        last_error = Some(error);
                        GrowthState::Proposing { attempt: attempt + 1 }
                    }
                }
                terminal => terminal,
            };
            history.push(state.name());
        }

        let attempts = history.iter().filter(|s| **s == "proposing").count();
        match &state {
            GrowthState::Accepted { skill_id } => info!(skill_id, attempts, reward, "skill accepted"),
            GrowthState::ExhaustedFailed { last_error } => {
                warn!(attempts, last_error = %last_error, "growth loop exhausted")
            }
            _ => {}
        }

        Ok(GrowthReport {
            final_state: state,
            history,
            attempts,
            reward,
            discovery: accepted_outcome,
            optimistic,
        })
    }

    /// Execute, submit and score one candidate. Discovery is scored against
    /// a copy of `discovery`; the caller commits it on acceptance.
    async fn test(&self, source: &str, discovery: &DiscoveryState) -> Result<Verdict> {
        let blockhash = self.submitter.latest_blockhash().await?;
        let bindings = ExecutionBindings::new(self.submitter.agent_pubkey().to_string(), blockhash.to_string());

        let tx_bytes = match self.executor.execute_source(source, &bindings).await {
            ExecutionOutcome::Ok { tx_bytes, .. } => tx_bytes,
            failed => {
                return Err(failed
                    .to_error()
                    .unwrap_or_else(|| error::execution_failed("execution failed")));
            }
        };

        match self.submitter.submit(&tx_bytes, blockhash).await {
            SubmitOutcome::Confirmed(record) if record.succeeded => {
                let mut trial = discovery.clone();
                let outcome = self.engine.compute_reward_and_update(Some(&record), &mut trial);
                if self.require_discovery && !outcome.discovered_anything() {
                    return Err(Error::new(
                        ErrorKind::ExecutionFailed,
                        "transaction confirmed but discovered nothing new; target a program or instruction not yet used",
                    )
                    .with_operation("growth::test")
                    .with_context("signature", record.signature.clone()));
                }
                Ok(Verdict::Confirmed { record, trial, outcome })
            }
            SubmitOutcome::Confirmed(record) => Err(on_chain_failure(&record)),
            SubmitOutcome::PossiblySucceeded { signature, detail } => Ok(Verdict::Optimistic { signature, detail }),
            SubmitOutcome::Failed(e) => Err(e),
        }
    }
}

/// Feedback for a transaction that landed but failed
fn on_chain_failure(record: &TransactionRecord) -> Error {
    let mut text = format!(
        "transaction failed on chain: {}",
        record.error_detail.as_deref().unwrap_or("unknown error")
    );
    let tail = record.log_tail(FEEDBACK_LOG_LINES);
    if !tail.is_empty() {
        text.push_str("\nlogs:\n");
        text.push_str(&tail.join("\n"));
    }
    error::submission_failed(text)
        .with_operation("growth::test")
        .with_context("signature", record.signature.clone())
}

/// Error text handed back to the planner
fn feedback(err: &Error) -> String {
    format!("{}: {}", err.kind(), err.message())
}

/// Trajectory accounting never stops the loop
fn note(result: Result<()>) {
    if let Err(e) = result {
        warn!(error = %e, "trajectory not updated");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::{engine, FakeChain, FakeRuntime, ScriptedPlanner};
    use serde_json::json;
    use solana_sdk::hash::Hash;

    struct Fixture {
        registry: SkillRegistry,
        discovery: DiscoveryState,
        log: TrajectoryLog,
    }

    impl Fixture {
        fn new() -> Self {
            let mut log = TrajectoryLog::new();
            log.start_episode();
            Self {
                registry: SkillRegistry::memory(),
                discovery: DiscoveryState::new(),
                log,
            }
        }
    }

    #[tokio::test]
    async fn test_accepts_first_confirmed_candidate() {
        let planner = ScriptedPlanner::new(["tx:jup"]);
        let (runtime, chain, engine) = (FakeRuntime::default(), FakeChain::default(), engine());
        let mut fx = Fixture::new();

        let report = GrowthLoop::new(&planner, &runtime, &chain, &engine)
            .run(&mut fx.registry, &mut fx.discovery, &mut fx.log, &json!({}), "find Jupiter")
            .await
            .unwrap();

        assert_eq!(report.final_state, GrowthState::Accepted { skill_id: 0 });
        assert_eq!(report.history, vec!["proposing", "testing", "accepted"]);
        assert_eq!(report.attempts, 1);
        assert_eq!(report.reward, 1.0);
        assert!(fx.discovery.has_protocol("Jupiter"));
        assert_eq!(fx.registry.get(0).unwrap().source, "tx:jup");

        let episode = fx.log.current().unwrap();
        assert_eq!(episode.skills_created, vec!["skill_0"]);
        assert_eq!(episode.planner_calls.len(), 1);
        assert!(episode.planner_calls[0].skill_generated);
        assert_eq!(episode.attempts[0].skill_id, Some(0));
        assert_eq!(episode.protocols_discovered, vec!["Jupiter"]);

        // the fresh blockhash and agent key reach the runtime
        let bindings = runtime.bindings_seen.lock().unwrap();
        assert_eq!(bindings[0].blockhash.as_deref(), Some(Hash::new_from_array([7; 32]).to_string().as_str()));
        assert!(bindings[0].agent_pubkey.is_some());
    }

    #[tokio::test]
    async fn test_retry_feeds_previous_error() {
        let planner = ScriptedPlanner::new(["const x = ;", "tx:jup"]);
        let (runtime, chain, engine) = (FakeRuntime::default(), FakeChain::default(), engine());
        let mut fx = Fixture::new();

        let report = GrowthLoop::new(&planner, &runtime, &chain, &engine)
            .run(&mut fx.registry, &mut fx.discovery, &mut fx.log, &json!({}), "")
            .await
            .unwrap();

        assert!(report.accepted());
        assert_eq!(
            report.history,
            vec!["proposing", "testing", "retrying", "proposing", "testing", "accepted"]
        );
        let errors = planner.errors_seen.lock().unwrap();
        assert_eq!(errors[0], None);
        assert!(errors[1].as_deref().unwrap().contains("SyntaxError"));

        let episode = fx.log.current().unwrap();
        assert_eq!(episode.planner_calls.len(), 2);
        assert!(!episode.planner_calls[0].skill_generated);
        assert_eq!(episode.planner_calls[1].retry_count, 1);
        assert_eq!(episode.attempts[0].done_reason, "candidate_failed");
        assert_eq!(episode.attempts[0].error_kind.as_deref(), Some("ExecutionFailed"));
    }

    #[tokio::test]
    async fn test_exhausted_registers_nothing() {
        let planner = ScriptedPlanner::new(["timeout", "tx:unknown", "tx:fail"]);
        let (runtime, chain, engine) = (FakeRuntime::default(), FakeChain::default(), engine());
        let mut fx = Fixture::new();

        let report = GrowthLoop::new(&planner, &runtime, &chain, &engine)
            .run(&mut fx.registry, &mut fx.discovery, &mut fx.log, &json!({}), "x")
            .await
            .unwrap();

        assert!(!report.accepted());
        assert_eq!(report.attempts, 3);
        assert_eq!(planner.calls(), 3);
        let last = report.last_error().unwrap();
        assert!(last.contains("custom program error: 0x1771"));
        assert!(last.contains("SlippageToleranceExceeded"));

        // nothing registered, nothing discovered even though `fail` touched Jupiter
        assert!(fx.registry.is_empty());
        assert_eq!(fx.discovery, DiscoveryState::new());
        assert!(fx.log.current().unwrap().skills_created.is_empty());

        let errors = planner.errors_seen.lock().unwrap();
        assert!(errors[1].as_deref().unwrap().starts_with("ExecutionTimeout"));
        assert!(errors[2].as_deref().unwrap().starts_with("SubmissionFailed"));
    }

    #[tokio::test]
    async fn test_failed_on_chain_candidate_discovers_nothing() {
        // `fail` lands and touches Jupiter, but only the accepted `orca` counts
        let planner = ScriptedPlanner::new(["tx:fail", "tx:orca"]);
        let (runtime, chain, engine) = (FakeRuntime::default(), FakeChain::default(), engine());
        let mut fx = Fixture::new();

        let report = GrowthLoop::new(&planner, &runtime, &chain, &engine)
            .run(&mut fx.registry, &mut fx.discovery, &mut fx.log, &json!({}), "x")
            .await
            .unwrap();

        assert_eq!(report.skill_id(), Some(0));
        assert_eq!(report.attempts, 2);
        assert_eq!(report.discovery.as_ref().unwrap().new_protocols, vec!["Orca"]);
        assert!(!fx.discovery.has_protocol("Jupiter"));
        assert!(fx.discovery.has_protocol("Orca"));
        assert_eq!(*chain.submitted.lock().unwrap(), vec!["fail", "orca"]);

        let errors = planner.errors_seen.lock().unwrap();
        let retry = errors[1].as_deref().unwrap();
        assert!(retry.starts_with("SubmissionFailed: transaction failed on chain: custom program error: 0x1771"));
        assert!(retry.contains("logs:\nProgram JUP6"));
        assert!(retry.contains("SlippageToleranceExceeded"));

        let episode = fx.log.current().unwrap();
        assert_eq!(episode.protocols_discovered, vec!["Orca"]);
        assert_eq!(episode.attempts[0].done_reason, "candidate_failed");
        assert_eq!(episode.attempts[0].error_kind.as_deref(), Some("SubmissionFailed"));
    }

    #[tokio::test]
    async fn test_planner_failure_counts_as_attempt() {
        let planner = ScriptedPlanner::default();
        planner.push_error(error::inference_failed("model overloaded"));
        let (runtime, chain, engine) = (FakeRuntime::default(), FakeChain::default(), engine());
        let mut fx = Fixture::new();

        let report = GrowthLoop::new(&planner, &runtime, &chain, &engine)
            .with_max_tries(2)
            .run(&mut fx.registry, &mut fx.discovery, &mut fx.log, &json!({}), "x")
            .await
            .unwrap();

        assert_eq!(report.attempts, 2);
        assert!(report.last_error().unwrap().contains("script exhausted"));
        let calls = &fx.log.current().unwrap().planner_calls;
        assert_eq!(calls.len(), 2);
        assert!(calls.iter().all(|c| !c.success));
        // the runtime was never invoked
        assert!(runtime.bindings_seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_require_discovery() {
        let planner = ScriptedPlanner::new(["tx:system", "tx:orca"]);
        let (runtime, chain, engine) = (FakeRuntime::default(), FakeChain::default(), engine());
        let mut fx = Fixture::new();

        let report = GrowthLoop::new(&planner, &runtime, &chain, &engine)
            .with_require_discovery(true)
            .run(&mut fx.registry, &mut fx.discovery, &mut fx.log, &json!({}), "x")
            .await
            .unwrap();

        assert_eq!(report.attempts, 2);
        assert_eq!(report.skill_id(), Some(0));
        assert_eq!(fx.registry.get(0).unwrap().source, "tx:orca");
        assert!(planner.errors_seen.lock().unwrap()[1].as_deref().unwrap().contains("discovered nothing new"));
    }

    #[tokio::test]
    async fn test_zero_discovery_accepted_by_default() {
        let planner = ScriptedPlanner::new(["tx:system"]);
        let (runtime, chain, engine) = (FakeRuntime::default(), FakeChain::default(), engine());
        let mut fx = Fixture::new();

        let report = GrowthLoop::new(&planner, &runtime, &chain, &engine)
            .run(&mut fx.registry, &mut fx.discovery, &mut fx.log, &json!({}), "x")
            .await
            .unwrap();

        assert!(report.accepted());
        assert_eq!(report.reward, 0.0);
        assert!(!report.discovery.unwrap().discovered_anything());
    }

    #[tokio::test]
    async fn test_possibly_succeeded_is_optimistic() {
        let planner = ScriptedPlanner::new(["tx:maybe"]);
        let (runtime, chain, engine) = (FakeRuntime::default(), FakeChain::default(), engine());
        let mut fx = Fixture::new();

        let report = GrowthLoop::new(&planner, &runtime, &chain, &engine)
            .run(&mut fx.registry, &mut fx.discovery, &mut fx.log, &json!({}), "x")
            .await
            .unwrap();

        assert!(report.accepted());
        assert!(report.optimistic);
        assert!(report.discovery.is_none());
        assert_eq!(fx.discovery, DiscoveryState::new());
        let attempt = &fx.log.current().unwrap().attempts[0];
        assert_eq!(attempt.error_kind.as_deref(), Some("PossiblySucceeded"));
        assert!(!attempt.success);
    }

    #[tokio::test]
    async fn test_runs_without_open_episode() {
        let planner = ScriptedPlanner::new(["tx:jup"]);
        let (runtime, chain, engine) = (FakeRuntime::default(), FakeChain::default(), engine());
        let mut registry = SkillRegistry::memory();
        let mut discovery = DiscoveryState::new();
        let mut log = TrajectoryLog::new();

        let report = GrowthLoop::new(&planner, &runtime, &chain, &engine)
            .run(&mut registry, &mut discovery, &mut log, &json!({}), "x")
            .await
            .unwrap();
        assert!(report.accepted());
        assert!(log.episodes.is_empty());
    }
}
