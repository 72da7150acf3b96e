//! Episode driver - owns the session, discovery state and trajectory of a run

use crate::growth::GrowthLoop;
use crate::policy::{Policy, PolicyView};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::{debug, info, warn};
use voyager_env::config::AgentSettings;
use voyager_env::discovery::{DiscoveryEngine, DiscoveryScope, DiscoveryState};
use voyager_env::error::{self, Error, ErrorKind, Result};
use voyager_env::fetch::{ExampleTransaction, MAX_EXAMPLES};
use voyager_env::gateway::{ExecutionBindings, ExecutionOutcome, SkillExecutor};
use voyager_env::planner::{ContextUpdate, SkillPlanner};
use voyager_env::registry::{SkillId, SkillRegistry};
use voyager_env::rpc::RpcClient;
use voyager_env::session::{Observation, ValidatorSession};
use voyager_env::submission::{SubmitOutcome, TransactionSubmitter};
use voyager_env::trajectory::{AttemptEntry, Episode, TrajectoryLog};
use voyager_env::EnvConfig;

/// Discovery checkpoint written next to the trajectory file in `run` scope
pub const DISCOVERY_FILE: &str = "discovery_state.json";

// ============================================================================
// Seams
// ============================================================================

/// A live chain the agent can observe and submit to
#[allow(async_fn_in_trait)]
pub trait Environment: TransactionSubmitter {
    async fn observe(&self) -> Observation;

    /// Release the environment; must be safe to call twice
    async fn close(&mut self) -> Result<()>;
}

impl Environment for ValidatorSession {
    async fn observe(&self) -> Observation {
        ValidatorSession::observe(self).await
    }

    async fn close(&mut self) -> Result<()> {
        ValidatorSession::close(self).await
    }
}

/// Creates one environment per episode
#[allow(async_fn_in_trait)]
pub trait EnvironmentLauncher {
    type Env: Environment;

    async fn launch(&self) -> Result<Self::Env>;
}

/// Launches a fresh validator session per episode
pub struct SessionLauncher {
    config: EnvConfig,
}

impl SessionLauncher {
    pub fn new(config: EnvConfig) -> Self {
        Self { config }
    }
}

impl EnvironmentLauncher for SessionLauncher {
    type Env = ValidatorSession;

    async fn launch(&self) -> Result<ValidatorSession> {
        ValidatorSession::open(&self.config).await
    }
}

/// Where example transactions come from
#[allow(async_fn_in_trait)]
pub trait ExampleSource {
    async fn fetch_examples(&self, program_id: &str, limit: usize) -> Result<Vec<ExampleTransaction>>;
}

impl ExampleSource for RpcClient {
    async fn fetch_examples(&self, program_id: &str, limit: usize) -> Result<Vec<ExampleTransaction>> {
        voyager_env::fetch::fetch_examples(self, program_id, limit).await
    }
}

// ============================================================================
// Actions and results
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Run the growth loop for one new skill
    NewSkill,
    /// List the library without touching the chain
    InspectLibrary,
    /// Pull recent live transactions of a program into planner context
    FetchExamples { program_id: String },
    /// Execute a registered skill and score its transaction
    RunSkill { skill_id: SkillId },
}

impl Action {
    pub fn name(&self) -> &'static str {
        match self {
            Action::NewSkill => "new_skill",
            Action::InspectLibrary => "inspect_library",
            Action::FetchExamples { .. } => "fetch_examples",
            Action::RunSkill { .. } => "run_skill",
        }
    }
}

/// What one step produced
#[derive(Debug)]
pub struct StepResult {
    pub reward: f64,
    pub done_reason: String,
    pub error: Option<Error>,
    /// The episode hit its step limit
    pub terminated: bool,
    pub info: Value,
}

impl StepResult {
    fn new(reward: f64, done_reason: impl Into<String>) -> Self {
        Self {
            reward,
            done_reason: done_reason.into(),
            error: None,
            terminated: false,
            info: Value::Null,
        }
    }

    fn with_error(mut self, err: Error) -> Self {
        self.error = Some(err);
        self
    }

    fn with_info(mut self, info: Value) -> Self {
        self.info = info;
        self
    }
}

// ============================================================================
// Agent
// ============================================================================

/// Drives episodes against environments produced by `L`
pub struct Agent<L: EnvironmentLauncher, P, E, X = RpcClient> {
    launcher: L,
    planner: P,
    executor: E,
    examples: Option<X>,
    engine: DiscoveryEngine,
    registry: SkillRegistry,
    discovery: DiscoveryState,
    trajectory: TrajectoryLog,
    settings: AgentSettings,
    objective: String,
    env: Option<L::Env>,
    steps: usize,
    run_counts: BTreeMap<SkillId, usize>,
    /// Success and error of the most recent transaction
    last_tx: Option<(bool, Option<String>)>,
}

impl<L: EnvironmentLauncher, P, E> Agent<L, P, E> {
    /// Build an agent. An existing trajectory file is resumed, and in `run`
    /// scope so is the discovery checkpoint next to it.
    pub fn new(
        launcher: L,
        planner: P,
        executor: E,
        engine: DiscoveryEngine,
        registry: SkillRegistry,
        settings: AgentSettings,
    ) -> Self {
        let trajectory = settings
            .trajectory_path
            .as_ref()
            .filter(|p| p.exists())
            .and_then(|p| match TrajectoryLog::load(p) {
                Ok(log) => Some(log),
                Err(e) => {
                    warn!(path = %p.display(), error = %e, "ignoring unreadable trajectory");
                    None
                }
            })
            .unwrap_or_default();

        let mut agent = Self {
            launcher,
            planner,
            executor,
            examples: None,
            engine,
            registry,
            discovery: DiscoveryState::new(),
            trajectory,
            settings,
            objective: String::new(),
            env: None,
            steps: 0,
            run_counts: BTreeMap::new(),
            last_tx: None,
        };

        if agent.engine.policy().scope == DiscoveryScope::Run {
            if let Some(path) = agent.discovery_path().filter(|p| p.exists()) {
                match DiscoveryState::load(&path) {
                    Ok(state) => {
                        info!(protocols = state.protocols.len(), "resumed discovery state");
                        agent.discovery = state;
                    }
                    Err(e) => warn!(path = %path.display(), error = %e, "ignoring unreadable discovery state"),
                }
            }
        }
        agent
    }

    /// Attach an upstream for `FetchExamples`
    pub fn with_examples<Y>(self, source: Y) -> Agent<L, P, E, Y> {
        Agent {
            launcher: self.launcher,
            planner: self.planner,
            executor: self.executor,
            examples: Some(source),
            engine: self.engine,
            registry: self.registry,
            discovery: self.discovery,
            trajectory: self.trajectory,
            settings: self.settings,
            objective: self.objective,
            env: self.env,
            steps: self.steps,
            run_counts: self.run_counts,
            last_tx: self.last_tx,
        }
    }
}

impl<L: EnvironmentLauncher, P, E, X> Agent<L, P, E, X> {
    /// Where the `run`-scope discovery checkpoint lives
    pub fn discovery_path(&self) -> Option<PathBuf> {
        self.settings
            .trajectory_path
            .as_ref()
            .map(|p| p.with_file_name(DISCOVERY_FILE))
    }
}

impl<L, P, E, X> Agent<L, P, E, X>
where
    L: EnvironmentLauncher,
    P: SkillPlanner,
    E: SkillExecutor,
    X: ExampleSource,
{
    /// Objective handed to the planner; empty lets the planner pick one
    pub fn with_objective(mut self, objective: impl Into<String>) -> Self {
        self.objective = objective.into();
        self
    }

    pub fn registry(&self) -> &SkillRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut SkillRegistry {
        &mut self.registry
    }

    pub fn discovery(&self) -> &DiscoveryState {
        &self.discovery
    }

    pub fn trajectory(&self) -> &TrajectoryLog {
        &self.trajectory
    }

    pub fn planner(&self) -> &P {
        &self.planner
    }

    pub fn steps(&self) -> usize {
        self.steps
    }

    pub fn is_active(&self) -> bool {
        self.env.is_some()
    }

    fn skill_names(&self) -> Vec<String> {
        self.registry.list().iter().map(|s| s.display_name()).collect()
    }

    /// Start a new episode on a fresh environment. Launch failures are
    /// episode-fatal and returned as errors.
    pub async fn reset(&mut self) -> Result<Observation> {
        if let Some(mut previous) = self.env.take() {
            if let Err(e) = previous.close().await {
                warn!(error = %e, "previous environment did not close cleanly");
            }
        }
        if self.trajectory.current().is_some() {
            self.trajectory.end_episode();
        }

        let env = self.launcher.launch().await?;
        self.env = Some(env);

        if self.engine.policy().scope == DiscoveryScope::Episode {
            self.discovery.clear();
        }
        self.steps = 0;
        self.run_counts.clear();
        self.last_tx = None;
        let episode = self.trajectory.start_episode();

        self.planner.update_context(ContextUpdate::Reset);
        self.planner
            .update_context(ContextUpdate::Discovered(self.discovery.protocols.keys().cloned().collect()));
        self.planner.update_context(ContextUpdate::Skills(self.skill_names()));

        let observation = self.observe().await;
        info!(
            episode,
            agent = %observation.agent_pubkey,
            sol = observation.sol_balance,
            skills = observation.skills,
            "episode reset"
        );
        Ok(observation)
    }

    /// Chain state plus discovery and library counts
    pub async fn observe(&self) -> Observation {
        let mut observation = match &self.env {
            Some(env) => env.observe().await,
            None => Observation::default(),
        };
        let snapshot = self.discovery.snapshot();
        observation.protocols_discovered = snapshot.protocols;
        observation.instructions_discovered = snapshot.instructions;
        observation.skills = self.registry.len();
        if let Some((success, error)) = &self.last_tx {
            observation.last_tx_success = *success;
            observation.last_tx_error = error.clone();
        }
        observation
    }

    /// Perform one action. Attempt-level failures come back inside the
    /// result; `Err` means there is no active episode.
    pub async fn step(&mut self, action: Action) -> Result<StepResult> {
        if self.env.is_none() {
            return Err(error::invalid_argument("no active episode, call reset first").with_operation("agent::step"));
        }
        self.steps += 1;
        debug!(step = self.steps, action = action.name(), "step");

        let mut result = match action {
            Action::NewSkill => self.new_skill().await,
            Action::InspectLibrary => self.inspect_library(),
            Action::FetchExamples { program_id } => self.fetch_examples(&program_id).await,
            Action::RunSkill { skill_id } => self.run_skill(skill_id).await,
        };
        result.terminated = self.steps >= self.settings.max_steps;
        Ok(result)
    }

    async fn new_skill(&mut self) -> StepResult {
        let observation = self.observe().await.to_json();
        let Some(env) = self.env.as_ref() else {
            return StepResult::new(0.0, "no_session");
        };

        let report = GrowthLoop::new(&self.planner, &self.executor, env, &self.engine)
            .with_max_tries(self.settings.max_skill_tries)
            .with_require_discovery(self.settings.require_discovery)
            .run(
                &mut self.registry,
                &mut self.discovery,
                &mut self.trajectory,
                &observation,
                &self.objective,
            )
            .await;

        let report = match report {
            Ok(report) => report,
            Err(e) => {
                warn!(error = %e, "accepted skill could not be stored");
                return StepResult::new(0.0, "skill_storage_failed").with_error(e);
            }
        };

        let info = json!({
            "attempts": report.attempts,
            "history": report.history,
            "skill_id": report.skill_id(),
            "optimistic": report.optimistic,
        });
        match report.skill_id() {
            Some(_) => {
                self.last_tx = Some((true, None));
                if let Some(outcome) = &report.discovery {
                    if !outcome.new_protocols.is_empty() {
                        self.planner
                            .update_context(ContextUpdate::Discovered(outcome.new_protocols.clone()));
                    }
                }
                self.planner.update_context(ContextUpdate::Skills(self.skill_names()));
                StepResult::new(report.reward, "skill_created").with_info(info)
            }
            None => {
                let last_error = report.last_error().unwrap_or("growth loop failed").to_string();
                self.last_tx = Some((false, Some(last_error.clone())));
                StepResult::new(0.0, "skill_creation_failed")
                    .with_error(
                        Error::new(ErrorKind::ExecutionFailed, last_error)
                            .with_operation("agent::new_skill")
                            .with_context("attempts", report.attempts.to_string()),
                    )
                    .with_info(info)
            }
        }
    }

    fn inspect_library(&self) -> StepResult {
        let skills: Vec<Value> = self
            .registry
            .list()
            .iter()
            .map(|s| {
                json!({
                    "id": s.id(),
                    "name": s.display_name(),
                    "description": s.meta.description,
                    "runs": self.run_counts.get(&s.id()).copied().unwrap_or(0),
                })
            })
            .collect();
        StepResult::new(0.0, "library_inspected").with_info(json!({ "skills": skills }))
    }

    async fn fetch_examples(&mut self, program_id: &str) -> StepResult {
        let Some(source) = self.examples.as_ref() else {
            return StepResult::new(0.0, "examples_unavailable").with_error(
                Error::new(ErrorKind::Unsupported, "no upstream configured for example transactions")
                    .with_operation("agent::fetch_examples"),
            );
        };
        match source.fetch_examples(program_id, MAX_EXAMPLES).await {
            Ok(examples) => {
                let count = examples.len();
                self.planner.update_context(ContextUpdate::Examples {
                    program_id: program_id.to_string(),
                    examples,
                });
                StepResult::new(0.0, "examples_fetched").with_info(json!({ "program_id": program_id, "count": count }))
            }
            Err(e) => StepResult::new(0.0, "examples_failed").with_error(e),
        }
    }

    async fn run_skill(&mut self, skill_id: SkillId) -> StepResult {
        let outcome = match self.env.as_ref() {
            Some(env) => execute_skill(env, &self.executor, &self.registry, skill_id).await,
            None => Err(error::invalid_argument("no active episode")),
        };

        let (entry, err) = match outcome {
            Err(e) => {
                let reason = match e.kind() {
                    ErrorKind::SkillNotFound => "skill_not_found",
                    ErrorKind::ExecutionFailed
                    | ErrorKind::ExecutionTimeout
                    | ErrorKind::MalformedOutput
                    | ErrorKind::RuntimeUnavailable => "execution_failed",
                    _ => "attempt_failed",
                };
                if e.kind() != ErrorKind::SkillNotFound {
                    *self.run_counts.entry(skill_id).or_default() += 1;
                    self.last_tx = Some((false, Some(e.message().to_string())));
                }
                (AttemptEntry::new(Some(skill_id), 0.0, reason).with_error(&e), Some(e))
            }
            Ok(SubmitOutcome::Confirmed(record)) => {
                *self.run_counts.entry(skill_id).or_default() += 1;
                let outcome = self.engine.compute_reward_and_update(Some(&record), &mut self.discovery);
                self.last_tx = Some((record.succeeded, record.error_detail.clone()));
                if !outcome.new_protocols.is_empty() {
                    self.planner
                        .update_context(ContextUpdate::Discovered(outcome.new_protocols.clone()));
                }

                let reason = if record.succeeded { "confirmed" } else { "confirmed_failed" };
                let mut entry = AttemptEntry::new(Some(skill_id), outcome.reward, reason)
                    .with_success(record.succeeded)
                    .with_discoveries(outcome.new_protocols, outcome.new_instructions)
                    .with_transaction(record.summary());
                if let Some(diagnostic) = &outcome.diagnostic {
                    entry = entry.with_error(diagnostic);
                }
                (entry, outcome.diagnostic)
            }
            Ok(SubmitOutcome::PossiblySucceeded { signature, detail }) => {
                *self.run_counts.entry(skill_id).or_default() += 1;
                let mut e = error::possibly_succeeded(detail);
                if let Some(signature) = signature {
                    e = e.with_context("signature", signature);
                }
                self.last_tx = Some((false, Some(e.message().to_string())));
                (AttemptEntry::new(Some(skill_id), 0.0, "possibly_succeeded").with_error(&e), Some(e))
            }
            Ok(SubmitOutcome::Failed(e)) => {
                *self.run_counts.entry(skill_id).or_default() += 1;
                self.last_tx = Some((false, Some(e.message().to_string())));
                (AttemptEntry::new(Some(skill_id), 0.0, "submission_failed").with_error(&e), Some(e))
            }
        };

        let mut result = StepResult::new(entry.reward, entry.done_reason.clone()).with_info(json!({
            "skill_id": skill_id,
            "new_protocols": entry.new_protocols,
            "new_instructions": entry.new_instructions.iter().map(|k| k.to_string()).collect::<Vec<_>>(),
        }));
        result.error = err;
        info!(skill_id, reward = entry.reward, done_reason = %entry.done_reason, "skill run");
        if let Err(e) = self.trajectory.record_attempt(entry) {
            warn!(error = %e, "trajectory not updated");
        }
        result
    }

    /// End the episode, persist accounting and stop the environment. Every
    /// step runs even if an earlier one failed; the first error is returned.
    pub async fn close(&mut self) -> Result<()> {
        let mut first_err: Option<Error> = None;

        if self.trajectory.current().is_some() {
            self.trajectory.end_episode();
        }
        if let Some(path) = &self.settings.trajectory_path {
            if !self.trajectory.episodes.is_empty() {
                if let Err(e) = self.trajectory.save(path) {
                    warn!(error = %e, "trajectory not saved");
                    first_err.get_or_insert(e);
                }
            }
        }
        if self.engine.policy().scope == DiscoveryScope::Run {
            if let Some(path) = self.discovery_path() {
                if let Err(e) = self.discovery.save(&path) {
                    warn!(error = %e, "discovery state not saved");
                    first_err.get_or_insert(e);
                }
            }
        }
        if let Some(mut env) = self.env.take() {
            if let Err(e) = env.close().await {
                warn!(error = %e, "environment did not close cleanly");
                first_err.get_or_insert(e);
            }
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Reset, step until the policy's episode terminates, then close. The
    /// environment is closed on every exit path.
    pub async fn run_episode<Pol: Policy>(&mut self, policy: &mut Pol) -> Result<Episode> {
        let driven = self.drive(policy).await;
        let closed = self.close().await;
        driven?;
        closed?;
        self.trajectory
            .episodes
            .last()
            .cloned()
            .ok_or_else(|| error::invalid_argument("no episode recorded"))
    }

    async fn drive<Pol: Policy>(&mut self, policy: &mut Pol) -> Result<()> {
        let mut observation = self.reset().await?;
        loop {
            let skills = self.registry.ids();
            let action = policy.next_action(&PolicyView {
                skills: &skills,
                run_counts: &self.run_counts,
                observation: &observation,
            });
            let result = self.step(action.clone()).await?;
            info!(
                step = self.steps,
                action = action.name(),
                reward = result.reward,
                done_reason = %result.done_reason,
                "step finished"
            );
            policy.record(&action, &result);
            if result.terminated {
                return Ok(());
            }
            observation = self.observe().await;
        }
    }
}

/// Fresh blockhash, execute, submit. Execution problems come back as errors.
async fn execute_skill<S, E>(
    env: &S,
    executor: &E,
    registry: &SkillRegistry,
    skill_id: SkillId,
) -> Result<SubmitOutcome>
where
    S: TransactionSubmitter,
    E: SkillExecutor,
{
    let skill = registry.get(skill_id)?;
    let blockhash = env.latest_blockhash().await?;
    let bindings = ExecutionBindings::new(env.agent_pubkey().to_string(), blockhash.to_string());

    let outcome = match registry.path(skill_id) {
        Some(path) => executor.execute(&path, &bindings).await,
        None => executor.execute_source(&skill.source, &bindings).await,
    };
    let tx_bytes = match outcome {
        ExecutionOutcome::Ok { tx_bytes, .. } => tx_bytes,
        failed => {
            return Err(failed
                .to_error()
                .unwrap_or_else(|| error::execution_failed("execution failed"))
                .with_context("skill_id", skill_id.to_string()));
        }
    };
    Ok(env.submit(&tx_bytes, blockhash).await)
}
