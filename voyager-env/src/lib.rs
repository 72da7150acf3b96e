//! # Voyager Environment
//!
//! A local Solana validator as an exploration environment.
//!
//! ## Core Concepts
//! - **Session**: one validator process plus a funded agent keypair per episode
//! - **Gateway**: runs a skill in an external script runtime and returns the
//!   unsigned transaction it built
//! - **Submission**: sign, send and confirm that transaction
//! - **Discovery**: reward first-time protocol and instruction usage
//! - **Registry**: accepted skills, addressable by id
//! - **Trajectory**: per-episode accounting of attempts and planner calls
//! - **Planner**: LLM-backed skill generation

pub mod config;
pub mod discovery;
pub mod error;
pub mod fetch;
pub mod gateway;
pub mod planner;
pub mod programs;
pub mod record;
pub mod registry;
pub mod rpc;
pub mod session;
pub mod submission;
pub mod trajectory;
pub mod validator;

pub use config::{
    AgentSettings, EnvConfig, PlannerConfig, RegistryConfig, RpcConfig, RunnerConfig,
    ValidatorConfig, LAMPORTS_PER_SOL,
};
pub use discovery::{
    DiscoveryEngine, DiscoveryScope, DiscoverySnapshot, DiscoveryState, InstructionKey,
    RewardOutcome, RewardPolicy,
};
pub use error::{Error, ErrorKind, ErrorStatus, Result};
pub use fetch::{fetch_examples, ExampleTransaction};
pub use gateway::{ExecutionBindings, ExecutionErrorKind, ExecutionOutcome, SkillExecutor, SkillRunner};
pub use planner::{ContextUpdate, LlmPlanner, LlmProvider, OpenAIProvider, ProviderConfig, SkillPlanner};
pub use programs::{ProgramEntry, ProgramRegistry};
pub use record::{TransactionRecord, TransactionSummary};
pub use registry::{FileSkillStore, MemorySkillStore, Skill, SkillId, SkillRegistry, SkillStore};
pub use rpc::RpcClient;
pub use session::{Observation, ValidatorSession};
pub use submission::{SubmitOutcome, TransactionSubmitter};
pub use trajectory::{AttemptEntry, Episode, PlannerCall, TrajectoryLog, TrajectoryMetrics};
pub use validator::ValidatorProcess;
