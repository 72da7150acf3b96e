//! # Voyager Agent
//!
//! The agent grows a library of skills by exploring a local chain:
//! 1. A session starts a validator and funds a fresh agent keypair
//! 2. The planner writes a skill that builds one transaction
//! 3. The skill runs, its transaction is signed, submitted and confirmed
//! 4. New protocols and instructions in the confirmed transaction earn reward
//! 5. A failing candidate is retried with its error fed back to the planner
//! 6. Accepted skills join the library and can be rerun later
//!
//! The planner proposes, the chain decides.

pub mod agent;
pub mod growth;
pub mod policy;

#[cfg(test)]
mod fakes;

pub use agent::{
    Action, Agent, Environment, EnvironmentLauncher, ExampleSource, SessionLauncher, StepResult,
    DISCOVERY_FILE,
};
pub use growth::{GrowthLoop, GrowthReport, GrowthState};
pub use policy::{ExplorationPolicy, Policy, PolicyView, ScriptedPolicy};
