//! Spawn decisions and state repair for the task board.
//!
//! [`SpawnOrchestrator`] reacts to status changes and comments by spawning
//! agents through an [`AgentGateway`](kanbot_core::AgentGateway);
//! [`Reconciler`] repairs tasks the orchestrator could not finish.

pub mod error;
pub mod mention;
pub mod orchestrator;
pub mod reconciler;

pub use error::EngineError;
pub use mention::{extract_mentions, first_known_mention, MentionScan};
pub use orchestrator::{OrchestratorConfig, SpawnOrchestrator, SpawnOutcome};
pub use reconciler::{ReconcileReport, Reconciler};
