use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::GatewayError;
use crate::ids::{AgentId, RunId, SessionKey, TaskId};

/// What the agent is told about the task it is being spawned for.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskContext {
    pub task_id: TaskId,
    pub title: String,
    pub instructions: String,
}

/// A single request to start an agent session.
#[derive(Clone, Debug)]
pub struct SpawnRequest {
    pub agent_id: AgentId,
    pub context: TaskContext,
}

impl SpawnRequest {
    pub fn task_id(&self) -> TaskId {
        self.context.task_id
    }
}

/// Normalized result of an accepted spawn.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SpawnReceipt {
    /// Gateway-reported status of the child run (e.g. `accepted`).
    pub status: String,
    pub run_id: Option<RunId>,
    pub session_key: SessionKey,
}

/// Remote agent-execution gateway.
///
/// Implementations never retry internally; the orchestrator owns retry policy.
#[async_trait]
pub trait AgentGateway: Send + Sync {
    fn name(&self) -> &str;

    async fn spawn(&self, request: &SpawnRequest) -> Result<SpawnReceipt, GatewayError>;

    async fn health_check(&self) -> bool;
}
