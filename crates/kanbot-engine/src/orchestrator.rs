use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, error, info, instrument, warn};

use kanbot_core::{
    AgentDirectory, AgentGateway, AgentId, GatewayError, SessionKey, SpawnReceipt, SpawnRequest,
    SpawnState, Task, TaskContext, TaskId, TaskStatus,
};
use kanbot_settings::GatewaySettings;
use kanbot_store::{ActivityAction, ActivityRepo, CasOutcome, Database, SpawnTransition, TaskRepo};

use crate::error::EngineError;
use crate::mention::first_known_mention;

/// Retry policy for transport failures. The gateway client itself never
/// retries.
#[derive(Clone, Debug)]
pub struct OrchestratorConfig {
    /// Extra attempts after an `unreachable` failure.
    pub spawn_retries: u32,
    pub retry_delay: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            spawn_retries: 0,
            retry_delay: Duration::from_secs(1),
        }
    }
}

impl From<&GatewaySettings> for OrchestratorConfig {
    fn from(settings: &GatewaySettings) -> Self {
        Self {
            spawn_retries: settings.spawn_retries,
            retry_delay: Duration::from_millis(settings.retry_delay_ms),
        }
    }
}

/// What a trigger did. Returned for logging and for the HTTP layer to echo.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SpawnOutcome {
    /// The gateway accepted the spawn and the session key is stored.
    Spawned {
        agent: String,
        session_key: SessionKey,
    },
    /// The task already has a live session.
    AlreadyActive,
    /// Another trigger holds the in-flight marker.
    SpawnInProgress,
    /// The responsible agent is not in the directory.
    AgentNotFound { name: String },
    /// Nobody is assigned to the task.
    NoAgent,
    /// The gateway call failed; the task stays In Progress without a key.
    Failed { kind: String, reason: String },
    /// The task changed underneath the spawn, so the result was not stored.
    Superseded,
    /// The task left In Progress and its assignment was dropped.
    Released,
    /// The event does not call for a spawn.
    NotTriggered,
    /// The comment mentions nobody.
    NoMention,
    /// The task already has a working agent; mentions do not preempt it.
    AlreadyWorking { agent: String },
    /// The mentioned agent is working on another task.
    AgentBusy { agent: String, busy_on: TaskId },
}

/// Decides when to spawn an agent for a task and records the result.
///
/// All coordination goes through the task row's compare-and-set; two
/// orchestrators sharing a database are as safe as one.
pub struct SpawnOrchestrator {
    tasks: TaskRepo,
    activity: ActivityRepo,
    directory: Arc<AgentDirectory>,
    gateway: Arc<dyn AgentGateway>,
    config: OrchestratorConfig,
}

impl SpawnOrchestrator {
    pub fn new(
        db: Database,
        directory: Arc<AgentDirectory>,
        gateway: Arc<dyn AgentGateway>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            tasks: TaskRepo::new(db.clone()),
            activity: ActivityRepo::new(db),
            directory,
            gateway,
            config,
        }
    }

    pub fn gateway(&self) -> &Arc<dyn AgentGateway> {
        &self.gateway
    }

    /// React to a task moving from `old` to `new`.
    #[instrument(skip(self), fields(task_id = task_id.get(), old = %old, new = %new))]
    pub async fn on_status_changed(
        &self,
        task_id: TaskId,
        old: &TaskStatus,
        new: &TaskStatus,
    ) -> Result<SpawnOutcome, EngineError> {
        if old.is_in_progress() && !new.is_in_progress() {
            return self.release(task_id);
        }
        if old.is_in_progress() || !new.is_in_progress() {
            return Ok(SpawnOutcome::NotTriggered);
        }

        let task = self.tasks.get(task_id)?;
        if !task.is_in_progress() {
            debug!(status = %task.status, "task left In Progress before the trigger ran");
            return Ok(SpawnOutcome::NotTriggered);
        }
        if task.has_stale_assignment() {
            log_stale_assignment(&task);
        } else if task.has_active_session() {
            debug!("task already has an active session");
            return Ok(SpawnOutcome::AlreadyActive);
        } else if task.spawn_state == SpawnState::InFlight {
            debug!("spawn already in progress");
            return Ok(SpawnOutcome::SpawnInProgress);
        }

        let Some(name) = task.responsible_agent().map(str::to_owned) else {
            info!("task entered In Progress with no agent assigned");
            return Ok(SpawnOutcome::NoAgent);
        };
        let Some(agent_id) = self.directory.resolve(&name).cloned() else {
            info!(agent = %name, "agent not found in directory, no spawn");
            self.activity.record(
                task_id,
                ActivityAction::AgentNotFound,
                Some(&name),
                Some(json!({ "trigger": "status_change" })),
            )?;
            return Ok(SpawnOutcome::AgentNotFound { name });
        };

        self.claim_and_spawn(&task, name, agent_id, false).await
    }

    /// React to a new comment on a task.
    #[instrument(skip(self, text), fields(task_id = task_id.get()))]
    pub async fn on_comment_created(
        &self,
        task_id: TaskId,
        text: &str,
    ) -> Result<SpawnOutcome, EngineError> {
        let scan = first_known_mention(text, &self.directory);
        let Some((name, agent_id)) = scan.resolved else {
            return Ok(match scan.unknown.into_iter().next() {
                Some(name) => {
                    info!(agent = %name, "mentioned agent not found in directory");
                    SpawnOutcome::AgentNotFound { name }
                }
                None => SpawnOutcome::NoMention,
            });
        };
        let agent_id = agent_id.clone();

        let task = self.tasks.get(task_id)?;
        if task.has_stale_assignment() {
            log_stale_assignment(&task);
        } else if task.is_in_progress() {
            if let Some(current) = &task.working_agent {
                info!(agent = %name, working_agent = %current, "task already has a working agent, mention ignored");
                return Ok(SpawnOutcome::AlreadyWorking {
                    agent: current.clone(),
                });
            }
            match task.spawn_state {
                SpawnState::InFlight => {
                    debug!("spawn already in progress");
                    return Ok(SpawnOutcome::SpawnInProgress);
                }
                SpawnState::Active => return Ok(SpawnOutcome::AlreadyActive),
                SpawnState::Idle => {}
            }
        }

        self.claim_and_spawn(&task, name, agent_id, true).await
    }

    fn release(&self, task_id: TaskId) -> Result<SpawnOutcome, EngineError> {
        match self.tasks.release_assignment(task_id)? {
            Some(before) => {
                info!(
                    agent = before.working_agent.as_deref().unwrap_or_default(),
                    had_session = before.agent_session_key.is_some(),
                    "task left In Progress, assignment released"
                );
                Ok(SpawnOutcome::Released)
            }
            None => Ok(SpawnOutcome::NotTriggered),
        }
    }

    /// Take the in-flight marker, call the gateway, and store the result.
    /// An `exclusive` claim also requires `agent` to be free of other tasks.
    async fn claim_and_spawn(
        &self,
        task: &Task,
        agent: String,
        agent_id: AgentId,
        exclusive: bool,
    ) -> Result<SpawnOutcome, EngineError> {
        let claimed_at = Utc::now();
        let claim = SpawnTransition::Claim {
            agent: agent.clone(),
            at: claimed_at,
            exclusive,
        };
        if self
            .tasks
            .compare_and_set_spawn_state(task.id, &task.status, &claim)?
            == CasOutcome::Conflict
        {
            if exclusive {
                if let Some(busy_on) = self.tasks.find_busy_task_for_agent(&agent, task.id)? {
                    info!(agent = %agent, busy_on = busy_on.get(), "mentioned agent is busy on another task, mention ignored");
                    return Ok(SpawnOutcome::AgentBusy { agent, busy_on });
                }
            }
            debug!(agent = %agent, "spawn already in progress");
            return Ok(SpawnOutcome::SpawnInProgress);
        }
        self.activity.record(
            task.id,
            ActivityAction::SpawnRequested,
            Some(&agent),
            Some(json!({ "agentId": agent_id.as_str() })),
        )?;

        let request = SpawnRequest {
            agent_id,
            context: TaskContext {
                task_id: task.id,
                title: task.title.clone(),
                instructions: task.description.clone(),
            },
        };

        match self.spawn_with_retry(&request).await {
            Ok(receipt) => self.commit(task.id, agent, claimed_at, receipt),
            Err(err) => self.fail(task.id, agent, claimed_at, err),
        }
    }

    async fn spawn_with_retry(&self, request: &SpawnRequest) -> Result<SpawnReceipt, GatewayError> {
        let mut attempt = 0;
        loop {
            match self.gateway.spawn(request).await {
                Err(err) if err.is_retryable() && attempt < self.config.spawn_retries => {
                    attempt += 1;
                    warn!(
                        agent = %request.agent_id,
                        attempt,
                        error = %err,
                        "gateway unreachable, retrying spawn"
                    );
                    tokio::time::sleep(self.config.retry_delay).await;
                }
                result => return result,
            }
        }
    }

    fn commit(
        &self,
        task_id: TaskId,
        agent: String,
        claimed_at: chrono::DateTime<Utc>,
        receipt: SpawnReceipt,
    ) -> Result<SpawnOutcome, EngineError> {
        let transition = SpawnTransition::Commit {
            claimed_at,
            session_key: receipt.session_key.clone(),
            run_id: receipt.run_id.clone(),
        };
        if self
            .tasks
            .compare_and_set_spawn_state(task_id, &TaskStatus::InProgress, &transition)?
            == CasOutcome::Conflict
        {
            warn!(
                agent = %agent,
                session_key = %receipt.session_key,
                "task changed while spawning, session not recorded"
            );
            return Ok(SpawnOutcome::Superseded);
        }

        info!(
            agent = %agent,
            session_key = %receipt.session_key,
            run_id = receipt.run_id.as_ref().map(|r| r.as_str()).unwrap_or_default(),
            gateway_status = %receipt.status,
            "agent spawned"
        );
        self.activity.record(
            task_id,
            ActivityAction::Spawned,
            Some(&agent),
            Some(json!({
                "sessionKey": receipt.session_key,
                "runId": receipt.run_id,
                "status": receipt.status,
            })),
        )?;
        Ok(SpawnOutcome::Spawned {
            agent,
            session_key: receipt.session_key,
        })
    }

    fn fail(
        &self,
        task_id: TaskId,
        agent: String,
        claimed_at: chrono::DateTime<Utc>,
        err: GatewayError,
    ) -> Result<SpawnOutcome, EngineError> {
        let kind = err.error_kind();
        if err.is_contract_violation() {
            error!(agent = %agent, error = %err, "gateway response did not match contract");
        } else {
            warn!(agent = %agent, kind, error = %err, "spawn failed");
        }

        let transition = SpawnTransition::Fail {
            claimed_at,
            error: format!("{kind}: {err}"),
        };
        if self
            .tasks
            .compare_and_set_spawn_state(task_id, &TaskStatus::InProgress, &transition)?
            == CasOutcome::Conflict
        {
            debug!("task changed while spawning, failure not recorded");
            return Ok(SpawnOutcome::Superseded);
        }

        self.activity.record(
            task_id,
            ActivityAction::SpawnFailed,
            Some(&agent),
            Some(json!({ "kind": kind, "error": err.to_string() })),
        )?;
        Ok(SpawnOutcome::Failed {
            kind: kind.to_string(),
            reason: err.to_string(),
        })
    }
}

fn log_stale_assignment(task: &Task) {
    info!(
        agent = task.working_agent.as_deref().unwrap_or_default(),
        spawn_state = %task.spawn_state,
        session_key = task.agent_session_key.as_ref().map(|k| k.as_str()).unwrap_or_default(),
        "replacing assignment left from an earlier stint in In Progress"
    );
}
