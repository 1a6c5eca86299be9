use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use kanbot_core::{Task, TaskId};
use kanbot_store::{Database, TaskRepo};

use crate::error::EngineError;

/// Tasks repaired by one pass.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub phantoms_reset: Vec<TaskId>,
    pub orphans_cleared: Vec<TaskId>,
}

impl ReconcileReport {
    pub fn is_empty(&self) -> bool {
        self.phantoms_reset.is_empty() && self.orphans_cleared.is_empty()
    }
}

/// Repairs tasks whose lifecycle columns disagree with their status.
///
/// A phantom is In Progress with no live session for longer than the grace
/// period; it goes back to Backlog. An orphan is outside In Progress but
/// still names an agent or session; those fields are cleared. Every repair
/// is re-checked in the same statement that applies it, so a pass racing a
/// spawn never undoes a session that landed in between.
pub struct Reconciler {
    tasks: TaskRepo,
    grace: chrono::Duration,
}

impl Reconciler {
    pub fn new(db: Database, grace: chrono::Duration) -> Self {
        Self {
            tasks: TaskRepo::new(db),
            grace,
        }
    }

    pub fn run(&self) -> Result<ReconcileReport, EngineError> {
        self.run_at(Utc::now())
    }

    /// One pass with `now` as the clock.
    #[instrument(skip(self), fields(grace_secs = self.grace.num_seconds()))]
    pub fn run_at(&self, now: DateTime<Utc>) -> Result<ReconcileReport, EngineError> {
        let cutoff = now - self.grace;

        let stale = self.tasks.list_stale_in_progress(cutoff)?;
        let reset = if stale.is_empty() {
            Vec::new()
        } else {
            self.tasks.reset_to_backlog(&stale, cutoff)?
        };
        for task in &reset {
            warn!(
                task_id = task.id.get(),
                agent = task.working_agent.as_deref().unwrap_or_default(),
                spawn_state = %task.spawn_state,
                spawn_error = task.spawn_error.as_deref().unwrap_or_default(),
                entered_in_progress_at = ?task.entered_in_progress_at,
                "phantom task reset to Backlog"
            );
        }

        let orphaned = self.tasks.list_orphaned()?;
        let cleared = if orphaned.is_empty() {
            Vec::new()
        } else {
            self.tasks.clear_orphaned(&orphaned)?
        };
        for task in &cleared {
            warn!(
                task_id = task.id.get(),
                status = %task.status,
                agent = task.working_agent.as_deref().unwrap_or_default(),
                session_key = task.agent_session_key.as_ref().map(|k| k.as_str()).unwrap_or_default(),
                "orphaned assignment cleared"
            );
        }

        let report = ReconcileReport {
            phantoms_reset: ids(&reset),
            orphans_cleared: ids(&cleared),
        };
        if report.is_empty() {
            debug!("reconcile pass found nothing to repair");
        } else {
            info!(
                phantoms = report.phantoms_reset.len(),
                orphans = report.orphans_cleared.len(),
                "reconcile pass complete"
            );
        }
        Ok(report)
    }

    /// Run a pass every `interval` until `cancel` fires. The first pass runs
    /// immediately. A failed pass is logged and the loop carries on.
    pub fn spawn_periodic(
        self: Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => {
                        debug!("periodic reconciler stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = self.run() {
                            error!(error = %e, "reconcile pass failed");
                        }
                    }
                }
            }
        })
    }
}

fn ids(tasks: &[Task]) -> Vec<TaskId> {
    tasks.iter().map(|t| t.id).collect()
}
