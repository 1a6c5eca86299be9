use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Value};
use tracing::instrument;

use kanbot_core::task::{DEFAULT_BOARD, DEFAULT_PRIORITY, UNASSIGNED};
use kanbot_core::{NewTask, RunId, SessionKey, SpawnState, Task, TaskId, TaskStatus};

use crate::activity::{self, ActivityAction};
use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers::{self, format_ts};

const TASK_COLUMNS: &str = "id, title, description, status, agent, working_agent, \
     agent_session_key, spawn_state, spawn_run_id, spawn_error, entered_in_progress_at, \
     spawn_started_at, created_at, updated_at, priority, due_date, board, source_file, source_ref";

/// Clears everything the spawn lifecycle attached to a task. `spawn_error`
/// is kept as the last known failure.
const CLEAR_ASSIGNMENT: &str = "working_agent = NULL, agent_session_key = NULL, \
     spawn_run_id = NULL, spawn_state = 'idle', spawn_started_at = NULL";

/// Not In Progress but still carrying lifecycle state.
const ORPHAN_PREDICATE: &str = "status != 'In Progress' AND (working_agent IS NOT NULL \
     OR agent_session_key IS NOT NULL OR spawn_state != 'idle')";

/// Spawn state taken before the task's current stint in In Progress began.
/// Mirrors [`Task::has_stale_assignment`].
const PREVIOUS_STINT: &str = "(spawn_state != 'idle' AND (status != 'In Progress' \
     OR spawn_started_at IS NULL OR spawn_started_at < entered_in_progress_at))";

/// In Progress without a live session, and older than the cutoff bound to
/// `param`. A session claimed before the latest entry into In Progress is
/// not live. An in-flight claim ages from `spawn_started_at`, anything else
/// from `entered_in_progress_at`; a missing timestamp counts as ancient.
fn stale_predicate(param: &str) -> String {
    format!(
        "status = 'In Progress' \
         AND NOT (spawn_state = 'active' AND agent_session_key IS NOT NULL \
                  AND NOT {PREVIOUS_STINT}) \
         AND COALESCE(CASE spawn_state WHEN 'in_flight' THEN spawn_started_at \
                      ELSE entered_in_progress_at END, '') < {param}"
    )
}

/// `row` is In Progress and holds a pending or live spawn from this stint.
fn busy_predicate(row: &str) -> String {
    format!(
        "{row}.status = 'In Progress' AND {row}.spawn_state IN ('in_flight', 'active') \
         AND {row}.spawn_started_at >= {row}.entered_in_progress_at"
    )
}

/// A change to a task's spawn sub-state. Each variant implies the sub-state
/// it starts from.
#[derive(Clone, Debug)]
pub enum SpawnTransition {
    /// `idle → in_flight`: record `agent` as the working agent and move the
    /// task into In Progress if it is not there yet. `at` becomes the claim
    /// stamp that later transitions must present. Spawn state left from an
    /// earlier stint counts as idle and is replaced. With `exclusive`, the
    /// claim also fails while `agent` is busy on another task.
    Claim {
        agent: String,
        at: DateTime<Utc>,
        exclusive: bool,
    },
    /// `in_flight → active` with the gateway's session.
    Commit {
        claimed_at: DateTime<Utc>,
        session_key: SessionKey,
        run_id: Option<RunId>,
    },
    /// `in_flight → idle`, keeping the failure reason.
    Fail { claimed_at: DateTime<Utc>, error: String },
}

impl SpawnTransition {
    pub fn from_state(&self) -> SpawnState {
        match self {
            Self::Claim { .. } => SpawnState::Idle,
            Self::Commit { .. } | Self::Fail { .. } => SpawnState::InFlight,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CasOutcome {
    Applied,
    /// The row no longer matched the expected status / sub-state; nothing
    /// was written.
    Conflict,
}

enum Repair {
    Phantom { cutoff: String },
    Orphan,
    Release,
}

pub struct TaskRepo {
    db: Database,
}

impl TaskRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Create a task in Backlog with default board fields.
    pub fn create(
        &self,
        title: &str,
        description: &str,
        assignee: Option<&str>,
    ) -> Result<Task, StoreError> {
        self.insert(&NewTask {
            description: description.to_owned(),
            assignee: assignee.map(str::to_owned),
            ..NewTask::new(title)
        })
    }

    /// Create a task in Backlog.
    #[instrument(skip(self, new), fields(title = %new.title))]
    pub fn insert(&self, new: &NewTask) -> Result<Task, StoreError> {
        let now = format_ts(Utc::now());
        let assignee = new
            .assignee
            .as_deref()
            .map(str::trim)
            .filter(|a| !a.is_empty())
            .unwrap_or(UNASSIGNED);

        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO tasks (title, description, status, priority, agent, due_date, board,
                                    source_file, source_ref, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10)",
                rusqlite::params![
                    new.title,
                    new.description,
                    TaskStatus::Backlog.as_str(),
                    new.priority.as_deref().unwrap_or(DEFAULT_PRIORITY),
                    assignee,
                    new.due_date,
                    new.board.as_deref().unwrap_or(DEFAULT_BOARD),
                    new.source_file,
                    new.source_ref,
                    now
                ],
            )?;
            let id = TaskId::new(conn.last_insert_rowid());
            select_task(conn, id)?.ok_or_else(|| StoreError::NotFound(format!("task {id}")))
        })
    }

    #[instrument(skip(self), fields(task_id = id.get()))]
    pub fn get(&self, id: TaskId) -> Result<Task, StoreError> {
        self.db.with_conn(|conn| {
            select_task(conn, id)?.ok_or_else(|| StoreError::NotFound(format!("task {id}")))
        })
    }

    /// All tasks, optionally restricted to one status, ordered by id.
    #[instrument(skip(self))]
    pub fn list(&self, status: Option<&TaskStatus>) -> Result<Vec<Task>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {TASK_COLUMNS} FROM tasks WHERE ?1 IS NULL OR status = ?1 ORDER BY id"
            ))?;
            let mut rows = stmt.query([status.map(TaskStatus::as_str)])?;
            let mut tasks = Vec::new();
            while let Some(row) = rows.next()? {
                tasks.push(row_to_task(row)?);
            }
            Ok(tasks)
        })
    }

    /// Move a task to `status`, returning the status it had before.
    pub fn set_status(&self, id: TaskId, status: &TaskStatus) -> Result<TaskStatus, StoreError> {
        self.set_status_at(id, status, Utc::now())
    }

    /// As [`set_status`](Self::set_status) with an explicit clock. Entering In
    /// Progress from another status stamps `entered_in_progress_at`.
    #[instrument(skip(self), fields(task_id = id.get(), status = %status))]
    pub fn set_status_at(
        &self,
        id: TaskId,
        status: &TaskStatus,
        at: DateTime<Utc>,
    ) -> Result<TaskStatus, StoreError> {
        self.db.with_tx(|conn| {
            let previous: String = conn
                .query_row("SELECT status FROM tasks WHERE id = ?1", [id.get()], |row| {
                    row.get(0)
                })
                .optional()?
                .ok_or_else(|| StoreError::NotFound(format!("task {id}")))?;

            conn.execute(
                "UPDATE tasks SET
                    entered_in_progress_at = CASE
                        WHEN ?2 = 'In Progress' AND status != 'In Progress' THEN ?3
                        ELSE entered_in_progress_at END,
                    status = ?2,
                    updated_at = ?3
                 WHERE id = ?1",
                rusqlite::params![id.get(), status.as_str(), format_ts(at)],
            )?;
            Ok(TaskStatus::from_label(&previous))
        })
    }

    /// Conditional update of the spawn sub-state. Applies only while the row
    /// still has `expected_status` and the transition's starting sub-state
    /// (and, past a claim, the same claim stamp). A claim that replaces
    /// state from an earlier stint logs it as an `orphan_cleared` activity
    /// in the same transaction.
    #[instrument(skip(self, transition), fields(task_id = id.get(), from = %transition.from_state()))]
    pub fn compare_and_set_spawn_state(
        &self,
        id: TaskId,
        expected_status: &TaskStatus,
        transition: &SpawnTransition,
    ) -> Result<CasOutcome, StoreError> {
        self.db.with_tx(|conn| {
            let before = select_task(conn, id)?
                .ok_or_else(|| StoreError::NotFound(format!("task {id}")))?;
            let changed = match transition {
                SpawnTransition::Claim {
                    agent,
                    at,
                    exclusive,
                } => conn.execute(
                    &format!(
                        "UPDATE tasks SET
                        entered_in_progress_at = CASE
                            WHEN status = 'In Progress' THEN COALESCE(entered_in_progress_at, ?4)
                            ELSE ?4 END,
                        status = 'In Progress',
                        working_agent = ?3,
                        agent_session_key = NULL,
                        spawn_run_id = NULL,
                        spawn_error = NULL,
                        spawn_state = 'in_flight',
                        spawn_started_at = ?4,
                        updated_at = ?4
                     WHERE id = ?1 AND status = ?2
                       AND (spawn_state = 'idle' OR {PREVIOUS_STINT})
                       AND (?5 = 0 OR NOT EXISTS (
                            SELECT 1 FROM tasks AS other
                            WHERE other.working_agent = ?3 AND other.id != ?1 AND {}))",
                        busy_predicate("other")
                    ),
                    rusqlite::params![
                        id.get(),
                        expected_status.as_str(),
                        agent,
                        format_ts(*at),
                        exclusive
                    ],
                )?,
                SpawnTransition::Commit {
                    claimed_at,
                    session_key,
                    run_id,
                } => conn.execute(
                    "UPDATE tasks SET
                        spawn_state = 'active',
                        agent_session_key = ?4,
                        spawn_run_id = ?5,
                        spawn_error = NULL,
                        updated_at = ?6
                     WHERE id = ?1 AND status = ?2 AND spawn_state = 'in_flight'
                       AND spawn_started_at = ?3",
                    rusqlite::params![
                        id.get(),
                        expected_status.as_str(),
                        format_ts(*claimed_at),
                        session_key.as_str(),
                        run_id.as_ref().map(RunId::as_str),
                        format_ts(Utc::now()),
                    ],
                )?,
                SpawnTransition::Fail { claimed_at, error } => conn.execute(
                    "UPDATE tasks SET
                        spawn_state = 'idle',
                        agent_session_key = NULL,
                        spawn_run_id = NULL,
                        spawn_error = ?4,
                        spawn_started_at = NULL,
                        updated_at = ?5
                     WHERE id = ?1 AND status = ?2 AND spawn_state = 'in_flight'
                       AND spawn_started_at = ?3",
                    rusqlite::params![
                        id.get(),
                        expected_status.as_str(),
                        format_ts(*claimed_at),
                        error,
                        format_ts(Utc::now()),
                    ],
                )?,
            };

            if changed == 0 {
                return Ok(CasOutcome::Conflict);
            }
            if matches!(transition, SpawnTransition::Claim { .. }) && before.has_stale_assignment() {
                let after = select_task(conn, id)?
                    .ok_or_else(|| StoreError::NotFound(format!("task {id}")))?;
                activity::insert(
                    conn,
                    id,
                    ActivityAction::OrphanCleared,
                    before.working_agent.as_deref(),
                    Some(json!({
                        "before": lifecycle_snapshot(&before),
                        "after": lifecycle_snapshot(&after),
                    })),
                )?;
            }
            Ok(CasOutcome::Applied)
        })
    }

    /// Ids of tasks stuck In Progress without a session since before `cutoff`.
    #[instrument(skip(self))]
    pub fn list_stale_in_progress(&self, cutoff: DateTime<Utc>) -> Result<Vec<TaskId>, StoreError> {
        let sql = format!("SELECT id FROM tasks WHERE {} ORDER BY id", stale_predicate("?1"));
        self.select_ids(&sql, Some(format_ts(cutoff)))
    }

    /// Reset phantoms to Backlog. Each id is re-checked against the staleness
    /// predicate in the same statement; returns the pre-repair rows of the
    /// tasks actually reset.
    pub fn reset_to_backlog(
        &self,
        ids: &[TaskId],
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Task>, StoreError> {
        self.repair(
            ids,
            Repair::Phantom {
                cutoff: format_ts(cutoff),
            },
        )
    }

    /// Ids of tasks outside In Progress that still hold an agent or session.
    #[instrument(skip(self))]
    pub fn list_orphaned(&self) -> Result<Vec<TaskId>, StoreError> {
        let sql = format!("SELECT id FROM tasks WHERE {ORPHAN_PREDICATE} ORDER BY id");
        self.select_ids(&sql, None)
    }

    /// Clear agent and session from orphaned tasks; status is untouched.
    pub fn clear_orphaned(&self, ids: &[TaskId]) -> Result<Vec<Task>, StoreError> {
        self.repair(ids, Repair::Orphan)
    }

    /// Drop the agent/session of a task that just left In Progress. Returns
    /// the previous row if there was anything to release.
    pub fn release_assignment(&self, id: TaskId) -> Result<Option<Task>, StoreError> {
        Ok(self.repair(&[id], Repair::Release)?.into_iter().next())
    }

    /// Another In Progress task this agent is spawning or running on.
    #[instrument(skip(self), fields(excluding = excluding.get()))]
    pub fn find_busy_task_for_agent(
        &self,
        agent: &str,
        excluding: TaskId,
    ) -> Result<Option<TaskId>, StoreError> {
        self.db.with_conn(|conn| {
            let id: Option<i64> = conn
                .query_row(
                    &format!(
                        "SELECT t.id FROM tasks AS t
                         WHERE t.working_agent = ?1 AND t.id != ?2 AND {}
                         ORDER BY t.id LIMIT 1",
                        busy_predicate("t")
                    ),
                    rusqlite::params![agent, excluding.get()],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(id.map(TaskId::new))
        })
    }

    fn select_ids(&self, sql: &str, param: Option<String>) -> Result<Vec<TaskId>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(sql)?;
            let mut rows = match &param {
                Some(p) => stmt.query([p])?,
                None => stmt.query([])?,
            };
            let mut ids = Vec::new();
            while let Some(row) = rows.next()? {
                ids.push(TaskId::new(row_helpers::get(row, 0, "tasks", "id")?));
            }
            Ok(ids)
        })
    }

    #[instrument(skip(self, ids, repair), fields(count = ids.len()))]
    fn repair(&self, ids: &[TaskId], repair: Repair) -> Result<Vec<Task>, StoreError> {
        let (sql, action, cutoff) = match &repair {
            Repair::Phantom { cutoff } => (
                format!(
                    "UPDATE tasks SET status = 'Backlog', {CLEAR_ASSIGNMENT}, updated_at = ?2
                     WHERE id = ?1 AND {}",
                    stale_predicate("?3")
                ),
                ActivityAction::PhantomReset,
                Some(cutoff.as_str()),
            ),
            Repair::Orphan | Repair::Release => (
                format!(
                    "UPDATE tasks SET {CLEAR_ASSIGNMENT}, updated_at = ?2
                     WHERE id = ?1 AND {ORPHAN_PREDICATE}"
                ),
                if matches!(repair, Repair::Orphan) {
                    ActivityAction::OrphanCleared
                } else {
                    ActivityAction::Released
                },
                None,
            ),
        };

        self.db.with_tx(|conn| {
            let now = format_ts(Utc::now());
            let mut repaired = Vec::new();
            for &id in ids {
                let Some(before) = select_task(conn, id)? else {
                    continue;
                };
                let changed = match cutoff {
                    Some(cutoff) => conn.execute(&sql, rusqlite::params![id.get(), now, cutoff])?,
                    None => conn.execute(&sql, rusqlite::params![id.get(), now])?,
                };
                if changed == 0 {
                    continue;
                }
                let after = select_task(conn, id)?
                    .ok_or_else(|| StoreError::NotFound(format!("task {id}")))?;
                activity::insert(
                    conn,
                    id,
                    action,
                    before.working_agent.as_deref(),
                    Some(json!({
                        "before": lifecycle_snapshot(&before),
                        "after": lifecycle_snapshot(&after),
                    })),
                )?;
                repaired.push(before);
            }
            Ok(repaired)
        })
    }
}

/// The fields a repair can change, for the activity log.
pub fn lifecycle_snapshot(task: &Task) -> Value {
    json!({
        "status": task.status,
        "workingAgent": task.working_agent,
        "agentSessionKey": task.agent_session_key,
        "spawnState": task.spawn_state,
    })
}

fn select_task(conn: &Connection, id: TaskId) -> Result<Option<Task>, StoreError> {
    let mut stmt = conn.prepare(&format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"))?;
    let mut rows = stmt.query([id.get()])?;
    match rows.next()? {
        Some(row) => Ok(Some(row_to_task(row)?)),
        None => Ok(None),
    }
}

fn row_to_task(row: &rusqlite::Row<'_>) -> Result<Task, StoreError> {
    let status: String = row_helpers::get(row, 3, "tasks", "status")?;
    let spawn_state: String = row_helpers::get(row, 7, "tasks", "spawn_state")?;
    let created_at: String = row_helpers::get(row, 12, "tasks", "created_at")?;
    let updated_at: String = row_helpers::get(row, 13, "tasks", "updated_at")?;

    Ok(Task {
        id: TaskId::new(row_helpers::get(row, 0, "tasks", "id")?),
        title: row_helpers::get(row, 1, "tasks", "title")?,
        description: row_helpers::get(row, 2, "tasks", "description")?,
        status: TaskStatus::from_label(&status),
        assignee: row_helpers::get(row, 4, "tasks", "agent")?,
        working_agent: row_helpers::get_opt(row, 5, "tasks", "working_agent")?,
        agent_session_key: row_helpers::get_opt::<String>(row, 6, "tasks", "agent_session_key")?
            .map(SessionKey::from_raw),
        spawn_state: row_helpers::parse_enum(&spawn_state, "tasks", "spawn_state")?,
        spawn_run_id: row_helpers::get_opt::<String>(row, 8, "tasks", "spawn_run_id")?
            .map(RunId::from_raw),
        spawn_error: row_helpers::get_opt(row, 9, "tasks", "spawn_error")?,
        entered_in_progress_at: row_helpers::parse_ts_opt(
            row_helpers::get_opt(row, 10, "tasks", "entered_in_progress_at")?,
            "tasks",
            "entered_in_progress_at",
        )?,
        spawn_started_at: row_helpers::parse_ts_opt(
            row_helpers::get_opt(row, 11, "tasks", "spawn_started_at")?,
            "tasks",
            "spawn_started_at",
        )?,
        created_at: row_helpers::parse_ts(&created_at, "tasks", "created_at")?,
        updated_at: row_helpers::parse_ts(&updated_at, "tasks", "updated_at")?,
        priority: row_helpers::get(row, 14, "tasks", "priority")?,
        due_date: row_helpers::get_opt(row, 15, "tasks", "due_date")?,
        board: row_helpers::get(row, 16, "tasks", "board")?,
        source_file: row_helpers::get_opt(row, 17, "tasks", "source_file")?,
        source_ref: row_helpers::get_opt(row, 18, "tasks", "source_ref")?,
    })
}
