use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::instrument;

use kanbot_core::TaskId;

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

/// What happened to a task, as recorded in `activity_log.action`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityAction {
    Created,
    StatusChanged,
    Commented,
    SpawnRequested,
    Spawned,
    SpawnFailed,
    AgentNotFound,
    Released,
    PhantomReset,
    OrphanCleared,
}

impl ActivityAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::StatusChanged => "status_changed",
            Self::Commented => "commented",
            Self::SpawnRequested => "spawn_requested",
            Self::Spawned => "spawned",
            Self::SpawnFailed => "spawn_failed",
            Self::AgentNotFound => "agent_not_found",
            Self::Released => "released",
            Self::PhantomReset => "phantom_reset",
            Self::OrphanCleared => "orphan_cleared",
        }
    }
}

impl std::fmt::Display for ActivityAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ActivityAction {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "created" => Self::Created,
            "status_changed" => Self::StatusChanged,
            "commented" => Self::Commented,
            "spawn_requested" => Self::SpawnRequested,
            "spawned" => Self::Spawned,
            "spawn_failed" => Self::SpawnFailed,
            "agent_not_found" => Self::AgentNotFound,
            "released" => Self::Released,
            "phantom_reset" => Self::PhantomReset,
            "orphan_cleared" => Self::OrphanCleared,
            other => return Err(format!("unknown activity action: {other}")),
        })
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ActivityEntry {
    pub id: i64,
    pub task_id: TaskId,
    pub action: ActivityAction,
    pub agent: Option<String>,
    pub details: Option<Value>,
    pub created_at: DateTime<Utc>,
}

/// Append-only audit trail per task.
pub struct ActivityRepo {
    db: Database,
}

impl ActivityRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    #[instrument(skip(self, details), fields(task_id = task_id.get(), action = %action))]
    pub fn record(
        &self,
        task_id: TaskId,
        action: ActivityAction,
        agent: Option<&str>,
        details: Option<Value>,
    ) -> Result<ActivityEntry, StoreError> {
        self.db
            .with_conn(|conn| insert(conn, task_id, action, agent, details))
    }

    /// Oldest first.
    #[instrument(skip(self), fields(task_id = task_id.get()))]
    pub fn list(&self, task_id: TaskId) -> Result<Vec<ActivityEntry>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, task_id, action, agent, details, created_at
                 FROM activity_log WHERE task_id = ?1 ORDER BY id",
            )?;
            let mut rows = stmt.query([task_id.get()])?;
            let mut entries = Vec::new();
            while let Some(row) = rows.next()? {
                entries.push(row_to_entry(row)?);
            }
            Ok(entries)
        })
    }
}

/// Insert on an existing connection, so repairs can log inside their own
/// transaction.
pub(crate) fn insert(
    conn: &Connection,
    task_id: TaskId,
    action: ActivityAction,
    agent: Option<&str>,
    details: Option<Value>,
) -> Result<ActivityEntry, StoreError> {
    let now = Utc::now();
    let details_json = details.as_ref().map(serde_json::to_string).transpose()?;
    conn.execute(
        "INSERT INTO activity_log (task_id, action, agent, details, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        rusqlite::params![
            task_id.get(),
            action.as_str(),
            agent,
            details_json,
            row_helpers::format_ts(now),
        ],
    )?;

    Ok(ActivityEntry {
        id: conn.last_insert_rowid(),
        task_id,
        action,
        agent: agent.map(str::to_owned),
        details,
        created_at: now,
    })
}

fn row_to_entry(row: &rusqlite::Row<'_>) -> Result<ActivityEntry, StoreError> {
    let action: String = row_helpers::get(row, 2, "activity_log", "action")?;
    let details: Option<String> = row_helpers::get_opt(row, 4, "activity_log", "details")?;
    let created_at: String = row_helpers::get(row, 5, "activity_log", "created_at")?;

    Ok(ActivityEntry {
        id: row_helpers::get(row, 0, "activity_log", "id")?,
        task_id: TaskId::new(row_helpers::get(row, 1, "activity_log", "task_id")?),
        action: row_helpers::parse_enum(&action, "activity_log", "action")?,
        agent: row_helpers::get_opt(row, 3, "activity_log", "agent")?,
        details: details
            .map(|raw| row_helpers::parse_json(&raw, "activity_log", "details"))
            .transpose()?,
        created_at: row_helpers::parse_ts(&created_at, "activity_log", "created_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::TaskRepo;
    use serde_json::json;

    fn setup() -> (ActivityRepo, TaskId) {
        let db = Database::in_memory().unwrap();
        let task = TaskRepo::new(db.clone()).create("Design API", "", None).unwrap();
        (ActivityRepo::new(db), task.id)
    }

    #[test]
    fn record_and_list_in_order() {
        let (repo, id) = setup();
        repo.record(id, ActivityAction::SpawnRequested, Some("Architect"), None)
            .unwrap();
        repo.record(
            id,
            ActivityAction::Spawned,
            Some("Architect"),
            Some(json!({ "sessionKey": "agent:architect:subagent:99" })),
        )
        .unwrap();

        let entries = repo.list(id).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].action, ActivityAction::SpawnRequested);
        assert_eq!(entries[1].action, ActivityAction::Spawned);
        assert_eq!(
            entries[1].details.as_ref().unwrap()["sessionKey"],
            "agent:architect:subagent:99"
        );
    }

    #[test]
    fn list_is_scoped_to_task() {
        let (repo, id) = setup();
        repo.record(id, ActivityAction::Released, None, None).unwrap();
        assert!(repo.list(TaskId::new(id.get() + 1)).unwrap().is_empty());
    }

    #[test]
    fn unknown_task_violates_foreign_key() {
        let (repo, _) = setup();
        let err = repo
            .record(TaskId::new(999), ActivityAction::Released, None, None)
            .unwrap_err();
        assert!(matches!(err, StoreError::Database(_)));
    }

    #[test]
    fn action_strings_round_trip() {
        for action in [
            ActivityAction::PhantomReset,
            ActivityAction::OrphanCleared,
            ActivityAction::AgentNotFound,
        ] {
            assert_eq!(action.as_str().parse::<ActivityAction>().unwrap(), action);
        }
        assert!("exploded".parse::<ActivityAction>().is_err());
    }
}
