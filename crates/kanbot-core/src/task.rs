use std::convert::Infallible;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::ids::{RunId, SessionKey, TaskId};

/// Assignee value the board uses when nobody owns a task.
pub const UNASSIGNED: &str = "Unassigned";

pub const DEFAULT_PRIORITY: &str = "Medium";
pub const DEFAULT_BOARD: &str = "tasks";

/// Workflow column of a task.
///
/// Only `InProgress` carries meaning for the spawn lifecycle; any column the
/// board defines beyond the three built-ins round-trips through `Other`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum TaskStatus {
    Backlog,
    InProgress,
    Done,
    Other(String),
}

impl TaskStatus {
    pub fn is_in_progress(&self) -> bool {
        matches!(self, Self::InProgress)
    }

    pub fn from_label(label: &str) -> Self {
        match label {
            "Backlog" => Self::Backlog,
            "In Progress" => Self::InProgress,
            "Done" => Self::Done,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Backlog => "Backlog",
            Self::InProgress => "In Progress",
            Self::Done => "Done",
            Self::Other(s) => s,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = Infallible;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::from_label(s))
    }
}

impl Serialize for TaskStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for TaskStatus {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(Self::from_label(&raw))
    }
}

/// Where a task stands with respect to its remote agent session.
///
/// Kept as its own column so the spawn guard and the reconciler read one
/// value instead of inferring state from nullable fields.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpawnState {
    /// No session and nobody currently asking for one.
    Idle,
    /// A spawn request has been claimed and not yet resolved.
    InFlight,
    /// The gateway accepted the spawn and returned a session key.
    Active,
}

impl fmt::Display for SpawnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::InFlight => write!(f, "in_flight"),
            Self::Active => write!(f, "active"),
        }
    }
}

impl FromStr for SpawnState {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(Self::Idle),
            "in_flight" => Ok(Self::InFlight),
            "active" => Ok(Self::Active),
            other => Err(format!("unknown spawn state: {other}")),
        }
    }
}

/// A task row as the lifecycle manager sees it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub title: String,
    pub description: String,
    pub status: TaskStatus,
    pub priority: String,
    /// The board's assignee column.
    pub assignee: String,
    pub due_date: Option<String>,
    pub board: String,
    /// Where an imported task came from.
    pub source_file: Option<String>,
    pub source_ref: Option<String>,
    pub working_agent: Option<String>,
    pub agent_session_key: Option<SessionKey>,
    pub spawn_state: SpawnState,
    pub spawn_run_id: Option<RunId>,
    pub spawn_error: Option<String>,
    pub entered_in_progress_at: Option<DateTime<Utc>>,
    pub spawn_started_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn is_in_progress(&self) -> bool {
        self.status.is_in_progress()
    }

    /// True when the task already owns a live remote session.
    pub fn has_active_session(&self) -> bool {
        self.spawn_state == SpawnState::Active && self.agent_session_key.is_some()
    }

    /// The agent that should be spawned for this task: the working agent if
    /// one is recorded, otherwise the board assignee when it names someone.
    pub fn responsible_agent(&self) -> Option<&str> {
        self.working_agent.as_deref().or_else(|| {
            let assignee = self.assignee.trim();
            (!assignee.is_empty() && assignee != UNASSIGNED).then_some(assignee)
        })
    }

    /// Spawn state left over from an earlier stint in In Progress: the task
    /// has left since the claim, or re-entered after it. Such state belongs
    /// to no current trigger and may be replaced by a new claim.
    pub fn has_stale_assignment(&self) -> bool {
        if self.spawn_state == SpawnState::Idle {
            return false;
        }
        if !self.is_in_progress() {
            return true;
        }
        match (self.spawn_started_at, self.entered_in_progress_at) {
            (None, _) => true,
            (Some(started), Some(entered)) => started < entered,
            (Some(_), None) => false,
        }
    }
}

/// Board fields for a new task. Everything but the title has a default.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct NewTask {
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub assignee: Option<String>,
    #[serde(default)]
    pub priority: Option<String>,
    #[serde(default)]
    pub due_date: Option<String>,
    #[serde(default)]
    pub board: Option<String>,
    #[serde(default)]
    pub source_file: Option<String>,
    #[serde(default)]
    pub source_ref: Option<String>,
}

impl NewTask {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(status: TaskStatus) -> Task {
        let now = Utc::now();
        Task {
            id: TaskId::new(1),
            title: "t".into(),
            description: String::new(),
            status,
            priority: DEFAULT_PRIORITY.into(),
            assignee: UNASSIGNED.into(),
            due_date: None,
            board: DEFAULT_BOARD.into(),
            source_file: None,
            source_ref: None,
            working_agent: None,
            agent_session_key: None,
            spawn_state: SpawnState::Idle,
            spawn_run_id: None,
            spawn_error: None,
            entered_in_progress_at: None,
            spawn_started_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn status_parses_board_columns() {
        assert_eq!("Backlog".parse::<TaskStatus>().unwrap(), TaskStatus::Backlog);
        assert_eq!("In Progress".parse::<TaskStatus>().unwrap(), TaskStatus::InProgress);
        assert_eq!("Done".parse::<TaskStatus>().unwrap(), TaskStatus::Done);
        assert_eq!(
            "Review".parse::<TaskStatus>().unwrap(),
            TaskStatus::Other("Review".into())
        );
    }

    #[test]
    fn status_serializes_as_board_label() {
        let json = serde_json::to_string(&TaskStatus::InProgress).unwrap();
        assert_eq!(json, "\"In Progress\"");
        let back: TaskStatus = serde_json::from_str("\"Review\"").unwrap();
        assert_eq!(back, TaskStatus::Other("Review".into()));
    }

    #[test]
    fn spawn_state_roundtrips_through_str() {
        for state in [SpawnState::Idle, SpawnState::InFlight, SpawnState::Active] {
            assert_eq!(state.to_string().parse::<SpawnState>().unwrap(), state);
        }
        assert!("running".parse::<SpawnState>().is_err());
    }

    #[test]
    fn responsible_agent_prefers_working_agent() {
        let mut t = task(TaskStatus::InProgress);
        assert_eq!(t.responsible_agent(), None);

        t.assignee = "Architect".into();
        assert_eq!(t.responsible_agent(), Some("Architect"));

        t.working_agent = Some("UX-Manager".into());
        assert_eq!(t.responsible_agent(), Some("UX-Manager"));
    }

    #[test]
    fn stale_assignment_belongs_to_an_earlier_stint() {
        let entered = Utc::now();
        let mut t = task(TaskStatus::InProgress);
        t.entered_in_progress_at = Some(entered);
        assert!(!t.has_stale_assignment());

        t.spawn_state = SpawnState::Active;
        t.spawn_started_at = Some(entered);
        assert!(!t.has_stale_assignment());

        t.spawn_started_at = Some(entered - chrono::Duration::hours(1));
        assert!(t.has_stale_assignment());

        t.spawn_started_at = Some(entered);
        t.status = TaskStatus::Done;
        assert!(t.has_stale_assignment());
    }

    #[test]
    fn active_session_needs_key_and_state() {
        let mut t = task(TaskStatus::InProgress);
        t.spawn_state = SpawnState::Active;
        assert!(!t.has_active_session());
        t.agent_session_key = Some(SessionKey::from_raw("agent:architect:subagent:1"));
        assert!(t.has_active_session());
    }
}
