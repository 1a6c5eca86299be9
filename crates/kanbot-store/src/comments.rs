use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::instrument;

use kanbot_core::TaskId;

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Comment {
    pub id: i64,
    pub task_id: TaskId,
    pub author: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

pub struct CommentRepo {
    db: Database,
}

impl CommentRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Add a comment to an existing task.
    #[instrument(skip(self, content), fields(task_id = task_id.get()))]
    pub fn add(&self, task_id: TaskId, author: &str, content: &str) -> Result<Comment, StoreError> {
        let now = Utc::now();
        self.db.with_conn(|conn| {
            let exists: bool = conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM tasks WHERE id = ?1)",
                [task_id.get()],
                |row| row.get(0),
            )?;
            if !exists {
                return Err(StoreError::NotFound(format!("task {task_id}")));
            }

            conn.execute(
                "INSERT INTO comments (task_id, author, content, created_at) VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![task_id.get(), author, content, row_helpers::format_ts(now)],
            )?;

            Ok(Comment {
                id: conn.last_insert_rowid(),
                task_id,
                author: author.to_string(),
                content: content.to_string(),
                created_at: now,
            })
        })
    }

    /// Oldest first.
    #[instrument(skip(self), fields(task_id = task_id.get()))]
    pub fn list(&self, task_id: TaskId) -> Result<Vec<Comment>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, task_id, author, content, created_at
                 FROM comments WHERE task_id = ?1 ORDER BY id",
            )?;
            let mut rows = stmt.query([task_id.get()])?;
            let mut comments = Vec::new();
            while let Some(row) = rows.next()? {
                let created_at: String = row_helpers::get(row, 4, "comments", "created_at")?;
                comments.push(Comment {
                    id: row_helpers::get(row, 0, "comments", "id")?,
                    task_id: TaskId::new(row_helpers::get(row, 1, "comments", "task_id")?),
                    author: row_helpers::get(row, 2, "comments", "author")?,
                    content: row_helpers::get(row, 3, "comments", "content")?,
                    created_at: row_helpers::parse_ts(&created_at, "comments", "created_at")?,
                });
            }
            Ok(comments)
        })
    }
}
