//! SQLite persistence for tasks, comments and the activity log.
//!
//! Every write that touches a task's spawn fields is a single conditional
//! statement (or a short transaction under the connection lock), so callers
//! get compare-and-set semantics without holding any lock of their own.

pub mod activity;
pub mod comments;
pub mod database;
pub mod error;
pub mod row_helpers;
pub mod schema;
pub mod tasks;

pub use activity::{ActivityAction, ActivityEntry, ActivityRepo};
pub use comments::{Comment, CommentRepo};
pub use database::Database;
pub use error::StoreError;
pub use tasks::{CasOutcome, SpawnTransition, TaskRepo};
