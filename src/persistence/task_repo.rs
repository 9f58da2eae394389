//! Task repository: the contract recovery needs, plus a `SQLite` implementation.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use chrono::Utc;

use crate::models::task::{Task, TaskStatus};
use crate::{AppError, Result};

use super::db::Database;
use super::parse_timestamp;

/// Boxed future returned by [`TaskRepository`] methods.
pub type RepoFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Store of agent task records that recovery releases.
///
/// Implementations may be local or backed by a remote service; either way
/// failures surface as `AppError` and the recovery coordinator turns them
/// into a failed [`RecoveryResult`](crate::models::recovery::RecoveryResult).
pub trait TaskRepository: Send + Sync {
    /// Tasks currently claimed by agents of `session_id`.
    ///
    /// # Errors
    ///
    /// Returns an error if the repository cannot be queried.
    fn find_by_assignee<'a>(&'a self, session_id: &'a str) -> RepoFuture<'a, Vec<Task>>;

    /// Clear the assignment of `task_id` and return it to `pending`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the task does not exist, or another
    /// error if the repository cannot be updated.
    fn unassign<'a>(&'a self, task_id: &'a str) -> RepoFuture<'a, ()>;
}

/// `SQLite`-backed task store sharing the application database.
#[derive(Clone)]
pub struct SqliteTaskRepo {
    db: Arc<Database>,
}

#[derive(sqlx::FromRow)]
struct TaskRow {
    id: String,
    title: String,
    status: String,
    assignee_session_id: Option<String>,
    assignee_agent: Option<String>,
    updated_at: String,
}

impl TaskRow {
    fn into_task(self) -> Result<Task> {
        Ok(Task {
            status: TaskStatus::parse(&self.status)?,
            updated_at: parse_timestamp("updated_at", &self.updated_at)?,
            id: self.id,
            title: self.title,
            assignee_session_id: self.assignee_session_id,
            assignee_agent: self.assignee_agent,
        })
    }
}

impl SqliteTaskRepo {
    /// Create a new repository instance.
    #[must_use]
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Insert a new task record.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the insert fails.
    pub async fn insert(&self, task: &Task) -> Result<Task> {
        sqlx::query(
            "INSERT INTO task (id, title, status, assignee_session_id, assignee_agent, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )
        .bind(&task.id)
        .bind(&task.title)
        .bind(task.status.as_str())
        .bind(&task.assignee_session_id)
        .bind(&task.assignee_agent)
        .bind(task.updated_at.to_rfc3339())
        .execute(self.db.as_ref())
        .await?;
        Ok(task.clone())
    }

    /// Retrieve a task by identifier.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn get_by_id(&self, id: &str) -> Result<Option<Task>> {
        let row: Option<TaskRow> = sqlx::query_as(
            "SELECT id, title, status, assignee_session_id, assignee_agent, updated_at
             FROM task WHERE id = ?1",
        )
        .bind(id)
        .fetch_optional(self.db.as_ref())
        .await?;
        row.map(TaskRow::into_task).transpose()
    }

    /// Claim a pending task for an agent of `session_id`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the task does not exist or is not
    /// pending, or `AppError::Db` if the update fails.
    pub async fn claim(&self, task_id: &str, session_id: &str, agent: &str) -> Result<Task> {
        let result = sqlx::query(
            "UPDATE task SET status = 'in_progress', assignee_session_id = ?2,
                assignee_agent = ?3, updated_at = ?4
             WHERE id = ?1 AND status = 'pending' AND assignee_session_id IS NULL",
        )
        .bind(task_id)
        .bind(session_id)
        .bind(agent)
        .bind(Utc::now().to_rfc3339())
        .execute(self.db.as_ref())
        .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!(
                "no pending task {task_id} to claim"
            )));
        }
        self.get_by_id(task_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("task {task_id} vanished after claim")))
    }

    async fn claimed_by(&self, session_id: &str) -> Result<Vec<Task>> {
        let rows: Vec<TaskRow> = sqlx::query_as(
            "SELECT id, title, status, assignee_session_id, assignee_agent, updated_at
             FROM task
             WHERE assignee_session_id = ?1 AND status = 'in_progress'
             ORDER BY updated_at ASC, id ASC",
        )
        .bind(session_id)
        .fetch_all(self.db.as_ref())
        .await?;
        rows.into_iter().map(TaskRow::into_task).collect()
    }

    async fn release(&self, task_id: &str) -> Result<()> {
        let result = sqlx::query(
            "UPDATE task SET status = 'pending', assignee_session_id = NULL,
                assignee_agent = NULL, updated_at = ?2
             WHERE id = ?1",
        )
        .bind(task_id)
        .bind(Utc::now().to_rfc3339())
        .execute(self.db.as_ref())
        .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("task {task_id} not found")));
        }
        Ok(())
    }
}

impl TaskRepository for SqliteTaskRepo {
    fn find_by_assignee<'a>(&'a self, session_id: &'a str) -> RepoFuture<'a, Vec<Task>> {
        Box::pin(self.claimed_by(session_id))
    }

    fn unassign<'a>(&'a self, task_id: &'a str) -> RepoFuture<'a, ()> {
        Box::pin(self.release(task_id))
    }
}
