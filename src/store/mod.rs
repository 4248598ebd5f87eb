//! User and plan persistence.
//!
//! [`Store`] abstracts the backend. [`PgStore`] is used when a database URL
//! is configured; [`InMemoryStore`] otherwise and in tests.
//!
//! Users are keyed by their identity-provider subject (`external_id`) and
//! carry their own UUID, which plans reference.

mod memory;
mod postgres;

pub use memory::InMemoryStore;
pub use postgres::PgStore;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::planner::Task;

/// A known user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct User {
    /// Internal id
    pub id: Uuid,
    /// Identity-provider subject
    pub external_id: String,
    /// Email, when the provider shared it
    pub email: Option<String>,
    /// Display name, when the provider shared it
    pub name: Option<String>,
    /// First seen
    pub created_at: DateTime<Utc>,
}

/// A saved plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Plan {
    /// Plan id
    pub id: Uuid,
    /// Owner
    pub user_id: Uuid,
    /// Title
    pub title: String,
    /// Goal the plan was generated for
    pub goal: String,
    /// Generated tasks
    pub tasks: Vec<Task>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last modification time
    pub updated_at: DateTime<Utc>,
}

/// A plan to insert.
#[derive(Debug, Clone)]
pub struct NewPlan {
    /// Owner
    pub user_id: Uuid,
    /// Title
    pub title: String,
    /// Goal
    pub goal: String,
    /// Generated tasks
    pub tasks: Vec<Task>,
}

/// Storage errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Query or connection failure.
    #[error("database error: {0}")]
    Database(String),

    /// A stored value could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        Self::Database(e.to_string())
    }
}

/// Persistence backend.
#[async_trait::async_trait]
pub trait Store: Send + Sync + 'static {
    /// Return the user for `external_id`, creating it on first sight.
    ///
    /// Email and name fill in missing profile fields but never overwrite
    /// stored ones.
    async fn find_or_create_user(
        &self,
        external_id: &str,
        email: Option<&str>,
        name: Option<&str>,
    ) -> Result<User, StoreError>;

    /// Look up a user by identity-provider subject.
    async fn find_user_by_external_id(&self, external_id: &str) -> Result<Option<User>, StoreError>;

    /// Save a plan and return its id.
    async fn insert_plan(&self, plan: NewPlan) -> Result<Uuid, StoreError>;

    /// Up to `limit` plans of `user_id`, newest first.
    async fn list_plans(&self, user_id: Uuid, limit: usize) -> Result<Vec<Plan>, StoreError>;

    /// Release connections. Further calls may fail.
    async fn close(&self) {}
}
