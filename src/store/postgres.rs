//! Postgres store over a `sqlx` connection pool.

use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::Row;
use tracing::{info, warn};
use uuid::Uuid;

use super::{NewPlan, Plan, Store, StoreError, User};
use crate::config::DatabaseConfig;
use crate::planner::Task;

/// Store backed by the `users` and `plans` tables.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Open a pool sized by `config`.
    pub async fn connect(url: &str, config: &DatabaseConfig) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .idle_timeout(config.idle_timeout)
            .acquire_timeout(config.connect_timeout)
            .connect(url)
            .await?;
        info!(max_connections = config.max_connections, "Database pool ready");
        Ok(Self { pool })
    }

    /// Wrap an existing pool.
    #[must_use]
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Apply pending migrations from `migrations/`.
    pub async fn migrate(&self) -> Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("./migrations").run(&self.pool).await
    }
}

fn user_from_row(row: &PgRow) -> Result<User, StoreError> {
    Ok(User {
        id: row.try_get("id")?,
        external_id: row.try_get("external_id")?,
        email: row.try_get("email")?,
        name: row.try_get("name")?,
        created_at: row.try_get("created_at")?,
    })
}

fn plan_from_row(row: &PgRow) -> Result<Plan, StoreError> {
    let tasks: Json<Vec<Task>> = row
        .try_get("tasks")
        .map_err(|e| StoreError::Serialization(format!("Failed to decode tasks: {e}")))?;
    Ok(Plan {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        title: row.try_get("title")?,
        goal: row.try_get("goal")?,
        tasks: tasks.0,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

/// Drop plans whose stored tasks no longer decode; other failures abort.
fn keep_decodable(rows: impl IntoIterator<Item = Result<Plan, StoreError>>) -> Result<Vec<Plan>, StoreError> {
    let mut plans = Vec::new();
    for row in rows {
        match row {
            Ok(plan) => plans.push(plan),
            Err(StoreError::Serialization(e)) => warn!(error = %e, "Skipping undecodable plan row"),
            Err(e) => return Err(e),
        }
    }
    Ok(plans)
}

#[async_trait::async_trait]
impl Store for PgStore {
    async fn find_or_create_user(
        &self,
        external_id: &str,
        email: Option<&str>,
        name: Option<&str>,
    ) -> Result<User, StoreError> {
        let row = sqlx::query(
            r"
            INSERT INTO users (id, external_id, email, name, created_at)
            VALUES ($1, $2, $3, $4, now())
            ON CONFLICT (external_id) DO UPDATE SET
                email = COALESCE(users.email, EXCLUDED.email),
                name = COALESCE(users.name, EXCLUDED.name)
            RETURNING id, external_id, email, name, created_at
            ",
        )
        .bind(Uuid::new_v4())
        .bind(external_id)
        .bind(email)
        .bind(name)
        .fetch_one(&self.pool)
        .await?;

        user_from_row(&row)
    }

    async fn find_user_by_external_id(&self, external_id: &str) -> Result<Option<User>, StoreError> {
        sqlx::query("SELECT id, external_id, email, name, created_at FROM users WHERE external_id = $1")
            .bind(external_id)
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(user_from_row)
            .transpose()
    }

    async fn insert_plan(&self, plan: NewPlan) -> Result<Uuid, StoreError> {
        let id = Uuid::new_v4();
        sqlx::query(
            r"
            INSERT INTO plans (id, user_id, title, goal, tasks, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, now(), now())
            ",
        )
        .bind(id)
        .bind(plan.user_id)
        .bind(&plan.title)
        .bind(&plan.goal)
        .bind(Json(&plan.tasks))
        .execute(&self.pool)
        .await?;

        Ok(id)
    }

    async fn list_plans(&self, user_id: Uuid, limit: usize) -> Result<Vec<Plan>, StoreError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = sqlx::query(
            r"
            SELECT id, user_id, title, goal, tasks, created_at, updated_at
            FROM plans
            WHERE user_id = $1
            ORDER BY created_at DESC
            LIMIT $2
            ",
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        keep_decodable(rows.iter().map(plan_from_row))
    }

    async fn close(&self) {
        self.pool.close().await;
        info!("Database pool closed");
    }
}
