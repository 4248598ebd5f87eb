//! Plan generation and history handlers

use std::sync::Arc;

use axum::{
    Json,
    extract::{State, rejection::JsonRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{info, warn};
use uuid::Uuid;

use super::error::ApiError;
use super::router::AppState;
use super::streaming::plan_event_stream;
use crate::auth::AuthenticatedUser;
use crate::planner::{PlanError, Task};
use crate::store::{NewPlan, StoreError};

const MAX_GOAL_CHARS: usize = 1000;
const MAX_TITLE_CHARS: usize = 200;
const HISTORY_LIMIT: usize = 100;

/// Shown to anonymous callers whose plan was not persisted.
pub(super) const NOT_SAVED_MESSAGE: &str = "Plan generated but not saved. Login to save your plans.";

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub(super) struct GenerateRequest {
    goal: String,
    title: String,
}

/// A request that passed validation.
#[derive(Debug, Clone)]
pub(super) struct PlanRequest {
    pub goal: String,
    pub title: String,
}

impl GenerateRequest {
    fn validate(self) -> Result<PlanRequest, ApiError> {
        let goal = self.goal.trim();
        if goal.is_empty() {
            return Err(ApiError::bad_request("goal_required"));
        }
        if goal.chars().count() > MAX_GOAL_CHARS {
            return Err(ApiError::bad_request("goal_too_long"));
        }

        let title = self.title.trim();
        if title.chars().count() > MAX_TITLE_CHARS {
            return Err(ApiError::bad_request("title_too_long"));
        }
        let title = if title.is_empty() {
            goal.chars().take(MAX_TITLE_CHARS).collect()
        } else {
            title.to_string()
        };

        Ok(PlanRequest {
            goal: goal.to_string(),
            title,
        })
    }
}

fn parse_request(body: Result<Json<GenerateRequest>, JsonRejection>) -> Result<PlanRequest, ApiError> {
    let Json(req) = body.map_err(|_| ApiError::bad_request("invalid_body"))?;
    req.validate()
}

/// Failure persisting a generated plan.
#[derive(Debug, thiserror::Error)]
pub(super) enum SaveError {
    #[error("user upsert failed: {0}")]
    UserUpsert(StoreError),
    #[error("save failed: {0}")]
    Save(StoreError),
}

impl SaveError {
    pub(super) fn code(&self) -> &'static str {
        match self {
            Self::UserUpsert(_) => "user_upsert_failed",
            Self::Save(_) => "save_failed",
        }
    }
}

/// Run the generator under the configured time bound.
pub(super) async fn generate_tasks(state: &AppState, goal: &str) -> Result<Vec<Task>, PlanError> {
    tokio::time::timeout(state.generation_timeout, state.planner.generate(goal))
        .await
        .map_err(|_| PlanError::Timeout)?
}

/// Upsert the caller and store the plan under their id.
pub(super) async fn save_plan(
    state: &AppState,
    user: &AuthenticatedUser,
    req: &PlanRequest,
    tasks: &[Task],
) -> Result<Uuid, SaveError> {
    let owner = state
        .store
        .find_or_create_user(
            &user.subject,
            user.claims.get_str("email"),
            user.claims.get_str("name"),
        )
        .await
        .map_err(SaveError::UserUpsert)?;

    let id = state
        .store
        .insert_plan(NewPlan {
            user_id: owner.id,
            title: req.title.clone(),
            goal: req.goal.clone(),
            tasks: tasks.to_vec(),
        })
        .await
        .map_err(SaveError::Save)?;

    info!(plan_id = %id, user_id = %owner.id, tasks = tasks.len(), "Plan saved");
    Ok(id)
}

/// POST /api/generate
pub(super) async fn generate_handler(
    State(state): State<Arc<AppState>>,
    user: Option<AuthenticatedUser>,
    body: Result<Json<GenerateRequest>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let req = parse_request(body)?;

    let tasks = generate_tasks(&state, &req.goal).await.map_err(|e| {
        warn!(error = %e, "Plan generation failed");
        ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "generation_failed").with_detail(e.public_detail())
    })?;

    let Some(user) = user else {
        return Ok(Json(json!({
            "plan": tasks,
            "saved": false,
            "message": NOT_SAVED_MESSAGE,
        })));
    };

    let id = save_plan(&state, &user, &req, &tasks)
        .await
        .map_err(|e| ApiError::internal(e.code(), e))?;

    Ok(Json(json!({ "plan": tasks, "id": id, "saved": true })))
}

/// POST /api/generate/stream
///
/// Validation failures are plain JSON errors; everything after that is
/// reported as SSE events.
pub(super) async fn generate_stream_handler(
    State(state): State<Arc<AppState>>,
    user: Option<AuthenticatedUser>,
    body: Result<Json<GenerateRequest>, JsonRejection>,
) -> Response {
    match parse_request(body) {
        Ok(req) => plan_event_stream(state, user, req).into_response(),
        Err(e) => e.into_response(),
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct HistoryEntry {
    id: Uuid,
    title: String,
    goal: String,
    plan: Vec<Task>,
    created_at: chrono::DateTime<chrono::Utc>,
    updated_at: chrono::DateTime<chrono::Utc>,
}

/// GET /api/history - the caller's most recent plans
pub(super) async fn history_handler(
    State(state): State<Arc<AppState>>,
    user: AuthenticatedUser,
) -> Result<Json<Value>, ApiError> {
    let Some(owner) = state
        .store
        .find_user_by_external_id(&user.subject)
        .await
        .map_err(|e| ApiError::internal("db_query_failed", e))?
    else {
        return Ok(Json(json!({ "plans": [] })));
    };

    let plans: Vec<HistoryEntry> = state
        .store
        .list_plans(owner.id, HISTORY_LIMIT)
        .await
        .map_err(|e| ApiError::internal("db_query_failed", e))?
        .into_iter()
        .map(|p| HistoryEntry {
            id: p.id,
            title: p.title,
            goal: p.goal,
            plan: p.tasks,
            created_at: p.created_at,
            updated_at: p.updated_at,
        })
        .collect();

    Ok(Json(json!({ "plans": plans })))
}
