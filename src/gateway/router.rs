//! HTTP router and shared state

use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router, middleware,
    routing::{get, post},
};
use serde_json::{Value, json};
use tower_http::{
    catch_panic::CatchPanicLayer,
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};

use super::{account, plans};
use crate::auth::{AuthGate, IdentityProvider, optional_auth, require_auth};
use crate::planner::PlanGenerator;
use crate::store::Store;

/// Shared application state
pub struct AppState {
    /// User and plan persistence
    pub store: Arc<dyn Store>,
    /// Plan generator
    pub planner: Arc<dyn PlanGenerator>,
    /// Identity provider client for the login flow
    pub provider: IdentityProvider,
    /// Bearer authentication
    pub gate: AuthGate,
    /// Upper bound on one plan generation
    pub generation_timeout: Duration,
}

/// Create the router
///
/// Routes fall in three groups: public, optionally authenticated (plans are
/// saved only for identified callers) and authenticated.
pub fn create_router(state: Arc<AppState>) -> Router {
    let public = Router::new()
        .route("/health", get(health_handler))
        .route("/auth/login", get(account::login_handler))
        .route("/auth/callback", get(account::callback_handler))
        .route("/auth/refresh", post(account::refresh_handler))
        .route("/auth/logout", get(account::logout_handler));

    let optional = Router::new()
        .route("/api/generate", post(plans::generate_handler))
        .route("/api/generate/stream", post(plans::generate_stream_handler))
        .route_layer(middleware::from_fn_with_state(state.gate.clone(), optional_auth));

    let protected = Router::new()
        .route("/auth/profile", get(account::profile_handler))
        .route("/api/history", get(plans::history_handler))
        .route_layer(middleware::from_fn_with_state(state.gate.clone(), require_auth));

    public
        .merge(optional)
        .merge(protected)
        .layer(CatchPanicLayer::new())
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(TraceLayer::new_for_http())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
        .with_state(state)
}

/// Health check handler
async fn health_handler() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "timestamp": chrono::Utc::now().timestamp(),
        "service": env!("CARGO_PKG_NAME"),
    }))
}
