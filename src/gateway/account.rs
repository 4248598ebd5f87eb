//! Login flow, token refresh and profile handlers

use std::sync::Arc;

use axum::{
    Json,
    extract::{Query, State, rejection::JsonRejection},
    http::StatusCode,
    response::Redirect,
};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{error, info, warn};

use super::error::ApiError;
use super::router::AppState;
use crate::auth::{AuthenticatedUser, Connection};

#[derive(Debug, Deserialize)]
pub(super) struct LoginParams {
    provider: Option<String>,
}

/// GET /auth/login - authorize URL for the chosen social connection
pub(super) async fn login_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<LoginParams>,
) -> Result<Json<Value>, ApiError> {
    let provider = params.provider.as_deref().unwrap_or("google");
    let connection = Connection::parse(provider).map_err(|_| ApiError::bad_request("invalid_provider"))?;
    let login = state
        .provider
        .login_url(connection)
        .map_err(|e| ApiError::internal("login_url_failed", e))?;

    Ok(Json(json!({ "auth_url": login.auth_url, "state": login.state })))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub(super) struct CallbackParams {
    code: String,
    state: String,
    error: String,
    error_description: String,
}

/// GET /auth/callback - finish the login and hand the token to the frontend
pub(super) async fn callback_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<CallbackParams>,
) -> Result<Redirect, ApiError> {
    let provider = &state.provider;

    if !params.error.is_empty() {
        warn!(error = %params.error, description = %params.error_description, "Login failed at provider");
        return Ok(Redirect::to(&provider.error_redirect(&params.error)));
    }
    if params.code.is_empty() {
        return Err(ApiError::bad_request("authorization_code_required"));
    }
    if params.state.is_empty() {
        return Err(ApiError::bad_request("state_parameter_required"));
    }

    let tokens = match provider.exchange_code(&params.code).await {
        Ok(tokens) => tokens,
        Err(e) => {
            error!(error = %e, "Failed to exchange code for token");
            return Ok(Redirect::to(&provider.error_redirect("token_exchange_failed")));
        }
    };

    let info = match provider.user_info(&tokens.access_token).await {
        Ok(info) => info,
        Err(e) => {
            error!(error = %e, "Failed to fetch user info");
            return Ok(Redirect::to(&provider.error_redirect("user_info_failed")));
        }
    };

    let user = match state
        .store
        .find_or_create_user(&info.sub, info.email.as_deref(), info.name.as_deref())
        .await
    {
        Ok(user) => user,
        Err(e) => {
            error!(error = %e, "Failed to create or find user");
            return Ok(Redirect::to(&provider.error_redirect("user_creation_failed")));
        }
    };

    info!(user_id = %user.id, "User logged in");
    let summary = json!({ "id": user.id, "email": user.email, "name": user.name });
    Ok(Redirect::to(&provider.success_redirect(&tokens.access_token, &summary)))
}

#[derive(Debug, Deserialize)]
pub(super) struct RefreshRequest {
    #[serde(default)]
    refresh_token: String,
}

/// POST /auth/refresh - redeem a refresh token
pub(super) async fn refresh_handler(
    State(state): State<Arc<AppState>>,
    body: Result<Json<RefreshRequest>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let Json(req) = body.map_err(|_| ApiError::bad_request("invalid_request_body"))?;
    if req.refresh_token.is_empty() {
        return Err(ApiError::bad_request("refresh_token_required"));
    }

    let tokens = state.provider.refresh(&req.refresh_token).await.map_err(|e| {
        warn!(error = %e, "Token refresh failed");
        ApiError::new(StatusCode::UNAUTHORIZED, "invalid_refresh_token")
    })?;

    Ok(Json(json!({
        "access_token": tokens.access_token,
        "token_type": tokens.token_type,
        "expires_in": tokens.expires_in,
    })))
}

/// GET /auth/logout - provider logout URL
pub(super) async fn logout_handler(State(state): State<Arc<AppState>>) -> Result<Json<Value>, ApiError> {
    let logout_url = state
        .provider
        .logout_url()
        .map_err(|e| ApiError::internal("logout_url_failed", e))?;
    Ok(Json(json!({ "logout_url": logout_url })))
}

/// GET /auth/profile - the caller's stored profile
pub(super) async fn profile_handler(
    State(state): State<Arc<AppState>>,
    user: AuthenticatedUser,
) -> Result<Json<Value>, ApiError> {
    let stored = state
        .store
        .find_user_by_external_id(&user.subject)
        .await
        .map_err(|e| ApiError::internal("db_query_failed", e))?
        .ok_or_else(|| ApiError::new(StatusCode::NOT_FOUND, "user_not_found"))?;

    Ok(Json(json!({
        "user": {
            "id": stored.id,
            "email": stored.email,
            "name": stored.name,
            "created_at": stored.created_at,
        }
    })))
}
