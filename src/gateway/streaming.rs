//! Server-sent event stream for plan generation
//!
//! Event sequence:
//!
//! - `status`, then `error` if generation fails
//! - otherwise `progress`, `plan`, then one of
//!   `saved` + `complete`, `warning` + `complete` (save failed) or
//!   `info` + `complete` (anonymous caller)

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use async_stream::stream;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::Stream;
use serde_json::{Value, json};
use tracing::warn;

use super::plans::{NOT_SAVED_MESSAGE, PlanRequest, generate_tasks, save_plan};
use super::router::AppState;
use crate::auth::AuthenticatedUser;

const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);

fn event(name: &str, data: &Value) -> Result<Event, Infallible> {
    Ok(Event::default().event(name).data(data.to_string()))
}

/// Generate (and, for identified callers, save) a plan, reporting progress
/// as SSE events.
///
/// Takes owned data to satisfy Rust 2024 lifetime capture rules for `impl Stream`.
pub(super) fn plan_event_stream(
    state: Arc<AppState>,
    user: Option<AuthenticatedUser>,
    req: PlanRequest,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let stream = stream! {
        yield event("status", &json!({ "message": "Starting plan generation..." }));

        let tasks = match generate_tasks(&state, &req.goal).await {
            Ok(tasks) => tasks,
            Err(e) => {
                warn!(error = %e, "Streaming plan generation failed");
                yield event("error", &json!({ "error": "generation_failed", "detail": e.public_detail() }));
                return;
            }
        };

        yield event("progress", &json!({ "message": "Plan generated successfully!" }));
        yield event("plan", &json!({ "plan": tasks }));

        match user {
            Some(user) => match save_plan(&state, &user, &req, &tasks).await {
                Ok(id) => {
                    yield event("saved", &json!({ "id": id, "message": "Plan saved successfully!" }));
                    yield event("complete", &json!({ "saved": true }));
                }
                Err(e) => {
                    warn!(error = %e, "Failed to save streamed plan");
                    yield event("warning", &json!({ "message": "Plan generated but not saved", "error": e.code() }));
                    yield event("complete", &json!({ "saved": false }));
                }
            },
            None => {
                yield event("info", &json!({ "message": NOT_SAVED_MESSAGE }));
                yield event("complete", &json!({ "saved": false }));
            }
        }
    };

    Sse::new(stream).keep_alive(KeepAlive::new().interval(KEEP_ALIVE_INTERVAL).text("ping"))
}
