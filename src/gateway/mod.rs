//! HTTP server: routing, handlers and process lifecycle

mod account;
mod error;
mod plans;
mod router;
mod server;
mod streaming;

pub use error::ApiError;
pub use router::{AppState, create_router};
pub use server::Gateway;
