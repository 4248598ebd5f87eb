//! Task planning API
//!
//! Bearer-token authentication against an OpenID Connect issuer, plan
//! generation through a hosted model, and per-user plan history.
//!
//! # Features
//!
//! - **Auth gate**: lazy JWKS loading, background key refresh, strict claim checks
//! - **Login flow**: authorize/callback/refresh/logout against the identity provider
//! - **Plans**: JSON and SSE generation endpoints, history backed by Postgres
//!   or an in-memory store

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod auth;
pub mod cli;
pub mod config;
pub mod error;
pub mod gateway;
pub mod planner;
pub mod store;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => subscriber
            .with(fmt::layer().json())
            .try_init()
            .map_err(|e| Error::Internal(e.to_string())),
        _ => subscriber
            .with(fmt::layer())
            .try_init()
            .map_err(|e| Error::Internal(e.to_string())),
    }
}
