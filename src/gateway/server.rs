//! Gateway server

use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::router::{AppState, create_router};
use crate::auth::{AuthGate, IdentityProvider};
use crate::config::Config;
use crate::planner::GeminiPlanner;
use crate::store::{InMemoryStore, PgStore, Store};
use crate::{Error, Result};

/// Task planning API server
pub struct Gateway {
    /// Configuration
    config: Config,
    /// Shared handler state
    state: Arc<AppState>,
}

impl Gateway {
    /// Create a new gateway: connect the store and build the auth gate.
    ///
    /// Signing keys are not fetched here; the first authenticated request
    /// loads them.
    pub async fn new(config: Config) -> Result<Self> {
        let store: Arc<dyn Store> = match config.database.url.as_deref() {
            Some(url) => {
                let pg = PgStore::connect(url, &config.database)
                    .await
                    .map_err(|e| Error::Database(e.to_string()))?;
                if config.database.run_migrations {
                    pg.migrate().await?;
                    info!("Database migrations applied");
                }
                Arc::new(pg)
            }
            None => {
                warn!("No database configured - plans are kept in memory only");
                Arc::new(InMemoryStore::new())
            }
        };

        let gate = AuthGate::from_config(&config.auth).map_err(|e| Error::Config(e.to_string()))?;
        let provider =
            IdentityProvider::from_config(&config.auth).map_err(|e| Error::Config(e.to_string()))?;
        let planner = GeminiPlanner::new(&config.planner).map_err(|e| Error::Config(e.to_string()))?;

        let state = Arc::new(AppState {
            store,
            planner: Arc::new(planner),
            provider,
            gate,
            generation_timeout: config.planner.generation_timeout,
        });

        Ok(Self { config, state })
    }

    /// Run until SIGINT/SIGTERM, then drain and release resources
    pub async fn run(self) -> Result<()> {
        let addr = SocketAddr::new(
            self.config
                .server
                .host
                .parse()
                .map_err(|e| Error::Config(format!("Invalid host: {e}")))?,
            self.config.server.port,
        );

        let app = create_router(Arc::clone(&self.state));
        let listener = TcpListener::bind(addr).await?;

        info!("============================================================");
        info!("TASKPLAN GATEWAY v{}", env!("CARGO_PKG_VERSION"));
        info!("============================================================");
        info!(host = %self.config.server.host, port = %self.config.server.port, "Listening");
        info!(issuer = %self.config.auth.issuer, audience = %self.config.auth.audience, "Bearer authentication");
        info!(jwks = %self.config.auth.jwks_url(), "Signing keys load on first authenticated request");

        let shutdown = CancellationToken::new();
        let server = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
            .into_future();

        let drain_timeout = self.config.server.shutdown_timeout;
        tokio::select! {
            result = server => result.map_err(|e| Error::Internal(e.to_string()))?,
            () = async {
                shutdown.cancelled().await;
                tokio::time::sleep(drain_timeout).await;
            } => {
                warn!(timeout = ?drain_timeout, "In-flight requests did not drain in time");
            }
        }

        info!("Shutting down key resolver and store...");
        self.state.gate.resolver().shutdown();
        self.state.store.close().await;

        Ok(())
    }
}

/// Shutdown signal handler
async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
    shutdown.cancel();
}
