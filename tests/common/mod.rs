//! Shared helpers for integration tests

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, Response};
use jsonwebtoken::{Algorithm, EncodingKey, Header, jwk::JwkSet};
use serde_json::{Value, json};

use taskplan_gateway::auth::{
    AuthGate, IdentityProvider, KeyError, KeyResolver, KeySource, ResolverSettings, TokenVerifier,
};
use taskplan_gateway::config::AuthConfig;
use taskplan_gateway::gateway::AppState;
use taskplan_gateway::planner::{PlanError, PlanGenerator, Task};
use taskplan_gateway::store::InMemoryStore;

pub const ISSUER: &str = "https://good.example/";
pub const AUDIENCE: &str = "https://planner.example/api";
pub const SIGNING_KEY: &str = include_str!("../fixtures/signing_key.pem");
pub const OTHER_KEY: &str = include_str!("../fixtures/other_key.pem");

pub fn fixture_jwks() -> JwkSet {
    serde_json::from_str(include_str!("../fixtures/jwks.json")).unwrap()
}

pub fn rotated_jwks() -> JwkSet {
    serde_json::from_str(include_str!("../fixtures/rotated_jwks.json")).unwrap()
}

pub fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

pub fn claims_for(sub: &str) -> Value {
    json!({
        "iss": ISSUER,
        "aud": AUDIENCE,
        "sub": sub,
        "exp": now() + 300,
        "iat": now(),
        "email": format!("{sub}@example.com"),
    })
}

pub fn sign_with(pem: &str, kid: &str, claims: &Value) -> String {
    let mut header = Header::new(Algorithm::RS256);
    header.kid = Some(kid.to_string());
    jsonwebtoken::encode(&header, claims, &EncodingKey::from_rsa_pem(pem.as_bytes()).unwrap()).unwrap()
}

pub fn sign(claims: &Value) -> String {
    sign_with(SIGNING_KEY, "test-key-1", claims)
}

/// Serves the fixture key set (or fails), counting fetches.
pub struct CountingKeySource {
    pub fetches: AtomicUsize,
    pub fail: bool,
    pub delay: Duration,
}

impl CountingKeySource {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            fetches: AtomicUsize::new(0),
            fail: false,
            delay: Duration::ZERO,
        })
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            fetches: AtomicUsize::new(0),
            fail: true,
            delay: Duration::ZERO,
        })
    }

    pub fn slow(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            fetches: AtomicUsize::new(0),
            fail: false,
            delay,
        })
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl KeySource for CountingKeySource {
    async fn fetch(&self) -> Result<JwkSet, KeyError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.fail {
            return Err(KeyError::FetchFailed("connection refused".to_string()));
        }
        Ok(fixture_jwks())
    }

    fn describe(&self) -> String {
        "counting".to_string()
    }
}

/// Returns a fixed plan, or fails.
pub struct FakePlanner {
    pub fail: bool,
}

pub fn sample_tasks() -> Vec<Task> {
    vec![
        Task {
            task: "Outline chapters".to_string(),
            duration_days: 2,
            depends_on: vec![],
        },
        Task {
            task: "Write draft".to_string(),
            duration_days: 10,
            depends_on: vec!["Outline chapters".to_string()],
        },
    ]
}

#[async_trait]
impl PlanGenerator for FakePlanner {
    async fn generate(&self, _goal: &str) -> Result<Vec<Task>, PlanError> {
        if self.fail {
            Err(PlanError::NoTaskArray)
        } else {
            Ok(sample_tasks())
        }
    }
}

pub fn auth_config() -> AuthConfig {
    AuthConfig {
        issuer: ISSUER.to_string(),
        audience: AUDIENCE.to_string(),
        domain: "tenant.example.com".to_string(),
        client_id: "client-123".to_string(),
        client_secret: "s3cret".to_string(),
        redirect_uri: "http://localhost:8080/auth/callback".to_string(),
        frontend_url: "http://localhost:3000".to_string(),
        ..AuthConfig::default()
    }
}

pub fn gate_over(source: Arc<dyn KeySource>, issuer: &str) -> AuthGate {
    let resolver = KeyResolver::new(source, ResolverSettings::default());
    AuthGate::new(TokenVerifier::new(resolver, issuer, AUDIENCE), Duration::from_secs(2))
}

pub struct TestApp {
    pub state: Arc<AppState>,
    pub keys: Arc<CountingKeySource>,
}

impl TestApp {
    pub fn new() -> Self {
        Self::build(CountingKeySource::new(), ISSUER, false)
    }

    pub fn build(keys: Arc<CountingKeySource>, issuer: &str, planner_fails: bool) -> Self {
        Self::with_planner(keys, issuer, Arc::new(FakePlanner { fail: planner_fails }))
    }

    pub fn with_planner(keys: Arc<CountingKeySource>, issuer: &str, planner: Arc<dyn PlanGenerator>) -> Self {
        let state = Arc::new(AppState {
            store: Arc::new(InMemoryStore::new()),
            planner,
            provider: IdentityProvider::from_config(&auth_config()).unwrap(),
            gate: gate_over(keys.clone(), issuer),
            generation_timeout: Duration::from_secs(5),
        });
        Self { state, keys }
    }

    pub fn router(&self) -> axum::Router {
        taskplan_gateway::gateway::create_router(Arc::clone(&self.state))
    }
}

pub fn get(uri: &str, token: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().method("GET").uri(uri);
    if let Some(token) = token {
        builder = builder.header("authorization", format!("Bearer {token}"));
    }
    builder.body(Body::empty()).unwrap()
}

pub fn post_json(uri: &str, token: Option<&str>, body: &Value) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json");
    if let Some(token) = token {
        builder = builder.header("authorization", format!("Bearer {token}"));
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

pub async fn body_text(response: Response<Body>) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

pub async fn body_json(response: Response<Body>) -> Value {
    serde_json::from_str(&body_text(response).await).unwrap()
}
