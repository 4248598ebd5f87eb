//! Bearer authentication middleware and identity extractors.
//!
//! [`require_auth`] rejects requests without a valid token; [`optional_auth`]
//! lets requests without an `Authorization` header through anonymously.
//! Handlers read the identity with the [`AuthenticatedUser`] extractor, or
//! `Option<AuthenticatedUser>` on optionally authenticated routes.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json,
    extract::{FromRequestParts, OptionalFromRequestParts, Request, State},
    http::{HeaderMap, StatusCode, header, request::Parts},
    middleware::Next,
    response::{IntoResponse, Response},
};
use serde_json::json;
use tracing::{debug, warn};

use super::keys::{KeyError, KeyResolver};
use super::verifier::{Claims, TokenVerifier, VerifyError};
use crate::config::AuthConfig;

/// Identity established by the auth gate.
#[derive(Debug, Clone)]
pub struct AuthenticatedUser {
    /// Token subject (the IdP user id)
    pub subject: String,
    /// Verified claim set
    pub claims: Claims,
}

/// Why the gate refused a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthRejection {
    /// Missing or malformed header, or a token that failed verification.
    Unauthenticated,
    /// The token was well-formed and signed but expired.
    TokenExpired,
    /// Signing keys could not be loaded.
    ServiceUnavailable,
    /// A handler asked for an identity on a route that did not establish one.
    MissingIdentity,
}

impl AuthRejection {
    /// Status and error code for this rejection.
    #[must_use]
    pub fn parts(&self) -> (StatusCode, &'static str) {
        match self {
            Self::Unauthenticated => (StatusCode::UNAUTHORIZED, "unauthorized"),
            Self::TokenExpired => (StatusCode::UNAUTHORIZED, "token_expired"),
            Self::ServiceUnavailable => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "authentication_service_unavailable",
            ),
            Self::MissingIdentity => (StatusCode::UNAUTHORIZED, "unauthenticated"),
        }
    }
}

impl From<VerifyError> for AuthRejection {
    fn from(e: VerifyError) -> Self {
        match e {
            VerifyError::TokenExpired => Self::TokenExpired,
            _ => Self::Unauthenticated,
        }
    }
}

impl IntoResponse for AuthRejection {
    fn into_response(self) -> Response {
        let (status, code) = self.parts();
        let body = Json(json!({ "error": code }));
        if status == StatusCode::UNAUTHORIZED {
            (status, [(header::WWW_AUTHENTICATE, "Bearer")], body).into_response()
        } else {
            (status, body).into_response()
        }
    }
}

/// Shared state of the auth middleware.
#[derive(Clone)]
pub struct AuthGate {
    verifier: Arc<TokenVerifier>,
    init_timeout: Duration,
}

impl AuthGate {
    /// Gate over `verifier`; key loading is bounded by `init_timeout`.
    #[must_use]
    pub fn new(verifier: TokenVerifier, init_timeout: Duration) -> Self {
        Self {
            verifier: Arc::new(verifier),
            init_timeout,
        }
    }

    /// Gate fetching keys from the configured issuer.
    pub fn from_config(config: &AuthConfig) -> Result<Self, KeyError> {
        let resolver = KeyResolver::from_config(config)?;
        let verifier = TokenVerifier::new(resolver, &config.issuer, &config.audience);
        Ok(Self::new(verifier, config.init_timeout))
    }

    /// The key resolver, for lifecycle control.
    #[must_use]
    pub fn resolver(&self) -> &KeyResolver {
        self.verifier.resolver()
    }

    /// Authenticate a request from its headers.
    ///
    /// The header shape is checked before any key material is loaded.
    pub async fn authenticate(&self, headers: &HeaderMap) -> Result<AuthenticatedUser, AuthRejection> {
        let token = bearer_token(headers).ok_or(AuthRejection::Unauthenticated)?;

        match tokio::time::timeout(self.init_timeout, self.resolver().ensure_initialized()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(error = %e, "Signing keys unavailable");
                return Err(AuthRejection::ServiceUnavailable);
            }
            Err(_) => {
                warn!(timeout = ?self.init_timeout, "Signing key initialization timed out");
                return Err(AuthRejection::ServiceUnavailable);
            }
        }

        let verified = self.verifier.verify(token).await?;
        Ok(AuthenticatedUser {
            subject: verified.subject,
            claims: verified.claims,
        })
    }
}

/// `Bearer <token>`: case-sensitive scheme, one space, non-empty token.
fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    if scheme != "Bearer" || token.is_empty() || token.contains(' ') {
        return None;
    }
    Some(token)
}

/// Middleware rejecting unauthenticated requests.
pub async fn require_auth(State(gate): State<AuthGate>, mut request: Request, next: Next) -> Response {
    match gate.authenticate(request.headers()).await {
        Ok(user) => {
            debug!(subject = %user.subject, path = %request.uri().path(), "Authenticated request");
            request.extensions_mut().insert(user);
            next.run(request).await
        }
        Err(rejection) => {
            warn!(path = %request.uri().path(), reason = ?rejection, "Rejected request");
            rejection.into_response()
        }
    }
}

/// Middleware that authenticates when an `Authorization` header is present.
pub async fn optional_auth(State(gate): State<AuthGate>, request: Request, next: Next) -> Response {
    if !request.headers().contains_key(header::AUTHORIZATION) {
        return next.run(request).await;
    }
    require_auth(State(gate), request, next).await
}

impl<S> FromRequestParts<S> for AuthenticatedUser
where
    S: Send + Sync,
{
    type Rejection = AuthRejection;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<Self>()
            .cloned()
            .ok_or(AuthRejection::MissingIdentity)
    }
}

impl<S> OptionalFromRequestParts<S> for AuthenticatedUser
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Option<Self>, Self::Rejection> {
        Ok(parts.extensions.get::<Self>().cloned())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use axum::http::HeaderValue;
    use jsonwebtoken::jwk::JwkSet;
    use serde_json::json;

    use super::*;
    use crate::auth::keys::{KeySource, ResolverSettings, tests::fixture_jwks};
    use crate::auth::verifier::tests::{AUDIENCE, ISSUER, sign, valid_claims};

    struct CountingSource {
        fetches: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl KeySource for CountingSource {
        async fn fetch(&self) -> Result<JwkSet, KeyError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(KeyError::FetchFailed("connection refused".to_string()))
            } else {
                Ok(fixture_jwks())
            }
        }

        fn describe(&self) -> String {
            "counting".to_string()
        }
    }

    fn gate(fail: bool) -> (AuthGate, Arc<CountingSource>) {
        let source = Arc::new(CountingSource {
            fetches: AtomicUsize::new(0),
            fail,
        });
        let resolver = KeyResolver::new(source.clone(), ResolverSettings::default());
        let verifier = TokenVerifier::new(resolver, ISSUER, AUDIENCE);
        (AuthGate::new(verifier, Duration::from_secs(1)), source)
    }

    fn headers(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_str(value).unwrap());
        headers
    }

    #[test]
    fn bearer_token_shapes() {
        assert_eq!(bearer_token(&headers("Bearer abc.def.ghi")), Some("abc.def.ghi"));
        assert_eq!(bearer_token(&headers("bearer abc")), None);
        assert_eq!(bearer_token(&headers("Basic abc")), None);
        assert_eq!(bearer_token(&headers("Bearer")), None);
        assert_eq!(bearer_token(&headers("Bearer ")), None);
        assert_eq!(bearer_token(&headers("Bearer  abc")), None);
        assert_eq!(bearer_token(&headers("Bearer abc def")), None);
        assert_eq!(bearer_token(&HeaderMap::new()), None);
    }

    #[tokio::test]
    async fn malformed_header_never_fetches_keys() {
        // GIVEN: a gate whose key source counts fetches
        let (gate, source) = gate(false);

        // WHEN: requests arrive with unusable Authorization headers
        for value in ["", "Token abc", "Bearer", "Bearer ", "bearer abc"] {
            let err = gate.authenticate(&headers(value)).await.unwrap_err();
            assert_eq!(err, AuthRejection::Unauthenticated, "{value:?}");
        }
        assert_eq!(gate.authenticate(&HeaderMap::new()).await.unwrap_err(), AuthRejection::Unauthenticated);

        // THEN: no key fetch happened
        assert_eq!(source.fetches.load(Ordering::SeqCst), 0);
        assert!(!gate.resolver().is_initialized());
    }

    #[tokio::test]
    async fn valid_token_authenticates() {
        let (gate, source) = gate(false);
        let token = sign(&valid_claims());

        let user = gate.authenticate(&headers(&format!("Bearer {token}"))).await.unwrap();

        assert_eq!(user.subject, "auth0|alice");
        assert_eq!(source.fetches.load(Ordering::SeqCst), 1);
        gate.resolver().shutdown();
    }

    #[tokio::test]
    async fn expired_token_maps_to_token_expired() {
        let (gate, _) = gate(false);
        let mut claims = valid_claims();
        claims["exp"] = json!(chrono::Utc::now().timestamp() - 60);

        let err = gate
            .authenticate(&headers(&format!("Bearer {}", sign(&claims))))
            .await
            .unwrap_err();

        assert_eq!(err, AuthRejection::TokenExpired);
        assert_eq!(err.parts(), (StatusCode::UNAUTHORIZED, "token_expired"));
        gate.resolver().shutdown();
    }

    #[tokio::test]
    async fn key_fetch_failure_is_service_unavailable() {
        let (gate, _) = gate(true);
        let token = sign(&valid_claims());

        let err = gate.authenticate(&headers(&format!("Bearer {token}"))).await.unwrap_err();

        assert_eq!(err, AuthRejection::ServiceUnavailable);
        assert_eq!(err.parts().0, StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn unauthorized_response_carries_challenge() {
        let response = AuthRejection::Unauthenticated.into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(response.headers().get(header::WWW_AUTHENTICATE).unwrap(), "Bearer");

        let response = AuthRejection::ServiceUnavailable.into_response();
        assert!(response.headers().get(header::WWW_AUTHENTICATE).is_none());
    }
}
