//! Bearer token verification.
//!
//! # Verification flow
//!
//! Checks run in order and stop at the first failure:
//!
//! 1. Well-formed: three segments, decodable header carrying a `kid`.
//! 2. Signature: key resolved by `kid`, signature verified with the header
//!    algorithm (asymmetric algorithms only).
//! 3. Issuer: `iss` equals the configured issuer, ignoring trailing `/`.
//! 4. Audience: `aud` (string or list) contains the configured audience.
//! 5. Expiry: `exp` present and strictly in the future. No leeway.
//! 6. Subject: `sub` present and non-empty.

use jsonwebtoken::{Algorithm, Validation, errors::ErrorKind};
use serde::{Deserialize, Deserializer, Serialize};
use tracing::debug;

use super::keys::KeyResolver;

/// Why a token was rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VerifyError {
    /// Not a compact JWS with a `kid`, or the payload is not a claim object.
    #[error("malformed token")]
    MalformedToken,
    /// Unknown key, unsupported algorithm, or a signature that does not verify.
    #[error("invalid signature")]
    InvalidSignature,
    /// `iss` does not match.
    #[error("issuer mismatch")]
    IssuerMismatch,
    /// `aud` does not contain the expected audience.
    #[error("audience mismatch")]
    AudienceMismatch,
    /// `exp` missing or not after now.
    #[error("token expired")]
    TokenExpired,
    /// `sub` missing or empty.
    #[error("missing subject")]
    MissingSubject,
}

impl VerifyError {
    /// Client-visible error code. Only expiry is distinguishable.
    #[must_use]
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::TokenExpired => "token_expired",
            _ => "unauthorized",
        }
    }
}

/// The `aud` claim: a single string, a list, or something unusable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Audience {
    /// `"aud": "api"`
    Single(String),
    /// `"aud": ["api", "userinfo"]`
    Many(Vec<String>),
    /// Any other JSON shape. Never matches.
    Other(serde_json::Value),
}

impl Audience {
    /// Whether `expected` is the audience or one of the audiences.
    #[must_use]
    pub fn contains(&self, expected: &str) -> bool {
        match self {
            Self::Single(aud) => aud == expected,
            Self::Many(auds) => auds.iter().any(|aud| aud == expected),
            Self::Other(_) => false,
        }
    }
}

/// Claim set of a verified token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claims {
    /// Issuer
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
    /// Subject
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,
    /// Audience
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aud: Option<Audience>,
    /// Expiry (Unix seconds)
    #[serde(default, deserialize_with = "numeric_date", skip_serializing_if = "Option::is_none")]
    pub exp: Option<i64>,
    /// Issued-at (Unix seconds)
    #[serde(default, deserialize_with = "numeric_date", skip_serializing_if = "Option::is_none")]
    pub iat: Option<i64>,
    /// Everything else (`scope`, `email`, `azp`, provider-specific claims)
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Claims {
    /// A string-valued non-standard claim.
    #[must_use]
    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.extra.get(name).and_then(serde_json::Value::as_str)
    }
}

/// NumericDate may be encoded as an integer or a float.
fn numeric_date<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    let number = Option::<serde_json::Number>::deserialize(deserializer)?;
    #[allow(clippy::cast_possible_truncation)]
    Ok(number.and_then(|n| n.as_i64().or_else(|| n.as_f64().map(|f| f as i64))))
}

/// Outcome of a successful verification.
#[derive(Debug, Clone)]
pub struct VerifiedToken {
    /// The `sub` claim
    pub subject: String,
    /// The full claim set
    pub claims: Claims,
}

/// Verifies bearer tokens against one issuer/audience pair.
pub struct TokenVerifier {
    resolver: KeyResolver,
    issuer: String,
    audience: String,
}

impl TokenVerifier {
    /// Create a verifier. Keys come from `resolver`.
    #[must_use]
    pub fn new(resolver: KeyResolver, issuer: impl Into<String>, audience: impl Into<String>) -> Self {
        Self {
            resolver,
            issuer: issuer.into(),
            audience: audience.into(),
        }
    }

    /// The key resolver backing this verifier.
    #[must_use]
    pub fn resolver(&self) -> &KeyResolver {
        &self.resolver
    }

    /// Verify `token` and return its subject and claims.
    pub async fn verify(&self, token: &str) -> Result<VerifiedToken, VerifyError> {
        if token.is_empty() || token.split('.').count() != 3 {
            return Err(VerifyError::MalformedToken);
        }
        let header = jsonwebtoken::decode_header(token).map_err(|_| VerifyError::MalformedToken)?;
        let kid = header
            .kid
            .as_deref()
            .filter(|kid| !kid.is_empty())
            .ok_or(VerifyError::MalformedToken)?;

        let Some(alg) = supported_algorithm(header.alg) else {
            debug!(alg = ?header.alg, "Rejecting token with unsupported algorithm");
            return Err(VerifyError::InvalidSignature);
        };
        let key = self.resolver.resolve(kid).await.map_err(|e| {
            debug!(kid = %kid, error = %e, "No verification key for token");
            VerifyError::InvalidSignature
        })?;

        let claims = jsonwebtoken::decode::<Claims>(token, &key, &signature_only(alg))
            .map_err(|e| classify(e.kind()))?
            .claims;

        self.check_claims(claims, chrono::Utc::now().timestamp())
    }

    /// Steps 3-6 against an already signature-checked claim set.
    pub(crate) fn check_claims(&self, claims: Claims, now: i64) -> Result<VerifiedToken, VerifyError> {
        match claims.iss.as_deref() {
            Some(iss) if normalize_issuer(iss) == normalize_issuer(&self.issuer) => {}
            _ => return Err(VerifyError::IssuerMismatch),
        }

        if !claims.aud.as_ref().is_some_and(|aud| aud.contains(&self.audience)) {
            return Err(VerifyError::AudienceMismatch);
        }

        match claims.exp {
            Some(exp) if exp > now => {}
            _ => return Err(VerifyError::TokenExpired),
        }

        let subject = match claims.sub.as_deref() {
            Some(sub) if !sub.is_empty() => sub.to_string(),
            _ => return Err(VerifyError::MissingSubject),
        };

        Ok(VerifiedToken { subject, claims })
    }
}

fn normalize_issuer(issuer: &str) -> &str {
    issuer.trim_end_matches('/')
}

fn supported_algorithm(alg: Algorithm) -> Option<Algorithm> {
    match alg {
        Algorithm::RS256
        | Algorithm::RS384
        | Algorithm::RS512
        | Algorithm::PS256
        | Algorithm::PS384
        | Algorithm::PS512
        | Algorithm::ES256
        | Algorithm::ES384 => Some(alg),
        _ => None,
    }
}

/// Signature verification only; claims are checked by [`TokenVerifier::check_claims`].
fn signature_only(alg: Algorithm) -> Validation {
    let mut v = Validation::new(alg);
    v.validate_exp = false;
    v.validate_nbf = false;
    v.validate_aud = false;
    v.required_spec_claims.clear();
    v.leeway = 0;
    v
}

fn classify(kind: &ErrorKind) -> VerifyError {
    match kind {
        ErrorKind::InvalidToken | ErrorKind::Base64(_) | ErrorKind::Json(_) | ErrorKind::Utf8(_) => {
            VerifyError::MalformedToken
        }
        _ => VerifyError::InvalidSignature,
    }
}
