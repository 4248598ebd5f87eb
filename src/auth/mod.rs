//! Bearer-token authentication against an OpenID Connect issuer.
//!
//! - [`keys`]: signing-key resolution and caching
//! - [`verifier`]: token signature and claim checks
//! - [`middleware`]: axum gate and identity extractors
//! - [`provider`]: login, refresh and logout against the identity provider

pub mod keys;
pub mod middleware;
pub mod provider;
pub mod verifier;

pub use keys::{HttpKeySource, KeyError, KeyResolver, KeySet, KeySource, ResolverSettings, StaticKeySource};
pub use middleware::{AuthGate, AuthRejection, AuthenticatedUser, optional_auth, require_auth};
pub use provider::{Connection, IdentityProvider, ProviderError};
pub use verifier::{Audience, Claims, TokenVerifier, VerifiedToken, VerifyError};
