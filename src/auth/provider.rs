//! Identity provider client for the browser login flow.
//!
//! Builds authorize/logout URLs and proxies the code and refresh grants to
//! the provider's `/oauth/token` endpoint.

use std::time::Duration;

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use rand::RngExt;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;
use url::Url;

use crate::config::AuthConfig;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Identity provider errors.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// Login requested for a connection we do not offer.
    #[error("invalid provider: {0}")]
    InvalidProvider(String),

    /// The provider answered with an OAuth error body.
    #[error("provider rejected request: {error} - {description}")]
    Rejected {
        /// `error`
        error: String,
        /// `error_description`
        description: String,
    },

    /// Non-success status without an OAuth error body.
    #[error("provider returned HTTP {0}")]
    Status(StatusCode),

    /// Transport or decoding failure.
    #[error("provider request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Configured URL could not be built.
    #[error("invalid provider URL: {0}")]
    Url(#[from] url::ParseError),
}

/// Social connections offered at login.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connection {
    /// Google
    Google,
    /// GitHub
    GitHub,
}

impl Connection {
    /// Parse the `provider` query value.
    pub fn parse(provider: &str) -> Result<Self, ProviderError> {
        match provider {
            "google" => Ok(Self::Google),
            "github" => Ok(Self::GitHub),
            other => Err(ProviderError::InvalidProvider(other.to_string())),
        }
    }

    /// Connection name understood by the provider.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Google => "google-oauth2",
            Self::GitHub => "github",
        }
    }
}

/// Authorize URL plus the state value embedded in it.
#[derive(Debug, Clone, Serialize)]
pub struct LoginUrl {
    /// URL to send the browser to
    pub auth_url: String,
    /// Opaque state value
    pub state: String,
}

/// Token endpoint response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenResponse {
    /// Access token
    pub access_token: String,
    /// Refresh token, when offline access was granted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    /// Usually `Bearer`
    #[serde(default)]
    pub token_type: String,
    /// Lifetime in seconds
    #[serde(default)]
    pub expires_in: u64,
}

/// `/userinfo` response.
#[derive(Debug, Clone, Deserialize)]
pub struct UserInfo {
    /// Subject
    pub sub: String,
    /// Email address
    #[serde(default)]
    pub email: Option<String>,
    /// Display name
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
    #[serde(default)]
    error_description: String,
}

/// Client for the identity provider's OAuth endpoints.
#[derive(Clone)]
pub struct IdentityProvider {
    http: Client,
    base_url: String,
    client_id: String,
    client_secret: String,
    redirect_uri: String,
    frontend_url: String,
}

impl IdentityProvider {
    /// Build from the auth configuration. `domain` may omit the scheme.
    pub fn from_config(config: &AuthConfig) -> Result<Self, ProviderError> {
        let http = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        let domain = config.domain.trim_end_matches('/');
        let base_url = if domain.starts_with("http://") || domain.starts_with("https://") {
            domain.to_string()
        } else {
            format!("https://{domain}")
        };

        Ok(Self {
            http,
            base_url,
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
            redirect_uri: config.redirect_uri.clone(),
            frontend_url: config.frontend_url.trim_end_matches('/').to_string(),
        })
    }

    /// Authorize URL for `connection` with a fresh state value.
    pub fn login_url(&self, connection: Connection) -> Result<LoginUrl, ProviderError> {
        let state = generate_state();
        let mut url = Url::parse(&format!("{}/authorize", self.base_url))?;
        url.query_pairs_mut()
            .append_pair("response_type", "code")
            .append_pair("client_id", &self.client_id)
            .append_pair("redirect_uri", &self.redirect_uri)
            .append_pair("scope", "openid profile email")
            .append_pair("state", &state)
            .append_pair("connection", connection.as_str());

        Ok(LoginUrl {
            auth_url: url.into(),
            state,
        })
    }

    /// Exchange an authorization code for tokens.
    pub async fn exchange_code(&self, code: &str) -> Result<TokenResponse, ProviderError> {
        self.token_request(json!({
            "grant_type": "authorization_code",
            "client_id": self.client_id,
            "client_secret": self.client_secret,
            "code": code,
            "redirect_uri": self.redirect_uri,
        }))
        .await
    }

    /// Redeem a refresh token.
    pub async fn refresh(&self, refresh_token: &str) -> Result<TokenResponse, ProviderError> {
        self.token_request(json!({
            "grant_type": "refresh_token",
            "client_id": self.client_id,
            "client_secret": self.client_secret,
            "refresh_token": refresh_token,
        }))
        .await
    }

    /// Profile of the user owning `access_token`.
    pub async fn user_info(&self, access_token: &str) -> Result<UserInfo, ProviderError> {
        let response = self
            .http
            .get(format!("{}/userinfo", self.base_url))
            .bearer_auth(access_token)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(ProviderError::Status(status));
        }
        Ok(response.json().await?)
    }

    /// Provider logout URL returning to the frontend.
    pub fn logout_url(&self) -> Result<String, ProviderError> {
        let mut url = Url::parse(&format!("{}/v2/logout", self.base_url))?;
        url.query_pairs_mut()
            .append_pair("client_id", &self.client_id)
            .append_pair("returnTo", &self.frontend_url);
        Ok(url.into())
    }

    /// Frontend page reporting a failed login.
    #[must_use]
    pub fn error_redirect(&self, error: &str) -> String {
        let mut url = format!("{}/auth/error?error=", self.frontend_url);
        url.extend(url::form_urlencoded::byte_serialize(error.as_bytes()));
        url
    }

    /// Frontend page receiving the access token and user summary.
    #[must_use]
    pub fn success_redirect(&self, access_token: &str, user: &serde_json::Value) -> String {
        let user = user.to_string();
        url::form_urlencoded::Serializer::new(format!("{}/auth/success?", self.frontend_url))
            .append_pair("token", access_token)
            .append_pair("user", &user)
            .finish()
    }

    async fn token_request(&self, body: serde_json::Value) -> Result<TokenResponse, ProviderError> {
        let response = self
            .http
            .post(format!("{}/oauth/token", self.base_url))
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            debug!(status = %status, "Token endpoint returned an error");
            return Err(match serde_json::from_str::<ErrorBody>(&text) {
                Ok(body) => ProviderError::Rejected {
                    error: body.error,
                    description: body.error_description,
                },
                Err(_) => ProviderError::Status(status),
            });
        }

        Ok(response.json().await?)
    }
}

/// 32 random bytes, base64url without padding.
fn generate_state() -> String {
    let state_bytes: [u8; 32] = rand::rng().random();
    URL_SAFE_NO_PAD.encode(state_bytes)
}
