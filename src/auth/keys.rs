//! Signing-key resolution: JWKS fetching, caching and background refresh.
//!
//! # Lifecycle
//!
//! 1. Nothing is fetched at construction. The first caller of
//!    [`KeyResolver::ensure_initialized`] performs the fetch while concurrent
//!    callers wait on the init lock; the second check under the lock keeps it
//!    to exactly one fetch.
//! 2. After the first successful fetch a refresh task replaces the key set
//!    every `refresh_interval`. Each attempt is bounded by `refresh_timeout`.
//!    A failed attempt is logged and the cached set stays in place.
//! 3. A lookup miss triggers a refresh. Misses are serialized on their own
//!    lock and re-check the cache first, so callers that queued behind a
//!    refresh which already brought the key in do not fetch again.
//! 4. [`KeyResolver::shutdown`] cancels the refresh task and clears the cache.
//!    Lookups after that fail with [`KeyError::KeyNotFound`].
//!
//! Readers clone an `Arc<KeySet>` under a short read lock; refreshes swap the
//! `Arc` under the write lock, so a reader sees the old set or the new one,
//! never a mix.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use jsonwebtoken::{
    DecodingKey,
    jwk::{AlgorithmParameters, JwkSet, PublicKeyUse},
};
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::AuthConfig;

/// Key resolution failures.
#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    /// No key with this `kid`, even after a refresh attempt.
    #[error("signing key not found: {0}")]
    KeyNotFound(String),

    /// The key set could not be fetched or contained no usable keys.
    #[error("JWKS fetch failed: {0}")]
    FetchFailed(String),

    /// The fetch did not complete within the configured timeout.
    #[error("JWKS fetch timed out after {0:?}")]
    Timeout(Duration),

    /// The resolver was shut down.
    #[error("key resolver is shut down")]
    Closed,
}

/// Where key sets come from.
#[async_trait]
pub trait KeySource: Send + Sync + 'static {
    /// Fetch the current key set.
    async fn fetch(&self) -> Result<JwkSet, KeyError>;

    /// Human-readable origin for log lines.
    fn describe(&self) -> String;
}

/// Fetches the JWKS document over HTTP(S).
pub struct HttpKeySource {
    url: String,
    http: reqwest::Client,
}

impl HttpKeySource {
    /// Build a source for `url`. With `require_https` the client refuses
    /// plain-HTTP URLs (including redirects to them).
    pub fn new(url: impl Into<String>, timeout: Duration, require_https: bool) -> Result<Self, KeyError> {
        let http = reqwest::Client::builder()
            .https_only(require_https)
            .timeout(timeout)
            .build()
            .map_err(|e| KeyError::FetchFailed(format!("HTTP client: {e}")))?;

        Ok(Self {
            url: url.into(),
            http,
        })
    }
}

#[async_trait]
impl KeySource for HttpKeySource {
    async fn fetch(&self) -> Result<JwkSet, KeyError> {
        debug!(url = %self.url, "Fetching JWKS");
        self.http
            .get(&self.url)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| KeyError::FetchFailed(e.to_string()))?
            .json::<JwkSet>()
            .await
            .map_err(|e| KeyError::FetchFailed(format!("invalid JWKS document: {e}")))
    }

    fn describe(&self) -> String {
        self.url.clone()
    }
}

/// A fixed key set, for deployments with pinned keys and for tests.
pub struct StaticKeySource {
    jwks: JwkSet,
}

impl StaticKeySource {
    /// Serve `jwks` on every fetch.
    #[must_use]
    pub fn new(jwks: JwkSet) -> Self {
        Self { jwks }
    }
}

#[async_trait]
impl KeySource for StaticKeySource {
    async fn fetch(&self) -> Result<JwkSet, KeyError> {
        Ok(self.jwks.clone())
    }

    fn describe(&self) -> String {
        "static".to_string()
    }
}

/// Verification keys indexed by `kid`.
#[derive(Clone, Default)]
pub struct KeySet {
    keys: HashMap<String, DecodingKey>,
}

impl KeySet {
    /// Admit RSA and EC signing keys that carry a `kid`; everything else is skipped.
    #[must_use]
    pub fn from_jwks(jwks: &JwkSet) -> Self {
        let mut keys = HashMap::with_capacity(jwks.keys.len());

        for jwk in &jwks.keys {
            let Some(kid) = jwk.common.key_id.as_deref().filter(|k| !k.is_empty()) else {
                debug!("Skipping JWK without kid");
                continue;
            };
            if matches!(jwk.common.public_key_use, Some(PublicKeyUse::Encryption)) {
                debug!(kid = %kid, "Skipping encryption JWK");
                continue;
            }

            let key = match &jwk.algorithm {
                AlgorithmParameters::RSA(rsa) => DecodingKey::from_rsa_components(&rsa.n, &rsa.e).ok(),
                AlgorithmParameters::EllipticCurve(ec) => DecodingKey::from_ec_components(&ec.x, &ec.y).ok(),
                _ => None,
            };

            match key {
                Some(key) => {
                    keys.insert(kid.to_string(), key);
                }
                None => debug!(kid = %kid, "Skipping unsupported or invalid JWK"),
            }
        }

        Self { keys }
    }

    /// Key for `kid`, if present.
    #[must_use]
    pub fn get(&self, kid: &str) -> Option<&DecodingKey> {
        self.keys.get(kid)
    }

    /// Number of usable keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// True when no usable key was found.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

impl fmt::Debug for KeySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut kids: Vec<&str> = self.keys.keys().map(String::as_str).collect();
        kids.sort_unstable();
        f.debug_struct("KeySet").field("kids", &kids).finish()
    }
}

/// Timing knobs for a [`KeyResolver`].
#[derive(Debug, Clone, Copy)]
pub struct ResolverSettings {
    /// Background refresh period.
    pub refresh_interval: Duration,
    /// Bound on a single fetch.
    pub refresh_timeout: Duration,
}

impl Default for ResolverSettings {
    fn default() -> Self {
        Self {
            refresh_interval: Duration::from_secs(3600),
            refresh_timeout: Duration::from_secs(10),
        }
    }
}

impl From<&AuthConfig> for ResolverSettings {
    fn from(config: &AuthConfig) -> Self {
        Self {
            refresh_interval: config.jwks_refresh_interval,
            refresh_timeout: config.jwks_refresh_timeout,
        }
    }
}

/// Lazily initialized, periodically refreshed `kid -> key` cache.
///
/// Cheap to clone; clones share the cache and the refresh task.
#[derive(Clone)]
pub struct KeyResolver {
    inner: Arc<Inner>,
}

struct Inner {
    source: Arc<dyn KeySource>,
    settings: ResolverSettings,
    keys: RwLock<Option<Arc<KeySet>>>,
    init_lock: tokio::sync::Mutex<()>,
    miss_lock: tokio::sync::Mutex<()>,
    refresh_task: Mutex<Option<JoinHandle<()>>>,
    shutdown: CancellationToken,
}

impl KeyResolver {
    /// Create a resolver over `source`. No fetch happens until first use.
    #[must_use]
    pub fn new(source: Arc<dyn KeySource>, settings: ResolverSettings) -> Self {
        Self {
            inner: Arc::new(Inner {
                source,
                settings,
                keys: RwLock::new(None),
                init_lock: tokio::sync::Mutex::new(()),
                miss_lock: tokio::sync::Mutex::new(()),
                refresh_task: Mutex::new(None),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Resolver fetching `<issuer>/.well-known/jwks.json` (or the configured override).
    pub fn from_config(config: &AuthConfig) -> Result<Self, KeyError> {
        let source = HttpKeySource::new(
            config.jwks_url(),
            config.jwks_refresh_timeout,
            config.require_https,
        )?;
        Ok(Self::new(Arc::new(source), ResolverSettings::from(config)))
    }

    /// Whether a key set is currently cached.
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.inner.keys.read().is_some()
    }

    /// Snapshot of the cached key set.
    #[must_use]
    pub fn current(&self) -> Option<Arc<KeySet>> {
        self.inner.keys.read().clone()
    }

    /// Fetch the key set if none is cached yet and start the refresh task.
    ///
    /// Concurrent first callers share one fetch. On failure nothing is
    /// cached, so the next caller tries again.
    pub async fn ensure_initialized(&self) -> Result<(), KeyError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(KeyError::Closed);
        }
        if self.is_initialized() {
            return Ok(());
        }

        let _guard = self.inner.init_lock.lock().await;

        if self.inner.shutdown.is_cancelled() {
            return Err(KeyError::Closed);
        }
        if self.is_initialized() {
            return Ok(());
        }

        let count = self.inner.refresh().await.inspect_err(|e| {
            warn!(source = %self.inner.source.describe(), error = %e, "Failed to initialize JWKS");
        })?;
        info!(source = %self.inner.source.describe(), keys = count, "JWKS initialized");

        self.spawn_refresh_task();
        Ok(())
    }

    /// Look up `kid`; on a miss, refresh and look again.
    ///
    /// Miss-triggered refreshes are single-flight: callers take the miss lock
    /// and re-check the cache before fetching.
    pub async fn resolve(&self, kid: &str) -> Result<DecodingKey, KeyError> {
        if let Some(key) = self.lookup(kid) {
            return Ok(key);
        }
        if self.inner.shutdown.is_cancelled() {
            return Err(KeyError::KeyNotFound(kid.to_string()));
        }

        let _guard = self.inner.miss_lock.lock().await;

        if let Some(key) = self.lookup(kid) {
            return Ok(key);
        }
        if self.inner.shutdown.is_cancelled() {
            return Err(KeyError::KeyNotFound(kid.to_string()));
        }

        debug!(kid = %kid, "Key not found in cached JWKS, refreshing");
        if let Err(e) = self.inner.refresh().await {
            warn!(kid = %kid, error = %e, "JWKS refresh for unknown kid failed");
        }

        self.lookup(kid)
            .ok_or_else(|| KeyError::KeyNotFound(kid.to_string()))
    }

    /// Fetch now and replace the cached set. The old set is kept on failure.
    pub async fn refresh(&self) -> Result<usize, KeyError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(KeyError::Closed);
        }
        self.inner.refresh().await
    }

    /// Stop background refresh and drop the cached keys.
    ///
    /// Safe to call while requests are in flight and more than once.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
        if let Some(handle) = self.inner.refresh_task.lock().take() {
            handle.abort();
        }
        *self.inner.keys.write() = None;
        info!("Key resolver shut down");
    }

    fn lookup(&self, kid: &str) -> Option<DecodingKey> {
        self.current().and_then(|set| set.get(kid).cloned())
    }

    fn spawn_refresh_task(&self) {
        let period = self.inner.settings.refresh_interval;
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let token = self.inner.shutdown.clone();

        let handle = tokio::spawn(async move {
            let mut interval = time::interval_at(time::Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut consecutive_failures: u32 = 0;

            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    _ = interval.tick() => {
                        let Some(inner) = weak.upgrade() else { break };
                        match inner.refresh().await {
                            Ok(count) => {
                                if consecutive_failures > 0 {
                                    info!(keys = count, after_failures = consecutive_failures, "JWKS refresh recovered");
                                } else {
                                    debug!(keys = count, "JWKS refreshed");
                                }
                                consecutive_failures = 0;
                            }
                            Err(e) => {
                                consecutive_failures += 1;
                                warn!(
                                    error = %e,
                                    consecutive_failures,
                                    "JWKS refresh failed, keeping cached keys"
                                );
                            }
                        }
                    }
                }
            }
            debug!("JWKS refresh task stopped");
        });

        *self.inner.refresh_task.lock() = Some(handle);
    }
}

impl Inner {
    async fn refresh(&self) -> Result<usize, KeyError> {
        let jwks = match time::timeout(self.settings.refresh_timeout, self.source.fetch()).await {
            Ok(result) => result?,
            Err(_) => return Err(KeyError::Timeout(self.settings.refresh_timeout)),
        };

        let set = KeySet::from_jwks(&jwks);
        if set.is_empty() {
            return Err(KeyError::FetchFailed("key set contains no usable signing keys".to_string()));
        }
        let count = set.len();

        let mut keys = self.keys.write();
        // a fetch that raced shutdown must not repopulate the cache
        if self.shutdown.is_cancelled() {
            return Err(KeyError::Closed);
        }
        *keys = Some(Arc::new(set));
        Ok(count)
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    pub(crate) fn fixture_jwks() -> JwkSet {
        serde_json::from_str(include_str!("../../tests/fixtures/jwks.json")).unwrap()
    }

    fn rotated_jwks() -> JwkSet {
        serde_json::from_str(include_str!("../../tests/fixtures/rotated_jwks.json")).unwrap()
    }

    /// Counts fetches; serves `responses` in order, repeating the last one.
    struct ScriptedSource {
        fetches: AtomicUsize,
        delay: Duration,
        responses: Vec<Option<JwkSet>>,
    }

    impl ScriptedSource {
        fn new(responses: Vec<Option<JwkSet>>) -> Self {
            Self {
                fetches: AtomicUsize::new(0),
                delay: Duration::ZERO,
                responses,
            }
        }

        fn fetches(&self) -> usize {
            self.fetches.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl KeySource for ScriptedSource {
        async fn fetch(&self) -> Result<JwkSet, KeyError> {
            let n = self.fetches.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                time::sleep(self.delay).await;
            }
            let idx = n.min(self.responses.len() - 1);
            self.responses[idx]
                .clone()
                .ok_or_else(|| KeyError::FetchFailed("scripted failure".to_string()))
        }

        fn describe(&self) -> String {
            "scripted".to_string()
        }
    }

    fn settings(refresh_interval: Duration) -> ResolverSettings {
        ResolverSettings {
            refresh_interval,
            refresh_timeout: Duration::from_secs(1),
        }
    }

    #[test]
    fn key_set_admits_rsa_keys_with_kid() {
        let set = KeySet::from_jwks(&fixture_jwks());
        assert_eq!(set.len(), 1);
        assert!(set.get("test-key-1").is_some());
        assert!(set.get("missing").is_none());
    }

    #[test]
    fn key_set_skips_symmetric_and_kidless_keys() {
        // GIVEN: an oct key and an RSA key without kid
        let jwks: JwkSet = serde_json::from_value(serde_json::json!({
            "keys": [
                { "kty": "oct", "kid": "hmac", "k": "c2VjcmV0" },
                { "kty": "RSA", "n": "AQAB", "e": "AQAB" }
            ]
        }))
        .unwrap();

        // THEN: neither is admitted
        assert!(KeySet::from_jwks(&jwks).is_empty());
    }

    #[tokio::test]
    async fn resolver_is_lazy() {
        let source = Arc::new(ScriptedSource::new(vec![Some(fixture_jwks())]));
        let resolver = KeyResolver::new(source.clone(), settings(Duration::from_secs(3600)));

        assert!(!resolver.is_initialized());
        assert_eq!(source.fetches(), 0);

        resolver.ensure_initialized().await.unwrap();
        assert!(resolver.is_initialized());
        assert_eq!(source.fetches(), 1);

        // second call is a no-op
        resolver.ensure_initialized().await.unwrap();
        assert_eq!(source.fetches(), 1);
        resolver.shutdown();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_first_use_fetches_once() {
        // GIVEN: a slow source and no cached keys
        let mut scripted = ScriptedSource::new(vec![Some(fixture_jwks())]);
        scripted.delay = Duration::from_millis(50);
        let source = Arc::new(scripted);
        let resolver = KeyResolver::new(source.clone(), settings(Duration::from_secs(3600)));

        // WHEN: 32 callers race on first use
        let mut handles = Vec::new();
        for _ in 0..32 {
            let r = resolver.clone();
            handles.push(tokio::spawn(async move { r.ensure_initialized().await }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }

        // THEN: exactly one outbound fetch
        assert_eq!(source.fetches(), 1);
        resolver.shutdown();
    }

    #[tokio::test]
    async fn failed_initialization_is_retried_by_next_caller() {
        let source = Arc::new(ScriptedSource::new(vec![None, Some(fixture_jwks())]));
        let resolver = KeyResolver::new(source.clone(), settings(Duration::from_secs(3600)));

        assert!(matches!(
            resolver.ensure_initialized().await,
            Err(KeyError::FetchFailed(_))
        ));
        assert!(!resolver.is_initialized());

        resolver.ensure_initialized().await.unwrap();
        assert_eq!(source.fetches(), 2);
        resolver.shutdown();
    }

    #[tokio::test]
    async fn slow_fetch_times_out() {
        let mut scripted = ScriptedSource::new(vec![Some(fixture_jwks())]);
        scripted.delay = Duration::from_millis(200);
        let resolver = KeyResolver::new(
            Arc::new(scripted),
            ResolverSettings {
                refresh_timeout: Duration::from_millis(20),
                ..settings(Duration::from_secs(3600))
            },
        );

        assert!(matches!(
            resolver.ensure_initialized().await,
            Err(KeyError::Timeout(_))
        ));
    }

    #[tokio::test]
    async fn refresh_failures_keep_cached_keys() {
        // GIVEN: the first fetch succeeds, every later one fails
        let source = Arc::new(ScriptedSource::new(vec![Some(fixture_jwks()), None]));
        let resolver = KeyResolver::new(source.clone(), settings(Duration::from_millis(10)));
        resolver.ensure_initialized().await.unwrap();

        // WHEN: at least three background refreshes fail
        let deadline = Instant::now() + Duration::from_secs(5);
        while source.fetches() < 4 && Instant::now() < deadline {
            time::sleep(Duration::from_millis(10)).await;
        }
        assert!(source.fetches() >= 4, "refresh task did not run");

        // THEN: existing kids still resolve
        assert!(resolver.resolve("test-key-1").await.is_ok());
        resolver.shutdown();
    }

    #[tokio::test]
    async fn unknown_kid_triggers_refresh_and_picks_up_rotation() {
        let source = Arc::new(ScriptedSource::new(vec![Some(fixture_jwks()), Some(rotated_jwks())]));
        let resolver = KeyResolver::new(source.clone(), settings(Duration::from_secs(3600)));
        resolver.ensure_initialized().await.unwrap();

        assert!(resolver.resolve("rotated-key").await.is_ok());
        assert_eq!(source.fetches(), 2);
        resolver.shutdown();
    }

    #[tokio::test]
    async fn bogus_kid_does_not_block_rotated_key() {
        // GIVEN: the issuer rotates right after a miss for an unknown kid
        let source = Arc::new(ScriptedSource::new(vec![
            Some(fixture_jwks()),
            Some(fixture_jwks()),
            Some(rotated_jwks()),
        ]));
        let resolver = KeyResolver::new(source.clone(), settings(Duration::from_secs(3600)));
        resolver.ensure_initialized().await.unwrap();

        // WHEN: a bogus kid misses, then the rotated kid arrives
        assert!(matches!(resolver.resolve("nope").await, Err(KeyError::KeyNotFound(_))));
        let rotated = resolver.resolve("rotated-key").await;

        // THEN: each miss refreshed and the rotated key resolves
        assert!(rotated.is_ok());
        assert_eq!(source.fetches(), 3);
        resolver.shutdown();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_misses_for_rotated_key_share_one_fetch() {
        // GIVEN: a slow source that serves the rotated set after init
        let mut scripted = ScriptedSource::new(vec![Some(fixture_jwks()), Some(rotated_jwks())]);
        scripted.delay = Duration::from_millis(30);
        let source = Arc::new(scripted);
        let resolver = KeyResolver::new(source.clone(), settings(Duration::from_secs(3600)));
        resolver.ensure_initialized().await.unwrap();

        // WHEN: 16 callers miss on the new kid at once
        let mut handles = Vec::new();
        for _ in 0..16 {
            let r = resolver.clone();
            handles.push(tokio::spawn(async move { r.resolve("rotated-key").await.is_ok() }));
        }
        for h in handles {
            assert!(h.await.unwrap());
        }

        // THEN: the first refresh served everyone queued behind it
        assert_eq!(source.fetches(), 2);
        resolver.shutdown();
    }

    #[tokio::test]
    async fn shutdown_clears_cache_and_rejects_late_use() {
        let source = Arc::new(ScriptedSource::new(vec![Some(fixture_jwks())]));
        let resolver = KeyResolver::new(source.clone(), settings(Duration::from_secs(3600)));
        resolver.ensure_initialized().await.unwrap();

        resolver.shutdown();
        resolver.shutdown();

        assert!(!resolver.is_initialized());
        assert!(matches!(resolver.resolve("test-key-1").await, Err(KeyError::KeyNotFound(_))));
        assert!(matches!(resolver.ensure_initialized().await, Err(KeyError::Closed)));
        assert_eq!(source.fetches(), 1);
    }
}
