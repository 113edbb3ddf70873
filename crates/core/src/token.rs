//! Storage access tokens
//!
//! Tokens are scoped to `(tenant, subproject, readonly)` and fetched from a
//! [`CredentialSource`]. The [`AccessTokenCache`] is shared by all chunk workers
//! of a session; concurrent callers that find the token expired trigger a
//! single refresh.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use jiff::Timestamp;
use tokio::sync::{Mutex, RwLock};

use crate::error::{Error, Result};

/// Lifetime assumed for a freshly issued storage token
pub const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(3000);

/// Tokens this close to expiry are treated as expired
const EXPIRY_MARGIN: Duration = Duration::from_secs(30);

/// What a token grants access to
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TokenScope {
    pub tenant: String,
    pub subproject: String,
    pub readonly: bool,
}

impl TokenScope {
    pub fn new(tenant: impl Into<String>, subproject: impl Into<String>, readonly: bool) -> Self {
        Self {
            tenant: tenant.into(),
            subproject: subproject.into(),
            readonly,
        }
    }
}

/// A short-lived storage credential
#[derive(Clone)]
pub struct AccessToken {
    pub value: String,
    pub scope: TokenScope,
    pub expires_at: Timestamp,
    /// Fetch counter of the cache that issued the token
    pub generation: u64,
}

impl AccessToken {
    pub fn is_expired(&self) -> bool {
        match Timestamp::now().checked_add(EXPIRY_MARGIN) {
            Ok(deadline) => deadline >= self.expires_at,
            Err(_) => true,
        }
    }
}

impl std::fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessToken")
            .field("value", &"<redacted>")
            .field("scope", &self.scope)
            .field("expires_at", &self.expires_at)
            .field("generation", &self.generation)
            .finish()
    }
}

/// Issues provider credentials for a scope
///
/// For Azure the value is a SAS URL, for Google an OAuth bearer token, for the
/// S3 family a `access_key:secret[:session_token]` triple.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CredentialSource: Send + Sync {
    async fn storage_access_token(&self, scope: &TokenScope) -> Result<String>;
}

/// Credential source that always returns the same value
#[derive(Clone)]
pub struct StaticCredentials {
    value: String,
}

impl StaticCredentials {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
        }
    }
}

#[async_trait]
impl CredentialSource for StaticCredentials {
    async fn storage_access_token(&self, _scope: &TokenScope) -> Result<String> {
        if self.value.is_empty() {
            return Err(Error::Auth("no storage access token configured".to_string()));
        }
        Ok(self.value.clone())
    }
}

/// Session-wide token cache with single-flight refresh
pub struct AccessTokenCache {
    source: Arc<dyn CredentialSource>,
    scope: TokenScope,
    ttl: Duration,
    current: RwLock<Option<AccessToken>>,
    refresh_lock: Mutex<()>,
    generation: AtomicU64,
}

impl AccessTokenCache {
    pub fn new(source: Arc<dyn CredentialSource>, scope: TokenScope) -> Self {
        Self::with_ttl(source, scope, DEFAULT_TOKEN_TTL)
    }

    pub fn with_ttl(source: Arc<dyn CredentialSource>, scope: TokenScope, ttl: Duration) -> Self {
        Self {
            source,
            scope,
            ttl,
            current: RwLock::new(None),
            refresh_lock: Mutex::new(()),
            generation: AtomicU64::new(0),
        }
    }

    pub fn scope(&self) -> &TokenScope {
        &self.scope
    }

    /// Generation of the most recently fetched token; 0 before the first fetch
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    async fn fresh(&self) -> Option<AccessToken> {
        let current = self.current.read().await;
        current
            .as_ref()
            .filter(|token| !token.is_expired())
            .cloned()
    }

    /// Return a valid token, fetching a new one if needed
    pub async fn get(&self) -> Result<AccessToken> {
        if let Some(token) = self.fresh().await {
            return Ok(token);
        }

        let _guard = self.refresh_lock.lock().await;
        // Another worker may have refreshed while we waited
        if let Some(token) = self.fresh().await {
            return Ok(token);
        }

        tracing::debug!(
            tenant = %self.scope.tenant,
            subproject = %self.scope.subproject,
            readonly = self.scope.readonly,
            "Fetching storage access token"
        );
        let value = self.source.storage_access_token(&self.scope).await?;
        let expires_at = Timestamp::now()
            .checked_add(self.ttl)
            .map_err(|e| Error::General(format!("token expiry out of range: {e}")))?;
        let token = AccessToken {
            value,
            scope: self.scope.clone(),
            expires_at,
            generation: self.generation.fetch_add(1, Ordering::SeqCst) + 1,
        };
        *self.current.write().await = Some(token.clone());

        Ok(token)
    }

    /// Drop the cached token if it is still the one issued as `generation`
    ///
    /// Workers that hit an auth error with the same token all call this; only
    /// the first one clears it, so the source is asked once.
    pub async fn invalidate(&self, generation: u64) {
        let mut current = self.current.write().await;
        if current
            .as_ref()
            .is_some_and(|token| token.generation == generation)
        {
            *current = None;
        }
    }
}

impl std::fmt::Debug for AccessTokenCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessTokenCache")
            .field("scope", &self.scope)
            .field("ttl", &self.ttl)
            .field("generation", &self.generation())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct CountingSource {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl CredentialSource for CountingSource {
        async fn storage_access_token(&self, _scope: &TokenScope) -> Result<String> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            Ok(format!("token-{n}"))
        }
    }

    fn scope() -> TokenScope {
        TokenScope::new("tenant", "sub", false)
    }

    #[tokio::test]
    async fn test_cache_reuses_valid_token() {
        let mut source = MockCredentialSource::new();
        source
            .expect_storage_access_token()
            .times(1)
            .returning(|_| Ok("abc".to_string()));
        let cache = AccessTokenCache::new(Arc::new(source), scope());

        assert_eq!(cache.get().await.unwrap().value, "abc");
        let again = cache.get().await.unwrap();
        assert_eq!(again.value, "abc");
        assert_eq!(again.generation, 1);
        assert_eq!(cache.generation(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_refresh_is_single_flight() {
        let source = Arc::new(CountingSource {
            calls: AtomicUsize::new(0),
        });
        let cache = Arc::new(AccessTokenCache::new(source.clone(), scope()));

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let cache = cache.clone();
                tokio::spawn(async move { cache.get().await.unwrap().value })
            })
            .collect();
        for task in tasks {
            assert_eq!(task.await.unwrap(), "token-0");
        }

        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_expired_token_is_refreshed() {
        let source = Arc::new(CountingSource {
            calls: AtomicUsize::new(0),
        });
        let cache = AccessTokenCache::with_ttl(source.clone(), scope(), Duration::ZERO);

        assert_eq!(cache.get().await.unwrap().value, "token-0");
        assert_eq!(cache.get().await.unwrap().value, "token-1");
        assert_eq!(cache.generation(), 2);
    }

    #[tokio::test]
    async fn test_invalidate_only_matching_generation() {
        let source = Arc::new(CountingSource {
            calls: AtomicUsize::new(0),
        });
        let cache = AccessTokenCache::new(source.clone(), scope());

        let seen = cache.get().await.unwrap().generation;

        cache.invalidate(seen).await;
        assert_eq!(cache.get().await.unwrap().value, "token-1");

        // Stale generation is ignored
        cache.invalidate(seen).await;
        assert_eq!(cache.get().await.unwrap().value, "token-1");
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_static_credentials() {
        let creds = StaticCredentials::new("sas");
        assert_eq!(creds.storage_access_token(&scope()).await.unwrap(), "sas");

        let empty = StaticCredentials::new("");
        assert!(matches!(
            empty.storage_access_token(&scope()).await,
            Err(Error::Auth(_))
        ));
    }

    #[test]
    fn test_token_debug_redacts_value() {
        let token = AccessToken {
            value: "secret".to_string(),
            scope: scope(),
            expires_at: Timestamp::now(),
            generation: 1,
        };
        assert!(!format!("{token:?}").contains("secret"));
        assert!(token.is_expired());
    }
}
