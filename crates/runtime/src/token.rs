//! Bearer-token plumbing.
//!
//! The provider itself (OAuth flows, on-disk credential encoding) lives
//! outside this crate; channels consume it through the [`TokenProvider`]
//! seam. [`TokenSource`] adds the single-flight refresh discipline: when a
//! refresh is already in flight, concurrent callers await it instead of
//! issuing their own.

use crate::error::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Freshness margin subtracted from a token's expiry before reuse.
const EXPIRY_MARGIN_SECS: u64 = 60;

/// A bearer token for one account.
#[derive(Debug, Clone)]
pub struct AccessToken {
    pub secret: String,
    /// Unix expiry time. Tokens without one are never cached.
    pub expires_at: Option<u64>,
    /// Scopes granted to the token, when the provider reports them.
    pub scopes: Vec<String>,
}

impl AccessToken {
    /// Whether the token is still usable at `now` with margin to spare.
    pub fn is_fresh(&self, now: u64) -> bool {
        match self.expires_at {
            Some(expires_at) => now + EXPIRY_MARGIN_SECS < expires_at,
            None => false,
        }
    }
}

/// Supplies a currently-valid bearer token for an account, refreshing on
/// demand.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn access_token(&self, account: &str) -> Result<AccessToken>;
}

/// Caching, single-flight wrapper around a [`TokenProvider`].
///
/// Channels call [`TokenSource::token`] before every connection attempt; a
/// fresh cached token is served without a provider round-trip, and expiry is
/// re-checked per call so no attempt runs on a token older than one fetch.
pub struct TokenSource {
    provider: Arc<dyn TokenProvider>,
    refresh: tokio::sync::Mutex<()>,
    cached: Mutex<HashMap<String, AccessToken>>,
}

impl TokenSource {
    pub fn new(provider: Arc<dyn TokenProvider>) -> Self {
        Self {
            provider,
            refresh: tokio::sync::Mutex::new(()),
            cached: Mutex::new(HashMap::new()),
        }
    }

    pub async fn token(&self, account: &str) -> Result<AccessToken> {
        if let Some(token) = self.fresh_cached(account) {
            return Ok(token);
        }

        let _refresh = self.refresh.lock().await;

        // A refresh that completed while we waited satisfies this call too.
        if let Some(token) = self.fresh_cached(account) {
            return Ok(token);
        }

        tracing::debug!(target: "cgpu.token", account, "refreshing access token");
        let token = self.provider.access_token(account).await.map_err(|err| {
            if matches!(err, Error::Token(_)) {
                err
            } else {
                Error::Token(err.to_string())
            }
        })?;

        if token.expires_at.is_some() {
            self.cached
                .lock()
                .insert(account.to_string(), token.clone());
        }

        Ok(token)
    }

    /// Drop any cached token for the account, forcing the next call through
    /// the provider.
    pub fn invalidate(&self, account: &str) {
        self.cached.lock().remove(account);
    }

    fn fresh_cached(&self, account: &str) -> Option<AccessToken> {
        let cached = self.cached.lock();
        let token = cached.get(account)?;
        token.is_fresh(now_ts()).then(|| token.clone())
    }
}

pub(crate) fn now_ts() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingProvider {
        calls: AtomicU32,
        expires_at: Option<u64>,
    }

    #[async_trait]
    impl TokenProvider for CountingProvider {
        async fn access_token(&self, _account: &str) -> Result<AccessToken> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            // Yield so concurrent callers pile up on the refresh lock.
            tokio::task::yield_now().await;
            Ok(AccessToken {
                secret: "tok".into(),
                expires_at: self.expires_at,
                scopes: vec![],
            })
        }
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_refresh() {
        let provider = Arc::new(CountingProvider {
            calls: AtomicU32::new(0),
            expires_at: Some(now_ts() + 3600),
        });
        let source = Arc::new(TokenSource::new(provider.clone()));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let source = Arc::clone(&source);
            handles.push(tokio::spawn(
                async move { source.token("acct").await.unwrap() },
            ));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn tokens_without_expiry_are_fetched_every_time() {
        let provider = Arc::new(CountingProvider {
            calls: AtomicU32::new(0),
            expires_at: None,
        });
        let source = TokenSource::new(provider.clone());

        source.token("acct").await.unwrap();
        source.token("acct").await.unwrap();

        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn invalidate_forces_refresh() {
        let provider = Arc::new(CountingProvider {
            calls: AtomicU32::new(0),
            expires_at: Some(now_ts() + 3600),
        });
        let source = TokenSource::new(provider.clone());

        source.token("acct").await.unwrap();
        source.token("acct").await.unwrap();
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);

        source.invalidate("acct");
        source.token("acct").await.unwrap();
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn freshness_respects_margin() {
        let token = AccessToken {
            secret: "tok".into(),
            expires_at: Some(1_000),
            scopes: vec![],
        };
        assert!(token.is_fresh(1_000 - EXPIRY_MARGIN_SECS - 1));
        assert!(!token.is_fresh(1_000 - EXPIRY_MARGIN_SECS));
        assert!(!token.is_fresh(2_000));
    }
}
