//! Sharded cache for minted tokens.
//!
//! Keys are [`TokenUid`]s; the shard is chosen from the UID's hash so
//! unrelated identities do not contend on one mutex. A fetched token must
//! have at least `min_lifetime` remaining, otherwise it is evicted and
//! treated as absent. Background GC walks the shards on a ticker, collecting
//! expired keys first and deleting them in a second pass.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use vouch_core::apimetrics;

use crate::lookup::{TokenLookup, TokenUid};

const SHARD_COUNT: usize = 16;

const CACHE_NAME: &str = "tokens";

/// A token that was minted before, with its originating lookup.
#[derive(Debug, Clone)]
pub struct CachedToken {
    pub token: String,
    pub lookup: TokenLookup,
    pub expires: DateTime<Utc>,
}

/// Sharded map of previously minted tokens.
pub struct TokenCache {
    shards: [Mutex<HashMap<TokenUid, CachedToken>>; SHARD_COUNT],
    min_lifetime: Duration,
    gc_interval: Duration,
    shutdown: watch::Sender<bool>,
    gc_started: AtomicBool,
}

impl TokenCache {
    /// Creates a cache. `min_lifetime` is the smallest remaining validity a
    /// fetched token may have; `gc_interval` drives the background sweep
    /// (zero disables it).
    pub fn new(gc_interval: Duration, min_lifetime: Duration) -> Arc<Self> {
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            shards: std::array::from_fn(|_| Mutex::new(HashMap::new())),
            min_lifetime,
            gc_interval,
            shutdown,
            gc_started: AtomicBool::new(false),
        })
    }

    fn shard(&self, uid: &TokenUid) -> &Mutex<HashMap<TokenUid, CachedToken>> {
        &self.shards[(uid.digest() % SHARD_COUNT as u64) as usize]
    }

    /// Returns the cached token for a lookup, or `None`.
    ///
    /// Tokens expiring within `min_lifetime` are evicted on fetch. A stored
    /// entry whose lookup does not deep-equal the probe is a hash collision:
    /// it is evicted, logged, and reported as a miss.
    pub fn get(&self, lookup: &TokenLookup) -> Option<CachedToken> {
        let uid = lookup.uid();
        let mut shard = self
            .shard(&uid)
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let Some(entry) = shard.get(&uid) else {
            apimetrics::cache_miss(CACHE_NAME);
            return None;
        };

        let min_remaining = chrono::Duration::from_std(self.min_lifetime)
            .unwrap_or_else(|_| chrono::Duration::zero());
        if Utc::now() + min_remaining >= entry.expires {
            debug!(uid = %uid, "removing expired, or about to expire, token upon fetch");
            shard.remove(&uid);
            apimetrics::cache_miss(CACHE_NAME);
            return None;
        }

        if !lookup.matches(&entry.lookup) {
            warn!(uid = %uid, "token cache collision detected");
            shard.remove(&uid);
            apimetrics::cache_collision(CACHE_NAME);
            apimetrics::cache_miss(CACHE_NAME);
            return None;
        }

        apimetrics::cache_hit(CACHE_NAME);
        Some(entry.clone())
    }

    /// Stores a token valid until the given instant.
    pub fn store_until(
        &self,
        lookup: TokenLookup,
        token: String,
        expires: DateTime<Utc>,
    ) -> CachedToken {
        let uid = lookup.uid();
        let entry = CachedToken {
            token,
            lookup,
            expires,
        };
        self.shard(&uid)
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(uid, entry.clone());
        apimetrics::cache_set(CACHE_NAME);
        entry
    }

    /// Stores a token valid until an RFC 3339 timestamp.
    ///
    /// If the timestamp does not parse, the token is returned as already
    /// expired and not cached.
    pub fn store_until_rfc3339(
        &self,
        lookup: TokenLookup,
        token: String,
        expires: &str,
    ) -> CachedToken {
        match DateTime::parse_from_rfc3339(expires) {
            Ok(parsed) => self.store_until(lookup, token, parsed.with_timezone(&Utc)),
            Err(err) => {
                warn!(expires, error = %err, "token carried an unparseable expiry, not caching");
                CachedToken {
                    token,
                    lookup,
                    expires: Utc::now(),
                }
            }
        }
    }

    /// Stores a token valid for the given duration from now.
    pub fn store_for(&self, lookup: TokenLookup, token: String, valid: Duration) -> CachedToken {
        let valid =
            chrono::Duration::from_std(valid).unwrap_or_else(|_| chrono::Duration::zero());
        self.store_until(lookup, token, Utc::now() + valid)
    }

    /// Removes expired entries from every shard.
    ///
    /// Expired keys are collected first and deleted in a second pass so the
    /// map is never mutated mid-iteration.
    pub fn gc(&self) {
        let now = Utc::now();
        for shard in &self.shards {
            let mut shard = shard.lock().unwrap_or_else(PoisonError::into_inner);

            let stale: Vec<TokenUid> = shard
                .iter()
                .filter(|(_, entry)| now > entry.expires)
                .map(|(uid, _)| *uid)
                .collect();
            for uid in stale {
                shard.remove(&uid);
            }
        }
    }

    /// Spawns the background GC task. Idempotent; a zero interval disables
    /// collection entirely.
    pub fn start_gc(self: &Arc<Self>) -> bool {
        if self.gc_interval.is_zero() {
            return false;
        }
        if self
            .gc_started
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }
        let _ = self.shutdown.send(false);
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut shutdown_rx = cache.shutdown.subscribe();
            let mut ticker = tokio::time::interval(cache.gc_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick of a tokio interval fires immediately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => cache.gc(),
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            info!("token cache GC shutting down");
                            return;
                        }
                    }
                }
            }
        });
        true
    }

    /// Stops the background GC task. Idempotent.
    pub fn stop_gc(&self) {
        self.gc_started.store(false, Ordering::SeqCst);
        let _ = self.shutdown.send(true);
    }

    /// Total number of cached entries across all shards.
    pub fn len(&self) -> usize {
        self.shards
            .iter()
            .map(|s| s.lock().unwrap_or_else(PoisonError::into_inner).len())
            .sum()
    }

    /// True if no entries are cached.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for TokenCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenCache")
            .field("entries", &self.len())
            .field("min_lifetime", &self.min_lifetime)
            .field("gc_interval", &self.gc_interval)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{HostIdentity, SourceIdentity};
    use crate::lookup::TokenKind;

    fn identity() -> SourceIdentity {
        SourceIdentity::Host(HostIdentity {
            bound_gsa: "test@gcp.com".into(),
        })
    }

    #[test]
    fn test_store_and_get() {
        let cache = TokenCache::new(Duration::ZERO, Duration::ZERO);

        let lookups = [
            TokenLookup::new(TokenKind::Access, identity()),
            TokenLookup::with_audience(TokenKind::Access, identity(), "audience".into()),
            TokenLookup::with_scopes_and_audiences(
                TokenKind::Access,
                identity(),
                vec!["scope".into()],
                vec!["audience".into()],
            ),
            TokenLookup::new(TokenKind::Id, identity()),
        ];

        for (i, lookup) in lookups.iter().enumerate() {
            cache.store_until(
                lookup.clone(),
                format!("token-{i}"),
                Utc::now() + chrono::Duration::minutes(1),
            );
        }

        for (i, lookup) in lookups.iter().enumerate() {
            let entry = cache.get(lookup).expect("token cached");
            assert_eq!(entry.token, format!("token-{i}"));
        }
    }

    #[test]
    fn test_expired_token_absent_on_fetch() {
        let cache = TokenCache::new(Duration::ZERO, Duration::ZERO);
        let lookup = TokenLookup::new(TokenKind::Access, identity());

        cache.store_until(
            lookup.clone(),
            "stale".into(),
            Utc::now() - chrono::Duration::seconds(1),
        );
        assert!(cache.get(&lookup).is_none());
        // A second fetch after eviction must not panic.
        assert!(cache.get(&lookup).is_none());
    }

    #[test]
    fn test_min_lifetime_floor() {
        // min lifetime 5s, token expires in 1s: treated as absent.
        let cache = TokenCache::new(Duration::ZERO, Duration::from_secs(5));
        let lookup = TokenLookup::new(TokenKind::Access, identity());

        cache.store_until(
            lookup.clone(),
            "short".into(),
            Utc::now() + chrono::Duration::seconds(1),
        );
        assert!(cache.get(&lookup).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_fetched_token_satisfies_min_lifetime() {
        let cache = TokenCache::new(Duration::ZERO, Duration::from_secs(5));
        let lookup = TokenLookup::new(TokenKind::Access, identity());

        cache.store_until(
            lookup.clone(),
            "long".into(),
            Utc::now() + chrono::Duration::minutes(10),
        );
        let entry = cache.get(&lookup).expect("token cached");
        assert!(entry.expires - Utc::now() >= chrono::Duration::seconds(5));
    }

    #[test]
    fn test_gc_removes_expired() {
        let cache = TokenCache::new(Duration::ZERO, Duration::ZERO);
        let fresh = TokenLookup::new(TokenKind::Access, identity());
        let stale = TokenLookup::new(TokenKind::Id, identity());

        cache.store_until(
            fresh.clone(),
            "fresh".into(),
            Utc::now() + chrono::Duration::minutes(1),
        );
        cache.store_until(
            stale.clone(),
            "stale".into(),
            Utc::now() - chrono::Duration::seconds(1),
        );

        cache.gc();
        assert_eq!(cache.len(), 1);
        assert!(cache.get(&fresh).is_some());
    }

    #[test]
    fn test_store_until_rfc3339_rejects_garbage() {
        let cache = TokenCache::new(Duration::ZERO, Duration::ZERO);
        let lookup = TokenLookup::new(TokenKind::Access, identity());

        let entry = cache.store_until_rfc3339(lookup.clone(), "token".into(), "not-a-time");
        assert_eq!(entry.token, "token");
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_background_gc() {
        let cache = TokenCache::new(Duration::from_millis(50), Duration::ZERO);
        let lookup = TokenLookup::new(TokenKind::Access, identity());
        cache.store_until(
            lookup,
            "stale".into(),
            Utc::now() + chrono::Duration::milliseconds(50),
        );

        assert!(cache.start_gc());
        assert!(!cache.start_gc());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(cache.is_empty());
        cache.stop_gc();
    }
}
