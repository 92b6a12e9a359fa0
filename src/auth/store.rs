//! In-memory bearer token store with time-ordered expiry.
//!
//! Raw tokens are never kept: records are keyed by the SHA-256 digest of the
//! token string. Expiry is tracked in a min-heap and removed by a single
//! periodic [`TokenStore::sweep`]; lookups also refuse records whose deadline
//! has passed so a token is never honoured past its TTL between sweeps.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use sha2::{Digest, Sha256};
use tokio::time::Instant;
use uuid::Uuid;

/// Trust tier of a token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenClass {
    /// Long-lived login token for the API and `/ws`.
    Session,
    /// Short-lived token accepted only by the terminal proxy mount.
    Proxy,
}

/// What a valid token resolves to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenInfo {
    pub username: String,
    pub class: TokenClass,
}

type TokenDigest = [u8; 32];

struct TokenRecord {
    info: TokenInfo,
    expires_at: Instant,
}

#[derive(Default)]
struct Inner {
    tokens: HashMap<TokenDigest, TokenRecord>,
    expiries: BinaryHeap<Reverse<(Instant, TokenDigest)>>,
}

/// Process-wide token map. All mutation happens under one short-lived lock
/// that is never held across an `.await`.
#[derive(Default)]
pub struct TokenStore {
    inner: Mutex<Inner>,
}

impl TokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Mint a random opaque token for `username` valid for `ttl`.
    pub fn issue(&self, username: &str, class: TokenClass, ttl: Duration) -> String {
        let token = generate_token();
        let digest = digest(&token);
        let expires_at = Instant::now() + ttl;

        let mut inner = self.lock();
        inner.tokens.insert(
            digest,
            TokenRecord {
                info: TokenInfo {
                    username: username.to_string(),
                    class,
                },
                expires_at,
            },
        );
        inner.expiries.push(Reverse((expires_at, digest)));
        token
    }

    /// Resolve a token. Unknown and expired tokens yield `None`; an expired
    /// record found here is dropped immediately.
    pub fn lookup(&self, token: &str) -> Option<TokenInfo> {
        let digest = digest(token);
        let mut inner = self.lock();
        let expired = match inner.tokens.get(&digest) {
            None => return None,
            Some(record) => record.expires_at <= Instant::now(),
        };
        if expired {
            inner.tokens.remove(&digest);
            return None;
        }
        inner.tokens.get(&digest).map(|r| r.info.clone())
    }

    /// Remove a token. Returns whether it was present.
    ///
    /// The heap entry is left behind and discarded by the next sweep.
    pub fn revoke(&self, token: &str) -> bool {
        self.lock().tokens.remove(&digest(token)).is_some()
    }

    /// Drop every token whose deadline is at or before `now`. Returns the
    /// number of live records removed.
    pub fn sweep(&self, now: Instant) -> usize {
        let mut inner = self.lock();
        let mut removed = 0;
        while let Some(Reverse((deadline, digest))) = inner.expiries.peek().copied() {
            if deadline > now {
                break;
            }
            inner.expiries.pop();
            // A revoked token's digest may have been reissued; only remove the
            // record this heap entry was scheduled for.
            let scheduled = inner
                .tokens
                .get(&digest)
                .is_some_and(|r| r.expires_at == deadline);
            if scheduled {
                inner.tokens.remove(&digest);
                removed += 1;
            }
        }
        removed
    }

    /// Number of stored (possibly not yet swept) tokens.
    pub fn len(&self) -> usize {
        self.lock().tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// 32 random bytes (two v4 UUIDs), base64url without padding.
fn generate_token() -> String {
    let mut bytes = [0u8; 32];
    bytes[..16].copy_from_slice(Uuid::new_v4().as_bytes());
    bytes[16..].copy_from_slice(Uuid::new_v4().as_bytes());
    URL_SAFE_NO_PAD.encode(bytes)
}

fn digest(token: &str) -> TokenDigest {
    let mut out = [0u8; 32];
    out.copy_from_slice(&Sha256::digest(token.as_bytes()));
    out
}

pub(crate) fn now_ms() -> u64 {
    #[allow(clippy::cast_possible_truncation)]
    let ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as u64);
    ms
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOUR: Duration = Duration::from_secs(3600);

    #[test]
    fn test_tokens_are_random_and_opaque() {
        let store = TokenStore::new();
        let a = store.issue("alice", TokenClass::Session, HOUR);
        let b = store.issue("alice", TokenClass::Session, HOUR);
        assert_ne!(a, b);
        assert_eq!(a.len(), 43);
        assert!(!a.contains("alice"));
    }

    #[tokio::test]
    async fn test_lookup_returns_owner_and_class() {
        let store = TokenStore::new();
        let token = store.issue("alice", TokenClass::Proxy, HOUR);
        assert_eq!(
            store.lookup(&token),
            Some(TokenInfo {
                username: "alice".to_string(),
                class: TokenClass::Proxy,
            })
        );
        assert!(store.lookup("not-a-token").is_none());
    }

    #[tokio::test]
    async fn test_revoke_is_idempotent() {
        let store = TokenStore::new();
        let token = store.issue("alice", TokenClass::Session, HOUR);
        assert!(store.revoke(&token));
        assert!(!store.revoke(&token));
        assert!(store.lookup(&token).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_lookup_refuses_expired_before_sweep() {
        let store = TokenStore::new();
        let token = store.issue("alice", TokenClass::Proxy, Duration::from_secs(300));
        tokio::time::advance(Duration::from_secs(299)).await;
        assert!(store.lookup(&token).is_some());
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(store.lookup(&token).is_none());
        assert!(store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_removes_only_due_tokens() {
        let store = TokenStore::new();
        let short = store.issue("alice", TokenClass::Proxy, Duration::from_secs(300));
        let long = store.issue("alice", TokenClass::Session, Duration::from_secs(86_400));
        tokio::time::advance(Duration::from_secs(301)).await;

        assert_eq!(store.sweep(Instant::now()), 1);
        assert_eq!(store.len(), 1);
        assert!(store.lookup(&short).is_none());
        assert!(store.lookup(&long).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_skips_revoked_entries() {
        let store = TokenStore::new();
        let token = store.issue("alice", TokenClass::Proxy, Duration::from_secs(5));
        store.revoke(&token);
        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(store.sweep(Instant::now()), 0);
    }
}
