//! Connection pool: idle session retention and credential caching.
//!
//! The pool owns two process-wide maps, instantiated once at daemon startup
//! and passed explicitly to every client handler:
//!
//! - `idle`: (cache key, optional share key) -> parked session with a
//!   retention deadline. Reusable sessions live for 12 hours, shared
//!   sessions for 5 seconds. Each parked session has a watcher task that
//!   evicts and closes it on expiry or on session-level disconnect.
//! - `creds`: cache key -> last credentials that authenticated without a
//!   keyboard challenge. Entries are evicted with negative feedback: a
//!   connect that reused a cached entry and was denied authentication
//!   removes it, identity-checked so a racing writer's fresh entry
//!   survives.
//!
//! Map operations are short critical sections; no I/O happens while a map
//! shard is locked.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{SHARE_TTL, resolve_idle_ttl};
use crate::error::{REASON_NO_CACHED_CONNECTION, REASON_NO_CREDENTIALS, SshErrorKind, SshFailure};
use crate::request::{CacheKey, ConnectRequest, Credentials, ReuseRequest, WindowSize};
use crate::ssh::observer::{SessionEvent, SessionObserver};
use crate::ssh::session::SshSession;
use crate::ssh::{self, parse_private_key};

/// What to do with a session a handler no longer owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReuseMode {
    /// Close the session.
    Drop,
    /// Park it under the plain cache key (only if the caller consented to
    /// reuse; otherwise the session is closed).
    Keep,
    /// Park it under the extended key for transient pickup.
    Share,
}

/// The slice of session behavior the pool needs.
///
/// The daemon parks [`SshSession`]s; tests park fakes.
#[async_trait]
pub trait PooledSession: Send + Sync + 'static {
    fn cache_key(&self) -> &CacheKey;
    fn fingerprint(&self) -> &str;
    fn banner(&self) -> Option<&str>;
    fn reusable(&self) -> bool;
    fn share_key(&self) -> Option<&str>;
    fn set_share_key(&mut self, key: String);
    fn swap_observer(&self, observer: SessionObserver);
    async fn close(self);
}

#[async_trait]
impl PooledSession for SshSession {
    fn cache_key(&self) -> &CacheKey {
        SshSession::cache_key(self)
    }

    fn fingerprint(&self) -> &str {
        SshSession::fingerprint(self)
    }

    fn banner(&self) -> Option<&str> {
        SshSession::banner(self)
    }

    fn reusable(&self) -> bool {
        SshSession::reusable(self)
    }

    fn share_key(&self) -> Option<&str> {
        SshSession::share_key(self)
    }

    fn set_share_key(&mut self, key: String) {
        SshSession::set_share_key(self, key)
    }

    fn swap_observer(&self, observer: SessionObserver) {
        SshSession::swap_observer(self, observer)
    }

    async fn close(self) {
        SshSession::close(self).await
    }
}

/// Key of an idle entry: cache key, extended by a share key when present.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolKey {
    pub key: CacheKey,
    pub share_key: Option<String>,
}

struct IdleEntry<S> {
    session: S,
    watcher: JoinHandle<()>,
}

/// Process-wide store of idle sessions and cached credentials.
pub struct ConnectionPool<S: PooledSession = SshSession> {
    idle: DashMap<PoolKey, IdleEntry<S>>,
    creds: DashMap<CacheKey, Arc<Credentials>>,
    idle_ttl: Duration,
    share_ttl: Duration,
}

impl<S: PooledSession> ConnectionPool<S> {
    pub fn new() -> Self {
        Self::with_ttls(resolve_idle_ttl(None), SHARE_TTL)
    }

    pub fn with_ttls(idle_ttl: Duration, share_ttl: Duration) -> Self {
        Self {
            idle: DashMap::new(),
            creds: DashMap::new(),
            idle_ttl,
            share_ttl,
        }
    }

    /// Number of parked sessions.
    pub fn idle_len(&self) -> usize {
        self.idle.len()
    }

    /// Number of cached credential entries.
    pub fn creds_len(&self) -> usize {
        self.creds.len()
    }

    /// Atomically take a parked session matching the request.
    ///
    /// Emits `Connected` through `observer` on a hit, `Unconnected` with
    /// the no-cached-connection reason on a miss.
    pub fn reuse(self: &Arc<Self>, request: &ReuseRequest, observer: &SessionObserver) -> Option<S> {
        let key = PoolKey {
            key: request.key.clone(),
            share_key: request.share_key.clone(),
        };

        match self.idle.remove(&key) {
            Some((_, entry)) => {
                entry.watcher.abort();
                entry.session.swap_observer(observer.clone());
                observer.notify(SessionEvent::Connected {
                    fingerprint: entry.session.fingerprint().to_string(),
                    banner: entry.session.banner().map(str::to_string),
                });
                debug!(key = %request.key, shared = request.share_key.is_some(), "reusing pooled session");
                Some(entry.session)
            }
            None => {
                observer.notify(SessionEvent::Unconnected {
                    reason: REASON_NO_CACHED_CONNECTION.to_string(),
                });
                None
            }
        }
    }

    /// Terminate or park a session a handler is giving up.
    ///
    /// Returns the share key when `mode` is [`ReuseMode::Share`].
    pub async fn relinquish(self: &Arc<Self>, mut session: S, mode: ReuseMode) -> Option<String> {
        match mode {
            ReuseMode::Drop => {
                session.close().await;
                None
            }
            ReuseMode::Keep => {
                if !session.reusable() {
                    session.close().await;
                    return None;
                }
                self.park(session, None, self.idle_ttl).await;
                None
            }
            ReuseMode::Share => {
                let share_key = match session.share_key() {
                    Some(existing) => existing.to_string(),
                    None => {
                        let fresh = generate_share_key();
                        session.set_share_key(fresh.clone());
                        fresh
                    }
                };
                self.park(session, Some(share_key.clone()), self.share_ttl)
                    .await;
                Some(share_key)
            }
        }
    }

    /// Park a session under `key`, closing any previous occupant, and start
    /// its retention watcher.
    async fn park(self: &Arc<Self>, session: S, share_key: Option<String>, ttl: Duration) {
        let key = PoolKey {
            key: session.cache_key().clone(),
            share_key,
        };

        if let Some((_, old)) = self.idle.remove(&key) {
            old.watcher.abort();
            old.session.close().await;
        }

        let (observer, mut events) = SessionObserver::channel();
        session.swap_observer(observer);

        let pool = Arc::downgrade(self);
        let watcher_key = key.clone();
        let watcher = tokio::spawn(async move {
            let expire = tokio::time::sleep(ttl);
            tokio::pin!(expire);
            loop {
                tokio::select! {
                    _ = &mut expire => {
                        debug!(key = %watcher_key.key, "idle session expired");
                        break;
                    }
                    event = events.recv() => match event {
                        Some(SessionEvent::Disconnected { reason }) => {
                            debug!(key = %watcher_key.key, reason = %reason, "idle session disconnected");
                            break;
                        }
                        // Stray events from a command that finished while
                        // the session was being parked; not a liveness
                        // signal either way.
                        Some(_) => {}
                        None => break,
                    }
                }
            }
            let Some(pool) = pool.upgrade() else { return };
            if let Some((_, entry)) = pool.idle.remove(&watcher_key) {
                entry.session.close().await;
            }
        });

        debug!(key = %key.key, shared = key.share_key.is_some(), ttl_secs = ttl.as_secs(), "parked idle session");
        self.idle.insert(key, IdleEntry { session, watcher });
    }

    /// Drain every idle session, closing each one. Used at shutdown.
    pub async fn clear(&self) {
        let keys: Vec<PoolKey> = self.idle.iter().map(|entry| entry.key().clone()).collect();
        for key in keys {
            if let Some((_, entry)) = self.idle.remove(&key) {
                entry.watcher.abort();
                entry.session.close().await;
            }
        }
    }

    /// Pick the credentials a connect attempt should use.
    ///
    /// Directly supplied credentials win; otherwise the cached entry for
    /// the key is substituted. The returned `Arc` identifies a cached entry
    /// so a later eviction can verify it still points at the same record.
    fn resolve_credentials(
        &self,
        key: &CacheKey,
        direct: &Credentials,
    ) -> Result<(Credentials, Option<Arc<Credentials>>), String> {
        if !direct.is_empty() {
            return Ok((direct.clone(), None));
        }
        match self.creds.get(key) {
            Some(entry) => {
                let cached = entry.value().clone();
                Ok(((*cached).clone(), Some(cached)))
            }
            None => Err(REASON_NO_CREDENTIALS.to_string()),
        }
    }

    /// Cache a sanitized copy of credentials that just authenticated.
    fn store_credentials(&self, key: &CacheKey, credentials: &Credentials) {
        let sanitized = credentials.sanitized();
        if sanitized.is_empty() {
            return;
        }
        self.creds.insert(key.clone(), Arc::new(sanitized));
    }

    /// Evict a cached credential entry, but only if it is still the exact
    /// record that was reused; a concurrent writer's entry stays.
    fn evict_credentials_if(&self, key: &CacheKey, reused: &Arc<Credentials>) {
        let removed = self
            .creds
            .remove_if(key, |_, current| Arc::ptr_eq(current, reused));
        if removed.is_some() {
            info!(key = %key, "evicted cached credentials after authentication failure");
        }
    }
}

impl<S: PooledSession> Default for ConnectionPool<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionPool<SshSession> {
    /// Establish a new session for `request`, consulting and maintaining
    /// the credential cache.
    ///
    /// All connection outcomes are reported through `observer`; the return
    /// value only hands the session to the caller on success.
    pub async fn connect(
        self: &Arc<Self>,
        request: &ConnectRequest,
        window: WindowSize,
        observer: &SessionObserver,
        challenges: mpsc::UnboundedReceiver<Vec<String>>,
    ) -> Option<SshSession> {
        let (mut credentials, reused) =
            match self.resolve_credentials(&request.key, &request.credentials) {
                Ok(resolved) => resolved,
                Err(reason) => {
                    observer.notify(SessionEvent::Unconnected { reason });
                    return None;
                }
            };

        let key_parse_failure = credentials
            .private_key
            .as_deref()
            .and_then(|material| {
                parse_private_key(material, credentials.passphrase.as_deref()).err()
            });
        if let Some(parse_error) = key_parse_failure {
            warn!(key = %request.key, error = %parse_error, "supplied private key does not parse");
            if credentials.password.is_some() || credentials.try_keyboard {
                credentials = credentials.without_key();
            } else {
                observer.notify(SessionEvent::Unconnected {
                    reason: SshFailure::authentication().reason(),
                });
                return None;
            }
        }

        match ssh::establish(
            &request.key,
            request.fingerprint.as_deref(),
            &credentials,
            request.reusable,
            window,
            observer,
            challenges,
        )
        .await
        {
            Ok(established) => {
                if reused.is_none() && !established.challenged {
                    self.store_credentials(&request.key, &credentials);
                }
                Some(established.session)
            }
            Err(failure) => {
                if failure.kind == SshErrorKind::Authentication
                    && let Some(stale) = &reused
                {
                    self.evict_credentials_if(&request.key, stale);
                }
                None
            }
        }
    }
}

/// A fresh unguessable share key: 128 random bits as lowercase hex.
fn generate_share_key() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}
