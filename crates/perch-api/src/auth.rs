// ── Token lifecycle ──
//
// Owns the one access/refresh credential shared by every session under
// a client. The credential is replaced, never edited in place, and only
// inside the refresh critical section: callers that arrive while a
// refresh is in flight block on the same lock and reuse its result, so
// a thundering herd never fans out into parallel refresh calls.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use secrecy::SecretString;
use tokio::time::Instant;
use tracing::debug;

use crate::error::Error;
use crate::rest::{RestClient, TokenPair};

/// Assumed access-token lifetime when the service does not advertise one.
pub const DEFAULT_TOKEN_LIFETIME: Duration = Duration::from_secs(3600);

/// Refresh this long before expiry rather than at it.
pub const DEFAULT_REFRESH_MARGIN: Duration = Duration::from_secs(300);

struct Credential {
    access: SecretString,
    refresh: SecretString,
    issued_at: Instant,
    lifetime: Duration,
}

impl Credential {
    fn remaining(&self) -> Duration {
        (self.issued_at + self.lifetime).saturating_duration_since(Instant::now())
    }
}

type RotationCallback = Arc<dyn Fn(&TokenPair) + Send + Sync>;
type ListenerMap = Mutex<HashMap<u64, RotationCallback>>;

/// Manages the account credential with proactive renewal.
///
/// Does not own the REST client -- the caller provides it. Rotation
/// listeners fire after every successful refresh so the host can
/// persist the new pair; callbacks must be cheap and must not call back
/// into the manager.
pub struct TokenManager {
    rest: Arc<RestClient>,
    credential: tokio::sync::Mutex<Credential>,
    refresh_margin: Duration,
    listeners: Arc<ListenerMap>,
    next_listener_id: AtomicU64,
}

impl TokenManager {
    /// Seed from a freshly issued pair (login / MFA verification).
    pub fn new(rest: Arc<RestClient>, tokens: &TokenPair) -> Self {
        Self::with_lifetime(
            rest,
            tokens.access.clone(),
            tokens.refresh.clone(),
            tokens.expires_in.unwrap_or(DEFAULT_TOKEN_LIFETIME),
        )
    }

    /// Seed from a previously persisted pair without touching the
    /// network. The restored access token is assumed fresh; if it is
    /// not, the first authorized call fails and the caller refreshes.
    pub fn restore(rest: Arc<RestClient>, access: SecretString, refresh: SecretString) -> Self {
        Self::with_lifetime(rest, access, refresh, DEFAULT_TOKEN_LIFETIME)
    }

    /// Seed with an explicit remaining lifetime (hosts that persist the
    /// expiry alongside the pair).
    pub fn with_lifetime(
        rest: Arc<RestClient>,
        access: SecretString,
        refresh: SecretString,
        lifetime: Duration,
    ) -> Self {
        Self {
            rest,
            credential: tokio::sync::Mutex::new(Credential {
                access,
                refresh,
                issued_at: Instant::now(),
                lifetime,
            }),
            refresh_margin: DEFAULT_REFRESH_MARGIN,
            listeners: Arc::new(Mutex::new(HashMap::new())),
            next_listener_id: AtomicU64::new(0),
        }
    }

    /// Return an access token with at least `min_ttl` of lifetime left,
    /// refreshing first if needed.
    ///
    /// Concurrent callers serialize on the credential lock: whichever
    /// arrives first performs the refresh, the rest see the renewed
    /// credential and return without a second network call.
    pub async fn get_valid_token(&self, min_ttl: Duration) -> Result<SecretString, Error> {
        let mut credential = self.credential.lock().await;
        if credential.remaining() <= min_ttl.max(self.refresh_margin) {
            self.refresh_locked(&mut credential).await?;
        }
        Ok(credential.access.clone())
    }

    /// Refresh unconditionally.
    pub async fn force_refresh(&self) -> Result<(), Error> {
        let mut credential = self.credential.lock().await;
        self.refresh_locked(&mut credential).await
    }

    /// Register a listener invoked with the new pair after every
    /// successful refresh. Returns a handle that deregisters it; the
    /// handle holds no strong reference to the manager.
    pub fn on_rotated(
        &self,
        callback: impl Fn(&TokenPair) + Send + Sync + 'static,
    ) -> RotationHandle {
        let id = self.next_listener_id.fetch_add(1, Ordering::Relaxed);
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, Arc::new(callback));
        RotationHandle {
            id,
            listeners: Arc::downgrade(&self.listeners),
        }
    }

    async fn refresh_locked(&self, credential: &mut Credential) -> Result<(), Error> {
        debug!("refreshing access token");
        let pair = self
            .rest
            .refresh(&credential.access, &credential.refresh)
            .await?;

        *credential = Credential {
            access: pair.access.clone(),
            refresh: pair.refresh.clone(),
            issued_at: Instant::now(),
            lifetime: pair.expires_in.unwrap_or(DEFAULT_TOKEN_LIFETIME),
        };
        debug!("access token rotated");

        let listeners: Vec<RotationCallback> = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        for listener in listeners {
            listener(&pair);
        }
        Ok(())
    }
}

/// Deregistration handle returned by [`TokenManager::on_rotated`].
pub struct RotationHandle {
    id: u64,
    listeners: Weak<ListenerMap>,
}

impl RotationHandle {
    /// Remove the listener. A no-op if the manager is already gone.
    pub fn unsubscribe(self) {
        if let Some(listeners) = self.listeners.upgrade() {
            listeners
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&self.id);
        }
    }
}
