// ── Top-level client ──
//
// Owns the one credential, the REST collaborator, and the session
// registry. The registry is the single source of truth for sessions:
// the device class enforces a small connection ceiling, so a duplicate
// session per device id is a correctness bug, not just waste.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use dashmap::DashMap;
use secrecy::SecretString;
use tracing::debug;

use perch_api::{CloudEvent, DeviceRecord, LoginOutcome, RestClient, TokenManager, TokenPair};

use crate::config::{ClientConfig, SessionConfig};
use crate::error::CoreError;
use crate::session::DeviceSession;

const TOKEN_MIN_TTL: Duration = Duration::from_secs(60);

/// Entry point: authenticates the account and vends device sessions.
///
/// Cheaply cloneable. One `Client` holds one [`TokenManager`] shared by
/// every session it creates.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    config: ClientConfig,
    rest: Arc<RestClient>,
    tokens: Mutex<Option<Arc<TokenManager>>>,
    sessions: DashMap<String, DeviceSession>,
    closed: AtomicBool,
}

impl Client {
    pub fn new(config: ClientConfig) -> Result<Self, CoreError> {
        let rest = Arc::new(RestClient::new(config.api_base.clone(), config.timeout)?);
        Ok(Self {
            inner: Arc::new(ClientInner {
                config,
                rest,
                tokens: Mutex::new(None),
                sessions: DashMap::new(),
                closed: AtomicBool::new(false),
            }),
        })
    }

    /// The underlying REST collaborator.
    pub fn rest(&self) -> &Arc<RestClient> {
        &self.inner.rest
    }

    /// The current token manager, or `None` before authentication.
    pub fn token_manager(&self) -> Option<Arc<TokenManager>> {
        self.inner
            .tokens
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    // ── Authentication ───────────────────────────────────────────────

    /// Log in with email/password. On success the client is ready to
    /// vend sessions; an [`LoginOutcome::MfaRequired`] outcome must be
    /// completed through [`verify_mfa`](Self::verify_mfa).
    pub async fn login(&self, email: &str, password: &SecretString) -> Result<LoginOutcome, CoreError> {
        let outcome = self.inner.rest.login(email, password).await?;
        if let LoginOutcome::Tokens(pair) = &outcome {
            self.install_tokens(pair);
        }
        Ok(outcome)
    }

    /// Complete an MFA challenge from [`login`](Self::login).
    pub async fn verify_mfa(
        &self,
        email: &str,
        password: &SecretString,
        mfa_token: &str,
        mfa_code: &str,
    ) -> Result<TokenPair, CoreError> {
        let pair = self
            .inner
            .rest
            .verify_mfa(email, password, mfa_token, mfa_code)
            .await?;
        self.install_tokens(&pair);
        Ok(pair)
    }

    /// Seed credentials from host storage without any network call.
    pub fn restore_credentials(&self, access: SecretString, refresh: SecretString) {
        let manager = Arc::new(TokenManager::restore(
            Arc::clone(&self.inner.rest),
            access,
            refresh,
        ));
        *self
            .inner
            .tokens
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(manager);
    }

    fn install_tokens(&self, pair: &TokenPair) {
        let manager = Arc::new(TokenManager::new(Arc::clone(&self.inner.rest), pair));
        *self
            .inner
            .tokens
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(manager);
    }

    fn require_tokens(&self) -> Result<Arc<TokenManager>, CoreError> {
        self.token_manager().ok_or(CoreError::NotAuthenticated)
    }

    // ── Account data ─────────────────────────────────────────────────

    /// List the cameras on the account.
    pub async fn list_devices(&self) -> Result<Vec<DeviceRecord>, CoreError> {
        let tokens = self.require_tokens()?;
        let token = tokens.get_valid_token(TOKEN_MIN_TTL).await?;
        Ok(self.inner.rest.list_devices(&token).await?)
    }

    /// Page the most recent cloud notifications for one device.
    pub async fn device_events(
        &self,
        device_id: &str,
        limit: u32,
    ) -> Result<Vec<CloudEvent>, CoreError> {
        let tokens = self.require_tokens()?;
        let token = tokens.get_valid_token(TOKEN_MIN_TTL).await?;
        Ok(self.inner.rest.get_events(&token, device_id, limit).await?)
    }

    // ── Sessions ─────────────────────────────────────────────────────

    /// Get or create the session for a device. Idempotent: a second
    /// call with the same id returns the existing session unchanged
    /// (including its original `SessionConfig`), never a second
    /// connection.
    pub fn camera(
        &self,
        device_id: &str,
        config: SessionConfig,
    ) -> Result<DeviceSession, CoreError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(CoreError::SessionStopped);
        }
        let tokens = self.require_tokens()?;
        let session = self
            .inner
            .sessions
            .entry(device_id.to_owned())
            .or_insert_with(|| {
                debug!(device_id, "creating device session");
                DeviceSession::new(
                    device_id,
                    config,
                    self.inner.config.clone(),
                    tokens,
                    Arc::clone(&self.inner.rest),
                )
            });
        Ok(session.clone())
    }

    /// Stop every session and clear the registry. The REST collaborator
    /// is released when the last clone of the client drops.
    pub async fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        let sessions: Vec<DeviceSession> = self
            .inner
            .sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        self.inner.sessions.clear();
        for session in sessions {
            session.stop().await;
        }
        *self
            .inner
            .tokens
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = None;
        debug!("client closed");
    }
}
