// ── Cloud REST client ──
//
// Thin wrappers over the account endpoints: login (with MFA), token
// refresh, device listing, event history, snapshot stills. The engine
// itself depends only on `refresh` (through the token manager); the
// rest are conveniences for the host application.
//
// Every request carries the versioned API header and a mobile user
// agent -- the service rejects unversioned requests outright, and MFA
// logins additionally require the mobile UA.

use std::time::Duration;

use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::json;
use tracing::debug;
use url::Url;

use crate::error::Error;

pub const API_VERSION_HEADER: &str = "x-perch-api-version";
pub const API_VERSION: &str = "1";

const USER_AGENT: &str = "Perch/412 CFNetwork/1498.700.2 Darwin/23.6.0";

// ── Records ──────────────────────────────────────────────────────────

/// An access/refresh token pair as issued by the service.
#[derive(Clone)]
pub struct TokenPair {
    pub access: SecretString,
    pub refresh: SecretString,
    /// Advertised lifetime of the access token, when the service sends one.
    pub expires_in: Option<Duration>,
}

impl std::fmt::Debug for TokenPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenPair")
            .field("access", &"[REDACTED]")
            .field("refresh", &"[REDACTED]")
            .field("expires_in", &self.expires_in)
            .finish()
    }
}

/// Outcome of a login attempt. The service may demand a second factor
/// before issuing tokens.
#[derive(Debug)]
pub enum LoginOutcome {
    Tokens(TokenPair),
    /// Call [`RestClient::verify_mfa`] with this token and the user's code.
    MfaRequired { mfa_token: String },
}

/// One camera as listed by the account endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceRecord {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// A historical notification from the cloud (motion, sound, ...).
#[derive(Debug, Clone, Deserialize)]
pub struct CloudEvent {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(rename = "time")]
    pub timestamp: f64,
}

#[derive(Deserialize)]
struct TokenBody {
    access_token: String,
    refresh_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

impl From<TokenBody> for TokenPair {
    fn from(body: TokenBody) -> Self {
        Self {
            access: SecretString::from(body.access_token),
            refresh: SecretString::from(body.refresh_token),
            expires_in: body.expires_in.map(Duration::from_secs),
        }
    }
}

// ── Client ───────────────────────────────────────────────────────────

/// Async HTTP client for the cloud REST API.
pub struct RestClient {
    http: reqwest::Client,
    base_url: Url,
}

impl RestClient {
    pub fn new(base_url: Url, timeout: Duration) -> Result<Self, Error> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()
            .map_err(Error::Transport)?;
        Ok(Self { http, base_url })
    }

    /// Build on an existing `reqwest::Client` (test seam).
    pub fn with_client(http: reqwest::Client, base_url: Url) -> Self {
        Self { http, base_url }
    }

    // ── Auth ─────────────────────────────────────────────────────────

    /// Authenticate with email/password.
    pub async fn login(
        &self,
        email: &str,
        password: &SecretString,
    ) -> Result<LoginOutcome, Error> {
        let body = json!({
            "email": email,
            "password": password.expose_secret(),
        });
        self.auth_request(body).await
    }

    /// Complete an MFA challenge issued by [`login`](Self::login).
    pub async fn verify_mfa(
        &self,
        email: &str,
        password: &SecretString,
        mfa_token: &str,
        mfa_code: &str,
    ) -> Result<TokenPair, Error> {
        let body = json!({
            "email": email,
            "password": password.expose_secret(),
            "mfa_token": mfa_token,
            "mfa_code": mfa_code,
        });
        match self.auth_request(body).await? {
            LoginOutcome::Tokens(pair) => Ok(pair),
            LoginOutcome::MfaRequired { .. } => Err(Error::Authentication {
                message: "MFA verification rejected".into(),
            }),
        }
    }

    async fn auth_request(&self, body: serde_json::Value) -> Result<LoginOutcome, Error> {
        let resp = self
            .http
            .post(self.endpoint("login")?)
            .header(API_VERSION_HEADER, API_VERSION)
            .json(&body)
            .send()
            .await
            .map_err(Error::Transport)?;

        if resp.status() == StatusCode::UNAUTHORIZED {
            return Err(Error::Authentication {
                message: "invalid credentials".into(),
            });
        }

        // The MFA challenge rides on a non-standard 4xx, so parse the
        // body before checking for generic failure.
        let status = resp.status();
        let value: serde_json::Value = resp.json().await.map_err(Error::Transport)?;

        if let Some(mfa_token) = value.get("mfa_token").and_then(|v| v.as_str()) {
            return Ok(LoginOutcome::MfaRequired {
                mfa_token: mfa_token.to_owned(),
            });
        }

        if !status.is_success() {
            return Err(Error::Api {
                status: status.as_u16(),
                message: value.to_string(),
            });
        }

        let tokens: TokenBody =
            serde_json::from_value(value).map_err(|e| Error::Api {
                status: status.as_u16(),
                message: format!("malformed login response: {e}"),
            })?;
        Ok(LoginOutcome::Tokens(tokens.into()))
    }

    /// Exchange the refresh token for a new pair.
    ///
    /// A 404 means the refresh token itself is dead -- terminal. The
    /// service authorizes this call with the bare access token (no
    /// `Bearer` prefix), expired or not.
    pub async fn refresh(
        &self,
        access: &SecretString,
        refresh: &SecretString,
    ) -> Result<TokenPair, Error> {
        let resp = self
            .http
            .post(self.endpoint("tokens/refresh")?)
            .header(API_VERSION_HEADER, API_VERSION)
            .header("Authorization", access.expose_secret())
            .json(&json!({ "refresh_token": refresh.expose_secret() }))
            .send()
            .await
            .map_err(Error::Transport)?;

        match resp.status() {
            StatusCode::NOT_FOUND => Err(Error::AuthExpired),
            StatusCode::UNAUTHORIZED => Err(Error::Authentication {
                message: "access token rejected during refresh".into(),
            }),
            status if !status.is_success() => Err(Error::Api {
                status: status.as_u16(),
                message: resp.text().await.unwrap_or_default(),
            }),
            _ => {
                let tokens: TokenBody = resp.json().await.map_err(Error::Transport)?;
                Ok(tokens.into())
            }
        }
    }

    // ── Account data ─────────────────────────────────────────────────

    /// List the cameras on the account.
    pub async fn list_devices(&self, access: &SecretString) -> Result<Vec<DeviceRecord>, Error> {
        #[derive(Deserialize)]
        struct Body {
            #[serde(default)]
            devices: Vec<DeviceRecord>,
        }
        let body: Body = self
            .get_json(self.endpoint("devices")?, access)
            .await?;
        Ok(body.devices)
    }

    /// Page the most recent cloud notifications for one device.
    pub async fn get_events(
        &self,
        access: &SecretString,
        device_id: &str,
        limit: u32,
    ) -> Result<Vec<CloudEvent>, Error> {
        #[derive(Deserialize)]
        struct Body {
            #[serde(default)]
            events: Vec<CloudEvent>,
        }
        let mut url = self.endpoint(&format!("devices/{device_id}/events"))?;
        url.query_pairs_mut()
            .append_pair("limit", &limit.to_string());
        let body: Body = self.get_json(url, access).await?;
        Ok(body.events)
    }

    /// Fetch a JPEG still of the device's view.
    ///
    /// Best-effort: any failure is logged and collapses to `None` -- the
    /// endpoint is flaky on sleeping devices and callers treat a missing
    /// still as normal.
    pub async fn fetch_snapshot(
        &self,
        access: &SecretString,
        device_id: &str,
    ) -> Option<bytes::Bytes> {
        let url = self
            .endpoint(&format!("devices/{device_id}/snapshot"))
            .ok()?;
        let result = self
            .http
            .get(url)
            .header(API_VERSION_HEADER, API_VERSION)
            .header("Authorization", access.expose_secret())
            .send()
            .await;

        match result {
            Ok(resp) if resp.status().is_success() => resp.bytes().await.ok(),
            Ok(resp) => {
                debug!(device_id, status = %resp.status(), "snapshot endpoint declined");
                None
            }
            Err(e) => {
                debug!(device_id, error = %e, "snapshot fetch failed");
                None
            }
        }
    }

    // ── Helpers ──────────────────────────────────────────────────────

    fn endpoint(&self, path: &str) -> Result<Url, Error> {
        self.base_url.join(path).map_err(Error::InvalidUrl)
    }

    async fn get_json<T: for<'de> Deserialize<'de>>(
        &self,
        url: Url,
        access: &SecretString,
    ) -> Result<T, Error> {
        let resp = self
            .http
            .get(url)
            .header(API_VERSION_HEADER, API_VERSION)
            .header("Authorization", access.expose_secret())
            .send()
            .await
            .map_err(Error::Transport)?;

        match resp.status() {
            StatusCode::UNAUTHORIZED => Err(Error::Authentication {
                message: "access token rejected".into(),
            }),
            status if !status.is_success() => Err(Error::Api {
                status: status.as_u16(),
                message: resp.text().await.unwrap_or_default(),
            }),
            _ => resp.json().await.map_err(Error::Transport),
        }
    }
}
