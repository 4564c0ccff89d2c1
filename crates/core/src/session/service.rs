//! Session authenticator: acquire, cache, validate and renew a signed-in
//! session.
//!
//! `authenticate()` resolves in this order:
//!
//! 1. a credential validated within the TTL is reused as is;
//! 2. otherwise the cached (or persisted) credential is probed against a
//!    cheap table endpoint;
//! 3. if it is absent or the probe fails, the identity handshake runs.
//!
//! Concurrent callers share one handshake: the first caller holds the flight
//! lock and the rest reuse its credential once it is released.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::{json, Value};
use ticketline_domain::{
    AuthConfig, InstanceConfig, Result, SessionCredential, TicketlineError, ValidationStatus,
};
use tracing::{debug, info, instrument, warn};

use super::ports::{ConfigStore, IdentityProvider};
use crate::transport::{HttpMethod, HttpRequest, ProxySelector, Transport};

/// Config store keys owned by the authenticator
pub mod keys {
    pub const CREDENTIAL: &str = "session.credential";
    pub const ERROR_COUNT: &str = "session.error_count";
    pub const LAST_ERROR: &str = "session.last_error";
    pub const LAST_AUTHENTICATED_AT: &str = "session.last_authenticated_at";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthState {
    Unauthenticated,
    Authenticating,
    Authenticated,
}

impl fmt::Display for AuthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unauthenticated => write!(f, "unauthenticated"),
            Self::Authenticating => write!(f, "authenticating"),
            Self::Authenticated => write!(f, "authenticated"),
        }
    }
}

pub struct SessionAuthenticator {
    transport: Arc<dyn Transport>,
    identity: Arc<dyn IdentityProvider>,
    store: Arc<dyn ConfigStore>,
    proxies: ProxySelector,
    probe_url: String,
    timeout: Duration,
    validation_ttl: Duration,
    state: Mutex<AuthState>,
    credential: RwLock<Option<SessionCredential>>,
    flight: tokio::sync::Mutex<()>,
}

impl fmt::Debug for SessionAuthenticator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionAuthenticator")
            .field("state", &self.state())
            .field("probe_url", &self.probe_url)
            .finish_non_exhaustive()
    }
}

impl SessionAuthenticator {
    pub fn new(
        instance: &InstanceConfig,
        auth: &AuthConfig,
        transport: Arc<dyn Transport>,
        identity: Arc<dyn IdentityProvider>,
        store: Arc<dyn ConfigStore>,
    ) -> Self {
        let probe_url = format!("{}/{}", instance.api_base(), auth.probe_path.trim_start_matches('/'));
        Self {
            transport,
            identity,
            store,
            proxies: ProxySelector::new(instance),
            probe_url,
            timeout: instance.request_timeout(),
            validation_ttl: auth.validation_ttl(),
            state: Mutex::new(AuthState::Unauthenticated),
            credential: RwLock::new(None),
            flight: tokio::sync::Mutex::new(()),
        }
    }

    #[must_use]
    pub fn with_proxy_selector(mut self, proxies: ProxySelector) -> Self {
        self.proxies = proxies;
        self
    }

    pub fn state(&self) -> AuthState {
        *self.state.lock()
    }

    pub fn is_authenticated(&self) -> bool {
        self.state() == AuthState::Authenticated
    }

    /// Current credential, if one has been adopted.
    pub fn credential(&self) -> Option<SessionCredential> {
        self.credential.read().clone()
    }

    /// `Cookie` and `X-UserToken` headers of the current credential.
    pub fn default_headers(&self) -> Vec<(String, String)> {
        self.credential.read().as_ref().map(SessionCredential::request_headers).unwrap_or_default()
    }

    fn fresh_credential(&self) -> Option<SessionCredential> {
        if !self.is_authenticated() {
            return None;
        }
        self.credential
            .read()
            .as_ref()
            .filter(|c| c.validated_within(self.validation_ttl, Utc::now()))
            .cloned()
    }

    /// Ensure a usable session and return its credential.
    ///
    /// # Errors
    ///
    /// Returns [`TicketlineError::Authentication`] when no credential could
    /// be validated and the handshake failed.
    #[instrument(skip(self), fields(state = %self.state()))]
    pub async fn authenticate(&self) -> Result<SessionCredential> {
        if let Some(credential) = self.fresh_credential() {
            return Ok(credential);
        }

        let _flight = self.flight.lock().await;
        if let Some(credential) = self.fresh_credential() {
            debug!("session_shared_with_waiter");
            return Ok(credential);
        }
        *self.state.lock() = AuthState::Authenticating;

        if let Some(mut cached) = self.cached_credential().await {
            if cached.validation_status != ValidationStatus::Invalid
                && !cached.is_expired(Utc::now())
                && self.probe(&cached).await
            {
                cached.mark_valid(Utc::now());
                info!("session_revalidated");
                return Ok(self.adopt(cached).await);
            }
            warn!("cached_session_rejected");
        }

        match self.identity.sign_in().await {
            Ok(mut credential) => {
                let now = Utc::now();
                credential.created_at = now;
                credential.mark_valid(now);
                info!("session_established");
                Ok(self.adopt(credential).await)
            }
            Err(err) => {
                let err = match err {
                    TicketlineError::Authentication(_) => err,
                    other => TicketlineError::Authentication(other.to_string()),
                };
                *self.credential.write() = None;
                *self.state.lock() = AuthState::Unauthenticated;
                warn!(error = %err, "session_handshake_failed");
                self.record_failure(&err).await;
                Err(err)
            }
        }
    }

    /// Drop the current session after the server rejected it.
    pub async fn invalidate(&self) {
        let credential = {
            let mut slot = self.credential.write();
            if let Some(credential) = slot.as_mut() {
                credential.mark_invalid();
            }
            slot.clone()
        };
        *self.state.lock() = AuthState::Unauthenticated;
        if let Some(credential) = credential {
            self.persist(&credential).await;
        }
        info!("session_invalidated");
    }

    /// Forget the session in memory and in the store.
    pub async fn reset(&self) {
        *self.credential.write() = None;
        *self.state.lock() = AuthState::Unauthenticated;
        if let Err(err) = self.store.set_config(keys::CREDENTIAL, Value::Null).await {
            warn!(error = %err, "session_store_write_failed");
        }
        info!("session_reset");
    }

    async fn cached_credential(&self) -> Option<SessionCredential> {
        if let Some(credential) = self.credential.read().clone() {
            return Some(credential);
        }
        match self.store.get_config(keys::CREDENTIAL).await {
            Ok(Some(Value::Null) | None) => None,
            Ok(Some(value)) => match serde_json::from_value(value) {
                Ok(credential) => Some(credential),
                Err(err) => {
                    warn!(error = %err, "stored_session_unreadable");
                    None
                }
            },
            Err(err) => {
                warn!(error = %err, "session_store_read_failed");
                None
            }
        }
    }

    /// GET on the probe path; any 2xx means the session is live.
    async fn probe(&self, credential: &SessionCredential) -> bool {
        let request = HttpRequest::new(HttpMethod::Get, self.probe_url.clone())
            .with_header("Accept", "application/json")
            .with_headers(credential.request_headers())
            .with_timeout(self.timeout)
            .with_proxy(self.proxies.select(&self.probe_url));
        match self.transport.send(request).await {
            Ok(response) if response.is_success() => true,
            Ok(response) => {
                debug!(status = response.status, "session_probe_rejected");
                false
            }
            Err(err) => {
                debug!(error = %err, "session_probe_failed");
                false
            }
        }
    }

    async fn adopt(&self, credential: SessionCredential) -> SessionCredential {
        *self.credential.write() = Some(credential.clone());
        *self.state.lock() = AuthState::Authenticated;
        self.persist(&credential).await;
        self.record_success().await;
        credential
    }

    async fn persist(&self, credential: &SessionCredential) {
        let value = match serde_json::to_value(credential) {
            Ok(value) => value,
            Err(err) => {
                warn!(error = %err, "session_serialize_failed");
                return;
            }
        };
        if let Err(err) = self.store.set_config(keys::CREDENTIAL, value).await {
            warn!(error = %err, "session_store_write_failed");
        }
    }

    async fn record_success(&self) {
        let writes = [
            (keys::ERROR_COUNT, json!(0)),
            (keys::LAST_AUTHENTICATED_AT, json!(Utc::now().to_rfc3339())),
        ];
        for (key, value) in writes {
            if let Err(err) = self.store.set_config(key, value).await {
                warn!(error = %err, key, "session_audit_write_failed");
            }
        }
    }

    async fn record_failure(&self, error: &TicketlineError) {
        let previous = match self.store.get_config(keys::ERROR_COUNT).await {
            Ok(Some(value)) => value.as_u64().unwrap_or(0),
            _ => 0,
        };
        let writes =
            [(keys::ERROR_COUNT, json!(previous + 1)), (keys::LAST_ERROR, json!(error.to_string()))];
        for (key, value) in writes {
            if let Err(err) = self.store.set_config(key, value).await {
                warn!(error = %err, key, "session_audit_write_failed");
            }
        }
    }
}
