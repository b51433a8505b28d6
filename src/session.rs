//! Session: authentication credentials and their refresh.
//!
//! ARCHITECTURE
//! ============
//! The login flow itself is external: an `Authenticator` produces
//! `Credentials`. The session caches them, hands out header snapshots, and
//! refreshes them when absent or about to expire.
//!
//! CONCURRENCY
//! ===========
//! Readers clone the current `Credentials` under a short read lock; a refresh
//! swaps in a whole new value, so no reader sees a half-updated token pair.
//! Refresh is single-flight: the first caller spawns the authentication task
//! and parks a shared future in `in_flight`; every concurrent caller awaits
//! that same future. The task runs to completion even if all callers go away.

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::error::ClientError;

pub const HEADER_REGISTRATION_TOKEN: &str = "RegistrationToken";
pub const HEADER_ACCESS_TOKEN: &str = "X-Skypetoken";

// =============================================================================
// CREDENTIALS
// =============================================================================

/// Identity plus the token pair every authenticated request carries.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub identity: String,
    pub registration_token: String,
    pub access_token: String,
    /// `None` means the tokens never expire on their own.
    pub expires_at: Option<Instant>,
}

impl Credentials {
    #[must_use]
    pub fn new(
        identity: impl Into<String>,
        registration_token: impl Into<String>,
        access_token: impl Into<String>,
    ) -> Self {
        Self {
            identity: identity.into(),
            registration_token: registration_token.into(),
            access_token: access_token.into(),
            expires_at: None,
        }
    }

    #[must_use]
    pub fn expires_in(mut self, ttl: Duration) -> Self {
        self.expires_at = Some(Instant::now() + ttl);
        self
    }

    /// True when the tokens expire within `skew` of `now`.
    #[must_use]
    pub fn is_expired_at(&self, now: Instant, skew: Duration) -> bool {
        self.expires_at
            .is_some_and(|at| at.saturating_duration_since(now) <= skew)
    }

    #[must_use]
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        vec![
            (HEADER_REGISTRATION_TOKEN, self.registration_token.clone()),
            (HEADER_ACCESS_TOKEN, self.access_token.clone()),
        ]
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("identity", &self.identity)
            .field("registration_token", &"<redacted>")
            .field("access_token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

// =============================================================================
// AUTHENTICATOR
// =============================================================================

/// Performs the login / re-authentication flow. Enables fakes in tests.
#[async_trait::async_trait]
pub trait Authenticator: Send + Sync {
    /// Obtain a fresh set of credentials.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::AuthenticationFailed`] when the service rejects the login.
    async fn authenticate(&self) -> Result<Credentials, ClientError>;
}

/// Serves credentials obtained out of band (a browser session, a config file).
pub struct StaticAuthenticator {
    credentials: Credentials,
}

impl StaticAuthenticator {
    #[must_use]
    pub fn new(credentials: Credentials) -> Self {
        Self { credentials }
    }
}

#[async_trait::async_trait]
impl Authenticator for StaticAuthenticator {
    async fn authenticate(&self) -> Result<Credentials, ClientError> {
        if self.credentials.access_token.is_empty() || self.credentials.registration_token.is_empty() {
            return Err(ClientError::AuthenticationFailed("static credentials are empty".into()));
        }
        Ok(self.credentials.clone())
    }
}

// =============================================================================
// SESSION
// =============================================================================

/// Lifecycle signal for whoever manages the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionStatus {
    Unauthenticated,
    Active,
    /// The service kept rejecting credentials even after a refresh.
    Terminated { reason: String },
}

type RefreshFlight = Shared<BoxFuture<'static, Result<Credentials, ClientError>>>;

/// Shared handle to the authentication state. Clone is cheap.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    authenticator: Arc<dyn Authenticator>,
    credentials: RwLock<Option<Credentials>>,
    in_flight: Mutex<Option<RefreshFlight>>,
    refreshes: AtomicU64,
    expiry_skew: Duration,
    status: watch::Sender<SessionStatus>,
}

impl Session {
    #[must_use]
    pub fn new(authenticator: Arc<dyn Authenticator>, expiry_skew: Duration) -> Self {
        let (status, _) = watch::channel(SessionStatus::Unauthenticated);
        Self {
            inner: Arc::new(SessionInner {
                authenticator,
                credentials: RwLock::new(None),
                in_flight: Mutex::new(None),
                refreshes: AtomicU64::new(0),
                expiry_skew,
                status,
            }),
        }
    }

    /// Snapshot of the current credentials, fresh or not.
    #[must_use]
    pub fn credentials(&self) -> Option<Credentials> {
        self.inner
            .credentials
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    #[must_use]
    pub fn identity(&self) -> Option<String> {
        self.credentials().map(|c| c.identity)
    }

    /// Number of successful re-authentications so far.
    #[must_use]
    pub fn refresh_count(&self) -> u64 {
        self.inner.refreshes.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn status(&self) -> watch::Receiver<SessionStatus> {
        self.inner.status.subscribe()
    }

    #[must_use]
    pub fn current_status(&self) -> SessionStatus {
        self.inner.status.borrow().clone()
    }

    /// Auth headers for one request, refreshing first when tokens are absent or expiring.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::AuthenticationFailed`] if the refresh fails.
    pub async fn auth_headers(&self) -> Result<Vec<(&'static str, String)>, ClientError> {
        if let Some(credentials) = self.fresh_credentials() {
            return Ok(credentials.headers());
        }
        let now = Instant::now();
        let skew = self.inner.expiry_skew;
        let credentials = self.join_refresh(|c| !c.is_expired_at(now, skew)).await?;
        Ok(credentials.headers())
    }

    /// Re-authenticate. Concurrent callers share one authentication.
    ///
    /// # Errors
    ///
    /// Returns the refresh failure to every caller that awaited it.
    pub async fn refresh(&self) -> Result<(), ClientError> {
        self.join_refresh(|_| false).await.map(|_| ())
    }

    /// Refresh after the service rejected `rejected_access_token`, unless a
    /// newer token has already replaced it.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::AuthenticationFailed`] if a needed refresh fails.
    pub async fn renew_rejected(&self, rejected_access_token: &str) -> Result<(), ClientError> {
        self.join_refresh(|c| c.access_token != rejected_access_token)
            .await
            .map(|_| ())
    }

    /// Install credentials obtained elsewhere, skipping the authenticator.
    pub fn install(&self, credentials: Credentials) {
        *self
            .inner
            .credentials
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(credentials);
        self.inner.status.send_replace(SessionStatus::Active);
    }

    /// Drop the credentials. The next authenticated request logs in again.
    pub fn logout(&self) {
        *self
            .inner
            .credentials
            .write()
            .unwrap_or_else(PoisonError::into_inner) = None;
        self.inner.status.send_replace(SessionStatus::Unauthenticated);
        info!("session logged out");
    }

    /// Escalate a persistent authentication failure to the session owner.
    pub fn mark_terminated(&self, reason: impl Into<String>) {
        let reason = reason.into();
        error!(%reason, "session terminated");
        self.inner.status.send_replace(SessionStatus::Terminated { reason });
    }

    fn fresh_credentials(&self) -> Option<Credentials> {
        let guard = self
            .inner
            .credentials
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        guard
            .as_ref()
            .filter(|c| !c.is_expired_at(Instant::now(), self.inner.expiry_skew))
            .cloned()
    }

    /// Join the running refresh, or start one unless `reuse` accepts the
    /// current credentials. Checked under the flight lock, so a refresh that
    /// just finished is seen here instead of being repeated.
    fn join_refresh(&self, reuse: impl FnOnce(&Credentials) -> bool) -> RefreshFlight {
        let mut slot = self
            .inner
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(flight) = slot.as_ref() {
            return flight.clone();
        }
        if let Some(current) = self.credentials().filter(reuse) {
            return futures::future::ready(Ok(current)).boxed().shared();
        }

        let inner = Arc::clone(&self.inner);
        let task = tokio::spawn(async move {
            info!("refreshing session");
            let result = AssertUnwindSafe(inner.authenticator.authenticate())
                .catch_unwind()
                .await
                .unwrap_or_else(|_| Err(ClientError::AuthenticationFailed("authenticator panicked".into())));
            inner.finish_refresh(&result);
            result
        });
        let flight = async move {
            task.await
                .unwrap_or_else(|e| Err(ClientError::AuthenticationFailed(format!("refresh task failed: {e}"))))
        }
        .boxed()
        .shared();

        *slot = Some(flight.clone());
        flight
    }
}

impl SessionInner {
    fn finish_refresh(&self, result: &Result<Credentials, ClientError>) {
        match result {
            Ok(credentials) => {
                *self
                    .credentials
                    .write()
                    .unwrap_or_else(PoisonError::into_inner) = Some(credentials.clone());
                self.refreshes.fetch_add(1, Ordering::AcqRel);
                self.status.send_replace(SessionStatus::Active);
                info!(identity = %credentials.identity, "session refreshed");
            }
            Err(e) => {
                warn!(error = %e, "session refresh failed");
            }
        }
        // Cleared only after the credentials are stored, so a caller that
        // misses this flight finds fresh tokens instead of starting another.
        *self
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = None;
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("credentials", &self.credentials())
            .field("refreshes", &self.refresh_count())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[path = "session_test.rs"]
mod tests;
