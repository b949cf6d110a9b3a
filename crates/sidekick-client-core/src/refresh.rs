//! Credential refresh orchestration.
//!
//! Runs in the background authority only. Owns the single expiry timer and
//! the one writable path into the credential store; every other context
//! reaches refreshes through `request_refresh`, which collapses concurrent
//! callers onto one exchange.

use crate::bundle::CredentialBundle;
use crate::config::{AuthConfig, RefreshRetryPolicy};
use crate::error::Result;
use crate::events::{CredentialBus, CredentialEvent};
use crate::store::CredentialStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Exchange surface for the refresh endpoint.
#[async_trait]
pub trait RefreshTransport: Send + Sync {
    async fn refresh_session(
        &self,
        subject_id: &str,
        refresh_token: &str,
    ) -> Result<RefreshResponse>;

    /// Best-effort server-side revocation.
    async fn logout(&self, access_token: &str) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
}

/// Where the current bundle sits in its refresh lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialState {
    Missing,
    Fresh,
    ExpiringSoon,
    RefreshInFlight,
    RefreshFailed,
}

enum Role {
    Leader(watch::Sender<Option<bool>>),
    Follower(watch::Receiver<Option<bool>>),
}

pub struct RefreshOrchestrator {
    store: Arc<CredentialStore>,
    transport: Arc<dyn RefreshTransport>,
    bus: CredentialBus,
    config: AuthConfig,
    in_flight: Mutex<Option<watch::Receiver<Option<bool>>>>,
    expiry_timer: Mutex<Option<JoinHandle<()>>>,
    store_watcher: Mutex<Option<JoinHandle<()>>>,
    last_refresh_failed: AtomicBool,
}

impl RefreshOrchestrator {
    pub fn new(
        store: Arc<CredentialStore>,
        transport: Arc<dyn RefreshTransport>,
        bus: CredentialBus,
        config: AuthConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            transport,
            bus,
            config,
            in_flight: Mutex::new(None),
            expiry_timer: Mutex::new(None),
            store_watcher: Mutex::new(None),
            last_refresh_failed: AtomicBool::new(false),
        })
    }

    /// Begin timer upkeep: schedule from the current bundle (immediately if
    /// already past threshold) and reschedule whenever a store update
    /// changes `issued_at`.
    pub async fn start(self: &Arc<Self>) {
        let mut last_issued_at = None;
        if let Some(bundle) = self.store.get().await {
            last_issued_at = Some(bundle.issued_at);
            self.schedule_expiry(bundle.issued_at).await;
        }

        let mut changes = self.store.subscribe();
        let orchestrator = Arc::clone(self);
        let watcher = tokio::spawn(async move {
            while changes.changed().await.is_ok() {
                let issued_at = changes.borrow_and_update().as_ref().map(|bundle| bundle.issued_at);
                match issued_at {
                    Some(issued_at) if last_issued_at != Some(issued_at) => {
                        last_issued_at = Some(issued_at);
                        orchestrator.schedule_expiry(issued_at).await;
                    }
                    None => {
                        last_issued_at = None;
                        orchestrator.cancel_expiry().await;
                    }
                    Some(_) => {}
                }
            }
        });

        let mut guard = self.store_watcher.lock().await;
        if let Some(previous) = guard.take() {
            previous.abort();
        }
        *guard = Some(watcher);
    }

    /// Install a bundle delivered by the external login flow.
    pub async fn install_bundle(self: &Arc<Self>, bundle: CredentialBundle) {
        self.last_refresh_failed.store(false, Ordering::Relaxed);
        let issued_at = bundle.issued_at;
        self.store.set(bundle).await;
        self.schedule_expiry(issued_at).await;
    }

    /// Destroy credentials, best-effort revoking them server-side first.
    pub async fn logout(self: &Arc<Self>) {
        if let Some(bundle) = self.store.get().await
            && let Err(error) = self.transport.logout(&bundle.access_token).await
        {
            debug!("server-side logout failed: {error}");
        }
        self.cancel_expiry().await;
        self.store.clear().await;
    }

    /// Schedule the expiry timer for `lifetime - grace_window` past
    /// `issued_at`. Exactly one timer is ever pending: scheduling replaces
    /// and aborts any previous one.
    pub async fn schedule_expiry(self: &Arc<Self>, issued_at: DateTime<Utc>) {
        let delay = self.config.time_until_refresh(issued_at, Utc::now());
        self.schedule_refresh_in(delay).await;
    }

    pub async fn cancel_expiry(&self) {
        if let Some(timer) = self.expiry_timer.lock().await.take() {
            timer.abort();
        }
    }

    /// Refresh now, from any context. Concurrent calls collapse onto the
    /// exchange already in flight: refresh tokens are single-use, and a
    /// second request with a consumed token would spuriously fail.
    pub async fn request_refresh(self: &Arc<Self>) -> bool {
        let role = {
            let mut in_flight = self.in_flight.lock().await;
            match in_flight.as_ref() {
                Some(rx) => Role::Follower(rx.clone()),
                None => {
                    let (tx, rx) = watch::channel(None);
                    *in_flight = Some(rx);
                    Role::Leader(tx)
                }
            }
        };

        match role {
            Role::Follower(mut rx) => match rx.wait_for(|outcome| outcome.is_some()).await {
                Ok(outcome) => (*outcome).unwrap_or(false),
                Err(_) => false,
            },
            Role::Leader(tx) => {
                let succeeded = self.perform_refresh().await;
                *self.in_flight.lock().await = None;
                let _ = tx.send(Some(succeeded));
                succeeded
            }
        }
    }

    /// Current lifecycle position, for UI surfaces.
    pub async fn credential_state(&self) -> CredentialState {
        if self.in_flight.lock().await.is_some() {
            return CredentialState::RefreshInFlight;
        }
        if self.last_refresh_failed.load(Ordering::Relaxed) {
            return CredentialState::RefreshFailed;
        }
        match self.store.get().await {
            None => CredentialState::Missing,
            Some(bundle) if bundle.is_expiring_soon_at(Utc::now(), &self.config) => {
                CredentialState::ExpiringSoon
            }
            Some(_) => CredentialState::Fresh,
        }
    }

    pub async fn shutdown(&self) {
        self.cancel_expiry().await;
        if let Some(watcher) = self.store_watcher.lock().await.take() {
            watcher.abort();
        }
    }

    async fn perform_refresh(self: &Arc<Self>) -> bool {
        let Some(bundle) = self.store.get().await else {
            warn!("refresh requested without a credential bundle");
            self.bus.publish(CredentialEvent::ReauthenticationRequired);
            return false;
        };
        let (Some(subject_id), Some(refresh_token)) =
            (bundle.subject_id.clone(), bundle.refresh_token.clone())
        else {
            warn!("credential bundle cannot self-refresh");
            self.bus.publish(CredentialEvent::ReauthenticationRequired);
            return false;
        };

        match self.transport.refresh_session(&subject_id, &refresh_token).await {
            Ok(response) => {
                let refreshed = CredentialBundle {
                    access_token: response.access_token.clone(),
                    // the old refresh token stays valid when the response
                    // does not rotate it
                    refresh_token: response.refresh_token.or(bundle.refresh_token),
                    subject_id: bundle.subject_id,
                    issued_at: Utc::now(),
                };
                let issued_at = refreshed.issued_at;
                self.store.set(refreshed).await;
                self.schedule_expiry(issued_at).await;
                self.last_refresh_failed.store(false, Ordering::Relaxed);
                self.bus.publish(CredentialEvent::Refreshed {
                    access_token: response.access_token,
                });
                true
            }
            Err(error) => {
                warn!("credential refresh failed: {error}");
                self.last_refresh_failed.store(true, Ordering::Relaxed);
                self.bus.publish(CredentialEvent::ReauthenticationRequired);
                if let RefreshRetryPolicy::RetryAfter(delay) = self.config.refresh_retry {
                    self.schedule_refresh_in(delay).await;
                }
                false
            }
        }
    }

    // Returns an explicitly-boxed `Send` future rather than using `async fn`:
    // this routine is reachable from `request_refresh` (via `perform_refresh`)
    // and also spawns `request_refresh`, forming a recursive cycle that defeats
    // `Send` auto-trait inference on an opaque return type. A declared `Send`
    // boxed future gives that cycle a terminating node.
    fn schedule_refresh_in(
        self: &Arc<Self>,
        delay: Duration,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            let orchestrator = Arc::clone(self);
            let timer = tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                // the exchange runs on its own task so replacing the timer slot
                // never cancels an exchange already underway
                let refresher = Arc::clone(&orchestrator);
                tokio::spawn(async move {
                    refresher.request_refresh().await;
                });
            });

            let mut pending = self.expiry_timer.lock().await;
            if let Some(previous) = pending.take() {
                previous.abort();
            }
            *pending = Some(timer);
        })
    }
}
