//! Per-context credential health audit.

use crate::config::AuthConfig;
use crate::events::{CredentialBus, CredentialEvent};
use crate::refresh::RefreshOrchestrator;
use crate::store::CredentialStore;
use chrono::Utc;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::debug;

/// Periodic audit of credential freshness, run in every page context.
///
/// Deliberately redundant with the orchestrator's expiry timer: the outcome
/// is the same whether or not that timer already fired, and duplicate
/// refresh requests collapse onto the exchange in flight. This also bounds
/// how long a context can act on a stale cross-context snapshot.
pub struct SessionHealthValidator {
    store: Arc<CredentialStore>,
    orchestrator: Arc<RefreshOrchestrator>,
    bus: CredentialBus,
    config: AuthConfig,
}

impl SessionHealthValidator {
    pub fn new(
        store: Arc<CredentialStore>,
        orchestrator: Arc<RefreshOrchestrator>,
        bus: CredentialBus,
        config: AuthConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            orchestrator,
            bus,
            config,
        })
    }

    /// One audit pass.
    pub async fn run_check(&self) {
        let Some(bundle) = self.store.get().await else {
            debug!("health check: no credential bundle");
            self.bus.publish(CredentialEvent::ReauthenticationRequired);
            return;
        };

        let needs_refresh =
            !bundle.has_access_token() || bundle.is_expiring_soon_at(Utc::now(), &self.config);
        if !needs_refresh {
            return;
        }

        if bundle.can_refresh() {
            // failure broadcasting is the orchestrator's job
            self.orchestrator.request_refresh().await;
        } else {
            self.bus.publish(CredentialEvent::ReauthenticationRequired);
        }
    }

    /// Audit immediately, then every `health_check_interval`.
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let validator = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticks = tokio::time::interval(validator.config.health_check_interval);
            loop {
                ticks.tick().await;
                validator.run_check().await;
            }
        })
    }
}
