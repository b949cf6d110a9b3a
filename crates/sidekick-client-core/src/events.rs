//! Cross-context credential notifications.

use tokio::sync::broadcast;
use tracing::debug;

pub const DEFAULT_BUS_CAPACITY: usize = 64;

/// Notification fanned out to every execution context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialEvent {
    /// A refresh succeeded. Carries only the new access token to keep the
    /// cross-context update minimal.
    Refreshed { access_token: String },
    /// Credentials cannot be obtained or refreshed; contexts present the
    /// re-authentication prompt until a new bundle appears.
    ReauthenticationRequired,
}

/// Broadcast bus for credential events.
///
/// The in-process stand-in for the platform notification channel: delivery
/// is at-least-once and ordered per sender. Subscribers that fall behind see
/// a lag error, not missed-forever state, and re-sync from the store.
#[derive(Debug, Clone)]
pub struct CredentialBus {
    tx: broadcast::Sender<CredentialEvent>,
}

impl CredentialBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CredentialEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: CredentialEvent) {
        if self.tx.send(event).is_err() {
            debug!("credential event dropped: no subscribers");
        }
    }
}

impl Default for CredentialBus {
    fn default() -> Self {
        Self::new(DEFAULT_BUS_CAPACITY)
    }
}
