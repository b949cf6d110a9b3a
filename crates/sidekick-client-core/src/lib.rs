//! Credential lifecycle for the Sidekick client.
//!
//! One background authority owns the writable credential store and the
//! refresh timer; page contexts hold read-only snapshots plus subscriptions
//! and may request refreshes, never write. Events cross context boundaries
//! over a broadcast bus.

pub mod bundle;
pub mod config;
pub mod error;
pub mod events;
pub mod refresh;
pub mod store;
pub mod transport;
pub mod validator;

pub use bundle::CredentialBundle;
pub use config::{AuthConfig, RefreshRetryPolicy};
pub use error::AuthError;
pub use events::{CredentialBus, CredentialEvent};
pub use refresh::{CredentialState, RefreshOrchestrator, RefreshResponse, RefreshTransport};
pub use store::{CredentialStateStore, CredentialStore, MemoryStateStore, StorageError};
pub use transport::{HttpRefreshConfig, HttpRefreshTransport};
pub use validator::SessionHealthValidator;
