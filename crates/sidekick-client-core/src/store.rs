//! Process-wide credential store.

use crate::bundle::CredentialBundle;
use crate::error::{AuthError, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{RwLock, watch};
use tracing::warn;

/// Persistence backend error. Backends report what went wrong; the store
/// logs it and answers "no credential" so callers always get a definite
/// value.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct StorageError(pub String);

/// Persistence seam for the credential bundle.
#[async_trait]
pub trait CredentialStateStore: Send + Sync {
    async fn load(&self) -> std::result::Result<Option<CredentialBundle>, StorageError>;
    async fn persist(&self, bundle: &CredentialBundle) -> std::result::Result<(), StorageError>;
    async fn clear(&self) -> std::result::Result<(), StorageError>;
}

enum CacheState {
    NotLoaded,
    Loaded(Option<CredentialBundle>),
}

/// Cached credential bundle backed by persistent storage.
///
/// Exactly one writer is permitted: the background authority (refresh
/// orchestrator plus the login flow) calls `set`/`clear`. Every other
/// context reads snapshots via `get` and watches `subscribe`; that
/// single-writer discipline is what keeps refresh-token rotation sound.
pub struct CredentialStore {
    backend: Arc<dyn CredentialStateStore>,
    cache: RwLock<CacheState>,
    changes: watch::Sender<Option<CredentialBundle>>,
}

impl CredentialStore {
    pub fn new(backend: Arc<dyn CredentialStateStore>) -> Self {
        let (changes, _) = watch::channel(None);
        Self {
            backend,
            cache: RwLock::new(CacheState::NotLoaded),
            changes,
        }
    }

    /// Current bundle, loading from the backend once on first access.
    pub async fn get(&self) -> Option<CredentialBundle> {
        {
            let cache = self.cache.read().await;
            if let CacheState::Loaded(value) = &*cache {
                return value.clone();
            }
        }

        let mut cache = self.cache.write().await;
        // another task may have finished the load while we waited
        if let CacheState::Loaded(value) = &*cache {
            return value.clone();
        }
        let loaded = match self.backend.load().await {
            Ok(value) => value,
            Err(error) => {
                warn!("credential storage read failed: {error}");
                None
            }
        };
        *cache = CacheState::Loaded(loaded.clone());
        loaded
    }

    /// Replace the bundle, persist it, and notify subscribers.
    pub async fn set(&self, bundle: CredentialBundle) {
        {
            let mut cache = self.cache.write().await;
            *cache = CacheState::Loaded(Some(bundle.clone()));
        }
        if let Err(error) = self.backend.persist(&bundle).await {
            warn!("credential storage write failed: {error}");
        }
        let _ = self.changes.send(Some(bundle));
    }

    /// Drop the bundle everywhere and notify subscribers.
    pub async fn clear(&self) {
        {
            let mut cache = self.cache.write().await;
            *cache = CacheState::Loaded(None);
        }
        if let Err(error) = self.backend.clear().await {
            warn!("credential storage clear failed: {error}");
        }
        let _ = self.changes.send(None);
    }

    /// Change notifications for every `set`/`clear`, including ones made in
    /// another context. Drop the receiver to unsubscribe.
    pub fn subscribe(&self) -> watch::Receiver<Option<CredentialBundle>> {
        self.changes.subscribe()
    }

    /// Resolve once an access token is available.
    ///
    /// The cached value is checked before waiting on future notifications so
    /// a token that arrived before the call is never missed.
    pub async fn wait_for_access_token(&self, wait: Duration) -> Result<String> {
        let mut rx = self.changes.subscribe();
        if let Some(bundle) = self.get().await
            && bundle.has_access_token()
        {
            return Ok(bundle.access_token);
        }

        let outcome = tokio::time::timeout(
            wait,
            rx.wait_for(|value| value.as_ref().is_some_and(|bundle| bundle.has_access_token())),
        )
        .await;

        match outcome {
            Ok(Ok(value)) => match value.as_ref() {
                Some(bundle) => Ok(bundle.access_token.clone()),
                None => Err(AuthError::CredentialUnavailable),
            },
            Ok(Err(_)) => Err(AuthError::CredentialUnavailable),
            Err(_) => Err(AuthError::Timeout { waited: wait }),
        }
    }
}

/// In-memory backend for embedding and tests.
#[derive(Default)]
pub struct MemoryStateStore {
    value: std::sync::Mutex<Option<CredentialBundle>>,
}

#[async_trait]
impl CredentialStateStore for MemoryStateStore {
    async fn load(&self) -> std::result::Result<Option<CredentialBundle>, StorageError> {
        let value = self
            .value
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Ok(value.clone())
    }

    async fn persist(&self, bundle: &CredentialBundle) -> std::result::Result<(), StorageError> {
        let mut value = self
            .value
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *value = Some(bundle.clone());
        Ok(())
    }

    async fn clear(&self) -> std::result::Result<(), StorageError> {
        let mut value = self
            .value
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *value = None;
        Ok(())
    }
}
