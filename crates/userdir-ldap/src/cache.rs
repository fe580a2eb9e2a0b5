//! Keyed resource cache collaborator for live sessions.
//!
//! The cache is owned by the host process, not by the delegate; the
//! delegate only holds a key. Creation is single-flight with respect to
//! the key, so two concurrent callers cannot open duplicate connections
//! for the same delegate.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::session::{ConnectOptions, DirectoryConnector, DirectorySession};
use crate::Result;

/// A live session shared between operations on the same delegate.
pub type SharedSession = Arc<Mutex<Box<dyn DirectorySession>>>;

/// Process-wide keyed cache of live sessions.
///
/// Not mocked: tests exercise cache behavior through [`MemoryCache`],
/// which is small enough to use directly.
#[async_trait]
pub trait ResourceCache: Send + Sync {
    /// Returns the cached session for the key, if any.
    async fn get(&self, key: &str) -> Option<SharedSession>;

    /// Returns the cached session for the key, opening one through the
    /// connector when absent. Creation is atomic per key.
    async fn get_or_create(
        &self,
        key: &str,
        connector: &dyn DirectoryConnector,
        url: &str,
        options: &ConnectOptions,
    ) -> Result<SharedSession>;

    /// Drops the cached session for the key.
    async fn remove(&self, key: &str);
}

/// In-memory cache implementation.
///
/// The map lock is held across session creation, which keeps creation
/// single-flight at the cost of serializing creations for distinct keys.
#[derive(Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, SharedSession>>,
}

impl MemoryCache {
    /// Creates an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ResourceCache for MemoryCache {
    async fn get(&self, key: &str) -> Option<SharedSession> {
        self.entries.lock().await.get(key).cloned()
    }

    async fn get_or_create(
        &self,
        key: &str,
        connector: &dyn DirectoryConnector,
        url: &str,
        options: &ConnectOptions,
    ) -> Result<SharedSession> {
        let mut entries = self.entries.lock().await;
        if let Some(session) = entries.get(key) {
            return Ok(session.clone());
        }

        let session: SharedSession = Arc::new(Mutex::new(connector.open(url, options).await?));
        entries.insert(key.to_string(), session.clone());
        Ok(session)
    }

    async fn remove(&self, key: &str) {
        self.entries.lock().await.remove(key);
    }
}
