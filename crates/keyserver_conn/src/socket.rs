use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, RwLock,
    },
};

use async_trait::async_trait;
use serde_json::Value;
use shared::domain::KeyserverId;
use tracing::debug;

use crate::{endpoints::Endpoint, error::CallError};

/// Sends one request over an established keyserver socket. Implementations
/// report `CallError::SocketOffline` and `CallError::SocketTimeout` for the two
/// transient failures the executor may fall back from.
#[async_trait]
pub trait SocketApiHandler: Send + Sync {
    async fn call(&self, endpoint: Endpoint, input: Value) -> Result<Value, CallError>;
}

#[derive(Default)]
pub struct SocketRegistry {
    handlers: RwLock<HashMap<KeyserverId, Arc<dyn SocketApiHandler>>>,
    generation: AtomicU64,
}

impl SocketRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, keyserver_id: KeyserverId, handler: Arc<dyn SocketApiHandler>) {
        debug!(keyserver_id = %keyserver_id, "registering socket handler");
        self.write().insert(keyserver_id, handler);
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    pub fn unregister(&self, keyserver_id: &KeyserverId) {
        if self.write().remove(keyserver_id).is_some() {
            debug!(keyserver_id = %keyserver_id, "unregistered socket handler");
            self.generation.fetch_add(1, Ordering::SeqCst);
        }
    }

    pub fn handler(&self, keyserver_id: &KeyserverId) -> Option<Arc<dyn SocketApiHandler>> {
        self.handlers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(keyserver_id)
            .cloned()
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    fn write(
        &self,
    ) -> std::sync::RwLockWriteGuard<'_, HashMap<KeyserverId, Arc<dyn SocketApiHandler>>> {
        self.handlers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
