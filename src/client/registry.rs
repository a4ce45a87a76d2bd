//! Named adapters shared across a process

use super::adapter::Adapter;
use crate::connection::{ConnectionConfig, TransportProvider};
use crate::Result;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::OnceCell;

type Slot = Arc<OnceCell<Arc<Adapter>>>;

/// Adapters keyed by name
///
/// Concurrent [`get_or_connect`](Self::get_or_connect) calls for the same name open
/// one adapter; a failed connect leaves the name free for the next attempt.
#[derive(Default)]
pub struct Registry {
    slots: Mutex<HashMap<String, Slot>>,
}

impl Registry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `adapter` under `name`, returning the adapter it replaced
    pub fn register(&self, name: impl Into<String>, adapter: Adapter) -> Option<Arc<Adapter>> {
        let slot = Arc::new(OnceCell::new_with(Some(Arc::new(adapter))));
        self.slots
            .lock()
            .insert(name.into(), slot)
            .and_then(|old| old.get().cloned())
    }

    /// Adapter stored under `name`, if connected
    pub fn get(&self, name: &str) -> Option<Arc<Adapter>> {
        self.slots.lock().get(name).and_then(|slot| slot.get().cloned())
    }

    /// Adapter stored under `name`, connecting it with `config` on first use.
    ///
    /// # Errors
    ///
    /// Whatever [`Adapter::connect`] returns.
    pub async fn get_or_connect(
        &self,
        name: &str,
        config: impl Into<Arc<ConnectionConfig>>,
        provider: Arc<dyn TransportProvider>,
    ) -> Result<Arc<Adapter>> {
        let slot = self
            .slots
            .lock()
            .entry(name.to_string())
            .or_default()
            .clone();

        slot.get_or_try_init(|| async {
            tracing::debug!(name, "connecting adapter");
            Adapter::connect(config, provider).await.map(Arc::new)
        })
        .await
        .cloned()
    }

    /// Take `name` out of the registry without closing it
    pub fn remove(&self, name: &str) -> Option<Arc<Adapter>> {
        self.slots
            .lock()
            .remove(name)
            .and_then(|slot| slot.get().cloned())
    }

    /// Registered names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.slots.lock().keys().cloned().collect();
        names.sort();
        names
    }

    /// Close and forget every adapter
    pub async fn close_all(&self) {
        let adapters: Vec<Arc<Adapter>> = self
            .slots
            .lock()
            .drain()
            .filter_map(|(_, slot)| slot.get().cloned())
            .collect();

        tracing::debug!(count = adapters.len(), "closing registered adapters");
        futures::future::join_all(adapters.iter().map(|adapter| adapter.close())).await;
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("names", &self.names())
            .finish()
    }
}
