//! A thread-safe in-memory storage for the currently active configuration
//! and the default entity. [`ConfigurationStore`] provides concurrent access
//! for readers (flag evaluation) and writers (the initial fetch and the SSE
//! consumer).

use std::sync::{Arc, Mutex};

use crate::configuration::Configuration;
use crate::entity::Entity;

/// `ConfigurationStore` is the only cross-thread mutable state outside the
/// ingestion pipeline. The stored configuration is immutable and can only be
/// replaced fully; readers clone an `Arc` under a short lock and evaluate
/// lock-free, so a concurrent swap is either fully visible or not at all.
///
/// Every ingress is normalized ("escaped") exactly once on set.
#[derive(Default)]
pub struct ConfigurationStore {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    configuration: Option<Arc<Configuration>>,
    default_entity: Option<Arc<Entity>>,
}

impl ConfigurationStore {
    pub fn new() -> ConfigurationStore {
        ConfigurationStore::default()
    }

    pub fn configuration(&self) -> Option<Arc<Configuration>> {
        // The lock is only ever held for the duration of a pointer copy or
        // swap, so a poisoned lock means a panic in that window; there is
        // nothing useful to do but propagate.
        let inner = self
            .inner
            .lock()
            .expect("thread holding configuration lock should not panic");
        inner.configuration.clone()
    }

    /// Replace the active configuration. `None` clears it, which sends the
    /// SDK back to the uninitialized behavior.
    pub fn set_configuration(&self, configuration: Option<Configuration>) {
        let configuration = configuration.map(|mut configuration| {
            configuration.escape();
            Arc::new(configuration)
        });

        let mut inner = self
            .inner
            .lock()
            .expect("thread holding configuration lock should not panic");
        inner.configuration = configuration;
    }

    pub fn default_entity(&self) -> Option<Arc<Entity>> {
        let inner = self
            .inner
            .lock()
            .expect("thread holding configuration lock should not panic");
        inner.default_entity.clone()
    }

    /// Replace the default entity used when flag functions are called
    /// without one. `None` clears it.
    pub fn set_default_entity(&self, entity: Option<Entity>) {
        let entity = entity.map(|entity| Arc::new(entity.escape()));

        let mut inner = self
            .inner
            .lock()
            .expect("thread holding configuration lock should not panic");
        inner.default_entity = entity;
    }
}
