use std::{
    cell::{Cell, RefCell},
    collections::{BTreeMap, HashSet},
    rc::Rc,
    time::Duration,
};

use async_trait::async_trait;

use super::KeyValueStore;
use crate::StorageError;

/// Process-local storage. Cloning shares the same map, which lets a test
/// simulate a restart by building fresh stores over the same instance.
#[derive(Clone, Default)]
pub struct MemoryStorage {
    values: Rc<RefCell<BTreeMap<String, String>>>,
    failing: Rc<RefCell<HashSet<String>>>,
    fail_all: Rc<Cell<bool>>,
    latency: Rc<Cell<Duration>>,
}

impl MemoryStorage {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every access to `key` fail.
    pub fn fail_key(&self, key: &str) {
        self.failing.borrow_mut().insert(key.to_string());
    }

    /// Make every access fail (`true`) or succeed again (`false`).
    pub fn fail_all(&self, fail: bool) {
        self.fail_all.set(fail);
    }

    /// Delay every operation by `latency`. Reads return the value as of the
    /// call, writes apply after the delay.
    pub fn set_latency(&self, latency: Duration) {
        self.latency.set(latency);
    }

    /// Synchronous read for assertions.
    pub fn peek(&self, key: &str) -> Option<String> {
        self.values.borrow().get(key).cloned()
    }

    /// Number of stored values.
    pub fn len(&self) -> usize {
        self.values.borrow().len()
    }

    /// Whether nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.values.borrow().is_empty()
    }

    async fn wait(&self) {
        let latency = self.latency.get();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }

    fn check(&self, key: &str) -> Result<(), StorageError> {
        if self.fail_all.get() || self.failing.borrow().contains(key) {
            Err(StorageError::io(key, "injected failure"))
        } else {
            Ok(())
        }
    }
}

#[async_trait(?Send)]
impl KeyValueStore for MemoryStorage {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        self.check(key)?;
        let value = self.values.borrow().get(key).cloned();
        self.wait().await;
        Ok(value)
    }

    async fn set(&self, key: &str, value: String) -> Result<(), StorageError> {
        self.check(key)?;
        self.wait().await;
        self.values.borrow_mut().insert(key.to_string(), value);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.check(key)?;
        self.wait().await;
        self.values.borrow_mut().remove(key);
        Ok(())
    }

    async fn clear(&self) -> Result<(), StorageError> {
        if self.fail_all.get() {
            return Err(StorageError::io("*", "injected failure"));
        }
        self.wait().await;
        self.values.borrow_mut().clear();
        Ok(())
    }
}
