use crate::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendType {
    Memory,
    Local,
    S3,
}

/// The four verbs the engine needs from a bucket.
///
/// Each call is atomic for a single key and strongly consistent for the
/// read that follows it. `get` reports a missing key as [`Error::NotFound`].
#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn init(&self) -> Result<()> {
        Ok(())
    }

    async fn put(&self, key: &str, data: Bytes) -> Result<()>;

    async fn get(&self, key: &str) -> Result<Bytes>;

    async fn delete(&self, key: &str) -> Result<()>;

    async fn list(&self, prefix: &str) -> Result<Vec<String>>;

    fn backend_type(&self) -> BackendType;
}

/// In-process bucket. Counts mutating calls so callers can assert on the
/// remote side effects of a run.
#[derive(Debug, Default)]
pub struct MemoryStore {
    objects: Mutex<BTreeMap<String, Bytes>>,
    puts: AtomicUsize,
    deletes: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn keys(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    pub fn snapshot(&self) -> BTreeMap<String, Bytes> {
        self.lock().clone()
    }

    /// Replaces a stored value without counting it as a write.
    pub fn tamper(&self, key: &str, data: Bytes) {
        self.lock().insert(key.to_string(), data);
    }

    pub fn remove_silently(&self, key: &str) {
        self.lock().remove(key);
    }

    pub fn put_count(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }

    pub fn delete_count(&self) -> usize {
        self.deletes.load(Ordering::SeqCst)
    }

    pub fn write_count(&self) -> usize {
        self.put_count() + self.delete_count()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, Bytes>> {
        self.objects
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl RemoteStore for MemoryStore {
    async fn put(&self, key: &str, data: Bytes) -> Result<()> {
        self.puts.fetch_add(1, Ordering::SeqCst);
        self.lock().insert(key.to_string(), data);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Bytes> {
        self.lock().get(key).cloned().ok_or_else(|| Error::not_found(key))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        self.lock().remove(key);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .lock()
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, _)| key.clone())
            .collect())
    }

    fn backend_type(&self) -> BackendType {
        BackendType::Memory
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_store_verbs() {
        let store = MemoryStore::new();
        store.put("objects/a/000000000.end", Bytes::from_static(b"a")).await.unwrap();
        store.put("objects/b/000000000.end", Bytes::from_static(b"b")).await.unwrap();
        store.put("lock", Bytes::from_static(b"{}")).await.unwrap();

        assert_eq!(store.list("objects/").await.unwrap().len(), 2);
        assert_eq!(store.list("").await.unwrap().len(), 3);
        assert_eq!(store.get("lock").await.unwrap(), Bytes::from_static(b"{}"));

        store.delete("lock").await.unwrap();
        assert!(matches!(store.get("lock").await, Err(Error::NotFound { .. })));
        assert_eq!(store.put_count(), 3);
        assert_eq!(store.delete_count(), 1);
    }
}
