use async_trait::async_trait;
use bytes::Bytes;
use onesnap_core::remote::{BackendType, RemoteStore};
use onesnap_core::{Error, Result};
use std::io;
use std::path::{Component, Path, PathBuf};
use tokio::fs;
use tracing::debug;
use walkdir::WalkDir;

const TEMP_SUFFIX: &str = ".onesnap-tmp";

/// A bucket kept as a directory tree: every key is a file below `base_path`.
pub struct LocalStore {
    base_path: PathBuf,
}

impl LocalStore {
    pub fn new<P: AsRef<Path>>(base_path: P) -> Self {
        Self {
            base_path: base_path.as_ref().to_path_buf(),
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn full_path(&self, key: &str) -> Result<PathBuf> {
        let relative = Path::new(key);
        let valid = !key.is_empty()
            && !key.ends_with(TEMP_SUFFIX)
            && relative.components().all(|c| matches!(c, Component::Normal(_)));
        if !valid {
            return Err(Error::InvalidInput(format!("invalid key: {:?}", key)));
        }
        Ok(self.base_path.join(relative))
    }

    /// Removes directories emptied by a delete, up to the base path.
    async fn prune_parents(&self, path: &Path) {
        let mut current = path.parent();
        while let Some(dir) = current {
            if dir == self.base_path || !dir.starts_with(&self.base_path) {
                break;
            }
            if fs::remove_dir(dir).await.is_err() {
                break;
            }
            current = dir.parent();
        }
    }
}

fn backend_error(operation: &str, key: &str, error: io::Error) -> Error {
    match error.kind() {
        io::ErrorKind::NotFound => Error::not_found(key),
        _ => Error::Io(io::Error::new(
            error.kind(),
            format!("{} {}: {}", operation, key, error),
        )),
    }
}

#[async_trait]
impl RemoteStore for LocalStore {
    async fn init(&self) -> Result<()> {
        fs::create_dir_all(&self.base_path).await?;
        Ok(())
    }

    /// Writes to a temporary sibling and renames it into place, so readers
    /// never see a partially written key.
    async fn put(&self, key: &str, data: Bytes) -> Result<()> {
        let full_path = self.full_path(key)?;
        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| backend_error("put", key, e))?;
        }

        let mut temp = full_path.clone().into_os_string();
        temp.push(format!(".{}{}", uuid::Uuid::new_v4().simple(), TEMP_SUFFIX));
        let temp = PathBuf::from(temp);

        fs::write(&temp, &data)
            .await
            .map_err(|e| backend_error("put", key, e))?;
        if let Err(e) = fs::rename(&temp, &full_path).await {
            let _ = fs::remove_file(&temp).await;
            return Err(backend_error("put", key, e));
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Bytes> {
        let full_path = self.full_path(key)?;
        let data = fs::read(&full_path)
            .await
            .map_err(|e| backend_error("get", key, e))?;
        Ok(Bytes::from(data))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let full_path = self.full_path(key)?;
        match fs::remove_file(&full_path).await {
            Ok(()) => {
                self.prune_parents(&full_path).await;
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(key = %key, "Delete of missing key");
                Ok(())
            }
            Err(e) => Err(backend_error("delete", key, e)),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        if !self.base_path.exists() {
            return Ok(Vec::new());
        }

        let mut results = Vec::new();
        for entry in WalkDir::new(&self.base_path).min_depth(1).sort_by_file_name() {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) if e.io_error().is_some_and(|io| io.kind() == io::ErrorKind::NotFound) => continue,
                Err(e) => {
                    return Err(Error::Io(io::Error::other(format!("list {}: {}", prefix, e))));
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }

            let Ok(relative) = entry.path().strip_prefix(&self.base_path) else {
                continue;
            };
            let Some(key) = relative.to_str().map(str::to_string) else {
                continue;
            };
            if key.ends_with(TEMP_SUFFIX) || !key.starts_with(prefix) {
                continue;
            }
            results.push(key);
        }

        results.sort();
        Ok(results)
    }

    fn backend_type(&self) -> BackendType {
        BackendType::Local
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_get_list_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path().join("bucket"));
        store.init().await.unwrap();

        store.put("objects/ab/000000000", Bytes::from_static(b"one")).await.unwrap();
        store.put("objects/ab/000000001.end", Bytes::from_static(b"two")).await.unwrap();
        store.put("lock", Bytes::from_static(b"{}")).await.unwrap();

        assert_eq!(
            store.list("objects/").await.unwrap(),
            vec!["objects/ab/000000000", "objects/ab/000000001.end"]
        );
        assert_eq!(store.list("").await.unwrap().len(), 3);
        assert_eq!(store.get("lock").await.unwrap(), Bytes::from_static(b"{}"));

        store.delete("objects/ab/000000000").await.unwrap();
        store.delete("objects/ab/000000001.end").await.unwrap();
        assert!(!dir.path().join("bucket/objects").exists());
        assert!(store.base_path().exists());
    }

    #[tokio::test]
    async fn missing_key_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path());

        assert!(matches!(store.get("nope").await, Err(Error::NotFound { .. })));
        store.delete("nope").await.unwrap();
    }

    #[tokio::test]
    async fn overwrite_replaces_content() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path());

        store.put("lock", Bytes::from_static(b"first")).await.unwrap();
        store.put("lock", Bytes::from_static(b"second")).await.unwrap();

        assert_eq!(store.get("lock").await.unwrap(), Bytes::from_static(b"second"));
        assert_eq!(store.list("").await.unwrap(), vec!["lock"]);
    }

    #[tokio::test]
    async fn escaping_keys_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path());

        for key in ["../outside", "/etc/passwd", "", "./lock"] {
            assert!(
                matches!(store.put(key, Bytes::new()).await, Err(Error::InvalidInput(_))),
                "{key}"
            );
        }
    }

    #[tokio::test]
    async fn listing_a_missing_directory_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path().join("never-created"));
        assert!(store.list("").await.unwrap().is_empty());
    }
}
