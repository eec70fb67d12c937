use crate::config::EngineConfig;
use crate::crypto::{BlockCipher, DOMAIN_OBJECT, EncryptionKey};
use crate::pipeline::{self, sealed_block_count};
use crate::remote::RemoteStore;
use crate::{Digest, Error, Result};
use std::collections::{BTreeMap, HashSet};
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::unix::fs::MetadataExt;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const OBJECTS_PREFIX: &str = "objects/";

pub fn object_prefix(digest: &Digest) -> String {
    format!("{}{}", OBJECTS_PREFIX, digest)
}

/// Outcome of storing one stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stored {
    pub digest: Digest,
    /// `false` when an object with this digest already existed.
    pub uploaded: bool,
    pub plain_len: u64,
    pub stored_len: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferStats {
    pub uploaded_objects: u64,
    /// Distinct objects already in the bucket before this run and reused.
    pub deduplicated: u64,
    /// Streams whose content was already stored, whether before or
    /// earlier in this run.
    pub reused_files: u64,
    pub uploaded_bytes: u64,
    pub downloaded_objects: u64,
}

/// Content-addressed store of encrypted objects inside the bucket.
///
/// The engine is the only writer of its bucket while holding the lock, so
/// the set of complete objects is listed once on open and kept current
/// locally afterwards.
pub struct ObjectStore {
    remote: Arc<dyn RemoteStore>,
    cipher: BlockCipher,
    config: EngineConfig,
    known: HashSet<Digest>,
    uploaded: HashSet<Digest>,
    reused: HashSet<Digest>,
    stats: TransferStats,
}

impl ObjectStore {
    pub async fn open(remote: Arc<dyn RemoteStore>, key: &EncryptionKey, config: &EngineConfig) -> Result<Self> {
        let cipher = BlockCipher::new(key)?;
        let mut store = Self {
            remote,
            cipher,
            config: config.clone(),
            known: HashSet::new(),
            uploaded: HashSet::new(),
            reused: HashSet::new(),
            stats: TransferStats::default(),
        };
        store.refresh().await?;
        Ok(store)
    }

    /// Re-reads the set of complete objects from the bucket.
    pub async fn refresh(&mut self) -> Result<()> {
        let listing = self.listing().await?;
        self.known = listing
            .into_iter()
            .filter_map(|(digest, names)| {
                sealed_block_count(names.iter().map(String::as_str)).map(|_| digest)
            })
            .collect();
        debug!(objects = self.known.len(), "Loaded object listing");
        Ok(())
    }

    pub fn contains(&self, digest: &Digest) -> bool {
        self.known.contains(digest)
    }

    pub fn len(&self) -> usize {
        self.known.len()
    }

    pub fn is_empty(&self) -> bool {
        self.known.is_empty()
    }

    pub fn stats(&self) -> TransferStats {
        self.stats
    }

    /// Stores the content of the file at `path`.
    ///
    /// Returns `Ok(None)` if the file vanished before it could be opened.
    /// Returns [`Error::SourceChanged`] if it was modified while being read.
    pub async fn upload_file(&mut self, path: &Path) -> Result<Option<Stored>> {
        let mut file = match File::open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                warn!(path = %path.display(), "File vanished before upload, skipping");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        let before = file.metadata()?;
        let stored = self.upload_reader(&mut file).await;
        let after = match std::fs::symlink_metadata(path) {
            Ok(after) => after,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                warn!(path = %path.display(), "File vanished during upload, skipping");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        let stored = stored?;
        if before.len() != after.len()
            || before.mtime() != after.mtime()
            || before.mtime_nsec() != after.mtime_nsec()
            || before.ino() != after.ino()
        {
            return Err(Error::SourceChanged {
                path: path.to_path_buf(),
            });
        }

        Ok(Some(stored))
    }

    /// Seals `reader` and uploads it unless an identical object exists.
    pub async fn upload_reader<R: Read + ?Sized>(&mut self, reader: &mut R) -> Result<Stored> {
        let mut sealed = pipeline::seal_to_spool(reader, &mut self.cipher, DOMAIN_OBJECT, &self.config)?;
        let digest = sealed.digest;

        if self.known.contains(&digest) {
            debug!(digest = %digest.short_string(), "Object already stored, skipping upload");
            self.stats.reused_files += 1;
            if !self.uploaded.contains(&digest) && self.reused.insert(digest) {
                self.stats.deduplicated += 1;
            }
            return Ok(Stored {
                digest,
                uploaded: false,
                plain_len: sealed.plain_len,
                stored_len: sealed.stored_len,
            });
        }

        let prefix = object_prefix(&digest);
        pipeline::upload_spool(self.remote.as_ref(), &prefix, &mut sealed, self.config.block_size).await?;
        self.known.insert(digest);
        self.uploaded.insert(digest);
        self.stats.uploaded_objects += 1;
        self.stats.uploaded_bytes += sealed.stored_len;

        debug!(
            digest = %digest.short_string(),
            blocks = sealed.blocks,
            bytes = sealed.stored_len,
            "Uploaded object"
        );

        Ok(Stored {
            digest,
            uploaded: true,
            plain_len: sealed.plain_len,
            stored_len: sealed.stored_len,
        })
    }

    /// Streams the plaintext of `digest` into `sink`, verifying that the
    /// downloaded ciphertext still hashes to its address.
    pub async fn download<W: Write>(&mut self, digest: &Digest, sink: W) -> Result<W> {
        let prefix = object_prefix(digest);
        let opened = pipeline::open_stream(
            self.remote.as_ref(),
            &prefix,
            &mut self.cipher,
            DOMAIN_OBJECT,
            sink,
        )
        .await?;

        if opened.digest != *digest {
            return Err(Error::integrity(
                prefix,
                format!("content hashes to {}", opened.digest.short_string()),
            ));
        }

        self.stats.downloaded_objects += 1;
        Ok(opened.sink)
    }

    /// Downloads and authenticates an object without keeping its content.
    pub async fn check(&mut self, digest: &Digest) -> Result<()> {
        self.download(digest, io::sink()).await.map(|_| ())
    }

    /// Deletes every object not in `live`, including incomplete leftovers
    /// of interrupted uploads. Returns the number of keys removed.
    pub async fn sweep(&mut self, live: &HashSet<Digest>) -> Result<usize> {
        let listing = self.listing().await?;
        let mut removed = 0;

        for (digest, names) in listing {
            if live.contains(&digest) {
                continue;
            }
            let prefix = object_prefix(&digest);
            for name in names {
                self.remote.delete(&format!("{}/{}", prefix, name)).await?;
                removed += 1;
            }
            self.known.remove(&digest);
            debug!(digest = %digest.short_string(), "Pruned unreferenced object");
        }

        if removed > 0 {
            info!(keys = removed, "Pruned unreferenced object blocks");
        }
        Ok(removed)
    }

    /// Groups the keys under `objects/` by digest. Keys that do not parse
    /// are left for the bucket sweep.
    async fn listing(&self) -> Result<BTreeMap<Digest, Vec<String>>> {
        let mut listing: BTreeMap<Digest, Vec<String>> = BTreeMap::new();
        for key in self.remote.list(OBJECTS_PREFIX).await? {
            let Some(rest) = key.strip_prefix(OBJECTS_PREFIX) else {
                continue;
            };
            let Some((digest, name)) = rest.split_once('/') else {
                continue;
            };
            let Ok(digest) = digest.parse::<Digest>() else {
                continue;
            };
            listing.entry(digest).or_default().push(name.to_string());
        }
        Ok(listing)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::test_key;
    use crate::remote::MemoryStore;
    use bytes::Bytes;

    fn config() -> EngineConfig {
        EngineConfig {
            block_size: 128,
            compression_level: 6,
            ..Default::default()
        }
    }

    async fn open(store: &Arc<MemoryStore>) -> ObjectStore {
        let remote: Arc<dyn RemoteStore> = store.clone();
        ObjectStore::open(remote, &test_key("pw"), &config()).await.unwrap()
    }

    #[tokio::test]
    async fn identical_content_is_stored_once() {
        let store = Arc::new(MemoryStore::new());
        let mut objects = open(&store).await;

        let first = objects.upload_reader(&mut &b"same content"[..]).await.unwrap();
        let puts = store.put_count();
        let second = objects.upload_reader(&mut &b"same content"[..]).await.unwrap();

        assert!(first.uploaded);
        assert!(!second.uploaded);
        assert_eq!(first.digest, second.digest);
        assert_eq!(store.put_count(), puts);
        assert_eq!(objects.stats().reused_files, 1);
        assert_eq!(objects.stats().deduplicated, 0);
    }

    #[tokio::test]
    async fn deduplicated_counts_distinct_existing_objects() {
        let store = Arc::new(MemoryStore::new());
        open(&store).await.upload_reader(&mut &b"old"[..]).await.unwrap();

        let mut objects = open(&store).await;
        objects.upload_reader(&mut &b"old"[..]).await.unwrap();
        objects.upload_reader(&mut &b"old"[..]).await.unwrap();
        objects.upload_reader(&mut &b"new"[..]).await.unwrap();
        objects.upload_reader(&mut &b"new"[..]).await.unwrap();

        let stats = objects.stats();
        assert_eq!(stats.uploaded_objects, 1);
        assert_eq!(stats.deduplicated, 1);
        assert_eq!(stats.reused_files, 3);
    }

    #[tokio::test]
    async fn reopened_store_sees_existing_objects() {
        let store = Arc::new(MemoryStore::new());
        let stored = open(&store).await.upload_reader(&mut &b"persisted"[..]).await.unwrap();

        let objects = open(&store).await;
        assert!(objects.contains(&stored.digest));
        assert_eq!(objects.len(), 1);
    }

    #[tokio::test]
    async fn upload_and_download_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bin");
        let content: Vec<u8> = (0..10_000u32).flat_map(|i| i.to_le_bytes()).collect();
        std::fs::write(&path, &content).unwrap();

        let store = Arc::new(MemoryStore::new());
        let mut objects = open(&store).await;
        let stored = objects.upload_file(&path).await.unwrap().unwrap();

        let restored = objects.download(&stored.digest, Vec::new()).await.unwrap();
        assert_eq!(restored, content);
        assert_eq!(stored.plain_len, content.len() as u64);
    }

    #[tokio::test]
    async fn vanished_file_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let mut objects = open(&store).await;

        let result = objects.upload_file(&dir.path().join("gone")).await.unwrap();
        assert!(result.is_none());
        assert_eq!(store.put_count(), 0);
    }

    #[tokio::test]
    async fn missing_object_is_not_found() {
        let store = Arc::new(MemoryStore::new());
        let mut objects = open(&store).await;
        let digest = Digest::from(blake3::hash(b"never stored"));

        assert!(matches!(objects.check(&digest).await, Err(Error::NotFound { .. })));
    }

    #[tokio::test]
    async fn tampered_object_fails_integrity() {
        let store = Arc::new(MemoryStore::new());
        let mut objects = open(&store).await;
        let stored = objects.upload_reader(&mut &b"precious"[..]).await.unwrap();

        let key = store.keys().into_iter().next().unwrap();
        let mut bytes = store.snapshot()[&key].to_vec();
        bytes[0] ^= 0xff;
        store.tamper(&key, Bytes::from(bytes));

        assert!(matches!(
            objects.check(&stored.digest).await,
            Err(Error::Integrity { .. })
        ));
    }

    #[tokio::test]
    async fn incomplete_upload_is_not_known_and_gets_swept() {
        let store = Arc::new(MemoryStore::new());
        let orphan = Digest::from(blake3::hash(b"orphan"));
        store
            .put(&format!("{}/000000000", object_prefix(&orphan)), Bytes::from_static(b"x"))
            .await
            .unwrap();

        let mut objects = open(&store).await;
        assert!(!objects.contains(&orphan));

        let kept = objects.upload_reader(&mut &b"live"[..]).await.unwrap();
        let dropped = objects.upload_reader(&mut &b"dead"[..]).await.unwrap();

        let live: HashSet<Digest> = [kept.digest].into_iter().collect();
        let removed = objects.sweep(&live).await.unwrap();

        assert!(removed >= 2);
        assert!(objects.contains(&kept.digest));
        assert!(!objects.contains(&dropped.digest));
        assert!(store.keys().iter().all(|k| k.contains(&kept.digest.to_hex())));
    }
}
