use crate::config::EngineConfig;
use crate::crypto::{BlockCipher, DOMAIN_MANIFEST, EncryptionKey};
use crate::identity::SnapshotIdentity;
use crate::pipeline::{self, sealed_block_count};
use crate::remote::RemoteStore;
use crate::types::{EntryKind, ManifestEntry};
use crate::{Digest, Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::io::{BufReader, BufWriter, Seek, SeekFrom, Write};
use std::path::{Component, Path};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const MANIFEST_VERSION: u32 = 1;
pub const MANIFESTS_PREFIX: &str = "manifests/";

/// The complete snapshot state of one bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub version: u32,
    pub identity: SnapshotIdentity,
    pub created_at: DateTime<Utc>,
    pub entries: Vec<ManifestEntry>,
}

impl Manifest {
    pub fn new(identity: SnapshotIdentity) -> Self {
        Self {
            version: MANIFEST_VERSION,
            identity,
            created_at: Utc::now(),
            entries: Vec::new(),
        }
    }

    pub fn push(&mut self, entry: ManifestEntry) {
        self.entries.push(entry);
    }

    /// Every object the manifest keeps alive.
    pub fn digests(&self) -> HashSet<Digest> {
        self.entries.iter().filter_map(|e| e.digest().copied()).collect()
    }

    /// Entries grouped by the object they resolve to, in first-seen order
    /// of the digests.
    pub fn by_digest(&self) -> Vec<(Digest, Vec<&ManifestEntry>)> {
        let mut order = Vec::new();
        let mut groups: HashMap<Digest, Vec<&ManifestEntry>> = HashMap::new();
        for entry in &self.entries {
            if let Some(digest) = entry.digest() {
                groups
                    .entry(*digest)
                    .or_insert_with(|| {
                        order.push(*digest);
                        Vec::new()
                    })
                    .push(entry);
            }
        }
        order
            .into_iter()
            .filter_map(|digest| groups.remove(&digest).map(|entries| (digest, entries)))
            .collect()
    }

    pub fn total_size(&self) -> u64 {
        self.entries.iter().map(|e| e.size).sum()
    }

    pub fn file_count(&self) -> usize {
        self.entries.iter().filter(|e| e.is_file()).count()
    }

    pub fn symlink_count(&self) -> usize {
        self.entries.iter().filter(|e| e.is_symlink()).count()
    }

    pub fn summary(&self) -> String {
        format!(
            "{} files, {} symlinks, {} objects, {} bytes from {} at {}",
            self.file_count(),
            self.symlink_count(),
            self.digests().len(),
            self.total_size(),
            self.identity,
            self.created_at.format("%Y-%m-%d %H:%M:%S UTC")
        )
    }

    /// Structural checks applied to every manifest read from the bucket.
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.version != MANIFEST_VERSION {
            return Err(format!("unsupported format version {}", self.version));
        }

        let mut seen = HashSet::new();
        for entry in &self.entries {
            if !is_safe_relative(&entry.path) {
                return Err(format!("unsafe entry path {}", entry.path.display()));
            }
            if !seen.insert(entry.path.as_path()) {
                return Err(format!("duplicate entry path {}", entry.path.display()));
            }
            if let EntryKind::File { digest: None } = entry.kind {
                if entry.size != 0 {
                    return Err(format!(
                        "non-empty file {} has no object",
                        entry.path.display()
                    ));
                }
            }
            if entry.link_group.is_some() && !entry.is_file() {
                return Err(format!("{} is linked but not a file", entry.path.display()));
            }
        }
        Ok(())
    }
}

fn is_safe_relative(path: &Path) -> bool {
    path.components().next().is_some()
        && path.components().all(|c| matches!(c, Component::Normal(_)))
}

/// One stored manifest, complete or not.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Generation {
    pub id: String,
    pub keys: Vec<String>,
    pub complete: bool,
}

impl Generation {
    fn new_id(created_at: DateTime<Utc>) -> String {
        format!(
            "{:013}-{}",
            created_at.timestamp_millis().max(0),
            uuid::Uuid::new_v4().simple()
        )
    }

    fn prefix(&self) -> String {
        generation_prefix(&self.id)
    }
}

fn generation_prefix(id: &str) -> String {
    format!("{}{}", MANIFESTS_PREFIX, id)
}

/// Reads and replaces the bucket's manifest.
///
/// A manifest is written as a new generation and only then are older
/// generations deleted, so an interruption at any point leaves either the
/// old or the new manifest readable, never neither.
pub struct ManifestStore {
    remote: Arc<dyn RemoteStore>,
    config: EngineConfig,
}

impl ManifestStore {
    pub fn new(remote: Arc<dyn RemoteStore>, config: &EngineConfig) -> Self {
        Self {
            remote,
            config: config.clone(),
        }
    }

    /// All generations, oldest first.
    pub async fn generations(&self) -> Result<Vec<Generation>> {
        let mut grouped: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for key in self.remote.list(MANIFESTS_PREFIX).await? {
            let Some(rest) = key.strip_prefix(MANIFESTS_PREFIX) else {
                continue;
            };
            let Some((id, _)) = rest.split_once('/') else {
                continue;
            };
            grouped.entry(id.to_string()).or_default().push(key.clone());
        }

        Ok(grouped
            .into_iter()
            .map(|(id, keys)| {
                let prefix = format!("{}/", generation_prefix(&id));
                let complete = sealed_block_count(
                    keys.iter().filter_map(|k| k.strip_prefix(prefix.as_str())),
                )
                .is_some();
                Generation { id, keys, complete }
            })
            .collect())
    }

    /// The newest complete manifest, if any.
    pub async fn current(&self, key: &EncryptionKey) -> Result<Option<Manifest>> {
        let generations = self.generations().await?;
        let Some(live) = generations.iter().rev().find(|g| g.complete) else {
            if !generations.is_empty() {
                warn!(
                    generations = generations.len(),
                    "Bucket only holds incomplete manifests"
                );
            }
            return Ok(None);
        };

        let mut cipher = BlockCipher::new(key)?;
        let opened = pipeline::open_stream(
            self.remote.as_ref(),
            &live.prefix(),
            &mut cipher,
            DOMAIN_MANIFEST,
            BufWriter::new(tempfile::tempfile()?),
        )
        .await?;
        let mut spool = opened.sink.into_inner().map_err(|e| e.into_error())?;
        spool.seek(SeekFrom::Start(0))?;

        let manifest: Manifest =
            serde_json::from_reader(BufReader::new(spool)).map_err(|e| Error::CorruptManifest {
                generation: live.id.clone(),
                reason: e.to_string(),
            })?;
        manifest
            .validate()
            .map_err(|reason| Error::CorruptManifest {
                generation: live.id.clone(),
                reason,
            })?;

        debug!(generation = %live.id, entries = manifest.entries.len(), "Loaded manifest");
        Ok(Some(manifest))
    }

    /// Writes `manifest` as a new generation, then deletes every other one.
    /// Returns the id of the new generation.
    pub async fn publish(&self, key: &EncryptionKey, manifest: &Manifest) -> Result<String> {
        let previous = self.generations().await?;

        let mut cipher = BlockCipher::new(key)?;
        let mut sealed = pipeline::spool_with(&mut cipher, DOMAIN_MANIFEST, &self.config, |writer| {
            let mut buffered = BufWriter::new(writer);
            serde_json::to_writer(&mut buffered, manifest)?;
            buffered.flush()?;
            Ok(())
        })?;

        let id = Generation::new_id(manifest.created_at);
        let prefix = generation_prefix(&id);
        pipeline::upload_spool(self.remote.as_ref(), &prefix, &mut sealed, self.config.block_size).await?;
        info!(generation = %id, entries = manifest.entries.len(), "Published manifest");

        for generation in previous.iter().filter(|g| g.id != id) {
            for key in &generation.keys {
                self.remote.delete(key).await?;
            }
            debug!(generation = %generation.id, "Deleted superseded manifest");
        }

        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::test_key;
    use crate::identity::derive_identity;
    use crate::remote::MemoryStore;
    use crate::types::Principal;
    use bytes::Bytes;
    use std::path::PathBuf;

    fn entry(path: &str, content: &[u8]) -> ManifestEntry {
        ManifestEntry {
            path: PathBuf::from(path),
            kind: EntryKind::File {
                digest: Some(Digest::from(blake3::hash(content))),
            },
            mode: 0o100644,
            owner: Principal::new(Some("root".into()), 0),
            group: Principal::new(Some("root".into()), 0),
            size: content.len() as u64,
            mtime: 1_700_000_000,
            mtime_nsec: 0,
            link_group: None,
        }
    }

    fn manifest() -> Manifest {
        let mut manifest = Manifest::new(derive_identity("host", Path::new("/data"), 7));
        manifest.push(entry("a.txt", b"A"));
        manifest.push(entry("sub/b.txt", b"A"));
        manifest.push(entry("c.txt", b"B"));
        manifest
    }

    fn store() -> (Arc<MemoryStore>, ManifestStore) {
        let memory = Arc::new(MemoryStore::new());
        let remote: Arc<dyn RemoteStore> = memory.clone();
        let config = EngineConfig {
            block_size: 64,
            ..Default::default()
        };
        (memory, ManifestStore::new(remote, &config))
    }

    #[test]
    fn groups_entries_by_digest() {
        let manifest = manifest();
        let groups = manifest.by_digest();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].1.len(), 2);
        assert_eq!(manifest.digests().len(), 2);
    }

    #[test]
    fn rejects_escaping_paths() {
        let mut manifest = manifest();
        manifest.push(entry("../etc/passwd", b"x"));
        assert!(manifest.validate().is_err());
    }

    #[tokio::test]
    async fn publish_then_read() {
        let (_, manifests) = store();
        let key = test_key("pw");
        assert!(manifests.current(&key).await.unwrap().is_none());

        let original = manifest();
        manifests.publish(&key, &original).await.unwrap();
        assert_eq!(manifests.current(&key).await.unwrap(), Some(original));
    }

    #[test]
    fn link_group_on_a_symlink_is_rejected() {
        let mut manifest = manifest();
        manifest.push(ManifestEntry {
            kind: EntryKind::Symlink {
                target: PathBuf::from("a.txt"),
            },
            link_group: Some(0),
            ..entry("link", b"")
        });
        assert!(manifest.validate().is_err());
    }

    #[tokio::test]
    async fn large_manifest_spans_many_blocks() {
        let (memory, manifests) = store();
        let key = test_key("pw");
        let mut large = Manifest::new(derive_identity("host", Path::new("/data"), 7));
        for i in 0..500u32 {
            let mut item = entry(&format!("dir{}/file{}.bin", i % 17, i), &i.to_be_bytes());
            item.link_group = (i % 5 == 0).then_some(u64::from(i / 5));
            large.push(item);
        }

        let id = manifests.publish(&key, &large).await.unwrap();
        let blocks = memory
            .keys()
            .iter()
            .filter(|k| k.starts_with(&format!("manifests/{}/", id)))
            .count();
        assert!(blocks > 10);
        assert_eq!(manifests.current(&key).await.unwrap(), Some(large));
    }

    #[tokio::test]
    async fn publishing_replaces_previous_generation() {
        let (_, manifests) = store();
        let key = test_key("pw");

        manifests.publish(&key, &manifest()).await.unwrap();
        let mut newer = manifest();
        newer.push(entry("d.txt", b"D"));
        let id = manifests.publish(&key, &newer).await.unwrap();

        let generations = manifests.generations().await.unwrap();
        assert_eq!(generations.len(), 1);
        assert_eq!(generations[0].id, id);
        assert_eq!(manifests.current(&key).await.unwrap().unwrap().entries.len(), 4);
    }

    #[tokio::test]
    async fn incomplete_newer_generation_is_ignored() {
        let (memory, manifests) = store();
        let key = test_key("pw");
        let original = manifest();
        manifests.publish(&key, &original).await.unwrap();

        memory
            .put("manifests/9999999999999-dead/000000000", Bytes::from_static(b"partial"))
            .await
            .unwrap();

        assert_eq!(manifests.current(&key).await.unwrap(), Some(original));
        manifests.publish(&key, &manifest()).await.unwrap();
        assert!(memory.keys().iter().all(|k| !k.contains("dead")));
    }

    #[tokio::test]
    async fn wrong_password_is_an_integrity_error() {
        let (_, manifests) = store();
        manifests.publish(&test_key("pw"), &manifest()).await.unwrap();

        assert!(matches!(
            manifests.current(&test_key("other")).await,
            Err(Error::Integrity { .. })
        ));
    }

    #[tokio::test]
    async fn unknown_version_is_corrupt() {
        let (_, manifests) = store();
        let key = test_key("pw");
        let mut future = manifest();
        future.version = 99;
        manifests.publish(&key, &future).await.unwrap();

        assert!(matches!(
            manifests.current(&key).await,
            Err(Error::CorruptManifest { .. })
        ));
    }
}
