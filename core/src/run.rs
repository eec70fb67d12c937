use crate::config::EngineConfig;
use crate::crypto::EncryptionKey;
use crate::identity::SnapshotIdentity;
use crate::inventory::{Inventory, Scanned};
use crate::lock::{LOCK_KEY, LockCoordinator, LockMode, LockRecord, LockState, LockToken};
use crate::manifest::{MANIFESTS_PREFIX, Manifest, ManifestStore};
use crate::objects::{OBJECTS_PREFIX, ObjectStore, TransferStats};
use crate::remote::RemoteStore;
use crate::restore::Restorer;
use crate::types::{EntryKind, ManifestEntry};
use crate::{Digest, Error, Result};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Locking,
    Walking,
    Transferring,
    Finalizing,
    Released,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Locking => "locking",
            Self::Walking => "walking",
            Self::Transferring => "transferring",
            Self::Finalizing => "finalizing",
            Self::Released => "released",
        };
        f.write_str(name)
    }
}

/// Cooperative cancellation flag, polled between files and objects.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Observer for long-running commands.
pub trait Progress: Send + Sync {
    fn phase(&self, _phase: Phase) {}

    /// Number of work items the current phase will process.
    fn begin(&self, _total: u64) {}

    fn advance(&self, _path: &Path, _bytes: u64) {}

    fn finish(&self) {}
}

pub struct NoProgress;

impl Progress for NoProgress {}

#[derive(Debug, Clone, Default)]
pub struct CreateOptions {
    pub skip: Vec<PathBuf>,
    /// Replace a manifest that belongs to another identity or cannot be
    /// read with the current password.
    pub force: bool,
}

#[derive(Debug, Clone, Default)]
pub struct CreateReport {
    pub generation: String,
    pub entries: usize,
    pub skipped: usize,
    pub total_size: u64,
    pub transfer: TransferStats,
    pub pruned: usize,
}

#[derive(Debug, Clone, Default)]
pub struct RestoreReport {
    pub entries: usize,
    pub objects: usize,
    pub copies: usize,
    pub links: usize,
    pub total_size: u64,
}

#[derive(Debug, Clone)]
pub struct VerifyProblem {
    pub digest: Digest,
    pub paths: Vec<PathBuf>,
    pub kind: &'static str,
    pub message: String,
}

#[derive(Debug, Clone, Default)]
pub struct VerifyReport {
    pub entries: usize,
    pub checked: usize,
    pub problems: Vec<VerifyProblem>,
}

impl VerifyReport {
    pub fn is_ok(&self) -> bool {
        self.problems.is_empty()
    }
}

/// Drives create, restore and verify runs under the bucket lock.
pub struct RunController {
    remote: Arc<dyn RemoteStore>,
    config: EngineConfig,
    key: Option<Arc<EncryptionKey>>,
    cancel: CancelToken,
    progress: Arc<dyn Progress>,
    phase: Phase,
}

impl RunController {
    pub fn new(remote: Arc<dyn RemoteStore>, config: EngineConfig) -> Self {
        Self {
            remote,
            config,
            key: None,
            cancel: CancelToken::new(),
            progress: Arc::new(NoProgress),
            phase: Phase::Idle,
        }
    }

    pub fn with_key(mut self, key: EncryptionKey) -> Self {
        self.key = Some(Arc::new(key));
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_progress(mut self, progress: Arc<dyn Progress>) -> Self {
        self.progress = progress;
        self
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Backs up `source`, replacing the bucket's manifest.
    pub async fn create(&mut self, source: &Path, options: &CreateOptions) -> Result<CreateReport> {
        self.config.validate()?;
        self.key()?;
        let identity = SnapshotIdentity::resolve(source)?;
        info!(identity = %identity, "Starting create run");

        let (locks, token) = self.lock_for_run().await?;
        let result = self.create_locked(&identity, options).await;
        self.finish(&locks, &token, result).await
    }

    /// Restores the manifest into `target`, which must be empty.
    pub async fn restore(&mut self, target: &Path) -> Result<RestoreReport> {
        self.config.validate()?;
        self.key()?;
        let mut restorer = Restorer::prepare(target)?;
        info!(target = %target.display(), "Starting restore run");

        let (locks, token) = self.lock_for_run().await?;
        let result = self.restore_locked(&mut restorer).await;
        self.finish(&locks, &token, result).await
    }

    /// Downloads and authenticates every object the manifest references.
    /// Missing and corrupt objects are collected, not fatal.
    pub async fn verify(&mut self) -> Result<VerifyReport> {
        self.config.validate()?;
        self.key()?;
        info!("Starting verify run");

        let (locks, token) = self.lock_for_run().await?;
        let result = self.verify_locked().await;
        self.finish(&locks, &token, result).await
    }

    /// Takes a persistent lock that only [`RunController::unlock`] removes.
    pub async fn lock(&mut self) -> Result<LockRecord> {
        let locks = LockCoordinator::new(self.remote.clone());
        locks.acquire(&LockToken::generate(), LockMode::PersistentLock).await
    }

    /// Removes any lock record, whoever holds it.
    pub async fn unlock(&mut self) -> Result<Option<LockRecord>> {
        LockCoordinator::new(self.remote.clone()).force_unlock().await
    }

    pub async fn status(&self) -> Result<LockState> {
        LockCoordinator::new(self.remote.clone()).status().await
    }

    fn key(&self) -> Result<Arc<EncryptionKey>> {
        self.key
            .clone()
            .ok_or_else(|| Error::InvalidInput("a password is required for this command".to_string()))
    }

    fn set_phase(&mut self, phase: Phase) {
        debug!(from = %self.phase, to = %phase, "Run phase");
        self.phase = phase;
        self.progress.phase(phase);
    }

    async fn lock_for_run(&mut self) -> Result<(LockCoordinator, LockToken)> {
        self.set_phase(Phase::Locking);
        let locks = LockCoordinator::new(self.remote.clone());
        let token = LockToken::generate();
        if let Err(e) = locks.acquire(&token, LockMode::ExclusiveRun).await {
            self.set_phase(Phase::Idle);
            return Err(e);
        }
        Ok((locks, token))
    }

    /// Releases the run lock whatever the outcome of the run. A release
    /// failure after a failed run is logged and the run's error returned.
    async fn finish<T>(&mut self, locks: &LockCoordinator, token: &LockToken, result: Result<T>) -> Result<T> {
        let released = locks.release(token).await;
        self.set_phase(Phase::Released);
        self.progress.finish();

        match (result, released) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(e)) => Err(e),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(release)) => {
                error!(error = %release, "Failed to release bucket lock after failed run");
                Err(e)
            }
        }
    }

    fn check_cancelled(&self, completed: usize) -> Result<()> {
        if self.cancel.is_cancelled() {
            warn!(completed, "Cancellation requested, stopping run");
            return Err(Error::Interrupted { completed });
        }
        Ok(())
    }

    async fn create_locked(&mut self, identity: &SnapshotIdentity, options: &CreateOptions) -> Result<CreateReport> {
        let key = self.key()?;
        let manifests = ManifestStore::new(self.remote.clone(), &self.config);

        match manifests.current(&key).await {
            Ok(Some(previous)) if previous.identity.id != identity.id => {
                if !options.force {
                    return Err(Error::IdentityMismatch {
                        expected: identity.to_string(),
                        found: previous.identity.to_string(),
                    });
                }
                warn!(previous = %previous.identity, "Replacing manifest of another identity");
            }
            Ok(Some(previous)) => {
                debug!(entries = previous.entries.len(), "Found previous manifest");
            }
            Ok(None) => info!("Bucket holds no manifest yet"),
            Err(e @ (Error::Integrity { .. } | Error::CorruptManifest { .. })) if options.force => {
                warn!(error = %e, "Ignoring unreadable manifest");
            }
            Err(e) => return Err(e),
        }

        let mut objects = ObjectStore::open(self.remote.clone(), &key, &self.config).await?;

        self.set_phase(Phase::Walking);
        let inventory = Inventory::new(&identity.path, &options.skip)?;
        let scanned: Vec<Scanned> = inventory.walk().collect::<Result<_>>()?;
        info!(entries = scanned.len(), "Walked source tree");

        self.set_phase(Phase::Transferring);
        self.progress.begin(scanned.len() as u64);

        let mut manifest = Manifest::new(identity.clone());
        let mut report = CreateReport::default();
        let mut linked: HashMap<u64, Digest> = HashMap::new();

        for (completed, item) in scanned.into_iter().enumerate() {
            self.check_cancelled(completed)?;
            self.progress.advance(&item.relative, item.size);

            let known_link = item.link_group.and_then(|group| linked.get(&group).copied());
            let digest = if let Some(digest) = known_link {
                debug!(path = %item.relative.display(), "Hard link to a stored file");
                Some(digest)
            } else if item.is_file() && item.size > 0 {
                match objects.upload_file(&item.path).await {
                    Ok(Some(stored)) => {
                        if let Some(group) = item.link_group {
                            linked.insert(group, stored.digest);
                        }
                        Some(stored.digest)
                    }
                    Ok(None) => {
                        report.skipped += 1;
                        continue;
                    }
                    Err(Error::SourceChanged { path }) => {
                        warn!(path = %path.display(), "File changed while reading, leaving it out");
                        report.skipped += 1;
                        continue;
                    }
                    Err(e) => return Err(e),
                }
            } else {
                None
            };

            report.total_size += item.size;
            manifest.push(item.into_entry(digest));
        }

        self.check_cancelled(manifest.entries.len())?;
        self.set_phase(Phase::Finalizing);

        report.generation = manifests.publish(&key, &manifest).await?;
        report.entries = manifest.entries.len();

        match self.prune(&mut objects, &manifest.digests(), &report.generation).await {
            Ok(removed) => report.pruned = removed,
            Err(e) => warn!(error = %e, "Pruning unreferenced keys failed"),
        }
        report.transfer = objects.stats();

        info!(
            entries = report.entries,
            uploaded = report.transfer.uploaded_objects,
            deduplicated = report.transfer.deduplicated,
            pruned = report.pruned,
            "Create run complete"
        );
        Ok(report)
    }

    /// Deletes every key that is not the lock, the live manifest or a
    /// live object.
    async fn prune(&self, objects: &mut ObjectStore, live: &HashSet<Digest>, generation: &str) -> Result<usize> {
        let mut removed = objects.sweep(live).await?;
        let live_manifest = format!("{}{}/", MANIFESTS_PREFIX, generation);

        for key in self.remote.list("").await? {
            if key == LOCK_KEY || key.starts_with(&live_manifest) || is_object_key(&key) {
                continue;
            }
            self.remote.delete(&key).await?;
            debug!(key = %key, "Deleted foreign key");
            removed += 1;
        }
        Ok(removed)
    }

    async fn load_manifest(&self, key: &EncryptionKey) -> Result<Manifest> {
        let manifests = ManifestStore::new(self.remote.clone(), &self.config);
        manifests
            .current(key)
            .await?
            .ok_or_else(|| Error::not_found(MANIFESTS_PREFIX))
    }

    async fn restore_locked(&mut self, restorer: &mut Restorer) -> Result<RestoreReport> {
        let key = self.key()?;
        let manifest = self.load_manifest(&key).await?;
        let mut objects = ObjectStore::open(self.remote.clone(), &key, &self.config).await?;
        restorer.create_target()?;
        info!(summary = %manifest.summary(), "Restoring manifest");

        self.set_phase(Phase::Transferring);
        let groups = manifest.by_digest();
        self.progress.begin(groups.len() as u64);

        let mut report = RestoreReport::default();
        for (completed, (digest, entries)) in groups.iter().enumerate() {
            self.check_cancelled(completed)?;
            let Some((first, rest)) = entries.split_first() else {
                continue;
            };
            self.progress.advance(&first.path, first.size);

            let file = restorer.create_file(first)?;
            let mut writer = objects.download(digest, BufWriter::new(file)).await?;
            writer.flush()?;
            drop(writer);
            report.objects += 1;

            // One restored path per link group; later members become hard
            // links and share its inode, so only owners get metadata applied.
            let mut heads: HashMap<u64, &ManifestEntry> = HashMap::new();
            let mut owners = vec![*first];
            if let Some(group) = first.link_group {
                heads.insert(group, *first);
            }
            for entry in rest.iter().copied() {
                match entry.link_group.and_then(|group| heads.get(&group).copied()) {
                    Some(head) => {
                        restorer.hard_link(head, entry)?;
                        report.links += 1;
                    }
                    None => {
                        restorer.copy_from(first, entry)?;
                        report.copies += 1;
                        owners.push(entry);
                        if let Some(group) = entry.link_group {
                            heads.insert(group, entry);
                        }
                    }
                }
            }
            for entry in owners {
                restorer.apply_metadata(entry)?;
            }
            report.total_size += entries.iter().map(|entry| entry.size).sum::<u64>();
        }

        self.check_cancelled(report.objects)?;
        self.set_phase(Phase::Finalizing);
        let mut heads: HashMap<u64, &ManifestEntry> = HashMap::new();
        for entry in manifest.entries.iter().filter(|e| e.digest().is_none()) {
            match entry.link_group.and_then(|group| heads.get(&group).copied()) {
                Some(head) => {
                    restorer.hard_link(head, entry)?;
                    report.links += 1;
                }
                None => {
                    restore_without_object(restorer, entry)?;
                    if let Some(group) = entry.link_group {
                        heads.insert(group, entry);
                    }
                }
            }
        }

        report.entries = manifest.entries.len();
        info!(
            entries = report.entries,
            objects = report.objects,
            copies = report.copies,
            links = report.links,
            "Restore run complete"
        );
        Ok(report)
    }

    async fn verify_locked(&mut self) -> Result<VerifyReport> {
        let key = self.key()?;
        let manifest = self.load_manifest(&key).await?;
        let mut objects = ObjectStore::open(self.remote.clone(), &key, &self.config).await?;

        self.set_phase(Phase::Transferring);
        let groups = manifest.by_digest();
        self.progress.begin(groups.len() as u64);

        let mut report = VerifyReport {
            entries: manifest.entries.len(),
            ..Default::default()
        };

        for (completed, (digest, entries)) in groups.iter().enumerate() {
            self.check_cancelled(completed)?;
            if let Some(first) = entries.first() {
                self.progress.advance(&first.path, first.size);
            }

            match objects.check(digest).await {
                Ok(()) => report.checked += 1,
                Err(e @ (Error::Integrity { .. } | Error::NotFound { .. })) => {
                    let paths: Vec<PathBuf> = entries.iter().map(|entry| entry.path.clone()).collect();
                    error!(
                        digest = %digest.short_string(),
                        kind = e.kind(),
                        paths = paths.len(),
                        error = %e,
                        "Object failed verification"
                    );
                    report.problems.push(VerifyProblem {
                        digest: *digest,
                        paths,
                        kind: e.kind(),
                        message: e.to_string(),
                    });
                }
                Err(e) => return Err(e),
            }
        }

        self.set_phase(Phase::Finalizing);
        info!(
            checked = report.checked,
            problems = report.problems.len(),
            "Verify run complete"
        );
        Ok(report)
    }
}

fn restore_without_object(restorer: &mut Restorer, entry: &ManifestEntry) -> Result<()> {
    match &entry.kind {
        EntryKind::Symlink { .. } => restorer.create_symlink(entry)?,
        EntryKind::File { .. } => drop(restorer.create_file(entry)?),
    }
    restorer.apply_metadata(entry)
}

fn is_object_key(key: &str) -> bool {
    key.strip_prefix(OBJECTS_PREFIX)
        .and_then(|rest| rest.split_once('/'))
        .is_some_and(|(digest, _)| digest.parse::<Digest>().is_ok())
}
