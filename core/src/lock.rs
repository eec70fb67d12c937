use crate::remote::RemoteStore;
use crate::{Error, Result};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Key of the single lock record. Stored as plain JSON so that `status`
/// and `unlock` work without the password.
pub const LOCK_KEY: &str = "lock";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LockMode {
    ExclusiveRun,
    PersistentLock,
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ExclusiveRun => f.write_str("exclusive-run"),
            Self::PersistentLock => f.write_str("persistent-lock"),
        }
    }
}

/// Identifies one holder of the lock.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LockToken(String);

impl LockToken {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LockToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    pub token: LockToken,
    pub mode: LockMode,
    pub acquired_at: DateTime<Utc>,
    pub hostname: String,
    pub pid: u32,
}

impl LockRecord {
    fn new(token: LockToken, mode: LockMode) -> Self {
        let hostname = hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "unknown".to_string());

        Self {
            token,
            mode,
            acquired_at: Utc::now(),
            hostname,
            pid: std::process::id(),
        }
    }

    pub fn holder(&self) -> String {
        format!("{} (pid {}, token {})", self.hostname, self.pid, self.token)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockState {
    Unlocked,
    LockedByRun(LockRecord),
    LockedPersistent(LockRecord),
}

impl LockState {
    pub fn is_locked(&self) -> bool {
        !matches!(self, Self::Unlocked)
    }
}

impl fmt::Display for LockState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unlocked => f.write_str("unlocked"),
            Self::LockedByRun(record) => write!(
                f,
                "locked by a running job on {} since {}",
                record.holder(),
                record.acquired_at.format("%Y-%m-%d %H:%M:%S UTC")
            ),
            Self::LockedPersistent(record) => write!(
                f,
                "locked persistently by {} since {}",
                record.holder(),
                record.acquired_at.format("%Y-%m-%d %H:%M:%S UTC")
            ),
        }
    }
}

/// Mutual exclusion through a single record in the bucket.
///
/// There is no expiry: a record left behind by a crashed run stays until an
/// operator removes it with [`LockCoordinator::force_unlock`].
pub struct LockCoordinator {
    remote: Arc<dyn RemoteStore>,
}

impl LockCoordinator {
    pub fn new(remote: Arc<dyn RemoteStore>) -> Self {
        Self { remote }
    }

    pub async fn read(&self) -> Result<Option<LockRecord>> {
        match self.remote.get(LOCK_KEY).await {
            Ok(data) => {
                let record = serde_json::from_slice(&data)?;
                Ok(Some(record))
            }
            Err(Error::NotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn status(&self) -> Result<LockState> {
        Ok(match self.read().await? {
            None => LockState::Unlocked,
            Some(record) => match record.mode {
                LockMode::ExclusiveRun => LockState::LockedByRun(record),
                LockMode::PersistentLock => LockState::LockedPersistent(record),
            },
        })
    }

    /// Check-then-write acquisition. Fails without writing anything if a
    /// record held by another token exists.
    pub async fn acquire(&self, token: &LockToken, mode: LockMode) -> Result<LockRecord> {
        if let Some(existing) = self.read().await? {
            if existing.token != *token {
                return Err(Error::AlreadyLocked {
                    holder: existing.holder(),
                    mode: existing.mode.to_string(),
                    since: existing.acquired_at.to_rfc3339(),
                });
            }
            debug!(token = %token, "Lock already held by this token, refreshing");
        }

        let record = LockRecord::new(token.clone(), mode);
        let data = serde_json::to_vec_pretty(&record)?;
        self.remote.put(LOCK_KEY, Bytes::from(data)).await?;

        info!(mode = %mode, token = %token, "Acquired bucket lock");
        Ok(record)
    }

    pub async fn release(&self, token: &LockToken) -> Result<()> {
        match self.read().await? {
            Some(existing) if existing.token == *token => {
                self.remote.delete(LOCK_KEY).await?;
                info!(token = %token, "Released bucket lock");
                Ok(())
            }
            Some(existing) => Err(Error::NotHolder {
                found: existing.holder(),
            }),
            None => Err(Error::NotHolder {
                found: "no lock record".to_string(),
            }),
        }
    }

    /// Deletes the lock record regardless of its holder. Returns the record
    /// that was removed, if it could be read.
    pub async fn force_unlock(&self) -> Result<Option<LockRecord>> {
        let previous = match self.read().await {
            Ok(previous) => previous,
            Err(Error::Serialization(e)) => {
                warn!(error = %e, "Lock record is unreadable, removing it anyway");
                None
            }
            Err(e) => return Err(e),
        };

        self.remote.delete(LOCK_KEY).await?;
        match &previous {
            Some(record) => warn!(holder = %record.holder(), "Forcibly removed bucket lock"),
            None => info!("No readable lock record, unlock was a no-op"),
        }
        Ok(previous)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::MemoryStore;

    fn coordinator() -> (Arc<MemoryStore>, LockCoordinator) {
        let store = Arc::new(MemoryStore::new());
        let remote: Arc<dyn RemoteStore> = store.clone();
        (store, LockCoordinator::new(remote))
    }

    #[tokio::test]
    async fn acquire_and_release() {
        let (store, locks) = coordinator();
        let token = LockToken::generate();

        assert_eq!(locks.status().await.unwrap(), LockState::Unlocked);
        locks.acquire(&token, LockMode::ExclusiveRun).await.unwrap();
        assert!(matches!(locks.status().await.unwrap(), LockState::LockedByRun(_)));

        locks.release(&token).await.unwrap();
        assert_eq!(locks.status().await.unwrap(), LockState::Unlocked);
        assert!(store.keys().is_empty());
    }

    #[tokio::test]
    async fn second_holder_is_rejected_without_writes() {
        let (store, locks) = coordinator();
        locks
            .acquire(&LockToken::generate(), LockMode::ExclusiveRun)
            .await
            .unwrap();
        let writes = store.write_count();

        let result = locks.acquire(&LockToken::generate(), LockMode::ExclusiveRun).await;
        assert!(matches!(result, Err(Error::AlreadyLocked { .. })));
        assert_eq!(store.write_count(), writes);
    }

    #[tokio::test]
    async fn same_token_may_reacquire() {
        let (_, locks) = coordinator();
        let token = LockToken::generate();
        locks.acquire(&token, LockMode::ExclusiveRun).await.unwrap();
        locks.acquire(&token, LockMode::PersistentLock).await.unwrap();
        assert!(matches!(
            locks.status().await.unwrap(),
            LockState::LockedPersistent(_)
        ));
    }

    #[tokio::test]
    async fn release_with_foreign_token_fails() {
        let (_, locks) = coordinator();
        locks
            .acquire(&LockToken::generate(), LockMode::PersistentLock)
            .await
            .unwrap();

        let result = locks.release(&LockToken::generate()).await;
        assert!(matches!(result, Err(Error::NotHolder { .. })));
        assert!(locks.status().await.unwrap().is_locked());
    }

    #[tokio::test]
    async fn release_without_record_fails() {
        let (_, locks) = coordinator();
        assert!(matches!(
            locks.release(&LockToken::generate()).await,
            Err(Error::NotHolder { .. })
        ));
    }

    #[tokio::test]
    async fn force_unlock_ignores_token_and_garbage() {
        let (store, locks) = coordinator();
        locks
            .acquire(&LockToken::generate(), LockMode::PersistentLock)
            .await
            .unwrap();

        let removed = locks.force_unlock().await.unwrap();
        assert!(removed.is_some());
        assert_eq!(locks.status().await.unwrap(), LockState::Unlocked);

        store.tamper(LOCK_KEY, Bytes::from_static(b"not json"));
        assert!(locks.force_unlock().await.unwrap().is_none());
        assert!(store.keys().is_empty());
    }
}
