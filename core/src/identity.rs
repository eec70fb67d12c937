use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

const IDENTITY_CONTEXT: &str = "onesnap 2024 snapshot identity v1";

/// Stable identity of the `(hostname, path, inode)` a bucket backs up.
///
/// The inode keeps a freshly provisioned host with the same hostname and
/// path from silently taking over another machine's bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotIdentity {
    pub id: String,
    pub hostname: String,
    pub path: PathBuf,
    pub inode: u64,
}

impl SnapshotIdentity {
    /// Resolves the identity of `path` on this host.
    pub fn resolve(path: &Path) -> Result<Self> {
        let absolute = path.canonicalize().map_err(|e| {
            Error::InvalidInput(format!("cannot resolve {}: {}", path.display(), e))
        })?;
        let metadata = std::fs::metadata(&absolute).map_err(|e| {
            Error::InvalidInput(format!("cannot stat {}: {}", absolute.display(), e))
        })?;

        let hostname = hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .map_err(|e| Error::InvalidInput(format!("cannot determine hostname: {}", e)))?;

        Ok(derive_identity(&hostname, &absolute, metadata.ino()))
    }

    pub fn short_id(&self) -> String {
        self.id.chars().take(12).collect()
    }
}

impl fmt::Display for SnapshotIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{} [{}]",
            self.hostname,
            self.path.display(),
            self.inode,
            self.short_id()
        )
    }
}

/// Pure identity derivation. Every component is length-prefixed so distinct
/// triples never encode to the same input.
pub fn derive_identity(hostname: &str, path: &Path, inode: u64) -> SnapshotIdentity {
    let mut hasher = blake3::Hasher::new_derive_key(IDENTITY_CONTEXT);

    let host = hostname.as_bytes();
    hasher.update(&(host.len() as u64).to_le_bytes());
    hasher.update(host);

    let path_bytes = path.as_os_str().as_bytes();
    hasher.update(&(path_bytes.len() as u64).to_le_bytes());
    hasher.update(path_bytes);

    hasher.update(&inode.to_le_bytes());

    SnapshotIdentity {
        id: hasher.finalize().to_hex().to_string(),
        hostname: hostname.to_string(),
        path: path.to_path_buf(),
        inode,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn same_triple_same_identity() {
        let a = derive_identity("web01", Path::new("/srv/data"), 42);
        let b = derive_identity("web01", Path::new("/srv/data"), 42);
        assert_eq!(a, b);
    }

    #[test]
    fn inode_separates_identities() {
        let a = derive_identity("web01", Path::new("/srv/data"), 42);
        let b = derive_identity("web01", Path::new("/srv/data"), 43);
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn boundaries_are_unambiguous() {
        let a = derive_identity("web01:", Path::new("/srv"), 1);
        let b = derive_identity("web01", Path::new(":/srv"), 1);
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn resolve_missing_path_is_invalid_input() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("does-not-exist");
        assert!(matches!(
            SnapshotIdentity::resolve(&missing),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn resolve_is_stable_across_calls() {
        let dir = tempfile::tempdir().unwrap();
        let first = SnapshotIdentity::resolve(dir.path()).unwrap();
        let second = SnapshotIdentity::resolve(dir.path()).unwrap();
        assert_eq!(first, second);
        assert!(first.path.is_absolute());
    }

    proptest! {
        #[test]
        fn distinct_triples_never_collide(
            host_a in "[a-z0-9.:-]{0,12}",
            host_b in "[a-z0-9.:-]{0,12}",
            path_a in "/[a-z0-9/:]{0,16}",
            path_b in "/[a-z0-9/:]{0,16}",
            inode_a in any::<u64>(),
            inode_b in any::<u64>(),
        ) {
            let a = derive_identity(&host_a, Path::new(&path_a), inode_a);
            let b = derive_identity(&host_b, Path::new(&path_b), inode_b);
            let same_triple = host_a == host_b && path_a == path_b && inode_a == inode_b;
            prop_assert_eq!(a.id == b.id, same_triple);
        }
    }
}
