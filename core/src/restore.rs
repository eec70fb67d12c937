use crate::types::{EntryKind, ManifestEntry, Principal};
use crate::{Error, Result};
use nix::unistd::{Group, User};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions, Permissions};
use std::os::unix::fs::{PermissionsExt, lchown, symlink};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

/// Recreates manifest entries below a restore target.
pub struct Restorer {
    target: PathBuf,
    uids: HashMap<String, Option<u32>>,
    gids: HashMap<String, Option<u32>>,
}

impl Restorer {
    /// Checks that `target` is an empty directory or does not exist yet.
    /// Nothing is written until [`Restorer::create_target`].
    pub fn prepare(target: &Path) -> Result<Self> {
        match fs::read_dir(target) {
            Ok(mut entries) => {
                if entries.next().is_some() {
                    return Err(Error::TargetNotEmpty {
                        path: target.to_path_buf(),
                    });
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotADirectory => {
                return Err(Error::TargetNotEmpty {
                    path: target.to_path_buf(),
                });
            }
            Err(e) => return Err(e.into()),
        }

        Ok(Self {
            target: target.to_path_buf(),
            uids: HashMap::new(),
            gids: HashMap::new(),
        })
    }

    pub fn target(&self) -> &Path {
        &self.target
    }

    pub fn create_target(&self) -> Result<()> {
        fs::create_dir_all(&self.target)?;
        Ok(())
    }

    pub fn destination(&self, entry: &ManifestEntry) -> PathBuf {
        self.target.join(&entry.path)
    }

    /// Creates the file for `entry`, and any missing parent directories.
    pub fn create_file(&self, entry: &ManifestEntry) -> Result<File> {
        let path = self.prepare_parent(entry)?;
        Ok(OpenOptions::new().write(true).create_new(true).open(path)?)
    }

    /// Fills `entry` with the content already restored for `source`.
    pub fn copy_from(&self, source: &ManifestEntry, entry: &ManifestEntry) -> Result<()> {
        let path = self.prepare_parent(entry)?;
        fs::copy(self.destination(source), &path)?;
        Ok(())
    }

    /// Makes `entry` another name for the file already restored for `source`.
    pub fn hard_link(&self, source: &ManifestEntry, entry: &ManifestEntry) -> Result<()> {
        let path = self.prepare_parent(entry)?;
        fs::hard_link(self.destination(source), &path)?;
        Ok(())
    }

    pub fn create_symlink(&self, entry: &ManifestEntry) -> Result<()> {
        let EntryKind::Symlink { target } = &entry.kind else {
            return Err(Error::InvalidInput(format!(
                "{} is not a symlink",
                entry.path.display()
            )));
        };
        let path = self.prepare_parent(entry)?;
        symlink(target, &path)?;
        Ok(())
    }

    /// Applies modification time, ownership and mode, in that order, so
    /// the file is still writable while its time is set and a chown cannot
    /// clear set-id bits afterwards. Ownership problems only warn.
    pub fn apply_metadata(&mut self, entry: &ManifestEntry) -> Result<()> {
        let path = self.destination(entry);

        if entry.is_file() {
            let file = OpenOptions::new().write(true).open(&path)?;
            file.set_modified(system_time(entry.mtime, entry.mtime_nsec))?;
        }

        let uid = self.resolve_uid(&entry.owner);
        let gid = self.resolve_gid(&entry.group);
        if let Err(e) = lchown(&path, Some(uid), Some(gid)) {
            warn!(
                path = %path.display(),
                owner = %entry.owner,
                group = %entry.group,
                error = %e,
                "Cannot set ownership, keeping the invoking user"
            );
        }

        if entry.is_file() {
            fs::set_permissions(&path, Permissions::from_mode(entry.mode & 0o7777))?;
        }

        debug!(path = %path.display(), mode = format!("{:o}", entry.mode), "Restored entry");
        Ok(())
    }

    fn prepare_parent(&self, entry: &ManifestEntry) -> Result<PathBuf> {
        let path = self.destination(entry);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(path)
    }

    fn resolve_uid(&mut self, owner: &Principal) -> u32 {
        let Some(name) = &owner.name else {
            return owner.id;
        };
        let resolved = *self.uids.entry(name.clone()).or_insert_with(|| {
            let uid = User::from_name(name).ok().flatten().map(|u| u.uid.as_raw());
            if uid.is_none() {
                warn!(user = %name, uid = owner.id, "Unknown user, falling back to numeric id");
            }
            uid
        });
        resolved.unwrap_or(owner.id)
    }

    fn resolve_gid(&mut self, group: &Principal) -> u32 {
        let Some(name) = &group.name else {
            return group.id;
        };
        let resolved = *self.gids.entry(name.clone()).or_insert_with(|| {
            let gid = Group::from_name(name).ok().flatten().map(|g| g.gid.as_raw());
            if gid.is_none() {
                warn!(group = %name, gid = group.id, "Unknown group, falling back to numeric id");
            }
            gid
        });
        resolved.unwrap_or(group.id)
    }
}

fn system_time(secs: i64, nsec: u32) -> SystemTime {
    let nanos = Duration::from_nanos(u64::from(nsec));
    if secs >= 0 {
        UNIX_EPOCH + Duration::from_secs(secs as u64) + nanos
    } else {
        UNIX_EPOCH - Duration::from_secs(secs.unsigned_abs()) + nanos
    }
}
