use crate::types::{EntryKind, ManifestEntry, Principal};
use crate::{Digest, Error, Result};
use nix::unistd::{Gid, Group, Uid, User};
use std::collections::HashMap;
use std::io;
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::{DirEntry, WalkDir};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScannedKind {
    File,
    Symlink { target: PathBuf },
}

/// A file or symlink found under the snapshot root, with the metadata the
/// manifest records for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scanned {
    pub path: PathBuf,
    pub relative: PathBuf,
    pub kind: ScannedKind,
    pub mode: u32,
    pub owner: Principal,
    pub group: Principal,
    pub size: u64,
    pub mtime: i64,
    pub mtime_nsec: u32,
    /// Set for regular files with more than one link. Paths to the same
    /// file share the group.
    pub link_group: Option<u64>,
}

impl Scanned {
    pub fn is_file(&self) -> bool {
        self.kind == ScannedKind::File
    }

    pub fn into_entry(self, digest: Option<Digest>) -> ManifestEntry {
        let kind = match self.kind {
            ScannedKind::File => EntryKind::File { digest },
            ScannedKind::Symlink { target } => EntryKind::Symlink { target },
        };
        ManifestEntry {
            path: self.relative,
            kind,
            mode: self.mode,
            owner: self.owner,
            group: self.group,
            size: self.size,
            mtime: self.mtime,
            mtime_nsec: self.mtime_nsec,
            link_group: self.link_group,
        }
    }
}

/// uid/gid to name lookups, cached for the duration of a walk.
#[derive(Debug, Default)]
pub struct NameCache {
    users: HashMap<u32, Option<String>>,
    groups: HashMap<u32, Option<String>>,
}

impl NameCache {
    pub fn owner(&mut self, uid: u32) -> Principal {
        let name = self
            .users
            .entry(uid)
            .or_insert_with(|| match User::from_uid(Uid::from_raw(uid)) {
                Ok(user) => user.map(|u| u.name),
                Err(e) => {
                    debug!(uid, error = %e, "User lookup failed");
                    None
                }
            })
            .clone();
        Principal::new(name, uid)
    }

    pub fn group(&mut self, gid: u32) -> Principal {
        let name = self
            .groups
            .entry(gid)
            .or_insert_with(|| match Group::from_gid(Gid::from_raw(gid)) {
                Ok(group) => group.map(|g| g.name),
                Err(e) => {
                    debug!(gid, error = %e, "Group lookup failed");
                    None
                }
            })
            .clone();
        Principal::new(name, gid)
    }
}

/// The set of paths a create run backs up.
pub struct Inventory {
    root: PathBuf,
    skip: Vec<PathBuf>,
}

impl Inventory {
    /// `skip` entries are relative to `root` unless absolute; each one
    /// excludes the path and everything below it.
    pub fn new(root: &Path, skip: &[PathBuf]) -> Result<Self> {
        let metadata = std::fs::metadata(root).map_err(|e| {
            Error::InvalidInput(format!("cannot stat {}: {}", root.display(), e))
        })?;
        if !metadata.is_dir() {
            return Err(Error::InvalidInput(format!(
                "{} is not a directory",
                root.display()
            )));
        }

        let skip = skip
            .iter()
            .map(|p| if p.is_absolute() { p.clone() } else { root.join(p) })
            .collect();

        Ok(Self {
            root: root.to_path_buf(),
            skip,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Walks the tree in file-name order without following symlinks.
    pub fn walk(&self) -> Walk {
        let skip = self.skip.clone();
        let entries = WalkDir::new(&self.root)
            .min_depth(1)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(move |entry| {
                let skipped = skip.iter().any(|s| entry.path() == s);
                if skipped {
                    debug!(path = %entry.path().display(), "Skipping excluded path");
                }
                !skipped
            });

        Walk {
            root: self.root.clone(),
            entries: Box::new(entries),
            names: NameCache::default(),
            links: HashMap::new(),
        }
    }
}

pub struct Walk {
    root: PathBuf,
    entries: Box<dyn Iterator<Item = walkdir::Result<DirEntry>> + Send>,
    names: NameCache,
    links: HashMap<(u64, u64), u64>,
}

impl Walk {
    fn scan(&mut self, entry: DirEntry) -> Result<Option<Scanned>> {
        let path = entry.path();
        let file_type = entry.file_type();

        if file_type.is_dir() {
            return Ok(None);
        }
        if !file_type.is_file() && !file_type.is_symlink() {
            let what = if file_type.is_socket() {
                "socket"
            } else if file_type.is_fifo() {
                "fifo"
            } else if file_type.is_block_device() {
                "block device"
            } else if file_type.is_char_device() {
                "character device"
            } else {
                "special file"
            };
            warn!(path = %path.display(), kind = what, "Skipping unsupported file type");
            return Ok(None);
        }

        let metadata = match entry.metadata() {
            Ok(metadata) => metadata,
            Err(e) if is_vanished(&e) => {
                warn!(path = %path.display(), "Entry vanished during walk, skipping");
                return Ok(None);
            }
            Err(e) => return Err(walk_error(e)),
        };

        let kind = if file_type.is_symlink() {
            match std::fs::read_link(path) {
                Ok(target) => ScannedKind::Symlink { target },
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    warn!(path = %path.display(), "Symlink vanished during walk, skipping");
                    return Ok(None);
                }
                Err(e) => return Err(e.into()),
            }
        } else {
            ScannedKind::File
        };

        let relative = path
            .strip_prefix(&self.root)
            .map_err(|_| {
                Error::InvalidInput(format!(
                    "{} is outside of {}",
                    path.display(),
                    self.root.display()
                ))
            })?
            .to_path_buf();

        let link_group = if kind == ScannedKind::File && metadata.nlink() > 1 {
            let next = self.links.len() as u64;
            Some(*self.links.entry((metadata.dev(), metadata.ino())).or_insert(next))
        } else {
            None
        };

        Ok(Some(Scanned {
            path: path.to_path_buf(),
            relative,
            kind,
            mode: metadata.mode(),
            owner: self.names.owner(metadata.uid()),
            group: self.names.group(metadata.gid()),
            size: metadata.len(),
            mtime: metadata.mtime(),
            mtime_nsec: metadata.mtime_nsec() as u32,
            link_group,
        }))
    }
}

impl Iterator for Walk {
    type Item = Result<Scanned>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let entry = match self.entries.next()? {
                Ok(entry) => entry,
                Err(e) if is_vanished(&e) => {
                    warn!(
                        path = ?e.path().map(Path::display).map(|d| d.to_string()),
                        "Entry vanished during walk, skipping"
                    );
                    continue;
                }
                Err(e) => return Some(Err(walk_error(e))),
            };

            match self.scan(entry) {
                Ok(Some(scanned)) => return Some(Ok(scanned)),
                Ok(None) => continue,
                Err(e) => return Some(Err(e)),
            }
        }
    }
}

fn is_vanished(error: &walkdir::Error) -> bool {
    error
        .io_error()
        .is_some_and(|e| e.kind() == io::ErrorKind::NotFound)
}

fn walk_error(error: walkdir::Error) -> Error {
    let path = error.path().map(|p| p.display().to_string());
    match error.into_io_error() {
        Some(io) => match path {
            Some(path) => Error::Io(io::Error::new(io.kind(), format!("{}: {}", path, io))),
            None => Error::Io(io),
        },
        None => Error::InvalidInput("filesystem loop detected during walk".to_string()),
    }
}
