//! Directory state observation.
//!
//! A walk produces a [`Snapshot`], two snapshots produce a stream of
//! [`Change`] records:
//!
//! ```text
//! walk(root) --> Snapshot --+
//!                           +--> diff --> Change, Change, ... --> chunks of 64
//! baseline   --> Snapshot --+
//! ```

pub mod diff;
pub mod exclude;
pub mod walker;

pub use diff::{count_changes, diff, relative_path, Change, ChangeChunks, ChangeKind};
pub use exclude::IgnoreMatcher;
pub use walker::{walk, WalkStats};

use std::collections::BTreeMap;
use std::fs::Metadata;
use std::path::PathBuf;

/// Lightweight description of one filesystem object seen during a walk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDescriptor {
    /// Absolute path, the snapshot key
    pub path: PathBuf,
    pub is_dir: bool,
    /// Size in bytes, 0 for directories
    pub size: u64,
    /// Modification time, whole seconds since the epoch
    pub mtime: i64,
    /// Sub-second remainder of the modification time
    pub mtime_nanos: i64,
}

impl FileDescriptor {
    /// Directories only record existence; their size and mtime stay zero so
    /// that adding a file inside a directory does not report the directory.
    pub fn directory(path: PathBuf) -> Self {
        Self {
            path,
            is_dir: true,
            size: 0,
            mtime: 0,
            mtime_nanos: 0,
        }
    }

    pub fn from_metadata(path: PathBuf, metadata: &Metadata) -> Self {
        if metadata.is_dir() {
            return Self::directory(path);
        }

        let mtime = filetime::FileTime::from_last_modification_time(metadata);
        Self {
            path,
            is_dir: false,
            size: metadata.len(),
            mtime: mtime.unix_seconds(),
            mtime_nanos: i64::from(mtime.nanoseconds()),
        }
    }

    /// True when the two descriptors would be reported as a modification.
    pub fn differs_from(&self, other: &FileDescriptor) -> bool {
        self.is_dir != other.is_dir
            || self.size != other.size
            || self.mtime != other.mtime
            || self.mtime_nanos != other.mtime_nanos
    }
}

/// Observed state of a root at one instant, keyed by absolute path.
///
/// Built once per walk and never mutated afterwards.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    entries: BTreeMap<PathBuf, FileDescriptor>,
}

impl Snapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&mut self, descriptor: FileDescriptor) {
        self.entries.insert(descriptor.path.clone(), descriptor);
    }

    pub fn get(&self, path: &std::path::Path) -> Option<&FileDescriptor> {
        self.entries.get(path)
    }

    pub fn contains(&self, path: &std::path::Path) -> bool {
        self.entries.contains_key(path)
    }

    pub fn iter(&self) -> impl Iterator<Item = &FileDescriptor> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl FromIterator<FileDescriptor> for Snapshot {
    fn from_iter<I: IntoIterator<Item = FileDescriptor>>(iter: I) -> Self {
        let mut snapshot = Snapshot::new();
        for descriptor in iter {
            snapshot.insert(descriptor);
        }
        snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(path: &str, size: u64, mtime: i64, mtime_nanos: i64) -> FileDescriptor {
        FileDescriptor {
            path: PathBuf::from(path),
            is_dir: false,
            size,
            mtime,
            mtime_nanos,
        }
    }

    #[test]
    fn test_differs_on_subsecond_mtime() {
        let a = file("/r/a", 10, 1_700_000_000, 100);
        let b = file("/r/a", 10, 1_700_000_000, 200);
        assert!(a.differs_from(&b));
        assert!(!a.differs_from(&a.clone()));
    }

    #[test]
    fn test_differs_on_type_change() {
        let f = file("/r/a", 0, 0, 0);
        let d = FileDescriptor::directory(PathBuf::from("/r/a"));
        assert!(f.differs_from(&d));
    }

    #[test]
    fn test_snapshot_keys_are_unique() {
        let snapshot: Snapshot = vec![file("/r/a", 1, 0, 0), file("/r/a", 2, 0, 0)]
            .into_iter()
            .collect();

        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot.get(std::path::Path::new("/r/a")).unwrap().size, 2);
    }
}
