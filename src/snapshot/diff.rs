//! Snapshot differencing.
//!
//! Changes are produced lazily, so counting them never materializes the
//! record list and streaming them only holds one chunk at a time.

use crate::snapshot::{FileDescriptor, Snapshot};
use serde::Serialize;
use std::path::{Component, Path};

/// Maximum number of changes per transmitted chunk
pub const CHANGE_CHUNK_SIZE: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    /// Created or modified
    Upsert,
    Delete,
}

/// One detected difference between two snapshots.
///
/// Upserts carry the new descriptor's attributes, deletes the last known
/// ones.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Change {
    pub kind: ChangeKind,
    /// Path relative to the walked root, `/`-separated
    pub path: String,
    pub mtime: i64,
    pub mtime_nanos: i64,
    pub size: u64,
    pub is_dir: bool,
}

impl Change {
    fn from_descriptor(root: &Path, kind: ChangeKind, descriptor: &FileDescriptor) -> Self {
        Self {
            kind,
            path: relative_path(root, &descriptor.path),
            mtime: descriptor.mtime,
            mtime_nanos: descriptor.mtime_nanos,
            size: descriptor.size,
            is_dir: descriptor.is_dir,
        }
    }

    pub fn is_delete(&self) -> bool {
        self.kind == ChangeKind::Delete
    }
}

/// Strip `root` from `path` and join the remaining components with `/`.
pub fn relative_path(root: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(root).unwrap_or(path);
    relative
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// Compare `previous` (or nothing, before the first sync) with `current`.
///
/// Yields an upsert for every entry of `current` that is new or differs in
/// type, size, or mtime, then a delete for every entry of `previous` missing
/// from `current`. Identical entries yield nothing. Order follows the
/// snapshots' iteration order and is not part of the contract.
pub fn diff<'a>(
    root: &'a Path,
    previous: Option<&'a Snapshot>,
    current: &'a Snapshot,
) -> impl Iterator<Item = Change> + 'a {
    let upserts = current
        .iter()
        .filter(move |new| is_upsert(previous, new))
        .map(move |new| Change::from_descriptor(root, ChangeKind::Upsert, new));

    let deletes = previous
        .into_iter()
        .flat_map(|prev| prev.iter())
        .filter(move |old| is_delete(current, old))
        .map(move |old| Change::from_descriptor(root, ChangeKind::Delete, old));

    upserts.chain(deletes)
}

/// Number of changes between two snapshots, without building any records.
pub fn count_changes(previous: Option<&Snapshot>, current: &Snapshot) -> u64 {
    let upserts = current
        .iter()
        .filter(|new| is_upsert(previous, new))
        .count();

    let deletes = previous
        .map(|prev| prev.iter().filter(|old| is_delete(current, old)).count())
        .unwrap_or(0);

    (upserts + deletes) as u64
}

/// `new` is absent from `previous` or differs from its entry there.
fn is_upsert(previous: Option<&Snapshot>, new: &FileDescriptor) -> bool {
    match previous.and_then(|prev| prev.get(&new.path)) {
        Some(old) => old.differs_from(new),
        None => true,
    }
}

fn is_delete(current: &Snapshot, old: &FileDescriptor) -> bool {
    !current.contains(&old.path)
}

/// Groups a change iterator into batches of at most `cap` records, pulling
/// from the source only as each batch is requested.
pub struct ChangeChunks<I> {
    changes: I,
    cap: usize,
}

impl<I: Iterator<Item = Change>> ChangeChunks<I> {
    pub fn new(changes: I, cap: usize) -> Self {
        Self {
            changes,
            cap: cap.max(1),
        }
    }
}

impl<I: Iterator<Item = Change>> Iterator for ChangeChunks<I> {
    type Item = Vec<Change>;

    fn next(&mut self) -> Option<Self::Item> {
        let chunk: Vec<Change> = self.changes.by_ref().take(self.cap).collect();
        if chunk.is_empty() {
            None
        } else {
            Some(chunk)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::BTreeSet;
    use std::path::PathBuf;

    const ROOT: &str = "/srv/app";

    fn file(name: &str, size: u64, mtime: i64) -> FileDescriptor {
        FileDescriptor {
            path: Path::new(ROOT).join(name),
            is_dir: false,
            size,
            mtime,
            mtime_nanos: 0,
        }
    }

    fn dir(name: &str) -> FileDescriptor {
        FileDescriptor::directory(Path::new(ROOT).join(name))
    }

    fn run(previous: Option<&Snapshot>, current: &Snapshot) -> Vec<Change> {
        diff(Path::new(ROOT), previous, current).collect()
    }

    #[test]
    fn test_first_diff_reports_everything() {
        let current: Snapshot = vec![dir("src"), file("src/main.rs", 10, 1)]
            .into_iter()
            .collect();

        let changes = run(None, &current);

        assert_eq!(changes.len(), 2);
        assert!(changes.iter().all(|c| c.kind == ChangeKind::Upsert));
        let paths: BTreeSet<_> = changes.iter().map(|c| c.path.as_str()).collect();
        assert!(paths.contains("src"));
        assert!(paths.contains("src/main.rs"));
    }

    #[test]
    fn test_identical_snapshots_are_silent() {
        let snapshot: Snapshot = vec![dir("src"), file("src/main.rs", 10, 1)]
            .into_iter()
            .collect();

        assert!(run(Some(&snapshot), &snapshot.clone()).is_empty());
        assert_eq!(count_changes(Some(&snapshot), &snapshot), 0);
    }

    #[test]
    fn test_modification_carries_new_attributes() {
        let previous: Snapshot = vec![file("a.txt", 10, 1)].into_iter().collect();
        let mut modified = file("a.txt", 10, 1);
        modified.mtime_nanos = 500;
        let current: Snapshot = vec![modified].into_iter().collect();

        let changes = run(Some(&previous), &current);

        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].kind, ChangeKind::Upsert);
        assert_eq!(changes[0].path, "a.txt");
        assert_eq!(changes[0].mtime_nanos, 500);
    }

    #[test]
    fn test_deleted_directory_and_file() {
        let previous: Snapshot = vec![dir("d"), file("d/a.txt", 3, 1), file("keep", 1, 1)]
            .into_iter()
            .collect();
        let current: Snapshot = vec![file("keep", 1, 1)].into_iter().collect();

        let changes = run(Some(&previous), &current);

        assert_eq!(changes.len(), 2);
        assert!(changes.iter().all(Change::is_delete));
        let deleted: BTreeSet<_> = changes.iter().map(|c| (c.path.as_str(), c.is_dir)).collect();
        assert!(deleted.contains(&("d", true)));
        assert!(deleted.contains(&("d/a.txt", false)));
    }

    #[test]
    fn test_file_replaced_by_directory() {
        let previous: Snapshot = vec![file("x", 4, 9)].into_iter().collect();
        let current: Snapshot = vec![dir("x")].into_iter().collect();

        let changes = run(Some(&previous), &current);

        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].kind, ChangeKind::Upsert);
        assert!(changes[0].is_dir);
        assert_eq!(count_changes(Some(&previous), &current), 1);
    }

    #[test]
    fn test_chunk_boundaries() {
        let previous = Snapshot::new();
        let current: Snapshot = (0..130).map(|i| file(&format!("f{}", i), 1, 1)).collect();

        let chunks: Vec<Vec<Change>> =
            ChangeChunks::new(diff(Path::new(ROOT), Some(&previous), &current), 64).collect();

        let sizes: Vec<usize> = chunks.iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![64, 64, 2]);
        assert_eq!(count_changes(Some(&previous), &current), 130);
    }

    #[test]
    fn test_no_changes_means_no_chunks() {
        let snapshot: Snapshot = vec![file("a", 1, 1)].into_iter().collect();
        let mut chunks = ChangeChunks::new(
            diff(Path::new(ROOT), Some(&snapshot), &snapshot),
            CHANGE_CHUNK_SIZE,
        );
        assert!(chunks.next().is_none());
    }

    #[test]
    fn test_relative_path_strips_root() {
        assert_eq!(
            relative_path(Path::new("/srv/app"), Path::new("/srv/app/a/b.txt")),
            "a/b.txt"
        );
        assert_eq!(relative_path(Path::new("/srv/app"), Path::new("/srv/app")), "");
        assert_eq!(
            relative_path(Path::new("/srv/app/"), &PathBuf::from("/srv/app/x")),
            "x"
        );
    }

    fn arb_snapshot() -> impl Strategy<Value = Snapshot> {
        prop::collection::btree_map(0u8..40, (0u64..3, 0i64..3), 0..30).prop_map(|files| {
            files
                .into_iter()
                .map(|(name, (size, mtime))| file(&format!("f{}", name), size, mtime))
                .collect()
        })
    }

    proptest! {
        #[test]
        fn prop_count_matches_streamed_records(previous in arb_snapshot(), current in arb_snapshot()) {
            let streamed: usize = ChangeChunks::new(
                diff(Path::new(ROOT), Some(&previous), &current),
                7,
            )
            .map(|chunk| chunk.len())
            .sum();

            prop_assert_eq!(count_changes(Some(&previous), &current), streamed as u64);
        }

        #[test]
        fn prop_chunks_never_exceed_cap(current in arb_snapshot(), cap in 1usize..10) {
            for chunk in ChangeChunks::new(diff(Path::new(ROOT), None, &current), cap) {
                prop_assert!(!chunk.is_empty() && chunk.len() <= cap);
            }
        }
    }
}
