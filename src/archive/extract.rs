//! Unpacking of downloaded archives.

use crate::error::{Result, SyncError};
use flate2::read::GzDecoder;
use std::fs;
use std::io::Read;
use std::path::Path;
use tracing::{debug, warn};

/// Decode a tar+gzip stream and unpack every entry below `dest`.
///
/// Modification times and permissions are restored, symlinks are recreated
/// as links, and existing files are overwritten. Entries that would land
/// outside `dest` are skipped. Returns the number of unpacked entries.
pub fn extract<R: Read>(reader: R, dest: &Path) -> Result<usize> {
    fs::create_dir_all(dest)?;

    let mut archive = tar::Archive::new(GzDecoder::new(reader));
    archive.set_preserve_mtime(true);
    archive.set_preserve_permissions(true);
    archive.set_overwrite(true);

    let mut unpacked = 0;
    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.into_owned();

        let inside = entry
            .unpack_in(dest)
            .map_err(|source| SyncError::Archive {
                path: path.clone(),
                source,
            })?;
        if !inside {
            warn!("Skipped archive entry outside destination: {}", path.display());
            continue;
        }
        unpacked += 1;
    }

    debug!("Unpacked {} entries into {}", unpacked, dest.display());
    Ok(unpacked)
}
