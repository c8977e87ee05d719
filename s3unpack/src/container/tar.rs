//! Reads entries from a tar stream with the `tar` crate
use super::{EntryEmitter, EntryHeader, EntryKind};
use crate::{Result, S3UnpackError};
use std::io::Read;
use tracing::trace;

/// Emit every entry of the tar archive in `reader`, stopping at the end-of-archive marker.
///
/// Returns the number of entries emitted.
pub(super) fn read_entries<R: Read>(reader: &mut R, emitter: &EntryEmitter) -> Result<usize> {
    let mut archive = ::tar::Archive::new(reader);
    let mut count = 0;

    for entry in archive.entries().map_err(tar_error)? {
        let mut entry = entry.map_err(tar_error)?;

        let entry_type = entry.header().entry_type();
        let kind = if entry_type.is_dir() {
            EntryKind::Directory
        } else if entry_type.is_file() || entry_type.is_contiguous() || entry_type.is_gnu_sparse()
        {
            EntryKind::File
        } else {
            EntryKind::Special
        };

        // The raw bytes, not `path()`, which would already have cleaned up the path
        let name = String::from_utf8_lossy(&entry.path_bytes()).into_owned();

        trace!(%name, ?entry_type, "Read tar header");

        let header = EntryHeader {
            name,
            kind,
            size: Some(entry.size()),
        };

        emitter.emit(header, &mut entry)?;
        count += 1;
    }

    Ok(count)
}

fn tar_error(error: std::io::Error) -> S3UnpackError {
    super::read_error(error, |source| S3UnpackError::TarRead { source })
}
