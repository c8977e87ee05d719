use crate::EntryHeader;
use std::time::Duration;

/// A trait which callers can implement to get detailed progress updates as an archive is
/// streamed into object storage.
///
/// Every method has an empty default implementation, so implementors only override the updates
/// they care about.  Methods are called from async tasks and from the blocking thread that reads
/// the archive, so they should return quickly.
#[allow(unused_variables)]
pub trait UploadProgressCallback: Sync + Send {
    /// Some bytes of the raw archive (after decompression, if any) have been read by the archive
    /// parser.
    fn archive_bytes_read(&self, bytes: usize) {}

    /// An entry was found in the archive, before deciding whether to upload it
    fn entry_received(&self, header: &EntryHeader) {}

    /// An entry is being skipped: it's a directory or other non-file entry, it matched an ignore
    /// rule, or an earlier error stopped new uploads.  Its data is drained and discarded.
    fn entry_skipped(&self, header: &EntryHeader, reason: SkipReason) {}

    /// The maximum number of uploads are already running, so this one has to wait its turn
    fn upload_queued(&self, key: &str) {}

    /// The upload of the specified object is starting
    fn upload_starting(&self, key: &str, size: Option<u64>) {}

    /// The object has been uploaded in its entirety
    fn object_uploaded(&self, key: &str, size: u64) {}

    /// The upload of the object failed.  The whole operation will fail with the first such error.
    fn upload_failed(&self, key: &str) {}

    /// The archive has been read to the end; no more entries will be produced.
    ///
    /// Uploads of the last entries may still be running.
    fn archive_drained(&self, total_entries: usize, total_bytes: u64) {}

    /// All uploads have finished and the operation has succeeded
    fn uploads_finished(&self, total_objects: usize, total_bytes: u64, duration: Duration) {}
}

/// Why an archive entry was not uploaded
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SkipReason {
    /// Directories have no object representation
    Directory,

    /// Symlinks, hard links, devices and the like have no object representation either
    Special,

    /// The entry path matched one of the ignore rules
    Ignored,

    /// An earlier failure means no new uploads are started
    AfterError,
}

/// Progress callback that discards every update
pub(crate) struct NoProgress;

impl UploadProgressCallback for NoProgress {}
