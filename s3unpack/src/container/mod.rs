//! Archive container adapters.
//!
//! Both supported formats are parsed with blocking [`std::io::Read`]: tar archives by the `tar`
//! crate, zip archives by a local-header walker that decompresses with `flate2`.  The
//! parser runs on a blocking worker thread, reading the raw archive bytes
//! through [`crate::async_bridge`], and reports what it finds as [`ContainerEvent`]s on a channel
//! that the async upload coordinator consumes.
//!
//! Each entry's data is pumped, chunk by chunk, into its own bounded channel which backs the
//! entry's [`EntryBody`].  The parser stays on an entry until its data has been read completely,
//! and only then moves on to the next header.  That's the only way to get through a tar stream,
//! and the streaming zip reader works the same way.
use crate::progress::UploadProgressCallback;
use crate::{EntryBody, Result, S3UnpackError};
use bytes::Bytes;
use futures::Stream;
use std::io::Read;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, debug_span, error, info_span, warn};

mod tar;
mod zip;

/// The size of the chunks entry data is read in
const ENTRY_CHUNK_SIZE: usize = 64 * 1024;

/// How many container events can be waiting for the coordinator
const EVENT_CHANNEL_DEPTH: usize = 16;

/// The container format of an archive
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
pub enum ArchiveFormat {
    /// POSIX, GNU or PAX tar archive
    #[default]
    Tar,

    /// Zip archive.  Entries are read from their local headers as the archive streams past;
    /// entries whose sizes are only recorded in a data descriptor after their data are supported.
    Zip,
}

impl std::fmt::Display for ArchiveFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tar => write!(f, "tar"),
            Self::Zip => write!(f, "zip"),
        }
    }
}

/// What kind of thing an archive entry describes
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntryKind {
    /// A regular file.  Files are the only entries that become objects.
    File,

    Directory,

    /// A symlink, hard link, device node, FIFO, or archive-level metadata record
    Special,
}

/// The header of an archive entry as reported by the archive parser
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EntryHeader {
    /// The entry path exactly as recorded in the archive
    pub name: String,

    pub kind: EntryKind,

    /// The size of the entry data, if the archive records it up front.  Zip entries written by
    /// streaming zip writers only record their size after the data.
    pub size: Option<u64>,
}

/// An entry produced by a container adapter: its header and a stream of its data
#[derive(Debug)]
pub(crate) struct Entry {
    pub header: EntryHeader,
    pub body: EntryBody,
}

/// Events reported by a running container adapter, in the order they happen
#[derive(Debug)]
pub(crate) enum ContainerEvent {
    /// The next entry of the archive.  Its body must be consumed to the end.
    Entry(Entry),

    /// The archive couldn't be read, or the data of an entry couldn't be read.  This is always
    /// the last event.
    Error(S3UnpackError),

    /// All of the input has been consumed and every entry has been produced.
    Drained { total_entries: usize, total_bytes: u64 },
}

/// Start reading an archive of the given format from `input` on a blocking worker thread.
///
/// Returns the receiver of the adapter's events.  The sending side is dropped once the input has
/// been read to its end, whether or not the archive was valid, so a closed channel always means
/// that no more events will arrive.
pub(crate) fn spawn_container_reader<S>(
    format: ArchiveFormat,
    input: S,
    entry_channel_depth: usize,
    progress: Arc<dyn UploadProgressCallback>,
) -> (mpsc::Receiver<ContainerEvent>, JoinHandle<()>)
where
    S: Stream<Item = Result<Bytes>> + Send + 'static,
{
    let (event_sender, event_receiver) = mpsc::channel(EVENT_CHANNEL_DEPTH);
    let reader = CountingReader::new(crate::async_bridge::stream_as_reader(input), progress);
    let span = info_span!("read_container_blocking", %format);

    let handle = tokio::task::spawn_blocking(move || {
        let _guard = span.enter();

        debug!("Starting blocking archive read task");

        let emitter = EntryEmitter {
            events: event_sender,
            entry_channel_depth: entry_channel_depth.max(1),
        };

        read_container_blocking(format, reader, &emitter);

        debug!("Blocking archive read task exiting");
    });

    (event_receiver, handle)
}

fn read_container_blocking<R: Read>(
    format: ArchiveFormat,
    mut reader: CountingReader<R>,
    emitter: &EntryEmitter,
) {
    let result = match format {
        ArchiveFormat::Tar => tar::read_entries(&mut reader, emitter),
        ArchiveFormat::Zip => zip::read_entries(&mut reader, emitter),
    };

    match result {
        Ok(total_entries) => {
            // Whatever follows the last entry (tar end-of-archive padding, the zip central
            // directory) still has to be read so that whoever is writing it isn't left blocked
            drain_remaining_input(&mut reader);

            let total_bytes = reader.total_bytes_read();
            debug!(total_entries, total_bytes, "Archive fully read");

            emitter.send(ContainerEvent::Drained {
                total_entries,
                total_bytes,
            });
        }
        Err(e) => {
            error!(err = ?e, "Reading archive failed");

            emitter.send(ContainerEvent::Error(e));

            drain_remaining_input(&mut reader);
        }
    }
}

/// Attribute an I/O error raised while reading the archive to the input, if the input stream
/// failed, or else to the archive itself with `archive_error`
pub(crate) fn read_error(
    error: std::io::Error,
    archive_error: impl FnOnce(std::io::Error) -> S3UnpackError,
) -> S3UnpackError {
    crate::async_bridge::input_error(error).unwrap_or_else(archive_error)
}

fn drain_remaining_input<R: Read>(reader: &mut CountingReader<R>) {
    match std::io::copy(reader, &mut std::io::sink()) {
        Ok(0) => {}
        Ok(bytes) => debug!(bytes, "Discarded input following the end of the archive"),
        Err(e) => warn!(err = ?e, "Error discarding input following the end of the archive"),
    }
}

/// Hands entries found by a format-specific reader over to the async side.
pub(crate) struct EntryEmitter {
    events: mpsc::Sender<ContainerEvent>,
    entry_channel_depth: usize,
}

impl EntryEmitter {
    /// Report an entry and pump all of its data from `data` into the entry's body.
    ///
    /// Returns only once `data` has been read to its end (or failed), which is what allows the
    /// caller to move on to the next entry.  If the body is dropped before all of the data was
    /// taken, the rest is read and discarded here.
    ///
    /// If the data can't be read, or ends before the size recorded in the header, the body fails
    /// so that no object is written for the entry, and the error is returned.  Nothing more should
    /// be read from the archive after that, nor after a failure because the coordinator is gone.
    fn emit(&self, header: EntryHeader, data: &mut impl Read) -> Result<()> {
        let span = debug_span!("entry", path = %header.name, kind = ?header.kind, size = ?header.size);
        let _guard = span.enter();

        let (chunk_sender, chunk_receiver) = mpsc::channel(self.entry_channel_depth);
        let path = header.name.clone();
        let expected_size = header.size;
        let body = EntryBody::from_receiver(path.clone(), chunk_receiver);

        if self
            .events
            .blocking_send(ContainerEvent::Entry(Entry { header, body }))
            .is_err()
        {
            debug!("Container event receiver dropped; aborting blocking archive reader");
            return crate::error::SinkClosedSnafu {}.fail();
        }

        let mut chunk_sender = Some(chunk_sender);
        let mut buffer = vec![0u8; ENTRY_CHUNK_SIZE];
        let mut total = 0u64;

        loop {
            match data.read(&mut buffer) {
                Ok(0) => break,
                Ok(bytes_read) => {
                    total += bytes_read as u64;

                    if let Some(sender) = &chunk_sender {
                        let chunk = Bytes::copy_from_slice(&buffer[..bytes_read]);
                        if sender.blocking_send(Ok(chunk)).is_err() {
                            debug!("Entry body dropped before its end; discarding the rest");
                            chunk_sender = None;
                        }
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!(err = ?e, total, "Error reading entry data");

                    let error = read_error(e, |source| S3UnpackError::EntryRead {
                        path: path.clone(),
                        source,
                    });
                    fail_body(chunk_sender.take(), stand_in_error(&error, &path));

                    return Err(error);
                }
            }
        }

        if let Some(expected_size) = expected_size.filter(|expected| total < *expected) {
            error!(total, expected_size, "Archive ended in the middle of the entry data");

            fail_body(
                chunk_sender.take(),
                S3UnpackError::EntryAbandoned { path: path.clone() },
            );

            return crate::error::EntryAbandonedSnafu { path }.fail();
        }

        debug!(total, "Finished reading entry data");

        Ok(())
    }

    fn send(&self, event: ContainerEvent) {
        if self.events.blocking_send(event).is_err() {
            debug!("Container event receiver dropped; event discarded");
        }
    }
}

/// End an entry body with `error` instead of a clean end of data, so its upload fails
fn fail_body(sender: Option<mpsc::Sender<Result<Bytes>>>, error: S3UnpackError) {
    if let Some(sender) = sender {
        if sender.blocking_send(Err(error)).is_err() {
            debug!("Entry body dropped before the entry failed");
        }
    }
}

/// The error to fail an entry body with when reading its data failed with `error`.  The original
/// is reported to the coordinator, so the body gets one of the same kind with the same message.
fn stand_in_error(error: &S3UnpackError, path: &str) -> S3UnpackError {
    let source = std::io::Error::new(std::io::ErrorKind::Other, error.to_string());

    match error {
        S3UnpackError::ReadInput { .. } => S3UnpackError::ReadInput { source },
        _ => S3UnpackError::EntryRead {
            path: path.to_string(),
            source,
        },
    }
}

/// A wrapper around an arbitrary [`std::io::Read`] which counts how many bytes are read from the
/// underlying reader and reports them to [`UploadProgressCallback::archive_bytes_read`]
pub(crate) struct CountingReader<R> {
    inner: R,
    progress: Arc<dyn UploadProgressCallback>,
    total_bytes_read: u64,
}

impl<R: Read> CountingReader<R> {
    pub(crate) fn new(reader: R, progress: Arc<dyn UploadProgressCallback>) -> Self {
        Self {
            inner: reader,
            progress,
            total_bytes_read: 0,
        }
    }

    pub fn total_bytes_read(&self) -> u64 {
        self.total_bytes_read
    }
}

impl<R: Read> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let bytes_read = self.inner.read(buf)?;

        if bytes_read > 0 {
            self.progress.archive_bytes_read(bytes_read);
            self.total_bytes_read += bytes_read as u64;
        }

        Ok(bytes_read)
    }
}
