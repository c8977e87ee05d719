use crate::container::{self, ArchiveFormat, EntryHeader};
use crate::coordinator::Coordinator;
use crate::objstore::{Bucket, ObjectStorageFactory};
use crate::progress::{NoProgress, UploadProgressCallback};
use crate::slots::UploadSlots;
use crate::{Config, EntryFilter, Result};
use bytes::Bytes;
use futures::StreamExt;
use snafu::{prelude::*, IntoError};
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;
use tokio::io::AsyncRead;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info_span, Instrument};
use url::Url;

/// How many uploads run at once unless [`ArchiveSinkBuilder::max_parallel`] says otherwise
pub const DEFAULT_MAX_PARALLEL: usize = 10;

/// How many chunks of raw archive input may be waiting for the archive reader
const INPUT_CHANNEL_DEPTH: usize = 16;

/// A function called with the header of every entry in the archive, before it's decided whether
/// the entry is uploaded.
///
/// It can't change whether the entry is uploaded, but it can set [`ObjectAnnotations`] that are
/// applied to the entry's object if it is.
pub type EntryObserver = dyn Fn(&EntryHeader, &mut ObjectAnnotations) + Send + Sync;

/// Extra properties for the object an entry is uploaded to, set by an [`EntryObserver`]
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ObjectAnnotations {
    /// Overrides the content type that would otherwise be inferred from the entry's extension
    pub content_type: Option<String>,

    /// Object tags, encoded as URL query parameters like `key1=value1&key2=value2`
    pub tagging: Option<String>,

    /// User-defined object metadata
    pub metadata: HashMap<String, String>,
}

/// The result of a successful archive upload
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UploadOutcome {
    /// The keys of every object written, in the order their uploads finished.
    ///
    /// Uploads run concurrently, so this is generally *not* the order of the entries in the
    /// archive.
    pub keys: Vec<String>,

    /// Total size of all objects written
    pub total_bytes: u64,

    /// Number of entries in the archive, including directories and skipped entries
    pub total_entries: usize,

    /// Number of bytes of archive read, after decompression
    pub archive_bytes: u64,
}

/// Configures an [`ArchiveSink`].
pub struct ArchiveSinkBuilder {
    config: Config,
    bucket: Box<dyn Bucket>,
    prefix: String,
    format: ArchiveFormat,
    filter: EntryFilter,
    max_parallel: usize,
    on_entry: Option<Arc<EntryObserver>>,
}

impl ArchiveSinkBuilder {
    /// Prepare to upload into the bucket and prefix given as a URL like `s3://bucket/prefix`.
    ///
    /// Fails if the URL isn't for a supported object storage system, or if the bucket doesn't
    /// exist or isn't accessible.
    pub async fn new(config: Config, target: Url) -> Result<Self> {
        let objstore = ObjectStorageFactory::new(config.clone())
            .from_url(&target)
            .await?;
        let bucket = objstore.extract_bucket_from_url(&target).await?;
        let prefix = crate::objstore::url_path_to_prefix(&target);

        Ok(Self::with_bucket(config, bucket, prefix))
    }

    /// Prepare to upload into an already-constructed [`Bucket`] under `prefix`
    pub fn with_bucket(config: Config, bucket: Box<dyn Bucket>, prefix: impl Into<String>) -> Self {
        Self {
            config,
            bucket,
            prefix: prefix.into(),
            format: ArchiveFormat::default(),
            filter: EntryFilter::new(),
            max_parallel: DEFAULT_MAX_PARALLEL,
            on_entry: None,
        }
    }

    pub fn format(&mut self, format: ArchiveFormat) -> &mut Self {
        self.format = format;
        self
    }

    /// Skip entries whose path matches the regular expression `pattern` anywhere
    pub fn add_ignore(&mut self, pattern: impl AsRef<str>) -> Result<&mut Self> {
        self.filter.add_pattern(pattern)?;
        Ok(self)
    }

    /// The maximum number of objects uploaded at the same time.  Must be at least 1.
    pub fn max_parallel(&mut self, max_parallel: usize) -> &mut Self {
        self.max_parallel = max_parallel;
        self
    }

    pub fn on_entry(
        &mut self,
        observer: impl Fn(&EntryHeader, &mut ObjectAnnotations) + Send + Sync + 'static,
    ) -> &mut Self {
        let observer: Arc<EntryObserver> = Arc::new(observer);
        self.on_entry = Some(observer);
        self
    }

    /// Start the upload pipeline without progress reporting.
    ///
    /// Must be called from within a tokio runtime.
    pub fn build(self) -> Result<ArchiveSink> {
        self.build_with_progress(NoProgress)
    }

    /// Start the upload pipeline, reporting progress to `progress`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn build_with_progress<Progress>(self, progress: Progress) -> Result<ArchiveSink>
    where
        Progress: UploadProgressCallback + 'static,
    {
        let max_parallel =
            NonZeroUsize::new(self.max_parallel).context(crate::error::InvalidMaxParallelSnafu {
                max_parallel: self.max_parallel,
            })?;
        let progress: Arc<dyn UploadProgressCallback> = Arc::new(progress);

        let span = info_span!("archive_sink",
            bucket = self.bucket.name(),
            prefix = %self.prefix,
            format = %self.format);

        let (input_sender, input_receiver) = mpsc::channel(INPUT_CHANNEL_DEPTH);
        let (events, reader) = {
            let _guard = span.enter();

            container::spawn_container_reader(
                self.format,
                tokio_stream::wrappers::ReceiverStream::new(input_receiver),
                self.config.entry_channel_depth,
                progress.clone(),
            )
        };

        let slots = UploadSlots::new(self.bucket, max_parallel, progress.clone());
        let coordinator = Coordinator::new(self.prefix, self.filter, self.on_entry, slots, progress);

        let outcome = tokio::spawn(coordinator.run(events, reader).instrument(span));

        Ok(ArchiveSink {
            input: Some(input_sender),
            outcome,
        })
    }
}

impl std::fmt::Debug for ArchiveSinkBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArchiveSinkBuilder")
            .field("bucket", &self.bucket)
            .field("prefix", &self.prefix)
            .field("format", &self.format)
            .field("filter", &self.filter)
            .field("max_parallel", &self.max_parallel)
            .field("on_entry", &self.on_entry.as_ref().map(|_| "<fn>"))
            .finish()
    }
}

/// Accepts the raw bytes of an archive and uploads each file in it as an object.
///
/// Write the archive with [`Self::write`], in order, then call [`Self::finish`] to signal the end
/// of the input and wait for the outcome.  Uploads start as soon as the first entry has been
/// read, and writes wait whenever the pipeline is backed up.
#[derive(Debug)]
pub struct ArchiveSink {
    input: Option<mpsc::Sender<Result<Bytes>>>,
    outcome: JoinHandle<Result<UploadOutcome>>,
}

impl ArchiveSink {
    /// Feed the next piece of the archive.
    ///
    /// Fails with [`crate::S3UnpackError::SinkClosed`] if the pipeline has shut down, in which
    /// case [`Self::finish`] reports why.
    pub async fn write(&mut self, data: impl Into<Bytes>) -> Result<()> {
        self.send(Ok(data.into())).await
    }

    /// Fail the archive input with `error`, as if reading the archive from its source failed.
    ///
    /// The archive reader stops there, and `error` itself is what [`Self::finish`] returns.
    pub async fn fail_input(&mut self, error: crate::S3UnpackError) -> Result<()> {
        self.send(Err(error)).await
    }

    async fn send(&mut self, data: Result<Bytes>) -> Result<()> {
        let input = self
            .input
            .as_ref()
            .ok_or(crate::S3UnpackError::SinkClosed)?;

        input
            .send(data)
            .await
            .map_err(|_| crate::S3UnpackError::SinkClosed)
    }

    /// Signal the end of the archive and wait until the archive has been read and every upload
    /// has finished.
    ///
    /// On success, returns the keys of all objects written.  On failure returns the first error;
    /// some objects may have been written anyway.
    pub async fn finish(mut self) -> Result<UploadOutcome> {
        // Dropping the sender is the end of input
        self.input.take();

        self.outcome.await.context(crate::error::SpawnSnafu)?
    }
}

/// Read a complete archive from `reader` into `sink`, decompressing it first if it's
/// gzip-compressed, and wait for the outcome.
pub async fn upload_archive<R>(reader: R, mut sink: ArchiveSink) -> Result<UploadOutcome>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let reader = match crate::decompress::decompress_if_gzip(reader).await {
        Ok(reader) => reader,
        Err(e) => {
            let _ = sink.fail_input(e).await;
            return sink.finish().await;
        }
    };

    let mut chunks = tokio_util::io::ReaderStream::new(reader);

    while let Some(chunk) = chunks.next().await {
        let result = match chunk {
            Ok(bytes) => sink.write(bytes).await,
            Err(e) => {
                let _ = sink
                    .fail_input(crate::error::ReadInputSnafu.into_error(e))
                    .await;
                break;
            }
        };

        if result.is_err() {
            debug!("Archive sink closed before the end of the input");
            break;
        }
    }

    sink.finish().await
}
