//! The byte stream of a single archive entry, handed from the archive reader to whatever consumes
//! the entry: an upload, or a drain that throws the data away.
use crate::Result;
use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt};
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;

/// The data of one archive entry, delivered as a stream of chunks.
///
/// The archive reader will not move on to the next entry until every chunk of this one has been
/// taken from the stream (or the stream has been dropped), so an `EntryBody` must always be
/// consumed to the end: either by uploading it or by calling [`EntryBody::drain`].
pub struct EntryBody {
    path: String,
    inner: Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>,
}

impl EntryBody {
    /// Make a body fed by the receiving half of a channel, as the archive readers do.
    pub(crate) fn from_receiver(path: String, receiver: mpsc::Receiver<Result<Bytes>>) -> Self {
        Self::from_stream(path, ReceiverStream::new(receiver))
    }

    /// Wrap an arbitrary stream of chunks as an entry body.
    pub fn from_stream(
        path: impl Into<String>,
        stream: impl Stream<Item = Result<Bytes>> + Send + 'static,
    ) -> Self {
        Self {
            path: path.into(),
            inner: Box::pin(stream),
        }
    }

    /// A body consisting of a single in-memory buffer
    pub fn from_bytes(path: impl Into<String>, data: impl Into<Bytes>) -> Self {
        let data = data.into();
        Self::from_stream(path, futures::stream::iter(std::iter::once(Ok(data))))
    }

    /// The path of the archive entry this body belongs to
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Read the remaining data and throw it away.
    ///
    /// Returns the number of bytes discarded.  An error reading the entry is still reported, but
    /// only after the stream has been exhausted so the archive reader is never left waiting.
    pub async fn drain(mut self) -> Result<u64> {
        let mut drained = 0u64;
        let mut first_error = None;

        while let Some(result) = self.inner.next().await {
            match result {
                Ok(chunk) => drained += chunk.len() as u64,
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }

        debug!(path = %self.path, drained, "Drained entry body");

        match first_error {
            Some(e) => Err(e),
            None => Ok(drained),
        }
    }

    /// Read the entire body into one contiguous buffer.
    ///
    /// Only appropriate for entries known to be small.
    pub async fn collect_bytes(mut self, capacity_hint: usize) -> Result<Bytes> {
        let mut buffer = BytesMut::with_capacity(capacity_hint);

        while let Some(chunk) = self.inner.next().await {
            buffer.extend_from_slice(&chunk?);
        }

        Ok(buffer.freeze())
    }
}

impl Stream for EntryBody {
    type Item = Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

impl std::fmt::Debug for EntryBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntryBody")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}
