//! Bridge from the async world, where archive bytes arrive, to the blocking `std::io::Read` world
//! where the archive parsers work.
//!
//! Neither the `tar` crate nor the zip reader has an async API, so the parsers run on a blocking
//! worker thread and pull
//! their input through the [`Read`] impl produced here, which in turn awaits chunks from an async
//! [`Stream`].

use crate::{Result, S3UnpackError};
use bytes::{buf::Reader, Buf, Bytes};
use futures::{Stream, StreamExt};
use std::{io::Read, pin::Pin};

/// Given a [`Stream`] impl that yields chunks of bytes, produce a [`Read`] implementation that
/// exposes those same bytes to blocking reads.
///
/// NOTE: The resulting reader will panic if any of its `read_*` methods are called from an async
/// context.  Reads must happen in a blocking worker thread started with
/// [`tokio::task::spawn_blocking`].
pub(crate) fn stream_as_reader<S>(stream: S) -> impl Read + Send + 'static
where
    S: Stream<Item = Result<Bytes>> + Send + 'static,
{
    let handle = tokio::runtime::Handle::current();

    TryStreamReader {
        buffer: None,
        stream: Box::pin(stream),
        handle,
    }
}

/// Recover the error the input stream failed with, if that's where the I/O error `error` raised by
/// a reader from [`stream_as_reader`] came from.
///
/// Returns `error` itself if it came from somewhere else, such as the archive parser.
pub(crate) fn input_error(error: std::io::Error) -> std::result::Result<S3UnpackError, std::io::Error> {
    if error
        .get_ref()
        .map_or(false, |inner| inner.is::<S3UnpackError>())
    {
        let inner = error
            .into_inner()
            .expect("BUG: error with a custom payload has an inner error");

        return Ok(*inner
            .downcast::<S3UnpackError>()
            .expect("BUG: payload type was just checked"));
    }

    Err(error)
}

struct TryStreamReader {
    buffer: Option<Reader<Bytes>>,
    stream: Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>,
    handle: tokio::runtime::Handle,
}

impl Read for TryStreamReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        // Leftovers from the previous chunk are served first.  A short read is fine here; `Read`
        // doesn't require filling `buf`.
        if let Some(mut buffer) = self.buffer.take() {
            if buffer.get_ref().remaining() > 0 {
                let bytes_read = buffer.read(buf)?;

                if buffer.get_ref().remaining() > 0 {
                    self.buffer = Some(buffer);
                }

                return Ok(bytes_read);
            }
        }

        loop {
            match self.handle.block_on(async { self.stream.next().await }) {
                None => {
                    // End of the stream is EOF as far as the reader is concerned
                    return Ok(0);
                }
                Some(Err(e)) => {
                    return Err(std::io::Error::new(std::io::ErrorKind::Other, e));
                }
                Some(Ok(bytes)) if bytes.is_empty() => {
                    // A zero-length read would be taken as EOF, so skip empty chunks
                    continue;
                }
                Some(Ok(bytes)) => {
                    let mut buffer = bytes.reader();

                    let bytes_read = buffer.read(buf)?;

                    if buffer.get_ref().remaining() > 0 {
                        self.buffer = Some(buffer);
                    }

                    return Ok(bytes_read);
                }
            }
        }
    }
}
