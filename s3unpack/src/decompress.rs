//! Transparent gzip decompression of archive input
use crate::Result;
use async_compression::tokio::bufread::GzipDecoder;
use snafu::prelude::*;
use std::pin::Pin;
use tokio::io::{AsyncRead, AsyncReadExt, BufReader};
use tracing::debug;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Peek at the start of `reader` and, if it's gzip-compressed, wrap it in a decompressor.
/// Anything else is passed through unchanged, including the peeked bytes.
pub(crate) async fn decompress_if_gzip<R>(mut reader: R) -> Result<Pin<Box<dyn AsyncRead + Send>>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut magic = [0u8; 2];
    let mut filled = 0;

    while filled < magic.len() {
        let bytes_read = reader
            .read(&mut magic[filled..])
            .await
            .context(crate::error::ReadInputSnafu)?;

        if bytes_read == 0 {
            break;
        }

        filled += bytes_read;
    }

    let reader = std::io::Cursor::new(magic[..filled].to_vec()).chain(reader);

    if magic[..filled] == GZIP_MAGIC {
        debug!("Input is gzip-compressed");

        let mut decoder = GzipDecoder::new(BufReader::new(reader));
        // `gzip -c a b > ab.gz` and friends produce one member per input
        decoder.multiple_members(true);

        Ok(Box::pin(decoder))
    } else {
        Ok(Box::pin(reader))
    }
}
