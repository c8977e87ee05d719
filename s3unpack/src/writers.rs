//! Splits the data of an archive entry into fixed-size chunks for the multipart upload APIs.
//!
//! Entry data arrives in whatever chunk sizes the archive reader happens to produce, while
//! multipart uploads need every part but the last to be the same, fairly large, size.  The
//! [`multipart`] helper collects the data of an [`EntryBody`] into chunks of the multipart chunk
//! size and yields them on a channel for the uploading task to consume.

use crate::{EntryBody, Result};
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use tokio::sync::mpsc;
use tracing::{debug, warn};

#[derive(Debug)]
pub(crate) struct MultipartChunk {
    /// The part number of the chunk starting from 0.
    pub part_number: usize,

    /// The contents of this chunk
    pub data: Bytes,
}

/// Spawn a task which reads `body` to the end, building its data up into chunks of
/// `multipart_chunk_size` bytes (except potentially for the last chunk) and sending them to the
/// returned receiver.
///
/// An error reading the body is sent in place of the next chunk, and ends the chunk stream.
///
/// The body is always read to the end, even after an error or if the receiver is dropped, so the
/// archive reader is never left waiting for this entry to be consumed.
pub(crate) fn multipart(
    mut body: EntryBody,
    multipart_chunk_size: usize,
    chunks_channel_depth: usize,
) -> mpsc::Receiver<Result<MultipartChunk>> {
    let (chunks_sender, chunks_receiver) = mpsc::channel(chunks_channel_depth.max(1));
    let multipart_chunk_size = multipart_chunk_size.max(1);

    tokio::spawn(async move {
        let mut part_number = 0usize;
        let mut buffer = BytesMut::with_capacity(multipart_chunk_size);
        let mut receiver_alive = true;

        while let Some(result) = body.next().await {
            if !receiver_alive {
                continue;
            }

            match result {
                Ok(bytes) => {
                    buffer.extend_from_slice(&bytes);

                    while buffer.len() >= multipart_chunk_size {
                        let chunk = MultipartChunk {
                            part_number,
                            data: buffer.split_to(multipart_chunk_size).freeze(),
                        };
                        part_number += 1;

                        // If sending on the channel fails, it can only mean the receiver was
                        // dropped, probably because the upload failed.  The rest of the body
                        // still has to be read.
                        if chunks_sender.send(Ok(chunk)).await.is_err() {
                            warn!(path = %body.path(), "chunks receiver was dropped; discarding the rest of the entry");
                            receiver_alive = false;
                            break;
                        }
                    }
                }
                Err(e) => {
                    let _ = chunks_sender.send(Err(e)).await;
                    receiver_alive = false;
                }
            }
        }

        if receiver_alive && !buffer.is_empty() {
            let chunk = MultipartChunk {
                part_number,
                data: buffer.freeze(),
            };

            if chunks_sender.send(Ok(chunk)).await.is_err() {
                warn!(path = %body.path(), "chunks receiver was dropped; final chunk is lost");
            }
        }

        debug!(path = %body.path(), "encountered end of entry body; chunking task exiting");
    });

    chunks_receiver
}
