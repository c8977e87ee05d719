//! Bounded-concurrency scheduling of object uploads.
//!
//! [`UploadSlots`] runs at most `max_parallel` uploads at a time and holds any others in a FIFO
//! queue until a slot frees up.  It's owned and driven by a single task, the coordinator, so the
//! queue and the count of running uploads need no locking: every change to them happens inside
//! one call to [`UploadSlots::submit`] or [`UploadSlots::next_settlement`].
use crate::objstore::{Bucket, PutObjectOutput, PutObjectRequest};
use crate::progress::UploadProgressCallback;
use crate::{EntryBody, S3UnpackError};
use snafu::IntoError;
use std::collections::VecDeque;
use std::num::NonZeroUsize;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, debug_span, error, Instrument};

/// How an upload dispatched by [`UploadSlots`] ended
#[derive(Debug)]
pub(crate) enum Settlement {
    Uploaded(PutObjectOutput),
    Failed(S3UnpackError),
}

pub(crate) struct UploadSlots {
    bucket: Box<dyn Bucket>,
    max_parallel: NonZeroUsize,
    pending: VecDeque<PutObjectRequest>,
    in_flight: JoinSet<(String, crate::Result<PutObjectOutput>)>,
    progress: Arc<dyn UploadProgressCallback>,

    /// Set after the first failure; from then on nothing new is dispatched
    halted: bool,
}

impl UploadSlots {
    pub fn new(
        bucket: Box<dyn Bucket>,
        max_parallel: NonZeroUsize,
        progress: Arc<dyn UploadProgressCallback>,
    ) -> Self {
        Self {
            bucket,
            max_parallel,
            pending: VecDeque::new(),
            in_flight: JoinSet::new(),
            progress,
            halted: false,
        }
    }

    pub fn max_parallel(&self) -> usize {
        self.max_parallel.get()
    }

    /// Number of uploads dispatched but not yet settled
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Number of uploads waiting for a free slot
    pub fn queued(&self) -> usize {
        self.pending.len()
    }

    /// `true` if nothing is running and nothing is waiting to run
    pub fn is_idle(&self) -> bool {
        self.pending.is_empty() && self.in_flight.is_empty()
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }

    /// Start uploading `request` now if a slot is free, otherwise put it at the back of the queue.
    ///
    /// After [`Self::halt`], the request's body is drained instead.
    pub fn submit(&mut self, request: PutObjectRequest) {
        if self.halted {
            debug!(key = %request.key, "Upload submitted after a failure; discarding its data");
            discard(request.body);
        } else if self.in_flight.len() < self.max_parallel.get() {
            self.dispatch(request);
        } else {
            debug!(key = %request.key, queued = self.pending.len() + 1, "All upload slots busy; queuing upload");
            self.progress.upload_queued(&request.key);
            self.pending.push_back(request);
        }
    }

    /// Wait for the next dispatched upload to settle, and hand its slot to the oldest queued
    /// upload, if any.
    ///
    /// A failed upload halts the manager, as if by [`Self::halt`].  Returns `None` if nothing is
    /// in flight.
    ///
    /// Cancel safe: if the returned future is dropped before completion, no settlement is lost.
    pub async fn next_settlement(&mut self) -> Option<Settlement> {
        let joined = self.in_flight.join_next().await?;

        let settlement = match joined {
            Ok((_, Ok(output))) => {
                debug!(key = %output.key, bytes = output.bytes, "Upload succeeded");
                self.progress.object_uploaded(&output.key, output.bytes);

                Settlement::Uploaded(output)
            }
            Ok((key, Err(e))) => {
                error!(%key, err = ?e, "Upload failed");
                self.progress.upload_failed(&key);

                Settlement::Failed(e)
            }
            Err(e) => {
                error!(err = ?e, "Upload task panicked");

                Settlement::Failed(crate::error::SpawnSnafu.into_error(e))
            }
        };

        if let Settlement::Failed(_) = &settlement {
            self.halt();
        } else if let Some(next) = self.pending.pop_front() {
            self.dispatch(next);
        }

        Some(settlement)
    }

    /// Stop dispatching uploads.
    ///
    /// Uploads already running carry on; queued uploads are dropped and their data drained.
    pub fn halt(&mut self) {
        if !self.halted {
            debug!(
                in_flight = self.in_flight.len(),
                queued = self.pending.len(),
                "Halting uploads"
            );
        }

        self.halted = true;

        for request in self.pending.drain(..) {
            debug!(key = %request.key, "Dropping queued upload");
            discard(request.body);
        }
    }

    fn dispatch(&mut self, request: PutObjectRequest) {
        let bucket = self.bucket.clone();
        let key = request.key.clone();

        debug!(%key, size = ?request.size_hint, in_flight = self.in_flight.len() + 1, "Dispatching upload");
        self.progress.upload_starting(&key, request.size_hint);

        let span = debug_span!("upload", %key);
        self.in_flight.spawn(
            async move {
                let result = bucket.put_object(request).await;

                (key, result)
            }
            .instrument(span),
        );
    }
}

/// Consume an entry's data to the end without storing it anywhere.
///
/// This is the only way an entry that isn't uploaded is disposed of.  The archive reader can't
/// move past an entry until its data has been consumed.
pub(crate) fn discard(body: EntryBody) {
    tokio::spawn(async move {
        let path = body.path().to_string();

        if let Err(e) = body.drain().await {
            // The archive reader reports read errors itself
            debug!(%path, err = ?e, "Error while draining entry data");
        }
    });
}
