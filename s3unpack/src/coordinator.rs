//! The task that ties the archive reader to the uploads.
//!
//! The coordinator consumes [`ContainerEvent`]s, decides what happens to each entry, hands uploads
//! to the [`UploadSlots`], and watches for uploads to settle.  The operation is done only when
//! both the archive has been read to the end and every upload has settled; those two things can
//! happen in either order.
use crate::container::{ContainerEvent, Entry, EntryKind};
use crate::objstore::PutObjectRequest;
use crate::progress::{SkipReason, UploadProgressCallback};
use crate::sink::{EntryObserver, ObjectAnnotations, UploadOutcome};
use crate::slots::{Settlement, UploadSlots};
use crate::{keys, EntryFilter, Result, S3UnpackError};
use snafu::prelude::*;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum CoordinatorState {
    /// Entries are still arriving
    Running,

    /// The archive has been read to the end but some uploads are still queued
    Draining,

    /// Nothing is queued; waiting only for running uploads to settle
    Settling,

    Done,

    /// Something failed.  Entries that still arrive are drained, and running uploads are
    /// allowed to settle, before the error is reported.
    Errored,
}

pub(crate) struct Coordinator {
    prefix: String,
    filter: EntryFilter,
    on_entry: Option<Arc<EntryObserver>>,
    slots: UploadSlots,
    progress: Arc<dyn UploadProgressCallback>,

    state: CoordinatorState,

    /// Keys of uploaded objects, in the order their uploads settled
    keys: Vec<String>,
    uploaded_bytes: u64,

    /// The container reader has read all of the input and produced its last entry
    drained: bool,
    total_entries: usize,
    archive_bytes: u64,

    /// The container reader's event channel is closed
    input_closed: bool,

    first_error: Option<S3UnpackError>,
}

impl Coordinator {
    pub fn new(
        prefix: String,
        filter: EntryFilter,
        on_entry: Option<Arc<EntryObserver>>,
        slots: UploadSlots,
        progress: Arc<dyn UploadProgressCallback>,
    ) -> Self {
        Self {
            prefix,
            filter,
            on_entry,
            slots,
            progress,
            state: CoordinatorState::Running,
            keys: Vec::new(),
            uploaded_bytes: 0,
            drained: false,
            total_entries: 0,
            archive_bytes: 0,
            input_closed: false,
            first_error: None,
        }
    }

    #[cfg(test)]
    pub fn state(&self) -> CoordinatorState {
        self.state
    }

    /// Drive the operation to the end: until the reader's events are exhausted and every upload
    /// has settled.  Returns the first error, if there was one.
    pub async fn run(
        mut self,
        mut events: mpsc::Receiver<ContainerEvent>,
        reader: JoinHandle<()>,
    ) -> Result<UploadOutcome> {
        let started = Instant::now();

        info!(prefix = %self.prefix, max_parallel = self.slots.max_parallel(), "Starting archive upload");

        while !self.is_finished() {
            // While the queue is full, leave further entries waiting in the archive reader
            let accept_entries =
                !self.input_closed && self.slots.queued() < self.slots.max_parallel();
            let uploads_running = self.slots.in_flight() > 0;

            tokio::select! {
                event = events.recv(), if accept_entries => {
                    match event {
                        Some(event) => self.handle_event(event),
                        None => {
                            debug!("Archive reader finished");
                            self.input_closed = true;
                        }
                    }
                }
                Some(settlement) = self.slots.next_settlement(), if uploads_running => {
                    self.handle_settlement(settlement);
                }
                else => break,
            }

            self.update_state();
        }

        if let Err(e) = reader.await.context(crate::error::SpawnBlockingSnafu) {
            self.fail(e);
        } else if !self.drained && self.first_error.is_none() {
            // The reader always reports an error or the end of the archive before it exits
            self.fail(S3UnpackError::SinkClosed);
        }
        self.update_state();

        match self.first_error {
            Some(e) => {
                error!(err = ?e, uploaded = self.keys.len(), "Archive upload failed");

                Err(e)
            }
            None => {
                let duration = started.elapsed();

                info!(
                    objects = self.keys.len(),
                    bytes = self.uploaded_bytes,
                    ?duration,
                    "Archive upload complete"
                );
                self.progress
                    .uploads_finished(self.keys.len(), self.uploaded_bytes, duration);

                Ok(UploadOutcome {
                    keys: self.keys,
                    total_bytes: self.uploaded_bytes,
                    total_entries: self.total_entries,
                    archive_bytes: self.archive_bytes,
                })
            }
        }
    }

    fn is_finished(&self) -> bool {
        self.input_closed && self.slots.is_idle()
    }

    fn handle_event(&mut self, event: ContainerEvent) {
        match event {
            ContainerEvent::Entry(entry) => self.handle_entry(entry),
            ContainerEvent::Error(e) => self.fail(e),
            ContainerEvent::Drained {
                total_entries,
                total_bytes,
            } => {
                debug!(total_entries, total_bytes, "Archive drained");

                self.drained = true;
                self.total_entries = total_entries;
                self.archive_bytes = total_bytes;
                self.progress.archive_drained(total_entries, total_bytes);
            }
        }
    }

    fn handle_entry(&mut self, entry: Entry) {
        let Entry { header, body } = entry;

        self.progress.entry_received(&header);

        let mut annotations = ObjectAnnotations::default();
        if let Some(on_entry) = &self.on_entry {
            on_entry(&header, &mut annotations);
        }

        let skip_reason = match header.kind {
            EntryKind::Directory => Some(SkipReason::Directory),
            EntryKind::Special => Some(SkipReason::Special),
            EntryKind::File if self.first_error.is_some() => Some(SkipReason::AfterError),
            EntryKind::File if self.filter.ignore(&header.name) => Some(SkipReason::Ignored),
            EntryKind::File => None,
        };

        if let Some(reason) = skip_reason {
            debug!(path = %header.name, ?reason, "Skipping entry");
            self.progress.entry_skipped(&header, reason);
            crate::slots::discard(body);

            return;
        }

        let key = keys::build_key(&self.prefix, &header.name);
        let content_type = annotations
            .content_type
            .or_else(|| keys::infer_content_type(&header.name));

        debug!(path = %header.name, %key, ?content_type, size = ?header.size, "Submitting upload");

        self.slots.submit(PutObjectRequest {
            key,
            body,
            size_hint: header.size,
            content_type,
            tagging: annotations.tagging,
            metadata: annotations.metadata,
        });
    }

    fn handle_settlement(&mut self, settlement: Settlement) {
        match settlement {
            Settlement::Uploaded(output) => {
                self.uploaded_bytes += output.bytes;
                self.keys.push(output.key);
            }
            Settlement::Failed(e) => self.fail(e),
        }
    }

    /// Record an error.  Only the first one is reported; later ones are logged and dropped.
    fn fail(&mut self, error: S3UnpackError) {
        if self.first_error.is_some() {
            debug!(err = ?error, "Ignoring error after the first failure");
            return;
        }

        error!(err = ?error, "Archive upload failing");

        self.first_error = Some(error);
        self.slots.halt();
    }

    fn update_state(&mut self) {
        let state = if self.first_error.is_some() {
            CoordinatorState::Errored
        } else if !self.drained {
            CoordinatorState::Running
        } else if self.slots.queued() > 0 {
            CoordinatorState::Draining
        } else if self.slots.in_flight() > 0 {
            CoordinatorState::Settling
        } else {
            CoordinatorState::Done
        };

        if state != self.state {
            debug!(from = ?self.state, to = ?state, "Coordinator state change");
            self.state = state;
        }
    }
}
