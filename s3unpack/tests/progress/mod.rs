//! Test helper that implements [`s3unpack::UploadProgressCallback`] by recording every progress
//! update in order, so tests can verify the progress reporting along with the outcome.
use s3unpack::{EntryHeader, EntryKind, SkipReason, UploadProgressCallback};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Clone, Debug, strum::EnumDiscriminants)]
#[allow(dead_code)] // Not every field is checked by a test but all of them are recorded
pub(crate) enum UploadProgressEvent {
    ArchiveBytesRead {
        bytes: usize,
    },

    EntryReceived {
        name: String,
        kind: EntryKind,
        size: Option<u64>,
    },

    EntrySkipped {
        name: String,
        reason: SkipReason,
    },

    UploadQueued {
        key: String,
    },

    UploadStarting {
        key: String,
        size: Option<u64>,
    },

    ObjectUploaded {
        key: String,
        size: u64,
    },

    UploadFailed {
        key: String,
    },

    ArchiveDrained {
        total_entries: usize,
        total_bytes: u64,
    },

    UploadsFinished {
        total_objects: usize,
        total_bytes: u64,
        duration: Duration,
    },
}

#[derive(Clone, Default)]
pub(crate) struct TestUploadProgressCallback {
    events: Arc<Mutex<Vec<UploadProgressEvent>>>,
}

impl TestUploadProgressCallback {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check that the updates recorded by a successful upload are consistent with each other.
    ///
    /// Not meaningful if the upload failed.
    pub fn sanity_check_updates(&self) {
        // Every byte the archive parser read is accounted for in the drained total
        let (_, archive_bytes) = self.archive_drained();
        assert_eq!(archive_bytes, self.archive_bytes_read());

        // Every entry received was either skipped or uploaded
        let received = self.entries_received();
        let skipped = self.filter_events(UploadProgressEventDiscriminants::EntrySkipped);
        let started = self.uploads_started();
        assert_eq!(received.len(), skipped.len() + started.len());

        let (total_entries, _) = self.archive_drained();
        assert_eq!(total_entries, received.len());

        // Each upload started exactly once and finished exactly once, and nothing failed
        let started_keys = started.iter().cloned().collect::<HashSet<_>>();
        assert_eq!(started.len(), started_keys.len(), "duplicate upload starts");

        let uploaded = self.objects_uploaded();
        let uploaded_keys = uploaded
            .iter()
            .map(|(key, _)| key.clone())
            .collect::<HashSet<_>>();
        assert_eq!(started_keys, uploaded_keys);
        assert!(self.uploads_failed().is_empty());

        // Queued uploads are a subset of the started ones
        for key in self.uploads_queued() {
            assert!(started_keys.contains(&key), "{key} was queued but never started");
        }

        // The final update matches the per-object updates, and comes last
        let (total_objects, total_bytes) = self.uploads_finished();
        assert_eq!(total_objects, uploaded.len());
        assert_eq!(
            total_bytes,
            uploaded.iter().map(|(_, size)| *size).sum::<u64>()
        );
        assert_matches::assert_matches!(
            self.events.lock().unwrap().last(),
            Some(UploadProgressEvent::UploadsFinished { .. })
        );
    }

    /// Sum of all archive bytes read updates
    pub fn archive_bytes_read(&self) -> u64 {
        self.filter_events(UploadProgressEventDiscriminants::ArchiveBytesRead)
            .into_iter()
            .map(|event| match event {
                UploadProgressEvent::ArchiveBytesRead { bytes } => bytes as u64,
                other => unreachable!("{other:?}"),
            })
            .sum()
    }

    /// Names of all entries received, in archive order
    pub fn entries_received(&self) -> Vec<String> {
        self.filter_events(UploadProgressEventDiscriminants::EntryReceived)
            .into_iter()
            .map(|event| match event {
                UploadProgressEvent::EntryReceived { name, .. } => name,
                other => unreachable!("{other:?}"),
            })
            .collect()
    }

    /// Names of skipped entries, with the reason
    pub fn entries_skipped(&self) -> Vec<(String, SkipReason)> {
        self.filter_events(UploadProgressEventDiscriminants::EntrySkipped)
            .into_iter()
            .map(|event| match event {
                UploadProgressEvent::EntrySkipped { name, reason } => (name, reason),
                other => unreachable!("{other:?}"),
            })
            .collect()
    }

    pub fn uploads_queued(&self) -> Vec<String> {
        self.filter_events(UploadProgressEventDiscriminants::UploadQueued)
            .into_iter()
            .map(|event| match event {
                UploadProgressEvent::UploadQueued { key } => key,
                other => unreachable!("{other:?}"),
            })
            .collect()
    }

    pub fn uploads_started(&self) -> Vec<String> {
        self.filter_events(UploadProgressEventDiscriminants::UploadStarting)
            .into_iter()
            .map(|event| match event {
                UploadProgressEvent::UploadStarting { key, .. } => key,
                other => unreachable!("{other:?}"),
            })
            .collect()
    }

    pub fn objects_uploaded(&self) -> Vec<(String, u64)> {
        self.filter_events(UploadProgressEventDiscriminants::ObjectUploaded)
            .into_iter()
            .map(|event| match event {
                UploadProgressEvent::ObjectUploaded { key, size } => (key, size),
                other => unreachable!("{other:?}"),
            })
            .collect()
    }

    pub fn uploads_failed(&self) -> Vec<String> {
        self.filter_events(UploadProgressEventDiscriminants::UploadFailed)
            .into_iter()
            .map(|event| match event {
                UploadProgressEvent::UploadFailed { key } => key,
                other => unreachable!("{other:?}"),
            })
            .collect()
    }

    /// The `(total_entries, total_bytes)` of the one archive drained update
    pub fn archive_drained(&self) -> (usize, u64) {
        let events = self.filter_events(UploadProgressEventDiscriminants::ArchiveDrained);
        assert_eq!(1, events.len(), "expected exactly one archive drained update");

        match &events[0] {
            UploadProgressEvent::ArchiveDrained {
                total_entries,
                total_bytes,
            } => (*total_entries, *total_bytes),
            other => unreachable!("{other:?}"),
        }
    }

    /// The `(total_objects, total_bytes)` of the one uploads finished update
    pub fn uploads_finished(&self) -> (usize, u64) {
        let events = self.filter_events(UploadProgressEventDiscriminants::UploadsFinished);
        assert_eq!(1, events.len(), "expected exactly one uploads finished update");

        match &events[0] {
            UploadProgressEvent::UploadsFinished {
                total_objects,
                total_bytes,
                ..
            } => (*total_objects, *total_bytes),
            other => unreachable!("{other:?}"),
        }
    }

    pub fn has_drained(&self) -> bool {
        !self
            .filter_events(UploadProgressEventDiscriminants::ArchiveDrained)
            .is_empty()
    }

    pub fn has_finished(&self) -> bool {
        !self
            .filter_events(UploadProgressEventDiscriminants::UploadsFinished)
            .is_empty()
    }

    fn filter_events(
        &self,
        discriminant: UploadProgressEventDiscriminants,
    ) -> Vec<UploadProgressEvent> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|event| UploadProgressEventDiscriminants::from(*event) == discriminant)
            .cloned()
            .collect()
    }

    fn report(&self, event: UploadProgressEvent) {
        self.events.lock().unwrap().push(event);
    }
}

impl UploadProgressCallback for TestUploadProgressCallback {
    fn archive_bytes_read(&self, bytes: usize) {
        self.report(UploadProgressEvent::ArchiveBytesRead { bytes });
    }

    fn entry_received(&self, header: &EntryHeader) {
        self.report(UploadProgressEvent::EntryReceived {
            name: header.name.clone(),
            kind: header.kind,
            size: header.size,
        });
    }

    fn entry_skipped(&self, header: &EntryHeader, reason: SkipReason) {
        self.report(UploadProgressEvent::EntrySkipped {
            name: header.name.clone(),
            reason,
        });
    }

    fn upload_queued(&self, key: &str) {
        self.report(UploadProgressEvent::UploadQueued {
            key: key.to_string(),
        });
    }

    fn upload_starting(&self, key: &str, size: Option<u64>) {
        self.report(UploadProgressEvent::UploadStarting {
            key: key.to_string(),
            size,
        });
    }

    fn object_uploaded(&self, key: &str, size: u64) {
        self.report(UploadProgressEvent::ObjectUploaded {
            key: key.to_string(),
            size,
        });
    }

    fn upload_failed(&self, key: &str) {
        self.report(UploadProgressEvent::UploadFailed {
            key: key.to_string(),
        });
    }

    fn archive_drained(&self, total_entries: usize, total_bytes: u64) {
        self.report(UploadProgressEvent::ArchiveDrained {
            total_entries,
            total_bytes,
        });
    }

    fn uploads_finished(&self, total_objects: usize, total_bytes: u64, duration: Duration) {
        self.report(UploadProgressEvent::UploadsFinished {
            total_objects,
            total_bytes,
            duration,
        });
    }
}
