//! Progress bars for an archive upload
use s3unpack::{ArchiveSinkBuilder, EntryHeader, SkipReason, UploadOutcome};
use std::{
    borrow::Cow,
    future::Future,
    sync::atomic::{AtomicUsize, Ordering},
    sync::Arc,
    time::Duration,
};
use tokio::io::AsyncRead;

/// Display a spinner while some long-running but unmeasurable task is running, then hide the
/// spinner when it finishes
pub(crate) async fn with_spinner<S, F, T>(globals: &super::Globals, message: S, task: F) -> T
where
    S: Into<Cow<'static, str>>,
    F: Future<Output = T>,
{
    let spinner = if !hide_progress(globals) {
        indicatif::ProgressBar::new_spinner()
    } else {
        indicatif::ProgressBar::hidden()
    };

    spinner.set_style(
        indicatif::ProgressStyle::with_template("{spinner:.blue} {msg}")
            .expect("BUG: spinner template is valid")
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
    );

    spinner.enable_steady_tick(Duration::from_millis(120));

    spinner.set_message(message);

    let result = task.await;

    spinner.finish_and_clear();

    result
}

/// Unpack the archive read from `input`, with progress bars
pub(crate) async fn run_upload<R>(
    globals: &super::Globals,
    builder: ArchiveSinkBuilder,
    input: R,
) -> s3unpack::Result<UploadOutcome>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let progress = UploadProgressReport::new(hide_progress(globals));

    let sink = builder.build_with_progress(progress.clone())?;
    let result = s3unpack::upload_archive(input, sink).await;

    if result.is_err() {
        progress.abandon();
    }

    result
}

/// Progress bars would be garbled by a flurry of log messages in verbose mode, and aren't quiet
fn hide_progress(globals: &super::Globals) -> bool {
    globals.verbose || globals.quiet
}

/// Renders the progress updates of an upload as two bars: how much of the archive has been read,
/// and how many of the objects found so far have been uploaded.
#[derive(Clone)]
struct UploadProgressReport {
    #[allow(dead_code)] // Keeps the bars grouped; must stay in scope
    multi: indicatif::MultiProgress,

    /// Archive bytes read.  The size of the archive isn't known up front, so this is a spinner
    /// with a byte count rather than a bar.
    archive_bytes_read: indicatif::ProgressBar,

    /// Objects uploaded out of the uploads started so far.  The length grows as the archive is
    /// read.
    objects_uploaded: indicatif::ProgressBar,

    skipped: Arc<AtomicUsize>,
}

impl UploadProgressReport {
    fn new(hide_progress: bool) -> Self {
        /// The template syntax for right alignment doesn't pad the prefix, so do it here
        fn pad_prefix(prefix: &'static str) -> String {
            format!("{prefix:>16}")
        }

        let multi = if !hide_progress {
            indicatif::MultiProgress::new()
        } else {
            indicatif::MultiProgress::with_draw_target(indicatif::ProgressDrawTarget::hidden())
        };

        let archive_bytes_read = multi.add(indicatif::ProgressBar::new_spinner());
        archive_bytes_read.set_style(
            indicatif::ProgressStyle::with_template(
                "{spinner:.green} {prefix}: {msg:<55!} {bytes} ({bytes_per_sec})",
            )
            .expect("BUG: progress template is valid"),
        );
        archive_bytes_read.set_prefix(pad_prefix("Archive read"));
        archive_bytes_read.enable_steady_tick(Duration::from_millis(120));

        let objects_uploaded = multi.add(indicatif::ProgressBar::new(0));
        objects_uploaded.set_style(
            indicatif::ProgressStyle::with_template(
                "{spinner:.green} {prefix}: {msg:<55!} [{bar:20.cyan/blue}] {pos}/{len}",
            )
            .expect("BUG: progress template is valid")
            .progress_chars("#>-"),
        );
        objects_uploaded.set_prefix(pad_prefix("Objects uploaded"));

        Self {
            multi,
            archive_bytes_read,
            objects_uploaded,
            skipped: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn abandon(&self) {
        self.archive_bytes_read.abandon();
        self.objects_uploaded.abandon_with_message("Failed");
    }
}

#[allow(unused_variables)] // so we can keep the unused progress methods with their comments
impl s3unpack::UploadProgressCallback for UploadProgressReport {
    fn archive_bytes_read(&self, bytes: usize) {
        self.archive_bytes_read.inc(bytes as u64);
    }

    fn entry_received(&self, header: &EntryHeader) {
        self.archive_bytes_read.set_message(header.name.clone());
    }

    fn entry_skipped(&self, header: &EntryHeader, reason: SkipReason) {
        // Directories are routine; only the others are worth counting
        if reason != SkipReason::Directory {
            self.skipped.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn upload_queued(&self, key: &str) {
        // Queued uploads show up when they start
    }

    fn upload_starting(&self, key: &str, size: Option<u64>) {
        self.objects_uploaded.inc_length(1);
        self.objects_uploaded.set_message(key.to_string());
    }

    fn object_uploaded(&self, key: &str, size: u64) {
        self.objects_uploaded.inc(1);
    }

    fn upload_failed(&self, key: &str) {
        self.objects_uploaded
            .set_message(format!("Upload of {key} failed"));
    }

    fn archive_drained(&self, total_entries: usize, total_bytes: u64) {
        self.archive_bytes_read.finish_with_message(format!(
            "{total_entries} entries, {}",
            indicatif::BinaryBytes(total_bytes)
        ));
    }

    fn uploads_finished(&self, total_objects: usize, total_bytes: u64, duration: Duration) {
        let bytes_per_second = (total_bytes as f64 / duration.as_secs_f64().max(0.001)) as u64;
        let skipped = self.skipped.load(Ordering::Relaxed);

        let mut message = format!(
            "{} in {} ({}/s)",
            indicatif::BinaryBytes(total_bytes),
            indicatif::HumanDuration(duration),
            indicatif::BinaryBytes(bytes_per_second)
        );
        if skipped > 0 {
            message.push_str(&format!(", {skipped} entries skipped"));
        }

        self.objects_uploaded.finish_with_message(message);
    }
}
