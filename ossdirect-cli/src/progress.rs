//! Implementations of progress callbacks that render progress bars
use ossdirect::{ObjectDetails, PartFailure, Result};
use std::{borrow::Cow, future::Future, time::Duration, time::Instant};
use tracing::{error, warn};

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
            .unwrap()
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
    );

    spinner.enable_steady_tick(Duration::from_millis(120));

    spinner.set_message(message);

    let result = task.await;

    spinner.finish_and_clear();

    result
}

/// Run the specified upload job, with a progress bar for extra pretty-ness
pub(crate) async fn run_upload_job(
    globals: &super::Globals,
    job: ossdirect::UploadJob,
) -> Result<ObjectDetails> {
    let progress = UploadProgressReport::new(hide_progress(globals), &job);

    job.run(ctrl_c(), progress).await
}

/// Run the specified download job, with a progress bar for extra pretty-ness
pub(crate) async fn run_download_job(
    globals: &super::Globals,
    job: ossdirect::DownloadJob,
    to_stdout: bool,
) -> Result<()> {
    // The progress bar is drawn on stderr so it doesn't corrupt the object data even when
    // writing to stdout, but it still makes a mess of a terminal that's showing both
    let progress = DownloadProgressReport::new(hide_progress(globals) || to_stdout);

    job.run(ctrl_c(), progress).await?;

    Ok(())
}

/// Progress should be hidden for either of verbose mode (because there will be a flurry of log
/// messages and the progress bar rendering will be all messed up), or quiet mode (because
/// progress bars are not quiet).
fn hide_progress(globals: &super::Globals) -> bool {
    globals.verbose || globals.quiet
}

/// Completes when the user hits Ctrl-C, which aborts the running job
async fn ctrl_c() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            warn!("Interrupted; aborting the transfer");
        }
        Err(e) => {
            // Without a signal handler there's no way to abort, but the job can still run
            error!(err = ?e, "Unable to listen for Ctrl-C");
            futures::future::pending::<()>().await
        }
    }
}

fn standard_style() -> indicatif::ProgressStyle {
    indicatif::ProgressStyle::with_template(
        "{spinner:.green} {msg:<40!} [{bar:30.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})",
    )
    .unwrap()
    .progress_chars("#>-")
}

/// Style for uploads from a reader, where the total size isn't known until the end
fn unknown_length_style() -> indicatif::ProgressStyle {
    indicatif::ProgressStyle::with_template("{spinner:.green} {msg:<40!} {bytes} ({bytes_per_sec})")
        .unwrap()
}

fn throughput(total_bytes: u64, duration: Duration) -> (indicatif::BinaryBytes, indicatif::HumanDuration) {
    let bytes_per_second = (total_bytes as f64 / duration.as_secs_f64().max(0.001)) as u64;

    (
        indicatif::BinaryBytes(bytes_per_second),
        indicatif::HumanDuration(duration),
    )
}

/// Progress reporting for the upload operation, which receives progress updates from the lib
/// crate and renders a progress bar accordingly
struct UploadProgressReport {
    started: Instant,

    /// Bytes of the parts that have been uploaded successfully.  Failed attempts don't count.
    parts_uploaded: indicatif::ProgressBar,
}

impl UploadProgressReport {
    fn new(hide_progress: bool, job: &ossdirect::UploadJob) -> Self {
        let parts_uploaded = if hide_progress {
            indicatif::ProgressBar::hidden()
        } else {
            match job.total_bytes() {
                Some(total_bytes) => {
                    let bar = indicatif::ProgressBar::new(total_bytes);
                    bar.set_style(standard_style());
                    bar
                }
                None => {
                    let bar = indicatif::ProgressBar::new_spinner();
                    bar.set_style(unknown_length_style());
                    bar
                }
            }
        };
        parts_uploaded.enable_steady_tick(Duration::from_millis(120));

        Self {
            started: Instant::now(),
            parts_uploaded,
        }
    }
}

#[allow(unused_variables)] // so we can keep the unused progress methods with their comments
impl ossdirect::UploadProgressCallback for UploadProgressReport {
    fn upload_starting(
        &self,
        bucket: &str,
        key: &str,
        total_bytes: Option<u64>,
        total_parts: Option<usize>,
    ) {
        self.parts_uploaded.set_message(match total_parts {
            Some(total_parts) => format!("Uploading {key} ({total_parts} parts)"),
            None => format!("Uploading {key}"),
        });
    }

    fn upload_urls_issued(&self, bucket: &str, key: &str, first_part: usize, count: usize) {
        // Happens every `max_batch_size` parts, and after failures; not interesting enough to
        // show
    }

    fn part_attempt_failed(
        &self,
        bucket: &str,
        key: &str,
        part_number: usize,
        attempt: usize,
        failure: &PartFailure,
    ) {
        self.parts_uploaded.println(format!(
            "Attempt {attempt} to upload part {part_number} failed: {failure}"
        ));
    }

    fn part_uploaded(&self, bucket: &str, key: &str, part_number: usize, part_size: usize) {
        self.parts_uploaded.inc(part_size as u64);
        self.parts_uploaded
            .set_message(format!("{key} (part {part_number})"));
    }

    fn upload_finalizing(&self, bucket: &str, key: &str, total_parts: usize, total_bytes: u64) {
        self.parts_uploaded.set_length(total_bytes);
        self.parts_uploaded
            .set_message(format!("Completing upload of {total_parts} parts..."));
    }

    fn upload_completed(&self, bucket: &str, key: &str, details: &ObjectDetails) {
        let (bytes_per_second, duration) = throughput(details.size, self.started.elapsed());
        let size = indicatif::BinaryBytes(details.size);

        self.parts_uploaded.println(format!(
            "Upload complete!  Uploaded '{key}' ({size}) to bucket '{bucket}' in {duration} ({bytes_per_second}/s)"
        ));
        self.parts_uploaded.finish_and_clear();
    }
}

/// Progress reporting for the download operation
struct DownloadProgressReport {
    started: Instant,
    bytes_received: indicatif::ProgressBar,
}

impl DownloadProgressReport {
    fn new(hide_progress: bool) -> Self {
        let bytes_received = if hide_progress {
            indicatif::ProgressBar::hidden()
        } else {
            indicatif::ProgressBar::new_spinner()
        };
        bytes_received.set_style(unknown_length_style());
        bytes_received.set_message("Requesting download URL...");
        bytes_received.enable_steady_tick(Duration::from_millis(120));

        Self {
            started: Instant::now(),
            bytes_received,
        }
    }
}

impl ossdirect::DownloadProgressCallback for DownloadProgressReport {
    fn download_starting(&self, _bucket: &str, key: &str, total_bytes: Option<u64>) {
        if let Some(total_bytes) = total_bytes {
            self.bytes_received.set_length(total_bytes);
            self.bytes_received.set_style(standard_style());
        }
        self.bytes_received.set_message(key.to_string());
    }

    fn download_bytes_received(&self, _bucket: &str, _key: &str, bytes: usize) {
        self.bytes_received.inc(bytes as u64);
    }

    fn download_completed(&self, bucket: &str, key: &str, total_bytes: u64) {
        let (bytes_per_second, duration) = throughput(total_bytes, self.started.elapsed());
        let size = indicatif::BinaryBytes(total_bytes);

        self.bytes_received.println(format!(
            "Download complete!  Downloaded '{key}' ({size}) from bucket '{bucket}' in {duration} ({bytes_per_second}/s)"
        ));
        self.bytes_received.finish_and_clear();
    }
}
