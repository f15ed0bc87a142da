use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use tracing::{debug, warn};

use crate::index::ContentIndex;
use crate::types::{
    ImageRecord, ImageStatus, UploadErrorEntry, UploadProgress, UploadSummary, UploadTask,
    UploadTaskStatus,
};

const DEFAULT_CONCURRENCY: usize = 3;
const DEFAULT_RETRY_TIMES: u32 = 3;
const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);
const DEFAULT_MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct UploadConfig {
    pub concurrency: usize,
    pub retry_times: u32,
    pub retry_delay: Duration,
    pub max_retry_delay: Duration,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            retry_times: DEFAULT_RETRY_TIMES,
            retry_delay: DEFAULT_RETRY_DELAY,
            max_retry_delay: DEFAULT_MAX_RETRY_DELAY,
        }
    }
}

/// Form fields the remote endpoint requires alongside the file bytes.
#[derive(Debug, Clone, Default)]
pub struct UploadParams {
    pub apply_code: String,
    pub user_id: String,
    pub user_code: String,
}

/// Pushes one task's bytes to the remote endpoint and returns the final
/// remote URL. Tests substitute their own implementation.
pub trait ImageUploader: Send + Sync {
    fn upload(&self, task: &UploadTask, params: &UploadParams) -> Result<String, String>;
}

/// Events around the queue drain. All methods default to no-ops so
/// callers implement only what they observe.
pub trait UploadObserver: Sync {
    fn on_progress(&self, _progress: &UploadProgress) {}
    fn on_task_success(&self, _image_id: &str, _new_url: &str) {}
    fn on_task_error(&self, _image_id: &str, _error: &str, _attempts: u32) {}
    fn on_complete(&self, _summary: &UploadSummary) {}
}

pub struct NoopObserver;

impl UploadObserver for NoopObserver {}

/// Exponential backoff for one failed attempt, capped.
fn backoff_delay(config: &UploadConfig, attempt: u32) -> Duration {
    let factor = 1u32 << attempt.saturating_sub(1).min(16);
    config
        .retry_delay
        .saturating_mul(factor)
        .min(config.max_retry_delay)
}

#[derive(Default)]
struct DrainState {
    completed: usize,
    success: usize,
    failed: usize,
    running: usize,
    summary: UploadSummary,
}

/// Drains "needs upload" records with bounded concurrency: `concurrency`
/// workers pull from one shared queue, so no task is processed twice and
/// no worker sits on a pre-partitioned backlog.
pub struct UploadManager {
    config: UploadConfig,
    uploader: Arc<dyn ImageUploader>,
    index: Arc<ContentIndex>,
    queue: Mutex<Vec<UploadTask>>,
    params: Mutex<UploadParams>,
    cancelled: AtomicBool,
}

impl UploadManager {
    pub fn new(
        config: UploadConfig,
        uploader: Arc<dyn ImageUploader>,
        index: Arc<ContentIndex>,
    ) -> Self {
        Self {
            config,
            uploader,
            index,
            queue: Mutex::new(Vec::new()),
            params: Mutex::new(UploadParams::default()),
            cancelled: AtomicBool::new(false),
        }
    }

    /// Builds the pending queue from records. Records without a local
    /// file cannot upload and are skipped here, not failed later.
    pub fn set_queue(&self, images: &[ImageRecord], params: UploadParams) {
        let tasks: Vec<UploadTask> = images
            .iter()
            .filter_map(|record| {
                let local_path = record.local_path.clone()?;
                Some(UploadTask {
                    image_id: record.remote_url.clone(),
                    image_type: record.image_type,
                    sku_index: record.sku_index,
                    local_path,
                    attempts: 0,
                    status: UploadTaskStatus::Pending,
                })
            })
            .collect();
        *self.queue.lock().expect("poisoned") = tasks;
        *self.params.lock().expect("poisoned") = params;
        self.cancelled.store(false, Ordering::SeqCst);
    }

    /// Convenience: queue every mid-edit record of a product.
    pub fn queue_modified(&self, apply_code: &str, params: UploadParams) -> usize {
        let records = self.index.all_modified_images(apply_code);
        self.set_queue(&records, params);
        self.queue.lock().expect("poisoned").len()
    }

    /// Cooperative cancellation: still-pending tasks settle as cancelled,
    /// in-flight tasks run to completion.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Runs the drain to completion and always reports, partial failure
    /// included. `success + failed == total` holds on return for every
    /// queue composition and failure pattern.
    pub fn start_upload(&self, observer: &dyn UploadObserver) -> UploadSummary {
        let tasks: Vec<UploadTask> = std::mem::take(&mut *self.queue.lock().expect("poisoned"));
        let total = tasks.len();
        let pending: Mutex<VecDeque<UploadTask>> = Mutex::new(tasks.into());
        let state = Mutex::new(DrainState {
            summary: UploadSummary {
                total,
                ..Default::default()
            },
            ..Default::default()
        });
        let params = self.params.lock().expect("poisoned").clone();
        let workers = self.config.concurrency.max(1).min(total.max(1));

        thread::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(|| self.worker_loop(&pending, &state, &params, observer));
            }
        });

        let mut state = state.into_inner().expect("poisoned");
        state.summary.success = state.success;
        state.summary.failed = state.failed;
        observer.on_complete(&state.summary);
        state.summary
    }

    fn worker_loop(
        &self,
        pending: &Mutex<VecDeque<UploadTask>>,
        state: &Mutex<DrainState>,
        params: &UploadParams,
        observer: &dyn UploadObserver,
    ) {
        loop {
            let task = pending.lock().expect("poisoned").pop_front();
            let Some(mut task) = task else {
                break;
            };

            if self.cancelled.load(Ordering::SeqCst) {
                task.status = UploadTaskStatus::Cancelled;
                self.settle(state, observer, task, Err("cancelled".to_string()));
                continue;
            }

            {
                let mut guard = state.lock().expect("poisoned");
                guard.running += 1;
            }
            task.status = UploadTaskStatus::Running;

            let result = loop {
                task.attempts += 1;
                match self.uploader.upload(&task, params) {
                    Ok(url) if !url.trim().is_empty() => break Ok(url),
                    Ok(_) => {
                        warn!(image = %task.image_id, "upload returned an empty url");
                        break Err("upload returned an empty url".to_string());
                    }
                    Err(err) => {
                        if task.attempts > self.config.retry_times {
                            break Err(err);
                        }
                        let delay = backoff_delay(&self.config, task.attempts);
                        debug!(
                            image = %task.image_id,
                            attempt = task.attempts,
                            delay_ms = delay.as_millis() as u64,
                            "upload attempt failed, backing off"
                        );
                        thread::sleep(delay);
                    }
                }
            };

            {
                let mut guard = state.lock().expect("poisoned");
                guard.running -= 1;
            }
            task.status = match result {
                Ok(_) => UploadTaskStatus::Succeeded,
                Err(_) => UploadTaskStatus::Failed,
            };
            self.settle(state, observer, task, result);
        }
    }

    /// Terminal bookkeeping for one task: aggregate, mark the record when
    /// the upload landed, fire progress. A task's exhausted retries never
    /// halt the other workers.
    fn settle(
        &self,
        state: &Mutex<DrainState>,
        observer: &dyn UploadObserver,
        task: UploadTask,
        result: Result<String, String>,
    ) {
        let progress = {
            let mut guard = state.lock().expect("poisoned");
            guard.completed += 1;
            match &result {
                Ok(url) => {
                    guard.success += 1;
                    guard
                        .summary
                        .new_urls
                        .insert(task.image_id.clone(), url.clone());
                }
                Err(err) => {
                    guard.failed += 1;
                    guard.summary.errors.push(UploadErrorEntry {
                        image_id: task.image_id.clone(),
                        error: err.clone(),
                        attempts: task.attempts,
                    });
                }
            }
            UploadProgress {
                total: guard.summary.total,
                completed: guard.completed,
                success: guard.success,
                failed: guard.failed,
                running: guard.running,
                current_task: Some(task.image_id.clone()),
            }
        };

        match &result {
            Ok(url) => {
                // Uploaded means finished editing locally; synced maps to
                // completed in the three-state vocabulary.
                if let Err(err) = self
                    .index
                    .update_record(&task.image_id, |record| {
                        record.status = ImageStatus::Completed;
                    })
                {
                    warn!(image = %task.image_id, error = %err, "uploaded but index update failed");
                }
                observer.on_task_success(&task.image_id, url);
            }
            Err(err) => observer.on_task_error(&task.image_id, err, task.attempts),
        }
        observer.on_progress(&progress);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::InitOptions;
    use crate::types::ImageType;
    use std::sync::atomic::AtomicUsize;

    struct ScriptedUploader {
        /// url -> number of failures before success; None = always fail.
        plan: std::collections::HashMap<String, Option<u32>>,
        calls: AtomicUsize,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        attempt_counts: Mutex<std::collections::HashMap<String, u32>>,
        work_delay: Duration,
    }

    impl ScriptedUploader {
        fn new(plan: &[(&str, Option<u32>)]) -> Self {
            Self {
                plan: plan
                    .iter()
                    .map(|(url, failures)| (url.to_string(), *failures))
                    .collect(),
                calls: AtomicUsize::new(0),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
                attempt_counts: Mutex::new(Default::default()),
                work_delay: Duration::ZERO,
            }
        }

        fn with_delay(mut self, delay: Duration) -> Self {
            self.work_delay = delay;
            self
        }
    }

    impl ImageUploader for ScriptedUploader {
        fn upload(&self, task: &UploadTask, _params: &UploadParams) -> Result<String, String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            if !self.work_delay.is_zero() {
                thread::sleep(self.work_delay);
            }
            let attempt = {
                let mut counts = self.attempt_counts.lock().unwrap();
                let entry = counts.entry(task.image_id.clone()).or_insert(0);
                *entry += 1;
                *entry
            };
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            match self.plan.get(&task.image_id) {
                Some(None) => Err("backend rejected".into()),
                Some(Some(failures)) if attempt <= *failures => Err("transient".into()),
                _ => Ok(format!("https://cdn.example.com/final/{}", attempt)),
            }
        }
    }

    fn record(url: &str) -> ImageRecord {
        ImageRecord {
            remote_url: url.into(),
            apply_code: "AP-1".into(),
            image_type: ImageType::Sku,
            sku_index: Some(0),
            local_path: Some(format!("AP-1/{}.jpg", url)),
            status: ImageStatus::Editing,
            file_size: Some(10),
            timestamp: 0,
            host_document_id: None,
            fingerprint: None,
        }
    }

    fn fast_config(concurrency: usize) -> UploadConfig {
        UploadConfig {
            concurrency,
            retry_times: 3,
            retry_delay: Duration::from_millis(1),
            max_retry_delay: Duration::from_millis(4),
        }
    }

    fn manager_with(
        uploader: ScriptedUploader,
        config: UploadConfig,
        records: &[ImageRecord],
    ) -> (tempfile::TempDir, Arc<ContentIndex>, UploadManager, Arc<ScriptedUploader>) {
        let dir = tempfile::tempdir().expect("temp dir");
        let index = Arc::new(ContentIndex::new(dir.path().join("index.json")));
        index.initialize(InitOptions::default()).expect("initialize");
        for rec in records {
            index.upsert_record(rec.clone()).expect("seed");
        }
        let uploader = Arc::new(uploader);
        let manager = UploadManager::new(config, Arc::clone(&uploader) as Arc<dyn ImageUploader>, Arc::clone(&index));
        manager.set_queue(records, UploadParams::default());
        (dir, index, manager, uploader)
    }

    #[derive(Default)]
    struct RecordingObserver {
        progress: Mutex<Vec<UploadProgress>>,
        completes: AtomicUsize,
    }

    impl UploadObserver for RecordingObserver {
        fn on_progress(&self, progress: &UploadProgress) {
            self.progress.lock().unwrap().push(progress.clone());
        }

        fn on_complete(&self, _summary: &UploadSummary) {
            self.completes.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn summary_is_exhaustive_for_mixed_outcomes() {
        let uploader = ScriptedUploader::new(&[
            ("a", Some(0)),
            ("b", None),
            ("c", Some(2)),
            ("d", Some(0)),
        ]);
        let records = [record("a"), record("b"), record("c"), record("d")];
        let (_dir, index, manager, _) = manager_with(uploader, fast_config(2), &records);

        let observer = RecordingObserver::default();
        let summary = manager.start_upload(&observer);

        assert_eq!(summary.total, 4);
        assert_eq!(summary.success + summary.failed, summary.total);
        assert_eq!(summary.success, 3);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.new_urls.len(), 3);
        assert!(summary.new_urls.contains_key("c"), "retried task still lands");
        assert_eq!(summary.errors.len(), 1);
        assert_eq!(summary.errors[0].image_id, "b");

        // Uploaded records get the synced-equivalent status.
        assert_eq!(
            index.get_image_info("a").unwrap().status,
            ImageStatus::Completed
        );
        assert_eq!(
            index.get_image_info("b").unwrap().status,
            ImageStatus::Editing,
            "failed task leaves the record mid-edit"
        );

        assert_eq!(observer.completes.load(Ordering::SeqCst), 1);
        let progress = observer.progress.lock().unwrap();
        assert_eq!(progress.len(), 4, "progress fires once per terminal task");
        assert_eq!(progress.last().unwrap().completed, 4);
    }

    #[test]
    fn retry_exhaustion_makes_exactly_one_plus_retry_times_attempts() {
        let uploader = ScriptedUploader::new(&[("a", None)]);
        let records = [record("a")];
        let (_dir, _index, manager, uploader) = manager_with(uploader, fast_config(1), &records);

        let summary = manager.start_upload(&NoopObserver);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.errors[0].attempts, 4, "1 initial + 3 retries");
        assert_eq!(uploader.calls.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn concurrency_stays_within_the_configured_bound() {
        let plan: Vec<(String, Option<u32>)> =
            (0..8).map(|i| (format!("img-{}", i), Some(0))).collect();
        let plan_refs: Vec<(&str, Option<u32>)> =
            plan.iter().map(|(s, f)| (s.as_str(), *f)).collect();
        let uploader =
            ScriptedUploader::new(&plan_refs).with_delay(Duration::from_millis(15));
        let records: Vec<ImageRecord> = plan.iter().map(|(url, _)| record(url)).collect();
        let (_dir, _index, manager, uploader) = manager_with(uploader, fast_config(3), &records);

        let summary = manager.start_upload(&NoopObserver);
        assert_eq!(summary.success, 8);
        assert!(
            uploader.max_in_flight.load(Ordering::SeqCst) <= 3,
            "no more than `concurrency` uploads overlap"
        );
        assert_eq!(
            uploader.calls.load(Ordering::SeqCst),
            8,
            "pull-based queue processes every task exactly once"
        );
    }

    #[test]
    fn cancel_settles_pending_tasks_without_uploading() {
        let uploader = ScriptedUploader::new(&[("a", Some(0)), ("b", Some(0))]);
        let records = [record("a"), record("b")];
        let (_dir, _index, manager, uploader) = manager_with(uploader, fast_config(1), &records);

        manager.cancel();
        let summary = manager.start_upload(&NoopObserver);
        assert_eq!(summary.total, 2);
        assert_eq!(summary.success, 0);
        assert_eq!(summary.failed, 2, "cancelled tasks settle as failed");
        assert!(summary.errors.iter().all(|e| e.error == "cancelled"));
        assert_eq!(uploader.calls.load(Ordering::SeqCst), 0, "no upload started");
    }

    #[test]
    fn queue_skips_records_without_local_files() {
        let mut no_local = record("x");
        no_local.local_path = None;
        no_local.status = ImageStatus::Editing;
        let uploader = ScriptedUploader::new(&[("y", Some(0))]);
        let records = [no_local, record("y")];
        let (_dir, _index, manager, _) = manager_with(uploader, fast_config(1), &records);
        let summary = manager.start_upload(&NoopObserver);
        assert_eq!(summary.total, 1, "record without a file never enters the queue");
        assert_eq!(summary.success, 1);
    }

    #[test]
    fn backoff_doubles_per_attempt_and_caps() {
        let config = UploadConfig {
            concurrency: 1,
            retry_times: 5,
            retry_delay: Duration::from_millis(100),
            max_retry_delay: Duration::from_millis(350),
        };
        assert_eq!(backoff_delay(&config, 1), Duration::from_millis(100));
        assert_eq!(backoff_delay(&config, 2), Duration::from_millis(200));
        assert_eq!(backoff_delay(&config, 3), Duration::from_millis(350), "capped");
        assert_eq!(backoff_delay(&config, 10), Duration::from_millis(350));
    }
}
