use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};

use crate::index::{ContentIndex, IndexError};
use crate::lifecycle::LifecycleEngine;
use crate::store::{LocalImageStore, StoreError};
use crate::types::{BatchItemOutcome, HostEvent, ImageStatus};

const DEFAULT_OPEN_BATCH_SIZE: usize = 3;
const DEFAULT_OPEN_BATCH_DELAY: Duration = Duration::from_millis(500);

#[derive(Debug, Error)]
pub enum HostError {
    #[error("document host unavailable: {0}")]
    HostUnavailable(String),
    #[error("no image known for id {0}")]
    UnknownImage(String),
    #[error("image {0} has no local file to open")]
    NoLocalFile(String),
    #[error(transparent)]
    Index(#[from] IndexError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Capability port for the external document editor. Injected at startup;
/// code never probes for the editor at call sites.
pub trait DocumentHost: Send + Sync {
    /// Opens a local file as an editing session and returns its opaque
    /// document id.
    fn open_document(&self, path: &Path) -> Result<String, String>;
    fn close_document(&self, document_id: &str) -> Result<(), String>;
}

/// Stand-in for environments without an editor. Every call fails with an
/// actionable message instead of crashing.
pub struct NullDocumentHost;

impl DocumentHost for NullDocumentHost {
    fn open_document(&self, _path: &Path) -> Result<String, String> {
        Err("document host is not connected; open the plugin inside the editor".into())
    }

    fn close_document(&self, _document_id: &str) -> Result<(), String> {
        Err("document host is not connected; open the plugin inside the editor".into())
    }
}

#[derive(Debug, Clone)]
pub struct OpenBatchOptions {
    pub batch_size: usize,
    pub batch_delay: Duration,
}

impl Default for OpenBatchOptions {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_OPEN_BATCH_SIZE,
            batch_delay: DEFAULT_OPEN_BATCH_DELAY,
        }
    }
}

/// Normalizes host-editor events into lifecycle transitions and owns the
/// URL-to-document mapping. One host document may stand for several image
/// references sharing a URL, so every status change is propagated to all
/// records bound to the triggering document.
pub struct HostSyncBridge {
    index: Arc<ContentIndex>,
    store: Arc<LocalImageStore>,
    host: Arc<dyn DocumentHost>,
    /// remoteUrl -> open document id.
    documents: Mutex<HashMap<String, String>>,
}

impl HostSyncBridge {
    pub fn new(
        index: Arc<ContentIndex>,
        store: Arc<LocalImageStore>,
        host: Arc<dyn DocumentHost>,
    ) -> Self {
        Self {
            index,
            store,
            host,
            documents: Mutex::new(HashMap::new()),
        }
    }

    pub fn document_for(&self, url: &str) -> Option<String> {
        self.documents.lock().expect("poisoned").get(url).cloned()
    }

    /// Opens the local copy of `url` in the host editor. An existing
    /// mapping for the URL is reused instead of opening a second document
    /// for the same image.
    pub fn open_image(&self, url: &str) -> Result<String, HostError> {
        if let Some(existing) = self.document_for(url) {
            debug!(url, document = %existing, "reusing open document");
            return Ok(existing);
        }
        if self.index.get_image_info(url).is_none() {
            return Err(HostError::UnknownImage(url.to_string()));
        }
        let path = self
            .store
            .local_display_path(url)
            .ok_or_else(|| HostError::NoLocalFile(url.to_string()))?;
        let document_id = self
            .host
            .open_document(&path)
            .map_err(HostError::HostUnavailable)?;
        self.bind_document(&document_id, url)?;
        Ok(document_id)
    }

    /// Records the document-to-URL binding on both the in-memory map and
    /// the durable record.
    pub fn bind_document(&self, document_id: &str, url: &str) -> Result<(), HostError> {
        self.documents
            .lock()
            .expect("poisoned")
            .insert(url.to_string(), document_id.to_string());
        self.index.update_record(url, |record| {
            record.host_document_id = Some(document_id.to_string());
        })?;
        Ok(())
    }

    /// Opens many images with pacing: small concurrent-open batches with a
    /// delay in between, so the editor is not flooded with simultaneous
    /// document opens. Per-item failures never abort the batch.
    pub fn open_in_batches(
        &self,
        urls: &[String],
        options: OpenBatchOptions,
    ) -> Vec<BatchItemOutcome> {
        let mut outcomes = Vec::with_capacity(urls.len());
        for (batch_no, chunk) in urls.chunks(options.batch_size.max(1)).enumerate() {
            if batch_no > 0 && !options.batch_delay.is_zero() {
                thread::sleep(options.batch_delay);
            }
            for url in chunk {
                match self.open_image(url) {
                    Ok(_) => outcomes.push(BatchItemOutcome {
                        success: true,
                        file_name: url.clone(),
                        error: None,
                    }),
                    Err(err) => {
                        warn!(url, error = %err, "batch open failed for one image");
                        outcomes.push(BatchItemOutcome {
                            success: false,
                            file_name: url.clone(),
                            error: Some(err.to_string()),
                        });
                    }
                }
            }
        }
        outcomes
    }

    /// Applies one host event. Resolves the concerned records by
    /// `hostDocumentId` first, falling back to treating the event id as a
    /// URL for events arriving before a binding exists. Returns the
    /// `(url, new_status)` pairs that actually changed.
    pub fn handle_event(
        &self,
        event: &HostEvent,
    ) -> Result<Vec<(String, ImageStatus)>, HostError> {
        let id = event.image_id();
        let mut records = self.index.records_by_host_document(id);
        if records.is_empty() {
            if let Some(record) = self.index.get_image_info(id) {
                records.push(record);
            }
        }
        if records.is_empty() {
            return Err(HostError::UnknownImage(id.to_string()));
        }

        let mut changed = Vec::new();
        for record in &records {
            let byte_change = match event {
                HostEvent::FileSaved { .. } => {
                    match self.store.check_file_modification(&record.remote_url) {
                        Ok(modified) => modified,
                        Err(err) => {
                            debug!(url = %record.remote_url, error = %err, "modification check failed, assuming unchanged");
                            false
                        }
                    }
                }
                _ => false,
            };
            if let Some(target) = LifecycleEngine::event_target(record.status, event, byte_change) {
                self.index.set_image_status(&record.remote_url, target)?;
                changed.push((record.remote_url.clone(), target));
            }
            if byte_change {
                // The on-disk bytes moved under the cached handle.
                let _ = self.store.refresh_display_source(&record.remote_url);
            }
        }

        if matches!(
            event,
            HostEvent::DocumentClosedCompleted { .. } | HostEvent::DocumentClosedNoChange { .. }
        ) {
            self.unbind_all(&records.iter().map(|r| r.remote_url.clone()).collect::<Vec<_>>())?;
        }

        Ok(changed)
    }

    fn unbind_all(&self, urls: &[String]) -> Result<(), HostError> {
        let mut map = self.documents.lock().expect("poisoned");
        for url in urls {
            map.remove(url);
        }
        drop(map);
        for url in urls {
            self.index.update_record(url, |record| {
                record.host_document_id = None;
            })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::InitOptions;
    use crate::store::ImageFetcher;
    use crate::types::{ImageRecord, ImageType};
    use std::fs;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeHost {
        opens: AtomicUsize,
        fail: bool,
    }

    impl FakeHost {
        fn new() -> Self {
            Self {
                opens: AtomicUsize::new(0),
                fail: false,
            }
        }
    }

    impl DocumentHost for FakeHost {
        fn open_document(&self, _path: &Path) -> Result<String, String> {
            if self.fail {
                return Err("host refused".into());
            }
            let n = self.opens.fetch_add(1, Ordering::SeqCst);
            Ok(format!("doc-{}", n))
        }

        fn close_document(&self, _document_id: &str) -> Result<(), String> {
            Ok(())
        }
    }

    struct NoFetch;

    impl ImageFetcher for NoFetch {
        fn fetch(&self, _url: &str) -> Result<Vec<u8>, String> {
            Err("offline".into())
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        index: Arc<ContentIndex>,
        store: Arc<LocalImageStore>,
        host: Arc<FakeHost>,
        bridge: HostSyncBridge,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().expect("temp dir");
        let index = Arc::new(ContentIndex::new(dir.path().join("index.json")));
        index.initialize(InitOptions::default()).expect("initialize");
        let store = Arc::new(LocalImageStore::new(
            dir.path().join("cache"),
            Arc::clone(&index),
            Arc::new(NoFetch),
        ));
        let host = Arc::new(FakeHost::new());
        let bridge = HostSyncBridge::new(
            Arc::clone(&index),
            Arc::clone(&store),
            Arc::clone(&host) as Arc<dyn DocumentHost>,
        );
        Fixture {
            _dir: dir,
            index,
            store,
            host,
            bridge,
        }
    }

    fn seed_with_file(fx: &Fixture, url: &str, status: ImageStatus) {
        let folder = fx.store.product_folder("AP-1").expect("folder");
        let name = LocalImageStore::local_filename_for(url);
        fs::write(folder.join(&name), b"pixels").expect("write file");
        fx.index
            .upsert_record(ImageRecord {
                remote_url: url.into(),
                apply_code: "AP-1".into(),
                image_type: ImageType::Sku,
                sku_index: Some(0),
                local_path: Some(format!("AP-1/{}", name)),
                status,
                file_size: Some(6),
                timestamp: 0,
                host_document_id: None,
                fingerprint: None,
            })
            .expect("seed");
    }

    #[test]
    fn open_binds_a_document_and_reuses_it() {
        let fx = fixture();
        seed_with_file(&fx, "https://cdn.example.com/a.jpg", ImageStatus::PendingEdit);

        let doc = fx.bridge.open_image("https://cdn.example.com/a.jpg").expect("open");
        assert_eq!(doc, "doc-0");
        assert_eq!(
            fx.index
                .get_image_info("https://cdn.example.com/a.jpg")
                .unwrap()
                .host_document_id
                .as_deref(),
            Some("doc-0")
        );

        let again = fx.bridge.open_image("https://cdn.example.com/a.jpg").expect("reopen");
        assert_eq!(again, "doc-0", "existing mapping is reused");
        assert_eq!(fx.host.opens.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn open_without_local_file_is_an_actionable_error() {
        let fx = fixture();
        fx.index
            .upsert_record(ImageRecord {
                remote_url: "https://cdn.example.com/remote-only.jpg".into(),
                apply_code: "AP-1".into(),
                image_type: ImageType::Original,
                sku_index: None,
                local_path: None,
                status: ImageStatus::NotDownloaded,
                file_size: None,
                timestamp: 0,
                host_document_id: None,
                fingerprint: None,
            })
            .expect("seed");
        let err = fx
            .bridge
            .open_image("https://cdn.example.com/remote-only.jpg")
            .expect_err("no file");
        assert!(matches!(err, HostError::NoLocalFile(_)));
    }

    #[test]
    fn null_host_fails_without_crashing() {
        let fx = fixture();
        seed_with_file(&fx, "https://cdn.example.com/a.jpg", ImageStatus::PendingEdit);
        let bridge = HostSyncBridge::new(
            Arc::clone(&fx.index),
            Arc::clone(&fx.store),
            Arc::new(NullDocumentHost),
        );
        let err = bridge
            .open_image("https://cdn.example.com/a.jpg")
            .expect_err("no host connected");
        assert!(matches!(err, HostError::HostUnavailable(_)));
    }

    #[test]
    fn save_event_with_byte_change_moves_pending_to_editing() {
        let fx = fixture();
        let url = "https://cdn.example.com/a.jpg";
        seed_with_file(&fx, url, ImageStatus::PendingEdit);
        fx.bridge.open_image(url).expect("open");

        // Grow the file so the stored fingerprint no longer matches.
        let path = fx.store.local_display_path(url).expect("local path");
        fs::write(&path, b"pixels but bigger now").expect("rewrite");

        let changed = fx
            .bridge
            .handle_event(&HostEvent::FileSaved { image_id: "doc-0".into() })
            .expect("event");
        assert_eq!(changed, vec![(url.to_string(), ImageStatus::Editing)]);
        assert_eq!(
            fx.index.get_image_info(url).unwrap().status,
            ImageStatus::Editing
        );
    }

    #[test]
    fn save_event_without_byte_change_is_a_no_op() {
        let fx = fixture();
        let url = "https://cdn.example.com/a.jpg";
        seed_with_file(&fx, url, ImageStatus::PendingEdit);
        fx.bridge.open_image(url).expect("open");
        // Prime the stored fingerprint so the next check sees no change.
        fx.store.check_file_modification(url).expect("prime");

        let changed = fx
            .bridge
            .handle_event(&HostEvent::FileSaved { image_id: "doc-0".into() })
            .expect("event");
        assert!(changed.is_empty());
        assert_eq!(
            fx.index.get_image_info(url).unwrap().status,
            ImageStatus::PendingEdit
        );
    }

    #[test]
    fn close_completed_propagates_to_every_record_bound_to_the_document() {
        let fx = fixture();
        let a = "https://cdn.example.com/a.jpg";
        let b = "local://AP-1/a-copy.jpg";
        seed_with_file(&fx, a, ImageStatus::Editing);
        seed_with_file(&fx, b, ImageStatus::Editing);
        fx.bridge.bind_document("doc-7", a).expect("bind a");
        fx.bridge.bind_document("doc-7", b).expect("bind b");

        let changed = fx
            .bridge
            .handle_event(&HostEvent::DocumentClosedCompleted {
                image_id: "doc-7".into(),
                auto_completed: true,
            })
            .expect("event");
        assert_eq!(changed.len(), 2, "both records bound to the document move");
        assert_eq!(fx.index.get_image_info(a).unwrap().status, ImageStatus::Completed);
        assert_eq!(fx.index.get_image_info(b).unwrap().status, ImageStatus::Completed);
        // The document binding is gone once the document closed.
        assert!(fx.bridge.document_for(a).is_none());
        assert!(fx.index.get_image_info(a).unwrap().host_document_id.is_none());
    }

    #[test]
    fn close_without_change_returns_editing_records_to_pending() {
        let fx = fixture();
        let url = "https://cdn.example.com/a.jpg";
        seed_with_file(&fx, url, ImageStatus::Editing);
        fx.bridge.bind_document("doc-3", url).expect("bind");

        let changed = fx
            .bridge
            .handle_event(&HostEvent::DocumentClosedNoChange { image_id: "doc-3".into() })
            .expect("event");
        assert_eq!(changed, vec![(url.to_string(), ImageStatus::PendingEdit)]);
    }

    #[test]
    fn event_for_unknown_id_is_an_error() {
        let fx = fixture();
        let err = fx
            .bridge
            .handle_event(&HostEvent::FileSaved { image_id: "doc-404".into() })
            .expect_err("nothing bound");
        assert!(matches!(err, HostError::UnknownImage(_)));
    }

    #[test]
    fn batch_open_reports_per_item_outcomes() {
        let fx = fixture();
        seed_with_file(&fx, "https://cdn.example.com/a.jpg", ImageStatus::PendingEdit);
        seed_with_file(&fx, "https://cdn.example.com/b.jpg", ImageStatus::PendingEdit);
        let urls = vec![
            "https://cdn.example.com/a.jpg".to_string(),
            "https://cdn.example.com/missing.jpg".to_string(),
            "https://cdn.example.com/b.jpg".to_string(),
        ];
        let outcomes = fx.bridge.open_in_batches(
            &urls,
            OpenBatchOptions {
                batch_size: 2,
                batch_delay: Duration::ZERO,
            },
        );
        assert_eq!(outcomes.len(), 3);
        assert!(outcomes[0].success);
        assert!(!outcomes[1].success, "unknown image fails in place");
        assert!(outcomes[2].success, "failure does not abort the batch");
    }
}
