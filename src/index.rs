use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::types::{GroupRef, ImageRecord, ImageRef, ImageStatus, Product, PublishSku};

/// Persisted schema version. Version 1 predates the three-state lifecycle
/// and is only loadable through the legacy-tag aliases; `force_cleanup`
/// discards it wholesale.
const INDEX_VERSION: u32 = 2;

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("unknown image: {0}")]
    UnknownImage(String),
}

#[derive(Debug, Clone, Copy, Default)]
pub struct InitOptions {
    pub force_cleanup: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IndexData {
    version: u32,
    #[serde(default)]
    products: HashMap<String, Product>,
    #[serde(default)]
    records: HashMap<String, ImageRecord>,
}

impl Default for IndexData {
    fn default() -> Self {
        Self {
            version: INDEX_VERSION,
            products: HashMap::new(),
            records: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationReport {
    pub migrated: usize,
}

/// Durable mapping `remote_url -> ImageRecord` plus the per-product group
/// arrays, persisted as one JSON file and loaded once per session.
///
/// This is the sole source of truth for cross-session state; UI-facing
/// projections are derived from it, never the reverse. All mutation goes
/// through the setters here so the write-through/flush invariants hold.
pub struct ContentIndex {
    path: PathBuf,
    inner: Mutex<IndexData>,
}

impl ContentIndex {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            inner: Mutex::new(IndexData::default()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads persisted data. A corrupt or unreadable index is treated as
    /// empty (fail open): downloads and status tracking still function,
    /// everything just appears not-downloaded.
    pub fn initialize(&self, options: InitOptions) -> Result<(), IndexError> {
        let data = match fs::read(&self.path) {
            Ok(bytes) => match serde_json::from_slice::<IndexData>(&bytes) {
                Ok(data) if options.force_cleanup && data.version < INDEX_VERSION => {
                    warn!(
                        version = data.version,
                        "discarding pre-three-state index data on forced cleanup"
                    );
                    IndexData::default()
                }
                Ok(data) => data,
                Err(err) => {
                    warn!(error = %err, path = %self.path.display(), "index unreadable, starting empty");
                    IndexData::default()
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => IndexData::default(),
            Err(err) => {
                warn!(error = %err, path = %self.path.display(), "index unreadable, starting empty");
                IndexData::default()
            }
        };
        let mut guard = self.inner.lock().expect("poisoned");
        *guard = data;
        Ok(())
    }

    /// Explicit flush. Must follow any batch of mutations that bypasses a
    /// single-record setter so the data survives process suspension.
    pub fn save_index_data(&self) -> Result<(), IndexError> {
        let json = {
            let guard = self.inner.lock().expect("poisoned");
            serde_json::to_vec_pretty(&*guard)?
        };
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, json)?;
        Ok(())
    }

    pub fn get_image_info(&self, url: &str) -> Option<ImageRecord> {
        let guard = self.inner.lock().expect("poisoned");
        guard.records.get(url).cloned()
    }

    pub fn has_local_image(&self, url: &str) -> bool {
        let guard = self.inner.lock().expect("poisoned");
        guard
            .records
            .get(url)
            .map(|record| record.local_path.is_some())
            .unwrap_or(false)
    }

    /// Inserts or replaces the canonical record for a URL, write-through.
    /// A record with a local path is never left `NotDownloaded`.
    pub fn upsert_record(&self, mut record: ImageRecord) -> Result<(), IndexError> {
        if record.local_path.is_some() && record.status == ImageStatus::NotDownloaded {
            record.status = ImageStatus::PendingEdit;
        }
        record.timestamp = now_ms();
        {
            let mut guard = self.inner.lock().expect("poisoned");
            guard.records.insert(record.remote_url.clone(), record);
        }
        self.save_index_data()
    }

    /// Writes a new status immediately; never buffered across a
    /// cache-invalidation boundary.
    pub fn set_image_status(&self, url: &str, status: ImageStatus) -> Result<(), IndexError> {
        self.update_record(url, |record| {
            record.status = status;
        })
    }

    /// Applies a closure to one record and flushes. Fails without touching
    /// disk when the URL is unknown; a failed flush rolls the in-memory
    /// record back so the previous state stays intact for retries.
    pub fn update_record<F>(&self, url: &str, apply: F) -> Result<(), IndexError>
    where
        F: FnOnce(&mut ImageRecord),
    {
        let previous = {
            let mut guard = self.inner.lock().expect("poisoned");
            let record = guard
                .records
                .get_mut(url)
                .ok_or_else(|| IndexError::UnknownImage(url.to_string()))?;
            let previous = record.clone();
            apply(record);
            record.timestamp = now_ms();
            if record.local_path.is_some() && record.status == ImageStatus::NotDownloaded {
                record.status = ImageStatus::PendingEdit;
            }
            previous
        };
        if let Err(err) = self.save_index_data() {
            let mut guard = self.inner.lock().expect("poisoned");
            guard.records.insert(url.to_string(), previous);
            return Err(err);
        }
        Ok(())
    }

    pub fn remove_record(&self, url: &str) -> Result<bool, IndexError> {
        let removed = {
            let mut guard = self.inner.lock().expect("poisoned");
            guard.records.remove(url).is_some()
        };
        if removed {
            self.save_index_data()?;
        }
        Ok(removed)
    }

    pub fn product(&self, apply_code: &str) -> Option<Product> {
        let guard = self.inner.lock().expect("poisoned");
        guard.products.get(apply_code).cloned()
    }

    /// Replaces one product's group arrays without flushing; callers batch
    /// further mutations and then call `save_index_data`.
    pub fn put_product(&self, product: Product) {
        let mut guard = self.inner.lock().expect("poisoned");
        guard.products.insert(product.apply_code.clone(), product);
    }

    /// Replaces exactly one group's references and flushes. Unrelated
    /// groups are never rewritten. Missing SKU slots are created so an
    /// insertion into a new SKU group works.
    pub fn update_group(
        &self,
        apply_code: &str,
        group: GroupRef,
        items: Vec<ImageRef>,
    ) -> Result<(), IndexError> {
        {
            let mut guard = self.inner.lock().expect("poisoned");
            let product = guard
                .products
                .entry(apply_code.to_string())
                .or_insert_with(|| Product::new(apply_code));
            if let GroupRef::Sku(sku_idx) = group {
                while product.publish_skus.len() <= sku_idx {
                    product.publish_skus.push(PublishSku::default());
                }
            }
            if let Some(slot) = product.group_mut(group) {
                *slot = items;
            }
        }
        self.save_index_data()
    }

    pub fn records_for_product(&self, apply_code: &str) -> Vec<ImageRecord> {
        let guard = self.inner.lock().expect("poisoned");
        let mut records: Vec<_> = guard
            .records
            .values()
            .filter(|record| record.apply_code == apply_code)
            .cloned()
            .collect();
        records.sort_by(|a, b| a.remote_url.cmp(&b.remote_url));
        records
    }

    pub fn all_pending_edit_images(&self, apply_code: &str) -> Vec<ImageRecord> {
        self.records_with_status(apply_code, ImageStatus::PendingEdit)
    }

    /// Drain source for the upload coordinator: records mid-edit with a
    /// local file.
    pub fn all_modified_images(&self, apply_code: &str) -> Vec<ImageRecord> {
        self.records_with_status(apply_code, ImageStatus::Editing)
            .into_iter()
            .filter(|record| record.local_path.is_some())
            .collect()
    }

    fn records_with_status(&self, apply_code: &str, status: ImageStatus) -> Vec<ImageRecord> {
        let guard = self.inner.lock().expect("poisoned");
        let mut records: Vec<_> = guard
            .records
            .values()
            .filter(|record| record.apply_code == apply_code && record.status == status)
            .cloned()
            .collect();
        records.sort_by(|a, b| a.remote_url.cmp(&b.remote_url));
        records
    }

    pub fn records_by_host_document(&self, document_id: &str) -> Vec<ImageRecord> {
        let guard = self.inner.lock().expect("poisoned");
        guard
            .records
            .values()
            .filter(|record| record.host_document_id.as_deref() == Some(document_id))
            .cloned()
            .collect()
    }

    /// Rewrites legacy status tags for one product's records inside the
    /// persisted file and reloads. Idempotent: a clean index reports zero
    /// migrated records.
    pub fn migrate_product_to_three_state(
        &self,
        apply_code: &str,
    ) -> Result<MigrationReport, IndexError> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(MigrationReport::default())
            }
            Err(err) => return Err(err.into()),
        };
        let mut root: serde_json::Value = match serde_json::from_slice(&bytes) {
            Ok(value) => value,
            Err(err) => {
                warn!(error = %err, "index unreadable during migration, nothing to migrate");
                return Ok(MigrationReport::default());
            }
        };

        let migrated = migrate_legacy_tags(&mut root, apply_code);
        if migrated > 0 {
            root["version"] = serde_json::json!(INDEX_VERSION);
            fs::write(&self.path, serde_json::to_vec_pretty(&root)?)?;
            self.initialize(InitOptions::default())?;
            info!(apply_code, migrated, "migrated legacy status tags");
        }
        Ok(MigrationReport { migrated })
    }
}

/// Converts the closed set of legacy tags on one product's records to the
/// three-state vocabulary. Returns the number of rewritten records.
fn migrate_legacy_tags(root: &mut serde_json::Value, apply_code: &str) -> usize {
    let mut migrated = 0;
    let Some(records) = root.get_mut("records").and_then(|v| v.as_object_mut()) else {
        return 0;
    };
    for record in records.values_mut() {
        if record.get("applyCode").and_then(|v| v.as_str()) != Some(apply_code) {
            continue;
        }
        let Some(tag) = record.get("status").and_then(|v| v.as_str()) else {
            continue;
        };
        if !ImageStatus::is_legacy_tag(tag) {
            continue;
        }
        if let Some(status) = ImageStatus::from_tag(tag) {
            record["status"] = serde_json::json!(status.as_tag());
            migrated += 1;
        }
    }
    migrated
}

pub(crate) fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ImageType;

    fn record(url: &str, apply_code: &str, status: ImageStatus) -> ImageRecord {
        ImageRecord {
            remote_url: url.into(),
            apply_code: apply_code.into(),
            image_type: ImageType::Sku,
            sku_index: Some(0),
            local_path: None,
            status,
            file_size: None,
            timestamp: 0,
            host_document_id: None,
            fingerprint: None,
        }
    }

    fn temp_index() -> (tempfile::TempDir, ContentIndex) {
        let dir = tempfile::tempdir().expect("temp dir");
        let index = ContentIndex::new(dir.path().join("content-index.json"));
        index.initialize(InitOptions::default()).expect("initialize");
        (dir, index)
    }

    #[test]
    fn missing_file_loads_as_empty_index() {
        let (_dir, index) = temp_index();
        assert!(index.get_image_info("https://cdn.example.com/a.jpg").is_none());
        assert!(!index.has_local_image("https://cdn.example.com/a.jpg"));
    }

    #[test]
    fn corrupt_file_is_treated_as_empty_not_an_error() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("content-index.json");
        fs::write(&path, b"{ not json").expect("write corrupt");
        let index = ContentIndex::new(&path);
        index.initialize(InitOptions::default()).expect("fail open");
        assert!(index.get_image_info("anything").is_none());
    }

    #[test]
    fn set_image_status_writes_through_to_disk() {
        let (_dir, index) = temp_index();
        index
            .upsert_record(record("u1", "AP-1", ImageStatus::PendingEdit))
            .expect("upsert");
        index
            .set_image_status("u1", ImageStatus::Editing)
            .expect("set status");

        let reloaded = ContentIndex::new(index.path());
        reloaded.initialize(InitOptions::default()).expect("reload");
        let info = reloaded.get_image_info("u1").expect("record survives reload");
        assert_eq!(info.status, ImageStatus::Editing);
    }

    #[test]
    fn unknown_image_status_update_fails_without_side_effects() {
        let (_dir, index) = temp_index();
        let err = index
            .set_image_status("nope", ImageStatus::Completed)
            .expect_err("unknown url");
        assert!(matches!(err, IndexError::UnknownImage(_)));
    }

    #[test]
    fn local_path_implies_not_not_downloaded() {
        let (_dir, index) = temp_index();
        let mut rec = record("u1", "AP-1", ImageStatus::NotDownloaded);
        rec.local_path = Some("AP-1/u1.jpg".into());
        index.upsert_record(rec).expect("upsert");
        let info = index.get_image_info("u1").expect("record");
        assert_eq!(info.status, ImageStatus::PendingEdit);
    }

    #[test]
    fn migration_rewrites_legacy_tags_once() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("content-index.json");
        let legacy = serde_json::json!({
            "version": 1,
            "products": {},
            "records": {
                "u1": {
                    "remoteUrl": "u1", "applyCode": "AP-1", "imageType": "sku",
                    "status": "modified", "timestamp": 0
                },
                "u2": {
                    "remoteUrl": "u2", "applyCode": "AP-1", "imageType": "scene",
                    "status": "synced", "timestamp": 0
                },
                "u3": {
                    "remoteUrl": "u3", "applyCode": "OTHER", "imageType": "original",
                    "status": "downloaded", "timestamp": 0
                }
            }
        });
        fs::write(&path, serde_json::to_vec(&legacy).unwrap()).expect("seed legacy");

        let index = ContentIndex::new(&path);
        index.initialize(InitOptions::default()).expect("initialize");
        let report = index.migrate_product_to_three_state("AP-1").expect("migrate");
        assert_eq!(report.migrated, 2, "only AP-1 records are rewritten");

        let again = index.migrate_product_to_three_state("AP-1").expect("re-run");
        assert_eq!(again.migrated, 0, "migration is idempotent");

        let u1 = index.get_image_info("u1").expect("u1");
        assert_eq!(u1.status, ImageStatus::Editing);
        let u2 = index.get_image_info("u2").expect("u2");
        assert_eq!(u2.status, ImageStatus::Completed);
    }

    #[test]
    fn force_cleanup_discards_pre_three_state_payload() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("content-index.json");
        let legacy = serde_json::json!({
            "version": 1,
            "products": {},
            "records": {
                "u1": {
                    "remoteUrl": "u1", "applyCode": "AP-1", "imageType": "sku",
                    "status": "downloaded", "timestamp": 0
                }
            }
        });
        fs::write(&path, serde_json::to_vec(&legacy).unwrap()).expect("seed legacy");

        let index = ContentIndex::new(&path);
        index
            .initialize(InitOptions { force_cleanup: true })
            .expect("initialize");
        assert!(index.get_image_info("u1").is_none(), "legacy data dropped");
    }

    #[test]
    fn modified_query_only_returns_editing_records_with_local_files() {
        let (_dir, index) = temp_index();
        let mut editing_local = record("u1", "AP-1", ImageStatus::Editing);
        editing_local.local_path = Some("AP-1/u1.jpg".into());
        index.upsert_record(editing_local).expect("upsert");
        index
            .upsert_record(record("u2", "AP-1", ImageStatus::Editing))
            .expect("upsert");
        index
            .upsert_record(record("u3", "AP-1", ImageStatus::PendingEdit))
            .expect("upsert");

        let modified = index.all_modified_images("AP-1");
        assert_eq!(modified.len(), 1);
        assert_eq!(modified[0].remote_url, "u1");

        let pending = index.all_pending_edit_images("AP-1");
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].remote_url, "u3");
    }
}
