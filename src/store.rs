use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};

use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;
use walkdir::WalkDir;

use crate::index::{ContentIndex, IndexError};
use crate::types::{
    BatchItemOutcome, DisplaySource, Fingerprint, ImageRecord, ImageStatus, ImageType,
};

/// Import allow-list. Anything else is rejected per-file.
const ALLOWED_IMPORT_FORMATS: &[image::ImageFormat] =
    &[image::ImageFormat::Png, image::ImageFormat::Jpeg];

#[cfg(feature = "backend-http")]
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("index error: {0}")]
    Index(#[from] IndexError),
    #[error("unknown image: {0}")]
    UnknownImage(String),
    #[error("image has no local file: {0}")]
    NoLocalFile(String),
}

/// Fetches remote image bytes. The HTTP implementation is the production
/// path; tests substitute their own.
pub trait ImageFetcher: Send + Sync {
    fn fetch(&self, url: &str) -> Result<Vec<u8>, String>;
}

#[cfg(feature = "backend-http")]
pub struct HttpImageFetcher {
    client: reqwest::blocking::Client,
}

#[cfg(feature = "backend-http")]
impl HttpImageFetcher {
    pub fn new() -> Self {
        let client = reqwest::blocking::Client::builder()
            .timeout(DOWNLOAD_TIMEOUT)
            .build()
            .expect("build client");
        Self { client }
    }
}

#[cfg(feature = "backend-http")]
impl Default for HttpImageFetcher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "backend-http")]
impl ImageFetcher for HttpImageFetcher {
    fn fetch(&self, url: &str) -> Result<Vec<u8>, String> {
        let resp = self.client.get(url).send().map_err(|e| e.to_string())?;
        if !resp.status().is_success() {
            return Err(format!("HTTP {}", resp.status()));
        }
        resp.bytes().map(|b| b.to_vec()).map_err(|e| e.to_string())
    }
}

/// Descriptor for one image in a download batch.
#[derive(Debug, Clone)]
pub struct DownloadRequest {
    pub remote_url: String,
    pub apply_code: String,
    pub image_type: ImageType,
    pub sku_index: Option<usize>,
}

#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    pub file_count: usize,
    pub total_bytes: u64,
    /// Files in the product folder no record points at. Reported only;
    /// list-removal never deletes from disk.
    pub orphans: Vec<String>,
}

/// Owns the per-product on-disk folder layout and every filesystem touch
/// the cache needs. No other component writes inside `root`.
pub struct LocalImageStore {
    root: PathBuf,
    index: Arc<ContentIndex>,
    fetcher: Arc<dyn ImageFetcher>,
}

impl LocalImageStore {
    pub fn new(root: impl Into<PathBuf>, index: Arc<ContentIndex>, fetcher: Arc<dyn ImageFetcher>) -> Self {
        Self {
            root: root.into(),
            index,
            fetcher,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn product_folder(&self, apply_code: &str) -> Result<PathBuf, StoreError> {
        let folder = self.root.join(apply_code);
        fs::create_dir_all(&folder)?;
        Ok(folder)
    }

    /// Deterministic filename derivation: the same URL always yields the
    /// same name, so a re-download overwrites in place.
    pub fn local_filename_for(url: &str) -> String {
        let digest = Sha256::digest(url.as_bytes());
        let stem = hex::encode(&digest[..8]);
        format!("{}.{}", stem, extension_for(url))
    }

    /// Local-only display path: `Some` iff the record has a local path and
    /// the file is actually present. Never falls back to the remote URL;
    /// that policy belongs to `display_source`.
    pub fn local_display_path(&self, url: &str) -> Option<PathBuf> {
        let record = self.index.get_image_info(url)?;
        let relative = record.local_path?;
        let absolute = self.root.join(relative);
        absolute.exists().then_some(absolute)
    }

    /// Three-way display resolution, precedence order load-bearing:
    /// present local file, then fully-qualified remote URL, then nothing.
    pub fn display_source(&self, url: &str) -> DisplaySource {
        if let Some(path) = self.local_display_path(url) {
            return DisplaySource::Local(path);
        }
        if is_fully_qualified(url) {
            return DisplaySource::Remote(url.to_string());
        }
        DisplaySource::Placeholder
    }

    /// Downloads a batch, one failure never aborting the rest. Progress is
    /// reported as `(current, total)` after each item settles.
    pub fn download_product_images(
        &self,
        images: &[DownloadRequest],
        mut on_progress: impl FnMut(usize, usize),
        mut on_error: impl FnMut(&str, &str),
    ) -> Vec<BatchItemOutcome> {
        let total = images.len();
        let mut outcomes = Vec::with_capacity(total);
        for (position, request) in images.iter().enumerate() {
            let file_name = Self::local_filename_for(&request.remote_url);
            let outcome = match self.download_one(request, &file_name) {
                Ok(()) => BatchItemOutcome {
                    success: true,
                    file_name: file_name.clone(),
                    error: None,
                },
                Err(err) => {
                    let message = err.to_string();
                    warn!(url = %request.remote_url, error = %message, "download failed");
                    on_error(&request.remote_url, &message);
                    BatchItemOutcome {
                        success: false,
                        file_name: file_name.clone(),
                        error: Some(message),
                    }
                }
            };
            outcomes.push(outcome);
            on_progress(position + 1, total);
        }
        outcomes
    }

    fn download_one(&self, request: &DownloadRequest, file_name: &str) -> Result<(), StoreError> {
        let bytes = self
            .fetcher
            .fetch(&request.remote_url)
            .map_err(|e| StoreError::Io(std::io::Error::other(e)))?;
        let folder = self.product_folder(&request.apply_code)?;
        let path = folder.join(file_name);
        fs::write(&path, &bytes)?;
        let fingerprint = read_fingerprint(&path)?;
        debug!(url = %request.remote_url, path = %path.display(), "downloaded image");

        self.index.upsert_record(ImageRecord {
            remote_url: request.remote_url.clone(),
            apply_code: request.apply_code.clone(),
            image_type: request.image_type,
            sku_index: request.sku_index,
            local_path: Some(format!("{}/{}", request.apply_code, file_name)),
            status: ImageStatus::PendingEdit,
            file_size: Some(fingerprint.size),
            timestamp: 0,
            host_document_id: None,
            fingerprint: Some(fingerprint),
        })?;
        Ok(())
    }

    /// Imports user-picked files. Disallowed formats are rejected per-file
    /// without aborting the batch. Each accepted file gets a synthetic
    /// `local://` id until upload assigns a real remote URL.
    pub fn add_local_images(
        &self,
        apply_code: &str,
        files: &[PathBuf],
        image_type: ImageType,
        sku_index: Option<usize>,
        mut on_progress: impl FnMut(usize, usize),
    ) -> Vec<BatchItemOutcome> {
        let total = files.len();
        let mut outcomes = Vec::with_capacity(total);
        for (position, file) in files.iter().enumerate() {
            let file_name = file
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| "unnamed".to_string());
            let outcome = match self.import_one(apply_code, file, image_type, sku_index) {
                Ok(()) => BatchItemOutcome {
                    success: true,
                    file_name,
                    error: None,
                },
                Err(err) => BatchItemOutcome {
                    success: false,
                    file_name,
                    error: Some(err),
                },
            };
            outcomes.push(outcome);
            on_progress(position + 1, total);
        }
        outcomes
    }

    fn import_one(
        &self,
        apply_code: &str,
        file: &Path,
        image_type: ImageType,
        sku_index: Option<usize>,
    ) -> Result<(), String> {
        let bytes = fs::read(file).map_err(|e| e.to_string())?;
        let format = image::guess_format(&bytes)
            .map_err(|_| "unrecognized image format".to_string())?;
        if !ALLOWED_IMPORT_FORMATS.contains(&format) {
            return Err(format!("format {:?} not allowed, expected PNG or JPEG", format));
        }

        let source_name = file
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .ok_or_else(|| "file has no name".to_string())?;
        let image_id = format!("local://{}/{}", apply_code, source_name);
        let file_name = Self::local_filename_for(&image_id);
        let folder = self.product_folder(apply_code).map_err(|e| e.to_string())?;
        let path = folder.join(&file_name);
        fs::write(&path, &bytes).map_err(|e| e.to_string())?;
        let fingerprint = read_fingerprint(&path).map_err(|e| e.to_string())?;

        self.index
            .upsert_record(ImageRecord {
                remote_url: image_id,
                apply_code: apply_code.to_string(),
                image_type,
                sku_index,
                local_path: Some(format!("{}/{}", apply_code, file_name)),
                status: ImageStatus::PendingEdit,
                file_size: Some(fingerprint.size),
                timestamp: 0,
                host_document_id: None,
                fingerprint: Some(fingerprint),
            })
            .map_err(|e| e.to_string())
    }

    /// Compares the stored fingerprint against the file on disk. A host
    /// "save" that left the bytes untouched reports `false`. The stored
    /// fingerprint is refreshed whenever a change is detected.
    pub fn check_file_modification(&self, url: &str) -> Result<bool, StoreError> {
        let record = self
            .index
            .get_image_info(url)
            .ok_or_else(|| StoreError::UnknownImage(url.to_string()))?;
        let relative = record
            .local_path
            .ok_or_else(|| StoreError::NoLocalFile(url.to_string()))?;
        let path = self.root.join(relative);
        let current = read_fingerprint(&path)?;
        let changed = record.fingerprint.map(|stored| stored != current).unwrap_or(true);
        if changed {
            self.index.update_record(url, |rec| {
                rec.fingerprint = Some(current);
                rec.file_size = Some(current.size);
            })?;
        }
        Ok(changed)
    }

    /// Re-resolves the local path after an external modification so any
    /// cached display handle is dropped. `None` when no local file exists.
    pub fn refresh_display_source(&self, url: &str) -> Result<Option<PathBuf>, StoreError> {
        match self.local_display_path(url) {
            Some(path) => {
                let fingerprint = read_fingerprint(&path)?;
                self.index.update_record(url, |rec| {
                    rec.fingerprint = Some(fingerprint);
                    rec.file_size = Some(fingerprint.size);
                })?;
                Ok(Some(path))
            }
            None => Ok(None),
        }
    }

    /// Walks the product folder and reports totals plus files nothing in
    /// the index points at. Orphans are never removed here.
    pub fn cache_stats(&self, apply_code: &str) -> Result<CacheStats, StoreError> {
        let folder = self.root.join(apply_code);
        if !folder.exists() {
            return Ok(CacheStats::default());
        }
        let referenced: std::collections::HashSet<String> = self
            .index
            .records_for_product(apply_code)
            .into_iter()
            .filter_map(|record| record.local_path)
            .collect();

        let mut stats = CacheStats::default();
        for entry in WalkDir::new(&folder).into_iter().filter_map(Result::ok) {
            if !entry.file_type().is_file() {
                continue;
            }
            stats.file_count += 1;
            stats.total_bytes += entry.metadata().map(|m| m.len()).unwrap_or(0);
            let relative = entry
                .path()
                .strip_prefix(&self.root)
                .map(|p| p.to_string_lossy().replace('\\', "/"))
                .unwrap_or_default();
            if !referenced.contains(&relative) {
                stats.orphans.push(relative);
            }
        }
        stats.orphans.sort();
        Ok(stats)
    }
}

fn is_fully_qualified(url: &str) -> bool {
    Url::parse(url)
        .map(|parsed| matches!(parsed.scheme(), "http" | "https"))
        .unwrap_or(false)
}

fn extension_for(url: &str) -> String {
    let path = Url::parse(url)
        .map(|parsed| parsed.path().to_string())
        .unwrap_or_else(|_| url.to_string());
    let candidate = path.rsplit('/').next().and_then(|name| {
        let (_, ext) = name.rsplit_once('.')?;
        let ext = ext.to_ascii_lowercase();
        (!ext.is_empty() && ext.len() <= 4 && ext.chars().all(|c| c.is_ascii_alphanumeric()))
            .then_some(ext)
    });
    candidate.unwrap_or_else(|| "jpg".to_string())
}

fn read_fingerprint(path: &Path) -> Result<Fingerprint, std::io::Error> {
    let metadata = fs::metadata(path)?;
    let mtime_ms = metadata
        .modified()
        .ok()
        .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
        .map(|elapsed| elapsed.as_millis() as i64)
        .unwrap_or(0);
    Ok(Fingerprint {
        size: metadata.len(),
        mtime_ms,
    })
}
