use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::index::now_ms;
use crate::store::LocalImageStore;
use crate::types::{Product, UploadTask};
use crate::upload::{ImageUploader, UploadParams};

/// Credentials for the image translation service.
#[derive(Debug, Clone, Default)]
pub struct TranslateAuth {
    pub user_key: String,
    pub img_trans_key: String,
}

/// Request signature the translation service expects:
/// `md5(commitTime + "_" + userKey + "_" + imgTransKey)`.
pub fn translate_signature(commit_time: i64, auth: &TranslateAuth) -> String {
    let payload = format!("{}_{}_{}", commit_time, auth.user_key, auth.img_trans_key);
    format!("{:x}", md5::compute(payload.as_bytes()))
}

/// Everything the plugin asks of the remote backend. Implementations
/// convert transport failures into strings at this boundary.
pub trait BackendAdapter: Send + Sync {
    fn fetch_product(&self, apply_code: &str) -> Result<Product, String>;
    fn submit_product(&self, product: &Product) -> Result<(), String>;
    /// Pushes one image's bytes and returns the final remote URL.
    fn upload_image(
        &self,
        bytes: Vec<u8>,
        file_name: &str,
        params: &UploadParams,
    ) -> Result<String, String>;
    /// Translates the image behind a remote URL; returns the translated
    /// image's URL.
    fn translate_url(&self, image_url: &str, auth: &TranslateAuth) -> Result<String, String>;
    /// Translates a local image by uploading its bytes.
    fn translate_file(
        &self,
        bytes: Vec<u8>,
        file_name: &str,
        auth: &TranslateAuth,
    ) -> Result<String, String>;
}

/// In-memory adapter for development and tests; no network calls.
#[derive(Default)]
pub struct MockBackendAdapter {
    products: Mutex<HashMap<String, Product>>,
    submissions: Mutex<Vec<Product>>,
    uploads: Mutex<Vec<String>>,
}

impl MockBackendAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_product(&self, product: Product) {
        self.products
            .lock()
            .expect("poisoned")
            .insert(product.apply_code.clone(), product);
    }

    pub fn submissions(&self) -> Vec<Product> {
        self.submissions.lock().expect("poisoned").clone()
    }

    pub fn uploaded_files(&self) -> Vec<String> {
        self.uploads.lock().expect("poisoned").clone()
    }
}

impl BackendAdapter for MockBackendAdapter {
    fn fetch_product(&self, apply_code: &str) -> Result<Product, String> {
        self.products
            .lock()
            .expect("poisoned")
            .get(apply_code)
            .cloned()
            .ok_or_else(|| format!("product {} not found", apply_code))
    }

    fn submit_product(&self, product: &Product) -> Result<(), String> {
        self.submissions.lock().expect("poisoned").push(product.clone());
        Ok(())
    }

    fn upload_image(
        &self,
        _bytes: Vec<u8>,
        file_name: &str,
        params: &UploadParams,
    ) -> Result<String, String> {
        self.uploads.lock().expect("poisoned").push(file_name.to_string());
        Ok(format!(
            "https://cdn.example.com/{}/{}",
            params.apply_code, file_name
        ))
    }

    fn translate_url(&self, image_url: &str, _auth: &TranslateAuth) -> Result<String, String> {
        Ok(format!("{}?translated=1", image_url))
    }

    fn translate_file(
        &self,
        _bytes: Vec<u8>,
        file_name: &str,
        _auth: &TranslateAuth,
    ) -> Result<String, String> {
        Ok(format!("https://trans.example.com/{}", file_name))
    }
}

/// Bridges the backend adapter into the upload coordinator: reads the
/// task's local file from the store's folder and pushes the bytes.
pub struct BackendUploader {
    store: Arc<LocalImageStore>,
    adapter: Arc<dyn BackendAdapter>,
}

impl BackendUploader {
    pub fn new(store: Arc<LocalImageStore>, adapter: Arc<dyn BackendAdapter>) -> Self {
        Self { store, adapter }
    }
}

impl ImageUploader for BackendUploader {
    fn upload(&self, task: &UploadTask, params: &UploadParams) -> Result<String, String> {
        let path = self.store.root().join(&task.local_path);
        let bytes = std::fs::read(&path).map_err(|e| e.to_string())?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| task.local_path.clone());
        self.adapter.upload_image(bytes, &file_name, params)
    }
}

#[cfg(feature = "backend-http")]
pub use http_impl::HttpBackendAdapter;

#[cfg(feature = "backend-http")]
mod http_impl {
    use super::*;
    use std::time::Duration;
    use tracing::debug;

    // Multipart submissions of full-size images can be slow.
    const UPLOAD_TIMEOUT: Duration = Duration::from_secs(300);

    pub struct HttpBackendAdapter {
        base_url: String,
        client: reqwest::blocking::Client,
    }

    impl HttpBackendAdapter {
        pub fn new(base_url: impl Into<String>) -> Self {
            let client = reqwest::blocking::Client::builder()
                .timeout(UPLOAD_TIMEOUT)
                .build()
                .expect("build http client");
            Self {
                base_url: base_url.into().trim_end_matches('/').to_string(),
                client,
            }
        }

        fn endpoint(&self, path: &str) -> String {
            format!("{}{}", self.base_url, path)
        }

        fn extract_url(v: &serde_json::Value) -> Result<String, String> {
            v.get("data")
                .and_then(|data| {
                    data.as_str()
                        .map(|s| s.to_string())
                        .or_else(|| {
                            data.get("url")
                                .and_then(|u| u.as_str())
                                .map(|s| s.to_string())
                        })
                })
                .filter(|url| !url.is_empty())
                .ok_or_else(|| "response carried no url".to_string())
        }
    }

    impl BackendAdapter for HttpBackendAdapter {
        fn fetch_product(&self, apply_code: &str) -> Result<Product, String> {
            let resp = self
                .client
                .get(self.endpoint(&format!("/api/product/{}", apply_code)))
                .send()
                .map_err(|e| e.to_string())?;
            if !resp.status().is_success() {
                return Err(format!("HTTP {}", resp.status()));
            }
            let v: serde_json::Value = resp.json().map_err(|e| e.to_string())?;
            let data = v.get("data").cloned().unwrap_or(v);
            serde_json::from_value(data).map_err(|e| e.to_string())
        }

        fn submit_product(&self, product: &Product) -> Result<(), String> {
            let resp = self
                .client
                .post(self.endpoint("/api/product/submit"))
                .json(product)
                .send()
                .map_err(|e| e.to_string())?;
            if !resp.status().is_success() {
                return Err(format!("HTTP {}", resp.status()));
            }
            Ok(())
        }

        fn upload_image(
            &self,
            bytes: Vec<u8>,
            file_name: &str,
            params: &UploadParams,
        ) -> Result<String, String> {
            debug!(file = file_name, size = bytes.len(), "uploading image");
            let part = reqwest::blocking::multipart::Part::bytes(bytes)
                .file_name(file_name.to_string());
            let form = reqwest::blocking::multipart::Form::new()
                .part("File", part)
                .text("file-stream", file_name.to_string())
                .text("applyCode", params.apply_code.clone())
                .text("userId", params.user_id.clone())
                .text("userCode", params.user_code.clone());
            let resp = self
                .client
                .post(self.endpoint("/api/image/upload"))
                .multipart(form)
                .send()
                .map_err(|e| e.to_string())?;
            if !resp.status().is_success() {
                return Err(format!("HTTP {}", resp.status()));
            }
            let v: serde_json::Value = resp.json().map_err(|e| e.to_string())?;
            Self::extract_url(&v)
        }

        fn translate_url(&self, image_url: &str, auth: &TranslateAuth) -> Result<String, String> {
            let commit_time = now_ms();
            let sign = translate_signature(commit_time, auth);
            let resp = self
                .client
                .post(self.endpoint("/api/translate/url"))
                .form(&[
                    ("commitTime", commit_time.to_string()),
                    ("userKey", auth.user_key.clone()),
                    ("sign", sign),
                    ("url", image_url.to_string()),
                ])
                .send()
                .map_err(|e| e.to_string())?;
            if !resp.status().is_success() {
                return Err(format!("HTTP {}", resp.status()));
            }
            let v: serde_json::Value = resp.json().map_err(|e| e.to_string())?;
            Self::extract_url(&v)
        }

        fn translate_file(
            &self,
            bytes: Vec<u8>,
            file_name: &str,
            auth: &TranslateAuth,
        ) -> Result<String, String> {
            let commit_time = now_ms();
            let sign = translate_signature(commit_time, auth);
            let part = reqwest::blocking::multipart::Part::bytes(bytes)
                .file_name(file_name.to_string());
            let form = reqwest::blocking::multipart::Form::new()
                .part("File", part)
                .text("commitTime", commit_time.to_string())
                .text("userKey", auth.user_key.clone())
                .text("sign", sign);
            let resp = self
                .client
                .post(self.endpoint("/api/translate/file"))
                .multipart(form)
                .send()
                .map_err(|e| e.to_string())?;
            if !resp.status().is_success() {
                return Err(format!("HTTP {}", resp.status()));
            }
            let v: serde_json::Value = resp.json().map_err(|e| e.to_string())?;
            Self::extract_url(&v)
        }
    }
}
