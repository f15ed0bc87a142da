use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Which ordered collection of a product an image reference lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageType {
    Original,
    Sku,
    Scene,
}

/// Per-image edit lifecycle. Legacy tags from the pre-three-state index
/// (`downloaded`, `modified`, `synced`, `local_added`) are accepted on read
/// and rewritten by the migration pass in `index`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageStatus {
    NotDownloaded,
    #[serde(alias = "downloaded", alias = "local_added")]
    PendingEdit,
    #[serde(alias = "modified")]
    Editing,
    #[serde(alias = "synced")]
    Completed,
}

impl ImageStatus {
    pub fn as_tag(&self) -> &'static str {
        match self {
            Self::NotDownloaded => "not_downloaded",
            Self::PendingEdit => "pending_edit",
            Self::Editing => "editing",
            Self::Completed => "completed",
        }
    }

    /// Maps a persisted tag, including the legacy vocabulary, to the
    /// current three-state enum. Unknown tags are rejected.
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "not_downloaded" => Some(Self::NotDownloaded),
            "pending_edit" | "downloaded" | "local_added" => Some(Self::PendingEdit),
            "editing" | "modified" => Some(Self::Editing),
            "completed" | "synced" => Some(Self::Completed),
            _ => None,
        }
    }

    pub fn is_legacy_tag(tag: &str) -> bool {
        matches!(tag, "downloaded" | "local_added" | "modified" | "synced")
    }
}

/// Size + mtime pair used to detect external edits without hashing file
/// contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Fingerprint {
    pub size: u64,
    pub mtime_ms: i64,
}

/// Durable per-URL entry in the content index. Exactly one record exists
/// per remote URL; group membership is a property of where the URL is
/// referenced, not of the record itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageRecord {
    pub remote_url: String,
    pub apply_code: String,
    pub image_type: ImageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sku_index: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_path: Option<String>,
    pub status: ImageStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_size: Option<u64>,
    /// Last mutation time, unix ms.
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_document_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<Fingerprint>,
}

impl ImageRecord {
    pub fn has_local(&self) -> bool {
        self.local_path.is_some()
    }
}

/// One occurrence of a URL inside a group. The same URL may appear in
/// several groups; each occurrence carries its own per-group index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageRef {
    pub image_url: String,
    pub index: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishSku {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sku_code: Option<String>,
    #[serde(default)]
    pub sku_images: Vec<ImageRef>,
}

/// Product aggregate as round-tripped to the remote backend.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Product {
    pub apply_code: String,
    #[serde(default)]
    pub original_images: Vec<ImageRef>,
    #[serde(default)]
    pub publish_skus: Vec<PublishSku>,
    // The backend spells this field "senceImages"; keep that on the wire.
    #[serde(default, rename = "senceImages", alias = "sceneImages")]
    pub scene_images: Vec<ImageRef>,
}

impl Product {
    pub fn new(apply_code: impl Into<String>) -> Self {
        Self {
            apply_code: apply_code.into(),
            ..Default::default()
        }
    }

    pub fn group(&self, group: GroupRef) -> Option<&Vec<ImageRef>> {
        match group {
            GroupRef::Original => Some(&self.original_images),
            GroupRef::Scene => Some(&self.scene_images),
            GroupRef::Sku(idx) => self.publish_skus.get(idx).map(|sku| &sku.sku_images),
        }
    }

    pub fn group_mut(&mut self, group: GroupRef) -> Option<&mut Vec<ImageRef>> {
        match group {
            GroupRef::Original => Some(&mut self.original_images),
            GroupRef::Scene => Some(&mut self.scene_images),
            GroupRef::Sku(idx) => self.publish_skus.get_mut(idx).map(|sku| &mut sku.sku_images),
        }
    }
}

/// Identifies one group of a product.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GroupRef {
    Original,
    Sku(usize),
    Scene,
}

impl GroupRef {
    pub fn image_type(&self) -> ImageType {
        match self {
            Self::Original => ImageType::Original,
            Self::Sku(_) => ImageType::Sku,
            Self::Scene => ImageType::Scene,
        }
    }

    pub fn sku_index(&self) -> Option<usize> {
        match self {
            Self::Sku(idx) => Some(*idx),
            _ => None,
        }
    }
}

// -----------------------------
// Host events
// -----------------------------

/// Host-editor events, discriminated by the `type` field on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum HostEvent {
    FileSaved {
        image_id: String,
    },
    DocumentClosedCompleted {
        image_id: String,
        #[serde(default)]
        auto_completed: bool,
    },
    DocumentClosedNoChange {
        image_id: String,
    },
    UserSaveConfirmed {
        image_id: String,
    },
}

impl HostEvent {
    pub fn image_id(&self) -> &str {
        match self {
            Self::FileSaved { image_id }
            | Self::DocumentClosedCompleted { image_id, .. }
            | Self::DocumentClosedNoChange { image_id }
            | Self::UserSaveConfirmed { image_id } => image_id,
        }
    }
}

// -----------------------------
// Upload types
// -----------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadTaskStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

/// Ephemeral work item; created from records that need upload, destroyed
/// on completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadTask {
    pub image_id: String,
    pub image_type: ImageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sku_index: Option<usize>,
    pub local_path: String,
    pub attempts: u32,
    pub status: UploadTaskStatus,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadProgress {
    pub total: usize,
    pub completed: usize,
    pub success: usize,
    pub failed: usize,
    pub running: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_task: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadErrorEntry {
    pub image_id: String,
    pub error: String,
    pub attempts: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadSummary {
    pub total: usize,
    pub success: usize,
    pub failed: usize,
    pub new_urls: HashMap<String, String>,
    pub errors: Vec<UploadErrorEntry>,
}

// -----------------------------
// Batch operation results
// -----------------------------

/// Per-item outcome for batch downloads and local imports. A failed item
/// never aborts the rest of the batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchItemOutcome {
    pub success: bool,
    pub file_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Resolution of "what should the UI show for this image".
///
/// Precedence is load-bearing: a present local file wins; otherwise a
/// fully-qualified remote URL is shown directly; otherwise nothing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisplaySource {
    Local(PathBuf),
    Remote(String),
    Placeholder,
}
