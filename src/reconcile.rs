use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use thiserror::Error;
use tracing::{info, warn};

use crate::index::{ContentIndex, IndexError};
use crate::types::{GroupRef, ImageRef, ImageStatus, Product};

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("unknown product: {0}")]
    UnknownProduct(String),
    #[error("group {0:?} does not exist")]
    UnknownGroup(GroupRef),
    #[error("index {index} out of bounds for group of length {len}")]
    OutOfBounds { index: usize, len: usize },
    #[error(transparent)]
    Index(#[from] IndexError),
    #[error("commit failed: {0}")]
    CommitFailed(String),
    #[error("commit thread panicked")]
    CommitPanicked,
}

/// Soft result of a cross-group insertion; a duplicate URL in the target
/// group is reported, never raised as an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    DuplicateSkipped,
}

/// Structural edits the UI can stage. A reorder names exactly one group:
/// cross-group reorder does not exist, dragging into another group is
/// always an `Insert` of a new reference.
#[derive(Debug, Clone)]
pub enum EditOp {
    Reorder {
        group: GroupRef,
        source_index: usize,
        target_index: usize,
        /// From pointer position relative to the target's midpoint.
        drop_before: bool,
    },
    Insert {
        source_url: String,
        group: GroupRef,
        position: Option<usize>,
    },
    Delete {
        group: GroupRef,
        index: usize,
    },
}

// -----------------------------
// UI projection
// -----------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectionItem {
    /// id == remote URL, the stable identity across the system.
    pub id: String,
    pub group: GroupRef,
    pub index: usize,
    pub status: ImageStatus,
    pub has_local: bool,
}

/// Flattened, UI-facing view of one product's groups. Patched in place by
/// staged edits for responsiveness; the content index stays the source of
/// truth and wins on any detected divergence.
#[derive(Debug, Clone, Default)]
pub struct Projection {
    pub apply_code: String,
    pub items: Vec<ProjectionItem>,
}

#[derive(Debug, Clone, Default)]
pub struct DataLossReport {
    pub missing: Vec<String>,
    pub extra: Vec<String>,
}

impl Projection {
    /// Full rebuild from the durable store: originals, then each SKU group
    /// in order, then scenes.
    pub fn rebuild(index: &ContentIndex, apply_code: &str) -> Self {
        let product = index.product(apply_code).unwrap_or_else(|| Product::new(apply_code));
        let mut items = Vec::new();
        let mut push_group = |group: GroupRef, refs: &[ImageRef]| {
            for (position, image_ref) in refs.iter().enumerate() {
                let record = index.get_image_info(&image_ref.image_url);
                items.push(ProjectionItem {
                    id: image_ref.image_url.clone(),
                    group,
                    index: position,
                    status: record
                        .as_ref()
                        .map(|r| r.status)
                        .unwrap_or(ImageStatus::NotDownloaded),
                    has_local: record.map(|r| r.local_path.is_some()).unwrap_or(false),
                });
            }
        };
        push_group(GroupRef::Original, &product.original_images);
        for (sku_idx, sku) in product.publish_skus.iter().enumerate() {
            push_group(GroupRef::Sku(sku_idx), &sku.sku_images);
        }
        push_group(GroupRef::Scene, &product.scene_images);
        Self {
            apply_code: apply_code.to_string(),
            items,
        }
    }

    fn group_items(&self, group: GroupRef) -> Vec<usize> {
        self.items
            .iter()
            .enumerate()
            .filter(|(_, item)| item.group == group)
            .map(|(flat_idx, _)| flat_idx)
            .collect()
    }

    fn reindex_group(&mut self, group: GroupRef) {
        let mut position = 0;
        for item in self.items.iter_mut().filter(|item| item.group == group) {
            item.index = position;
            position += 1;
        }
    }

    /// Optimistic patch: mutates the projection without touching the
    /// durable store. The staged commit later confirms or corrects it.
    pub fn apply(&mut self, op: &EditOp, index: &ContentIndex) {
        match op {
            EditOp::Reorder {
                group,
                source_index,
                target_index,
                drop_before,
            } => {
                let flat = self.group_items(*group);
                let (Some(&from), Some(&target)) =
                    (flat.get(*source_index), flat.get(*target_index))
                else {
                    return;
                };
                let item = self.items.remove(from);
                let mut insert_at = if *drop_before { target } else { target + 1 };
                if from < insert_at {
                    insert_at -= 1;
                }
                self.items.insert(insert_at.min(self.items.len()), item);
                self.reindex_group(*group);
            }
            EditOp::Insert {
                source_url,
                group,
                position,
            } => {
                if self
                    .items
                    .iter()
                    .any(|item| item.group == *group && item.id == *source_url)
                {
                    return;
                }
                let record = index.get_image_info(source_url);
                let has_local = record.map(|r| r.local_path.is_some()).unwrap_or(false);
                let status = if has_local {
                    ImageStatus::PendingEdit
                } else {
                    ImageStatus::NotDownloaded
                };
                let flat = self.group_items(*group);
                let group_len = flat.len();
                let within = position.unwrap_or(group_len).min(group_len);
                let flat_insert = flat.get(within).copied().unwrap_or_else(|| {
                    flat.last().map(|&last| last + 1).unwrap_or(self.items.len())
                });
                self.items.insert(
                    flat_insert,
                    ProjectionItem {
                        id: source_url.clone(),
                        group: *group,
                        index: within,
                        status,
                        has_local,
                    },
                );
                self.reindex_group(*group);
            }
            EditOp::Delete { group, index: pos } => {
                let flat = self.group_items(*group);
                if let Some(&flat_idx) = flat.get(*pos) {
                    self.items.remove(flat_idx);
                    self.reindex_group(*group);
                }
            }
        }
    }

    /// Compares this projection against a fresh rebuild. Entries present
    /// durably but missing here mean a patch dropped data; the report is
    /// logged so the divergence never passes silently.
    pub fn detect_data_loss(&self, rebuilt: &Projection) -> Option<DataLossReport> {
        let here: Vec<(GroupRef, &str)> = self
            .items
            .iter()
            .map(|item| (item.group, item.id.as_str()))
            .collect();
        let there: Vec<(GroupRef, &str)> = rebuilt
            .items
            .iter()
            .map(|item| (item.group, item.id.as_str()))
            .collect();
        let missing: Vec<String> = there
            .iter()
            .filter(|entry| !here.contains(entry))
            .map(|(_, id)| id.to_string())
            .collect();
        let extra: Vec<String> = here
            .iter()
            .filter(|entry| !there.contains(entry))
            .map(|(_, id)| id.to_string())
            .collect();
        if missing.is_empty() && extra.is_empty() {
            return None;
        }
        warn!(
            apply_code = %self.apply_code,
            missing = missing.len(),
            extra = extra.len(),
            "projection diverged from content index"
        );
        Some(DataLossReport { missing, extra })
    }
}

// -----------------------------
// Engine
// -----------------------------

/// Applies structural edits to the durable group arrays and the content
/// index. Only the affected group is rewritten.
pub struct ReconcileEngine {
    index: Arc<ContentIndex>,
}

impl ReconcileEngine {
    pub fn new(index: Arc<ContentIndex>) -> Self {
        Self { index }
    }

    fn group_of(&self, apply_code: &str, group: GroupRef) -> Result<Vec<ImageRef>, ReconcileError> {
        let product = self
            .index
            .product(apply_code)
            .ok_or_else(|| ReconcileError::UnknownProduct(apply_code.to_string()))?;
        product
            .group(group)
            .cloned()
            .ok_or(ReconcileError::UnknownGroup(group))
    }

    fn reindex(items: &mut [ImageRef]) {
        for (position, item) in items.iter_mut().enumerate() {
            item.index = position;
        }
    }

    /// Reorder-by-insert within one group. Remove-then-insert splice; when
    /// the source precedes the insertion point the point shifts back one
    /// to compensate for the removed slot.
    pub fn reorder_within_group(
        &self,
        apply_code: &str,
        group: GroupRef,
        source_index: usize,
        target_index: usize,
        drop_before: bool,
    ) -> Result<(), ReconcileError> {
        let mut items = self.group_of(apply_code, group)?;
        let len = items.len();
        if source_index >= len {
            return Err(ReconcileError::OutOfBounds { index: source_index, len });
        }
        if target_index >= len {
            return Err(ReconcileError::OutOfBounds { index: target_index, len });
        }
        let moved = items.remove(source_index);
        let mut insert_at = if drop_before { target_index } else { target_index + 1 };
        if source_index < insert_at {
            insert_at -= 1;
        }
        items.insert(insert_at.min(items.len()), moved);
        Self::reindex(&mut items);
        self.index.update_group(apply_code, group, items)?;
        Ok(())
    }

    /// Cross-group reference insertion: a fresh reference sharing the URL
    /// and local file. The canonical record's status resets to
    /// pending-edit when a local file exists, else not-downloaded. A URL
    /// already present in the target group makes this a soft no-op.
    pub fn insert_reference(
        &self,
        apply_code: &str,
        source_url: &str,
        group: GroupRef,
        position: Option<usize>,
    ) -> Result<InsertOutcome, ReconcileError> {
        let mut items = match self.group_of(apply_code, group) {
            Ok(items) => items,
            // Inserting into a brand-new SKU slot starts from empty.
            Err(ReconcileError::UnknownGroup(_)) | Err(ReconcileError::UnknownProduct(_)) => {
                Vec::new()
            }
            Err(err) => return Err(err),
        };
        if items.iter().any(|item| item.image_url == source_url) {
            info!(url = source_url, ?group, "duplicate reference skipped");
            return Ok(InsertOutcome::DuplicateSkipped);
        }
        let at = position.unwrap_or(items.len()).min(items.len());
        items.insert(
            at,
            ImageRef {
                image_url: source_url.to_string(),
                index: at,
            },
        );
        Self::reindex(&mut items);
        self.index.update_group(apply_code, group, items)?;

        match self.index.get_image_info(source_url) {
            Some(record) => {
                let status = if record.local_path.is_some() {
                    ImageStatus::PendingEdit
                } else {
                    ImageStatus::NotDownloaded
                };
                self.index.set_image_status(source_url, status)?;
            }
            None => {
                self.index.upsert_record(crate::types::ImageRecord {
                    remote_url: source_url.to_string(),
                    apply_code: apply_code.to_string(),
                    image_type: group.image_type(),
                    sku_index: group.sku_index(),
                    local_path: None,
                    status: ImageStatus::NotDownloaded,
                    file_size: None,
                    timestamp: 0,
                    host_document_id: None,
                    fingerprint: None,
                })?;
            }
        }
        Ok(InsertOutcome::Inserted)
    }

    /// Deletes one reference by `(group, index)`, never by URL: the same
    /// URL may legitimately appear in several groups. The file on disk and
    /// the canonical record are left alone.
    pub fn delete_reference(
        &self,
        apply_code: &str,
        group: GroupRef,
        position: usize,
    ) -> Result<(), ReconcileError> {
        let mut items = self.group_of(apply_code, group)?;
        let len = items.len();
        if position >= len {
            return Err(ReconcileError::OutOfBounds { index: position, len });
        }
        items.remove(position);
        Self::reindex(&mut items);
        self.index.update_group(apply_code, group, items)?;
        Ok(())
    }

    /// Clears a group by repeatedly deleting the first remaining element
    /// against the authoritative store; earlier deletions shift the array,
    /// so a cached index list would skip entries.
    pub fn clear_group(&self, apply_code: &str, group: GroupRef) -> Result<usize, ReconcileError> {
        let mut deleted = 0;
        loop {
            let items = self.group_of(apply_code, group)?;
            if items.is_empty() {
                break;
            }
            self.delete_reference(apply_code, group, 0)?;
            deleted += 1;
        }
        Ok(deleted)
    }

    pub fn append_reference(
        &self,
        apply_code: &str,
        source_url: &str,
        group: GroupRef,
    ) -> Result<InsertOutcome, ReconcileError> {
        self.insert_reference(apply_code, source_url, group, None)
    }

    /// Two-phase commit: the caller has already patched the projection
    /// (phase 1); this stages the durable write on a background thread
    /// (phase 2). The returned handle is awaitable so tests and strongly
    /// consistent callers can observe the outcome; on failure the caller
    /// reloads from the content index.
    pub fn stage(self: &Arc<Self>, apply_code: String, op: EditOp) -> PendingCommit {
        let cancelled = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&cancelled);
        let engine = Arc::clone(self);
        let handle = thread::spawn(move || {
            if flag.load(Ordering::SeqCst) {
                return Ok(CommitOutcome::Cancelled);
            }
            let applied = match &op {
                EditOp::Reorder {
                    group,
                    source_index,
                    target_index,
                    drop_before,
                } => engine
                    .reorder_within_group(&apply_code, *group, *source_index, *target_index, *drop_before)
                    .map(|_| CommitOutcome::Confirmed),
                EditOp::Insert {
                    source_url,
                    group,
                    position,
                } => engine
                    .insert_reference(&apply_code, source_url, *group, *position)
                    .map(|outcome| match outcome {
                        InsertOutcome::Inserted => CommitOutcome::Confirmed,
                        InsertOutcome::DuplicateSkipped => CommitOutcome::DuplicateSkipped,
                    }),
                EditOp::Delete { group, index } => engine
                    .delete_reference(&apply_code, *group, *index)
                    .map(|_| CommitOutcome::Confirmed),
            };
            applied.map_err(|err| err.to_string())
        });
        PendingCommit { handle, cancelled }
    }

    /// Source-of-truth recovery after a failed or diverged commit.
    pub fn reload(&self, apply_code: &str) -> Projection {
        Projection::rebuild(&self.index, apply_code)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    Confirmed,
    DuplicateSkipped,
    Cancelled,
}

/// Awaitable phase-2 handle. Cancellation is cooperative: a commit that
/// already started runs to completion.
pub struct PendingCommit {
    handle: thread::JoinHandle<Result<CommitOutcome, String>>,
    cancelled: Arc<AtomicBool>,
}

impl PendingCommit {
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn wait(self) -> Result<CommitOutcome, ReconcileError> {
        match self.handle.join() {
            Ok(Ok(outcome)) => Ok(outcome),
            Ok(Err(message)) => Err(ReconcileError::CommitFailed(message)),
            Err(_) => Err(ReconcileError::CommitPanicked),
        }
    }
}
