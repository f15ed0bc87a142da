use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::index::{ContentIndex, IndexError};
use crate::types::{HostEvent, ImageStatus};

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("invalid status transition {from:?} -> {to:?}")]
    InvalidTransition { from: ImageStatus, to: ImageStatus },
    #[error(transparent)]
    Index(#[from] IndexError),
}

/// Declared edges of the lifecycle graph. Self-transitions are allowed as
/// no-ops; everything else is rejected. The user-initiated toggle and
/// reset actions deliberately bypass this check.
pub fn can_transition(from: ImageStatus, to: ImageStatus) -> bool {
    use ImageStatus::*;
    if from == to {
        return true;
    }
    matches!(
        (from, to),
        (NotDownloaded, PendingEdit)
            | (PendingEdit, Editing)
            | (Editing, Completed)
            | (Editing, PendingEdit)
            | (Completed, Editing)
            | (Completed, PendingEdit)
    )
}

/// Outcome of a toggle; `new_status` is authoritative and callers must
/// reconcile any optimistic UI guess against it.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToggleOutcome {
    pub success: bool,
    pub new_status: ImageStatus,
}

/// Drives status transitions against the content index. All writes go
/// through the index's write-through setters, so a failed transition
/// leaves the previous status intact.
pub struct LifecycleEngine {
    index: Arc<ContentIndex>,
}

impl LifecycleEngine {
    pub fn new(index: Arc<ContentIndex>) -> Self {
        Self { index }
    }

    pub fn status_of(&self, url: &str) -> Option<ImageStatus> {
        self.index.get_image_info(url).map(|record| record.status)
    }

    /// Walks one declared edge. Rejects undeclared edges before touching
    /// the index.
    pub fn transition(&self, url: &str, to: ImageStatus) -> Result<ImageStatus, LifecycleError> {
        let from = self
            .index
            .get_image_info(url)
            .map(|record| record.status)
            .ok_or_else(|| IndexError::UnknownImage(url.to_string()))?;
        if !can_transition(from, to) {
            return Err(LifecycleError::InvalidTransition { from, to });
        }
        if from != to {
            self.index.set_image_status(url, to)?;
            debug!(url, from = from.as_tag(), to = to.as_tag(), "status transition");
        }
        Ok(to)
    }

    /// Flips between completed and editing. Safe to call even when the
    /// caller's optimistic guess of the outcome is wrong; the returned
    /// status is what actually got persisted.
    pub fn toggle_completed(&self, url: &str) -> Result<ToggleOutcome, LifecycleError> {
        let current = self
            .index
            .get_image_info(url)
            .map(|record| record.status)
            .ok_or_else(|| IndexError::UnknownImage(url.to_string()))?;
        let target = if current == ImageStatus::Completed {
            ImageStatus::Editing
        } else {
            ImageStatus::Completed
        };
        self.index.set_image_status(url, target)?;
        Ok(ToggleOutcome {
            success: true,
            new_status: target,
        })
    }

    /// Forces `completed -> editing`, used when the user reopens a
    /// finished image in the host editor. Anything not yet completed is
    /// rejected; an image already mid-edit is a no-op.
    pub fn reset_to_editing(&self, url: &str) -> Result<(), LifecycleError> {
        let current = self
            .index
            .get_image_info(url)
            .map(|record| record.status)
            .ok_or_else(|| IndexError::UnknownImage(url.to_string()))?;
        match current {
            ImageStatus::Completed => {
                self.index.set_image_status(url, ImageStatus::Editing)?;
                Ok(())
            }
            ImageStatus::Editing => Ok(()),
            _ => Err(LifecycleError::InvalidTransition {
                from: current,
                to: ImageStatus::Editing,
            }),
        }
    }

    /// Target status for a host event given the current status and whether
    /// the save actually changed bytes. `None` means no status change.
    pub fn event_target(
        current: ImageStatus,
        event: &HostEvent,
        byte_change: bool,
    ) -> Option<ImageStatus> {
        match event {
            HostEvent::FileSaved { .. } => {
                // A real save while editing keeps the image mid-edit; the
                // bridge refreshes the display handle separately.
                if byte_change && current == ImageStatus::PendingEdit {
                    Some(ImageStatus::Editing)
                } else {
                    None
                }
            }
            HostEvent::DocumentClosedCompleted { .. } | HostEvent::UserSaveConfirmed { .. } => {
                (current != ImageStatus::Completed).then_some(ImageStatus::Completed)
            }
            HostEvent::DocumentClosedNoChange { .. } => {
                (current == ImageStatus::Editing).then_some(ImageStatus::PendingEdit)
            }
        }
    }
}
