//! Structured observability hooks for publish operations.
//!
//! This module provides:
//! - Operation-scoped tracing spans via `OperationSpan`
//! - `log_progress`, which renders every [`ProgressEvent`] as a structured log line
//!
//! Per-file failures are logged at `warn!`, everything else at `info!`.

use tracing::{info, warn, Span};
use uuid::Uuid;

use crate::progress::ProgressEvent;

/// Operation-scoped span for one upload-to-publish run.
///
/// Attach it to the operation's future so every log line inside carries
/// the same `op_id`.
///
/// # Example
///
/// ```ignore
/// let op = OperationSpan::new();
/// publisher.publish_completed(&uploads).instrument(op.span()).await?;
/// ```
#[derive(Debug, Clone)]
pub struct OperationSpan {
    id: Uuid,
    span: Span,
}

impl OperationSpan {
    /// Create a span tagged with a fresh operation id.
    pub fn new() -> Self {
        let id = Uuid::new_v4();
        let span = tracing::info_span!("arcwrap.publish", op_id = %id);
        Self { id, span }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn span(&self) -> Span {
        self.span.clone()
    }
}

impl Default for OperationSpan {
    fn default() -> Self {
        Self::new()
    }
}

/// Emit one structured log line for `event`.
pub fn log_progress(event: &ProgressEvent) {
    match event {
        ProgressEvent::BatchStarted { files } => {
            info!(event = "upload.batch_started", files = files);
        }
        ProgressEvent::FileStarted { file } => {
            info!(event = "upload.file_started", file = %file);
        }
        ProgressEvent::FileMetadataStarted { file, url } => {
            info!(event = "upload.file_metadata", file = %file, url = %url);
        }
        ProgressEvent::FileFinished { file, url, size } => {
            info!(event = "upload.file_finished", file = %file, url = %url, size = size);
        }
        ProgressEvent::FileFailed { file, error } => {
            warn!(event = "upload.file_failed", file = %file, error = %error);
        }
        ProgressEvent::BatchFinished {
            completed,
            rejected,
        } => {
            info!(
                event = "upload.batch_finished",
                completed = completed.len(),
                rejected = rejected.len(),
            );
        }
        ProgressEvent::BatchFailed { error } => {
            warn!(event = "upload.batch_failed", error = %error);
        }
        ProgressEvent::StageChanged { stage } => {
            info!(event = "publish.stage", stage = %stage);
        }
        ProgressEvent::PublishFinished { url } => {
            info!(event = "publish.finished", url = %url);
        }
        ProgressEvent::PublishFailed { stage, error } => {
            warn!(event = "publish.failed", stage = %stage, error = %error);
        }
    }
}
