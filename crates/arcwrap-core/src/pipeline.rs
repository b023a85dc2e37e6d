//! Upload-to-publish pipeline.
//!
//! One operation walks a fixed sequence of stages:
//!
//! ```text
//! Idle -> UploadingFiles -> TemplateLoading -> LinkingFiles
//!      -> ManifestUploading -> Packaging -> Publishing -> Done
//! ```
//!
//! Any non-terminal stage can move to `Failed`. Nothing is retried here; a
//! retry is a new operation. [`Publisher::publish_completed`] starts at
//! `TemplateLoading` with uploads that already succeeded, so publishing can
//! be retried without uploading the files again.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn, Instrument};

use crate::backend::{Backend, StorageError};
use crate::car::ContainerPackager;
use crate::codec::{ContentId, IdentifierUrl};
use crate::config::WrapperConfig;
use crate::dag::{DagBuilder, Manifest};
use crate::error::{Result, WrapError};
use crate::input::{partition_accepted, InputFile};
use crate::node::DirectoryNode;
use crate::obs::OperationSpan;
use crate::progress::{ProgressEvent, ProgressSink};
use crate::upload::{UploadBatchResult, UploadOrchestrator, UploadResult};

/// Pipeline stage of one operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Idle,
    UploadingFiles,
    TemplateLoading,
    LinkingFiles,
    ManifestUploading,
    Packaging,
    Publishing,
    Done,
    Failed,
}

impl Stage {
    pub fn is_terminal(self) -> bool {
        matches!(self, Stage::Done | Stage::Failed)
    }

    /// The stage that follows this one on success.
    pub fn next(self) -> Option<Stage> {
        match self {
            Stage::Idle => Some(Stage::UploadingFiles),
            Stage::UploadingFiles => Some(Stage::TemplateLoading),
            Stage::TemplateLoading => Some(Stage::LinkingFiles),
            Stage::LinkingFiles => Some(Stage::ManifestUploading),
            Stage::ManifestUploading => Some(Stage::Packaging),
            Stage::Packaging => Some(Stage::Publishing),
            Stage::Publishing => Some(Stage::Done),
            Stage::Done | Stage::Failed => None,
        }
    }

    /// Whether `self -> to` is a legal transition.
    ///
    /// `Idle -> TemplateLoading` is allowed for operations that start from
    /// already uploaded files.
    pub fn can_transition_to(self, to: Stage) -> bool {
        if self.is_terminal() {
            return false;
        }
        to == Stage::Failed
            || self.next() == Some(to)
            || (self == Stage::Idle && to == Stage::TemplateLoading)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::Idle => "idle",
            Stage::UploadingFiles => "uploading_files",
            Stage::TemplateLoading => "template_loading",
            Stage::LinkingFiles => "linking_files",
            Stage::ManifestUploading => "manifest_uploading",
            Stage::Packaging => "packaging",
            Stage::Publishing => "publishing",
            Stage::Done => "done",
            Stage::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Result of a successful publish.
#[derive(Debug, Clone)]
pub struct PublishOutcome {
    /// URL returned by the backend for the site root.
    pub url: String,
    pub root: ContentId,
    /// Final site directory as published.
    pub node: DirectoryNode,
    pub manifest: Manifest,
    pub manifest_url: IdentifierUrl,
    pub container_size: usize,
}

/// Result of [`Publisher::run`].
#[derive(Debug)]
pub struct PublishReport {
    pub batch: UploadBatchResult,
    /// Inputs skipped by the archive filter.
    pub filtered: Vec<String>,
    pub outcome: PublishOutcome,
}

/// Tracks the stage of one operation and reports transitions.
struct StageTracker<'a> {
    sink: &'a dyn ProgressSink,
    stage: Stage,
}

impl<'a> StageTracker<'a> {
    fn new(sink: &'a dyn ProgressSink) -> Self {
        Self {
            sink,
            stage: Stage::Idle,
        }
    }

    fn enter(&mut self, next: Stage) {
        debug_assert!(
            self.stage.can_transition_to(next),
            "illegal stage transition {} -> {}",
            self.stage,
            next
        );
        self.stage = next;
        self.sink.emit(ProgressEvent::StageChanged { stage: next });
    }

    fn fail(&mut self, error: WrapError) -> WrapError {
        warn!(stage = %self.stage, error = %error, "publish operation failed");
        self.sink.emit(ProgressEvent::PublishFailed {
            stage: self.stage,
            error: error.to_string(),
        });
        self.stage = Stage::Failed;
        self.sink.emit(ProgressEvent::StageChanged {
            stage: Stage::Failed,
        });
        error
    }
}

/// Drives uploads, site assembly, packaging and publishing.
pub struct Publisher {
    backend: Arc<dyn Backend>,
    sink: Arc<dyn ProgressSink>,
    uploader: UploadOrchestrator,
    dag: DagBuilder,
}

impl Publisher {
    /// Build a publisher; fails if `config` does not validate.
    pub fn new(
        backend: Arc<dyn Backend>,
        sink: Arc<dyn ProgressSink>,
        config: WrapperConfig,
    ) -> Result<Self> {
        config.validate()?;
        let uploader =
            UploadOrchestrator::new(Arc::clone(&backend), Arc::clone(&sink), config.size_policy);
        let dag = DagBuilder::new(Arc::clone(&backend), uploader.clone(), config);
        Ok(Self {
            backend,
            sink,
            uploader,
            dag,
        })
    }

    pub fn config(&self) -> &WrapperConfig {
        self.dag.config()
    }

    pub fn uploader(&self) -> &UploadOrchestrator {
        &self.uploader
    }

    /// Upload `files` and publish the site.
    ///
    /// Inputs that are not web archives are skipped unless `accept_any` is
    /// configured. With `allow_partial` unset, any rejected upload stops
    /// the operation with [`WrapError::IncompleteBatch`], which hands back
    /// the batch so the caller can publish the completed part later.
    pub async fn run(&self, files: Vec<InputFile>, allow_partial: bool) -> Result<PublishReport> {
        let op = OperationSpan::new();
        self.run_inner(files, allow_partial).instrument(op.span()).await
    }

    async fn run_inner(&self, files: Vec<InputFile>, allow_partial: bool) -> Result<PublishReport> {
        let mut tracker = StageTracker::new(self.sink.as_ref());

        let (accepted, filtered) = if self.config().accept_any {
            (files, Vec::new())
        } else {
            partition_accepted(files)
        };
        let filtered: Vec<String> = filtered.iter().map(|f| f.name().to_string()).collect();
        if accepted.is_empty() {
            return Err(tracker.fail(WrapError::NoAcceptedFiles {
                rejected: filtered.len(),
            }));
        }
        if !filtered.is_empty() {
            info!(skipped = ?filtered, "skipping inputs that are not web archives");
        }

        tracker.enter(Stage::UploadingFiles);
        let batch = match self.uploader.upload_files(accepted).await {
            Ok(batch) => batch,
            Err(e) => return Err(tracker.fail(e)),
        };
        if batch.completed.is_empty() || (!batch.is_complete() && !allow_partial) {
            return Err(tracker.fail(WrapError::IncompleteBatch(Box::new(batch))));
        }

        let outcome = self.publish_stages(&mut tracker, &batch.completed).await?;
        Ok(PublishReport {
            batch,
            filtered,
            outcome,
        })
    }

    /// Publish a site from uploads that already succeeded.
    pub async fn publish_completed(&self, completed: &[UploadResult]) -> Result<PublishOutcome> {
        let op = OperationSpan::new();
        async {
            let mut tracker = StageTracker::new(self.sink.as_ref());
            self.publish_stages(&mut tracker, completed).await
        }
        .instrument(op.span())
        .await
    }

    async fn publish_stages(
        &self,
        tracker: &mut StageTracker<'_>,
        completed: &[UploadResult],
    ) -> Result<PublishOutcome> {
        tracker.enter(Stage::TemplateLoading);
        let mut node = match self.dag.load_template().await {
            Ok(node) => node,
            Err(e) => return Err(tracker.fail(e)),
        };

        tracker.enter(Stage::LinkingFiles);
        let manifest = self.dag.link_files(&mut node, completed);

        tracker.enter(Stage::ManifestUploading);
        let manifest_upload = match self.dag.attach_manifest(&mut node, &manifest).await {
            Ok((_, upload)) => upload,
            Err(e) => return Err(tracker.fail(e)),
        };

        tracker.enter(Stage::Packaging);
        let site = node.clone();
        let packaged = match ContainerPackager::package(node) {
            Ok(packaged) => packaged,
            Err(e) => return Err(tracker.fail(e)),
        };

        tracker.enter(Stage::Publishing);
        let url = match self.publish_container(packaged.root, &packaged.bytes).await {
            Ok(url) => url,
            Err(e) => return Err(tracker.fail(e)),
        };

        tracker.enter(Stage::Done);
        self.sink
            .emit(ProgressEvent::PublishFinished { url: url.clone() });
        Ok(PublishOutcome {
            url,
            root: packaged.root,
            node: site,
            manifest,
            manifest_url: manifest_upload.url,
            container_size: packaged.bytes.len(),
        })
    }

    async fn publish_container(&self, root: ContentId, car: &[u8]) -> Result<String> {
        let urls = self
            .backend
            .publish_container(car)
            .await
            .map_err(WrapError::PublishFailed)?;
        let first = urls.into_iter().next().ok_or_else(|| {
            WrapError::PublishFailed(StorageError::Rejected(
                "backend returned no root identifier".to_string(),
            ))
        })?;
        let returned = IdentifierUrl::parse(&first)
            .map_err(|e| WrapError::PublishFailed(StorageError::InvalidIdentifier(e.to_string())))?;
        if returned.cid() != root {
            return Err(WrapError::PublishFailed(StorageError::Rejected(format!(
                "backend returned root {}, expected {root}",
                returned.cid()
            ))));
        }
        info!(event = "publish.container_uploaded", root = %root, url = %first);
        Ok(first)
    }
}
