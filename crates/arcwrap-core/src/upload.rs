//! Concurrent file upload with all-settled semantics.
//!
//! [`UploadOrchestrator::upload_files`] fires one task per input file, waits
//! for every task to settle and partitions the outcomes. A failing file
//! never cancels its siblings and never fails the batch; only a failure to
//! run the batch at all does. Results keep input order, not completion order.

use std::collections::HashSet;
use std::sync::Arc;

use serde::Serialize;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::backend::{Backend, StorageError};
use crate::codec::{ContentId, IdentifierUrl};
use crate::config::SizePolicy;
use crate::error::{Result, WrapError};
use crate::input::{InputFile, SourceFile};
use crate::progress::{FailedFile, ProgressEvent, ProgressSink};

/// A stored file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UploadResult {
    pub source: SourceFile,
    pub url: IdentifierUrl,
    /// Size recorded on the file's link.
    pub size: u64,
}

impl UploadResult {
    pub fn content_id(&self) -> ContentId {
        self.url.cid()
    }
}

/// A file whose upload failed, with the reason.
#[derive(Debug)]
pub struct RejectedUpload {
    pub source: SourceFile,
    pub error: WrapError,
}

/// Outcome of one batch, both halves in input order.
#[derive(Debug, Default)]
pub struct UploadBatchResult {
    pub completed: Vec<UploadResult>,
    pub rejected: Vec<RejectedUpload>,
}

impl UploadBatchResult {
    /// Total number of files in the batch.
    pub fn len(&self) -> usize {
        self.completed.len() + self.rejected.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `true` when every file in the batch was stored.
    pub fn is_complete(&self) -> bool {
        self.rejected.is_empty()
    }

    pub fn completed(&self, name: &str) -> Option<&UploadResult> {
        self.completed.iter().find(|r| r.source.name == name)
    }

    pub fn rejected(&self, name: &str) -> Option<&WrapError> {
        self.rejected
            .iter()
            .find(|r| r.source.name == name)
            .map(|r| &r.error)
    }

    pub fn failed_files(&self) -> Vec<FailedFile> {
        self.rejected
            .iter()
            .map(|r| FailedFile {
                file: r.source.name.clone(),
                error: r.error.to_string(),
            })
            .collect()
    }
}

/// Uploads files through a [`Backend`], reporting to a [`ProgressSink`].
#[derive(Clone)]
pub struct UploadOrchestrator {
    backend: Arc<dyn Backend>,
    sink: Arc<dyn ProgressSink>,
    size_policy: SizePolicy,
}

impl UploadOrchestrator {
    pub fn new(
        backend: Arc<dyn Backend>,
        sink: Arc<dyn ProgressSink>,
        size_policy: SizePolicy,
    ) -> Self {
        Self {
            backend,
            sink,
            size_policy,
        }
    }

    /// Upload one file.
    ///
    /// Emits `FileStarted`, then `FileMetadataStarted` once stored, then
    /// `FileFinished` or `FileFailed`.
    pub async fn upload_file(&self, file: InputFile) -> Result<UploadResult> {
        upload_one(
            Arc::clone(&self.backend),
            Arc::clone(&self.sink),
            self.size_policy,
            file,
        )
        .await
    }

    /// Upload every file concurrently and wait for all of them to settle.
    ///
    /// Per-file failures land in [`UploadBatchResult::rejected`], including
    /// a task that dies without reporting an outcome; siblings are never
    /// cancelled. The call itself only fails when the batch cannot be run
    /// at all (duplicate source names).
    pub async fn upload_files(&self, files: Vec<InputFile>) -> Result<UploadBatchResult> {
        self.sink.emit(ProgressEvent::BatchStarted { files: files.len() });

        match self.run_batch(files).await {
            Ok(batch) => {
                self.sink.emit(ProgressEvent::BatchFinished {
                    completed: batch.completed.clone(),
                    rejected: batch.failed_files(),
                });
                Ok(batch)
            }
            Err(e) => {
                self.sink.emit(ProgressEvent::BatchFailed {
                    error: e.to_string(),
                });
                Err(e)
            }
        }
    }

    async fn run_batch(&self, files: Vec<InputFile>) -> Result<UploadBatchResult> {
        let mut seen = HashSet::new();
        if let Some(dup) = files.iter().find(|f| !seen.insert(f.name().to_string())) {
            return Err(WrapError::BatchDispatch(format!(
                "duplicate file name {:?}",
                dup.name()
            )));
        }

        let sources: Vec<SourceFile> = files.iter().map(|f| f.source.clone()).collect();
        let mut join_set = JoinSet::new();
        for (idx, file) in files.into_iter().enumerate() {
            let backend = Arc::clone(&self.backend);
            let sink = Arc::clone(&self.sink);
            let policy = self.size_policy;
            join_set.spawn(async move { (idx, upload_one(backend, sink, policy, file).await) });
        }

        // Drain every task before looking at outcomes; a task that died
        // leaves its slot empty.
        let mut slots: Vec<Option<Result<UploadResult>>> =
            std::iter::repeat_with(|| None).take(sources.len()).collect();
        let mut join_errors = Vec::new();
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((idx, outcome)) => slots[idx] = Some(outcome),
                Err(e) => {
                    warn!(error = %e, "upload task ended without an outcome");
                    join_errors.push(e.to_string());
                }
            }
        }
        let reason = match join_errors.as_slice() {
            [single] => single.clone(),
            _ => "task panicked or was cancelled".to_string(),
        };

        let mut batch = UploadBatchResult::default();
        for (source, slot) in sources.into_iter().zip(slots) {
            match slot {
                Some(Ok(result)) => batch.completed.push(result),
                Some(Err(error)) => batch.rejected.push(RejectedUpload { source, error }),
                None => {
                    let error = WrapError::UploadAborted {
                        file: source.name.clone(),
                        reason: reason.clone(),
                    };
                    self.sink.emit(ProgressEvent::FileFailed {
                        file: source.name.clone(),
                        error: error.to_string(),
                    });
                    batch.rejected.push(RejectedUpload { source, error });
                }
            }
        }
        debug!(
            completed = batch.completed.len(),
            rejected = batch.rejected.len(),
            "upload batch settled"
        );
        Ok(batch)
    }
}

async fn upload_one(
    backend: Arc<dyn Backend>,
    sink: Arc<dyn ProgressSink>,
    policy: SizePolicy,
    file: InputFile,
) -> Result<UploadResult> {
    let name = file.name().to_string();
    sink.emit(ProgressEvent::FileStarted { file: name.clone() });

    let failed = |source: StorageError| WrapError::UploadFailed {
        file: name.clone(),
        source,
    };

    let outcome: Result<UploadResult> = async {
        let raw_url = backend.store(&name, &file.data).await.map_err(failed)?;
        let url = IdentifierUrl::parse(&raw_url)
            .map_err(|e| failed(StorageError::InvalidIdentifier(e.to_string())))?;
        sink.emit(ProgressEvent::FileMetadataStarted {
            file: name.clone(),
            url: raw_url.clone(),
        });
        let size = match policy {
            SizePolicy::Local => file.source.size,
            SizePolicy::Backend => backend.size_of(&raw_url).await.map_err(failed)?,
        };
        Ok(UploadResult {
            source: file.source.clone(),
            url,
            size,
        })
    }
    .await;

    match &outcome {
        Ok(result) => sink.emit(ProgressEvent::FileFinished {
            file: name.clone(),
            url: result.url.to_string(),
            size: result.size,
        }),
        Err(e) => sink.emit(ProgressEvent::FileFailed {
            file: name.clone(),
            error: e.to_string(),
        }),
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::progress::CollectingSink;
    use std::time::Duration;

    fn orchestrator(
        backend: &Arc<MemoryBackend>,
        policy: SizePolicy,
    ) -> (UploadOrchestrator, CollectingSink) {
        let sink = CollectingSink::new();
        let orch = UploadOrchestrator::new(backend.clone(), Arc::new(sink.clone()), policy);
        (orch, sink)
    }

    fn files(names: &[&str]) -> Vec<InputFile> {
        names
            .iter()
            .map(|n| InputFile::new(*n, format!("contents of {n}").into_bytes()))
            .collect()
    }

    #[tokio::test]
    async fn single_upload_emits_lifecycle() {
        let backend = Arc::new(MemoryBackend::new());
        let (orch, sink) = orchestrator(&backend, SizePolicy::Local);
        let result = orch
            .upload_file(InputFile::new("a.wacz", b"abc".to_vec()))
            .await
            .unwrap();
        assert_eq!(result.size, 3);
        assert_eq!(result.content_id(), ContentId::hash_raw(b"abc"));

        let events = sink.events();
        assert!(matches!(events[0], ProgressEvent::FileStarted { .. }));
        assert!(matches!(events[1], ProgressEvent::FileMetadataStarted { .. }));
        assert!(matches!(events[2], ProgressEvent::FileFinished { size: 3, .. }));
    }

    #[tokio::test]
    async fn single_upload_failure_carries_file_and_cause() {
        let backend = Arc::new(MemoryBackend::new());
        backend.fail_store_for("bad.wacz");
        let (orch, sink) = orchestrator(&backend, SizePolicy::Local);
        let err = orch
            .upload_file(InputFile::new("bad.wacz", vec![1]))
            .await
            .unwrap_err();
        match err {
            WrapError::UploadFailed { file, source } => {
                assert_eq!(file, "bad.wacz");
                assert!(matches!(source, StorageError::Rejected(_)));
            }
            other => panic!("expected UploadFailed, got {other:?}"),
        }
        assert!(matches!(
            sink.events().last(),
            Some(ProgressEvent::FileFailed { .. })
        ));
    }

    #[tokio::test]
    async fn backend_size_policy_asks_backend() {
        let backend = Arc::new(MemoryBackend::new());
        backend.fail_size();
        let (orch, _sink) = orchestrator(&backend, SizePolicy::Backend);
        let err = orch
            .upload_file(InputFile::new("a.wacz", vec![1, 2]))
            .await
            .unwrap_err();
        assert!(matches!(err, WrapError::UploadFailed { .. }));

        let healthy = Arc::new(MemoryBackend::new());
        let (orch, _sink) = orchestrator(&healthy, SizePolicy::Backend);
        let result = orch
            .upload_file(InputFile::new("a.wacz", vec![1, 2]))
            .await
            .unwrap();
        assert_eq!(result.size, 2);
    }

    #[tokio::test]
    async fn partial_failure_batch_settles_all() {
        let backend = Arc::new(MemoryBackend::new());
        backend.fail_store_for("2.wacz");
        let (orch, sink) = orchestrator(&backend, SizePolicy::Local);

        let batch = orch
            .upload_files(files(&["1.wacz", "2.wacz", "3.wacz"]))
            .await
            .unwrap();

        let done: Vec<_> = batch.completed.iter().map(|r| r.source.name.as_str()).collect();
        assert_eq!(done, vec!["1.wacz", "3.wacz"]);
        assert_eq!(batch.rejected.len(), 1);
        assert!(matches!(
            batch.rejected("2.wacz"),
            Some(WrapError::UploadFailed { .. })
        ));
        assert!(!batch.is_complete());

        match sink.events().last() {
            Some(ProgressEvent::BatchFinished {
                completed,
                rejected,
            }) => {
                assert_eq!(completed.len(), 2);
                assert_eq!(rejected[0].file, "2.wacz");
            }
            other => panic!("expected BatchFinished, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn batch_preserves_input_order_not_completion_order() {
        let backend = Arc::new(MemoryBackend::new());
        backend.delay_store_for("slow.wacz", Duration::from_millis(500));
        let (orch, _sink) = orchestrator(&backend, SizePolicy::Local);

        let batch = orch
            .upload_files(files(&["slow.wacz", "fast.wacz"]))
            .await
            .unwrap();
        let done: Vec<_> = batch.completed.iter().map(|r| r.source.name.as_str()).collect();
        assert_eq!(done, vec!["slow.wacz", "fast.wacz"]);
    }

    #[tokio::test(start_paused = true)]
    async fn batch_fans_out_without_cap() {
        let backend = Arc::new(MemoryBackend::new());
        let names: Vec<String> = (0..8).map(|i| format!("{i}.wacz")).collect();
        for name in &names {
            backend.delay_store_for(name, Duration::from_millis(100));
        }
        let (orch, _sink) = orchestrator(&backend, SizePolicy::Local);
        let refs: Vec<&str> = names.iter().map(String::as_str).collect();
        let batch = orch.upload_files(files(&refs)).await.unwrap();
        assert!(batch.is_complete());
        assert_eq!(backend.peak_concurrent_stores(), 8);
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_upload_does_not_cancel_siblings() {
        let backend = Arc::new(MemoryBackend::new());
        backend.panic_store_for("b.wacz");
        backend.delay_store_for("a.wacz", Duration::from_millis(200));
        backend.delay_store_for("c.wacz", Duration::from_millis(200));
        let (orch, sink) = orchestrator(&backend, SizePolicy::Local);

        let batch = orch
            .upload_files(files(&["a.wacz", "b.wacz", "c.wacz"]))
            .await
            .unwrap();

        let done: Vec<_> = batch.completed.iter().map(|r| r.source.name.as_str()).collect();
        assert_eq!(done, vec!["a.wacz", "c.wacz"]);
        for result in &batch.completed {
            assert!(backend.get(&result.content_id()).is_some());
        }
        assert!(matches!(
            batch.rejected("b.wacz"),
            Some(WrapError::UploadAborted { file, .. }) if file == "b.wacz"
        ));
        assert!(sink.events().iter().any(|e| matches!(
            e,
            ProgressEvent::FileFailed { file, .. } if file == "b.wacz"
        )));
    }

    #[tokio::test]
    async fn duplicate_names_fail_dispatch() {
        let backend = Arc::new(MemoryBackend::new());
        let (orch, sink) = orchestrator(&backend, SizePolicy::Local);
        let err = orch
            .upload_files(files(&["a.wacz", "a.wacz"]))
            .await
            .unwrap_err();
        assert!(matches!(err, WrapError::BatchDispatch(_)));
        assert!(matches!(
            sink.events().last(),
            Some(ProgressEvent::BatchFailed { .. })
        ));
    }

    #[tokio::test]
    async fn empty_batch_is_complete() {
        let backend = Arc::new(MemoryBackend::new());
        let (orch, _sink) = orchestrator(&backend, SizePolicy::Local);
        let batch = orch.upload_files(Vec::new()).await.unwrap();
        assert!(batch.is_empty());
        assert!(batch.is_complete());
    }
}
