//! Progress notifications.
//!
//! The pipeline reports what it is doing through a [`ProgressSink`] instead
//! of dispatching UI events. Sinks are plain observers: they cannot fail
//! and cannot influence the pipeline.

use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::mpsc;

use crate::pipeline::Stage;
use crate::upload::UploadResult;

/// A rejected upload, reduced to its message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedFile {
    pub file: String,
    pub error: String,
}

/// Stage-transition and per-file messages emitted by the pipeline.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    BatchStarted {
        files: usize,
    },
    FileStarted {
        file: String,
    },
    /// Stored; now resolving the size recorded on the link.
    FileMetadataStarted {
        file: String,
        url: String,
    },
    FileFinished {
        file: String,
        url: String,
        size: u64,
    },
    FileFailed {
        file: String,
        error: String,
    },
    BatchFinished {
        completed: Vec<UploadResult>,
        rejected: Vec<FailedFile>,
    },
    BatchFailed {
        error: String,
    },
    StageChanged {
        stage: Stage,
    },
    PublishFinished {
        url: String,
    },
    PublishFailed {
        stage: Stage,
        error: String,
    },
}

/// Receiver of [`ProgressEvent`]s.
pub trait ProgressSink: Send + Sync {
    fn emit(&self, event: ProgressEvent);
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl ProgressSink for NoopSink {
    fn emit(&self, _event: ProgressEvent) {}
}

/// Logs every event through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl ProgressSink for TracingSink {
    fn emit(&self, event: ProgressEvent) {
        crate::obs::log_progress(&event);
    }
}

/// Forwards events into an unbounded channel. Events sent after the
/// receiver is dropped are discarded.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<ProgressEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ProgressEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl ProgressSink for ChannelSink {
    fn emit(&self, event: ProgressEvent) {
        let _ = self.tx.send(event);
    }
}

/// Keeps every event in memory, in emission order.
#[derive(Debug, Default, Clone)]
pub struct CollectingSink {
    events: Arc<Mutex<Vec<ProgressEvent>>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ProgressEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl ProgressSink for CollectingSink {
    fn emit(&self, event: ProgressEvent) {
        self.events.lock().unwrap().push(event);
    }
}

/// Fans each event out to several sinks.
#[derive(Default, Clone)]
pub struct MultiSink {
    sinks: Vec<Arc<dyn ProgressSink>>,
}

impl MultiSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl ProgressSink for MultiSink {
    fn emit(&self, event: ProgressEvent) {
        for sink in &self.sinks {
            sink.emit(event.clone());
        }
    }
}
