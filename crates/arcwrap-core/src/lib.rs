//! arcwrap core library
//!
//! Wraps uploaded web archives into a static replay site: uploads the files,
//! links them into a template directory node together with a generated
//! manifest, packages the result as a CAR and publishes it.

pub mod backend;
pub mod car;
pub mod codec;
pub mod config;
pub mod dag;
pub mod error;
pub mod input;
pub mod node;
pub mod obs;
pub mod pipeline;
pub mod progress;
pub mod telemetry;
pub mod upload;

mod varint;

pub use backend::{Backend, FsBackend, MemoryBackend, StorageError, StorageResult};
pub use car::{read_car, Block, CarContents, CarWriter, ContainerPackager, PackagedContainer};
pub use codec::{ContentId, IdentifierUrl};
pub use config::{SizePolicy, WrapperConfig, DEFAULT_MANIFEST_NAME, DEFAULT_TEMPLATE};
pub use dag::{ArchiveDescriptor, DagBuilder, Manifest, WrappedSite};
pub use error::{Result, WrapError};
pub use input::{default_display_name, partition_accepted, InputFile, SourceFile};
pub use node::{DirectoryNode, Link};
pub use pipeline::{PublishOutcome, PublishReport, Publisher, Stage};
pub use progress::{
    ChannelSink, CollectingSink, FailedFile, MultiSink, NoopSink, ProgressEvent, ProgressSink,
    TracingSink,
};
pub use upload::{RejectedUpload, UploadBatchResult, UploadOrchestrator, UploadResult};

pub use obs::{log_progress, OperationSpan};
pub use telemetry::init_tracing;

/// arcwrap version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
