//! Error taxonomy for the wrap-and-publish pipeline.

use crate::backend::StorageError;
use crate::upload::UploadBatchResult;

/// Errors produced while building, packaging or publishing an archive site.
#[derive(Debug, thiserror::Error)]
pub enum WrapError {
    #[error("malformed identifier {input:?}: {reason}")]
    MalformedIdentifier { input: String, reason: String },

    #[error("corrupt directory node: {0}")]
    CorruptNode(String),

    #[error("template unavailable at {url}: {source}")]
    TemplateUnavailable {
        url: String,
        #[source]
        source: StorageError,
    },

    #[error("upload failed for {file}: {source}")]
    UploadFailed {
        file: String,
        #[source]
        source: StorageError,
    },

    #[error("upload task for {file} ended without an outcome: {reason}")]
    UploadAborted { file: String, reason: String },

    #[error("packaging failed: {0}")]
    PackagingFailed(String),

    #[error("container write failed: {0}")]
    ContainerWriteFailed(String),

    #[error("malformed container: {0}")]
    MalformedContainer(String),

    #[error("publish failed: {0}")]
    PublishFailed(#[source] StorageError),

    #[error("upload batch could not be dispatched: {0}")]
    BatchDispatch(String),

    #[error("no accepted files in batch ({rejected} rejected by filter)")]
    NoAcceptedFiles { rejected: usize },

    #[error("{} of {} uploads failed", .0.rejected.len(), .0.len())]
    IncompleteBatch(Box<UploadBatchResult>),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl WrapError {
    pub(crate) fn malformed(input: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        WrapError::MalformedIdentifier {
            input: input.into(),
            reason: reason.to_string(),
        }
    }
}

/// Result type for pipeline operations.
pub type Result<T> = std::result::Result<T, WrapError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_malformed_identifier_display() {
        let err = WrapError::malformed("ipfs://nope", "invalid multibase");
        let msg = err.to_string();
        assert!(msg.contains("malformed identifier"));
        assert!(msg.contains("ipfs://nope"));
        assert!(msg.contains("invalid multibase"));
    }

    #[test]
    fn test_upload_failed_carries_file_and_cause() {
        let err = WrapError::UploadFailed {
            file: "site.wacz".to_string(),
            source: StorageError::Rejected("quota exceeded".to_string()),
        };
        let msg = err.to_string();
        assert!(msg.contains("site.wacz"));
        assert!(msg.contains("quota exceeded"));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_template_unavailable_display() {
        let err = WrapError::TemplateUnavailable {
            url: "ipfs://bafy/".to_string(),
            source: StorageError::NotFound {
                url: "ipfs://bafy/".to_string(),
            },
        };
        assert!(err.to_string().contains("template unavailable"));
    }
}
