//! Input files and the web-archive acceptance filter.

use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// A file queued for upload.
#[derive(Debug, Clone)]
pub struct InputFile {
    pub source: SourceFile,
    pub media_type: Option<String>,
    pub data: Vec<u8>,
}

/// Metadata describing where an upload came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceFile {
    /// Original file name; doubles as the link name in the site directory.
    pub name: String,
    /// Name assigned by the user for the manifest, if any.
    pub display_name: Option<String>,
    pub description: Option<String>,
    /// Locally known size in bytes.
    pub size: u64,
}

impl SourceFile {
    /// User-assigned display name, else the file name minus its extension.
    pub fn display_name(&self) -> String {
        match &self.display_name {
            Some(name) if !name.trim().is_empty() => name.clone(),
            _ => default_display_name(&self.name),
        }
    }
}

impl InputFile {
    pub fn new(name: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            source: SourceFile {
                name: name.into(),
                display_name: None,
                description: None,
                size: data.len() as u64,
            },
            media_type: None,
            data,
        }
    }

    /// Read a file from disk, named after its final path component.
    pub async fn read(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| {
                std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("{} has no file name", path.display()),
                )
            })?;
        let data = tokio::fs::read(path).await?;
        Ok(Self::new(name, data))
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.source.display_name = Some(name.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.source.description = Some(description.into());
        self
    }

    pub fn with_media_type(mut self, media_type: impl Into<String>) -> Self {
        self.media_type = Some(media_type.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.source.name
    }

    /// Whether this looks like a WACZ/WARC web archive, by extension or media type.
    pub fn is_accepted(&self) -> bool {
        static NAME: OnceLock<Regex> = OnceLock::new();
        static MEDIA: OnceLock<Regex> = OnceLock::new();
        let name_re = NAME.get_or_init(|| Regex::new(r"\.wa(cz|rc)$").expect("static regex"));
        let media_re = MEDIA.get_or_init(|| Regex::new(r"/wa(cz|rc)$").expect("static regex"));
        name_re.is_match(&self.source.name)
            || self
                .media_type
                .as_deref()
                .is_some_and(|t| media_re.is_match(t))
    }
}

/// File name with its last extension removed (`site.wacz` → `site`).
///
/// Names without an extension, or consisting only of one (`.wacz`), are
/// returned unchanged.
pub fn default_display_name(file_name: &str) -> String {
    match file_name.rfind('.') {
        Some(0) | None => file_name.to_string(),
        Some(i) => file_name[..i].to_string(),
    }
}

/// Split `files` into `(accepted, rejected)` by [`InputFile::is_accepted`],
/// preserving order within each half.
pub fn partition_accepted(files: Vec<InputFile>) -> (Vec<InputFile>, Vec<InputFile>) {
    files.into_iter().partition(InputFile::is_accepted)
}
