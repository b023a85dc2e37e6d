//! Published-site history kept in a JSON file.
//!
//! Every successful publish appends its URL once; a URL that is already
//! present is not added again.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub url: String,
    pub published_at: DateTime<Utc>,
    #[serde(default)]
    pub archives: Vec<String>,
}

pub struct History {
    path: PathBuf,
}

impl History {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// All recorded entries, oldest first. A missing file is an empty history.
    pub fn entries(&self) -> Result<Vec<HistoryEntry>> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(e).context(format!("Failed to read history {:?}", self.path));
            }
        };
        serde_json::from_str(&content)
            .context(format!("Failed to parse history {:?}", self.path))
    }

    /// Append `entry` unless its URL is already recorded. Returns whether it
    /// was added.
    pub fn record(&self, entry: HistoryEntry) -> Result<bool> {
        let mut entries = self.entries()?;
        if entries.iter().any(|e| e.url == entry.url) {
            return Ok(false);
        }
        entries.push(entry);

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .context(format!("Failed to create {:?}", parent))?;
        }
        let json = serde_json::to_string_pretty(&entries)?;
        std::fs::write(&self.path, json)
            .context(format!("Failed to write history {:?}", self.path))?;
        Ok(true)
    }
}
