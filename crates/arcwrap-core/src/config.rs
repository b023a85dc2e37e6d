//! Pipeline configuration.
//!
//! Everything that used to be a module-level default is a field of
//! [`WrapperConfig`] and is handed to the pipeline explicitly.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::codec::IdentifierUrl;
use crate::error::{Result, WrapError};

/// Published empty-site template the archives are linked into.
pub const DEFAULT_TEMPLATE: &str =
    "ipfs://bafybeiaqxlrvmovkiiniojnsy67fnfagddb2ml67ejbjcqgqyccedaegxi/";

/// Link name of the generated manifest inside the site directory.
pub const DEFAULT_MANIFEST_NAME: &str = "archives.json";

/// Where the size recorded on a file's link comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SizePolicy {
    /// Ask the backend for the stored size (also warms gateway caches).
    Backend,
    /// Use the byte length of the local file.
    #[default]
    Local,
}

impl fmt::Display for SizePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SizePolicy::Backend => f.write_str("backend"),
            SizePolicy::Local => f.write_str("local"),
        }
    }
}

impl FromStr for SizePolicy {
    type Err = WrapError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "backend" => Ok(SizePolicy::Backend),
            "local" => Ok(SizePolicy::Local),
            other => Err(WrapError::InvalidConfig(format!(
                "unknown size policy {other:?} (expected \"backend\" or \"local\")"
            ))),
        }
    }
}

/// Configuration for one wrapper instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WrapperConfig {
    /// Identifier URL of the template directory node.
    pub template_url: String,
    /// Reserved link name for the manifest document.
    pub manifest_name: String,
    pub size_policy: SizePolicy,
    /// Upload every input, not only `.wacz`/`.warc` archives.
    #[serde(default)]
    pub accept_any: bool,
}

impl Default for WrapperConfig {
    fn default() -> Self {
        Self {
            template_url: DEFAULT_TEMPLATE.to_string(),
            manifest_name: DEFAULT_MANIFEST_NAME.to_string(),
            size_policy: SizePolicy::default(),
            accept_any: false,
        }
    }
}

impl WrapperConfig {
    /// Check the template URL parses and the manifest name is a single
    /// non-empty path segment.
    pub fn validate(&self) -> Result<()> {
        IdentifierUrl::parse(&self.template_url)?;
        if self.manifest_name.is_empty() {
            return Err(WrapError::InvalidConfig(
                "manifest name must not be empty".to_string(),
            ));
        }
        if self.manifest_name.contains('/') {
            return Err(WrapError::InvalidConfig(format!(
                "manifest name {:?} must not contain '/'",
                self.manifest_name
            )));
        }
        Ok(())
    }
}
