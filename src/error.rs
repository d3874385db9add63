use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum HarvestError {
    #[error("invalid class name: {0}")]
    InvalidClassName(String),

    #[error("invalid biome lineage: {0}")]
    InvalidLineage(String),

    #[error("invalid class spec (expected name=lineage): {0}")]
    InvalidClassSpec(String),

    #[error("missing config file biom-harvest.json in current directory")]
    MissingConfig,

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("failed to build HTTP client: {0}")]
    HttpClient(String),

    #[error("MGnify request failed for {url}: {message}")]
    ApiRequest { url: String, message: String },

    #[error("MGnify returned status {status} for {url}")]
    ApiStatus { url: String, status: u16 },

    #[error("download failed: {0}")]
    DownloadFailed(String),

    #[error("unreadable BIOM table: {0}")]
    TableFormat(String),

    #[error("biom conversion failed: {0}")]
    Conversion(String),

    #[error("required tool not found: {0}")]
    MissingTool(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("interrupted")]
    Interrupted,
}

impl HarvestError {
    /// Whether the walk abandons the current branch and keeps going, as
    /// opposed to aborting the class (state persistence) or the whole
    /// run (interrupt).
    pub fn is_branch_skip(&self) -> bool {
        matches!(
            self,
            HarvestError::ApiRequest { .. }
                | HarvestError::ApiStatus { .. }
                | HarvestError::DownloadFailed(_)
                | HarvestError::TableFormat(_)
                | HarvestError::Conversion(_)
                | HarvestError::MissingTool(_)
        )
    }
}
