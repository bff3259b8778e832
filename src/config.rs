//! Hub configuration
//!
//! Read from a YAML file; every key is optional.
//!
//! ```yaml
//! database_url: postgres://localhost/dochub
//! default_branch: master
//! schema_dir: ./schema
//! page_size: 10
//! max_page_size: 1000
//! ```

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    pub database_url: Option<String>,
    pub default_branch: String,
    /// Directory of JSON/YAML schema model files
    pub schema_dir: Option<PathBuf>,
    pub page_size: usize,
    pub max_page_size: usize,
    pub reference_id_batch_size: usize,
    pub reference_row_batch_size: usize,
    pub max_connections: u32,
    pub log_filter: String,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            default_branch: "master".to_string(),
            schema_dir: None,
            page_size: crate::query::searcher::DEFAULT_PAGE_SIZE,
            max_page_size: crate::query::searcher::MAX_PAGE_SIZE,
            reference_id_batch_size: crate::storage::pg::DEFAULT_ID_BATCH_SIZE,
            reference_row_batch_size: crate::storage::pg::DEFAULT_ROW_BATCH_SIZE,
            max_connections: 5,
            log_filter: "info".to_string(),
        }
    }
}

impl HubConfig {
    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: HubConfig = serde_yaml::from_str(content)?;
        config.check()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| Error::FileReadError {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&content)
    }

    /// Reject values no hub could run with
    pub fn check(&self) -> Result<()> {
        let invalid = |message: &str| {
            Err(Error::Config {
                message: message.to_string(),
            })
        };
        if self.default_branch.trim().is_empty() {
            return invalid("default_branch may not be empty");
        }
        if self.page_size == 0 || self.max_page_size == 0 {
            return invalid("page sizes must be at least 1");
        }
        if self.page_size > self.max_page_size {
            return invalid("page_size may not exceed max_page_size");
        }
        if self.reference_id_batch_size == 0 || self.reference_row_batch_size == 0 {
            return invalid("reference batch sizes must be at least 1");
        }
        if self.max_connections == 0 {
            return invalid("max_connections must be at least 1");
        }
        Ok(())
    }

    /// The database URL, or a config error naming the missing key
    pub fn require_database_url(&self) -> Result<&str> {
        self.database_url.as_deref().ok_or_else(|| Error::Config {
            message: "database_url is not set".to_string(),
        })
    }
}
