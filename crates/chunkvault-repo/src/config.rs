//! Repository configuration.

use serde::{Deserialize, Serialize};
use std::path::Path;

use chunkvault_store::StoreConfig;

use crate::directory::valid_name;
use crate::error::{RepoError, RepoResult};
use crate::merge::ConflictPolicy;

/// Settings of one repository checkout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RepoConfig {
    /// Branch whose log is read and appended
    pub branch: String,
    /// Chunk store location and tree shape; `store.dir` is relative to the repository
    pub store: StoreConfig,
    /// Decoded commits kept in memory
    pub commit_cache_capacity: usize,
    /// Winner of merge conflicts
    pub conflict_policy: ConflictPolicy,
}

impl Default for RepoConfig {
    fn default() -> Self {
        Self {
            branch: "main".to_string(),
            store: StoreConfig::default(),
            commit_cache_capacity: 1024,
            conflict_policy: ConflictPolicy::default(),
        }
    }
}

impl RepoConfig {
    /// Load from a `.toml` or `.json` file
    pub fn from_file(path: &Path) -> RepoResult<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let config: RepoConfig = match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents).map_err(|e| RepoError::Config(e.to_string()))?,
            "json" => serde_json::from_str(&contents).map_err(|e| RepoError::Config(e.to_string()))?,
            _ => {
                return Err(RepoError::Config(format!(
                    "unsupported config file extension: {}",
                    ext
                )))
            }
        };
        config.validate()?;
        Ok(config)
    }

    /// Check branch name, cache size and the store settings
    pub fn validate(&self) -> RepoResult<()> {
        if !valid_name(&self.branch) {
            return Err(RepoError::Config(format!("invalid branch name {:?}", self.branch)));
        }
        if self.commit_cache_capacity == 0 {
            return Err(RepoError::Config("commit_cache_capacity must be > 0".to_string()));
        }
        self.store
            .validate()
            .map_err(|e| RepoError::Config(e.to_string()))
    }
}
