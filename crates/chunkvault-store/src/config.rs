//! Store and tree configuration loaded from TOML or JSON files.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::cache::CacheConfig;
use crate::encryption::EncryptionAlgorithm;
use crate::error::{StoreError, StoreResult};
use crate::tree::TreeConfig;

/// Where a chunk store lives and how trees written into it are shaped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Directory holding `<name>.pack` and `<name>.idx`
    pub dir: PathBuf,
    /// Store name within the directory
    pub name: String,
    /// Chunking and compression of new container trees
    pub tree: TreeConfig,
    /// Pointer cache bounds of opened trees
    pub cache: CacheConfig,
    /// Cipher used when the store is opened with a key
    pub algorithm: EncryptionAlgorithm,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from(".chunkvault"),
            name: String::from("objects"),
            tree: TreeConfig::default(),
            cache: CacheConfig::default(),
            algorithm: EncryptionAlgorithm::default(),
        }
    }
}

impl StoreConfig {
    /// Load from a `.toml` or `.json` file; missing fields take their defaults
    pub fn from_file(path: &Path) -> StoreResult<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let config: StoreConfig = match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents).map_err(|e| StoreError::Config(e.to_string()))?,
            "json" => {
                serde_json::from_str(&contents).map_err(|e| StoreError::Config(e.to_string()))?
            }
            _ => {
                return Err(StoreError::Config(format!(
                    "unsupported config file extension: {}",
                    ext
                )))
            }
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject values no store could be opened with
    pub fn validate(&self) -> StoreResult<()> {
        if self.name.is_empty() || self.name.contains(['/', '\\']) {
            return Err(StoreError::Config(format!(
                "store name {:?} must be a non-empty file name",
                self.name
            )));
        }
        if self.cache.capacity == 0 {
            return Err(StoreError::Config("cache capacity must be > 0".to_string()));
        }
        self.tree.splitter.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compression::CompressionType;
    use crate::splitter::SplitterConfig;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_values() {
        let config = StoreConfig::default();
        assert_eq!(config.name, "objects");
        assert_eq!(config.tree.compression, CompressionType::None);
        assert_eq!(config.cache.capacity, 4096);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_file_toml() {
        let mut file = NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(
            file,
            r#"
dir = "/srv/vault"
name = "main"
algorithm = "ChaCha20Poly1305"

[tree]
compression = "zstd"

[tree.splitter]
type = "fixed_size"
block_size = 4096

[cache]
capacity = 128
"#
        )
        .unwrap();

        let config = StoreConfig::from_file(file.path()).unwrap();
        assert_eq!(config.dir, PathBuf::from("/srv/vault"));
        assert_eq!(config.name, "main");
        assert_eq!(config.algorithm, EncryptionAlgorithm::ChaCha20Poly1305);
        assert_eq!(config.tree.compression, CompressionType::Zstd);
        assert_eq!(
            config.tree.splitter,
            SplitterConfig::FixedSize { block_size: 4096 }
        );
        assert_eq!(config.cache.capacity, 128);
        assert_eq!(config.cache.slack, 256);
    }

    #[test]
    fn test_from_file_json() {
        let mut file = NamedTempFile::with_suffix(".json").unwrap();
        writeln!(
            file,
            r#"{{"name": "json-store", "tree": {{"splitter": {{"type": "rolling", "target": 1024, "min": 256, "max": 8192}}}}}}"#
        )
        .unwrap();

        let config = StoreConfig::from_file(file.path()).unwrap();
        assert_eq!(config.name, "json-store");
        assert_eq!(
            config.tree.splitter,
            SplitterConfig::Rolling { target: 1024, min: 256, max: 8192 }
        );
    }

    #[test]
    fn test_from_file_rejects_unknown_extension() {
        let file = NamedTempFile::with_suffix(".yaml").unwrap();
        assert!(matches!(
            StoreConfig::from_file(file.path()),
            Err(StoreError::Config(_))
        ));
    }

    #[test]
    fn test_invalid_splitter_rejected() {
        let mut file = NamedTempFile::with_suffix(".json").unwrap();
        writeln!(file, r#"{{"tree": {{"splitter": {{"type": "fixed_size", "block_size": 0}}}}}}"#).unwrap();
        assert!(matches!(
            StoreConfig::from_file(file.path()),
            Err(StoreError::Config(_))
        ));
    }

    #[test]
    fn test_bad_name_rejected() {
        let config = StoreConfig {
            name: "a/b".to_string(),
            ..StoreConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
