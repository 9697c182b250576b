//! Engine configuration.
//!
//! Loaded from TOML; every field has a default so an empty file is valid.
//!
//! ```toml
//! root = "/srv/shelf"
//! identity = "xattr"
//! hash_workers = 4
//! segment_size = 1073741824
//! registry_snapshot = "/srv/shelf/registry.log"
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};

/// Default fingerprint segment: 1 GiB.
pub const DEFAULT_SEGMENT_SIZE: u64 = 1 << 30;

/// Where identity records are kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdentityBackend {
    /// Extended attribute on each entry
    Xattr,
    /// Index keyed by device and inode, for filesystems without xattrs
    Sidecar,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Directory holding `drives/<uuid>` roots
    pub root: PathBuf,

    pub identity: IdentityBackend,

    /// Extended attribute carrying the identity blob
    pub xattr_name: String,

    /// Persisted sidecar index (sidecar backend only)
    pub sidecar_path: Option<PathBuf>,

    /// Fingerprint segment size in bytes
    pub segment_size: u64,

    /// Concurrent segment hashes
    pub hash_workers: usize,

    /// Concurrent directory scans
    pub scan_workers: usize,

    /// Rescans attempted when a directory changes while being listed
    pub scan_retry_limit: u32,

    /// Linear backoff unit between scan retries
    pub scan_backoff_ms: u64,

    /// Append-only digest registry snapshot
    pub registry_snapshot: Option<PathBuf>,

    /// Re-hash copied files before publishing them
    pub verify_copies: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            root: PathBuf::from("/srv/shelf"),
            identity: IdentityBackend::Xattr,
            xattr_name: "user.shelf".to_string(),
            sidecar_path: None,
            segment_size: DEFAULT_SEGMENT_SIZE,
            hash_workers: 4,
            scan_workers: 4,
            scan_retry_limit: 3,
            scan_backoff_ms: 50,
            registry_snapshot: None,
            verify_copies: true,
        }
    }
}

impl EngineConfig {
    pub fn from_toml_str(s: &str) -> EngineResult<Self> {
        let config: EngineConfig = toml::from_str(s).map_err(|e| EngineError::Config {
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> EngineResult<Self> {
        let text = fs::read_to_string(path).map_err(|e| EngineError::io(path, e))?;
        Self::from_toml_str(&text)
    }

    /// Configuration for tests and tools: sidecar identities under `root`.
    pub fn sidecar(root: impl Into<PathBuf>) -> Self {
        EngineConfig {
            root: root.into(),
            identity: IdentityBackend::Sidecar,
            ..Default::default()
        }
    }

    pub fn validate(&self) -> EngineResult<()> {
        let fail = |message: &str| {
            Err(EngineError::Config {
                message: message.to_string(),
            })
        };
        if self.segment_size == 0 {
            return fail("segment_size must be positive");
        }
        if self.hash_workers == 0 || self.scan_workers == 0 {
            return fail("worker counts must be positive");
        }
        if self.identity == IdentityBackend::Xattr && !self.xattr_name.starts_with("user.") {
            return fail("xattr_name must live in the user. namespace");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_toml_uses_defaults() {
        let config = EngineConfig::from_toml_str("").expect("empty config should parse");
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.segment_size, 1 << 30);
        assert_eq!(config.hash_workers, 4);
    }

    #[test]
    fn test_toml_overrides() {
        let config = EngineConfig::from_toml_str(
            r#"
            root = "/tmp/shelf"
            identity = "sidecar"
            segment_size = 4096
            scan_retry_limit = 1
            registry_snapshot = "/tmp/shelf/registry.log"
            "#,
        )
        .expect("config should parse");
        assert_eq!(config.root, PathBuf::from("/tmp/shelf"));
        assert_eq!(config.identity, IdentityBackend::Sidecar);
        assert_eq!(config.segment_size, 4096);
        assert_eq!(config.scan_retry_limit, 1);
        assert!(config.registry_snapshot.is_some());
    }

    #[test]
    fn test_invalid_values_rejected() {
        let err = EngineConfig::from_toml_str("segment_size = 0").unwrap_err();
        assert_eq!(err.code(), "ECONFIG");

        let err = EngineConfig::from_toml_str("xattr_name = \"trusted.shelf\"").unwrap_err();
        assert_eq!(err.code(), "ECONFIG");

        let err = EngineConfig::from_toml_str("hash_workers = \"many\"").unwrap_err();
        assert_eq!(err.code(), "ECONFIG");
    }
}
