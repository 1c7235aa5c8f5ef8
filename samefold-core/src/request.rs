//! Scan request contract, as submitted by the transport layer.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SamefoldError};
use crate::fingerprint::{EqualityMode, StructurePolicy};

/// Excludes applied when the request does not override them. The quarantine
/// directory is root-anchored so a folder that happens to be named
/// `.quarantine` deeper in the tree still scans.
pub fn default_excludes() -> Vec<String> {
    [
        ".git/",
        "node_modules/",
        "__pycache__/",
        ".cache/",
        "Thumbs.db",
        ".DS_Store",
        "/.quarantine/",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_similarity_threshold() -> f64 {
    0.80
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanRequest {
    /// Absolute path to scan.
    pub root_path: PathBuf,
    /// If non-empty, only matching files emit.
    #[serde(default)]
    pub include: Vec<String>,
    #[serde(default = "default_excludes")]
    pub exclude: Vec<String>,
    #[serde(default)]
    pub file_equality: EqualityMode,
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f64,
    #[serde(default)]
    pub structure_policy: StructurePolicy,
    #[serde(default)]
    pub force_case_insensitive: bool,
    /// Worker pool size cap; auto when absent.
    #[serde(default)]
    pub concurrency: Option<usize>,
    #[serde(default)]
    pub deletion_enabled: bool,
}

impl ScanRequest {
    pub fn new(root_path: impl Into<PathBuf>) -> Self {
        Self {
            root_path: root_path.into(),
            include: Vec::new(),
            exclude: default_excludes(),
            file_equality: EqualityMode::default(),
            similarity_threshold: default_similarity_threshold(),
            structure_policy: StructurePolicy::default(),
            force_case_insensitive: false,
            concurrency: None,
            deletion_enabled: false,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.root_path.as_os_str().is_empty() {
            return Err(SamefoldError::InvalidRequest(
                "root_path must not be empty".to_string(),
            ));
        }
        if !self.root_path.is_absolute() {
            return Err(SamefoldError::InvalidRequest(
                "root_path must be absolute".to_string(),
            ));
        }
        if !(self.similarity_threshold > 0.0 && self.similarity_threshold <= 1.0) {
            return Err(SamefoldError::InvalidRequest(format!(
                "similarity_threshold must be in (0, 1], got {}",
                self.similarity_threshold
            )));
        }
        if self.concurrency == Some(0) {
            return Err(SamefoldError::InvalidRequest(
                "concurrency must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_contract() {
        let request = ScanRequest::new("/data");
        assert_eq!(request.file_equality, EqualityMode::NameSize);
        assert_eq!(request.structure_policy, StructurePolicy::Relative);
        assert_eq!(request.similarity_threshold, 0.80);
        assert!(!request.deletion_enabled);
        assert!(request.exclude.contains(&".git/".to_string()));
    }

    #[test]
    fn test_deserialize_fills_defaults() {
        let request: ScanRequest =
            serde_json::from_str(r#"{"root_path": "/data"}"#).unwrap();
        assert_eq!(request.similarity_threshold, 0.80);
        assert!(request.exclude.contains(&"/.quarantine/".to_string()));
    }

    #[test]
    fn test_validate_rejects_bad_threshold() {
        let mut request = ScanRequest::new("/data");
        request.similarity_threshold = 0.0;
        assert!(request.validate().is_err());
        request.similarity_threshold = 1.5;
        assert!(request.validate().is_err());
        request.similarity_threshold = 1.0;
        assert!(request.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_relative_root() {
        let request = ScanRequest::new("relative/path");
        assert!(request.validate().is_err());
    }
}
