/*
 * Amapiano Host - Real-time Plugin Host
 * Copyright (c) 2025 MACHIKO LAB
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 */

//! Artifact sources
//!
//! Where plugin artifacts (`downloadUrl`) are fetched from.

use std::path::{Component, Path, PathBuf};

use dashmap::DashMap;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SourceError {
    #[error("Artifact not found: {location}")]
    NotFound { location: String },

    #[error("Artifact location rejected: {location} ({reason})")]
    Rejected { location: String, reason: String },

    #[error("Failed to read {location}: {reason}")]
    Io { location: String, reason: String },
}

/// Fetches plugin artifacts by location.
pub trait ArtifactSource: Send + Sync {
    fn fetch(&self, location: &str) -> Result<Vec<u8>, SourceError>;

    /// Filesystem path of the artifact, for loaders that need one.
    fn local_path(&self, location: &str) -> Option<PathBuf>;
}

/// Artifacts under a root directory.
///
/// Accepts plain relative paths and `file://` locations. Locations that climb out of
/// the root are rejected.
#[derive(Debug, Clone)]
pub struct FileSource {
    root: PathBuf,
}

impl FileSource {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, location: &str) -> Result<PathBuf, SourceError> {
        let raw = location.strip_prefix("file://").unwrap_or(location);
        if raw.contains("://") {
            return Err(SourceError::Rejected {
                location: location.to_string(),
                reason: "only local artifacts are supported".to_string(),
            });
        }
        let path = Path::new(raw);
        if path.components().any(|component| matches!(component, Component::ParentDir)) {
            return Err(SourceError::Rejected {
                location: location.to_string(),
                reason: "path traversal".to_string(),
            });
        }
        if path.is_absolute() {
            if !path.starts_with(&self.root) {
                return Err(SourceError::Rejected {
                    location: location.to_string(),
                    reason: format!("outside of {}", self.root.display()),
                });
            }
            return Ok(path.to_path_buf());
        }
        Ok(self.root.join(path))
    }
}

impl ArtifactSource for FileSource {
    fn fetch(&self, location: &str) -> Result<Vec<u8>, SourceError> {
        let path = self.resolve(location)?;
        std::fs::read(&path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => SourceError::NotFound {
                location: location.to_string(),
            },
            _ => SourceError::Io {
                location: location.to_string(),
                reason: e.to_string(),
            },
        })
    }

    fn local_path(&self, location: &str) -> Option<PathBuf> {
        self.resolve(location).ok().filter(|path| path.is_file())
    }
}

/// In-memory artifacts, for embedded plugins and tests.
#[derive(Debug, Default)]
pub struct MemorySource {
    artifacts: DashMap<String, Vec<u8>>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, location: &str, bytes: impl Into<Vec<u8>>) {
        self.artifacts.insert(location.to_string(), bytes.into());
    }

    pub fn with_artifact(self, location: &str, bytes: impl Into<Vec<u8>>) -> Self {
        self.insert(location, bytes);
        self
    }
}

impl ArtifactSource for MemorySource {
    fn fetch(&self, location: &str) -> Result<Vec<u8>, SourceError> {
        self.artifacts
            .get(location)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| SourceError::NotFound {
                location: location.to_string(),
            })
    }

    fn local_path(&self, _location: &str) -> Option<PathBuf> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_file_source_reads_relative_and_file_urls() {
        let dir = tempdir().unwrap();
        std::fs::create_dir(dir.path().join("eq")).unwrap();
        std::fs::write(dir.path().join("eq/plugin.toml"), b"hello").unwrap();

        let source = FileSource::new(dir.path());
        assert_eq!(source.fetch("eq/plugin.toml").unwrap(), b"hello");
        assert_eq!(source.fetch("file://eq/plugin.toml").unwrap(), b"hello");
        assert_eq!(source.local_path("eq/plugin.toml"), Some(dir.path().join("eq/plugin.toml")));
        assert_eq!(source.local_path("eq/missing.toml"), None);
    }

    #[test]
    fn test_file_source_rejections() {
        let dir = tempdir().unwrap();
        let source = FileSource::new(dir.path());
        assert!(matches!(source.fetch("../secret"), Err(SourceError::Rejected { .. })));
        assert!(matches!(source.fetch("eq/../../secret"), Err(SourceError::Rejected { .. })));
        assert!(matches!(source.fetch("/etc/passwd"), Err(SourceError::Rejected { .. })));
        assert!(matches!(
            source.fetch("https://plugins.example.com/eq.wasm"),
            Err(SourceError::Rejected { .. })
        ));
        assert!(matches!(source.fetch("missing.toml"), Err(SourceError::NotFound { .. })));
    }

    #[test]
    fn test_memory_source() {
        let source = MemorySource::new().with_artifact("builtin/eq", "data");
        assert_eq!(source.fetch("builtin/eq").unwrap(), b"data");
        assert!(source.local_path("builtin/eq").is_none());
        assert!(matches!(source.fetch("builtin/none"), Err(SourceError::NotFound { .. })));
    }
}
