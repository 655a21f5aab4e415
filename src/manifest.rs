use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::warn;

use crate::error::{Error, Result};

/// Name of the per-installation manifest stored at the install root.
pub const PKG_VERSION: &str = "pkg_version";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestEntry {
    /// Forward-slash separated path relative to the install root.
    pub relative_path: String,
    /// Lowercase hex MD5.
    pub md5: String,
    pub size: u64,
}

#[derive(Debug, Deserialize)]
struct PkgVersionLine {
    #[serde(rename = "remoteName")]
    remote_name: String,
    md5: String,
    #[serde(rename = "fileSize")]
    file_size: u64,
}

/// Declared files of an installation, keyed by relative path.
#[derive(Debug, Clone, Default)]
pub struct Manifest {
    entries: BTreeMap<String, ManifestEntry>,
}

impl Manifest {
    /// Parse newline-delimited JSON. Blank lines are ignored; a later
    /// duplicate of a path replaces the earlier one.
    pub fn parse(raw: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(raw).map_err(|e| Error::Manifest {
            line: 0,
            reason: format!("not UTF-8: {e}"),
        })?;

        let mut entries = BTreeMap::new();
        for (index, line) in text.split('\n').enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let parsed: PkgVersionLine =
                serde_json::from_str(line).map_err(|e| Error::Manifest {
                    line: index + 1,
                    reason: e.to_string(),
                })?;
            let entry = ManifestEntry {
                relative_path: parsed.remote_name.replace('\\', "/"),
                md5: parsed.md5.to_ascii_lowercase(),
                size: parsed.file_size,
            };
            if let Some(previous) = entries.insert(entry.relative_path.clone(), entry) {
                warn!(path = %previous.relative_path, "duplicate manifest entry, keeping the last one");
            }
        }
        Ok(Self { entries })
    }

    /// Load `pkg_version` from the install root. `Ok(None)` when the file is absent.
    pub fn load(install_root: &Path) -> Result<Option<Self>> {
        let path = install_root.join(PKG_VERSION);
        match std::fs::read(&path) {
            Ok(raw) => Self::parse(&raw).map(Some),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::io(path, e)),
        }
    }

    pub fn get(&self, relative_path: &str) -> Option<&ManifestEntry> {
        self.entries.get(relative_path)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ManifestEntry> {
        self.entries.values()
    }
}

impl FromIterator<ManifestEntry> for Manifest {
    fn from_iter<I: IntoIterator<Item = ManifestEntry>>(iter: I) -> Self {
        Self {
            entries: iter
                .into_iter()
                .map(|e| (e.relative_path.clone(), e))
                .collect(),
        }
    }
}
