//! Error types for update and repair operations

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Result type for update and repair operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while patching or repairing an installation
#[derive(Error, Debug)]
pub enum Error {
    /// The container is neither a zip nor a (compressed) tar stream
    #[error("Unsupported container format: {}", .path.display())]
    UnsupportedContainerFormat { path: PathBuf },

    /// Corrupt container or malformed control entry
    #[error("Invalid archive: {0}")]
    ArchiveFormat(String),

    /// An entry referenced by the archive plan is not in the archive
    #[error("Archive entry not found: {0}")]
    MissingEntry(String),

    /// A single entry could not be extracted
    #[error("Failed to extract {entry}: {reason}")]
    Extraction { entry: String, reason: String },

    /// The external diff tool failed for one file
    #[error("Diff tool failed for {}: {reason}", .path.display())]
    DiffTool { path: PathBuf, reason: String },

    /// The external diff tool could not be started
    #[error("Diff tool executable not found: {}", .0.display())]
    DiffToolNotFound(PathBuf),

    /// Transport-level HTTP failure (connect, read, timeout)
    #[error("HTTP request to {url} failed: {reason}")]
    Http { url: String, reason: String },

    /// Server answered with an unexpected status
    #[error("HTTP {status} from {url}")]
    HttpStatus { url: String, status: u16 },

    /// Content size mismatch
    #[error("Size mismatch: expected {expected} bytes, got {actual} bytes")]
    SizeMismatch { expected: u64, actual: u64 },

    /// Checksum mismatch
    #[error("Checksum mismatch for {}: expected {expected}, got {actual}", .path.display())]
    ChecksumMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    /// Replacing one file from a remote source failed
    #[error("Failed to repair {}: {source}", .path.display())]
    Repair {
        path: PathBuf,
        #[source]
        source: Box<Error>,
    },

    /// Some files of a repair batch could not be repaired
    #[error("{} file(s) could not be repaired: {}", .0.len(), FailureList(.0))]
    AggregateRepair(Vec<FileFailure>),

    /// Some files of an update could not be processed
    #[error("{} file(s) failed during update: {}", .0.len(), FailureList(.0))]
    PartialFailure(Vec<FileFailure>),

    /// The installation has no usable manifest and must be reinstalled
    #[error("Reinstall required: {0}")]
    ReinstallRequired(String),

    /// Malformed pkg_version line
    #[error("Invalid manifest line {line}: {reason}")]
    Manifest { line: usize, reason: String },

    /// I/O error on a specific path
    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Invalid engine configuration
    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl Error {
    /// Wrap an I/O error with the path it happened on
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn archive_format(reason: impl fmt::Display) -> Self {
        Self::ArchiveFormat(reason.to_string())
    }

    pub fn extraction(entry: impl Into<String>, reason: impl fmt::Display) -> Self {
        Self::Extraction {
            entry: entry.into(),
            reason: reason.to_string(),
        }
    }

    pub fn http(url: impl Into<String>, reason: impl fmt::Display) -> Self {
        Self::Http {
            url: url.into(),
            reason: reason.to_string(),
        }
    }

    /// Per-path failures carried by an aggregate error, if any
    pub fn failures(&self) -> &[FileFailure] {
        match self {
            Self::AggregateRepair(failures) | Self::PartialFailure(failures) => failures,
            _ => &[],
        }
    }
}

/// One failed item of a batch, attributed to its relative path
#[derive(Debug)]
pub struct FileFailure {
    pub path: String,
    pub error: Error,
}

impl FileFailure {
    pub fn new(path: impl Into<String>, error: Error) -> Self {
        Self {
            path: path.into(),
            error,
        }
    }
}

impl fmt::Display for FileFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path, self.error)
    }
}

struct FailureList<'a>(&'a [FileFailure]);

impl fmt::Display for FailureList<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, failure) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{failure}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggregate_message_names_every_path() {
        let err = Error::PartialFailure(vec![
            FileFailure::new("a.bin", Error::MissingEntry("a.bin.hdiff".into())),
            FileFailure::new("b.bin", Error::ArchiveFormat("bad".into())),
        ]);
        let msg = err.to_string();
        assert!(msg.starts_with("2 file(s) failed"));
        assert!(msg.contains("a.bin: Archive entry not found"));
        assert!(msg.contains("b.bin: Invalid archive: bad"));
        assert_eq!(err.failures().len(), 2);
    }

    #[test]
    fn non_aggregate_has_no_failures() {
        assert!(Error::Config("x".into()).failures().is_empty());
    }
}
