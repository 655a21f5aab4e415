//! Uniform view over update and install archives.
//!
//! Two backends sit behind [`ArchiveReader`]: a seekable one for zip
//! containers, where any entry can be reached through the central directory,
//! and a streaming one for tar containers (optionally gzip or zstd
//! compressed), which needs one pass to build the index and another pass to
//! extract. [`open_archive`] sniffs the container and picks the backend.

mod seekable;
mod streaming;

pub use seekable::SeekableArchive;
pub use streaming::{StreamCompression, StreamingArchive};

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::io::{Cursor, Read, Seek, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{Error, FileFailure, Result};
use crate::pool::WorkerPool;

pub trait ReadSeek: Read + Seek + Send {}
impl<T: Read + Seek + Send> ReadSeek for T {}

/// Where the archive bytes live. Both variants can be reopened, which the
/// streaming backend needs for its second pass and the seekable backend uses
/// to hand each worker its own handle.
#[derive(Clone)]
pub enum ArchiveSource {
    File(PathBuf),
    Memory(Arc<[u8]>),
}

impl ArchiveSource {
    pub fn open(&self) -> Result<Box<dyn ReadSeek>> {
        match self {
            Self::File(path) => {
                let file = std::fs::File::open(path).map_err(|e| Error::io(path, e))?;
                Ok(Box::new(std::io::BufReader::new(file)))
            }
            Self::Memory(bytes) => Ok(Box::new(Cursor::new(Arc::clone(bytes)))),
        }
    }

    pub fn label(&self) -> PathBuf {
        match self {
            Self::File(path) => path.clone(),
            Self::Memory(_) => PathBuf::from("<memory>"),
        }
    }
}

impl fmt::Debug for ArchiveSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::File(path) => f.debug_tuple("File").field(path).finish(),
            Self::Memory(bytes) => write!(f, "Memory({} bytes)", bytes.len()),
        }
    }
}

impl From<PathBuf> for ArchiveSource {
    fn from(path: PathBuf) -> Self {
        Self::File(path)
    }
}

impl From<&Path> for ArchiveSource {
    fn from(path: &Path) -> Self {
        Self::File(path.to_path_buf())
    }
}

impl From<Vec<u8>> for ArchiveSource {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Memory(bytes.into())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerFormat {
    Zip,
    Tar(StreamCompression),
}

/// Identify the container from its leading bytes.
pub fn sniff_format(source: &ArchiveSource) -> Result<ContainerFormat> {
    let mut reader = source.open()?;
    let mut head = Vec::with_capacity(512);
    reader
        .by_ref()
        .take(512)
        .read_to_end(&mut head)
        .map_err(|e| Error::io(source.label(), e))?;

    let format = if head.starts_with(b"PK\x03\x04") || head.starts_with(b"PK\x05\x06") {
        ContainerFormat::Zip
    } else if head.starts_with(&[0x1f, 0x8b]) {
        ContainerFormat::Tar(StreamCompression::Gzip)
    } else if head.starts_with(&[0x28, 0xb5, 0x2f, 0xfd]) {
        ContainerFormat::Tar(StreamCompression::Zstd)
    } else if head.len() >= 262 && &head[257..262] == b"ustar" {
        ContainerFormat::Tar(StreamCompression::None)
    } else {
        return Err(Error::UnsupportedContainerFormat {
            path: source.label(),
        });
    };
    Ok(format)
}

/// Outcome of extracting a set of entries.
#[derive(Debug, Default)]
pub struct Extraction {
    pub extracted: Vec<String>,
    /// Entries whose names resolve outside the destination; never written.
    pub refused: Vec<String>,
    pub failures: Vec<FileFailure>,
}

impl Extraction {
    pub(crate) fn record(&mut self, name: String, outcome: Result<EntryWrite>) {
        match outcome {
            Ok(EntryWrite::Written) => self.extracted.push(name),
            Ok(EntryWrite::Refused) => self.refused.push(name),
            Err(error) => self.failures.push(FileFailure::new(name, error)),
        }
    }
}

#[derive(Debug)]
pub(crate) enum EntryWrite {
    Written,
    Refused,
}

/// Capability interface shared by both container backends.
///
/// Callers must not rely on entries being extracted in listing order.
pub trait ArchiveReader: Send {
    fn format(&self) -> ContainerFormat;

    /// Regular-file entries, `/`-separated, in container order.
    fn entries(&self) -> &[String];

    /// Read small entries (control files) fully into memory.
    /// Names that are not in the archive are absent from the result.
    fn read_entries(&mut self, names: &BTreeSet<String>) -> Result<HashMap<String, Vec<u8>>>;

    /// Extract `names` below `dest`, keeping their relative layout.
    fn extract(
        &mut self,
        names: &BTreeSet<String>,
        dest: &Path,
        pool: &WorkerPool,
    ) -> Result<Extraction>;

    fn contains(&self, name: &str) -> bool {
        self.entries().iter().any(|e| e == name)
    }
}

/// Open an archive, choosing the backend from the container's magic bytes.
pub fn open_archive(source: impl Into<ArchiveSource>) -> Result<Box<dyn ArchiveReader>> {
    let source = source.into();
    match sniff_format(&source)? {
        ContainerFormat::Zip => Ok(Box::new(SeekableArchive::open(source)?)),
        ContainerFormat::Tar(compression) => {
            Ok(Box::new(StreamingArchive::open(source, compression)?))
        }
    }
}

/// Upper bound for control entries read into memory.
pub(crate) const CONTROL_ENTRY_LIMIT: u64 = 64 * 1024 * 1024;

/// Read a whole entry into memory, refusing anything above `limit` bytes
/// whatever size the container declares.
pub(crate) fn read_limited(name: &str, reader: &mut dyn Read, limit: u64) -> Result<Vec<u8>> {
    let mut data = Vec::new();
    Read::take(reader, limit.saturating_add(1))
        .read_to_end(&mut data)
        .map_err(|e| Error::archive_format(format!("{name}: {e}")))?;
    if data.len() as u64 > limit {
        return Err(Error::archive_format(format!("{name} is larger than {limit} bytes")));
    }
    Ok(data)
}

/// Copy one entry's bytes to its resolved location below `dest`.
///
/// Bytes go to a sibling `.part` file first, which replaces the destination
/// only once the entry was read completely (`expected_len`, when known), so
/// a broken entry never clobbers the file already installed there.
pub(crate) fn write_entry(
    dest: &Path,
    name: &str,
    reader: &mut dyn Read,
    expected_len: Option<u64>,
) -> Result<EntryWrite> {
    let Some(target) = crate::util::resolve_within(dest, name) else {
        tracing::warn!(entry = name, "refusing archive entry outside destination");
        return Ok(EntryWrite::Refused);
    };
    crate::util::ensure_parent(&target)?;

    let partial = crate::util::partial_path(&target);
    let copied = copy_to(&partial, name, reader).and_then(|written| match expected_len {
        Some(expected) if expected != written => Err(Error::extraction(
            name,
            format!("entry ended after {written} of {expected} bytes"),
        )),
        _ => Ok(()),
    });
    match copied {
        Ok(()) => {
            crate::util::rename(&partial, &target)?;
            Ok(EntryWrite::Written)
        }
        Err(e) => {
            if let Err(cleanup) = crate::util::remove_file_if_exists(&partial) {
                tracing::warn!(entry = name, error = %cleanup, "failed to remove partial entry");
            }
            Err(e)
        }
    }
}

fn copy_to(path: &Path, name: &str, reader: &mut dyn Read) -> Result<u64> {
    let mut out = std::fs::File::create(path).map_err(|e| Error::io(path, e))?;
    let written = std::io::copy(reader, &mut out).map_err(|e| Error::extraction(name, e))?;
    out.flush().map_err(|e| Error::io(path, e))?;
    Ok(written)
}

/// Normalize a container entry name to the `/`-separated form used everywhere else.
pub(crate) fn normalize_entry_name(raw: &str) -> String {
    let name = raw.replace('\\', "/");
    name.strip_prefix("./").unwrap_or(&name).to_string()
}
