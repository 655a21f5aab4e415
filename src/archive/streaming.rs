use std::collections::{BTreeSet, HashMap};
use std::io::Read;
use std::path::Path;
use tracing::debug;

use super::{
    normalize_entry_name, read_limited, write_entry, ArchiveReader, ArchiveSource,
    ContainerFormat, Extraction, CONTROL_ENTRY_LIMIT,
};
use crate::error::{Error, FileFailure, Result};
use crate::pool::WorkerPool;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamCompression {
    None,
    Gzip,
    Zstd,
}

/// Tar backend. There is no central index, so opening makes one full pass
/// to list entries, and every later read or extraction reopens the source
/// and makes another.
pub struct StreamingArchive {
    source: ArchiveSource,
    compression: StreamCompression,
    entries: Vec<String>,
}

impl StreamingArchive {
    pub fn open(source: ArchiveSource, compression: StreamCompression) -> Result<Self> {
        let mut archive = Self {
            source,
            compression,
            entries: Vec::new(),
        };
        let mut entries = Vec::new();
        archive.each_file(|name, _, _| {
            entries.push(name);
            Ok(())
        })?;
        debug!(entries = entries.len(), ?compression, "indexed tar archive");
        archive.entries = entries;
        Ok(archive)
    }

    fn reader(&self) -> Result<Box<dyn Read>> {
        let raw = self.source.open()?;
        Ok(match self.compression {
            StreamCompression::None => Box::new(raw),
            StreamCompression::Gzip => Box::new(flate2::read::GzDecoder::new(raw)),
            StreamCompression::Zstd => Box::new(
                zstd::stream::read::Decoder::new(raw)
                    .map_err(|e| Error::io(self.source.label(), e))?,
            ),
        })
    }

    /// One sequential pass over every regular-file entry. An error from the
    /// visitor aborts the pass; a damaged stream is a format error.
    fn each_file(
        &self,
        mut visit: impl FnMut(String, u64, &mut dyn Read) -> Result<()>,
    ) -> Result<()> {
        let mut archive = tar::Archive::new(self.reader()?);
        let entries = archive.entries().map_err(|e| self.format_error(e))?;
        for entry in entries {
            let mut entry = entry.map_err(|e| self.format_error(e))?;
            if !entry.header().entry_type().is_file() {
                continue;
            }
            let name = {
                let path = entry.path().map_err(|e| self.format_error(e))?;
                normalize_entry_name(&path.to_string_lossy())
            };
            let size = entry.size();
            visit(name, size, &mut entry)?;
        }
        Ok(())
    }

    fn format_error(&self, e: std::io::Error) -> Error {
        Error::archive_format(format!("{}: {e}", self.source.label().display()))
    }
}

impl ArchiveReader for StreamingArchive {
    fn format(&self) -> ContainerFormat {
        ContainerFormat::Tar(self.compression)
    }

    fn entries(&self) -> &[String] {
        &self.entries
    }

    fn read_entries(&mut self, names: &BTreeSet<String>) -> Result<HashMap<String, Vec<u8>>> {
        let mut out = HashMap::new();
        if !names.iter().any(|n| self.contains(n)) {
            return Ok(out);
        }
        self.each_file(|name, _, reader| {
            if names.contains(&name) {
                let data = read_limited(&name, reader, CONTROL_ENTRY_LIMIT)?;
                out.insert(name, data);
            }
            Ok(())
        })?;
        Ok(out)
    }

    /// Sequential by nature: the pool is not used. A stream that breaks
    /// mid-way fails every requested entry not yet written.
    fn extract(
        &mut self,
        names: &BTreeSet<String>,
        dest: &Path,
        _pool: &WorkerPool,
    ) -> Result<Extraction> {
        let mut extraction = Extraction::default();
        let mut pending: BTreeSet<String> = names.clone();

        let pass = self.each_file(|name, size, reader| {
            if pending.remove(&name) {
                let outcome = write_entry(dest, &name, reader, Some(size));
                extraction.record(name, outcome);
            }
            Ok(())
        });

        let reason = match &pass {
            Ok(()) => None,
            Err(e) => Some(e.to_string()),
        };
        for name in pending {
            let error = match &reason {
                Some(reason) => Error::extraction(&name, reason),
                None => Error::MissingEntry(name.clone()),
            };
            extraction.failures.push(FileFailure::new(name, error));
        }
        Ok(extraction)
    }
}

#[cfg(test)]
mod tests {
    use super::super::testutil::{tar_bytes, tar_gz_bytes};
    use super::*;

    #[test]
    fn index_pass_then_reopen_for_extraction() {
        let bytes = tar_gz_bytes(&[("a/one.txt", b"1"), ("a/two.txt", b"2")]);
        let mut archive = StreamingArchive::open(bytes.into(), StreamCompression::Gzip).unwrap();
        assert_eq!(archive.entries(), &["a/one.txt", "a/two.txt"]);

        let pool = WorkerPool::new(1).unwrap();
        let dir = tempfile::tempdir().unwrap();
        for name in ["a/two.txt", "a/one.txt"] {
            let wanted: BTreeSet<String> = [name.to_string()].into();
            let result = archive.extract(&wanted, dir.path(), &pool).unwrap();
            assert_eq!(result.extracted, vec![name.to_string()]);
        }
        assert_eq!(std::fs::read(dir.path().join("a/one.txt")).unwrap(), b"1");
        assert_eq!(std::fs::read(dir.path().join("a/two.txt")).unwrap(), b"2");
    }

    #[test]
    fn truncated_stream_fails_pending_entries() {
        let full = tar_bytes(&[("first.bin", &[7u8; 600]), ("second.bin", &[9u8; 600])]);
        let source: ArchiveSource = full.clone().into();
        let mut archive = StreamingArchive::open(source, StreamCompression::None).unwrap();

        // Swap in a copy that stops inside the second entry's data.
        archive.source = full[..1024 + 512 + 100].to_vec().into();

        let pool = WorkerPool::new(1).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let wanted: BTreeSet<String> = archive.entries().iter().cloned().collect();
        let result = archive.extract(&wanted, dir.path(), &pool).unwrap();

        assert_eq!(result.extracted, vec!["first.bin".to_string()]);
        assert_eq!(result.failures.len(), 1);
        assert_eq!(result.failures[0].path, "second.bin");
    }

    #[test]
    fn read_entries_skips_pass_when_nothing_matches() {
        let bytes = tar_bytes(&[("x.txt", b"x")]);
        let mut archive = StreamingArchive::open(bytes.into(), StreamCompression::None).unwrap();
        let wanted: BTreeSet<String> = ["hdiffmap.json".to_string()].into();
        assert!(archive.read_entries(&wanted).unwrap().is_empty());
    }
}
