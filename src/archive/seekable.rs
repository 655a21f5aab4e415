use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use tracing::debug;
use zip::result::ZipError;
use zip::ZipArchive;

use super::{
    normalize_entry_name, read_limited, write_entry, ArchiveReader, ArchiveSource,
    ContainerFormat, EntryWrite, Extraction, ReadSeek, CONTROL_ENTRY_LIMIT,
};
use crate::error::{Error, Result};
use crate::pool::WorkerPool;

type Zip = ZipArchive<Box<dyn ReadSeek>>;

/// Zip backend: entries are reachable directly through the central directory.
pub struct SeekableArchive {
    source: ArchiveSource,
    archive: Zip,
    entries: Vec<String>,
    /// Normalized name -> name as stored in the container.
    raw_names: HashMap<String, String>,
}

impl SeekableArchive {
    pub fn open(source: ArchiveSource) -> Result<Self> {
        let archive = open_zip(&source)?;
        let mut entries = Vec::new();
        let mut raw_names = HashMap::new();
        for raw in archive.file_names() {
            if raw.ends_with('/') {
                continue;
            }
            let name = normalize_entry_name(raw);
            raw_names.insert(name.clone(), raw.to_string());
            entries.push(name);
        }

        debug!(entries = entries.len(), "opened zip archive");
        Ok(Self {
            source,
            archive,
            entries,
            raw_names,
        })
    }
}

fn open_zip(source: &ArchiveSource) -> Result<Zip> {
    ZipArchive::new(source.open()?).map_err(|e| {
        Error::archive_format(format!("{}: {e}", source.label().display()))
    })
}

fn extract_one(archive: &mut Zip, raw: &str, name: &str, dest: &Path) -> Result<EntryWrite> {
    let mut file = archive.by_name(raw).map_err(|e| match e {
        ZipError::FileNotFound => Error::MissingEntry(name.to_string()),
        other => Error::extraction(name, other),
    })?;
    let declared = file.size();
    write_entry(dest, name, &mut file, Some(declared))
}

impl ArchiveReader for SeekableArchive {
    fn format(&self) -> ContainerFormat {
        ContainerFormat::Zip
    }

    fn entries(&self) -> &[String] {
        &self.entries
    }

    fn read_entries(&mut self, names: &BTreeSet<String>) -> Result<HashMap<String, Vec<u8>>> {
        let mut out = HashMap::new();
        for name in names {
            let Some(raw) = self.raw_names.get(name) else {
                continue;
            };
            let mut file = self
                .archive
                .by_name(raw)
                .map_err(|e| Error::archive_format(format!("{name}: {e}")))?;
            let data = read_limited(name, &mut file, CONTROL_ENTRY_LIMIT)?;
            out.insert(name.clone(), data);
        }
        Ok(out)
    }

    /// Entries are spread over the pool; each worker opens its own handle.
    fn extract(
        &mut self,
        names: &BTreeSet<String>,
        dest: &Path,
        pool: &WorkerPool,
    ) -> Result<Extraction> {
        let jobs: Vec<(String, Option<String>)> = names
            .iter()
            .map(|name| (name.clone(), self.raw_names.get(name).cloned()))
            .collect();
        let source = &self.source;

        let outcomes = pool.run_batch_with(
            jobs,
            || open_zip(source),
            |handle, (name, raw)| {
                let outcome = match (handle, raw) {
                    (_, None) => Err(Error::MissingEntry(name.clone())),
                    (Ok(archive), Some(raw)) => extract_one(archive, &raw, &name, dest),
                    (Err(e), _) => Err(Error::extraction(&name, e)),
                };
                (name, outcome)
            },
        );

        let mut extraction = Extraction::default();
        for (name, outcome) in outcomes {
            extraction.record(name, outcome);
        }
        Ok(extraction)
    }
}

#[cfg(test)]
mod tests {
    use super::super::testutil::zip_bytes;
    use super::*;

    #[test]
    fn directory_entries_are_not_listed() {
        use std::io::Write;
        let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
        let options = zip::write::SimpleFileOptions::default();
        writer.add_directory("Data/", options).unwrap();
        writer.start_file("Data/file.bin", options).unwrap();
        writer.write_all(b"x").unwrap();
        let bytes = writer.finish().unwrap().into_inner();

        let archive = SeekableArchive::open(bytes.into()).unwrap();
        assert_eq!(archive.entries(), &["Data/file.bin"]);
    }

    #[test]
    fn traversal_entries_are_refused() {
        let bytes = zip_bytes(&[("../escape.txt", b"evil"), ("ok.txt", b"fine")]);
        let mut archive = SeekableArchive::open(bytes.into()).unwrap();
        let pool = WorkerPool::new(2).unwrap();

        let parent = tempfile::tempdir().unwrap();
        let dest = parent.path().join("install");
        std::fs::create_dir(&dest).unwrap();

        let names: BTreeSet<String> = archive.entries().iter().cloned().collect();
        let result = archive.extract(&names, &dest, &pool).unwrap();
        assert_eq!(result.extracted, vec!["ok.txt".to_string()]);
        assert_eq!(result.refused, vec!["../escape.txt".to_string()]);
        assert!(!parent.path().join("escape.txt").exists());
    }

    #[test]
    fn garbage_after_magic_is_a_format_error() {
        let mut bytes = b"PK\x03\x04".to_vec();
        bytes.extend_from_slice(&[0u8; 64]);
        assert!(matches!(
            SeekableArchive::open(bytes.into()),
            Err(Error::ArchiveFormat(_))
        ));
    }
}
