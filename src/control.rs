//! Control entries shipped inside update archives.
//!
//! An update archive carries a delete-list and one of two diff-map formats
//! next to its payload. These entries describe how to apply the archive and
//! are never extracted into the installation.

use serde::Deserialize;
use std::collections::{BTreeSet, HashMap};

use crate::error::{Error, Result};

pub const DELETE_LIST: &str = "deletefiles.txt";
/// Line-delimited JSON diff list (source and target share a name).
pub const LEGACY_DIFF_LIST: &str = "hdifffiles.txt";
/// Structured diff map with explicit source/target pairs.
pub const DIFF_MAP: &str = "hdiffmap.json";
pub const PATCH_SUFFIX: &str = ".hdiff";

pub fn control_entry_names() -> BTreeSet<String> {
    [DELETE_LIST, LEGACY_DIFF_LIST, DIFF_MAP]
        .into_iter()
        .map(String::from)
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DiffPair {
    pub source: String,
    pub target: String,
}

impl DiffPair {
    /// Archive entry holding the patch bytes for this pair.
    pub fn patch_entry(&self) -> String {
        format!("{}{PATCH_SUFFIX}", self.target)
    }
}

#[derive(Debug, Deserialize)]
struct LegacyDiffLine {
    #[serde(rename = "remoteName")]
    remote_name: String,
}

#[derive(Debug, Deserialize)]
struct DiffMapFile {
    diff_map: Vec<DiffMapEntry>,
}

#[derive(Debug, Deserialize)]
struct DiffMapEntry {
    source_file_name: String,
    target_file_name: String,
}

/// Parsed plan of an update archive.
#[derive(Debug, Default)]
pub struct ControlPlan {
    pub delete_list: Vec<String>,
    pub diff_map: Vec<DiffPair>,
}

impl ControlPlan {
    /// Build the plan from control entries read out of the archive.
    /// When both diff formats are present, `hdiffmap.json` wins.
    pub fn from_entries(entries: &HashMap<String, Vec<u8>>) -> Result<Self> {
        let delete_list = match entries.get(DELETE_LIST) {
            Some(raw) => parse_delete_list(raw)?,
            None => Vec::new(),
        };
        let diff_map = match (entries.get(DIFF_MAP), entries.get(LEGACY_DIFF_LIST)) {
            (Some(raw), legacy) => {
                if legacy.is_some() {
                    tracing::warn!("archive ships both {DIFF_MAP} and {LEGACY_DIFF_LIST}; using {DIFF_MAP}");
                }
                parse_diff_map(raw)?
            }
            (None, Some(raw)) => parse_legacy_diff_list(raw)?,
            (None, None) => Vec::new(),
        };
        Ok(Self {
            delete_list,
            diff_map,
        })
    }
}

fn as_text<'a>(name: &str, raw: &'a [u8]) -> Result<&'a str> {
    let text = std::str::from_utf8(raw)
        .map_err(|e| Error::archive_format(format!("{name} is not UTF-8: {e}")))?;
    Ok(text.strip_prefix('\u{feff}').unwrap_or(text))
}

/// Lines are CRLF-separated in practice; bare LF is accepted too.
/// Only the line terminator is stripped: spaces may be part of a path.
fn lines(text: &str) -> impl Iterator<Item = (usize, &str)> {
    text.split('\n')
        .map(|line| line.strip_suffix('\r').unwrap_or(line))
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(i, line)| (i + 1, line))
}

pub fn parse_delete_list(raw: &[u8]) -> Result<Vec<String>> {
    let text = as_text(DELETE_LIST, raw)?;
    Ok(lines(text).map(|(_, line)| line.replace('\\', "/")).collect())
}

pub fn parse_legacy_diff_list(raw: &[u8]) -> Result<Vec<DiffPair>> {
    let text = as_text(LEGACY_DIFF_LIST, raw)?;
    lines(text)
        .map(|(number, line)| {
            let parsed: LegacyDiffLine = serde_json::from_str(line).map_err(|e| {
                Error::archive_format(format!("{LEGACY_DIFF_LIST} line {number}: {e}"))
            })?;
            let name = parsed.remote_name.replace('\\', "/");
            Ok(DiffPair {
                source: name.clone(),
                target: name,
            })
        })
        .collect()
}

pub fn parse_diff_map(raw: &[u8]) -> Result<Vec<DiffPair>> {
    let text = as_text(DIFF_MAP, raw)?;
    let parsed: DiffMapFile = serde_json::from_str(text)
        .map_err(|e| Error::archive_format(format!("{DIFF_MAP}: {e}")))?;
    Ok(parsed
        .diff_map
        .into_iter()
        .map(|entry| DiffPair {
            source: entry.source_file_name.replace('\\', "/"),
            target: entry.target_file_name.replace('\\', "/"),
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delete_list_is_crlf_separated() {
        let list = parse_delete_list(b"old.dat\r\nData\\gone.pck\r\n\r\n").unwrap();
        assert_eq!(list, vec!["old.dat", "Data/gone.pck"]);
    }

    #[test]
    fn delete_list_keeps_spaces_inside_paths() {
        let list = parse_delete_list(b" leading.dat\r\nData/trailing.pck \r\n   \r\n").unwrap();
        assert_eq!(list, vec![" leading.dat", "Data/trailing.pck "]);
    }

    #[test]
    fn legacy_list_uses_remote_name_for_both_sides() {
        let raw = b"{\"remoteName\": \"Data/a.bin\"}\r\n{\"remoteName\": \"b.bin\", \"extra\": 1}\r\n";
        let pairs = parse_legacy_diff_list(raw).unwrap();
        assert_eq!(pairs.len(), 2);
        assert_eq!(pairs[0].source, "Data/a.bin");
        assert_eq!(pairs[0].target, "Data/a.bin");
        assert_eq!(pairs[1].patch_entry(), "b.bin.hdiff");
    }

    #[test]
    fn malformed_legacy_line_is_fatal() {
        let err = parse_legacy_diff_list(b"{\"remoteName\": \"a\"}\r\nnot json\r\n").unwrap_err();
        assert!(matches!(err, Error::ArchiveFormat(msg) if msg.contains("line 2")));
    }

    #[test]
    fn structured_map_keeps_distinct_names() {
        let raw = br#"{"diff_map": [{"source_file_name": "old/a.bin", "target_file_name": "new/a.bin"}]}"#;
        let pairs = parse_diff_map(raw).unwrap();
        assert_eq!(
            pairs,
            vec![DiffPair {
                source: "old/a.bin".into(),
                target: "new/a.bin".into()
            }]
        );
        assert_eq!(pairs[0].patch_entry(), "new/a.bin.hdiff");
    }

    #[test]
    fn structured_map_wins_over_legacy() {
        let mut entries = HashMap::new();
        entries.insert(
            DIFF_MAP.to_string(),
            br#"{"diff_map": [{"source_file_name": "x", "target_file_name": "y"}]}"#.to_vec(),
        );
        entries.insert(LEGACY_DIFF_LIST.to_string(), b"{\"remoteName\": \"z\"}".to_vec());
        let plan = ControlPlan::from_entries(&entries).unwrap();
        assert_eq!(plan.diff_map.len(), 1);
        assert_eq!(plan.diff_map[0].target, "y");
        assert!(plan.delete_list.is_empty());
    }

    #[test]
    fn no_control_entries_is_an_empty_plan() {
        let plan = ControlPlan::from_entries(&HashMap::new()).unwrap();
        assert!(plan.delete_list.is_empty());
        assert!(plan.diff_map.is_empty());
    }

    #[test]
    fn bad_diff_map_is_fatal() {
        assert!(matches!(
            parse_diff_map(b"{\"diff_map\": 3}"),
            Err(Error::ArchiveFormat(_))
        ));
    }
}
