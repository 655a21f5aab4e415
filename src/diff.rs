//! Binary-diff application with backup/rollback.

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::util;

/// Something that can rebuild `new_file` from `old_file` and a patch.
///
/// The production implementation shells out to `hpatchz`; tests plug in an
/// in-process stand-in.
pub trait DiffTool: Send + Sync {
    fn patch(&self, old_file: &Path, patch_file: &Path, new_file: &Path) -> Result<()>;
}

/// The HDiffPatch command line patcher.
#[derive(Debug, Clone)]
pub struct Hpatchz {
    program: PathBuf,
}

impl Hpatchz {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl DiffTool for Hpatchz {
    /// `hpatchz -f <old> <patch> <new>`; success is exit code zero and the
    /// new file existing afterwards.
    fn patch(&self, old_file: &Path, patch_file: &Path, new_file: &Path) -> Result<()> {
        let output = Command::new(&self.program)
            .arg("-f")
            .arg(old_file)
            .arg(patch_file)
            .arg(new_file)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => Error::DiffToolNotFound(self.program.clone()),
                _ => Error::io(&self.program, e),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::DiffTool {
                path: new_file.to_path_buf(),
                reason: format!("{} ({})", output.status, stderr.trim()),
            });
        }
        if !new_file.exists() {
            return Err(Error::DiffTool {
                path: new_file.to_path_buf(),
                reason: "tool exited successfully but produced no output".into(),
            });
        }
        Ok(())
    }
}

/// Independent way of producing a correct target file, e.g. a re-download.
pub type RepairFallback<'a> = &'a (dyn Fn(&Path) -> Result<()> + Sync);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchOutcome {
    /// The diff tool produced the target.
    Patched,
    /// The original was not on disk; nothing was touched.
    Skipped,
    /// The diff tool failed and the fallback produced the target.
    Repaired,
    /// Both the diff tool and the fallback failed. The old bytes were put
    /// back under the target name for the game's own updater to fix.
    Unverified,
}

/// Applies one patch to one file.
///
/// Backup discipline: the original is renamed to `<original>.bak` before the
/// tool runs. On success the backup is deleted; on failure it is renamed back
/// to the target name. The patch file is deleted whatever the outcome.
pub struct DiffApplier<'a> {
    tool: &'a dyn DiffTool,
}

impl<'a> DiffApplier<'a> {
    pub fn new(tool: &'a dyn DiffTool) -> Self {
        Self { tool }
    }

    pub fn apply(
        &self,
        original: &Path,
        target: &Path,
        patch_file: &Path,
        fallback: Option<RepairFallback<'_>>,
    ) -> Result<PatchOutcome> {
        let outcome = self.apply_inner(original, target, patch_file, fallback);
        if let Err(e) = util::remove_file_if_exists(patch_file) {
            warn!(patch = %patch_file.display(), error = %e, "failed to delete consumed patch");
        }
        outcome
    }

    fn apply_inner(
        &self,
        original: &Path,
        target: &Path,
        patch_file: &Path,
        fallback: Option<RepairFallback<'_>>,
    ) -> Result<PatchOutcome> {
        if !original.is_file() {
            debug!(file = %original.display(), "original missing, skipping patch");
            return Ok(PatchOutcome::Skipped);
        }

        let backup = util::backup_path(original);
        util::rename(original, &backup)?;
        util::ensure_parent(target)?;

        let failure = match self.tool.patch(&backup, patch_file, target) {
            Ok(()) => {
                util::remove_file_if_exists(&backup)?;
                debug!(file = %target.display(), "patched");
                return Ok(PatchOutcome::Patched);
            }
            Err(e) => e,
        };
        warn!(file = %target.display(), error = %failure, "patch failed");

        let Some(fallback) = fallback else {
            util::restore_backup(&backup, target)?;
            return Err(failure);
        };

        // Partial tool output must not be mistaken for a file worth backing up.
        util::remove_file_if_exists(target)?;
        match fallback(target) {
            Ok(()) if target.is_file() => {
                util::remove_file_if_exists(&backup)?;
                Ok(PatchOutcome::Repaired)
            }
            result => {
                if let Err(e) = result {
                    warn!(file = %target.display(), error = %e, "repair fallback failed");
                }
                util::restore_backup(&backup, target)?;
                warn!(
                    file = %target.display(),
                    "left previous version in place; file is unverified"
                );
                Ok(PatchOutcome::Unverified)
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;

    /// Patch format understood by [`FakeDiffTool`]: `APPEND:<bytes>` appends
    /// to the old content, `FAIL` makes the tool fail.
    pub struct FakeDiffTool;

    impl DiffTool for FakeDiffTool {
        fn patch(&self, old_file: &Path, patch_file: &Path, new_file: &Path) -> Result<()> {
            let patch = std::fs::read(patch_file).map_err(|e| Error::io(patch_file, e))?;
            let Some(suffix) = patch.strip_prefix(b"APPEND:") else {
                return Err(Error::DiffTool {
                    path: new_file.to_path_buf(),
                    reason: "unsupported patch".into(),
                });
            };
            let mut data = std::fs::read(old_file).map_err(|e| Error::io(old_file, e))?;
            data.extend_from_slice(suffix);
            std::fs::write(new_file, data).map_err(|e| Error::io(new_file, e))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testutil::FakeDiffTool;
    use super::*;

    struct Fixture {
        _dir: tempfile::TempDir,
        file: PathBuf,
        patch: PathBuf,
    }

    fn fixture(original: &[u8], patch: &[u8]) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.bin");
        let patch_path = dir.path().join("a.bin.hdiff");
        std::fs::write(&file, original).unwrap();
        std::fs::write(&patch_path, patch).unwrap();
        Fixture {
            _dir: dir,
            file,
            patch: patch_path,
        }
    }

    fn exactly_one_of(path: &Path) -> bool {
        path.exists() != util::backup_path(path).exists()
    }

    #[test]
    fn successful_patch_commits_and_cleans_up() {
        let fx = fixture(b"v1", b"APPEND:+v2");
        let outcome = DiffApplier::new(&FakeDiffTool)
            .apply(&fx.file, &fx.file, &fx.patch, None)
            .unwrap();
        assert_eq!(outcome, PatchOutcome::Patched);
        assert_eq!(std::fs::read(&fx.file).unwrap(), b"v1+v2");
        assert!(!fx.patch.exists());
        assert!(exactly_one_of(&fx.file));
    }

    #[test]
    fn patching_is_deterministic() {
        let a = fixture(b"same", b"APPEND:tail");
        let b = fixture(b"same", b"APPEND:tail");
        let applier = DiffApplier::new(&FakeDiffTool);
        applier.apply(&a.file, &a.file, &a.patch, None).unwrap();
        applier.apply(&b.file, &b.file, &b.patch, None).unwrap();
        assert_eq!(std::fs::read(&a.file).unwrap(), std::fs::read(&b.file).unwrap());
    }

    #[test]
    fn failure_without_fallback_restores_and_reports() {
        let fx = fixture(b"v1", b"FAIL");
        let err = DiffApplier::new(&FakeDiffTool)
            .apply(&fx.file, &fx.file, &fx.patch, None)
            .unwrap_err();
        assert!(matches!(err, Error::DiffTool { .. }));
        assert_eq!(std::fs::read(&fx.file).unwrap(), b"v1");
        assert!(!fx.patch.exists());
        assert!(exactly_one_of(&fx.file));
    }

    #[test]
    fn fallback_success_counts_as_repaired() {
        let fx = fixture(b"v1", b"FAIL");
        let fallback = |path: &Path| -> Result<()> {
            std::fs::write(path, b"downloaded").map_err(|e| Error::io(path, e))
        };
        let outcome = DiffApplier::new(&FakeDiffTool)
            .apply(&fx.file, &fx.file, &fx.patch, Some(&fallback))
            .unwrap();
        assert_eq!(outcome, PatchOutcome::Repaired);
        assert_eq!(std::fs::read(&fx.file).unwrap(), b"downloaded");
        assert!(exactly_one_of(&fx.file));
    }

    #[test]
    fn fallback_failure_leaves_old_bytes_under_target_name() {
        let dir = tempfile::tempdir().unwrap();
        let original = dir.path().join("old_name.bin");
        let target = dir.path().join("new_name.bin");
        let patch = dir.path().join("new_name.bin.hdiff");
        std::fs::write(&original, b"v1").unwrap();
        std::fs::write(&patch, b"FAIL").unwrap();

        let fallback =
            |_: &Path| -> Result<()> { Err(Error::http("http://mirror/x", "connection refused")) };
        let outcome = DiffApplier::new(&FakeDiffTool)
            .apply(&original, &target, &patch, Some(&fallback))
            .unwrap();

        assert_eq!(outcome, PatchOutcome::Unverified);
        assert_eq!(std::fs::read(&target).unwrap(), b"v1");
        assert!(!original.exists());
        assert!(exactly_one_of(&target));
        assert!(!util::backup_path(&original).exists());
        assert!(!patch.exists());
    }

    #[test]
    fn missing_original_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("absent.bin");
        let patch = dir.path().join("absent.bin.hdiff");
        std::fs::write(&patch, b"APPEND:x").unwrap();

        let outcome = DiffApplier::new(&FakeDiffTool)
            .apply(&file, &file, &patch, None)
            .unwrap();
        assert_eq!(outcome, PatchOutcome::Skipped);
        assert!(!file.exists());
        assert!(!patch.exists());
    }

    #[test]
    fn missing_executable_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let tool = Hpatchz::new(dir.path().join("no-such-hpatchz"));
        let err = tool
            .patch(
                &dir.path().join("a"),
                &dir.path().join("b"),
                &dir.path().join("c"),
            )
            .unwrap_err();
        assert!(matches!(err, Error::DiffToolNotFound(_)));
    }

    #[cfg(unix)]
    fn script(dir: &Path, name: &str, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    // One test drives every script so no other test thread forks while a
    // script is still open for writing.
    #[cfg(unix)]
    #[test]
    fn hpatchz_process_contract() {
        let dir = tempfile::tempdir().unwrap();
        // $1 is -f; concatenate old and patch into new.
        let concat = Hpatchz::new(script(dir.path(), "concat", r#"cat "$2" "$3" > "$4""#));
        let broken = Hpatchz::new(script(dir.path(), "broken", "echo broken >&2; exit 3"));
        let silent = Hpatchz::new(script(dir.path(), "silent", "exit 0"));

        let fx = fixture(b"old-", b"patch");
        let outcome = DiffApplier::new(&concat)
            .apply(&fx.file, &fx.file, &fx.patch, None)
            .unwrap();
        assert_eq!(outcome, PatchOutcome::Patched);
        assert_eq!(std::fs::read(&fx.file).unwrap(), b"old-patch");

        let fx = fixture(b"v1", b"whatever");
        let err = DiffApplier::new(&broken)
            .apply(&fx.file, &fx.file, &fx.patch, None)
            .unwrap_err();
        assert!(matches!(&err, Error::DiffTool { reason, .. } if reason.contains("broken")));
        assert_eq!(std::fs::read(&fx.file).unwrap(), b"v1");

        let fx = fixture(b"v1", b"whatever");
        let dest = dir.path().join("out.bin");
        let err = silent.patch(&fx.file, &fx.patch, &dest).unwrap_err();
        assert!(matches!(err, Error::DiffTool { .. }));
    }
}
