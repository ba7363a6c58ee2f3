use crate::privileged::{ModeChange, Owner, PrivilegedExecutor, PrivilegedOp};
use crate::RuntimeError;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Where a file or directory must end up, and who must own it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnershipTarget {
    pub path: PathBuf,
    pub owner: Owner,
    pub mode: u32,
}

impl OwnershipTarget {
    pub fn new(path: impl Into<PathBuf>, owner: Owner, mode: u32) -> Self {
        Self {
            path: path.into(),
            owner,
            mode,
        }
    }
}

/// Writes into the service-owned tree, which the installer cannot write
/// directly.
///
/// Content is staged in an owner-only temp file under the installer's own
/// state directory, copied next to the destination with elevated rights,
/// secured (owner, then mode), and finally renamed over the destination.
/// The destination therefore never exists with the wrong owner or mode, and
/// the staged copy is removed on every exit path.
pub struct OwnedFiles<'a> {
    exec: &'a dyn PrivilegedExecutor,
    staging_dir: PathBuf,
}

impl<'a> OwnedFiles<'a> {
    pub fn new(exec: &'a dyn PrivilegedExecutor, staging_dir: impl Into<PathBuf>) -> Self {
        Self {
            exec,
            staging_dir: staging_dir.into(),
        }
    }

    pub fn write_owned_file(
        &self,
        path: &Path,
        content: &[u8],
        mode: u32,
        owner: &Owner,
    ) -> Result<(), RuntimeError> {
        self.write(&OwnershipTarget::new(path, owner.clone(), mode), content)
    }

    pub fn write(&self, target: &OwnershipTarget, content: &[u8]) -> Result<(), RuntimeError> {
        fs::create_dir_all(&self.staging_dir)?;
        // NamedTempFile is created 0600 and unlinked on drop.
        let mut staged = tempfile::Builder::new()
            .prefix(".stage-")
            .tempfile_in(&self.staging_dir)?;
        staged.write_all(content)?;
        staged.as_file().sync_all()?;
        debug!(
            "staged {} bytes for {} at {}",
            content.len(),
            target.path.display(),
            staged.path().display()
        );

        let partial = partial_path(&target.path);
        self.exec.run(&PrivilegedOp::CopyFile {
            from: staged.path().to_path_buf(),
            to: partial.clone(),
        })?;

        let path = &target.path;
        let steps = [
            (
                "chown",
                PrivilegedOp::Chown {
                    path: partial.clone(),
                    owner: target.owner.clone(),
                    recursive: false,
                },
            ),
            (
                "chmod",
                PrivilegedOp::Chmod {
                    path: partial.clone(),
                    mode: ModeChange::Exact(target.mode),
                    recursive: false,
                },
            ),
            (
                "rename",
                PrivilegedOp::MoveFile {
                    from: partial,
                    to: path.clone(),
                },
            ),
        ];
        for (step, op) in steps {
            self.exec
                .run(&op)
                .map_err(|e| RuntimeError::PartialWrite {
                    path: path.display().to_string(),
                    step,
                    source: Box::new(e),
                })?;
        }
        debug!(
            "wrote {} ({}, {:04o})",
            path.display(),
            target.owner,
            target.mode
        );
        Ok(())
    }

    pub fn create_owned_directory(
        &self,
        path: &Path,
        mode: u32,
        owner: &Owner,
    ) -> Result<(), RuntimeError> {
        self.exec.run(&PrivilegedOp::MakeDir {
            path: path.to_path_buf(),
        })?;
        let steps = [
            (
                "chown",
                PrivilegedOp::Chown {
                    path: path.to_path_buf(),
                    owner: owner.clone(),
                    recursive: false,
                },
            ),
            (
                "chmod",
                PrivilegedOp::Chmod {
                    path: path.to_path_buf(),
                    mode: ModeChange::Exact(mode),
                    recursive: false,
                },
            ),
        ];
        for (step, op) in steps {
            self.exec
                .run(&op)
                .map_err(|e| RuntimeError::PartialWrite {
                    path: path.display().to_string(),
                    step,
                    source: Box::new(e),
                })?;
        }
        debug!("ensured directory {} ({owner}, {mode:04o})", path.display());
        Ok(())
    }
}

/// Sibling of `path` used while the new content is being secured.
pub fn partial_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{name}.stackwright-partial"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{ExternalReset, InjectedFailure, SimulatedHost};

    fn host() -> SimulatedHost {
        let host = SimulatedHost::new().with_user("svc", &["svc"]);
        host.seed_dir("/opt/app", "svc", "svc", 0o750);
        host
    }

    fn svc() -> Owner {
        Owner::user("svc").with_group("svc")
    }

    #[test]
    fn writes_with_owner_and_mode() {
        let staging = tempfile::tempdir().unwrap();
        let h = host();
        let files = OwnedFiles::new(&h, staging.path());
        files
            .write_owned_file(Path::new("/opt/app/.env"), b"A=1\n", 0o600, &svc())
            .unwrap();

        let info = h.inspect(Path::new("/opt/app/.env")).unwrap().unwrap();
        assert_eq!(info.owner, "svc");
        assert_eq!(info.group, "svc");
        assert_eq!(info.mode, 0o600);
        assert_eq!(h.file_content("/opt/app/.env").unwrap(), b"A=1\n");
        assert!(!h.exists(partial_path(Path::new("/opt/app/.env"))));
    }

    #[test]
    fn staging_is_cleaned_up() {
        let staging = tempfile::tempdir().unwrap();
        let h = host();
        let files = OwnedFiles::new(&h, staging.path());
        files
            .write_owned_file(Path::new("/opt/app/a"), b"x", 0o640, &svc())
            .unwrap();
        h.fail_next("copy", InjectedFailure::Error("cp: disk full".to_owned()));
        assert!(files
            .write_owned_file(Path::new("/opt/app/b"), b"y", 0o640, &svc())
            .is_err());
        assert_eq!(fs::read_dir(staging.path()).unwrap().count(), 0);
    }

    #[test]
    fn rewrite_repairs_wrong_owner_and_mode() {
        let staging = tempfile::tempdir().unwrap();
        let h = host();
        h.seed_file("/opt/app/config.toml", "root", 0o644, b"old");
        let files = OwnedFiles::new(&h, staging.path());
        files
            .write_owned_file(Path::new("/opt/app/config.toml"), b"new", 0o600, &svc())
            .unwrap();
        let info = h.inspect(Path::new("/opt/app/config.toml")).unwrap().unwrap();
        assert_eq!((info.owner.as_str(), info.mode), ("svc", 0o600));
        assert_eq!(h.file_content("/opt/app/config.toml").unwrap(), b"new");
    }

    #[test]
    fn failure_after_transfer_is_a_partial_write() {
        let staging = tempfile::tempdir().unwrap();
        let h = host();
        h.fail_next("chown", InjectedFailure::Error("chown: I/O error".to_owned()));
        let files = OwnedFiles::new(&h, staging.path());
        let err = files
            .write_owned_file(Path::new("/opt/app/.env"), b"A=1\n", 0o600, &svc())
            .unwrap_err();
        match &err {
            RuntimeError::PartialWrite { path, step, .. } => {
                assert_eq!(path, "/opt/app/.env");
                assert_eq!(*step, "chown");
            }
            other => panic!("expected partial write, got {other:?}"),
        }
        // The destination was never exposed with root ownership.
        assert!(!h.exists("/opt/app/.env"));

        files
            .write_owned_file(Path::new("/opt/app/.env"), b"A=1\n", 0o600, &svc())
            .unwrap();
        assert!(!h.exists(partial_path(Path::new("/opt/app/.env"))));
        assert_eq!(h.paths_under("/opt/app").len(), 2);
    }

    #[test]
    fn denied_transfer_is_not_partial() {
        let staging = tempfile::tempdir().unwrap();
        let h = host();
        h.fail_next("copy", InjectedFailure::Denied);
        let files = OwnedFiles::new(&h, staging.path());
        let err = files
            .write_owned_file(Path::new("/opt/app/.env"), b"", 0o600, &svc())
            .unwrap_err();
        assert!(err.is_elevation_denied());
        assert!(!err.is_partial_write());
    }

    #[test]
    fn directory_creation_is_idempotent() {
        let staging = tempfile::tempdir().unwrap();
        let h = host();
        let files = OwnedFiles::new(&h, staging.path());
        for _ in 0..2 {
            files
                .create_owned_directory(Path::new("/opt/app/logs"), 0o750, &svc())
                .unwrap();
        }
        let info = h.inspect(Path::new("/opt/app/logs")).unwrap().unwrap();
        assert_eq!(info.owner, "svc");
        assert_eq!(info.mode, 0o750);
        assert!(info.is_dir);
    }

    #[test]
    fn directory_reset_is_repaired() {
        let staging = tempfile::tempdir().unwrap();
        let h = host();
        let files = OwnedFiles::new(&h, staging.path());
        files
            .create_owned_directory(Path::new("/opt/app/data"), 0o750, &svc())
            .unwrap();
        h.external_reset(&ExternalReset::new("/opt/app/data", Owner::user("root"), 0o700));
        files
            .create_owned_directory(Path::new("/opt/app/data"), 0o750, &svc())
            .unwrap();
        let info = h.inspect(Path::new("/opt/app/data")).unwrap().unwrap();
        assert_eq!((info.owner.as_str(), info.mode), ("svc", 0o750));
    }

    #[test]
    fn partial_path_is_a_hidden_sibling() {
        assert_eq!(
            partial_path(Path::new("/opt/app/.env")),
            PathBuf::from("/opt/app/..env.stackwright-partial")
        );
        assert_eq!(
            partial_path(Path::new("/opt/app/compose.yaml")),
            PathBuf::from("/opt/app/.compose.yaml.stackwright-partial")
        );
    }
}
