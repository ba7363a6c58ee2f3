use std::path::{Path, PathBuf};

/// System-wide logrotate drop-in directory.
pub const LOGROTATE_DIR: &str = "/etc/logrotate.d";

/// Paths inside the service-owned install root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetLayout {
    root: PathBuf,
}

impl TargetLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[inline]
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn data_dir(&self) -> PathBuf {
        self.root.join("data")
    }

    pub fn config_dir(&self) -> PathBuf {
        self.root.join("config")
    }

    /// Written by the operator, the service account, and the containers.
    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    pub fn backups_dir(&self) -> PathBuf {
        self.root.join("backups")
    }

    pub fn seed_dir(&self) -> PathBuf {
        self.data_dir().join("seed")
    }

    pub fn credentials_file(&self) -> PathBuf {
        self.root.join(".env")
    }

    pub fn runtime_config_file(&self) -> PathBuf {
        self.config_dir().join("runtime.toml")
    }

    pub fn metrics_config_file(&self) -> PathBuf {
        self.config_dir().join("metrics.yml")
    }

    pub fn compose_file(&self) -> PathBuf {
        self.root.join("compose.yaml")
    }

    pub fn install_record(&self) -> PathBuf {
        self.root.join("install.json")
    }

    pub fn logrotate_file(&self) -> PathBuf {
        Path::new(LOGROTATE_DIR).join("stackwright")
    }

    /// Directories created under the root, with their modes.
    pub fn service_tree(&self) -> [(PathBuf, u32); 4] {
        [
            (self.data_dir(), 0o750),
            (self.config_dir(), 0o750),
            (self.logs_dir(), 0o770),
            (self.backups_dir(), 0o750),
        ]
    }
}
