//! Installer-side persistent state for Stackwright.
//!
//! Everything here lives in a directory owned by the invoking operator, never
//! under the service-owned install root: `StateLayout` names the files,
//! `CheckpointStore` persists the resume point and an append-only history of
//! every phase outcome, and `SecretStore` keeps generated credentials stable
//! across re-runs.

pub mod checkpoint;
pub mod layout;
pub mod secrets;

pub use checkpoint::{Checkpoint, CheckpointStore, PhaseStatus};
pub use layout::{StateLayout, STATE_FORMAT_VERSION};
pub use secrets::SecretStore;

use std::path::Path;
use thiserror::Error;

/// Fsync a directory to ensure that a preceding `rename()` is durable.
///
/// POSIX does not guarantee a rename survives a crash until the parent
/// directory is synced.
pub(crate) fn fsync_dir(dir: &Path) -> Result<(), std::io::Error> {
    let f = std::fs::File::open(dir)?;
    f.sync_all()
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("state I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("state format version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: u32, found: u32 },
    #[error("no usable entropy source: {0}")]
    Entropy(String),
}
