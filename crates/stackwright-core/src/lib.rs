//! Provisioning orchestration for Stackwright.
//!
//! This crate ties the schema, state store, and privileged runtime together:
//! the `Phase` trait and `PhaseRegistry`, the resumable `Orchestrator` that
//! runs phases in order and checkpoints after each one, the standard phase
//! catalog, failure summaries with remediation, and the advisory run lock.

pub mod concurrency;
pub mod context;
pub mod layout;
pub mod orchestrator;
pub mod phase;
pub mod phases;
pub mod summary;

pub use concurrency::{install_signal_handler, shutdown_requested, InstallLock};
pub use context::InstallContext;
pub use layout::TargetLayout;
pub use orchestrator::{NoProgress, Orchestrator, PhaseRecord, Progress, ResumePlan, RunReport};
pub use phase::{Gate, Phase, PhaseEntry, PhaseRegistry, RegistryBuilder};
pub use phases::standard_registry;
pub use summary::{FailureKind, FailureSummary, InstallFailure};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("configuration error: {0}")]
    Config(#[from] stackwright_schema::ConfigError),
    #[error("state error: {0}")]
    Store(#[from] stackwright_store::StoreError),
    #[error(transparent)]
    Runtime(#[from] stackwright_runtime::RuntimeError),
    #[error("invalid phase registry: {0}")]
    Registry(String),
    #[error("another stackwright run holds {0}; wait for it to finish")]
    Locked(String),
    #[error("precondition failed: {0}")]
    Precondition(String),
    #[error("interrupted before phase {0}")]
    Interrupted(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("TOML serialization error: {0}")]
    Toml(#[from] toml::ser::Error),
}

impl CoreError {
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Config(_) => FailureKind::Config,
            Self::Store(_) | Self::Locked(_) => FailureKind::State,
            Self::Runtime(e) if e.is_elevation_denied() => FailureKind::ElevationDenied,
            Self::Runtime(e) if e.is_partial_write() => FailureKind::PartialWrite,
            Self::Runtime(e) if e.is_transient() => FailureKind::Transient,
            Self::Precondition(_) => FailureKind::Precondition,
            Self::Interrupted(_) => FailureKind::Interrupted,
            Self::Runtime(_)
            | Self::Registry(_)
            | Self::Io(_)
            | Self::Serialization(_)
            | Self::Toml(_) => FailureKind::Command,
        }
    }
}

/// `err: cause: cause`, for log lines that need the whole chain.
pub fn error_chain(err: &dyn std::error::Error) -> String {
    let mut out = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        let text = cause.to_string();
        if !out.contains(&text) {
            out.push_str(": ");
            out.push_str(&text);
        }
        source = cause.source();
    }
    out
}
