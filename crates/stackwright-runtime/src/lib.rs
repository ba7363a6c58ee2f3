//! Host-side execution layer for Stackwright.
//!
//! This crate implements everything that touches the host on behalf of the
//! installer: a blocking command runner with timeouts and bounded retry, the
//! `PrivilegedExecutor` boundary with its enumerated verb set (`sudo` and a
//! simulated host for tests), privilege-separated file transfer into the
//! service-owned tree, the ACL reconciliation engine for multi-writer
//! directories, managed scheduled-task blocks, and prerequisite checks.

pub mod acl;
pub mod command;
pub mod files;
pub mod mock;
pub mod prereq;
pub mod privileged;
pub mod schedule;

pub use acl::{
    AccessEntry, AclReconciler, AclRule, AclScope, AclSnapshot, AclTag, Perms, Principal,
    ReconcileOutcome, ReconcileReport,
};
pub use command::{CommandOutput, CommandSpec, RetryPolicy};
pub use files::{OwnedFiles, OwnershipTarget};
pub use mock::{ExternalReset, InjectedFailure, SimulatedHost};
pub use prereq::{check_install_prereqs, format_missing, MissingPrereq};
pub use privileged::{
    select_executor, ContainerAction, ModeChange, Owner, PathInfo, PrivilegedExecutor,
    PrivilegedOp, Retrying, SudoExecutor,
};
pub use schedule::ScheduledTasks;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("runtime I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to start `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("privilege escalation denied for `{command}`: {detail}")]
    ElevationDenied { command: String, detail: String },
    #[error("`{command}` timed out after {secs}s")]
    Timeout { command: String, secs: u64 },
    #[error("`{command}` failed transiently: {detail}")]
    Transient { command: String, detail: String },
    #[error("`{command}` exited with {status}: {stderr}")]
    CommandFailed {
        command: String,
        status: i32,
        stderr: String,
    },
    #[error("access control lists are not supported on {0}")]
    AclUnsupported(String),
    #[error("partial write of {path}: content was transferred but `{step}` failed: {source}")]
    PartialWrite {
        path: String,
        step: &'static str,
        #[source]
        source: Box<RuntimeError>,
    },
    #[error("unexpected output from `{command}`: {detail}")]
    UnexpectedOutput { command: String, detail: String },
    #[error("executor '{0}' is not available")]
    ExecutorUnavailable(String),
}

impl RuntimeError {
    /// Timeouts and momentary contention. Only these are worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Transient { .. })
    }

    /// True when the elevation mechanism itself refused, including when the
    /// refusal happened partway through a privileged write.
    pub fn is_elevation_denied(&self) -> bool {
        match self {
            Self::ElevationDenied { .. } => true,
            Self::PartialWrite { source, .. } => source.is_elevation_denied(),
            _ => false,
        }
    }

    pub fn is_partial_write(&self) -> bool {
        matches!(self, Self::PartialWrite { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(RuntimeError::Timeout {
            command: "docker compose pull".to_owned(),
            secs: 900,
        }
        .is_transient());
        assert!(RuntimeError::Transient {
            command: "crontab".to_owned(),
            detail: "locked".to_owned(),
        }
        .is_transient());
        assert!(!RuntimeError::CommandFailed {
            command: "chmod".to_owned(),
            status: 1,
            stderr: "nope".to_owned(),
        }
        .is_transient());
        assert!(!RuntimeError::ElevationDenied {
            command: "sudo".to_owned(),
            detail: "password required".to_owned(),
        }
        .is_transient());
    }

    #[test]
    fn elevation_denial_is_seen_through_partial_writes() {
        let e = RuntimeError::PartialWrite {
            path: "/opt/stack/.env".to_owned(),
            step: "chown",
            source: Box::new(RuntimeError::ElevationDenied {
                command: "chown".to_owned(),
                detail: "not allowed".to_owned(),
            }),
        };
        assert!(e.is_elevation_denied());
        assert!(e.is_partial_write());
        let msg = e.to_string();
        assert!(msg.contains("/opt/stack/.env"));
        assert!(msg.contains("chown"));
    }

    #[test]
    fn elevation_denied_message_names_the_command() {
        let e = RuntimeError::ElevationDenied {
            command: "mkdir -p /opt/stack".to_owned(),
            detail: "a password is required".to_owned(),
        };
        assert!(e.to_string().contains("privilege escalation denied"));
        assert!(e.to_string().contains("mkdir -p /opt/stack"));
    }
}
