use crate::orchestrator::PhaseRecord;
use crate::{error_chain, CoreError};
use serde::Serialize;
use stackwright_schema::{InstallConfig, PhaseNumber};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Config,
    ElevationDenied,
    PartialWrite,
    Transient,
    Precondition,
    Interrupted,
    State,
    Command,
}

/// A run that stopped before the last phase.
#[derive(Debug)]
pub struct InstallFailure {
    /// Phases finished during this run, in order.
    pub completed: Vec<PhaseRecord>,
    /// The most recent checkpointed phase, possibly from an earlier run.
    pub last_successful: Option<PhaseRecord>,
    pub failed_number: PhaseNumber,
    pub failed_key: String,
    pub failed_name: String,
    pub error: CoreError,
}

impl InstallFailure {
    pub fn kind(&self) -> FailureKind {
        self.error.kind()
    }

    pub fn remediation(&self, config: Option<&InstallConfig>) -> String {
        let invoker = config.map_or("the invoking user", InstallConfig::invoking_user);
        match self.kind() {
            FailureKind::Config => {
                "correct the configuration value named above, then re-run with --resume".to_owned()
            }
            FailureKind::ElevationDenied => format!(
                "allow {invoker} to run the provisioning commands through `sudo -n` without a \
                 password (check with `stackwright doctor`), then re-run with --resume"
            ),
            FailureKind::PartialWrite => {
                "re-run with --resume; the interrupted write is repaired in place".to_owned()
            }
            FailureKind::Transient => {
                "check network access and the container runtime, then re-run with --resume"
                    .to_owned()
            }
            FailureKind::Precondition => "resolve the precondition above, then re-run with --resume".to_owned(),
            FailureKind::Interrupted => "re-run with --resume to continue".to_owned(),
            FailureKind::State => {
                "inspect the state directory (`stackwright status`); `stackwright reset` starts over"
                    .to_owned()
            }
            FailureKind::Command => "fix the error above, then re-run with --resume".to_owned(),
        }
    }

    pub fn summary(&self, config: Option<&InstallConfig>) -> FailureSummary {
        FailureSummary {
            last_successful: self
                .last_successful
                .as_ref()
                .map(|r| format!("{} ({})", r.number, r.name)),
            failed_phase: format!("{} ({})", self.failed_number, self.failed_name),
            failed_key: self.failed_key.clone(),
            kind: self.kind(),
            error: error_chain(&self.error),
            remediation: self.remediation(config),
        }
    }
}

impl std::fmt::Display for InstallFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "phase {} ({}) failed: {}",
            self.failed_number,
            self.failed_name,
            error_chain(&self.error)
        )
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FailureSummary {
    pub last_successful: Option<String>,
    pub failed_phase: String,
    pub failed_key: String,
    pub kind: FailureKind,
    pub error: String,
    pub remediation: String,
}

impl std::fmt::Display for FailureSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "last successful phase: {}",
            self.last_successful.as_deref().unwrap_or("none")
        )?;
        writeln!(f, "failed phase:          {}", self.failed_phase)?;
        writeln!(f, "error:                 {}", self.error)?;
        write!(f, "next step:             {}", self.remediation)
    }
}
