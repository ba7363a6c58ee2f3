//! The standard install sequence.
//!
//! Numbers order the phases; keys identify them in checkpoints. New phases
//! are slotted in with fractional numbers (`9.5`, `11.5`) so nothing is ever
//! renumbered.

mod base;
mod configuration;
mod optional;
mod permissions;
mod record;
mod stack;
#[cfg(test)]
pub(crate) mod testing;

use crate::phase::PhaseRegistry;
use crate::CoreError;

pub use base::{DirectoryTree, Preflight, ServiceRoot};
pub use configuration::{ComposeFile, CredentialsFile, RuntimeConfig};
pub use optional::{LogRotation, MetricsExporter, SampleContent, ScheduledJob};
pub use permissions::LogPermissions;
pub use record::{Finalize, InstallRecord};
pub use stack::{PullImages, StartStack};

/// Every phase in install order.
pub fn standard_registry() -> Result<PhaseRegistry, CoreError> {
    PhaseRegistry::builder()
        .required(1.0, Preflight)
        .required(2.0, ServiceRoot)
        .required(3.0, DirectoryTree)
        .required(4.0, CredentialsFile)
        .required(5.0, RuntimeConfig)
        .required(6.0, ComposeFile)
        .required(7.0, LogPermissions::initial())
        .required(8.0, PullImages)
        .required(9.0, StartStack)
        .required(9.5, LogPermissions::post_start())
        .optional(10.0, "scheduled-backups", ScheduledJob::backups())
        .optional(11.0, "update-notifier", ScheduledJob::update_notifier())
        .optional(11.5, "health-monitor", ScheduledJob::health_monitor())
        .optional(12.0, "log-rotation", LogRotation)
        .optional(13.0, "metrics-exporter", MetricsExporter)
        .optional(14.0, "sample-content", SampleContent)
        .required(20.0, Finalize)
        .build()
}
