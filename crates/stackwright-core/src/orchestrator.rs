use crate::concurrency::shutdown_requested;
use crate::context::InstallContext;
use crate::phase::{Gate, PhaseEntry, PhaseRegistry};
use crate::summary::InstallFailure;
use crate::{error_chain, CoreError};
use serde::Serialize;
use stackwright_schema::PhaseNumber;
use stackwright_store::{Checkpoint, CheckpointStore, PhaseStatus};
use tracing::{error, info, warn};

/// Outcome of one phase, as reported to the operator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PhaseRecord {
    pub number: PhaseNumber,
    pub key: String,
    pub name: String,
    pub status: PhaseStatus,
}

impl PhaseRecord {
    fn new(entry: &PhaseEntry, status: PhaseStatus) -> Self {
        Self {
            number: entry.number(),
            key: entry.key().to_owned(),
            name: entry.name().to_owned(),
            status,
        }
    }

    pub fn from_checkpoint(cp: &Checkpoint) -> Self {
        Self {
            number: cp.phase_id,
            key: cp.phase_key.clone().unwrap_or_default(),
            name: cp.phase_name.clone(),
            status: cp.status,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RunReport {
    pub phases: Vec<PhaseRecord>,
}

impl RunReport {
    pub fn count(&self, status: PhaseStatus) -> usize {
        self.phases.iter().filter(|p| p.status == status).count()
    }
}

/// Observer for phase boundaries, used by the CLI to drive spinners.
pub trait Progress {
    fn phase_started(&mut self, _entry: &PhaseEntry) {}
    fn phase_finished(&mut self, _entry: &PhaseEntry, _status: PhaseStatus) {}
    fn phase_failed(&mut self, _entry: &PhaseEntry, _error: &CoreError) {}
}

pub struct NoProgress;

impl Progress for NoProgress {}

/// Where a run should start.
#[derive(Debug, Clone)]
pub struct ResumePlan {
    /// `None` when the checkpoint is already past the last phase.
    pub start: Option<PhaseNumber>,
    pub checkpoint: Option<Checkpoint>,
}

impl ResumePlan {
    pub fn is_complete(&self) -> bool {
        self.start.is_none()
    }
}

/// Runs registered phases in order, checkpointing after each one.
pub struct Orchestrator<'r> {
    registry: &'r PhaseRegistry,
    store: &'r CheckpointStore,
}

impl<'r> Orchestrator<'r> {
    pub fn new(registry: &'r PhaseRegistry, store: &'r CheckpointStore) -> Self {
        Self { registry, store }
    }

    pub fn registry(&self) -> &PhaseRegistry {
        self.registry
    }

    /// Decide the start phase. Without `resume`, any previous checkpoint is
    /// ignored and the run starts from the first phase.
    pub fn plan(&self, resume: bool, fingerprint: Option<&str>) -> ResumePlan {
        let first = self.registry.first_number();
        let checkpoint = self.store.load();
        if !resume {
            if let Some(cp) = checkpoint {
                info!(
                    "previous run reached phase {} ({}); starting over from the first phase \
                     (use --resume to continue instead)",
                    cp.phase_id, cp.phase_name
                );
            }
            return ResumePlan {
                start: first,
                checkpoint: None,
            };
        }
        let Some(cp) = checkpoint else {
            info!("no checkpoint found; starting from the first phase");
            return ResumePlan {
                start: first,
                checkpoint: None,
            };
        };

        if let (Some(current), Some(stored)) = (fingerprint, cp.config_fingerprint.as_deref()) {
            if current != stored {
                warn!(
                    "configuration changed since phase {} was checkpointed; \
                     phases up to it will not be re-run (start without --resume to apply everywhere)",
                    cp.phase_id
                );
            }
        }

        let start = self.registry.resume_point(&cp);
        match start {
            Some(next) => info!(
                "resuming after phase {} ({}) at phase {next}",
                cp.phase_id, cp.phase_name
            ),
            None => info!(
                "phase {} ({}) was the last phase; nothing to resume",
                cp.phase_id, cp.phase_name
            ),
        }
        ResumePlan {
            start,
            checkpoint: Some(cp),
        }
    }

    /// Resume from the saved checkpoint, or start fresh when there is none.
    pub fn resume(
        &self,
        ctx: &InstallContext<'_>,
        progress: &mut dyn Progress,
    ) -> Result<RunReport, InstallFailure> {
        let fingerprint = ctx.config.fingerprint().ok();
        match self.plan(true, fingerprint.as_deref()).start {
            Some(start) => self.run(ctx, start, progress),
            None => Ok(RunReport::default()),
        }
    }

    /// Run every phase numbered `start` or above.
    ///
    /// Stops at the first failure without checkpointing the failed phase, so
    /// the last saved checkpoint remains the resume point.
    pub fn run(
        &self,
        ctx: &InstallContext<'_>,
        start: PhaseNumber,
        progress: &mut dyn Progress,
    ) -> Result<RunReport, InstallFailure> {
        ctx.exclusions.warn_unknown();

        let mut last_successful = self
            .store
            .load()
            .filter(|cp| cp.phase_id < start)
            .map(|cp| PhaseRecord::from_checkpoint(&cp));
        let mut completed: Vec<PhaseRecord> = Vec::new();

        let pending: Vec<&PhaseEntry> = self
            .registry
            .entries()
            .iter()
            .filter(|e| e.number() >= start)
            .collect();
        let Some(first) = pending.first() else {
            return Ok(RunReport::default());
        };

        let prepared = ctx
            .config
            .snapshot()
            .and_then(|s| ctx.config.fingerprint().map(|f| (s, f)));
        let (snapshot, fingerprint) = match prepared {
            Ok(v) => v,
            Err(e) => return Err(failure(first, e.into(), completed, last_successful)),
        };

        for entry in pending {
            if shutdown_requested() {
                warn!("stopping before phase {} ({})", entry.number(), entry.name());
                let err = CoreError::Interrupted(entry.number().to_string());
                return Err(failure(entry, err, completed, last_successful));
            }

            progress.phase_started(entry);
            let status = match execute(entry, ctx) {
                Ok(status) => status,
                Err(e) => {
                    error!(
                        "phase {} ({}) failed: {}",
                        entry.number(),
                        entry.key(),
                        error_chain(&e)
                    );
                    progress.phase_failed(entry, &e);
                    return Err(failure(entry, e, completed, last_successful));
                }
            };

            let checkpoint = Checkpoint::new(entry.number(), entry.name(), snapshot.clone(), status)
                .with_key(entry.key())
                .with_fingerprint(&fingerprint);
            if let Err(e) = self.store.save(&checkpoint) {
                let e = CoreError::from(e);
                error!(
                    "phase {} ({}) finished but its checkpoint could not be saved: {}",
                    entry.number(),
                    entry.key(),
                    error_chain(&e)
                );
                progress.phase_failed(entry, &e);
                return Err(failure(entry, e, completed, last_successful));
            }
            progress.phase_finished(entry, status);

            let record = PhaseRecord::new(entry, status);
            last_successful = Some(record.clone());
            completed.push(record);
        }

        info!("all {} phases finished", completed.len());
        Ok(RunReport { phases: completed })
    }
}

/// The exclusion check wraps every optional phase and runs before `run`,
/// so an excluded phase has no side effects at all.
fn execute(entry: &PhaseEntry, ctx: &InstallContext<'_>) -> Result<PhaseStatus, CoreError> {
    if let Gate::Optional(feature) = entry.gate() {
        if ctx.exclusions.is_excluded(feature.id) {
            info!(
                "phase {} ({}) skipped: feature '{}' is excluded",
                entry.number(),
                entry.name(),
                feature.id
            );
            return Ok(PhaseStatus::Skipped);
        }
    }
    info!("phase {}: {}", entry.number(), entry.name());
    entry.phase().run(ctx)?;
    Ok(PhaseStatus::Completed)
}

fn failure(
    entry: &PhaseEntry,
    error: CoreError,
    completed: Vec<PhaseRecord>,
    last_successful: Option<PhaseRecord>,
) -> InstallFailure {
    InstallFailure {
        completed,
        last_successful,
        failed_number: entry.number(),
        failed_key: entry.key().to_owned(),
        failed_name: entry.name().to_owned(),
        error,
    }
}
