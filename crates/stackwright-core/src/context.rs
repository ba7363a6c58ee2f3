use crate::layout::TargetLayout;
use stackwright_runtime::{
    AclReconciler, OwnedFiles, Owner, Principal, PrivilegedExecutor, ReconcileOutcome,
    ReconcileReport, RuntimeError, ScheduledTasks,
};
use stackwright_schema::{ExclusionList, InstallConfig};
use std::path::PathBuf;

/// Everything a phase may use. Built once per run and shared by every phase.
pub struct InstallContext<'a> {
    pub config: &'a InstallConfig,
    pub layout: TargetLayout,
    pub exec: &'a dyn PrivilegedExecutor,
    pub files: OwnedFiles<'a>,
    pub acl: AclReconciler<'a>,
    pub schedule: ScheduledTasks<'a>,
    pub exclusions: ExclusionList,
}

impl<'a> InstallContext<'a> {
    /// `staging_dir` must be private to the invoking user; staged content
    /// for owned files is written there before the privileged copy.
    pub fn new(
        config: &'a InstallConfig,
        exec: &'a dyn PrivilegedExecutor,
        staging_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            config,
            layout: TargetLayout::new(&config.identity.install_root),
            exec,
            files: OwnedFiles::new(exec, staging_dir),
            acl: AclReconciler::new(exec, config.shared_group()),
            schedule: ScheduledTasks::new(exec),
            exclusions: ExclusionList::new(&config.exclude_features),
        }
    }

    /// `service_user:service_group`.
    pub fn service_owner(&self) -> Owner {
        Owner::user(&self.config.identity.service_user).with_group(self.config.service_group())
    }

    /// The three identities that must be able to write the shared log tree.
    pub fn log_writers(&self) -> Vec<Principal> {
        let mut writers: Vec<Principal> = Vec::with_capacity(3);
        for user in [
            self.config.invoking_user(),
            self.config.identity.service_user.as_str(),
            self.config.identity.container_user.as_str(),
        ] {
            let principal = Principal::User(user.to_owned());
            if !writers.contains(&principal) {
                writers.push(principal);
            }
        }
        writers
    }

    /// Reconcile write access on the log tree, then make `<root>` searchable
    /// by the same writers so they can reach it.
    pub fn share_logs(&self) -> Result<ReconcileReport, RuntimeError> {
        let writers = self.log_writers();
        let report = self
            .acl
            .reconcile_permissions(&self.layout.logs_dir(), &writers)?;
        if report.outcome != ReconcileOutcome::Missing {
            self.acl.grant_traverse(self.layout.root(), &writers)?;
        }
        Ok(report)
    }
}
