use crate::context::InstallContext;
use crate::phase::Phase;
use crate::CoreError;
use stackwright_runtime::ReconcileOutcome;
use tracing::{info, warn};

/// Shared write access to `<root>/logs` for the operator, the service
/// identity, and the containers.
///
/// Registered twice: once before the stack starts, and again afterwards,
/// because the container runtime resets ownership on the bind-mounted tree
/// when it starts.
pub struct LogPermissions {
    key: &'static str,
    name: &'static str,
}

impl LogPermissions {
    pub fn initial() -> Self {
        Self {
            key: "log-permissions",
            name: "Grant shared log access",
        }
    }

    pub fn post_start() -> Self {
        Self {
            key: "post-start-log-permissions",
            name: "Re-grant shared log access after start",
        }
    }
}

impl Phase for LogPermissions {
    fn key(&self) -> &'static str {
        self.key
    }

    fn name(&self) -> &'static str {
        self.name
    }

    fn run(&self, ctx: &InstallContext<'_>) -> Result<(), CoreError> {
        let logs = ctx.layout.logs_dir();
        let writers = ctx.log_writers();
        let report = ctx.share_logs()?;
        match report.outcome {
            ReconcileOutcome::Converged { passes } => info!(
                "{} writable by {} identities after {passes} pass(es)",
                logs.display(),
                writers.len()
            ),
            ReconcileOutcome::GroupFallback { ref group } => {
                info!("{} shared through group '{group}'", logs.display())
            }
            ReconcileOutcome::Drifted { ref mismatches, .. } => {
                warn!(
                    "{} is still being reset externally ({}); run `stackwright reconcile` once the stack settles",
                    logs.display(),
                    mismatches.join("; ")
                );
            }
            ReconcileOutcome::Missing => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phases::testing::{config, context_with};
    use crate::phases::{DirectoryTree, ServiceRoot};
    use stackwright_runtime::{ExternalReset, Owner, SimulatedHost};

    fn host() -> SimulatedHost {
        SimulatedHost::new()
            .with_user("alice", &["alice"])
            .with_user("stackwright", &["stackwright"])
    }

    #[test]
    fn all_three_identities_can_write() {
        let host = host();
        let cfg = config("container_user = \"1000\"\n");
        let dir = tempfile::tempdir().unwrap();
        let ctx = context_with(&cfg, &host, dir.path());
        ServiceRoot.run(&ctx).unwrap();
        DirectoryTree.run(&ctx).unwrap();
        LogPermissions::initial().run(&ctx).unwrap();

        let logs = ctx.layout.logs_dir();
        for user in ["alice", "stackwright", "1000"] {
            assert!(host.can_write(user, &logs), "{user}");
        }
        // New files inherit the grants through the default ACL.
        host.create_file_as("1000", logs.join("app.log")).unwrap();
        assert!(host.can_write("alice", logs.join("app.log")));
    }

    #[test]
    fn writers_can_search_the_root_only() {
        let host = host();
        let cfg = config("");
        let dir = tempfile::tempdir().unwrap();
        let ctx = context_with(&cfg, &host, dir.path());
        ServiceRoot.run(&ctx).unwrap();
        DirectoryTree.run(&ctx).unwrap();
        assert!(!host.can_traverse("alice", ctx.layout.logs_dir().join("x")));

        LogPermissions::initial().run(&ctx).unwrap();
        assert!(host.can_traverse("alice", ctx.layout.logs_dir().join("x")));
        assert!(!host.can_read("alice", ctx.layout.root()));
        assert!(!host.can_write("alice", ctx.layout.root()));
        assert!(!host.can_read("alice", ctx.layout.config_dir()));
    }

    #[test]
    fn re_grants_after_a_container_reset() {
        let host = host();
        let cfg = config("");
        let dir = tempfile::tempdir().unwrap();
        let ctx = context_with(&cfg, &host, dir.path());
        ServiceRoot.run(&ctx).unwrap();
        DirectoryTree.run(&ctx).unwrap();
        LogPermissions::initial().run(&ctx).unwrap();

        let logs = ctx.layout.logs_dir();
        host.external_reset(&ExternalReset::new(&logs, Owner::user("1000"), 0o755));
        assert!(!host.can_write("alice", &logs));

        LogPermissions::post_start().run(&ctx).unwrap();
        assert!(host.can_write("alice", &logs));
        assert!(host.can_write("stackwright", &logs));
    }

    #[test]
    fn persistent_drift_is_not_fatal() {
        let host = host();
        let cfg = config("");
        let dir = tempfile::tempdir().unwrap();
        let ctx = context_with(&cfg, &host, dir.path());
        ServiceRoot.run(&ctx).unwrap();
        DirectoryTree.run(&ctx).unwrap();
        let logs = ctx.layout.logs_dir();
        // Reset after every setfacl call of every pass.
        for nth in 1..=12 {
            host.reset_after(
                "setfacl",
                nth,
                ExternalReset::new(&logs, Owner::user("1000"), 0o700),
            );
        }
        LogPermissions::initial().run(&ctx).unwrap();
    }
}
