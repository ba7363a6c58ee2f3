use crate::context::InstallContext;
use crate::phase::Phase;
use crate::CoreError;
use stackwright_runtime::{ContainerAction, PrivilegedOp};
use tracing::{info, warn};

#[allow(unsafe_code)]
fn effective_uid() -> u32 {
    // SAFETY: geteuid() takes no arguments and cannot fail.
    unsafe { libc::geteuid() }
}

/// Checks elevation, the accounts involved, and the container runtime
/// before anything is written.
pub struct Preflight;

impl Phase for Preflight {
    fn key(&self) -> &'static str {
        "preflight"
    }

    fn name(&self) -> &'static str {
        "Preflight checks"
    }

    fn run(&self, ctx: &InstallContext<'_>) -> Result<(), CoreError> {
        ctx.exec.probe()?;

        let identity = &ctx.config.identity;
        let mut accounts = vec![
            ("identity.service_user", identity.service_user.as_str()),
            ("identity.invoking_user", ctx.config.invoking_user()),
        ];
        // Numeric container ids need no account on the host.
        if identity.container_user.parse::<u32>().is_err() {
            accounts.push(("identity.container_user", identity.container_user.as_str()));
        }
        for (field, account) in accounts {
            if !ctx.exec.identity_exists(account)? {
                return Err(CoreError::Precondition(format!(
                    "account '{account}' ({field}) does not exist on this host; \
                     create it first, e.g. `useradd --system --no-create-home {account}`"
                )));
            }
        }

        let out = ctx.exec.run(&PrivilegedOp::Container {
            project_dir: ctx.layout.root().to_path_buf(),
            action: ContainerAction::Version,
        })?;
        info!("container runtime {}", out.stdout.trim());

        if effective_uid() == 0 {
            warn!(
                "running as root; run as {} instead so staged files stay out of root's reach",
                ctx.config.invoking_user()
            );
        }
        Ok(())
    }
}

/// The install root, owned by the service identity.
pub struct ServiceRoot;

impl Phase for ServiceRoot {
    fn key(&self) -> &'static str {
        "service-root"
    }

    fn name(&self) -> &'static str {
        "Create service root"
    }

    fn run(&self, ctx: &InstallContext<'_>) -> Result<(), CoreError> {
        ctx.files
            .create_owned_directory(ctx.layout.root(), 0o750, &ctx.service_owner())?;
        Ok(())
    }
}

pub struct DirectoryTree;

impl Phase for DirectoryTree {
    fn key(&self) -> &'static str {
        "directory-tree"
    }

    fn name(&self) -> &'static str {
        "Create directory tree"
    }

    fn run(&self, ctx: &InstallContext<'_>) -> Result<(), CoreError> {
        let owner = ctx.service_owner();
        for (dir, mode) in ctx.layout.service_tree() {
            ctx.files.create_owned_directory(&dir, mode, &owner)?;
        }
        Ok(())
    }
}
