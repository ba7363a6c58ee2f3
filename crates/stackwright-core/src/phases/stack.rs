use crate::context::InstallContext;
use crate::phase::Phase;
use crate::CoreError;
use stackwright_runtime::{ContainerAction, PrivilegedOp};
use tracing::info;

fn compose(ctx: &InstallContext<'_>, action: ContainerAction) -> Result<(), CoreError> {
    ctx.exec.run(&PrivilegedOp::Container {
        project_dir: ctx.layout.root().to_path_buf(),
        action,
    })?;
    Ok(())
}

/// Fetch every image the compose file names, including profiled services.
pub struct PullImages;

impl Phase for PullImages {
    fn key(&self) -> &'static str {
        "pull-images"
    }

    fn name(&self) -> &'static str {
        "Pull container images"
    }

    fn run(&self, ctx: &InstallContext<'_>) -> Result<(), CoreError> {
        compose(ctx, ContainerAction::Pull)?;
        info!("images pulled");
        Ok(())
    }
}

/// Start the core services. Profiled services are started by the phase that
/// owns their feature.
pub struct StartStack;

impl Phase for StartStack {
    fn key(&self) -> &'static str {
        "start-stack"
    }

    fn name(&self) -> &'static str {
        "Start application stack"
    }

    fn run(&self, ctx: &InstallContext<'_>) -> Result<(), CoreError> {
        compose(ctx, ContainerAction::Up { profiles: Vec::new() })?;
        info!("stack started from {}", ctx.layout.compose_file().display());
        Ok(())
    }
}
