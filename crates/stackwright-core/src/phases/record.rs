use crate::context::InstallContext;
use crate::phase::Phase;
use crate::CoreError;
use serde::{Deserialize, Serialize};
use stackwright_schema::{Environment, FEATURES};
use std::path::PathBuf;
use tracing::{info, warn};

/// `<root>/install.json`: what was installed, for operators and for the
/// next installer run. Deterministic, so re-running does not change it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallRecord {
    pub version: String,
    pub environment: Environment,
    pub domain: String,
    pub install_root: PathBuf,
    pub service_user: String,
    pub features_enabled: Vec<String>,
    pub features_excluded: Vec<String>,
    pub config_fingerprint: String,
}

impl InstallRecord {
    pub fn from_context(ctx: &InstallContext<'_>) -> Result<Self, CoreError> {
        let (excluded, enabled): (Vec<_>, Vec<_>) = FEATURES
            .iter()
            .map(|f| f.id)
            .partition(|id| ctx.exclusions.is_excluded(id));
        Ok(Self {
            version: env!("CARGO_PKG_VERSION").to_owned(),
            environment: ctx.config.environment,
            domain: ctx.config.network.domain.clone(),
            install_root: ctx.layout.root().to_path_buf(),
            service_user: ctx.config.identity.service_user.clone(),
            features_enabled: enabled.into_iter().map(str::to_owned).collect(),
            features_excluded: excluded.into_iter().map(str::to_owned).collect(),
            config_fingerprint: ctx.config.fingerprint()?,
        })
    }
}

/// Writes the install record and checks that the service identity still
/// owns the paths it must own.
pub struct Finalize;

impl Phase for Finalize {
    fn key(&self) -> &'static str {
        "finalize"
    }

    fn name(&self) -> &'static str {
        "Write install record"
    }

    fn run(&self, ctx: &InstallContext<'_>) -> Result<(), CoreError> {
        let record = InstallRecord::from_context(ctx)?;
        let mut content = serde_json::to_string_pretty(&record)?;
        content.push('\n');
        ctx.files.write_owned_file(
            &ctx.layout.install_record(),
            content.as_bytes(),
            0o640,
            &ctx.service_owner(),
        )?;

        let service_user = &ctx.config.identity.service_user;
        for path in [
            ctx.layout.root().to_path_buf(),
            ctx.layout.credentials_file(),
            ctx.layout.compose_file(),
        ] {
            match ctx.exec.inspect(&path)? {
                Some(info) if &info.owner != service_user => warn!(
                    "{} is owned by {} instead of {service_user}",
                    path.display(),
                    info.owner
                ),
                Some(_) => {}
                None => warn!("{} is missing", path.display()),
            }
        }
        info!(
            "installed {} feature(s) at {}",
            record.features_enabled.len(),
            ctx.layout.root().display()
        );
        Ok(())
    }
}
