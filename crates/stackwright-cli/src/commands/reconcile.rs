use super::{executor, json_pretty, load_config, spin_fail, spin_ok, spinner, EXIT_FAILURE, EXIT_SUCCESS};
use stackwright_core::{InstallContext, InstallLock};
use stackwright_runtime::{ReconcileOutcome, RuntimeError};
use stackwright_store::StateLayout;
use std::path::Path;

/// Re-apply the shared log access outside of an install, for when the
/// container runtime reset it after the install finished.
pub fn run(state_dir: &Path, config_path: &Path, json_output: bool) -> Result<u8, String> {
    let config = load_config(config_path)?;
    let layout = StateLayout::new(state_dir);
    layout
        .initialize()
        .map_err(|e| format!("state error: {e}"))?;
    let _lock =
        InstallLock::acquire(&layout.lock_file()).map_err(|e| format!("state error: {e}"))?;

    let exec = executor()?;
    let ctx = InstallContext::new(&config, &exec, layout.staging_dir());
    let logs = ctx.layout.logs_dir();
    let writers = ctx.log_writers();

    let pb = (!json_output).then(|| spinner(&format!("reconciling {}", logs.display())));
    let report = match ctx.share_logs() {
        Ok(report) => report,
        Err(e) => {
            if let Some(ref pb) = pb {
                spin_fail(pb, &format!("reconciling {}", logs.display()));
            }
            return Err(describe(&e));
        }
    };

    let code = match report.outcome {
        ReconcileOutcome::Converged { .. } | ReconcileOutcome::GroupFallback { .. } => EXIT_SUCCESS,
        ReconcileOutcome::Drifted { .. } => EXIT_FAILURE,
        ReconcileOutcome::Missing => {
            if let Some(ref pb) = pb {
                spin_fail(pb, &format!("{} is missing", logs.display()));
            }
            return Err(format!(
                "{} does not exist; run `stackwright install` first",
                logs.display()
            ));
        }
    };

    if json_output {
        println!("{}", json_pretty(&report)?);
    } else if let Some(ref pb) = pb {
        let who = writers
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ");
        match report.outcome {
            ReconcileOutcome::Converged { passes } => spin_ok(
                pb,
                &format!("{} writable by {who} ({passes} pass(es))", logs.display()),
            ),
            ReconcileOutcome::GroupFallback { ref group } => spin_ok(
                pb,
                &format!("{} shared through group '{group}' (no ACL support)", logs.display()),
            ),
            ReconcileOutcome::Drifted { ref mismatches, .. } => spin_fail(
                pb,
                &format!(
                    "{} is still being reset: {}",
                    logs.display(),
                    mismatches.join("; ")
                ),
            ),
            ReconcileOutcome::Missing => {}
        }
    }
    Ok(code)
}

fn describe(err: &RuntimeError) -> String {
    if err.is_elevation_denied() {
        format!("elevation denied: {err}")
    } else {
        err.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn denial_is_prefixed_for_the_exit_code() {
        let denied = RuntimeError::ElevationDenied {
            command: "sudo -n setfacl".to_owned(),
            detail: "a password is required".to_owned(),
        };
        assert!(describe(&denied).starts_with("elevation denied:"));

        let other = RuntimeError::ExecutorUnavailable("doas".to_owned());
        assert!(!describe(&other).starts_with("elevation denied:"));
    }
}
