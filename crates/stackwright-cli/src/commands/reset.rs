use super::{confirm, json_pretty, EXIT_FAILURE, EXIT_SUCCESS};
use stackwright_core::InstallLock;
use stackwright_store::{CheckpointStore, SecretStore, StateLayout};
use std::path::Path;

/// Forget installer progress. The installed files are left alone; the next
/// `install` simply starts over from the first phase.
pub fn run(state_dir: &Path, yes: bool, secrets: bool, json_output: bool) -> Result<u8, String> {
    let layout = StateLayout::new(state_dir);
    if !layout.root().exists() {
        if json_output {
            println!("{}", json_pretty(&serde_json::json!({ "reset": false }))?);
        } else {
            println!("nothing to reset in {}", state_dir.display());
        }
        return Ok(EXIT_SUCCESS);
    }

    if !yes && !json_output {
        let what = if secrets {
            "forget install progress and generated credentials?"
        } else {
            "forget install progress?"
        };
        if !confirm(what, false)? {
            eprintln!("reset cancelled (pass --yes to skip this prompt)");
            return Ok(EXIT_FAILURE);
        }
    }

    let _lock =
        InstallLock::acquire(&layout.lock_file()).map_err(|e| format!("state error: {e}"))?;
    CheckpointStore::new(layout.clone())
        .clear()
        .map_err(|e| format!("state error: {e}"))?;
    if secrets {
        SecretStore::new(layout)
            .clear()
            .map_err(|e| format!("state error: {e}"))?;
    }

    if json_output {
        let json = serde_json::json!({ "reset": true, "secrets_cleared": secrets });
        println!("{}", json_pretty(&json)?);
    } else {
        println!("install progress cleared; the next install starts from the first phase");
    }
    Ok(EXIT_SUCCESS)
}
