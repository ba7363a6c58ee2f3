use super::{colorize_status, json_pretty, EXIT_SUCCESS};
use stackwright_core::standard_registry;
use stackwright_store::{CheckpointStore, StateLayout};
use std::path::Path;

pub fn run(state_dir: &Path, json_output: bool) -> Result<u8, String> {
    let layout = StateLayout::new(state_dir);
    let store = CheckpointStore::new(layout);
    let registry = standard_registry().map_err(|e| e.to_string())?;

    let checkpoint = store.load();
    let history = store
        .history()
        .map_err(|e| format!("state error: {e}"))?;
    let next = checkpoint
        .as_ref()
        .and_then(|cp| registry.resume_point(cp))
        .and_then(|n| registry.find_number(n));
    let complete = checkpoint.is_some() && next.is_none();

    if json_output {
        let json = serde_json::json!({
            "installed": complete,
            "checkpoint": checkpoint,
            "next_phase": next.map(|e| serde_json::json!({
                "number": e.number(),
                "key": e.key(),
                "name": e.name(),
            })),
            "history": history,
        });
        println!("{}", json_pretty(&json)?);
        return Ok(EXIT_SUCCESS);
    }

    let Some(cp) = checkpoint else {
        println!("not installed (no checkpoint in {})", state_dir.display());
        return Ok(EXIT_SUCCESS);
    };
    println!(
        "last phase: {} ({}) {} at {}",
        cp.phase_id,
        cp.phase_name,
        colorize_status(cp.status),
        cp.timestamp
    );
    match next {
        Some(entry) => println!(
            "next phase: {} ({}); run `stackwright install --resume`",
            entry.number(),
            entry.name()
        ),
        None => println!("install complete"),
    }
    if !history.is_empty() {
        println!();
        println!("history:");
        for entry in &history {
            println!(
                "  {:<26} {:>4}  {:<42} {}",
                entry.timestamp,
                entry.phase_id.to_string(),
                entry.phase_name,
                colorize_status(entry.status)
            );
        }
    }
    Ok(EXIT_SUCCESS)
}
