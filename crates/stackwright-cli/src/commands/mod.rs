pub mod completions;
pub mod doctor;
pub mod features;
pub mod install;
pub mod man_pages;
pub mod reconcile;
pub mod reset;
pub mod status;

use dialoguer::Confirm;
use indicatif::{ProgressBar, ProgressStyle};
use stackwright_core::FailureKind;
use stackwright_runtime::{select_executor, PrivilegedExecutor, RetryPolicy, Retrying};
use stackwright_schema::{HostFacts, InstallConfig};
use stackwright_store::PhaseStatus;
use std::io::{stderr, stdin, IsTerminal};
use std::path::Path;
use std::time::Duration;

pub const BIN_NAME: &str = "stackwright";

pub const EXIT_SUCCESS: u8 = 0;
pub const EXIT_FAILURE: u8 = 1;
pub const EXIT_CONFIG_ERROR: u8 = 2;
pub const EXIT_STATE_ERROR: u8 = 3;
pub const EXIT_ELEVATION_DENIED: u8 = 4;

const EXECUTOR_ENV: &str = "STACKWRIGHT_EXECUTOR";
const SKIP_PREREQS_ENV: &str = "STACKWRIGHT_SKIP_PREREQS";

pub type Executor = Retrying<Box<dyn PrivilegedExecutor>>;

pub fn json_pretty(value: &impl serde::Serialize) -> Result<String, String> {
    serde_json::to_string_pretty(value).map_err(|e| format!("JSON serialization failed: {e}"))
}

pub fn spinner(msg: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::with_template("{spinner:.cyan} {msg}")
            .expect("valid template")
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
    );
    pb.set_message(msg.to_owned());
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}

fn finish(pb: &ProgressBar, icon: &str, msg: &str) {
    pb.set_style(ProgressStyle::with_template("{msg}").expect("valid template"));
    pb.finish_with_message(format!("{icon} {msg}"));
}

pub fn spin_ok(pb: &ProgressBar, msg: &str) {
    finish(pb, "✓", msg);
}

pub fn spin_skip(pb: &ProgressBar, msg: &str) {
    finish(pb, "-", msg);
}

pub fn spin_fail(pb: &ProgressBar, msg: &str) {
    finish(pb, "✗", msg);
}

pub fn colorize_status(status: PhaseStatus) -> String {
    use console::Style;
    let text = status.to_string();
    match status {
        PhaseStatus::Completed => Style::new().green().apply_to(text).to_string(),
        PhaseStatus::Skipped => Style::new().dim().apply_to(text).to_string(),
    }
}

/// Exit code for a failed install, by failure kind.
pub fn exit_code_for(kind: FailureKind) -> u8 {
    match kind {
        FailureKind::Config => EXIT_CONFIG_ERROR,
        FailureKind::State => EXIT_STATE_ERROR,
        FailureKind::ElevationDenied => EXIT_ELEVATION_DENIED,
        FailureKind::PartialWrite
        | FailureKind::Transient
        | FailureKind::Precondition
        | FailureKind::Interrupted
        | FailureKind::Command => EXIT_FAILURE,
    }
}

fn executor_name() -> String {
    std::env::var(EXECUTOR_ENV).unwrap_or_else(|_| "sudo".to_owned())
}

pub fn executor_is_simulated() -> bool {
    executor_name() == "simulated"
}

pub fn prereqs_skipped() -> bool {
    std::env::var(SKIP_PREREQS_ENV).as_deref() == Ok("1")
}

/// The configured elevation mechanism, with transient failures retried.
pub fn executor() -> Result<Executor, String> {
    let inner = select_executor(&executor_name()).map_err(|e| e.to_string())?;
    Ok(Retrying::new(inner, RetryPolicy::default()))
}

pub fn load_config(path: &Path) -> Result<InstallConfig, String> {
    InstallConfig::load(path, &HostFacts::detect())
        .map_err(|e| format!("configuration error: {}: {e}", path.display()))
}

/// Ask on a terminal; anywhere else the answer is `unattended`.
pub fn confirm(prompt: &str, unattended: bool) -> Result<bool, String> {
    if !(stdin().is_terminal() && stderr().is_terminal()) {
        return Ok(unattended);
    }
    Confirm::new()
        .with_prompt(prompt)
        .default(false)
        .interact()
        .map_err(|e| format!("prompt failed: {e}"))
}
