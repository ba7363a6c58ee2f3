use super::{executor, executor_is_simulated, load_config, EXIT_FAILURE, EXIT_SUCCESS};
use stackwright_core::{CoreError, InstallLock};
use stackwright_runtime::PrivilegedExecutor;
use stackwright_store::{CheckpointStore, StateLayout};
use std::path::Path;

pub fn run(state_dir: &Path, config_path: Option<&Path>, json_output: bool) -> Result<u8, String> {
    let mut checks: Vec<Check> = Vec::new();
    let mut all_pass = true;

    check_prereqs(&mut checks, &mut all_pass);
    check_elevation(&mut checks, &mut all_pass);

    let layout = StateLayout::new(state_dir);
    if layout.root().exists() {
        checks.push(Check::pass("state_dir", "State directory exists"));
        check_state(&layout, &mut checks, &mut all_pass);
    } else {
        checks.push(Check::info(
            "state_dir",
            "State directory not initialized (will be created on first install)",
        ));
    }

    if let Some(path) = config_path {
        match load_config(path) {
            Ok(config) => {
                checks.push(Check::pass(
                    "config",
                    &format!("Configuration {} is valid", path.display()),
                ));
                check_disk_space(&config.identity.install_root, &mut checks);
            }
            Err(e) => {
                all_pass = false;
                checks.push(Check::fail("config", &e));
            }
        }
    }

    print_results(&checks, all_pass, json_output)
}

fn check_prereqs(checks: &mut Vec<Check>, all_pass: &mut bool) {
    if executor_is_simulated() {
        checks.push(Check::info(
            "host_prereqs",
            "Simulated executor selected; host tools are not used",
        ));
        return;
    }
    let missing = stackwright_runtime::check_install_prereqs();
    if missing.is_empty() {
        checks.push(Check::pass("host_prereqs", "Host prerequisites satisfied"));
    } else {
        *all_pass = false;
        checks.push(Check::fail(
            "host_prereqs",
            &stackwright_runtime::format_missing(&missing),
        ));
    }
}

fn check_elevation(checks: &mut Vec<Check>, all_pass: &mut bool) {
    let exec = match executor() {
        Ok(exec) => exec,
        Err(e) => {
            *all_pass = false;
            checks.push(Check::fail("elevation", &e));
            return;
        }
    };
    match exec.probe() {
        Ok(()) => checks.push(Check::pass(
            "elevation",
            &format!("Non-interactive elevation through '{}' works", exec.name()),
        )),
        Err(e) => {
            *all_pass = false;
            checks.push(Check::fail(
                "elevation",
                &format!("Elevation through '{}' failed: {e}", exec.name()),
            ));
        }
    }
}

fn check_state(layout: &StateLayout, checks: &mut Vec<Check>, all_pass: &mut bool) {
    match layout.verify_version() {
        Ok(()) => checks.push(Check::pass("state_version", "State format version valid")),
        Err(e) => {
            *all_pass = false;
            checks.push(Check::fail(
                "state_version",
                &format!("State version check failed: {e}"),
            ));
        }
    }

    match CheckpointStore::new(layout.clone()).load() {
        Some(cp) => checks.push(Check::info(
            "checkpoint",
            &format!("Last checkpoint: phase {} ({})", cp.phase_id, cp.phase_name),
        )),
        None => checks.push(Check::info("checkpoint", "No usable checkpoint")),
    }

    match InstallLock::acquire(&layout.lock_file()) {
        Ok(_) => checks.push(Check::pass("install_lock", "Install lock is free")),
        Err(CoreError::Locked(_)) => checks.push(Check::warn(
            "install_lock",
            "Install lock is held by another process",
        )),
        Err(e) => {
            *all_pass = false;
            checks.push(Check::fail(
                "install_lock",
                &format!("Cannot check install lock: {e}"),
            ));
        }
    }
}

fn print_results(checks: &[Check], all_pass: bool, json_output: bool) -> Result<u8, String> {
    if json_output {
        let json = serde_json::json!({
            "healthy": all_pass,
            "checks": checks.iter().map(|c| serde_json::json!({
                "name": c.name,
                "status": c.status,
                "message": c.message,
            })).collect::<Vec<_>>(),
        });
        println!(
            "{}",
            serde_json::to_string_pretty(&json).map_err(|e| e.to_string())?
        );
    } else {
        println!("Stackwright Doctor\n");
        for check in checks {
            let icon = match check.status {
                "pass" => "✓",
                "fail" => "✗",
                "warn" => "⚠",
                _ => "ℹ",
            };
            println!("  {icon} {}", check.message);
        }
        println!();
        if all_pass {
            println!("All checks passed.");
        } else {
            println!("Some checks failed. See above for details.");
        }
    }
    Ok(if all_pass { EXIT_SUCCESS } else { EXIT_FAILURE })
}

struct Check {
    name: &'static str,
    status: &'static str,
    message: String,
}

impl Check {
    fn new(name: &'static str, status: &'static str, message: &str) -> Self {
        Self {
            name,
            status,
            message: message.to_owned(),
        }
    }

    fn pass(name: &'static str, message: &str) -> Self {
        Self::new(name, "pass", message)
    }

    fn fail(name: &'static str, message: &str) -> Self {
        Self::new(name, "fail", message)
    }

    fn warn(name: &'static str, message: &str) -> Self {
        Self::new(name, "warn", message)
    }

    fn info(name: &'static str, message: &str) -> Self {
        Self::new(name, "info", message)
    }
}

/// Free space on the filesystem that will hold `install_root`, which may not
/// exist yet.
fn check_disk_space(install_root: &Path, checks: &mut Vec<Check>) {
    let Some(existing) = install_root.ancestors().find(|p| p.exists()) else {
        return;
    };
    let Ok(c_path) = std::ffi::CString::new(existing.to_string_lossy().as_bytes()) else {
        return;
    };

    // SAFETY: zeroed statvfs is a valid initial state for the struct.
    #[allow(unsafe_code, clippy::undocumented_unsafe_blocks)]
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    // SAFETY: valid NUL-terminated path and a zeroed output struct that is
    // only read after the call succeeds.
    #[allow(unsafe_code, clippy::undocumented_unsafe_blocks)]
    let ret = unsafe { libc::statvfs(c_path.as_ptr(), &raw mut stat) };
    if ret != 0 {
        return;
    }

    #[allow(clippy::unnecessary_cast)]
    let avail_mb = (stat.f_bavail as u64 * stat.f_frsize as u64) / (1024 * 1024);
    if avail_mb < 2048 {
        checks.push(Check::warn(
            "disk_space",
            &format!(
                "Only {avail_mb} MB free under {}; container images need more",
                existing.display()
            ),
        ));
    } else {
        checks.push(Check::pass(
            "disk_space",
            &format!("Disk space: {} GB free under {}", avail_mb / 1024, existing.display()),
        ));
    }
}
