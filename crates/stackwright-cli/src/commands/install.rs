use super::{
    confirm, executor, exit_code_for, json_pretty, load_config, spin_fail, spin_ok, spin_skip,
    spinner, EXIT_FAILURE, EXIT_SUCCESS,
};
use console::Style;
use indicatif::ProgressBar;
use stackwright_core::{
    standard_registry, CoreError, InstallContext, InstallFailure, InstallLock, NoProgress,
    Orchestrator, PhaseEntry, PhaseRegistry, Progress, RunReport,
};
use stackwright_schema::{InstallConfig, PhaseNumber};
use stackwright_store::{CheckpointStore, PhaseStatus, SecretStore, StateLayout};
use std::path::Path;

#[derive(Debug, Clone, Copy, Default)]
pub struct InstallOptions {
    pub non_interactive: bool,
    pub resume: bool,
}

pub fn run(
    state_dir: &Path,
    config_path: &Path,
    options: InstallOptions,
    json_output: bool,
) -> Result<u8, String> {
    let mut config = load_config(config_path)?;

    let layout = StateLayout::new(state_dir);
    layout
        .initialize()
        .map_err(|e| format!("state error: {e}"))?;
    let _lock =
        InstallLock::acquire(&layout.lock_file()).map_err(|e| format!("state error: {e}"))?;

    let secrets = SecretStore::new(layout.clone());
    config
        .credentials
        .fill_missing(|name| secrets.get_or_generate(name))
        .map_err(|e| format!("state error: {e}"))?;
    config
        .validate()
        .map_err(|e| format!("configuration error: {e}"))?;

    let exec = executor()?;
    let registry = standard_registry().map_err(|e| e.to_string())?;
    let store = CheckpointStore::new(layout.clone());
    let orchestrator = Orchestrator::new(&registry, &store);

    let fingerprint = config.fingerprint().ok();
    let plan = orchestrator.plan(options.resume, fingerprint.as_deref());
    let Some(start) = plan.start else {
        if json_output {
            let json = serde_json::json!({
                "status": "installed",
                "install_root": config.identity.install_root,
                "phases": [],
            });
            println!("{}", json_pretty(&json)?);
        } else {
            println!(
                "{} is already installed; nothing to resume.",
                config.identity.install_root.display()
            );
        }
        return Ok(EXIT_SUCCESS);
    };

    if !options.non_interactive && !json_output {
        print_plan(&config, &registry, start);
        if !confirm("proceed with the install?", true)? {
            println!("install cancelled");
            return Ok(EXIT_FAILURE);
        }
    }

    let ctx = InstallContext::new(&config, &exec, layout.staging_dir());
    let mut progress: Box<dyn Progress> = if json_output {
        Box::new(NoProgress)
    } else {
        Box::new(SpinnerProgress::default())
    };
    match orchestrator.run(&ctx, start, progress.as_mut()) {
        Ok(report) => print_success(&config, &report, json_output),
        Err(failure) => print_failure(&config, &failure, json_output),
    }
}

fn print_plan(config: &InstallConfig, registry: &PhaseRegistry, start: PhaseNumber) {
    let bold = Style::new().bold();
    println!("{}", bold.apply_to("Stackwright install"));
    println!("  environment: {}", config.environment);
    println!("  domain:      {}", config.network.domain);
    println!("  root:        {}", config.identity.install_root.display());
    println!(
        "  service:     {}:{}",
        config.identity.service_user,
        config.service_group()
    );
    if !config.exclude_features.is_empty() {
        println!("  excluded:    {}", config.exclude_features.join(", "));
    }
    let pending = registry
        .entries()
        .iter()
        .filter(|e| e.number() >= start)
        .count();
    println!("  phases:      {pending} of {} (from {start})", registry.len());
    println!();
}

fn print_success(config: &InstallConfig, report: &RunReport, json_output: bool) -> Result<u8, String> {
    if json_output {
        let json = serde_json::json!({
            "status": "installed",
            "install_root": config.identity.install_root,
            "completed": report.count(PhaseStatus::Completed),
            "skipped": report.count(PhaseStatus::Skipped),
            "phases": report.phases,
        });
        println!("{}", json_pretty(&json)?);
    } else {
        println!();
        println!(
            "{} {} ({} phase(s) completed, {} skipped)",
            Style::new().green().bold().apply_to("installed"),
            config.identity.install_root.display(),
            report.count(PhaseStatus::Completed),
            report.count(PhaseStatus::Skipped)
        );
    }
    Ok(EXIT_SUCCESS)
}

fn print_failure(
    config: &InstallConfig,
    failure: &InstallFailure,
    json_output: bool,
) -> Result<u8, String> {
    let summary = failure.summary(Some(config));
    if json_output {
        let json = serde_json::json!({
            "status": "failed",
            "summary": summary,
            "completed": failure.completed,
        });
        println!("{}", json_pretty(&json)?);
    } else {
        eprintln!();
        eprintln!("{}", Style::new().red().bold().apply_to("install failed"));
        eprintln!("{summary}");
    }
    Ok(exit_code_for(failure.kind()))
}

/// One spinner per phase on stderr.
#[derive(Default)]
struct SpinnerProgress {
    current: Option<ProgressBar>,
}

fn label(entry: &PhaseEntry) -> String {
    format!("{:>4}  {}", entry.number().to_string(), entry.name())
}

impl Progress for SpinnerProgress {
    fn phase_started(&mut self, entry: &PhaseEntry) {
        self.current = Some(spinner(&label(entry)));
    }

    fn phase_finished(&mut self, entry: &PhaseEntry, status: PhaseStatus) {
        if let Some(pb) = self.current.take() {
            match status {
                PhaseStatus::Completed => spin_ok(&pb, &label(entry)),
                PhaseStatus::Skipped => spin_skip(&pb, &format!("{} (excluded)", label(entry))),
            }
        }
    }

    fn phase_failed(&mut self, entry: &PhaseEntry, _error: &CoreError) {
        if let Some(pb) = self.current.take() {
            spin_fail(&pb, &label(entry));
        }
    }
}
