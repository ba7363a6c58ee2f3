mod commands;

use clap::{Parser, Subcommand};
use clap_complete::Shell;
use commands::{EXIT_CONFIG_ERROR, EXIT_ELEVATION_DENIED, EXIT_FAILURE, EXIT_STATE_ERROR};
use stackwright_core::install_signal_handler;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(
    name = "stackwright",
    version,
    about = "Resumable, privilege-separated installer for a single-host container stack"
)]
struct Cli {
    /// Directory holding the checkpoint, history, install lock, and generated secrets.
    #[arg(long, default_value = "~/.local/state/stackwright", global = true)]
    state_dir: String,

    /// Output results as structured JSON.
    #[arg(long, default_value_t = false, global = true)]
    json: bool,

    /// Enable verbose (debug) logging output.
    #[arg(short, long, default_value_t = false, global = true)]
    verbose: bool,

    /// Enable trace-level logging (more detailed than --verbose).
    #[arg(long, default_value_t = false, global = true)]
    trace: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Provision the stack, phase by phase.
    Install {
        /// Path to the install configuration.
        #[arg(long, default_value = "stackwright.toml")]
        config: PathBuf,
        /// Never prompt; assume yes.
        #[arg(long, default_value_t = false)]
        non_interactive: bool,
        /// Continue after the last checkpointed phase instead of starting over.
        #[arg(long, default_value_t = false)]
        resume: bool,
        /// Print the optional features and their categories, then exit.
        #[arg(long, default_value_t = false)]
        list_features: bool,
    },
    /// Show the last checkpoint and the phase history.
    Status,
    /// Re-apply shared write access on the log directory.
    Reconcile {
        /// Path to the install configuration.
        #[arg(long, default_value = "stackwright.toml")]
        config: PathBuf,
    },
    /// Forget all installer progress so the next install starts over.
    Reset {
        /// Do not ask for confirmation.
        #[arg(long, short = 'y', default_value_t = false)]
        yes: bool,
        /// Also drop the generated credentials.
        #[arg(long, default_value_t = false)]
        secrets: bool,
    },
    /// Run diagnostic checks on the host and the state directory.
    Doctor {
        /// Also validate this install configuration.
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Generate shell completions for bash, zsh, fish, elvish, or powershell.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
    /// Generate man pages in the specified directory.
    ManPages {
        /// Output directory for man pages.
        #[arg(default_value = "man")]
        dir: PathBuf,
    },
}

fn main() -> ExitCode {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let msg = info.to_string();
        if msg.contains("Broken pipe")
            || msg.contains("broken pipe")
            || msg.contains("os error 32")
            || msg.contains("failed printing to stdout")
        {
            std::process::exit(0);
        }
        default_hook(info);
    }));

    let cli = Cli::parse();

    let default_level = if cli.trace {
        "trace"
    } else if cli.verbose {
        "debug"
    } else {
        "warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("STACKWRIGHT_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .without_time()
        .init();

    install_signal_handler();

    let state_dir = expand_tilde(&cli.state_dir);
    let json_output = cli.json;

    let touches_host = matches!(
        cli.command,
        Commands::Install {
            list_features: false,
            ..
        } | Commands::Reconcile { .. }
    );
    if touches_host && !commands::executor_is_simulated() && !commands::prereqs_skipped() {
        let missing = stackwright_runtime::check_install_prereqs();
        if !missing.is_empty() {
            eprintln!("error: {}", stackwright_runtime::format_missing(&missing));
            return ExitCode::from(EXIT_FAILURE);
        }
    }

    let result = match cli.command {
        Commands::Install {
            config,
            non_interactive,
            resume,
            list_features,
        } => {
            if list_features {
                commands::features::run(json_output)
            } else {
                commands::install::run(
                    &state_dir,
                    &config,
                    commands::install::InstallOptions {
                        non_interactive,
                        resume,
                    },
                    json_output,
                )
            }
        }
        Commands::Status => commands::status::run(&state_dir, json_output),
        Commands::Reconcile { config } => commands::reconcile::run(&state_dir, &config, json_output),
        Commands::Reset { yes, secrets } => {
            commands::reset::run(&state_dir, yes, secrets, json_output)
        }
        Commands::Doctor { config } => {
            commands::doctor::run(&state_dir, config.as_deref(), json_output)
        }
        Commands::Completions { shell } => commands::completions::run::<Cli>(shell),
        Commands::ManPages { dir } => commands::man_pages::run::<Cli>(&dir),
    };

    match result {
        Ok(code) => ExitCode::from(code),
        Err(msg) => {
            eprintln!("error: {msg}");
            ExitCode::from(exit_code_for(&msg))
        }
    }
}

fn exit_code_for(msg: &str) -> u8 {
    if msg.starts_with("configuration error:") {
        EXIT_CONFIG_ERROR
    } else if msg.starts_with("state error:") {
        EXIT_STATE_ERROR
    } else if msg.starts_with("elevation denied:") {
        EXIT_ELEVATION_DENIED
    } else {
        EXIT_FAILURE
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(stripped);
        }
    }
    PathBuf::from(path)
}
