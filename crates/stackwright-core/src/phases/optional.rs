//! Phases an operator can opt out of through `exclude_features`.
//!
//! Each key equals the id of the feature that gates it. None of these check
//! the exclusion list themselves; the orchestrator does that before `run`.

use crate::context::InstallContext;
use crate::layout::LOGROTATE_DIR;
use crate::phase::Phase;
use crate::CoreError;
use serde_json::json;
use stackwright_runtime::{ContainerAction, Owner, PrivilegedOp};
use std::path::PathBuf;
use tracing::info;

/// A managed crontab block for the service identity.
pub struct ScheduledJob {
    key: &'static str,
    name: &'static str,
    entries: fn(&InstallContext<'_>) -> Vec<String>,
}

impl ScheduledJob {
    pub fn backups() -> Self {
        Self {
            key: "scheduled-backups",
            name: "Schedule database backups",
            entries: |ctx| {
                let root = ctx.layout.root().display();
                let backups = ctx.layout.backups_dir();
                let backups = backups.display();
                vec![
                    format!(
                        "30 2 * * * cd {root} && docker compose exec -T db pg_dumpall -U postgres \
                         | gzip > {backups}/db-$(date +\\%F).sql.gz"
                    ),
                    format!("15 3 * * * find {backups} -name 'db-*.sql.gz' -mtime +14 -delete"),
                ]
            },
        }
    }

    pub fn update_notifier() -> Self {
        Self {
            key: "update-notifier",
            name: "Schedule update checks",
            entries: |ctx| {
                let root = ctx.layout.root().display();
                let logs = ctx.layout.logs_dir();
                vec![format!(
                    "0 9 * * 1 cd {root} && docker compose pull --quiet >> {}/update-check.log 2>&1",
                    logs.display()
                )]
            },
        }
    }

    pub fn health_monitor() -> Self {
        Self {
            key: "health-monitor",
            name: "Schedule health monitor",
            entries: |ctx| {
                let root = ctx.layout.root().display();
                let logs = ctx.layout.logs_dir();
                vec![format!(
                    "*/5 * * * * cd {root} && docker compose ps --status=unhealthy -q | grep -q . \
                     && docker compose restart >> {}/health.log 2>&1",
                    logs.display()
                )]
            },
        }
    }
}

impl Phase for ScheduledJob {
    fn key(&self) -> &'static str {
        self.key
    }

    fn name(&self) -> &'static str {
        self.name
    }

    fn run(&self, ctx: &InstallContext<'_>) -> Result<(), CoreError> {
        let entries = (self.entries)(ctx);
        ctx.schedule
            .install(&ctx.config.identity.service_user, self.key, &entries)?;
        Ok(())
    }
}

pub fn render_logrotate(ctx: &InstallContext<'_>) -> String {
    format!(
        "# Managed by stackwright.\n\
         {logs}/*.log {{\n    \
             weekly\n    \
             rotate 8\n    \
             compress\n    \
             delaycompress\n    \
             missingok\n    \
             notifempty\n    \
             copytruncate\n    \
             su {user} {group}\n\
         }}\n",
        logs = ctx.layout.logs_dir().display(),
        user = ctx.config.identity.service_user,
        group = ctx.config.service_group(),
    )
}

/// System logrotate drop-in for the shared log directory.
pub struct LogRotation;

impl Phase for LogRotation {
    fn key(&self) -> &'static str {
        "log-rotation"
    }

    fn name(&self) -> &'static str {
        "Install log rotation policy"
    }

    fn run(&self, ctx: &InstallContext<'_>) -> Result<(), CoreError> {
        ctx.exec.run(&PrivilegedOp::MakeDir {
            path: PathBuf::from(LOGROTATE_DIR),
        })?;
        ctx.files.write_owned_file(
            &ctx.layout.logrotate_file(),
            render_logrotate(ctx).as_bytes(),
            0o644,
            &Owner::user("root").with_group("root"),
        )?;
        Ok(())
    }
}

pub fn render_metrics_config(ctx: &InstallContext<'_>) -> String {
    format!(
        "# Managed by stackwright.\n\
         global:\n  \
           scrape_interval: 30s\n\
         scrape_configs:\n  \
           - job_name: stackwright\n    \
             metrics_path: /metrics\n    \
             static_configs:\n      \
               - targets: [\"app:8080\"]\n        \
                 labels:\n          \
                   instance: \"{}\"\n",
        ctx.config.network.domain
    )
}

/// Prometheus scrape config plus the `metrics` compose profile.
pub struct MetricsExporter;

impl Phase for MetricsExporter {
    fn key(&self) -> &'static str {
        "metrics-exporter"
    }

    fn name(&self) -> &'static str {
        "Enable metrics exporter"
    }

    fn run(&self, ctx: &InstallContext<'_>) -> Result<(), CoreError> {
        ctx.files.write_owned_file(
            &ctx.layout.metrics_config_file(),
            render_metrics_config(ctx).as_bytes(),
            0o640,
            &ctx.service_owner(),
        )?;
        ctx.exec.run(&PrivilegedOp::Container {
            project_dir: ctx.layout.root().to_path_buf(),
            action: ContainerAction::Up {
                profiles: vec!["metrics".to_owned()],
            },
        })?;
        info!("metrics profile started");
        Ok(())
    }
}

/// Seed data the application imports on first start.
pub struct SampleContent;

impl Phase for SampleContent {
    fn key(&self) -> &'static str {
        "sample-content"
    }

    fn name(&self) -> &'static str {
        "Install sample content"
    }

    fn run(&self, ctx: &InstallContext<'_>) -> Result<(), CoreError> {
        let owner = ctx.service_owner();
        let seed = ctx.layout.seed_dir();
        ctx.files.create_owned_directory(&seed, 0o750, &owner)?;
        let welcome = json!({
            "title": format!("Welcome to {}", ctx.config.network.domain),
            "body": "This entry was created by the installer. Delete it whenever you like.",
            "tags": ["welcome", "sample"],
        });
        let mut content = serde_json::to_string_pretty(&welcome)?;
        content.push('\n');
        ctx.files
            .write_owned_file(&seed.join("welcome.json"), content.as_bytes(), 0o640, &owner)?;
        Ok(())
    }
}
