use crate::context::InstallContext;
use crate::layout::TargetLayout;
use crate::phase::Phase;
use crate::CoreError;
use serde::Serialize;
use stackwright_schema::{ConfigError, Environment, InstallConfig};
use std::fmt::Write as _;
use std::path::PathBuf;

pub const APP_IMAGE: &str = "ghcr.io/stackwright/app:stable";
pub const DATABASE_IMAGE: &str = "postgres:16-alpine";
pub const METRICS_IMAGE: &str = "prom/prometheus:v2.53.0";

fn secret<'c>(value: &'c Option<String>, field: &'static str) -> Result<&'c str, ConfigError> {
    let value = value.as_deref().ok_or_else(|| {
        ConfigError::invalid(field, "no value; set it or let the installer generate one")
    })?;
    if value.contains(['\n', '\r']) {
        return Err(ConfigError::invalid(field, "must be a single line"));
    }
    Ok(value)
}

/// Render the `.env` file the containers read their credentials from.
pub fn render_credentials(config: &InstallConfig) -> Result<String, ConfigError> {
    let creds = &config.credentials;
    let admin_password = secret(&creds.admin_password, "credentials.admin_password")?;
    let database_password = secret(&creds.database_password, "credentials.database_password")?;
    let admin_email = creds
        .admin_email
        .clone()
        .unwrap_or_else(|| format!("admin@{}", config.network.domain));

    let mut out = String::from("# Managed by stackwright. Rewritten on every install.\n");
    for (key, value) in [
        ("STACK_DOMAIN", config.network.domain.as_str()),
        ("ADMIN_EMAIL", admin_email.as_str()),
        ("ADMIN_PASSWORD", admin_password),
        ("DATABASE_PASSWORD", database_password),
        ("POSTGRES_PASSWORD", database_password),
    ] {
        let _ = writeln!(out, "{key}={value}");
    }
    Ok(out)
}

/// `<root>/.env`, readable by the service identity only.
pub struct CredentialsFile;

impl Phase for CredentialsFile {
    fn key(&self) -> &'static str {
        "credentials"
    }

    fn name(&self) -> &'static str {
        "Write credentials file"
    }

    fn run(&self, ctx: &InstallContext<'_>) -> Result<(), CoreError> {
        let content = render_credentials(ctx.config)?;
        ctx.files.write_owned_file(
            &ctx.layout.credentials_file(),
            content.as_bytes(),
            0o600,
            &ctx.service_owner(),
        )?;
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct RuntimeSettings<'c> {
    environment: Environment,
    log_level: &'static str,
    server: ServerSettings<'c>,
    database: DatabaseSettings,
    paths: PathSettings,
}

#[derive(Debug, Serialize)]
struct ServerSettings<'c> {
    domain: &'c str,
    bind_address: &'c str,
    http_port: u16,
    workers: u32,
}

#[derive(Debug, Serialize)]
struct DatabaseSettings {
    host: &'static str,
    name: &'static str,
    memory_mb: u32,
}

/// Paths as the application sees them inside its container.
#[derive(Debug, Serialize)]
struct PathSettings {
    data: PathBuf,
    logs: PathBuf,
}

pub fn render_runtime_config(config: &InstallConfig) -> Result<String, CoreError> {
    let settings = RuntimeSettings {
        environment: config.environment,
        log_level: config.log_level(),
        server: ServerSettings {
            domain: &config.network.domain,
            bind_address: &config.network.bind_address,
            http_port: config.network.http_port,
            workers: config.workers(),
        },
        database: DatabaseSettings {
            host: "db",
            name: "stackwright",
            memory_mb: config.database_memory_mb(),
        },
        paths: PathSettings {
            data: PathBuf::from("/var/lib/stackwright"),
            logs: PathBuf::from("/var/log/stackwright"),
        },
    };
    let mut out = String::from("# Managed by stackwright. Rewritten on every install.\n\n");
    out.push_str(&toml::to_string_pretty(&settings)?);
    Ok(out)
}

/// `<root>/config/runtime.toml`.
pub struct RuntimeConfig;

impl Phase for RuntimeConfig {
    fn key(&self) -> &'static str {
        "runtime-config"
    }

    fn name(&self) -> &'static str {
        "Write runtime configuration"
    }

    fn run(&self, ctx: &InstallContext<'_>) -> Result<(), CoreError> {
        let content = render_runtime_config(ctx.config)?;
        ctx.files.write_owned_file(
            &ctx.layout.runtime_config_file(),
            content.as_bytes(),
            0o600,
            &ctx.service_owner(),
        )?;
        Ok(())
    }
}

/// Render `compose.yaml`. Every path is relative to the install root, which
/// is the compose project directory.
pub fn render_compose(config: &InstallConfig, layout: &TargetLayout) -> String {
    let net = &config.network;
    let shared_buffers = (config.database_memory_mb() / 4).max(32);
    let mut out = String::new();
    let _ = writeln!(out, "# Managed by stackwright. Rewritten on every install.");
    let _ = writeln!(out, "name: stackwright");
    let _ = writeln!(out, "services:");

    let _ = writeln!(out, "  app:");
    let _ = writeln!(out, "    image: {APP_IMAGE}");
    let _ = writeln!(out, "    restart: unless-stopped");
    let _ = writeln!(out, "    user: \"{}\"", config.identity.container_user);
    let _ = writeln!(out, "    env_file: .env");
    let _ = writeln!(out, "    depends_on: [db]");
    let _ = writeln!(out, "    ports:");
    let _ = writeln!(out, "      - \"{}:{}:8080\"", net.bind_address, net.http_port);
    let _ = writeln!(out, "    volumes:");
    let _ = writeln!(out, "      - ./data:/var/lib/stackwright");
    let _ = writeln!(out, "      - ./logs:/var/log/stackwright");
    let _ = writeln!(out, "      - ./config/runtime.toml:/etc/stackwright/runtime.toml:ro");
    let _ = writeln!(out, "    healthcheck:");
    let _ = writeln!(
        out,
        "      test: [\"CMD\", \"wget\", \"-q\", \"-O-\", \"http://localhost:8080/health\"]"
    );
    let _ = writeln!(out, "      interval: 30s");
    let _ = writeln!(out, "      retries: 3");

    let _ = writeln!(out, "  db:");
    let _ = writeln!(out, "    image: {DATABASE_IMAGE}");
    let _ = writeln!(out, "    restart: unless-stopped");
    let _ = writeln!(out, "    env_file: .env");
    let _ = writeln!(out, "    command: [\"postgres\", \"-c\", \"shared_buffers={shared_buffers}MB\"]");
    let _ = writeln!(out, "    volumes:");
    let _ = writeln!(out, "      - ./data/postgres:/var/lib/postgresql/data");
    let _ = writeln!(out, "      - ./backups:/backups");

    let _ = writeln!(out, "  metrics:");
    let _ = writeln!(out, "    image: {METRICS_IMAGE}");
    let _ = writeln!(out, "    restart: unless-stopped");
    let _ = writeln!(out, "    profiles: [\"metrics\"]");
    let _ = writeln!(out, "    volumes:");
    let _ = writeln!(
        out,
        "      - ./{}:/etc/prometheus/prometheus.yml:ro",
        relative(layout, &layout.metrics_config_file())
    );
    out
}

fn relative(layout: &TargetLayout, path: &std::path::Path) -> String {
    path.strip_prefix(layout.root())
        .unwrap_or(path)
        .display()
        .to_string()
}

/// `<root>/compose.yaml`, readable by the service group.
pub struct ComposeFile;

impl Phase for ComposeFile {
    fn key(&self) -> &'static str {
        "compose-file"
    }

    fn name(&self) -> &'static str {
        "Write compose file"
    }

    fn run(&self, ctx: &InstallContext<'_>) -> Result<(), CoreError> {
        let content = render_compose(ctx.config, &ctx.layout);
        ctx.files.write_owned_file(
            &ctx.layout.compose_file(),
            content.as_bytes(),
            0o640,
            &ctx.service_owner(),
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phases::testing::{config, config_with, context_with, ROOT};
    use crate::phases::ServiceRoot;
    use stackwright_runtime::SimulatedHost;

    #[test]
    fn credentials_default_the_admin_email() {
        let env = render_credentials(&config("")).unwrap();
        assert!(env.contains("ADMIN_EMAIL=admin@stack.example.org\n"));
        assert!(env.contains("ADMIN_PASSWORD=admin-secret\n"));
        assert!(env.contains("POSTGRES_PASSWORD=db-secret-value\n"));
    }

    #[test]
    fn missing_credentials_name_the_field() {
        let mut cfg = config("");
        cfg.credentials.database_password = None;
        let err = render_credentials(&cfg).unwrap_err();
        assert!(err.to_string().contains("credentials.database_password"));
    }

    #[test]
    fn multi_line_secrets_are_rejected() {
        let mut cfg = config("");
        cfg.credentials.admin_password = Some("a\nEVIL=1".to_owned());
        assert!(render_credentials(&cfg).is_err());
    }

    #[test]
    fn runtime_config_follows_environment() {
        let cfg = config_with("environment = \"development\"\n", "");
        let text = render_runtime_config(&cfg).unwrap();
        let parsed: toml::Value = toml::from_str(&text).unwrap();
        assert_eq!(parsed["environment"].as_str(), Some("development"));
        assert_eq!(parsed["log_level"].as_str(), Some("debug"));
        assert_eq!(parsed["database"]["memory_mb"].as_integer(), Some(256));
        assert_eq!(parsed["server"]["http_port"].as_integer(), Some(8080));
    }

    #[test]
    fn compose_gates_metrics_behind_a_profile() {
        let cfg = config("container_user = \"1001\"\n");
        let yaml = render_compose(&cfg, &crate::layout::TargetLayout::new(ROOT));
        assert!(yaml.contains("user: \"1001\""));
        assert!(yaml.contains("profiles: [\"metrics\"]"));
        assert!(yaml.contains("./config/metrics.yml:/etc/prometheus/prometheus.yml:ro"));
        assert!(yaml.contains("\"0.0.0.0:8080:8080\""));
    }

    #[test]
    fn secret_files_are_service_owned_and_private() {
        let host = SimulatedHost::permissive();
        let cfg = config("");
        let dir = tempfile::tempdir().unwrap();
        let ctx = context_with(&cfg, &host, dir.path());
        ServiceRoot.run(&ctx).unwrap();
        crate::phases::DirectoryTree.run(&ctx).unwrap();
        CredentialsFile.run(&ctx).unwrap();
        RuntimeConfig.run(&ctx).unwrap();
        ComposeFile.run(&ctx).unwrap();

        let snap = host.snapshot();
        for (path, mode) in [
            (ctx.layout.credentials_file(), 0o600),
            (ctx.layout.runtime_config_file(), 0o600),
            (ctx.layout.compose_file(), 0o640),
        ] {
            let node = &snap[&path];
            assert_eq!(node.owner, "stackwright", "{}", path.display());
            assert_eq!(node.mode & 0o7777, mode, "{}", path.display());
        }
        assert!(!host.can_read("alice", ctx.layout.credentials_file()));
        // Staged copies never outlive the write.
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
