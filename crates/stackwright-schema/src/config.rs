use crate::detect::HostFacts;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Placeholder written into config snapshots in place of secrets.
pub const REDACTED: &str = "<redacted>";

const MIN_PASSWORD_LEN: usize = 12;
const MAX_WORKERS: u32 = 256;
const MIN_DATABASE_MEMORY_MB: u32 = 128;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    ParseToml(#[from] toml::de::Error),
    #[error("invalid value for `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
    #[error("config serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ConfigError {
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Production,
    Staging,
    Development,
}

impl std::fmt::Display for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Environment::Production => write!(f, "production"),
            Environment::Staging => write!(f, "staging"),
            Environment::Development => write!(f, "development"),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct InstallConfig {
    #[serde(default)]
    pub environment: Environment,
    /// Feature ids or `category:<name>` entries to skip. Empty installs everything.
    #[serde(default)]
    pub exclude_features: Vec<String>,
    #[serde(default)]
    pub identity: IdentitySection,
    pub network: NetworkSection,
    #[serde(default)]
    pub credentials: CredentialsSection,
    #[serde(default)]
    pub performance: PerformanceSection,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct IdentitySection {
    /// Dedicated, non-interactive account that owns everything under `install_root`.
    pub service_user: String,
    pub service_group: Option<String>,
    pub install_root: PathBuf,
    /// Identity the containers write shared files as (name or numeric uid).
    pub container_user: String,
    /// Operator account running the installer. Auto-detected when absent.
    pub invoking_user: Option<String>,
    /// Group used for shared directories when ACLs are unavailable.
    pub shared_group: Option<String>,
}

impl Default for IdentitySection {
    fn default() -> Self {
        Self {
            service_user: "stackwright".to_owned(),
            service_group: None,
            install_root: PathBuf::from("/opt/stackwright"),
            container_user: "1000".to_owned(),
            invoking_user: None,
            shared_group: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct NetworkSection {
    pub domain: String,
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_http_port")]
    pub http_port: u16,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct CredentialsSection {
    #[serde(default)]
    pub admin_email: Option<String>,
    #[serde(default)]
    pub admin_password: Option<String>,
    #[serde(default)]
    pub database_password: Option<String>,
}

impl CredentialsSection {
    pub const GENERATED: [&'static str; 2] = ["admin_password", "database_password"];

    /// Fill every missing secret from `source`. Existing values are kept.
    pub fn fill_missing<E>(
        &mut self,
        mut source: impl FnMut(&str) -> Result<String, E>,
    ) -> Result<(), E> {
        if self.admin_password.is_none() {
            self.admin_password = Some(source("admin_password")?);
        }
        if self.database_password.is_none() {
            self.database_password = Some(source("database_password")?);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct PerformanceSection {
    #[serde(default)]
    pub workers: Option<u32>,
    #[serde(default)]
    pub database_memory_mb: Option<u32>,
}

fn default_bind_address() -> String {
    "0.0.0.0".to_owned()
}

fn default_http_port() -> u16 {
    8080
}

impl InstallConfig {
    /// Parse, auto-detect missing host-derived values, and validate.
    pub fn load(path: &Path, facts: &HostFacts) -> Result<Self, ConfigError> {
        let mut config = parse_config_file(path)?;
        config.apply_host_facts(facts);
        config.validate()?;
        Ok(config)
    }

    /// Fill values that were left for auto-detection. Never overrides explicit values.
    pub fn apply_host_facts(&mut self, facts: &HostFacts) {
        if self.identity.invoking_user.is_none() {
            self.identity.invoking_user.clone_from(&facts.invoking_user);
        }
        if self.performance.workers.is_none() {
            self.performance.workers = Some(facts.cpus.clamp(1, MAX_WORKERS));
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_account_name("identity.service_user", &self.identity.service_user)?;
        if let Some(ref group) = self.identity.service_group {
            validate_account_name("identity.service_group", group)?;
        }
        if let Some(ref group) = self.identity.shared_group {
            validate_account_name("identity.shared_group", group)?;
        }
        if let Some(ref user) = self.identity.invoking_user {
            validate_account_name("identity.invoking_user", user)?;
        } else {
            return Err(ConfigError::invalid(
                "identity.invoking_user",
                "could not be detected; set it explicitly",
            ));
        }
        if self.identity.container_user.trim().is_empty() {
            return Err(ConfigError::invalid(
                "identity.container_user",
                "must not be empty",
            ));
        }

        let root = &self.identity.install_root;
        if !root.is_absolute() {
            return Err(ConfigError::invalid(
                "identity.install_root",
                format!("'{}' is not an absolute path", root.display()),
            ));
        }
        if root.parent().is_none() {
            return Err(ConfigError::invalid(
                "identity.install_root",
                "must not be the filesystem root",
            ));
        }

        let domain = self.network.domain.trim();
        if domain.is_empty() {
            return Err(ConfigError::invalid("network.domain", "must not be empty"));
        }
        if domain
            .chars()
            .any(|c| c.is_whitespace() || c == '/' || c == ':')
        {
            return Err(ConfigError::invalid(
                "network.domain",
                format!("'{domain}' is not a bare host name"),
            ));
        }
        if self.network.http_port == 0 {
            return Err(ConfigError::invalid("network.http_port", "must be 1-65535"));
        }
        if self.network.bind_address.trim().is_empty() {
            return Err(ConfigError::invalid(
                "network.bind_address",
                "must not be empty",
            ));
        }

        if let Some(ref email) = self.credentials.admin_email {
            if !email.contains('@') {
                return Err(ConfigError::invalid(
                    "credentials.admin_email",
                    format!("'{email}' is not an email address"),
                ));
            }
        }
        for (field, value) in [
            (
                "credentials.admin_password",
                &self.credentials.admin_password,
            ),
            (
                "credentials.database_password",
                &self.credentials.database_password,
            ),
        ] {
            if let Some(secret) = value {
                if secret.len() < MIN_PASSWORD_LEN {
                    return Err(ConfigError::invalid(
                        field,
                        format!("must be at least {MIN_PASSWORD_LEN} characters"),
                    ));
                }
                if secret.contains(['\n', '\r']) {
                    return Err(ConfigError::invalid(field, "must be a single line"));
                }
            }
        }

        if let Some(workers) = self.performance.workers {
            if workers == 0 || workers > MAX_WORKERS {
                return Err(ConfigError::invalid(
                    "performance.workers",
                    format!("must be 1-{MAX_WORKERS}"),
                ));
            }
        }
        if let Some(mem) = self.performance.database_memory_mb {
            if mem < MIN_DATABASE_MEMORY_MB {
                return Err(ConfigError::invalid(
                    "performance.database_memory_mb",
                    format!("must be at least {MIN_DATABASE_MEMORY_MB}"),
                ));
            }
        }

        for entry in &self.exclude_features {
            if entry.trim().is_empty() {
                return Err(ConfigError::invalid(
                    "exclude_features",
                    "entries must not be empty",
                ));
            }
        }
        Ok(())
    }

    pub fn service_group(&self) -> &str {
        self.identity
            .service_group
            .as_deref()
            .unwrap_or(&self.identity.service_user)
    }

    pub fn shared_group(&self) -> &str {
        self.identity
            .shared_group
            .as_deref()
            .unwrap_or_else(|| self.service_group())
    }

    pub fn invoking_user(&self) -> &str {
        self.identity.invoking_user.as_deref().unwrap_or("root")
    }

    pub fn workers(&self) -> u32 {
        self.performance.workers.unwrap_or(1)
    }

    pub fn database_memory_mb(&self) -> u32 {
        self.performance
            .database_memory_mb
            .unwrap_or(match self.environment {
                Environment::Production => 1024,
                Environment::Staging => 512,
                Environment::Development => 256,
            })
    }

    pub fn log_level(&self) -> &'static str {
        match self.environment {
            Environment::Production => "warn",
            Environment::Staging => "info",
            Environment::Development => "debug",
        }
    }

    /// JSON view of the config with every secret replaced by [`REDACTED`].
    pub fn snapshot(&self) -> Result<serde_json::Value, ConfigError> {
        let mut value = serde_json::to_value(self)?;
        if let Some(creds) = value
            .get_mut("credentials")
            .and_then(serde_json::Value::as_object_mut)
        {
            for key in CredentialsSection::GENERATED {
                if let Some(slot) = creds.get_mut(key) {
                    if !slot.is_null() {
                        *slot = serde_json::Value::String(REDACTED.to_owned());
                    }
                }
            }
        }
        Ok(value)
    }

    /// Stable digest of the redacted snapshot, used to notice config changes on resume.
    pub fn fingerprint(&self) -> Result<String, ConfigError> {
        let json = serde_json::to_string(&self.snapshot()?)?;
        Ok(blake3::hash(json.as_bytes()).to_hex().to_string())
    }
}

fn validate_account_name(field: &'static str, name: &str) -> Result<(), ConfigError> {
    let valid_len = !name.is_empty() && name.len() <= 32;
    let valid_start = name
        .bytes()
        .next()
        .is_some_and(|b| b.is_ascii_lowercase() || b == b'_');
    let valid_chars = name
        .bytes()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_' || b == b'-');
    if valid_len && valid_start && valid_chars {
        Ok(())
    } else {
        Err(ConfigError::invalid(
            field,
            format!("'{name}' must match [a-z_][a-z0-9_-]{{0,31}}"),
        ))
    }
}

pub fn parse_config_str(input: &str) -> Result<InstallConfig, ConfigError> {
    Ok(toml::from_str(input)?)
}

pub fn parse_config_file(path: impl AsRef<Path>) -> Result<InstallConfig, ConfigError> {
    let content = fs::read_to_string(path)?;
    parse_config_str(&content)
}
