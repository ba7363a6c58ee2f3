use crate::acl::AclRule;
use crate::command::{self, CommandOutput, CommandSpec, RetryPolicy};
use crate::RuntimeError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

const PULL_TIMEOUT: Duration = Duration::from_secs(900);
const UP_TIMEOUT: Duration = Duration::from_secs(300);

/// `user` or `user:group`, as accepted by `chown`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Owner {
    pub user: String,
    pub group: Option<String>,
}

impl Owner {
    pub fn user(user: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            group: None,
        }
    }

    #[must_use]
    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }
}

impl fmt::Display for Owner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.group {
            Some(g) => write!(f, "{}:{g}", self.user),
            None => f.write_str(&self.user),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeChange {
    /// Absolute octal mode, e.g. `0o750`.
    Exact(u32),
    /// `g+rwX`: group gets read/write, and execute where anyone already has it.
    GroupShare,
    /// `g+s` on a directory so new entries inherit its group.
    SetGid,
}

impl fmt::Display for ModeChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exact(mode) => write!(f, "{mode:04o}"),
            Self::GroupShare => f.write_str("g+rwX"),
            Self::SetGid => f.write_str("g+s"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContainerAction {
    Version,
    Pull,
    Up { profiles: Vec<String> },
}

/// The closed set of operations the installer may perform with elevated
/// privileges. Nothing else is ever handed to the elevation mechanism.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrivilegedOp {
    MakeDir {
        path: PathBuf,
    },
    Chown {
        path: PathBuf,
        owner: Owner,
        recursive: bool,
    },
    ChangeGroup {
        path: PathBuf,
        group: String,
        recursive: bool,
    },
    Chmod {
        path: PathBuf,
        mode: ModeChange,
        recursive: bool,
    },
    CopyFile {
        from: PathBuf,
        to: PathBuf,
    },
    MoveFile {
        from: PathBuf,
        to: PathBuf,
    },
    /// Modify ACL entries without recalculating the mask (`setfacl -n`);
    /// the mask is always set explicitly.
    SetAcl {
        path: PathBuf,
        rules: Vec<AclRule>,
        recursive: bool,
        default: bool,
    },
    ReadAcl {
        path: PathBuf,
    },
    Inspect {
        path: PathBuf,
    },
    Container {
        project_dir: PathBuf,
        action: ContainerAction,
    },
    ReadSchedule {
        user: String,
    },
    WriteSchedule {
        user: String,
        table: String,
    },
}

impl PrivilegedOp {
    /// Short verb name, used for logging and for failure injection in tests.
    pub fn verb(&self) -> &'static str {
        match self {
            Self::MakeDir { .. } => "mkdir",
            Self::Chown { .. } => "chown",
            Self::ChangeGroup { .. } => "chgrp",
            Self::Chmod { .. } => "chmod",
            Self::CopyFile { .. } => "copy",
            Self::MoveFile { .. } => "move",
            Self::SetAcl { .. } => "setfacl",
            Self::ReadAcl { .. } => "getfacl",
            Self::Inspect { .. } => "stat",
            Self::Container { .. } => "container",
            Self::ReadSchedule { .. } => "crontab-read",
            Self::WriteSchedule { .. } => "crontab-write",
        }
    }

    /// The path this operation mutates or reads, if any.
    pub fn target(&self) -> Option<&Path> {
        match self {
            Self::MakeDir { path }
            | Self::Chown { path, .. }
            | Self::ChangeGroup { path, .. }
            | Self::Chmod { path, .. }
            | Self::SetAcl { path, .. }
            | Self::ReadAcl { path }
            | Self::Inspect { path } => Some(path),
            Self::CopyFile { to, .. } | Self::MoveFile { to, .. } => Some(to),
            Self::Container { project_dir, .. } => Some(project_dir),
            Self::ReadSchedule { .. } | Self::WriteSchedule { .. } => None,
        }
    }

    /// The unprivileged command line for this operation.
    pub fn to_command(&self) -> CommandSpec {
        fn p(path: &Path) -> String {
            path.to_string_lossy().into_owned()
        }
        match self {
            Self::MakeDir { path } => CommandSpec::new("mkdir").args(["-p".to_owned(), p(path)]),
            Self::Chown {
                path,
                owner,
                recursive,
            } => recursive_flag(CommandSpec::new("chown"), *recursive)
                .args([owner.to_string(), p(path)]),
            Self::ChangeGroup {
                path,
                group,
                recursive,
            } => recursive_flag(CommandSpec::new("chgrp"), *recursive)
                .args([group.clone(), p(path)]),
            Self::Chmod {
                path,
                mode,
                recursive,
            } => recursive_flag(CommandSpec::new("chmod"), *recursive)
                .args([mode.to_string(), p(path)]),
            Self::CopyFile { from, to } => CommandSpec::new("cp")
                .args(["-f", "--preserve=mode"])
                .args([p(from), p(to)]),
            Self::MoveFile { from, to } => {
                CommandSpec::new("mv").args(["-f".to_owned(), p(from), p(to)])
            }
            Self::SetAcl {
                path,
                rules,
                recursive,
                default,
            } => {
                let spec = recursive_flag(CommandSpec::new("setfacl"), *recursive);
                let spec = if *default { spec.arg("-d") } else { spec };
                let joined = rules
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(",");
                spec.args(["-n".to_owned(), "-m".to_owned(), joined, p(path)])
            }
            Self::ReadAcl { path } => CommandSpec::new("getfacl").args(["-p".to_owned(), p(path)]),
            Self::Inspect { path } => {
                CommandSpec::new("stat").args(["-c".to_owned(), "%U:%G:%a:%F".to_owned(), p(path)])
            }
            Self::Container {
                project_dir,
                action,
            } => {
                let compose = || {
                    CommandSpec::new("docker").args([
                        "compose".to_owned(),
                        "--project-directory".to_owned(),
                        p(project_dir),
                    ])
                };
                match action {
                    ContainerAction::Version => CommandSpec::new("docker").args([
                        "version",
                        "--format",
                        "{{.Server.Version}}",
                    ]),
                    ContainerAction::Pull => compose().arg("pull").timeout(PULL_TIMEOUT),
                    ContainerAction::Up { profiles } => {
                        let mut spec = compose();
                        for profile in profiles {
                            spec = spec.args(["--profile", profile.as_str()]);
                        }
                        spec.args(["up", "-d", "--remove-orphans"])
                            .timeout(UP_TIMEOUT)
                    }
                }
            }
            Self::ReadSchedule { user } => {
                CommandSpec::new("crontab").args(["-u".to_owned(), user.clone(), "-l".to_owned()])
            }
            Self::WriteSchedule { user, table } => CommandSpec::new("crontab")
                .args(["-u".to_owned(), user.clone(), "-".to_owned()])
                .stdin(table.clone()),
        }
    }

    pub fn describe(&self) -> String {
        self.to_command().display()
    }
}

fn recursive_flag(spec: CommandSpec, recursive: bool) -> CommandSpec {
    if recursive {
        spec.arg("-R")
    } else {
        spec
    }
}

/// Owner, group, and mode as reported by `stat`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathInfo {
    pub owner: String,
    pub group: String,
    pub mode: u32,
    pub is_dir: bool,
}

impl PathInfo {
    /// Parse the `%U:%G:%a:%F` format.
    pub fn parse(line: &str) -> Option<Self> {
        let mut parts = line.trim().splitn(4, ':');
        let owner = parts.next()?.to_owned();
        let group = parts.next()?.to_owned();
        let mode = u32::from_str_radix(parts.next()?, 8).ok()?;
        let kind = parts.next()?;
        Some(Self {
            owner,
            group,
            mode,
            is_dir: kind == "directory",
        })
    }
}

const DENIAL_MARKERS: &[&str] = &[
    "a password is required",
    "is not allowed to execute",
    "is not in the sudoers file",
    "may not run sudo",
    "a terminal is required",
];

const TRANSIENT_MARKERS: &[&str] = &[
    "Resource temporarily unavailable",
    "Could not get lock",
    "i/o timeout",
    "TLS handshake timeout",
    "connection reset by peer",
    "toomanyrequests",
    "Temporary failure in name resolution",
];

/// Map a non-zero exit into the error the caller should see.
pub fn classify_failure(op: &PrivilegedOp, command: &str, output: &CommandOutput) -> RuntimeError {
    let stderr = output.stderr.trim();
    if DENIAL_MARKERS.iter().any(|m| stderr.contains(m)) {
        return RuntimeError::ElevationDenied {
            command: command.to_owned(),
            detail: stderr.to_owned(),
        };
    }
    if matches!(op, PrivilegedOp::SetAcl { .. } | PrivilegedOp::ReadAcl { .. })
        && stderr.contains("Operation not supported")
    {
        let path = op
            .target()
            .map(|p| p.display().to_string())
            .unwrap_or_default();
        return RuntimeError::AclUnsupported(path);
    }
    if TRANSIENT_MARKERS.iter().any(|m| stderr.contains(m)) {
        return RuntimeError::Transient {
            command: command.to_owned(),
            detail: stderr.to_owned(),
        };
    }
    RuntimeError::CommandFailed {
        command: command.to_owned(),
        status: output.status,
        stderr: stderr.to_owned(),
    }
}

/// The single boundary through which elevated operations run.
///
/// Implementors provide [`execute`](Self::execute), which returns the raw
/// exit status and output. Callers go through [`run`](Self::run), which
/// turns non-zero exits into classified errors.
pub trait PrivilegedExecutor: Send + Sync {
    fn name(&self) -> &str;

    /// Check that elevation works without an interactive prompt.
    fn probe(&self) -> Result<(), RuntimeError>;

    fn execute(&self, op: &PrivilegedOp) -> Result<CommandOutput, RuntimeError>;

    /// Whether a user account exists on the host.
    fn identity_exists(&self, name: &str) -> Result<bool, RuntimeError>;

    fn run(&self, op: &PrivilegedOp) -> Result<CommandOutput, RuntimeError> {
        let output = self.execute(op)?;
        if output.success() {
            Ok(output)
        } else {
            Err(classify_failure(op, &op.describe(), &output))
        }
    }

    /// `stat` a path; `None` when it does not exist.
    fn inspect(&self, path: &Path) -> Result<Option<PathInfo>, RuntimeError> {
        let op = PrivilegedOp::Inspect {
            path: path.to_path_buf(),
        };
        match self.run(&op) {
            Ok(out) => PathInfo::parse(&out.stdout).map(Some).ok_or_else(|| {
                RuntimeError::UnexpectedOutput {
                    command: op.describe(),
                    detail: out.stdout.trim().to_owned(),
                }
            }),
            Err(RuntimeError::CommandFailed { ref stderr, .. })
                if stderr.contains("No such file or directory") =>
            {
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

impl<E: PrivilegedExecutor + ?Sized> PrivilegedExecutor for Box<E> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn probe(&self) -> Result<(), RuntimeError> {
        (**self).probe()
    }

    fn execute(&self, op: &PrivilegedOp) -> Result<CommandOutput, RuntimeError> {
        (**self).execute(op)
    }

    fn identity_exists(&self, name: &str) -> Result<bool, RuntimeError> {
        (**self).identity_exists(name)
    }

    fn run(&self, op: &PrivilegedOp) -> Result<CommandOutput, RuntimeError> {
        (**self).run(op)
    }
}

/// Runs operations through `sudo -n`, so a missing sudoers rule fails
/// immediately instead of hanging on a password prompt.
pub struct SudoExecutor {
    sudo: String,
}

impl SudoExecutor {
    pub fn new() -> Self {
        Self {
            sudo: "sudo".to_owned(),
        }
    }

    pub fn with_program(sudo: impl Into<String>) -> Self {
        Self { sudo: sudo.into() }
    }

    fn elevate(&self, spec: CommandSpec) -> CommandSpec {
        spec.wrapped(&self.sudo, &["-n"])
    }
}

impl Default for SudoExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl PrivilegedExecutor for SudoExecutor {
    fn name(&self) -> &str {
        "sudo"
    }

    fn probe(&self) -> Result<(), RuntimeError> {
        let spec = self.elevate(CommandSpec::new("true"));
        let out = command::run(&spec)?;
        if out.success() {
            return Ok(());
        }
        Err(RuntimeError::ElevationDenied {
            command: spec.display(),
            detail: out.stderr.trim().to_owned(),
        })
    }

    fn execute(&self, op: &PrivilegedOp) -> Result<CommandOutput, RuntimeError> {
        let spec = self.elevate(op.to_command());
        debug!("privileged {}: {}", op.verb(), spec.display());
        command::run(&spec)
    }

    fn identity_exists(&self, name: &str) -> Result<bool, RuntimeError> {
        let out = command::run(&CommandSpec::new("id").args(["-u", name]))?;
        Ok(out.success())
    }
}

/// Retries transient failures of the wrapped executor.
pub struct Retrying<E> {
    inner: E,
    policy: RetryPolicy,
}

impl<E: PrivilegedExecutor> Retrying<E> {
    pub fn new(inner: E, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn inner(&self) -> &E {
        &self.inner
    }
}

impl<E: PrivilegedExecutor> PrivilegedExecutor for Retrying<E> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn probe(&self) -> Result<(), RuntimeError> {
        self.inner.probe()
    }

    fn execute(&self, op: &PrivilegedOp) -> Result<CommandOutput, RuntimeError> {
        self.inner.execute(op)
    }

    fn identity_exists(&self, name: &str) -> Result<bool, RuntimeError> {
        self.inner.identity_exists(name)
    }

    fn run(&self, op: &PrivilegedOp) -> Result<CommandOutput, RuntimeError> {
        self.policy.run(&op.describe(), || self.inner.run(op))
    }
}

pub fn select_executor(name: &str) -> Result<Box<dyn PrivilegedExecutor>, RuntimeError> {
    match name {
        "sudo" => Ok(Box::new(SudoExecutor::new())),
        "simulated" => Ok(Box::new(crate::mock::SimulatedHost::permissive())),
        other => Err(RuntimeError::ExecutorUnavailable(other.to_owned())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acl::{AclTag, Perms};

    #[test]
    fn select_valid_executors() {
        assert_eq!(select_executor("sudo").unwrap().name(), "sudo");
        assert_eq!(select_executor("simulated").unwrap().name(), "simulated");
    }

    #[test]
    fn select_invalid_executor_fails() {
        assert!(matches!(
            select_executor("doas"),
            Err(RuntimeError::ExecutorUnavailable(_))
        ));
    }

    #[test]
    fn command_lines() {
        let op = PrivilegedOp::Chown {
            path: "/opt/app".into(),
            owner: Owner::user("svc").with_group("svc"),
            recursive: true,
        };
        assert_eq!(op.describe(), "chown -R svc:svc /opt/app");

        let op = PrivilegedOp::Chmod {
            path: "/opt/app/.env".into(),
            mode: ModeChange::Exact(0o600),
            recursive: false,
        };
        assert_eq!(op.describe(), "chmod 0600 /opt/app/.env");

        let op = PrivilegedOp::SetAcl {
            path: "/opt/app/logs".into(),
            rules: vec![
                AclRule::new(AclTag::User("alice".to_owned()), Perms::RWX),
                AclRule::new(AclTag::Mask, Perms::RWX),
            ],
            recursive: true,
            default: true,
        };
        assert_eq!(
            op.describe(),
            "setfacl -R -d -n -m u:alice:rwx,m::rwx /opt/app/logs"
        );

        let op = PrivilegedOp::Container {
            project_dir: "/opt/app".into(),
            action: ContainerAction::Up {
                profiles: vec!["metrics".to_owned()],
            },
        };
        assert_eq!(
            op.describe(),
            "docker compose --project-directory /opt/app --profile metrics up -d --remove-orphans"
        );
    }

    #[test]
    fn sudo_wraps_with_non_interactive_flag() {
        let exec = SudoExecutor::with_program("sudo");
        let spec = exec.elevate(
            PrivilegedOp::MakeDir {
                path: "/opt/app".into(),
            }
            .to_command(),
        );
        assert_eq!(spec.display(), "sudo -n mkdir -p /opt/app");
    }

    #[test]
    fn classify_denial() {
        let op = PrivilegedOp::MakeDir {
            path: "/opt/app".into(),
        };
        let out = CommandOutput::failed(1, "sudo: a password is required\n");
        assert!(classify_failure(&op, "mkdir", &out).is_elevation_denied());
        let out = CommandOutput::failed(
            1,
            "Sorry, user bob is not allowed to execute '/bin/mkdir -p /opt/app' as root.",
        );
        assert!(classify_failure(&op, "mkdir", &out).is_elevation_denied());
    }

    #[test]
    fn classify_acl_unsupported_only_for_acl_ops() {
        let op = PrivilegedOp::SetAcl {
            path: "/mnt/nfs/logs".into(),
            rules: vec![AclRule::new(AclTag::Mask, Perms::RWX)],
            recursive: false,
            default: false,
        };
        let out = CommandOutput::failed(1, "setfacl: /mnt/nfs/logs: Operation not supported");
        assert!(matches!(
            classify_failure(&op, "setfacl", &out),
            RuntimeError::AclUnsupported(ref p) if p == "/mnt/nfs/logs"
        ));

        let op = PrivilegedOp::Chmod {
            path: "/mnt/nfs/logs".into(),
            mode: ModeChange::SetGid,
            recursive: false,
        };
        assert!(matches!(
            classify_failure(&op, "chmod", &out),
            RuntimeError::CommandFailed { .. }
        ));
    }

    #[test]
    fn classify_transient() {
        let op = PrivilegedOp::Container {
            project_dir: "/opt/app".into(),
            action: ContainerAction::Pull,
        };
        let out = CommandOutput::failed(1, "Error response from daemon: toomanyrequests: slow down");
        assert!(classify_failure(&op, "pull", &out).is_transient());
    }

    #[test]
    fn parse_stat_output() {
        let info = PathInfo::parse("svc:svc:750:directory\n").unwrap();
        assert_eq!(info.owner, "svc");
        assert_eq!(info.mode, 0o750);
        assert!(info.is_dir);
        let info = PathInfo::parse("root:root:600:regular file").unwrap();
        assert!(!info.is_dir);
        assert!(PathInfo::parse("garbage").is_none());
    }
}
