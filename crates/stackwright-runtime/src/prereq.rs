use std::fmt;
use std::process::Command;

/// A missing prerequisite with actionable install instructions.
#[derive(Debug)]
pub struct MissingPrereq {
    pub name: &'static str,
    pub purpose: &'static str,
    pub install_hint: &'static str,
}

impl fmt::Display for MissingPrereq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "  - {}: {} (install: {})",
            self.name, self.purpose, self.install_hint
        )
    }
}

pub(crate) fn command_exists(name: &str) -> bool {
    Command::new("which")
        .arg(name)
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

static REQUIRED: &[MissingPrereq] = &[
    MissingPrereq {
        name: "sudo",
        purpose: "privilege elevation for writes into the service tree",
        install_hint: "apt install sudo / dnf install sudo",
    },
    MissingPrereq {
        name: "setfacl",
        purpose: "shared write access to the log directory",
        install_hint: "apt install acl / dnf install acl",
    },
    MissingPrereq {
        name: "getfacl",
        purpose: "verifying access control lists",
        install_hint: "apt install acl / dnf install acl",
    },
    MissingPrereq {
        name: "docker",
        purpose: "running the application stack",
        install_hint: "https://docs.docker.com/engine/install/",
    },
    MissingPrereq {
        name: "crontab",
        purpose: "scheduled backups and health checks",
        install_hint: "apt install cron / dnf install cronie",
    },
    MissingPrereq {
        name: "stat",
        purpose: "inspecting ownership and modes",
        install_hint: "part of coreutils (usually pre-installed)",
    },
];

/// Check every tool the installer shells out to.
/// Returns a list of missing items. Empty list means all prerequisites are met.
pub fn check_install_prereqs() -> Vec<&'static MissingPrereq> {
    missing_from(command_exists)
}

fn missing_from(exists: impl Fn(&str) -> bool) -> Vec<&'static MissingPrereq> {
    REQUIRED.iter().filter(|p| !exists(p.name)).collect()
}

/// Format a list of missing prerequisites into a user-friendly error message.
pub fn format_missing(missing: &[&MissingPrereq]) -> String {
    let mut msg = String::from("missing prerequisites:\n");
    for m in missing {
        msg.push_str(&format!("{m}\n"));
    }
    msg.push_str("\nStackwright needs these tools to provision the host.");
    msg
}
