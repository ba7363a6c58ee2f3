//! POSIX access-control lists for directories with several writers.
//!
//! The shared log directory is written by the operator, the service account,
//! and the container's numeric user. Plain owner/group bits cannot express
//! that, so the reconciler grants each identity an explicit entry plus a
//! default (inherited) entry, and then sets the mask explicitly: a mask
//! narrower than a grant silently reduces its effective permissions.

use crate::privileged::{ModeChange, PrivilegedExecutor, PrivilegedOp};
use crate::RuntimeError;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord, Serialize)]
pub struct Perms(u8);

impl Perms {
    pub const NONE: Self = Self(0);
    pub const READ: Self = Self(4);
    pub const WRITE: Self = Self(2);
    pub const EXEC: Self = Self(1);
    pub const RWX: Self = Self(7);

    pub const fn from_bits(bits: u32) -> Self {
        Self((bits & 7) as u8)
    }

    pub const fn bits(self) -> u32 {
        self.0 as u32
    }

    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    #[must_use]
    pub const fn intersect(self, other: Self) -> Self {
        Self(self.0 & other.0)
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Parse the `rwx` / `r-x` notation.
    pub fn parse(s: &str) -> Option<Self> {
        let b = s.as_bytes();
        if b.len() != 3 {
            return None;
        }
        let bit = |c: u8, want: u8, val: u8| match c {
            b'-' => Some(0),
            c if c == want => Some(val),
            _ => None,
        };
        Some(Self(bit(b[0], b'r', 4)? | bit(b[1], b'w', 2)? | bit(b[2], b'x', 1)?))
    }
}

impl fmt::Display for Perms {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let c = |bit: u8, ch: char| if self.0 & bit != 0 { ch } else { '-' };
        write!(f, "{}{}{}", c(4, 'r'), c(2, 'w'), c(1, 'x'))
    }
}

/// A named user or group. Users may be names or numeric ids.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(tag = "kind", content = "name", rename_all = "lowercase")]
pub enum Principal {
    User(String),
    Group(String),
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::User(u) => write!(f, "user {u}"),
            Self::Group(g) => write!(f, "group {g}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AclScope {
    /// Applies to the path itself.
    Explicit,
    /// Inherited by entries created later inside a directory.
    Default,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AccessEntry {
    pub principal: Principal,
    pub perms: Perms,
    pub scope: AclScope,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AclTag {
    User(String),
    Group(String),
    Mask,
}

/// One `setfacl -m` rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AclRule {
    pub tag: AclTag,
    pub perms: Perms,
}

impl AclRule {
    pub fn new(tag: AclTag, perms: Perms) -> Self {
        Self { tag, perms }
    }

    fn grant(principal: &Principal, perms: Perms) -> Self {
        let tag = match principal {
            Principal::User(u) => AclTag::User(u.clone()),
            Principal::Group(g) => AclTag::Group(g.clone()),
        };
        Self { tag, perms }
    }
}

impl fmt::Display for AclRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.tag {
            AclTag::User(u) => write!(f, "u:{u}:{}", self.perms),
            AclTag::Group(g) => write!(f, "g:{g}:{}", self.perms),
            AclTag::Mask => write!(f, "m::{}", self.perms),
        }
    }
}

/// The ACL of one path, in the shape `getfacl` reports it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AclSnapshot {
    pub owner: String,
    pub group: String,
    pub user_obj: Perms,
    pub group_obj: Perms,
    pub other: Perms,
    pub named: BTreeMap<Principal, Perms>,
    pub mask: Option<Perms>,
    pub default_named: BTreeMap<Principal, Perms>,
    pub default_mask: Option<Perms>,
}

impl AclSnapshot {
    /// Parse `getfacl -p` output. Unknown lines are ignored.
    pub fn parse(text: &str) -> Self {
        let mut snap = Self::default();
        for raw in text.lines() {
            let line = raw.trim();
            if let Some(header) = line.strip_prefix('#') {
                let header = header.trim();
                if let Some(owner) = header.strip_prefix("owner:") {
                    owner.trim().clone_into(&mut snap.owner);
                } else if let Some(group) = header.strip_prefix("group:") {
                    group.trim().clone_into(&mut snap.group);
                }
                continue;
            }
            // Drop the "#effective:" annotation getfacl adds when masked.
            let entry = line.split('#').next().unwrap_or("").trim();
            if entry.is_empty() {
                continue;
            }
            let (is_default, entry) = match entry.strip_prefix("default:") {
                Some(rest) => (true, rest),
                None => (false, entry),
            };
            let mut parts = entry.splitn(3, ':');
            let (Some(tag), Some(qualifier), Some(perms)) = (parts.next(), parts.next(), parts.next())
            else {
                continue;
            };
            let Some(perms) = Perms::parse(perms) else {
                continue;
            };
            snap.record(is_default, tag, qualifier, perms);
        }
        snap
    }

    fn record(&mut self, is_default: bool, tag: &str, qualifier: &str, perms: Perms) {
        let principal = match (tag, qualifier.is_empty()) {
            ("user", false) => Some(Principal::User(qualifier.to_owned())),
            ("group", false) => Some(Principal::Group(qualifier.to_owned())),
            _ => None,
        };
        match (is_default, principal, tag) {
            (false, Some(p), _) => {
                self.named.insert(p, perms);
            }
            (true, Some(p), _) => {
                self.default_named.insert(p, perms);
            }
            (false, None, "user") => self.user_obj = perms,
            (false, None, "group") => self.group_obj = perms,
            (false, None, "other") => self.other = perms,
            (false, None, "mask") => self.mask = Some(perms),
            (true, None, "mask") => self.default_mask = Some(perms),
            _ => {}
        }
    }

    /// What a named entry actually grants once the mask is applied.
    pub fn effective(&self, principal: &Principal, scope: AclScope) -> Option<Perms> {
        let (entries, mask) = match scope {
            AclScope::Explicit => (&self.named, self.mask),
            AclScope::Default => (&self.default_named, self.default_mask),
        };
        let granted = *entries.get(principal)?;
        Some(mask.map_or(granted, |m| granted.intersect(m)))
    }

    pub fn has_default(&self) -> bool {
        !self.default_named.is_empty() || self.default_mask.is_some()
    }

    /// Render in `getfacl -p` format.
    pub fn render(&self, path: &Path) -> String {
        let mut out = format!(
            "# file: {}\n# owner: {}\n# group: {}\n",
            path.display(),
            self.owner,
            self.group
        );
        let line = |out: &mut String, prefix: &str, tag: &str, q: &str, p: Perms| {
            out.push_str(&format!("{prefix}{tag}:{q}:{p}\n"));
        };
        line(&mut out, "", "user", "", self.user_obj);
        for (principal, perms) in &self.named {
            if let Principal::User(u) = principal {
                line(&mut out, "", "user", u, *perms);
            }
        }
        line(&mut out, "", "group", "", self.group_obj);
        for (principal, perms) in &self.named {
            if let Principal::Group(g) = principal {
                line(&mut out, "", "group", g, *perms);
            }
        }
        if let Some(mask) = self.mask {
            line(&mut out, "", "mask", "", mask);
        }
        line(&mut out, "", "other", "", self.other);
        if self.has_default() {
            for (principal, perms) in &self.default_named {
                let (tag, q) = match principal {
                    Principal::User(u) => ("user", u.as_str()),
                    Principal::Group(g) => ("group", g.as_str()),
                };
                line(&mut out, "default:", tag, q, *perms);
            }
            if let Some(mask) = self.default_mask {
                line(&mut out, "default:", "mask", "", mask);
            }
        }
        out
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ReconcileOutcome {
    /// Every requested entry is effective.
    Converged { passes: u32 },
    /// Still drifting after the pass budget; reported, not fatal.
    Drifted { passes: u32, mismatches: Vec<String> },
    /// The path does not exist yet.
    Missing,
    /// The filesystem has no ACL support; group sharing was used instead.
    GroupFallback { group: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub path: PathBuf,
    #[serde(flatten)]
    pub outcome: ReconcileOutcome,
}

impl ReconcileReport {
    pub fn is_converged(&self) -> bool {
        matches!(self.outcome, ReconcileOutcome::Converged { .. })
    }
}

pub struct AclReconciler<'a> {
    exec: &'a dyn PrivilegedExecutor,
    fallback_group: String,
    max_passes: u32,
}

impl<'a> AclReconciler<'a> {
    pub const DEFAULT_PASSES: u32 = 3;

    pub fn new(exec: &'a dyn PrivilegedExecutor, fallback_group: impl Into<String>) -> Self {
        Self {
            exec,
            fallback_group: fallback_group.into(),
            max_passes: Self::DEFAULT_PASSES,
        }
    }

    #[must_use]
    pub fn with_max_passes(mut self, passes: u32) -> Self {
        self.max_passes = passes.max(1);
        self
    }

    /// Give every identity full access to `path`, and to anything created
    /// under it later.
    pub fn reconcile_permissions(
        &self,
        path: &Path,
        identities: &[Principal],
    ) -> Result<ReconcileReport, RuntimeError> {
        let grants: Vec<(Principal, Perms)> =
            identities.iter().map(|p| (p.clone(), Perms::RWX)).collect();
        self.reconcile(path, &grants)
    }

    pub fn reconcile(
        &self,
        path: &Path,
        grants: &[(Principal, Perms)],
    ) -> Result<ReconcileReport, RuntimeError> {
        let report = |outcome| ReconcileReport {
            path: path.to_path_buf(),
            outcome,
        };
        let Some(info) = self.exec.inspect(path)? else {
            warn!(
                "{} does not exist; skipping permission reconciliation",
                path.display()
            );
            return Ok(report(ReconcileOutcome::Missing));
        };
        let wanted = desired_entries(grants, info.is_dir);

        let mut mismatches = Vec::new();
        for pass in 1..=self.max_passes {
            match self.apply(path, info.is_dir, grants) {
                Ok(()) => {}
                Err(RuntimeError::AclUnsupported(_)) => {
                    warn!(
                        "{} does not support ACLs; falling back to shared group '{}'",
                        path.display(),
                        self.fallback_group
                    );
                    self.group_fallback(path, info.is_dir, grants)?;
                    return Ok(report(ReconcileOutcome::GroupFallback {
                        group: self.fallback_group.clone(),
                    }));
                }
                Err(e) => return Err(e),
            }

            let snapshot = self.read_snapshot(path)?;
            mismatches = verify(&snapshot, &wanted);
            if mismatches.is_empty() {
                if pass > 1 {
                    info!(
                        "permissions on {} converged after {pass} passes",
                        path.display()
                    );
                } else {
                    debug!("permissions on {} converged", path.display());
                }
                return Ok(report(ReconcileOutcome::Converged { passes: pass }));
            }
            warn!(
                "permissions on {} changed underneath us (pass {pass}/{}): {}; re-applying",
                path.display(),
                self.max_passes,
                mismatches.join("; ")
            );
        }

        warn!(
            "permissions on {} did not converge; the external writer may still be resetting them",
            path.display()
        );
        Ok(report(ReconcileOutcome::Drifted {
            passes: self.max_passes,
            mismatches,
        }))
    }

    /// Let every identity search `dir` without reading or writing it.
    ///
    /// Only `dir` itself is changed; nothing below it is. Returns `false`
    /// when `dir` is missing or the filesystem has no ACLs.
    pub fn grant_traverse(&self, dir: &Path, identities: &[Principal]) -> Result<bool, RuntimeError> {
        if self.exec.inspect(dir)?.is_none() {
            return Ok(false);
        }
        let snapshot = self.read_snapshot(dir)?;
        let mut rules: Vec<AclRule> = identities
            .iter()
            .filter(|p| {
                !snapshot
                    .effective(p, AclScope::Explicit)
                    .is_some_and(|perms| perms.contains(Perms::EXEC))
            })
            .map(|p| {
                let held = snapshot.named.get(p).copied().unwrap_or(Perms::NONE);
                AclRule::grant(p, held.union(Perms::EXEC))
            })
            .collect();
        if rules.is_empty() {
            debug!("{} already searchable by every identity", dir.display());
            return Ok(true);
        }
        let mask = snapshot.mask.unwrap_or(snapshot.group_obj).union(Perms::EXEC);
        rules.push(AclRule::new(AclTag::Mask, mask));
        match self.set_acl(dir, rules, false, false) {
            Ok(()) => {
                debug!("granted search access on {}", dir.display());
                Ok(true)
            }
            Err(RuntimeError::AclUnsupported(_)) => {
                warn!(
                    "{} does not support ACLs; writers outside group '{}' cannot reach below it",
                    dir.display(),
                    self.fallback_group
                );
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    pub fn read_snapshot(&self, path: &Path) -> Result<AclSnapshot, RuntimeError> {
        let out = self.exec.run(&PrivilegedOp::ReadAcl {
            path: path.to_path_buf(),
        })?;
        Ok(AclSnapshot::parse(&out.stdout))
    }

    fn apply(
        &self,
        path: &Path,
        is_dir: bool,
        grants: &[(Principal, Perms)],
    ) -> Result<(), RuntimeError> {
        let rules: Vec<AclRule> = grants.iter().map(|(p, perms)| AclRule::grant(p, *perms)).collect();
        let mask = grants
            .iter()
            .fold(Perms::NONE, |acc, (_, perms)| acc.union(*perms));
        let mask_rule = vec![AclRule::new(AclTag::Mask, mask)];

        let scopes: &[bool] = if is_dir { &[false, true] } else { &[false] };
        for &default in scopes {
            for rules in [rules.clone(), mask_rule.clone()] {
                self.set_acl(path, rules, is_dir, default)?;
            }
        }
        Ok(())
    }

    fn set_acl(
        &self,
        path: &Path,
        rules: Vec<AclRule>,
        recursive: bool,
        default: bool,
    ) -> Result<(), RuntimeError> {
        let op = PrivilegedOp::SetAcl {
            path: path.to_path_buf(),
            rules,
            recursive,
            default,
        };
        match self.exec.run(&op) {
            Ok(_) => Ok(()),
            // Entries that vanish mid-walk (rotated logs) are expected.
            Err(RuntimeError::CommandFailed { ref stderr, .. })
                if recursive && stderr.contains("No such file or directory") =>
            {
                warn!("{}: some entries disappeared during ACL update", path.display());
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn group_fallback(
        &self,
        path: &Path,
        is_dir: bool,
        grants: &[(Principal, Perms)],
    ) -> Result<(), RuntimeError> {
        let group = &self.fallback_group;
        self.exec.run(&PrivilegedOp::ChangeGroup {
            path: path.to_path_buf(),
            group: group.clone(),
            recursive: is_dir,
        })?;
        self.exec.run(&PrivilegedOp::Chmod {
            path: path.to_path_buf(),
            mode: ModeChange::GroupShare,
            recursive: is_dir,
        })?;
        if is_dir {
            self.exec.run(&PrivilegedOp::Chmod {
                path: path.to_path_buf(),
                mode: ModeChange::SetGid,
                recursive: false,
            })?;
        }
        let names: Vec<String> = grants.iter().map(|(p, _)| p.to_string()).collect();
        warn!(
            "make sure {} belong to group '{group}' for write access to {}",
            names.join(", "),
            path.display()
        );
        Ok(())
    }
}

fn desired_entries(grants: &[(Principal, Perms)], is_dir: bool) -> Vec<AccessEntry> {
    let mut entries = Vec::new();
    for (principal, perms) in grants {
        entries.push(AccessEntry {
            principal: principal.clone(),
            perms: *perms,
            scope: AclScope::Explicit,
        });
        if is_dir {
            entries.push(AccessEntry {
                principal: principal.clone(),
                perms: *perms,
                scope: AclScope::Default,
            });
        }
    }
    entries
}

fn verify(snapshot: &AclSnapshot, wanted: &[AccessEntry]) -> Vec<String> {
    wanted
        .iter()
        .filter_map(|entry| {
            let actual = snapshot.effective(&entry.principal, entry.scope);
            if actual == Some(entry.perms) {
                return None;
            }
            let scope = match entry.scope {
                AclScope::Explicit => "",
                AclScope::Default => "default ",
            };
            Some(format!(
                "{scope}{} has {} (want {})",
                entry.principal,
                actual.map_or_else(|| "no entry".to_owned(), |p| p.to_string()),
                entry.perms
            ))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{ExternalReset, InjectedFailure, SimulatedHost};
    use crate::privileged::Owner;

    const GETFACL: &str = "\
# file: /opt/app/logs
# owner: svc
# group: svc
# flags: -s-
user::rwx
user:alice:rwx\t\t\t#effective:r-x
user:1000:rwx
group::r-x
mask::r-x
other::---
default:user::rwx
default:user:alice:rwx
default:group::r-x
default:mask::rwx
default:other::---
";

    fn identities() -> Vec<Principal> {
        vec![
            Principal::User("alice".to_owned()),
            Principal::User("svc".to_owned()),
            Principal::User("1000".to_owned()),
        ]
    }

    fn host_with_logs() -> SimulatedHost {
        let host = SimulatedHost::new()
            .with_user("alice", &["alice"])
            .with_user("svc", &["svc"])
            .with_user("1000", &[]);
        host.seed_dir("/opt/app/logs", "svc", "svc", 0o755);
        host
    }

    #[test]
    fn perms_parse_and_display() {
        assert_eq!(Perms::parse("rwx"), Some(Perms::RWX));
        assert_eq!(Perms::parse("r-x"), Some(Perms::READ.union(Perms::EXEC)));
        assert_eq!(Perms::parse("---"), Some(Perms::NONE));
        assert_eq!(Perms::parse("rw"), None);
        assert_eq!(Perms::parse("xwr"), None);
        assert_eq!(Perms::from_bits(0o5).to_string(), "r-x");
    }

    #[test]
    fn snapshot_parses_getfacl_output() {
        let snap = AclSnapshot::parse(GETFACL);
        assert_eq!(snap.owner, "svc");
        assert_eq!(snap.group, "svc");
        assert_eq!(snap.mask, Some(Perms::parse("r-x").unwrap()));
        assert_eq!(snap.other, Perms::NONE);
        let alice = Principal::User("alice".to_owned());
        assert_eq!(snap.named.get(&alice), Some(&Perms::RWX));
        assert_eq!(snap.default_mask, Some(Perms::RWX));
        assert!(snap.has_default());
    }

    #[test]
    fn mask_limits_effective_permissions() {
        let snap = AclSnapshot::parse(GETFACL);
        let alice = Principal::User("alice".to_owned());
        assert_eq!(
            snap.effective(&alice, AclScope::Explicit),
            Perms::parse("r-x")
        );
        assert_eq!(snap.effective(&alice, AclScope::Default), Some(Perms::RWX));
        assert_eq!(
            snap.effective(&Principal::User("bob".to_owned()), AclScope::Explicit),
            None
        );
    }

    #[test]
    fn render_round_trips_through_parse() {
        let snap = AclSnapshot::parse(GETFACL);
        let again = AclSnapshot::parse(&snap.render(Path::new("/opt/app/logs")));
        assert_eq!(snap, again);
    }

    #[test]
    fn rule_rendering() {
        assert_eq!(
            AclRule::new(AclTag::User("1000".to_owned()), Perms::RWX).to_string(),
            "u:1000:rwx"
        );
        assert_eq!(
            AclRule::new(AclTag::Group("ops".to_owned()), Perms::READ).to_string(),
            "g:ops:r--"
        );
        assert_eq!(AclRule::new(AclTag::Mask, Perms::RWX).to_string(), "m::rwx");
    }

    #[test]
    fn grants_become_effective_despite_narrow_group_bits() {
        let host = host_with_logs();
        let acl = AclReconciler::new(&host, "svc");
        let report = acl
            .reconcile_permissions(Path::new("/opt/app/logs"), &identities())
            .unwrap();
        assert_eq!(report.outcome, ReconcileOutcome::Converged { passes: 1 });

        let snap = acl.read_snapshot(Path::new("/opt/app/logs")).unwrap();
        for who in identities() {
            assert_eq!(snap.effective(&who, AclScope::Explicit), Some(Perms::RWX));
            assert_eq!(snap.effective(&who, AclScope::Default), Some(Perms::RWX));
        }
        assert!(host.create_file_as("1000", "/opt/app/logs/app.log").is_ok());
        assert!(host.create_file_as("alice", "/opt/app/logs/alice.log").is_ok());
    }

    #[test]
    fn new_entries_inherit_access() {
        let host = host_with_logs();
        let acl = AclReconciler::new(&host, "svc");
        acl.reconcile_permissions(Path::new("/opt/app/logs"), &identities())
            .unwrap();
        host.create_file_as("1000", "/opt/app/logs/worker.log").unwrap();
        assert!(host.can_write("alice", "/opt/app/logs/worker.log"));
        assert!(host.can_write("svc", "/opt/app/logs/worker.log"));
    }

    #[test]
    fn missing_path_is_skipped() {
        let host = host_with_logs();
        let acl = AclReconciler::new(&host, "svc");
        let report = acl
            .reconcile_permissions(Path::new("/opt/app/nope"), &identities())
            .unwrap();
        assert_eq!(report.outcome, ReconcileOutcome::Missing);
        assert!(host
            .operations()
            .iter()
            .all(|op| !op.starts_with("setfacl")));
    }

    #[test]
    fn reconciling_twice_changes_nothing() {
        let host = host_with_logs();
        let acl = AclReconciler::new(&host, "svc");
        acl.reconcile_permissions(Path::new("/opt/app/logs"), &identities())
            .unwrap();
        let before = host.snapshot();
        let report = acl
            .reconcile_permissions(Path::new("/opt/app/logs"), &identities())
            .unwrap();
        assert!(report.is_converged());
        assert_eq!(before, host.snapshot());
    }

    #[test]
    fn reset_during_reconciliation_is_repaired() {
        let host = host_with_logs();
        // Something resets the tree right after our explicit mask is set.
        host.reset_after(
            "setfacl",
            2,
            ExternalReset::new("/opt/app/logs", Owner::user("root").with_group("root"), 0o700),
        );
        let acl = AclReconciler::new(&host, "svc");
        let report = acl
            .reconcile_permissions(Path::new("/opt/app/logs"), &identities())
            .unwrap();
        assert_eq!(report.outcome, ReconcileOutcome::Converged { passes: 2 });
        assert!(host.create_file_as("1000", "/opt/app/logs/app.log").is_ok());
    }

    #[test]
    fn persistent_drift_is_reported_not_fatal() {
        let host = host_with_logs();
        for n in [2, 6, 10] {
            host.reset_after(
                "setfacl",
                n,
                ExternalReset::new("/opt/app/logs", Owner::user("root"), 0o700),
            );
        }
        let acl = AclReconciler::new(&host, "svc");
        let report = acl
            .reconcile_permissions(Path::new("/opt/app/logs"), &identities())
            .unwrap();
        match report.outcome {
            ReconcileOutcome::Drifted { passes, mismatches } => {
                assert_eq!(passes, 3);
                assert!(!mismatches.is_empty());
            }
            other => panic!("expected drift, got {other:?}"),
        }
    }

    #[test]
    fn falls_back_to_group_sharing_without_acl_support() {
        let host = host_with_logs().without_acl_support();
        let acl = AclReconciler::new(&host, "stackwright");
        let report = acl
            .reconcile_permissions(Path::new("/opt/app/logs"), &identities())
            .unwrap();
        assert_eq!(
            report.outcome,
            ReconcileOutcome::GroupFallback {
                group: "stackwright".to_owned()
            }
        );
        let info = host.inspect(Path::new("/opt/app/logs")).unwrap().unwrap();
        assert_eq!(info.group, "stackwright");
        assert_eq!(info.mode & 0o070, 0o070);
        assert_eq!(info.mode & 0o2000, 0o2000);
    }

    #[test]
    fn traverse_grant_only_adds_search() {
        let host = host_with_logs();
        host.seed_dir("/opt/app", "svc", "svc", 0o750);
        host.seed_file("/opt/app/.env", "svc", 0o600, b"SECRET=1\n");
        assert!(!host.can_traverse("alice", "/opt/app/logs"));

        let acl = AclReconciler::new(&host, "svc");
        assert!(acl.grant_traverse(Path::new("/opt/app"), &identities()).unwrap());
        assert!(host.can_traverse("alice", "/opt/app/logs"));
        assert!(!host.can_read("alice", "/opt/app"));
        assert!(!host.can_read("alice", "/opt/app/.env"));

        let snap = acl.read_snapshot(Path::new("/opt/app")).unwrap();
        let alice = Principal::User("alice".to_owned());
        assert_eq!(snap.effective(&alice, AclScope::Explicit), Some(Perms::EXEC));
        assert!(!snap.has_default());
        // The owning group keeps its r-x.
        assert_eq!(snap.mask, Some(Perms::READ.union(Perms::EXEC)));
        assert_eq!(host.inspect(Path::new("/opt/app/.env")).unwrap().unwrap().mode, 0o600);

        let before = host.snapshot();
        assert!(acl.grant_traverse(Path::new("/opt/app"), &identities()).unwrap());
        assert_eq!(before, host.snapshot());
    }

    #[test]
    fn traverse_grant_without_acl_support_is_a_warning() {
        let host = host_with_logs().without_acl_support();
        host.seed_dir("/opt/app", "svc", "svc", 0o750);
        let acl = AclReconciler::new(&host, "svc");
        assert!(!acl.grant_traverse(Path::new("/opt/app"), &identities()).unwrap());
        assert!(!acl.grant_traverse(Path::new("/opt/nope"), &identities()).unwrap());
    }

    #[test]
    fn elevation_denial_propagates() {
        let host = host_with_logs();
        host.fail_next("setfacl", InjectedFailure::Denied);
        let acl = AclReconciler::new(&host, "svc");
        let err = acl
            .reconcile_permissions(Path::new("/opt/app/logs"), &identities())
            .unwrap_err();
        assert!(err.is_elevation_denied());
    }
}
