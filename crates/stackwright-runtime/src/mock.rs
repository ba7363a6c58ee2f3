//! An in-memory host for exercising the installer without root.
//!
//! `SimulatedHost` models just enough of a Linux filesystem to make the
//! privileged verbs meaningful: ownership, mode bits, POSIX ACLs with an
//! explicit mask (modifications behave like `setfacl -n`), default ACL
//! inheritance, and the interaction between `chmod` group bits and the mask.
//! Failures, elevation denial, and external permission resets can be
//! injected per verb. Command output mimics the real tools so the same
//! classification and parsing code runs against it.

use crate::acl::{AclRule, AclSnapshot, AclTag, Perms, Principal};
use crate::command::CommandOutput;
use crate::privileged::{ContainerAction, ModeChange, Owner, PrivilegedExecutor, PrivilegedOp};
use crate::RuntimeError;
use std::collections::BTreeMap;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

const UMASK: u32 = 0o022;
const SETGID: u32 = 0o2000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InjectedFailure {
    /// The elevation mechanism refuses (`sudo: a password is required`).
    Denied,
    Timeout,
    /// Momentary contention, worth retrying.
    Transient,
    /// A permanent failure with the given stderr.
    Error(String),
}

/// Another process (typically a container runtime) resetting ownership and
/// mode on a tree, the way `chown -R` plus `chmod -R` would.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalReset {
    pub path: PathBuf,
    pub owner: Owner,
    pub mode: u32,
}

impl ExternalReset {
    pub fn new(path: impl Into<PathBuf>, owner: Owner, mode: u32) -> Self {
        Self {
            path: path.into(),
            owner,
            mode,
        }
    }
}

/// Comparable view of one node, for idempotence checks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeSummary {
    pub owner: String,
    pub group: String,
    pub mode: u32,
    pub is_dir: bool,
    pub acl: String,
    pub content_len: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct DefaultAcl {
    user_obj: Perms,
    group_obj: Perms,
    other: Perms,
    named: BTreeMap<Principal, Perms>,
    mask: Perms,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Node {
    is_dir: bool,
    owner: String,
    group: String,
    /// With an extended ACL the group bits hold the mask.
    mode: u32,
    content: Vec<u8>,
    /// `Some` once the node carries an extended ACL.
    group_obj: Option<Perms>,
    named: BTreeMap<Principal, Perms>,
    default: Option<DefaultAcl>,
}

impl Node {
    fn new(is_dir: bool, owner: &str, group: &str, mode: u32) -> Self {
        Self {
            is_dir,
            owner: owner.to_owned(),
            group: group.to_owned(),
            mode,
            content: Vec::new(),
            group_obj: None,
            named: BTreeMap::new(),
            default: None,
        }
    }

    fn group_bits(&self) -> Perms {
        Perms::from_bits(self.mode >> 3)
    }

    fn set_group_bits(&mut self, perms: Perms) {
        self.mode = (self.mode & !0o070) | (perms.bits() << 3);
    }

    fn ensure_extended(&mut self) {
        if self.group_obj.is_none() {
            self.group_obj = Some(self.group_bits());
        }
    }

    fn chmod(&mut self, mode: u32) {
        let keep = if self.is_dir && mode & 0o7000 == 0 {
            self.mode & SETGID
        } else {
            0
        };
        self.mode = (mode & 0o7777) | keep;
    }

    fn snapshot(&self) -> AclSnapshot {
        let extended = self.group_obj.is_some();
        AclSnapshot {
            owner: self.owner.clone(),
            group: self.group.clone(),
            user_obj: Perms::from_bits(self.mode >> 6),
            group_obj: self.group_obj.unwrap_or_else(|| self.group_bits()),
            other: Perms::from_bits(self.mode),
            named: self.named.clone(),
            mask: extended.then(|| self.group_bits()),
            default_named: self
                .default
                .as_ref()
                .map(|d| d.named.clone())
                .unwrap_or_default(),
            default_mask: self.default.as_ref().map(|d| d.mask),
        }
    }

    /// A fresh child of `self`, honoring default ACL and setgid inheritance.
    fn child(&self, is_dir: bool, owner: &str, group: &str, create_mode: u32) -> Self {
        let group = if self.mode & SETGID != 0 {
            self.group.as_str()
        } else {
            group
        };
        let mut node = Self::new(is_dir, owner, group, create_mode & !UMASK);
        if let Some(def) = &self.default {
            let user = def.user_obj.intersect(Perms::from_bits(create_mode >> 6));
            let mask = def.mask.intersect(Perms::from_bits(create_mode >> 3));
            let other = def.other.intersect(Perms::from_bits(create_mode));
            node.mode = (user.bits() << 6) | (mask.bits() << 3) | other.bits();
            node.group_obj = Some(def.group_obj);
            node.named = def.named.clone();
            if is_dir {
                node.default = Some(def.clone());
            }
        }
        if is_dir && self.mode & SETGID != 0 {
            node.mode |= SETGID;
        }
        node
    }
}

struct HostState {
    nodes: BTreeMap<PathBuf, Node>,
    users: BTreeMap<String, Vec<String>>,
    log: Vec<String>,
    verb_counts: BTreeMap<&'static str, usize>,
    failures: Vec<(&'static str, InjectedFailure)>,
    resets: Vec<(&'static str, usize, ExternalReset)>,
    schedules: BTreeMap<String, String>,
    images_pulled: bool,
    running_profiles: Option<Vec<String>>,
    deny_all: bool,
}

pub struct SimulatedHost {
    state: Mutex<HostState>,
    acl_supported: bool,
    permissive: bool,
}

impl Default for SimulatedHost {
    fn default() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(PathBuf::from("/"), Node::new(true, "root", "root", 0o755));
        let mut users = BTreeMap::new();
        users.insert("root".to_owned(), vec!["root".to_owned()]);
        Self {
            state: Mutex::new(HostState {
                nodes,
                users,
                log: Vec::new(),
                verb_counts: BTreeMap::new(),
                failures: Vec::new(),
                resets: Vec::new(),
                schedules: BTreeMap::new(),
                images_pulled: false,
                running_profiles: None,
                deny_all: false,
            }),
            acl_supported: true,
            permissive: false,
        }
    }
}

impl SimulatedHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// A host on which every account name resolves.
    pub fn permissive() -> Self {
        Self {
            permissive: true,
            ..Self::default()
        }
    }

    /// Register an account. The first group is its primary group; with no
    /// groups, a group named after the user is assumed.
    #[must_use]
    pub fn with_user(self, name: &str, groups: &[&str]) -> Self {
        let groups = if groups.is_empty() {
            vec![name.to_owned()]
        } else {
            groups.iter().map(|g| (*g).to_owned()).collect()
        };
        self.state().users.insert(name.to_owned(), groups);
        self
    }

    #[must_use]
    pub fn without_acl_support(mut self) -> Self {
        self.acl_supported = false;
        self
    }

    fn state(&self) -> MutexGuard<'_, HostState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn seed_dir(&self, path: impl AsRef<Path>, owner: &str, group: &str, mode: u32) {
        let mut st = self.state();
        st.ensure_ancestors(path.as_ref());
        st.nodes.insert(
            path.as_ref().to_path_buf(),
            Node::new(true, owner, group, mode),
        );
    }

    pub fn seed_file(&self, path: impl AsRef<Path>, owner: &str, mode: u32, content: &[u8]) {
        let mut st = self.state();
        st.ensure_ancestors(path.as_ref());
        let mut node = Node::new(false, owner, owner, mode);
        node.content = content.to_vec();
        st.nodes.insert(path.as_ref().to_path_buf(), node);
    }

    /// Make the next matching operation fail.
    pub fn fail_next(&self, verb: &'static str, failure: InjectedFailure) {
        self.fail_times(verb, failure, 1);
    }

    pub fn fail_times(&self, verb: &'static str, failure: InjectedFailure, times: usize) {
        let mut st = self.state();
        for _ in 0..times {
            st.failures.push((verb, failure.clone()));
        }
    }

    /// Refuse every elevated operation from now on.
    pub fn deny_elevation(&self) {
        self.state().deny_all = true;
    }

    pub fn allow_elevation(&self) {
        self.state().deny_all = false;
    }

    /// Apply `reset` right after the `nth` execution of `verb`.
    pub fn reset_after(&self, verb: &'static str, nth: usize, reset: ExternalReset) {
        self.state().resets.push((verb, nth, reset));
    }

    /// Apply `reset` now.
    pub fn external_reset(&self, reset: &ExternalReset) {
        self.state().apply_reset(reset);
    }

    pub fn operations(&self) -> Vec<String> {
        self.state().log.clone()
    }

    pub fn count(&self, verb: &str) -> usize {
        self.state().verb_counts.get(verb).copied().unwrap_or(0)
    }

    pub fn exists(&self, path: impl AsRef<Path>) -> bool {
        self.state().nodes.contains_key(path.as_ref())
    }

    pub fn file_content(&self, path: impl AsRef<Path>) -> Option<Vec<u8>> {
        self.state()
            .nodes
            .get(path.as_ref())
            .filter(|n| !n.is_dir)
            .map(|n| n.content.clone())
    }

    pub fn schedule_for(&self, user: &str) -> Option<String> {
        self.state().schedules.get(user).cloned()
    }

    pub fn images_pulled(&self) -> bool {
        self.state().images_pulled
    }

    pub fn running_profiles(&self) -> Option<Vec<String>> {
        self.state().running_profiles.clone()
    }

    /// Every node at or below `root`, in path order.
    pub fn paths_under(&self, root: impl AsRef<Path>) -> Vec<PathBuf> {
        self.state()
            .nodes
            .keys()
            .filter(|p| p.starts_with(root.as_ref()))
            .cloned()
            .collect()
    }

    pub fn snapshot(&self) -> BTreeMap<PathBuf, NodeSummary> {
        self.state()
            .nodes
            .iter()
            .map(|(path, node)| {
                (
                    path.clone(),
                    NodeSummary {
                        owner: node.owner.clone(),
                        group: node.group.clone(),
                        mode: node.mode,
                        is_dir: node.is_dir,
                        acl: node.snapshot().render(path),
                        content_len: node.content.len(),
                    },
                )
            })
            .collect()
    }

    pub fn can_read(&self, user: &str, path: impl AsRef<Path>) -> bool {
        self.can(user, path.as_ref(), Perms::READ)
    }

    pub fn can_write(&self, user: &str, path: impl AsRef<Path>) -> bool {
        self.can(user, path.as_ref(), Perms::WRITE)
    }

    /// Whether `user` can resolve `path`, i.e. search every directory above it.
    pub fn can_traverse(&self, user: &str, path: impl AsRef<Path>) -> bool {
        self.state().can_traverse(user, path.as_ref())
    }

    fn can(&self, user: &str, path: &Path, wanted: Perms) -> bool {
        let st = self.state();
        st.can_traverse(user, path)
            && st
                .nodes
                .get(path)
                .is_some_and(|n| st.perms_for(user, n).contains(wanted))
    }

    /// Create (or truncate) a file the way an unprivileged process would.
    pub fn create_file_as(&self, user: &str, path: impl AsRef<Path>) -> Result<(), String> {
        let path = path.as_ref();
        let mut st = self.state();
        if !st.can_traverse(user, path) {
            return Err(format!("{user}: permission denied: {}", path.display()));
        }
        if let Some(existing) = st.nodes.get(path) {
            if !st.perms_for(user, existing).contains(Perms::WRITE) {
                return Err(format!("{user}: permission denied: {}", path.display()));
            }
            if let Some(node) = st.nodes.get_mut(path) {
                node.content.clear();
            }
            return Ok(());
        }
        let parent_path = path.parent().unwrap_or(Path::new("/"));
        let Some(parent) = st.nodes.get(parent_path) else {
            return Err(format!("{}: no such directory", parent_path.display()));
        };
        if !st
            .perms_for(user, parent)
            .contains(Perms::WRITE.union(Perms::EXEC))
        {
            return Err(format!("{user}: permission denied: {}", parent_path.display()));
        }
        let group = st.primary_group(user);
        let node = parent.child(false, user, &group, 0o666);
        st.nodes.insert(path.to_path_buf(), node);
        Ok(())
    }

    fn fail(&self, op: &PrivilegedOp, failure: InjectedFailure) -> Result<CommandOutput, RuntimeError> {
        match failure {
            InjectedFailure::Denied => Ok(CommandOutput::failed(1, "sudo: a password is required\n")),
            InjectedFailure::Timeout => Err(RuntimeError::Timeout {
                command: op.describe(),
                secs: op.to_command().timeout_duration().as_secs(),
            }),
            InjectedFailure::Transient => Ok(CommandOutput::failed(
                1,
                format!("{}: Resource temporarily unavailable\n", op.verb()),
            )),
            InjectedFailure::Error(stderr) => Ok(CommandOutput::failed(1, stderr)),
        }
    }
}

impl HostState {
    fn known_user(&self, name: &str, permissive: bool) -> bool {
        permissive || self.users.contains_key(name) || name.parse::<u32>().is_ok()
    }

    fn primary_group(&self, user: &str) -> String {
        self.users
            .get(user)
            .and_then(|g| g.first().cloned())
            .unwrap_or_else(|| user.to_owned())
    }

    fn in_group(&self, user: &str, group: &str) -> bool {
        self.users
            .get(user)
            .is_some_and(|gs| gs.iter().any(|g| g == group))
    }

    fn can_traverse(&self, user: &str, path: &Path) -> bool {
        path.ancestors().skip(1).all(|dir| {
            self.nodes
                .get(dir)
                .is_none_or(|n| self.perms_for(user, n).contains(Perms::EXEC))
        })
    }

    /// Standard POSIX ACL access check.
    fn perms_for(&self, user: &str, node: &Node) -> Perms {
        if user == "root" {
            return Perms::RWX;
        }
        if node.owner == user {
            return Perms::from_bits(node.mode >> 6);
        }
        let mask = node.group_obj.map(|_| node.group_bits());
        let masked = |p: Perms| mask.map_or(p, |m| p.intersect(m));
        if let Some(p) = node.named.get(&Principal::User(user.to_owned())) {
            return masked(*p);
        }
        let mut matched = None::<Perms>;
        if self.in_group(user, &node.group) {
            let owning = node.group_obj.unwrap_or_else(|| node.group_bits());
            matched = Some(owning);
        }
        for (principal, perms) in &node.named {
            if let Principal::Group(g) = principal {
                if self.in_group(user, g) {
                    matched = Some(matched.unwrap_or(Perms::NONE).union(*perms));
                }
            }
        }
        match matched {
            Some(p) => masked(p),
            None => Perms::from_bits(node.mode),
        }
    }

    fn ensure_ancestors(&mut self, path: &Path) {
        let ancestors: Vec<PathBuf> = path
            .ancestors()
            .skip(1)
            .map(Path::to_path_buf)
            .collect();
        for dir in ancestors.into_iter().rev() {
            if self.nodes.contains_key(&dir) {
                continue;
            }
            let parent = dir.parent().map(Path::to_path_buf);
            let node = match parent.as_ref().and_then(|p| self.nodes.get(p)) {
                Some(parent) => parent.child(true, "root", "root", 0o777),
                None => Node::new(true, "root", "root", 0o755),
            };
            self.nodes.insert(dir, node);
        }
    }

    fn targets(&self, path: &Path, recursive: bool) -> Vec<PathBuf> {
        if recursive {
            self.nodes
                .keys()
                .filter(|p| p.starts_with(path))
                .cloned()
                .collect()
        } else {
            vec![path.to_path_buf()]
        }
    }

    fn apply_reset(&mut self, reset: &ExternalReset) {
        for target in self.targets(&reset.path, true) {
            if let Some(node) = self.nodes.get_mut(&target) {
                node.owner.clone_from(&reset.owner.user);
                if let Some(group) = &reset.owner.group {
                    node.group.clone_from(group);
                }
                node.chmod(reset.mode);
            }
        }
    }

    fn missing(tool: &str, path: &Path) -> CommandOutput {
        CommandOutput::failed(
            1,
            format!("{tool}: cannot access '{}': No such file or directory\n", path.display()),
        )
    }

    fn apply(&mut self, op: &PrivilegedOp, acl_supported: bool, permissive: bool) -> CommandOutput {
        match op {
            PrivilegedOp::MakeDir { path } => {
                if let Some(node) = self.nodes.get(path) {
                    if !node.is_dir {
                        return CommandOutput::failed(
                            1,
                            format!("mkdir: cannot create directory '{}': File exists\n", path.display()),
                        );
                    }
                    return CommandOutput::ok("");
                }
                self.ensure_ancestors(path);
                let node = match path.parent().and_then(|p| self.nodes.get(p)) {
                    Some(parent) => parent.child(true, "root", "root", 0o777),
                    None => Node::new(true, "root", "root", 0o755),
                };
                self.nodes.insert(path.clone(), node);
                CommandOutput::ok("")
            }
            PrivilegedOp::Chown {
                path,
                owner,
                recursive,
            } => {
                if !self.nodes.contains_key(path) {
                    return Self::missing("chown", path);
                }
                if !self.known_user(&owner.user, permissive) {
                    return CommandOutput::failed(1, format!("chown: invalid user: '{owner}'\n"));
                }
                for target in self.targets(path, *recursive) {
                    if let Some(node) = self.nodes.get_mut(&target) {
                        node.owner.clone_from(&owner.user);
                        if let Some(group) = &owner.group {
                            node.group.clone_from(group);
                        }
                    }
                }
                CommandOutput::ok("")
            }
            PrivilegedOp::ChangeGroup {
                path,
                group,
                recursive,
            } => {
                if !self.nodes.contains_key(path) {
                    return Self::missing("chgrp", path);
                }
                for target in self.targets(path, *recursive) {
                    if let Some(node) = self.nodes.get_mut(&target) {
                        node.group.clone_from(group);
                    }
                }
                CommandOutput::ok("")
            }
            PrivilegedOp::Chmod {
                path,
                mode,
                recursive,
            } => {
                if !self.nodes.contains_key(path) {
                    return Self::missing("chmod", path);
                }
                for target in self.targets(path, *recursive) {
                    if let Some(node) = self.nodes.get_mut(&target) {
                        match mode {
                            ModeChange::Exact(m) => node.chmod(*m),
                            ModeChange::GroupShare => {
                                let any_exec = node.is_dir || node.mode & 0o111 != 0;
                                let mut bits = node.group_bits().union(Perms::READ).union(Perms::WRITE);
                                if any_exec {
                                    bits = bits.union(Perms::EXEC);
                                }
                                node.set_group_bits(bits);
                            }
                            ModeChange::SetGid => node.mode |= SETGID,
                        }
                    }
                }
                CommandOutput::ok("")
            }
            PrivilegedOp::CopyFile { from, to } => {
                let source = match self.nodes.get(from) {
                    Some(node) => Ok((node.content.clone(), node.mode & 0o7777)),
                    None => std::fs::read(from).and_then(|content| {
                        let mode = std::fs::metadata(from)?.permissions().mode() & 0o7777;
                        Ok((content, mode))
                    }),
                };
                let Ok((content, mode)) = source else {
                    return CommandOutput::failed(
                        1,
                        format!("cp: cannot stat '{}': No such file or directory\n", from.display()),
                    );
                };
                if let Some(existing) = self.nodes.get_mut(to) {
                    if existing.is_dir {
                        return CommandOutput::failed(
                            1,
                            format!("cp: cannot overwrite directory '{}'\n", to.display()),
                        );
                    }
                    existing.content = content;
                    existing.chmod(mode);
                    return CommandOutput::ok("");
                }
                let Some(parent) = to.parent().and_then(|p| self.nodes.get(p)) else {
                    return CommandOutput::failed(
                        1,
                        format!(
                            "cp: cannot create regular file '{}': No such file or directory\n",
                            to.display()
                        ),
                    );
                };
                let mut node = parent.child(false, "root", "root", 0o666);
                node.content = content;
                node.chmod(mode);
                self.nodes.insert(to.clone(), node);
                CommandOutput::ok("")
            }
            PrivilegedOp::MoveFile { from, to } => {
                let Some(node) = self.nodes.remove(from) else {
                    return CommandOutput::failed(
                        1,
                        format!("mv: cannot stat '{}': No such file or directory\n", from.display()),
                    );
                };
                self.nodes.insert(to.clone(), node);
                CommandOutput::ok("")
            }
            PrivilegedOp::SetAcl {
                path,
                rules,
                recursive,
                default,
            } => {
                if !acl_supported {
                    return CommandOutput::failed(
                        1,
                        format!("setfacl: {}: Operation not supported\n", path.display()),
                    );
                }
                let Some(node) = self.nodes.get(path) else {
                    return CommandOutput::failed(
                        1,
                        format!("setfacl: {}: No such file or directory\n", path.display()),
                    );
                };
                if *default && !node.is_dir && !*recursive {
                    return CommandOutput::failed(
                        1,
                        format!("setfacl: {}: Only directories can have default ACLs\n", path.display()),
                    );
                }
                for target in self.targets(path, *recursive) {
                    if let Some(node) = self.nodes.get_mut(&target) {
                        if *default {
                            if node.is_dir {
                                apply_default_rules(node, rules);
                            }
                        } else {
                            apply_access_rules(node, rules);
                        }
                    }
                }
                CommandOutput::ok("")
            }
            PrivilegedOp::ReadAcl { path } => match self.nodes.get(path) {
                Some(node) => CommandOutput::ok(node.snapshot().render(path)),
                None => CommandOutput::failed(
                    1,
                    format!("getfacl: {}: No such file or directory\n", path.display()),
                ),
            },
            PrivilegedOp::Inspect { path } => match self.nodes.get(path) {
                Some(node) => CommandOutput::ok(format!(
                    "{}:{}:{:o}:{}\n",
                    node.owner,
                    node.group,
                    node.mode,
                    if node.is_dir { "directory" } else { "regular file" }
                )),
                None => CommandOutput::failed(
                    1,
                    format!("stat: cannot statx '{}': No such file or directory\n", path.display()),
                ),
            },
            PrivilegedOp::Container {
                project_dir,
                action,
            } => match action {
                ContainerAction::Version => CommandOutput::ok("27.1.1\n"),
                ContainerAction::Pull | ContainerAction::Up { .. }
                    if !self.nodes.contains_key(&project_dir.join("compose.yaml")) =>
                {
                    CommandOutput::failed(1, "no configuration file provided: not found\n")
                }
                ContainerAction::Pull => {
                    self.images_pulled = true;
                    CommandOutput::ok("")
                }
                ContainerAction::Up { profiles } => {
                    self.images_pulled = true;
                    self.running_profiles = Some(profiles.clone());
                    CommandOutput::ok("")
                }
            },
            PrivilegedOp::ReadSchedule { user } => match self.schedules.get(user) {
                Some(table) => CommandOutput::ok(table.clone()),
                None => CommandOutput::failed(1, format!("no crontab for {user}\n")),
            },
            PrivilegedOp::WriteSchedule { user, table } => {
                self.schedules.insert(user.clone(), table.clone());
                CommandOutput::ok("")
            }
        }
    }
}

fn apply_access_rules(node: &mut Node, rules: &[AclRule]) {
    node.ensure_extended();
    for rule in rules {
        match &rule.tag {
            AclTag::User(u) => {
                node.named.insert(Principal::User(u.clone()), rule.perms);
            }
            AclTag::Group(g) => {
                node.named.insert(Principal::Group(g.clone()), rule.perms);
            }
            AclTag::Mask => node.set_group_bits(rule.perms),
        }
    }
}

fn apply_default_rules(node: &mut Node, rules: &[AclRule]) {
    let group_obj = node.group_obj.unwrap_or_else(|| node.group_bits());
    let user_obj = Perms::from_bits(node.mode >> 6);
    let other = Perms::from_bits(node.mode);
    let def = node.default.get_or_insert_with(|| DefaultAcl {
        user_obj,
        group_obj,
        other,
        named: BTreeMap::new(),
        mask: group_obj,
    });
    for rule in rules {
        match &rule.tag {
            AclTag::User(u) => {
                def.named.insert(Principal::User(u.clone()), rule.perms);
            }
            AclTag::Group(g) => {
                def.named.insert(Principal::Group(g.clone()), rule.perms);
            }
            AclTag::Mask => def.mask = rule.perms,
        }
    }
}

impl PrivilegedExecutor for SimulatedHost {
    fn name(&self) -> &str {
        "simulated"
    }

    fn probe(&self) -> Result<(), RuntimeError> {
        if self.state().deny_all {
            return Err(RuntimeError::ElevationDenied {
                command: "sudo -n true".to_owned(),
                detail: "sudo: a password is required".to_owned(),
            });
        }
        Ok(())
    }

    fn execute(&self, op: &PrivilegedOp) -> Result<CommandOutput, RuntimeError> {
        let mut st = self.state();
        st.log.push(op.describe());
        if st.deny_all {
            return Ok(CommandOutput::failed(1, "sudo: a password is required\n"));
        }
        let verb = op.verb();
        let count = {
            let c = st.verb_counts.entry(verb).or_insert(0);
            *c += 1;
            *c
        };
        if let Some(idx) = st.failures.iter().position(|(v, _)| *v == verb) {
            let (_, failure) = st.failures.remove(idx);
            drop(st);
            return self.fail(op, failure);
        }
        let out = st.apply(op, self.acl_supported, self.permissive);
        let due: Vec<ExternalReset> = st
            .resets
            .iter()
            .filter(|(v, n, _)| *v == verb && *n == count)
            .map(|(_, _, r)| r.clone())
            .collect();
        for reset in &due {
            st.apply_reset(reset);
        }
        Ok(out)
    }

    fn identity_exists(&self, name: &str) -> Result<bool, RuntimeError> {
        Ok(self.permissive || self.state().users.contains_key(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host() -> SimulatedHost {
        SimulatedHost::new()
            .with_user("svc", &["svc"])
            .with_user("alice", &["alice", "ops"])
    }

    #[test]
    fn mkdir_creates_ancestors() {
        let h = host();
        h.run(&PrivilegedOp::MakeDir {
            path: "/opt/app/data".into(),
        })
        .unwrap();
        assert!(h.exists("/opt"));
        assert!(h.exists("/opt/app"));
        let info = h.inspect(Path::new("/opt/app/data")).unwrap().unwrap();
        assert_eq!(info.owner, "root");
        assert_eq!(info.mode, 0o755);
        assert!(info.is_dir);
    }

    #[test]
    fn inspect_missing_is_none() {
        assert!(host().inspect(Path::new("/nowhere")).unwrap().is_none());
    }

    #[test]
    fn chown_rejects_unknown_user() {
        let h = host();
        h.seed_dir("/opt/app", "root", "root", 0o755);
        let err = h
            .run(&PrivilegedOp::Chown {
                path: "/opt/app".into(),
                owner: Owner::user("ghost"),
                recursive: false,
            })
            .unwrap_err();
        assert!(matches!(err, RuntimeError::CommandFailed { .. }));
    }

    #[test]
    fn chmod_on_acl_node_moves_the_mask() {
        let h = host();
        h.seed_dir("/srv/logs", "svc", "svc", 0o770);
        h.run(&PrivilegedOp::SetAcl {
            path: "/srv/logs".into(),
            rules: vec![AclRule::new(AclTag::User("alice".to_owned()), Perms::RWX)],
            recursive: false,
            default: false,
        })
        .unwrap();
        assert!(h.can_write("alice", "/srv/logs"));
        h.run(&PrivilegedOp::Chmod {
            path: "/srv/logs".into(),
            mode: ModeChange::Exact(0o750),
            recursive: false,
        })
        .unwrap();
        assert!(!h.can_write("alice", "/srv/logs"));
        assert!(h.can_read("alice", "/srv/logs"));
    }

    #[test]
    fn first_named_entry_takes_mask_from_group_bits() {
        let h = host();
        h.seed_dir("/srv/logs", "svc", "svc", 0o755);
        h.run(&PrivilegedOp::SetAcl {
            path: "/srv/logs".into(),
            rules: vec![AclRule::new(AclTag::User("alice".to_owned()), Perms::RWX)],
            recursive: false,
            default: false,
        })
        .unwrap();
        // Granted rwx, but the mask inherited r-x from the group bits.
        assert!(!h.can_write("alice", "/srv/logs"));
    }

    #[test]
    fn closed_parent_blocks_access_below_it() {
        let h = host();
        h.seed_dir("/srv/private", "svc", "svc", 0o700);
        h.seed_dir("/srv/private/open", "svc", "svc", 0o777);
        h.seed_file("/srv/private/open/notes", "svc", 0o666, b"");
        assert!(!h.can_traverse("alice", "/srv/private/open"));
        assert!(!h.can_write("alice", "/srv/private/open"));
        assert!(!h.can_read("alice", "/srv/private/open/notes"));
        assert!(h.create_file_as("alice", "/srv/private/open/new").is_err());

        h.run(&PrivilegedOp::SetAcl {
            path: "/srv/private".into(),
            rules: vec![
                AclRule::new(AclTag::User("alice".to_owned()), Perms::EXEC),
                AclRule::new(AclTag::Mask, Perms::EXEC),
            ],
            recursive: false,
            default: false,
        })
        .unwrap();
        assert!(h.can_write("alice", "/srv/private/open"));
        assert!(!h.can_read("alice", "/srv/private"));
        assert!(h.create_file_as("alice", "/srv/private/open/new").is_ok());
    }

    #[test]
    fn group_membership_grants_access() {
        let h = host();
        h.seed_dir("/srv/shared", "svc", "ops", 0o770);
        assert!(h.can_write("alice", "/srv/shared"));
        assert!(!h.can_read("nobody", "/srv/shared"));
    }

    #[test]
    fn copy_reads_host_files_and_preserves_mode() {
        let dir = tempfile::tempdir().unwrap();
        let staged = dir.path().join("staged");
        std::fs::write(&staged, b"SECRET=1\n").unwrap();
        std::fs::set_permissions(&staged, std::fs::Permissions::from_mode(0o600)).unwrap();

        let h = host();
        h.seed_dir("/opt/app", "svc", "svc", 0o750);
        h.run(&PrivilegedOp::CopyFile {
            from: staged,
            to: "/opt/app/.env".into(),
        })
        .unwrap();
        assert_eq!(h.file_content("/opt/app/.env").unwrap(), b"SECRET=1\n");
        let info = h.inspect(Path::new("/opt/app/.env")).unwrap().unwrap();
        assert_eq!(info.mode, 0o600);
        assert_eq!(info.owner, "root");
    }

    #[test]
    fn injected_failures_are_consumed_in_order() {
        let h = host();
        h.fail_times("mkdir", InjectedFailure::Transient, 2);
        let op = PrivilegedOp::MakeDir {
            path: "/opt/app".into(),
        };
        assert!(h.run(&op).unwrap_err().is_transient());
        assert!(h.run(&op).unwrap_err().is_transient());
        assert!(h.run(&op).is_ok());
        assert_eq!(h.count("mkdir"), 3);
    }

    #[test]
    fn denied_elevation_fails_everything() {
        let h = host();
        h.deny_elevation();
        assert!(h.probe().unwrap_err().is_elevation_denied());
        let err = h
            .run(&PrivilegedOp::MakeDir {
                path: "/opt/app".into(),
            })
            .unwrap_err();
        assert!(err.is_elevation_denied());
        assert!(!h.exists("/opt/app"));
    }

    #[test]
    fn container_needs_a_compose_file() {
        let h = host();
        let up = PrivilegedOp::Container {
            project_dir: "/opt/app".into(),
            action: ContainerAction::Up { profiles: vec![] },
        };
        assert!(h.run(&up).is_err());
        h.seed_file("/opt/app/compose.yaml", "svc", 0o640, b"services: {}\n");
        h.run(&up).unwrap();
        assert_eq!(h.running_profiles(), Some(vec![]));
    }

    #[test]
    fn identities() {
        let h = host();
        assert!(h.identity_exists("svc").unwrap());
        assert!(!h.identity_exists("ghost").unwrap());
        assert!(SimulatedHost::permissive().identity_exists("ghost").unwrap());
    }
}
