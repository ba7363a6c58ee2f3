//! Managed blocks in a user's crontab.
//!
//! Each optional feature owns one block delimited by marker comments, so
//! re-installing replaces the block in place and never duplicates entries or
//! touches lines the operator added by hand.

use crate::privileged::{PrivilegedExecutor, PrivilegedOp};
use crate::RuntimeError;
use tracing::{debug, info};

fn begin_marker(block: &str) -> String {
    format!("# BEGIN stackwright:{block}")
}

fn end_marker(block: &str) -> String {
    format!("# END stackwright:{block}")
}

/// Replace (or append) the managed block named `block` in `table`.
pub fn merge_block(table: &str, block: &str, entries: &[String]) -> String {
    let mut out = remove_block(table, block);
    if !out.is_empty() && !out.ends_with('\n') {
        out.push('\n');
    }
    out.push_str(&begin_marker(block));
    out.push('\n');
    for entry in entries {
        out.push_str(entry);
        out.push('\n');
    }
    out.push_str(&end_marker(block));
    out.push('\n');
    out
}

/// Drop the managed block named `block`, leaving everything else intact.
/// A BEGIN marker without its END is not a block; those lines are kept.
pub fn remove_block(table: &str, block: &str) -> String {
    let begin = begin_marker(block);
    let end = end_marker(block);
    let mut out = String::new();
    let mut pending: Option<String> = None;
    for line in table.lines() {
        let trimmed = line.trim();
        if let Some(buf) = pending.as_mut() {
            if trimmed == end {
                pending = None;
            } else if trimmed == begin {
                out.push_str(buf);
                *buf = format!("{line}\n");
            } else {
                buf.push_str(line);
                buf.push('\n');
            }
            continue;
        }
        if trimmed == begin {
            pending = Some(format!("{line}\n"));
            continue;
        }
        out.push_str(line);
        out.push('\n');
    }
    if let Some(unterminated) = pending {
        out.push_str(&unterminated);
    }
    out
}

pub fn has_block(table: &str, block: &str) -> bool {
    let begin = begin_marker(block);
    table.lines().any(|l| l.trim() == begin)
}

pub struct ScheduledTasks<'a> {
    exec: &'a dyn PrivilegedExecutor,
}

impl<'a> ScheduledTasks<'a> {
    pub fn new(exec: &'a dyn PrivilegedExecutor) -> Self {
        Self { exec }
    }

    /// The user's current table; empty when they have none.
    pub fn read(&self, user: &str) -> Result<String, RuntimeError> {
        match self.exec.run(&PrivilegedOp::ReadSchedule {
            user: user.to_owned(),
        }) {
            Ok(out) => Ok(out.stdout),
            Err(RuntimeError::CommandFailed { ref stderr, .. })
                if stderr.contains("no crontab for") =>
            {
                Ok(String::new())
            }
            Err(e) => Err(e),
        }
    }

    /// Install `entries` as block `block` in `user`'s table. Returns whether
    /// the table changed.
    pub fn install(&self, user: &str, block: &str, entries: &[String]) -> Result<bool, RuntimeError> {
        let current = self.read(user)?;
        let updated = merge_block(&current, block, entries);
        if updated == current {
            debug!("scheduled tasks '{block}' for {user} already up to date");
            return Ok(false);
        }
        self.exec.run(&PrivilegedOp::WriteSchedule {
            user: user.to_owned(),
            table: updated,
        })?;
        info!("installed scheduled tasks '{block}' for {user}");
        Ok(true)
    }
}
