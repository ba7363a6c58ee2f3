use crate::layout::StateLayout;
use crate::{fsync_dir, StoreError};
use serde::{Deserialize, Serialize};
use stackwright_schema::PhaseNumber;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use tempfile::NamedTempFile;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PhaseStatus {
    Completed,
    Skipped,
}

impl std::fmt::Display for PhaseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PhaseStatus::Completed => write!(f, "completed"),
            PhaseStatus::Skipped => write!(f, "skipped"),
        }
    }
}

/// Record of the last phase that finished, written after every phase.
///
/// Readers must tolerate fields they do not know about, so no
/// `deny_unknown_fields` here.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    pub phase_id: PhaseNumber,
    pub phase_name: String,
    pub timestamp: String,
    pub config_snapshot: serde_json::Value,
    pub status: PhaseStatus,
    /// Stable phase identity. Absent in records written by hand or by older tools.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_fingerprint: Option<String>,
}

impl Checkpoint {
    pub fn new(
        phase_id: PhaseNumber,
        phase_name: impl Into<String>,
        config_snapshot: serde_json::Value,
        status: PhaseStatus,
    ) -> Self {
        Self {
            phase_id,
            phase_name: phase_name.into(),
            timestamp: chrono::Utc::now().to_rfc3339(),
            config_snapshot,
            status,
            phase_key: None,
            config_fingerprint: None,
        }
    }

    #[must_use]
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.phase_key = Some(key.into());
        self
    }

    #[must_use]
    pub fn with_fingerprint(mut self, fingerprint: impl Into<String>) -> Self {
        self.config_fingerprint = Some(fingerprint.into());
        self
    }
}

/// Persists the resume point.
///
/// `checkpoint.json` holds only the latest record and is replaced atomically;
/// `history.jsonl` gets every record appended so skipped and completed phases
/// stay auditable after later phases overwrite the checkpoint.
pub struct CheckpointStore {
    layout: StateLayout,
}

impl CheckpointStore {
    pub fn new(layout: StateLayout) -> Self {
        Self { layout }
    }

    pub fn save(&self, checkpoint: &Checkpoint) -> Result<(), StoreError> {
        let dest = self.layout.checkpoint_file();
        let dir = self.layout.root().to_path_buf();
        fs::create_dir_all(&dir)?;

        let content = serde_json::to_string_pretty(checkpoint)?;
        let mut tmp = NamedTempFile::new_in(&dir)?;
        tmp.write_all(content.as_bytes())?;
        tmp.as_file().sync_all()?;
        tmp.persist(&dest).map_err(|e| StoreError::Io(e.error))?;
        fsync_dir(&dir)?;

        self.append_history(checkpoint)?;
        debug!(
            "checkpoint saved: phase {} ({}) {}",
            checkpoint.phase_id, checkpoint.phase_name, checkpoint.status
        );
        Ok(())
    }

    /// The last checkpoint, or `None` for a fresh install.
    ///
    /// A missing file is normal. An unreadable or corrupt file is treated as
    /// "no checkpoint" with a warning: the phases are idempotent, so starting
    /// over is always safe, while refusing to start is not.
    pub fn load(&self) -> Option<Checkpoint> {
        let path = self.layout.checkpoint_file();
        let content = match fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("no checkpoint at {}", path.display());
                return None;
            }
            Err(e) => {
                warn!(
                    "unreadable checkpoint {}: {e}; starting from the first phase",
                    path.display()
                );
                return None;
            }
        };
        match serde_json::from_str::<Checkpoint>(&content) {
            Ok(cp) if cp.phase_id.is_valid() => Some(cp),
            Ok(cp) => {
                warn!(
                    "checkpoint {} has invalid phase id {}; starting from the first phase",
                    path.display(),
                    cp.phase_id
                );
                None
            }
            Err(e) => {
                warn!(
                    "corrupt checkpoint {}: {e}; starting from the first phase",
                    path.display()
                );
                None
            }
        }
    }

    /// Every checkpoint ever saved, oldest first. Corrupt lines are skipped.
    pub fn history(&self) -> Result<Vec<Checkpoint>, StoreError> {
        let path = self.layout.history_file();
        let content = match fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut entries = Vec::new();
        for (n, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Checkpoint>(line) {
                Ok(cp) => entries.push(cp),
                Err(e) => warn!("skipping corrupt history line {}: {e}", n + 1),
            }
        }
        Ok(entries)
    }

    /// Forget all progress. Used when the stack is uninstalled or reset.
    pub fn clear(&self) -> Result<(), StoreError> {
        for path in [self.layout.checkpoint_file(), self.layout.history_file()] {
            match fs::remove_file(&path) {
                Ok(()) => debug!("removed {}", path.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn append_history(&self, checkpoint: &Checkpoint) -> Result<(), StoreError> {
        let mut line = serde_json::to_string(checkpoint)?;
        line.push('\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .mode(0o600)
            .open(self.layout.history_file())?;
        file.write_all(line.as_bytes())?;
        file.sync_data()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_store() -> (tempfile::TempDir, CheckpointStore) {
        let dir = tempfile::tempdir().unwrap();
        let layout = StateLayout::new(dir.path());
        layout.initialize().unwrap();
        (dir, CheckpointStore::new(layout))
    }

    fn sample(id: f64, status: PhaseStatus) -> Checkpoint {
        Checkpoint::new(
            PhaseNumber::new(id),
            format!("phase {id}"),
            serde_json::json!({"network": {"domain": "a.example"}}),
            status,
        )
        .with_key(format!("key-{id}"))
    }

    #[test]
    fn load_without_file_is_fresh_install() {
        let (_dir, store) = test_store();
        assert!(store.load().is_none());
    }

    #[test]
    fn save_then_load_returns_latest() {
        let (_dir, store) = test_store();
        store.save(&sample(1.0, PhaseStatus::Completed)).unwrap();
        store.save(&sample(11.5, PhaseStatus::Skipped)).unwrap();
        let cp = store.load().unwrap();
        assert_eq!(cp.phase_id, PhaseNumber::new(11.5));
        assert_eq!(cp.status, PhaseStatus::Skipped);
        assert_eq!(cp.phase_key.as_deref(), Some("key-11.5"));
    }

    #[test]
    fn record_uses_documented_field_names() {
        let (dir, store) = test_store();
        store
            .save(&sample(4.0, PhaseStatus::Completed).with_fingerprint("abc"))
            .unwrap();
        let raw = fs::read_to_string(dir.path().join("checkpoint.json")).unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["phaseId"], 4.0);
        assert_eq!(value["phaseName"], "phase 4");
        assert_eq!(value["status"], "completed");
        assert!(value["timestamp"].is_string());
        assert!(value["configSnapshot"].is_object());
        assert_eq!(value["configFingerprint"], "abc");
    }

    #[test]
    fn unknown_fields_are_tolerated() {
        let (dir, store) = test_store();
        fs::write(
            dir.path().join("checkpoint.json"),
            r#"{
                "phaseId": 7,
                "phaseName": "shared log permissions",
                "timestamp": "2025-01-01T00:00:00Z",
                "configSnapshot": {},
                "status": "completed",
                "writtenBy": "a future version",
                "hostname": "box"
            }"#,
        )
        .unwrap();
        let cp = store.load().unwrap();
        assert_eq!(cp.phase_id, PhaseNumber::from(7u32));
        assert!(cp.phase_key.is_none());
    }

    #[test]
    fn corrupt_checkpoint_is_treated_as_absent() {
        let (dir, store) = test_store();
        fs::write(dir.path().join("checkpoint.json"), "{ not json").unwrap();
        assert!(store.load().is_none());

        fs::write(dir.path().join("checkpoint.json"), "").unwrap();
        assert!(store.load().is_none());

        fs::write(
            dir.path().join("checkpoint.json"),
            r#"{"phaseId": "seven", "phaseName": "x", "timestamp": "t", "configSnapshot": {}, "status": "completed"}"#,
        )
        .unwrap();
        assert!(store.load().is_none());
    }

    #[test]
    fn negative_phase_id_is_treated_as_absent() {
        let (dir, store) = test_store();
        fs::write(
            dir.path().join("checkpoint.json"),
            r#"{"phaseId": -1, "phaseName": "x", "timestamp": "t", "configSnapshot": {}, "status": "completed"}"#,
        )
        .unwrap();
        assert!(store.load().is_none());
    }

    #[test]
    fn unknown_status_is_treated_as_absent() {
        let (dir, store) = test_store();
        fs::write(
            dir.path().join("checkpoint.json"),
            r#"{"phaseId": 3, "phaseName": "x", "timestamp": "t", "configSnapshot": {}, "status": "failed"}"#,
        )
        .unwrap();
        assert!(store.load().is_none());
    }

    #[test]
    fn save_leaves_no_temp_files() {
        let (dir, store) = test_store();
        for i in 1..=5 {
            store
                .save(&sample(f64::from(i), PhaseStatus::Completed))
                .unwrap();
        }
        let mut names: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        assert_eq!(
            names,
            vec!["checkpoint.json", "history.jsonl", "staging", "version"]
        );
    }

    #[test]
    fn history_keeps_every_record_in_order() {
        let (_dir, store) = test_store();
        store.save(&sample(1.0, PhaseStatus::Completed)).unwrap();
        store.save(&sample(2.0, PhaseStatus::Skipped)).unwrap();
        store.save(&sample(3.0, PhaseStatus::Completed)).unwrap();
        let history = store.history().unwrap();
        let ids: Vec<f64> = history.iter().map(|c| c.phase_id.value()).collect();
        assert_eq!(ids, vec![1.0, 2.0, 3.0]);
        assert_eq!(history[1].status, PhaseStatus::Skipped);
    }

    #[test]
    fn history_skips_corrupt_lines() {
        let (dir, store) = test_store();
        store.save(&sample(1.0, PhaseStatus::Completed)).unwrap();
        let mut f = OpenOptions::new()
            .append(true)
            .open(dir.path().join("history.jsonl"))
            .unwrap();
        f.write_all(b"garbage line\n").unwrap();
        drop(f);
        store.save(&sample(2.0, PhaseStatus::Completed)).unwrap();
        assert_eq!(store.history().unwrap().len(), 2);
    }

    #[test]
    fn clear_removes_progress() {
        let (_dir, store) = test_store();
        store.save(&sample(1.0, PhaseStatus::Completed)).unwrap();
        store.clear().unwrap();
        assert!(store.load().is_none());
        assert!(store.history().unwrap().is_empty());
        store.clear().unwrap();
    }
}
