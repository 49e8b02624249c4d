//! Build journal and command envelopes.
//!
//! Every state transition of a pipeline run is appended as one JSON line to
//! `<state_dir>/build.events.jsonl`. The journal is append-only; a fresh run
//! gets a fresh `build_id` and never rewrites earlier lines.

use crate::core::error::StagehandError;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use ulid::Ulid;

pub const JOURNAL_FILE: &str = "build.events.jsonl";

/// Returns unix-epoch seconds with `Z` suffix (e.g. `1771220592Z`).
pub fn now_epoch_z() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    format!("{}Z", secs)
}

pub fn new_event_id() -> String {
    Ulid::new().to_string()
}

/// Response envelope printed on stdout by every command.
pub fn command_envelope(cmd: &str, status: &str, extra: JsonValue) -> JsonValue {
    let mut base = serde_json::json!({
        "envelope_version": "1.0.0",
        "ts": now_epoch_z(),
        "event_id": new_event_id(),
        "cmd": cmd,
        "status": status
    });
    if let (Some(base_obj), Some(extra_obj)) = (base.as_object_mut(), extra.as_object()) {
        for (k, v) in extra_obj {
            base_obj.insert(k.clone(), v.clone());
        }
    }
    base
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JournalEvent {
    pub ts: String,
    pub event_id: String,
    pub build_id: String,
    pub phase: String,
    pub status: String,
    pub detail: JsonValue,
}

#[derive(Debug, Clone)]
pub struct Journal {
    path: Option<PathBuf>,
    build_id: String,
}

impl Journal {
    pub fn open(state_dir: &Path) -> Result<Self, StagehandError> {
        fs::create_dir_all(state_dir)?;
        Ok(Self {
            path: Some(state_dir.join(JOURNAL_FILE)),
            build_id: Ulid::new().to_string(),
        })
    }

    /// A journal that records nothing.
    pub fn disabled() -> Self {
        Self {
            path: None,
            build_id: Ulid::new().to_string(),
        }
    }

    pub fn build_id(&self) -> &str {
        &self.build_id
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn record(
        &self,
        phase: &str,
        status: &str,
        detail: JsonValue,
    ) -> Result<JournalEvent, StagehandError> {
        let event = JournalEvent {
            ts: now_epoch_z(),
            event_id: new_event_id(),
            build_id: self.build_id.clone(),
            phase: phase.to_string(),
            status: status.to_string(),
            detail,
        };
        if let Some(path) = &self.path {
            let mut f = OpenOptions::new().create(true).append(true).open(path)?;
            writeln!(f, "{}", serde_json::to_string(&event)?)?;
        }
        Ok(event)
    }

    /// Events of a single build, oldest first.
    pub fn read_build(path: &Path, build_id: &str) -> Result<Vec<JournalEvent>, StagehandError> {
        let raw = fs::read_to_string(path)?;
        let mut events = Vec::new();
        for line in raw.lines().filter(|l| !l.trim().is_empty()) {
            let event: JournalEvent = serde_json::from_str(line)?;
            if event.build_id == build_id {
                events.push(event);
            }
        }
        Ok(events)
    }
}
