//! Write-only audit trail of connection state changes.
//!
//! Entries are NDJSON lines with size-based rotation. Recording is
//! fire-and-forget from the state machine's point of view: a failed append
//! is the caller's warning, never a lifecycle failure.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use comanda_core::{append_line_with_rotation, current_unix_timestamp_ms, LogRotationPolicy};

pub const CHANNEL_AUDIT_LOG_FILE_NAME: &str = "channel-audit.jsonl";
const CHANNEL_AUDIT_SCHEMA_VERSION: u32 = 1;

fn channel_audit_schema_version() -> u32 {
    CHANNEL_AUDIT_SCHEMA_VERSION
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
/// One recorded state transition.
pub struct ChannelAuditEntry {
    #[serde(default = "channel_audit_schema_version")]
    pub schema_version: u32,
    #[serde(default)]
    pub at_unix_ms: u64,
    #[serde(default)]
    pub from_state: String,
    #[serde(default)]
    pub to_state: String,
    #[serde(default)]
    pub detail: Option<String>,
}

#[derive(Debug, Clone)]
/// Appends [`ChannelAuditEntry`] lines under a state directory.
pub struct ChannelAuditLog {
    path: PathBuf,
    policy: LogRotationPolicy,
}

impl ChannelAuditLog {
    pub fn new(state_dir: &Path, policy: LogRotationPolicy) -> Self {
        Self {
            path: state_dir.join(CHANNEL_AUDIT_LOG_FILE_NAME),
            policy,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn record(&self, from_state: &str, to_state: &str, detail: Option<&str>) -> Result<()> {
        let entry = ChannelAuditEntry {
            schema_version: CHANNEL_AUDIT_SCHEMA_VERSION,
            at_unix_ms: current_unix_timestamp_ms(),
            from_state: from_state.to_string(),
            to_state: to_state.to_string(),
            detail: detail.map(str::to_string),
        };
        let line = serde_json::to_string(&entry).context("failed to serialize audit entry")?;
        append_line_with_rotation(&self.path, &line, self.policy)
    }

    /// Reads back every entry in the current log file. Unparseable lines are
    /// skipped rather than failing the read.
    pub fn read_entries(&self) -> Result<Vec<ChannelAuditEntry>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let raw = std::fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read {}", self.path.display()))?;
        Ok(raw
            .lines()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect())
    }
}
