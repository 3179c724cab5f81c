//! Persisted panel state for one channel: a plain key-value pair on disk.
//!
//! The connection-start timestamp (rendered as uptime) and the last observed
//! status survive panel reloads; nothing else does. Loads are tolerant so a
//! missing or corrupt file never blocks the state machine.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use comanda_core::{current_unix_timestamp_ms, write_text_atomic};

use crate::channel_status::ChannelStatus;

pub const PANEL_CHANNEL_STATE_FILE_NAME: &str = "channel-panel-state.json";
const PANEL_CHANNEL_STATE_SCHEMA_VERSION: u32 = 1;

fn panel_channel_state_schema_version() -> u32 {
    PANEL_CHANNEL_STATE_SCHEMA_VERSION
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
/// On-disk shape of the persisted panel state.
pub struct PanelChannelStateFile {
    #[serde(default = "panel_channel_state_schema_version")]
    pub schema_version: u32,
    #[serde(default)]
    pub connected_since_unix_ms: Option<u64>,
    #[serde(default)]
    pub last_status: Option<String>,
    #[serde(default)]
    pub updated_unix_ms: u64,
}

impl Default for PanelChannelStateFile {
    fn default() -> Self {
        Self {
            schema_version: PANEL_CHANNEL_STATE_SCHEMA_VERSION,
            connected_since_unix_ms: None,
            last_status: None,
            updated_unix_ms: 0,
        }
    }
}

#[derive(Debug, Clone)]
/// Loads and saves [`PanelChannelStateFile`] under a state directory.
pub struct ChannelStateStore {
    path: PathBuf,
}

impl ChannelStateStore {
    pub fn new(state_dir: &Path) -> Self {
        Self {
            path: state_dir.join(PANEL_CHANNEL_STATE_FILE_NAME),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Missing or unreadable files yield the default state.
    pub fn load(&self) -> PanelChannelStateFile {
        let Ok(raw) = std::fs::read_to_string(&self.path) else {
            return PanelChannelStateFile::default();
        };
        serde_json::from_str(&raw).unwrap_or_default()
    }

    fn save(&self, mut state: PanelChannelStateFile) -> Result<()> {
        state.schema_version = PANEL_CHANNEL_STATE_SCHEMA_VERSION;
        state.updated_unix_ms = current_unix_timestamp_ms();
        let serialized =
            serde_json::to_string_pretty(&state).context("failed to serialize panel state")?;
        write_text_atomic(&self.path, &serialized)
    }

    /// Records entry into the active state.
    pub fn record_connected(&self, at_unix_ms: u64) -> Result<()> {
        let mut state = self.load();
        state.connected_since_unix_ms = Some(at_unix_ms);
        state.last_status = Some(ChannelStatus::Active.as_str().to_string());
        self.save(state)
    }

    /// Records entry into the disconnected state and drops the uptime anchor.
    pub fn clear_connected(&self) -> Result<()> {
        let mut state = self.load();
        state.connected_since_unix_ms = None;
        state.last_status = Some(ChannelStatus::Disconnected.as_str().to_string());
        self.save(state)
    }

    pub fn record_last_status(&self, status: ChannelStatus) -> Result<()> {
        let mut state = self.load();
        state.last_status = Some(status.as_str().to_string());
        self.save(state)
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::{ChannelStateStore, PanelChannelStateFile};
    use crate::channel_status::ChannelStatus;

    #[test]
    fn missing_file_loads_default() {
        let dir = tempdir().expect("tempdir");
        let store = ChannelStateStore::new(dir.path());
        assert_eq!(store.load(), PanelChannelStateFile::default());
    }

    #[test]
    fn corrupt_file_loads_default() {
        let dir = tempdir().expect("tempdir");
        let store = ChannelStateStore::new(dir.path());
        std::fs::write(store.path(), "{not json").expect("write");
        assert_eq!(store.load(), PanelChannelStateFile::default());
    }

    #[test]
    fn connect_then_clear_round_trip() {
        let dir = tempdir().expect("tempdir");
        let store = ChannelStateStore::new(dir.path());

        store.record_connected(1_700_000_000_000).expect("record");
        let state = store.load();
        assert_eq!(state.connected_since_unix_ms, Some(1_700_000_000_000));
        assert_eq!(state.last_status.as_deref(), Some("active"));
        assert!(state.updated_unix_ms > 0);

        store.clear_connected().expect("clear");
        let state = store.load();
        assert_eq!(state.connected_since_unix_ms, None);
        assert_eq!(state.last_status.as_deref(), Some("disconnected"));
    }

    #[test]
    fn last_status_does_not_touch_uptime_anchor() {
        let dir = tempdir().expect("tempdir");
        let store = ChannelStateStore::new(dir.path());
        store.record_connected(42).expect("record");
        store
            .record_last_status(ChannelStatus::ReadyToScan)
            .expect("status");
        let state = store.load();
        assert_eq!(state.connected_since_unix_ms, Some(42));
        assert_eq!(state.last_status.as_deref(), Some("ready_to_scan"));
    }
}
