//! Domain status vocabulary for the external messaging channel.
//!
//! The provider's status endpoint reports a wider, eventually-consistent
//! vocabulary; everything outside the recognized literals folds to
//! `Disconnected` so callers never branch on provider-specific strings.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
/// Enumerates supported `ChannelStatus` values.
pub enum ChannelStatus {
    Active,
    ReadyToScan,
    Disconnected,
}

impl ChannelStatus {
    /// Returns the stable snake_case wire representation.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::ReadyToScan => "ready_to_scan",
            Self::Disconnected => "disconnected",
        }
    }

    pub fn is_active(self) -> bool {
        matches!(self, Self::Active)
    }
}

/// Folds a provider status body into the three-valued domain status.
///
/// Only the literal values `ACTIVE`, `ONLINE`, and `READY_TO_SCAN` are
/// recognized; any other body (missing field, unknown literal, non-string)
/// folds to [`ChannelStatus::Disconnected`].
pub fn parse_channel_status(body: &Value) -> ChannelStatus {
    match body.get("status").and_then(Value::as_str).map(str::trim) {
        Some("ACTIVE") | Some("ONLINE") => ChannelStatus::Active,
        Some("READY_TO_SCAN") => ChannelStatus::ReadyToScan,
        _ => ChannelStatus::Disconnected,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{parse_channel_status, ChannelStatus};

    #[test]
    fn recognizes_active_literals() {
        assert_eq!(
            parse_channel_status(&json!({ "status": "ACTIVE" })),
            ChannelStatus::Active
        );
        assert_eq!(
            parse_channel_status(&json!({ "status": "ONLINE" })),
            ChannelStatus::Active
        );
    }

    #[test]
    fn recognizes_ready_to_scan() {
        assert_eq!(
            parse_channel_status(&json!({ "status": "READY_TO_SCAN" })),
            ChannelStatus::ReadyToScan
        );
    }

    #[test]
    fn unknown_bodies_fold_to_disconnected() {
        assert_eq!(
            parse_channel_status(&json!({ "status": "CONNECTING" })),
            ChannelStatus::Disconnected
        );
        assert_eq!(
            parse_channel_status(&json!({ "status": 7 })),
            ChannelStatus::Disconnected
        );
        assert_eq!(
            parse_channel_status(&json!({ "state": "ACTIVE" })),
            ChannelStatus::Disconnected
        );
        assert_eq!(
            parse_channel_status(&serde_json::Value::Null),
            ChannelStatus::Disconnected
        );
    }

    #[test]
    fn literal_match_is_case_sensitive() {
        assert_eq!(
            parse_channel_status(&json!({ "status": "active" })),
            ChannelStatus::Disconnected
        );
    }

    #[test]
    fn wire_names_are_snake_case() {
        assert_eq!(ChannelStatus::ReadyToScan.as_str(), "ready_to_scan");
        assert!(ChannelStatus::Active.is_active());
        assert!(!ChannelStatus::Disconnected.is_active());
    }
}
