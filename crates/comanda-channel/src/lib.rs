//! Outbound-channel connection lifecycle and message dispatch for the
//! Comanda restaurant-operations panel.
//!
//! Provides the provider HTTP client, status probe, connection controller
//! (deploy → QR handshake → active session), single-message dispatcher, and
//! bulk campaign runner with pacing and cooperative cancellation.
//!
//! ```rust
//! use comanda_channel::{parse_channel_status, ChannelStatus};
//!
//! let body = serde_json::json!({ "status": "ONLINE" });
//! assert_eq!(parse_channel_status(&body), ChannelStatus::Active);
//!
//! let body = serde_json::json!({ "status": "REBOOTING" });
//! assert_eq!(parse_channel_status(&body), ChannelStatus::Disconnected);
//! ```

pub mod channel_audit;
pub mod channel_campaign;
pub mod channel_connection;
pub mod channel_provider;
pub mod channel_send;
pub mod channel_state_store;
pub mod channel_status;

pub use channel_audit::*;
pub use channel_campaign::*;
pub use channel_connection::*;
pub use channel_provider::*;
pub use channel_send::*;
pub use channel_state_store::*;
pub use channel_status::*;
