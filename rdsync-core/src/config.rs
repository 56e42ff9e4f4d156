//! Protocol configuration.
//!
//! Every field has a default, so a config file only needs to name what it
//! overrides:
//!
//! ```json
//! { "name": "server", "id_kind": "Server", "max_pending_messages": 1024 }
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;
use crate::protocol::IdKind;

/// Warn and error thresholds for synchronous RPC waits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcTimeouts {
    pub warn_ms: u64,
    pub error_ms: u64,
}

impl RpcTimeouts {
    pub const DEFAULT: RpcTimeouts = RpcTimeouts { warn_ms: 200, error_ms: 3000 };
    pub const LONG_RUNNING: RpcTimeouts = RpcTimeouts { warn_ms: 10_000, error_ms: 15_000 };

    pub fn warn(&self) -> Duration {
        Duration::from_millis(self.warn_ms)
    }

    pub fn error(&self) -> Duration {
        Duration::from_millis(self.error_ms)
    }
}

impl Default for RpcTimeouts {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Settings for one protocol endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Root location name, used as the prefix of every entity location.
    pub name: String,

    /// Which side of the connection this endpoint is. Decides the parity of
    /// dynamically allocated ids and which side is master for properties.
    pub id_kind: IdKind,

    /// Upper bound of messages buffered for ids nobody has bound yet.
    pub max_pending_messages: usize,

    /// How many unbound ids are remembered so late messages for them are dropped.
    pub retired_ids_capacity: usize,

    pub rpc_timeouts: RpcTimeouts,

    /// Largest accepted frame, counting the id and payload. A peer declaring
    /// a longer frame is treated as a transport fault.
    pub max_frame_size: u32,

    /// How long tearing down the protocol's lifetime waits for guarded
    /// executions still running on other threads.
    pub termination_wait_ms: u64,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            name: "protocol".to_string(),
            id_kind: IdKind::Client,
            max_pending_messages: 10_000,
            retired_ids_capacity: 4096,
            rpc_timeouts: RpcTimeouts::DEFAULT,
            max_frame_size: 16 * 1024 * 1024,
            termination_wait_ms: 500,
        }
    }
}

impl ProtocolConfig {
    pub fn client(name: impl Into<String>) -> Self {
        Self { name: name.into(), id_kind: IdKind::Client, ..Self::default() }
    }

    pub fn server(name: impl Into<String>) -> Self {
        Self { name: name.into(), id_kind: IdKind::Server, ..Self::default() }
    }

    pub fn termination_wait(&self) -> Duration {
        Duration::from_millis(self.termination_wait_ms)
    }

    /// Parse a config from JSON, filling unspecified fields with defaults.
    pub fn from_json(json: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(json).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_uses_defaults() {
        let config = ProtocolConfig::from_json(r#"{ "name": "srv", "id_kind": "Server" }"#).unwrap();

        assert_eq!(config.name, "srv");
        assert_eq!(config.id_kind, IdKind::Server);
        assert_eq!(config.max_pending_messages, 10_000);
        assert_eq!(config.rpc_timeouts, RpcTimeouts::DEFAULT);
        assert_eq!(config.max_frame_size, 16 * 1024 * 1024);
        assert_eq!(config.termination_wait(), Duration::from_millis(500));
    }

    #[test]
    fn invalid_json_is_a_serialization_error() {
        let err = ProtocolConfig::from_json("{ not json").unwrap_err();
        assert!(matches!(err, ProtocolError::Serialization(_)));
    }

    #[test]
    fn constructors_pick_side() {
        assert_eq!(ProtocolConfig::client("c").id_kind, IdKind::Client);
        assert_eq!(ProtocolConfig::server("s").id_kind, IdKind::Server);
    }
}
