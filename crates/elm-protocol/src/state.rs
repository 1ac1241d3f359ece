//! Connection lifecycle and the events a session emits about it.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::protocol::ObdProtocol;

/// Connection state of an adapter session.
///
/// Moves forward `Disconnected → Connecting → ConnectedToAdapter →
/// ConnectedToVehicle`, or collapses to `Disconnected`/`Error`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    ConnectedToAdapter,
    ConnectedToVehicle { protocol: ObdProtocol },
    Error { reason: String },
}

impl ConnectionState {
    /// Whether moving from `self` to `next` is a legal transition.
    ///
    /// Collapsing to `Disconnected` or `Error` is always allowed. Any other
    /// move is one step forward from its direct predecessor, so `Error` only
    /// leaves via `Disconnected`.
    pub fn can_transition_to(&self, next: &ConnectionState) -> bool {
        if self == next {
            return false;
        }
        match next {
            Self::Disconnected | Self::Error { .. } => true,
            Self::Connecting => matches!(self, Self::Disconnected),
            Self::ConnectedToAdapter => matches!(self, Self::Connecting),
            Self::ConnectedToVehicle { .. } => matches!(self, Self::ConnectedToAdapter),
        }
    }

    pub fn is_vehicle_ready(&self) -> bool {
        matches!(self, Self::ConnectedToVehicle { .. })
    }

    /// Adapter reachable, with or without a negotiated vehicle protocol.
    pub fn is_adapter_reachable(&self) -> bool {
        matches!(
            self,
            Self::ConnectedToAdapter | Self::ConnectedToVehicle { .. }
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => f.write_str("disconnected"),
            Self::Connecting => f.write_str("connecting"),
            Self::ConnectedToAdapter => f.write_str("connected to adapter"),
            Self::ConnectedToVehicle { protocol } => {
                write!(f, "connected to vehicle ({protocol})")
            }
            Self::Error { reason } => write!(f, "error: {reason}"),
        }
    }
}

/// Events emitted by a session for an external UI/observability layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    StateChanged {
        session_id: Uuid,
        from: ConnectionState,
        to: ConnectionState,
        timestamp: DateTime<Utc>,
    },
    VehicleDiscovered {
        session_id: Uuid,
        protocol: ObdProtocol,
        ecus: Vec<u32>,
        supported_pids: usize,
        timestamp: DateTime<Utc>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vehicle() -> ConnectionState {
        ConnectionState::ConnectedToVehicle {
            protocol: ObdProtocol::Iso15765_4Can11bit500,
        }
    }

    #[test]
    fn forward_transitions_allowed() {
        use ConnectionState::*;
        assert!(Disconnected.can_transition_to(&Connecting));
        assert!(Connecting.can_transition_to(&ConnectedToAdapter));
        assert!(ConnectedToAdapter.can_transition_to(&vehicle()));
    }

    #[test]
    fn never_reverts_to_connecting_from_vehicle() {
        assert!(!vehicle().can_transition_to(&ConnectionState::Connecting));
        assert!(!vehicle().can_transition_to(&ConnectionState::ConnectedToAdapter));
    }

    #[test]
    fn forward_moves_skip_no_step() {
        use ConnectionState::*;
        assert!(!Disconnected.can_transition_to(&ConnectedToAdapter));
        assert!(!Disconnected.can_transition_to(&vehicle()));
        assert!(!Connecting.can_transition_to(&vehicle()));
    }

    #[test]
    fn collapse_always_allowed() {
        let err = ConnectionState::Error {
            reason: "timeout".into(),
        };
        assert!(vehicle().can_transition_to(&ConnectionState::Disconnected));
        assert!(vehicle().can_transition_to(&err));
        assert!(ConnectionState::Connecting.can_transition_to(&err));
    }

    #[test]
    fn error_leaves_only_via_disconnected() {
        let err = ConnectionState::Error {
            reason: "init".into(),
        };
        assert!(!err.can_transition_to(&ConnectionState::Connecting));
        assert!(err.can_transition_to(&ConnectionState::Disconnected));
    }

    #[test]
    fn self_transition_is_not_a_change() {
        assert!(!ConnectionState::Disconnected.can_transition_to(&ConnectionState::Disconnected));
    }

    #[test]
    fn state_serialization() {
        let json = serde_json::to_value(vehicle()).unwrap();
        assert_eq!(json["state"], "connected_to_vehicle");
        assert_eq!(json["protocol"], "6");
    }
}
