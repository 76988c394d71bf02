//! Protocol Messages
//!
//! JSON wire format for client-server communication over WebSocket.
//! Field names are camelCase on the wire.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// =============================================================================
// CLIENT -> SERVER MESSAGES
// =============================================================================

/// Messages sent from client to server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Join (or rejoin) a save.
    Join {
        /// Save/session to join.
        #[serde(rename = "saveId")]
        save_id: String,
        /// Joining player.
        #[serde(rename = "playerId")]
        player_id: String,
    },

    /// Captured input for the next tick.
    Input(ClientPacket),

    /// Acknowledgements without input.
    Ack {
        /// Acks to route to the ack engine.
        #[serde(rename = "pendingAcks", default)]
        pending_acks: Vec<PendingAck>,
    },

    /// Pause the session's simulation.
    Pause,

    /// Resume the session's simulation.
    Unpause,
}

/// Client input packet.
///
/// Every field other than the known ones is captured into `input` and handed
/// to the action bindings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientPacket {
    /// Client sequence id, monotonic per client.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    /// Client timestamp in milliseconds.
    #[serde(default)]
    pub timestamp: i64,
    /// Acknowledgements carried by this packet.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pending_acks: Vec<PendingAck>,
    /// Receipt of a server packet, for latency accounting.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub received: Option<PacketReceipt>,
    /// Captured input fields.
    #[serde(flatten)]
    pub input: Map<String, Value>,
}

impl ClientPacket {
    /// Packet carrying only acknowledgements.
    pub fn acks_only(pending_acks: Vec<PendingAck>) -> Self {
        Self {
            pending_acks,
            ..Default::default()
        }
    }
}

/// A named acknowledgement sent by a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingAck {
    /// Ack name.
    pub name: String,
    /// Any other fields, handed to the ack callbacks.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl PendingAck {
    /// Ack with no extra fields.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            extra: Map::new(),
        }
    }

    /// Extra fields as a JSON object.
    pub fn payload(&self) -> Value {
        Value::Object(self.extra.clone())
    }
}

/// Client-reported receipt of a server packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PacketReceipt {
    /// Server packet id.
    pub id: u64,
    /// Client time the packet arrived, in milliseconds.
    pub timestamp: i64,
}

// =============================================================================
// SERVER -> CLIENT MESSAGES
// =============================================================================

/// Packets sent from server to client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServerPacket {
    /// Changes committed since the last push.
    Delta(DeltaPacket),
    /// Full state, pushed on the outbound cadence.
    Frame(StateFrame),
    /// Rejected request.
    Error(ErrorNotice),
    /// Full state tree, sent once on join.
    Snapshot(Value),
}

/// Change-delta packet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeltaPacket {
    /// Global packet sequence id.
    pub id: u64,
    /// Server time in milliseconds.
    pub timestamp: i64,
    /// Highest client input id processed for this player.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub highest_processed_message: Option<u64>,
    /// Partial trees to merge, in commit order.
    pub change_deltas: Vec<Value>,
}

/// Full-state packet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateFrame {
    /// Global packet sequence id.
    pub id: u64,
    /// Server time in milliseconds.
    pub timestamp: i64,
    /// Highest client input id processed for this player.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub highest_processed_message: Option<u64>,
    /// Committed state tree.
    pub state: Value,
}

/// Error reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorNotice {
    /// Human readable reason.
    pub error: String,
}

impl ServerPacket {
    /// Error reply with a message.
    pub fn error(message: impl Into<String>) -> Self {
        ServerPacket::Error(ErrorNotice {
            error: message.into(),
        })
    }

    /// Sequence id, if the packet carries one.
    pub fn sequence_id(&self) -> Option<u64> {
        match self {
            ServerPacket::Delta(p) => Some(p.id),
            ServerPacket::Frame(p) => Some(p.id),
            ServerPacket::Error(_) | ServerPacket::Snapshot(_) => None,
        }
    }
}

// =============================================================================
// TRANSPORT EVENTS
// =============================================================================

/// Events produced by the transport for one connection.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Connection opened.
    Connect {
        /// Stable connection id.
        connection_id: String,
    },
    /// Parsed message received.
    Message {
        /// Stable connection id.
        connection_id: String,
        /// Decoded message.
        message: ClientMessage,
    },
    /// Connection closed.
    Disconnect {
        /// Stable connection id.
        connection_id: String,
    },
    /// Transport or decode failure.
    Error {
        /// Stable connection id.
        connection_id: String,
        /// Failure description.
        error: String,
    },
}

impl TransportEvent {
    /// Connection the event belongs to.
    pub fn connection_id(&self) -> &str {
        match self {
            TransportEvent::Connect { connection_id }
            | TransportEvent::Message { connection_id, .. }
            | TransportEvent::Disconnect { connection_id }
            | TransportEvent::Error { connection_id, .. } => connection_id,
        }
    }
}

// =============================================================================
// SERIALIZATION HELPERS
// =============================================================================

impl ClientMessage {
    /// Serialize to JSON.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

impl ServerPacket {
    /// Serialize to JSON.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}
