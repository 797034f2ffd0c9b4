//! `mbot-types` – shared vocabulary for the MBot bridge.
//!
//! Every other crate in the workspace speaks in these types:
//!
//! - [`Value`] – the schema-agnostic structured value used to cross the JSON
//!   boundary.
//! - [`Envelope`] – one JSON protocol message exchanged over the client
//!   socket.
//! - [`BridgeError`] – the global error type.

pub mod envelope;
pub mod value;

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub use envelope::{Envelope, MessageKind, CHANNELS_CHANNEL, HOSTNAME_CHANNEL};
pub use value::{Record, Scalar, Value};

/// Identity of one connected WebSocket client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    /// Allocate a fresh random id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // The short form is plenty to tell clients apart in the logs.
        let s = self.0.simple().to_string();
        f.write_str(&s[..8])
    }
}

/// Registry header for one topic, as reported on the `CHANNELS` meta-topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelInfo {
    pub channel: String,
    pub dtype: String,
    pub queue_size: usize,
}

/// Global error type spanning protocol parsing, topic reads, type resolution
/// and transport failures.
///
/// The `Display` text of each variant is what a client sees in the `msg`
/// field of an ERROR envelope.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BridgeError {
    /// Malformed frame: bad JSON, missing `type`, missing required field.
    #[error("{0}")]
    ProtocolParse(String),

    #[error("No channel: {0}")]
    UnknownChannel(String),

    #[error("No data on channel: {0}")]
    EmptyChannel(String),

    #[error("Data on channel {0} is old")]
    StaleData(String),

    /// No configured namespace exposes a type with this name.
    #[error("Unknown message type: {0}")]
    UnknownType(String),

    /// Trial decoding found no matching type.
    #[error("Could not resolve a message type for a {len}-byte payload")]
    UnresolvedType { len: usize },

    #[error("Schema mismatch for {type_name}: {reason}")]
    SchemaMismatch { type_name: String, reason: String },

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Encode error: {0}")]
    Encode(String),

    #[error("Bus transport error: {0}")]
    Transport(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl BridgeError {
    pub(crate) fn parse(msg: impl Into<String>) -> Self {
        BridgeError::ProtocolParse(msg.into())
    }

    /// Shorthand for a [`BridgeError::SchemaMismatch`].
    pub fn mismatch(type_name: impl Into<String>, reason: impl Into<String>) -> Self {
        BridgeError::SchemaMismatch {
            type_name: type_name.into(),
            reason: reason.into(),
        }
    }
}
