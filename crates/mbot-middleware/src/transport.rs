//! The bus transport seam.
//!
//! The bridge needs three primitives from the bus: subscribe to a channel
//! pattern, receive with a timeout, and publish.  Everything else about the
//! wire is the transport's business.

use std::time::Duration;

use mbot_types::BridgeError;
use regex::Regex;

/// One message received from the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub channel: String,
    pub payload: Vec<u8>,
}

impl BusMessage {
    pub fn new(channel: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            channel: channel.into(),
            payload: payload.into(),
        }
    }
}

/// A binary publish/subscribe bus.
///
/// Implementations are shared between the bus-delivery thread (which calls
/// [`recv_timeout`][BusTransport::recv_timeout]) and the bridge actor (which
/// calls [`publish`][BusTransport::publish] and
/// [`subscribe`][BusTransport::subscribe]), so every method takes `&self`.
pub trait BusTransport: Send + Sync {
    /// Start receiving messages on channels matching `pattern`, an LCM
    /// channel regex matched against the whole channel name.
    fn subscribe(&self, pattern: &str) -> Result<(), BridgeError>;

    /// Block for at most `timeout` waiting for the next message on a
    /// subscribed channel.  `Ok(None)` means nothing arrived in time.
    fn recv_timeout(&self, timeout: Duration) -> Result<Option<BusMessage>, BridgeError>;

    fn publish(&self, channel: &str, payload: &[u8]) -> Result<(), BridgeError>;
}

/// The set of channel patterns a transport is subscribed to.
#[derive(Debug, Clone, Default)]
pub struct ChannelFilter {
    patterns: Vec<Regex>,
}

impl ChannelFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `pattern`, anchored at both ends as LCM does.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Transport`] when `pattern` is not a valid regex.
    pub fn add(&mut self, pattern: &str) -> Result<(), BridgeError> {
        let anchored = format!("^(?:{pattern})$");
        let regex = Regex::new(&anchored)
            .map_err(|e| BridgeError::Transport(format!("invalid channel pattern {pattern:?}: {e}")))?;
        if !self.patterns.iter().any(|p| p.as_str() == regex.as_str()) {
            self.patterns.push(regex);
        }
        Ok(())
    }

    pub fn matches(&self, channel: &str) -> bool {
        self.patterns.iter().any(|p| p.is_match(channel))
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}
