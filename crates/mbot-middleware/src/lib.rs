//! `mbot-middleware` – the bridge core.
//!
//! Routes bus traffic to WebSocket clients and client publishes onto the bus
//! without caring what the payloads mean beyond their schema.
//!
//! # Modules
//!
//! - [`transport`] – the [`BusTransport`] seam and LCM channel patterns.
//! - [`loopback`] – an in-process bus for tests and offline use.
//! - [`udpm`] – LCM UDP multicast transport.
//! - [`queue`] – [`TopicQueue`], the bounded most-recent buffer of one topic.
//! - [`registry`] – [`TopicRegistry`], topics, subscribers and the ignore-list.
//! - [`bridge`] – the [`Bridge`] state machine and the actor that owns it.
//! - [`listener`] – the blocking bus-delivery loop.
//! - [`config`] – [`BridgeConfig`], the plain structure the core consumes.

pub mod bridge;
pub mod config;
pub mod listener;
pub mod loopback;
pub mod queue;
pub mod registry;
pub mod transport;
pub mod udpm;

pub use bridge::{spawn_bridge, Bridge, BridgeHandle};
pub use config::{BridgeConfig, ChannelSpec, Subscriptions};
pub use listener::BusListener;
pub use loopback::LoopbackBus;
pub use queue::{Sample, TopicQueue};
pub use registry::TopicRegistry;
pub use transport::{BusMessage, BusTransport, ChannelFilter};
pub use udpm::{UdpmAddress, UdpmBus};

/// Wall-clock time in microseconds since the Unix epoch.
pub fn now_micros() -> i64 {
    chrono::Utc::now().timestamp_micros()
}
