//! The bridge orchestrator and the actor that owns it.
//!
//! [`Bridge`] is a plain state machine: it owns the [`TopicRegistry`] (and
//! with it every [`TopicQueue`][crate::TopicQueue]) plus the outbox of each
//! connected client, and it is driven through `&mut self`.  [`spawn_bridge`]
//! moves it into a single tokio task fed by a bounded command channel, so
//! bus deliveries and client frames are serialised without any lock.
//!
//! ```text
//! bus thread ──Deliver──┐
//!                       ├──► bridge task ──try_send──► per-client outbox
//! client task ──Frame───┘         │
//!        ▲                        │
//!        └───── oneshot reply ────┘
//! ```
//!
//! Fan-out never waits on a client: a full outbox drops that update for
//! that client only, and a closed outbox unsubscribes it.

use std::collections::HashMap;
use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use mbot_lcm::{codec, from_structured, Field, FieldType, Primitive, TypeEntry, TypeResolver};
use mbot_types::{
    BridgeError, ConnectionId, Envelope, MessageKind, Value, CHANNELS_CHANNEL, HOSTNAME_CHANNEL,
};
use serde_json::Value as Json;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::BridgeConfig;
use crate::registry::TopicRegistry;
use crate::transport::{BusMessage, BusTransport};

/// Depth of the actor's mailbox.
const COMMAND_CAPACITY: usize = 1024;

/// Wildcard channel pattern used in discovery mode.
const ALL_CHANNELS: &str = ".*";

pub struct Bridge {
    registry: TopicRegistry,
    resolver: Arc<TypeResolver>,
    bus: Arc<dyn BusTransport>,
    outboxes: HashMap<ConnectionId, mpsc::Sender<String>>,
    hostname: String,
    stale_after: Option<i64>,
    discovery: bool,
}

impl Bridge {
    /// Register the configured topics and subscribe `bus` to them (or to
    /// every channel in discovery mode).
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Transport`] when the bus refuses a
    /// subscription.
    pub fn new(
        config: &BridgeConfig,
        resolver: Arc<TypeResolver>,
        bus: Arc<dyn BusTransport>,
        hostname: impl Into<String>,
    ) -> Result<Self, BridgeError> {
        let mut registry = TopicRegistry::new(config.queue_size);
        for channel in &config.ignore_channels {
            registry.ignore(channel.clone());
        }
        for spec in config.channels() {
            registry.ensure_topic_with_capacity(
                &spec.channel,
                Some(&spec.dtype),
                None,
                spec.queue_size,
                &resolver,
            );
        }

        let discovery = config.discovery();
        if discovery {
            bus.subscribe(ALL_CHANNELS)?;
            info!(modules = ?resolver.modules(), "discovery mode: listening on every channel");
        } else {
            for header in registry.headers() {
                bus.subscribe(&regex::escape(&header.channel))?;
            }
        }

        Ok(Self {
            registry,
            resolver,
            bus,
            outboxes: HashMap::new(),
            hostname: hostname.into(),
            stale_after: config.stale_after_micros(),
            discovery,
        })
    }

    #[cfg(test)]
    fn registry(&self) -> &TopicRegistry {
        &self.registry
    }

    /// Start routing pushes for `conn` into `outbox`.
    pub fn connect(&mut self, conn: ConnectionId, outbox: mpsc::Sender<String>) {
        debug!(conn = %conn, "client connected");
        self.outboxes.insert(conn, outbox);
    }

    /// Forget `conn` and every subscription it held.
    pub fn disconnect(&mut self, conn: ConnectionId) {
        self.registry.remove_connection(conn);
        if self.outboxes.remove(&conn).is_some() {
            debug!(conn = %conn, "client disconnected");
        }
    }

    /// Drop every outbox, which ends each connection's writer.
    pub fn shutdown(&mut self) {
        info!(clients = self.outboxes.len(), "closing client connections");
        for (conn, _) in self.outboxes.drain() {
            self.registry.remove_connection(conn);
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Client side
    // ─────────────────────────────────────────────────────────────────────

    /// Handle one client frame received at `now` (microseconds), returning
    /// the reply to send back, if any.
    ///
    /// Errors never escape: they come back as ERROR envelopes and the
    /// connection carries on.
    pub fn handle(&mut self, conn: ConnectionId, frame: &str, now: i64) -> Option<Envelope> {
        debug!(conn = %conn, frame, "client frame");
        match Envelope::decode(frame).and_then(|env| self.handle_envelope(conn, env, now)) {
            Ok(reply) => reply,
            Err(e) => {
                warn!(conn = %conn, error = %e, "bad request");
                Some(Envelope::error(e.to_string()))
            }
        }
    }

    /// Apply one decoded envelope.
    pub fn handle_envelope(
        &mut self,
        conn: ConnectionId,
        env: Envelope,
        now: i64,
    ) -> Result<Option<Envelope>, BridgeError> {
        match env.kind {
            MessageKind::Init => Ok(None),
            MessageKind::Request => self.request(&env, now).map(Some),
            MessageKind::Publish => match self.publish(&env, now) {
                Ok(()) => Ok(None),
                Err(e) => {
                    let msg = publish_error(&env, &e);
                    warn!(conn = %conn, channel = env.channel(), error = %e, "bad publish");
                    Ok(Some(Envelope::error(msg)))
                }
            },
            MessageKind::Subscribe => self.subscribe(conn, &env).map(|()| None),
            MessageKind::Unsubscribe => {
                self.registry.unsubscribe(env.channel(), conn);
                Ok(None)
            }
            MessageKind::Response | MessageKind::Error => {
                let kind = format!("{:?}", env.kind).to_lowercase();
                Err(BridgeError::ProtocolParse(format!("Clients may not send {kind} messages.")))
            }
        }
    }

    fn request(&mut self, env: &Envelope, now: i64) -> Result<Envelope, BridgeError> {
        let channel = env.channel();
        match channel {
            HOSTNAME_CHANNEL => {
                return Ok(Envelope::response(channel, None, Json::String(self.hostname.clone())));
            }
            CHANNELS_CHANNEL => {
                let headers = serde_json::to_value(self.registry.headers())
                    .map_err(|e| BridgeError::Encode(e.to_string()))?;
                return Ok(Envelope::response(channel, None, headers));
            }
            _ => {}
        }

        let queue = self
            .registry
            .queue_mut(channel)
            .ok_or_else(|| BridgeError::UnknownChannel(channel.to_string()))?;
        let arrival = queue
            .latest_arrival_time()
            .ok_or_else(|| BridgeError::EmptyChannel(channel.to_string()))?;
        if let Some(threshold) = self.stale_after
            && now - arrival > threshold
        {
            queue.pop();
            return Err(BridgeError::StaleData(channel.to_string()));
        }

        let data = match (wants_raw(env.data.as_ref()), queue.latest()) {
            (true, Some(sample)) => Json::String(BASE64.encode(&sample.payload)),
            _ => queue.latest_decoded(&self.resolver)?.to_json(),
        };
        Ok(Envelope::response(channel, Some(queue.dtype().to_string()), data))
    }

    fn publish(&mut self, env: &Envelope, now: i64) -> Result<(), BridgeError> {
        let channel = env.channel();
        let dtype = env.dtype.as_deref().unwrap_or_default();
        let data = env.data.as_ref().unwrap_or(&Json::Null);

        let entry = self.resolver.resolve_by_name(dtype)?;
        let value = Value::from_json(data)?;
        let mut record = from_structured(self.resolver.directory(), entry, &value)?;
        if has_utime(entry)
            && let Some(utime) = record.get_mut("utime")
        {
            *utime = Field::I64(now);
        }
        let bytes = codec::encode(self.resolver.directory(), entry, &record)?;
        self.bus.publish(channel, &bytes)?;
        debug!(channel, dtype, len = bytes.len(), "published to bus");
        Ok(())
    }

    fn subscribe(&mut self, conn: ConnectionId, env: &Envelope) -> Result<(), BridgeError> {
        let channel = env.channel();
        if !self.registry.contains(channel) {
            // An unknown channel can still be created when the client names
            // a type we know.
            let dtype = env
                .dtype
                .as_deref()
                .filter(|name| self.resolver.resolve_by_name(name).is_ok())
                .ok_or_else(|| BridgeError::UnknownChannel(channel.to_string()))?;
            if !self.registry.ensure_topic(channel, Some(dtype), None, &self.resolver) {
                return Err(BridgeError::UnknownChannel(channel.to_string()));
            }
            if !self.discovery {
                self.bus.subscribe(&regex::escape(channel))?;
            }
        }
        self.registry.subscribe(channel, conn);
        debug!(conn = %conn, channel, "subscribed");
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────
    // Bus side
    // ─────────────────────────────────────────────────────────────────────

    /// Queue a bus message and push it to the topic's subscribers.
    pub fn on_bus_message(&mut self, message: BusMessage, arrival_micros: i64) {
        let BusMessage { channel, payload } = message;
        if self.registry.is_ignored(&channel) {
            return;
        }
        if !self.registry.contains(&channel)
            && !(self.discovery
                && self
                    .registry
                    .ensure_topic(&channel, None, Some(&payload), &self.resolver))
        {
            return;
        }

        let Some(queue) = self.registry.queue_mut(&channel) else {
            return;
        };
        queue.push(payload, arrival_micros);
        if self.registry.has_subscribers(&channel) {
            self.fan_out(&channel);
        }
    }

    fn fan_out(&mut self, channel: &str) {
        let frame = match self.update_frame(channel) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(channel, error = %e, "cannot decode update, not pushing it");
                return;
            }
        };

        let mut gone = Vec::new();
        for conn in self.registry.subscribers(channel) {
            let Some(outbox) = self.outboxes.get(&conn) else {
                gone.push(conn);
                continue;
            };
            match outbox.try_send(frame.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    warn!(conn = %conn, channel, "client outbox full, dropping update");
                }
                Err(TrySendError::Closed(_)) => {
                    debug!(conn = %conn, channel, "client outbox closed, unsubscribing");
                    gone.push(conn);
                }
            }
        }
        for conn in gone {
            self.registry.unsubscribe(channel, conn);
        }
    }

    fn update_frame(&self, channel: &str) -> Result<String, BridgeError> {
        let queue = self
            .registry
            .queue(channel)
            .ok_or_else(|| BridgeError::UnknownChannel(channel.to_string()))?;
        let value = queue.latest_decoded(&self.resolver)?;
        Envelope::response(channel, Some(queue.dtype().to_string()), value.to_json()).encode()
    }
}

/// `data` of `{"raw": true}` asks for the undecoded payload.
fn wants_raw(data: Option<&Json>) -> bool {
    data.and_then(|d| d.get("raw"))
        .and_then(Json::as_bool)
        .unwrap_or(false)
}

/// Whether `entry` carries a scalar `int64 utime` stamped on publish.
fn has_utime(entry: &TypeEntry) -> bool {
    entry
        .schema
        .field_named("utime")
        .is_some_and(|f| f.dim.is_none() && f.ty == FieldType::Primitive(Primitive::Int64))
}

fn publish_error(env: &Envelope, e: &BridgeError) -> String {
    let dtype = env.dtype.as_deref().unwrap_or_default();
    let data = env.data.as_ref().map(Json::to_string).unwrap_or_default();
    format!("Bad MBot publish. Bad message type ({dtype}) or data ({data}). {e}")
}

// ─────────────────────────────────────────────────────────────────────────────
// Actor
// ─────────────────────────────────────────────────────────────────────────────

enum Command {
    Connect {
        conn: ConnectionId,
        outbox: mpsc::Sender<String>,
    },
    Disconnect {
        conn: ConnectionId,
    },
    Frame {
        conn: ConnectionId,
        text: String,
        reply: oneshot::Sender<Option<Envelope>>,
    },
    Deliver {
        message: BusMessage,
        arrival_micros: i64,
    },
    Shutdown,
}

/// Cloneable handle to a running bridge task.
#[derive(Clone, Debug)]
pub struct BridgeHandle {
    commands: mpsc::Sender<Command>,
}

fn stopped() -> BridgeError {
    BridgeError::Transport("bridge has shut down".to_string())
}

impl BridgeHandle {
    pub async fn connect(&self, conn: ConnectionId, outbox: mpsc::Sender<String>) -> Result<(), BridgeError> {
        self.commands
            .send(Command::Connect { conn, outbox })
            .await
            .map_err(|_| stopped())
    }

    pub async fn disconnect(&self, conn: ConnectionId) {
        // Nothing to clean up once the bridge is gone.
        let _ = self.commands.send(Command::Disconnect { conn }).await;
    }

    /// Hand a client frame to the bridge and wait for its reply.
    pub async fn dispatch(&self, conn: ConnectionId, text: impl Into<String>) -> Result<Option<Envelope>, BridgeError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::Frame {
                conn,
                text: text.into(),
                reply,
            })
            .await
            .map_err(|_| stopped())?;
        response.await.map_err(|_| stopped())
    }

    /// Hand a bus message over from a non-async thread.
    ///
    /// # Panics
    ///
    /// Panics when called from inside an async runtime, as
    /// [`mpsc::Sender::blocking_send`] does.
    pub fn deliver_blocking(&self, message: BusMessage, arrival_micros: i64) -> Result<(), BridgeError> {
        self.commands
            .blocking_send(Command::Deliver {
                message,
                arrival_micros,
            })
            .map_err(|_| stopped())
    }

    pub async fn deliver(&self, message: BusMessage, arrival_micros: i64) -> Result<(), BridgeError> {
        self.commands
            .send(Command::Deliver {
                message,
                arrival_micros,
            })
            .await
            .map_err(|_| stopped())
    }

    /// Ask the bridge to close every client outbox and stop.
    pub async fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown).await;
    }
}

/// Move `bridge` into its own task.
pub fn spawn_bridge(bridge: Bridge) -> (BridgeHandle, JoinHandle<()>) {
    let (commands, mailbox) = mpsc::channel(COMMAND_CAPACITY);
    let task = tokio::spawn(run(bridge, mailbox));
    (BridgeHandle { commands }, task)
}

async fn run(mut bridge: Bridge, mut mailbox: mpsc::Receiver<Command>) {
    while let Some(command) = mailbox.recv().await {
        match command {
            Command::Connect { conn, outbox } => bridge.connect(conn, outbox),
            Command::Disconnect { conn } => bridge.disconnect(conn),
            Command::Frame { conn, text, reply } => {
                let out = bridge.handle(conn, &text, crate::now_micros());
                // The client may have gone away while we were busy.
                let _ = reply.send(out);
            }
            Command::Deliver {
                message,
                arrival_micros,
            } => bridge.on_bus_message(message, arrival_micros),
            Command::Shutdown => {
                bridge.shutdown();
                break;
            }
        }
    }
    debug!("bridge task stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use mbot_lcm::LcmRecord;

    use crate::config::{ChannelSpec, Subscriptions};
    use crate::loopback::LoopbackBus;

    const SECOND: i64 = 1_000_000;

    fn odom_config() -> BridgeConfig {
        BridgeConfig {
            subs: Subscriptions::List(vec![ChannelSpec {
                channel: "ODOM".to_string(),
                dtype: "pose2D".to_string(),
                queue_size: None,
            }]),
            ..BridgeConfig::default()
        }
    }

    fn make_bridge(config: &BridgeConfig) -> (Arc<LoopbackBus>, Arc<TypeResolver>, Bridge) {
        let bus = Arc::new(LoopbackBus::new());
        let resolver = Arc::new(TypeResolver::builtin().unwrap());
        let bridge = Bridge::new(config, Arc::clone(&resolver), bus.clone(), "mbot-01").unwrap();
        (bus, resolver, bridge)
    }

    fn pose_bytes(resolver: &TypeResolver, x: f32, y: f32, theta: f32) -> Vec<u8> {
        let record = LcmRecord::new("pose2D")
            .with("x", Field::F32(x))
            .with("y", Field::F32(y))
            .with("theta", Field::F32(theta));
        resolver.encode("pose2D", &record).unwrap()
    }

    fn reply_text(reply: Option<Envelope>) -> String {
        reply.expect("expected a reply").encode().unwrap()
    }

    fn error_msg(reply: Option<Envelope>) -> String {
        let env = reply.expect("expected a reply");
        assert_eq!(env.kind, MessageKind::Error);
        env.msg.unwrap()
    }

    #[test]
    fn request_returns_latest_value() {
        let (_bus, resolver, mut bridge) = make_bridge(&odom_config());
        let conn = ConnectionId::new();
        bridge.on_bus_message(BusMessage::new("ODOM", pose_bytes(&resolver, 1.0, 2.0, 0.5)), 0);

        let reply = bridge.handle(conn, r#"{"type":"request","channel":"ODOM"}"#, SECOND);
        assert_eq!(
            reply_text(reply),
            r#"{"type":"response","channel":"ODOM","dtype":"pose2D","data":{"x":1.0,"y":2.0,"theta":0.5}}"#
        );
    }

    #[test]
    fn unknown_and_empty_channels_are_distinct_errors() {
        let (_bus, _resolver, mut bridge) = make_bridge(&odom_config());
        let conn = ConnectionId::new();

        let unknown = error_msg(bridge.handle(conn, r#"{"type":"request","channel":"LIDAR"}"#, 0));
        let empty = error_msg(bridge.handle(conn, r#"{"type":"request","channel":"ODOM"}"#, 0));
        assert_eq!(unknown, "No channel: LIDAR");
        assert_eq!(empty, "No data on channel: ODOM");
    }

    #[test]
    fn stale_value_is_discarded() {
        let config = BridgeConfig {
            stale_after_secs: 0.5,
            ..odom_config()
        };
        let (_bus, resolver, mut bridge) = make_bridge(&config);
        let conn = ConnectionId::new();
        let request = r#"{"type":"request","channel":"ODOM"}"#;
        bridge.on_bus_message(BusMessage::new("ODOM", pose_bytes(&resolver, 1.0, 2.0, 0.5)), 0);

        // Exactly at the threshold is still fresh.
        let fresh = bridge.handle(conn, request, SECOND / 2).unwrap();
        assert_eq!(fresh.kind, MessageKind::Response);

        let stale = error_msg(bridge.handle(conn, request, SECOND / 2 + 1));
        assert_eq!(stale, "Data on channel ODOM is old");
        let empty = error_msg(bridge.handle(conn, request, SECOND));
        assert_eq!(empty, "No data on channel: ODOM");
    }

    #[test]
    fn staleness_disabled_by_default() {
        let (_bus, resolver, mut bridge) = make_bridge(&odom_config());
        bridge.on_bus_message(BusMessage::new("ODOM", pose_bytes(&resolver, 0.0, 0.0, 0.0)), 0);
        let reply = bridge.handle(ConnectionId::new(), r#"{"type":"request","channel":"ODOM"}"#, 3600 * SECOND);
        assert_eq!(reply.unwrap().kind, MessageKind::Response);
    }

    #[test]
    fn raw_request_returns_base64_payload() {
        let (_bus, resolver, mut bridge) = make_bridge(&odom_config());
        let bytes = pose_bytes(&resolver, 1.0, 2.0, 0.5);
        bridge.on_bus_message(BusMessage::new("ODOM", bytes.clone()), 0);

        let reply = bridge
            .handle(
                ConnectionId::new(),
                r#"{"type":"request","channel":"ODOM","data":{"raw":true}}"#,
                0,
            )
            .unwrap();
        assert_eq!(reply.dtype.as_deref(), Some("pose2D"));
        assert_eq!(reply.data, Some(Json::String(BASE64.encode(&bytes))));
    }

    #[test]
    fn hostname_meta_topic() {
        let (_bus, _resolver, mut bridge) = make_bridge(&odom_config());
        let reply = bridge.handle(ConnectionId::new(), r#"{"type":"request","channel":"HOSTNAME"}"#, 0);
        assert_eq!(
            reply_text(reply),
            r#"{"type":"response","channel":"HOSTNAME","data":"mbot-01"}"#
        );
    }

    #[test]
    fn channels_meta_topic() {
        let (_bus, _resolver, mut bridge) = make_bridge(&odom_config());
        let reply = bridge.handle(ConnectionId::new(), r#"{"type":"request","channel":"CHANNELS"}"#, 0);
        assert_eq!(
            reply_text(reply),
            r#"{"type":"response","channel":"CHANNELS","data":[{"channel":"ODOM","dtype":"pose2D","queue_size":1}]}"#
        );
    }

    #[test]
    fn publish_reaches_the_bus_without_reply() {
        let (bus, resolver, mut bridge) = make_bridge(&odom_config());
        let tap = bus.tap();
        let reply = bridge.handle(
            ConnectionId::new(),
            r#"{"type":"publish","channel":"CMD","dtype":"twist2D","data":{"vx":0.5,"vy":0,"wz":0}}"#,
            0,
        );
        assert!(reply.is_none());

        let sent = tap.try_recv().unwrap();
        assert_eq!(sent.channel, "CMD");
        let value = resolver.decode_value("twist2D", &sent.payload).unwrap();
        assert_eq!(value.to_json(), serde_json::json!({"vx": 0.5, "vy": 0.0, "wz": 0.0}));
        assert!(tap.try_recv().is_err());
    }

    #[test]
    fn publish_stamps_utime() {
        let (bus, resolver, mut bridge) = make_bridge(&odom_config());
        let tap = bus.tap();
        let reply = bridge.handle(
            ConnectionId::new(),
            r#"{"type":"publish","channel":"TICK","dtype":"timestamp","data":{"utime":5}}"#,
            42 * SECOND,
        );
        assert!(reply.is_none());
        let sent = tap.try_recv().unwrap();
        let value = resolver.decode_value("timestamp", &sent.payload).unwrap();
        assert_eq!(value.as_record().unwrap().get("utime").unwrap().as_i64(), Some(42 * SECOND));
    }

    #[test]
    fn bad_publish_is_reported_to_sender() {
        let (bus, _resolver, mut bridge) = make_bridge(&odom_config());
        let tap = bus.tap();
        let conn = ConnectionId::new();

        let msg = error_msg(bridge.handle(
            conn,
            r#"{"type":"publish","channel":"CMD","dtype":"twist2D","data":{"speed":1}}"#,
            0,
        ));
        assert!(msg.starts_with("Bad MBot publish. Bad message type (twist2D) or data ({\"speed\":1})."));
        assert!(msg.contains("no field named speed"));

        let msg = error_msg(bridge.handle(
            conn,
            r#"{"type":"publish","channel":"CMD","dtype":"warp_drive","data":{}}"#,
            0,
        ));
        assert!(msg.contains("Unknown message type: warp_drive"));
        assert!(tap.try_recv().is_err());
    }

    #[test]
    fn malformed_frames_get_errors() {
        let (_bus, _resolver, mut bridge) = make_bridge(&odom_config());
        let conn = ConnectionId::new();
        assert!(error_msg(bridge.handle(conn, "not-json", 0)).contains("not valid JSON"));
        assert!(error_msg(bridge.handle(conn, r#"{"channel":"ODOM"}"#, 0)).contains("type"));
        assert!(error_msg(bridge.handle(conn, r#"{"type":"request"}"#, 0)).contains("channel"));
        assert!(error_msg(bridge.handle(conn, r#"{"type":"response","channel":"ODOM"}"#, 0))
            .contains("may not send response"));
        assert!(bridge.handle(conn, r#"{"type":"init"}"#, 0).is_none());
    }

    #[test]
    fn fan_out_reaches_every_subscriber_in_order() {
        let (_bus, resolver, mut bridge) = make_bridge(&odom_config());
        let mut inboxes = Vec::new();
        for _ in 0..3 {
            let conn = ConnectionId::new();
            let (tx, rx) = mpsc::channel(8);
            bridge.connect(conn, tx);
            assert!(bridge.handle(conn, r#"{"type":"subscribe","channel":"ODOM"}"#, 0).is_none());
            inboxes.push(rx);
        }

        bridge.on_bus_message(BusMessage::new("ODOM", pose_bytes(&resolver, 1.0, 0.0, 0.0)), 1);
        bridge.on_bus_message(BusMessage::new("ODOM", pose_bytes(&resolver, 2.0, 0.0, 0.0)), 2);

        for rx in &mut inboxes {
            let first = Envelope::decode(&rx.try_recv().unwrap()).unwrap();
            let second = Envelope::decode(&rx.try_recv().unwrap()).unwrap();
            assert_eq!(first.data.unwrap()["x"], 1.0);
            assert_eq!(second.data.unwrap()["x"], 2.0);
            assert!(rx.try_recv().is_err());
        }
    }

    #[test]
    fn closed_outbox_only_removes_that_subscriber() {
        let (_bus, resolver, mut bridge) = make_bridge(&odom_config());
        let (alive, gone) = (ConnectionId::new(), ConnectionId::new());
        let (tx_alive, mut rx_alive) = mpsc::channel(8);
        let (tx_gone, rx_gone) = mpsc::channel(8);
        bridge.connect(alive, tx_alive);
        bridge.connect(gone, tx_gone);
        bridge.handle(alive, r#"{"type":"subscribe","channel":"ODOM"}"#, 0);
        bridge.handle(gone, r#"{"type":"subscribe","channel":"ODOM"}"#, 0);
        drop(rx_gone);

        bridge.on_bus_message(BusMessage::new("ODOM", pose_bytes(&resolver, 1.0, 0.0, 0.0)), 1);
        assert!(rx_alive.try_recv().is_ok());
        assert_eq!(bridge.registry().subscribers("ODOM"), [alive]);

        bridge.on_bus_message(BusMessage::new("ODOM", pose_bytes(&resolver, 2.0, 0.0, 0.0)), 2);
        assert!(rx_alive.try_recv().is_ok());
    }

    #[test]
    fn full_outbox_drops_update_but_keeps_subscriber() {
        let (_bus, resolver, mut bridge) = make_bridge(&odom_config());
        let conn = ConnectionId::new();
        let (tx, mut rx) = mpsc::channel(1);
        bridge.connect(conn, tx);
        bridge.handle(conn, r#"{"type":"subscribe","channel":"ODOM"}"#, 0);

        bridge.on_bus_message(BusMessage::new("ODOM", pose_bytes(&resolver, 1.0, 0.0, 0.0)), 1);
        bridge.on_bus_message(BusMessage::new("ODOM", pose_bytes(&resolver, 2.0, 0.0, 0.0)), 2);

        let only = Envelope::decode(&rx.try_recv().unwrap()).unwrap();
        assert_eq!(only.data.unwrap()["x"], 1.0);
        assert!(rx.try_recv().is_err());
        assert_eq!(bridge.registry().subscribers("ODOM"), [conn]);
    }

    #[test]
    fn subscribe_to_unknown_channel() {
        let (bus, _resolver, mut bridge) = make_bridge(&odom_config());
        let conn = ConnectionId::new();

        let msg = error_msg(bridge.handle(conn, r#"{"type":"subscribe","channel":"LIDAR"}"#, 0));
        assert_eq!(msg, "No channel: LIDAR");
        let msg = error_msg(bridge.handle(conn, r#"{"type":"subscribe","channel":"LIDAR","dtype":"nope"}"#, 0));
        assert_eq!(msg, "No channel: LIDAR");
        assert!(!bridge.registry().is_ignored("LIDAR"));

        // With a known type the topic is created and the bus subscribed.
        let reply = bridge.handle(conn, r#"{"type":"subscribe","channel":"LIDAR","dtype":"lidar"}"#, 0);
        assert!(reply.is_none());
        assert_eq!(bridge.registry().subscribers("LIDAR"), [conn]);
        bus.publish("LIDAR", b"scan").unwrap();
        let got = bus.recv_timeout(Duration::ZERO).unwrap().unwrap();
        assert_eq!(got.channel, "LIDAR");
    }

    #[test]
    fn unsubscribe_is_idempotent_and_disconnect_cleans_up() {
        let (_bus, _resolver, mut bridge) = make_bridge(&odom_config());
        let conn = ConnectionId::new();
        let (tx, _rx) = mpsc::channel(1);
        bridge.connect(conn, tx);
        bridge.handle(conn, r#"{"type":"subscribe","channel":"ODOM"}"#, 0);

        assert!(bridge.handle(conn, r#"{"type":"unsubscribe","channel":"ODOM"}"#, 0).is_none());
        assert!(bridge.handle(conn, r#"{"type":"unsubscribe","channel":"ODOM"}"#, 0).is_none());
        assert!(bridge.handle(conn, r#"{"type":"unsubscribe","channel":"NOPE"}"#, 0).is_none());
        assert!(!bridge.registry().has_subscribers("ODOM"));

        bridge.handle(conn, r#"{"type":"subscribe","channel":"ODOM"}"#, 0);
        bridge.disconnect(conn);
        assert!(!bridge.registry().has_subscribers("ODOM"));
    }

    #[test]
    fn discovery_mode_registers_on_first_sighting() {
        let config = BridgeConfig {
            ignore_channels: vec!["SECRET".to_string()],
            ..BridgeConfig::default()
        };
        let (_bus, resolver, mut bridge) = make_bridge(&config);
        let bytes = pose_bytes(&resolver, 1.0, 2.0, 0.5);

        bridge.on_bus_message(BusMessage::new("SLAM_POSE", bytes.clone()), 0);
        bridge.on_bus_message(BusMessage::new("NOISE", b"garbage".to_vec()), 0);
        bridge.on_bus_message(BusMessage::new("NOISE", bytes.clone()), 0);
        bridge.on_bus_message(BusMessage::new("SECRET", bytes), 0);

        assert_eq!(bridge.registry().queue("SLAM_POSE").unwrap().dtype(), "pose2D");
        assert!(bridge.registry().is_ignored("NOISE"));
        assert!(!bridge.registry().contains("NOISE"));
        assert!(!bridge.registry().contains("SECRET"));
    }

    #[test]
    fn configured_mode_skips_unconfigured_channels() {
        let (_bus, resolver, mut bridge) = make_bridge(&odom_config());
        bridge.on_bus_message(BusMessage::new("OTHER", pose_bytes(&resolver, 0.0, 0.0, 0.0)), 0);
        assert!(!bridge.registry().contains("OTHER"));
    }

    #[tokio::test]
    async fn actor_serves_requests_and_pushes() {
        let (_bus, resolver, bridge) = make_bridge(&odom_config());
        let (handle, task) = spawn_bridge(bridge);
        let conn = ConnectionId::new();
        let (tx, mut rx) = mpsc::channel(8);
        handle.connect(conn, tx).await.unwrap();

        let reply = handle
            .dispatch(conn, r#"{"type":"subscribe","channel":"ODOM"}"#)
            .await
            .unwrap();
        assert!(reply.is_none());

        handle
            .deliver(BusMessage::new("ODOM", pose_bytes(&resolver, 1.0, 2.0, 0.5)), crate::now_micros())
            .await
            .unwrap();
        let pushed = rx.recv().await.unwrap();
        assert!(pushed.contains(r#""channel":"ODOM""#));

        let reply = handle
            .dispatch(conn, r#"{"type":"request","channel":"ODOM"}"#)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply.kind, MessageKind::Response);

        handle.shutdown().await;
        task.await.unwrap();
        assert!(rx.recv().await.is_none());
        assert!(handle.dispatch(conn, r#"{"type":"init"}"#).await.is_err());
    }
}
