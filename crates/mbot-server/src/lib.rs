//! `mbot-server` – the WebSocket front end of the MBot bridge.
//!
//! Accepts client connections and shuttles JSON frames between each socket
//! and the bridge task:
//!
//! - [`server`] – [`BridgeServer`], the accept loop.
//! - [`connection`] – the per-client read loop and its writer task.
//!
//! # Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use mbot_lcm::TypeResolver;
//! use mbot_middleware::{spawn_bridge, Bridge, BridgeConfig, LoopbackBus};
//! use mbot_server::BridgeServer;
//! use tokio::sync::watch;
//!
//! #[tokio::main]
//! async fn main() {
//!     let resolver = Arc::new(TypeResolver::builtin().unwrap());
//!     let bus = Arc::new(LoopbackBus::new());
//!     let bridge = Bridge::new(&BridgeConfig::default(), resolver, bus, "mbot").unwrap();
//!     let (handle, _task) = spawn_bridge(bridge);
//!     let (_stop, shutdown) = watch::channel(false);
//!     BridgeServer::new(handle)
//!         .bind()
//!         .await
//!         .expect("bind failed")
//!         .serve(shutdown)
//!         .await
//!         .expect("server failed");
//! }
//! ```

pub mod connection;
pub mod server;

pub use server::{BoundServer, BridgeServer, DEFAULT_PORT};
