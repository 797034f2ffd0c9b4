//! [`BridgeServer`] – the WebSocket accept loop.
//!
//! Listens on `0.0.0.0:5005` by default (configurable via
//! [`BridgeServer::with_port`]).  Binding is a separate step so a bad port is
//! reported before anything is served, and so tests can bind port 0 and ask
//! for the address they got.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use mbot_middleware::BridgeHandle;
use mbot_types::BridgeError;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::connection::handle_connection;

/// Default TCP port for client connections.
pub const DEFAULT_PORT: u16 = 5005;

pub struct BridgeServer {
    bridge: BridgeHandle,
    host: IpAddr,
    port: u16,
}

impl BridgeServer {
    /// A server for `bridge` on all interfaces and the [`DEFAULT_PORT`].
    pub fn new(bridge: BridgeHandle) -> Self {
        Self {
            bridge,
            host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_PORT,
        }
    }

    /// Override the listening port (builder-style).
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Override the listening interface (builder-style).
    pub fn with_host(mut self, host: IpAddr) -> Self {
        self.host = host;
        self
    }

    /// Bind the listening socket.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Transport`] if the TCP listener cannot bind.
    pub async fn bind(self) -> Result<BoundServer, BridgeError> {
        let addr = SocketAddr::new(self.host, self.port);
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| BridgeError::Transport(format!("bind error on {addr}: {e}")))?;
        Ok(BoundServer {
            listener,
            bridge: self.bridge,
        })
    }
}

/// A server with its socket bound, ready to [`serve`][BoundServer::serve].
pub struct BoundServer {
    listener: TcpListener,
    bridge: BridgeHandle,
}

impl BoundServer {
    pub fn local_addr(&self) -> Result<SocketAddr, BridgeError> {
        self.listener
            .local_addr()
            .map_err(|e| BridgeError::Transport(e.to_string()))
    }

    /// Accept clients until `shutdown` turns `true` (or its sender is
    /// dropped), then wait for every connection to wind down.
    pub async fn serve(self, mut shutdown: watch::Receiver<bool>) -> Result<(), BridgeError> {
        let addr = self.local_addr()?;
        info!(%addr, "MBot Bridge listening for clients");

        let mut connections = JoinSet::new();
        loop {
            if *shutdown.borrow_and_update() {
                break;
            }
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let bridge = self.bridge.clone();
                        let shutdown = shutdown.clone();
                        connections.spawn(async move {
                            if let Err(e) = handle_connection(stream, peer, bridge, shutdown).await {
                                warn!(peer = %peer, error = %e, "client connection error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "accept error");
                    }
                },
                // Reap finished connections as we go.
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
            }
        }

        info!(open = connections.len(), "closing client connections");
        while connections.join_next().await.is_some() {}
        Ok(())
    }
}
