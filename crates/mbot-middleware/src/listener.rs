//! [`BusListener`] – the blocking bus-delivery loop.
//!
//! Runs on its own OS thread: waits on the bus with a bounded timeout and
//! hands each message to the bridge task.  It never touches a client
//! socket, so a slow client cannot hold up the next receive.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::bridge::BridgeHandle;
use crate::transport::BusTransport;

/// Pause after a failed receive so a broken socket does not spin.
const ERROR_BACKOFF: Duration = Duration::from_millis(100);

pub struct BusListener {
    bus: Arc<dyn BusTransport>,
    bridge: BridgeHandle,
    running: Arc<AtomicBool>,
    timeout: Duration,
}

impl BusListener {
    /// `running` is checked once per receive timeout; clearing it stops the
    /// loop within one `timeout`.
    pub fn new(
        bus: Arc<dyn BusTransport>,
        bridge: BridgeHandle,
        running: Arc<AtomicBool>,
        timeout: Duration,
    ) -> Self {
        Self {
            bus,
            bridge,
            running,
            timeout,
        }
    }

    /// Run the loop on a dedicated thread.
    pub fn spawn(self) -> std::io::Result<thread::JoinHandle<()>> {
        thread::Builder::new()
            .name("mbot-bus".to_string())
            .spawn(move || self.run())
    }

    /// Run the loop on the current thread until `running` is cleared or the
    /// bridge stops.
    pub fn run(self) {
        info!(timeout_ms = self.timeout.as_millis() as u64, "bus listener started");
        while self.running.load(Ordering::Acquire) {
            match self.bus.recv_timeout(self.timeout) {
                Ok(Some(message)) => {
                    let arrival = crate::now_micros();
                    if self.bridge.deliver_blocking(message, arrival).is_err() {
                        debug!("bridge stopped, leaving bus loop");
                        break;
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(error = %e, "bus receive failed");
                    thread::sleep(ERROR_BACKOFF.min(self.timeout));
                }
            }
        }
        info!("bus listener stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mbot_lcm::{Field, LcmRecord, TypeResolver};
    use mbot_types::{ConnectionId, Envelope};
    use tokio::sync::mpsc;

    use crate::bridge::{spawn_bridge, Bridge};
    use crate::config::BridgeConfig;
    use crate::loopback::LoopbackBus;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn bus_messages_reach_subscribers() {
        let bus = Arc::new(LoopbackBus::new());
        let resolver = Arc::new(TypeResolver::builtin().unwrap());
        let bridge = Bridge::new(&BridgeConfig::default(), Arc::clone(&resolver), bus.clone(), "").unwrap();
        let (handle, task) = spawn_bridge(bridge);

        let running = Arc::new(AtomicBool::new(true));
        let listener = BusListener::new(
            bus.clone(),
            handle.clone(),
            Arc::clone(&running),
            Duration::from_millis(20),
        )
        .spawn()
        .unwrap();

        let record = LcmRecord::new("twist2D")
            .with("vx", Field::F32(0.25))
            .with("vy", Field::F32(0.0))
            .with("wz", Field::F32(0.0));
        let bytes = resolver.encode("twist2D", &record).unwrap();

        // First sighting registers the topic in discovery mode.
        bus.publish("CMD", &bytes).unwrap();
        let conn = ConnectionId::new();
        let (tx, mut rx) = mpsc::channel(4);
        handle.connect(conn, tx).await.unwrap();
        let mut subscribed = false;
        for _ in 0..100 {
            let reply = handle
                .dispatch(conn, r#"{"type":"subscribe","channel":"CMD"}"#)
                .await
                .unwrap();
            if reply.is_none() {
                subscribed = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(subscribed);

        bus.publish("CMD", &bytes).unwrap();
        let pushed = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        let env = Envelope::decode(&pushed).unwrap();
        assert_eq!(env.dtype.as_deref(), Some("twist2D"));

        running.store(false, std::sync::atomic::Ordering::Release);
        tokio::task::spawn_blocking(move || listener.join().unwrap())
            .await
            .unwrap();
        handle.shutdown().await;
        task.await.unwrap();
    }
}
