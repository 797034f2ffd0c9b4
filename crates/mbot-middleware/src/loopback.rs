//! [`LoopbackBus`] – an in-process bus.
//!
//! Every publish is offered to the taps and, when its channel matches a
//! subscription, queued for [`recv_timeout`][BusTransport::recv_timeout].
//! Like a multicast bus with loopback enabled, a process sees its own
//! publishes.

use std::collections::VecDeque;
use std::sync::mpsc;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use mbot_types::BridgeError;

use crate::transport::{BusMessage, BusTransport, ChannelFilter};

#[derive(Default)]
struct State {
    filter: ChannelFilter,
    pending: VecDeque<BusMessage>,
    taps: Vec<mpsc::Sender<BusMessage>>,
}

#[derive(Default)]
pub struct LoopbackBus {
    state: Mutex<State>,
    ready: Condvar,
}

impl LoopbackBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Observe every message published on the bus, subscribed or not.
    pub fn tap(&self) -> mpsc::Receiver<BusMessage> {
        let (tx, rx) = mpsc::channel();
        self.lock().taps.push(tx);
        rx
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl BusTransport for LoopbackBus {
    fn subscribe(&self, pattern: &str) -> Result<(), BridgeError> {
        self.lock().filter.add(pattern)
    }

    fn recv_timeout(&self, timeout: Duration) -> Result<Option<BusMessage>, BridgeError> {
        let state = self.lock();
        let (mut state, _) = self
            .ready
            .wait_timeout_while(state, timeout, |s| s.pending.is_empty())
            .unwrap_or_else(PoisonError::into_inner);
        Ok(state.pending.pop_front())
    }

    fn publish(&self, channel: &str, payload: &[u8]) -> Result<(), BridgeError> {
        let message = BusMessage::new(channel, payload);
        let mut state = self.lock();
        state.taps.retain(|tap| tap.send(message.clone()).is_ok());
        if state.filter.matches(channel) {
            state.pending.push_back(message);
            self.ready.notify_one();
        }
        Ok(())
    }
}
