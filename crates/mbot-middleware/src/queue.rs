//! [`TopicQueue`] – the bounded most-recent buffer of one topic.
//!
//! Queues are owned by the bridge actor and mutated through `&mut self`,
//! so no lock is involved: the actor's mailbox serialises every push and
//! read.

use std::collections::VecDeque;

use mbot_lcm::TypeResolver;
use mbot_types::{BridgeError, ChannelInfo, Value};

/// One raw payload and the time it arrived, in microseconds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sample {
    pub payload: Vec<u8>,
    pub arrival_micros: i64,
}

#[derive(Debug, Clone)]
pub struct TopicQueue {
    channel: String,
    dtype: String,
    capacity: usize,
    samples: VecDeque<Sample>,
}

impl TopicQueue {
    /// A capacity of zero is raised to one.
    pub fn new(channel: impl Into<String>, dtype: impl Into<String>, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            channel: channel.into(),
            dtype: dtype.into(),
            capacity,
            samples: VecDeque::with_capacity(capacity),
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn dtype(&self) -> &str {
        &self.dtype
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append a payload, evicting the oldest entries beyond capacity.
    pub fn push(&mut self, payload: Vec<u8>, arrival_micros: i64) {
        self.samples.push_back(Sample {
            payload,
            arrival_micros,
        });
        while self.samples.len() > self.capacity {
            self.samples.pop_front();
        }
    }

    /// The most recently pushed sample, left in place.
    pub fn latest(&self) -> Option<&Sample> {
        self.samples.back()
    }

    /// The newest payload decoded as this topic's type.
    ///
    /// # Errors
    ///
    /// [`BridgeError::EmptyChannel`] when nothing has arrived yet, otherwise
    /// whatever decoding reports.
    pub fn latest_decoded(&self, resolver: &TypeResolver) -> Result<Value, BridgeError> {
        let sample = self
            .latest()
            .ok_or_else(|| BridgeError::EmptyChannel(self.channel.clone()))?;
        resolver.decode_value(&self.dtype, &sample.payload)
    }

    /// Remove and return the oldest sample.
    pub fn pop(&mut self) -> Option<Sample> {
        self.samples.pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Arrival time of the newest sample, without touching its payload.
    pub fn latest_arrival_time(&self) -> Option<i64> {
        self.samples.back().map(|s| s.arrival_micros)
    }

    /// The header reported on the `CHANNELS` meta-topic.
    pub fn describe(&self) -> ChannelInfo {
        ChannelInfo {
            channel: self.channel.clone(),
            dtype: self.dtype.clone(),
            queue_size: self.capacity,
        }
    }
}
