//! [`TopicRegistry`] – topics, their subscribers, and the ignore-list.
//!
//! A topic is created once, either from configuration or on first sighting
//! in discovery mode, and lives for the rest of the process.  A topic whose
//! type cannot be determined is put on the ignore-list instead and never
//! looked at again.

use std::collections::{HashMap, HashSet};

use mbot_lcm::TypeResolver;
use mbot_types::{ChannelInfo, ConnectionId};
use tracing::{info, warn};

use crate::queue::TopicQueue;

#[derive(Debug)]
struct Topic {
    queue: TopicQueue,
    subscribers: HashSet<ConnectionId>,
}

#[derive(Debug)]
pub struct TopicRegistry {
    topics: HashMap<String, Topic>,
    /// Channel names in registration order, for `CHANNELS`.
    order: Vec<String>,
    ignored: HashSet<String>,
    default_capacity: usize,
}

impl TopicRegistry {
    pub fn new(default_capacity: usize) -> Self {
        Self {
            topics: HashMap::new(),
            order: Vec::new(),
            ignored: HashSet::new(),
            default_capacity: default_capacity.max(1),
        }
    }

    /// Put `channel` on the ignore-list.  Registered topics are unaffected.
    pub fn ignore(&mut self, channel: impl Into<String>) {
        self.ignored.insert(channel.into());
    }

    pub fn is_ignored(&self, channel: &str) -> bool {
        self.ignored.contains(channel)
    }

    pub fn contains(&self, channel: &str) -> bool {
        self.topics.contains_key(channel)
    }

    pub fn len(&self) -> usize {
        self.topics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.topics.is_empty()
    }

    pub fn queue(&self, channel: &str) -> Option<&TopicQueue> {
        self.topics.get(channel).map(|t| &t.queue)
    }

    pub fn queue_mut(&mut self, channel: &str) -> Option<&mut TopicQueue> {
        self.topics.get_mut(channel).map(|t| &mut t.queue)
    }

    /// Make sure `channel` is registered, returning whether it is usable.
    ///
    /// A registered channel is reused as is.  An ignored one stays ignored.
    /// Otherwise the type is resolved from `dtype` when given, or discovered
    /// by trial-decoding `sample`.  Either failure puts the channel on the
    /// ignore-list.  With neither a type nor a sample there is nothing to go
    /// on and the channel is left alone.
    pub fn ensure_topic(
        &mut self,
        channel: &str,
        dtype: Option<&str>,
        sample: Option<&[u8]>,
        resolver: &TypeResolver,
    ) -> bool {
        self.ensure_topic_with_capacity(channel, dtype, sample, None, resolver)
    }

    /// [`ensure_topic`][Self::ensure_topic] with an explicit queue capacity
    /// instead of the registry default.
    pub fn ensure_topic_with_capacity(
        &mut self,
        channel: &str,
        dtype: Option<&str>,
        sample: Option<&[u8]>,
        capacity: Option<usize>,
        resolver: &TypeResolver,
    ) -> bool {
        if self.contains(channel) {
            return true;
        }
        if self.is_ignored(channel) {
            return false;
        }

        let dtype = match (dtype, sample) {
            (Some(name), _) => match resolver.resolve_by_name(name) {
                Ok(_) => name.to_string(),
                Err(e) => {
                    warn!(channel, error = %e, "ignoring channel with unknown message type");
                    self.ignore(channel);
                    return false;
                }
            },
            (None, Some(bytes)) => match resolver.discover(bytes) {
                Ok(entry) => entry.name().to_string(),
                Err(e) => {
                    warn!(channel, error = %e, "could not discover message type, ignoring channel");
                    self.ignore(channel);
                    return false;
                }
            },
            (None, None) => return false,
        };

        let capacity = capacity.unwrap_or(self.default_capacity);
        info!(channel, dtype = %dtype, queue_size = capacity, "listening on channel");
        self.topics.insert(
            channel.to_string(),
            Topic {
                queue: TopicQueue::new(channel, dtype, capacity),
                subscribers: HashSet::new(),
            },
        );
        self.order.push(channel.to_string());
        true
    }

    /// Add `conn` to the subscribers of `channel`.  Returns `false` when the
    /// channel is not registered.
    pub fn subscribe(&mut self, channel: &str, conn: ConnectionId) -> bool {
        match self.topics.get_mut(channel) {
            Some(topic) => {
                topic.subscribers.insert(conn);
                true
            }
            None => false,
        }
    }

    /// Remove `conn` from the subscribers of `channel`; a no-op for unknown
    /// channels and non-subscribers.
    pub fn unsubscribe(&mut self, channel: &str, conn: ConnectionId) {
        if let Some(topic) = self.topics.get_mut(channel) {
            topic.subscribers.remove(&conn);
        }
    }

    /// Drop `conn` from every subscriber set.
    pub fn remove_connection(&mut self, conn: ConnectionId) {
        for topic in self.topics.values_mut() {
            topic.subscribers.remove(&conn);
        }
    }

    pub fn subscribers(&self, channel: &str) -> Vec<ConnectionId> {
        self.topics
            .get(channel)
            .map(|t| t.subscribers.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn has_subscribers(&self, channel: &str) -> bool {
        self.topics
            .get(channel)
            .is_some_and(|t| !t.subscribers.is_empty())
    }

    /// Headers of every registered topic, in registration order.
    pub fn headers(&self) -> Vec<ChannelInfo> {
        self.order
            .iter()
            .filter_map(|name| self.topics.get(name))
            .map(|t| t.queue.describe())
            .collect()
    }
}
