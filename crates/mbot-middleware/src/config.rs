//! [`BridgeConfig`] – the plain configuration structure the core consumes.
//!
//! Loading it from disk and applying environment overrides is the binary's
//! job; this module only defines the shape and its defaults.
//!
//! ```toml
//! lcm_address = "udpm://239.255.76.67:7667?ttl=1"
//! stale_after_secs = 0.5
//! ignore_channels = ["LCM_SELF_TEST"]
//!
//! [[subs]]
//! channel = "ODOM"
//! type = "pose2D"
//! ```
//!
//! `subs = "all"` turns on discovery mode.

use mbot_lcm::BUILTIN_NAMESPACE;
use mbot_types::BridgeError;
use serde::{Deserialize, Serialize};

use crate::udpm::DEFAULT_URL;

/// One explicitly configured channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelSpec {
    pub channel: String,
    #[serde(rename = "type")]
    pub dtype: String,
    /// Overrides [`BridgeConfig::queue_size`] for this channel.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_size: Option<usize>,
}

/// Which bus channels the bridge listens to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "SubsRepr", into = "SubsRepr")]
pub enum Subscriptions {
    /// Discovery mode: every channel, types found by trial decoding.
    #[default]
    All,
    List(Vec<ChannelSpec>),
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum SubsRepr {
    Keyword(String),
    List(Vec<ChannelSpec>),
}

impl TryFrom<SubsRepr> for Subscriptions {
    type Error = String;

    fn try_from(repr: SubsRepr) -> Result<Self, Self::Error> {
        match repr {
            SubsRepr::Keyword(word) if word.eq_ignore_ascii_case("all") => Ok(Subscriptions::All),
            SubsRepr::Keyword(word) => Err(format!("subs must be \"all\" or a list of channels, not {word:?}")),
            SubsRepr::List(list) => Ok(Subscriptions::List(list)),
        }
    }
}

impl From<Subscriptions> for SubsRepr {
    fn from(subs: Subscriptions) -> Self {
        match subs {
            Subscriptions::All => SubsRepr::Keyword("all".to_string()),
            Subscriptions::List(list) => SubsRepr::List(list),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub lcm_address: String,
    pub subs: Subscriptions,
    pub ignore_channels: Vec<String>,
    /// Type namespaces searched for names and during discovery, in order.
    pub lcm_type_modules: Vec<String>,
    /// Maximum age of a topic's latest value in seconds.  Negative disables
    /// the check.
    pub stale_after_secs: f64,
    /// Default per-topic queue capacity.
    pub queue_size: usize,
    /// How long one bus receive may block, in milliseconds.
    pub lcm_timeout_ms: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            lcm_address: DEFAULT_URL.to_string(),
            subs: Subscriptions::All,
            ignore_channels: Vec::new(),
            lcm_type_modules: vec![BUILTIN_NAMESPACE.to_string()],
            stale_after_secs: -1.0,
            queue_size: 1,
            lcm_timeout_ms: 1000,
        }
    }
}

impl BridgeConfig {
    pub fn discovery(&self) -> bool {
        matches!(self.subs, Subscriptions::All)
    }

    /// The staleness threshold in microseconds, or `None` when disabled.
    /// Fractional seconds are kept.
    pub fn stale_after_micros(&self) -> Option<i64> {
        if self.stale_after_secs < 0.0 || !self.stale_after_secs.is_finite() {
            return None;
        }
        Some((self.stale_after_secs * 1_000_000.0).round() as i64)
    }

    /// Channels configured explicitly, empty in discovery mode.
    pub fn channels(&self) -> &[ChannelSpec] {
        match &self.subs {
            Subscriptions::All => &[],
            Subscriptions::List(list) => list,
        }
    }

    /// Reject settings the bridge cannot run with.
    pub fn validate(&self) -> Result<(), BridgeError> {
        if self.queue_size == 0 {
            return Err(BridgeError::Config("queue_size must be at least 1".to_string()));
        }
        if self.lcm_timeout_ms == 0 {
            return Err(BridgeError::Config("lcm_timeout_ms must be positive".to_string()));
        }
        for spec in self.channels() {
            if spec.channel.is_empty() || spec.dtype.is_empty() {
                return Err(BridgeError::Config(format!(
                    "subscription {:?} needs both a channel and a type",
                    spec.channel
                )));
            }
            if spec.queue_size == Some(0) {
                return Err(BridgeError::Config(format!(
                    "queue_size of {} must be at least 1",
                    spec.channel
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = BridgeConfig::default();
        assert!(config.discovery());
        assert_eq!(config.lcm_type_modules, ["mbot_lcm_msgs"]);
        assert_eq!(config.stale_after_micros(), None);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn subs_accepts_all_keyword() {
        let config: BridgeConfig = serde_json::from_str(r#"{"subs":"all"}"#).unwrap();
        assert_eq!(config.subs, Subscriptions::All);
        let config: BridgeConfig = serde_json::from_str(r#"{"subs":"ALL"}"#).unwrap();
        assert!(config.discovery());
    }

    #[test]
    fn subs_accepts_channel_list() {
        let config: BridgeConfig = serde_json::from_str(
            r#"{"subs":[{"channel":"ODOM","type":"pose2D"},{"channel":"SLAM_POSE","type":"pose2D","queue_size":4}]}"#,
        )
        .unwrap();
        assert!(!config.discovery());
        assert_eq!(config.channels().len(), 2);
        assert_eq!(config.channels()[0].dtype, "pose2D");
        assert_eq!(config.channels()[1].queue_size, Some(4));
    }

    #[test]
    fn subs_rejects_other_keywords() {
        let parsed = serde_json::from_str::<BridgeConfig>(r#"{"subs":"some"}"#);
        assert!(parsed.is_err());
    }

    #[test]
    fn stale_threshold_keeps_fractions() {
        let config = BridgeConfig {
            stale_after_secs: 0.25,
            ..BridgeConfig::default()
        };
        assert_eq!(config.stale_after_micros(), Some(250_000));
        let zero = BridgeConfig {
            stale_after_secs: 0.0,
            ..BridgeConfig::default()
        };
        assert_eq!(zero.stale_after_micros(), Some(0));
    }

    #[test]
    fn validate_rejects_empty_queue() {
        let config = BridgeConfig {
            queue_size: 0,
            ..BridgeConfig::default()
        };
        assert!(matches!(config.validate(), Err(BridgeError::Config(_))));
    }

    #[test]
    fn serialises_back_to_the_keyword() {
        let json = serde_json::to_value(BridgeConfig::default()).unwrap();
        assert_eq!(json["subs"], "all");
    }
}
