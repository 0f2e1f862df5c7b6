//! Protocol defaults and configuration documents.
//!
//! The constants are the wire-level defaults; the serde structs are
//! what an embedding application deserializes from its configuration
//! file (`serde_json5` documents, same dialect the rest of the stack
//! uses).

use serde::Deserialize;

use std::{ops::RangeInclusive, time::Duration};

/// default allocation lifetime granted by most servers, seconds.
pub const DEFAULT_ALLOCATION_LIFETIME: u32 = 600;

/// channel bindings live 10 minutes and are refreshed at 9.
pub const CHANNEL_BIND_LIFETIME: Duration = Duration::from_secs(600);
pub const CHANNEL_BIND_REFRESH: Duration = Duration::from_secs(540);

/// permissions live 5 minutes and are re-issued at 4.
pub const PERMISSION_LIFETIME: Duration = Duration::from_secs(300);
pub const PERMISSION_REFRESH: Duration = Duration::from_secs(240);

/// how long a cached (realm, nonce) pair stays usable.
pub const NONCE_CACHE_LIFETIME: Duration = Duration::from_secs(600);

pub const DEFAULT_CHANNEL_RANGE: RangeInclusive<u16> = 0x4000..=0x7FFF;

/// reliable channel timing defaults.
pub const RUDP_KEEP_ALIVE: Duration = Duration::from_secs(30);
pub const RUDP_INITIAL_RTO: Duration = Duration::from_millis(500);
pub const RUDP_MIN_RTO: Duration = Duration::from_millis(100);
pub const RUDP_MAX_RTO: Duration = Duration::from_secs(5);
pub const RUDP_DELAYED_ACK: Duration = Duration::from_millis(200);
pub const RUDP_CWND_INITIAL: u32 = 4;
pub const RUDP_CWND_MAX: u32 = 256;

/// TURN client section of a configuration document.
#[derive(Deserialize, Debug, Clone)]
pub struct TurnConfig {
    /// allocation lifetime requested from the server, seconds.
    #[serde(default = "TurnConfig::allocation_lifetime")]
    pub allocation_lifetime: u32,

    /// channel binding lifetime, seconds.
    #[serde(default = "TurnConfig::channel_bind_lifetime")]
    pub channel_bind_lifetime: u64,

    /// permission lifetime, seconds.
    #[serde(default = "TurnConfig::permission_lifetime")]
    pub permission_lifetime: u64,

    /// first channel number handed out.
    #[serde(default = "TurnConfig::channel_range_start")]
    pub channel_range_start: u16,

    /// last channel number handed out.
    #[serde(default = "TurnConfig::channel_range_end")]
    pub channel_range_end: u16,
}

impl TurnConfig {
    fn allocation_lifetime() -> u32 {
        DEFAULT_ALLOCATION_LIFETIME
    }

    fn channel_bind_lifetime() -> u64 {
        CHANNEL_BIND_LIFETIME.as_secs()
    }

    fn permission_lifetime() -> u64 {
        PERMISSION_LIFETIME.as_secs()
    }

    fn channel_range_start() -> u16 {
        *DEFAULT_CHANNEL_RANGE.start()
    }

    fn channel_range_end() -> u16 {
        *DEFAULT_CHANNEL_RANGE.end()
    }

    pub fn channel_range(&self) -> RangeInclusive<u16> {
        self.channel_range_start..=self.channel_range_end
    }
}

impl Default for TurnConfig {
    fn default() -> Self {
        Self {
            allocation_lifetime: Self::allocation_lifetime(),
            channel_bind_lifetime: Self::channel_bind_lifetime(),
            permission_lifetime: Self::permission_lifetime(),
            channel_range_start: Self::channel_range_start(),
            channel_range_end: Self::channel_range_end(),
        }
    }
}

/// Reliable channel section of a configuration document.
#[derive(Deserialize, Debug, Clone)]
pub struct RudpConfig {
    /// idle keep-alive period, seconds.
    #[serde(default = "RudpConfig::keep_alive")]
    pub keep_alive: u64,

    /// initial retransmission timeout, milliseconds.
    #[serde(default = "RudpConfig::initial_rto")]
    pub initial_rto: u64,

    /// retransmission timeout clamp, milliseconds.
    #[serde(default = "RudpConfig::min_rto")]
    pub min_rto: u64,

    #[serde(default = "RudpConfig::max_rto")]
    pub max_rto: u64,

    /// standalone acknowledgement delay, milliseconds.
    #[serde(default = "RudpConfig::delayed_ack")]
    pub delayed_ack: u64,

    /// congestion window start and cap, packets.
    #[serde(default = "RudpConfig::cwnd_initial")]
    pub cwnd_initial: u32,

    #[serde(default = "RudpConfig::cwnd_max")]
    pub cwnd_max: u32,
}

impl RudpConfig {
    fn keep_alive() -> u64 {
        RUDP_KEEP_ALIVE.as_secs()
    }

    fn initial_rto() -> u64 {
        RUDP_INITIAL_RTO.as_millis() as u64
    }

    fn min_rto() -> u64 {
        RUDP_MIN_RTO.as_millis() as u64
    }

    fn max_rto() -> u64 {
        RUDP_MAX_RTO.as_millis() as u64
    }

    fn delayed_ack() -> u64 {
        RUDP_DELAYED_ACK.as_millis() as u64
    }

    fn cwnd_initial() -> u32 {
        RUDP_CWND_INITIAL
    }

    fn cwnd_max() -> u32 {
        RUDP_CWND_MAX
    }
}

impl Default for RudpConfig {
    fn default() -> Self {
        Self {
            keep_alive: Self::keep_alive(),
            initial_rto: Self::initial_rto(),
            min_rto: Self::min_rto(),
            max_rto: Self::max_rto(),
            delayed_ack: Self::delayed_ack(),
            cwnd_initial: Self::cwnd_initial(),
            cwnd_max: Self::cwnd_max(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_missing_fields() {
        let turn: TurnConfig = serde_json5::from_str("{}").unwrap();
        assert_eq!(turn.allocation_lifetime, 600);
        assert_eq!(turn.channel_range(), 0x4000..=0x7FFF);

        let rudp: RudpConfig = serde_json5::from_str("{ keep_alive: 10 }").unwrap();
        assert_eq!(rudp.keep_alive, 10);
        assert_eq!(rudp.delayed_ack, 200);
        assert_eq!(rudp.cwnd_initial, 4);
    }
}
