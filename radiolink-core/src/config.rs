//! Link configuration: hardware capability descriptor, retry policy, timeouts.
//!
//! Channel range and timeouts differ between radio modules and regions; they are
//! configuration here, never constants in the protocol logic.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default time to wait for a reply before retransmitting.
pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_millis(1000);

/// Default transmissions per command, including the first.
pub const DEFAULT_MAX_ATTEMPTS: u8 = 3;

/// Default cooperative sleep between inbox polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Default inbox depth, like a radio receive ring.
pub const DEFAULT_INBOX_CAPACITY: usize = 32;

/// Default number of files that may be half-received at once.
pub const DEFAULT_MAX_RECEIVE_SESSIONS: usize = 2;

/// Default time a half-received file survives without a new chunk.
pub const DEFAULT_RECEIVE_IDLE_TIMEOUT: Duration = Duration::from_secs(10);

/// What the radio hardware can do and which quirks it has.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Capability {
    /// Highest channel to scan; scanning covers `1..=max_channel`.
    pub max_channel: u8,
    /// How long to listen on each channel after the discovery beacon.
    #[serde(with = "millis")]
    pub listen_timeout: Duration,
    /// Clear the locally-administered address bit on received source addresses.
    pub mask_local_admin_bit: bool,
    /// STOP puts the device in command mode (only radio traffic is serviced).
    pub stop_enters_command_mode: bool,
}

impl Capability {
    /// ESP32-class module: channels 1..=11, 500 ms listen window.
    pub fn esp32() -> Self {
        Self {
            max_channel: 11,
            listen_timeout: Duration::from_millis(500),
            mask_local_admin_bit: false,
            stop_enters_command_mode: true,
        }
    }

    /// ESP8266-class module: channels 1..=11, 250 ms listen window, and broadcast
    /// reception flips the locally-administered bit of the source address.
    pub fn esp8266() -> Self {
        Self {
            max_channel: 11,
            listen_timeout: Duration::from_millis(250),
            mask_local_admin_bit: true,
            stop_enters_command_mode: false,
        }
    }

    pub fn with_max_channel(mut self, max_channel: u8) -> Self {
        self.max_channel = max_channel;
        self
    }

    pub fn with_listen_timeout(mut self, listen_timeout: Duration) -> Self {
        self.listen_timeout = listen_timeout;
        self
    }

    pub fn is_valid_channel(&self, channel: u8) -> bool {
        (1..=self.max_channel).contains(&channel)
    }
}

impl Default for Capability {
    fn default() -> Self {
        Self::esp32()
    }
}

/// How many full passes over the channel space a scanning join may make.
///
/// Integer form: `0` = one pass, `-1` = retry forever, `n > 0` = up to `n` passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "i32", into = "i32")]
pub enum RetryPolicy {
    Once,
    Forever,
    Passes(u32),
}

impl RetryPolicy {
    /// Whether another pass may start after `completed` passes.
    pub fn allows_pass(&self, completed: u32) -> bool {
        match self {
            RetryPolicy::Once => completed == 0,
            RetryPolicy::Forever => true,
            RetryPolicy::Passes(n) => completed < (*n).max(1),
        }
    }
}

impl TryFrom<i32> for RetryPolicy {
    type Error = InvalidRetry;

    fn try_from(retry: i32) -> Result<Self, Self::Error> {
        match retry {
            0 => Ok(RetryPolicy::Once),
            -1 => Ok(RetryPolicy::Forever),
            n if n > 0 => Ok(RetryPolicy::Passes(n as u32)),
            n => Err(InvalidRetry(n)),
        }
    }
}

impl From<RetryPolicy> for i32 {
    fn from(policy: RetryPolicy) -> i32 {
        match policy {
            RetryPolicy::Once => 0,
            RetryPolicy::Forever => -1,
            RetryPolicy::Passes(n) => i32::try_from(n).unwrap_or(i32::MAX),
        }
    }
}

/// Retry value outside `-1`, `0`, `1..`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("invalid retry value {0}: use -1 (forever), 0 (one pass) or a positive pass count")]
pub struct InvalidRetry(pub i32);

/// Everything the protocol core needs to know about timing and hardware.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkConfig {
    pub capability: Capability,
    /// Wait per transmission for the expected reply.
    pub ack_timeout: Duration,
    /// Transmissions per command including the first; at least 1.
    pub max_attempts: u8,
    /// Cooperative sleep between polls in blocking operations.
    pub poll_interval: Duration,
    /// Pause between two full scan passes.
    pub pass_backoff: Duration,
    pub inbox_capacity: usize,
    /// Receive buffers held at once; the least recently active is evicted.
    pub max_receive_sessions: usize,
    /// A receive buffer with no chunk for this long is released.
    pub receive_idle_timeout: Duration,
}

impl LinkConfig {
    pub fn new(capability: Capability) -> Self {
        Self {
            capability,
            ack_timeout: DEFAULT_ACK_TIMEOUT,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            poll_interval: DEFAULT_POLL_INTERVAL,
            pass_backoff: Duration::ZERO,
            inbox_capacity: DEFAULT_INBOX_CAPACITY,
            max_receive_sessions: DEFAULT_MAX_RECEIVE_SESSIONS,
            receive_idle_timeout: DEFAULT_RECEIVE_IDLE_TIMEOUT,
        }
    }

    /// Longest a sender keeps retransmitting one frame.
    pub fn retry_window(&self) -> Duration {
        self.ack_timeout * u32::from(self.max_attempts.max(1))
    }
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self::new(Capability::default())
    }
}

/// `Duration` as integer milliseconds, for human-edited config files.
mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(v: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        u64::try_from(v.as_millis())
            .unwrap_or(u64::MAX)
            .serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let ms = u64::deserialize(d)?;
        Ok(Duration::from_millis(ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_integer_encoding() {
        assert_eq!(RetryPolicy::try_from(0), Ok(RetryPolicy::Once));
        assert_eq!(RetryPolicy::try_from(-1), Ok(RetryPolicy::Forever));
        assert_eq!(RetryPolicy::try_from(3), Ok(RetryPolicy::Passes(3)));
        assert_eq!(RetryPolicy::try_from(-2), Err(InvalidRetry(-2)));
        assert_eq!(i32::from(RetryPolicy::Passes(3)), 3);
        assert_eq!(i32::from(RetryPolicy::Forever), -1);
    }

    #[test]
    fn retry_window_covers_every_attempt() {
        let mut config = LinkConfig::default();
        config.ack_timeout = Duration::from_millis(250);
        config.max_attempts = 4;
        assert_eq!(config.retry_window(), Duration::from_secs(1));
        config.max_attempts = 0;
        assert_eq!(config.retry_window(), Duration::from_millis(250));
    }

    #[test]
    fn pass_limits() {
        assert!(RetryPolicy::Once.allows_pass(0));
        assert!(!RetryPolicy::Once.allows_pass(1));
        assert!(RetryPolicy::Passes(2).allows_pass(1));
        assert!(!RetryPolicy::Passes(2).allows_pass(2));
        assert!(RetryPolicy::Forever.allows_pass(u32::MAX));
    }

    #[test]
    fn presets_differ_only_in_hardware_details() {
        let esp32 = Capability::esp32();
        let esp8266 = Capability::esp8266();
        assert_eq!(esp32.max_channel, 11);
        assert_eq!(esp8266.max_channel, 11);
        assert_ne!(esp32.listen_timeout, esp8266.listen_timeout);
        assert!(esp8266.mask_local_admin_bit);
        assert!(!esp32.mask_local_admin_bit);
    }

    #[test]
    fn region_override_widens_channels() {
        let cap = Capability::esp32().with_max_channel(14);
        assert!(cap.is_valid_channel(14));
        assert!(!cap.is_valid_channel(0));
        assert!(!cap.is_valid_channel(15));
    }
}
