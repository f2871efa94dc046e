//! Channel negotiation: find the channel a peer is listening on.
//!
//! A scan walks channels `1..=max_channel`. On each channel it broadcasts a BOOT beacon
//! and listens for the capability's listen window. The first acceptable frame ends the
//! scan on that channel; a pass without one starts the next pass if the retry policy
//! allows it.

use std::time::{Duration, Instant};

use crate::config::{Capability, RetryPolicy};
use crate::core::Action;
use crate::identity::MacAddr;
use crate::protocol::Opcode;

/// Which responders end a scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanTarget {
    /// Any device that answers.
    Any,
    /// Only this hub; other responders are ignored.
    Hub(MacAddr),
}

impl ScanTarget {
    fn accepts(&self, from: &MacAddr) -> bool {
        match self {
            ScanTarget::Any => true,
            ScanTarget::Hub(hub) => hub == from,
        }
    }
}

/// How a scan ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanOutcome {
    Found { peer: MacAddr, channel: u8, pass: u32 },
    Exhausted { passes: u32 },
}

#[derive(Debug, Clone, Copy)]
enum Phase {
    Listening { deadline: Instant },
    Backoff { until: Instant },
}

/// Result of advancing a scan by the clock.
#[derive(Debug)]
pub(crate) enum ScanStep {
    Idle,
    Actions(Vec<Action>),
    Exhausted { passes: u32 },
}

/// Per-negotiation state; dropped on success or exhaustion.
#[derive(Debug)]
pub(crate) struct ChannelScan {
    policy: RetryPolicy,
    target: ScanTarget,
    max_channel: u8,
    listen_timeout: Duration,
    pass_backoff: Duration,
    /// 1-based pass counter.
    pass: u32,
    channel: u8,
    phase: Phase,
}

impl ChannelScan {
    pub(crate) fn start(
        now: Instant,
        policy: RetryPolicy,
        target: ScanTarget,
        capability: &Capability,
        pass_backoff: Duration,
    ) -> (Self, Vec<Action>) {
        let mut scan = Self {
            policy,
            target,
            max_channel: capability.max_channel.max(1),
            listen_timeout: capability.listen_timeout,
            pass_backoff,
            pass: 1,
            channel: 1,
            phase: Phase::Listening { deadline: now },
        };
        let actions = scan.enter_channel(now, 1);
        (scan, actions)
    }

    pub(crate) fn channel(&self) -> u8 {
        self.channel
    }

    #[cfg(test)]
    fn pass(&self) -> u32 {
        self.pass
    }

    fn enter_channel(&mut self, now: Instant, channel: u8) -> Vec<Action> {
        self.channel = channel;
        self.phase = Phase::Listening {
            deadline: now + self.listen_timeout,
        };
        tracing::debug!(pass = self.pass, channel, "scanning channel");
        vec![
            Action::SetChannel(channel),
            Action::Broadcast(Opcode::Boot.to_be_bytes().to_vec()),
        ]
    }

    /// A frame arrived from `from`. Returns the outcome if it ends the scan.
    pub(crate) fn observe(&self, from: &MacAddr) -> Option<ScanOutcome> {
        if !matches!(self.phase, Phase::Listening { .. }) || !self.target.accepts(from) {
            return None;
        }
        Some(ScanOutcome::Found {
            peer: *from,
            channel: self.channel,
            pass: self.pass,
        })
    }

    pub(crate) fn poll(&mut self, now: Instant) -> ScanStep {
        match self.phase {
            Phase::Listening { deadline } if now >= deadline => {
                if self.channel < self.max_channel {
                    return ScanStep::Actions(self.enter_channel(now, self.channel + 1));
                }
                if !self.policy.allows_pass(self.pass) {
                    return ScanStep::Exhausted { passes: self.pass };
                }
                tracing::debug!(pass = self.pass, "scan pass found no peer");
                if self.pass_backoff.is_zero() {
                    self.pass = self.pass.saturating_add(1);
                    return ScanStep::Actions(self.enter_channel(now, 1));
                }
                self.phase = Phase::Backoff {
                    until: now + self.pass_backoff,
                };
                ScanStep::Idle
            }
            Phase::Backoff { until } if now >= until => {
                self.pass = self.pass.saturating_add(1);
                ScanStep::Actions(self.enter_channel(now, 1))
            }
            _ => ScanStep::Idle,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cap(max_channel: u8) -> Capability {
        Capability::esp32()
            .with_max_channel(max_channel)
            .with_listen_timeout(Duration::from_millis(100))
    }

    fn hub() -> MacAddr {
        MacAddr::new([0x24, 0x6f, 0x28, 0xaa, 0xbb, 0xcc])
    }

    /// Advance past each listen window until the scan exhausts; returns the channels visited.
    fn run_to_exhaustion(scan: &mut ChannelScan, mut now: Instant) -> (Vec<u8>, u32) {
        let mut visited = vec![scan.channel()];
        for _ in 0..10_000 {
            now += Duration::from_millis(100);
            match scan.poll(now) {
                ScanStep::Actions(actions) => {
                    for a in actions {
                        if let Action::SetChannel(c) = a {
                            visited.push(c);
                        }
                    }
                }
                ScanStep::Exhausted { passes } => return (visited, passes),
                ScanStep::Idle => {}
            }
        }
        panic!("scan did not terminate");
    }

    #[test]
    fn start_sets_channel_one_and_beacons() {
        let now = Instant::now();
        let (scan, actions) =
            ChannelScan::start(now, RetryPolicy::Once, ScanTarget::Any, &cap(3), Duration::ZERO);
        assert_eq!(scan.channel(), 1);
        assert!(matches!(actions[0], Action::SetChannel(1)));
        assert!(matches!(&actions[1], Action::Broadcast(b) if b == &[0xff, 0x00]));
    }

    #[test]
    fn single_pass_visits_every_channel_once() {
        let now = Instant::now();
        let (mut scan, _) =
            ChannelScan::start(now, RetryPolicy::Once, ScanTarget::Any, &cap(4), Duration::ZERO);
        let (visited, passes) = run_to_exhaustion(&mut scan, now);
        assert_eq!(visited, vec![1, 2, 3, 4]);
        assert_eq!(passes, 1);
    }

    #[test]
    fn finite_retry_stops_after_n_passes() {
        let now = Instant::now();
        let (mut scan, _) = ChannelScan::start(
            now,
            RetryPolicy::Passes(3),
            ScanTarget::Any,
            &cap(2),
            Duration::from_millis(250),
        );
        let (visited, passes) = run_to_exhaustion(&mut scan, now);
        assert_eq!(passes, 3);
        assert_eq!(visited, vec![1, 2, 1, 2, 1, 2]);
    }

    #[test]
    fn nothing_happens_before_the_listen_window_ends() {
        let now = Instant::now();
        let (mut scan, _) =
            ChannelScan::start(now, RetryPolicy::Once, ScanTarget::Any, &cap(3), Duration::ZERO);
        assert!(matches!(
            scan.poll(now + Duration::from_millis(99)),
            ScanStep::Idle
        ));
        assert_eq!(scan.channel(), 1);
    }

    #[test]
    fn any_responder_ends_the_scan_on_the_current_channel() {
        let now = Instant::now();
        let (mut scan, _) =
            ChannelScan::start(now, RetryPolicy::Once, ScanTarget::Any, &cap(5), Duration::ZERO);
        scan.poll(now + Duration::from_millis(100));
        scan.poll(now + Duration::from_millis(200));
        assert_eq!(
            scan.observe(&hub()),
            Some(ScanOutcome::Found {
                peer: hub(),
                channel: 3,
                pass: 1
            })
        );
    }

    #[test]
    fn hub_scan_ignores_other_responders() {
        let now = Instant::now();
        let (scan, _) = ChannelScan::start(
            now,
            RetryPolicy::Forever,
            ScanTarget::Hub(hub()),
            &cap(5),
            Duration::ZERO,
        );
        let stranger = MacAddr::new([1, 2, 3, 4, 5, 6]);
        assert_eq!(scan.observe(&stranger), None);
        assert!(scan.observe(&hub()).is_some());
    }

    #[test]
    fn frames_during_backoff_do_not_count() {
        let now = Instant::now();
        let (mut scan, _) = ChannelScan::start(
            now,
            RetryPolicy::Forever,
            ScanTarget::Any,
            &cap(1),
            Duration::from_secs(1),
        );
        assert!(matches!(
            scan.poll(now + Duration::from_millis(100)),
            ScanStep::Idle
        ));
        assert_eq!(scan.observe(&hub()), None);
        assert!(matches!(
            scan.poll(now + Duration::from_millis(1100)),
            ScanStep::Actions(_)
        ));
        assert_eq!(scan.pass(), 2);
    }
}
