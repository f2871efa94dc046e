//! Reliable command channel: at most one outstanding reply per peer, bounded retransmission.
//!
//! A command moves a peer from `Idle` to `AwaitingAck`. Only a frame carrying the
//! expected reply opcode from that same peer resolves it; anything else leaves it
//! pending. When the deadline passes, the frame is retransmitted while attempts remain,
//! after which the command times out.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use crate::core::LinkError;
use crate::identity::MacAddr;
use crate::protocol::Opcode;

/// Per-peer view of the command channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckState {
    Idle,
    /// `attempt` is 1-based: the number of transmissions so far.
    AwaitingAck { expected: Opcode, attempt: u8 },
    Resolved(Opcode),
    TimedOut(Opcode),
}

/// Terminal result of a command, kept until the caller takes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    Resolved(Opcode),
    TimedOut(Opcode),
}

#[derive(Debug)]
struct PendingAck {
    expected: Opcode,
    deadline: Instant,
    timeout: Duration,
    attempt: u8,
    max_attempts: u8,
    /// Encoded frame for retransmission.
    frame: Vec<u8>,
}

/// Deadline work produced by [`CommandChannel::poll`].
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum AckTimer {
    Retransmit {
        peer: MacAddr,
        frame: Vec<u8>,
        attempt: u8,
    },
    Expired {
        peer: MacAddr,
        expected: Opcode,
    },
}

#[derive(Debug, Default)]
pub struct CommandChannel {
    pending: BTreeMap<MacAddr, PendingAck>,
    outcomes: BTreeMap<MacAddr, AckOutcome>,
}

impl CommandChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start waiting for `expected` from `peer`. The caller has already queued the first
    /// transmission of `frame`. `max_attempts` counts that transmission.
    pub fn begin(
        &mut self,
        now: Instant,
        peer: MacAddr,
        frame: Vec<u8>,
        expected: Opcode,
        timeout: Duration,
        max_attempts: u8,
    ) -> Result<(), LinkError> {
        if self.pending.contains_key(&peer) {
            return Err(LinkError::CommandPending(peer));
        }
        self.outcomes.remove(&peer);
        self.pending.insert(
            peer,
            PendingAck {
                expected,
                deadline: now + timeout,
                timeout,
                attempt: 1,
                max_attempts: max_attempts.max(1),
                frame,
            },
        );
        Ok(())
    }

    /// A control frame `opcode` arrived from `peer`. Returns true if it resolved a
    /// pending command.
    pub fn resolve(&mut self, peer: &MacAddr, opcode: Opcode) -> bool {
        match self.pending.get(peer) {
            Some(p) if p.expected == opcode => {
                self.pending.remove(peer);
                self.outcomes.insert(*peer, AckOutcome::Resolved(opcode));
                true
            }
            _ => false,
        }
    }

    /// Process every deadline that has passed at `now`.
    pub(crate) fn poll(&mut self, now: Instant) -> Vec<AckTimer> {
        let mut timers = Vec::new();
        let mut expired = Vec::new();
        for (peer, p) in self.pending.iter_mut() {
            if now < p.deadline {
                continue;
            }
            if p.attempt < p.max_attempts {
                p.attempt += 1;
                p.deadline = now + p.timeout;
                timers.push(AckTimer::Retransmit {
                    peer: *peer,
                    frame: p.frame.clone(),
                    attempt: p.attempt,
                });
            } else {
                expired.push((*peer, p.expected));
            }
        }
        for (peer, expected) in expired {
            self.pending.remove(&peer);
            self.outcomes.insert(peer, AckOutcome::TimedOut(expected));
            timers.push(AckTimer::Expired { peer, expected });
        }
        timers
    }

    pub fn state(&self, peer: &MacAddr) -> AckState {
        if let Some(p) = self.pending.get(peer) {
            return AckState::AwaitingAck {
                expected: p.expected,
                attempt: p.attempt,
            };
        }
        match self.outcomes.get(peer) {
            Some(AckOutcome::Resolved(op)) => AckState::Resolved(*op),
            Some(AckOutcome::TimedOut(op)) => AckState::TimedOut(*op),
            None => AckState::Idle,
        }
    }

    pub fn is_pending(&self, peer: &MacAddr) -> bool {
        self.pending.contains_key(peer)
    }

    /// Remove and return the terminal outcome for `peer`.
    pub fn take_outcome(&mut self, peer: &MacAddr) -> Option<AckOutcome> {
        self.outcomes.remove(peer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIMEOUT: Duration = Duration::from_millis(100);

    fn peer(last: u8) -> MacAddr {
        MacAddr::new([0x24, 0x6f, 0x28, 0, 0, last])
    }

    fn stop_frame() -> Vec<u8> {
        Opcode::Stop.to_be_bytes().to_vec()
    }

    #[test]
    fn only_expected_opcode_from_same_peer_resolves() {
        let now = Instant::now();
        let mut ch = CommandChannel::new();
        ch.begin(now, peer(1), stop_frame(), Opcode::Ack, TIMEOUT, 3)
            .unwrap();

        assert!(!ch.resolve(&peer(2), Opcode::Ack));
        assert!(!ch.resolve(&peer(1), Opcode::Done));
        assert!(matches!(
            ch.state(&peer(1)),
            AckState::AwaitingAck {
                expected: Opcode::Ack,
                attempt: 1
            }
        ));

        assert!(ch.resolve(&peer(1), Opcode::Ack));
        assert_eq!(ch.state(&peer(1)), AckState::Resolved(Opcode::Ack));
        assert_eq!(ch.take_outcome(&peer(1)), Some(AckOutcome::Resolved(Opcode::Ack)));
        assert_eq!(ch.state(&peer(1)), AckState::Idle);
    }

    #[test]
    fn second_command_to_same_peer_is_refused() {
        let now = Instant::now();
        let mut ch = CommandChannel::new();
        ch.begin(now, peer(1), stop_frame(), Opcode::Ack, TIMEOUT, 1)
            .unwrap();
        let err = ch
            .begin(now, peer(1), stop_frame(), Opcode::Ack, TIMEOUT, 1)
            .unwrap_err();
        assert!(matches!(err, LinkError::CommandPending(p) if p == peer(1)));
        ch.begin(now, peer(2), stop_frame(), Opcode::Ack, TIMEOUT, 1)
            .unwrap();
    }

    #[test]
    fn retransmits_then_times_out() {
        let start = Instant::now();
        let mut ch = CommandChannel::new();
        ch.begin(start, peer(1), stop_frame(), Opcode::Ack, TIMEOUT, 3)
            .unwrap();

        assert!(ch.poll(start + Duration::from_millis(50)).is_empty());

        let t1 = ch.poll(start + TIMEOUT);
        assert_eq!(
            t1,
            vec![AckTimer::Retransmit {
                peer: peer(1),
                frame: stop_frame(),
                attempt: 2
            }]
        );
        let t2 = ch.poll(start + TIMEOUT * 2);
        assert!(matches!(t2[0], AckTimer::Retransmit { attempt: 3, .. }));

        let t3 = ch.poll(start + TIMEOUT * 3);
        assert_eq!(
            t3,
            vec![AckTimer::Expired {
                peer: peer(1),
                expected: Opcode::Ack
            }]
        );
        assert_eq!(ch.state(&peer(1)), AckState::TimedOut(Opcode::Ack));
        assert!(!ch.is_pending(&peer(1)));
        assert!(ch.poll(start + TIMEOUT * 10).is_empty());
    }

    #[test]
    fn single_attempt_never_retransmits() {
        let start = Instant::now();
        let mut ch = CommandChannel::new();
        ch.begin(
            start,
            peer(1),
            Opcode::Reset.to_be_bytes().to_vec(),
            Opcode::Boot,
            TIMEOUT,
            1,
        )
        .unwrap();
        let timers = ch.poll(start + TIMEOUT);
        assert_eq!(timers.len(), 1);
        assert!(matches!(timers[0], AckTimer::Expired { .. }));
    }

    #[test]
    fn late_reply_after_timeout_is_ignored() {
        let start = Instant::now();
        let mut ch = CommandChannel::new();
        ch.begin(start, peer(1), stop_frame(), Opcode::Ack, TIMEOUT, 1)
            .unwrap();
        ch.poll(start + TIMEOUT);
        assert!(!ch.resolve(&peer(1), Opcode::Ack));
        assert_eq!(ch.take_outcome(&peer(1)), Some(AckOutcome::TimedOut(Opcode::Ack)));
    }
}
