//! Host-driven API: LinkCore receives frames and calls from the host, returns actions.
//!
//! The core performs no I/O. Entry points take the current time where deadlines matter
//! and return the side effects for the host to carry out, in order.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tracing::{debug, info, trace, warn};

use crate::chunk::{ChunkError, ChunkReceiveResult, Reassembler, ReassemblyLimits};
use crate::command::{AckOutcome, AckState, AckTimer, CommandChannel};
use crate::config::{LinkConfig, RetryPolicy};
use crate::identity::MacAddr;
use crate::integrity;
use crate::node::TransportError;
use crate::protocol::{FileChunk, Frame, Opcode, MAX_FRAME_LEN};
use crate::registry::{PeerAdded, PeerRegistry};
use crate::scan::{ChannelScan, ScanOutcome, ScanStep, ScanTarget};
use crate::transfer::{OutgoingTransfer, Progress, TransferOutcome, TransferReport};
use crate::wire::{self, FrameDecodeError, FrameEncodeError};

/// Side effect for the host to perform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Retune the radio.
    SetChannel(u8),
    /// Make `MacAddr` addressable by directed sends.
    RegisterPeer(MacAddr),
    Send(MacAddr, Vec<u8>),
    Broadcast(Vec<u8>),
    WriteFile { path: String, bytes: Vec<u8> },
    /// Restart the device. No further actions follow.
    Reboot,
    /// Application payload; not a protocol frame.
    Deliver { from: MacAddr, payload: Vec<u8> },
    Notify(Event),
}

/// Observable protocol events, surfaced to the host for logging or UI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    PeerJoined { peer: MacAddr, channel: u8 },
    ScanSucceeded { peer: MacAddr, channel: u8, pass: u32 },
    ScanExhausted { passes: u32 },
    AckReceived { peer: MacAddr, opcode: Opcode },
    AckTimedOut { peer: MacAddr, expected: Opcode },
    ChunkAcked { peer: MacAddr, progress: Progress },
    TransferComplete(TransferReport),
    TransferFailed {
        peer: MacAddr,
        filename: String,
        acked: usize,
        total: usize,
    },
    FileReceived {
        peer: MacAddr,
        filename: String,
        len: usize,
        digest: [u8; 32],
    },
    ChunkRejected { peer: MacAddr, error: ChunkError },
    /// The peer reported DONE for a file we sent.
    RemoteWriteComplete { peer: MacAddr },
    CommandMode { peer: MacAddr },
}

/// Main coordinator. Host passes frames and API calls; core returns actions.
pub struct LinkCore {
    local: MacAddr,
    config: LinkConfig,
    channel: u8,
    registry: PeerRegistry,
    commands: CommandChannel,
    outgoing: HashMap<MacAddr, OutgoingTransfer>,
    transfer_outcomes: HashMap<MacAddr, TransferOutcome>,
    reassembler: Reassembler,
    scan: Option<ChannelScan>,
    scan_outcome: Option<ScanOutcome>,
    command_mode: bool,
    halted: bool,
}

impl LinkCore {
    pub fn new(local: MacAddr, config: LinkConfig) -> Self {
        let limits = ReassemblyLimits {
            max_sessions: config.max_receive_sessions,
            idle_timeout: config.receive_idle_timeout,
            duplicate_window: config.retry_window(),
        };
        Self {
            local,
            config,
            channel: 1,
            registry: PeerRegistry::new(),
            commands: CommandChannel::new(),
            outgoing: HashMap::new(),
            transfer_outcomes: HashMap::new(),
            reassembler: Reassembler::with_limits(limits),
            scan: None,
            scan_outcome: None,
            command_mode: false,
            halted: false,
        }
    }

    pub fn local_address(&self) -> MacAddr {
        self.local
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    /// Channel the radio was last told to use.
    pub fn channel(&self) -> u8 {
        self.channel
    }

    pub fn registry(&self) -> &PeerRegistry {
        &self.registry
    }

    pub fn reassembler(&self) -> &Reassembler {
        &self.reassembler
    }

    pub fn is_command_mode(&self) -> bool {
        self.command_mode
    }

    pub fn exit_command_mode(&mut self) {
        self.command_mode = false;
    }

    /// A RESET was received; the core ignores everything until it is rebuilt.
    pub fn is_halted(&self) -> bool {
        self.halted
    }

    // --- channel negotiation ---

    /// Directed join: tune to `channel` and register `peer`.
    pub fn join(&mut self, peer: MacAddr, channel: u8) -> Result<Vec<Action>, LinkError> {
        self.ensure_running()?;
        if !self.config.capability.is_valid_channel(channel) {
            return Err(LinkError::InvalidChannel(channel));
        }
        if peer.is_broadcast() {
            return Err(LinkError::BroadcastPeer);
        }
        self.channel = channel;
        let mut actions = vec![Action::SetChannel(channel)];
        self.register(peer, &mut actions);
        info!(peer = %peer, channel, "joined peer");
        Ok(actions)
    }

    /// Register `peer` on the current channel.
    pub fn add_peer(&mut self, peer: MacAddr) -> Result<Vec<Action>, LinkError> {
        self.ensure_running()?;
        if peer.is_broadcast() {
            return Err(LinkError::BroadcastPeer);
        }
        let mut actions = Vec::new();
        self.register(peer, &mut actions);
        Ok(actions)
    }

    /// Scanning join. Replaces a scan already running.
    pub fn start_scan(
        &mut self,
        now: Instant,
        policy: RetryPolicy,
        target: ScanTarget,
    ) -> Result<Vec<Action>, LinkError> {
        self.ensure_running()?;
        let (scan, actions) = ChannelScan::start(
            now,
            policy,
            target,
            &self.config.capability,
            self.config.pass_backoff,
        );
        info!(?policy, ?target, "starting channel scan");
        self.channel = scan.channel();
        self.scan = Some(scan);
        self.scan_outcome = None;
        Ok(actions)
    }

    pub fn is_scanning(&self) -> bool {
        self.scan.is_some()
    }

    pub fn take_scan_outcome(&mut self) -> Option<ScanOutcome> {
        self.scan_outcome.take()
    }

    fn finish_scan(&mut self, outcome: ScanOutcome, actions: &mut Vec<Action>) {
        self.scan = None;
        match outcome {
            ScanOutcome::Found {
                peer,
                channel,
                pass,
            } => {
                info!(peer = %peer, channel, pass, "scan found peer");
                self.channel = channel;
                self.register(peer, actions);
                actions.push(Action::Notify(Event::ScanSucceeded {
                    peer,
                    channel,
                    pass,
                }));
            }
            ScanOutcome::Exhausted { passes } => {
                warn!(passes, "channel scan exhausted without a reply");
                actions.push(Action::Notify(Event::ScanExhausted { passes }));
            }
        }
        self.scan_outcome = Some(outcome);
    }

    // --- commands ---

    /// Send a control frame and wait for its reply with the configured timeout.
    pub fn send_command(
        &mut self,
        now: Instant,
        peer: MacAddr,
        opcode: Opcode,
    ) -> Result<Vec<Action>, LinkError> {
        let timeout = self.config.ack_timeout;
        self.send_command_with_timeout(now, peer, opcode, timeout)
    }

    pub fn send_command_with_timeout(
        &mut self,
        now: Instant,
        peer: MacAddr,
        opcode: Opcode,
        timeout: Duration,
    ) -> Result<Vec<Action>, LinkError> {
        self.ensure_running()?;
        let frame = Frame::control(opcode).ok_or(LinkError::NotACommand(opcode))?;
        let attempts = if opcode.is_retransmittable() {
            self.config.max_attempts
        } else {
            1
        };
        self.send_expecting(now, peer, &frame, opcode.expected_reply(), timeout, attempts)
    }

    fn send_expecting(
        &mut self,
        now: Instant,
        peer: MacAddr,
        frame: &Frame,
        expected: Opcode,
        timeout: Duration,
        attempts: u8,
    ) -> Result<Vec<Action>, LinkError> {
        self.ensure_sendable(&peer)?;
        let bytes = wire::encode_frame(frame)?;
        self.commands
            .begin(now, peer, bytes.clone(), expected, timeout, attempts)?;
        debug!(peer = %peer, opcode = %frame.opcode(), %expected, "awaiting reply");
        Ok(vec![Action::Send(peer, bytes)])
    }

    pub fn ack_state(&self, peer: &MacAddr) -> AckState {
        self.commands.state(peer)
    }

    pub fn take_ack_outcome(&mut self, peer: &MacAddr) -> Option<AckOutcome> {
        self.commands.take_outcome(peer)
    }

    /// Fire-and-forget protocol frame to one known peer.
    pub fn send_unacked(&mut self, peer: MacAddr, frame: &Frame) -> Result<Vec<Action>, LinkError> {
        self.ensure_running()?;
        self.ensure_sendable(&peer)?;
        let bytes = wire::encode_frame(frame)?;
        Ok(vec![Action::Send(peer, bytes)])
    }

    /// Fire-and-forget protocol frame to every known peer.
    pub fn send_all(&mut self, frame: &Frame) -> Result<Vec<Action>, LinkError> {
        self.ensure_running()?;
        let bytes = wire::encode_frame(frame)?;
        Ok(self
            .registry
            .addresses()
            .into_iter()
            .map(|peer| Action::Send(peer, bytes.clone()))
            .collect())
    }

    pub fn broadcast(&mut self, frame: &Frame) -> Result<Vec<Action>, LinkError> {
        self.ensure_running()?;
        let bytes = wire::encode_frame(frame)?;
        Ok(vec![Action::Broadcast(bytes)])
    }

    /// Introduce `advertised` to `to`.
    pub fn send_join(&mut self, to: MacAddr, advertised: MacAddr) -> Result<Vec<Action>, LinkError> {
        self.send_unacked(to, &Frame::Join { peer: advertised })
    }

    /// Tell `to` to move to `channel`.
    pub fn send_channel(&mut self, to: MacAddr, channel: u8) -> Result<Vec<Action>, LinkError> {
        if !self.config.capability.is_valid_channel(channel) {
            return Err(LinkError::InvalidChannel(channel));
        }
        self.send_unacked(to, &Frame::Channel { channel })
    }

    /// Application payload to one known peer.
    pub fn send_payload(&mut self, peer: MacAddr, payload: &[u8]) -> Result<Vec<Action>, LinkError> {
        self.ensure_running()?;
        self.ensure_sendable(&peer)?;
        check_payload_len(payload)?;
        Ok(vec![Action::Send(peer, payload.to_vec())])
    }

    pub fn broadcast_payload(&mut self, payload: &[u8]) -> Result<Vec<Action>, LinkError> {
        self.ensure_running()?;
        check_payload_len(payload)?;
        Ok(vec![Action::Broadcast(payload.to_vec())])
    }

    // --- file transfer ---

    /// Start sending `data` as `filename`. Each chunk waits for FILE_WRITE_ACK.
    pub fn send_file(
        &mut self,
        now: Instant,
        peer: MacAddr,
        filename: &str,
        data: Vec<u8>,
        chunk_size: u8,
    ) -> Result<Vec<Action>, LinkError> {
        self.ensure_running()?;
        if self.outgoing.contains_key(&peer) {
            return Err(LinkError::TransferPending(peer));
        }
        self.ensure_sendable(&peer)?;
        if self.commands.is_pending(&peer) {
            return Err(LinkError::CommandPending(peer));
        }
        let transfer = OutgoingTransfer::new(peer, filename, data, chunk_size)?;
        let Some(first) = transfer.current_frame() else {
            return Err(LinkError::Transfer(ChunkError::InvalidChunkSize));
        };
        let (timeout, attempts) = (self.config.ack_timeout, self.config.max_attempts);
        let actions =
            self.send_expecting(now, peer, &first, Opcode::FileWriteAck, timeout, attempts)?;
        info!(
            peer = %peer,
            filename,
            bytes = transfer.total_len(),
            chunks = transfer.chunk_count(),
            "sending file"
        );
        self.transfer_outcomes.remove(&peer);
        self.outgoing.insert(peer, transfer);
        Ok(actions)
    }

    pub fn transfer_progress(&self, peer: &MacAddr) -> Option<Progress> {
        self.outgoing.get(peer).map(OutgoingTransfer::progress)
    }

    pub fn take_transfer_outcome(&mut self, peer: &MacAddr) -> Option<TransferOutcome> {
        self.transfer_outcomes.remove(peer)
    }

    fn advance_transfer(&mut self, now: Instant, peer: MacAddr, actions: &mut Vec<Action>) {
        let Some(transfer) = self.outgoing.get_mut(&peer) else {
            return;
        };
        transfer.on_chunk_acked();
        let progress = transfer.progress();
        let next = transfer.current_frame();
        trace!(peer = %peer, acked = progress.acked, total = progress.total, "chunk acknowledged");
        actions.push(Action::Notify(Event::ChunkAcked { peer, progress }));

        let Some(frame) = next else {
            self.complete_transfer(peer, actions);
            return;
        };
        let (timeout, attempts) = (self.config.ack_timeout, self.config.max_attempts);
        match self.send_expecting(now, peer, &frame, Opcode::FileWriteAck, timeout, attempts) {
            Ok(sent) => actions.extend(sent),
            Err(error) => {
                warn!(peer = %peer, %error, "cannot send next chunk");
                self.fail_transfer(peer, actions);
            }
        }
    }

    fn complete_transfer(&mut self, peer: MacAddr, actions: &mut Vec<Action>) {
        let Some(transfer) = self.outgoing.remove(&peer) else {
            return;
        };
        let report = transfer.report();
        info!(
            peer = %peer,
            filename = %report.filename,
            bytes = report.total_length,
            digest = %integrity::digest_hex(&report.digest),
            "file transfer complete"
        );
        self.transfer_outcomes
            .insert(peer, TransferOutcome::Complete(report.clone()));
        actions.push(Action::Notify(Event::TransferComplete(report)));
    }

    fn fail_transfer(&mut self, peer: MacAddr, actions: &mut Vec<Action>) {
        let Some(transfer) = self.outgoing.remove(&peer) else {
            return;
        };
        let progress = transfer.progress();
        let filename = transfer.filename().to_string();
        warn!(
            peer = %peer,
            filename = %filename,
            acked = progress.acked,
            total = progress.total,
            "file transfer failed"
        );
        self.transfer_outcomes.insert(
            peer,
            TransferOutcome::Failed {
                filename: filename.clone(),
                acked: progress.acked,
                total: progress.total,
            },
        );
        actions.push(Action::Notify(Event::TransferFailed {
            peer,
            filename,
            acked: progress.acked,
            total: progress.total,
        }));
    }

    // --- receive dispatcher ---

    /// Process one frame received from the radio.
    pub fn on_frame(&mut self, now: Instant, from: MacAddr, bytes: &[u8]) -> Vec<Action> {
        let mut actions = Vec::new();
        if self.halted {
            return actions;
        }
        let from = if self.config.capability.mask_local_admin_bit {
            from.without_local_admin_bit()
        } else {
            from
        };
        if from == self.local || from.is_broadcast() {
            trace!(from = %from, "ignoring frame from own or broadcast address");
            return actions;
        }

        let decoded = wire::decode_frame(bytes);
        if let Ok(Frame::Reset) = decoded {
            warn!(peer = %from, "RESET received, rebooting");
            self.halted = true;
            actions.push(Action::Reboot);
            return actions;
        }

        if let Some(outcome) = self.scan.as_ref().and_then(|scan| scan.observe(&from)) {
            self.finish_scan(outcome, &mut actions);
        }

        match decoded {
            Ok(frame) => self.dispatch(now, from, frame, &mut actions),
            Err(FrameDecodeError::NotProtocol) => {
                trace!(peer = %from, len = bytes.len(), "application frame");
                actions.push(Action::Deliver {
                    from,
                    payload: bytes.to_vec(),
                });
            }
            Err(error) => warn!(peer = %from, %error, "dropping frame"),
        }
        actions
    }

    fn dispatch(&mut self, now: Instant, from: MacAddr, frame: Frame, actions: &mut Vec<Action>) {
        let opcode = frame.opcode();
        if frame.is_control() && self.commands.resolve(&from, opcode) {
            debug!(peer = %from, %opcode, "reply received");
            if opcode == Opcode::FileWriteAck && self.outgoing.contains_key(&from) {
                self.commands.take_outcome(&from);
                self.advance_transfer(now, from, actions);
            } else {
                actions.push(Action::Notify(Event::AckReceived { peer: from, opcode }));
            }
            return;
        }

        match frame {
            Frame::Boot => {
                info!(peer = %from, "BOOT received, answering with JOIN");
                let join = Frame::Join { peer: self.local };
                self.reply(from, &join, actions);
            }
            Frame::Join { peer } => {
                if peer != self.local {
                    debug!(introducer = %from, peer = %peer, "JOIN received");
                    self.register(peer, actions);
                }
            }
            Frame::Channel { channel } => self.on_channel_directive(from, channel, actions),
            Frame::File(chunk) => self.on_file_chunk(now, from, chunk, actions),
            Frame::Stop => {
                self.reply(from, &Frame::Ack, actions);
                if self.config.capability.stop_enters_command_mode && !self.command_mode {
                    info!(peer = %from, "STOP received, entering command mode");
                    self.command_mode = true;
                    actions.push(Action::Notify(Event::CommandMode { peer: from }));
                }
            }
            Frame::Done => {
                info!(peer = %from, "peer finished writing file");
                actions.push(Action::Notify(Event::RemoteWriteComplete { peer: from }));
            }
            Frame::Ack | Frame::FileWriteAck | Frame::Reset => {
                debug!(peer = %from, %opcode, "unsolicited reply, dropping");
            }
        }
    }

    fn on_channel_directive(&mut self, from: MacAddr, channel: u8, actions: &mut Vec<Action>) {
        if !self.config.capability.is_valid_channel(channel) {
            warn!(peer = %from, channel, "CHANNEL directive outside radio range, ignoring");
            return;
        }
        info!(peer = %from, channel, "switching channel on request");
        self.channel = channel;
        actions.push(Action::SetChannel(channel));
    }

    fn on_file_chunk(
        &mut self,
        now: Instant,
        from: MacAddr,
        chunk: FileChunk,
        actions: &mut Vec<Action>,
    ) {
        match self.reassembler.on_chunk_received(now, from, &chunk) {
            Ok(ChunkReceiveResult::InProgress { high_water }) => {
                trace!(
                    peer = %from,
                    filename = %chunk.filename,
                    offset = chunk.offset,
                    high_water,
                    "chunk stored"
                );
                self.reply(from, &Frame::FileWriteAck, actions);
            }
            Ok(ChunkReceiveResult::Complete(file)) => {
                let digest = integrity::hash_file(&file.bytes);
                let len = file.bytes.len();
                info!(
                    peer = %from,
                    filename = %file.filename,
                    bytes = len,
                    digest = %integrity::digest_hex(&digest),
                    "file received"
                );
                self.reply(from, &Frame::FileWriteAck, actions);
                actions.push(Action::WriteFile {
                    path: file.filename.clone(),
                    bytes: file.bytes,
                });
                self.reply(from, &Frame::Done, actions);
                actions.push(Action::Notify(Event::FileReceived {
                    peer: from,
                    filename: file.filename,
                    len,
                    digest,
                }));
            }
            Ok(ChunkReceiveResult::Duplicate) => {
                debug!(peer = %from, filename = %chunk.filename, "final chunk repeated, re-acknowledging");
                self.reply(from, &Frame::FileWriteAck, actions);
                self.reply(from, &Frame::Done, actions);
            }
            Err(error) => {
                warn!(peer = %from, %error, "rejecting chunk");
                actions.push(Action::Notify(Event::ChunkRejected { peer: from, error }));
            }
        }
    }

    // --- timers ---

    /// Advance scan and reply deadlines to `now`.
    pub fn tick(&mut self, now: Instant) -> Vec<Action> {
        let mut actions = Vec::new();
        if self.halted {
            return actions;
        }

        match self.scan.as_mut().map(|scan| (scan.poll(now), scan.channel())) {
            Some((ScanStep::Actions(step), channel)) => {
                self.channel = channel;
                actions.extend(step);
            }
            Some((ScanStep::Exhausted { passes }, _)) => {
                self.finish_scan(ScanOutcome::Exhausted { passes }, &mut actions);
            }
            Some((ScanStep::Idle, _)) | None => {}
        }

        self.reassembler.expire(now);

        for timer in self.commands.poll(now) {
            match timer {
                AckTimer::Retransmit {
                    peer,
                    frame,
                    attempt,
                } => {
                    debug!(peer = %peer, attempt, "no reply yet, retransmitting");
                    actions.push(Action::Send(peer, frame));
                }
                AckTimer::Expired { peer, expected } => {
                    if self.outgoing.contains_key(&peer) {
                        self.commands.take_outcome(&peer);
                        self.fail_transfer(peer, &mut actions);
                    } else {
                        warn!(peer = %peer, %expected, "no reply, giving up");
                        actions.push(Action::Notify(Event::AckTimedOut { peer, expected }));
                    }
                }
            }
        }
        actions
    }

    // --- helpers ---

    fn register(&mut self, peer: MacAddr, actions: &mut Vec<Action>) {
        if let Some(PeerAdded::New) = self.registry.add(peer, self.channel) {
            info!(peer = %peer, channel = self.channel, "peer registered");
            actions.push(Action::RegisterPeer(peer));
            actions.push(Action::Notify(Event::PeerJoined {
                peer,
                channel: self.channel,
            }));
        }
    }

    /// Reply to a frame's sender, registering it first if needed.
    fn reply(&mut self, to: MacAddr, frame: &Frame, actions: &mut Vec<Action>) {
        match wire::encode_frame(frame) {
            Ok(bytes) => {
                self.register(to, actions);
                actions.push(Action::Send(to, bytes));
            }
            Err(error) => warn!(peer = %to, %error, "cannot encode reply"),
        }
    }

    fn ensure_sendable(&self, peer: &MacAddr) -> Result<(), LinkError> {
        if peer.is_broadcast() {
            return Err(LinkError::BroadcastPeer);
        }
        if !self.registry.is_known(peer) {
            return Err(LinkError::UnknownPeer(*peer));
        }
        Ok(())
    }

    fn ensure_running(&self) -> Result<(), LinkError> {
        if self.halted {
            return Err(LinkError::Rebooting);
        }
        Ok(())
    }
}

fn check_payload_len(payload: &[u8]) -> Result<(), LinkError> {
    if payload.len() > MAX_FRAME_LEN {
        return Err(LinkError::PayloadTooLarge(payload.len()));
    }
    Ok(())
}

#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("no {expected} from {peer} within the attempt budget")]
    AckTimeout { peer: MacAddr, expected: Opcode },
    #[error("no peer answered after {passes} scan pass(es)")]
    ChannelScanExhausted { passes: u32 },
    #[error("transfer of {filename:?} to {peer} failed after {acked} of {total} bytes")]
    TransferFailed {
        peer: MacAddr,
        filename: String,
        acked: usize,
        total: usize,
    },
    #[error(transparent)]
    Transfer(#[from] ChunkError),
    #[error("cannot encode frame: {0}")]
    Encode(#[from] FrameEncodeError),
    #[error("transport failure: {0}")]
    TransportFailure(#[from] TransportError),
    #[error("unknown peer {0}")]
    UnknownPeer(MacAddr),
    #[error("the broadcast address cannot be a peer")]
    BroadcastPeer,
    #[error("a command to {0} is still awaiting its reply")]
    CommandPending(MacAddr),
    #[error("a file transfer to {0} is already running")]
    TransferPending(MacAddr),
    #[error("{0} carries a payload and cannot be sent as a command")]
    NotACommand(Opcode),
    #[error("channel {0} is outside this radio's range")]
    InvalidChannel(u8),
    #[error("payload of {0} bytes exceeds the radio frame limit")]
    PayloadTooLarge(usize),
    #[error("device is rebooting")]
    Rebooting,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Capability;

    fn local() -> MacAddr {
        MacAddr::new([0x24, 0x6f, 0x28, 0, 0, 1])
    }

    fn remote() -> MacAddr {
        MacAddr::new([0x24, 0x6f, 0x28, 0, 0, 2])
    }

    fn other() -> MacAddr {
        MacAddr::new([0x24, 0x6f, 0x28, 0, 0, 3])
    }

    fn core() -> LinkCore {
        LinkCore::new(local(), LinkConfig::default())
    }

    fn joined() -> LinkCore {
        let mut c = core();
        c.join(remote(), 1).unwrap();
        c
    }

    fn sends(actions: &[Action]) -> Vec<(MacAddr, Vec<u8>)> {
        actions
            .iter()
            .filter_map(|a| match a {
                Action::Send(to, bytes) => Some((*to, bytes.clone())),
                _ => None,
            })
            .collect()
    }

    fn encode(frame: &Frame) -> Vec<u8> {
        wire::encode_frame(frame).unwrap()
    }

    fn file_chunk(total: u32, offset: u16, data: &[u8]) -> Vec<u8> {
        encode(&Frame::File(FileChunk {
            chunk_size: 4,
            total_length: total,
            filename: "x.txt".into(),
            offset,
            data: data.to_vec(),
        }))
    }

    #[test]
    fn boot_registers_sender_and_replies_join() {
        let now = Instant::now();
        let mut c = core();
        let actions = c.on_frame(now, remote(), &[0xff, 0x00]);
        let register_pos = actions
            .iter()
            .position(|a| *a == Action::RegisterPeer(remote()))
            .unwrap();
        let send_pos = actions
            .iter()
            .position(|a| matches!(a, Action::Send(..)))
            .unwrap();
        assert!(register_pos < send_pos);
        assert_eq!(
            sends(&actions),
            vec![(remote(), encode(&Frame::Join { peer: local() }))]
        );
        assert!(c.registry().is_known(&remote()));
    }

    #[test]
    fn reset_reboots_and_halts() {
        let now = Instant::now();
        let mut c = joined();
        assert_eq!(c.on_frame(now, remote(), &[0xff, 0xff]), vec![Action::Reboot]);
        assert!(c.is_halted());
        assert!(c.on_frame(now, remote(), &[0xff, 0x00]).is_empty());
        assert!(c.tick(now + Duration::from_secs(10)).is_empty());
        assert!(matches!(
            c.send_command(now, remote(), Opcode::Stop),
            Err(LinkError::Rebooting)
        ));
    }

    #[test]
    fn pending_ack_cleared_only_by_matching_reply() {
        let now = Instant::now();
        let mut c = joined();
        c.add_peer(other()).unwrap();
        c.send_command(now, remote(), Opcode::Stop).unwrap();

        c.on_frame(now, other(), &[0xff, 0xfe]);
        c.on_frame(now, remote(), &[0xf4, 0x11]);
        assert!(matches!(c.ack_state(&remote()), AckState::AwaitingAck { .. }));

        let actions = c.on_frame(now, remote(), &[0xff, 0xfe]);
        assert!(actions.contains(&Action::Notify(Event::AckReceived {
            peer: remote(),
            opcode: Opcode::Ack
        })));
        assert_eq!(c.take_ack_outcome(&remote()), Some(AckOutcome::Resolved(Opcode::Ack)));
    }

    #[test]
    fn command_times_out_after_attempts() {
        let now = Instant::now();
        let mut c = joined();
        c.send_command(now, remote(), Opcode::Stop).unwrap();
        let timeout = c.config().ack_timeout;
        let mut retransmits = 0;
        let mut t = now;
        for _ in 0..5 {
            t += timeout;
            let actions = c.tick(t);
            retransmits += sends(&actions).len();
        }
        assert_eq!(retransmits, 2);
        assert_eq!(c.ack_state(&remote()), AckState::TimedOut(Opcode::Ack));
    }

    #[test]
    fn reset_command_waits_for_boot() {
        let now = Instant::now();
        let mut c = joined();
        c.send_command(now, remote(), Opcode::Reset).unwrap();
        let actions = c.on_frame(now, remote(), &[0xff, 0x00]);
        assert!(sends(&actions).is_empty(), "pending BOOT must not be answered");
        assert_eq!(c.take_ack_outcome(&remote()), Some(AckOutcome::Resolved(Opcode::Boot)));
    }

    #[test]
    fn unknown_peer_and_payload_opcodes_are_refused() {
        let now = Instant::now();
        let mut c = core();
        assert!(matches!(
            c.send_command(now, remote(), Opcode::Stop),
            Err(LinkError::UnknownPeer(_))
        ));
        c.add_peer(remote()).unwrap();
        assert!(matches!(
            c.send_command(now, remote(), Opcode::File),
            Err(LinkError::NotACommand(Opcode::File))
        ));
        assert!(matches!(c.add_peer(MacAddr::BROADCAST), Err(LinkError::BroadcastPeer)));
    }

    #[test]
    fn application_frames_are_delivered_and_junk_is_dropped() {
        let now = Instant::now();
        let mut c = joined();
        assert_eq!(
            c.on_frame(now, remote(), b"hello"),
            vec![Action::Deliver {
                from: remote(),
                payload: b"hello".to_vec()
            }]
        );
        assert!(c.on_frame(now, remote(), &[0xf0, 0x01]).is_empty());
        assert!(c.on_frame(now, remote(), &[0xff, 0x14]).is_empty());
        assert!(c.on_frame(now, remote(), &[0xff, 0x14, b'0', b'5']).is_empty());
    }

    #[test]
    fn own_frames_are_ignored() {
        let now = Instant::now();
        let mut c = core();
        assert!(c.on_frame(now, local(), &[0xff, 0x00]).is_empty());
        assert!(c.on_frame(now, MacAddr::BROADCAST, &[0xff, 0x00]).is_empty());
    }

    #[test]
    fn masked_source_address_on_esp8266() {
        let now = Instant::now();
        let mut c = LinkCore::new(local(), LinkConfig::new(Capability::esp8266()));
        let flipped = MacAddr::new([0x26, 0x6f, 0x28, 0, 0, 2]);
        c.on_frame(now, flipped, &[0xff, 0x00]);
        assert!(c.registry().is_known(&remote()));
        assert!(!c.registry().is_known(&flipped));
    }

    #[test]
    fn stop_replies_ack_and_enters_command_mode() {
        let now = Instant::now();
        let mut c = core();
        let actions = c.on_frame(now, remote(), &[0xf4, 0xfe]);
        assert_eq!(sends(&actions), vec![(remote(), vec![0xff, 0xfe])]);
        assert!(c.is_command_mode());

        let mut c8266 = LinkCore::new(local(), LinkConfig::new(Capability::esp8266()));
        let actions = c8266.on_frame(now, remote(), &[0xf4, 0xfe]);
        assert_eq!(sends(&actions), vec![(remote(), vec![0xff, 0xfe])]);
        assert!(!c8266.is_command_mode());
    }

    #[test]
    fn channel_directive_within_range() {
        let now = Instant::now();
        let mut c = core();
        let actions = c.on_frame(now, remote(), &encode(&Frame::Channel { channel: 6 }));
        assert_eq!(actions, vec![Action::SetChannel(6)]);
        assert_eq!(c.channel(), 6);

        assert!(c
            .on_frame(now, remote(), &encode(&Frame::Channel { channel: 13 }))
            .is_empty());
        assert_eq!(c.channel(), 6);
    }

    #[test]
    fn join_frame_registers_advertised_peer() {
        let now = Instant::now();
        let mut c = core();
        let actions = c.on_frame(now, remote(), &encode(&Frame::Join { peer: other() }));
        assert!(actions.contains(&Action::RegisterPeer(other())));
        assert!(!c.registry().is_known(&remote()));
        assert!(c
            .on_frame(now, remote(), &encode(&Frame::Join { peer: local() }))
            .is_empty());
    }

    #[test]
    fn receive_x_txt_writes_once_after_final_chunk() {
        let now = Instant::now();
        let mut c = core();
        let mut writes = Vec::new();
        let mut replies = Vec::new();
        for (offset, data) in [(0u16, &b"0123"[..]), (4, b"4567"), (8, b"89")] {
            for action in c.on_frame(now, remote(), &file_chunk(10, offset, data)) {
                match action {
                    Action::WriteFile { path, bytes } => writes.push((path, bytes)),
                    Action::Send(_, bytes) => replies.push(bytes),
                    _ => {}
                }
            }
        }
        assert_eq!(writes, vec![("x.txt".to_string(), b"0123456789".to_vec())]);
        assert_eq!(
            replies,
            vec![
                vec![0xf4, 0x12],
                vec![0xf4, 0x12],
                vec![0xf4, 0x12],
                vec![0xf4, 0x11]
            ]
        );
    }

    #[test]
    fn final_chunk_action_order() {
        let now = Instant::now();
        let mut c = core();
        c.add_peer(remote()).unwrap();
        let actions = c.on_frame(now, remote(), &file_chunk(2, 0, b"ab"));
        assert!(matches!(&actions[0], Action::Send(_, b) if b == &[0xf4, 0x12]));
        assert!(matches!(&actions[1], Action::WriteFile { .. }));
        assert!(matches!(&actions[2], Action::Send(_, b) if b == &[0xf4, 0x11]));
    }

    #[test]
    fn out_of_bounds_chunk_is_not_acked() {
        let now = Instant::now();
        let mut c = core();
        let actions = c.on_frame(now, remote(), &file_chunk(4, 2, b"abcd"));
        assert!(sends(&actions).is_empty());
        assert!(matches!(
            actions.last(),
            Some(Action::Notify(Event::ChunkRejected { .. }))
        ));
    }

    #[test]
    fn tick_releases_idle_receive_sessions() {
        let now = Instant::now();
        let mut c = core();
        c.on_frame(now, remote(), &file_chunk(10, 0, b"0123"));
        assert_eq!(c.reassembler().active_sessions(), 1);

        let idle = c.config().receive_idle_timeout;
        c.tick(now + idle / 2);
        assert_eq!(c.reassembler().active_sessions(), 1);
        c.tick(now + idle);
        assert_eq!(c.reassembler().active_sessions(), 0);
    }

    #[test]
    fn same_small_file_resent_later_is_written_twice() {
        let now = Instant::now();
        let mut c = core();
        let writes = |actions: Vec<Action>| {
            actions
                .iter()
                .filter(|a| matches!(a, Action::WriteFile { .. }))
                .count()
        };
        assert_eq!(writes(c.on_frame(now, remote(), &file_chunk(2, 0, b"hi"))), 1);
        assert_eq!(writes(c.on_frame(now, remote(), &file_chunk(2, 0, b"hi"))), 0);

        let later = now + c.config().retry_window();
        assert_eq!(writes(c.on_frame(later, remote(), &file_chunk(2, 0, b"hi"))), 1);
    }

    #[test]
    fn send_file_is_stop_and_wait() {
        let now = Instant::now();
        let mut c = joined();
        let first = c
            .send_file(now, remote(), "x.txt", b"0123456789".to_vec(), 4)
            .unwrap();
        assert_eq!(sends(&first), vec![(remote(), file_chunk(10, 0, b"0123"))]);
        assert!(matches!(
            c.send_file(now, remote(), "y.txt", vec![1], 4),
            Err(LinkError::TransferPending(_))
        ));

        let second = c.on_frame(now, remote(), &[0xf4, 0x12]);
        assert_eq!(sends(&second), vec![(remote(), file_chunk(10, 4, b"4567"))]);
        assert_eq!(c.transfer_progress(&remote()).unwrap().acked, 4);

        let third = c.on_frame(now, remote(), &[0xf4, 0x12]);
        assert_eq!(sends(&third), vec![(remote(), file_chunk(10, 8, b"89"))]);

        let done = c.on_frame(now, remote(), &[0xf4, 0x12]);
        assert!(sends(&done).is_empty());
        match c.take_transfer_outcome(&remote()) {
            Some(TransferOutcome::Complete(report)) => {
                assert_eq!(report.digest, integrity::hash_file(b"0123456789"));
                assert_eq!(report.chunks, 3);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(c.ack_state(&remote()), AckState::Idle);
    }

    #[test]
    fn send_file_fails_when_chunk_never_acked() {
        let now = Instant::now();
        let mut c = joined();
        c.send_file(now, remote(), "x.txt", b"0123456789".to_vec(), 4)
            .unwrap();
        c.on_frame(now, remote(), &[0xf4, 0x12]);
        let mut t = now;
        for _ in 0..4 {
            t += c.config().ack_timeout;
            c.tick(t);
        }
        assert_eq!(
            c.take_transfer_outcome(&remote()),
            Some(TransferOutcome::Failed {
                filename: "x.txt".into(),
                acked: 4,
                total: 10
            })
        );
        assert!(c.transfer_progress(&remote()).is_none());
    }

    #[test]
    fn scan_registers_first_responder() {
        let now = Instant::now();
        let mut c = core();
        let start = c.start_scan(now, RetryPolicy::Once, ScanTarget::Any).unwrap();
        assert_eq!(start[0], Action::SetChannel(1));
        let listen = c.config().capability.listen_timeout;
        c.tick(now + listen);
        c.tick(now + listen * 2);
        assert_eq!(c.channel(), 3);

        let actions = c.on_frame(now + listen * 2, remote(), &encode(&Frame::Join { peer: remote() }));
        assert!(actions.contains(&Action::RegisterPeer(remote())));
        assert_eq!(
            c.take_scan_outcome(),
            Some(ScanOutcome::Found {
                peer: remote(),
                channel: 3,
                pass: 1
            })
        );
        assert_eq!(c.registry().lookup(&remote()).unwrap().channel, 3);
        assert!(!c.is_scanning());
    }

    #[test]
    fn hub_scan_ignores_strangers() {
        let now = Instant::now();
        let mut c = core();
        c.start_scan(now, RetryPolicy::Forever, ScanTarget::Hub(remote()))
            .unwrap();
        c.on_frame(now, other(), &[0xff, 0x00]);
        assert!(c.is_scanning());
        c.on_frame(now, remote(), &[0xff, 0xfe]);
        assert!(!c.is_scanning());
    }
}
