//! Cooperative driver: owns a [`LinkCore`] and performs its actions against the
//! host's radio, storage and system.
//!
//! Blocking operations poll the inbox and sleep `poll_interval` between polls, so one
//! thread serves the radio while it waits for replies. Frames arrive through a bounded
//! inbox fed by the radio's receive path.

use std::cell::Cell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::command::AckOutcome;
use crate::config::{LinkConfig, RetryPolicy};
use crate::core::{Action, Event, LinkCore, LinkError};
use crate::identity::MacAddr;
use crate::protocol::{Frame, Opcode};
use crate::registry::Peer;
use crate::scan::{ScanOutcome, ScanTarget};
use crate::transfer::{Progress, TransferOutcome, TransferReport};

/// Events kept for [`Node::take_events`]; older ones are dropped first.
const EVENT_BACKLOG: usize = 256;

/// The radio link layer.
pub trait Radio {
    fn local_address(&self) -> MacAddr;
    fn set_channel(&mut self, channel: u8) -> Result<(), TransportError>;
    /// Make `peer` addressable. Registering twice is harmless.
    fn register_peer(&mut self, peer: MacAddr) -> Result<(), TransportError>;
    fn send(&mut self, peer: MacAddr, frame: &[u8]) -> Result<(), TransportError>;
    fn broadcast(&mut self, frame: &[u8]) -> Result<(), TransportError>;
}

/// Where received files go.
pub trait Storage {
    fn write_file(&mut self, path: &str, bytes: &[u8]) -> std::io::Result<()>;
}

/// Device-level control.
pub trait System {
    fn reboot(&mut self);
}

/// Time source. Tests substitute [`ManualClock`].
pub trait Clock {
    fn now(&self) -> Instant;
    fn sleep(&self, duration: Duration);
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("peer {0} is not registered with the radio")]
    NotRegistered(MacAddr),
    #[error("radio unavailable: {0}")]
    Unavailable(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Wall-clock time and real sleeps.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Virtual time: `sleep` advances the clock instead of blocking. Clones share one timeline.
#[derive(Debug, Clone)]
pub struct ManualClock {
    origin: Instant,
    elapsed: Rc<Cell<Duration>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            elapsed: Rc::new(Cell::new(Duration::ZERO)),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.elapsed.set(self.elapsed.get() + by);
    }

    pub fn elapsed(&self) -> Duration {
        self.elapsed.get()
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.origin + self.elapsed.get()
    }

    fn sleep(&self, duration: Duration) {
        self.advance(duration);
    }
}

/// Received files kept in memory.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    files: HashMap<String, Vec<u8>>,
    writes: usize,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, path: &str) -> Option<&[u8]> {
        self.files.get(path).map(Vec::as_slice)
    }

    /// Number of `write_file` calls, including overwrites.
    pub fn writes(&self) -> usize {
        self.writes
    }
}

impl Storage for MemoryStorage {
    fn write_file(&mut self, path: &str, bytes: &[u8]) -> std::io::Result<()> {
        self.files.insert(path.to_string(), bytes.to_vec());
        self.writes += 1;
        Ok(())
    }
}

/// One frame as the radio received it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    pub from: MacAddr,
    pub payload: Vec<u8>,
}

/// Create a bounded inbox; the sender side goes to the radio's receive path.
pub fn inbox(capacity: usize) -> (InboxSender, Inbox) {
    let (tx, rx) = mpsc::sync_channel(capacity.max(1));
    (InboxSender(tx), Inbox(rx))
}

/// Producer half of the inbox. Never blocks: a full inbox drops the frame.
#[derive(Debug, Clone)]
pub struct InboxSender(SyncSender<RawFrame>);

impl InboxSender {
    /// Queue a received frame. Returns false if it was dropped.
    pub fn push(&self, from: MacAddr, payload: Vec<u8>) -> bool {
        match self.0.try_send(RawFrame { from, payload }) {
            Ok(()) => true,
            Err(TrySendError::Full(frame)) => {
                warn!(peer = %frame.from, "inbox full, dropping frame");
                false
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }
}

/// Consumer half of the inbox, owned by the [`Node`].
#[derive(Debug)]
pub struct Inbox(Receiver<RawFrame>);

impl Inbox {
    pub fn try_recv(&self) -> Option<RawFrame> {
        self.0.try_recv().ok()
    }
}

type DeliverFn = Box<dyn FnMut(MacAddr, &[u8]) + Send>;

pub struct Node<R, S, Y, C> {
    core: LinkCore,
    radio: R,
    storage: S,
    system: Y,
    clock: C,
    inbox: Inbox,
    deliver: Option<DeliverFn>,
    events: VecDeque<Event>,
    rebooting: bool,
}

impl<R: Radio, S: Storage, Y: System, C: Clock> Node<R, S, Y, C> {
    /// Build a node. The returned sender feeds received frames to the node.
    pub fn new(radio: R, storage: S, system: Y, clock: C, config: LinkConfig) -> (Self, InboxSender) {
        let (tx, rx) = inbox(config.inbox_capacity);
        let core = LinkCore::new(radio.local_address(), config);
        let node = Self {
            core,
            radio,
            storage,
            system,
            clock,
            inbox: rx,
            deliver: None,
            events: VecDeque::new(),
            rebooting: false,
        };
        (node, tx)
    }

    /// Handler for application frames. Without one they are logged and dropped.
    pub fn on_deliver(&mut self, handler: impl FnMut(MacAddr, &[u8]) + Send + 'static) {
        self.deliver = Some(Box::new(handler));
    }

    pub fn core(&self) -> &LinkCore {
        &self.core
    }

    pub fn radio(&self) -> &R {
        &self.radio
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    pub fn is_rebooting(&self) -> bool {
        self.rebooting
    }

    /// Drain the events recorded since the last call.
    pub fn take_events(&mut self) -> Vec<Event> {
        self.events.drain(..).collect()
    }

    /// Process every queued frame, then advance timers.
    pub fn poll(&mut self) -> Result<(), LinkError> {
        self.ensure_running()?;
        while let Some(frame) = self.inbox.try_recv() {
            let actions = self.core.on_frame(self.clock.now(), frame.from, &frame.payload);
            self.perform(actions)?;
            self.ensure_running()?;
        }
        let actions = self.core.tick(self.clock.now());
        self.perform(actions)?;
        self.ensure_running()
    }

    /// Serve the radio until `stop` returns true.
    pub fn serve_until(&mut self, mut stop: impl FnMut() -> bool) -> Result<(), LinkError> {
        while !stop() {
            self.poll()?;
            self.clock.sleep(self.core.config().poll_interval);
        }
        Ok(())
    }

    // --- channel negotiation ---

    pub fn join(&mut self, peer: MacAddr, channel: u8) -> Result<(), LinkError> {
        let actions = self.core.join(peer, channel)?;
        self.perform(actions)
    }

    pub fn add_peer(&mut self, peer: MacAddr) -> Result<(), LinkError> {
        let actions = self.core.add_peer(peer)?;
        self.perform(actions)
    }

    /// Scan channels until a peer answers or the policy gives up.
    pub fn join_scanning(&mut self, policy: RetryPolicy, target: ScanTarget) -> Result<Peer, LinkError> {
        let actions = self.core.start_scan(self.clock.now(), policy, target)?;
        self.perform(actions)?;
        match self.wait_for(LinkCore::take_scan_outcome)? {
            ScanOutcome::Found { peer, channel, .. } => Ok(Peer {
                address: peer,
                channel,
            }),
            ScanOutcome::Exhausted { passes } => Err(LinkError::ChannelScanExhausted { passes }),
        }
    }

    // --- commands ---

    /// Send a control frame and block until its reply arrives or attempts run out.
    pub fn send_command(&mut self, peer: MacAddr, opcode: Opcode) -> Result<(), LinkError> {
        let timeout = self.core.config().ack_timeout;
        self.send_command_with_timeout(peer, opcode, timeout)
    }

    pub fn send_command_with_timeout(
        &mut self,
        peer: MacAddr,
        opcode: Opcode,
        timeout: Duration,
    ) -> Result<(), LinkError> {
        let actions = self
            .core
            .send_command_with_timeout(self.clock.now(), peer, opcode, timeout)?;
        self.perform(actions)?;
        match self.wait_for(|core| core.take_ack_outcome(&peer))? {
            AckOutcome::Resolved(_) => Ok(()),
            AckOutcome::TimedOut(expected) => Err(LinkError::AckTimeout { peer, expected }),
        }
    }

    /// Reset `peer`, wait for it to boot, then stop its application.
    pub fn enter_command_mode(&mut self, peer: MacAddr) -> Result<(), LinkError> {
        self.add_peer(peer)?;
        info!(peer = %peer, "putting peer into command mode");
        self.send_command(peer, Opcode::Reset)?;
        self.send_command(peer, Opcode::Stop)
    }

    pub fn send_unacked(&mut self, peer: MacAddr, frame: &Frame) -> Result<(), LinkError> {
        let actions = self.core.send_unacked(peer, frame)?;
        self.perform(actions)
    }

    pub fn send_all(&mut self, frame: &Frame) -> Result<(), LinkError> {
        let actions = self.core.send_all(frame)?;
        self.perform(actions)
    }

    pub fn broadcast(&mut self, frame: &Frame) -> Result<(), LinkError> {
        let actions = self.core.broadcast(frame)?;
        self.perform(actions)
    }

    pub fn send_join(&mut self, to: MacAddr, advertised: MacAddr) -> Result<(), LinkError> {
        let actions = self.core.send_join(to, advertised)?;
        self.perform(actions)
    }

    pub fn send_channel(&mut self, to: MacAddr, channel: u8) -> Result<(), LinkError> {
        let actions = self.core.send_channel(to, channel)?;
        self.perform(actions)
    }

    pub fn send_payload(&mut self, peer: MacAddr, payload: &[u8]) -> Result<(), LinkError> {
        let actions = self.core.send_payload(peer, payload)?;
        self.perform(actions)
    }

    pub fn broadcast_payload(&mut self, payload: &[u8]) -> Result<(), LinkError> {
        let actions = self.core.broadcast_payload(payload)?;
        self.perform(actions)
    }

    // --- file transfer ---

    pub fn send_file(
        &mut self,
        peer: MacAddr,
        filename: &str,
        data: Vec<u8>,
        chunk_size: u8,
    ) -> Result<TransferReport, LinkError> {
        self.send_file_with_progress(peer, filename, data, chunk_size, |_| {})
    }

    /// Send a file, calling `progress` whenever more bytes are acknowledged.
    pub fn send_file_with_progress(
        &mut self,
        peer: MacAddr,
        filename: &str,
        data: Vec<u8>,
        chunk_size: u8,
        mut progress: impl FnMut(Progress),
    ) -> Result<TransferReport, LinkError> {
        let actions = self
            .core
            .send_file(self.clock.now(), peer, filename, data, chunk_size)?;
        self.perform(actions)?;
        let mut reported = 0;
        loop {
            self.poll()?;
            if let Some(p) = self.core.transfer_progress(&peer) {
                if p.acked > reported {
                    reported = p.acked;
                    progress(p);
                }
            }
            match self.core.take_transfer_outcome(&peer) {
                Some(TransferOutcome::Complete(report)) => {
                    if report.total_length > reported {
                        progress(Progress {
                            acked: report.total_length,
                            total: report.total_length,
                        });
                    }
                    return Ok(report);
                }
                Some(TransferOutcome::Failed {
                    filename,
                    acked,
                    total,
                }) => {
                    return Err(LinkError::TransferFailed {
                        peer,
                        filename,
                        acked,
                        total,
                    })
                }
                None => self.clock.sleep(self.core.config().poll_interval),
            }
        }
    }

    /// Put `peer` in command mode, then send it a file.
    pub fn sync_file(
        &mut self,
        peer: MacAddr,
        filename: &str,
        data: Vec<u8>,
        chunk_size: u8,
    ) -> Result<TransferReport, LinkError> {
        self.enter_command_mode(peer)?;
        self.send_file(peer, filename, data, chunk_size)
    }

    // --- internals ---

    fn wait_for<T>(&mut self, mut check: impl FnMut(&mut LinkCore) -> Option<T>) -> Result<T, LinkError> {
        loop {
            self.poll()?;
            if let Some(value) = check(&mut self.core) {
                return Ok(value);
            }
            self.clock.sleep(self.core.config().poll_interval);
        }
    }

    fn ensure_running(&self) -> Result<(), LinkError> {
        if self.rebooting {
            return Err(LinkError::Rebooting);
        }
        Ok(())
    }

    fn perform(&mut self, actions: Vec<Action>) -> Result<(), LinkError> {
        for action in actions {
            let result = match action {
                Action::SetChannel(channel) => self.radio.set_channel(channel),
                Action::RegisterPeer(peer) => self.radio.register_peer(peer),
                Action::Send(peer, bytes) => self.radio.send(peer, &bytes),
                Action::Broadcast(bytes) => self.radio.broadcast(&bytes),
                Action::WriteFile { path, bytes } => {
                    if let Err(e) = self.storage.write_file(&path, &bytes) {
                        error!(path = %path, error = %e, "failed to store received file");
                    }
                    Ok(())
                }
                Action::Reboot => {
                    self.reboot();
                    return Ok(());
                }
                Action::Deliver { from, payload } => {
                    match self.deliver.as_mut() {
                        Some(handler) => handler(from, &payload),
                        None => debug!(peer = %from, len = payload.len(), "no handler for application frame"),
                    }
                    Ok(())
                }
                Action::Notify(event) => {
                    if self.events.len() == EVENT_BACKLOG {
                        self.events.pop_front();
                    }
                    self.events.push_back(event);
                    Ok(())
                }
            };
            if let Err(e) = result {
                error!(error = %e, "radio failure, rebooting");
                self.reboot();
                return Err(LinkError::TransportFailure(e));
            }
        }
        Ok(())
    }

    fn reboot(&mut self) {
        if !self.rebooting {
            self.rebooting = true;
            self.system.reboot();
        }
    }
}
