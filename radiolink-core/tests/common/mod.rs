//! Simulated air for integration tests: stations driven by bare `LinkCore`s plus
//! endpoints backed by a `Node` inbox, all sharing channels and one virtual clock.

#![allow(dead_code)]

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::rc::Rc;
use std::time::Instant;

use radiolink_core::{
    Action, Clock, Event, InboxSender, LinkConfig, LinkCore, MacAddr, ManualClock, Opcode, Radio,
    System, TransportError,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

pub fn addr(last: u8) -> MacAddr {
    MacAddr::new([0x24, 0x6f, 0x28, 0x10, 0x20, last])
}

/// A device whose core the test drives directly.
pub struct Station {
    pub core: LinkCore,
    pub channel: u8,
    pub files: HashMap<String, Vec<u8>>,
    pub writes: usize,
    pub delivered: Vec<(MacAddr, Vec<u8>)>,
    pub events: Vec<Event>,
    pub reboots: usize,
    registered: HashSet<MacAddr>,
    config: LinkConfig,
}

struct External {
    inbox: InboxSender,
    channel: u8,
}

#[derive(Debug, Clone)]
pub struct Transmission {
    pub from: MacAddr,
    pub to: Option<MacAddr>,
    pub channel: u8,
    pub bytes: Vec<u8>,
}

#[derive(Default)]
pub struct Air {
    stations: BTreeMap<MacAddr, Station>,
    externals: BTreeMap<MacAddr, External>,
    queue: VecDeque<Transmission>,
    pub log: Vec<Transmission>,
    loss: Option<(StdRng, f64)>,
    pub dropped: usize,
}

impl Air {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop each transmission with probability `rate`, reproducibly.
    pub fn with_loss(seed: u64, rate: f64) -> Self {
        Self {
            loss: Some((StdRng::seed_from_u64(seed), rate)),
            ..Self::default()
        }
    }

    pub fn add_station(&mut self, address: MacAddr, config: LinkConfig, channel: u8) {
        let station = Station {
            core: LinkCore::new(address, config.clone()),
            channel,
            files: HashMap::new(),
            writes: 0,
            delivered: Vec::new(),
            events: Vec::new(),
            reboots: 0,
            registered: HashSet::new(),
            config,
        };
        self.stations.insert(address, station);
    }

    pub fn station(&self, address: MacAddr) -> &Station {
        &self.stations[&address]
    }

    pub fn station_mut(&mut self, address: MacAddr) -> &mut Station {
        self.stations.get_mut(&address).expect("unknown station")
    }

    pub fn attach_external(&mut self, address: MacAddr, inbox: InboxSender) {
        self.externals.insert(address, External { inbox, channel: 1 });
    }

    pub fn set_external_channel(&mut self, address: MacAddr, channel: u8) {
        if let Some(ext) = self.externals.get_mut(&address) {
            ext.channel = channel;
        }
    }

    fn channel_of(&self, address: MacAddr) -> u8 {
        self.stations
            .get(&address)
            .map(|s| s.channel)
            .or_else(|| self.externals.get(&address).map(|e| e.channel))
            .unwrap_or(1)
    }

    pub fn transmit(&mut self, from: MacAddr, to: Option<MacAddr>, bytes: Vec<u8>) {
        let channel = self.channel_of(from);
        self.queue.push_back(Transmission {
            from,
            to,
            channel,
            bytes,
        });
    }

    /// Run `f` against a station's core, perform the actions, and deliver everything queued.
    pub fn run<T>(
        &mut self,
        address: MacAddr,
        now: Instant,
        f: impl FnOnce(&mut LinkCore) -> T,
    ) -> T
    where
        T: IntoActions,
    {
        let result = f(&mut self.station_mut(address).core);
        let actions = result.actions();
        self.apply(address, actions);
        self.flush(now);
        result
    }

    /// Advance every station's timers, then deliver.
    pub fn tick(&mut self, now: Instant) {
        let addresses: Vec<MacAddr> = self.stations.keys().copied().collect();
        for address in addresses {
            let actions = self.station_mut(address).core.tick(now);
            self.apply(address, actions);
        }
        self.flush(now);
    }

    pub fn flush(&mut self, now: Instant) {
        while let Some(tx) = self.queue.pop_front() {
            self.log.push(tx.clone());
            if let Some((rng, rate)) = self.loss.as_mut() {
                if rng.gen_bool(*rate) {
                    self.dropped += 1;
                    continue;
                }
            }
            let receivers: Vec<MacAddr> = self
                .stations
                .iter()
                .filter(|(a, s)| s.channel == tx.channel && **a != tx.from)
                .map(|(a, _)| *a)
                .filter(|a| tx.to.map_or(true, |to| to == *a))
                .collect();
            for receiver in receivers {
                let actions = self
                    .station_mut(receiver)
                    .core
                    .on_frame(now, tx.from, &tx.bytes);
                self.apply(receiver, actions);
            }
            for (address, ext) in &self.externals {
                if ext.channel == tx.channel
                    && *address != tx.from
                    && tx.to.map_or(true, |to| to == *address)
                {
                    ext.inbox.push(tx.from, tx.bytes.clone());
                }
            }
        }
    }

    fn apply(&mut self, address: MacAddr, actions: Vec<Action>) {
        for action in actions {
            let station = self.station_mut(address);
            match action {
                Action::SetChannel(channel) => station.channel = channel,
                Action::RegisterPeer(peer) => {
                    station.registered.insert(peer);
                }
                Action::Send(to, bytes) => {
                    assert!(
                        station.registered.contains(&to),
                        "{address} sent to unregistered peer {to}"
                    );
                    self.transmit(address, Some(to), bytes);
                }
                Action::Broadcast(bytes) => self.transmit(address, None, bytes),
                Action::WriteFile { path, bytes } => {
                    station.writes += 1;
                    station.files.insert(path, bytes);
                }
                Action::Deliver { from, payload } => station.delivered.push((from, payload)),
                Action::Notify(event) => station.events.push(event),
                Action::Reboot => {
                    station.reboots += 1;
                    station.core = LinkCore::new(address, station.config.clone());
                    station.registered.clear();
                    // Back up: announce on the channel it was on.
                    self.transmit(address, None, Opcode::Boot.to_be_bytes().to_vec());
                    return;
                }
            }
        }
    }
}

/// Results of core calls that carry actions.
pub trait IntoActions {
    fn actions(&self) -> Vec<Action>;
}

impl IntoActions for Vec<Action> {
    fn actions(&self) -> Vec<Action> {
        self.clone()
    }
}

impl<E> IntoActions for Result<Vec<Action>, E> {
    fn actions(&self) -> Vec<Action> {
        self.as_ref().map(Clone::clone).unwrap_or_default()
    }
}

/// `Radio` for a `Node` living on the simulated air.
pub struct SimRadio {
    address: MacAddr,
    air: Rc<RefCell<Air>>,
    clock: ManualClock,
    registered: HashSet<MacAddr>,
    pub channels: Vec<u8>,
    pub fail_sends: bool,
}

impl SimRadio {
    pub fn new(address: MacAddr, air: Rc<RefCell<Air>>, clock: ManualClock) -> Self {
        Self {
            address,
            air,
            clock,
            registered: HashSet::new(),
            channels: Vec::new(),
            fail_sends: false,
        }
    }
}

impl Radio for SimRadio {
    fn local_address(&self) -> MacAddr {
        self.address
    }

    fn set_channel(&mut self, channel: u8) -> Result<(), TransportError> {
        self.channels.push(channel);
        self.air
            .borrow_mut()
            .set_external_channel(self.address, channel);
        Ok(())
    }

    fn register_peer(&mut self, peer: MacAddr) -> Result<(), TransportError> {
        self.registered.insert(peer);
        Ok(())
    }

    fn send(&mut self, peer: MacAddr, frame: &[u8]) -> Result<(), TransportError> {
        if self.fail_sends {
            return Err(TransportError::Unavailable("radio switched off".into()));
        }
        if !self.registered.contains(&peer) {
            return Err(TransportError::NotRegistered(peer));
        }
        let mut air = self.air.borrow_mut();
        air.transmit(self.address, Some(peer), frame.to_vec());
        air.flush(self.clock.now());
        Ok(())
    }

    fn broadcast(&mut self, frame: &[u8]) -> Result<(), TransportError> {
        let mut air = self.air.borrow_mut();
        air.transmit(self.address, None, frame.to_vec());
        air.flush(self.clock.now());
        Ok(())
    }
}

/// Counts reboots instead of performing them.
#[derive(Clone, Default)]
pub struct RecordingSystem {
    pub reboots: Rc<Cell<usize>>,
}

impl System for RecordingSystem {
    fn reboot(&mut self) {
        self.reboots.set(self.reboots.get() + 1);
    }
}
