//! Emulated air: radio frames carried in UDP multicast datagrams on the LAN.
//!
//! Datagram layout: `channel:1, src:6, dst:6, frame`. A destination of
//! ff:ff:ff:ff:ff:ff is a broadcast. Every host on the group sees every datagram;
//! the receive loop keeps only those on our channel addressed to us.

use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use radiolink_core::identity::MAC_LEN;
use radiolink_core::{InboxSender, MacAddr, Radio, TransportError, MAX_FRAME_LEN};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(239, 255, 60, 61);

/// Bytes in front of the frame.
pub const HEADER_LEN: usize = 1 + 2 * MAC_LEN;

/// One frame on the emulated air.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    pub channel: u8,
    pub src: MacAddr,
    pub dst: MacAddr,
    pub frame: Vec<u8>,
}

impl Datagram {
    /// Whether a host at `local` tuned to `channel` would hear this.
    pub fn is_for(&self, local: MacAddr, channel: u8) -> bool {
        self.channel == channel && self.src != local && (self.dst == local || self.dst.is_broadcast())
    }
}

pub fn encode_datagram(d: &Datagram) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + d.frame.len());
    out.push(d.channel);
    out.extend_from_slice(d.src.as_bytes());
    out.extend_from_slice(d.dst.as_bytes());
    out.extend_from_slice(&d.frame);
    out
}

/// Parse a datagram; `None` for anything too short or too long to be ours.
pub fn parse_datagram(buf: &[u8]) -> Option<Datagram> {
    if buf.len() <= HEADER_LEN || buf.len() > HEADER_LEN + MAX_FRAME_LEN {
        return None;
    }
    let mac_at = |at: usize| {
        let mut bytes = [0u8; MAC_LEN];
        bytes.copy_from_slice(&buf[at..at + MAC_LEN]);
        MacAddr::new(bytes)
    };
    Some(Datagram {
        channel: buf[0],
        src: mac_at(1),
        dst: mac_at(1 + MAC_LEN),
        frame: buf[HEADER_LEN..].to_vec(),
    })
}

/// `Radio` backed by the multicast group. Called from the node's blocking thread;
/// transmission happens on the runtime.
pub struct UdpRadio {
    local: MacAddr,
    channel: Arc<AtomicU8>,
    registered: HashSet<MacAddr>,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
}

/// Socket side of the air, started once the node's inbox exists.
pub struct AirLink {
    socket: Arc<UdpSocket>,
    dest: SocketAddr,
    local: MacAddr,
    channel: Arc<AtomicU8>,
    outbound: mpsc::UnboundedReceiver<Vec<u8>>,
}

/// Join the group on `port`. Must be called inside the runtime.
pub fn open(local: MacAddr, port: u16, channel: u8) -> std::io::Result<(UdpRadio, AirLink)> {
    let socket = Arc::new(make_multicast_socket(port)?);
    let channel = Arc::new(AtomicU8::new(channel));
    let (tx, rx) = mpsc::unbounded_channel();
    let radio = UdpRadio {
        local,
        channel: channel.clone(),
        registered: HashSet::new(),
        outbound: tx,
    };
    let link = AirLink {
        socket,
        dest: SocketAddr::V4(SocketAddrV4::new(MULTICAST_GROUP, port)),
        local,
        channel,
        outbound: rx,
    };
    Ok((radio, link))
}

fn make_multicast_socket(port: u16) -> std::io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    // Several daemons on one host share the air.
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port).into())?;
    socket.join_multicast_v4(&MULTICAST_GROUP, &Ipv4Addr::UNSPECIFIED)?;
    socket.set_multicast_ttl_v4(1)?;
    socket.set_multicast_loop_v4(true)?;
    UdpSocket::from_std(socket.into())
}

impl UdpRadio {
    fn transmit(&self, dst: MacAddr, frame: &[u8]) -> Result<(), TransportError> {
        let datagram = Datagram {
            channel: self.channel.load(Ordering::Relaxed),
            src: self.local,
            dst,
            frame: frame.to_vec(),
        };
        self.outbound
            .send(encode_datagram(&datagram))
            .map_err(|_| TransportError::Unavailable("air task stopped".into()))
    }
}

impl Radio for UdpRadio {
    fn local_address(&self) -> MacAddr {
        self.local
    }

    fn set_channel(&mut self, channel: u8) -> Result<(), TransportError> {
        let old = self.channel.swap(channel, Ordering::Relaxed);
        if old != channel {
            tracing::debug!(from = old, to = channel, "radio channel changed");
        }
        Ok(())
    }

    fn register_peer(&mut self, peer: MacAddr) -> Result<(), TransportError> {
        self.registered.insert(peer);
        Ok(())
    }

    fn send(&mut self, peer: MacAddr, frame: &[u8]) -> Result<(), TransportError> {
        if !self.registered.contains(&peer) {
            return Err(TransportError::NotRegistered(peer));
        }
        self.transmit(peer, frame)
    }

    fn broadcast(&mut self, frame: &[u8]) -> Result<(), TransportError> {
        self.transmit(MacAddr::BROADCAST, frame)
    }
}

/// Handles of the running air loops.
pub struct AirTasks {
    /// Finishes once every frame queued by the radio is sent and the radio is dropped.
    pub send: JoinHandle<()>,
    /// Runs until the socket fails.
    pub recv: JoinHandle<std::io::Result<()>>,
}

impl AirLink {
    /// Start the send and receive loops; received frames go to `inbox`.
    pub fn spawn(self, inbox: InboxSender) -> AirTasks {
        let AirLink {
            socket,
            dest,
            local,
            channel,
            outbound,
        } = self;
        let send = tokio::spawn(send_loop(socket.clone(), dest, outbound));
        let recv = tokio::spawn(recv_loop(socket, local, channel, inbox));
        AirTasks { send, recv }
    }
}

async fn send_loop(
    socket: Arc<UdpSocket>,
    dest: SocketAddr,
    mut outbound: mpsc::UnboundedReceiver<Vec<u8>>,
) {
    while let Some(datagram) = outbound.recv().await {
        if let Err(e) = socket.send_to(&datagram, dest).await {
            tracing::warn!(error = %e, "air send failed");
        }
    }
    tracing::debug!("radio dropped, air send loop done");
}

async fn recv_loop(
    socket: Arc<UdpSocket>,
    local: MacAddr,
    channel: Arc<AtomicU8>,
    inbox: InboxSender,
) -> std::io::Result<()> {
    let mut buf = vec![0u8; 2048];
    loop {
        let (n, from) = socket.recv_from(&mut buf).await?;
        let Some(datagram) = parse_datagram(&buf[..n]) else {
            tracing::trace!(%from, len = n, "ignoring foreign datagram");
            continue;
        };
        if !datagram.is_for(local, channel.load(Ordering::Relaxed)) {
            continue;
        }
        if !inbox.push(datagram.src, datagram.frame) {
            tracing::debug!(src = %datagram.src, "inbox full, frame dropped");
        }
    }
}
