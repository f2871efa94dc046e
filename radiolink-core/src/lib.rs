//! radiolink: single-hop peer protocol for channel-hopping packet radios.
//! Host-driven: no I/O in the core; host passes frames and receives actions.
//! [`node::Node`] performs those actions against host-supplied radio, storage and clock.

pub mod chunk;
pub mod command;
pub mod config;
pub mod core;
pub mod identity;
pub mod integrity;
pub mod node;
pub mod protocol;
pub mod registry;
pub mod scan;
pub mod transfer;
pub mod wire;

pub use crate::core::{Action, Event, LinkCore, LinkError};
pub use command::{AckOutcome, AckState};
pub use config::{Capability, LinkConfig, RetryPolicy};
pub use identity::MacAddr;
pub use node::{
    inbox, Clock, Inbox, InboxSender, ManualClock, MemoryStorage, Node, Radio, RawFrame, Storage,
    System, SystemClock, TransportError,
};
pub use protocol::{FileChunk, Frame, Opcode, MAX_FRAME_LEN};
pub use registry::{Peer, PeerRegistry};
pub use scan::{ScanOutcome, ScanTarget};
pub use transfer::{Progress, TransferOutcome, TransferReport};
pub use wire::{decode_frame, encode_frame, FrameDecodeError, FrameEncodeError};
