//! # mbchan: channelized messaging over mailbox interconnects
//!
//! This crate multiplexes a single mailbox pair on each local port of a
//! packet-switched interconnect into thousands of independent bidirectional
//! channels, each a reliable in-order byte-message stream between a local
//! endpoint and a matching endpoint on a remote node. Connection setup and
//! teardown travel in-band as control datagrams on the same mailbox as the
//! data they manage.
//!
//! ## Architecture overview
//!
//! ```text
//! mbchan/
//! ├── wire       - fixed 20-byte header codec, network byte order
//! ├── transport  - mailbox driver contract (+ in-process loopback fabric)
//! ├── peer       - remote endpoint handles and capability admission
//! ├── channel    - per-channel state machine, receive ring, waiters
//! ├── registry   - process-wide channel-number map with sweeps
//! ├── tx         - bounded outbound ring with a deferred control queue
//! ├── port       - per-port context and the burst-draining RX dispatcher
//! ├── control    - serialized CONN_REQ/ACK/CLOSE worker
//! └── cm         - core lifecycle events and caller-facing operations
//! ```
//!
//! ## Design notes
//!
//! - **Threads and locks, no async.** Callers block on per-channel condition
//!   variables with timeouts; transport callbacks never block and only
//!   schedule downstream work (the per-port dispatcher, the control worker).
//! - **Bounded everywhere.** The outbound ring, the inbound pool and every
//!   receive ring are fixed-size; overflow drops data messages and defers
//!   control messages, because the handshake has no retransmission.
//! - **Reference-counted teardown.** Closing unpublishes the channel number
//!   first, then waits for the last reference to drop, so concurrent remote
//!   close, peer loss and port loss all funnel through one destruction path.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use mbchan::transport::loopback::LoopbackFabric;
//! use mbchan::{CmConfig, CmCore};
//!
//! let fabric = LoopbackFabric::new();
//! let node = fabric.add_node(0x01, 0);
//! let core = CmCore::new(CmConfig::default(), node.clone()).unwrap();
//! core.add_port(0, 0x01).unwrap();
//!
//! let ch = core.channel_create(0, None).unwrap();
//! core.channel_bind(ch, 0, None).unwrap();
//! core.channel_listen(ch).unwrap();
//! ```

mod channel;
mod cm;
pub mod config;
mod control;
pub mod error;
pub mod peer;
mod port;
mod registry;
pub mod transport;
mod tx;
pub mod types;
pub mod wire;

pub use channel::ChannelState;
pub use cm::CmCore;
pub use config::CmConfig;
pub use error::{Error, Result};
pub use peer::{PeerCaps, PeerHandle};
pub use wire::{HDR_LEN, MAX_MSG_SIZE};
