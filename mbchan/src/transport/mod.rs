//! Mailbox transport contract.
//!
//! The engine multiplexes channels over a packet-switched interconnect that
//! exposes numbered mailboxes on each local port. The hardware driver sits
//! behind [`MailboxTransport`]; the engine hands it pool buffers, submits
//! outbound datagrams, and reacts to its two completion callbacks. Callbacks
//! run on transport-owned threads and their handlers must not block; they
//! may only schedule downstream work.

pub mod loopback;

use crate::error::Result;
use crate::peer::PeerHandle;
use crate::types::{MboxId, PortId};
use std::sync::Arc;

/// Receiver side of the inbound-ready notification.
pub trait InboundEvents: Send + Sync {
    /// A filled inbound buffer is available on `mbox`. `slot` is the
    /// transport ring position that completed; the engine drains buffers by
    /// polling [`MailboxTransport::get_inbound`] rather than by slot.
    fn rx_ready(&self, port: PortId, mbox: MboxId, slot: usize);
}

/// Receiver side of the outbound-completion notification.
pub trait OutboundEvents: Send + Sync {
    /// An outbound transfer finished. `slot` is the transport ring position
    /// one past the most recently completed transfer; completions may be
    /// coalesced, in which case `slot` reflects only the latest one.
    fn tx_complete(&self, port: PortId, mbox: MboxId, slot: usize);
}

/// Contract the hardware mailbox driver provides to the engine.
pub trait MailboxTransport: Send + Sync {
    /// Reserve the outbound side of `mbox` on `port` with a ring of
    /// `ring_size` entries. `events` receives completion notifications
    /// until the mailbox is released.
    fn request_outbound(
        &self,
        port: PortId,
        mbox: MboxId,
        ring_size: usize,
        events: Arc<dyn OutboundEvents>,
    ) -> Result<()>;

    fn release_outbound(&self, port: PortId, mbox: MboxId);

    /// Reserve the inbound side of `mbox` on `port`.
    fn request_inbound(
        &self,
        port: PortId,
        mbox: MboxId,
        ring_size: usize,
        events: Arc<dyn InboundEvents>,
    ) -> Result<()>;

    fn release_inbound(&self, port: PortId, mbox: MboxId);

    /// Hand an empty pool buffer to the transport. Ownership passes to the
    /// transport until the buffer comes back through [`Self::get_inbound`].
    fn add_inbound_buffer(&self, port: PortId, mbox: MboxId, buf: Vec<u8>) -> Result<()>;

    /// Retrieve one filled inbound buffer, if any.
    fn get_inbound(&self, port: PortId, mbox: MboxId) -> Option<Vec<u8>>;

    /// Submit an outbound datagram to `peer`. The transport copies the
    /// payload internally; the caller keeps ownership of `buf`.
    fn submit_outbound(
        &self,
        port: PortId,
        peer: &PeerHandle,
        mbox: MboxId,
        buf: &[u8],
    ) -> Result<()>;

    /// Whether the port is still attached and running. Polled at the top of
    /// each dispatcher activation.
    fn is_port_running(&self, port: PortId) -> bool;
}
