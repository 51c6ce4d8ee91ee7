//! Shared identifier types used across the engine.

/// Network-level identity of an endpoint node.
pub type DestId = u32;

/// Local channel number carried in the wire header.
pub type ChanId = u16;

/// Local port (hardware attachment) identifier.
pub type PortId = u8;

/// Mailbox number on a local port.
pub type MboxId = u8;

/// Opaque token identifying the owner of a channel. Set by the adaptor
/// layer so it can reclaim channels when an owner goes away.
pub type OwnerToken = u64;
