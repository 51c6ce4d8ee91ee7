//! Remote peer endpoints.
//!
//! Peers are discovered by an external enumeration layer and pushed into the
//! engine through `add_peer`/`remove_peer` events. A peer is admitted onto a
//! port's peer list only if its capability words advertise data messaging in
//! both directions.

use crate::types::DestId;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Capability bit: the endpoint can source data messages.
pub const OPS_DATA_MSG: u32 = 1 << 2;

/// Capability words advertised by a discovered endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerCaps {
    pub src_ops: u32,
    pub dst_ops: u32,
}

impl PeerCaps {
    /// Capabilities of a fully data-message-capable endpoint.
    pub const DATA_MSG: PeerCaps = PeerCaps {
        src_ops: OPS_DATA_MSG,
        dst_ops: OPS_DATA_MSG,
    };

    /// True if the endpoint can both source and sink data messages.
    pub fn cm_capable(&self) -> bool {
        self.src_ops & OPS_DATA_MSG != 0 && self.dst_ops & OPS_DATA_MSG != 0
    }
}

struct PeerDevice {
    destid: DestId,
    caps: PeerCaps,
    shutdown: AtomicBool,
}

/// Cloneable handle to a remote peer device.
///
/// The handle is an identity: two clones of the same handle compare equal
/// under [`PeerHandle::same_device`], and that identity is what channel
/// teardown sweeps match on when a peer is removed.
#[derive(Clone)]
pub struct PeerHandle(Arc<PeerDevice>);

impl PeerHandle {
    pub fn new(destid: DestId, caps: PeerCaps) -> Self {
        PeerHandle(Arc::new(PeerDevice {
            destid,
            caps,
            shutdown: AtomicBool::new(false),
        }))
    }

    /// Destination ID of the remote endpoint.
    pub fn destid(&self) -> DestId {
        self.0.destid
    }

    /// True if the peer advertises data messaging in both directions.
    pub fn cm_capable(&self) -> bool {
        self.0.caps.cm_capable()
    }

    /// Mark the device as shut down. Channels attached to a shut-down peer
    /// are closed without a `Disconnect` transition when the peer is removed.
    pub fn mark_shutdown(&self) {
        self.0.shutdown.store(true, Ordering::Release);
    }

    pub fn is_shutdown(&self) -> bool {
        self.0.shutdown.load(Ordering::Acquire)
    }

    /// Identity comparison: true if both handles refer to the same device.
    pub fn same_device(&self, other: &PeerHandle) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for PeerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerHandle")
            .field("destid", &self.0.destid)
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capability_admission() {
        assert!(PeerHandle::new(1, PeerCaps::DATA_MSG).cm_capable());

        let src_only = PeerCaps {
            src_ops: OPS_DATA_MSG,
            dst_ops: 0,
        };
        assert!(!PeerHandle::new(1, src_only).cm_capable());

        let none = PeerCaps {
            src_ops: 0,
            dst_ops: 0,
        };
        assert!(!PeerHandle::new(1, none).cm_capable());
    }

    #[test]
    fn test_handle_identity() {
        let a = PeerHandle::new(7, PeerCaps::DATA_MSG);
        let b = a.clone();
        let c = PeerHandle::new(7, PeerCaps::DATA_MSG);
        assert!(a.same_device(&b));
        assert!(!a.same_device(&c));
    }
}
