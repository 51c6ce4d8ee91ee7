//! Outbound ring and deferred-send queue.
//!
//! Each port owns one bounded outbound ring tracking transfers the transport
//! has accepted but not yet completed. The handshake protocol has no
//! retransmission, so control messages must not be lost to transient ring
//! pressure: when the ring is full a control submission is copied onto the
//! deferred queue and drained, FIFO, by the completion callback. Data
//! messages get `Busy` instead: the caller owns the buffer and retries.
//!
//! The ring lock is taken from both caller threads and the transport's
//! completion context; nothing blocks while holding it.

use crate::error::{Error, Result};
use crate::peer::PeerHandle;
use crate::transport::MailboxTransport;
use crate::types::{MboxId, PortId};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Deferred outbound request. Owns its payload until the transport accepts
/// the transfer.
struct TxReq {
    peer: PeerHandle,
    payload: Vec<u8>,
}

struct TxState {
    /// Occupancy of the transport ring: exactly the slots in
    /// `[ack, head)` mod capacity are marked.
    slots: Box<[bool]>,
    /// Next slot to claim.
    head: usize,
    /// Oldest unacknowledged slot.
    ack: usize,
    /// Outstanding transfers, always within `[0, capacity]`.
    count: usize,
    deferred: VecDeque<TxReq>,
    dead: bool,
}

pub(crate) struct TxEngine {
    state: Mutex<TxState>,
    capacity: usize,
    mask: usize,
    port: PortId,
    mbox: MboxId,
    transport: Arc<dyn MailboxTransport>,
}

impl TxEngine {
    /// `capacity` must be a power of two (enforced by config validation).
    pub fn new(
        port: PortId,
        mbox: MboxId,
        capacity: usize,
        transport: Arc<dyn MailboxTransport>,
    ) -> Self {
        TxEngine {
            state: Mutex::new(TxState {
                slots: vec![false; capacity].into_boxed_slice(),
                head: 0,
                ack: 0,
                count: 0,
                deferred: VecDeque::new(),
                dead: false,
            }),
            capacity,
            mask: capacity - 1,
            port,
            mbox,
            transport,
        }
    }

    /// Submit one outbound datagram.
    ///
    /// # Errors
    /// `NoDevice` after the owning port was torn down. `Busy` when the ring
    /// is full. A control request is then parked on the deferred queue
    /// (the buffer was copied), a data request is not.
    pub fn submit(&self, peer: &PeerHandle, buf: &[u8], control: bool) -> Result<()> {
        let mut st = self.state.lock();

        if st.dead {
            return Err(Error::NoDevice);
        }

        if st.count == self.capacity {
            if control {
                st.deferred.push_back(TxReq {
                    peer: peer.clone(),
                    payload: buf.to_vec(),
                });
            }
            debug!(port = self.port, "outbound ring full");
            return Err(Error::Busy);
        }

        let head = st.head;
        st.slots[head] = true;
        let res = self
            .transport
            .submit_outbound(self.port, peer, self.mbox, buf);
        st.count += 1;
        st.head = (head + 1) & self.mask;
        debug!(
            port = self.port,
            destid = peer.destid(),
            slot = head,
            outstanding = st.count,
            "outbound message submitted"
        );
        res
    }

    /// Completion notification from the transport. `slot` is the ring
    /// position one past the most recently completed transfer; completions
    /// may be coalesced, so everything from `ack` up to `slot` is retired
    /// (the whole ring when it was full and `slot` wrapped onto `ack`).
    pub fn complete(&self, slot: usize) {
        let mut st = self.state.lock();
        if st.dead {
            return;
        }

        let mut ack = st.ack;
        while st.count > 0 && (ack != slot || st.count == self.capacity) {
            st.slots[ack] = false;
            ack = (ack + 1) & self.mask;
            st.count -= 1;
        }
        st.ack = ack;

        if st.count > self.capacity {
            error!(port = self.port, count = st.count, "outbound count out of sync");
        }

        while st.count < self.capacity {
            let Some(req) = st.deferred.pop_front() else { break };
            let head = st.head;
            st.slots[head] = true;
            if let Err(e) =
                self.transport
                    .submit_outbound(self.port, &req.peer, self.mbox, &req.payload)
            {
                warn!(port = self.port, err = %e, "deferred send failed");
            }
            st.count += 1;
            st.head = (head + 1) & self.mask;
        }
    }

    /// Mark the ring dead and drop any deferred requests. Submissions after
    /// this return `NoDevice`.
    pub fn shutdown(&self) {
        let mut st = self.state.lock();
        st.dead = true;
        if !st.deferred.is_empty() {
            debug!(
                port = self.port,
                dropped = st.deferred.len(),
                "dropping deferred sends on teardown"
            );
        }
        st.deferred.clear();
    }

    #[cfg(test)]
    fn outstanding(&self) -> usize {
        self.state.lock().count
    }

    #[cfg(test)]
    fn deferred_len(&self) -> usize {
        self.state.lock().deferred.len()
    }
}
