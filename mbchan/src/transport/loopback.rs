//! In-process loopback fabric.
//!
//! Connects any number of virtual nodes through a single delivery thread so
//! that full cores can talk to each other without hardware. Datagrams are
//! copied on submit, delivered into the destination's inbound pool, and
//! completed back to the sender from the fabric thread, the same threading
//! shape a real mailbox driver presents. Used by the integration tests and
//! the `mbchand` smoke harness.
//!
//! Test hooks: a node can park outbound completions (`set_tx_hold`) and
//! release them one at a time (`release_held`) to exercise ring
//! backpressure, and can be stopped (`set_running`) to exercise port loss.

use crate::error::{Error, Result};
use crate::peer::{PeerCaps, PeerHandle};
use crate::transport::{InboundEvents, MailboxTransport, OutboundEvents};
use crate::types::{DestId, MboxId, PortId};
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use tracing::{debug, warn};

/// One queued datagram transfer between two nodes.
struct Transfer {
    src: DestId,
    src_port: PortId,
    src_mbox: MboxId,
    tx_slot: usize,
    ring_size: usize,
    dst: DestId,
    dst_mbox: MboxId,
    payload: Vec<u8>,
}

struct InboundReg {
    events: Arc<dyn InboundEvents>,
    pool: VecDeque<Vec<u8>>,
    filled: VecDeque<Vec<u8>>,
}

struct OutboundReg {
    events: Arc<dyn OutboundEvents>,
    ring_size: usize,
    next_slot: usize,
}

#[derive(Default)]
struct MailboxState {
    inbound: Option<InboundReg>,
    outbound: Option<OutboundReg>,
}

struct NodeShared {
    destid: DestId,
    port: PortId,
    handle: PeerHandle,
    running: AtomicBool,
    tx_hold: AtomicBool,
    mboxes: Mutex<HashMap<MboxId, MailboxState>>,
    held: Mutex<VecDeque<Transfer>>,
}

struct FabricInner {
    nodes: Mutex<HashMap<DestId, Arc<NodeShared>>>,
    events: Sender<Transfer>,
}

/// A loopback interconnect fabric.
pub struct LoopbackFabric {
    inner: Arc<FabricInner>,
}

impl LoopbackFabric {
    pub fn new() -> Self {
        let (tx, rx) = unbounded();
        let inner = Arc::new(FabricInner {
            nodes: Mutex::new(HashMap::new()),
            events: tx,
        });
        spawn_delivery_thread(rx, Arc::downgrade(&inner));
        LoopbackFabric { inner }
    }

    /// Attach a new node to the fabric. The node is one local port with one
    /// host destination ID; its transport view covers only that port.
    pub fn add_node(&self, destid: DestId, port: PortId) -> Arc<LoopbackNode> {
        let shared = Arc::new(NodeShared {
            destid,
            port,
            handle: PeerHandle::new(destid, PeerCaps::DATA_MSG),
            running: AtomicBool::new(true),
            tx_hold: AtomicBool::new(false),
            mboxes: Mutex::new(HashMap::new()),
            held: Mutex::new(VecDeque::new()),
        });
        self.inner.nodes.lock().insert(destid, shared.clone());
        Arc::new(LoopbackNode {
            fabric: self.inner.clone(),
            shared,
        })
    }
}

impl Default for LoopbackFabric {
    fn default() -> Self {
        Self::new()
    }
}

fn spawn_delivery_thread(rx: Receiver<Transfer>, fabric: Weak<FabricInner>) {
    thread::Builder::new()
        .name("loopback-fabric".into())
        .spawn(move || {
            while let Ok(transfer) = rx.recv() {
                let Some(fabric) = fabric.upgrade() else { break };
                deliver(&fabric, &transfer);
                complete(&fabric, &transfer);
            }
            debug!("loopback fabric thread exiting");
        })
        .expect("spawn loopback fabric thread");
}

/// Copy the payload into the destination's pool and signal rx-ready.
fn deliver(fabric: &FabricInner, t: &Transfer) {
    let dst = fabric.nodes.lock().get(&t.dst).cloned();
    let Some(dst) = dst else {
        warn!(destid = t.dst, "dropping datagram for unknown node");
        return;
    };
    if !dst.running.load(Ordering::Acquire) {
        debug!(destid = t.dst, "dropping datagram for stopped node");
        return;
    }

    let (events, slot) = {
        let mut mboxes = dst.mboxes.lock();
        let Some(inbound) = mboxes
            .get_mut(&t.dst_mbox)
            .and_then(|m| m.inbound.as_mut())
        else {
            debug!(
                destid = t.dst,
                mbox = t.dst_mbox,
                "dropping datagram for unregistered mailbox"
            );
            return;
        };
        if inbound.pool.pop_front().is_none() {
            warn!(destid = t.dst, "inbound pool empty, datagram dropped");
            return;
        }
        inbound.filled.push_back(t.payload.clone());
        (inbound.events.clone(), inbound.filled.len() - 1)
    };
    events.rx_ready(dst.port, t.dst_mbox, slot);
}

/// Signal the sender's completion callback.
fn complete(fabric: &FabricInner, t: &Transfer) {
    let src = fabric.nodes.lock().get(&t.src).cloned();
    let Some(src) = src else { return };
    let events = {
        let mboxes = src.mboxes.lock();
        mboxes
            .get(&t.src_mbox)
            .and_then(|m| m.outbound.as_ref())
            .map(|o| o.events.clone())
    };
    if let Some(events) = events {
        events.tx_complete(t.src_port, t.src_mbox, (t.tx_slot + 1) % t.ring_size);
    }
}

/// One node's transport endpoint on the fabric.
pub struct LoopbackNode {
    fabric: Arc<FabricInner>,
    shared: Arc<NodeShared>,
}

impl LoopbackNode {
    pub fn destid(&self) -> DestId {
        self.shared.destid
    }

    pub fn port(&self) -> PortId {
        self.shared.port
    }

    /// Handle other nodes use to address this one. Clones share identity,
    /// so the same handle can be added to and removed from a peer list.
    pub fn peer_handle(&self) -> PeerHandle {
        self.shared.handle.clone()
    }

    /// Start or stop the node. A stopped node drops inbound datagrams and
    /// reports `is_port_running() == false`.
    pub fn set_running(&self, running: bool) {
        self.shared.running.store(running, Ordering::Release);
    }

    /// Park outbound transfers instead of delivering them, so tests can
    /// keep the sender's ring full.
    pub fn set_tx_hold(&self, hold: bool) {
        self.shared.tx_hold.store(hold, Ordering::Release);
    }

    /// Release up to `n` parked transfers in submission order. Returns how
    /// many were released.
    pub fn release_held(&self, n: usize) -> usize {
        let mut held = self.shared.held.lock();
        let mut released = 0;
        while released < n {
            let Some(t) = held.pop_front() else { break };
            let _ = self.fabric.events.send(t);
            released += 1;
        }
        released
    }

    pub fn held_len(&self) -> usize {
        self.shared.held.lock().len()
    }
}

impl MailboxTransport for LoopbackNode {
    fn request_outbound(
        &self,
        port: PortId,
        mbox: MboxId,
        ring_size: usize,
        events: Arc<dyn OutboundEvents>,
    ) -> Result<()> {
        if port != self.shared.port {
            return Err(Error::NotFound);
        }
        let mut mboxes = self.shared.mboxes.lock();
        let state = mboxes.entry(mbox).or_default();
        if state.outbound.is_some() {
            return Err(Error::Busy);
        }
        state.outbound = Some(OutboundReg {
            events,
            ring_size,
            next_slot: 0,
        });
        Ok(())
    }

    fn release_outbound(&self, port: PortId, mbox: MboxId) {
        if port != self.shared.port {
            return;
        }
        if let Some(state) = self.shared.mboxes.lock().get_mut(&mbox) {
            state.outbound = None;
        }
    }

    fn request_inbound(
        &self,
        port: PortId,
        mbox: MboxId,
        _ring_size: usize,
        events: Arc<dyn InboundEvents>,
    ) -> Result<()> {
        if port != self.shared.port {
            return Err(Error::NotFound);
        }
        let mut mboxes = self.shared.mboxes.lock();
        let state = mboxes.entry(mbox).or_default();
        if state.inbound.is_some() {
            return Err(Error::Busy);
        }
        state.inbound = Some(InboundReg {
            events,
            pool: VecDeque::new(),
            filled: VecDeque::new(),
        });
        Ok(())
    }

    fn release_inbound(&self, port: PortId, mbox: MboxId) {
        if port != self.shared.port {
            return;
        }
        if let Some(state) = self.shared.mboxes.lock().get_mut(&mbox) {
            state.inbound = None;
        }
    }

    fn add_inbound_buffer(&self, port: PortId, mbox: MboxId, buf: Vec<u8>) -> Result<()> {
        if port != self.shared.port {
            return Err(Error::NotFound);
        }
        let mut mboxes = self.shared.mboxes.lock();
        let inbound = mboxes
            .get_mut(&mbox)
            .and_then(|m| m.inbound.as_mut())
            .ok_or(Error::NoDevice)?;
        inbound.pool.push_back(buf);
        Ok(())
    }

    fn get_inbound(&self, port: PortId, mbox: MboxId) -> Option<Vec<u8>> {
        if port != self.shared.port {
            return None;
        }
        let mut mboxes = self.shared.mboxes.lock();
        mboxes
            .get_mut(&mbox)
            .and_then(|m| m.inbound.as_mut())
            .and_then(|i| i.filled.pop_front())
    }

    fn submit_outbound(
        &self,
        port: PortId,
        peer: &PeerHandle,
        mbox: MboxId,
        buf: &[u8],
    ) -> Result<()> {
        if port != self.shared.port {
            return Err(Error::NotFound);
        }
        if !self.shared.running.load(Ordering::Acquire) {
            return Err(Error::NoDevice);
        }

        let transfer = {
            let mut mboxes = self.shared.mboxes.lock();
            let outbound = mboxes
                .get_mut(&mbox)
                .and_then(|m| m.outbound.as_mut())
                .ok_or(Error::NoDevice)?;
            let slot = outbound.next_slot;
            outbound.next_slot = (slot + 1) % outbound.ring_size;
            Transfer {
                src: self.shared.destid,
                src_port: port,
                src_mbox: mbox,
                tx_slot: slot,
                ring_size: outbound.ring_size,
                dst: peer.destid(),
                dst_mbox: mbox,
                payload: buf.to_vec(),
            }
        };

        if self.shared.tx_hold.load(Ordering::Acquire) {
            self.shared.held.lock().push_back(transfer);
        } else {
            let _ = self.fabric.events.send(transfer);
        }
        Ok(())
    }

    fn is_port_running(&self, port: PortId) -> bool {
        port == self.shared.port && self.shared.running.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    struct Recorder {
        rx_ready: Mutex<Vec<usize>>,
        tx_done: Mutex<Vec<usize>>,
    }

    impl Recorder {
        fn new() -> Arc<Self> {
            Arc::new(Recorder {
                rx_ready: Mutex::new(Vec::new()),
                tx_done: Mutex::new(Vec::new()),
            })
        }
    }

    impl InboundEvents for Recorder {
        fn rx_ready(&self, _port: PortId, _mbox: MboxId, slot: usize) {
            self.rx_ready.lock().push(slot);
        }
    }

    impl OutboundEvents for Recorder {
        fn tx_complete(&self, _port: PortId, _mbox: MboxId, slot: usize) {
            self.tx_done.lock().push(slot);
        }
    }

    fn wait_until(mut cond: impl FnMut() -> bool) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            thread::sleep(Duration::from_millis(5));
        }
        panic!("condition not reached");
    }

    #[test]
    fn test_datagram_delivery_and_completion() {
        let fabric = LoopbackFabric::new();
        let a = fabric.add_node(0x01, 0);
        let b = fabric.add_node(0x02, 0);

        let a_rec = Recorder::new();
        let b_rec = Recorder::new();
        a.request_outbound(0, 1, 8, a_rec.clone()).unwrap();
        b.request_inbound(0, 1, 8, b_rec.clone()).unwrap();
        b.add_inbound_buffer(0, 1, vec![0u8; 64]).unwrap();

        a.submit_outbound(0, &b.peer_handle(), 1, b"hello").unwrap();

        wait_until(|| !b_rec.rx_ready.lock().is_empty());
        assert_eq!(b.get_inbound(0, 1).unwrap(), b"hello");

        wait_until(|| !a_rec.tx_done.lock().is_empty());
        assert_eq!(a_rec.tx_done.lock()[0], 1);
    }

    #[test]
    fn test_no_pool_buffer_drops_datagram() {
        let fabric = LoopbackFabric::new();
        let a = fabric.add_node(0x01, 0);
        let b = fabric.add_node(0x02, 0);

        let a_rec = Recorder::new();
        let b_rec = Recorder::new();
        a.request_outbound(0, 1, 8, a_rec.clone()).unwrap();
        b.request_inbound(0, 1, 8, b_rec).unwrap();

        a.submit_outbound(0, &b.peer_handle(), 1, b"lost").unwrap();

        // Sender still completes even though the receiver had no buffer.
        wait_until(|| !a_rec.tx_done.lock().is_empty());
        assert!(b.get_inbound(0, 1).is_none());
    }

    #[test]
    fn test_tx_hold_parks_transfers() {
        let fabric = LoopbackFabric::new();
        let a = fabric.add_node(0x01, 0);
        let b = fabric.add_node(0x02, 0);

        let a_rec = Recorder::new();
        let b_rec = Recorder::new();
        a.request_outbound(0, 1, 8, a_rec.clone()).unwrap();
        b.request_inbound(0, 1, 8, b_rec.clone()).unwrap();
        for _ in 0..2 {
            b.add_inbound_buffer(0, 1, vec![0u8; 64]).unwrap();
        }

        a.set_tx_hold(true);
        a.submit_outbound(0, &b.peer_handle(), 1, b"one").unwrap();
        a.submit_outbound(0, &b.peer_handle(), 1, b"two").unwrap();
        assert_eq!(a.held_len(), 2);
        assert!(a_rec.tx_done.lock().is_empty());

        assert_eq!(a.release_held(1), 1);
        wait_until(|| !a_rec.tx_done.lock().is_empty());
        assert_eq!(b.get_inbound(0, 1).unwrap(), b"one");
        assert_eq!(a.held_len(), 1);
    }

    #[test]
    fn test_stopped_node_rejects_submit() {
        let fabric = LoopbackFabric::new();
        let a = fabric.add_node(0x01, 0);
        let b = fabric.add_node(0x02, 0);
        let a_rec = Recorder::new();
        a.request_outbound(0, 1, 8, a_rec).unwrap();

        a.set_running(false);
        assert!(!a.is_port_running(0));
        assert_eq!(
            a.submit_outbound(0, &b.peer_handle(), 1, b"x"),
            Err(Error::NoDevice)
        );
    }
}
