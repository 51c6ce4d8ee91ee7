//! Per-port context: inbound pool, outbound ring, peer list, RX dispatcher.
//!
//! One `PortCtx` exists per managed local port. It is registered with the
//! transport as the receiver of both mailbox callbacks: outbound completions
//! feed the TX engine, inbound readiness schedules the dispatcher. The
//! dispatcher is single-threaded per port, with at most one activation
//! running at a time, and drains the inbound mailbox in bounded bursts,
//! splitting
//! data from control traffic.

use crate::cm::CoreShared;
use crate::config::CmConfig;
use crate::control::ControlWork;
use crate::error::Result;
use crate::peer::PeerHandle;
use crate::transport::{InboundEvents, MailboxTransport, OutboundEvents};
use crate::tx::TxEngine;
use crate::types::{DestId, MboxId, PortId};
use crate::wire::{HeaderError, MsgHeader, PacketType, ChanOp, MAX_MSG_SIZE};
use bytes::Bytes;
use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use tracing::{debug, error, warn};

/// Messages drained per dispatcher activation before it yields.
pub(crate) const RX_BURST: usize = 8;

/// Credit counter for the inbound buffer pool. Buffers themselves are owned
/// by the transport once handed over; the pool tracks how many more it may
/// be given.
struct RxPool {
    free_slots: usize,
    capacity: usize,
}

pub(crate) struct PortCtx {
    id: PortId,
    host_destid: DestId,
    mbox: MboxId,
    transport: Arc<dyn MailboxTransport>,
    tx: TxEngine,
    rx_pool: Mutex<RxPool>,
    peers: RwLock<Vec<PeerHandle>>,
    schedule_tx: Sender<()>,
    stop: AtomicBool,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl PortCtx {
    /// Build the context. The returned receiver is the dispatcher's wakeup
    /// queue; hand it to [`PortCtx::start_dispatcher`] once the mailboxes
    /// are acquired.
    pub fn new(
        id: PortId,
        host_destid: DestId,
        config: &CmConfig,
        transport: Arc<dyn MailboxTransport>,
    ) -> (Arc<Self>, Receiver<()>) {
        // Capacity 1 makes scheduling idempotent: a second wakeup while one
        // is pending is a no-op.
        let (schedule_tx, schedule_rx) = bounded(1);
        let ctx = Arc::new(PortCtx {
            id,
            host_destid,
            mbox: config.mbox,
            transport: transport.clone(),
            tx: TxEngine::new(id, config.mbox, config.tx_ring_size, transport),
            rx_pool: Mutex::new(RxPool {
                free_slots: config.rx_ring_size,
                capacity: config.rx_ring_size,
            }),
            peers: RwLock::new(Vec::new()),
            schedule_tx,
            stop: AtomicBool::new(false),
            dispatcher: Mutex::new(None),
        });
        (ctx, schedule_rx)
    }

    pub fn id(&self) -> PortId {
        self.id
    }

    pub fn host_destid(&self) -> DestId {
        self.host_destid
    }

    pub fn mbox(&self) -> MboxId {
        self.mbox
    }

    pub fn is_running(&self) -> bool {
        self.transport.is_port_running(self.id)
    }

    pub fn tx_submit(&self, peer: &PeerHandle, buf: &[u8], control: bool) -> Result<()> {
        self.tx.submit(peer, buf, control)
    }

    pub fn tx_shutdown(&self) {
        self.tx.shutdown();
    }

    /// Wake the dispatcher. Idempotent while a wakeup is already pending.
    pub fn schedule(&self) {
        let _ = self.schedule_tx.try_send(());
    }

    /// Pull one filled buffer from the transport, crediting the pool.
    fn rx_get_msg(&self) -> Option<Vec<u8>> {
        let msg = self.transport.get_inbound(self.id, self.mbox)?;
        let mut pool = self.rx_pool.lock();
        if pool.free_slots < pool.capacity {
            pool.free_slots += 1;
        } else {
            warn!(port = self.id, "no pool record for inbound buffer");
        }
        Some(msg)
    }

    /// Hand up to `nent` fresh max-size buffers to the transport, bounded
    /// by the pool's free credit.
    pub fn rx_fill(&self, nent: usize) {
        let mut pool = self.rx_pool.lock();
        for _ in 0..nent {
            if pool.free_slots == 0 {
                break;
            }
            if let Err(e) = self
                .transport
                .add_inbound_buffer(self.id, self.mbox, vec![0u8; MAX_MSG_SIZE])
            {
                warn!(port = self.id, err = %e, "failed to post inbound buffer");
                break;
            }
            pool.free_slots -= 1;
        }
    }

    pub fn add_peer(&self, peer: PeerHandle) {
        debug!(port = self.id, destid = peer.destid(), "peer added");
        self.peers.write().push(peer);
    }

    /// Remove a peer by device identity. False if it was not listed.
    pub fn remove_peer(&self, peer: &PeerHandle) -> bool {
        let mut peers = self.peers.write();
        let before = peers.len();
        peers.retain(|p| !p.same_device(peer));
        before != peers.len()
    }

    pub fn peer_by_destid(&self, destid: DestId) -> Option<PeerHandle> {
        self.peers.read().iter().find(|p| p.destid() == destid).cloned()
    }

    pub fn npeers(&self) -> usize {
        self.peers.read().len()
    }

    pub fn peer_destids(&self, max: usize) -> Vec<DestId> {
        self.peers.read().iter().take(max).map(|p| p.destid()).collect()
    }

    /// Spawn the per-port RX dispatcher.
    pub fn start_dispatcher(this: &Arc<Self>, signals: Receiver<()>, core: Weak<CoreShared>) {
        let port = this.clone();
        let handle = thread::Builder::new()
            .name(format!("mbchan-rx{}", this.id))
            .spawn(move || dispatch_loop(port, core, signals))
            .expect("spawn rx dispatcher thread");
        *this.dispatcher.lock() = Some(handle);
    }

    /// Stop the dispatcher and wait for it to exit.
    pub fn quiesce(&self) {
        self.stop.store(true, Ordering::Release);
        let _ = self.schedule_tx.try_send(());
        if let Some(handle) = self.dispatcher.lock().take() {
            let _ = handle.join();
        }
    }

}

/// Classify one inbound message and route it: data straight to the target
/// channel's ring, control to the serialized worker.
fn route_inbound(port: &Arc<PortCtx>, core: &Arc<CoreShared>, data: Vec<u8>) {
    let hdr = match MsgHeader::parse(&data) {
        Ok(hdr) => hdr,
        Err(HeaderError::UnsupportedType(ty)) => {
            error!(port = port.id, ty, "unsupported packet type, message dropped");
            return;
        }
        Err(e) => {
            warn!(port = port.id, err = %e, "malformed message dropped");
            return;
        }
    };

    if hdr.packet_type != PacketType::Channel {
        error!(port = port.id, ty = hdr.packet_type as u8, "non-channel packet dropped");
        return;
    }

    if hdr.ch_op == ChanOp::Data {
        core.rx_data(hdr.dst_ch, Bytes::from(data));
    } else {
        core.control.submit(ControlWork {
            port: port.clone(),
            data,
        });
    }
}

impl OutboundEvents for PortCtx {
    fn tx_complete(&self, port: PortId, _mbox: MboxId, slot: usize) {
        if self.transport.is_port_running(port) {
            self.tx.complete(slot);
        }
    }
}

impl InboundEvents for PortCtx {
    fn rx_ready(&self, port: PortId, _mbox: MboxId, _slot: usize) {
        if self.transport.is_port_running(port) {
            self.schedule();
        }
    }
}

/// Dispatcher body: drain up to [`RX_BURST`] messages per activation, then
/// reschedule if the mailbox may still hold more.
fn dispatch_loop(port: Arc<PortCtx>, core: Weak<CoreShared>, signals: Receiver<()>) {
    while signals.recv().is_ok() {
        if port.stop.load(Ordering::Acquire) {
            break;
        }
        let Some(core) = core.upgrade() else { break };
        if !port.is_running() {
            continue;
        }

        let mut drained = 0;
        while drained < RX_BURST {
            let Some(data) = port.rx_get_msg() else { break };
            port.rx_fill(1);
            route_inbound(&port, &core, data);
            drained += 1;
        }

        if drained == RX_BURST {
            port.schedule();
        }
    }
    debug!(port = port.id, "rx dispatcher exiting");
}
