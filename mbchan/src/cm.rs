//! Channel-manager core: lifecycle events and the caller-facing operations.
//!
//! `CmCore` ties the pieces together: the transport handle, the channel
//! registry, the port list, and the serialized control worker. The external
//! enumeration layer drives it with `add_port`/`remove_port` and
//! `add_peer`/`remove_peer`; the adaptor layer calls the channel operations
//! (`channel_create` through `channel_release_rx`).
//!
//! Lock order, top-down: port list rwlock → registry mutex → channel mutex
//! → TX ring mutex. No thread takes two channel mutexes at once.

use crate::channel::{Channel, ChannelState, CLOSE_DESTROY_TIMEOUT};
use crate::config::CmConfig;
use crate::control::ControlWorker;
use crate::error::{Error, Result};
use crate::peer::PeerHandle;
use crate::port::PortCtx;
use crate::registry::ChannelRegistry;
use crate::transport::MailboxTransport;
use crate::types::{ChanId, DestId, OwnerToken, PortId};
use crate::wire::{ChanOp, MsgHeader, PacketType, HDR_LEN, MAX_MSG_SIZE};
use bytes::Bytes;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// State shared between the core handle, the dispatchers and the control
/// worker.
pub(crate) struct CoreShared {
    pub config: Arc<CmConfig>,
    pub transport: Arc<dyn MailboxTransport>,
    pub registry: ChannelRegistry,
    pub ports: RwLock<Vec<Arc<PortCtx>>>,
    pub control: ControlWorker,
    /// Set once at shutdown; blocked waiters observe it and bail out with
    /// `Interrupted`.
    pub interrupt: Arc<AtomicBool>,
}

impl CoreShared {
    /// Inbound data path: hand a message to the target channel's ring.
    pub fn rx_data(&self, ch_id: ChanId, data: Bytes) {
        let Some(ch) = self.registry.get(ch_id) else {
            debug!(ch = ch_id, "data message for unknown channel dropped");
            return;
        };
        // Drop reasons are logged by the channel; never fatal.
        let _ = ch.push_rx(data);
    }
}

/// The channel-manager core.
///
/// Owns its worker threads; dropping the core interrupts blocked waiters,
/// tears down every port and stops the control worker.
pub struct CmCore {
    shared: Arc<CoreShared>,
}

impl CmCore {
    /// Build a core on top of a mailbox transport.
    ///
    /// # Errors
    /// `Invalid` when the configuration fails validation.
    pub fn new(config: CmConfig, transport: Arc<dyn MailboxTransport>) -> Result<Self> {
        if let Err(reason) = config.validate() {
            error!(%reason, "invalid channel-manager configuration");
            return Err(Error::Invalid);
        }
        let chan_start = config.chan_start;
        let shared = Arc::new_cyclic(|weak: &Weak<CoreShared>| CoreShared {
            config: Arc::new(config),
            transport,
            registry: ChannelRegistry::new(chan_start),
            ports: RwLock::new(Vec::new()),
            control: ControlWorker::spawn(weak.clone()),
            interrupt: Arc::new(AtomicBool::new(false)),
        });
        Ok(CmCore { shared })
    }

    // ------------------------------------------------------------------
    // Lifecycle events
    // ------------------------------------------------------------------

    /// Attach a local port: reserve both sides of the configured mailbox
    /// and start its dispatcher.
    ///
    /// # Errors
    /// Failure to acquire either mailbox is fatal for the port; anything
    /// acquired so far is released again.
    pub fn add_port(&self, port: PortId, host_destid: DestId) -> Result<()> {
        let sh = &self.shared;
        if sh.ports.read().iter().any(|p| p.id() == port) {
            return Err(Error::Busy);
        }

        let cfg = &sh.config;
        let (ctx, signals) = PortCtx::new(port, host_destid, cfg, sh.transport.clone());

        let events: Arc<PortCtx> = ctx.clone();
        if let Err(e) =
            sh.transport
                .request_outbound(port, cfg.mbox, cfg.tx_ring_size, events.clone())
        {
            error!(port, mbox = cfg.mbox, "failed to acquire outbound mailbox");
            return Err(e);
        }
        if let Err(e) = sh
            .transport
            .request_inbound(port, cfg.mbox, cfg.rx_ring_size, events)
        {
            error!(port, mbox = cfg.mbox, "failed to acquire inbound mailbox");
            sh.transport.release_outbound(port, cfg.mbox);
            return Err(e);
        }

        ctx.rx_fill(cfg.rx_ring_size);
        PortCtx::start_dispatcher(&ctx, signals, Arc::downgrade(sh));
        sh.ports.write().push(ctx);
        info!(port, host_destid, "port added");
        Ok(())
    }

    /// Detach a local port: quiesce its tasks, close every channel bound to
    /// it, release the mailboxes.
    pub fn remove_port(&self, port: PortId) -> Result<()> {
        let sh = &self.shared;
        let ctx = {
            let mut ports = sh.ports.write();
            let idx = ports
                .iter()
                .position(|p| p.id() == port)
                .ok_or(Error::NotFound)?;
            ports.remove(idx)
        };

        ctx.quiesce();
        sh.control.flush();

        let victims = sh
            .registry
            .sweep(|ch| ch.lock().port.as_ref().is_some_and(|p| Arc::ptr_eq(p, &ctx)));
        for ch in victims {
            debug!(port, ch = ch.id(), "dropping channel with removed port");
            let _ = close_channel(ch);
        }

        sh.transport.release_inbound(port, sh.config.mbox);
        sh.transport.release_outbound(port, sh.config.mbox);
        ctx.tx_shutdown();
        info!(port, "port removed");
        Ok(())
    }

    /// Admit a discovered peer onto a port's peer list. Peers that do not
    /// advertise data messaging in both directions are ignored.
    pub fn add_peer(&self, port: PortId, peer: PeerHandle) -> Result<()> {
        if !peer.cm_capable() {
            debug!(destid = peer.destid(), "peer without data messaging ignored");
            return Ok(());
        }
        let ports = self.shared.ports.read();
        let ctx = ports
            .iter()
            .find(|p| p.id() == port)
            .ok_or(Error::NotFound)?;
        ctx.add_peer(peer);
        Ok(())
    }

    /// Drop a peer and close every channel attached to it. Channels move
    /// through `Disconnect` unless the device was already marked shut down.
    pub fn remove_peer(&self, port: PortId, peer: &PeerHandle) -> Result<()> {
        if !peer.cm_capable() {
            return Ok(());
        }
        let removed = {
            let ports = self.shared.ports.read();
            let ctx = ports
                .iter()
                .find(|p| p.id() == port)
                .ok_or(Error::NotFound)?;
            ctx.remove_peer(peer)
        };
        if !removed {
            return Ok(());
        }
        debug!(port, destid = peer.destid(), "peer removed");

        let shutdown = peer.is_shutdown();
        let victims = self
            .shared
            .registry
            .sweep(|ch| ch.lock().peer.as_ref().is_some_and(|p| p.same_device(peer)));
        for ch in victims {
            debug!(ch = ch.id(), "dropping channel with removed peer");
            if !shutdown {
                // The device may still be reachable: notify it, then record
                // the disconnect so late receivers see a reset. A device
                // already marked shut down skips the transition and lets the
                // close path make the (likely futile) send attempt.
                if ch.comp(ChannelState::Connected) {
                    let _ = ch.send_close();
                }
                ch.mark_disconnected();
            }
            let _ = close_channel(ch);
        }
        Ok(())
    }

    /// System shutdown notice: tell every connected remote end we are going
    /// away. No local state changes.
    pub fn shutdown_notice(&self) {
        self.shared.registry.for_each(|ch| {
            if ch.comp(ChannelState::Connected) {
                debug!(ch = ch.id(), "sending close notification at shutdown");
                let _ = ch.send_close();
            }
        });
    }

    /// Full teardown: interrupt waiters, remove every port, stop the
    /// control worker. Runs at most once; `Drop` calls it too.
    pub fn shutdown(&self) {
        if self.shared.interrupt.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("channel-manager core shutting down");
        self.shared.registry.for_each(|ch| ch.wake_all());
        let ports: Vec<PortId> = self.shared.ports.read().iter().map(|p| p.id()).collect();
        for port in ports {
            let _ = self.remove_port(port);
        }
        self.shared.control.stop();
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// Number of peers known on `port`.
    pub fn ep_list_size(&self, port: PortId) -> Result<usize> {
        let ports = self.shared.ports.read();
        let ctx = ports
            .iter()
            .find(|p| p.id() == port)
            .ok_or(Error::NotFound)?;
        Ok(ctx.npeers())
    }

    /// Destination IDs of up to `max` peers known on `port`.
    pub fn ep_list(&self, port: PortId, max: usize) -> Result<Vec<DestId>> {
        let ports = self.shared.ports.read();
        let ctx = ports
            .iter()
            .find(|p| p.id() == port)
            .ok_or(Error::NotFound)?;
        Ok(ctx.peer_destids(max))
    }

    /// Up to `max` attached ports as `(port, host destination ID)` pairs.
    pub fn port_list(&self, max: usize) -> Vec<(PortId, DestId)> {
        self.shared
            .ports
            .read()
            .iter()
            .take(max)
            .map(|p| (p.id(), p.host_destid()))
            .collect()
    }

    /// Current state of a published channel, if any.
    pub fn channel_state(&self, id: ChanId) -> Option<ChannelState> {
        self.shared.registry.get(id).map(|ch| ch.state())
    }

    /// Context cookie recorded when the channel was bound.
    pub fn channel_context(&self, id: ChanId) -> Option<u64> {
        self.shared.registry.get(id).and_then(|ch| ch.lock().context)
    }

    // ------------------------------------------------------------------
    // Channel operations
    // ------------------------------------------------------------------

    /// Create a channel. `requested == 0` draws from the dynamic range;
    /// a nonzero ID is reserved exactly.
    ///
    /// # Errors
    /// `Busy` when the ID is taken or the dynamic range is exhausted.
    pub fn channel_create(&self, requested: ChanId, owner: Option<OwnerToken>) -> Result<ChanId> {
        let rx_capacity = self.shared.config.rx_ring_size;
        let interrupt = self.shared.interrupt.clone();
        let ch = self
            .shared
            .registry
            .publish_new(requested, |id| Channel::new(id, rx_capacity, interrupt, owner))?;
        debug!(ch = ch.id(), "channel created");
        Ok(ch.id())
    }

    /// Close a channel by local request.
    ///
    /// Closing an ID that is no longer published succeeds without side
    /// effects.
    ///
    /// # Errors
    /// `Invalid` when `owner` does not match the channel's owner token;
    /// `Timeout`/`Interrupted` when destruction did not complete.
    pub fn channel_close(&self, id: ChanId, owner: Option<OwnerToken>) -> Result<()> {
        debug!(ch = id, "local close");
        match self.shared.registry.close_take(id, owner)? {
            Some(ch) => close_channel(ch),
            None => Ok(()),
        }
    }

    /// Bind an idle channel to a local port.
    pub fn channel_bind(&self, id: ChanId, port: PortId, context: Option<u64>) -> Result<()> {
        let ctx = {
            let ports = self.shared.ports.read();
            ports
                .iter()
                .find(|p| p.id() == port && p.is_running())
                .cloned()
                .ok_or(Error::NotFound)?
        };
        let ch = self.shared.registry.get(id).ok_or(Error::Invalid)?;

        let mut inner = ch.lock();
        if inner.state != ChannelState::Idle {
            return Err(Error::Invalid);
        }
        inner.loc_destid = ctx.host_destid();
        inner.port = Some(ctx);
        inner.context = context;
        inner.state = ChannelState::Bound;
        debug!(ch = id, port, "channel bound");
        Ok(())
    }

    /// Move a bound channel into the listen state.
    pub fn channel_listen(&self, id: ChanId) -> Result<()> {
        debug!(ch = id, "listen");
        let ch = self.shared.registry.get(id).ok_or(Error::Invalid)?;
        if ch.comp_exch(ChannelState::Bound, ChannelState::Listen) {
            Ok(())
        } else {
            Err(Error::Invalid)
        }
    }

    /// Accept one pending connection request on a listening channel,
    /// producing a new connected channel.
    ///
    /// `Some(Duration::ZERO)` makes the call non-blocking; `None` waits
    /// forever.
    ///
    /// # Errors
    /// `Again` when non-blocking and nothing is pending; `Canceled` when
    /// the channel left the listen state while waiting; `NotFound` when the
    /// requester is no longer a known peer.
    pub fn channel_accept(&self, id: ChanId, timeout: Option<Duration>) -> Result<ChanId> {
        let ch = self.shared.registry.get(id).ok_or(Error::Invalid)?;

        let (req, owner, loc_destid) = {
            let mut inner = ch.lock();
            if inner.state != ChannelState::Listen {
                return Err(Error::Invalid);
            }
            if inner.accept_queue.is_empty() {
                if timeout == Some(Duration::ZERO) {
                    return Err(Error::Again);
                }
                ch.wait_conn_req(&mut inner, timeout)?;
            }
            let Some(req) = inner.accept_queue.pop_front() else {
                return Err(Error::Again);
            };
            (req, inner.owner, inner.loc_destid)
        };

        // ID allocation takes the registry lock, so it happens outside the
        // channel critical section.
        let rx_capacity = self.shared.config.rx_ring_size;
        let interrupt = self.shared.interrupt.clone();
        let new_ch = match self
            .shared
            .registry
            .publish_new(0, |nid| Channel::new(nid, rx_capacity, interrupt, owner))
        {
            Ok(new_ch) => new_ch,
            Err(e) => {
                error!(err = %e, "no channel available for connection request");
                ch.lock().accept_queue.push_front(req);
                return Err(e);
            }
        };

        let Some(peer) = req.port.peer_by_destid(req.destid) else {
            // Requester disappeared from the peer list; ignore the request.
            debug!(destid = req.destid, "requesting device not found");
            self.shared.registry.take(new_ch.id());
            return Err(Error::NotFound);
        };

        {
            let mut inner = new_ch.lock();
            inner.loc_destid = loc_destid;
            inner.rem_destid = req.destid;
            inner.rem_channel = req.chan;
            inner.port = Some(req.port.clone());
            inner.peer = Some(peer);
            inner.state = ChannelState::Connected;
        }

        // A full ring parks the ack on the deferred queue; errors are
        // logged by the channel and do not fail the accept.
        let _ = new_ch.send_ack();

        debug!(parent = id, ch = new_ch.id(), destid = req.destid, "connection accepted");
        Ok(new_ch.id())
    }

    /// Connect an idle channel to `remote_ch` on the endpoint `rem_destid`
    /// reachable through `port`, waiting for the remote accept.
    ///
    /// # Errors
    /// `NotFound` for an unknown port, peer or channel; `Invalid` when the
    /// channel is not idle; `Timeout` when no answer arrived (the channel
    /// returns to idle); `Refused` when the answer was not an accept.
    pub fn channel_connect(
        &self,
        id: ChanId,
        port: PortId,
        rem_destid: DestId,
        rem_ch: ChanId,
    ) -> Result<()> {
        let (ctx, peer) = {
            let ports = self.shared.ports.read();
            let Some(ctx) = ports.iter().find(|p| p.id() == port) else {
                error!(port, "port not found");
                return Err(Error::NotFound);
            };
            let Some(peer) = ctx.peer_by_destid(rem_destid) else {
                error!(destid = rem_destid, "target endpoint not found");
                return Err(Error::NotFound);
            };
            (ctx.clone(), peer)
        };

        let ch = self.shared.registry.get(id).ok_or(Error::NotFound)?;
        if !ch.comp_exch(ChannelState::Idle, ChannelState::Connect) {
            return Err(Error::Invalid);
        }

        let mbox = ctx.mbox();
        let hdr = MsgHeader {
            src_destid: ctx.host_destid(),
            dst_destid: rem_destid,
            src_mbox: mbox,
            dst_mbox: mbox,
            packet_type: PacketType::Channel,
            ch_op: ChanOp::ConnReq,
            dst_ch: rem_ch,
            src_ch: id,
            msg_len: HDR_LEN as u16,
        };

        {
            let mut inner = ch.lock();
            inner.loc_destid = ctx.host_destid();
            inner.rem_destid = rem_destid;
            inner.rem_channel = rem_ch;
            inner.peer = Some(peer.clone());
            inner.port = Some(ctx.clone());
            inner.context = None;
        }

        // A full ring defers the request; anything else aborts the attempt.
        if let Err(e) = ctx.tx_submit(&peer, &hdr.to_bytes(), true) {
            if e != Error::Busy {
                ch.comp_exch(ChannelState::Connect, ChannelState::Idle);
                return Err(e);
            }
        }

        let mut inner = ch.lock();
        if inner.state == ChannelState::Connect {
            let timeout = self.shared.config.connect_timeout();
            if let Err(e) = ch.wait_connect_resp(&mut inner, timeout) {
                // No answer: make the channel usable again.
                if inner.state == ChannelState::Connect {
                    inner.state = ChannelState::Idle;
                }
                debug!(ch = id, err = %e, "connect did not complete");
                return Err(e);
            }
        }

        if inner.state == ChannelState::Connected {
            Ok(())
        } else {
            Err(Error::Refused)
        }
    }

    /// Send a data message on a connected channel.
    ///
    /// The first [`HDR_LEN`] bytes of `buf` are reserved header space and
    /// are overwritten; the payload follows. `buf.len()` is the total
    /// message length, header included, and must not exceed
    /// [`MAX_MSG_SIZE`].
    ///
    /// # Errors
    /// `Again` when the channel is not connected; `Busy` when the outbound
    /// ring is full (the caller keeps the buffer and retries).
    pub fn channel_send(&self, id: ChanId, buf: &mut [u8]) -> Result<()> {
        let len = buf.len();
        if id == 0 || len < HDR_LEN || len > MAX_MSG_SIZE {
            return Err(Error::Invalid);
        }

        let ch = self.shared.registry.get(id).ok_or(Error::NotFound)?;
        let (port, peer, hdr) = {
            let inner = ch.lock();
            if inner.state != ChannelState::Connected {
                return Err(Error::Again);
            }
            let port = inner.port.clone().ok_or(Error::NoDevice)?;
            let peer = inner.peer.clone().ok_or(Error::NoDevice)?;
            let mbox = port.mbox();
            let hdr = MsgHeader {
                src_destid: inner.loc_destid,
                dst_destid: inner.rem_destid,
                src_mbox: mbox,
                dst_mbox: mbox,
                packet_type: PacketType::Channel,
                ch_op: ChanOp::Data,
                dst_ch: inner.rem_channel,
                src_ch: id,
                msg_len: len as u16,
            };
            (port, peer, hdr)
        };

        let mut head = &mut buf[..HDR_LEN];
        hdr.write(&mut head);

        let res = port.tx_submit(&peer, buf, false);
        if let Err(e) = res {
            debug!(ch = id, err = %e, "data send failed");
        }
        res
    }

    /// Receive one message on a connected channel. The returned buffer is
    /// the full message, wire header included, and stays charged against
    /// the channel's in-use table until released.
    pub fn channel_receive(&self, id: ChanId, timeout: Option<Duration>) -> Result<Bytes> {
        if id == 0 {
            return Err(Error::Invalid);
        }
        let ch = self.shared.registry.get(id).ok_or(Error::NotFound)?;
        ch.receive(timeout)
    }

    /// Return a buffer obtained from [`CmCore::channel_receive`].
    ///
    /// # Errors
    /// `Invalid` when the buffer is not currently lent out (releasing twice
    /// is caught).
    pub fn channel_release_rx(&self, id: ChanId, buf: &Bytes) -> Result<()> {
        let ch = self.shared.registry.get(id).ok_or(Error::NotFound)?;
        ch.release_rx(buf)
    }

    /// Close every channel belonging to `owner`. The reclaim path the
    /// adaptor runs when an owner goes away without closing its channels.
    pub fn release_owner(&self, owner: OwnerToken) {
        let victims = self
            .shared
            .registry
            .sweep(|ch| ch.lock().owner == Some(owner));
        for ch in victims {
            debug!(ch = ch.id(), owner, "reclaiming channel from departed owner");
            let _ = close_channel(ch);
        }
    }
}

impl Drop for CmCore {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Destroy a channel that has already been unpublished.
///
/// Swaps the state to `Destroying`, notifies the remote end if the channel
/// was connected, wakes every waiter, releases the caller's reference and
/// waits for the destruction completion.
pub(crate) fn close_channel(ch: Arc<Channel>) -> Result<()> {
    let id = ch.id();
    let prior = ch.exch(ChannelState::Destroying);
    if prior == ChannelState::Connected {
        let _ = ch.send_close();
    }
    ch.wake_all();

    let destroyed = ch.destroyed_handle();
    let interrupt = ch.interrupt_handle();
    drop(ch);

    if destroyed.wait_timeout(CLOSE_DESTROY_TIMEOUT) {
        debug!(ch = id, "channel destroyed");
        Ok(())
    } else if interrupt.load(Ordering::Acquire) {
        Err(Error::Interrupted)
    } else {
        warn!(ch = id, "timed out waiting for channel destruction");
        Err(Error::Timeout)
    }
}
