//! Channel objects and their state machine.
//!
//! A channel is one endpoint of a reliable in-order byte-message stream
//! multiplexed over a port's mailbox pair. It moves through
//! `Idle → Bound → Listen` on the accepting side and
//! `Idle → Connect → Connected` on the initiating side; both ends finish in
//! `Destroying` once closed locally, remotely, or by peer/port loss.
//!
//! One mutex guards all mutable channel state (state word, attachment,
//! accept queue, receive ring); one condvar serves every waiter. Only
//! caller threads block on the condvar; dispatcher and control-worker
//! contexts take the lock, mutate, wake, and leave. A one-shot completion
//! fires when the last reference drops, which is what the closing thread
//! waits on before reporting the channel gone.

use crate::error::{Error, Result};
use crate::peer::PeerHandle;
use crate::port::PortCtx;
use crate::types::{ChanId, DestId, OwnerToken};
use crate::wire::{ChanOp, MsgHeader, PacketType, HDR_LEN};
use bytes::Bytes;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error};

/// How long a closing thread waits for the last channel reference to drop.
pub(crate) const CLOSE_DESTROY_TIMEOUT: Duration = Duration::from_secs(3);

/// Channel lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Idle,
    Bound,
    Listen,
    Connect,
    Connected,
    Disconnect,
    Destroying,
}

/// A pending inbound connection request queued on a listening channel.
pub(crate) struct ConnReq {
    /// Requester destination ID.
    pub destid: DestId,
    /// Requester channel ID.
    pub chan: ChanId,
    /// Port the request arrived on.
    pub port: Arc<PortCtx>,
}

/// Bounded per-channel receive ring plus the table of buffers lent to the
/// consumer and awaiting release.
pub(crate) struct RxRing {
    slots: Box<[Option<Bytes>]>,
    head: usize,
    tail: usize,
    count: usize,
    inuse: Box<[Option<Bytes>]>,
    inuse_count: usize,
}

impl RxRing {
    fn new(capacity: usize) -> Self {
        RxRing {
            slots: vec![None; capacity].into_boxed_slice(),
            head: 0,
            tail: 0,
            count: 0,
            inuse: vec![None; capacity].into_boxed_slice(),
            inuse_count: 0,
        }
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn inuse_count(&self) -> usize {
        self.inuse_count
    }

    pub fn is_full(&self) -> bool {
        self.count == self.slots.len()
    }

    pub fn inuse_full(&self) -> bool {
        self.inuse_count == self.inuse.len()
    }

    fn enqueue(&mut self, buf: Bytes) {
        self.slots[self.head] = Some(buf);
        self.head = (self.head + 1) % self.slots.len();
        self.count += 1;
    }

    fn dequeue(&mut self) -> Option<Bytes> {
        if self.count == 0 {
            return None;
        }
        let buf = self.slots[self.tail].take();
        self.tail = (self.tail + 1) % self.slots.len();
        self.count -= 1;
        buf
    }

    /// Record a buffer as lent to the consumer. False if every tracking
    /// slot is taken.
    fn lend(&mut self, buf: Bytes) -> bool {
        for slot in self.inuse.iter_mut() {
            if slot.is_none() {
                *slot = Some(buf);
                self.inuse_count += 1;
                return true;
            }
        }
        false
    }

    /// Return a lent buffer. False if `buf` is not currently lent out.
    fn release(&mut self, buf: &Bytes) -> bool {
        for slot in self.inuse.iter_mut() {
            let matches = slot
                .as_ref()
                .is_some_and(|held| held.as_ref().as_ptr() == buf.as_ref().as_ptr());
            if matches {
                *slot = None;
                self.inuse_count -= 1;
                return true;
            }
        }
        false
    }
}

/// Mutable channel state, all guarded by the channel mutex.
pub(crate) struct ChannelInner {
    pub state: ChannelState,
    /// Sticky error reported to late receivers once the channel has left
    /// `Connected` involuntarily.
    pub last_error: Option<Error>,
    pub port: Option<Arc<PortCtx>>,
    pub peer: Option<PeerHandle>,
    pub loc_destid: DestId,
    pub rem_destid: DestId,
    pub rem_channel: ChanId,
    pub owner: Option<OwnerToken>,
    pub context: Option<u64>,
    pub accept_queue: VecDeque<ConnReq>,
    pub rx: RxRing,
}

pub(crate) struct Channel {
    id: ChanId,
    inner: Mutex<ChannelInner>,
    waiters: Condvar,
    destroyed: Arc<Completion>,
    interrupt: Arc<AtomicBool>,
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel").field("id", &self.id).finish()
    }
}

impl Channel {
    pub fn new(
        id: ChanId,
        rx_capacity: usize,
        interrupt: Arc<AtomicBool>,
        owner: Option<OwnerToken>,
    ) -> Self {
        Channel {
            id,
            inner: Mutex::new(ChannelInner {
                state: ChannelState::Idle,
                last_error: None,
                port: None,
                peer: None,
                loc_destid: 0,
                rem_destid: 0,
                rem_channel: 0,
                owner,
                context: None,
                accept_queue: VecDeque::new(),
                rx: RxRing::new(rx_capacity),
            }),
            waiters: Condvar::new(),
            destroyed: Arc::new(Completion::new()),
            interrupt,
        }
    }

    pub fn id(&self) -> ChanId {
        self.id
    }

    pub fn lock(&self) -> MutexGuard<'_, ChannelInner> {
        self.inner.lock()
    }

    pub fn state(&self) -> ChannelState {
        self.inner.lock().state
    }

    /// True if the channel is currently in `state`.
    pub fn comp(&self, state: ChannelState) -> bool {
        self.inner.lock().state == state
    }

    /// Compare-and-set the state. True if the transition happened.
    pub fn comp_exch(&self, from: ChannelState, to: ChannelState) -> bool {
        let mut inner = self.inner.lock();
        if inner.state == from {
            inner.state = to;
            true
        } else {
            false
        }
    }

    /// Unconditionally set the state, returning the previous one.
    pub fn exch(&self, to: ChannelState) -> ChannelState {
        let mut inner = self.inner.lock();
        std::mem::replace(&mut inner.state, to)
    }

    /// Involuntary disconnect: remote close or peer loss. Late receivers
    /// see `ConnReset` instead of a bare "not connected".
    pub fn mark_disconnected(&self) {
        let mut inner = self.inner.lock();
        inner.state = ChannelState::Disconnect;
        inner.last_error = Some(Error::ConnReset);
    }

    pub fn wake_one(&self) {
        self.waiters.notify_one();
    }

    pub fn wake_all(&self) {
        self.waiters.notify_all();
    }

    pub fn destroyed_handle(&self) -> Arc<Completion> {
        self.destroyed.clone()
    }

    pub fn interrupt_handle(&self) -> Arc<AtomicBool> {
        self.interrupt.clone()
    }

    pub fn interrupted(&self) -> bool {
        self.interrupt.load(Ordering::Acquire)
    }

    /// Queue an inbound data message on the receive ring.
    ///
    /// The buffer is dropped (never erroring the channel) when the channel
    /// is not connected or the ring is full.
    pub fn push_rx(&self, buf: Bytes) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.state != ChannelState::Connected {
            debug!(ch = self.id, state = ?inner.state, "data for channel in wrong state, dropped");
            return Err(Error::Io);
        }
        if inner.rx.is_full() {
            debug!(ch = self.id, "receive ring full, message dropped");
            return Err(Error::NoMemory);
        }
        inner.rx.enqueue(buf);
        drop(inner);
        self.waiters.notify_one();
        Ok(())
    }

    /// Dequeue one received message, waiting up to `timeout` when the ring
    /// is empty (`None` waits forever). The returned buffer counts against
    /// the in-use table until passed back through [`Channel::release_rx`].
    pub fn receive(&self, timeout: Option<Duration>) -> Result<Bytes> {
        let mut inner = self.inner.lock();
        if inner.state != ChannelState::Connected {
            return Err(inner.last_error.unwrap_or(Error::Again));
        }
        if inner.rx.inuse_full() {
            return Err(Error::NoMemory);
        }
        if inner.rx.count() == 0 {
            self.wait_rx_data(&mut inner, timeout)?;
        }
        let Some(msg) = inner.rx.dequeue() else {
            return Err(Error::Again);
        };
        if !inner.rx.lend(msg.clone()) {
            // Another consumer took the last tracking slot while we waited.
            debug!(ch = self.id, "no free in-use slot, message dropped");
            return Err(Error::NoMemory);
        }
        Ok(msg)
    }

    /// Release a buffer previously returned by [`Channel::receive`].
    pub fn release_rx(&self, buf: &Bytes) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.rx.release(buf) {
            Ok(())
        } else {
            Err(Error::Invalid)
        }
    }

    /// Wait until the remote end answered the connect request.
    ///
    /// Call with the channel lock held and the state already checked to be
    /// `Connect`. Returns once the state changed; the caller inspects it to
    /// tell acceptance from refusal.
    pub fn wait_connect_resp(
        &self,
        inner: &mut MutexGuard<'_, ChannelInner>,
        timeout: Duration,
    ) -> Result<()> {
        debug!(ch = self.id, "waiting for connect response");
        let deadline = Instant::now() + timeout;
        loop {
            if self.interrupted() {
                return Err(Error::Interrupted);
            }
            if inner.state != ChannelState::Connect {
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::Timeout);
            }
            self.waiters.wait_for(inner, deadline - now);
        }
    }

    /// Wait until a connection request is queued on this listening channel.
    pub fn wait_conn_req(
        &self,
        inner: &mut MutexGuard<'_, ChannelInner>,
        timeout: Option<Duration>,
    ) -> Result<()> {
        debug!(ch = self.id, "waiting for connect request");
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            if self.interrupted() {
                return Err(Error::Interrupted);
            }
            if !inner.accept_queue.is_empty() {
                return Ok(());
            }
            if inner.state != ChannelState::Listen {
                return Err(Error::Canceled);
            }
            self.wait_until(inner, deadline)?;
        }
    }

    /// Wait until a data message lands on the receive ring.
    fn wait_rx_data(
        &self,
        inner: &mut MutexGuard<'_, ChannelInner>,
        timeout: Option<Duration>,
    ) -> Result<()> {
        debug!(ch = self.id, "waiting for data");
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            if self.interrupted() {
                return Err(Error::Interrupted);
            }
            if inner.rx.count() > 0 {
                return Ok(());
            }
            if inner.state != ChannelState::Connected {
                return Err(Error::ConnReset);
            }
            self.wait_until(inner, deadline)?;
        }
    }

    /// One blocking step towards `deadline`. `Err(Timeout)` once it passed.
    fn wait_until(
        &self,
        inner: &mut MutexGuard<'_, ChannelInner>,
        deadline: Option<Instant>,
    ) -> Result<()> {
        match deadline {
            Some(deadline) => {
                let now = Instant::now();
                if now >= deadline {
                    return Err(Error::Timeout);
                }
                self.waiters.wait_for(inner, deadline - now);
            }
            None => self.waiters.wait(inner),
        }
        Ok(())
    }

    fn control_header(&self, inner: &ChannelInner, op: ChanOp) -> Result<(Arc<PortCtx>, PeerHandle, MsgHeader)> {
        let port = inner.port.clone().ok_or(Error::NoDevice)?;
        let peer = inner.peer.clone().ok_or(Error::NoDevice)?;
        let mbox = port.mbox();
        let hdr = MsgHeader {
            src_destid: inner.loc_destid,
            dst_destid: inner.rem_destid,
            src_mbox: mbox,
            dst_mbox: mbox,
            packet_type: PacketType::Channel,
            ch_op: op,
            dst_ch: inner.rem_channel,
            src_ch: self.id,
            msg_len: HDR_LEN as u16,
        };
        Ok((port, peer, hdr))
    }

    /// Acknowledge a connection request on a freshly accepted channel.
    ///
    /// A full outbound ring is not an error: the ack is parked on the
    /// deferred queue and leaves with the next completion.
    pub fn send_ack(&self) -> Result<()> {
        let (port, peer, hdr) = self.control_header(&self.inner.lock(), ChanOp::ConnAck)?;
        match port.tx_submit(&peer, &hdr.to_bytes(), true) {
            Ok(()) | Err(Error::Busy) => Ok(()),
            Err(e) => {
                error!(ch = self.id, err = %e, "failed to send connect ack");
                Err(e)
            }
        }
    }

    /// Notify the remote end that this channel is going away.
    pub fn send_close(&self) -> Result<()> {
        let (port, peer, hdr) = self.control_header(&self.inner.lock(), ChanOp::ConnClose)?;
        match port.tx_submit(&peer, &hdr.to_bytes(), true) {
            Ok(()) | Err(Error::Busy) => Ok(()),
            Err(e) => {
                error!(ch = self.id, err = %e, "failed to send close notification");
                Err(e)
            }
        }
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        debug!(
            ch = self.id,
            queued = inner.rx.count(),
            lent = inner.rx.inuse_count(),
            "channel resources released"
        );
        self.destroyed.complete();
    }
}

/// One-shot completion: signalled once, waited on with a timeout.
pub(crate) struct Completion {
    done: Mutex<bool>,
    cvar: Condvar,
}

impl Completion {
    fn new() -> Self {
        Completion {
            done: Mutex::new(false),
            cvar: Condvar::new(),
        }
    }

    pub fn complete(&self) {
        let mut done = self.done.lock();
        *done = true;
        self.cvar.notify_all();
    }

    /// True if the completion fired before `timeout` elapsed.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut done = self.done.lock();
        while !*done {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            self.cvar.wait_for(&mut done, deadline - now);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn connected_channel(rx_capacity: usize) -> Channel {
        let ch = Channel::new(100, rx_capacity, Arc::new(AtomicBool::new(false)), None);
        ch.lock().state = ChannelState::Connected;
        ch
    }

    fn msg(byte: u8) -> Bytes {
        Bytes::from(vec![byte; 32])
    }

    #[test]
    fn test_state_compare_exchange() {
        let ch = Channel::new(1, 4, Arc::new(AtomicBool::new(false)), None);
        assert!(ch.comp(ChannelState::Idle));
        assert!(ch.comp_exch(ChannelState::Idle, ChannelState::Connect));
        assert!(!ch.comp_exch(ChannelState::Idle, ChannelState::Connect));
        assert_eq!(ch.exch(ChannelState::Destroying), ChannelState::Connect);
    }

    #[test]
    fn test_push_drops_in_wrong_state() {
        let ch = Channel::new(1, 4, Arc::new(AtomicBool::new(false)), None);
        assert_eq!(ch.push_rx(msg(1)), Err(Error::Io));
    }

    #[test]
    fn test_ring_drops_when_full() {
        let ch = connected_channel(2);
        assert!(ch.push_rx(msg(1)).is_ok());
        assert!(ch.push_rx(msg(2)).is_ok());
        assert_eq!(ch.push_rx(msg(3)), Err(Error::NoMemory));
        // Still connected; the drop never errors the channel.
        assert!(ch.comp(ChannelState::Connected));
    }

    #[test]
    fn test_receive_and_release_cycle() {
        let ch = connected_channel(4);
        ch.push_rx(msg(7)).unwrap();

        let buf = ch.receive(Some(Duration::ZERO)).unwrap();
        assert_eq!(buf[0], 7);
        {
            let inner = ch.lock();
            assert_eq!(inner.rx.count(), 0);
            assert_eq!(inner.rx.inuse_count(), 1);
        }

        ch.release_rx(&buf).unwrap();
        assert_eq!(ch.lock().rx.inuse_count(), 0);
        // Exactly once: the second release is rejected.
        assert_eq!(ch.release_rx(&buf), Err(Error::Invalid));
    }

    #[test]
    fn test_receive_rejected_when_all_slots_lent() {
        let ch = connected_channel(2);
        ch.push_rx(msg(1)).unwrap();
        ch.push_rx(msg(2)).unwrap();
        let a = ch.receive(None).unwrap();
        let _b = ch.receive(None).unwrap();

        // Ring admission is bounded by the ring, not the in-use table.
        ch.push_rx(msg(3)).unwrap();
        assert_eq!(ch.receive(Some(Duration::ZERO)), Err(Error::NoMemory));

        ch.release_rx(&a).unwrap();
        let c = ch.receive(Some(Duration::ZERO)).unwrap();
        assert_eq!(c[0], 3);
    }

    #[test]
    fn test_receive_not_connected() {
        let ch = Channel::new(1, 4, Arc::new(AtomicBool::new(false)), None);
        assert_eq!(ch.receive(Some(Duration::ZERO)), Err(Error::Again));
        ch.mark_disconnected();
        assert_eq!(ch.receive(Some(Duration::ZERO)), Err(Error::ConnReset));
    }

    #[test]
    fn test_receive_timeout() {
        let ch = connected_channel(4);
        let err = ch.receive(Some(Duration::from_millis(20))).unwrap_err();
        assert_eq!(err, Error::Timeout);
    }

    #[test]
    fn test_blocked_receive_sees_disconnect() {
        let ch = Arc::new(connected_channel(4));
        let waiter = {
            let ch = ch.clone();
            thread::spawn(move || ch.receive(Some(Duration::from_secs(5))))
        };
        thread::sleep(Duration::from_millis(30));
        ch.mark_disconnected();
        ch.wake_all();
        assert_eq!(waiter.join().unwrap(), Err(Error::ConnReset));
    }

    #[test]
    fn test_interrupt_aborts_wait() {
        let interrupt = Arc::new(AtomicBool::new(false));
        let ch = Channel::new(1, 4, interrupt.clone(), None);
        ch.lock().state = ChannelState::Connected;
        let ch = Arc::new(ch);
        let waiter = {
            let ch = ch.clone();
            thread::spawn(move || ch.receive(None))
        };
        thread::sleep(Duration::from_millis(30));
        interrupt.store(true, Ordering::Release);
        ch.wake_all();
        assert_eq!(waiter.join().unwrap(), Err(Error::Interrupted));
    }

    #[test]
    fn test_destruction_completion_fires_on_last_drop() {
        let ch = Arc::new(Channel::new(9, 4, Arc::new(AtomicBool::new(false)), None));
        let destroyed = ch.destroyed_handle();
        assert!(!destroyed.wait_timeout(Duration::from_millis(10)));
        drop(ch);
        assert!(destroyed.wait_timeout(Duration::from_millis(100)));
    }
}
