//! Serialized handshake worker.
//!
//! All CONN_REQ / CONN_ACK / CONN_CLOSE processing across every port funnels
//! through one thread, so handshake state transitions never race each other.
//! Handlers may take channel and registry locks but never block on I/O or
//! channel waiters. Unknown channels and wrong states are logged and the
//! packet dropped. Inbound control traffic is never fatal.

use crate::channel::{ChannelState, ConnReq};
use crate::cm::{close_channel, CoreShared};
use crate::port::PortCtx;
use crate::wire::{ChanOp, MsgHeader};
use crossbeam_channel::{bounded, unbounded, Sender};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use tracing::{debug, error, warn};

/// One inbound control datagram awaiting serialized processing.
pub(crate) struct ControlWork {
    pub port: Arc<PortCtx>,
    pub data: Vec<u8>,
}

enum Msg {
    Work(ControlWork),
    Flush(Sender<()>),
    Stop,
}

pub(crate) struct ControlWorker {
    tx: Sender<Msg>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl ControlWorker {
    pub fn spawn(core: Weak<CoreShared>) -> Self {
        let (tx, rx) = unbounded();
        let handle = thread::Builder::new()
            .name("mbchan-ctl".into())
            .spawn(move || {
                while let Ok(msg) = rx.recv() {
                    match msg {
                        Msg::Work(work) => {
                            let Some(core) = core.upgrade() else { continue };
                            if !work.port.is_running() {
                                continue;
                            }
                            handle_work(&core, work);
                        }
                        Msg::Flush(done) => {
                            let _ = done.send(());
                        }
                        Msg::Stop => break,
                    }
                }
                debug!("control worker exiting");
            })
            .expect("spawn control worker thread");
        ControlWorker {
            tx,
            handle: Mutex::new(Some(handle)),
        }
    }

    pub fn submit(&self, work: ControlWork) {
        if self.tx.send(Msg::Work(work)).is_err() {
            warn!("control worker gone, packet dropped");
        }
    }

    /// Drain barrier: returns once every previously submitted work item has
    /// been processed.
    pub fn flush(&self) {
        let (done_tx, done_rx) = bounded(1);
        if self.tx.send(Msg::Flush(done_tx)).is_ok() {
            let _ = done_rx.recv();
        }
    }

    pub fn stop(&self) {
        let _ = self.tx.send(Msg::Stop);
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }
}

fn handle_work(core: &Arc<CoreShared>, work: ControlWork) {
    let hdr = match MsgHeader::parse(&work.data) {
        Ok(hdr) => hdr,
        Err(e) => {
            error!(err = %e, "invalid control header");
            return;
        }
    };

    debug!(
        op = ?hdr.ch_op,
        dst_ch = hdr.dst_ch,
        src_ch = hdr.src_ch,
        from = hdr.src_destid,
        "control message"
    );

    match hdr.ch_op {
        ChanOp::ConnReq => handle_conn_req(core, &work, &hdr),
        ChanOp::ConnAck => handle_conn_ack(core, &hdr),
        ChanOp::ConnClose => handle_conn_close(core, &hdr),
        ChanOp::Data => error!("data message routed to control worker"),
    }
}

/// Queue an inbound connection request on the listening channel.
fn handle_conn_req(core: &Arc<CoreShared>, work: &ControlWork, hdr: &MsgHeader) {
    let Some(ch) = core.registry.get(hdr.dst_ch) else {
        debug!(ch = hdr.dst_ch, "connect request for unknown channel");
        return;
    };

    let mut inner = ch.lock();
    if inner.state != ChannelState::Listen {
        debug!(ch = hdr.dst_ch, state = ?inner.state, "channel is not in listen state");
        return;
    }
    inner.accept_queue.push_back(ConnReq {
        destid: hdr.src_destid,
        chan: hdr.src_ch,
        port: work.port.clone(),
    });
    drop(inner);
    ch.wake_one();
}

/// Complete an outstanding connect with the remote channel number.
fn handle_conn_ack(core: &Arc<CoreShared>, hdr: &MsgHeader) {
    let Some(ch) = core.registry.get(hdr.dst_ch) else {
        debug!(ch = hdr.dst_ch, "connect ack for unknown channel");
        return;
    };

    let mut inner = ch.lock();
    if inner.state != ChannelState::Connect {
        debug!(ch = hdr.dst_ch, state = ?inner.state, "unexpected connect ack");
        return;
    }
    inner.state = ChannelState::Connected;
    inner.rem_channel = hdr.src_ch;
    drop(inner);
    ch.wake_all();
}

/// Remote close: unpublish first, then run the local close path.
fn handle_conn_close(core: &Arc<CoreShared>, hdr: &MsgHeader) {
    let Some(ch) = core.registry.take(hdr.dst_ch) else {
        debug!(ch = hdr.dst_ch, "close for unknown channel");
        return;
    };

    ch.mark_disconnected();
    if let Err(e) = close_channel(ch) {
        debug!(ch = hdr.dst_ch, err = %e, "close of remotely closed channel");
    }
}
