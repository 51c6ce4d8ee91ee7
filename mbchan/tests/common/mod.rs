//! Shared fixture: two cores talking over a loopback fabric.

#![allow(dead_code)]

use mbchan::transport::loopback::{LoopbackFabric, LoopbackNode};
use mbchan::{CmConfig, CmCore, HDR_LEN};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

pub const DESTID_A: u32 = 0x01;
pub const DESTID_B: u32 = 0x02;
pub const PORT: u8 = 0;

pub struct TwoNodes {
    pub fabric: LoopbackFabric,
    pub node_a: Arc<LoopbackNode>,
    pub node_b: Arc<LoopbackNode>,
    pub core_a: CmCore,
    pub core_b: CmCore,
}

/// Default test configuration: production defaults, short connect timeout.
pub fn test_config() -> CmConfig {
    CmConfig {
        connect_timeout_ms: 300,
        ..CmConfig::default()
    }
}

pub fn two_nodes() -> TwoNodes {
    two_nodes_with(test_config())
}

pub fn two_nodes_with(config: CmConfig) -> TwoNodes {
    let fabric = LoopbackFabric::new();
    let node_a = fabric.add_node(DESTID_A, PORT);
    let node_b = fabric.add_node(DESTID_B, PORT);

    let core_a = CmCore::new(config.clone(), node_a.clone()).unwrap();
    core_a.add_port(PORT, DESTID_A).unwrap();
    core_a.add_peer(PORT, node_b.peer_handle()).unwrap();

    let core_b = CmCore::new(config, node_b.clone()).unwrap();
    core_b.add_port(PORT, DESTID_B).unwrap();
    core_b.add_peer(PORT, node_a.peer_handle()).unwrap();

    TwoNodes {
        fabric,
        node_a,
        node_b,
        core_a,
        core_b,
    }
}

/// Listen on `b_listen` at B, connect `a_id` from A, accept, and return the
/// accepted channel ID on B.
pub fn connect_pair(t: &TwoNodes, a_id: u16, b_listen: u16) -> u16 {
    t.core_b.channel_create(b_listen, None).unwrap();
    t.core_b.channel_bind(b_listen, PORT, None).unwrap();
    t.core_b.channel_listen(b_listen).unwrap();
    t.core_a.channel_create(a_id, None).unwrap();

    thread::scope(|s| {
        let connect = s.spawn(|| t.core_a.channel_connect(a_id, PORT, DESTID_B, b_listen));
        let accepted = t
            .core_b
            .channel_accept(b_listen, Some(Duration::from_secs(2)))
            .unwrap();
        connect.join().unwrap().unwrap();
        accepted
    })
}

/// Message buffer with reserved header space followed by `payload`.
pub fn data_buf(payload: &[u8]) -> Vec<u8> {
    let mut buf = vec![0u8; HDR_LEN];
    buf.extend_from_slice(payload);
    buf
}

/// Payload portion of a received message.
pub fn payload(msg: &[u8]) -> &[u8] {
    &msg[HDR_LEN..]
}

/// Poll `cond` until it holds, panicking after a couple of seconds.
pub fn eventually(mut cond: impl FnMut() -> bool) {
    for _ in 0..400 {
        if cond() {
            return;
        }
        thread::sleep(Duration::from_millis(5));
    }
    panic!("condition not reached in time");
}
