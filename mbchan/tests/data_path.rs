//! Data transfer: echo, receive-ring bounds, outbound backpressure.

mod common;

use common::*;
use mbchan::wire::{ChanOp, MsgHeader};
use mbchan::{CmConfig, Error, HDR_LEN, MAX_MSG_SIZE};
use std::time::Duration;

#[test]
fn test_echo_round_trip() {
    let t = two_nodes();
    let b_ch = connect_pair(&t, 200, 100);

    let mut buf = data_buf(b"ping\0");
    t.core_a.channel_send(200, &mut buf).unwrap();

    let msg = t
        .core_b
        .channel_receive(b_ch, Some(Duration::from_secs(2)))
        .unwrap();
    assert_eq!(msg.len(), HDR_LEN + 5);
    assert_eq!(payload(&msg), b"ping\0");

    let hdr = MsgHeader::parse(&msg).unwrap();
    assert_eq!(hdr.ch_op, ChanOp::Data);
    assert_eq!(hdr.src_destid, DESTID_A);
    assert_eq!(hdr.dst_destid, DESTID_B);
    assert_eq!(hdr.src_ch, 200);
    assert_eq!(hdr.dst_ch, b_ch);
    assert_eq!(hdr.msg_len as usize, HDR_LEN + 5);

    t.core_b.channel_release_rx(b_ch, &msg).unwrap();

    // And back: the accepted channel can send to the initiator.
    let mut reply = data_buf(b"pong");
    t.core_b.channel_send(b_ch, &mut reply).unwrap();
    let msg = t
        .core_a
        .channel_receive(200, Some(Duration::from_secs(2)))
        .unwrap();
    assert_eq!(payload(&msg), b"pong");
    t.core_a.channel_release_rx(200, &msg).unwrap();
}

#[test]
fn test_messages_arrive_in_order() {
    let t = two_nodes();
    let b_ch = connect_pair(&t, 200, 100);

    for i in 0..16u8 {
        let mut buf = data_buf(&[i]);
        t.core_a.channel_send(200, &mut buf).unwrap();
    }
    for i in 0..16u8 {
        let msg = t
            .core_b
            .channel_receive(b_ch, Some(Duration::from_secs(2)))
            .unwrap();
        assert_eq!(payload(&msg), &[i]);
        t.core_b.channel_release_rx(b_ch, &msg).unwrap();
    }
}

#[test]
fn test_send_length_bounds() {
    let t = two_nodes();
    let _b_ch = connect_pair(&t, 200, 100);

    let mut empty: Vec<u8> = Vec::new();
    assert_eq!(t.core_a.channel_send(200, &mut empty), Err(Error::Invalid));

    let mut oversized = vec![0u8; MAX_MSG_SIZE + 1];
    assert_eq!(
        t.core_a.channel_send(200, &mut oversized),
        Err(Error::Invalid)
    );

    assert_eq!(
        t.core_a.channel_send(0, &mut data_buf(b"x")),
        Err(Error::Invalid)
    );

    // Largest allowed message passes.
    let mut max = vec![0u8; MAX_MSG_SIZE];
    t.core_a.channel_send(200, &mut max).unwrap();
}

#[test]
fn test_send_requires_connected_channel() {
    let t = two_nodes();
    t.core_a.channel_create(200, None).unwrap();
    assert_eq!(
        t.core_a.channel_send(200, &mut data_buf(b"x")),
        Err(Error::Again)
    );
    assert_eq!(
        t.core_a.channel_send(999, &mut data_buf(b"x")),
        Err(Error::NotFound)
    );
}

#[test]
fn test_receive_timeout_on_quiet_channel() {
    let t = two_nodes();
    let _b_ch = connect_pair(&t, 200, 100);
    assert_eq!(
        t.core_a.channel_receive(200, Some(Duration::from_millis(50))),
        Err(Error::Timeout)
    );
}

#[test]
fn test_receive_ring_drops_overflow_without_erroring_channel() {
    let config = CmConfig {
        rx_ring_size: 4,
        ..test_config()
    };
    let t = two_nodes_with(config);
    let b_ch = connect_pair(&t, 200, 100);

    // Park delivery until all six messages are submitted, then release them
    // as one burst so they hit the receive ring before anyone consumes.
    t.node_a.set_tx_hold(true);
    for i in 0..6u8 {
        let mut buf = data_buf(&[i]);
        t.core_a.channel_send(200, &mut buf).unwrap();
    }
    t.node_a.set_tx_hold(false);
    t.node_a.release_held(6);
    std::thread::sleep(Duration::from_millis(300));

    // Only the ring capacity survives; the overflow was dropped silently.
    for i in 0..4u8 {
        let msg = t
            .core_b
            .channel_receive(b_ch, Some(Duration::from_secs(2)))
            .unwrap();
        assert_eq!(payload(&msg), &[i]);
        t.core_b.channel_release_rx(b_ch, &msg).unwrap();
    }
    assert_eq!(
        t.core_b.channel_receive(b_ch, Some(Duration::from_millis(50))),
        Err(Error::Timeout)
    );

    // The channel itself stays healthy.
    let mut buf = data_buf(b"later");
    t.core_a.channel_send(200, &mut buf).unwrap();
    let msg = t
        .core_b
        .channel_receive(b_ch, Some(Duration::from_secs(2)))
        .unwrap();
    assert_eq!(payload(&msg), b"later");
}

#[test]
fn test_tx_ring_backpressure_and_deferred_close() {
    let config = CmConfig {
        tx_ring_size: 8,
        rx_ring_size: 16,
        ..test_config()
    };
    let t = two_nodes_with(config);
    let b_ch = connect_pair(&t, 200, 100);

    // Park completions so the outbound ring fills at exactly capacity.
    t.node_a.set_tx_hold(true);
    for i in 0..8u8 {
        let mut buf = data_buf(&[i]);
        t.core_a.channel_send(200, &mut buf).unwrap();
    }
    let mut overflow = data_buf(b"no room");
    assert_eq!(
        t.core_a.channel_send(200, &mut overflow),
        Err(Error::Busy)
    );
    assert_eq!(t.node_a.held_len(), 8);

    // Local close with a saturated ring: the close notification is parked
    // on the deferred queue, destruction still completes.
    t.core_a.channel_close(200, None).unwrap();
    assert!(t.core_a.channel_state(200).is_none());
    assert_eq!(t.node_a.held_len(), 8);

    // The first completion frees a slot and flushes the deferred close.
    t.node_a.release_held(8);
    eventually(|| t.node_a.held_len() == 1);

    // The close is still parked, so B drains all eight data messages first.
    for i in 0..8u8 {
        let msg = t
            .core_b
            .channel_receive(b_ch, Some(Duration::from_secs(2)))
            .unwrap();
        assert_eq!(payload(&msg), &[i]);
        t.core_b.channel_release_rx(b_ch, &msg).unwrap();
    }

    t.node_a.set_tx_hold(false);
    t.node_a.release_held(1);
    eventually(|| t.core_b.channel_state(b_ch).is_none());
}

#[test]
fn test_release_rx_rejects_foreign_buffer() {
    let t = two_nodes();
    let b_ch = connect_pair(&t, 200, 100);

    let mut buf = data_buf(b"once");
    t.core_a.channel_send(200, &mut buf).unwrap();
    let msg = t
        .core_b
        .channel_receive(b_ch, Some(Duration::from_secs(2)))
        .unwrap();

    t.core_b.channel_release_rx(b_ch, &msg).unwrap();
    assert_eq!(t.core_b.channel_release_rx(b_ch, &msg), Err(Error::Invalid));
}
