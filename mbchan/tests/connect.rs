//! Connect/accept handshake behavior across two loopback nodes.

mod common;

use common::*;
use mbchan::{ChannelState, Error};
use std::thread;
use std::time::{Duration, Instant};

#[test]
fn test_connect_and_accept() {
    let t = two_nodes();

    t.core_b.channel_create(100, None).unwrap();
    t.core_b.channel_bind(100, PORT, None).unwrap();
    t.core_b.channel_listen(100).unwrap();

    t.core_a.channel_create(200, None).unwrap();

    let accepted = thread::scope(|s| {
        let connect = s.spawn(|| t.core_a.channel_connect(200, PORT, DESTID_B, 100));
        let accepted = t
            .core_b
            .channel_accept(100, Some(Duration::from_secs(2)))
            .unwrap();
        connect.join().unwrap().unwrap();
        accepted
    });

    assert_eq!(t.core_a.channel_state(200), Some(ChannelState::Connected));
    assert_eq!(
        t.core_b.channel_state(accepted),
        Some(ChannelState::Connected)
    );
    // The parent keeps listening.
    assert_eq!(t.core_b.channel_state(100), Some(ChannelState::Listen));
}

#[test]
fn test_connect_timeout_returns_channel_to_idle() {
    let t = two_nodes();

    // B has no listening channel 500: the request is dropped on its floor
    // and no ack ever arrives.
    t.core_a.channel_create(200, None).unwrap();
    let start = Instant::now();
    let err = t
        .core_a
        .channel_connect(200, PORT, DESTID_B, 500)
        .unwrap_err();
    assert_eq!(err, Error::Timeout);
    assert!(start.elapsed() >= Duration::from_millis(300));
    assert_eq!(t.core_a.channel_state(200), Some(ChannelState::Idle));
}

#[test]
fn test_connect_unknown_peer() {
    let t = two_nodes();
    t.core_a.channel_create(200, None).unwrap();
    assert_eq!(
        t.core_a.channel_connect(200, PORT, 0x99, 100),
        Err(Error::NotFound)
    );
    assert_eq!(t.core_a.channel_state(200), Some(ChannelState::Idle));
}

#[test]
fn test_connect_unknown_port() {
    let t = two_nodes();
    t.core_a.channel_create(200, None).unwrap();
    assert_eq!(
        t.core_a.channel_connect(200, 9, DESTID_B, 100),
        Err(Error::NotFound)
    );
}

#[test]
fn test_connect_requires_idle_channel() {
    let t = two_nodes();
    t.core_a.channel_create(200, None).unwrap();
    t.core_a.channel_bind(200, PORT, None).unwrap();
    assert_eq!(
        t.core_a.channel_connect(200, PORT, DESTID_B, 100),
        Err(Error::Invalid)
    );
}

#[test]
fn test_listen_requires_bound_channel() {
    let t = two_nodes();
    t.core_b.channel_create(100, None).unwrap();
    assert_eq!(t.core_b.channel_listen(100), Err(Error::Invalid));
    t.core_b.channel_bind(100, PORT, None).unwrap();
    t.core_b.channel_listen(100).unwrap();
    // Listening twice is a state error as well.
    assert_eq!(t.core_b.channel_listen(100), Err(Error::Invalid));
}

#[test]
fn test_bind_unknown_port() {
    let t = two_nodes();
    t.core_b.channel_create(100, None).unwrap();
    assert_eq!(t.core_b.channel_bind(100, 9, None), Err(Error::NotFound));
}

#[test]
fn test_bind_records_context_cookie() {
    let t = two_nodes();
    t.core_b.channel_create(100, None).unwrap();
    assert_eq!(t.core_b.channel_context(100), None);
    t.core_b.channel_bind(100, PORT, Some(0xfeed)).unwrap();
    assert_eq!(t.core_b.channel_context(100), Some(0xfeed));
}

#[test]
fn test_accept_nonblocking_empty_queue() {
    let t = two_nodes();
    t.core_b.channel_create(100, None).unwrap();
    t.core_b.channel_bind(100, PORT, None).unwrap();
    t.core_b.channel_listen(100).unwrap();
    assert_eq!(
        t.core_b.channel_accept(100, Some(Duration::ZERO)),
        Err(Error::Again)
    );
}

#[test]
fn test_accept_timeout() {
    let t = two_nodes();
    t.core_b.channel_create(100, None).unwrap();
    t.core_b.channel_bind(100, PORT, None).unwrap();
    t.core_b.channel_listen(100).unwrap();
    assert_eq!(
        t.core_b.channel_accept(100, Some(Duration::from_millis(50))),
        Err(Error::Timeout)
    );
}

#[test]
fn test_accept_canceled_by_close() {
    let t = two_nodes();
    t.core_b.channel_create(100, None).unwrap();
    t.core_b.channel_bind(100, PORT, None).unwrap();
    t.core_b.channel_listen(100).unwrap();

    thread::scope(|s| {
        let accept = s.spawn(|| t.core_b.channel_accept(100, Some(Duration::from_secs(5))));
        thread::sleep(Duration::from_millis(50));
        t.core_b.channel_close(100, None).unwrap();
        assert_eq!(accept.join().unwrap(), Err(Error::Canceled));
    });
}

#[test]
fn test_id_allocation_ranges() {
    let t = two_nodes();
    let core = &t.core_a;

    assert_eq!(core.channel_create(256, None).unwrap(), 256);
    // Dynamic allocation starts above the taken slot.
    assert_eq!(core.channel_create(0, None).unwrap(), 257);
    assert_eq!(core.channel_create(256, None), Err(Error::Busy));
    // Below the dynamic start, available for explicit requests only.
    assert_eq!(core.channel_create(100, None).unwrap(), 100);
}

#[test]
fn test_duplicate_explicit_id_is_busy() {
    let t = two_nodes();
    assert_eq!(t.core_a.channel_create(1, None).unwrap(), 1);
    assert_eq!(t.core_a.channel_create(1, None), Err(Error::Busy));
}

#[test]
fn test_queries() {
    let t = two_nodes();

    assert_eq!(t.core_a.port_list(8), vec![(PORT, DESTID_A)]);
    assert_eq!(t.core_a.ep_list_size(PORT).unwrap(), 1);
    assert_eq!(t.core_a.ep_list(PORT, 8).unwrap(), vec![DESTID_B]);
    assert_eq!(t.core_a.ep_list_size(9), Err(Error::NotFound));
}
