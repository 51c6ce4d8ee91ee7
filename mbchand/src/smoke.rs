//! Loopback smoke run: bring up N in-process nodes and drive the full
//! channel lifecycle between them.
//!
//! Every node listens on the configured channel; every node also connects
//! to its ring neighbor and plays echo ping-pong over the connection. A run
//! passes when every pair moved every message and all channels tore down
//! cleanly.

use crate::config::ServiceConfig;
use anyhow::{anyhow, bail, Context, Result};
use mbchan::transport::loopback::{LoopbackFabric, LoopbackNode};
use mbchan::{CmCore, Error, HDR_LEN};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

const OP_TIMEOUT: Duration = Duration::from_secs(5);

/// Summary of a completed smoke run.
pub struct Stats {
    pub pairs: usize,
    pub messages: u64,
}

/// Execute the smoke run described by `config`.
pub fn run(config: &ServiceConfig) -> Result<Stats> {
    let n = config.fabric.nodes as usize;
    let port = config.fabric.port;
    let fabric = LoopbackFabric::new();

    let mut nodes: Vec<(Arc<LoopbackNode>, CmCore)> = Vec::with_capacity(n);
    for i in 0..n {
        let destid = config.fabric.base_destid + i as u32;
        let node = fabric.add_node(destid, port);
        let core = CmCore::new(config.core.clone(), node.clone())
            .map_err(|e| anyhow!("core init failed for node {destid:#x}: {e}"))?;
        core.add_port(port, destid)
            .map_err(|e| anyhow!("add_port failed for node {destid:#x}: {e}"))?;
        nodes.push((node, core));
    }

    // Full-mesh peer exchange, then listeners, before any client runs: a
    // connect request that reaches a non-listening channel is dropped.
    for (i, (_, core)) in nodes.iter().enumerate() {
        for (j, (node, _)) in nodes.iter().enumerate() {
            if i != j {
                core.add_peer(port, node.peer_handle())
                    .map_err(|e| anyhow!("add_peer failed: {e}"))?;
            }
        }
    }
    for (_, core) in &nodes {
        let listen = config.smoke.listen_channel;
        core.channel_create(listen, None)
            .map_err(|e| anyhow!("listener create failed: {e}"))?;
        core.channel_bind(listen, port, None)
            .map_err(|e| anyhow!("listener bind failed: {e}"))?;
        core.channel_listen(listen)
            .map_err(|e| anyhow!("listen failed: {e}"))?;
    }

    info!(nodes = n, "loopback fabric up, starting traffic");

    let nodes = &nodes;
    let mut failures = 0usize;
    let mut messages = 0u64;

    thread::scope(|s| {
        let mut servers = Vec::with_capacity(n);
        let mut clients = Vec::with_capacity(n);

        for (i, (_, core)) in nodes.iter().enumerate() {
            servers.push(s.spawn(move || {
                serve_echo(core, config).with_context(|| format!("server {i}"))
            }));
        }
        for (i, (_, core)) in nodes.iter().enumerate() {
            let dst_destid = config.fabric.base_destid + ((i + 1) % n) as u32;
            clients.push(s.spawn(move || {
                drive_echo(core, dst_destid, config).with_context(|| format!("client {i}"))
            }));
        }

        for handle in clients.into_iter().chain(servers) {
            match handle.join().expect("smoke worker panicked") {
                Ok(count) => messages += count,
                Err(e) => {
                    warn!(err = %e, "smoke worker failed");
                    failures += 1;
                }
            }
        }
    });

    if failures > 0 {
        bail!("{failures} smoke workers failed");
    }
    Ok(Stats {
        pairs: n,
        messages,
    })
}

/// Accept one connection and echo every message until the peer closes.
fn serve_echo(core: &CmCore, config: &ServiceConfig) -> Result<u64> {
    let accepted = core
        .channel_accept(config.smoke.listen_channel, Some(OP_TIMEOUT))
        .map_err(|e| anyhow!("accept failed: {e}"))?;
    debug!(ch = accepted, "connection accepted");

    let mut served = 0u64;
    loop {
        let msg = match core.channel_receive(accepted, Some(OP_TIMEOUT)) {
            Ok(msg) => msg,
            // The peer closed: the channel was unpublished under us.
            Err(Error::ConnReset) | Err(Error::NotFound) | Err(Error::Again) => break,
            Err(e) => bail!("server receive failed: {e}"),
        };
        let mut reply = msg.to_vec();
        core.channel_release_rx(accepted, &msg)
            .map_err(|e| anyhow!("release failed: {e}"))?;
        send_with_retry(core, accepted, &mut reply)?;
        served += 1;
    }

    let _ = core.channel_close(config.smoke.listen_channel, None);
    Ok(served)
}

/// Connect to `dst_destid`, send the configured number of messages and
/// verify each echo.
fn drive_echo(core: &CmCore, dst_destid: u32, config: &ServiceConfig) -> Result<u64> {
    let port = config.fabric.port;
    let ch = core
        .channel_create(0, None)
        .map_err(|e| anyhow!("client create failed: {e}"))?;
    core.channel_connect(ch, port, dst_destid, config.smoke.listen_channel)
        .map_err(|e| anyhow!("connect to {dst_destid:#x} failed: {e}"))?;
    debug!(ch, dst_destid, "connected");

    let mut moved = 0u64;
    for seq in 0..config.smoke.messages {
        let mut buf = vec![0u8; HDR_LEN + config.smoke.payload_len];
        for (k, byte) in buf[HDR_LEN..].iter_mut().enumerate() {
            *byte = (seq as u8).wrapping_add(k as u8);
        }
        let expected = buf[HDR_LEN..].to_vec();

        send_with_retry(core, ch, &mut buf)?;

        let echo = core
            .channel_receive(ch, Some(OP_TIMEOUT))
            .map_err(|e| anyhow!("echo receive failed: {e}"))?;
        if &echo[HDR_LEN..] != expected.as_slice() {
            bail!("echo payload mismatch at message {seq}");
        }
        core.channel_release_rx(ch, &echo)
            .map_err(|e| anyhow!("release failed: {e}"))?;
        moved += 1;
    }

    core.channel_close(ch, None)
        .map_err(|e| anyhow!("client close failed: {e}"))?;
    Ok(moved)
}

/// Outbound data gets `Busy` under ring pressure; back off briefly and
/// retry instead of failing the run.
fn send_with_retry(core: &CmCore, ch: u16, buf: &mut [u8]) -> Result<()> {
    for _ in 0..1000 {
        match core.channel_send(ch, buf) {
            Ok(()) => return Ok(()),
            Err(Error::Busy) => thread::sleep(Duration::from_millis(1)),
            Err(e) => bail!("send failed: {e}"),
        }
    }
    bail!("send kept hitting a full ring")
}
