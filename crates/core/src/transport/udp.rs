//! Datagram listener: a single shared socket demuxes inbound traffic from
//! every connected peer by the slot id carried in byte 0, then hands the
//! remainder of the packet to that session's inbound datagram queue.
//!
//! Mirrors the reference's `UDPServer.handle_datagram`: bind once, read
//! forever, bind each session's peer address the first time its traffic
//! arrives (or when it changes, e.g. after a NAT rebind).

use std::net::UdpSocket;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::codec;
use crate::error::Result;
use crate::registry::Registry;

/// Read timeout used so the accept loop can periodically re-check
/// `running` without blocking forever on a socket with no traffic.
const POLL_TIMEOUT: Duration = Duration::from_millis(500);

/// Largest datagram the reference protocol ever sends; well above any real
/// position update, generously bounding the receive buffer.
const MAX_DATAGRAM: usize = 4096;

pub fn bind(addr: &str) -> Result<UdpSocket> {
    let socket = UdpSocket::bind(addr)?;
    socket.set_read_timeout(Some(POLL_TIMEOUT))?;
    Ok(socket)
}

/// Blocking receive loop. Meant to be spawned on its own thread; returns
/// once `running` is cleared.
pub fn run(socket: &UdpSocket, registry: &Arc<Registry>, running: &Arc<AtomicBool>) {
    let mut buf = [0u8; MAX_DATAGRAM];
    tracing::debug!("datagram listener started");
    while running.load(Ordering::Relaxed) {
        let (n, addr) = match socket.recv_from(&mut buf) {
            Ok(pair) => pair,
            Err(e) if matches!(e.kind(), std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut) => continue,
            Err(e) => {
                tracing::warn!(error = %e, "datagram recv failed");
                continue;
            }
        };
        if n < 2 {
            continue;
        }
        let packet = &buf[..n];
        let Some(slot_id) = codec::datagram_slot(packet) else {
            continue;
        };
        let Some(session) = registry.by_slot(slot_id) else {
            tracing::trace!(slot_id, "datagram for unknown slot, dropping");
            continue;
        };
        if session.udp_peer() != Some(addr) {
            session.set_udp_peer(addr);
        }
        session.push_datagram(packet[2..].to_vec());
    }
    tracing::debug!("datagram listener stopped");
}
