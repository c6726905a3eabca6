//! Client session lifecycle (connect → identify → admit → sync mods → play)
//! and the per-session state a connected player owns: its car slots, its
//! inbound queues, its reliable/datagram transports and traffic counters.
//!
//! ## Session lifecycle
//!
//! ```text
//! ROLE_READ -> VERSION_CHECK -> KEY_EXCHANGE -> IDENTITY -> ADMIT -> SYNC -> PLAY -> CLOSED
//! ```
//!
//! The early states (role byte through identity resolution) run before a
//! `Session` exists at all — they operate on the raw accepted stream in
//! `transport::tcp`. A `Session` is constructed once a slot has been
//! assigned (ADMIT) and is shared via `Arc` from then on.

pub mod dispatch;

use std::collections::HashMap;
use std::io::Write;
use std::net::{SocketAddr, TcpStream, UdpSocket};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::time::Instant;

use crossbeam_channel::{Receiver, Sender, bounded};
use parking_lot::{Mutex, RwLock};
use serde_json::Value as Json;

use crate::codec;
use crate::error::{RelayError, Result};
use crate::event::SubscriptionId;

/// Maximum cars a session can own: 20 regular vehicles plus one unicycle
/// slot, matching the reference's `[None] * 21`.
pub const MAX_CARS: usize = 21;

/// Depth of each per-session inbound queue before a slow consumer starts
/// dropping newly arrived messages rather than growing unbounded.
pub const INBOUND_QUEUE_DEPTH: usize = 256;

/// Coarse lifecycle phase, mostly useful for diagnostics/console output —
/// the actual handshake in `transport::tcp` is a sequence of function calls
/// on one thread, not a value other threads branch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    RoleRead,
    VersionCheck,
    KeyExchange,
    Identity,
    Admit,
    Sync,
    Play,
    Closed,
}

/// One spawned vehicle (or the single unicycle), matching the reference's
/// per-slot car dict.
#[derive(Debug, Clone)]
pub struct Car {
    pub packet: String,
    pub json: Option<Json>,
    pub json_ok: bool,
    pub unicycle: bool,
    pub over_spawn: bool,
    pub pos: Option<Json>,
}

/// Singleton unicycle slot tracker: at most one unicycle may exist per
/// session, and spawning a new one replaces the old.
#[derive(Debug, Clone, Default)]
pub struct Unicycle {
    pub car_id: Option<usize>,
    pub packet: String,
}

#[derive(Debug, Default)]
pub struct Counters {
    pub tcp_recv_this_second: u64,
    pub udp_recv_this_second: u64,
    pub tcp_recv_total: u64,
    pub udp_recv_total: u64,
    pub tcp_bytes_recv_total: u64,
    pub udp_bytes_recv_total: u64,
    pub tcp_sent_total: u64,
    pub udp_sent_total: u64,
    pub tcp_bytes_sent_total: u64,
    pub udp_bytes_sent_total: u64,
    pub tcp_pps: u64,
    pub udp_pps: u64,
}

/// A connected, identified player. Constructed once the registry has
/// assigned it a slot; shared across the owning reliable-read thread, the
/// UDP receive thread and the tick scheduler via `Arc`.
pub struct Session {
    pub slot_id: i32,
    pub key: String,
    pub nickname: String,
    pub roles: String,
    pub guest: bool,
    pub identifiers: HashMap<String, String>,

    alive: AtomicBool,
    ready: AtomicBool,
    synced: AtomicBool,

    cars: RwLock<Vec<Option<Car>>>,
    focus_car: AtomicI32,
    unicycle: RwLock<Unicycle>,
    last_position: RwLock<Option<Json>>,

    pub connect_time: Instant,

    reliable_writer: Mutex<TcpStream>,
    download_writer: Mutex<Option<TcpStream>>,
    udp_socket: Arc<UdpSocket>,
    udp_peer: RwLock<Option<SocketAddr>>,

    counters: Mutex<Counters>,

    inbound_reliable: (Sender<Vec<u8>>, Receiver<Vec<u8>>),
    inbound_datagram: (Sender<Vec<u8>>, Receiver<Vec<u8>>),

    /// Subscription ids for this session's per-tick hooks, unregistered on
    /// teardown so a departed session stops being pumped.
    pub tick_hooks: Mutex<Vec<SubscriptionId>>,
}

impl Session {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        slot_id: i32,
        key: String,
        nickname: String,
        roles: String,
        guest: bool,
        identifiers: HashMap<String, String>,
        reliable_writer: TcpStream,
        udp_socket: Arc<UdpSocket>,
    ) -> Self {
        Self {
            slot_id,
            key,
            nickname,
            roles,
            guest,
            identifiers,
            alive: AtomicBool::new(true),
            ready: AtomicBool::new(false),
            synced: AtomicBool::new(false),
            cars: RwLock::new(vec![None; MAX_CARS]),
            focus_car: AtomicI32::new(-1),
            unicycle: RwLock::new(Unicycle::default()),
            last_position: RwLock::new(None),
            connect_time: Instant::now(),
            reliable_writer: Mutex::new(reliable_writer),
            download_writer: Mutex::new(None),
            udp_socket,
            udp_peer: RwLock::new(None),
            counters: Mutex::new(Counters::default()),
            inbound_reliable: bounded(INBOUND_QUEUE_DEPTH),
            inbound_datagram: bounded(INBOUND_QUEUE_DEPTH),
            tick_hooks: Mutex::new(Vec::new()),
        }
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Relaxed)
    }

    pub fn mark_dead(&self) {
        self.alive.store(false, Ordering::Relaxed);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Relaxed)
    }

    pub fn mark_ready(&self) {
        self.ready.store(true, Ordering::Relaxed);
    }

    pub fn is_synced(&self) -> bool {
        self.synced.load(Ordering::Relaxed)
    }

    pub fn mark_synced(&self) {
        self.synced.store(true, Ordering::Relaxed);
    }

    pub fn set_download_writer(&self, stream: TcpStream) {
        *self.download_writer.lock() = Some(stream);
    }

    pub fn has_download_writer(&self) -> bool {
        self.download_writer.lock().is_some()
    }

    pub fn download_writer(&self) -> Option<TcpStream> {
        self.download_writer.lock().as_ref().and_then(|s| s.try_clone().ok())
    }

    pub fn reliable_writer(&self) -> Option<TcpStream> {
        self.reliable_writer.lock().try_clone().ok()
    }

    pub fn set_udp_peer(&self, addr: SocketAddr) {
        let mut peer = self.udp_peer.write();
        if *peer != Some(addr) {
            tracing::debug!(slot = self.slot_id, %addr, "datagram peer bound");
            *peer = Some(addr);
        }
    }

    pub fn udp_peer(&self) -> Option<SocketAddr> {
        *self.udp_peer.read()
    }

    pub fn focus_car(&self) -> i32 {
        self.focus_car.load(Ordering::Relaxed)
    }

    pub fn set_focus_car(&self, car_id: i32) {
        self.focus_car.store(car_id, Ordering::Relaxed);
    }

    pub fn cars(&self) -> Vec<(usize, Car)> {
        self.cars
            .read()
            .iter()
            .enumerate()
            .filter_map(|(i, c)| c.clone().map(|c| (i, c)))
            .collect()
    }

    pub fn car(&self, car_id: usize) -> Option<Car> {
        self.cars.read().get(car_id).cloned().flatten()
    }

    pub fn set_car(&self, car_id: usize, car: Option<Car>) {
        if let Some(slot) = self.cars.write().get_mut(car_id) {
            *slot = car;
        }
    }

    pub fn car_count(&self) -> usize {
        self.cars.read().iter().filter(|c| c.is_some()).count()
    }

    pub fn unicycle(&self) -> Unicycle {
        self.unicycle.read().clone()
    }

    pub fn set_unicycle(&self, unicycle: Unicycle) {
        *self.unicycle.write() = unicycle;
    }

    pub fn set_last_position(&self, pos: Json) {
        *self.last_position.write() = Some(pos);
    }

    pub fn last_position(&self) -> Option<Json> {
        self.last_position.read().clone()
    }

    /// Push a reliable payload onto this session's inbound queue. Matches
    /// the reference's `_tpc_put`: a bounded queue, with the oldest-first
    /// FIFO drained one packet per tick by the scheduler hook.
    pub fn push_reliable(&self, payload: Vec<u8>) {
        let mut counters = self.counters.lock();
        counters.tcp_recv_this_second += 1;
        counters.tcp_recv_total += 1;
        counters.tcp_bytes_recv_total += payload.len() as u64;
        drop(counters);
        if self.inbound_reliable.0.try_send(payload).is_err() {
            tracing::warn!(slot = self.slot_id, "reliable inbound queue full, dropping packet");
        }
    }

    pub fn push_datagram(&self, payload: Vec<u8>) {
        let mut counters = self.counters.lock();
        counters.udp_recv_this_second += 1;
        counters.udp_recv_total += 1;
        counters.udp_bytes_recv_total += payload.len() as u64;
        drop(counters);
        if self.inbound_datagram.0.try_send(payload).is_err() {
            tracing::warn!(slot = self.slot_id, "datagram inbound queue full, dropping packet");
        }
    }

    /// Drain at most one pending reliable message, if any.
    pub fn try_recv_reliable(&self) -> Option<Vec<u8>> {
        self.inbound_reliable.1.try_recv().ok()
    }

    /// Drain at most one pending datagram, if any.
    pub fn try_recv_datagram(&self) -> Option<Vec<u8>> {
        self.inbound_datagram.1.try_recv().ok()
    }

    /// Reset the per-second packet counters and return `(tcp_pps, udp_pps)`,
    /// warning if either exceeded the target tick rate. Mirrors the
    /// reference's `_tick_pps`, registered on the `1s` cadence.
    pub fn sample_pps(&self, target_tps: u64) -> (u64, u64) {
        let mut counters = self.counters.lock();
        let tcp_pps = counters.tcp_recv_this_second;
        let udp_pps = counters.udp_recv_this_second;
        counters.tcp_pps = tcp_pps;
        counters.udp_pps = udp_pps;
        counters.tcp_recv_this_second = 0;
        counters.udp_recv_this_second = 0;
        drop(counters);
        if tcp_pps > target_tps || udp_pps > target_tps {
            tracing::warn!(slot = self.slot_id, tcp_pps, udp_pps, target_tps, "PPS exceeds target TPS");
        }
        (tcp_pps, udp_pps)
    }

    /// Send one already-assembled payload directly to this session: framed
    /// and `ABG:`-compressed over reliable, or raw over datagram. Both paths
    /// update the traffic counters. A reliable write failure marks the
    /// session dead — the caller is expected to drive teardown afterward.
    pub fn send_self(&self, payload: &[u8], to_udp: bool) -> Result<()> {
        if !self.is_alive() {
            return Ok(());
        }

        if to_udp {
            let Some(peer) = self.udp_peer() else {
                return Ok(());
            };
            let body = if payload.len() > codec::COMPRESS_THRESHOLD {
                let mut encoder =
                    flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::best());
                encoder.write_all(payload)?;
                let mut framed = codec::ABG_MAGIC.to_vec();
                framed.extend_from_slice(&encoder.finish()?);
                framed
            } else {
                payload.to_vec()
            };
            match self.udp_socket.send_to(&body, peer) {
                Ok(_) => {
                    let mut counters = self.counters.lock();
                    counters.udp_sent_total += 1;
                    counters.udp_bytes_sent_total += body.len() as u64;
                }
                Err(e) => tracing::debug!(slot = self.slot_id, error = %e, "udp send failed"),
            }
            return Ok(());
        }

        let frame = codec::encode_frame(payload)?;
        let mut writer = self.reliable_writer.lock();
        match writer.write_all(&frame) {
            Ok(()) => {
                let mut counters = self.counters.lock();
                counters.tcp_sent_total += 1;
                counters.tcp_bytes_sent_total += frame.len() as u64;
                Ok(())
            }
            Err(e) => {
                tracing::debug!(slot = self.slot_id, error = %e, "reliable write failed, marking session dead");
                self.mark_dead();
                Err(RelayError::TransportWrite(e.to_string()))
            }
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("slot_id", &self.slot_id)
            .field("nickname", &self.nickname)
            .field("alive", &self.is_alive())
            .finish()
    }
}

/// Test-only helpers for constructing a `Session` without a real socket
/// pair, shared by this module's tests and `registry`'s.
#[cfg(test)]
pub mod test_support {
    use super::*;
    use std::net::{TcpListener, UdpSocket};

    pub fn dummy_session(slot_id: i32, nickname: &str) -> Arc<Session> {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server_side, _) = listener.accept().unwrap();
        drop(client);
        let udp = Arc::new(UdpSocket::bind("127.0.0.1:0").unwrap());
        Arc::new(Session::new(
            slot_id,
            "test-key".to_string(),
            nickname.to_string(),
            "admin".to_string(),
            false,
            HashMap::new(),
            server_side,
            udp,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::dummy_session;
    use super::*;

    #[test]
    fn unicycle_replacement_keeps_a_single_slot() {
        let session = dummy_session(0, "player");
        session.set_unicycle(Unicycle {
            car_id: Some(2),
            packet: "pkt".into(),
        });
        assert_eq!(session.unicycle().car_id, Some(2));
        session.set_unicycle(Unicycle {
            car_id: Some(5),
            packet: "pkt2".into(),
        });
        assert_eq!(session.unicycle().car_id, Some(5));
    }

    #[test]
    fn car_slots_cap_at_max_cars() {
        let session = dummy_session(0, "player");
        assert_eq!(session.cars().len(), 0);
        for i in 0..MAX_CARS {
            session.set_car(
                i,
                Some(Car {
                    packet: String::new(),
                    json: None,
                    json_ok: false,
                    unicycle: false,
                    over_spawn: false,
                    pos: None,
                }),
            );
        }
        assert_eq!(session.car_count(), MAX_CARS);
    }

    #[test]
    fn reliable_queue_drains_fifo() {
        let session = dummy_session(0, "player");
        session.push_reliable(b"one".to_vec());
        session.push_reliable(b"two".to_vec());
        assert_eq!(session.try_recv_reliable(), Some(b"one".to_vec()));
        assert_eq!(session.try_recv_reliable(), Some(b"two".to_vec()));
        assert_eq!(session.try_recv_reliable(), None);
    }

    #[test]
    fn pps_sample_resets_the_per_second_counter() {
        let session = dummy_session(0, "player");
        session.push_reliable(b"x".to_vec());
        session.push_reliable(b"y".to_vec());
        let (tcp_pps, _) = session.sample_pps(60);
        assert_eq!(tcp_pps, 2);
        let (tcp_pps_again, _) = session.sample_pps(60);
        assert_eq!(tcp_pps_again, 0);
    }
}
