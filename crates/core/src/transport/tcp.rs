//! Reliable listener: accepts one connection per role byte (`C` full client
//! session, `D` secondary download socket, `P` ping) and drives the `C` path
//! through VERSION_CHECK, KEY_EXCHANGE, IDENTITY, ADMIT, SYNC and PLAY up to
//! teardown. Mirrors the reference's `TCPServer.handle_client` and
//! `Client._looper`/`_remove_me`.

use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use crate::codec::{self, Frame};
use crate::config::Config;
use crate::error::{RelayError, Result};
use crate::event::{EventBus, EventContext, topics};
use crate::heartbeat::CLIENT_MAJOR_VERSION;
use crate::identity::IdentityClient;
use crate::mods::{self, ModInventory};
use crate::ratelimit::RateLimiter;
use crate::registry::Registry;
use crate::session::Session;
use crate::session::dispatch::Dispatcher;

const POLL_INTERVAL: Duration = Duration::from_millis(50);
/// Largest accepted key, matching the reference's `len(data) > 50` check.
const MAX_KEY_LEN: usize = 50;

/// Everything a connection handler needs, shared across every accepted
/// socket for the lifetime of the server.
pub struct Shared {
    pub registry: Arc<Registry>,
    pub bus: Arc<EventBus>,
    pub dispatcher: Arc<Dispatcher>,
    pub rate_limiter: Arc<RateLimiter>,
    pub identity: Arc<IdentityClient>,
    pub mods: Arc<ModInventory>,
    pub config: Arc<Config>,
    pub udp_socket: Arc<UdpSocket>,
}

/// Non-blocking accept loop: checks `running` between accepts with a 50ms
/// poll interval so shutdown happens promptly without a dedicated signal.
pub fn accept_loop(listener: TcpListener, shared: Arc<Shared>, running: Arc<AtomicBool>) {
    if listener.set_nonblocking(true).is_err() {
        tracing::error!("failed to set listener non-blocking, accept loop cannot start");
        return;
    }
    tracing::debug!("reliable listener started");
    while running.load(Ordering::Relaxed) {
        match listener.accept() {
            Ok((stream, addr)) => {
                if stream.set_nonblocking(false).is_err() {
                    continue;
                }
                let shared = Arc::clone(&shared);
                thread::spawn(move || handle_connection(stream, addr, &shared));
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(POLL_INTERVAL);
            }
            Err(e) => {
                tracing::warn!(error = %e, "accept error");
            }
        }
    }
    tracing::debug!("reliable listener stopped");
}

fn handle_connection(mut stream: TcpStream, addr: SocketAddr, shared: &Shared) {
    if shared.rate_limiter.check(addr.ip()) {
        if shared.rate_limiter.should_notify(addr.ip()) {
            let _ = send_framed(&mut stream, b"Eip banned.");
        }
        let _ = stream.shutdown(Shutdown::Both);
        return;
    }

    let mut role = [0u8; 1];
    if stream.read_exact(&mut role).is_err() {
        return;
    }

    match role[0] {
        b'C' => handle_client_role(stream, addr, shared),
        b'D' => handle_download_role(stream, shared),
        b'P' => {
            let _ = stream.write_all(b"P");
            let _ = stream.shutdown(Shutdown::Both);
        }
        other => {
            tracing::warn!(role = other as char, "unknown role byte, closing");
            let _ = stream.shutdown(Shutdown::Both);
        }
    }
}

/// `D` role: the second byte is the slot id this socket is downloading for.
fn handle_download_role(mut stream: TcpStream, shared: &Shared) {
    let mut slot_byte = [0u8; 1];
    if stream.read_exact(&mut slot_byte).is_err() {
        return;
    }
    let slot_id = slot_byte[0] as i32;
    match shared.registry.by_slot(slot_id) {
        Some(session) => {
            tracing::debug!(slot_id, nickname = %session.nickname, "download socket attached");
            session.set_download_writer(stream);
        }
        None => {
            tracing::debug!(slot_id, "download socket for unknown slot, closing");
            let _ = stream.shutdown(Shutdown::Both);
        }
    }
}

fn send_framed(stream: &mut TcpStream, payload: &[u8]) -> Result<()> {
    let frame = codec::encode_frame(payload)?;
    stream.write_all(&frame)?;
    Ok(())
}

fn kick_before_session(stream: &mut TcpStream, reason: &str) {
    let _ = send_framed(stream, format!("K{reason}").as_bytes());
    let _ = stream.shutdown(Shutdown::Both);
}

fn kick_session(session: &Arc<Session>, reason: &str) {
    tracing::info!(slot = session.slot_id, nickname = %session.nickname, reason, "kicked");
    let _ = session.send_self(format!("K{reason}").as_bytes(), false);
    session.mark_dead();
}

/// `C` role: runs VERSION_CHECK through teardown for one client.
fn handle_client_role(mut stream: TcpStream, addr: SocketAddr, shared: &Shared) {
    // VERSION_CHECK
    let version = match codec::read_frame(&mut stream) {
        Ok(Frame::Payload(p)) => p,
        Ok(Frame::Closed) => return,
        Err(e) => {
            if codec::is_oversize_header(&e) {
                kick_before_session(&mut stream, "Header size limit exceeded");
            }
            return;
        }
    };
    let expected = format!("VC{CLIENT_MAJOR_VERSION}");
    if version != expected.as_bytes() {
        kick_before_session(&mut stream, "Outdated client, please update.");
        return;
    }

    // KEY_EXCHANGE
    if send_framed(&mut stream, b"A").is_err() {
        return;
    }
    let key = match codec::read_frame(&mut stream) {
        Ok(Frame::Payload(p)) => p,
        Ok(Frame::Closed) => return,
        Err(e) => {
            if codec::is_oversize_header(&e) {
                kick_before_session(&mut stream, "Header size limit exceeded");
            }
            return;
        }
    };
    if key.is_empty() || key.len() > MAX_KEY_LEN {
        kick_before_session(&mut stream, "Bad key.");
        return;
    }
    let key = match String::from_utf8(key) {
        Ok(k) => k,
        Err(_) => {
            kick_before_session(&mut stream, "Bad key.");
            return;
        }
    };

    // IDENTITY
    shared
        .bus
        .emit_both(&EventContext::new(topics::PLAYER_SENT_KEY));
    let identity = match shared.identity.resolve(&key, addr.ip()) {
        Ok(identity) => identity,
        Err(e) => {
            tracing::warn!(error = %e, "identity resolution failed");
            kick_before_session(&mut stream, "Auth server failed.");
            return;
        }
    };
    shared.bus.emit_both(
        &EventContext::new(topics::PLAYER_AUTHENTICATED).with_nickname(identity.username.clone()),
    );

    // ADMIT
    if let Some(incumbent) = shared.registry.by_nickname(&identity.username) {
        if incumbent.guest == identity.guest {
            kick_session(&incumbent, "Stale session replaced by a new connection.");
        }
    }
    if shared.registry.count() >= shared.config.game.players {
        kick_before_session(&mut stream, "Server is full.");
        return;
    }

    let reliable_writer = match stream.try_clone() {
        Ok(s) => s,
        Err(_) => return,
    };
    let Some(session) = shared.registry.insert(|slot_id| {
        Arc::new(Session::new(
            slot_id,
            key,
            identity.username.clone(),
            identity.roles.clone(),
            identity.guest,
            identity.identifiers.clone(),
            reliable_writer,
            Arc::clone(&shared.udp_socket),
        ))
    }) else {
        kick_before_session(&mut stream, "Server is full.");
        return;
    };

    tracing::info!(slot = session.slot_id, nickname = %session.nickname, %addr, "player admitted");

    // SYNC
    if session
        .send_self(format!("P{}", session.slot_id).as_bytes(), false)
        .is_err()
    {
        teardown(&session, shared);
        return;
    }
    if !run_sync_loop(&mut stream, &session, shared) {
        teardown(&session, shared);
        return;
    }

    // PLAY: register the tick-driven inbound pump, then block on reads.
    let hooks = register_tick_hooks(&session, shared);
    *session.tick_hooks.lock() = hooks;

    read_loop(&mut stream, &session);

    teardown(&session, shared);
}

/// Drives the mod-transfer sub-loop until the client sends `Done` or the
/// connection goes away. Returns `false` if the session should tear down
/// without entering PLAY.
fn run_sync_loop(stream: &mut TcpStream, session: &Arc<Session>, shared: &Shared) -> bool {
    loop {
        let payload = match codec::read_frame(stream) {
            Ok(Frame::Payload(p)) => p,
            Ok(Frame::Closed) => return false,
            Err(e) => {
                if codec::is_oversize_header(&e) {
                    let _ = session.send_self(b"KHeader size limit exceeded", false);
                }
                return false;
            }
        };

        if payload == b"Done" {
            let map = format!("M/levels/{}/info.json", shared.config.game.map);
            let _ = session.send_self(map.as_bytes(), false);
            return true;
        }

        if payload.starts_with(b"SR") {
            let _ = session.send_self(shared.mods.list_reply().as_bytes(), false);
            continue;
        }

        if let Some(path) = payload.strip_prefix(b"f") {
            let path = String::from_utf8_lossy(path).into_owned();
            let Some(entry) = shared.mods.find(&path).cloned() else {
                let _ = session.send_self(b"CO", false);
                kick_session(session, &format!("Not allowed mod: {path}"));
                return false;
            };
            let _ = session.send_self(b"AG", false);

            let mut waited = 0u32;
            while !session.has_download_writer() {
                if waited >= mods::DOWNLOAD_SOCKET_WAIT_STEPS {
                    kick_session(session, "Missing download socket");
                    return false;
                }
                thread::sleep(mods::DOWNLOAD_SOCKET_POLL_INTERVAL);
                waited += 1;
            }

            let use_queue = shared.config.options.use_queue;
            shared.mods.acquire_queue(use_queue);
            let result = (|| -> Result<()> {
                let mut primary = session
                    .reliable_writer()
                    .ok_or_else(|| RelayError::TransferFailed("no reliable writer".to_string()))?;
                let mut download = session
                    .download_writer()
                    .ok_or_else(|| RelayError::TransferFailed("no download writer".to_string()))?;
                shared
                    .mods
                    .upload(&entry, &mut primary, &mut download, shared.config.options.speed_limit)?;
                Ok(())
            })();
            shared.mods.release_queue(use_queue);

            if let Err(e) = result {
                kick_session(session, &format!("Error sending mod: {e}"));
                return false;
            }
            continue;
        }

        tracing::debug!(slot = session.slot_id, "unrecognized sync message, ignoring");
    }
}

/// Registers this session's per-tick hooks (reliable pump, datagram pump,
/// PPS sampler), matching the reference's three `ev.register` calls in
/// `_looper`.
fn register_tick_hooks(session: &Arc<Session>, shared: &Shared) -> Vec<crate::event::SubscriptionId> {
    let dispatcher = Arc::clone(&shared.dispatcher);
    let tcp_session = Arc::clone(session);
    let tcp_id = shared.bus.register_sync(topics::SERVER_TICK, move |_| {
        if let Some(payload) = tcp_session.try_recv_reliable() {
            dispatcher.handle_reliable(&tcp_session, &payload);
        }
        crate::event::EventValue::Unit
    });

    let dispatcher = Arc::clone(&shared.dispatcher);
    let udp_session = Arc::clone(session);
    let udp_id = shared.bus.register_sync(topics::SERVER_TICK, move |_| {
        if let Some(payload) = udp_session.try_recv_datagram() {
            dispatcher.handle_datagram(&udp_session, &payload);
        }
        crate::event::EventValue::Unit
    });

    let pps_session = Arc::clone(session);
    let target_tps = u64::from(crate::tick::TARGET_TPS);
    let pps_id = shared.bus.register_sync(topics::SERVER_TICK_1S, move |_| {
        pps_session.sample_pps(target_tps);
        crate::event::EventValue::Unit
    });

    vec![tcp_id, udp_id, pps_id]
}

/// Blocking read loop: feeds decoded frames into the session's reliable
/// inbound queue until the peer closes or sends something malformed.
fn read_loop(stream: &mut TcpStream, session: &Arc<Session>) {
    loop {
        if !session.is_alive() {
            return;
        }
        match codec::read_frame(stream) {
            Ok(Frame::Payload(payload)) => session.push_reliable(payload),
            Ok(Frame::Closed) => return,
            Err(e) => {
                tracing::debug!(slot = session.slot_id, error = %e, "reliable read error");
                if codec::is_oversize_header(&e) {
                    let _ = session.send_self(b"KHeader size limit exceeded", false);
                }
                return;
            }
        }
    }
}

/// Teardown: the 300ms grace sleep, owned-car removal broadcasts, the
/// disconnect announcement, hook/registry cleanup and socket close.
/// Mirrors the reference's `Client._remove_me`.
fn teardown(session: &Arc<Session>, shared: &Shared) {
    session.mark_dead();
    thread::sleep(Duration::from_millis(300));

    for (car_id, _) in session.cars() {
        let payload = format!("Od:{}-{car_id}", session.slot_id);
        shared.dispatcher.broadcast(session, payload.as_bytes(), false, false);
    }
    if session.is_ready() {
        let payload = format!("J{} disconnected!", session.nickname);
        shared.dispatcher.broadcast(session, payload.as_bytes(), false, false);
    }

    shared
        .bus
        .emit_both(&EventContext::new(topics::PLAYER_DISCONNECT).with_slot(session.slot_id));

    for id in session.tick_hooks.lock().drain(..) {
        shared.bus.unregister(id);
    }

    shared.registry.remove(session.slot_id);

    if let Some(writer) = session.reliable_writer() {
        let _ = writer.shutdown(Shutdown::Both);
    }
    if let Some(writer) = session.download_writer() {
        let _ = writer.shutdown(Shutdown::Both);
    }

    tracing::info!(slot = session.slot_id, nickname = %session.nickname, "session closed");
}
