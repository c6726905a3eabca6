//! Top-level orchestrator: owns every long-lived subsystem and the threads
//! that drive them. Mirrors the reference's `Core.main`, which wires the
//! same pieces together before handing control to `asyncio.gather`.

use std::net::{TcpListener, UdpSocket};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use crate::config::Config;
use crate::console::Console;
use crate::error::{RelayError, Result};
use crate::event::{EventBus, EventContext, EventValue, topics};
use crate::heartbeat::HeartbeatReporter;
use crate::identity::IdentityClient;
use crate::mods::ModInventory;
use crate::ratelimit::RateLimiter;
use crate::registry::Registry;
use crate::session::dispatch::Dispatcher;
use crate::tick::TickScheduler;
use crate::transport::{tcp, udp};

/// Directory the mod inventory scans, matching the reference's `mods_dir`.
const MODS_DIR: &str = "mods";

/// Owns every subsystem and the thread lifecycle that drives them. Building
/// one does no I/O; [`Server::start`] binds the sockets and spawns threads.
pub struct Server {
    config: Arc<Config>,
    registry: Arc<Registry>,
    bus: Arc<EventBus>,
    rate_limiter: Arc<RateLimiter>,
    dispatcher: Arc<Dispatcher>,
    identity: Arc<IdentityClient>,
    mods: Arc<ModInventory>,
    tick: Arc<TickScheduler>,
    heartbeat: Arc<HeartbeatReporter>,
    console: Arc<Console>,
    running: Arc<AtomicBool>,
}

impl Server {
    pub fn new(config: Config) -> Result<Self> {
        let config = Arc::new(config);
        let registry = Arc::new(Registry::new(config.game.players));
        let bus = Arc::new(EventBus::new());
        let rate_limiter = Arc::new(RateLimiter::default());
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&registry),
            Arc::clone(&bus),
            config.options.log_chat,
            config.game.cars,
        ));
        let identity = Arc::new(IdentityClient::default());
        let mods = Arc::new(ModInventory::scan(MODS_DIR)?);
        let tick = Arc::new(TickScheduler::new(Arc::clone(&bus)));
        let heartbeat = Arc::new(HeartbeatReporter::new(
            Arc::clone(&registry),
            Arc::clone(&mods),
            Arc::clone(&config),
        ));
        let console = Arc::new(Console::new(
            Arc::clone(&registry),
            Arc::clone(&rate_limiter),
            Arc::clone(&tick),
        ));

        Ok(Self {
            config,
            registry,
            bus,
            rate_limiter,
            dispatcher,
            identity,
            mods,
            tick,
            heartbeat,
            console,
            running: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Binds the reliable and datagram sockets and spawns the accept,
    /// datagram, tick and heartbeat threads.
    pub fn start(&mut self) -> Result<()> {
        if self.running.load(Ordering::SeqCst) {
            return Err(RelayError::AlreadyRunning);
        }
        self.running.store(true, Ordering::SeqCst);

        let addr = format!("{}:{}", self.config.server.server_ip, self.config.server.server_port);
        let listener = TcpListener::bind(&addr)?;
        let udp_socket: Arc<UdpSocket> = Arc::new(udp::bind(&addr)?);

        tracing::info!(%addr, "relay server listening");

        // Matches `heartbeat(test=True)` being awaited once before the main
        // task group starts, so the first directory announcement isn't
        // delayed by the full 15s interval.
        self.heartbeat.tick();

        self.register_periodic_hooks();

        let shared = Arc::new(tcp::Shared {
            registry: Arc::clone(&self.registry),
            bus: Arc::clone(&self.bus),
            dispatcher: Arc::clone(&self.dispatcher),
            rate_limiter: Arc::clone(&self.rate_limiter),
            identity: Arc::clone(&self.identity),
            mods: Arc::clone(&self.mods),
            config: Arc::clone(&self.config),
            udp_socket: Arc::clone(&udp_socket),
        });
        let running = Arc::clone(&self.running);
        thread::spawn(move || tcp::accept_loop(listener, shared, running));

        let registry = Arc::clone(&self.registry);
        let running = Arc::clone(&self.running);
        thread::spawn(move || udp::run(&udp_socket, &registry, &running));

        let tick = Arc::clone(&self.tick);
        let running = Arc::clone(&self.running);
        thread::spawn(move || tick.run(running));

        let heartbeat = Arc::clone(&self.heartbeat);
        let running = Arc::clone(&self.running);
        thread::spawn(move || heartbeat.run(running));

        Ok(())
    }

    /// `serverTick_1s` hooks matching `Core._check_alive` and
    /// `Core._send_online`: forcibly unblock dead sessions' read loops, and
    /// broadcast the current player count to everyone still connected.
    fn register_periodic_hooks(&self) {
        let registry = Arc::clone(&self.registry);
        self.bus.register_sync(topics::SERVER_TICK_1S, move |_: &EventContext| {
            for session in registry.live_sessions() {
                if !session.is_alive() {
                    if let Some(writer) = session.reliable_writer() {
                        use std::net::Shutdown;
                        let _ = writer.shutdown(Shutdown::Both);
                    }
                }
            }
            EventValue::Unit
        });

        let registry = Arc::clone(&self.registry);
        let config = Arc::clone(&self.config);
        self.bus.register_sync(topics::SERVER_TICK_1S, move |_: &EventContext| {
            let announcement = format!(
                "Ss{}/{}:{}",
                registry.count(),
                config.game.players,
                registry.nickname_list(false)
            );
            for session in registry.live_sessions() {
                if session.is_alive() {
                    let _ = session.send_self(announcement.as_bytes(), false);
                }
            }
            EventValue::Unit
        });
    }

    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        self.bus
            .emit_both(&EventContext::new(topics::SERVER_STOPPED));
        tracing::info!("server stopping");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    pub fn console(&self) -> Arc<Console> {
        Arc::clone(&self.console)
    }

    pub fn config(&self) -> Arc<Config> {
        Arc::clone(&self.config)
    }

    pub fn registry(&self) -> Arc<Registry> {
        Arc::clone(&self.registry)
    }
}
