//! # relay — multiplayer driving-simulation relay server
//!
//! Relays per-vehicle state, chat and named events between connected
//! clients over a dual-transport session (a reliable TCP connection for
//! the handshake, chat and authoritative state, plus an unreliable UDP
//! datagram path for high-frequency position updates).
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────┐
//! │  cli            — config load, process lifetime   │
//! ├──────────────────────────────────────────────────┤
//! │  Server         — orchestrator, thread lifecycle  │
//! ├──────────────────────────────────────────────────┤
//! │  transport::tcp — handshake + reliable read loop  │
//! │  transport::udp — datagram listener               │
//! ├──────────────────────────────────────────────────┤
//! │  session        — per-client state, car table     │
//! │  session::dispatch — protocol code -> mutation    │
//! │  registry       — slot table, nickname index      │
//! ├──────────────────────────────────────────────────┤
//! │  event          — topic-keyed pub/sub bus         │
//! │  tick           — fixed-rate scheduler             │
//! │  ratelimit      — per-IP sliding window + bans     │
//! ├──────────────────────────────────────────────────┤
//! │  identity       — key -> player identity (HTTP)   │
//! │  mods           — mod inventory + split uploader   │
//! │  heartbeat      — public directory announcements  │
//! │  console        — operator command surface        │
//! └──────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick start
//!
//! ```no_run
//! use relay::{Config, Server};
//!
//! let config = Config::default();
//! let mut server = Server::new(config).unwrap();
//! server.start().unwrap();
//! ```
//!
//! ## Crate layout
//!
//! - [`server`] — High-level [`Server`] orchestrator.
//! - [`config`] — [`Config`] document and its defaults.
//! - [`codec`] — Reliable-frame and datagram wire format.
//! - [`event`] — Topic-keyed event bus, native and scripting-bridge subscribers.
//! - [`tick`] — Fixed-rate tick scheduler and cadence topics.
//! - [`ratelimit`] — Per-IP sliding window limiter with timed bans.
//! - [`registry`] — Session slot table and nickname index.
//! - [`session`] — Per-client state and protocol dispatch.
//! - [`transport`] — TCP handshake listener, UDP datagram listener.
//! - [`identity`] — Client to the external identity service.
//! - [`mods`] — Mod inventory and the parallel-halves uploader.
//! - [`heartbeat`] — Public directory heartbeat reporter.
//! - [`console`] — Operator console command surface.
//! - [`error`] — [`RelayError`] enum and [`Result`] alias.

pub mod codec;
pub mod config;
pub mod console;
pub mod error;
pub mod event;
pub mod heartbeat;
pub mod identity;
pub mod mods;
pub mod ratelimit;
pub mod registry;
pub mod server;
pub mod session;
pub mod tick;
pub mod transport;

pub use config::Config;
pub use error::{RelayError, Result};
pub use server::Server;
