//! Heartbeat reporter: periodically announces this server to the public
//! directory so it shows up in the in-game server list.
//!
//! Mirrors `core.Core.heartbeat`: try each mirror in order, fall back to
//! "direct" mode (no further announcements) once every mirror refuses or
//! is unreachable, and never announce at all when the operator set
//! `private`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::config::Config;
use crate::mods::ModInventory;
use crate::registry::Registry;

/// Directory mirrors, tried in order until one accepts the report.
const MIRRORS: &[&str] = &[
    "backend.beammp.com",
    "backup1.beammp.com",
    "backup2.beammp.com",
];

/// Protocol version reported in the BeamMP `version` field.
pub const BEAMMP_VERSION: &str = "3.4.1";
/// Client major version reported in `clientversion`, matching the literal
/// the reliable listener checks during `VERSION_CHECK`.
pub const CLIENT_MAJOR_VERSION: &str = "2.0";

const INTERVAL: Duration = Duration::from_secs(15);

#[derive(Debug, Deserialize)]
struct HeartbeatResponse {
    status: Option<String>,
    #[allow(dead_code)]
    code: Option<String>,
    msg: Option<String>,
}

/// Owns the directory-facing HTTP client and the sticky "gone direct" flag.
pub struct HeartbeatReporter {
    registry: Arc<Registry>,
    mods: Arc<ModInventory>,
    config: Arc<Config>,
    http: reqwest::blocking::Client,
    direct: AtomicBool,
}

impl HeartbeatReporter {
    pub fn new(registry: Arc<Registry>, mods: Arc<ModInventory>, config: Arc<Config>) -> Self {
        Self {
            registry,
            mods,
            config,
            http: reqwest::blocking::Client::new(),
            direct: AtomicBool::new(false),
        }
    }

    pub fn is_direct(&self) -> bool {
        self.direct.load(Ordering::Relaxed)
    }

    /// Blocking loop, meant to be spawned on its own thread. Returns once
    /// `running` is cleared.
    pub fn run(&self, running: Arc<AtomicBool>) {
        while running.load(Ordering::Relaxed) {
            self.tick();
            std::thread::sleep(INTERVAL);
        }
    }

    /// One report attempt. Public so the server can run it once at startup
    /// (`test` semantics in the reference) without waiting out the first
    /// interval.
    pub fn tick(&self) {
        if self.config.auth.private || self.is_direct() {
            return;
        }

        let form = self.build_form();
        for mirror in MIRRORS {
            let url = format!("https://{mirror}/heartbeat");
            let response = match self
                .http
                .post(&url)
                .header("api-v", "2")
                .form(&form)
                .send()
            {
                Ok(r) => r,
                Err(e) => {
                    tracing::debug!(mirror, error = %e, "heartbeat mirror unreachable");
                    continue;
                }
            };

            let body: HeartbeatResponse = match response.json() {
                Ok(b) => b,
                Err(e) => {
                    tracing::debug!(mirror, error = %e, "heartbeat response unparseable");
                    continue;
                }
            };

            match body.status.as_deref() {
                Some("2000") => tracing::debug!(msg = body.msg.as_deref().unwrap_or(""), "heartbeat authenticated"),
                Some("200") => tracing::debug!(msg = body.msg.as_deref().unwrap_or(""), "heartbeat session resumed"),
                _ => {
                    tracing::error!(
                        msg = body.msg.as_deref().unwrap_or("no reason given"),
                        "directory refused heartbeat, switching to direct mode"
                    );
                    self.direct.store(true, Ordering::Relaxed);
                }
            }
            return;
        }

        tracing::warn!("no heartbeat mirror reachable, switching to direct mode");
        self.direct.store(true, Ordering::Relaxed);
    }

    fn build_form(&self) -> Vec<(&'static str, String)> {
        let map = if self.config.game.map.contains('/') {
            self.config.game.map.clone()
        } else {
            format!("/levels/{}/info.json", self.config.game.map)
        };

        let mut tags = self.config.server.tags.replace(", ", ";").replace(',', ";");
        if !tags.is_empty() && !tags.ends_with(';') {
            tags.push(';');
        }

        let players_list: String = self
            .registry
            .live_sessions()
            .iter()
            .map(|s| format!("{};", s.nickname))
            .collect();

        vec![
            ("uuid", self.config.auth.key.clone().unwrap_or_default()),
            ("players", self.registry.count().to_string()),
            ("maxplayers", self.config.game.players.to_string()),
            ("port", self.config.server.server_port.to_string()),
            ("map", map),
            ("private", self.config.auth.private.to_string()),
            ("version", BEAMMP_VERSION.to_string()),
            ("clientversion", CLIENT_MAJOR_VERSION.to_string()),
            ("name", self.config.server.name.clone()),
            ("tags", tags),
            ("guests", (!self.config.auth.private).to_string()),
            ("modlist", self.mods.modlist_tag()),
            ("modstotalsize", self.mods.total_size().to_string()),
            ("modstotal", self.mods.mods().len().to_string()),
            ("playerslist", players_list),
            ("desc", self.config.server.description.clone()),
            ("pass", "false".to_string()),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture() -> HeartbeatReporter {
        HeartbeatReporter::new(
            Arc::new(Registry::new(4)),
            Arc::new(ModInventory::scan(std::env::temp_dir()).unwrap()),
            Arc::new(Config::default()),
        )
    }

    #[test]
    fn private_config_never_calls_out() {
        let reporter = fixture();
        reporter.tick();
        assert!(!reporter.is_direct());
    }

    #[test]
    fn map_without_slash_gets_levels_prefix() {
        let reporter = fixture();
        let form = reporter.build_form();
        let map = form.iter().find(|(k, _)| *k == "map").unwrap();
        assert_eq!(map.1, "/levels/gridmap_v2/info.json");
    }

    #[test]
    fn tags_get_semicolon_terminated() {
        let mut config = Config::default();
        config.server.tags = "Drift, Freeroam".to_string();
        let reporter = HeartbeatReporter::new(
            Arc::new(Registry::new(4)),
            Arc::new(ModInventory::scan(std::env::temp_dir()).unwrap()),
            Arc::new(config),
        );
        let form = reporter.build_form();
        let tags = form.iter().find(|(k, _)| *k == "tags").unwrap();
        assert_eq!(tags.1, "Drift;Freeroam;");
    }
}
