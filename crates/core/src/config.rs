//! Read-only configuration tree. Loading and persisting the YAML document
//! itself lives outside the core (the `cli` crate owns the file path); this
//! module only defines the shape the rest of the crate consumes, with the
//! same defaults as the reference loader.

use serde::Deserialize;

fn default_guest_password() -> String {
    // The reference generates a random 6-byte hex token per install; a
    // fixed placeholder is used here since this crate never writes the
    // document back out (config persistence is out of scope).
    "change-me".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    pub key: Option<String>,
    #[serde(default = "default_true")]
    pub private: bool,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            key: None,
            private: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct GameConfig {
    #[serde(default = "default_map")]
    pub map: String,
    #[serde(default = "default_players")]
    pub players: usize,
    #[serde(default = "default_cars")]
    pub cars: usize,
}

impl Default for GameConfig {
    fn default() -> Self {
        Self {
            map: default_map(),
            players: default_players(),
            cars: default_cars(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerNetConfig {
    #[serde(default = "default_server_name")]
    pub name: String,
    #[serde(default = "default_description")]
    pub description: String,
    #[serde(default = "default_tags")]
    pub tags: String,
    #[serde(default = "default_server_ip")]
    pub server_ip: String,
    #[serde(default = "default_server_port")]
    pub server_port: u16,
}

impl Default for ServerNetConfig {
    fn default() -> Self {
        Self {
            name: default_server_name(),
            description: default_description(),
            tags: default_tags(),
            server_ip: default_server_ip(),
            server_port: default_server_port(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct OptionsConfig {
    #[serde(default = "default_encoding")]
    pub encoding: String,
    #[serde(default)]
    pub speed_limit: u64,
    #[serde(default)]
    pub use_queue: bool,
    #[serde(default)]
    pub use_lua: bool,
    #[serde(default = "default_true")]
    pub log_chat: bool,
}

impl Default for OptionsConfig {
    fn default() -> Self {
        Self {
            encoding: default_encoding(),
            speed_limit: 0,
            use_queue: false,
            use_lua: false,
            log_chat: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RconConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_rcon_ip")]
    pub server_ip: String,
    #[serde(default = "default_rcon_port")]
    pub server_port: u16,
    #[serde(default = "default_guest_password")]
    pub password: String,
}

impl Default for RconConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            server_ip: default_rcon_ip(),
            server_port: default_rcon_port(),
            password: default_guest_password(),
        }
    }
}

/// Root configuration document, deserialized from the operator's YAML file
/// (or, for tests and defaults, built programmatically).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub game: GameConfig,
    #[serde(default)]
    pub server: ServerNetConfig,
    #[serde(default)]
    pub options: OptionsConfig,
    #[serde(default)]
    pub rcon: RconConfig,
}

impl Config {
    /// Load a YAML document from `path`. Missing or malformed files are the
    /// caller's problem to report; this never falls back to defaults
    /// silently.
    pub fn load(path: impl AsRef<std::path::Path>) -> crate::error::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&text)?)
    }
}

fn default_true() -> bool {
    true
}
fn default_map() -> String {
    "gridmap_v2".to_string()
}
fn default_players() -> usize {
    8
}
fn default_cars() -> usize {
    1
}
fn default_server_name() -> String {
    "Relay Server".to_string()
}
fn default_description() -> String {
    "Welcome!".to_string()
}
fn default_tags() -> String {
    "Freeroam".to_string()
}
fn default_server_ip() -> String {
    "0.0.0.0".to_string()
}
fn default_server_port() -> u16 {
    30814
}
fn default_encoding() -> String {
    "utf-8".to_string()
}
fn default_rcon_ip() -> String {
    "127.0.0.1".to_string()
}
fn default_rcon_port() -> u16 {
    10383
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_reference_loader() {
        let cfg = Config::default();
        assert_eq!(cfg.game.map, "gridmap_v2");
        assert_eq!(cfg.game.players, 8);
        assert_eq!(cfg.server.server_port, 30814);
        assert!(cfg.auth.private);
        assert!(!cfg.options.use_lua);
    }

    #[test]
    fn partial_yaml_fills_in_remaining_defaults() {
        let yaml = "game:\n  players: 16\n";
        let cfg: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(cfg.game.players, 16);
        assert_eq!(cfg.game.map, "gridmap_v2");
        assert_eq!(cfg.server.server_port, 30814);
    }
}
