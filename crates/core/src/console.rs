//! Operator console command surface.
//!
//! This module only implements the command *logic* — reading input and
//! printing replies is the embedding binary's job (mirrors the reference's
//! split between `core.py`'s `console.add_command` registrations and the
//! actual REPL living in a separate `Console` module).

use std::net::{IpAddr, Shutdown};
use std::sync::Arc;
use std::time::Duration;

use crate::ratelimit::RateLimiter;
use crate::registry::Registry;
use crate::tick::TickScheduler;

/// Reply text for a console command. Every command returns one, even on
/// success, since the reference's commands are print-and-forget.
pub type Reply = String;

pub struct Console {
    registry: Arc<Registry>,
    rate_limiter: Arc<RateLimiter>,
    tick: Arc<TickScheduler>,
}

impl Console {
    pub fn new(registry: Arc<Registry>, rate_limiter: Arc<RateLimiter>, tick: Arc<TickScheduler>) -> Self {
        Self {
            registry,
            rate_limiter,
            tick,
        }
    }

    /// `list` — comma-separated `<nick>:<slot>` for every connected player.
    pub fn list(&self) -> Reply {
        format!("Players list: {}", self.registry.nickname_list(true))
    }

    /// `kick <nick>|:<id> [reason...]`
    pub fn kick(&self, args: &[&str]) -> Reply {
        let Some((&target, rest)) = args.split_first() else {
            return "Usage: kick <nick>|:<id> [reason]\nExamples:\n\tkick admin bad boy\n\tkick :0 bad boy".to_string();
        };
        let reason = if rest.is_empty() {
            "kicked by console.".to_string()
        } else {
            rest.join(" ")
        };

        let session = if let Some(slot_str) = target.strip_prefix(':') {
            slot_str
                .parse::<i32>()
                .ok()
                .and_then(|slot| self.registry.by_slot(slot))
        } else {
            self.registry.by_nickname(target)
        };

        let Some(session) = session else {
            return "Client not found.".to_string();
        };

        session.mark_dead();
        if let Some(writer) = session.reliable_writer() {
            let _ = writer.shutdown(Shutdown::Both);
        }
        tracing::info!(slot = session.slot_id, nickname = %session.nickname, reason, "kicked from console");
        format!("Kicked {} ({}).", session.nickname, reason)
    }

    /// `tps` — rolling average across the reference's 2s/5s/30s/60s windows.
    pub fn tps(&self) -> Reply {
        let report = self.tick.report();
        format!(
            "{:.2}TPS; For last 5s, 30s, 60s: {:.2}, {:.2}, {:.2}.",
            report.last_2s, report.last_5s, report.last_30s, report.last_60s
        )
    }

    /// `rl info|ban <ip> <sec>|unban <ip>|help`
    pub fn rate_limit(&self, args: &[&str]) -> Reply {
        match args {
            ["info"] | [] => {
                let banned = self.rate_limiter.banned_ips();
                if banned.is_empty() {
                    "No IPs currently banned.".to_string()
                } else {
                    let list: Vec<String> = banned.iter().map(IpAddr::to_string).collect();
                    format!("Banned: {}", list.join(", "))
                }
            }
            ["ban", ip, secs] => match (ip.parse::<IpAddr>(), secs.parse::<u64>()) {
                (Ok(ip), Ok(secs)) => {
                    self.rate_limiter.ban(ip, Duration::from_secs(secs));
                    format!("Banned {ip} for {secs}s.")
                }
                _ => "Usage: rl ban <ip> <seconds>".to_string(),
            },
            ["unban", ip] => match ip.parse::<IpAddr>() {
                Ok(ip) => {
                    if self.rate_limiter.unban(ip) {
                        format!("Unbanned {ip}.")
                    } else {
                        format!("{ip} was not banned.")
                    }
                }
                Err(_) => "Usage: rl unban <ip>".to_string(),
            },
            _ => self.rate_limit_help(),
        }
    }

    fn rate_limit_help(&self) -> Reply {
        "Usage: rl info|ban <ip> <seconds>|unban <ip>|help".to_string()
    }

    /// `plugins reload|load|unload|list`, and bare `plugins` as shorthand for
    /// `plugins list` — scripting plugin loading is out of scope, so these
    /// only report that there is nothing to manage.
    pub fn plugins(&self, args: &[&str]) -> Reply {
        match args.first() {
            None | Some(&"list") => "No plugins loaded.".to_string(),
            Some(&"reload") | Some(&"load") | Some(&"unload") => {
                "Plugin loading is not supported by this server.".to_string()
            }
            _ => "Usage: plugins reload|load|unload|list".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventBus;
    use crate::session::test_support::dummy_session;

    fn fixture() -> Console {
        let registry = Arc::new(Registry::new(4));
        let rate_limiter = Arc::new(RateLimiter::default());
        let tick = Arc::new(TickScheduler::new(Arc::new(EventBus::new())));
        Console::new(registry, rate_limiter, tick)
    }

    #[test]
    fn list_reports_empty_server() {
        let console = fixture();
        assert_eq!(console.list(), "Players list: ");
    }

    #[test]
    fn list_reports_nick_colon_slot() {
        let session = dummy_session(0, "racer");
        let registry = Arc::new(Registry::new(4));
        registry.insert(|_| Arc::clone(&session));
        let console = Console::new(
            Arc::clone(&registry),
            Arc::new(RateLimiter::default()),
            Arc::new(TickScheduler::new(Arc::new(EventBus::new()))),
        );
        assert_eq!(console.list(), "Players list: racer:0");
    }

    #[test]
    fn kick_without_args_prints_usage() {
        let console = fixture();
        assert!(console.kick(&[]).starts_with("Usage:"));
    }

    #[test]
    fn kick_unknown_nickname_reports_not_found() {
        let console = fixture();
        assert_eq!(console.kick(&["nobody"]), "Client not found.");
    }

    #[test]
    fn kick_by_nickname_marks_session_dead() {
        let session = dummy_session(0, "racer");
        let registry = Arc::new(Registry::new(4));
        registry.insert(|_| Arc::clone(&session));
        let console = Console::new(
            Arc::clone(&registry),
            Arc::new(RateLimiter::default()),
            Arc::new(TickScheduler::new(Arc::new(EventBus::new()))),
        );
        let reply = console.kick(&["racer", "being", "rude"]);
        assert!(reply.contains("being rude"));
        assert!(!session.is_alive());
    }

    #[test]
    fn rate_limit_info_reports_no_bans_initially() {
        let console = fixture();
        assert_eq!(console.rate_limit(&["info"]), "No IPs currently banned.");
    }

    #[test]
    fn rate_limit_ban_then_unban_round_trips() {
        let console = fixture();
        assert!(console.rate_limit(&["ban", "203.0.113.9", "60"]).starts_with("Banned"));
        assert!(console.rate_limit(&["unban", "203.0.113.9"]).starts_with("Unbanned"));
    }

    #[test]
    fn plugins_list_reports_nothing_loaded() {
        let console = fixture();
        assert_eq!(console.plugins(&["list"]), "No plugins loaded.");
    }

    #[test]
    fn bare_plugins_is_shorthand_for_list() {
        let console = fixture();
        assert_eq!(console.plugins(&[]), console.plugins(&["list"]));
    }
}
