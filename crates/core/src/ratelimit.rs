//! Per-source-IP sliding window rate limiter with timed bans.

use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Default window: 50 calls per 10 seconds, then a 300 second ban.
pub const DEFAULT_MAX_CALLS: u32 = 50;
/// Default window length.
pub const DEFAULT_PERIOD: Duration = Duration::from_secs(10);
/// Default ban duration once the window is exceeded.
pub const DEFAULT_BAN_TIME: Duration = Duration::from_secs(300);

struct IpState {
    calls: VecDeque<Instant>,
    banned_until: Option<Instant>,
    notified: bool,
}

impl Default for IpState {
    fn default() -> Self {
        Self {
            calls: VecDeque::new(),
            banned_until: None,
            notified: false,
        }
    }
}

/// Sliding-window call limiter keyed by source IP, with a timed ban once an
/// IP exceeds `max_calls` inside `period`.
pub struct RateLimiter {
    max_calls: u32,
    period: Duration,
    ban_time: Duration,
    state: Mutex<HashMap<IpAddr, IpState>>,
}

impl RateLimiter {
    pub fn new(max_calls: u32, period: Duration, ban_time: Duration) -> Self {
        Self {
            max_calls,
            period,
            ban_time,
            state: Mutex::new(HashMap::new()),
        }
    }

    /// Record a call from `ip` and report whether it is currently banned.
    ///
    /// Mirrors the sliding-window semantics of the reference limiter: a call
    /// already under an active ban short-circuits without touching the
    /// window; otherwise the call is recorded, the window is trimmed to
    /// `period`, and exceeding `max_calls` inside the window triggers a ban
    /// and clears the window.
    pub fn check(&self, ip: IpAddr) -> bool {
        let now = Instant::now();
        let mut state = self.state.lock();
        let entry = state.entry(ip).or_default();

        if let Some(until) = entry.banned_until {
            if now < until {
                return true;
            }
        }

        entry.calls.push_back(now);
        while let Some(&front) = entry.calls.front() {
            if front + self.period < now {
                entry.calls.pop_front();
            } else {
                break;
            }
        }

        if entry.calls.len() as u32 > self.max_calls {
            entry.banned_until = Some(now + self.ban_time);
            entry.calls.clear();
            return true;
        }

        entry.notified = false;
        false
    }

    /// Whether `ip` should receive the one-shot "banned" notice: true only
    /// the first time `check` reports a ban for an otherwise-fresh entry.
    pub fn should_notify(&self, ip: IpAddr) -> bool {
        let mut state = self.state.lock();
        let entry = state.entry(ip).or_default();
        if entry.notified {
            false
        } else {
            entry.notified = true;
            true
        }
    }

    /// List IPs currently serving a ban, for the `rl info` console command.
    pub fn banned_ips(&self) -> Vec<IpAddr> {
        let now = Instant::now();
        self.state
            .lock()
            .iter()
            .filter(|(_, s)| s.banned_until.is_some_and(|until| now < until))
            .map(|(ip, _)| *ip)
            .collect()
    }

    /// Force-ban `ip` for `duration`, clearing its call window.
    pub fn ban(&self, ip: IpAddr, duration: Duration) {
        let mut state = self.state.lock();
        let entry = state.entry(ip).or_default();
        entry.notified = false;
        entry.calls.clear();
        entry.banned_until = Some(Instant::now() + duration);
    }

    /// Remove any active ban on `ip`.
    pub fn unban(&self, ip: IpAddr) -> bool {
        let mut state = self.state.lock();
        match state.get_mut(&ip) {
            Some(entry) if entry.banned_until.is_some_and(|until| Instant::now() < until) => {
                entry.notified = false;
                entry.calls.clear();
                entry.banned_until = None;
                true
            }
            _ => false,
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CALLS, DEFAULT_PERIOD, DEFAULT_BAN_TIME)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn ip(n: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(127, 0, 0, n))
    }

    #[test]
    fn allows_calls_under_the_limit() {
        let rl = RateLimiter::new(5, Duration::from_secs(10), Duration::from_secs(30));
        for _ in 0..5 {
            assert!(!rl.check(ip(1)));
        }
    }

    #[test]
    fn bans_after_exceeding_the_limit() {
        let rl = RateLimiter::new(3, Duration::from_secs(10), Duration::from_secs(30));
        for _ in 0..3 {
            assert!(!rl.check(ip(1)));
        }
        assert!(rl.check(ip(1)));
        assert!(rl.banned_ips().contains(&ip(1)));
    }

    #[test]
    fn unban_clears_an_active_ban() {
        let rl = RateLimiter::new(1, Duration::from_secs(10), Duration::from_secs(30));
        rl.check(ip(1));
        assert!(rl.check(ip(1)));
        assert!(rl.unban(ip(1)));
        assert!(!rl.check(ip(1)));
    }

    #[test]
    fn notify_fires_only_once_per_ban() {
        let rl = RateLimiter::new(1, Duration::from_secs(10), Duration::from_secs(30));
        rl.check(ip(1));
        rl.check(ip(1));
        assert!(rl.should_notify(ip(1)));
        assert!(!rl.should_notify(ip(1)));
    }

    #[test]
    fn unrelated_ips_are_independent() {
        let rl = RateLimiter::new(1, Duration::from_secs(10), Duration::from_secs(30));
        rl.check(ip(1));
        rl.check(ip(1));
        assert!(!rl.check(ip(2)));
    }
}
