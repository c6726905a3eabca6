//! Fixed-rate tick scheduler: emits `serverTick` at `target_tps` and a set
//! of cadence topics (`serverTick_1s`, `serverTick_5s`, ...) derived from it,
//! smoothing out scheduling overshoot so the average rate tracks the target
//! even when a tick runs long.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::RwLock;

use crate::event::{EventBus, EventContext, topics};

/// Server ticks per second the scheduler aims for.
pub const TARGET_TPS: u32 = 60;

/// Cadence topics and the interval, in tenths of a second, at which each
/// fires. Tenths avoid floating point in the tick-count divisor below while
/// still expressing the 0.5s cadence. Checked widest-interval-first so a
/// tick that lands on more than one boundary (e.g. tick 3600 at 60 TPS
/// lands on every cadence) fires every topic that tick.
const CADENCE_TENTHS: &[(u32, &str)] = &[
    (600, topics::SERVER_TICK_60S),
    (300, topics::SERVER_TICK_30S),
    (100, topics::SERVER_TICK_10S),
    (50, topics::SERVER_TICK_5S),
    (40, topics::SERVER_TICK_4S),
    (30, topics::SERVER_TICK_3S),
    (20, topics::SERVER_TICK_2S),
    (10, topics::SERVER_TICK_1S),
    (5, topics::SERVER_TICK_0_5S),
];

/// Rolling window used to report ticks-per-second over the last `window`
/// seconds, mirroring the reference's `calc_ticks`.
struct TickWindow {
    window: Duration,
    samples: VecDeque<Instant>,
}

impl TickWindow {
    fn new(window: Duration) -> Self {
        Self {
            window,
            samples: VecDeque::new(),
        }
    }

    fn push(&mut self, now: Instant) {
        self.samples.push_back(now);
        while let Some(&front) = self.samples.front() {
            if front < now - self.window {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    fn tps(&self) -> f64 {
        self.samples.len() as f64 / self.window.as_secs_f64()
    }
}

/// Snapshot of the scheduler's recent tick rate, for the `tps` console
/// command.
#[derive(Debug, Clone, Copy, Default)]
pub struct TickReport {
    pub last_2s: f64,
    pub last_5s: f64,
    pub last_30s: f64,
    pub last_60s: f64,
}

/// Drives the `serverTick*` topics at `target_tps`, on a dedicated thread.
pub struct TickScheduler {
    bus: Arc<EventBus>,
    target_tps: u32,
    report: Arc<RwLock<TickReport>>,
}

impl TickScheduler {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self {
            bus,
            target_tps: TARGET_TPS,
            report: Arc::new(RwLock::new(TickReport::default())),
        }
    }

    /// Run the tick loop until `running` is cleared. Blocks the calling
    /// thread; callers spawn this on its own OS thread.
    pub fn run(&self, running: Arc<AtomicBool>) {
        let target_interval = Duration::from_secs_f64(1.0 / self.target_tps as f64);
        let mut tick_counter: u64 = 0;
        let tick_reset_at = 60u64 * self.target_tps as u64;

        let mut window_2s = TickWindow::new(Duration::from_secs(2));
        let mut window_5s = TickWindow::new(Duration::from_secs(5));
        let mut window_30s = TickWindow::new(Duration::from_secs(30));
        let mut window_60s = TickWindow::new(Duration::from_secs(60));

        // Smooths scheduling overshoot across the last 3 seconds of ticks.
        let smoothing_len = 3 * self.target_tps as usize;
        let mut overshoot: VecDeque<f64> = VecDeque::from(vec![0.0; 3]);

        tracing::debug!("tick scheduler started");
        while running.load(Ordering::Relaxed) {
            let start = Instant::now();

            self.bus.emit_sync(&EventContext::new(topics::SERVER_TICK));
            self.bus.emit_async(&EventContext::new(topics::SERVER_TICK));

            tick_counter += 1;
            for &(interval_tenths, topic) in CADENCE_TENTHS {
                let divisor = interval_tenths as u64 * self.target_tps as u64 / 10;
                if tick_counter % divisor == 0 {
                    self.bus.emit_sync(&EventContext::new(topic));
                    self.bus.emit_async(&EventContext::new(topic));
                }
            }
            if tick_counter == tick_reset_at {
                tick_counter = 0;
            }

            let tick_duration = start.elapsed();
            let smoothed: f64 = overshoot.iter().sum::<f64>() / overshoot.len() as f64;
            let sleep_time = target_interval
                .as_secs_f64()
                .saturating_sub(tick_duration.as_secs_f64())
                - smoothed;

            if sleep_time > 0.0 {
                std::thread::sleep(Duration::from_secs_f64(sleep_time));
            }

            let now = Instant::now();
            window_2s.push(now);
            window_5s.push(now);
            window_30s.push(now);
            window_60s.push(now);
            *self.report.write() = TickReport {
                last_2s: window_2s.tps(),
                last_5s: window_5s.tps(),
                last_30s: window_30s.tps(),
                last_60s: window_60s.tps(),
            };

            let actual_elapsed = now.duration_since(start).as_secs_f64();
            overshoot.push_back(actual_elapsed - sleep_time.max(0.0));
            if overshoot.len() > smoothing_len {
                overshoot.pop_front();
            }
        }
        tracing::debug!("tick scheduler stopped");
    }

    pub fn target_tps(&self) -> u32 {
        self.target_tps
    }

    /// Latest tick-rate snapshot, safe to call from any thread while `run`
    /// executes on its own. Backs the `tps` console command.
    pub fn report(&self) -> TickReport {
        *self.report.read()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tick_window_reports_zero_when_empty() {
        let w = TickWindow::new(Duration::from_secs(2));
        assert_eq!(w.tps(), 0.0);
    }

    #[test]
    fn tick_window_counts_recent_samples() {
        let mut w = TickWindow::new(Duration::from_secs(2));
        let now = Instant::now();
        for _ in 0..4 {
            w.push(now);
        }
        assert_eq!(w.tps(), 2.0);
    }

    #[test]
    fn cadence_table_covers_every_spec_interval() {
        let intervals: Vec<u32> = CADENCE_TENTHS.iter().map(|(i, _)| *i).collect();
        for expect in [5, 10, 20, 30, 40, 50, 100, 300, 600] {
            assert!(intervals.contains(&expect));
        }
    }
}
