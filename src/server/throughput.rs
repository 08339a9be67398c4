use crate::handle::lock;

use std::sync::Mutex;
use std::time::{Duration, Instant};

const WINDOW: Duration = Duration::from_secs(60);

// Weight of the newest minute in the moving average.
const ALPHA: f64 = 0.25;

// Beyond this many idle minutes the average is simply zero.
const MAX_CATCH_UP: u32 = 60;

/// Packets-per-minute exponential moving average.
#[derive(Debug)]
pub struct Throughput {
    state: Mutex<State>,
}

#[derive(Debug)]
struct State {
    window_start: Instant,
    count: u64,
    average: Option<f64>,
}

impl Default for Throughput {
    fn default() -> Self {
        Self::new()
    }
}

impl Throughput {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                window_start: Instant::now(),
                count: 0,
                average: None,
            }),
        }
    }

    /// Counts `packets` in the current minute.
    pub fn record(&self, packets: u64) {
        let mut state = lock(&self.state);
        state.roll(Instant::now());
        state.count += packets;
    }

    /// Average packets per minute. Until the first minute has passed this is
    /// the count so far.
    pub fn per_minute(&self) -> f64 {
        let mut state = lock(&self.state);
        state.roll(Instant::now());
        state.average.unwrap_or(state.count as f64)
    }
}

impl State {
    fn roll(&mut self, now: Instant) {
        let mut rolled = 0;
        while now.duration_since(self.window_start) >= WINDOW {
            if rolled == MAX_CATCH_UP {
                self.average = Some(0.0);
                self.window_start = now;
                self.count = 0;
                return;
            }
            let sample = self.count as f64;
            self.average = Some(match self.average {
                Some(average) => ALPHA * sample + (1.0 - ALPHA) * average,
                None => sample,
            });
            self.count = 0;
            self.window_start += WINDOW;
            rolled += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_minute_reports_running_count() {
        let throughput = Throughput::new();
        throughput.record(3);
        throughput.record(2);
        assert_eq!(throughput.per_minute(), 5.0);
    }

    #[test]
    fn average_decays_over_idle_minutes() {
        let start = Instant::now();
        let mut state = State {
            window_start: start,
            count: 100,
            average: None,
        };
        state.roll(start + WINDOW);
        assert_eq!(state.average, Some(100.0));
        state.roll(start + WINDOW * 2);
        assert_eq!(state.average, Some(75.0));
        state.roll(start + WINDOW * 200);
        assert_eq!(state.average, Some(0.0));
    }
}
