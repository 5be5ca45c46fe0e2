use std::sync::Mutex;
use std::time::{Duration, Instant};

const WINDOW: Duration = Duration::from_secs(1);

#[derive(Debug)]
struct MeterState {
    running: bool,
    window_start: Instant,
    window_bytes: u64,
    last_rate: u64,
}

impl MeterState {
    fn roll(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.window_start);
        if elapsed >= WINDOW {
            self.last_rate = (self.window_bytes as f64 / elapsed.as_secs_f64()) as u64;
            self.window_bytes = 0;
            self.window_start = now;
        }
    }
}

/// Aggregate download throughput over a rolling one-second window.
#[derive(Debug)]
pub struct SpeedMeter {
    state: Mutex<MeterState>,
}

impl Default for SpeedMeter {
    fn default() -> Self {
        Self::new()
    }
}

impl SpeedMeter {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MeterState {
                running: false,
                window_start: Instant::now(),
                window_bytes: 0,
                last_rate: 0,
            }),
        }
    }

    pub fn start(&self) {
        if let Ok(mut state) = self.state.lock() {
            if !state.running {
                state.running = true;
                state.window_start = Instant::now();
                state.window_bytes = 0;
            }
        }
    }

    pub fn pause(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.running = false;
            state.window_bytes = 0;
            state.last_rate = 0;
        }
    }

    pub fn record(&self, bytes: u64) {
        if let Ok(mut state) = self.state.lock() {
            if state.running {
                state.roll(Instant::now());
                state.window_bytes = state.window_bytes.saturating_add(bytes);
            }
        }
    }

    pub fn speed(&self) -> u64 {
        match self.state.lock() {
            Ok(mut state) if state.running => {
                state.roll(Instant::now());
                state.last_rate
            }
            _ => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paused_meter_ignores_bytes() {
        let meter = SpeedMeter::new();
        meter.record(1_000_000);
        assert_eq!(meter.speed(), 0);
    }

    #[test]
    fn rate_is_reported_after_a_full_window() {
        let meter = SpeedMeter::new();
        meter.start();
        meter.record(500_000);
        std::thread::sleep(Duration::from_millis(1100));
        let speed = meter.speed();
        assert!(speed > 0 && speed <= 500_000, "speed {}", speed);
        meter.pause();
        assert_eq!(meter.speed(), 0);
    }
}
