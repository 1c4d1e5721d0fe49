//! Throughput tracking for indexing runs.
//!
//! A sliding 60-second window feeds rolling averages (10 samples for rates,
//! 15 for per-file time) so the ETA shown in progress text does not jitter.
//! The throttle signal is informational: it fires when the provider reports
//! a rate-limit wait above half a second, when the request quota is nearly
//! exhausted, or when the average per-file time crosses five seconds.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::embed::ThrottleState;

/// Window length for instantaneous rate computation
const WINDOW: Duration = Duration::from_secs(60);

/// Provider wait beyond this counts as throttling
const THROTTLE_WAIT_THRESHOLD: Duration = Duration::from_millis(500);

/// Remaining request quota below this counts as throttling
const LOW_QUOTA_THRESHOLD: u32 = 10;

/// Average seconds-per-file beyond this counts as slow processing
const SLOW_FILE_THRESHOLD_SECS: f64 = 5.0;

/// Point-in-time throughput snapshot.
#[derive(Debug, Clone, Default)]
pub struct ThroughputStats {
    pub files_per_minute: f64,
    pub chunks_per_minute: f64,
    pub embedding_requests_per_minute: f64,
    pub is_throttling: bool,
    pub throttle_reason: String,
    pub average_processing_time_per_file: f64,
    pub estimated_time_remaining_seconds: f64,
}

/// Fixed-window rolling average.
#[derive(Debug)]
pub struct RollingAverage {
    window_size: usize,
    values: VecDeque<f64>,
    sum: f64,
}

impl RollingAverage {
    pub fn new(window_size: usize) -> Self {
        Self {
            window_size,
            values: VecDeque::with_capacity(window_size),
            sum: 0.0,
        }
    }

    pub fn add(&mut self, value: f64) {
        self.values.push_back(value);
        self.sum += value;
        if self.values.len() > self.window_size {
            if let Some(oldest) = self.values.pop_front() {
                self.sum -= oldest;
            }
        }
    }

    pub fn average(&self) -> f64 {
        if self.values.is_empty() {
            0.0
        } else {
            self.sum / self.values.len() as f64
        }
    }

    pub fn count(&self) -> usize {
        self.values.len()
    }
}

/// Tracks the sliding window and produces [`ThroughputStats`].
pub struct ThroughputMonitor {
    window_start: Instant,
    window_files: u64,
    window_chunks: u64,
    last_check: Instant,
    files_per_min: RollingAverage,
    chunks_per_min: RollingAverage,
    time_per_file: RollingAverage,
}

impl ThroughputMonitor {
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            window_start: now,
            window_files: 0,
            window_chunks: 0,
            last_check: now,
            files_per_min: RollingAverage::new(10),
            chunks_per_min: RollingAverage::new(10),
            time_per_file: RollingAverage::new(15),
        }
    }

    pub fn record_file(&mut self, chunks: u64) {
        self.window_files += 1;
        self.window_chunks += chunks;
    }

    /// Cadence of recomputation: frequently during the first files for an
    /// early estimate, then every 30 seconds or 50 files.
    pub fn should_recalculate(&self, file_index: usize) -> bool {
        if file_index < 5 {
            return file_index > 0 && file_index % 2 == 0;
        }
        self.last_check.elapsed() > Duration::from_secs(30) || file_index % 50 == 0
    }

    pub fn calculate(&mut self, files_remaining: usize, throttle: &ThrottleState) -> ThroughputStats {
        let elapsed = self.window_start.elapsed().as_secs_f64();
        if elapsed <= 0.0 {
            return ThroughputStats::default();
        }
        self.last_check = Instant::now();

        if self.window_files > 0 {
            self.files_per_min.add(self.window_files as f64 / elapsed * 60.0);
            self.chunks_per_min
                .add(self.window_chunks as f64 / elapsed * 60.0);
            self.time_per_file
                .add(elapsed / self.window_files.max(1) as f64);
        }

        let files_per_minute = self.files_per_min.average();
        let chunks_per_minute = self.chunks_per_min.average();
        let avg_time_per_file = self.time_per_file.average();

        let estimated_time_remaining_seconds = if files_per_minute > 0.0 && files_remaining > 0 {
            files_remaining as f64 / files_per_minute * 60.0
        } else {
            0.0
        };

        let (is_throttling, throttle_reason) = detect_throttle(throttle, avg_time_per_file);

        // Reset the window once it ages out
        if self.window_start.elapsed() > WINDOW {
            self.window_start = Instant::now();
            self.window_files = 0;
            self.window_chunks = 0;
        }

        ThroughputStats {
            files_per_minute,
            chunks_per_minute,
            embedding_requests_per_minute: chunks_per_minute,
            is_throttling,
            throttle_reason,
            average_processing_time_per_file: avg_time_per_file,
            estimated_time_remaining_seconds,
        }
    }
}

impl Default for ThroughputMonitor {
    fn default() -> Self {
        Self::new()
    }
}

fn detect_throttle(throttle: &ThrottleState, avg_time_per_file: f64) -> (bool, String) {
    if throttle.current_wait > THROTTLE_WAIT_THRESHOLD {
        return (
            true,
            format!(
                "API rate limiting (wait: {:.1}s)",
                throttle.current_wait.as_secs_f64()
            ),
        );
    }
    if let Some(remaining) = throttle.requests_remaining {
        if remaining < LOW_QUOTA_THRESHOLD {
            return (true, "API request quota running low".to_string());
        }
    }
    if avg_time_per_file > SLOW_FILE_THRESHOLD_SECS {
        return (
            true,
            format!("slow processing detected ({avg_time_per_file:.1}s/file)"),
        );
    }
    (false, String::new())
}

/// Compose the info string for progress callbacks:
/// `files/min | chunks/min | time left | throttle reason`.
pub fn compose_info(stats: &ThroughputStats) -> String {
    let mut parts = Vec::new();

    if stats.files_per_minute > 0.0 {
        parts.push(format!("{:.1} files/min", stats.files_per_minute));
    }
    if stats.chunks_per_minute > 0.0 {
        parts.push(format!("{:.1} chunks/min", stats.chunks_per_minute));
    }
    if stats.estimated_time_remaining_seconds > 0.0 {
        let remaining_minutes = stats.estimated_time_remaining_seconds / 60.0;
        if remaining_minutes >= 60.0 {
            let hours = (remaining_minutes / 60.0) as u64;
            let mins = (remaining_minutes % 60.0) as u64;
            parts.push(format!("{hours}h{mins}m left"));
        } else if remaining_minutes >= 1.0 {
            parts.push(format!("{remaining_minutes:.0}m left"));
        } else {
            parts.push(format!(
                "{:.0}s left",
                stats.estimated_time_remaining_seconds
            ));
        }
    }
    if stats.is_throttling {
        parts.push(format!("throttled: {}", stats.throttle_reason));
    }

    parts.join(" | ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_rolling_average_window() {
        let mut avg = RollingAverage::new(3);
        assert_eq!(avg.average(), 0.0);

        avg.add(1.0);
        avg.add(2.0);
        avg.add(3.0);
        assert_eq!(avg.average(), 2.0);
        assert_eq!(avg.count(), 3);

        // Oldest value (1.0) drops out of the window
        avg.add(6.0);
        assert_eq!(avg.count(), 3);
        assert!((avg.average() - 11.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_throttle_on_provider_wait() {
        let throttle = ThrottleState {
            current_wait: Duration::from_secs(2),
            requests_remaining: Some(500),
        };
        let (throttling, reason) = detect_throttle(&throttle, 0.1);
        assert!(throttling);
        assert!(reason.contains("rate limiting"));
    }

    #[test]
    fn test_throttle_on_low_quota() {
        let throttle = ThrottleState {
            current_wait: Duration::ZERO,
            requests_remaining: Some(3),
        };
        let (throttling, reason) = detect_throttle(&throttle, 0.1);
        assert!(throttling);
        assert!(reason.contains("quota"));
    }

    #[test]
    fn test_throttle_on_slow_files() {
        let (throttling, reason) = detect_throttle(&ThrottleState::default(), 7.5);
        assert!(throttling);
        assert!(reason.contains("7.5s/file"));
    }

    #[test]
    fn test_monitor_produces_rates() {
        let mut monitor = ThroughputMonitor::new();
        std::thread::sleep(Duration::from_millis(50));
        monitor.record_file(10);
        monitor.record_file(5);

        let stats = monitor.calculate(8, &ThrottleState::default());
        assert!(stats.files_per_minute > 0.0);
        assert!(stats.chunks_per_minute > stats.files_per_minute);
        assert!(stats.estimated_time_remaining_seconds > 0.0);
    }

    #[test]
    fn test_compose_info_sections() {
        let info = compose_info(&ThroughputStats {
            files_per_minute: 12.0,
            chunks_per_minute: 240.0,
            estimated_time_remaining_seconds: 90.0,
            is_throttling: true,
            throttle_reason: "API request quota running low".to_string(),
            ..Default::default()
        });
        assert!(info.contains("12.0 files/min"));
        assert!(info.contains("240.0 chunks/min"));
        assert!(info.contains("2m left"));
        assert!(info.contains("throttled"));

        assert_eq!(compose_info(&ThroughputStats::default()), "");
    }

    #[test]
    fn test_recalculation_cadence() {
        let monitor = ThroughputMonitor::new();
        assert!(!monitor.should_recalculate(0));
        assert!(!monitor.should_recalculate(1));
        assert!(monitor.should_recalculate(2));
        assert!(monitor.should_recalculate(4));
        // Past the warm-up, only the 50-file boundary triggers immediately
        assert!(!monitor.should_recalculate(7));
        assert!(monitor.should_recalculate(100));
    }
}
