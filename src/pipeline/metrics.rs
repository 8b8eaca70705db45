//! Counters and latency measurements for a running pipeline.
//!
//! Per-processor counters are plain atomics updated by each runner. Turn
//! timings are measured by the task where frames leave the pipeline, so they
//! describe what the remote peer actually experiences.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::info;

/// Frame and handler-time counters for one processor.
#[derive(Debug)]
pub struct ProcessorCounters {
    name: String,
    frames: AtomicU64,
    processing_nanos: AtomicU64,
    max_processing_nanos: AtomicU64,
}

impl ProcessorCounters {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            frames: AtomicU64::new(0),
            processing_nanos: AtomicU64::new(0),
            max_processing_nanos: AtomicU64::new(0),
        }
    }

    pub fn record_frame(&self) {
        self.frames.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_processing(&self, elapsed: Duration) {
        let nanos = u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX);
        self.processing_nanos.fetch_add(nanos, Ordering::Relaxed);
        self.max_processing_nanos.fetch_max(nanos, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ProcessorStats {
        ProcessorStats {
            name: self.name.clone(),
            frames: self.frames.load(Ordering::Relaxed),
            total_processing: Duration::from_nanos(self.processing_nanos.load(Ordering::Relaxed)),
            max_processing: Duration::from_nanos(
                self.max_processing_nanos.load(Ordering::Relaxed),
            ),
        }
    }
}

/// Point-in-time copy of a processor's counters.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessorStats {
    pub name: String,
    pub frames: u64,
    pub total_processing: Duration,
    pub max_processing: Duration,
}

/// Timing for a single conversational turn, measured at the pipeline sink.
#[derive(Debug, Clone)]
pub struct TurnTiming {
    /// When the user's turn closed (SpeechStopped or RunTrigger observed)
    pub turn_closed: Instant,
    /// When the first response fragment (text or audio) arrived
    pub first_response: Instant,
    /// When the model signalled completion
    pub completed: Instant,
    /// Total audio the model produced for this turn
    pub response_audio: Duration,
}

impl TurnTiming {
    /// Time the user waited before hearing or seeing anything.
    pub fn response_latency(&self) -> Duration {
        self.first_response.duration_since(self.turn_closed)
    }

    /// Time from end of turn to the model's completion signal.
    pub fn total_latency(&self) -> Duration {
        self.completed.duration_since(self.turn_closed)
    }

    /// Time spent streaming after the first fragment.
    pub fn streaming_duration(&self) -> Duration {
        self.completed.duration_since(self.first_response)
    }
}

/// Tracks timing statistics across multiple turns.
#[derive(Debug, Clone)]
pub struct LatencyTracker {
    measurements: Vec<TurnTiming>,
}

/// Summary statistics for latency measurements.
#[derive(Debug, Clone, PartialEq)]
pub struct LatencyStats {
    pub count: usize,
    pub response_avg: Duration,
    pub response_min: Duration,
    pub response_max: Duration,
    pub total_avg: Duration,
    pub streaming_avg: Duration,
    pub response_audio_avg: Duration,
}

impl LatencyTracker {
    pub fn new() -> Self {
        Self {
            measurements: Vec::new(),
        }
    }

    pub fn record(&mut self, timing: TurnTiming) {
        self.measurements.push(timing);
    }

    pub fn len(&self) -> usize {
        self.measurements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.measurements.is_empty()
    }

    /// Returns summary statistics, or None if no turns were measured.
    pub fn stats(&self) -> Option<LatencyStats> {
        if self.measurements.is_empty() {
            return None;
        }

        let response: Vec<Duration> = self
            .measurements
            .iter()
            .map(TurnTiming::response_latency)
            .collect();
        let total: Vec<Duration> = self
            .measurements
            .iter()
            .map(TurnTiming::total_latency)
            .collect();
        let streaming: Vec<Duration> = self
            .measurements
            .iter()
            .map(TurnTiming::streaming_duration)
            .collect();
        let audio: Vec<Duration> = self
            .measurements
            .iter()
            .map(|t| t.response_audio)
            .collect();

        Some(LatencyStats {
            count: self.measurements.len(),
            response_avg: avg_duration(&response),
            response_min: response.iter().min().copied().unwrap_or_default(),
            response_max: response.iter().max().copied().unwrap_or_default(),
            total_avg: avg_duration(&total),
            streaming_avg: avg_duration(&streaming),
            response_audio_avg: avg_duration(&audio),
        })
    }

    /// Logs a one-line summary of all measured turns.
    pub fn log_summary(&self) {
        if let Some(stats) = self.stats() {
            info!(
                turns = stats.count,
                "response latency avg {} (min {}, max {}), completion avg {}",
                format_duration(stats.response_avg),
                format_duration(stats.response_min),
                format_duration(stats.response_max),
                format_duration(stats.total_avg),
            );
        }
    }
}

impl Default for LatencyTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Formats a duration as a human-friendly string.
/// Under 1s: "450ms", at or above 1s: "1.5s".
pub fn format_duration(d: Duration) -> String {
    let ms = d.as_millis();
    if ms < 1000 {
        format!("{}ms", ms)
    } else {
        format!("{:.1}s", d.as_secs_f64())
    }
}

/// Calculates average duration from a slice.
fn avg_duration(durations: &[Duration]) -> Duration {
    if durations.is_empty() {
        return Duration::from_secs(0);
    }
    let sum: Duration = durations.iter().sum();
    sum / durations.len() as u32
}
