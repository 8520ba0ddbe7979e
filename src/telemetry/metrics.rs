//! Pipeline performance counters
//!
//! Counters are plain atomics shared between the tick thread and the I/O
//! thread. `snapshot()` produces a consistent-enough copy for display and
//! periodic logging; individual fields may be a few frames apart.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Push latency statistics in milliseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LatencyStats {
    pub avg_ms: f64,
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
    pub max_ms: f64,
}

/// Rolling window of operation durations.
pub struct LatencyTracker {
    samples: VecDeque<Duration>,
    max_samples: usize,
}

impl Default for LatencyTracker {
    fn default() -> Self {
        Self::new(300)
    }
}

impl LatencyTracker {
    /// Create a tracker keeping the last `max_samples` durations.
    pub fn new(max_samples: usize) -> Self {
        let max_samples = max_samples.max(1);
        Self {
            samples: VecDeque::with_capacity(max_samples),
            max_samples,
        }
    }

    pub fn record(&mut self, duration: Duration) {
        if self.samples.len() == self.max_samples {
            self.samples.pop_front();
        }
        self.samples.push_back(duration);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn stats(&self) -> LatencyStats {
        if self.samples.is_empty() {
            return LatencyStats::default();
        }

        let mut times: Vec<f64> = self
            .samples
            .iter()
            .map(|d| d.as_secs_f64() * 1000.0)
            .collect();
        times.sort_by(|a, b| a.total_cmp(b));

        let sum: f64 = times.iter().sum();
        LatencyStats {
            avg_ms: sum / times.len() as f64,
            p50_ms: percentile(&times, 0.50),
            p95_ms: percentile(&times, 0.95),
            p99_ms: percentile(&times, 0.99),
            max_ms: times[times.len() - 1],
        }
    }
}

/// Calculate percentile from a sorted slice
fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let idx = ((sorted.len() - 1) as f64 * p) as usize;
    sorted[idx]
}

/// Sender statistics snapshot.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SenderStats {
    pub name: String,
    /// Frames handed to `push_frame` while streaming
    pub frames_pushed: u64,
    /// Frames written to the transport by the I/O thread
    pub frames_sent: u64,
    /// Frames dropped (queue full, stale, pool exhausted, conversion)
    pub frames_dropped: u64,
    /// Frames skipped because no receiver was connected
    pub frames_skipped: u64,
    pub audio_frames_sent: u64,
    pub audio_frames_dropped: u64,
    pub metadata_sent: u64,
    pub audio_resyncs: u64,
    pub connections: u64,
    pub push_latency: LatencyStats,
}

/// Shared sender counters.
#[derive(Debug, Default)]
pub struct SenderCounters {
    pub frames_pushed: AtomicU64,
    pub frames_sent: AtomicU64,
    pub frames_dropped: AtomicU64,
    pub frames_skipped: AtomicU64,
    pub audio_frames_sent: AtomicU64,
    pub audio_frames_dropped: AtomicU64,
    pub metadata_sent: AtomicU64,
    pub audio_resyncs: AtomicU64,
    pub connections: AtomicU64,
}

impl SenderCounters {
    pub fn snapshot(&self, name: &str, push_latency: LatencyStats) -> SenderStats {
        SenderStats {
            name: name.to_string(),
            frames_pushed: self.frames_pushed.load(Ordering::Relaxed),
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            frames_skipped: self.frames_skipped.load(Ordering::Relaxed),
            audio_frames_sent: self.audio_frames_sent.load(Ordering::Relaxed),
            audio_frames_dropped: self.audio_frames_dropped.load(Ordering::Relaxed),
            metadata_sent: self.metadata_sent.load(Ordering::Relaxed),
            audio_resyncs: self.audio_resyncs.load(Ordering::Relaxed),
            connections: self.connections.load(Ordering::Relaxed),
            push_latency,
        }
    }
}

/// Receiver performance data snapshot.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReceiverStats {
    pub source_name: String,
    /// Complete video frames converted and published
    pub video_frames: u64,
    pub audio_frames: u64,
    pub metadata_frames: u64,
    /// Frames discarded before completion
    pub frames_incomplete: u64,
    /// Frames never seen (gaps in transport sequence)
    pub frames_lost: u64,
    /// Published frames replaced before the consumer took them
    pub frames_overwritten: u64,
    /// Frames that failed conversion or pool acquisition
    pub frames_failed: u64,
    /// Ticks where the previous frame was repeated
    pub frames_held: u64,
    /// Audio frames dropped: format mismatch, muted, queue overflow or skipped by A/V matching
    pub audio_dropped: u64,
    pub audio_resyncs: u64,
    /// Latest source timecode in ticks, if any frame arrived
    pub last_timecode: Option<i64>,
}

impl ReceiverStats {
    /// Total video frames that did not reach the consumer slot.
    pub fn video_dropped(&self) -> u64 {
        self.frames_incomplete + self.frames_lost + self.frames_failed
    }
}

/// Shared receiver counters.
#[derive(Debug, Default)]
pub struct ReceiverCounters {
    pub video_frames: AtomicU64,
    pub audio_frames: AtomicU64,
    pub metadata_frames: AtomicU64,
    pub frames_incomplete: AtomicU64,
    pub frames_lost: AtomicU64,
    pub frames_overwritten: AtomicU64,
    pub frames_failed: AtomicU64,
    pub frames_held: AtomicU64,
    pub audio_dropped: AtomicU64,
    pub audio_resyncs: AtomicU64,
}

impl ReceiverCounters {
    pub fn snapshot(&self, source_name: &str, last_timecode: Option<i64>) -> ReceiverStats {
        ReceiverStats {
            source_name: source_name.to_string(),
            video_frames: self.video_frames.load(Ordering::Relaxed),
            audio_frames: self.audio_frames.load(Ordering::Relaxed),
            metadata_frames: self.metadata_frames.load(Ordering::Relaxed),
            frames_incomplete: self.frames_incomplete.load(Ordering::Relaxed),
            frames_lost: self.frames_lost.load(Ordering::Relaxed),
            frames_overwritten: self.frames_overwritten.load(Ordering::Relaxed),
            frames_failed: self.frames_failed.load(Ordering::Relaxed),
            frames_held: self.frames_held.load(Ordering::Relaxed),
            audio_dropped: self.audio_dropped.load(Ordering::Relaxed),
            audio_resyncs: self.audio_resyncs.load(Ordering::Relaxed),
            last_timecode,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percentile() {
        let values = vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0, 10.0];
        assert_eq!(percentile(&values, 0.5), 5.0);
        assert_eq!(percentile(&values, 0.0), 1.0);
        assert_eq!(percentile(&values, 1.0), 10.0);
        assert_eq!(percentile(&[], 0.5), 0.0);
    }

    #[test]
    fn test_latency_tracker_window() {
        let mut tracker = LatencyTracker::new(4);
        for ms in [10, 1, 2, 3, 4] {
            tracker.record(Duration::from_millis(ms));
        }
        assert_eq!(tracker.len(), 4);

        // The 10ms sample fell out of the window
        let stats = tracker.stats();
        assert!((stats.max_ms - 4.0).abs() < 1e-9);
        assert!((stats.avg_ms - 2.5).abs() < 1e-9);
    }

    #[test]
    fn test_receiver_video_dropped() {
        let counters = ReceiverCounters::default();
        counters.frames_incomplete.fetch_add(2, Ordering::Relaxed);
        counters.frames_lost.fetch_add(3, Ordering::Relaxed);
        counters.frames_overwritten.fetch_add(7, Ordering::Relaxed);
        let stats = counters.snapshot("HOST (Test)", None);
        assert_eq!(stats.video_dropped(), 5);
        assert_eq!(stats.frames_overwritten, 7);
    }
}
