//! Per-stream clock domain
//!
//! Every send target and connected source owns one `ClockDomain`. Video
//! frames are stamped from a frame counter advanced once per engine tick, so
//! presentation times follow the configured cadence exactly. Audio is stamped
//! from a running sample count anchored to the video clock and re-anchored
//! when the two drift apart beyond the resync threshold.

use std::time::{Duration, Instant};

use super::{FrameRate, Ticks, Timecode, TICKS_PER_SECOND};

/// Timing assigned to one video frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameStamp {
    pub index: u64,
    pub timestamp: Ticks,
    pub timecode: Timecode,
}

/// Timing assigned to one audio frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioStamp {
    pub timestamp: Ticks,
    /// The sample clock was re-anchored to the video clock.
    pub resynced: bool,
}

pub struct ClockDomain {
    rate: FrameRate,
    origin: Instant,
    next_index: u64,
    last_video: Ticks,
    audio_anchor: Ticks,
    audio_samples: u64,
    audio_rate: u32,
    resync_threshold: Ticks,
    resyncs: u64,
}

impl ClockDomain {
    pub fn new(rate: FrameRate, resync_threshold: Duration) -> Self {
        Self {
            rate,
            origin: Instant::now(),
            next_index: 0,
            last_video: 0,
            audio_anchor: 0,
            audio_samples: 0,
            audio_rate: 0,
            resync_threshold: duration_to_ticks(resync_threshold),
            resyncs: 0,
        }
    }

    pub fn frame_rate(&self) -> FrameRate {
        self.rate
    }

    /// Frames stamped so far.
    pub fn frames_stamped(&self) -> u64 {
        self.next_index
    }

    pub fn resyncs(&self) -> u64 {
        self.resyncs
    }

    /// Wall-clock time since the domain was created, in ticks.
    pub fn elapsed_ticks(&self) -> Ticks {
        duration_to_ticks(self.origin.elapsed())
    }

    /// Stamp the next video frame.
    pub fn stamp_video(&mut self) -> FrameStamp {
        let index = self.next_index;
        self.next_index += 1;
        let timestamp = self.rate.ticks_for_frame(index);
        self.last_video = timestamp;
        FrameStamp {
            index,
            timestamp,
            timecode: Timecode::from_ticks(timestamp, self.rate),
        }
    }

    /// Stamp `samples` audio samples belonging to the most recent video frame.
    pub fn stamp_audio(&mut self, sample_rate: u32, samples: u32) -> AudioStamp {
        let mut resynced = false;

        if sample_rate != self.audio_rate {
            // New stream or rate change: restart the sample clock at the video clock
            self.audio_rate = sample_rate;
            self.audio_anchor = self.last_video;
            self.audio_samples = 0;
        }

        let mut timestamp = self.audio_timestamp();
        if (timestamp - self.last_video).abs() > self.resync_threshold {
            self.audio_anchor = self.last_video;
            self.audio_samples = 0;
            self.resyncs += 1;
            timestamp = self.last_video;
            resynced = true;
        }

        self.audio_samples += samples as u64;
        AudioStamp {
            timestamp,
            resynced,
        }
    }

    fn audio_timestamp(&self) -> Ticks {
        if self.audio_rate == 0 {
            return self.audio_anchor;
        }
        self.audio_anchor
            + (self.audio_samples as i128 * TICKS_PER_SECOND as i128 / self.audio_rate as i128)
                as Ticks
    }
}

pub fn duration_to_ticks(duration: Duration) -> Ticks {
    (duration.as_nanos() / 100) as Ticks
}

pub fn ticks_to_duration(ticks: Ticks) -> Duration {
    Duration::from_nanos(ticks.max(0) as u64 * 100)
}

/// Bounded-staleness admission: a frame is accepted only while no more than
/// `max_lag` earlier frames are still waiting for the transport.
#[derive(Debug, Clone, Copy)]
pub struct StalenessGate {
    max_lag: usize,
}

impl StalenessGate {
    pub fn new(max_lag: usize) -> Self {
        Self { max_lag }
    }

    pub fn admit(&self, in_flight: usize) -> bool {
        in_flight <= self.max_lag
    }
}
