//! Frame-rate rationals

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use super::{Ticks, TICKS_PER_SECOND};

/// A frame rate expressed as `numerator / denominator` frames per second.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FrameRate {
    #[serde(rename = "numerator")]
    pub numerator: u32,
    #[serde(rename = "denominator")]
    pub denominator: u32,
}

impl Default for FrameRate {
    fn default() -> Self {
        Self::FPS_60
    }
}

impl FrameRate {
    pub const FPS_24: FrameRate = FrameRate::new(24, 1);
    pub const FPS_25: FrameRate = FrameRate::new(25, 1);
    pub const FPS_29_97: FrameRate = FrameRate::new(30000, 1001);
    pub const FPS_30: FrameRate = FrameRate::new(30, 1);
    pub const FPS_50: FrameRate = FrameRate::new(50, 1);
    pub const FPS_59_94: FrameRate = FrameRate::new(60000, 1001);
    pub const FPS_60: FrameRate = FrameRate::new(60, 1);

    pub const fn new(numerator: u32, denominator: u32) -> Self {
        Self {
            numerator,
            denominator,
        }
    }

    /// Both terms must be non-zero.
    pub fn is_valid(&self) -> bool {
        self.numerator > 0 && self.denominator > 0
    }

    pub fn fps(&self) -> f64 {
        if self.denominator == 0 {
            return 0.0;
        }
        self.numerator as f64 / self.denominator as f64
    }

    /// Integer frames per second used for timecode counting (30 for 29.97).
    pub fn nominal_fps(&self) -> u32 {
        self.fps().round().max(1.0) as u32
    }

    /// NTSC rates count timecode with dropped frame numbers.
    pub fn is_drop_frame(&self) -> bool {
        self.denominator == 1001 && (self.numerator == 30000 || self.numerator == 60000)
    }

    /// Duration of one frame.
    pub fn frame_interval(&self) -> Duration {
        if !self.is_valid() {
            return Duration::ZERO;
        }
        let nanos = 1_000_000_000u128 * self.denominator as u128 / self.numerator as u128;
        Duration::from_nanos(nanos as u64)
    }

    /// Presentation time of frame `index`, exact in integer arithmetic.
    pub fn ticks_for_frame(&self, index: u64) -> Ticks {
        if !self.is_valid() {
            return 0;
        }
        let ticks = index as i128 * TICKS_PER_SECOND as i128 * self.denominator as i128
            / self.numerator as i128;
        ticks as Ticks
    }

    /// Index of the frame presented at `ticks` (floor).
    pub fn frame_at_ticks(&self, ticks: Ticks) -> u64 {
        if !self.is_valid() || ticks <= 0 {
            return 0;
        }
        let index = ticks as i128 * self.numerator as i128
            / (TICKS_PER_SECOND as i128 * self.denominator as i128);
        index as u64
    }

    /// Length of one frame in ticks (rounded down).
    pub fn frame_ticks(&self) -> Ticks {
        self.ticks_for_frame(1)
    }
}

impl fmt::Display for FrameRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.denominator == 1 {
            write!(f, "{}", self.numerator)
        } else {
            write!(f, "{:.2}", self.fps())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_ticks_for_ntsc() {
        let rate = FrameRate::FPS_29_97;
        assert_eq!(rate.ticks_for_frame(1800), 600_600_000);
        assert_eq!(rate.frame_at_ticks(600_600_000), 1800);
        assert!(rate.is_drop_frame());
        assert_eq!(rate.nominal_fps(), 30);
    }

    #[test]
    fn test_frame_interval() {
        assert_eq!(FrameRate::FPS_60.frame_interval(), Duration::from_nanos(16_666_666));
        assert_eq!(FrameRate::FPS_25.frame_ticks(), 400_000);
        assert_eq!(FrameRate::new(0, 1).frame_interval(), Duration::ZERO);
    }

    #[test]
    fn test_display() {
        assert_eq!(FrameRate::FPS_60.to_string(), "60");
        assert_eq!(FrameRate::FPS_59_94.to_string(), "59.94");
    }
}
