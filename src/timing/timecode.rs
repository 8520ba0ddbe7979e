//! SMPTE-style timecode derived from tick timestamps

use std::fmt;

use super::{FrameRate, Ticks, TICKS_PER_DAY};

/// Wrap a tick value into a single day.
pub fn wrap_day(ticks: Ticks) -> Ticks {
    ticks.rem_euclid(TICKS_PER_DAY)
}

/// Hours, minutes, seconds and frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Timecode {
    pub hours: u8,
    pub minutes: u8,
    pub seconds: u8,
    pub frames: u16,
    pub drop_frame: bool,
}

impl Timecode {
    /// Timecode for a presentation time at the given rate, wrapped at 24 hours.
    pub fn from_ticks(ticks: Ticks, rate: FrameRate) -> Self {
        let frame = rate.frame_at_ticks(wrap_day(ticks));
        Self::from_frame_count(frame, rate)
    }

    /// Timecode for an absolute frame count.
    pub fn from_frame_count(frame: u64, rate: FrameRate) -> Self {
        let fps = rate.nominal_fps() as u64;
        let drop_frame = rate.is_drop_frame();
        let frame = if drop_frame {
            drop_frame_number(frame, rate)
        } else {
            frame
        };

        let frames_per_hour = fps * 3600;
        Self {
            hours: ((frame / frames_per_hour) % 24) as u8,
            minutes: ((frame / (fps * 60)) % 60) as u8,
            seconds: ((frame / fps) % 60) as u8,
            frames: (frame % fps) as u16,
            drop_frame,
        }
    }

    /// Frames elapsed since midnight on the nominal (non-drop) counter.
    pub fn to_nominal_frames(&self, rate: FrameRate) -> u64 {
        let fps = rate.nominal_fps() as u64;
        ((self.hours as u64 * 60 + self.minutes as u64) * 60 + self.seconds as u64) * fps
            + self.frames as u64
    }
}

/// Map a real frame count onto the drop-frame label sequence.
///
/// Frame labels 0 and 1 (0-3 at 59.94) are skipped at the start of every
/// minute except each tenth minute.
fn drop_frame_number(frame: u64, rate: FrameRate) -> u64 {
    let fps = rate.nominal_fps() as u64;
    let drop = fps / 15;
    let frames_per_minute = fps * 60 - drop;
    let frames_per_ten_minutes = frames_per_minute * 10 + drop;

    let tens = frame / frames_per_ten_minutes;
    let rem = frame % frames_per_ten_minutes;
    let mut label = frame + drop * 9 * tens;
    if rem > drop {
        label += drop * ((rem - drop) / frames_per_minute);
    }
    label
}

impl fmt::Display for Timecode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sep = if self.drop_frame { ';' } else { ':' };
        write!(
            f,
            "{:02}:{:02}:{:02}{}{:02}",
            self.hours, self.minutes, self.seconds, sep, self.frames
        )
    }
}
