//! Timing and sync
//!
//! All timestamps are in 100ns ticks. Send targets stamp frames from a
//! per-stream [`ClockDomain`]; receivers reassemble fragments with
//! [`FrameAssembler`], keep the render loop fed with [`FrameHold`] and match
//! audio to video with [`AvSync`].

pub mod clock;
pub mod hold;
pub mod rate;
pub mod reorder;
pub mod sync;
pub mod timecode;

/// Time in 100ns units.
pub type Ticks = i64;

pub const TICKS_PER_SECOND: Ticks = 10_000_000;

/// Timecode wraps after 24 hours.
pub const TICKS_PER_DAY: Ticks = 24 * 60 * 60 * TICKS_PER_SECOND;

pub use clock::{
    duration_to_ticks, ticks_to_duration, AudioStamp, ClockDomain, FrameStamp, StalenessGate,
};
pub use hold::{FrameHold, HoldOutcome};
pub use rate::FrameRate;
pub use reorder::{AssembledFrame, AssemblerStats, FrameAssembler};
pub use sync::{AvSync, SyncOutcome};
pub use timecode::{wrap_day, Timecode};
