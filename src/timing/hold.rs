//! Frame-hold: keep presenting the last good frame when no new one arrives.

use std::time::{Duration, Instant};

#[derive(Debug, Clone, PartialEq)]
pub enum HoldOutcome<T> {
    /// A frame that has not been returned before
    New(T),
    /// The previous frame again
    Held(T),
    /// Nothing has been received yet
    Empty,
}

impl<T> HoldOutcome<T> {
    pub fn into_frame(self) -> Option<T> {
        match self {
            HoldOutcome::New(frame) | HoldOutcome::Held(frame) => Some(frame),
            HoldOutcome::Empty => None,
        }
    }

    pub fn is_new(&self) -> bool {
        matches!(self, HoldOutcome::New(_))
    }
}

/// Remembers the last frame handed to the consumer.
///
/// A repeat is counted once `hold_after` has passed since the last new frame,
/// and again for every later call until a new frame arrives.
#[derive(Debug)]
pub struct FrameHold<T: Clone> {
    last: Option<T>,
    last_new: Option<Instant>,
    hold_after: Duration,
    repeats: u64,
}

impl<T: Clone> FrameHold<T> {
    pub fn new(hold_after: Duration) -> Self {
        Self {
            last: None,
            last_new: None,
            hold_after,
            repeats: 0,
        }
    }

    pub fn hold_after(&self) -> Duration {
        self.hold_after
    }

    /// Frames repeated after the hold interval elapsed.
    pub fn repeats(&self) -> u64 {
        self.repeats
    }

    pub fn last(&self) -> Option<&T> {
        self.last.as_ref()
    }

    /// Feed the newest frame, if any, and get what should be presented.
    pub fn update(&mut self, fresh: Option<T>, now: Instant) -> HoldOutcome<T> {
        if let Some(frame) = fresh {
            self.last = Some(frame.clone());
            self.last_new = Some(now);
            return HoldOutcome::New(frame);
        }

        match &self.last {
            Some(frame) => {
                let overdue = self
                    .last_new
                    .is_some_and(|t| now.saturating_duration_since(t) >= self.hold_after);
                if overdue {
                    self.repeats += 1;
                }
                HoldOutcome::Held(frame.clone())
            }
            None => HoldOutcome::Empty,
        }
    }

    pub fn reset(&mut self) {
        self.last = None;
        self.last_new = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hold_returns_previous_frame() {
        let start = Instant::now();
        let mut hold = FrameHold::new(Duration::from_millis(16));
        assert_eq!(hold.update(None, start), HoldOutcome::Empty);
        assert_eq!(hold.update(Some(1), start), HoldOutcome::New(1));

        // Within the interval: same frame, not yet a repeat
        assert_eq!(hold.update(None, start + Duration::from_millis(5)), HoldOutcome::Held(1));
        assert_eq!(hold.repeats(), 0);

        assert_eq!(hold.update(None, start + Duration::from_millis(20)), HoldOutcome::Held(1));
        assert_eq!(hold.repeats(), 1);

        assert_eq!(hold.update(Some(2), start + Duration::from_millis(21)), HoldOutcome::New(2));
        assert_eq!(hold.update(None, start + Duration::from_millis(22)).into_frame(), Some(2));
    }

    #[test]
    fn test_reset_clears_frame() {
        let now = Instant::now();
        let mut hold = FrameHold::new(Duration::from_millis(16));
        hold.update(Some("a"), now);
        hold.reset();
        assert_eq!(hold.update(None, now), HoldOutcome::Empty);
        assert!(hold.last().is_none());
    }
}
