//! Audio/video matching on the receive side
//!
//! Received audio is queued and handed out against video presentation
//! times. Blocks that have fallen behind or run ahead of the video by more
//! than the threshold flush the queue instead of letting skew build up.

use std::collections::VecDeque;

use super::Ticks;
use crate::media::AudioFrame;

#[derive(Debug)]
pub enum SyncOutcome {
    /// The block nearest the video timestamp
    Matched(AudioFrame),
    /// Audio had drifted; the queue was flushed
    Resync { flushed: usize },
    Empty,
}

pub struct AvSync {
    queue: VecDeque<AudioFrame>,
    capacity: usize,
    threshold: Ticks,
    resyncs: u64,
    dropped: u64,
}

impl AvSync {
    pub fn new(capacity: usize, threshold: Ticks) -> Self {
        let capacity = capacity.max(1);
        Self {
            queue: VecDeque::with_capacity(capacity),
            capacity,
            threshold,
            resyncs: 0,
            dropped: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn resyncs(&self) -> u64 {
        self.resyncs
    }

    /// Blocks discarded by overflow or skipped over when matching.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Queue a block, dropping the oldest when full. Returns false if a block was dropped.
    pub fn push(&mut self, frame: AudioFrame) -> bool {
        let mut kept_all = true;
        if self.queue.len() >= self.capacity {
            self.queue.pop_front();
            self.dropped += 1;
            kept_all = false;
        }
        self.queue.push_back(frame);
        kept_all
    }

    /// Take the block nearest to `video_timestamp`. Blocks queued before it are discarded.
    pub fn take_for_video(&mut self, video_timestamp: Ticks) -> SyncOutcome {
        let nearest = self
            .queue
            .iter()
            .enumerate()
            .min_by_key(|(_, f)| (f.timestamp - video_timestamp).abs())
            .map(|(i, f)| (i, (f.timestamp - video_timestamp).abs()));

        match nearest {
            None => SyncOutcome::Empty,
            Some((index, drift)) if drift <= self.threshold => {
                self.dropped += index as u64;
                self.queue.drain(..index);
                match self.queue.pop_front() {
                    Some(frame) => SyncOutcome::Matched(frame),
                    None => SyncOutcome::Empty,
                }
            }
            Some(_) => {
                let flushed = self.queue.len();
                self.queue.clear();
                self.resyncs += 1;
                self.dropped += flushed as u64;
                SyncOutcome::Resync { flushed }
            }
        }
    }

    /// Everything queued, oldest first.
    pub fn drain(&mut self) -> Vec<AudioFrame> {
        self.queue.drain(..).collect()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timing::TICKS_PER_SECOND;

    const MS: Ticks = TICKS_PER_SECOND / 1000;

    fn block(timestamp: Ticks) -> AudioFrame {
        let mut frame = AudioFrame::from_planes(&[vec![0.0; 4]], 48_000).unwrap();
        frame.timestamp = timestamp;
        frame
    }

    #[test]
    fn test_matches_nearest_block() {
        let mut sync = AvSync::new(8, 50 * MS);
        for t in [0, 16, 33, 50] {
            sync.push(block(t * MS));
        }
        match sync.take_for_video(30 * MS) {
            SyncOutcome::Matched(f) => assert_eq!(f.timestamp, 33 * MS),
            other => panic!("unexpected {:?}", other),
        }
        // 0 and 16 were skipped
        assert_eq!(sync.dropped(), 2);
        assert_eq!(sync.len(), 1);
    }

    #[test]
    fn test_drift_flushes_queue() {
        let mut sync = AvSync::new(8, 50 * MS);
        sync.push(block(0));
        sync.push(block(10 * MS));
        match sync.take_for_video(500 * MS) {
            SyncOutcome::Resync { flushed } => assert_eq!(flushed, 2),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(sync.resyncs(), 1);
        assert!(sync.is_empty());
        assert!(matches!(sync.take_for_video(500 * MS), SyncOutcome::Empty));
    }

    #[test]
    fn test_overflow_drops_oldest() {
        let mut sync = AvSync::new(2, 50 * MS);
        assert!(sync.push(block(0)));
        assert!(sync.push(block(MS)));
        assert!(!sync.push(block(2 * MS)));
        let drained = sync.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].timestamp, MS);
    }
}
