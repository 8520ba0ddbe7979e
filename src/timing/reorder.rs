//! Fragment reassembly for received video
//!
//! Video frames arrive as numbered fragments that may be out of order. The
//! assembler keeps a bounded set of partial frames keyed by transport
//! sequence and releases a frame only once every fragment is present.
//! Completing a frame discards any older partial frame, so output is always
//! in sequence order.

use bytes::Bytes;
use std::collections::BTreeMap;

use crate::media::WireVideoHeader;
use crate::transport::VideoPacket;

/// Assembler health counters.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct AssemblerStats {
    pub fragments_received: u64,
    pub fragments_late: u64,
    pub fragments_duplicate: u64,
    pub fragments_malformed: u64,
    pub frames_completed: u64,
    /// Partial frames discarded before all fragments arrived
    pub frames_incomplete: u64,
    /// Sequence numbers never seen at all
    pub frames_lost: u64,
}

struct PartialFrame {
    header: WireVideoHeader,
    fragments: Vec<Option<Bytes>>,
    received: usize,
}

impl PartialFrame {
    fn is_complete(&self) -> bool {
        self.received == self.fragments.len()
    }
}

/// A complete frame in fragment order.
#[derive(Debug, Clone)]
pub struct AssembledFrame {
    pub sequence: u64,
    pub header: WireVideoHeader,
    pub fragments: Vec<Bytes>,
    /// Older partial frames discarded when this one completed
    pub discarded: u64,
    /// Frames between the previous completed frame and this one that never arrived
    pub lost: u64,
}

impl AssembledFrame {
    pub fn len(&self) -> usize {
        self.fragments.iter().map(|f| f.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The payload when it arrived in one piece.
    pub fn contiguous(&self) -> Option<&[u8]> {
        match self.fragments.as_slice() {
            [only] => Some(&only[..]),
            _ => None,
        }
    }

    /// Copy the payload into `dst`, returning the bytes written.
    pub fn copy_into(&self, dst: &mut [u8]) -> usize {
        let mut offset = 0;
        for fragment in &self.fragments {
            let end = (offset + fragment.len()).min(dst.len());
            let n = end - offset;
            dst[offset..end].copy_from_slice(&fragment[..n]);
            offset = end;
            if offset == dst.len() {
                break;
            }
        }
        offset
    }
}

pub struct FrameAssembler {
    max_pending: usize,
    pending: BTreeMap<u64, PartialFrame>,
    last_completed: Option<u64>,
    /// Partial frames evicted since the last completion
    evicted: u64,
    stats: AssemblerStats,
}

impl FrameAssembler {
    pub fn new(max_pending: usize) -> Self {
        Self {
            max_pending: max_pending.max(1),
            pending: BTreeMap::new(),
            last_completed: None,
            evicted: 0,
            stats: AssemblerStats::default(),
        }
    }

    pub fn stats(&self) -> &AssemblerStats {
        &self.stats
    }

    /// Partial frames currently held.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Forget all partial frames and sequence history.
    pub fn reset(&mut self) {
        self.stats.frames_incomplete += self.pending.len() as u64;
        self.pending.clear();
        self.last_completed = None;
        self.evicted = 0;
    }

    /// Add one fragment. Returns the frame it completes, if any.
    pub fn push(&mut self, packet: VideoPacket) -> Option<AssembledFrame> {
        self.stats.fragments_received += 1;

        if packet.fragment_count == 0 || packet.fragment >= packet.fragment_count {
            self.stats.fragments_malformed += 1;
            return None;
        }
        if self.last_completed.is_some_and(|last| packet.sequence <= last) {
            self.stats.fragments_late += 1;
            return None;
        }

        let sequence = packet.sequence;
        let partial = self.pending.entry(sequence).or_insert_with(|| PartialFrame {
            header: packet.header,
            fragments: vec![None; packet.fragment_count as usize],
            received: 0,
        });
        if partial.fragments.len() != packet.fragment_count as usize {
            self.stats.fragments_malformed += 1;
            return None;
        }
        let slot = &mut partial.fragments[packet.fragment as usize];
        if slot.is_some() {
            self.stats.fragments_duplicate += 1;
            return None;
        }
        *slot = Some(packet.payload);
        partial.received += 1;
        let complete = partial.is_complete();

        if !complete {
            while self.pending.len() > self.max_pending {
                if let Some((evicted, _)) = self.pending.pop_first() {
                    self.stats.frames_incomplete += 1;
                    self.evicted += 1;
                    if evicted == sequence {
                        return None;
                    }
                }
            }
            return None;
        }

        let frame = self.pending.remove(&sequence)?;
        let older: Vec<u64> = self.pending.range(..sequence).map(|(&s, _)| s).collect();
        for s in &older {
            self.pending.remove(s);
        }
        let discarded = older.len() as u64;
        self.stats.frames_incomplete += discarded;

        let gap = match self.last_completed {
            Some(last) => sequence - last - 1,
            None => 0,
        };
        let lost = gap.saturating_sub(discarded + self.evicted);
        self.stats.frames_lost += lost;
        self.stats.frames_completed += 1;
        self.last_completed = Some(sequence);
        self.evicted = 0;

        Some(AssembledFrame {
            sequence,
            header: frame.header,
            fragments: frame.fragments.into_iter().flatten().collect(),
            discarded,
            lost,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::WireFormat;
    use crate::timing::FrameRate;
    use rand::rngs::StdRng;
    use rand::seq::SliceRandom;
    use rand::SeedableRng;

    fn header() -> WireVideoHeader {
        WireVideoHeader {
            width: 2,
            height: 1,
            format: WireFormat::Bgra,
            frame_rate: FrameRate::FPS_60,
            timestamp: 0,
            timecode: None,
            frame_index: 0,
        }
    }

    fn fragments(sequence: u64, count: u16) -> Vec<VideoPacket> {
        (0..count)
            .map(|i| VideoPacket {
                sequence,
                fragment: i,
                fragment_count: count,
                header: header(),
                payload: Bytes::from(vec![i as u8; 3]),
            })
            .collect()
    }

    #[test]
    fn test_shuffled_fragments_reassemble_in_order() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut assembler = FrameAssembler::new(4);
        let mut packets = fragments(0, 6);
        packets.shuffle(&mut rng);

        let mut done = None;
        for p in packets {
            if let Some(frame) = assembler.push(p) {
                done = Some(frame);
            }
        }
        let frame = done.unwrap();
        assert_eq!(frame.len(), 18);
        let mut buf = vec![0u8; 18];
        assert_eq!(frame.copy_into(&mut buf), 18);
        assert_eq!(&buf[..6], &[0, 0, 0, 1, 1, 1]);
        assert_eq!(&buf[15..], &[5, 5, 5]);
    }

    #[test]
    fn test_newer_frame_discards_older_partial() {
        let mut assembler = FrameAssembler::new(4);
        let old = fragments(0, 2);
        assert!(assembler.push(old[0].clone()).is_none());

        let mut last = None;
        for p in fragments(1, 2) {
            last = assembler.push(p);
        }
        let frame = last.unwrap();
        assert_eq!(frame.sequence, 1);
        assert_eq!(frame.discarded, 1);
        assert_eq!(frame.lost, 0);

        // Late fragment of the discarded frame
        assert!(assembler.push(old[1].clone()).is_none());
        assert_eq!(assembler.stats().fragments_late, 1);
        assert_eq!(assembler.stats().frames_incomplete, 1);
        assert_eq!(assembler.pending(), 0);
    }

    #[test]
    fn test_sequence_gap_counts_lost() {
        let mut assembler = FrameAssembler::new(4);
        assert!(assembler.push(fragments(3, 1).remove(0)).is_some());
        let frame = assembler.push(fragments(7, 1).remove(0)).unwrap();
        assert_eq!(frame.lost, 3);
        assert_eq!(assembler.stats().frames_lost, 3);
        assert!(frame.contiguous().is_some());
    }

    #[test]
    fn test_duplicates_and_malformed_ignored() {
        let mut assembler = FrameAssembler::new(4);
        let packets = fragments(0, 2);
        assert!(assembler.push(packets[0].clone()).is_none());
        assert!(assembler.push(packets[0].clone()).is_none());
        assert_eq!(assembler.stats().fragments_duplicate, 1);

        let mut bad = packets[1].clone();
        bad.fragment = 5;
        assert!(assembler.push(bad).is_none());
        assert_eq!(assembler.stats().fragments_malformed, 1);

        assert!(assembler.push(packets[1].clone()).is_some());
    }

    #[test]
    fn test_pending_bound_evicts_oldest() {
        let mut assembler = FrameAssembler::new(2);
        for seq in 0..4 {
            assembler.push(fragments(seq, 2).remove(0));
        }
        assert_eq!(assembler.pending(), 2);
        assert_eq!(assembler.stats().frames_incomplete, 2);

        let frame = assembler.push(fragments(3, 2).remove(1)).unwrap();
        assert_eq!(frame.sequence, 3);
        // Sequence 2 discarded on completion, 0 and 1 evicted earlier
        assert_eq!(frame.discarded, 1);
        assert_eq!(assembler.stats().frames_incomplete, 3);
    }
}
