//! Audio layout conversion
//!
//! Engine audio is planar or interleaved `f32`; the wire carries interleaved
//! `f32` in wire channel order. No resampling is done: the stream format is
//! checked once at configure/connect time and mismatched blocks are rejected.

use super::ConvertError;
use crate::media::{AudioFormat, AudioFrame, SampleFormat, WireAudioFrame};
use crate::pool::{BufferSpec, FramePool, PoolKey};

/// Interleave planar audio. Wire channel `c` takes engine channel `map[c]`
/// when a map is given.
pub fn interleave(planar: &[f32], channels: usize, samples: usize, map: &[usize], out: &mut [f32]) {
    for c in 0..channels {
        let src_channel = map.get(c).copied().unwrap_or(c);
        let plane = &planar[src_channel * samples..(src_channel + 1) * samples];
        for (s, value) in plane.iter().enumerate() {
            out[s * channels + c] = *value;
        }
    }
}

/// Reorder channels of already-interleaved audio.
pub fn remap_interleaved(src: &[f32], channels: usize, map: &[usize], out: &mut [f32]) {
    for (frame_in, frame_out) in src.chunks_exact(channels).zip(out.chunks_exact_mut(channels)) {
        for (c, value) in frame_out.iter_mut().enumerate() {
            *value = frame_in[map.get(c).copied().unwrap_or(c)];
        }
    }
}

/// Split interleaved audio into one plane per channel.
pub fn deinterleave(interleaved: &[f32], channels: usize, samples: usize, out: &mut [f32]) {
    for (s, frame) in interleaved.chunks_exact(channels).take(samples).enumerate() {
        for (c, value) in frame.iter().enumerate() {
            out[c * samples + s] = *value;
        }
    }
}

/// Reject blocks whose format differs from the negotiated stream format.
pub fn ensure_format(expected: AudioFormat, actual: AudioFormat) -> Result<(), ConvertError> {
    if expected != actual {
        return Err(ConvertError::AudioFormatMismatch { expected, actual });
    }
    Ok(())
}

/// Converts engine audio frames to and from the wire layout.
#[derive(Debug, Clone, Default)]
pub struct AudioConverter {
    channel_map: Vec<usize>,
}

impl AudioConverter {
    /// `channel_map` may be empty for identity order.
    pub fn new(channel_map: Vec<usize>, channels: u16) -> Result<Self, ConvertError> {
        if !channel_map.is_empty()
            && (channel_map.len() != channels as usize
                || channel_map.iter().any(|&c| c >= channels as usize))
        {
            return Err(ConvertError::InvalidChannelMap {
                channels,
                map: channel_map,
            });
        }
        Ok(Self { channel_map })
    }

    pub fn channel_map(&self) -> &[usize] {
        &self.channel_map
    }

    pub fn to_wire(
        &self,
        frame: &AudioFrame,
        pool: &FramePool<f32>,
    ) -> Result<WireAudioFrame, ConvertError> {
        let channels = frame.channels() as usize;
        let samples = frame.samples_per_channel() as usize;
        if !self.channel_map.is_empty() && self.channel_map.len() != channels {
            return Err(ConvertError::InvalidChannelMap {
                channels: frame.channels(),
                map: self.channel_map.clone(),
            });
        }

        let spec = BufferSpec::new(
            PoolKey::audio(frame.channels(), frame.samples_per_channel()),
            channels * samples,
        );
        let mut data = pool.acquire(&spec)?;
        match frame.layout() {
            SampleFormat::F32Planar => {
                interleave(frame.samples(), channels, samples, &self.channel_map, &mut data)
            }
            SampleFormat::F32Interleaved => {
                remap_interleaved(frame.samples(), channels, &self.channel_map, &mut data)
            }
        }

        Ok(WireAudioFrame {
            format: frame.format(),
            samples_per_channel: frame.samples_per_channel(),
            timestamp: frame.timestamp,
            data,
        })
    }

    /// Build an engine frame from interleaved wire samples.
    pub fn from_wire(
        &self,
        format: AudioFormat,
        samples_per_channel: u32,
        interleaved: &[f32],
        layout: SampleFormat,
        pool: &FramePool<f32>,
    ) -> Result<AudioFrame, ConvertError> {
        let channels = format.channels as usize;
        let samples = samples_per_channel as usize;
        let needed = channels * samples;
        if interleaved.len() < needed {
            return Err(ConvertError::BufferTooSmall {
                needed,
                actual: interleaved.len(),
            });
        }

        let spec = BufferSpec::new(PoolKey::audio(format.channels, samples_per_channel), needed);
        let mut data = pool.acquire(&spec)?;
        match layout {
            SampleFormat::F32Planar => deinterleave(interleaved, channels, samples, &mut data),
            SampleFormat::F32Interleaved => data.copy_from_slice(&interleaved[..needed]),
        }
        AudioFrame::new(data, format.sample_rate, format.channels, samples_per_channel, layout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interleave_identity() {
        let planar = [1.0, 2.0, 3.0, 10.0, 20.0, 30.0];
        let mut out = [0.0; 6];
        interleave(&planar, 2, 3, &[], &mut out);
        assert_eq!(out, [1.0, 10.0, 2.0, 20.0, 3.0, 30.0]);

        let mut back = [0.0; 6];
        deinterleave(&out, 2, 3, &mut back);
        assert_eq!(back, planar);
    }

    #[test]
    fn test_channel_map() {
        let planar = [1.0, 1.0, 2.0, 2.0, 3.0, 3.0];
        let mut out = [0.0; 6];
        interleave(&planar, 3, 2, &[2, 0, 1], &mut out);
        assert_eq!(out, [3.0, 1.0, 2.0, 3.0, 1.0, 2.0]);

        let mut swapped = [0.0; 4];
        remap_interleaved(&[1.0, 2.0, 3.0, 4.0], 2, &[1, 0], &mut swapped);
        assert_eq!(swapped, [2.0, 1.0, 4.0, 3.0]);
    }

    #[test]
    fn test_invalid_channel_map() {
        assert!(AudioConverter::new(vec![0, 2], 2).is_err());
        assert!(AudioConverter::new(vec![0], 2).is_err());
        assert!(AudioConverter::new(vec![1, 0], 2).is_ok());
        assert!(AudioConverter::new(Vec::new(), 6).is_ok());
    }

    #[test]
    fn test_sample_rate_mismatch_is_error() {
        let err =
            ensure_format(AudioFormat::new(48_000, 2), AudioFormat::new(44_100, 2)).unwrap_err();
        assert!(matches!(err, ConvertError::AudioFormatMismatch { .. }));
        assert!(ensure_format(AudioFormat::new(48_000, 2), AudioFormat::new(48_000, 2)).is_ok());
    }

    #[test]
    fn test_wire_round_trip_through_pool() {
        let pool: FramePool<f32> = FramePool::new("audio", 4);
        let converter = AudioConverter::default();
        let frame = AudioFrame::from_planes(&[vec![0.5; 8], vec![-0.5; 8]], 48_000).unwrap();

        let wire = converter.to_wire(&frame, &pool).unwrap();
        assert_eq!(&wire.samples()[..4], &[0.5, -0.5, 0.5, -0.5]);

        let back = converter
            .from_wire(
                wire.format,
                wire.samples_per_channel,
                wire.samples(),
                SampleFormat::F32Planar,
                &pool,
            )
            .unwrap();
        assert_eq!(back.plane(1).unwrap(), &[-0.5; 8]);
        drop(wire);
        drop(back);
        assert_eq!(pool.live_count(), 0);
    }
}
