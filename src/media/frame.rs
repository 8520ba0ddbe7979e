//! Video, audio and wire frame types
//!
//! Engine frames hold their pixel or sample storage behind an `Arc`, so a
//! clone is a second reference to the same buffer. The buffer returns to its
//! pool when the last reference is dropped, which is what keeps frames valid
//! after the pipeline that produced them has been torn down.

use std::sync::Arc;

use crate::convert::ConvertError;
use crate::media::{AudioFormat, PixelFormat, SampleFormat, WireFormat};
use crate::pool::PooledBuffer;
use crate::timing::{FrameRate, FrameStamp, Ticks, Timecode, TICKS_PER_SECOND};

/// An engine-side video frame.
#[derive(Clone)]
pub struct VideoFrame {
    width: u32,
    height: u32,
    format: PixelFormat,
    stride: usize,
    /// Presentation time in 100ns ticks
    pub timestamp: Ticks,
    pub frame_rate: FrameRate,
    pub timecode: Option<Timecode>,
    /// Position in the owning clock domain
    pub frame_index: u64,
    buffer: Arc<PooledBuffer<u8>>,
}

impl VideoFrame {
    /// Wrap a buffer holding `height` rows of `stride` bytes.
    pub fn new(
        buffer: PooledBuffer<u8>,
        width: u32,
        height: u32,
        format: PixelFormat,
        stride: usize,
    ) -> Result<Self, ConvertError> {
        if width == 0 || height == 0 {
            return Err(ConvertError::InvalidDimensions { width, height });
        }
        if format.is_subsampled() && width % 2 != 0 {
            return Err(ConvertError::OddWidth { width });
        }
        let row = format.min_stride(width);
        if stride < row {
            return Err(ConvertError::InvalidStride { stride, row });
        }
        let needed = stride * height as usize;
        if buffer.len() < needed {
            return Err(ConvertError::BufferTooSmall {
                needed,
                actual: buffer.len(),
            });
        }

        Ok(Self {
            width,
            height,
            format,
            stride,
            timestamp: 0,
            frame_rate: FrameRate::default(),
            timecode: None,
            frame_index: 0,
            buffer: Arc::new(buffer),
        })
    }

    /// Wrap tightly packed host pixels that do not come from a pool.
    pub fn from_vec(
        data: Vec<u8>,
        width: u32,
        height: u32,
        format: PixelFormat,
    ) -> Result<Self, ConvertError> {
        let stride = format.min_stride(width);
        Self::new(PooledBuffer::detached(data), width, height, format, stride)
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    pub fn data(&self) -> &[u8] {
        &self.buffer
    }

    /// Mutable pixels, available only while this is the sole reference.
    pub fn data_mut(&mut self) -> Option<&mut [u8]> {
        Arc::get_mut(&mut self.buffer).map(|b| &mut b[..])
    }

    /// Bytes of row `y` without stride padding.
    pub fn row(&self, y: u32) -> &[u8] {
        let start = y as usize * self.stride;
        &self.buffer[start..start + self.format.min_stride(self.width)]
    }

    /// True when both frames reference the same buffer.
    pub fn same_buffer(&self, other: &VideoFrame) -> bool {
        Arc::ptr_eq(&self.buffer, &other.buffer)
    }

    pub(crate) fn apply_stamp(&mut self, stamp: &FrameStamp, frame_rate: FrameRate) {
        self.frame_index = stamp.index;
        self.timestamp = stamp.timestamp;
        self.timecode = Some(stamp.timecode);
        self.frame_rate = frame_rate;
    }
}

impl std::fmt::Debug for VideoFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VideoFrame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("format", &self.format)
            .field("stride", &self.stride)
            .field("timestamp", &self.timestamp)
            .field("frame_index", &self.frame_index)
            .finish()
    }
}

/// An engine-side block of audio samples.
#[derive(Clone)]
pub struct AudioFrame {
    sample_rate: u32,
    channels: u16,
    samples_per_channel: u32,
    layout: SampleFormat,
    /// Presentation time in the owning video clock domain
    pub timestamp: Ticks,
    buffer: Arc<PooledBuffer<f32>>,
}

impl AudioFrame {
    pub fn new(
        buffer: PooledBuffer<f32>,
        sample_rate: u32,
        channels: u16,
        samples_per_channel: u32,
        layout: SampleFormat,
    ) -> Result<Self, ConvertError> {
        if sample_rate == 0 || channels == 0 {
            return Err(ConvertError::InvalidAudioFormat {
                sample_rate,
                channels,
            });
        }
        let needed = channels as usize * samples_per_channel as usize;
        if buffer.len() < needed {
            return Err(ConvertError::BufferTooSmall {
                needed,
                actual: buffer.len(),
            });
        }
        Ok(Self {
            sample_rate,
            channels,
            samples_per_channel,
            layout,
            timestamp: 0,
            buffer: Arc::new(buffer),
        })
    }

    /// Build a planar frame from one vector per channel.
    pub fn from_planes(planes: &[Vec<f32>], sample_rate: u32) -> Result<Self, ConvertError> {
        let samples = planes.first().map(Vec::len).unwrap_or(0);
        if planes.iter().any(|p| p.len() != samples) {
            return Err(ConvertError::RaggedPlanes);
        }
        let data: Vec<f32> = planes.iter().flatten().copied().collect();
        Self::new(
            PooledBuffer::detached(data),
            sample_rate,
            planes.len() as u16,
            samples as u32,
            SampleFormat::F32Planar,
        )
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    pub fn samples_per_channel(&self) -> u32 {
        self.samples_per_channel
    }

    pub fn layout(&self) -> SampleFormat {
        self.layout
    }

    pub fn format(&self) -> AudioFormat {
        AudioFormat::new(self.sample_rate, self.channels)
    }

    pub fn samples(&self) -> &[f32] {
        &self.buffer[..self.channels as usize * self.samples_per_channel as usize]
    }

    /// One channel's samples, for planar frames.
    pub fn plane(&self, channel: u16) -> Option<&[f32]> {
        if self.layout != SampleFormat::F32Planar || channel >= self.channels {
            return None;
        }
        let n = self.samples_per_channel as usize;
        let start = channel as usize * n;
        Some(&self.buffer[start..start + n])
    }

    /// Length of the block in ticks.
    pub fn duration_ticks(&self) -> Ticks {
        self.samples_per_channel as Ticks * TICKS_PER_SECOND / self.sample_rate as Ticks
    }

    pub fn same_buffer(&self, other: &AudioFrame) -> bool {
        Arc::ptr_eq(&self.buffer, &other.buffer)
    }
}

impl std::fmt::Debug for AudioFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioFrame")
            .field("sample_rate", &self.sample_rate)
            .field("channels", &self.channels)
            .field("samples_per_channel", &self.samples_per_channel)
            .field("layout", &self.layout)
            .field("timestamp", &self.timestamp)
            .finish()
    }
}

/// Description of a wire video frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WireVideoHeader {
    pub width: u32,
    pub height: u32,
    pub format: WireFormat,
    pub frame_rate: FrameRate,
    pub timestamp: Ticks,
    pub timecode: Option<Timecode>,
    pub frame_index: u64,
}

impl WireVideoHeader {
    pub fn data_len(&self) -> usize {
        self.format.frame_size(self.width, self.height)
    }
}

/// Video converted to a wire layout, ready for the transport.
#[derive(Debug)]
pub struct WireFrame {
    pub header: WireVideoHeader,
    pub data: PooledBuffer<u8>,
}

impl WireFrame {
    pub fn payload(&self) -> &[u8] {
        &self.data[..self.header.data_len()]
    }
}

/// Interleaved audio in wire channel order.
#[derive(Debug)]
pub struct WireAudioFrame {
    pub format: AudioFormat,
    pub samples_per_channel: u32,
    pub timestamp: Ticks,
    pub data: PooledBuffer<f32>,
}

impl WireAudioFrame {
    pub fn samples(&self) -> &[f32] {
        &self.data[..self.format.channels as usize * self.samples_per_channel as usize]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_video_frame_validation() {
        let err = VideoFrame::from_vec(vec![0; 12], 2, 2, PixelFormat::Rgba8).unwrap_err();
        assert_eq!(err, ConvertError::BufferTooSmall { needed: 16, actual: 12 });

        let err = VideoFrame::from_vec(vec![0; 6], 3, 1, PixelFormat::Uyvy).unwrap_err();
        assert_eq!(err, ConvertError::OddWidth { width: 3 });

        let err = VideoFrame::new(PooledBuffer::detached(vec![0; 64]), 4, 2, PixelFormat::Rgba8, 8)
            .unwrap_err();
        assert_eq!(err, ConvertError::InvalidStride { stride: 8, row: 16 });
    }

    #[test]
    fn test_clone_shares_identity() {
        let mut frame = VideoFrame::from_vec(vec![0; 16], 2, 2, PixelFormat::Bgra8).unwrap();
        assert!(frame.data_mut().is_some());
        let copy = frame.clone();
        assert!(copy.same_buffer(&frame));
        assert!(frame.data_mut().is_none());
    }

    #[test]
    fn test_padded_rows() {
        let mut data = vec![0u8; 2 * 12];
        data[12..20].copy_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);
        let frame =
            VideoFrame::new(PooledBuffer::detached(data), 2, 2, PixelFormat::Rgba8, 12).unwrap();
        assert_eq!(frame.row(1), &[1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn test_audio_planes() {
        let frame = AudioFrame::from_planes(&[vec![0.1; 4], vec![0.2; 4]], 48_000).unwrap();
        assert_eq!(frame.channels(), 2);
        assert_eq!(frame.plane(1).unwrap(), &[0.2; 4]);
        assert!(frame.plane(2).is_none());
        assert_eq!(frame.duration_ticks(), 4 * TICKS_PER_SECOND / 48_000);

        assert_eq!(
            AudioFrame::from_planes(&[vec![0.0; 4], vec![0.0; 3]], 48_000).unwrap_err(),
            ConvertError::RaggedPlanes
        );
    }
}
