//! Color and format conversion between engine frames and wire frames
//!
//! Conversion runs one row at a time through a 16-bit RGBA scratch row owned
//! by the converter, writing straight into pooled output buffers. Nothing on
//! this path allocates once the scratch rows have grown to the frame width.

pub mod audio;
pub mod color;
pub mod pixel;
pub mod scale;
pub mod yuv;

use thiserror::Error;

pub use audio::{deinterleave, ensure_format, interleave, AudioConverter};
pub use color::{AlphaRemap, ColorCorrection, TransferLut};
pub use scale::{fit_rect, FitRect};

use crate::media::{AudioFormat, PixelFormat, VideoFrame, WireFormat, WireFrame, WireVideoHeader};
use crate::pool::{BufferSpec, FramePool, PoolError, PoolKey};
use pixel::{Rgba16, BLANK, OPAQUE};

/// Largest accepted frame edge.
pub const MAX_DIMENSION: u32 = 16_384;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConvertError {
    #[error("invalid dimensions {width}x{height}")]
    InvalidDimensions { width: u32, height: u32 },

    #[error("4:2:2 layouts need an even width, got {width}")]
    OddWidth { width: u32 },

    #[error("stride {stride} is smaller than the row size {row}")]
    InvalidStride { stride: usize, row: usize },

    #[error("buffer too small: need {needed}, got {actual}")]
    BufferTooSmall { needed: usize, actual: usize },

    #[error("invalid audio format: {sample_rate} Hz, {channels} channels")]
    InvalidAudioFormat { sample_rate: u32, channels: u16 },

    #[error("audio planes have different lengths")]
    RaggedPlanes,

    #[error("channel map {map:?} does not fit {channels} channels")]
    InvalidChannelMap { channels: u16, map: Vec<usize> },

    #[error("audio format {actual} does not match stream format {expected}")]
    AudioFormatMismatch {
        expected: AudioFormat,
        actual: AudioFormat,
    },

    #[error("alpha range {min}..{max} is invalid")]
    InvalidAlphaRange { min: f32, max: f32 },

    #[error(transparent)]
    Pool(#[from] PoolError),
}

/// Check a wire resolution before any buffers are sized for it.
pub fn validate_dimensions(
    format: WireFormat,
    width: u32,
    height: u32,
) -> Result<(), ConvertError> {
    if width == 0 || height == 0 || width > MAX_DIMENSION || height > MAX_DIMENSION {
        return Err(ConvertError::InvalidDimensions { width, height });
    }
    if format.is_yuv() && width % 2 != 0 {
        return Err(ConvertError::OddWidth { width });
    }
    Ok(())
}

/// Per-stream conversion settings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConversionOptions {
    pub color_correction: ColorCorrection,
    pub alpha_remap: AlphaRemap,
    /// Keep decoded alpha; when false every pixel is delivered opaque
    pub alpha: bool,
}

impl Default for ConversionOptions {
    fn default() -> Self {
        Self {
            color_correction: ColorCorrection::None,
            alpha_remap: AlphaRemap::default(),
            alpha: true,
        }
    }
}

impl ConversionOptions {
    pub fn validate(&self) -> Result<(), ConvertError> {
        if !self.alpha_remap.is_valid() {
            return Err(ConvertError::InvalidAlphaRange {
                min: self.alpha_remap.min,
                max: self.alpha_remap.max,
            });
        }
        Ok(())
    }
}

fn apply_corrections(lut: Option<&TransferLut>, options: &ConversionOptions, row: &mut [Rgba16]) {
    if let Some(lut) = lut {
        lut.apply(row);
    }
    if options.alpha {
        options.alpha_remap.apply(row);
    } else {
        for px in row.iter_mut() {
            px[3] = OPAQUE;
        }
    }
}

/// Converts video frames between engine and wire layouts.
pub struct VideoConverter {
    options: ConversionOptions,
    lut: Option<TransferLut>,
    src_row: Vec<Rgba16>,
    dst_row: Vec<Rgba16>,
}

impl VideoConverter {
    pub fn new(options: ConversionOptions) -> Self {
        Self {
            lut: TransferLut::build(options.color_correction),
            options,
            src_row: Vec::new(),
            dst_row: Vec::new(),
        }
    }

    pub fn options(&self) -> &ConversionOptions {
        &self.options
    }

    /// Convert an engine frame into a pooled wire frame described by `header`.
    /// The frame is fitted to the header's resolution if sizes differ.
    pub fn to_wire(
        &mut self,
        frame: &VideoFrame,
        header: WireVideoHeader,
        pool: &FramePool<u8>,
    ) -> Result<WireFrame, ConvertError> {
        validate_dimensions(header.format, header.width, header.height)?;
        let spec = BufferSpec::new(
            PoolKey::wire(header.format, header.width, header.height),
            header.data_len(),
        );
        let mut data = pool.acquire(&spec)?;
        self.encode_into(frame, &header, &mut data)?;
        Ok(WireFrame { header, data })
    }

    /// Write the wire representation of `frame` into `dst`.
    pub fn encode_into(
        &mut self,
        frame: &VideoFrame,
        header: &WireVideoHeader,
        dst: &mut [u8],
    ) -> Result<(), ConvertError> {
        let needed = header.data_len();
        if dst.len() < needed {
            return Err(ConvertError::BufferTooSmall {
                needed,
                actual: dst.len(),
            });
        }

        let (width, height) = (header.width, header.height);
        let src_width = frame.width() as usize;
        self.src_row.resize(src_width, BLANK);
        self.dst_row.resize(width as usize, BLANK);

        let scaled = frame.width() != width || frame.height() != height;
        let rect = fit_rect(frame.width(), frame.height(), width, height);
        let mut decoded_row: Option<u32> = None;

        for y in 0..height {
            if !scaled {
                pixel::decode_engine_row(
                    frame.format(),
                    frame.row(y),
                    src_width,
                    &mut self.dst_row,
                );
            } else if rect.contains_row(y) {
                let sy = rect.source_row(y, frame.height());
                if decoded_row != Some(sy) {
                    pixel::decode_engine_row(
                        frame.format(),
                        frame.row(sy),
                        src_width,
                        &mut self.src_row,
                    );
                    decoded_row = Some(sy);
                }
                scale::sample_row(&self.src_row, &rect, &mut self.dst_row, BLANK);
            } else {
                self.dst_row.fill(BLANK);
            }

            apply_corrections(self.lut.as_ref(), &self.options, &mut self.dst_row);
            pixel::encode_wire_row(
                header.format,
                width as usize,
                height as usize,
                y as usize,
                &self.dst_row,
                dst,
            );
        }

        Ok(())
    }

    /// Convert a wire frame into a pooled engine frame of `format`.
    pub fn from_wire(
        &mut self,
        wire: &WireFrame,
        format: PixelFormat,
        pool: &FramePool<u8>,
    ) -> Result<VideoFrame, ConvertError> {
        self.decode_frame(&wire.header, &wire.data, format, pool)
    }

    /// Decode raw wire bytes described by `header` into a pooled engine frame.
    pub fn decode_frame(
        &mut self,
        header: &WireVideoHeader,
        src: &[u8],
        format: PixelFormat,
        pool: &FramePool<u8>,
    ) -> Result<VideoFrame, ConvertError> {
        validate_dimensions(header.format, header.width, header.height)?;
        if format.is_subsampled() && header.width % 2 != 0 {
            return Err(ConvertError::OddWidth {
                width: header.width,
            });
        }

        let stride = format.min_stride(header.width);
        let spec = BufferSpec::new(
            PoolKey::video(format, header.width, header.height),
            stride * header.height as usize,
        );
        let mut data = pool.acquire(&spec)?;
        self.decode_into(header, src, format, &mut data, stride)?;

        let mut frame = VideoFrame::new(data, header.width, header.height, format, stride)?;
        frame.timestamp = header.timestamp;
        frame.timecode = header.timecode;
        frame.frame_rate = header.frame_rate;
        frame.frame_index = header.frame_index;
        Ok(frame)
    }

    /// Decode wire bytes into engine rows of `stride` bytes.
    pub fn decode_into(
        &mut self,
        header: &WireVideoHeader,
        src: &[u8],
        format: PixelFormat,
        dst: &mut [u8],
        stride: usize,
    ) -> Result<(), ConvertError> {
        let needed = header.data_len();
        if src.len() < needed {
            return Err(ConvertError::BufferTooSmall {
                needed,
                actual: src.len(),
            });
        }
        let row_len = format.min_stride(header.width);
        if stride < row_len {
            return Err(ConvertError::InvalidStride {
                stride,
                row: row_len,
            });
        }
        let dst_needed = stride * header.height as usize;
        if dst.len() < dst_needed {
            return Err(ConvertError::BufferTooSmall {
                needed: dst_needed,
                actual: dst.len(),
            });
        }

        let (width, height) = (header.width as usize, header.height as usize);
        self.dst_row.resize(width, BLANK);
        for y in 0..height {
            pixel::decode_wire_row(header.format, width, height, y, src, &mut self.dst_row);
            apply_corrections(self.lut.as_ref(), &self.options, &mut self.dst_row);
            pixel::encode_engine_row(
                format,
                &self.dst_row,
                &mut dst[y * stride..y * stride + row_len],
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timing::FrameRate;

    fn header(format: WireFormat, width: u32, height: u32) -> WireVideoHeader {
        WireVideoHeader {
            width,
            height,
            format,
            frame_rate: FrameRate::FPS_60,
            timestamp: 1234,
            timecode: None,
            frame_index: 9,
        }
    }

    /// Gradient colour with an alpha ramp covering every 8-bit value.
    fn pattern_rgba8(width: u32, height: u32) -> Vec<u8> {
        let mut data = Vec::with_capacity((width * height * 4) as usize);
        for y in 0..height {
            for x in 0..width {
                let i = y * width + x;
                data.extend_from_slice(&[(x * 7) as u8, (y * 13) as u8, (i * 3) as u8, i as u8]);
            }
        }
        data
    }

    fn alpha_of(frame: &VideoFrame) -> Vec<u8> {
        frame.data().chunks_exact(4).map(|c| c[3]).collect()
    }

    #[test]
    fn test_alpha_round_trip_is_bit_exact() {
        let pool: FramePool<u8> = FramePool::new("test", 8);
        let source = VideoFrame::from_vec(pattern_rgba8(32, 8), 32, 8, PixelFormat::Rgba8).unwrap();

        for format in [WireFormat::Uyva, WireFormat::Pa16, WireFormat::Bgra, WireFormat::Rgba] {
            let mut converter = VideoConverter::new(ConversionOptions::default());
            let wire = converter.to_wire(&source, header(format, 32, 8), &pool).unwrap();
            let back = converter.from_wire(&wire, PixelFormat::Rgba8, &pool).unwrap();

            assert_eq!((back.width(), back.height()), (32, 8));
            assert_eq!(alpha_of(&back), alpha_of(&source), "alpha changed through {}", format);
        }
    }

    #[test]
    fn test_rgb_exact_through_bgra() {
        let pool: FramePool<u8> = FramePool::new("test", 4);
        let source = VideoFrame::from_vec(pattern_rgba8(16, 4), 16, 4, PixelFormat::Rgba8).unwrap();
        let mut converter = VideoConverter::new(ConversionOptions::default());
        let wire = converter.to_wire(&source, header(WireFormat::Bgra, 16, 4), &pool).unwrap();
        let back = converter.from_wire(&wire, PixelFormat::Bgra8, &pool).unwrap();

        for (s, b) in source.data().chunks_exact(4).zip(back.data().chunks_exact(4)) {
            assert_eq!([s[2], s[1], s[0], s[3]], [b[0], b[1], b[2], b[3]]);
        }
    }

    #[test]
    fn test_rgb10a2_alpha_through_uyva() {
        let pool: FramePool<u8> = FramePool::new("test", 4);
        let mut data = Vec::new();
        for i in 0..8u32 {
            let px = (i * 100) | ((i * 50) << 10) | (1023 << 20) | ((i % 4) << 30);
            data.extend_from_slice(&px.to_le_bytes());
        }
        let source = VideoFrame::from_vec(data, 8, 1, PixelFormat::Rgb10A2).unwrap();
        let mut converter = VideoConverter::new(ConversionOptions::default());
        let wire = converter.to_wire(&source, header(WireFormat::Uyva, 8, 1), &pool).unwrap();
        let back = converter.from_wire(&wire, PixelFormat::Rgb10A2, &pool).unwrap();

        for (s, b) in source.data().chunks_exact(4).zip(back.data().chunks_exact(4)) {
            assert_eq!(s[3] >> 6, b[3] >> 6);
        }
    }

    #[test]
    fn test_alpha_dropped_when_disabled() {
        let pool: FramePool<u8> = FramePool::new("test", 4);
        let source = VideoFrame::from_vec(pattern_rgba8(8, 2), 8, 2, PixelFormat::Rgba8).unwrap();
        let mut converter = VideoConverter::new(ConversionOptions::default());
        let wire = converter.to_wire(&source, header(WireFormat::Uyvy, 8, 2), &pool).unwrap();
        let back = converter.from_wire(&wire, PixelFormat::Rgba8, &pool).unwrap();
        assert!(alpha_of(&back).iter().all(|&a| a == 255));

        // Alpha on the wire but disabled on receive
        let mut opaque = VideoConverter::new(ConversionOptions {
            alpha: false,
            ..Default::default()
        });
        let wire = converter.to_wire(&source, header(WireFormat::Uyva, 8, 2), &pool).unwrap();
        let back = opaque.from_wire(&wire, PixelFormat::Rgba8, &pool).unwrap();
        assert!(alpha_of(&back).iter().all(|&a| a == 255));
    }

    #[test]
    fn test_solid_colour_through_uyvy() {
        let pool: FramePool<u8> = FramePool::new("test", 4);
        let colour = [200u8, 100, 50, 255];
        let source =
            VideoFrame::from_vec(colour.repeat(64 * 4), 64, 4, PixelFormat::Rgba8).unwrap();
        let mut converter = VideoConverter::new(ConversionOptions::default());
        let wire = converter.to_wire(&source, header(WireFormat::Uyvy, 64, 4), &pool).unwrap();
        let back = converter.from_wire(&wire, PixelFormat::Rgba8, &pool).unwrap();

        for px in back.data().chunks_exact(4) {
            for c in 0..3 {
                assert!((px[c] as i32 - colour[c] as i32).abs() <= 3, "{:?}", px);
            }
        }
    }

    #[test]
    fn test_letterbox_into_output_resolution() {
        let pool: FramePool<u8> = FramePool::new("test", 4);
        // 4:1 white source into a 4:2 output leaves bars top and bottom
        let source =
            VideoFrame::from_vec([255u8; 4].repeat(8 * 2), 8, 2, PixelFormat::Rgba8).unwrap();
        let mut converter = VideoConverter::new(ConversionOptions::default());
        let wire = converter.to_wire(&source, header(WireFormat::Rgba, 8, 4), &pool).unwrap();
        let back = converter.from_wire(&wire, PixelFormat::Rgba8, &pool).unwrap();

        assert_eq!(back.row(0)[..4], [0, 0, 0, 0]);
        assert_eq!(back.row(1)[..4], [255, 255, 255, 255]);
        assert_eq!(back.row(2)[..4], [255, 255, 255, 255]);
        assert_eq!(back.row(3)[..4], [0, 0, 0, 0]);
    }

    #[test]
    fn test_header_timing_carried_to_engine_frame() {
        let pool: FramePool<u8> = FramePool::new("test", 4);
        let source = VideoFrame::from_vec(pattern_rgba8(4, 2), 4, 2, PixelFormat::Rgba8).unwrap();
        let mut converter = VideoConverter::new(ConversionOptions::default());
        let wire = converter.to_wire(&source, header(WireFormat::P216, 4, 2), &pool).unwrap();
        let back = converter.from_wire(&wire, PixelFormat::Uyvy, &pool).unwrap();
        assert_eq!(back.timestamp, 1234);
        assert_eq!(back.frame_index, 9);
        assert_eq!(back.stride(), 8);
    }

    #[test]
    fn test_invalid_dimensions() {
        assert_eq!(
            validate_dimensions(WireFormat::Uyvy, 1919, 1080),
            Err(ConvertError::OddWidth { width: 1919 })
        );
        assert!(validate_dimensions(WireFormat::Bgra, 1919, 1080).is_ok());
        assert!(validate_dimensions(WireFormat::Bgra, 0, 1080).is_err());
    }

    #[test]
    fn test_conversion_reuses_pool_buffers() {
        let pool: FramePool<u8> = FramePool::new("test", 2);
        let source = VideoFrame::from_vec(pattern_rgba8(8, 2), 8, 2, PixelFormat::Rgba8).unwrap();
        let mut converter = VideoConverter::new(ConversionOptions::default());
        for _ in 0..10 {
            let wire = converter.to_wire(&source, header(WireFormat::Uyvy, 8, 2), &pool).unwrap();
            drop(wire);
        }
        assert_eq!(pool.capacity(), 1);
    }
}
