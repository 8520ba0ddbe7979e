//! Engine and wire format tags

use serde::{Deserialize, Serialize};
use std::fmt;

/// Pixel formats produced or consumed by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum PixelFormat {
    /// 8-bit RGBA
    #[default]
    Rgba8,
    /// 8-bit BGRA (swapchain order)
    Bgra8,
    /// 10-bit RGB with 2-bit alpha packed little-endian into 32 bits,
    /// red in the low bits
    Rgb10A2,
    /// 8-bit packed YCbCr 4:2:2 (U Y V Y), no alpha
    Uyvy,
}

impl PixelFormat {
    /// Bytes per pixel; for `Uyvy` this is the average over a pixel pair.
    pub fn bytes_per_pixel(&self) -> usize {
        match self {
            PixelFormat::Rgba8 | PixelFormat::Bgra8 | PixelFormat::Rgb10A2 => 4,
            PixelFormat::Uyvy => 2,
        }
    }

    /// Smallest valid row stride.
    pub fn min_stride(&self, width: u32) -> usize {
        width as usize * self.bytes_per_pixel()
    }

    pub fn has_alpha(&self) -> bool {
        !matches!(self, PixelFormat::Uyvy)
    }

    /// Chroma is shared across pixel pairs, so width must be even.
    pub fn is_subsampled(&self) -> bool {
        matches!(self, PixelFormat::Uyvy)
    }

    pub(crate) fn tag(&self) -> u32 {
        match self {
            PixelFormat::Rgba8 => 1,
            PixelFormat::Bgra8 => 2,
            PixelFormat::Rgb10A2 => 3,
            PixelFormat::Uyvy => 4,
        }
    }
}

/// Pixel layouts carried on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WireFormat {
    /// YCbCr 4:2:2, 8-bit
    Uyvy,
    /// UYVY plane followed by an 8-bit alpha plane
    Uyva,
    Bgra,
    /// BGRA with the alpha byte fixed at 255
    Bgrx,
    Rgba,
    /// RGBA with the alpha byte fixed at 255
    Rgbx,
    /// 16-bit Y plane followed by an interleaved 16-bit CbCr plane
    P216,
    /// P216 followed by a 16-bit alpha plane
    Pa16,
}

impl WireFormat {
    /// FourCC code as used by network media SDKs.
    pub fn fourcc(&self) -> u32 {
        let code = match self {
            WireFormat::Uyvy => b"UYVY",
            WireFormat::Uyva => b"UYVA",
            WireFormat::Bgra => b"BGRA",
            WireFormat::Bgrx => b"BGRX",
            WireFormat::Rgba => b"RGBA",
            WireFormat::Rgbx => b"RGBX",
            WireFormat::P216 => b"P216",
            WireFormat::Pa16 => b"PA16",
        };
        u32::from_le_bytes(*code)
    }

    pub fn has_alpha(&self) -> bool {
        matches!(
            self,
            WireFormat::Uyva | WireFormat::Bgra | WireFormat::Rgba | WireFormat::Pa16
        )
    }

    pub fn is_yuv(&self) -> bool {
        matches!(
            self,
            WireFormat::Uyvy | WireFormat::Uyva | WireFormat::P216 | WireFormat::Pa16
        )
    }

    pub fn family(&self) -> WireFamily {
        match self {
            WireFormat::Uyvy | WireFormat::Uyva => WireFamily::Uyvy,
            WireFormat::Bgra | WireFormat::Bgrx => WireFamily::Bgra,
            WireFormat::Rgba | WireFormat::Rgbx => WireFamily::Rgba,
            WireFormat::P216 | WireFormat::Pa16 => WireFamily::P216,
        }
    }

    /// Stride of the first plane.
    pub fn line_stride(&self, width: u32) -> usize {
        let w = width as usize;
        match self {
            WireFormat::Uyvy | WireFormat::Uyva | WireFormat::P216 | WireFormat::Pa16 => w * 2,
            WireFormat::Bgra | WireFormat::Bgrx | WireFormat::Rgba | WireFormat::Rgbx => w * 4,
        }
    }

    /// Total bytes for a frame including every plane.
    pub fn frame_size(&self, width: u32, height: u32) -> usize {
        let pixels = width as usize * height as usize;
        match self {
            WireFormat::Uyvy => pixels * 2,
            WireFormat::Uyva => pixels * 3,
            WireFormat::Bgra | WireFormat::Bgrx | WireFormat::Rgba | WireFormat::Rgbx => pixels * 4,
            WireFormat::P216 => pixels * 4,
            WireFormat::Pa16 => pixels * 6,
        }
    }

    pub(crate) fn tag(&self) -> u32 {
        self.fourcc()
    }
}

impl fmt::Display for WireFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bytes = self.fourcc().to_le_bytes();
        write!(f, "{}", String::from_utf8_lossy(&bytes))
    }
}

/// Wire format family chosen in configuration; the alpha flag selects the
/// concrete layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum WireFamily {
    #[default]
    Uyvy,
    P216,
    Bgra,
    Rgba,
}

impl WireFamily {
    pub fn resolve(&self, alpha: bool) -> WireFormat {
        match (self, alpha) {
            (WireFamily::Uyvy, false) => WireFormat::Uyvy,
            (WireFamily::Uyvy, true) => WireFormat::Uyva,
            (WireFamily::P216, false) => WireFormat::P216,
            (WireFamily::P216, true) => WireFormat::Pa16,
            (WireFamily::Bgra, false) => WireFormat::Bgrx,
            (WireFamily::Bgra, true) => WireFormat::Bgra,
            (WireFamily::Rgba, false) => WireFormat::Rgbx,
            (WireFamily::Rgba, true) => WireFormat::Rgba,
        }
    }
}

/// Engine-side audio sample layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum SampleFormat {
    /// One contiguous plane per channel
    #[default]
    F32Planar,
    /// Samples interleaved in channel order
    F32Interleaved,
}

/// Sample rate and channel count of an audio stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AudioFormat {
    #[serde(rename = "sampleRate")]
    pub sample_rate: u32,
    #[serde(rename = "channels")]
    pub channels: u16,
}

impl Default for AudioFormat {
    fn default() -> Self {
        Self {
            sample_rate: 48_000,
            channels: 2,
        }
    }
}

impl AudioFormat {
    pub fn new(sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_rate,
            channels,
        }
    }
}

impl fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} Hz x{}", self.sample_rate, self.channels)
    }
}
