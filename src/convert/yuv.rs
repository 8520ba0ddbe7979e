//! BT.709 limited-range YCbCr
//!
//! 8-bit codes: Y in 16..=235, Cb/Cr in 16..=240 centred on 128.
//! 16-bit codes are the 8-bit ranges scaled by 256.

use super::pixel::{Rgba16, OPAQUE};

const KR: f32 = 0.2126;
const KB: f32 = 0.0722;
const KG: f32 = 1.0 - KR - KB;
const CB_SCALE: f32 = 2.0 * (1.0 - KB);
const CR_SCALE: f32 = 2.0 * (1.0 - KR);

/// Normalised luma (0..1) and chroma (-0.5..0.5).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Ycc {
    pub y: f32,
    pub cb: f32,
    pub cr: f32,
}

impl Ycc {
    pub fn from_rgb(px: &Rgba16) -> Self {
        let r = px[0] as f32 / 65535.0;
        let g = px[1] as f32 / 65535.0;
        let b = px[2] as f32 / 65535.0;
        let y = KR * r + KG * g + KB * b;
        Self {
            y,
            cb: (b - y) / CB_SCALE,
            cr: (r - y) / CR_SCALE,
        }
    }

    /// RGB with the given alpha.
    pub fn to_rgba(&self, alpha: u16) -> Rgba16 {
        let r = self.y + CR_SCALE * self.cr;
        let b = self.y + CB_SCALE * self.cb;
        let g = (self.y - KR * r - KB * b) / KG;
        [unit_to_16(r), unit_to_16(g), unit_to_16(b), alpha]
    }

    /// Chroma average of a pixel pair.
    pub fn mean_chroma(a: &Ycc, b: &Ycc) -> (f32, f32) {
        ((a.cb + b.cb) * 0.5, (a.cr + b.cr) * 0.5)
    }
}

fn unit_to_16(v: f32) -> u16 {
    (v.clamp(0.0, 1.0) * 65535.0).round() as u16
}

pub fn luma8(y: f32) -> u8 {
    (16.0 + 219.0 * y).round().clamp(0.0, 255.0) as u8
}

pub fn chroma8(c: f32) -> u8 {
    (128.0 + 224.0 * c).round().clamp(0.0, 255.0) as u8
}

pub fn luma16(y: f32) -> u16 {
    ((16.0 + 219.0 * y) * 256.0).round().clamp(0.0, 65535.0) as u16
}

pub fn chroma16(c: f32) -> u16 {
    ((128.0 + 224.0 * c) * 256.0).round().clamp(0.0, 65535.0) as u16
}

/// Decode 8-bit codes to RGBA16 with opaque alpha.
pub fn decode8(y: u8, cb: u8, cr: u8) -> Rgba16 {
    Ycc {
        y: (y as f32 - 16.0) / 219.0,
        cb: (cb as f32 - 128.0) / 224.0,
        cr: (cr as f32 - 128.0) / 224.0,
    }
    .to_rgba(OPAQUE)
}

/// Decode 16-bit codes to RGBA16 with opaque alpha.
pub fn decode16(y: u16, cb: u16, cr: u16) -> Rgba16 {
    Ycc {
        y: (y as f32 / 256.0 - 16.0) / 219.0,
        cb: (cb as f32 / 256.0 - 128.0) / 224.0,
        cr: (cr as f32 / 256.0 - 128.0) / 224.0,
    }
    .to_rgba(OPAQUE)
}
