//! Transfer-function correction and alpha range remapping

use serde::{Deserialize, Serialize};

use super::pixel::Rgba16;

/// Optional transfer-function conversion applied to RGB.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ColorCorrection {
    #[default]
    None,
    /// Encode linear render output for display-referred receivers
    LinearToSrgb,
    SrgbToLinear,
}

pub fn linear_to_srgb(x: f32) -> f32 {
    if x <= 0.003_130_8 {
        x * 12.92
    } else {
        1.055 * x.powf(1.0 / 2.4) - 0.055
    }
}

pub fn srgb_to_linear(x: f32) -> f32 {
    if x <= 0.040_45 {
        x / 12.92
    } else {
        ((x + 0.055) / 1.055).powf(2.4)
    }
}

/// Full 16-bit lookup table for one transfer function.
pub struct TransferLut {
    table: Box<[u16]>,
}

impl TransferLut {
    /// `None` when no correction is requested.
    pub fn build(correction: ColorCorrection) -> Option<Self> {
        let f: fn(f32) -> f32 = match correction {
            ColorCorrection::None => return None,
            ColorCorrection::LinearToSrgb => linear_to_srgb,
            ColorCorrection::SrgbToLinear => srgb_to_linear,
        };
        let table = (0..=u16::MAX)
            .map(|v| (f(v as f32 / 65535.0).clamp(0.0, 1.0) * 65535.0).round() as u16)
            .collect();
        Some(Self { table })
    }

    pub fn apply(&self, row: &mut [Rgba16]) {
        for px in row {
            px[0] = self.table[px[0] as usize];
            px[1] = self.table[px[1] as usize];
            px[2] = self.table[px[2] as usize];
        }
    }
}

/// Maps alpha in `[min, max]` onto the full range.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AlphaRemap {
    pub min: f32,
    pub max: f32,
}

impl Default for AlphaRemap {
    fn default() -> Self {
        Self { min: 0.0, max: 1.0 }
    }
}

impl AlphaRemap {
    pub fn new(min: f32, max: f32) -> Self {
        Self { min, max }
    }

    pub fn is_identity(&self) -> bool {
        self.min == 0.0 && self.max == 1.0
    }

    pub fn is_valid(&self) -> bool {
        (0.0..=1.0).contains(&self.min) && (0.0..=1.0).contains(&self.max) && self.min < self.max
    }

    pub fn apply(&self, row: &mut [Rgba16]) {
        if self.is_identity() {
            return;
        }
        let scale = 1.0 / (self.max - self.min);
        for px in row {
            let a = px[3] as f32 / 65535.0;
            px[3] = (((a - self.min) * scale).clamp(0.0, 1.0) * 65535.0).round() as u16;
        }
    }
}
