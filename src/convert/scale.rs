//! Aspect-preserving fit onto a fixed output resolution

use super::pixel::Rgba16;

/// Region of the output covered by the source image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FitRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl FitRect {
    pub fn covers(&self, width: u32, height: u32) -> bool {
        self.x == 0 && self.y == 0 && self.width == width && self.height == height
    }

    pub fn contains_row(&self, y: u32) -> bool {
        y >= self.y && y < self.y + self.height
    }

    /// Source row sampled for output row `y`.
    pub fn source_row(&self, y: u32, src_height: u32) -> u32 {
        let local = (y - self.y) as u64;
        ((local * src_height as u64) / self.height as u64).min(src_height as u64 - 1) as u32
    }
}

/// Letterbox or pillarbox `src` into `dst`, centred.
pub fn fit_rect(src_width: u32, src_height: u32, dst_width: u32, dst_height: u32) -> FitRect {
    let src_w = src_width.max(1) as u64;
    let src_h = src_height.max(1) as u64;
    let dst_w = dst_width as u64;
    let dst_h = dst_height as u64;

    if src_w * dst_h > dst_w * src_h {
        // Source is wider: bars above and below
        let height = ((dst_w * src_h + src_w / 2) / src_w).clamp(1, dst_h) as u32;
        FitRect {
            x: 0,
            y: (dst_height - height) / 2,
            width: dst_width,
            height,
        }
    } else {
        let width = ((dst_h * src_w + src_h / 2) / src_h).clamp(1, dst_w) as u32;
        FitRect {
            x: (dst_width - width) / 2,
            y: 0,
            width,
            height: dst_height,
        }
    }
}

/// Nearest-neighbour resample of one source row into the fitted region of
/// `out`; pixels outside the region get `fill`.
pub fn sample_row(src: &[Rgba16], rect: &FitRect, out: &mut [Rgba16], fill: Rgba16) {
    let src_width = src.len() as u64;
    let start = rect.x as usize;
    let end = (rect.x + rect.width) as usize;

    out[..start].fill(fill);
    for (i, px) in out[start..end].iter_mut().enumerate() {
        let sx = ((i as u64 * src_width) / rect.width as u64).min(src_width - 1);
        *px = src[sx as usize];
    }
    out[end..].fill(fill);
}
