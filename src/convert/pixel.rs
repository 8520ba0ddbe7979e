//! Row codecs between engine/wire layouts and 16-bit RGBA
//!
//! Every conversion passes through one row of `[u16; 4]` RGBA. Widening and
//! narrowing are exact inverses for 8-bit, 10-bit and 2-bit values, which is
//! what makes alpha survive a round trip bit-for-bit.

use super::yuv::{self, Ycc};
use crate::media::{PixelFormat, WireFormat};

pub type Rgba16 = [u16; 4];

pub const OPAQUE: u16 = u16::MAX;

/// Fill for letterbox bars: black, fully transparent.
pub const BLANK: Rgba16 = [0, 0, 0, 0];

#[inline]
pub fn widen8(v: u8) -> u16 {
    v as u16 * 257
}

#[inline]
pub fn narrow8(v: u16) -> u8 {
    ((v as u32 + 128) / 257) as u8
}

#[inline]
fn widen10(v: u32) -> u16 {
    ((v << 6) | (v >> 4)) as u16
}

#[inline]
fn narrow10(v: u16) -> u32 {
    (v as u32 * 1023 + 32767) / 65535
}

#[inline]
fn widen2(v: u32) -> u16 {
    (v * 0x5555) as u16
}

#[inline]
fn narrow2(v: u16) -> u32 {
    (v as u32 + 0x2AAA) / 0x5555
}

#[inline]
fn read_u16(bytes: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([bytes[offset], bytes[offset + 1]])
}

#[inline]
fn write_u16(bytes: &mut [u8], offset: usize, v: u16) {
    bytes[offset..offset + 2].copy_from_slice(&v.to_le_bytes());
}

/// Decode `width` engine pixels from `src` into `out`.
pub fn decode_engine_row(format: PixelFormat, src: &[u8], width: usize, out: &mut [Rgba16]) {
    let out = &mut out[..width];
    match format {
        PixelFormat::Rgba8 => {
            for (px, c) in out.iter_mut().zip(src.chunks_exact(4)) {
                *px = [widen8(c[0]), widen8(c[1]), widen8(c[2]), widen8(c[3])];
            }
        }
        PixelFormat::Bgra8 => {
            for (px, c) in out.iter_mut().zip(src.chunks_exact(4)) {
                *px = [widen8(c[2]), widen8(c[1]), widen8(c[0]), widen8(c[3])];
            }
        }
        PixelFormat::Rgb10A2 => {
            for (px, c) in out.iter_mut().zip(src.chunks_exact(4)) {
                let v = u32::from_le_bytes([c[0], c[1], c[2], c[3]]);
                *px = [
                    widen10(v & 0x3FF),
                    widen10((v >> 10) & 0x3FF),
                    widen10((v >> 20) & 0x3FF),
                    widen2(v >> 30),
                ];
            }
        }
        PixelFormat::Uyvy => {
            for (pair, c) in out.chunks_exact_mut(2).zip(src.chunks_exact(4)) {
                pair[0] = yuv::decode8(c[1], c[0], c[2]);
                pair[1] = yuv::decode8(c[3], c[0], c[2]);
            }
        }
    }
}

/// Encode one row of RGBA16 into engine pixels.
pub fn encode_engine_row(format: PixelFormat, row: &[Rgba16], dst: &mut [u8]) {
    match format {
        PixelFormat::Rgba8 => {
            for (px, c) in row.iter().zip(dst.chunks_exact_mut(4)) {
                c.copy_from_slice(&[
                    narrow8(px[0]),
                    narrow8(px[1]),
                    narrow8(px[2]),
                    narrow8(px[3]),
                ]);
            }
        }
        PixelFormat::Bgra8 => {
            for (px, c) in row.iter().zip(dst.chunks_exact_mut(4)) {
                c.copy_from_slice(&[
                    narrow8(px[2]),
                    narrow8(px[1]),
                    narrow8(px[0]),
                    narrow8(px[3]),
                ]);
            }
        }
        PixelFormat::Rgb10A2 => {
            for (px, c) in row.iter().zip(dst.chunks_exact_mut(4)) {
                let v = narrow10(px[0])
                    | narrow10(px[1]) << 10
                    | narrow10(px[2]) << 20
                    | narrow2(px[3]) << 30;
                c.copy_from_slice(&v.to_le_bytes());
            }
        }
        PixelFormat::Uyvy => {
            for (pair, c) in row.chunks_exact(2).zip(dst.chunks_exact_mut(4)) {
                let a = Ycc::from_rgb(&pair[0]);
                let b = Ycc::from_rgb(&pair[1]);
                let (cb, cr) = Ycc::mean_chroma(&a, &b);
                c.copy_from_slice(&[
                    yuv::chroma8(cb),
                    yuv::luma8(a.y),
                    yuv::chroma8(cr),
                    yuv::luma8(b.y),
                ]);
            }
        }
    }
}

/// Encode row `y` of a `width` x `height` wire frame into `dst`, which holds
/// the whole frame (all planes).
pub fn encode_wire_row(
    format: WireFormat,
    width: usize,
    height: usize,
    y: usize,
    row: &[Rgba16],
    dst: &mut [u8],
) {
    let row = &row[..width];
    match format {
        WireFormat::Uyvy | WireFormat::Uyva => {
            let line = &mut dst[y * width * 2..(y + 1) * width * 2];
            for (pair, c) in row.chunks_exact(2).zip(line.chunks_exact_mut(4)) {
                let a = Ycc::from_rgb(&pair[0]);
                let b = Ycc::from_rgb(&pair[1]);
                let (cb, cr) = Ycc::mean_chroma(&a, &b);
                c.copy_from_slice(&[
                    yuv::chroma8(cb),
                    yuv::luma8(a.y),
                    yuv::chroma8(cr),
                    yuv::luma8(b.y),
                ]);
            }
            if format == WireFormat::Uyva {
                let base = width * height * 2 + y * width;
                for (px, a) in row.iter().zip(dst[base..base + width].iter_mut()) {
                    *a = narrow8(px[3]);
                }
            }
        }
        WireFormat::Bgra | WireFormat::Bgrx => {
            let keep_alpha = format == WireFormat::Bgra;
            let line = &mut dst[y * width * 4..(y + 1) * width * 4];
            for (px, c) in row.iter().zip(line.chunks_exact_mut(4)) {
                let a = if keep_alpha { narrow8(px[3]) } else { 255 };
                c.copy_from_slice(&[narrow8(px[2]), narrow8(px[1]), narrow8(px[0]), a]);
            }
        }
        WireFormat::Rgba | WireFormat::Rgbx => {
            let keep_alpha = format == WireFormat::Rgba;
            let line = &mut dst[y * width * 4..(y + 1) * width * 4];
            for (px, c) in row.iter().zip(line.chunks_exact_mut(4)) {
                let a = if keep_alpha { narrow8(px[3]) } else { 255 };
                c.copy_from_slice(&[narrow8(px[0]), narrow8(px[1]), narrow8(px[2]), a]);
            }
        }
        WireFormat::P216 | WireFormat::Pa16 => {
            let plane = width * height * 2;
            let y_base = y * width * 2;
            let c_base = plane + y * width * 2;
            for (i, pair) in row.chunks_exact(2).enumerate() {
                let a = Ycc::from_rgb(&pair[0]);
                let b = Ycc::from_rgb(&pair[1]);
                let (cb, cr) = Ycc::mean_chroma(&a, &b);
                write_u16(dst, y_base + i * 4, yuv::luma16(a.y));
                write_u16(dst, y_base + i * 4 + 2, yuv::luma16(b.y));
                write_u16(dst, c_base + i * 4, yuv::chroma16(cb));
                write_u16(dst, c_base + i * 4 + 2, yuv::chroma16(cr));
            }
            if format == WireFormat::Pa16 {
                let a_base = plane * 2 + y * width * 2;
                for (x, px) in row.iter().enumerate() {
                    write_u16(dst, a_base + x * 2, px[3]);
                }
            }
        }
    }
}

/// Decode row `y` of a wire frame. Formats without alpha decode as opaque.
pub fn decode_wire_row(
    format: WireFormat,
    width: usize,
    height: usize,
    y: usize,
    src: &[u8],
    out: &mut [Rgba16],
) {
    let out = &mut out[..width];
    match format {
        WireFormat::Uyvy | WireFormat::Uyva => {
            let line = &src[y * width * 2..(y + 1) * width * 2];
            for (pair, c) in out.chunks_exact_mut(2).zip(line.chunks_exact(4)) {
                pair[0] = yuv::decode8(c[1], c[0], c[2]);
                pair[1] = yuv::decode8(c[3], c[0], c[2]);
            }
            if format == WireFormat::Uyva {
                let base = width * height * 2 + y * width;
                for (px, a) in out.iter_mut().zip(src[base..base + width].iter()) {
                    px[3] = widen8(*a);
                }
            }
        }
        WireFormat::Bgra | WireFormat::Bgrx => {
            let keep_alpha = format == WireFormat::Bgra;
            let line = &src[y * width * 4..(y + 1) * width * 4];
            for (px, c) in out.iter_mut().zip(line.chunks_exact(4)) {
                let a = if keep_alpha { widen8(c[3]) } else { OPAQUE };
                *px = [widen8(c[2]), widen8(c[1]), widen8(c[0]), a];
            }
        }
        WireFormat::Rgba | WireFormat::Rgbx => {
            let keep_alpha = format == WireFormat::Rgba;
            let line = &src[y * width * 4..(y + 1) * width * 4];
            for (px, c) in out.iter_mut().zip(line.chunks_exact(4)) {
                let a = if keep_alpha { widen8(c[3]) } else { OPAQUE };
                *px = [widen8(c[0]), widen8(c[1]), widen8(c[2]), a];
            }
        }
        WireFormat::P216 | WireFormat::Pa16 => {
            let plane = width * height * 2;
            let y_base = y * width * 2;
            let c_base = plane + y * width * 2;
            for (i, pair) in out.chunks_exact_mut(2).enumerate() {
                let cb = read_u16(src, c_base + i * 4);
                let cr = read_u16(src, c_base + i * 4 + 2);
                pair[0] = yuv::decode16(read_u16(src, y_base + i * 4), cb, cr);
                pair[1] = yuv::decode16(read_u16(src, y_base + i * 4 + 2), cb, cr);
            }
            if format == WireFormat::Pa16 {
                let a_base = plane * 2 + y * width * 2;
                for (x, px) in out.iter_mut().enumerate() {
                    px[3] = read_u16(src, a_base + x * 2);
                }
            }
        }
    }
}
