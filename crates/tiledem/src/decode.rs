//! Pixel to height decoding.
//!
//! All supported encodings pack a height in centimeters into the 24 bits of
//! the RGB channels (`R * 65536 + G * 256 + B`). They differ in sign handling
//! and in how "no data" is marked:
//!
//! | Format | Sign | NODATA |
//! |---|---|---|
//! | `GSI_RGB_24BIT` | two's complement around `2^23` | `x == 2^23` |
//! | `QMAP_RGB_SCALED` | unsigned | `(R, G, B) == (128, 0, 0)` |
//! | `ALPHA_MASKED_RGB` | unsigned | `A == 0` |

use crate::heights::{HeightBuffer, NODATA};
use crate::source::DecodeFormat;
use crate::{DemError, Result};

/// Height unit of the 24-bit encodings, in meters.
pub const HEIGHT_UNIT_M: f64 = 0.01;

const SIGNED_MIDPOINT: u32 = 1 << 23;
const FULL_RANGE: i64 = 1 << 24;

/// A decoded raster image, row-major, interleaved channels.
#[derive(Debug, Clone)]
pub struct PixelGrid {
    width: usize,
    height: usize,
    channels: usize,
    data: Vec<u8>,
}

impl PixelGrid {
    /// Wrap interleaved pixel bytes.
    pub fn new(width: usize, height: usize, channels: usize, data: Vec<u8>) -> Result<Self> {
        if data.len() != width * height * channels {
            return Err(DemError::Undecodable(format!(
                "{} bytes for {}x{}x{} pixels",
                data.len(),
                width,
                height,
                channels
            )));
        }
        Ok(Self {
            width,
            height,
            channels,
            data,
        })
    }

    /// Width in pixels.
    pub fn width(&self) -> usize {
        self.width
    }

    /// Height in pixels.
    pub fn height(&self) -> usize {
        self.height
    }

    /// Channels per pixel.
    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Iterate `(r, g, b, a)` per pixel; alpha is 255 without an alpha channel.
    fn rgba(&self) -> impl Iterator<Item = (u8, u8, u8, u8)> + '_ {
        let with_alpha = self.channels >= 4;
        self.data.chunks_exact(self.channels).map(move |px| {
            let a = if with_alpha { px[3] } else { u8::MAX };
            (px[0], px[1], px[2], a)
        })
    }

    /// Fraction of pixels a provider uses to say "nothing here": fully
    /// transparent pixels and the format's sentinel colour.
    pub fn sentinel_ratio(&self, format: DecodeFormat) -> f64 {
        let total = self.width * self.height;
        if total == 0 || self.channels < 3 {
            return 1.0;
        }
        let sentinel = self
            .rgba()
            .filter(|&(r, g, b, a)| a == 0 || decode_pixel(format, r, g, b, a).is_none())
            .count();
        sentinel as f64 / total as f64
    }
}

/// Pack three colour channels into a 24-bit integer.
#[inline]
pub fn pack_rgb(r: u8, g: u8, b: u8) -> u32 {
    (u32::from(r) << 16) | (u32::from(g) << 8) | u32::from(b)
}

/// Decode a single pixel; `None` means NODATA.
#[inline]
pub fn decode_pixel(format: DecodeFormat, r: u8, g: u8, b: u8, a: u8) -> Option<f32> {
    let x = pack_rgb(r, g, b);
    match format {
        DecodeFormat::GsiRgb24bit => match x.cmp(&SIGNED_MIDPOINT) {
            std::cmp::Ordering::Less => Some((f64::from(x) * HEIGHT_UNIT_M) as f32),
            std::cmp::Ordering::Equal => None,
            std::cmp::Ordering::Greater => Some(((i64::from(x) - FULL_RANGE) as f64 * HEIGHT_UNIT_M) as f32),
        },
        DecodeFormat::QmapRgbScaled => {
            if (r, g, b) == (128, 0, 0) {
                None
            } else {
                Some((f64::from(x) * HEIGHT_UNIT_M) as f32)
            }
        }
        DecodeFormat::AlphaMaskedRgb => {
            if a == 0 {
                None
            } else {
                Some((f64::from(x) * HEIGHT_UNIT_M) as f32)
            }
        }
    }
}

/// Encode a height into `GSI_RGB_24BIT` channels; `None` encodes NODATA.
///
/// Heights are rounded to the nearest centimeter and must satisfy
/// `|h| < 83886.08`.
pub fn encode_gsi(height: Option<f64>) -> [u8; 3] {
    let x = match height {
        None => SIGNED_MIDPOINT,
        Some(h) => {
            let cm = (h / HEIGHT_UNIT_M).round() as i64;
            cm.rem_euclid(FULL_RANGE) as u32
        }
    };
    [(x >> 16) as u8, (x >> 8) as u8, x as u8]
}

/// Decode a full pixel grid into heights.
///
/// The grid must be `side x side` with at least three colour channels.
pub fn decode_heights(format: DecodeFormat, pixels: &PixelGrid, side: usize) -> Result<HeightBuffer> {
    if pixels.channels < 3 {
        return Err(DemError::Undecodable(format!(
            "{} channel image, need at least RGB",
            pixels.channels
        )));
    }
    if pixels.width != side || pixels.height != side {
        return Err(DemError::Undecodable(format!(
            "{}x{} image, expected {}x{}",
            pixels.width, pixels.height, side, side
        )));
    }

    let data = pixels
        .rgba()
        .map(|(r, g, b, a)| decode_pixel(format, r, g, b, a).unwrap_or(NODATA))
        .collect();
    HeightBuffer::from_vec(side, data).ok_or_else(|| DemError::Undecodable("pixel count mismatch".to_string()))
}

/// Decode an encoded image payload (PNG, WebP) into a [`PixelGrid`].
///
/// Grey-scale payloads are rejected rather than expanded, since their
/// channels cannot carry a 24-bit height.
pub fn decode_image(bytes: &[u8]) -> Result<PixelGrid> {
    let img = image::load_from_memory(bytes).map_err(|e| DemError::Undecodable(e.to_string()))?;
    let channels = usize::from(img.color().channel_count());
    if channels < 3 {
        return Err(DemError::Undecodable(format!(
            "{:?} image, need at least RGB",
            img.color()
        )));
    }
    let rgba = img.to_rgba8();
    let (width, height) = rgba.dimensions();
    PixelGrid::new(width as usize, height as usize, 4, rgba.into_raw())
}
