//! Zoom-level reconciliation between a source and the output tile grid.
//!
//! Heights are resized with a separable triangle (bilinear) filter. The
//! filter runs over `value * mask` and over `mask` independently and the
//! two results are divided afterwards, so missing samples never bleed into
//! their valid neighbours as a synthetic zero.
//!
//! The resampler never touches the network: tiles at the source zoom are
//! obtained through a caller-supplied fetch closure.

use crate::geo::TileIndex;
use crate::heights::{is_valid, HeightBuffer, NODATA};
use crate::{DemError, Result};
use std::cmp::Ordering;
use std::ops::Range;

/// Accumulated mask weight below which an output sample is NODATA.
pub const MASK_THRESHOLD: f32 = 0.01;

/// Filter taps for one output sample.
#[derive(Debug)]
struct Contribution {
    start: usize,
    weights: Vec<f32>,
}

/// Triangle filter weights mapping `src_len` samples onto `dst_len` samples,
/// for output positions in `range`.
///
/// Sample centers are aligned (`src = (dst + 0.5) * ratio - 0.5`). When
/// shrinking, the filter support widens with the ratio so every source
/// sample contributes.
fn contributions(src_len: usize, dst_len: usize, range: Range<usize>) -> Vec<Contribution> {
    let ratio = src_len as f64 / dst_len as f64;
    let support = ratio.max(1.0);

    range
        .map(|i| {
            let center = (i as f64 + 0.5) * ratio;
            let lo = ((center - support).floor().max(0.0)) as usize;
            let hi = ((center + support).ceil() as usize).min(src_len);

            let mut weights: Vec<f32> = (lo..hi)
                .map(|k| {
                    let d = ((k as f64 + 0.5 - center) / support).abs();
                    (1.0 - d).max(0.0) as f32
                })
                .collect();
            let sum: f32 = weights.iter().sum();
            if sum > 0.0 {
                weights.iter_mut().for_each(|w| *w /= sum);
            }
            Contribution { start: lo, weights }
        })
        .collect()
}

/// Resize a square grid to `dst_side`, computing only the window
/// `cols x rows` of the output. Returns the window row-major.
fn resize_window(src: &[f32], src_side: usize, dst_side: usize, cols: Range<usize>, rows: Range<usize>) -> Vec<f32> {
    let width = cols.len();
    let horizontal = contributions(src_side, dst_side, cols);
    let vertical = contributions(src_side, dst_side, rows);

    // Horizontal pass over every source row.
    let mut tmp = vec![0.0f32; src_side * width];
    for row in 0..src_side {
        let line = &src[row * src_side..(row + 1) * src_side];
        for (j, c) in horizontal.iter().enumerate() {
            tmp[row * width + j] = c
                .weights
                .iter()
                .enumerate()
                .map(|(k, w)| w * line[c.start + k])
                .sum();
        }
    }

    let mut out = vec![0.0f32; vertical.len() * width];
    for (i, c) in vertical.iter().enumerate() {
        let dst = &mut out[i * width..(i + 1) * width];
        for (k, w) in c.weights.iter().enumerate() {
            let line = &tmp[(c.start + k) * width..(c.start + k + 1) * width];
            for (d, s) in dst.iter_mut().zip(line) {
                *d += w * s;
            }
        }
    }
    out
}

/// Bilinear resize of a square grid. No NODATA handling.
pub fn resize_bilinear(src: &[f32], src_side: usize, dst_side: usize) -> Vec<f32> {
    resize_window(src, src_side, dst_side, 0..dst_side, 0..dst_side)
}

/// Split a height buffer into `(value * mask, mask)` channels.
fn split_mask(buf: &HeightBuffer) -> (Vec<f32>, Vec<f32>) {
    buf.as_slice()
        .iter()
        .map(|&v| if is_valid(v) { (v, 1.0) } else { (0.0, 0.0) })
        .unzip()
}

/// Mask-normalized resize of `buf` to `dst_side`, restricted to a window.
///
/// Returns the resized `(value * mask, mask)` channels of the window.
fn masked_resize_window(
    buf: &HeightBuffer,
    dst_side: usize,
    cols: Range<usize>,
    rows: Range<usize>,
) -> (Vec<f32>, Vec<f32>) {
    let (values, mask) = split_mask(buf);
    let side = buf.side();
    (
        resize_window(&values, side, dst_side, cols.clone(), rows.clone()),
        resize_window(&mask, side, dst_side, cols, rows),
    )
}

/// Divide accumulated values by accumulated mask weight.
fn normalize(side: usize, values: &[f32], mask: &[f32]) -> HeightBuffer {
    let data = values
        .iter()
        .zip(mask)
        .map(|(&v, &m)| if m > MASK_THRESHOLD { v / m } else { NODATA })
        .collect();
    // Lengths are produced by this module and always match.
    HeightBuffer::from_vec(side, data).unwrap_or_else(|| HeightBuffer::empty(side))
}

/// Mask-normalized resize of a whole buffer.
pub fn masked_resize(buf: &HeightBuffer, dst_side: usize) -> HeightBuffer {
    let (values, mask) = masked_resize_window(buf, dst_side, 0..dst_side, 0..dst_side);
    normalize(dst_side, &values, &mask)
}

/// Converts height tiles from a source zoom to the output tile grid.
#[derive(Debug, Clone, Copy)]
pub struct Resampler {
    side: usize,
}

impl Resampler {
    /// Resampler for tiles of `side x side` samples.
    pub fn new(side: usize) -> Self {
        Self { side }
    }

    /// Tile side length.
    pub fn side(&self) -> usize {
        self.side
    }

    /// Produce heights for `target` from a source published at `src_zoom`.
    ///
    /// `fetch` is called with tile indices at `src_zoom` and returns `None`
    /// for tiles the source cannot provide. Returns `Ok(None)` when the
    /// source contributes nothing to `target`.
    pub fn resample<F>(&self, src_zoom: u8, target: TileIndex, mut fetch: F) -> Result<Option<HeightBuffer>>
    where
        F: FnMut(TileIndex) -> Option<HeightBuffer>,
    {
        match src_zoom.cmp(&target.z) {
            Ordering::Equal => match fetch(target) {
                Some(buf) => self.check_side(buf).map(Some),
                None => Ok(None),
            },
            Ordering::Greater => self.downsample(src_zoom, target, fetch),
            Ordering::Less => {
                let ancestor = target.ancestor(src_zoom);
                match fetch(ancestor) {
                    Some(buf) => self.upsample(&self.check_side(buf)?, ancestor, target),
                    None => Ok(None),
                }
            }
        }
    }

    /// Enlarge `source` (the tile `ancestor`) and crop out `target`.
    pub fn upsample(&self, source: &HeightBuffer, ancestor: TileIndex, target: TileIndex) -> Result<Option<HeightBuffer>> {
        let shift = target.z.checked_sub(ancestor.z).filter(|s| *s > 0).ok_or_else(|| DemError::IndexMismatch {
            z: target.z,
            x: target.x,
            y: target.y,
            src_zoom: ancestor.z,
            reason: "upsampling needs a coarser source".to_string(),
        })?;
        let scale = 1i64 << shift;

        let ox = i64::from(target.x) - (i64::from(ancestor.x) << shift);
        let oy = i64::from(target.y) - (i64::from(ancestor.y) << shift);
        if !(0..scale).contains(&ox) || !(0..scale).contains(&oy) {
            return Err(DemError::IndexMismatch {
                z: target.z,
                x: target.x,
                y: target.y,
                src_zoom: ancestor.z,
                reason: format!("crop offset ({}, {}) outside [0, {})", ox, oy, scale),
            });
        }

        let side = self.side;
        let big = side << shift;
        let (ox, oy) = (ox as usize * side, oy as usize * side);
        let (values, mask) = masked_resize_window(source, big, ox..ox + side, oy..oy + side);
        let out = normalize(side, &values, &mask);
        Ok((!out.is_all_nodata()).then_some(out))
    }

    /// Composite the `scale x scale` finer tiles under `target`.
    fn downsample<F>(&self, src_zoom: u8, target: TileIndex, mut fetch: F) -> Result<Option<HeightBuffer>>
    where
        F: FnMut(TileIndex) -> Option<HeightBuffer>,
    {
        let shift = src_zoom - target.z;
        let scale = 1usize << shift;
        let side = self.side;
        if scale > side || side % scale != 0 {
            return Err(DemError::IndexMismatch {
                z: target.z,
                x: target.x,
                y: target.y,
                src_zoom,
                reason: format!("cannot fit {}x{} child tiles into {} samples", scale, scale, side),
            });
        }
        let footprint = side / scale;

        let mut values = vec![0.0f32; side * side];
        let mut mask = vec![0.0f32; side * side];
        let mut any = false;

        for child in target.children(src_zoom) {
            let Some(buf) = fetch(child) else {
                continue;
            };
            let buf = self.check_side(buf)?;
            let (cv, cm) = masked_resize_window(&buf, footprint, 0..footprint, 0..footprint);

            let col0 = (child.x - (target.x << shift)) as usize * footprint;
            let row0 = (child.y - (target.y << shift)) as usize * footprint;
            for r in 0..footprint {
                let dst = (row0 + r) * side + col0;
                let src = r * footprint;
                for c in 0..footprint {
                    values[dst + c] += cv[src + c];
                    mask[dst + c] += cm[src + c];
                }
            }
            any = true;
        }

        if !any {
            return Ok(None);
        }
        let out = normalize(side, &values, &mask);
        Ok((!out.is_all_nodata()).then_some(out))
    }

    fn check_side(&self, buf: HeightBuffer) -> Result<HeightBuffer> {
        if buf.side() != self.side {
            return Err(DemError::Undecodable(format!(
                "source tile is {} samples wide, expected {}",
                buf.side(),
                self.side
            )));
        }
        Ok(buf)
    }
}
