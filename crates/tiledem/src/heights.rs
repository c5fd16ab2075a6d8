//! Square grids of decoded height samples.

/// In-memory "no data" sentinel. Any NaN sample is treated as missing.
pub const NODATA: f32 = f32::NAN;

/// Default tile side length in pixels.
pub const DEFAULT_TILE_SIDE: usize = 256;

/// Check whether a sample carries a measurement.
#[inline]
pub fn is_valid(v: f32) -> bool {
    !v.is_nan()
}

/// A `side x side` grid of heights in meters, row-major, north row first.
///
/// Missing samples hold [`NODATA`].
#[derive(Debug, Clone, PartialEq)]
pub struct HeightBuffer {
    side: usize,
    data: Vec<f32>,
}

impl HeightBuffer {
    /// A buffer with every sample missing.
    pub fn empty(side: usize) -> Self {
        Self::filled(side, NODATA)
    }

    /// A buffer with every sample set to `value`.
    pub fn filled(side: usize, value: f32) -> Self {
        Self {
            side,
            data: vec![value; side * side],
        }
    }

    /// Wrap existing samples. Returns `None` unless `data.len() == side * side`.
    pub fn from_vec(side: usize, data: Vec<f32>) -> Option<Self> {
        (data.len() == side * side).then_some(Self { side, data })
    }

    /// Side length in samples.
    pub fn side(&self) -> usize {
        self.side
    }

    /// Samples in row-major order.
    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    /// Mutable samples in row-major order.
    pub fn as_mut_slice(&mut self) -> &mut [f32] {
        &mut self.data
    }

    /// Consume into the raw sample vector.
    pub fn into_vec(self) -> Vec<f32> {
        self.data
    }

    /// Sample at column `col`, row `row`.
    #[inline]
    pub fn get(&self, col: usize, row: usize) -> f32 {
        self.data[row * self.side + col]
    }

    /// Set the sample at column `col`, row `row`.
    #[inline]
    pub fn set(&mut self, col: usize, row: usize, value: f32) {
        self.data[row * self.side + col] = value;
    }

    /// Number of valid samples.
    pub fn valid_count(&self) -> usize {
        self.data.iter().filter(|v| is_valid(**v)).count()
    }

    /// Number of missing samples.
    pub fn hole_count(&self) -> usize {
        self.data.len() - self.valid_count()
    }

    /// Fraction of samples that are valid, in `[0, 1]`.
    pub fn valid_fraction(&self) -> f64 {
        if self.data.is_empty() {
            return 0.0;
        }
        self.valid_count() as f64 / self.data.len() as f64
    }

    /// True if at least one sample is missing.
    pub fn has_holes(&self) -> bool {
        self.data.iter().any(|v| !is_valid(*v))
    }

    /// True if every sample is missing.
    pub fn is_all_nodata(&self) -> bool {
        self.data.iter().all(|v| !is_valid(*v))
    }

    /// Copy valid samples from `other` into cells that are missing here.
    ///
    /// Cells that already hold a value are never overwritten. Returns the
    /// number of cells filled.
    pub fn fill_holes_from(&mut self, other: &HeightBuffer) -> usize {
        debug_assert_eq!(self.side, other.side);
        let mut filled = 0;
        for (dst, src) in self.data.iter_mut().zip(&other.data) {
            if !is_valid(*dst) && is_valid(*src) {
                *dst = *src;
                filled += 1;
            }
        }
        filled
    }

    /// Minimum and maximum valid sample, if any.
    pub fn min_max(&self) -> Option<(f32, f32)> {
        self.data
            .iter()
            .copied()
            .filter(|v| is_valid(*v))
            .fold(None, |acc, v| match acc {
                None => Some((v, v)),
                Some((lo, hi)) => Some((lo.min(v), hi.max(v))),
            })
    }

    /// Samples with missing cells replaced by `nodata`, for writing out.
    pub fn to_filled_vec(&self, nodata: f32) -> Vec<f32> {
        self.data
            .iter()
            .map(|v| if is_valid(*v) { *v } else { nodata })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fill_holes_never_overwrites() {
        let mut base = HeightBuffer::filled(2, 10.0);
        base.set(1, 1, NODATA);
        let other = HeightBuffer::filled(2, 99.0);

        let filled = base.fill_holes_from(&other);
        assert_eq!(filled, 1);
        assert_eq!(base.as_slice(), &[10.0, 10.0, 10.0, 99.0]);
    }

    #[test]
    fn test_fill_skips_missing_source_cells() {
        let mut base = HeightBuffer::empty(2);
        let mut other = HeightBuffer::filled(2, 5.0);
        other.set(0, 0, NODATA);

        assert_eq!(base.fill_holes_from(&other), 3);
        assert!(base.has_holes());
        assert_eq!(base.hole_count(), 1);
    }

    #[test]
    fn test_counts() {
        let mut buf = HeightBuffer::empty(4);
        assert!(buf.is_all_nodata());
        assert_eq!(buf.valid_fraction(), 0.0);
        buf.set(0, 0, 1.0);
        buf.set(3, 3, -4.0);
        assert_eq!(buf.valid_count(), 2);
        assert_eq!(buf.min_max(), Some((-4.0, 1.0)));
        assert!(!buf.is_all_nodata());
    }

    #[test]
    fn test_from_vec_checks_len() {
        assert!(HeightBuffer::from_vec(2, vec![0.0; 4]).is_some());
        assert!(HeightBuffer::from_vec(2, vec![0.0; 3]).is_none());
    }

    #[test]
    fn test_to_filled_vec() {
        let mut buf = HeightBuffer::filled(2, 1.5);
        buf.set(0, 1, NODATA);
        assert_eq!(buf.to_filled_vec(-9999.0), vec![1.5, 1.5, -9999.0, 1.5]);
    }
}
