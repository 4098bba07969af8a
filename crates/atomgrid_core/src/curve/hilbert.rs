//! Hilbert-curve encoder over quantized `B`-dimensional coordinates.
//!
//! # Responsibility
//! - Quantize bounded coordinates to `precision_bits` per axis.
//! - Map quantized cells to a sortable `u64` key and back.
//! - Decompose a query box into the key intervals that cover it.
//!
//! # Invariants
//! - `dims * precision_bits <= 64`, `1 <= dims <= MAX_CURVE_DIMS`.
//! - Consecutive keys decode to cells one step apart on one axis.
//! - Every aligned sub-cube of side `2^k` maps to one contiguous key interval,
//!   which is what makes interval decomposition exact.
//! - Out-of-range values clamp to the edge cell; NaN is rejected.

use crate::model::validation::ValidationError;
use log::warn;
use std::error::Error;
use std::fmt::{Display, Formatter};

/// Upper bound on curve dimensionality; each subdivision visits `2^dims` children.
pub const MAX_CURVE_DIMS: usize = 8;

#[derive(Debug, Clone, PartialEq)]
pub enum CurveError {
    InvalidDims(usize),
    InvalidPrecision { dims: usize, bits: u32 },
    InvalidBounds { axis: usize, min: f32, max: f32 },
}

impl Display for CurveError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidDims(dims) => write!(
                f,
                "curve dimensionality must be in 1..={MAX_CURVE_DIMS}, got {dims}"
            ),
            Self::InvalidPrecision { dims, bits } => write!(
                f,
                "precision of {bits} bits over {dims} axes does not fit a 64-bit key"
            ),
            Self::InvalidBounds { axis, min, max } => {
                write!(f, "axis {axis} bounds [{min}, {max}] are empty or non-finite")
            }
        }
    }
}

impl Error for CurveError {}

/// Key plus the out-of-range flag of its coordinate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncodedKey {
    pub key: u64,
    /// At least one axis was clamped into the bounding range.
    pub clamped: bool,
}

/// Sorted, non-overlapping inclusive key intervals covering a query box.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyRanges {
    pub ranges: Vec<(u64, u64)>,
    /// Share of the whole key space covered, in `[0, 1]`.
    pub coverage: f64,
}

impl KeyRanges {
    pub fn contains(&self, key: u64) -> bool {
        self.ranges
            .binary_search_by(|(start, end)| {
                if *end < key {
                    std::cmp::Ordering::Less
                } else if *start > key {
                    std::cmp::Ordering::Greater
                } else {
                    std::cmp::Ordering::Equal
                }
            })
            .is_ok()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HilbertEncoder {
    dims: usize,
    bits: u32,
    min: Vec<f32>,
    max: Vec<f32>,
}

impl HilbertEncoder {
    /// Encoder with the same `[min, max]` range on every axis.
    pub fn new(dims: usize, bits: u32, min: f32, max: f32) -> Result<Self, CurveError> {
        Self::with_bounds(bits, vec![(min, max); dims])
    }

    /// Encoder with per-axis bounds.
    pub fn with_bounds(bits: u32, bounds: Vec<(f32, f32)>) -> Result<Self, CurveError> {
        let dims = bounds.len();
        if dims == 0 || dims > MAX_CURVE_DIMS {
            return Err(CurveError::InvalidDims(dims));
        }
        if bits == 0 || bits > 32 || dims as u32 * bits > 64 {
            return Err(CurveError::InvalidPrecision { dims, bits });
        }
        for (axis, (min, max)) in bounds.iter().enumerate() {
            if !min.is_finite() || !max.is_finite() || min >= max {
                return Err(CurveError::InvalidBounds {
                    axis,
                    min: *min,
                    max: *max,
                });
            }
        }

        Ok(Self {
            dims,
            bits,
            min: bounds.iter().map(|(min, _)| *min).collect(),
            max: bounds.iter().map(|(_, max)| *max).collect(),
        })
    }

    pub fn dims(&self) -> usize {
        self.dims
    }

    pub fn precision_bits(&self) -> u32 {
        self.bits
    }

    /// Largest valid key.
    pub fn max_key(&self) -> u64 {
        let total = self.dims as u32 * self.bits;
        if total == 64 {
            u64::MAX
        } else {
            (1_u64 << total) - 1
        }
    }

    fn max_cell(&self) -> u32 {
        if self.bits == 32 {
            u32::MAX
        } else {
            (1_u32 << self.bits) - 1
        }
    }

    /// Quantizes `coordinate` to grid cells.
    ///
    /// Returns the cells and whether any axis was clamped.
    pub fn quantize(&self, coordinate: &[f32]) -> Result<(Vec<u32>, bool), ValidationError> {
        if coordinate.len() != self.dims {
            return Err(ValidationError::DimensionMismatch {
                expected: self.dims,
                actual: coordinate.len(),
            });
        }
        let mut clamped = false;
        let mut cells = Vec::with_capacity(self.dims);
        for (axis, value) in coordinate.iter().enumerate() {
            if value.is_nan() {
                return Err(ValidationError::NonFiniteValue);
            }
            if *value < self.min[axis] || *value > self.max[axis] {
                clamped = true;
            }
            cells.push(self.quantize_axis(axis, *value));
        }
        Ok((cells, clamped))
    }

    fn quantize_axis(&self, axis: usize, value: f32) -> u32 {
        let (min, max) = (f64::from(self.min[axis]), f64::from(self.max[axis]));
        let scale = (1_u64 << self.bits) as f64;
        let position = ((f64::from(value) - min) / (max - min) * scale).floor();
        position.clamp(0.0, f64::from(self.max_cell())) as u32
    }

    /// Encodes a coordinate; out-of-range axes clamp with a warning.
    pub fn encode(&self, coordinate: &[f32]) -> Result<EncodedKey, ValidationError> {
        let (cells, clamped) = self.quantize(coordinate)?;
        if clamped {
            warn!(
                "event=coordinate_clamped module=curve status=warn dims={} bits={}",
                self.dims, self.bits
            );
        }
        Ok(EncodedKey {
            key: self.encode_cells(&cells),
            clamped,
        })
    }

    /// Hilbert index of already-quantized cells.
    pub fn encode_cells(&self, cells: &[u32]) -> u64 {
        let mut transpose = cells.to_vec();
        axes_to_transpose(&mut transpose, self.bits);
        interleave(&transpose, self.bits)
    }

    /// Cells addressed by `key`.
    pub fn decode_cells(&self, key: u64) -> Vec<u32> {
        let mut transpose = deinterleave(key, self.dims, self.bits);
        transpose_to_axes(&mut transpose, self.bits);
        transpose
    }

    /// Key intervals covering every cell that intersects the box
    /// `[center - radius, center + radius]`.
    ///
    /// Refinement stops at `max_ranges` (soft budget); remaining partially
    /// covered cells are emitted whole, so the result is a superset.
    pub fn key_ranges(
        &self,
        center: &[f32],
        radius: f32,
        max_ranges: usize,
    ) -> Result<KeyRanges, ValidationError> {
        if !radius.is_finite() || radius < 0.0 {
            return Err(ValidationError::InvalidRadius);
        }
        let low: Vec<f32> = center.iter().map(|value| value - radius).collect();
        let high: Vec<f32> = center.iter().map(|value| value + radius).collect();
        let (low_cells, _) = self.quantize(&low)?;
        let (high_cells, _) = self.quantize(&high)?;

        let mut ranges = Vec::new();
        self.collect_ranges(0, 0, &low_cells, &high_cells, max_ranges.max(1), &mut ranges);

        let total_bits = self.dims as u32 * self.bits;
        let covered: f64 = ranges
            .iter()
            .map(|(start, end)| (end - start) as f64 + 1.0)
            .sum();
        let coverage = (covered / 2_f64.powi(total_bits as i32)).min(1.0);
        Ok(KeyRanges { ranges, coverage })
    }

    fn collect_ranges(
        &self,
        prefix: u64,
        level: u32,
        low: &[u32],
        high: &[u32],
        max_ranges: usize,
        out: &mut Vec<(u64, u64)>,
    ) {
        let shift = self.bits - level;
        let span_bits = shift * self.dims as u32;
        let start = u128::from(prefix) << span_bits;
        let end = start + (1_u128 << span_bits) - 1;

        let origin_cells = self.decode_cells(start as u64);
        let mut contained = true;
        for axis in 0..self.dims {
            let origin = (u64::from(origin_cells[axis]) >> shift) << shift;
            let last = origin + (1_u64 << shift) - 1;
            if last < u64::from(low[axis]) || origin > u64::from(high[axis]) {
                return;
            }
            if origin < u64::from(low[axis]) || last > u64::from(high[axis]) {
                contained = false;
            }
        }

        let fanout = 1_usize << self.dims;
        if contained || level == self.bits || out.len() + fanout > max_ranges {
            push_merged(out, start as u64, end as u64);
            return;
        }
        for child in 0..fanout as u64 {
            self.collect_ranges(
                (prefix << self.dims) | child,
                level + 1,
                low,
                high,
                max_ranges,
                out,
            );
        }
    }
}

fn push_merged(out: &mut Vec<(u64, u64)>, start: u64, end: u64) {
    if let Some(last) = out.last_mut() {
        if last.1.checked_add(1) == Some(start) {
            last.1 = end;
            return;
        }
    }
    out.push((start, end));
}

/// Skilling's AxestoTranspose (in place).
fn axes_to_transpose(x: &mut [u32], bits: u32) {
    let n = x.len();
    let m: u64 = 1 << (bits - 1);

    let mut q = m;
    while q > 1 {
        let p = (q - 1) as u32;
        let mask = q as u32;
        for i in 0..n {
            if x[i] & mask != 0 {
                x[0] ^= p;
            } else {
                let t = (x[0] ^ x[i]) & p;
                x[0] ^= t;
                x[i] ^= t;
            }
        }
        q >>= 1;
    }

    for i in 1..n {
        x[i] ^= x[i - 1];
    }
    let mut t = 0_u32;
    let mut q = m;
    while q > 1 {
        if x[n - 1] & (q as u32) != 0 {
            t ^= (q - 1) as u32;
        }
        q >>= 1;
    }
    for value in x.iter_mut() {
        *value ^= t;
    }
}

/// Skilling's TransposetoAxes (in place).
fn transpose_to_axes(x: &mut [u32], bits: u32) {
    let n = x.len();
    let limit: u64 = 1 << bits;

    let t = x[n - 1] >> 1;
    for i in (1..n).rev() {
        x[i] ^= x[i - 1];
    }
    x[0] ^= t;

    let mut q: u64 = 2;
    while q != limit && q < limit {
        let p = (q - 1) as u32;
        let mask = q as u32;
        for i in (0..n).rev() {
            if x[i] & mask != 0 {
                x[0] ^= p;
            } else {
                let t = (x[0] ^ x[i]) & p;
                x[0] ^= t;
                x[i] ^= t;
            }
        }
        q <<= 1;
    }
}

fn interleave(transpose: &[u32], bits: u32) -> u64 {
    let mut key = 0_u64;
    for level in (0..bits).rev() {
        for value in transpose {
            key = (key << 1) | u64::from((value >> level) & 1);
        }
    }
    key
}

fn deinterleave(key: u64, dims: usize, bits: u32) -> Vec<u32> {
    let mut transpose = vec![0_u32; dims];
    let mut position = dims as u32 * bits;
    for level in (0..bits).rev() {
        for value in transpose.iter_mut() {
            position -= 1;
            let bit = ((key >> position) & 1) as u32;
            *value |= bit << level;
        }
    }
    transpose
}
