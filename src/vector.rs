//! Process-local segments of system-wide arrays.
//!
//! A [`Vector`] is one rank's contiguous slice of a logically concatenated
//! array. Variables are laid out inside the slice by a shared [`Layout`]; the
//! slice itself sits at [`Segment::offset`] inside the rank-major global array
//! that transfer plans index into.
//!
//! # Complex step
//!
//! Real data always lives in a plain `Vec<f64>`. The imaginary part used by
//! complex-step differentiation is a separate shadow array of the same length,
//! represented by [`Storage::RealPlusImaginaryShadow`]. The shadow is allocated
//! the first time complex step is activated and kept afterwards, so repeated
//! approximations do not reallocate.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use tessera::vector::{Layout, Vector, VectorKind};
//!
//! let mut layout = Layout::new();
//! layout.push("x", &[2]);
//! layout.push("y", &[1]);
//!
//! let mut vec = Vector::new(VectorKind::Output, Arc::new(layout));
//! vec.set("x", &[1.0, 2.0]).unwrap();
//! vec.set("y", &[3.0]).unwrap();
//!
//! assert_eq!(vec.as_slice(), &[1.0, 2.0, 3.0]);
//! assert_eq!(vec.get("x").unwrap(), &[1.0, 2.0]);
//! ```

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::hash::Hasher;
use std::ops::Range;
use std::sync::Arc;

use num_complex::Complex64;
use rustc_hash::FxHasher;

/// Errors raised when reading or writing vectors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum VectorError {
    /// The variable does not exist in the vector's layout.
    #[error("variable '{0}' is not part of this vector")]
    UnknownVariable(String),
    /// A write was attempted while the vector is flagged read-only.
    #[error("attempt to set value of '{name}' in a read-only {kind} vector")]
    ReadOnly { name: String, kind: VectorKind },
    /// Wrong number of values for a variable.
    #[error("size mismatch for '{name}': expected {expected} values but got {found}")]
    SizeMismatch { name: String, expected: usize, found: usize },
    /// Whole-vector operation on vectors of different lengths.
    #[error("vector length mismatch: expected {expected} but got {found}")]
    LengthMismatch { expected: usize, found: usize },
    /// Complex values written while complex step is not active.
    #[error("complex step is not active on this {0} vector")]
    ComplexStepInactive(VectorKind),
}

/// Role of a vector in the system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VectorKind {
    /// Input variables (or their derivative seeds).
    Input,
    /// Output variables (or their derivative seeds).
    Output,
    /// Residuals of the outputs.
    Residual,
}

impl fmt::Display for VectorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VectorKind::Input => write!(f, "input"),
            VectorKind::Output => write!(f, "output"),
            VectorKind::Residual => write!(f, "residual"),
        }
    }
}

/// Value of a discrete (non-differentiable) variable.
#[derive(Debug, Clone, PartialEq)]
pub enum DiscreteValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

/// Discrete variables keyed by name.
pub type DiscreteVars = BTreeMap<String, DiscreteValue>;

/// Placement of variables inside a local array segment.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Layout {
    names: Vec<String>,
    ranges: Vec<Range<usize>>,
    shapes: Vec<Vec<usize>>,
    index: HashMap<String, usize>,
    len: usize,
}

impl Layout {
    /// Creates an empty layout.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a variable with the given shape. Returns its range.
    pub fn push(&mut self, name: &str, shape: &[usize]) -> Range<usize> {
        let size: usize = shape.iter().product();
        let range = self.len..self.len + size;
        self.index.insert(name.to_string(), self.names.len());
        self.names.push(name.to_string());
        self.ranges.push(range.clone());
        self.shapes.push(shape.to_vec());
        self.len += size;
        range
    }

    /// Builds a layout of flat variables from `(name, size)` pairs.
    pub fn from_sizes<'a>(vars: impl IntoIterator<Item = (&'a str, usize)>) -> Self {
        let mut layout = Self::new();
        for (name, size) in vars {
            layout.push(name, &[size]);
        }
        layout
    }

    /// Range of a variable inside the segment.
    pub fn range(&self, name: &str) -> Option<Range<usize>> {
        self.index.get(name).map(|&i| self.ranges[i].clone())
    }

    /// Shape of a variable.
    pub fn shape(&self, name: &str) -> Option<&[usize]> {
        self.index.get(name).map(|&i| self.shapes[i].as_slice())
    }

    /// Returns true if the variable is part of the layout.
    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Variable names in layout order.
    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Iterates over `(name, range)` in layout order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, Range<usize>)> + '_ {
        self.names.iter().zip(&self.ranges).map(|(n, r)| (n.as_str(), r.clone()))
    }

    /// Total number of entries.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if the layout holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Position of a local segment in the rank-major global array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Segment {
    /// Global offset of the first local entry.
    pub offset: usize,
    /// Length of the global array across all ranks.
    pub global_len: usize,
}

impl Segment {
    /// Returns true if the global index falls inside a local segment of `len` entries.
    pub fn owns(&self, global: usize, len: usize) -> bool {
        global >= self.offset && global < self.offset + len
    }
}

/// Storage variant of a vector.
#[derive(Debug, Clone, PartialEq)]
pub enum Storage {
    /// Real data only.
    RealOnly,
    /// Real data plus an imaginary shadow of identical length.
    RealPlusImaginaryShadow { imag: Vec<f64> },
}

/// Affine map from scaled to physical values: `physical = scaled * scaler + adder`.
#[derive(Debug, Clone, PartialEq)]
pub struct Scaling {
    pub scaler: Vec<f64>,
    pub adder: Vec<f64>,
}

impl Scaling {
    /// Identity scaling of the given length.
    pub fn identity(len: usize) -> Self {
        Scaling { scaler: vec![1.0; len], adder: vec![0.0; len] }
    }

    /// Returns true if the map leaves every value unchanged.
    pub fn is_identity(&self) -> bool {
        self.scaler.iter().all(|&s| s == 1.0) && self.adder.iter().all(|&a| a == 0.0)
    }
}

/// One rank's segment of a system-wide array.
#[derive(Debug, Clone, PartialEq)]
pub struct Vector {
    kind: VectorKind,
    layout: Arc<Layout>,
    data: Vec<f64>,
    storage: Storage,
    under_complex_step: bool,
    read_only: bool,
    scaling: Option<Scaling>,
    scaled: bool,
    segment: Segment,
}

impl Vector {
    /// Creates a zero-filled vector over `layout`, in the physical (unscaled) state.
    pub fn new(kind: VectorKind, layout: Arc<Layout>) -> Self {
        let len = layout.len();
        Vector {
            kind,
            layout,
            data: vec![0.0; len],
            storage: Storage::RealOnly,
            under_complex_step: false,
            read_only: false,
            scaling: None,
            scaled: false,
            segment: Segment { offset: 0, global_len: len },
        }
    }

    /// Places the vector in a global array.
    pub fn with_segment(mut self, segment: Segment) -> Self {
        self.segment = segment;
        self
    }

    /// Attaches a scaling map. Identity maps are dropped.
    pub fn with_scaling(mut self, scaling: Scaling) -> Self {
        self.scaling = if scaling.is_identity() { None } else { Some(scaling) };
        self
    }

    pub fn kind(&self) -> VectorKind {
        self.kind
    }

    pub fn layout(&self) -> &Arc<Layout> {
        &self.layout
    }

    pub fn segment(&self) -> Segment {
        self.segment
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Returns true if the variable is part of this vector.
    pub fn contains(&self, name: &str) -> bool {
        self.layout.contains(name)
    }

    fn range(&self, name: &str) -> Result<Range<usize>, VectorError> {
        self.layout.range(name).ok_or_else(|| VectorError::UnknownVariable(name.to_string()))
    }

    /// Values of one variable.
    pub fn get(&self, name: &str) -> Result<&[f64], VectorError> {
        let range = self.range(name)?;
        Ok(&self.data[range])
    }

    /// Mutable values of one variable. Fails on read-only vectors.
    pub fn get_mut(&mut self, name: &str) -> Result<&mut [f64], VectorError> {
        let range = self.range(name)?;
        if self.read_only {
            return Err(VectorError::ReadOnly { name: name.to_string(), kind: self.kind });
        }
        Ok(&mut self.data[range])
    }

    /// Sets one variable. A single value is broadcast over the variable.
    pub fn set(&mut self, name: &str, values: &[f64]) -> Result<(), VectorError> {
        let target = self.get_mut(name)?;
        match values.len() {
            1 => target.fill(values[0]),
            n if n == target.len() => target.copy_from_slice(values),
            n => {
                return Err(VectorError::SizeMismatch {
                    name: name.to_string(),
                    expected: target.len(),
                    found: n,
                })
            }
        }
        Ok(())
    }

    /// Adds into one variable.
    pub fn add(&mut self, name: &str, values: &[f64]) -> Result<(), VectorError> {
        let target = self.get_mut(name)?;
        if values.len() != target.len() {
            return Err(VectorError::SizeMismatch {
                name: name.to_string(),
                expected: target.len(),
                found: values.len(),
            });
        }
        target.iter_mut().zip(values).for_each(|(t, v)| *t += v);
        Ok(())
    }

    /// Real data of the whole segment.
    pub fn as_slice(&self) -> &[f64] {
        &self.data
    }

    /// Mutable real data of the whole segment.
    ///
    /// Framework access: the read-only flag only guards the named mutators
    /// handed to user code.
    pub fn as_mut_slice(&mut self) -> &mut [f64] {
        &mut self.data
    }

    /// Overwrites the whole segment.
    pub fn set_val(&mut self, values: &[f64]) -> Result<(), VectorError> {
        if values.len() != self.data.len() {
            return Err(VectorError::LengthMismatch { expected: self.data.len(), found: values.len() });
        }
        self.data.copy_from_slice(values);
        Ok(())
    }

    /// Copies real (and, under complex step, imaginary) data from another vector.
    pub fn set_vec(&mut self, other: &Vector) -> Result<(), VectorError> {
        self.set_val(&other.data)?;
        if self.under_complex_step {
            let src = other.imag().map(<[f64]>::to_vec).unwrap_or_else(|| vec![0.0; other.len()]);
            if let Some(imag) = self.imag_mut() {
                imag.copy_from_slice(&src);
            }
        }
        Ok(())
    }

    /// Fills the segment with a constant (and clears the shadow).
    pub fn fill(&mut self, value: f64) {
        self.data.fill(value);
        if let Some(imag) = self.imag_mut() {
            imag.fill(0.0);
        }
    }

    /// Multiplies real and imaginary parts by a constant.
    pub fn scale_by(&mut self, factor: f64) {
        self.data.iter_mut().for_each(|v| *v *= factor);
        if let Some(imag) = self.imag_mut() {
            imag.iter_mut().for_each(|v| *v *= factor);
        }
    }

    /// `self += other`, including the shadow when both carry one.
    pub fn add_vec(&mut self, other: &Vector) -> Result<(), VectorError> {
        self.axpy(1.0, other)
    }

    /// `self -= other`, including the shadow when both carry one.
    pub fn sub_vec(&mut self, other: &Vector) -> Result<(), VectorError> {
        self.axpy(-1.0, other)
    }

    fn axpy(&mut self, alpha: f64, other: &Vector) -> Result<(), VectorError> {
        if other.len() != self.len() {
            return Err(VectorError::LengthMismatch { expected: self.len(), found: other.len() });
        }
        self.data.iter_mut().zip(&other.data).for_each(|(a, b)| *a += alpha * b);
        if let (Some(imag), Some(other_imag)) = (self.imag_mut(), other.imag()) {
            imag.iter_mut().zip(other_imag).for_each(|(a, b)| *a += alpha * b);
        }
        Ok(())
    }

    /// Adds a flat array into the real data.
    pub fn iadd(&mut self, values: &[f64]) -> Result<(), VectorError> {
        if values.len() != self.len() {
            return Err(VectorError::LengthMismatch { expected: self.len(), found: values.len() });
        }
        self.data.iter_mut().zip(values).for_each(|(a, b)| *a += b);
        Ok(())
    }

    /// Content hash of the segment (real data, plus the shadow under complex step).
    pub fn get_hash(&self) -> u64 {
        let mut hasher = FxHasher::default();
        hasher.write_usize(self.data.len());
        for v in &self.data {
            hasher.write_u64(v.to_bits());
        }
        if let Some(imag) = self.imag() {
            for v in imag {
                hasher.write_u64(v.to_bits());
            }
        }
        hasher.finish()
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn set_read_only(&mut self, read_only: bool) {
        self.read_only = read_only;
    }

    /// Allocates the imaginary shadow if it does not exist yet.
    pub fn alloc_complex(&mut self) {
        if matches!(self.storage, Storage::RealOnly) {
            self.storage = Storage::RealPlusImaginaryShadow { imag: vec![0.0; self.data.len()] };
        }
    }

    /// Returns true if an imaginary shadow has been allocated.
    pub fn has_shadow(&self) -> bool {
        matches!(self.storage, Storage::RealPlusImaginaryShadow { .. })
    }

    /// Activates or deactivates complex step. Activation allocates the shadow;
    /// deactivation clears it but keeps the allocation.
    pub fn set_complex_step(&mut self, active: bool) {
        if active {
            self.alloc_complex();
        } else if let Storage::RealPlusImaginaryShadow { imag } = &mut self.storage {
            imag.fill(0.0);
        }
        self.under_complex_step = active;
    }

    pub fn under_complex_step(&self) -> bool {
        self.under_complex_step
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    /// Imaginary data, only while complex step is active.
    pub fn imag(&self) -> Option<&[f64]> {
        match &self.storage {
            Storage::RealPlusImaginaryShadow { imag } if self.under_complex_step => Some(imag),
            _ => None,
        }
    }

    /// Mutable imaginary data, only while complex step is active.
    pub fn imag_mut(&mut self) -> Option<&mut [f64]> {
        match &mut self.storage {
            Storage::RealPlusImaginaryShadow { imag } if self.under_complex_step => Some(imag),
            _ => None,
        }
    }

    /// The shadow array regardless of the complex-step flag.
    pub(crate) fn shadow(&self) -> Option<&[f64]> {
        match &self.storage {
            Storage::RealPlusImaginaryShadow { imag } => Some(imag),
            Storage::RealOnly => None,
        }
    }

    /// Mutable shadow array regardless of the complex-step flag.
    pub(crate) fn shadow_mut(&mut self) -> Option<&mut Vec<f64>> {
        match &mut self.storage {
            Storage::RealPlusImaginaryShadow { imag } => Some(imag),
            Storage::RealOnly => None,
        }
    }

    /// Complex values of one variable. The imaginary part is zero outside complex step.
    pub fn get_complex(&self, name: &str) -> Result<Vec<Complex64>, VectorError> {
        let range = self.range(name)?;
        let imag = self.imag();
        Ok(range
            .map(|i| Complex64::new(self.data[i], imag.map_or(0.0, |im| im[i])))
            .collect())
    }

    /// Sets complex values of one variable. Requires active complex step.
    pub fn set_complex(&mut self, name: &str, values: &[Complex64]) -> Result<(), VectorError> {
        let range = self.range(name)?;
        if self.read_only {
            return Err(VectorError::ReadOnly { name: name.to_string(), kind: self.kind });
        }
        if range.len() != values.len() {
            return Err(VectorError::SizeMismatch {
                name: name.to_string(),
                expected: range.len(),
                found: values.len(),
            });
        }
        let kind = self.kind;
        let start = range.start;
        let imag = self.imag_mut().ok_or(VectorError::ComplexStepInactive(kind))?;
        for (i, v) in values.iter().enumerate() {
            imag[start + i] = v.im;
        }
        for (i, v) in values.iter().enumerate() {
            self.data[start + i] = v.re;
        }
        Ok(())
    }

    /// Whole segment as complex values.
    pub fn as_complex(&self) -> Vec<Complex64> {
        let imag = self.imag();
        self.data
            .iter()
            .enumerate()
            .map(|(i, &re)| Complex64::new(re, imag.map_or(0.0, |im| im[i])))
            .collect()
    }

    /// Returns true if the values are currently in the scaled state.
    pub fn is_scaled(&self) -> bool {
        self.scaled && self.scaling.is_some()
    }

    /// Converts scaled values to physical values.
    pub fn unscale(&mut self) {
        if !self.scaled {
            return;
        }
        self.scaled = false;
        if let Some(scaling) = &self.scaling {
            for ((v, s), a) in self.data.iter_mut().zip(&scaling.scaler).zip(&scaling.adder) {
                *v = *v * s + a;
            }
            if let Some(Storage::RealPlusImaginaryShadow { imag }) =
                self.under_complex_step.then_some(&mut self.storage)
            {
                imag.iter_mut().zip(&scaling.scaler).for_each(|(v, s)| *v *= s);
            }
        }
    }

    /// Converts physical values to scaled values.
    pub fn scale(&mut self) {
        if self.scaled {
            return;
        }
        self.scaled = true;
        if let Some(scaling) = &self.scaling {
            for ((v, s), a) in self.data.iter_mut().zip(&scaling.scaler).zip(&scaling.adder) {
                *v = (*v - a) / s;
            }
            if let Some(Storage::RealPlusImaginaryShadow { imag }) =
                self.under_complex_step.then_some(&mut self.storage)
            {
                imag.iter_mut().zip(&scaling.scaler).for_each(|(v, s)| *v /= s);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout() -> Arc<Layout> {
        Arc::new(Layout::from_sizes([("a", 2), ("b", 3)]))
    }

    #[test]
    fn test_layout_ranges() {
        let layout = layout();
        assert_eq!(layout.range("a"), Some(0..2));
        assert_eq!(layout.range("b"), Some(2..5));
        assert_eq!(layout.len(), 5);
        assert!(layout.range("c").is_none());
    }

    #[test]
    fn test_set_broadcasts_scalar() {
        let mut vec = Vector::new(VectorKind::Output, layout());
        vec.set("b", &[7.0]).unwrap();
        assert_eq!(vec.get("b").unwrap(), &[7.0, 7.0, 7.0]);
    }

    #[test]
    fn test_set_size_mismatch() {
        let mut vec = Vector::new(VectorKind::Output, layout());
        let err = vec.set("b", &[1.0, 2.0]).unwrap_err();
        assert_eq!(err, VectorError::SizeMismatch { name: "b".into(), expected: 3, found: 2 });
    }

    #[test]
    fn test_read_only_blocks_named_writes() {
        let mut vec = Vector::new(VectorKind::Input, layout());
        vec.set_read_only(true);
        assert!(matches!(vec.set("a", &[1.0]), Err(VectorError::ReadOnly { .. })));
        vec.set_read_only(false);
        assert!(vec.set("a", &[1.0]).is_ok());
    }

    #[test]
    fn test_hash_tracks_content() {
        let mut vec = Vector::new(VectorKind::Input, layout());
        let h0 = vec.get_hash();
        assert_eq!(h0, vec.get_hash());
        vec.set("a", &[1e-300]).unwrap();
        assert_ne!(h0, vec.get_hash());
    }

    #[test]
    fn test_scaling_round_trip() {
        let scaling = Scaling { scaler: vec![2.0; 5], adder: vec![1.0; 5] };
        let mut vec = Vector::new(VectorKind::Output, layout()).with_scaling(scaling);
        vec.set_val(&[3.0, 5.0, 7.0, 9.0, 11.0]).unwrap();
        vec.scale();
        assert_eq!(vec.as_slice(), &[1.0, 2.0, 3.0, 4.0, 5.0]);
        vec.unscale();
        assert_eq!(vec.as_slice(), &[3.0, 5.0, 7.0, 9.0, 11.0]);
    }

    #[test]
    fn test_shadow_allocated_once_and_retained() {
        let mut vec = Vector::new(VectorKind::Output, layout());
        assert_eq!(vec.storage(), &Storage::RealOnly);
        vec.set_complex_step(true);
        vec.set_complex("a", &[Complex64::new(1.0, 2.0), Complex64::new(3.0, 4.0)]).unwrap();
        assert_eq!(vec.imag().unwrap()[..2], [2.0, 4.0]);

        vec.set_complex_step(false);
        assert!(vec.has_shadow());
        assert!(vec.imag().is_none());
        assert_eq!(vec.get_complex("a").unwrap()[1], Complex64::new(3.0, 0.0));
    }

    #[test]
    fn test_set_complex_requires_complex_step() {
        let mut vec = Vector::new(VectorKind::Output, layout());
        let err = vec.set_complex("a", &[Complex64::new(0.0, 1.0); 2]).unwrap_err();
        assert_eq!(err, VectorError::ComplexStepInactive(VectorKind::Output));
    }
}
