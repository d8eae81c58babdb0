//! Jacobian access contract and the dictionary-backed Jacobian.
//!
//! The storage format of an assembled Jacobian belongs to the linear-solver
//! layer. Components only need the access contract captured by the
//! [`Jacobian`] trait: set and read sub-Jacobian blocks keyed by
//! `(of, wrt)`, and apply the local Jacobian to derivative vectors.
//!
//! [`DictionaryJacobian`] keeps one block per declared key. A block is either
//! dense (row-major values of shape `(rows, cols)`) or sparse (explicit
//! `rows`/`cols` coordinate lists with one value per nonzero).

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ops::Range;

use nalgebra::{DMatrix, DVector};

use crate::approx::ApproxMethod;
use crate::vector::{Vector, VectorError};
use crate::Mode;

/// Key of a sub-Jacobian: `(of, wrt)`.
pub type SubjacKey = (String, String);

/// Errors raised when accessing sub-Jacobians.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum JacobianError {
    /// Write to a sub-Jacobian that was never declared.
    #[error("sub-jacobian ('{of}', '{wrt}') has not been declared")]
    Undeclared { of: String, wrt: String },
    /// Wrong number of values for a sub-Jacobian.
    #[error("sub-jacobian ('{of}', '{wrt}') expects {expected} values but got {found}")]
    SizeMismatch { of: String, wrt: String, expected: usize, found: usize },
    #[error(transparent)]
    Vector(#[from] VectorError),
}

/// Whether a Jacobian column variable is an input or an output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WrtKind {
    Input,
    Output,
}

/// Metadata and values of one sub-Jacobian.
#[derive(Debug, Clone, PartialEq)]
pub struct SubjacInfo {
    /// Row coordinates for sparse blocks.
    pub rows: Option<Vec<usize>>,
    /// Column coordinates for sparse blocks.
    pub cols: Option<Vec<usize>>,
    /// Block shape `(size of 'of', size of 'wrt')`.
    pub shape: (usize, usize),
    /// Values: row-major for dense blocks, one per nonzero for sparse blocks.
    pub val: Vec<f64>,
    /// Approximation scheme computing this block, if any.
    pub method: Option<ApproxMethod>,
    /// False when the block is known to be structurally zero.
    pub dependent: bool,
}

impl SubjacInfo {
    /// A zero dense block.
    pub fn dense(shape: (usize, usize)) -> Self {
        SubjacInfo {
            rows: None,
            cols: None,
            shape,
            val: vec![0.0; shape.0 * shape.1],
            method: None,
            dependent: true,
        }
    }

    /// A sparse block with the given coordinates and values.
    pub fn sparse(rows: Vec<usize>, cols: Vec<usize>, shape: (usize, usize), val: Vec<f64>) -> Self {
        SubjacInfo { rows: Some(rows), cols: Some(cols), shape, val, method: None, dependent: true }
    }

    /// Sets the approximation method.
    pub fn with_method(mut self, method: Option<ApproxMethod>) -> Self {
        self.method = method;
        self
    }

    /// Number of stored values.
    pub fn nnz(&self) -> usize {
        self.val.len()
    }

    /// Returns true for sparse blocks whose nonzeros all sit on the diagonal.
    pub fn is_diagonal(&self) -> bool {
        match (&self.rows, &self.cols) {
            (Some(rows), Some(cols)) => rows.iter().zip(cols).all(|(r, c)| r == c),
            _ => false,
        }
    }

    /// Dense row-major copy of the block.
    pub fn to_dense(&self) -> DMatrix<f64> {
        let (nrows, ncols) = self.shape;
        match (&self.rows, &self.cols) {
            (Some(rows), Some(cols)) => {
                let mut m = DMatrix::zeros(nrows, ncols);
                for ((&r, &c), &v) in rows.iter().zip(cols).zip(&self.val) {
                    m[(r, c)] += v;
                }
                m
            }
            _ => DMatrix::from_row_slice(nrows, ncols, &self.val),
        }
    }

    /// `out += J x`.
    fn matvec(&self, x: &[f64], out: &mut [f64]) {
        match (&self.rows, &self.cols) {
            (Some(rows), Some(cols)) => {
                for ((&r, &c), &v) in rows.iter().zip(cols).zip(&self.val) {
                    out[r] += v * x[c];
                }
            }
            _ => {
                let (nrows, ncols) = self.shape;
                let prod = DMatrix::from_row_slice(nrows, ncols, &self.val)
                    * DVector::from_column_slice(x);
                out.iter_mut().zip(prod.iter()).for_each(|(o, p)| *o += p);
            }
        }
    }

    /// `out += J^T y`.
    fn rmatvec(&self, y: &[f64], out: &mut [f64]) {
        match (&self.rows, &self.cols) {
            (Some(rows), Some(cols)) => {
                for ((&r, &c), &v) in rows.iter().zip(cols).zip(&self.val) {
                    out[c] += v * y[r];
                }
            }
            _ => {
                let (nrows, ncols) = self.shape;
                let prod = DMatrix::from_row_slice(nrows, ncols, &self.val)
                    .tr_mul(&DVector::from_column_slice(y));
                out.iter_mut().zip(prod.iter()).for_each(|(o, p)| *o += p);
            }
        }
    }
}

/// Variables taking part in one matrix-vector product.
///
/// `None` means every variable of that kind is in scope.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MatvecScope {
    pub outputs: Option<BTreeSet<String>>,
    pub inputs: Option<BTreeSet<String>>,
}

impl MatvecScope {
    /// Scope containing every variable.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn includes_output(&self, name: &str) -> bool {
        self.outputs.as_ref().map_or(true, |s| s.contains(name))
    }

    pub fn includes_input(&self, name: &str) -> bool {
        self.inputs.as_ref().map_or(true, |s| s.contains(name))
    }
}

/// Access contract for local Jacobians.
pub trait Jacobian {
    /// Writes the values of a declared sub-Jacobian. A single value is broadcast.
    fn set(&mut self, of: &str, wrt: &str, values: &[f64]) -> Result<(), JacobianError>;

    /// Values of a sub-Jacobian.
    fn get(&self, of: &str, wrt: &str) -> Option<&[f64]>;

    /// Returns true if the sub-Jacobian has been declared.
    fn contains(&self, of: &str, wrt: &str) -> bool;

    /// All `(key, values)` pairs in key order.
    fn items(&self) -> Vec<(SubjacKey, Vec<f64>)>;

    /// Applies the Jacobian.
    ///
    /// Forward: `d_residuals += J [d_outputs; d_inputs]`.
    /// Reverse: `[d_outputs; d_inputs] += J^T d_residuals`.
    fn apply(
        &self,
        d_inputs: &mut Vector,
        d_outputs: &mut Vector,
        d_residuals: &mut Vector,
        mode: Mode,
        scope: &MatvecScope,
    ) -> Result<(), JacobianError>;
}

/// Jacobian storing one block per `(of, wrt)` key.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DictionaryJacobian {
    subjacs: BTreeMap<SubjacKey, SubjacInfo>,
    row_ranges: HashMap<String, Range<usize>>,
    col_ranges: HashMap<String, (WrtKind, Range<usize>)>,
}

impl DictionaryJacobian {
    /// Creates an empty Jacobian.
    ///
    /// `row_ranges` maps each `of` name to its range in the residual array;
    /// `col_ranges` maps each `wrt` name to its kind and range in the
    /// corresponding input or output array.
    pub fn new(
        row_ranges: HashMap<String, Range<usize>>,
        col_ranges: HashMap<String, (WrtKind, Range<usize>)>,
    ) -> Self {
        DictionaryJacobian { subjacs: BTreeMap::new(), row_ranges, col_ranges }
    }

    /// Declares (or replaces) a sub-Jacobian.
    pub fn declare(&mut self, of: &str, wrt: &str, info: SubjacInfo) {
        self.subjacs.insert((of.to_string(), wrt.to_string()), info);
    }

    pub fn info(&self, of: &str, wrt: &str) -> Option<&SubjacInfo> {
        self.subjacs.get(&(of.to_string(), wrt.to_string()))
    }

    pub fn info_mut(&mut self, of: &str, wrt: &str) -> Option<&mut SubjacInfo> {
        self.subjacs.get_mut(&(of.to_string(), wrt.to_string()))
    }

    /// Removes a sub-Jacobian.
    pub fn remove(&mut self, of: &str, wrt: &str) -> Option<SubjacInfo> {
        self.subjacs.remove(&(of.to_string(), wrt.to_string()))
    }

    /// All declared blocks in key order.
    pub fn subjacs(&self) -> &BTreeMap<SubjacKey, SubjacInfo> {
        &self.subjacs
    }

    /// Kind of a column variable.
    pub fn wrt_kind(&self, wrt: &str) -> Option<WrtKind> {
        self.col_ranges.get(wrt).map(|(kind, _)| *kind)
    }

    /// Range of an `of` variable in the residual array.
    pub fn row_range(&self, of: &str) -> Option<Range<usize>> {
        self.row_ranges.get(of).cloned()
    }

    /// Kind and range of a `wrt` variable.
    pub fn col_range(&self, wrt: &str) -> Option<(WrtKind, Range<usize>)> {
        self.col_ranges.get(wrt).cloned()
    }
}

impl Jacobian for DictionaryJacobian {
    fn set(&mut self, of: &str, wrt: &str, values: &[f64]) -> Result<(), JacobianError> {
        let info = self
            .info_mut(of, wrt)
            .ok_or_else(|| JacobianError::Undeclared { of: of.to_string(), wrt: wrt.to_string() })?;
        match values.len() {
            1 => info.val.fill(values[0]),
            n if n == info.val.len() => info.val.copy_from_slice(values),
            n => {
                return Err(JacobianError::SizeMismatch {
                    of: of.to_string(),
                    wrt: wrt.to_string(),
                    expected: info.val.len(),
                    found: n,
                })
            }
        }
        Ok(())
    }

    fn get(&self, of: &str, wrt: &str) -> Option<&[f64]> {
        self.info(of, wrt).map(|info| info.val.as_slice())
    }

    fn contains(&self, of: &str, wrt: &str) -> bool {
        self.info(of, wrt).is_some()
    }

    fn items(&self) -> Vec<(SubjacKey, Vec<f64>)> {
        self.subjacs.iter().map(|(k, info)| (k.clone(), info.val.clone())).collect()
    }

    fn apply(
        &self,
        d_inputs: &mut Vector,
        d_outputs: &mut Vector,
        d_residuals: &mut Vector,
        mode: Mode,
        scope: &MatvecScope,
    ) -> Result<(), JacobianError> {
        for ((of, wrt), info) in &self.subjacs {
            if !info.dependent {
                continue;
            }
            let (Some(rows), Some((kind, cols))) = (self.row_ranges.get(of), self.col_ranges.get(wrt))
            else {
                continue;
            };
            let column_vec = match kind {
                WrtKind::Output if scope.includes_output(wrt) => &mut *d_outputs,
                WrtKind::Input if scope.includes_input(wrt) => &mut *d_inputs,
                _ => continue,
            };
            match mode {
                Mode::Fwd => {
                    let x = &column_vec.as_slice()[cols.clone()];
                    info.matvec(x, &mut d_residuals.as_mut_slice()[rows.clone()]);
                }
                Mode::Rev => {
                    let y = &d_residuals.as_slice()[rows.clone()];
                    info.rmatvec(y, &mut column_vec.as_mut_slice()[cols.clone()]);
                }
            }
        }
        Ok(())
    }
}
