//! Finite-difference and complex-step approximation of sub-Jacobians.
//!
//! Schemes perturb one input entry at a time, re-evaluate the component and
//! write one Jacobian column per perturbation into every declared block
//! `(of, wrt)` that uses the scheme. The component is seen through the
//! [`ApproxTarget`] trait so schemes never touch component internals.
//!
//! Blocks are derivatives of `compute(x)` with respect to the inputs, which
//! matches the `-1` self-diagonal convention of explicit components
//! (`R = compute(x) - y`).

use std::collections::BTreeMap;
use std::fmt;
use std::ops::Range;

use num_complex::Complex64;

use crate::component::ComputeError;
use crate::jacobian::{DictionaryJacobian, SubjacInfo, SubjacKey};

/// Approximation methods that can be attached to declared partials.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ApproxMethod {
    /// Finite difference.
    Fd,
    /// Complex step.
    Cs,
}

impl fmt::Display for ApproxMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApproxMethod::Fd => write!(f, "fd"),
            ApproxMethod::Cs => write!(f, "cs"),
        }
    }
}

/// Difference formula.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FdForm {
    #[default]
    Forward,
    Backward,
    Central,
}

/// How the perturbation size is derived from `step`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StepCalc {
    /// `h = step`
    #[default]
    Abs,
    /// `h = step * |x|`, falling back to `step` at zero.
    Rel,
}

/// View of a component used by approximation schemes.
pub trait ApproxTarget {
    /// Current (physical) input values.
    fn input_values(&self) -> &[f64];

    /// Range of an input in the flat input array.
    fn input_range(&self, name: &str) -> Option<Range<usize>>;

    /// Range of an `of` variable in the flat output array.
    fn output_range(&self, name: &str) -> Option<Range<usize>>;

    /// Evaluates the outputs for the given inputs.
    fn eval(&mut self, inputs: &[f64]) -> Result<Vec<f64>, ComputeError>;

    /// Evaluates the outputs for complex inputs.
    fn eval_complex(&mut self, inputs: &[Complex64]) -> Result<Vec<Complex64>, ComputeError>;
}

/// A scheme that fills sub-Jacobians by repeated evaluation.
pub trait ApproximationScheme: fmt::Debug + Send + Sync {
    fn method(&self) -> ApproxMethod;

    /// Computes every block in `keys` and writes it into `jac`.
    fn compute_approximations(
        &self,
        target: &mut dyn ApproxTarget,
        keys: &[SubjacKey],
        jac: &mut DictionaryJacobian,
    ) -> Result<(), ComputeError>;
}

/// Groups keys by `wrt`, keeping the `of` names in key order.
fn keys_by_wrt(keys: &[SubjacKey]) -> BTreeMap<&str, Vec<&str>> {
    let mut grouped: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for (of, wrt) in keys {
        grouped.entry(wrt.as_str()).or_default().push(of.as_str());
    }
    grouped
}

/// Writes column `col` of each block `(of, wrt)` from a full output derivative.
fn scatter_column(
    jac: &mut DictionaryJacobian,
    target: &dyn ApproxTarget,
    ofs: &[&str],
    wrt: &str,
    col: usize,
    column: &[f64],
) {
    for of in ofs {
        let Some(rows) = target.output_range(of) else { continue };
        if let Some(info) = jac.info_mut(of, wrt) {
            info.set_column(col, &column[rows]);
        }
    }
}

impl SubjacInfo {
    /// Writes one column of the block.
    ///
    /// Dense blocks take every row; sparse blocks only their declared nonzeros.
    pub(crate) fn set_column(&mut self, col: usize, values: &[f64]) {
        let ncols = self.shape.1;
        match (&self.rows, &self.cols) {
            (Some(rows), Some(cols)) => {
                for (k, (&r, &c)) in rows.iter().zip(cols).enumerate() {
                    if c == col {
                        self.val[k] = values[r];
                    }
                }
            }
            _ => {
                for (r, v) in values.iter().enumerate() {
                    self.val[r * ncols + col] = *v;
                }
            }
        }
    }
}

/// Finite-difference approximation.
#[derive(Debug, Clone, PartialEq)]
pub struct FiniteDifference {
    pub step: f64,
    pub form: FdForm,
    pub step_calc: StepCalc,
}

impl Default for FiniteDifference {
    fn default() -> Self {
        FiniteDifference { step: 1e-6, form: FdForm::Forward, step_calc: StepCalc::Abs }
    }
}

impl FiniteDifference {
    /// Creates a forward difference with absolute step `step`.
    pub fn new(step: f64) -> Self {
        FiniteDifference { step, ..Self::default() }
    }

    /// Sets the difference formula.
    pub fn with_form(mut self, form: FdForm) -> Self {
        self.form = form;
        self
    }

    /// Sets the step calculation.
    pub fn with_step_calc(mut self, step_calc: StepCalc) -> Self {
        self.step_calc = step_calc;
        self
    }

    fn step_for(&self, x: f64) -> f64 {
        match self.step_calc {
            StepCalc::Abs => self.step,
            StepCalc::Rel if x != 0.0 => self.step * x.abs(),
            StepCalc::Rel => self.step,
        }
    }
}

impl ApproximationScheme for FiniteDifference {
    fn method(&self) -> ApproxMethod {
        ApproxMethod::Fd
    }

    fn compute_approximations(
        &self,
        target: &mut dyn ApproxTarget,
        keys: &[SubjacKey],
        jac: &mut DictionaryJacobian,
    ) -> Result<(), ComputeError> {
        if keys.is_empty() {
            return Ok(());
        }
        let base_inputs = target.input_values().to_vec();
        let base_outputs = match self.form {
            FdForm::Central => Vec::new(),
            _ => target.eval(&base_inputs)?,
        };

        for (wrt, ofs) in keys_by_wrt(keys) {
            let Some(range) = target.input_range(wrt) else { continue };
            for (col, idx) in range.enumerate() {
                let h = self.step_for(base_inputs[idx]);
                let mut perturbed = base_inputs.clone();
                let column: Vec<f64> = match self.form {
                    FdForm::Forward => {
                        perturbed[idx] += h;
                        let plus = target.eval(&perturbed)?;
                        plus.iter().zip(&base_outputs).map(|(p, b)| (p - b) / h).collect()
                    }
                    FdForm::Backward => {
                        perturbed[idx] -= h;
                        let minus = target.eval(&perturbed)?;
                        base_outputs.iter().zip(&minus).map(|(b, m)| (b - m) / h).collect()
                    }
                    FdForm::Central => {
                        perturbed[idx] += h;
                        let plus = target.eval(&perturbed)?;
                        perturbed[idx] -= 2.0 * h;
                        let minus = target.eval(&perturbed)?;
                        plus.iter().zip(&minus).map(|(p, m)| (p - m) / (2.0 * h)).collect()
                    }
                };
                scatter_column(jac, target, &ofs, wrt, col, &column);
            }
        }
        Ok(())
    }
}

/// Complex-step approximation.
#[derive(Debug, Clone, PartialEq)]
pub struct ComplexStep {
    pub step: f64,
}

impl Default for ComplexStep {
    fn default() -> Self {
        ComplexStep { step: 1e-40 }
    }
}

impl ComplexStep {
    pub fn new(step: f64) -> Self {
        ComplexStep { step }
    }
}

impl ApproximationScheme for ComplexStep {
    fn method(&self) -> ApproxMethod {
        ApproxMethod::Cs
    }

    fn compute_approximations(
        &self,
        target: &mut dyn ApproxTarget,
        keys: &[SubjacKey],
        jac: &mut DictionaryJacobian,
    ) -> Result<(), ComputeError> {
        if keys.is_empty() {
            return Ok(());
        }
        let base: Vec<Complex64> =
            target.input_values().iter().map(|&re| Complex64::new(re, 0.0)).collect();

        for (wrt, ofs) in keys_by_wrt(keys) {
            let Some(range) = target.input_range(wrt) else { continue };
            for (col, idx) in range.enumerate() {
                let mut perturbed = base.clone();
                perturbed[idx].im = self.step;
                let result = target.eval_complex(&perturbed)?;
                let column: Vec<f64> = result.iter().map(|v| v.im / self.step).collect();
                scatter_column(jac, target, &ofs, wrt, col, &column);
            }
        }
        Ok(())
    }
}
