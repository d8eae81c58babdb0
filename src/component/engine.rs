//! Execution engine wrapping an explicit component.
//!
//! The engine owns the component's nonlinear vectors (`inputs`, `outputs`,
//! `residuals`), its linear vectors (`d_inputs`, `d_outputs`, `d_residuals`)
//! and its [`DictionaryJacobian`]. Between calls the output and residual
//! vectors are kept in the scaled state; every call into user code happens
//! inside an unscaled context, so user functions always see physical values.
//!
//! # Residual convention
//!
//! The residual of an explicit component is `R = compute(x) - y`. Hence the
//! self block `d(y)/d(y)` is a `-1` diagonal and user partials are plain
//! derivatives of `compute`. Matrix-free components carry no self block; the
//! identity term is applied algebraically in [`ExplicitEngine::apply_linear`].
//!
//! # Root-only execution
//!
//! With [`ComponentOptions::run_root_only`], rank 0 runs each user function
//! and broadcasts the result; the other ranks apply the broadcast instead of
//! calling the function. A failure on the root is broadcast too, so every
//! rank returns an error instead of waiting for data that never comes.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::hash::Hasher;
use std::sync::Arc;

use num_complex::Complex64;
use rustc_hash::FxHasher;
use tracing::{debug, debug_span, trace, warn};

use super::{
    Capability, ComponentBuilder, ComponentOptions, ComputeError, ComputeResult, ExecutionState,
    ExplicitComponent, PartialsSpec, SetupError, VarMeta, glob_match,
};
use crate::approx::{ApproxMethod, ApproxTarget, ApproximationScheme};
use crate::comm::{CommError, Communicator, Payload};
use crate::jacobian::{DictionaryJacobian, Jacobian, MatvecScope, SubjacInfo, SubjacKey, WrtKind};
use crate::vector::{DiscreteVars, Layout, Scaling, Vector, VectorKind};
use crate::Mode;

/// Vectors switched to physical values by an unscaled context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Unscaled {
    /// `outputs` and `residuals`.
    Nonlinear,
    /// `outputs` and `d_residuals`. `d_outputs` stays scaled, so the identity
    /// term of matrix-free products reads it as stored.
    LinearApply,
    /// `d_outputs` and `d_residuals`.
    LinearSolve,
}

/// An explicit component set up for execution.
pub struct ExplicitEngine {
    path: String,
    class: String,
    component: Box<dyn ExplicitComponent>,
    options: ComponentOptions,
    comm: Arc<dyn Communicator>,

    has_compute_partials: bool,
    matrix_free: bool,
    has_resid_scaling: bool,
    first_linearize: bool,

    input_meta: Vec<VarMeta>,
    output_meta: Vec<VarMeta>,

    inputs: Vector,
    outputs: Vector,
    residuals: Vector,
    d_inputs: Vector,
    d_outputs: Vector,
    d_residuals: Vector,
    discrete_inputs: DiscreteVars,
    discrete_outputs: DiscreteVars,

    jacobian: DictionaryJacobian,
    approx_schemes: BTreeMap<ApproxMethod, Box<dyn ApproximationScheme>>,
    state: ExecutionState,

    iter_count: usize,
    iter_count_apply: usize,
}

impl fmt::Debug for ExplicitEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExplicitEngine")
            .field("path", &self.path)
            .field("class", &self.class)
            .field("matrix_free", &self.matrix_free)
            .field("has_compute_partials", &self.has_compute_partials)
            .field("iter_count", &self.iter_count)
            .field("iter_count_apply", &self.iter_count_apply)
            .finish_non_exhaustive()
    }
}

/// Last path segment of a type name, without generic arguments.
fn short_type_name<C>() -> String {
    let full = std::any::type_name::<C>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base).to_string()
}

/// Identity of a root-only broadcast.
fn op_tag(path: &str, op: &str) -> u64 {
    let mut hasher = FxHasher::default();
    hasher.write(path.as_bytes());
    hasher.write_u8(0);
    hasher.write(op.as_bytes());
    hasher.finish()
}

/// Runs `local` on rank 0 and broadcasts its payload.
///
/// Every rank returns the root's payload. An error on the root is returned
/// unchanged there and as [`CommError::RootFailed`] everywhere else.
fn run_on_root(
    comm: &dyn Communicator,
    path: &str,
    op: &str,
    local: impl FnOnce() -> ComputeResult<Payload>,
) -> ComputeResult<Payload> {
    let tag = op_tag(path, op);
    if comm.rank() == 0 {
        match local() {
            Ok(payload) => Ok(comm.broadcast(tag, 0, payload)?),
            Err(err) => {
                let failed = Payload::Failed { path: path.to_string(), message: err.to_string() };
                comm.broadcast(tag, 0, failed)?;
                Err(err)
            }
        }
    } else {
        match comm.broadcast(tag, 0, Payload::Empty)? {
            Payload::Failed { path, message } => Err(CommError::RootFailed { path, message }.into()),
            payload => Ok(payload),
        }
    }
}

fn call_compute(
    component: &dyn ExplicitComponent,
    inputs: &Vector,
    outputs: &mut Vector,
    discrete_inputs: &DiscreteVars,
    discrete_outputs: &mut DiscreteVars,
) -> ComputeResult<()> {
    if discrete_inputs.is_empty() && discrete_outputs.is_empty() {
        component.compute(inputs, outputs)
    } else {
        component.compute_discrete(inputs, outputs, discrete_inputs, discrete_outputs)
    }
}

impl ExplicitEngine {
    /// Runs the component's `setup` and builds vectors and Jacobian.
    ///
    /// Capabilities are read once here; the engine never inspects the
    /// component again to decide which operations it supports.
    pub fn setup<C: ExplicitComponent + 'static>(
        path: &str,
        mut component: C,
        options: ComponentOptions,
        comm: Arc<dyn Communicator>,
    ) -> Result<Self, SetupError> {
        let class = short_type_name::<C>();
        let mut builder = ComponentBuilder::new(path, &class, options.distributed);
        component.setup(&mut builder)?;

        let has_compute_partials = builder.capabilities.contains(&Capability::ComputePartials);
        let matrix_free = builder.capabilities.contains(&Capability::JacvecProduct);
        let has_complex_step = builder.capabilities.contains(&Capability::ComplexStep);

        let mut in_layout = Layout::new();
        let mut in_vals = Vec::new();
        let mut input_meta = Vec::new();
        for (meta, val) in std::mem::take(&mut builder.inputs) {
            in_layout.push(&meta.name, &meta.shape);
            in_vals.extend(val);
            input_meta.push(meta);
        }

        let mut out_layout = Layout::new();
        let mut out_vals = Vec::new();
        let mut output_meta = Vec::new();
        let (mut scaler, mut adder, mut res_scaler) = (Vec::new(), Vec::new(), Vec::new());
        for declared in std::mem::take(&mut builder.outputs) {
            out_layout.push(&declared.meta.name, &declared.meta.shape);
            out_vals.extend(declared.val);
            for ((r, r0), rr) in declared.ref_.iter().zip(&declared.ref0).zip(&declared.res_ref) {
                scaler.push(r - r0);
                adder.push(*r0);
                res_scaler.push(*rr);
            }
            output_meta.push(declared.meta);
        }

        let res_layout = if builder.residuals.is_empty() {
            out_layout.clone()
        } else {
            let mut layout = Layout::new();
            res_scaler.clear();
            for (name, spec, ref_) in &builder.residuals {
                if out_layout.contains(name) {
                    return Err(SetupError::ResidualNameConflict {
                        path: path.to_string(),
                        class,
                        name: name.clone(),
                    });
                }
                layout.push(name, &spec.shape);
                res_scaler.extend(ref_);
            }
            if layout.len() != out_layout.len() {
                return Err(SetupError::ResidualSizeMismatch {
                    path: path.to_string(),
                    class,
                    residuals: layout.len(),
                    outputs: out_layout.len(),
                });
            }
            layout
        };

        if options.run_root_only && input_meta.iter().chain(&output_meta).any(|m| m.distributed) {
            return Err(SetupError::RootOnlyDistributed { path: path.to_string(), class });
        }

        let has_resid_scaling = res_scaler != scaler;
        let zeros = vec![0.0; scaler.len()];
        let in_layout = Arc::new(in_layout);
        let out_layout = Arc::new(out_layout);
        let res_layout = Arc::new(res_layout);

        let mut inputs = Vector::new(VectorKind::Input, Arc::clone(&in_layout));
        inputs.as_mut_slice().copy_from_slice(&in_vals);
        let mut outputs = Vector::new(VectorKind::Output, Arc::clone(&out_layout))
            .with_scaling(Scaling { scaler: scaler.clone(), adder });
        outputs.as_mut_slice().copy_from_slice(&out_vals);
        let residuals = Vector::new(VectorKind::Residual, Arc::clone(&res_layout))
            .with_scaling(Scaling { scaler: res_scaler.clone(), adder: zeros.clone() });
        let d_inputs = Vector::new(VectorKind::Input, Arc::clone(&in_layout));
        let d_outputs = Vector::new(VectorKind::Output, Arc::clone(&out_layout))
            .with_scaling(Scaling { scaler, adder: zeros.clone() });
        let d_residuals = Vector::new(VectorKind::Residual, Arc::clone(&res_layout))
            .with_scaling(Scaling { scaler: res_scaler, adder: zeros });

        let mut row_ranges: HashMap<String, std::ops::Range<usize>> =
            out_layout.iter().map(|(n, r)| (n.to_string(), r)).collect();
        row_ranges.extend(res_layout.iter().map(|(n, r)| (n.to_string(), r)));
        let mut col_ranges: HashMap<String, (WrtKind, std::ops::Range<usize>)> =
            in_layout.iter().map(|(n, r)| (n.to_string(), (WrtKind::Input, r))).collect();
        col_ranges.extend(out_layout.iter().map(|(n, r)| (n.to_string(), (WrtKind::Output, r))));

        let mut engine = ExplicitEngine {
            path: path.to_string(),
            class,
            component: Box::new(component),
            options,
            comm,
            has_compute_partials,
            matrix_free,
            has_resid_scaling,
            first_linearize: true,
            input_meta,
            output_meta,
            inputs,
            outputs,
            residuals,
            d_inputs,
            d_outputs,
            d_residuals,
            discrete_inputs: std::mem::take(&mut builder.discrete_inputs),
            discrete_outputs: std::mem::take(&mut builder.discrete_outputs),
            jacobian: DictionaryJacobian::new(row_ranges, col_ranges),
            approx_schemes: std::mem::take(&mut builder.approx_schemes),
            state: ExecutionState::new(),
            iter_count: 0,
            iter_count_apply: 0,
        };

        let renamed = !builder.residuals.is_empty();
        for (of, wrt, spec) in &builder.partials {
            engine.declare_partials(of, wrt, spec, renamed, has_complex_step)?;
        }
        engine.setup_partials();

        for vec in [&mut engine.outputs, &mut engine.residuals, &mut engine.d_outputs, &mut engine.d_residuals]
        {
            vec.scale();
        }

        debug!(
            path = %engine.path,
            class = %engine.class,
            inputs = engine.inputs.len(),
            outputs = engine.outputs.len(),
            subjacs = engine.jacobian.subjacs().len(),
            matrix_free = engine.matrix_free,
            "explicit component set up"
        );
        Ok(engine)
    }

    fn setup_error_partials(&self, of: &str, wrt: &str, reason: String) -> SetupError {
        SetupError::InvalidPartials {
            path: self.path.clone(),
            class: self.class.clone(),
            of: of.to_string(),
            wrt: wrt.to_string(),
            reason,
        }
    }

    /// Resolves one `declare_partials` call into sub-Jacobian blocks.
    fn declare_partials(
        &mut self,
        of_pattern: &str,
        wrt_pattern: &str,
        spec: &PartialsSpec,
        renamed: bool,
        has_complex_step: bool,
    ) -> Result<(), SetupError> {
        let of_layout = if renamed { self.residuals.layout() } else { self.outputs.layout() };
        let ofs: Vec<(String, usize)> = of_layout
            .iter()
            .filter(|(name, _)| glob_match(of_pattern, name))
            .map(|(name, range)| (name.to_string(), range.len()))
            .collect();
        let wrts: Vec<(String, usize)> = self
            .inputs
            .layout()
            .iter()
            .chain(self.outputs.layout().iter())
            .filter(|(name, _)| glob_match(wrt_pattern, name))
            .map(|(name, range)| (name.to_string(), range.len()))
            .collect();

        for (arg, pattern, found) in [("of", of_pattern, &ofs), ("wrt", wrt_pattern, &wrts)] {
            if found.is_empty() {
                return Err(SetupError::NoMatchingVariables {
                    path: self.path.clone(),
                    class: self.class.clone(),
                    arg,
                    pattern: pattern.to_string(),
                });
            }
        }
        if spec.method == Some(ApproxMethod::Cs) && !has_complex_step {
            return Err(SetupError::ComplexStepUnsupported {
                path: self.path.clone(),
                class: self.class.clone(),
            });
        }

        for (of, of_size) in &ofs {
            for (wrt, wrt_size) in &wrts {
                let shape = (*of_size, *wrt_size);
                let mut info = match (&spec.rows, &spec.cols) {
                    (Some(rows), Some(cols)) => {
                        if rows.len() != cols.len() {
                            return Err(self.setup_error_partials(
                                of,
                                wrt,
                                format!("rows and cols must have the same length ({} != {})", rows.len(), cols.len()),
                            ));
                        }
                        if let Some((r, c)) =
                            rows.iter().zip(cols).find(|(r, c)| **r >= shape.0 || **c >= shape.1)
                        {
                            return Err(self.setup_error_partials(
                                of,
                                wrt,
                                format!("index ({r}, {c}) is out of bounds for shape ({}, {})", shape.0, shape.1),
                            ));
                        }
                        SubjacInfo::sparse(rows.clone(), cols.clone(), shape, vec![0.0; rows.len()])
                    }
                    (None, None) => SubjacInfo::dense(shape),
                    _ => {
                        return Err(self.setup_error_partials(
                            of,
                            wrt,
                            "rows and cols must be declared together".to_string(),
                        ))
                    }
                };
                if let Some(val) = &spec.val {
                    match val.len() {
                        1 => info.val.fill(val[0]),
                        n if n == info.nnz() => info.val.copy_from_slice(val),
                        n => {
                            return Err(self.setup_error_partials(
                                of,
                                wrt,
                                format!("expected {} values but got {n}", info.nnz()),
                            ))
                        }
                    }
                }
                info.method = spec.method;
                self.jacobian.declare(of, wrt, info);
            }
        }
        Ok(())
    }

    /// Installs the `-1` self diagonal of every non-empty output.
    fn setup_partials(&mut self) {
        for meta in &self.output_meta {
            let name = meta.name.as_str();
            if let Some(info) = self.jacobian.info_mut(name, name) {
                info.method = None;
            }
            if meta.size > 0 && !self.matrix_free {
                let arange: Vec<usize> = (0..meta.size).collect();
                self.jacobian.declare(
                    name,
                    name,
                    SubjacInfo::sparse(arange.clone(), arange, (meta.size, meta.size), vec![-1.0; meta.size]),
                );
            }
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Short type name of the component.
    pub fn class(&self) -> &str {
        &self.class
    }

    pub fn comm(&self) -> &Arc<dyn Communicator> {
        &self.comm
    }

    pub fn options(&self) -> &ComponentOptions {
        &self.options
    }

    /// True if the component supplies `compute_jacvec_product`.
    pub fn matrix_free(&self) -> bool {
        self.matrix_free
    }

    pub fn has_compute_partials(&self) -> bool {
        self.has_compute_partials
    }

    pub fn input_meta(&self) -> &[VarMeta] {
        &self.input_meta
    }

    pub fn output_meta(&self) -> &[VarMeta] {
        &self.output_meta
    }

    pub fn inputs(&self) -> &Vector {
        &self.inputs
    }

    pub fn inputs_mut(&mut self) -> &mut Vector {
        &mut self.inputs
    }

    /// Outputs in the scaled state.
    pub fn outputs(&self) -> &Vector {
        &self.outputs
    }

    pub fn outputs_mut(&mut self) -> &mut Vector {
        &mut self.outputs
    }

    /// Residuals in the scaled state.
    pub fn residuals(&self) -> &Vector {
        &self.residuals
    }

    pub fn d_inputs(&self) -> &Vector {
        &self.d_inputs
    }

    pub fn d_inputs_mut(&mut self) -> &mut Vector {
        &mut self.d_inputs
    }

    pub fn d_outputs(&self) -> &Vector {
        &self.d_outputs
    }

    pub fn d_outputs_mut(&mut self) -> &mut Vector {
        &mut self.d_outputs
    }

    pub fn d_residuals(&self) -> &Vector {
        &self.d_residuals
    }

    pub fn d_residuals_mut(&mut self) -> &mut Vector {
        &mut self.d_residuals
    }

    pub fn discrete_inputs_mut(&mut self) -> &mut DiscreteVars {
        &mut self.discrete_inputs
    }

    pub fn discrete_outputs(&self) -> &DiscreteVars {
        &self.discrete_outputs
    }

    pub fn jacobian(&self) -> &DictionaryJacobian {
        &self.jacobian
    }

    pub fn state(&self) -> &ExecutionState {
        &self.state
    }

    /// Number of `solve_nonlinear` executions.
    pub fn iter_count(&self) -> usize {
        self.iter_count
    }

    /// Number of `apply_nonlinear` executions.
    pub fn iter_count_apply(&self) -> usize {
        self.iter_count_apply
    }

    /// Physical values of one output.
    pub fn output_value(&self, name: &str) -> ComputeResult<Vec<f64>> {
        let mut outputs = self.outputs.clone();
        outputs.unscale();
        Ok(outputs.get(name)?.to_vec())
    }

    fn run_root_only(&self) -> bool {
        self.options.run_root_only && self.comm.size() > 1
    }

    fn set_scaled(&mut self, which: Unscaled, scaled: bool) {
        let vectors: Vec<&mut Vector> = match which {
            Unscaled::Nonlinear => vec![&mut self.outputs, &mut self.residuals],
            Unscaled::LinearApply => vec![&mut self.outputs, &mut self.d_residuals],
            Unscaled::LinearSolve => vec![&mut self.d_outputs, &mut self.d_residuals],
        };
        for vec in vectors {
            if scaled {
                vec.scale();
            } else {
                vec.unscale();
            }
        }
    }

    /// Runs `f` with the selected vectors in physical units, rescaling them
    /// afterwards whether `f` succeeds or not.
    fn unscaled<T>(
        &mut self,
        which: Unscaled,
        f: impl FnOnce(&mut Self) -> ComputeResult<T>,
    ) -> ComputeResult<T> {
        self.set_scaled(which, false);
        let result = f(self);
        self.set_scaled(which, true);
        result
    }

    fn compute_wrapper(&mut self) -> ComputeResult<()> {
        let _span = debug_span!("compute", path = %self.path).entered();
        let root_only = self.run_root_only();
        let component = &*self.component;
        let inputs = &self.inputs;
        let outputs = &mut self.outputs;
        let discrete_inputs = &self.discrete_inputs;
        let discrete_outputs = &mut self.discrete_outputs;

        if !root_only {
            return call_compute(component, inputs, outputs, discrete_inputs, discrete_outputs);
        }

        let payload = run_on_root(&*self.comm, &self.path, "compute", || {
            call_compute(component, inputs, outputs, discrete_inputs, discrete_outputs)?;
            Ok(Payload::Outputs {
                values: outputs.as_slice().to_vec(),
                imag: None,
                discrete: discrete_outputs.clone(),
            })
        })?;
        if self.comm.rank() != 0 {
            let Payload::Outputs { values, discrete, .. } = payload else {
                return Err(CommError::UnexpectedPayload { expected: "outputs" }.into());
            };
            self.outputs.set_val(&values)?;
            self.discrete_outputs.extend(discrete);
        }
        Ok(())
    }

    fn compute_partials_wrapper(&mut self) -> ComputeResult<()> {
        let _span = debug_span!("compute_partials", path = %self.path).entered();
        let root_only = self.run_root_only();
        let component = &*self.component;
        let inputs = &self.inputs;
        let jacobian = &mut self.jacobian;
        let discrete_inputs = &self.discrete_inputs;

        if !root_only {
            return component.compute_partials(inputs, jacobian, discrete_inputs);
        }

        let payload = run_on_root(&*self.comm, &self.path, "compute_partials", || {
            component.compute_partials(inputs, jacobian, discrete_inputs)?;
            Ok(Payload::Partials(jacobian.items()))
        })?;
        if self.comm.rank() != 0 {
            let Payload::Partials(items) = payload else {
                return Err(CommError::UnexpectedPayload { expected: "partials" }.into());
            };
            for ((of, wrt), val) in items {
                self.jacobian.set(&of, &wrt, &val)?;
            }
        }
        Ok(())
    }

    fn jacvec_product_wrapper(&mut self, mode: Mode) -> ComputeResult<()> {
        let _span = debug_span!("compute_jacvec_product", path = %self.path, %mode).entered();
        let root_only = self.run_root_only();
        let component = &*self.component;
        let inputs = &self.inputs;
        let d_inputs = &mut self.d_inputs;
        let d_residuals = &mut self.d_residuals;
        let discrete_inputs = &self.discrete_inputs;

        if !root_only {
            return component.compute_jacvec_product(inputs, d_inputs, d_residuals, mode, discrete_inputs);
        }

        let payload = run_on_root(&*self.comm, &self.path, "compute_jacvec_product", || {
            component.compute_jacvec_product(inputs, d_inputs, d_residuals, mode, discrete_inputs)?;
            let result = match mode {
                Mode::Fwd => d_residuals.as_slice().to_vec(),
                Mode::Rev => d_inputs.as_slice().to_vec(),
            };
            Ok(Payload::Reals(result))
        })?;
        if self.comm.rank() != 0 {
            let Payload::Reals(values) = payload else {
                return Err(CommError::UnexpectedPayload { expected: "reals" }.into());
            };
            match mode {
                Mode::Fwd => self.d_residuals.set_val(&values)?,
                Mode::Rev => self.d_inputs.set_val(&values)?,
            }
        }
        Ok(())
    }

    /// Computes the residuals `R = compute(x) - y`.
    ///
    /// The outputs seen by the caller are left at their value before the call.
    pub fn apply_nonlinear(&mut self) -> ComputeResult<()> {
        self.unscaled(Unscaled::Nonlinear, |engine| {
            engine.residuals.set_vec(&engine.outputs)?;
            engine.residuals.scale_by(-1.0);
            engine.compute_wrapper()?;
            engine.residuals.add_vec(&engine.outputs)?;
            engine.outputs.sub_vec(&engine.residuals)?;
            Ok(())
        })?;
        self.iter_count_apply += 1;
        Ok(())
    }

    /// Computes the outputs and zeroes the residuals.
    pub fn solve_nonlinear(&mut self) -> ComputeResult<()> {
        let _span = debug_span!("solve_nonlinear", path = %self.path, iter = self.iter_count).entered();
        let result = self.unscaled(Unscaled::Nonlinear, |engine| {
            engine.residuals.fill(0.0);
            engine.compute_wrapper()
        });
        self.iter_count += 1;
        result
    }

    /// Returns true if the inputs or the active seed changed since the last
    /// matrix-free product. Updates the recorded state.
    pub fn seed_changed(&mut self, mode: Mode) -> bool {
        self.state.seed_changed(&self.inputs, &self.d_inputs, &self.d_residuals, mode)
    }

    /// Applies the Jacobian to the linear vectors.
    ///
    /// `jac` replaces the component's own Jacobian when given. For
    /// matrix-free components, the identity term of every in-scope output
    /// without a self block is applied and `compute_jacvec_product` is called,
    /// or its cached contribution reused when caching is enabled and the seed
    /// is unchanged.
    pub fn apply_linear(
        &mut self,
        jac: Option<&dyn Jacobian>,
        _rel_systems: Option<&BTreeSet<String>>,
        mode: Mode,
        scope_out: Option<&BTreeSet<String>>,
        scope_in: Option<&BTreeSet<String>>,
    ) -> ComputeResult<()> {
        let caching = self.options.matrix_free_caching;
        let changed = !caching || self.seed_changed(mode);
        let scope = MatvecScope { outputs: scope_out.cloned(), inputs: scope_in.cloned() };

        match jac {
            Some(jac) => {
                jac.apply(&mut self.d_inputs, &mut self.d_outputs, &mut self.d_residuals, mode, &scope)?
            }
            None => self.jacobian.apply(
                &mut self.d_inputs,
                &mut self.d_outputs,
                &mut self.d_residuals,
                mode,
                &scope,
            )?,
        }

        if !self.matrix_free {
            return Ok(());
        }

        self.unscaled(Unscaled::LinearApply, |engine| {
            match mode {
                Mode::Fwd => engine.d_inputs.set_read_only(true),
                Mode::Rev => engine.d_residuals.set_read_only(true),
            }
            let result = engine.matrix_free_product(mode, changed, &scope);
            engine.d_inputs.set_read_only(false);
            engine.d_residuals.set_read_only(false);
            result
        })
    }

    fn matrix_free_product(&mut self, mode: Mode, changed: bool, scope: &MatvecScope) -> ComputeResult<()> {
        let layout = Arc::clone(self.outputs.layout());
        for (name, range) in layout.iter() {
            if !scope.includes_output(name) || self.jacobian.contains(name, name) {
                continue;
            }
            for i in range {
                match mode {
                    Mode::Fwd => self.d_residuals.as_mut_slice()[i] -= self.d_outputs.as_slice()[i],
                    Mode::Rev => self.d_outputs.as_mut_slice()[i] -= self.d_residuals.as_slice()[i],
                }
            }
        }

        let cached = if changed { None } else { self.state.cached_product().map(<[f64]>::to_vec) };
        if let Some(contribution) = cached {
            trace!(path = %self.path, %mode, "reusing cached jacvec product");
            match mode {
                Mode::Fwd => self.d_residuals.iadd(&contribution)?,
                Mode::Rev => self.d_inputs.iadd(&contribution)?,
            }
            return Ok(());
        }

        let before = match mode {
            Mode::Fwd => self.d_residuals.as_slice().to_vec(),
            Mode::Rev => self.d_inputs.as_slice().to_vec(),
        };
        if let Err(err) = self.jacvec_product_wrapper(mode) {
            self.state.invalidate();
            return Err(err);
        }
        if self.options.matrix_free_caching {
            let after = match mode {
                Mode::Fwd => self.d_residuals.as_slice(),
                Mode::Rev => self.d_inputs.as_slice(),
            };
            let contribution: Vec<f64> = after.iter().zip(&before).map(|(a, b)| a - b).collect();
            self.state.cache_product(&contribution);
        }
        Ok(())
    }

    /// Applies the inverse of the `-1` diagonal.
    ///
    /// Forward: `d_outputs = -d_residuals`. Reverse: `d_residuals = -d_outputs`.
    pub fn solve_linear(&mut self, mode: Mode, _rel_systems: Option<&BTreeSet<String>>) -> ComputeResult<()> {
        let copy = move |engine: &mut Self| -> ComputeResult<()> {
            match mode {
                Mode::Fwd => engine.d_outputs.set_vec(&engine.d_residuals)?,
                Mode::Rev => engine.d_residuals.set_vec(&engine.d_outputs)?,
            }
            Ok(())
        };
        if self.has_resid_scaling {
            self.unscaled(Unscaled::LinearSolve, copy)?;
        } else {
            copy(self)?;
        }
        match mode {
            Mode::Fwd => self.d_outputs.scale_by(-1.0),
            Mode::Rev => self.d_residuals.scale_by(-1.0),
        }
        Ok(())
    }

    /// Keys approximated by `method`. Derivatives with respect to outputs are
    /// never approximated.
    fn approx_keys(&self, method: ApproxMethod) -> Vec<SubjacKey> {
        self.jacobian
            .subjacs()
            .iter()
            .filter(|((_, wrt), info)| {
                info.method == Some(method) && self.jacobian.wrt_kind(wrt) != Some(WrtKind::Output)
            })
            .map(|(key, _)| key.clone())
            .collect()
    }

    fn check_first_linearize(&mut self) {
        if !self.first_linearize {
            return;
        }
        self.first_linearize = false;
        for method in self.approx_schemes.keys() {
            let keys = self.approx_keys(*method);
            if keys.is_empty() {
                warn!(path = %self.path, %method, "approximation scheme has no sub-jacobians to compute");
            } else {
                debug!(path = %self.path, %method, count = keys.len(), "approximating sub-jacobians");
            }
        }
    }

    /// Computes the Jacobian: approximations first, then `compute_partials`,
    /// so analytic values override approximated ones.
    pub fn linearize(&mut self, _sub_do_ln: bool) -> ComputeResult<()> {
        if !(self.has_compute_partials || !self.approx_schemes.is_empty()) {
            return Ok(());
        }
        self.check_first_linearize();
        let _span = debug_span!("linearize", path = %self.path).entered();

        self.unscaled(Unscaled::Nonlinear, |engine| {
            let root_only = engine.run_root_only();
            for (method, scheme) in &engine.approx_schemes {
                let keys = engine.approx_keys(*method);
                let mut target = EngineTarget {
                    component: &*engine.component,
                    comm: &*engine.comm,
                    path: &engine.path,
                    root_only,
                    inputs: &engine.inputs,
                    outputs: &engine.outputs,
                    residual_layout: engine.residuals.layout(),
                    discrete_inputs: &engine.discrete_inputs,
                    discrete_outputs: &engine.discrete_outputs,
                };
                scheme.compute_approximations(&mut target, &keys, &mut engine.jacobian)?;
            }
            if engine.has_compute_partials {
                engine.compute_partials_wrapper()?;
            }
            Ok(())
        })
    }
}

/// The component as seen by approximation schemes.
///
/// Evaluations work on copies of the vectors, so the engine state is left
/// untouched by perturbed calls.
struct EngineTarget<'a> {
    component: &'a dyn ExplicitComponent,
    comm: &'a dyn Communicator,
    path: &'a str,
    root_only: bool,
    inputs: &'a Vector,
    outputs: &'a Vector,
    residual_layout: &'a Arc<Layout>,
    discrete_inputs: &'a DiscreteVars,
    discrete_outputs: &'a DiscreteVars,
}

impl EngineTarget<'_> {
    fn evaluate(
        &self,
        op: &str,
        local: impl FnOnce() -> ComputeResult<Payload>,
    ) -> ComputeResult<Payload> {
        if self.root_only {
            run_on_root(self.comm, self.path, op, local)
        } else {
            local()
        }
    }
}

impl ApproxTarget for EngineTarget<'_> {
    fn input_values(&self) -> &[f64] {
        self.inputs.as_slice()
    }

    fn input_range(&self, name: &str) -> Option<std::ops::Range<usize>> {
        self.inputs.layout().range(name)
    }

    fn output_range(&self, name: &str) -> Option<std::ops::Range<usize>> {
        self.outputs.layout().range(name).or_else(|| self.residual_layout.range(name))
    }

    fn eval(&mut self, x: &[f64]) -> ComputeResult<Vec<f64>> {
        let mut inputs = self.inputs.clone();
        inputs.set_val(x)?;
        let mut outputs = self.outputs.clone();
        let mut discrete_outputs = self.discrete_outputs.clone();
        let payload = self.evaluate("approx_fd", || {
            call_compute(self.component, &inputs, &mut outputs, self.discrete_inputs, &mut discrete_outputs)?;
            Ok(Payload::Reals(outputs.as_slice().to_vec()))
        })?;
        match payload {
            Payload::Reals(values) => Ok(values),
            _ => Err(CommError::UnexpectedPayload { expected: "reals" }.into()),
        }
    }

    fn eval_complex(&mut self, x: &[Complex64]) -> ComputeResult<Vec<Complex64>> {
        let mut inputs = self.inputs.clone();
        inputs.set_complex_step(true);
        let re: Vec<f64> = x.iter().map(|v| v.re).collect();
        inputs.set_val(&re)?;
        if let Some(imag) = inputs.imag_mut() {
            imag.iter_mut().zip(x).for_each(|(i, v)| *i = v.im);
        }
        let mut outputs = self.outputs.clone();
        outputs.set_complex_step(true);

        let path = self.path;
        let payload = self.evaluate("approx_cs", || {
            self.component.compute_complex(&inputs, &mut outputs).map_err(|err| match err {
                ComputeError::ComplexStepUnsupported(_) => ComputeError::ComplexStepUnsupported(path.to_string()),
                err => err,
            })?;
            Ok(Payload::Outputs {
                values: outputs.as_slice().to_vec(),
                imag: outputs.imag().map(<[f64]>::to_vec),
                discrete: DiscreteVars::new(),
            })
        })?;
        match payload {
            Payload::Outputs { values, imag, .. } => {
                let imag = imag.unwrap_or_else(|| vec![0.0; values.len()]);
                Ok(values.iter().zip(&imag).map(|(&re, &im)| Complex64::new(re, im)).collect())
            }
            _ => Err(CommError::UnexpectedPayload { expected: "outputs" }.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::SerialComm;
    use crate::component::{InputSpec, OutputSpec, ResidualSpec};

    /// y = 2x
    struct Doubler {
        analytic: bool,
    }

    impl ExplicitComponent for Doubler {
        fn setup(&mut self, builder: &mut ComponentBuilder) -> Result<(), SetupError> {
            builder.add_input("x", InputSpec::scalar(3.0))?;
            builder.add_output("y", OutputSpec::scalar(0.0))?;
            if self.analytic {
                builder.declare_partials("y", "x", PartialsSpec::dense())?;
                builder.declare_capability(Capability::ComputePartials);
            } else {
                builder.declare_partials("y", "x", PartialsSpec::dense().with_method(ApproxMethod::Fd))?;
            }
            Ok(())
        }

        fn compute(&self, inputs: &Vector, outputs: &mut Vector) -> ComputeResult<()> {
            let x = inputs.get("x")?[0];
            outputs.set("y", &[2.0 * x])?;
            Ok(())
        }

        fn compute_partials(
            &self,
            _inputs: &Vector,
            partials: &mut dyn Jacobian,
            _discrete_inputs: &DiscreteVars,
        ) -> ComputeResult<()> {
            partials.set("y", "x", &[2.0])?;
            Ok(())
        }
    }

    fn engine(analytic: bool) -> ExplicitEngine {
        ExplicitEngine::setup("comp", Doubler { analytic }, ComponentOptions::default(), Arc::new(SerialComm))
            .unwrap()
    }

    #[test]
    fn test_class_name() {
        assert_eq!(engine(true).class(), "Doubler");
        assert_eq!(short_type_name::<Vec<f64>>(), "Vec");
    }

    #[test]
    fn test_self_block_is_negative_identity() {
        let engine = engine(true);
        let info = engine.jacobian().info("y", "y").unwrap();
        assert!(info.is_diagonal());
        assert_eq!(info.val, vec![-1.0]);
        assert_eq!(info.method, None);
    }

    #[test]
    fn test_apply_nonlinear_restores_outputs() {
        let mut engine = engine(true);
        engine.outputs_mut().set("y", &[5.0]).unwrap();
        engine.apply_nonlinear().unwrap();
        assert_eq!(engine.residuals().get("y").unwrap(), &[6.0 - 5.0]);
        assert_eq!(engine.outputs().get("y").unwrap(), &[5.0]);
        assert_eq!(engine.iter_count_apply(), 1);
        assert_eq!(engine.iter_count(), 0);
    }

    #[test]
    fn test_solve_nonlinear_counts_iterations() {
        let mut engine = engine(true);
        engine.solve_nonlinear().unwrap();
        engine.solve_nonlinear().unwrap();
        assert_eq!(engine.outputs().get("y").unwrap(), &[6.0]);
        assert_eq!(engine.residuals().get("y").unwrap(), &[0.0]);
        assert_eq!(engine.iter_count(), 2);
    }

    #[test]
    fn test_fd_linearize() {
        let mut engine = engine(false);
        engine.linearize(false).unwrap();
        let val = engine.jacobian().get("y", "x").unwrap()[0];
        assert!((val - 2.0).abs() < 1e-6, "got {val}");
    }

    #[test]
    fn test_solve_linear_negates() {
        let mut engine = engine(true);
        engine.d_residuals_mut().set("y", &[4.0]).unwrap();
        engine.solve_linear(Mode::Fwd, None).unwrap();
        assert_eq!(engine.d_outputs().get("y").unwrap(), &[-4.0]);

        engine.d_outputs_mut().set("y", &[1.5]).unwrap();
        engine.solve_linear(Mode::Rev, None).unwrap();
        assert_eq!(engine.d_residuals().get("y").unwrap(), &[-1.5]);
    }

    struct Scaled;

    impl ExplicitComponent for Scaled {
        fn setup(&mut self, builder: &mut ComponentBuilder) -> Result<(), SetupError> {
            builder.add_input("x", InputSpec::scalar(3.0))?;
            builder.add_output("y", OutputSpec::scalar(0.0).with_ref(10.0).with_res_ref(100.0))?;
            Ok(())
        }

        fn compute(&self, inputs: &Vector, outputs: &mut Vector) -> ComputeResult<()> {
            outputs.set("y", &[2.0 * inputs.get("x")?[0]])?;
            Ok(())
        }
    }

    #[test]
    fn test_user_code_sees_physical_values() {
        let mut engine =
            ExplicitEngine::setup("scaled", Scaled, ComponentOptions::default(), Arc::new(SerialComm)).unwrap();
        engine.solve_nonlinear().unwrap();
        assert!((engine.outputs().get("y").unwrap()[0] - 0.6).abs() < 1e-12);
        assert!((engine.output_value("y").unwrap()[0] - 6.0).abs() < 1e-12);
    }

    /// Matrix-free y = 3x with y scaled by ref = 10.
    struct ScaledFree;

    impl ExplicitComponent for ScaledFree {
        fn setup(&mut self, builder: &mut ComponentBuilder) -> Result<(), SetupError> {
            builder.add_input("x", InputSpec::scalar(1.0))?;
            builder.add_output("y", OutputSpec::scalar(0.0).with_ref(10.0))?;
            builder.declare_capability(Capability::JacvecProduct);
            Ok(())
        }

        fn compute(&self, inputs: &Vector, outputs: &mut Vector) -> ComputeResult<()> {
            outputs.set("y", &[3.0 * inputs.get("x")?[0]])?;
            Ok(())
        }

        fn compute_jacvec_product(
            &self,
            _inputs: &Vector,
            d_inputs: &mut Vector,
            d_outputs: &mut Vector,
            mode: Mode,
            _discrete_inputs: &DiscreteVars,
        ) -> ComputeResult<()> {
            if mode == Mode::Fwd {
                let dx = d_inputs.get("x")?[0];
                d_outputs.add("y", &[3.0 * dx])?;
            }
            Ok(())
        }
    }

    #[test]
    fn test_matrix_free_identity_uses_stored_d_outputs() {
        let mut engine =
            ExplicitEngine::setup("free", ScaledFree, ComponentOptions::default(), Arc::new(SerialComm))
                .unwrap();
        engine.d_inputs_mut().set("x", &[1.0]).unwrap();
        engine.d_outputs_mut().set("y", &[2.0]).unwrap();
        engine.apply_linear(None, None, Mode::Fwd, None, None).unwrap();

        // Unscaled d_residuals: 3 * 1 - 2, stored divided by res_ref = 10.
        assert!((engine.d_residuals().get("y").unwrap()[0] - 0.1).abs() < 1e-12);
        assert_eq!(engine.d_outputs().get("y").unwrap(), &[2.0]);
    }

    #[test]
    fn test_residual_name_taken_by_output() {
        struct Clash;
        impl ExplicitComponent for Clash {
            fn setup(&mut self, builder: &mut ComponentBuilder) -> Result<(), SetupError> {
                builder.add_output("a", OutputSpec::scalar(0.0))?;
                builder.add_output("b", OutputSpec::with_shape(&[2]))?;
                builder.add_residual("b", ResidualSpec::with_shape(&[1]))?;
                builder.add_residual("r", ResidualSpec::with_shape(&[2]))?;
                Ok(())
            }
            fn compute(&self, _inputs: &Vector, _outputs: &mut Vector) -> ComputeResult<()> {
                Ok(())
            }
        }
        let err = ExplicitEngine::setup("c", Clash, ComponentOptions::default(), Arc::new(SerialComm))
            .unwrap_err();
        assert_eq!(err.to_string(), "'c' <class Clash>: Residual name 'b' is already used by an output.");
    }

    struct Renamed {
        residual_sizes: Vec<usize>,
    }

    impl ExplicitComponent for Renamed {
        fn setup(&mut self, builder: &mut ComponentBuilder) -> Result<(), SetupError> {
            builder.add_input("mm", InputSpec::scalar(1.0))?;
            builder.add_output("Re", OutputSpec::with_shape(&[1, 1]))?;
            builder.add_output("temp", OutputSpec::with_shape(&[1, 1]))?;
            for (i, size) in self.residual_sizes.iter().enumerate() {
                builder.add_residual(&format!("res{}", i + 1), ResidualSpec::with_shape(&[*size]))?;
            }
            Ok(())
        }

        fn compute(&self, _inputs: &Vector, _outputs: &mut Vector) -> ComputeResult<()> {
            Ok(())
        }
    }

    #[test]
    fn test_renamed_residual_size_mismatch() {
        let err = ExplicitEngine::setup(
            "MyComp",
            Renamed { residual_sizes: vec![1, 2] },
            ComponentOptions::default(),
            Arc::new(SerialComm),
        )
        .unwrap_err();
        assert_eq!(
            err.to_string(),
            "'MyComp' <class Renamed>: The number of residuals (3) doesn't match number of outputs (2).  If any residuals are added using 'add_residuals', their total size must match the total size of the outputs."
        );
    }

    #[test]
    fn test_renamed_residual_layout() {
        let engine = ExplicitEngine::setup(
            "MyComp",
            Renamed { residual_sizes: vec![1, 1] },
            ComponentOptions::default(),
            Arc::new(SerialComm),
        )
        .unwrap();
        assert_eq!(engine.residuals().layout().names(), &["res1".to_string(), "res2".to_string()]);
        assert!(engine.jacobian().contains("temp", "temp"));
    }

    #[test]
    fn test_unknown_partials_pattern() {
        struct Bad;
        impl ExplicitComponent for Bad {
            fn setup(&mut self, builder: &mut ComponentBuilder) -> Result<(), SetupError> {
                builder.add_input("x", InputSpec::scalar(1.0))?;
                builder.add_output("y", OutputSpec::scalar(1.0))?;
                builder.declare_partials("y", "z*", PartialsSpec::dense())?;
                Ok(())
            }
            fn compute(&self, _inputs: &Vector, _outputs: &mut Vector) -> ComputeResult<()> {
                Ok(())
            }
        }
        let err = ExplicitEngine::setup("c", Bad, ComponentOptions::default(), Arc::new(SerialComm))
            .unwrap_err();
        assert!(matches!(err, SetupError::NoMatchingVariables { arg: "wrt", .. }));
    }
}
