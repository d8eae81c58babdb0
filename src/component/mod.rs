//! Explicit components: user contract, declarations and execution engine.
//!
//! An explicit component computes its outputs as a closed-form function of
//! its inputs. The user implements [`ExplicitComponent`]; the framework wraps
//! it in an [`ExplicitEngine`] that owns the component's vectors and Jacobian
//! and exposes the residual-based operations used by solvers:
//!
//! - [`ExplicitEngine::apply_nonlinear`]: `R = compute(x) - y`
//! - [`ExplicitEngine::solve_nonlinear`]: `y = compute(x)`
//! - [`ExplicitEngine::linearize`]: approximations, then analytic partials
//! - [`ExplicitEngine::apply_linear`] / [`ExplicitEngine::solve_linear`]
//!
//! # Declaring a component
//!
//! ```
//! use std::sync::Arc;
//! use tessera::comm::SerialComm;
//! use tessera::component::*;
//! use tessera::vector::Vector;
//!
//! struct Doubler;
//!
//! impl ExplicitComponent for Doubler {
//!     fn setup(&mut self, builder: &mut ComponentBuilder) -> Result<(), SetupError> {
//!         builder.add_input("x", InputSpec::scalar(3.0))?;
//!         builder.add_output("y", OutputSpec::scalar(0.0))?;
//!         builder.declare_partials("y", "x", PartialsSpec::dense().with_val(&[2.0]))?;
//!         Ok(())
//!     }
//!
//!     fn compute(&self, inputs: &Vector, outputs: &mut Vector) -> ComputeResult<()> {
//!         let x = inputs.get("x")?[0];
//!         outputs.set("y", &[2.0 * x])?;
//!         Ok(())
//!     }
//! }
//!
//! let mut engine =
//!     ExplicitEngine::setup("comp", Doubler, ComponentOptions::default(), Arc::new(SerialComm))
//!         .unwrap();
//! engine.solve_nonlinear().unwrap();
//! assert_eq!(engine.outputs().get("y").unwrap(), &[6.0]);
//! ```

mod cache;
pub mod engine;

pub use cache::ExecutionState;
pub use engine::ExplicitEngine;

use std::collections::{BTreeMap, BTreeSet};
use std::error::Error;

use crate::approx::{ApproxMethod, ApproximationScheme, ComplexStep, FiniteDifference};
use crate::comm::CommError;
use crate::jacobian::{Jacobian, JacobianError};
use crate::units::{validate_units, UnitsError};
use crate::vector::{DiscreteValue, DiscreteVars, Vector, VectorError};
use crate::Mode;

/// Result type for component execution.
pub type ComputeResult<T> = Result<T, ComputeError>;

/// Structural errors raised while setting up a component or a group.
///
/// Every variant carries the path of the failing system and its class so the
/// message reads `'path' <class Type>: ...`.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SetupError {
    #[error(
        "'{path}' <class {class}>: The number of residuals ({residuals}) doesn't match number of outputs ({outputs}).  If any residuals are added using 'add_residuals', their total size must match the total size of the outputs."
    )]
    ResidualSizeMismatch { path: String, class: String, residuals: usize, outputs: usize },

    #[error(
        "'{path}' <class {class}>: When adding {kind} '{name}', expected shape {expected} but got shape {found} for argument '{arg}'."
    )]
    ScalingShape {
        path: String,
        class: String,
        kind: &'static str,
        name: String,
        arg: &'static str,
        expected: String,
        found: String,
    },

    #[error("'{path}' <class {class}>: {source}")]
    Units {
        path: String,
        class: String,
        #[source]
        source: UnitsError,
    },

    #[error(
        "'{path}' <class {class}>: Default value of '{name}' has {found} entries but the variable has {expected}."
    )]
    ValueSize { path: String, class: String, name: String, expected: usize, found: usize },

    #[error("'{path}' <class {class}>: Variable name '{name}' already exists.")]
    DuplicateVariable { path: String, class: String, name: String },

    #[error("'{path}' <class {class}>: Residual name '{name}' is already used by an output.")]
    ResidualNameConflict { path: String, class: String, name: String },

    #[error("'{path}' <class {class}>: No matches were found for {arg}='{pattern}'.")]
    NoMatchingVariables { path: String, class: String, arg: &'static str, pattern: String },

    #[error("'{path}' <class {class}>: d({of})/d({wrt}): {reason}")]
    InvalidPartials { path: String, class: String, of: String, wrt: String, reason: String },

    #[error(
        "'{path}' <class {class}>: Complex step was requested but the component does not declare the complex-step capability."
    )]
    ComplexStepUnsupported { path: String, class: String },

    #[error(
        "'{path}' <class {class}>: Can't set 'run_root_only' option when a component has distributed variables."
    )]
    RootOnlyDistributed { path: String, class: String },

    #[error(
        "'{path}' <class Group>: Can't connect distributed output '{src}' to non-distributed input '{tgt}' without declaring src_indices."
    )]
    DistributedToNonDistributed { path: String, src: String, tgt: String },
}

/// Errors raised while executing a component.
#[derive(Debug, thiserror::Error)]
pub enum ComputeError {
    /// Error returned by a user function, passed through unchanged.
    #[error(transparent)]
    User(Box<dyn Error + Send + Sync>),
    #[error(transparent)]
    Vector(#[from] VectorError),
    #[error(transparent)]
    Jacobian(#[from] JacobianError),
    #[error(transparent)]
    Comm(#[from] CommError),
    #[error("'{0}': complex step evaluation is not implemented by this component")]
    ComplexStepUnsupported(String),
}

impl ComputeError {
    /// Wraps a user error.
    pub fn user(err: impl Into<Box<dyn Error + Send + Sync>>) -> Self {
        ComputeError::User(err.into())
    }
}

/// Optional operations a component implements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Capability {
    /// `compute_partials` fills the Jacobian analytically.
    ComputePartials,
    /// `compute_jacvec_product` applies the Jacobian (matrix-free).
    JacvecProduct,
    /// `compute_complex` evaluates the component on complex values.
    ComplexStep,
}

/// Contract implemented by explicit components.
///
/// Only [`setup`](ExplicitComponent::setup) and
/// [`compute`](ExplicitComponent::compute) are required. The optional
/// operations are only called when the matching [`Capability`] is declared
/// in `setup`.
pub trait ExplicitComponent: Send + Sync {
    /// Declares variables, partials and capabilities.
    fn setup(&mut self, builder: &mut ComponentBuilder) -> Result<(), SetupError>;

    /// Computes outputs from inputs. Values are unscaled.
    fn compute(&self, inputs: &Vector, outputs: &mut Vector) -> ComputeResult<()>;

    /// Computes outputs when the component declares discrete variables.
    fn compute_discrete(
        &self,
        inputs: &Vector,
        outputs: &mut Vector,
        _discrete_inputs: &DiscreteVars,
        _discrete_outputs: &mut DiscreteVars,
    ) -> ComputeResult<()> {
        self.compute(inputs, outputs)
    }

    /// Computes sub-Jacobians of the outputs with respect to the inputs.
    fn compute_partials(
        &self,
        _inputs: &Vector,
        _partials: &mut dyn Jacobian,
        _discrete_inputs: &DiscreteVars,
    ) -> ComputeResult<()> {
        Ok(())
    }

    /// Matrix-free Jacobian product.
    ///
    /// - `Mode::Fwd`: adds `J d_inputs` into `d_outputs`.
    /// - `Mode::Rev`: adds `J^T d_outputs` into `d_inputs`.
    fn compute_jacvec_product(
        &self,
        _inputs: &Vector,
        _d_inputs: &mut Vector,
        _d_outputs: &mut Vector,
        _mode: Mode,
        _discrete_inputs: &DiscreteVars,
    ) -> ComputeResult<()> {
        Ok(())
    }

    /// Computes outputs from complex inputs, reading and writing the
    /// imaginary shadows through [`Vector::get_complex`] and
    /// [`Vector::set_complex`].
    fn compute_complex(&self, _inputs: &Vector, _outputs: &mut Vector) -> ComputeResult<()> {
        Err(ComputeError::ComplexStepUnsupported(String::new()))
    }
}

/// A scaling argument: a scalar or an array matching the variable shape.
#[derive(Debug, Clone, PartialEq)]
pub enum ScaleArg {
    Scalar(f64),
    Array { shape: Vec<usize>, values: Vec<f64> },
}

impl From<f64> for ScaleArg {
    fn from(value: f64) -> Self {
        ScaleArg::Scalar(value)
    }
}

impl ScaleArg {
    /// A one-dimensional array argument.
    pub fn array(values: &[f64]) -> Self {
        ScaleArg::Array { shape: vec![values.len()], values: values.to_vec() }
    }

    /// Expands the argument to one value per entry of a variable of `shape`.
    fn expand(&self, shape: &[usize]) -> Result<Vec<f64>, String> {
        let size: usize = shape.iter().product();
        match self {
            ScaleArg::Scalar(v) => Ok(vec![*v; size]),
            ScaleArg::Array { shape: found, values } if found == shape && values.len() == size => {
                Ok(values.clone())
            }
            ScaleArg::Array { shape: found, .. } => Err(format_shape(found)),
        }
    }
}

/// Formats a shape the way tuples print: `(1,)`, `(1, 2)`.
pub(crate) fn format_shape(shape: &[usize]) -> String {
    match shape {
        [n] => format!("({n},)"),
        _ => {
            let dims: Vec<String> = shape.iter().map(usize::to_string).collect();
            format!("({})", dims.join(", "))
        }
    }
}

/// Declaration of an input.
#[derive(Debug, Clone, PartialEq)]
pub struct InputSpec {
    pub shape: Vec<usize>,
    pub val: Vec<f64>,
    pub units: Option<String>,
    pub distributed: Option<bool>,
}

impl InputSpec {
    /// A scalar input with a default value.
    pub fn scalar(val: f64) -> Self {
        InputSpec { shape: vec![1], val: vec![val], units: None, distributed: None }
    }

    /// A zero-filled input of the given shape.
    pub fn with_shape(shape: &[usize]) -> Self {
        let size = shape.iter().product();
        InputSpec { shape: shape.to_vec(), val: vec![0.0; size], units: None, distributed: None }
    }

    /// Sets the default value. A single value fills the variable.
    pub fn with_val(mut self, val: &[f64]) -> Self {
        self.val = val.to_vec();
        self
    }

    pub fn with_units(mut self, units: &str) -> Self {
        self.units = Some(units.to_string());
        self
    }

    pub fn with_distributed(mut self, distributed: bool) -> Self {
        self.distributed = Some(distributed);
        self
    }
}

/// Declaration of an output.
///
/// `ref_` and `ref0` are the physical values at which the scaled output is 1
/// and 0. `res_ref` scales the residual and defaults to `ref_`.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputSpec {
    pub shape: Vec<usize>,
    pub val: Vec<f64>,
    pub units: Option<String>,
    pub res_units: Option<String>,
    pub ref_: ScaleArg,
    pub ref0: ScaleArg,
    pub res_ref: Option<ScaleArg>,
    pub distributed: Option<bool>,
}

impl OutputSpec {
    /// A scalar output with a default value.
    pub fn scalar(val: f64) -> Self {
        OutputSpec {
            shape: vec![1],
            val: vec![val],
            units: None,
            res_units: None,
            ref_: ScaleArg::Scalar(1.0),
            ref0: ScaleArg::Scalar(0.0),
            res_ref: None,
            distributed: None,
        }
    }

    /// A zero-filled output of the given shape.
    pub fn with_shape(shape: &[usize]) -> Self {
        let size = shape.iter().product();
        OutputSpec { shape: shape.to_vec(), val: vec![0.0; size], ..Self::scalar(0.0) }
    }

    pub fn with_val(mut self, val: &[f64]) -> Self {
        self.val = val.to_vec();
        self
    }

    pub fn with_units(mut self, units: &str) -> Self {
        self.units = Some(units.to_string());
        self
    }

    pub fn with_res_units(mut self, units: &str) -> Self {
        self.res_units = Some(units.to_string());
        self
    }

    pub fn with_ref(mut self, ref_: impl Into<ScaleArg>) -> Self {
        self.ref_ = ref_.into();
        self
    }

    pub fn with_ref0(mut self, ref0: impl Into<ScaleArg>) -> Self {
        self.ref0 = ref0.into();
        self
    }

    pub fn with_res_ref(mut self, res_ref: impl Into<ScaleArg>) -> Self {
        self.res_ref = Some(res_ref.into());
        self
    }

    pub fn with_distributed(mut self, distributed: bool) -> Self {
        self.distributed = Some(distributed);
        self
    }
}

/// Declaration of a renamed residual.
#[derive(Debug, Clone, PartialEq)]
pub struct ResidualSpec {
    pub shape: Vec<usize>,
    pub units: Option<String>,
    pub ref_: ScaleArg,
}

impl ResidualSpec {
    pub fn with_shape(shape: &[usize]) -> Self {
        ResidualSpec { shape: shape.to_vec(), units: None, ref_: ScaleArg::Scalar(1.0) }
    }

    pub fn with_units(mut self, units: &str) -> Self {
        self.units = Some(units.to_string());
        self
    }

    pub fn with_ref(mut self, ref_: impl Into<ScaleArg>) -> Self {
        self.ref_ = ref_.into();
        self
    }
}

/// Declaration of a sub-Jacobian block.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PartialsSpec {
    pub rows: Option<Vec<usize>>,
    pub cols: Option<Vec<usize>>,
    pub val: Option<Vec<f64>>,
    pub method: Option<ApproxMethod>,
}

impl PartialsSpec {
    /// A dense block.
    pub fn dense() -> Self {
        Self::default()
    }

    /// A sparse block with the given nonzero coordinates.
    pub fn sparse(rows: &[usize], cols: &[usize]) -> Self {
        PartialsSpec { rows: Some(rows.to_vec()), cols: Some(cols.to_vec()), ..Self::default() }
    }

    /// Constant values of the block. A single value is broadcast.
    pub fn with_val(mut self, val: &[f64]) -> Self {
        self.val = Some(val.to_vec());
        self
    }

    /// Computes the block with an approximation scheme.
    pub fn with_method(mut self, method: ApproxMethod) -> Self {
        self.method = Some(method);
        self
    }
}

/// Metadata of a declared continuous variable.
#[derive(Debug, Clone, PartialEq)]
pub struct VarMeta {
    pub name: String,
    pub shape: Vec<usize>,
    pub size: usize,
    pub units: Option<String>,
    pub distributed: bool,
}

/// An output with its default value and expanded scaling arguments.
pub(crate) struct DeclaredOutput {
    pub(crate) meta: VarMeta,
    pub(crate) val: Vec<f64>,
    pub(crate) ref_: Vec<f64>,
    pub(crate) ref0: Vec<f64>,
    pub(crate) res_ref: Vec<f64>,
}

/// Collects a component's declarations during `setup`.
pub struct ComponentBuilder {
    path: String,
    class: String,
    default_distributed: bool,
    pub(crate) inputs: Vec<(VarMeta, Vec<f64>)>,
    pub(crate) outputs: Vec<DeclaredOutput>,
    pub(crate) residuals: Vec<(String, ResidualSpec, Vec<f64>)>,
    pub(crate) discrete_inputs: DiscreteVars,
    pub(crate) discrete_outputs: DiscreteVars,
    pub(crate) partials: Vec<(String, String, PartialsSpec)>,
    pub(crate) approx_schemes: BTreeMap<ApproxMethod, Box<dyn ApproximationScheme>>,
    pub(crate) capabilities: BTreeSet<Capability>,
    names: BTreeSet<String>,
}

impl ComponentBuilder {
    pub(crate) fn new(path: &str, class: &str, default_distributed: bool) -> Self {
        ComponentBuilder {
            path: path.to_string(),
            class: class.to_string(),
            default_distributed,
            inputs: Vec::new(),
            outputs: Vec::new(),
            residuals: Vec::new(),
            discrete_inputs: DiscreteVars::new(),
            discrete_outputs: DiscreteVars::new(),
            partials: Vec::new(),
            approx_schemes: BTreeMap::new(),
            capabilities: BTreeSet::new(),
            names: BTreeSet::new(),
        }
    }

    /// Path of the component being set up.
    pub fn path(&self) -> &str {
        &self.path
    }

    fn claim(&mut self, name: &str) -> Result<(), SetupError> {
        if !self.names.insert(name.to_string()) {
            return Err(SetupError::DuplicateVariable {
                path: self.path.clone(),
                class: self.class.clone(),
                name: name.to_string(),
            });
        }
        Ok(())
    }

    fn check_units(&self, units: Option<&str>) -> Result<(), SetupError> {
        match units {
            Some(units) => validate_units(units).map_err(|source| SetupError::Units {
                path: self.path.clone(),
                class: self.class.clone(),
                source,
            }),
            None => Ok(()),
        }
    }

    fn expand_scale(
        &self,
        kind: &'static str,
        name: &str,
        arg: &'static str,
        value: &ScaleArg,
        shape: &[usize],
    ) -> Result<Vec<f64>, SetupError> {
        value.expand(shape).map_err(|found| SetupError::ScalingShape {
            path: self.path.clone(),
            class: self.class.clone(),
            kind,
            name: name.to_string(),
            arg,
            expected: format_shape(shape),
            found,
        })
    }

    fn expand_val(&self, name: &str, val: &[f64], size: usize) -> Result<Vec<f64>, SetupError> {
        match val.len() {
            1 => Ok(vec![val[0]; size]),
            n if n == size => Ok(val.to_vec()),
            n => Err(SetupError::ValueSize {
                path: self.path.clone(),
                class: self.class.clone(),
                name: name.to_string(),
                expected: size,
                found: n,
            }),
        }
    }

    /// Adds a continuous input.
    pub fn add_input(&mut self, name: &str, spec: InputSpec) -> Result<&mut Self, SetupError> {
        self.check_units(spec.units.as_deref())?;
        let size: usize = spec.shape.iter().product();
        let val = self.expand_val(name, &spec.val, size)?;
        self.claim(name)?;
        let meta = VarMeta {
            name: name.to_string(),
            shape: spec.shape,
            size,
            units: spec.units,
            distributed: spec.distributed.unwrap_or(self.default_distributed),
        };
        self.inputs.push((meta, val));
        Ok(self)
    }

    /// Adds a continuous output.
    pub fn add_output(&mut self, name: &str, spec: OutputSpec) -> Result<&mut Self, SetupError> {
        self.check_units(spec.units.as_deref())?;
        self.check_units(spec.res_units.as_deref())?;
        let ref_ = self.expand_scale("output", name, "ref", &spec.ref_, &spec.shape)?;
        let ref0 = self.expand_scale("output", name, "ref0", &spec.ref0, &spec.shape)?;
        let res_ref = match &spec.res_ref {
            Some(res_ref) => self.expand_scale("output", name, "res_ref", res_ref, &spec.shape)?,
            None => ref_.clone(),
        };
        let size: usize = spec.shape.iter().product();
        let val = self.expand_val(name, &spec.val, size)?;
        self.claim(name)?;
        let meta = VarMeta {
            name: name.to_string(),
            shape: spec.shape,
            size,
            units: spec.units,
            distributed: spec.distributed.unwrap_or(self.default_distributed),
        };
        self.outputs.push(DeclaredOutput { meta, val, ref_, ref0, res_ref });
        Ok(self)
    }

    /// Adds a renamed residual. Once any residual is added, the residual
    /// vector is laid out by residual names and its total size must match
    /// the total output size.
    pub fn add_residual(&mut self, name: &str, spec: ResidualSpec) -> Result<&mut Self, SetupError> {
        self.check_units(spec.units.as_deref())?;
        let scaler = self.expand_scale("residual", name, "ref", &spec.ref_, &spec.shape)?;
        if self.residuals.iter().any(|(existing, ..)| existing == name) {
            return Err(SetupError::DuplicateVariable {
                path: self.path.clone(),
                class: self.class.clone(),
                name: name.to_string(),
            });
        }
        self.residuals.push((name.to_string(), spec, scaler));
        Ok(self)
    }

    /// Adds a discrete input.
    pub fn add_discrete_input(
        &mut self,
        name: &str,
        val: DiscreteValue,
    ) -> Result<&mut Self, SetupError> {
        self.claim(name)?;
        self.discrete_inputs.insert(name.to_string(), val);
        Ok(self)
    }

    /// Adds a discrete output.
    pub fn add_discrete_output(
        &mut self,
        name: &str,
        val: DiscreteValue,
    ) -> Result<&mut Self, SetupError> {
        self.claim(name)?;
        self.discrete_outputs.insert(name.to_string(), val);
        Ok(self)
    }

    /// Declares sub-Jacobians `d(of)/d(wrt)`. Both names accept `*` and `?`
    /// wildcards; patterns are resolved once every variable is known.
    pub fn declare_partials(
        &mut self,
        of: &str,
        wrt: &str,
        spec: PartialsSpec,
    ) -> Result<&mut Self, SetupError> {
        if let Some(method) = spec.method {
            self.approx_schemes.entry(method).or_insert_with(|| match method {
                ApproxMethod::Fd => Box::new(FiniteDifference::default()),
                ApproxMethod::Cs => Box::new(ComplexStep::default()),
            });
        }
        self.partials.push((of.to_string(), wrt.to_string(), spec));
        Ok(self)
    }

    /// Replaces the scheme used for one approximation method.
    pub fn set_approx_scheme(&mut self, scheme: impl ApproximationScheme + 'static) -> &mut Self {
        self.approx_schemes.insert(scheme.method(), Box::new(scheme));
        self
    }

    /// Declares an optional operation implemented by the component.
    pub fn declare_capability(&mut self, capability: Capability) -> &mut Self {
        self.capabilities.insert(capability);
        self
    }
}

/// Matches a name against a pattern with `*` and `?` wildcards.
pub(crate) fn glob_match(pattern: &str, name: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let n: Vec<char> = name.chars().collect();
    let (mut pi, mut ni) = (0, 0);
    let mut star: Option<(usize, usize)> = None;
    while ni < n.len() {
        match p.get(pi) {
            Some('*') => {
                star = Some((pi, ni));
                pi += 1;
            }
            Some(&c) if c == '?' || c == n[ni] => {
                pi += 1;
                ni += 1;
            }
            _ => match star {
                Some((sp, sn)) => {
                    pi = sp + 1;
                    ni = sn + 1;
                    star = Some((sp, sn + 1));
                }
                None => return false,
            },
        }
    }
    p[pi..].iter().all(|&c| c == '*')
}

/// Behavior options of a component.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ComponentOptions {
    /// Run user functions on rank 0 only and broadcast the results.
    pub run_root_only: bool,
    /// Reuse the last matrix-free product while inputs and seeds are unchanged.
    pub matrix_free_caching: bool,
    /// Default distributed flag of the component's variables.
    pub distributed: bool,
}

impl ComponentOptions {
    pub fn with_run_root_only(mut self, run_root_only: bool) -> Self {
        self.run_root_only = run_root_only;
        self
    }

    pub fn with_matrix_free_caching(mut self, caching: bool) -> Self {
        self.matrix_free_caching = caching;
        self
    }

    pub fn with_distributed(mut self, distributed: bool) -> Self {
        self.distributed = distributed;
        self
    }
}
