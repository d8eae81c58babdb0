//! # Tessera: Explicit Components and Distributed Transfers
//!
//! Building blocks for executing multidisciplinary models on one process or
//! on a static group of cooperating processes:
//!
//! - [`component`]: the execution engine of explicit components. A component
//!   computes outputs from inputs; the engine wraps it with scaling, the
//!   `R = compute(x) - y` residual, Jacobian bookkeeping, matrix-free products
//!   with seed-change caching and root-only execution.
//! - [`transfer`]: the planner computing the index correspondence between
//!   sources and targets across ranks, and the executor moving data along
//!   those plans in forward and reverse mode.
//!
//! Supporting modules:
//!
//! - [`vector`]: process-local segments of system-wide arrays
//! - [`jacobian`]: the Jacobian access contract and a block dictionary
//! - [`approx`]: finite-difference and complex-step approximations
//! - [`comm`]: process groups and collective calls
//! - [`units`]: unit string validation
//!
//! ## Example
//!
//! ```
//! use std::sync::Arc;
//! use tessera::comm::SerialComm;
//! use tessera::component::*;
//! use tessera::vector::Vector;
//! use tessera::Mode;
//!
//! struct Paraboloid;
//!
//! impl ExplicitComponent for Paraboloid {
//!     fn setup(&mut self, b: &mut ComponentBuilder) -> Result<(), SetupError> {
//!         b.add_input("x", InputSpec::scalar(3.0))?;
//!         b.add_output("f", OutputSpec::scalar(0.0))?;
//!         b.declare_partials("f", "x", PartialsSpec::dense())?;
//!         b.declare_capability(Capability::ComputePartials);
//!         Ok(())
//!     }
//!
//!     fn compute(&self, inputs: &Vector, outputs: &mut Vector) -> ComputeResult<()> {
//!         let x = inputs.get("x")?[0];
//!         outputs.set("f", &[x * x])?;
//!         Ok(())
//!     }
//!
//!     fn compute_partials(
//!         &self,
//!         inputs: &Vector,
//!         partials: &mut dyn tessera::jacobian::Jacobian,
//!         _discrete: &tessera::vector::DiscreteVars,
//!     ) -> ComputeResult<()> {
//!         partials.set("f", "x", &[2.0 * inputs.get("x")?[0]])?;
//!         Ok(())
//!     }
//! }
//!
//! let mut engine = ExplicitEngine::setup(
//!     "parab",
//!     Paraboloid,
//!     ComponentOptions::default(),
//!     Arc::new(SerialComm),
//! )
//! .unwrap();
//!
//! engine.solve_nonlinear().unwrap();
//! engine.linearize(false).unwrap();
//!
//! // Forward derivative of f with respect to x.
//! engine.d_inputs_mut().set("x", &[1.0]).unwrap();
//! engine.apply_linear(None, None, Mode::Fwd, None, None).unwrap();
//! assert_eq!(engine.d_residuals().get("f").unwrap(), &[6.0]);
//! ```
//!
//! ## Optional Features
//!
//! - **`autodiff`**: exact Jacobians and Jacobian-vector products with
//!   `num-dual`, for use inside `compute_partials` and
//!   `compute_jacvec_product`.

use std::fmt;

pub mod approx;
pub mod comm;
pub mod component;
pub mod jacobian;
pub mod transfer;
pub mod units;
pub mod vector;

#[cfg(feature = "autodiff")]
pub mod autodiff;

pub use comm::{CommError, Communicator, SerialComm, ThreadComm};
pub use component::{
    ComponentOptions, ComputeError, ComputeResult, ExplicitComponent, ExplicitEngine, SetupError,
};
pub use transfer::{plan_transfers, Transfer, TransferError, TransferPlan, TransferSet};
pub use vector::{Vector, VectorKind};

/// Direction of derivative propagation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mode {
    /// Forward: seeds on inputs, sensitivities on outputs.
    Fwd,
    /// Reverse (adjoint): seeds on outputs, sensitivities on inputs.
    Rev,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Fwd => write!(f, "fwd"),
            Mode::Rev => write!(f, "rev"),
        }
    }
}
