//! Automatic differentiation support using `num-dual`.
//!
//! Exact derivatives for use inside
//! [`compute_partials`](crate::component::ExplicitComponent::compute_partials)
//! and
//! [`compute_jacvec_product`](crate::component::ExplicitComponent::compute_jacvec_product):
//! write the component's math once over `Dual64` and differentiate it here.
//!
//! # Example
//!
//! ```ignore
//! use tessera::autodiff::*;
//! use num_dual::Dual64;
//!
//! // Jacobian of f(x, y) = [x^2, xy]
//! let f = |vars: &[Dual64]| vec![vars[0] * vars[0], vars[0] * vars[1]];
//! let jac = jacobian_dual(f, &[2.0, 3.0]);
//! assert_eq!(jac[(1, 0)], 3.0);
//! ```

use nalgebra::DMatrix;
use num_dual::*;

use crate::jacobian::{Jacobian, JacobianError};

/// Computes the dense Jacobian of `f` at `x` with forward-mode AD, one pass
/// per column.
pub fn jacobian_dual<F>(f: F, x: &[f64]) -> DMatrix<f64>
where
    F: Fn(&[Dual64]) -> Vec<Dual64>,
{
    let mut columns: Vec<Vec<f64>> = Vec::with_capacity(x.len());
    for j in 0..x.len() {
        let mut x_dual: Vec<Dual64> = x.iter().map(|&v| Dual64::from(v)).collect();
        x_dual[j] = Dual64::from(x[j]).derivative();
        columns.push(f(&x_dual).iter().map(|r| r.eps).collect());
    }

    let n_eqs = columns.first().map_or(0, Vec::len);
    DMatrix::from_fn(n_eqs, x.len(), |i, j| columns[j][i])
}

/// Jacobian-vector product `J(x) v` in a single forward pass.
pub fn jvp_dual<F>(f: F, x: &[f64], v: &[f64]) -> Vec<f64>
where
    F: Fn(&[Dual64]) -> Vec<Dual64>,
{
    let x_dual: Vec<Dual64> = x.iter().zip(v).map(|(&xi, &vi)| Dual64::new(xi, vi)).collect();
    f(&x_dual).iter().map(|r| r.eps).collect()
}

/// Vector-Jacobian product `J(x)^T w`, through the full Jacobian.
pub fn vjp_dual<F>(f: F, x: &[f64], w: &[f64]) -> Vec<f64>
where
    F: Fn(&[Dual64]) -> Vec<Dual64>,
{
    let jac = jacobian_dual(f, x);
    (0..jac.ncols()).map(|j| jac.column(j).iter().zip(w).map(|(a, b)| a * b).sum()).collect()
}

/// Writes a dense block into a declared sub-Jacobian, in row-major order.
pub fn set_dense_partials(
    partials: &mut dyn Jacobian,
    of: &str,
    wrt: &str,
    block: &DMatrix<f64>,
) -> Result<(), JacobianError> {
    // Column-major storage of the transpose is the row-major block.
    partials.set(of, wrt, block.transpose().as_slice())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jacobian::{DictionaryJacobian, SubjacInfo, WrtKind};
    use std::collections::HashMap;

    fn f(vars: &[Dual64]) -> Vec<Dual64> {
        let x = vars[0];
        let y = vars[1];
        vec![x * x, x * y]
    }

    #[test]
    fn test_jacobian_dual_simple() {
        let jac = jacobian_dual(f, &[2.0, 3.0]);

        // [[2x, 0], [y, x]] at (2, 3)
        assert_eq!(jac.shape(), (2, 2));
        assert!((jac[(0, 0)] - 4.0).abs() < 1e-12);
        assert!((jac[(0, 1)] - 0.0).abs() < 1e-12);
        assert!((jac[(1, 0)] - 3.0).abs() < 1e-12);
        assert!((jac[(1, 1)] - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_jvp_and_vjp_match_jacobian() {
        let jvp = jvp_dual(f, &[2.0, 3.0], &[1.0, -1.0]);
        assert!((jvp[0] - 4.0).abs() < 1e-12);
        assert!((jvp[1] - 1.0).abs() < 1e-12);

        let vjp = vjp_dual(f, &[2.0, 3.0], &[1.0, 2.0]);
        assert!((vjp[0] - 10.0).abs() < 1e-12);
        assert!((vjp[1] - 4.0).abs() < 1e-12);
    }

    #[test]
    fn test_set_dense_partials_row_major() {
        let rows = HashMap::from([("y".to_string(), 0..2)]);
        let cols = HashMap::from([("x".to_string(), (WrtKind::Input, 0..2))]);
        let mut jac = DictionaryJacobian::new(rows, cols);
        jac.declare("y", "x", SubjacInfo::dense((2, 2)));

        let block = jacobian_dual(f, &[2.0, 3.0]);
        set_dense_partials(&mut jac, "y", "x", &block).unwrap();
        assert_eq!(jac.get("y", "x").unwrap(), &[4.0, 0.0, 3.0, 2.0]);
    }
}
