//! Seed-change detection for matrix-free products.

use crate::vector::Vector;
use crate::Mode;

/// Per-component record of the last matrix-free product.
///
/// The cached contribution is valid only while the hashes of the nonlinear
/// inputs and of the active seed vector, and the derivative mode, all match
/// the previous call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutionState {
    last_input_hash: Option<u64>,
    last_dinput_hash: Option<u64>,
    last_doutput_hash: Option<u64>,
    last_mode: Option<Mode>,
    linop_cache: Option<Vec<f64>>,
}

impl ExecutionState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if `inputs` and `d_inputs` (fwd) or `d_outputs` (rev), or
    /// the mode, differ from the previous call. Always records the new state.
    pub fn seed_changed(
        &mut self,
        inputs: &Vector,
        d_inputs: &Vector,
        d_outputs: &Vector,
        mode: Mode,
    ) -> bool {
        let input_hash = inputs.get_hash();
        let mut changed = self.last_input_hash != Some(input_hash);
        match mode {
            Mode::Fwd => {
                let hash = d_inputs.get_hash();
                changed |= self.last_dinput_hash != Some(hash);
                self.last_dinput_hash = Some(hash);
            }
            Mode::Rev => {
                let hash = d_outputs.get_hash();
                changed |= self.last_doutput_hash != Some(hash);
                self.last_doutput_hash = Some(hash);
            }
        }
        changed |= self.last_mode != Some(mode);
        self.last_input_hash = Some(input_hash);
        self.last_mode = Some(mode);
        changed
    }

    /// Stores the contribution of the last product.
    pub fn cache_product(&mut self, contribution: &[f64]) {
        match &mut self.linop_cache {
            Some(cache) if cache.len() == contribution.len() => cache.copy_from_slice(contribution),
            slot => *slot = Some(contribution.to_vec()),
        }
    }

    /// Contribution of the last product, if any.
    pub fn cached_product(&self) -> Option<&[f64]> {
        self.linop_cache.as_deref()
    }

    /// Forgets everything, forcing the next product to be recomputed.
    pub fn invalidate(&mut self) {
        *self = Self::default();
    }

    pub fn last_mode(&self) -> Option<Mode> {
        self.last_mode
    }
}
