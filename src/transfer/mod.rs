//! # Distributed Transfers
//!
//! Moving data from source outputs to connected target inputs when both live
//! in rank-major global arrays spread across a process group.
//!
//! - [`layout`]: rank × variable size and offset tables
//! - [`planner`]: index correspondences per connection and direction, grouped
//!   by child subsystem, plus the full-system plan
//! - [`executor`]: scatter handles performing the data movement
//! - [`relevance`]: derivative relevance between design variables and
//!   responses, used to flag inputs of approximated groups
//!
//! ## Example
//!
//! ```
//! use std::sync::Arc;
//! use tessera::comm::SerialComm;
//! use tessera::transfer::*;
//! use tessera::vector::VectorKind;
//! use tessera::Mode;
//!
//! let outputs = IoTable::new(1, vec![VarSpec::duplicated("src.y", 2, 1)]).unwrap();
//! let inputs = IoTable::new(1, vec![VarSpec::duplicated("tgt.x", 2, 1)]).unwrap();
//! let setup = TransferSetup::new("", 0, inputs.clone(), outputs.clone())
//!     .with_connection(Connection::new("tgt.x", "src.y"));
//! let plans = plan_transfers(&setup).unwrap();
//!
//! let mut set = TransferSet::create("", &plans, Arc::new(SerialComm));
//! let mut ins = inputs.local_vector(0, VectorKind::Input);
//! let mut outs = outputs.local_vector(0, VectorKind::Output);
//! outs.set("src.y", &[1.0, 2.0]).unwrap();
//!
//! set.transfer(Direction::Fwd, &PlanKey::sub("tgt"), &mut ins, &mut outs, Mode::Fwd).unwrap();
//! assert_eq!(ins.get("tgt.x").unwrap(), &[1.0, 2.0]);
//! ```

use std::collections::BTreeMap;
use std::fmt;

use crate::comm::CommError;
use crate::component::SetupError;
use crate::vector::VectorError;

pub mod executor;
pub mod layout;
pub mod planner;
pub mod relevance;

pub use executor::{ScatterHandle, Transfer, TransferSet};
pub use layout::{IoTable, VarSpec};
pub use planner::{plan_transfers, Connection, TransferSetup};
pub use relevance::{common_subpath, FdSubgroupInputs, RelevanceContext, RelevanceGraph, VarNode};

/// Direction a plan was built for.
pub type Direction = crate::Mode;

/// Errors raised while planning or executing transfers.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error(transparent)]
    Setup(#[from] SetupError),

    #[error(transparent)]
    Comm(#[from] CommError),

    #[error(transparent)]
    Vector(#[from] VectorError),

    #[error("unknown variable '{0}'")]
    UnknownVariable(String),

    #[error("variable '{0}' is declared twice")]
    DuplicateVariable(String),

    #[error("variable '{name}' has sizes for {found} ranks, expected {expected}")]
    RankCount { name: String, expected: usize, found: usize },

    #[error("src_indices of '{tgt}' has {found} entries, expected {expected}")]
    SrcIndicesSize { tgt: String, expected: usize, found: usize },

    #[error("src index {index} of '{tgt}' is out of range for '{src}' of global size {size}")]
    SrcIndexOutOfRange { tgt: String, src: String, index: usize, size: usize },

    #[error("transfer plan has {inputs} input indices but {outputs} output indices")]
    UnequalPlan { inputs: usize, outputs: usize },

    #[error("global index {index} is outside the {kind} segment [{start}, {end})")]
    OutsideSegment { kind: &'static str, index: usize, start: usize, end: usize },

    #[error("global output index {0} is not owned by any rank")]
    Unowned(usize),

    #[error("no {direction} transfer registered for {key}")]
    MissingPlan { direction: Direction, key: PlanKey },

    #[error("transfers of group '{0}' have been torn down")]
    TornDown(String),
}

/// Result type for transfer operations.
pub type TransferResult<T> = Result<T, TransferError>;

/// Address of a plan inside a group.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PlanKey {
    /// Child subsystem the plan feeds, `None` for the full-system plan.
    pub subsystem: Option<String>,
    /// Side channel of reverse indices owned by other ranks under parallel
    /// derivative coloring.
    pub nocolor: bool,
}

impl PlanKey {
    /// The full-system plan.
    pub fn full() -> Self {
        PlanKey { subsystem: None, nocolor: false }
    }

    /// The plan of one child subsystem.
    pub fn sub(name: &str) -> Self {
        PlanKey { subsystem: Some(name.to_string()), nocolor: false }
    }

    /// The no-color counterpart of this key.
    pub fn nocolor(mut self) -> Self {
        self.nocolor = true;
        self
    }
}

impl fmt::Display for PlanKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.subsystem {
            Some(name) => write!(f, "'{name}'")?,
            None => write!(f, "full system")?,
        }
        if self.nocolor {
            write!(f, " (nocolor)")?;
        }
        Ok(())
    }
}

/// Index correspondence of one transfer: `inputs[input_indices[k]]` pairs with
/// `outputs[output_indices[k]]`, both as offsets into the rank-major arrays.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferPlan {
    input_indices: Vec<usize>,
    output_indices: Vec<usize>,
}

impl TransferPlan {
    /// Creates a plan from index arrays of equal length.
    pub fn new(input_indices: Vec<usize>, output_indices: Vec<usize>) -> TransferResult<Self> {
        if input_indices.len() != output_indices.len() {
            return Err(TransferError::UnequalPlan {
                inputs: input_indices.len(),
                outputs: output_indices.len(),
            });
        }
        Ok(TransferPlan { input_indices, output_indices })
    }

    /// A plan moving nothing.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Concatenates plans, preserving the position of every pair.
    pub fn concat<'a>(plans: impl IntoIterator<Item = &'a TransferPlan>) -> Self {
        let mut merged = TransferPlan::empty();
        for plan in plans {
            merged.input_indices.extend_from_slice(&plan.input_indices);
            merged.output_indices.extend_from_slice(&plan.output_indices);
        }
        merged
    }

    pub fn input_indices(&self) -> &[usize] {
        &self.input_indices
    }

    pub fn output_indices(&self) -> &[usize] {
        &self.output_indices
    }

    /// Iterates over `(input, output)` index pairs.
    pub fn pairs(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.input_indices.iter().copied().zip(self.output_indices.iter().copied())
    }

    pub fn len(&self) -> usize {
        self.input_indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.input_indices.is_empty()
    }
}

/// Every plan of one group.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransferPlans {
    /// Forward plans, one per child subsystem plus the full plan.
    pub fwd: BTreeMap<PlanKey, TransferPlan>,
    /// Reverse plans, absent when reverse transfers are not needed.
    pub rev: Option<BTreeMap<PlanKey, TransferPlan>>,
    /// Inputs of approximated subgroups that need a transfer for derivatives
    /// to cross distributed variables, keyed by their owning group.
    pub fd_subgroup_inputs: FdSubgroupInputs,
}

impl TransferPlans {
    pub fn get(&self, direction: Direction, key: &PlanKey) -> Option<&TransferPlan> {
        match direction {
            Direction::Fwd => self.fwd.get(key),
            Direction::Rev => self.rev.as_ref().and_then(|rev| rev.get(key)),
        }
    }

    /// Every registered `(direction, key, plan)`, forward first.
    pub fn iter(&self) -> impl Iterator<Item = (Direction, &PlanKey, &TransferPlan)> + '_ {
        self.fwd
            .iter()
            .map(|(k, p)| (Direction::Fwd, k, p))
            .chain(self.rev.iter().flatten().map(|(k, p)| (Direction::Rev, k, p)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unequal_plan_rejected() {
        let err = TransferPlan::new(vec![0, 1], vec![0]).unwrap_err();
        assert!(matches!(err, TransferError::UnequalPlan { inputs: 2, outputs: 1 }));
    }

    #[test]
    fn test_concat_preserves_positions() {
        let a = TransferPlan::new(vec![0, 1], vec![4, 5]).unwrap();
        let b = TransferPlan::new(vec![2], vec![0]).unwrap();
        let full = TransferPlan::concat([&a, &b]);
        assert_eq!(full.input_indices(), &[0, 1, 2]);
        assert_eq!(full.output_indices(), &[4, 5, 0]);
        assert_eq!(full.pairs().nth(2), Some((2, 0)));
    }

    #[test]
    fn test_plan_key_ordering_and_display() {
        assert!(PlanKey::full() < PlanKey::sub("a"));
        assert!(PlanKey::full() < PlanKey::full().nocolor());
        assert_eq!(PlanKey::sub("c1").nocolor().to_string(), "'c1' (nocolor)");
        assert_eq!(PlanKey::full().to_string(), "full system");
    }
}
