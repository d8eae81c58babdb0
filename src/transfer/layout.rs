//! Rank × variable size and offset tables.
//!
//! Every group-level vector is one segment of a rank-major global array: all
//! variables of rank 0 in declaration order, then all variables of rank 1, and
//! so on. The tables below answer where a variable's local block lives in that
//! array on any rank.

use std::sync::Arc;

use nalgebra::DMatrix;
use rustc_hash::FxHashMap;

use super::{TransferError, TransferResult};
use crate::vector::{Layout, Segment, Vector, VectorKind};

/// One variable as seen by the transfer layer.
#[derive(Debug, Clone, PartialEq)]
pub struct VarSpec {
    /// Absolute dotted path.
    pub name: String,
    /// Local size on each rank, `None` where the variable does not exist.
    pub local_sizes: Vec<Option<usize>>,
    /// True if each rank holds a different piece of the variable.
    pub distributed: bool,
}

impl VarSpec {
    /// A non-distributed variable of `size` entries present on every rank.
    pub fn duplicated(name: &str, size: usize, nranks: usize) -> Self {
        VarSpec { name: name.to_string(), local_sizes: vec![Some(size); nranks], distributed: false }
    }

    /// A distributed variable with the given local size on each rank.
    pub fn distributed(name: &str, sizes: &[usize]) -> Self {
        VarSpec {
            name: name.to_string(),
            local_sizes: sizes.iter().map(|&s| Some(s)).collect(),
            distributed: true,
        }
    }

    /// A non-distributed variable living on a subset of ranks.
    pub fn on_ranks(name: &str, size: usize, ranks: &[usize], nranks: usize) -> Self {
        let local_sizes =
            (0..nranks).map(|r| if ranks.contains(&r) { Some(size) } else { None }).collect();
        VarSpec { name: name.to_string(), local_sizes, distributed: false }
    }
}

/// Sizes and rank-major offsets of one variable kind (inputs or outputs).
#[derive(Debug, Clone)]
pub struct IoTable {
    vars: Vec<VarSpec>,
    index: FxHashMap<String, usize>,
    sizes: DMatrix<usize>,
    offsets: DMatrix<usize>,
}

impl IoTable {
    /// Builds the tables for `vars` (declaration order) over `nranks` ranks.
    pub fn new(nranks: usize, vars: Vec<VarSpec>) -> TransferResult<Self> {
        let mut index = FxHashMap::default();
        for (i, var) in vars.iter().enumerate() {
            if var.local_sizes.len() != nranks {
                return Err(TransferError::RankCount {
                    name: var.name.clone(),
                    expected: nranks,
                    found: var.local_sizes.len(),
                });
            }
            if index.insert(var.name.clone(), i).is_some() {
                return Err(TransferError::DuplicateVariable(var.name.clone()));
            }
        }

        let sizes = DMatrix::from_fn(nranks, vars.len(), |r, j| vars[j].local_sizes[r].unwrap_or(0));
        let mut offsets = DMatrix::zeros(nranks, vars.len());
        let mut running = 0;
        for r in 0..nranks {
            for j in 0..vars.len() {
                offsets[(r, j)] = running;
                running += sizes[(r, j)];
            }
        }

        Ok(IoTable { vars, index, sizes, offsets })
    }

    pub fn nranks(&self) -> usize {
        self.sizes.nrows()
    }

    pub fn vars(&self) -> &[VarSpec] {
        &self.vars
    }

    /// Column of `name` in the tables.
    pub fn idx(&self, name: &str) -> TransferResult<usize> {
        self.index.get(name).copied().ok_or_else(|| TransferError::UnknownVariable(name.to_string()))
    }

    pub fn var(&self, idx: usize) -> &VarSpec {
        &self.vars[idx]
    }

    pub fn sizes(&self) -> &DMatrix<usize> {
        &self.sizes
    }

    pub fn offsets(&self) -> &DMatrix<usize> {
        &self.offsets
    }

    pub fn size(&self, rank: usize, idx: usize) -> usize {
        self.sizes[(rank, idx)]
    }

    pub fn offset(&self, rank: usize, idx: usize) -> usize {
        self.offsets[(rank, idx)]
    }

    /// True if the variable exists on `rank`, even with zero local entries.
    pub fn is_local(&self, rank: usize, idx: usize) -> bool {
        self.vars[idx].local_sizes[rank].is_some()
    }

    /// Lowest rank holding a non-empty piece of the variable, 0 if none does.
    pub fn owning_rank(&self, idx: usize) -> usize {
        self.sizes.column(idx).iter().position(|&s| s > 0).unwrap_or(0)
    }

    /// Ranks holding a non-empty piece of the variable, ascending.
    pub fn nonzero_ranks(&self, idx: usize) -> Vec<usize> {
        self.sizes.column(idx).iter().enumerate().filter(|(_, s)| **s > 0).map(|(r, _)| r).collect()
    }

    /// Sum of the variable's local sizes on every rank.
    pub fn global_size(&self, idx: usize) -> usize {
        self.sizes.column(idx).iter().sum()
    }

    /// Sum of the variable's local sizes on the ranks below `rank`.
    pub fn size_below(&self, rank: usize, idx: usize) -> usize {
        self.sizes.column(idx).iter().take(rank).sum()
    }

    /// Duplication status: `(is_dup, missing_ranks, distributed)`.
    ///
    /// A distributed variable is never a duplicate. Otherwise it is duplicated
    /// when more than one rank holds it, and `missing_ranks` counts the ranks
    /// that do not.
    pub fn dup_status(&self, idx: usize) -> (bool, usize, bool) {
        if self.vars[idx].distributed {
            return (false, 0, true);
        }
        let nz = self.sizes.column(idx).iter().filter(|&&s| s > 0).count();
        (nz > 1, self.nranks() - nz, false)
    }

    /// Length of the whole rank-major array.
    pub fn global_len(&self) -> usize {
        self.sizes.iter().sum()
    }

    /// Position of `rank`'s segment in the global array.
    pub fn segment(&self, rank: usize) -> Segment {
        let offset = self.sizes.rows(0, rank).iter().sum();
        Segment { offset, global_len: self.global_len() }
    }

    /// Named layout of the variables present on `rank`.
    pub fn local_layout(&self, rank: usize) -> Layout {
        Layout::from_sizes(
            self.vars
                .iter()
                .enumerate()
                .filter(|(j, _)| self.is_local(rank, *j))
                .map(|(j, var)| (var.name.as_str(), self.sizes[(rank, j)])),
        )
    }

    /// A zero-filled vector holding `rank`'s segment.
    pub fn local_vector(&self, rank: usize, kind: VectorKind) -> Vector {
        Vector::new(kind, Arc::new(self.local_layout(rank))).with_segment(self.segment(rank))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> IoTable {
        IoTable::new(
            2,
            vec![
                VarSpec::distributed("a.y", &[1, 2]),
                VarSpec::duplicated("b.z", 3, 2),
                VarSpec::on_ranks("c.w", 2, &[1], 2),
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_rank_major_offsets() {
        let t = table();
        // rank 0: a.y[1], b.z[3]; rank 1: a.y[2], b.z[3], c.w[2]
        assert_eq!(t.offset(0, 0), 0);
        assert_eq!(t.offset(0, 1), 1);
        assert_eq!(t.offset(0, 2), 4);
        assert_eq!(t.offset(1, 0), 4);
        assert_eq!(t.offset(1, 1), 6);
        assert_eq!(t.offset(1, 2), 9);
        assert_eq!(t.global_len(), 11);
        assert_eq!(t.segment(1), Segment { offset: 4, global_len: 11 });
    }

    #[test]
    fn test_owning_rank_and_dup_status() {
        let t = table();
        assert_eq!(t.owning_rank(2), 1);
        assert_eq!(t.dup_status(0), (false, 0, true));
        assert_eq!(t.dup_status(1), (true, 0, false));
        assert_eq!(t.dup_status(2), (false, 1, false));
        assert_eq!(t.size_below(1, 0), 1);
        assert_eq!(t.global_size(0), 3);
    }

    #[test]
    fn test_local_layout_skips_absent_vars() {
        let t = table();
        assert_eq!(t.local_layout(0).names(), &["a.y".to_string(), "b.z".to_string()]);
        let v = t.local_vector(1, VectorKind::Output);
        assert_eq!(v.len(), 7);
        assert_eq!(v.segment().offset, 4);
    }

    #[test]
    fn test_wrong_rank_count_rejected() {
        let err = IoTable::new(3, vec![VarSpec::duplicated("x", 1, 2)]).unwrap_err();
        assert!(matches!(err, TransferError::RankCount { expected: 3, found: 2, .. }));
    }
}
