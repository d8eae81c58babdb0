//! Transfer planning.
//!
//! For each connection of a group the planner computes which entries of the
//! rank-major output array feed which entries of the local input segment, in
//! forward and, when needed, in reverse. Plans are grouped by the child
//! subsystem on the receiving side and concatenated into a full-system plan.

use std::collections::BTreeMap;

use tracing::{debug, trace, warn};

use super::layout::IoTable;
use super::relevance::RelevanceContext;
use super::{PlanKey, TransferError, TransferPlan, TransferPlans, TransferResult};
use crate::component::SetupError;

/// A target input fed by a source output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connection {
    /// Absolute path of the target input.
    pub tgt: String,
    /// Absolute path of the source output.
    pub src: String,
    /// Entries of the source read by this rank's piece of the target, as
    /// indices into the source's global (rank-concatenated) layout.
    pub src_indices: Option<Vec<usize>>,
}

impl Connection {
    pub fn new(tgt: &str, src: &str) -> Self {
        Connection { tgt: tgt.to_string(), src: src.to_string(), src_indices: None }
    }

    pub fn with_src_indices(mut self, src_indices: Vec<usize>) -> Self {
        self.src_indices = Some(src_indices);
        self
    }
}

/// Everything the planner needs to know about one group on one rank.
#[derive(Debug, Clone)]
pub struct TransferSetup {
    pub group_path: String,
    pub rank: usize,
    pub inputs: IoTable,
    pub outputs: IoTable,
    /// Connections internal to the group, in declaration order.
    pub connections: Vec<Connection>,
    /// Build reverse plans.
    pub rev: bool,
    /// The group approximates its own Jacobian, so reverse transfers are not
    /// needed inside it.
    pub owns_approx_jac: bool,
    /// Parallel derivative coloring in reverse mode is active.
    pub has_rev_par_coloring: bool,
    /// Model-level relevance data for approximated groups.
    pub relevance: Option<RelevanceContext>,
}

impl TransferSetup {
    pub fn new(group_path: &str, rank: usize, inputs: IoTable, outputs: IoTable) -> Self {
        TransferSetup {
            group_path: group_path.to_string(),
            rank,
            inputs,
            outputs,
            connections: Vec::new(),
            rev: false,
            owns_approx_jac: false,
            has_rev_par_coloring: false,
            relevance: None,
        }
    }

    pub fn with_connection(mut self, connection: Connection) -> Self {
        self.connections.push(connection);
        self
    }

    pub fn with_rev(mut self, rev: bool) -> Self {
        self.rev = rev;
        self
    }

    pub fn with_approx_jac(mut self, owns_approx_jac: bool) -> Self {
        self.owns_approx_jac = owns_approx_jac;
        self
    }

    pub fn with_rev_par_coloring(mut self, active: bool) -> Self {
        self.has_rev_par_coloring = active;
        self
    }

    pub fn with_relevance(mut self, relevance: RelevanceContext) -> Self {
        self.relevance = Some(relevance);
        self
    }

    pub fn nranks(&self) -> usize {
        self.inputs.nranks()
    }

    /// Name of the immediate child subsystem containing `var`.
    pub fn child_of<'a>(&self, var: &'a str) -> &'a str {
        let rest = if self.group_path.is_empty() {
            var
        } else {
            var.strip_prefix(self.group_path.as_str())
                .and_then(|r| r.strip_prefix('.'))
                .unwrap_or(var)
        };
        rest.split('.').next().unwrap_or(rest)
    }

    fn builds_rev(&self) -> bool {
        self.rev && !self.owns_approx_jac
    }
}

/// Index pairs accumulated per child subsystem, in connection order.
#[derive(Debug, Default)]
struct PairLists(BTreeMap<String, Vec<(Vec<usize>, Vec<usize>)>>);

impl PairLists {
    /// Registers `sub` without adding pairs.
    fn touch(&mut self, sub: &str) {
        self.0.entry(sub.to_string()).or_default();
    }

    fn push(&mut self, sub: &str, inputs: Vec<usize>, outputs: Vec<usize>) {
        self.0.entry(sub.to_string()).or_default().push((inputs, outputs));
    }

    fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Per-subsystem plans plus the full plan under `PlanKey::full()`.
    fn into_plans(self, nocolor: bool) -> TransferResult<BTreeMap<PlanKey, TransferPlan>> {
        let mut plans = BTreeMap::new();
        for (sub, pairs) in self.0 {
            let (inputs, outputs): (Vec<Vec<usize>>, Vec<Vec<usize>>) = pairs.into_iter().unzip();
            let plan = TransferPlan::new(inputs.concat(), outputs.concat())?;
            let mut key = PlanKey::sub(&sub);
            key.nocolor = nocolor;
            plans.insert(key, plan);
        }
        let mut full_key = PlanKey::full();
        full_key.nocolor = nocolor;
        let full = TransferPlan::concat(plans.values());
        plans.insert(full_key, full);
        Ok(plans)
    }
}

/// Computes the forward and reverse plans of one group on one rank.
///
/// Every connection registers an entry under its subsystems on every rank,
/// empty when the rank contributes nothing, so all ranks end up with the same
/// keys and issue the same collective scatters.
pub fn plan_transfers(setup: &TransferSetup) -> TransferResult<TransferPlans> {
    let rank = setup.rank;
    let nranks = setup.nranks();
    let ins = &setup.inputs;
    let outs = &setup.outputs;
    let coloring = setup.has_rev_par_coloring;

    let mut fwd = PairLists::default();
    let mut rev = PairLists::default();
    let mut rev_nocolor = PairLists::default();

    for conn in &setup.connections {
        let idx_in = ins.idx(&conn.tgt)?;
        let idx_out = outs.idx(&conn.src)?;
        let sub_in = setup.child_of(&conn.tgt);
        let sub_out = setup.child_of(&conn.src);

        if !ins.is_local(rank, idx_in) {
            fwd.touch(sub_in);
            if setup.builds_rev() {
                rev.touch(sub_out);
                if coloring {
                    rev_nocolor.touch(sub_out);
                }
            }
            continue;
        }

        let size_in = ins.size(rank, idx_in);
        let out_distributed = outs.var(idx_out).distributed;
        let in_distributed = ins.var(idx_in).distributed;
        let owner = outs.owning_rank(idx_out);
        let local_out = outs.is_local(rank, idx_out);

        let src_indices = effective_src_indices(setup, conn, idx_in, idx_out)?;

        let mut on_iprocs = Vec::new();
        let output_inds = match &src_indices {
            None => {
                if out_distributed && !in_distributed {
                    return Err(SetupError::DistributedToNonDistributed {
                        path: setup.group_path.clone(),
                        src: conn.src.clone(),
                        tgt: conn.tgt.clone(),
                    }
                    .into());
                }
                let src_rank = if local_out { rank } else { owner };
                let offset = outs.offset(src_rank, idx_out);
                (offset..offset + size_in).collect()
            }
            Some(si) => map_src_indices(outs, idx_out, si, &mut on_iprocs),
        };

        let in_offset = ins.offset(rank, idx_in);
        let input_inds: Vec<usize> = (in_offset..in_offset + size_in).collect();

        trace!(tgt = %conn.tgt, src = %conn.src, size = size_in, "forward pairs");
        fwd.push(sub_in, input_inds.clone(), output_inds.clone());

        if !setup.builds_rev() {
            continue;
        }

        if coloring {
            rev_nocolor.touch(sub_out);
        }
        let (inp_is_dup, inp_missing, distrib_in) = ins.dup_status(idx_in);
        let (out_is_dup, _, distrib_out) = outs.dup_status(idx_out);
        let iowninput = rank == ins.owning_rank(idx_in);

        if inp_is_dup && (!local_out || (distrib_out && !iowninput)) {
            // Another rank's copy of the input carries the reverse contribution.
            rev.touch(sub_out);
        } else if out_is_dup && inp_is_dup && inp_missing > 0 && iowninput {
            // Fan the input out to the output copies on ranks lacking the input.
            let mut main = (Vec::new(), Vec::new());
            let mut side = (Vec::new(), Vec::new());
            for rnk in 0..nranks {
                if rnk == rank {
                    main.0.extend_from_slice(&input_inds);
                    main.1.extend_from_slice(&output_inds);
                } else if outs.size(rnk, idx_out) > 0 && ins.size(rnk, idx_in) == 0 {
                    let offset = outs.offset(rnk, idx_out);
                    let oarr: Vec<usize> = match &src_indices {
                        None => (offset..offset + size_in).collect(),
                        Some(si) if !si.is_empty() => si.iter().map(|&i| i + offset).collect(),
                        Some(_) => continue,
                    };
                    let target = if coloring { &mut side } else { &mut main };
                    target.0.extend_from_slice(&input_inds);
                    target.1.extend(oarr);
                }
            }
            rev.push(sub_out, main.0, main.1);
            if !side.0.is_empty() {
                rev_nocolor.push(sub_out, side.0, side.1);
            }
        } else if out_is_dup && (!inp_is_dup || inp_missing > 0) && (iowninput || distrib_in) {
            // Gather the local input into every copy of the output.
            let mut main = (Vec::new(), Vec::new());
            let mut side = (Vec::new(), Vec::new());
            for rnk in outs.nonzero_ranks(idx_out) {
                let mut offset = outs.offset(rnk, idx_out);
                let oarr: Vec<usize> = match &src_indices {
                    None => (offset..offset + size_in).collect(),
                    Some(si) if !si.is_empty() => {
                        if distrib_in && !distrib_out && on_iprocs.len() == 1 && on_iprocs[0] == rnk {
                            offset -= outs.size_below(rnk, idx_out);
                        }
                        si.iter().map(|&i| i + offset).collect()
                    }
                    Some(_) => continue,
                };
                let target = if rnk == rank || !coloring { &mut main } else { &mut side };
                target.0.extend_from_slice(&input_inds);
                target.1.extend(oarr);
            }
            rev.push(sub_out, main.0, main.1);
            if !side.0.is_empty() {
                rev_nocolor.push(sub_out, side.0, side.1);
            }
        } else {
            let output_inds = match &src_indices {
                Some(si) if inp_is_dup && out_is_dup && !si.is_empty() => {
                    let offset = outs.offset(rank, idx_out);
                    si.iter().map(|&i| i + offset).collect()
                }
                _ => output_inds,
            };
            rev.push(sub_out, input_inds, output_inds);
        }
    }

    let fwd = fwd.into_plans(false)?;
    let rev = if setup.builds_rev() {
        let mut plans = rev.into_plans(false)?;
        if !rev_nocolor.is_empty() {
            plans.extend(rev_nocolor.into_plans(true)?);
        }
        Some(plans)
    } else {
        None
    };

    let fd_subgroup_inputs = match &setup.relevance {
        Some(ctx) if setup.rev && setup.owns_approx_jac && !setup.group_path.is_empty() => {
            ctx.fd_subgroup_inputs(&setup.group_path)
        }
        _ => Default::default(),
    };

    let full_len = fwd.get(&PlanKey::full()).map_or(0, TransferPlan::len);
    if full_len == 0 && !setup.connections.is_empty() {
        warn!(group = %setup.group_path, rank, "no forward transfer entries on this rank");
    }
    debug!(
        group = %setup.group_path,
        rank,
        fwd = full_len,
        rev = rev.as_ref().and_then(|r| r.get(&PlanKey::full())).map_or(0, TransferPlan::len),
        subsystems = fwd.len() - 1,
        "planned transfers"
    );

    Ok(TransferPlans { fwd, rev, fd_subgroup_inputs })
}

/// Explicit `src_indices`, or the mapping implied by the variable sizes.
fn effective_src_indices(
    setup: &TransferSetup,
    conn: &Connection,
    idx_in: usize,
    idx_out: usize,
) -> TransferResult<Option<Vec<usize>>> {
    let ins = &setup.inputs;
    let outs = &setup.outputs;
    let size_in = ins.size(setup.rank, idx_in);
    let global_out = outs.global_size(idx_out);

    if let Some(si) = &conn.src_indices {
        if si.len() != size_in {
            return Err(TransferError::SrcIndicesSize {
                tgt: conn.tgt.clone(),
                expected: size_in,
                found: si.len(),
            });
        }
        if let Some(&bad) = si.iter().find(|&&i| i >= global_out) {
            return Err(TransferError::SrcIndexOutOfRange {
                tgt: conn.tgt.clone(),
                src: conn.src.clone(),
                index: bad,
                size: global_out,
            });
        }
        return Ok(Some(si.clone()));
    }

    if outs.var(idx_out).distributed && ins.var(idx_in).distributed {
        // Rank r's piece of the input reads rank r's piece of the output.
        let start = outs.size_below(setup.rank, idx_out);
        if start + size_in > global_out {
            return Err(TransferError::SrcIndexOutOfRange {
                tgt: conn.tgt.clone(),
                src: conn.src.clone(),
                index: start + size_in.saturating_sub(1),
                size: global_out,
            });
        }
        return Ok(Some((start..start + size_in).collect()));
    }

    let owner = outs.owning_rank(idx_out);
    if size_in > outs.size(owner, idx_out) {
        return Ok(Some((0..size_in).collect()));
    }
    Ok(None)
}

/// Maps indices into the variable's global layout onto the rank-major array,
/// recording which ranks the entries come from.
fn map_src_indices(
    outs: &IoTable,
    idx_out: usize,
    src_indices: &[usize],
    on_iprocs: &mut Vec<usize>,
) -> Vec<usize> {
    let mut mapped = src_indices.to_vec();
    let mut start = 0;
    for iproc in 0..outs.nranks() {
        let end = start + outs.size(iproc, idx_out);
        if start == end {
            continue;
        }
        let base = outs.offset(iproc, idx_out);
        let mut hit = false;
        for (slot, &si) in mapped.iter_mut().zip(src_indices) {
            if si >= start && si < end {
                *slot = si - start + base;
                hit = true;
            }
        }
        if hit {
            on_iprocs.push(iproc);
        }
        start = end;
    }
    mapped
}
