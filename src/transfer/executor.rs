//! Transfer execution.
//!
//! A [`ScatterHandle`] moves one real array along a plan. Forward scatters
//! first learn which source entries each rank needs, then send only those
//! `(global index, value)` pairs and overwrite the local target entries.
//! Reverse scatters send `(global index, value)` pairs and accumulate them
//! into the owning segments in ascending rank order, so results do not
//! depend on thread timing.
//!
//! Every rank joins every collective call even when it fails locally: it
//! contributes [`Payload::Failed`] and the whole group returns an error.

use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use rustc_hash::{FxHashMap, FxHasher};
use tracing::{debug, trace};

use super::{Direction, PlanKey, TransferError, TransferPlan, TransferPlans, TransferResult};
use crate::comm::{CommError, Communicator, Payload};
use crate::vector::{Segment, Vector};
use crate::Mode;

/// Owned scatter state of one plan and one real array.
#[derive(Debug, Clone)]
pub struct ScatterHandle {
    tag: u64,
    label: String,
    /// Source indices of the forward scatter, resolved by its first call.
    routes: Option<Arc<Routes>>,
}

#[derive(Debug, Clone, Default)]
struct Routes {
    /// Global indices this rank owns and some rank reads.
    sends: Vec<usize>,
    /// Global indices read by any rank, identical on every rank.
    requested: Vec<usize>,
}

impl ScatterHandle {
    pub fn new(tag: u64) -> Self {
        ScatterHandle { tag, label: format!("scatter {tag:#018x}"), routes: None }
    }

    /// Name reported to peers when this rank fails.
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    /// Identity of the collective call issued by this handle.
    pub fn tag(&self) -> u64 {
        self.tag
    }

    /// `dst[in] = src[out]` for every pair of the plan.
    ///
    /// `src` is the local piece of the output array, `dst` the local piece of
    /// the input array. The handle is bound to the plan and source layout of
    /// its first call.
    pub fn forward(
        &mut self,
        comm: &dyn Communicator,
        plan: &TransferPlan,
        src: &[f64],
        src_seg: Segment,
        dst: &mut [f64],
        dst_seg: Segment,
    ) -> TransferResult<()> {
        if self.routes.is_none() {
            self.routes = Some(Arc::new(self.resolve_routes(comm, plan, src_seg, src.len())?));
        }
        let routes = self.routes.clone().unwrap_or_default();

        let targets: TransferResult<Vec<(usize, usize)>> = plan
            .pairs()
            .map(|(i, o)| Ok((local_index(dst_seg, dst.len(), i, "input")?, o)))
            .collect();
        let (contribution, targets) = match targets {
            Ok(targets) => {
                let pairs = routes
                    .sends
                    .iter()
                    .filter_map(|&o| {
                        let local = local_index(src_seg, src.len(), o, "output").ok()?;
                        Some((o, src[local]))
                    })
                    .collect();
                (Payload::Pairs(pairs), Ok(targets))
            }
            Err(err) => (self.failure(&err), Err(err)),
        };

        let gathered = comm.exchange(self.tag, contribution)?;
        let targets = targets?;
        check_peers(&gathered)?;

        let mut values = FxHashMap::default();
        for payload in gathered {
            let Payload::Pairs(pairs) = payload else {
                return Err(CommError::UnexpectedPayload { expected: "Pairs" }.into());
            };
            values.extend(pairs);
        }
        // Every rank sees the same values and requests, so this verdict is
        // shared by the whole group.
        if let Some(&o) = routes.requested.iter().find(|&&o| !values.contains_key(&o)) {
            return Err(TransferError::Unowned(o));
        }
        for (local, o) in targets {
            dst[local] = *values.get(&o).ok_or(TransferError::Unowned(o))?;
        }
        Ok(())
    }

    /// `dst[out] += src[in]` for every pair of the plan, across ranks.
    ///
    /// `src` is the local piece of the input array, `dst` the local piece of
    /// the output array. Nothing is accumulated when any rank fails.
    pub fn reverse_add(
        &mut self,
        comm: &dyn Communicator,
        plan: &TransferPlan,
        src: &[f64],
        src_seg: Segment,
        dst: &mut [f64],
        dst_seg: Segment,
    ) -> TransferResult<()> {
        let pairs: TransferResult<Vec<(usize, f64)>> = plan
            .pairs()
            .map(|(i, o)| Ok((o, src[local_index(src_seg, src.len(), i, "input")?])))
            .collect();
        let (contribution, local) = match pairs {
            Ok(pairs) => (Payload::Pairs(pairs), Ok(())),
            Err(err) => (self.failure(&err), Err(err)),
        };

        let gathered = comm.exchange(self.tag, contribution)?;
        local?;
        check_peers(&gathered)?;

        for payload in gathered {
            let Payload::Pairs(pairs) = payload else {
                return Err(CommError::UnexpectedPayload { expected: "Pairs" }.into());
            };
            for (o, value) in pairs {
                if dst_seg.owns(o, dst.len()) {
                    dst[o - dst_seg.offset] += value;
                }
            }
        }
        Ok(())
    }

    /// Exchanges the source indices of every rank's plan.
    fn resolve_routes(
        &self,
        comm: &dyn Communicator,
        plan: &TransferPlan,
        src_seg: Segment,
        src_len: usize,
    ) -> TransferResult<Routes> {
        let gathered = comm.exchange(self.tag, Payload::Indices(plan.output_indices().to_vec()))?;
        let mut requested = Vec::new();
        for payload in gathered {
            let Payload::Indices(indices) = payload else {
                return Err(CommError::UnexpectedPayload { expected: "Indices" }.into());
            };
            requested.extend(indices);
        }
        requested.sort_unstable();
        requested.dedup();
        let sends: Vec<usize> = requested.iter().copied().filter(|&o| src_seg.owns(o, src_len)).collect();
        trace!(
            label = %self.label,
            sends = sends.len(),
            requested = requested.len(),
            "resolved scatter routes"
        );
        Ok(Routes { sends, requested })
    }

    fn failure(&self, err: &TransferError) -> Payload {
        Payload::Failed { path: self.label.clone(), message: err.to_string() }
    }
}

/// The first peer failure of a collective call, if any.
fn check_peers(gathered: &[Payload]) -> TransferResult<()> {
    for (peer, payload) in gathered.iter().enumerate() {
        if let Payload::Failed { path, message } = payload {
            return Err(CommError::PeerFailed { peer, path: path.clone(), message: message.clone() }.into());
        }
    }
    Ok(())
}

fn local_index(seg: Segment, len: usize, global: usize, kind: &'static str) -> TransferResult<usize> {
    if seg.owns(global, len) {
        Ok(global - seg.offset)
    } else {
        Err(TransferError::OutsideSegment { kind, index: global, start: seg.offset, end: seg.offset + len })
    }
}

/// One registered plan bound to its group communicator.
#[derive(Debug)]
pub struct Transfer {
    key: PlanKey,
    direction: Direction,
    plan: TransferPlan,
    comm: Arc<dyn Communicator>,
    real: ScatterHandle,
    imag: ScatterHandle,
}

impl Transfer {
    pub fn new(
        group_path: &str,
        direction: Direction,
        key: PlanKey,
        plan: TransferPlan,
        comm: Arc<dyn Communicator>,
    ) -> Self {
        let tag = transfer_tag(group_path, direction, &key);
        let label = format!("{direction} transfer {key} of '{group_path}'");
        Transfer {
            real: ScatterHandle::new(tag).with_label(label.clone()),
            imag: ScatterHandle::new(tag.rotate_left(1) ^ 1).with_label(format!("{label} (imaginary)")),
            key,
            direction,
            plan,
            comm,
        }
    }

    pub fn key(&self) -> &PlanKey {
        &self.key
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn plan(&self) -> &TransferPlan {
        &self.plan
    }

    /// Moves data along the plan.
    ///
    /// Forward overwrites the target entries of `inputs` from `outputs`.
    /// Reverse accumulates `inputs` into the source entries of `outputs`.
    /// When the receiving vector is under complex step and the sending vector
    /// has an imaginary shadow, the shadow moves through a second scatter.
    pub fn transfer(&mut self, inputs: &mut Vector, outputs: &mut Vector, mode: Mode) -> TransferResult<()> {
        let comm = self.comm.as_ref();
        match mode {
            Mode::Fwd => {
                let complex = inputs.under_complex_step() && outputs.has_shadow();
                trace!(key = %self.key, complex, "forward transfer");
                let (src_seg, dst_seg) = (outputs.segment(), inputs.segment());
                self.real.forward(
                    comm,
                    &self.plan,
                    outputs.as_slice(),
                    src_seg,
                    inputs.as_mut_slice(),
                    dst_seg,
                )?;
                if let (true, Some(src), Some(dst)) = (complex, outputs.shadow(), inputs.shadow_mut()) {
                    self.imag.forward(comm, &self.plan, src, src_seg, dst, dst_seg)?;
                }
            }
            Mode::Rev => {
                let complex = outputs.under_complex_step() && inputs.has_shadow();
                trace!(key = %self.key, complex, "reverse transfer");
                let (src_seg, dst_seg) = (inputs.segment(), outputs.segment());
                self.real.reverse_add(
                    comm,
                    &self.plan,
                    inputs.as_slice(),
                    src_seg,
                    outputs.as_mut_slice(),
                    dst_seg,
                )?;
                if let (true, Some(src), Some(dst)) = (complex, inputs.shadow(), outputs.shadow_mut()) {
                    self.imag.reverse_add(comm, &self.plan, src, src_seg, dst, dst_seg)?;
                }
            }
        }
        Ok(())
    }
}

/// Identity of a plan's collective calls, equal on every rank of the group.
fn transfer_tag(group_path: &str, direction: Direction, key: &PlanKey) -> u64 {
    let mut hasher = FxHasher::default();
    "transfer".hash(&mut hasher);
    group_path.hash(&mut hasher);
    direction.hash(&mut hasher);
    key.hash(&mut hasher);
    hasher.finish()
}

/// All transfers of one group, created from its plans.
#[derive(Debug)]
pub struct TransferSet {
    group_path: String,
    transfers: BTreeMap<(u8, PlanKey), Transfer>,
    torn_down: bool,
}

fn slot(direction: Direction) -> u8 {
    match direction {
        Direction::Fwd => 0,
        Direction::Rev => 1,
    }
}

impl TransferSet {
    /// Creates one transfer per registered plan.
    pub fn create(group_path: &str, plans: &TransferPlans, comm: Arc<dyn Communicator>) -> Self {
        let transfers: BTreeMap<_, _> = plans
            .iter()
            .map(|(direction, key, plan)| {
                let transfer =
                    Transfer::new(group_path, direction, key.clone(), plan.clone(), comm.clone());
                ((slot(direction), key.clone()), transfer)
            })
            .collect();
        debug!(group = group_path, transfers = transfers.len(), "created transfers");
        TransferSet { group_path: group_path.to_string(), transfers, torn_down: false }
    }

    pub fn get(&self, direction: Direction, key: &PlanKey) -> Option<&Transfer> {
        self.transfers.get(&(slot(direction), key.clone()))
    }

    /// Keys registered for `direction`, in order.
    pub fn keys(&self, direction: Direction) -> impl Iterator<Item = &PlanKey> + '_ {
        let s = slot(direction);
        self.transfers.keys().filter(move |(d, _)| *d == s).map(|(_, k)| k)
    }

    pub fn len(&self) -> usize {
        self.transfers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transfers.is_empty()
    }

    /// Runs the transfer registered under `(direction, key)`.
    pub fn transfer(
        &mut self,
        direction: Direction,
        key: &PlanKey,
        inputs: &mut Vector,
        outputs: &mut Vector,
        mode: Mode,
    ) -> TransferResult<()> {
        if self.torn_down {
            return Err(TransferError::TornDown(self.group_path.clone()));
        }
        let transfer = self
            .transfers
            .get_mut(&(slot(direction), key.clone()))
            .ok_or_else(|| TransferError::MissingPlan { direction, key: key.clone() })?;
        transfer.transfer(inputs, outputs, mode)
    }

    /// Releases every scatter handle. The set must be recreated after the
    /// structure of the group changes.
    pub fn teardown(&mut self) {
        debug!(group = %self.group_path, transfers = self.transfers.len(), "tearing down transfers");
        self.transfers.clear();
        self.torn_down = true;
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::SerialComm;
    use crate::transfer::{plan_transfers, Connection, IoTable, TransferSetup, VarSpec};
    use crate::vector::VectorKind;

    fn serial_setup() -> (IoTable, IoTable, TransferPlans) {
        let outputs = IoTable::new(1, vec![VarSpec::duplicated("a.y", 3, 1)]).unwrap();
        let inputs = IoTable::new(
            1,
            vec![VarSpec::duplicated("b.x", 2, 1), VarSpec::duplicated("c.x", 1, 1)],
        )
        .unwrap();
        let setup = TransferSetup::new("", 0, inputs.clone(), outputs.clone())
            .with_connection(Connection::new("b.x", "a.y").with_src_indices(vec![2, 0]))
            .with_connection(Connection::new("c.x", "a.y").with_src_indices(vec![2]))
            .with_rev(true);
        (inputs, outputs, plan_transfers(&setup).unwrap())
    }

    #[test]
    fn test_forward_and_reverse_serial() {
        let (inputs, outputs, plans) = serial_setup();
        let mut set = TransferSet::create("", &plans, Arc::new(SerialComm));
        let mut ins = inputs.local_vector(0, VectorKind::Input);
        let mut outs = outputs.local_vector(0, VectorKind::Output);
        outs.set("a.y", &[1.0, 2.0, 3.0]).unwrap();

        set.transfer(Direction::Fwd, &PlanKey::full(), &mut ins, &mut outs, Mode::Fwd).unwrap();
        assert_eq!(ins.as_slice(), &[3.0, 1.0, 3.0]);

        // Adjoint: a.y[2] receives from both targets.
        let mut d_ins = inputs.local_vector(0, VectorKind::Input);
        let mut d_outs = outputs.local_vector(0, VectorKind::Output);
        d_ins.set_val(&[1.0, 10.0, 100.0]).unwrap();
        set.transfer(Direction::Rev, &PlanKey::full(), &mut d_ins, &mut d_outs, Mode::Rev).unwrap();
        assert_eq!(d_outs.as_slice(), &[10.0, 0.0, 101.0]);
    }

    #[test]
    fn test_subsystem_transfer_only_touches_its_inputs() {
        let (inputs, outputs, plans) = serial_setup();
        let mut set = TransferSet::create("", &plans, Arc::new(SerialComm));
        let mut ins = inputs.local_vector(0, VectorKind::Input);
        let mut outs = outputs.local_vector(0, VectorKind::Output);
        outs.set("a.y", &[1.0, 2.0, 3.0]).unwrap();
        set.transfer(Direction::Fwd, &PlanKey::sub("c"), &mut ins, &mut outs, Mode::Fwd).unwrap();
        assert_eq!(ins.as_slice(), &[0.0, 0.0, 3.0]);
    }

    #[test]
    fn test_complex_shadow_moves_with_real_part() {
        let (inputs, outputs, plans) = serial_setup();
        let mut set = TransferSet::create("", &plans, Arc::new(SerialComm));
        let mut ins = inputs.local_vector(0, VectorKind::Input);
        let mut outs = outputs.local_vector(0, VectorKind::Output);
        ins.set_complex_step(true);
        outs.set_complex_step(true);
        outs.imag_mut().unwrap().copy_from_slice(&[0.1, 0.2, 0.3]);
        outs.set("a.y", &[1.0, 2.0, 3.0]).unwrap();

        set.transfer(Direction::Fwd, &PlanKey::full(), &mut ins, &mut outs, Mode::Fwd).unwrap();
        assert_eq!(ins.as_slice(), &[3.0, 1.0, 3.0]);
        assert_eq!(ins.imag().unwrap(), &[0.3, 0.1, 0.3]);
    }

    #[test]
    fn test_source_entry_missing_from_every_segment() {
        let (inputs, _, plans) = serial_setup();
        let short = IoTable::new(1, vec![VarSpec::duplicated("a.y", 1, 1)]).unwrap();
        let mut set = TransferSet::create("", &plans, Arc::new(SerialComm));
        let mut ins = inputs.local_vector(0, VectorKind::Input);
        let mut outs = short.local_vector(0, VectorKind::Output);

        let err = set.transfer(Direction::Fwd, &PlanKey::full(), &mut ins, &mut outs, Mode::Fwd).unwrap_err();
        assert!(matches!(err, TransferError::Unowned(2)));
        assert_eq!(ins.as_slice(), &[0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_reverse_failure_leaves_outputs_untouched() {
        let (_, outputs, plans) = serial_setup();
        let short = IoTable::new(1, vec![VarSpec::duplicated("b.x", 1, 1)]).unwrap();
        let mut set = TransferSet::create("", &plans, Arc::new(SerialComm));
        let mut d_ins = short.local_vector(0, VectorKind::Input);
        let mut d_outs = outputs.local_vector(0, VectorKind::Output);
        d_ins.set_val(&[1.0]).unwrap();

        let err = set.transfer(Direction::Rev, &PlanKey::full(), &mut d_ins, &mut d_outs, Mode::Rev);
        assert!(matches!(err, Err(TransferError::OutsideSegment { kind: "input", index: 1, .. })));
        assert_eq!(d_outs.as_slice(), &[0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_teardown_and_missing_plan() {
        let (inputs, outputs, plans) = serial_setup();
        let mut set = TransferSet::create("g", &plans, Arc::new(SerialComm));
        let mut ins = inputs.local_vector(0, VectorKind::Input);
        let mut outs = outputs.local_vector(0, VectorKind::Output);

        let err = set
            .transfer(Direction::Fwd, &PlanKey::sub("zz"), &mut ins, &mut outs, Mode::Fwd)
            .unwrap_err();
        assert!(matches!(err, TransferError::MissingPlan { .. }));

        assert_eq!(set.keys(Direction::Fwd).count(), 3);
        set.teardown();
        assert!(set.is_empty());
        let err = set
            .transfer(Direction::Fwd, &PlanKey::full(), &mut ins, &mut outs, Mode::Fwd)
            .unwrap_err();
        assert_eq!(err.to_string(), "transfers of group 'g' have been torn down");
    }

    #[test]
    fn test_tags_differ_per_key_and_direction() {
        let a = transfer_tag("g", Direction::Fwd, &PlanKey::full());
        let b = transfer_tag("g", Direction::Rev, &PlanKey::full());
        let c = transfer_tag("g", Direction::Fwd, &PlanKey::sub("c1"));
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_eq!(a, transfer_tag("g", Direction::Fwd, &PlanKey::full()));
    }
}
