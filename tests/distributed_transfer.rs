use std::sync::Arc;

use tessera::comm::{CommError, Communicator, ThreadComm};
use tessera::transfer::*;
use tessera::vector::{Vector, VectorKind};
use tessera::Mode;

/// Distributed `src.y` (one entry per rank) feeding a duplicated `tgt.x` of size 2.
fn dist_to_dup(rank: usize) -> (TransferSetup, IoTable, IoTable) {
    let outputs = IoTable::new(2, vec![VarSpec::distributed("src.y", &[1, 1])]).unwrap();
    let inputs = IoTable::new(2, vec![VarSpec::duplicated("tgt.x", 2, 2)]).unwrap();
    let setup = TransferSetup::new("", rank, inputs.clone(), outputs.clone())
        .with_connection(Connection::new("tgt.x", "src.y").with_src_indices(vec![0, 1]))
        .with_rev(true);
    (setup, inputs, outputs)
}

#[test]
fn test_dist_output_gathered_into_dup_input() {
    let results = ThreadComm::run(2, |comm| {
        let rank = comm.rank();
        let (setup, inputs, outputs) = dist_to_dup(rank);
        let plans = plan_transfers(&setup).unwrap();
        let mut set = TransferSet::create("", &plans, Arc::new(comm));

        let mut ins = inputs.local_vector(rank, VectorKind::Input);
        let mut outs = outputs.local_vector(rank, VectorKind::Output);
        outs.set("src.y", &[(rank + 1) as f64]).unwrap();
        set.transfer(Direction::Fwd, &PlanKey::full(), &mut ins, &mut outs, Mode::Fwd).unwrap();
        ins.get("tgt.x").unwrap().to_vec()
    });

    assert_eq!(results, vec![vec![1.0, 2.0], vec![1.0, 2.0]]);
}

#[test]
fn test_dup_input_sends_reverse_contribution_once() {
    let results = ThreadComm::run(2, |comm| {
        let rank = comm.rank();
        let (setup, inputs, outputs) = dist_to_dup(rank);
        let plans = plan_transfers(&setup).unwrap();
        let mut set = TransferSet::create("", &plans, Arc::new(comm));

        let mut d_ins = inputs.local_vector(rank, VectorKind::Input);
        let mut d_outs = outputs.local_vector(rank, VectorKind::Output);
        d_ins.set("tgt.x", &[1.0, 2.0]).unwrap();
        set.transfer(Direction::Rev, &PlanKey::full(), &mut d_ins, &mut d_outs, Mode::Rev).unwrap();
        d_outs.get("src.y").unwrap().to_vec()
    });

    // Each piece of the source receives the owning rank's copy only.
    assert_eq!(results, vec![vec![1.0], vec![2.0]]);
}

/// The same connection without src_indices: the planner maps the whole
/// distributed source onto the duplicated target itself.
fn dist_to_dup_implicit(rank: usize) -> (TransferSetup, IoTable, IoTable) {
    let (setup, inputs, outputs) = dist_to_dup(rank);
    let setup = TransferSetup { connections: vec![Connection::new("tgt.x", "src.y")], ..setup };
    (setup, inputs, outputs)
}

#[test]
fn test_implicit_src_indices_match_explicit_plans() {
    for rank in 0..2 {
        let implicit = plan_transfers(&dist_to_dup_implicit(rank).0).unwrap();
        let explicit = plan_transfers(&dist_to_dup(rank).0).unwrap();
        assert_eq!(implicit.fwd, explicit.fwd);
        assert_eq!(implicit.rev, explicit.rev);
    }
}

#[test]
fn test_implicit_src_indices_forward_and_reverse() {
    let results = ThreadComm::run(2, |comm| {
        let rank = comm.rank();
        let (setup, inputs, outputs) = dist_to_dup_implicit(rank);
        let plans = plan_transfers(&setup).unwrap();
        let mut set = TransferSet::create("", &plans, Arc::new(comm));

        let mut ins = inputs.local_vector(rank, VectorKind::Input);
        let mut outs = outputs.local_vector(rank, VectorKind::Output);
        outs.set("src.y", &[(rank + 1) as f64]).unwrap();
        set.transfer(Direction::Fwd, &PlanKey::sub("tgt"), &mut ins, &mut outs, Mode::Fwd).unwrap();

        let mut d_ins = inputs.local_vector(rank, VectorKind::Input);
        let mut d_outs = outputs.local_vector(rank, VectorKind::Output);
        d_ins.set("tgt.x", &[10.0, 20.0]).unwrap();
        set.transfer(Direction::Rev, &PlanKey::sub("src"), &mut d_ins, &mut d_outs, Mode::Rev).unwrap();

        (ins.get("tgt.x").unwrap().to_vec(), d_outs.get("src.y").unwrap().to_vec())
    });

    assert_eq!(results[0], (vec![1.0, 2.0], vec![10.0]));
    assert_eq!(results[1], (vec![1.0, 2.0], vec![20.0]));
}

/// `a.y` lives entirely on rank 0 and feeds a distributed `b.x` (crossed
/// src_indices) and a duplicated `c.x`.
fn fan_out(rank: usize) -> (TransferSetup, IoTable, IoTable) {
    let outputs = IoTable::new(2, vec![VarSpec::distributed("a.y", &[2, 0])]).unwrap();
    let inputs = IoTable::new(
        2,
        vec![VarSpec::distributed("b.x", &[1, 1]), VarSpec::duplicated("c.x", 2, 2)],
    )
    .unwrap();
    let crossed = if rank == 0 { vec![1] } else { vec![0] };
    let setup = TransferSetup::new("", rank, inputs.clone(), outputs.clone())
        .with_connection(Connection::new("b.x", "a.y").with_src_indices(crossed))
        .with_connection(Connection::new("c.x", "a.y").with_src_indices(vec![0, 1]))
        .with_rev(true);
    (setup, inputs, outputs)
}

#[test]
fn test_fan_out_forward_and_reverse() {
    let results = ThreadComm::run(2, |comm| {
        let rank = comm.rank();
        let (setup, inputs, outputs) = fan_out(rank);
        let plans = plan_transfers(&setup).unwrap();
        for (_, _, plan) in plans.iter() {
            assert_eq!(plan.input_indices().len(), plan.output_indices().len());
        }
        let mut set = TransferSet::create("", &plans, Arc::new(comm));

        let mut ins = inputs.local_vector(rank, VectorKind::Input);
        let mut outs = outputs.local_vector(rank, VectorKind::Output);
        if rank == 0 {
            outs.set("a.y", &[10.0, 20.0]).unwrap();
        }
        set.transfer(Direction::Fwd, &PlanKey::full(), &mut ins, &mut outs, Mode::Fwd).unwrap();
        let fwd = ins.as_slice().to_vec();

        let mut d_ins = inputs.local_vector(rank, VectorKind::Input);
        let mut d_outs = outputs.local_vector(rank, VectorKind::Output);
        let base = 3.0 * rank as f64;
        d_ins.set_val(&[base + 1.0, base + 2.0, base + 3.0]).unwrap();
        set.transfer(Direction::Rev, &PlanKey::sub("a"), &mut d_ins, &mut d_outs, Mode::Rev).unwrap();
        (fwd, d_outs.as_slice().to_vec())
    });

    // [b.x, c.x[0], c.x[1]] on each rank.
    assert_eq!(results[0].0, vec![20.0, 10.0, 20.0]);
    assert_eq!(results[1].0, vec![10.0, 10.0, 20.0]);

    // a.y[0] <- c.x[0] (rank 0) + b.x (rank 1); a.y[1] <- b.x (rank 0) + c.x[1] (rank 0).
    assert_eq!(results[0].1, vec![2.0 + 4.0, 1.0 + 3.0]);
    assert!(results[1].1.is_empty());
}

#[test]
fn test_fan_out_accumulates_once_per_target() {
    // Two distributed targets read the same distributed source piece by piece.
    let results = ThreadComm::run(2, |comm| {
        let rank = comm.rank();
        let outputs = IoTable::new(2, vec![VarSpec::distributed("a.y", &[1, 1])]).unwrap();
        let inputs = IoTable::new(
            2,
            vec![VarSpec::distributed("b.x", &[1, 1]), VarSpec::distributed("c.x", &[1, 1])],
        )
        .unwrap();
        let setup = TransferSetup::new("", rank, inputs.clone(), outputs.clone())
            .with_connection(Connection::new("b.x", "a.y"))
            .with_connection(Connection::new("c.x", "a.y"))
            .with_rev(true);
        let plans = plan_transfers(&setup).unwrap();
        let mut set = TransferSet::create("", &plans, Arc::new(comm));

        let mut ins = inputs.local_vector(rank, VectorKind::Input);
        let mut outs = outputs.local_vector(rank, VectorKind::Output);
        outs.set("a.y", &[0.5 + rank as f64]).unwrap();
        set.transfer(Direction::Fwd, &PlanKey::full(), &mut ins, &mut outs, Mode::Fwd).unwrap();

        let mut back = outputs.local_vector(rank, VectorKind::Output);
        set.transfer(Direction::Rev, &PlanKey::full(), &mut ins, &mut back, Mode::Rev).unwrap();
        (outs.as_slice().to_vec(), back.as_slice().to_vec())
    });

    for (source, accumulated) in results {
        assert_eq!(accumulated, vec![2.0 * source[0]]);
    }
}

#[test]
fn test_complex_shadow_matches_complex_transfer() {
    let results = ThreadComm::run(2, |comm| {
        let rank = comm.rank();
        let (setup, inputs, outputs) = dist_to_dup(rank);
        let plans = plan_transfers(&setup).unwrap();
        let mut set = TransferSet::create("", &plans, Arc::new(comm));

        let mut ins = inputs.local_vector(rank, VectorKind::Input);
        let mut outs = outputs.local_vector(rank, VectorKind::Output);
        ins.set_complex_step(true);
        outs.set_complex_step(true);
        let value = num_complex::Complex64::new(rank as f64 + 1.0, 1e-30 * (rank as f64 + 1.0));
        outs.set_complex("src.y", &[value]).unwrap();

        set.transfer(Direction::Fwd, &PlanKey::full(), &mut ins, &mut outs, Mode::Fwd).unwrap();
        ins.get_complex("tgt.x").unwrap()
    });

    for received in results {
        assert_eq!(received[0].re, 1.0);
        assert_eq!(received[0].im, 1e-30);
        assert_eq!(received[1].re, 2.0);
        assert_eq!(received[1].im, 2e-30);
    }
}

#[test]
fn test_real_transfer_leaves_shadow_alone_outside_complex_step() {
    let results = ThreadComm::run(2, |comm| {
        let rank = comm.rank();
        let (setup, inputs, outputs) = dist_to_dup(rank);
        let plans = plan_transfers(&setup).unwrap();
        let mut set = TransferSet::create("", &plans, Arc::new(comm));

        let mut ins = inputs.local_vector(rank, VectorKind::Input);
        let mut outs = outputs.local_vector(rank, VectorKind::Output);
        outs.alloc_complex();
        ins.alloc_complex();
        outs.set("src.y", &[1.0]).unwrap();
        set.transfer(Direction::Fwd, &PlanKey::full(), &mut ins, &mut outs, Mode::Fwd).unwrap();
        ins.set_complex_step(true);
        ins.imag().unwrap().to_vec()
    });

    for imag in results {
        assert_eq!(imag, vec![0.0, 0.0]);
    }
}

/// `a.y` duplicated on both ranks, `b.x` only on rank 0.
fn colored(rank: usize) -> (TransferSetup, IoTable, IoTable) {
    let outputs = IoTable::new(2, vec![VarSpec::duplicated("a.y", 1, 2)]).unwrap();
    let inputs = IoTable::new(2, vec![VarSpec::on_ranks("b.x", 1, &[0], 2)]).unwrap();
    let setup = TransferSetup::new("", rank, inputs.clone(), outputs.clone())
        .with_connection(Connection::new("b.x", "a.y"))
        .with_rev(true)
        .with_rev_par_coloring(true);
    (setup, inputs, outputs)
}

#[test]
fn test_nocolor_channel_reaches_other_copies() {
    let results = ThreadComm::run(2, |comm| {
        let rank = comm.rank();
        let (setup, inputs, outputs) = colored(rank);
        let plans = plan_transfers(&setup).unwrap();
        let mut set = TransferSet::create("", &plans, Arc::new(comm));
        let keys: Vec<PlanKey> = set.keys(Direction::Rev).cloned().collect();

        let mut d_ins = inputs.local_vector(rank, VectorKind::Input);
        if rank == 0 {
            d_ins.set("b.x", &[5.0]).unwrap();
        }
        let mut main = outputs.local_vector(rank, VectorKind::Output);
        set.transfer(Direction::Rev, &PlanKey::sub("a"), &mut d_ins, &mut main, Mode::Rev).unwrap();
        let mut side = outputs.local_vector(rank, VectorKind::Output);
        set.transfer(Direction::Rev, &PlanKey::sub("a").nocolor(), &mut d_ins, &mut side, Mode::Rev)
            .unwrap();
        (keys, main.as_slice().to_vec(), side.as_slice().to_vec())
    });

    // Both ranks registered the same keys, so their collectives line up.
    assert_eq!(results[0].0, results[1].0);
    assert_eq!(results[0].0.len(), 4);
    assert_eq!((results[0].1.clone(), results[0].2.clone()), (vec![5.0], vec![0.0]));
    assert_eq!((results[1].1.clone(), results[1].2.clone()), (vec![0.0], vec![5.0]));
}

#[test]
fn test_mismatched_plans_are_detected() {
    let results = ThreadComm::run(2, |comm| {
        let rank = comm.rank();
        let (setup, inputs, outputs) = fan_out(rank);
        let plans = plan_transfers(&setup).unwrap();
        let mut set = TransferSet::create("", &plans, Arc::new(comm));

        let mut ins = inputs.local_vector(rank, VectorKind::Input);
        let mut outs = outputs.local_vector(rank, VectorKind::Output);
        let key = if rank == 0 { PlanKey::sub("b") } else { PlanKey::sub("c") };
        set.transfer(Direction::Fwd, &key, &mut ins, &mut outs, Mode::Fwd).unwrap_err()
    });

    for err in results {
        assert!(matches!(err, TransferError::Comm(CommError::CollectiveMismatch { .. })), "{err}");
    }
}

#[test]
fn test_teardown_then_recreate_after_resize() {
    let results = ThreadComm::run(2, |comm| {
        let rank = comm.rank();
        let comm: Arc<dyn tessera::Communicator> = Arc::new(comm);
        let (setup, ..) = dist_to_dup(rank);
        let mut set = TransferSet::create("", &plan_transfers(&setup).unwrap(), comm.clone());
        set.teardown();

        // Resized structure: three entries on rank 0, one on rank 1.
        let outputs = IoTable::new(2, vec![VarSpec::distributed("src.y", &[3, 1])]).unwrap();
        let inputs = IoTable::new(2, vec![VarSpec::duplicated("tgt.x", 4, 2)]).unwrap();
        let setup = TransferSetup::new("", rank, inputs.clone(), outputs.clone())
            .with_connection(Connection::new("tgt.x", "src.y").with_src_indices(vec![3, 2, 1, 0]));
        let mut set = TransferSet::create("", &plan_transfers(&setup).unwrap(), comm);

        let mut ins: Vector = inputs.local_vector(rank, VectorKind::Input);
        let mut outs = outputs.local_vector(rank, VectorKind::Output);
        let values: Vec<f64> = if rank == 0 { vec![1.0, 2.0, 3.0] } else { vec![4.0] };
        outs.set("src.y", &values).unwrap();
        set.transfer(Direction::Fwd, &PlanKey::sub("tgt"), &mut ins, &mut outs, Mode::Fwd).unwrap();
        ins.get("tgt.x").unwrap().to_vec()
    });

    assert_eq!(results, vec![vec![4.0, 3.0, 2.0, 1.0]; 2]);
}

#[test]
fn test_reverse_failure_on_one_rank_fails_every_rank() {
    let results = ThreadComm::run(2, |comm| {
        let rank = comm.rank();
        let (setup, inputs, outputs) = dist_to_dup(rank);
        let plans = plan_transfers(&setup).unwrap();
        let mut set = TransferSet::create("", &plans, Arc::new(comm));

        // Rank 0 passes a seed laid out like the outputs.
        let mut d_ins = if rank == 0 {
            outputs.local_vector(rank, VectorKind::Input)
        } else {
            inputs.local_vector(rank, VectorKind::Input)
        };
        let mut d_outs = outputs.local_vector(rank, VectorKind::Output);
        let err = set
            .transfer(Direction::Rev, &PlanKey::full(), &mut d_ins, &mut d_outs, Mode::Rev)
            .unwrap_err();
        (err, d_outs.as_slice().to_vec())
    });

    assert!(matches!(results[0].0, TransferError::OutsideSegment { kind: "input", .. }), "{}", results[0].0);
    assert!(
        matches!(&results[1].0, TransferError::Comm(CommError::PeerFailed { peer: 0, .. })),
        "{}",
        results[1].0
    );
    // Nothing was accumulated anywhere.
    assert_eq!(results[0].1, vec![0.0]);
    assert_eq!(results[1].1, vec![0.0]);
}

#[test]
fn test_forward_failure_on_one_rank_fails_every_rank() {
    let results = ThreadComm::run(2, |comm| {
        let rank = comm.rank();
        let (setup, inputs, outputs) = dist_to_dup(rank);
        let plans = plan_transfers(&setup).unwrap();
        let mut set = TransferSet::create("", &plans, Arc::new(comm));

        let mut ins = if rank == 1 {
            outputs.local_vector(rank, VectorKind::Input)
        } else {
            inputs.local_vector(rank, VectorKind::Input)
        };
        let mut outs = outputs.local_vector(rank, VectorKind::Output);
        outs.set("src.y", &[1.0]).unwrap();
        set.transfer(Direction::Fwd, &PlanKey::full(), &mut ins, &mut outs, Mode::Fwd).unwrap_err()
    });

    assert!(
        matches!(&results[0], TransferError::Comm(CommError::PeerFailed { peer: 1, .. })),
        "{}",
        results[0]
    );
    assert!(matches!(results[1], TransferError::OutsideSegment { .. }), "{}", results[1]);
}
