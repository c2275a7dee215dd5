use itertools::Itertools;

use crate::block::fock::{FockBlock, FockSpace, Residency};
use crate::npdm::distribution::{
    all_gather_serde, assign_descriptors, get_all_mpi_ops, get_mpi_max_lhs_size, load_bound,
    Communicator, LocalCommunicator, LocalWorld, NpdmOpDescriptor, PeerAborted, SingleRank,
};
use crate::npdm::wrappers::{NpdmOpWrapper, NpdmSpinOps};
use crate::operator::OpKind;

fn run_world<T, F>(size: usize, f: F) -> Vec<T>
where
    T: Send,
    F: Fn(LocalCommunicator) -> T + Sync,
{
    let comms = LocalWorld::new(size).unwrap();
    std::thread::scope(|s| {
        let handles = comms
            .into_iter()
            .map(|comm| s.spawn(|| f(comm)))
            .collect_vec();
        handles
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .collect_vec()
    })
}

fn descriptor(local_index: usize, resident_rank: usize) -> NpdmOpDescriptor {
    NpdmOpDescriptor {
        pattern: vec![OpKind::Cre],
        local_index,
        indices: vec![local_index as i32],
        size: 1,
        resident_rank,
    }
}

#[test]
fn test_distribution_single_rank() {
    let comm = SingleRank;
    assert_eq!(comm.rank(), 0);
    assert_eq!(comm.size(), 1);
    assert_eq!(comm.all_gather(vec![1, 2]).unwrap(), vec![vec![1, 2]]);
    assert_eq!(
        comm.exchange(vec![(0, vec![3])]).unwrap(),
        vec![(0, vec![3])]
    );
    assert!(comm.exchange(vec![(1, vec![3])]).is_err());
    assert_eq!(get_mpi_max_lhs_size(&comm, 7).unwrap(), 7);
}

#[test]
fn test_distribution_local_world_collectives() {
    assert!(LocalWorld::new(0).is_err());
    let results = run_world(3, |comm| {
        let rank = comm.rank();
        let gathered = all_gather_serde(&comm, &(rank * 10)).unwrap();
        // Every rank sends one message to each rank above it.
        let messages = (rank + 1..comm.size())
            .map(|dest| (dest, vec![rank as u8, dest as u8]))
            .collect_vec();
        let received = comm.exchange(messages).unwrap();
        // A second round must not see messages of the first.
        let again = comm.exchange(vec![]).unwrap();
        let max_size = get_mpi_max_lhs_size(&comm, rank + 4).unwrap();
        (gathered, received, again, max_size)
    });
    for (rank, (gathered, received, again, max_size)) in results.into_iter().enumerate() {
        assert_eq!(gathered, vec![0, 10, 20]);
        let expected = (0..rank)
            .map(|src| (src, vec![src as u8, rank as u8]))
            .collect_vec();
        assert_eq!(received, expected);
        assert!(again.is_empty());
        assert_eq!(max_size, 6);
    }
}

#[test]
fn test_distribution_exchange_rejects_unknown_rank() {
    let results = run_world(2, |comm| comm.exchange(vec![(5, vec![])]).is_err());
    assert_eq!(results, vec![true, true]);
}

#[test]
fn test_distribution_departed_rank_fails_pending_collectives() {
    let results = run_world(3, |comm| {
        let first = comm.all_gather(vec![comm.rank() as u8]).map(|_| ());
        if comm.rank() == 2 {
            // Leaves without joining the second round.
            return (first, None);
        }
        let second = comm.all_gather(vec![]).map(|_| ());
        let third = comm.exchange(vec![]).map(|_| ());
        (first, Some((second, third)))
    });
    for (rank, (first, rest)) in results.into_iter().enumerate() {
        assert!(first.is_ok());
        if let Some((second, third)) = rest {
            for err in [second.unwrap_err(), third.unwrap_err()] {
                assert_eq!(
                    err.downcast_ref::<PeerAborted>(),
                    Some(&PeerAborted { rank, origin: 2 })
                );
            }
        }
    }
}

#[test]
fn test_distribution_abort_fails_waiting_rank() {
    let results = run_world(2, |comm| {
        if comm.rank() == 0 {
            comm.abort();
            comm.all_gather(vec![]).is_err()
        } else {
            comm.all_gather(vec![])
                .unwrap_err()
                .is::<PeerAborted>()
        }
    });
    assert_eq!(results, vec![true, true]);
    assert!(SingleRank.all_gather(vec![1]).is_ok());
    SingleRank.abort();
    assert!(SingleRank.all_gather(vec![1]).is_ok());
}

#[test]
fn test_distribution_load_bound() {
    assert_eq!(load_bound(10, 3, None), 4);
    assert_eq!(load_bound(9, 3, None), 3);
    assert_eq!(load_bound(10, 3, Some(2)), 4);
    assert_eq!(load_bound(10, 3, Some(8)), 8);
    assert_eq!(load_bound(0, 3, None), 0);
}

#[test]
fn test_distribution_assignment_coverage() {
    for size in 1..=4 {
        for n_total in [0, 1, 5, 9] {
            // Everything resident on rank 0 forces overflow.
            let global = (0..n_total).map(|idx| descriptor(idx, 0)).collect_vec();
            for configured in [None, Some(1), Some(3), Some(20)] {
                let bound = load_bound(n_total, size, configured);
                let assigned = assign_descriptors(&global, size, bound).unwrap();
                assert_eq!(assigned.len(), n_total);
                let counts = assigned.iter().counts();
                assert!(counts.values().all(|&count| count <= bound));
                assert!(assigned.iter().all(|&rank| rank < size));
                // Resident rank keeps what it can.
                assert_eq!(
                    assigned.iter().filter(|&&rank| rank == 0).count(),
                    n_total.min(bound)
                );
            }
        }
    }

    let global = (0..6).map(|idx| descriptor(idx, idx % 2)).collect_vec();
    assert_eq!(
        assign_descriptors(&global, 3, 2).unwrap(),
        vec![0, 1, 0, 1, 2, 2]
    );
    assert!(assign_descriptors(&global, 3, 1).is_err());
    assert!(assign_descriptors(&global, 0, 6).is_err());
}

#[test]
fn test_distribution_get_all_mpi_ops_covers_every_instance() {
    let space = FockSpace::new(4).unwrap();
    let reference = FockBlock::new(&space, vec![0, 1, 2], Residency::Replicated).unwrap();
    for wrapper in [NpdmOpWrapper::C, NpdmOpWrapper::CD, NpdmOpWrapper::DD] {
        let ops = NpdmSpinOps::new(wrapper, Some(&reference)).unwrap();
        let expected = (0..ops.size())
            .map(|idx| ops.describe(idx).unwrap())
            .sorted()
            .collect_vec();
        for size in 1..=3 {
            for max_lhs_per_rank in [None, Some(1)] {
                let per_rank = run_world(size, |comm| {
                    let space = FockSpace::new(4).unwrap();
                    let residency = Residency::RoundRobin {
                        rank: comm.rank(),
                        size: comm.size(),
                    };
                    let block = FockBlock::new(&space, vec![0, 1, 2], residency).unwrap();
                    let mut ops = NpdmSpinOps::new(wrapper, Some(&block)).unwrap();
                    get_all_mpi_ops(&comm, &mut ops, max_lhs_per_rank)
                        .unwrap()
                        .into_iter()
                        .map(|base| {
                            assert_eq!(base.op_reps.len(), wrapper.mults().len());
                            base.indices
                        })
                        .collect_vec()
                });
                let bound = load_bound(expected.len(), size, max_lhs_per_rank);
                assert!(per_rank.iter().all(|indices| indices.len() <= bound));
                let all = per_rank.into_iter().flatten().sorted().collect_vec();
                assert_eq!(all, expected);
            }
        }
    }
}

#[test]
fn test_distribution_null_instance_assigned_once() {
    let per_rank = run_world(3, |comm| {
        let space = FockSpace::new(3).unwrap();
        let block = FockBlock::new(&space, vec![0], Residency::Replicated).unwrap();
        let mut ops = NpdmSpinOps::new(NpdmOpWrapper::Null, Some(&block)).unwrap();
        get_all_mpi_ops(&comm, &mut ops, None).unwrap().len()
    });
    assert_eq!(per_rank, vec![1, 0, 0]);
}
