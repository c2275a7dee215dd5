use approx::assert_abs_diff_eq;
use itertools::Itertools;
use proptest::prelude::*;

use crate::npdm::export::DenseNpdmArray;
use crate::npdm::export::NpdmExporter;
use crate::npdm::sparse_array::{canonical_key, NpdmKey, NpdmSparseArray};

#[test]
fn test_sparse_array_canonical_keys() {
    assert_eq!(
        canonical_key(&[3, 1, 0, 2]),
        Some((NpdmKey(vec![1, 3, 0, 2]), -1.0))
    );
    assert_eq!(
        canonical_key(&[3, 1, 2, 0]),
        Some((NpdmKey(vec![1, 3, 0, 2]), 1.0))
    );
    assert_eq!(canonical_key(&[2, 2, 0, 1]), None);
    assert_eq!(canonical_key(&[0, 1, 3]), None);
    assert_eq!(canonical_key(&[]), Some((NpdmKey(vec![]), 1.0)));
}

#[test]
fn test_sparse_array_accumulates_contributions() {
    let mut store = NpdmSparseArray::new(2);
    store.accumulate(&[0, 1, 2, 3], 0.25).unwrap();
    store.accumulate(&[1, 0, 2, 3], 0.5).unwrap();
    assert_eq!(store.len(), 1);
    assert_abs_diff_eq!(store.get(&[0, 1, 2, 3]), -0.25, epsilon = 1e-15);
    assert_abs_diff_eq!(store.get(&[0, 1, 3, 2]), 0.25, epsilon = 1e-15);

    // Identically vanishing elements are never stored.
    store.accumulate(&[1, 1, 2, 3], 1.0).unwrap();
    assert_eq!(store.len(), 1);

    // Exact cancellation removes the entry.
    store.accumulate(&[0, 1, 2, 3], 0.25).unwrap();
    assert!(store.is_empty());
    assert_eq!(store.get(&[0, 1, 2, 3]), 0.0);

    assert!(store.accumulate(&[0, 1], 1.0).is_err());
}

#[test]
fn test_sparse_array_merge() {
    let mut a = NpdmSparseArray::new(1);
    a.accumulate(&[0, 0], 1.0).unwrap();
    a.accumulate(&[0, 2], 0.5).unwrap();
    let mut b = NpdmSparseArray::new(1);
    b.accumulate(&[2, 0], 0.5).unwrap();
    b.accumulate(&[0, 2], 0.25).unwrap();
    a.merge(&b).unwrap();
    assert_eq!(a.len(), 3);
    assert_abs_diff_eq!(a.get(&[0, 2]), 0.75, epsilon = 1e-15);
    assert_abs_diff_eq!(a.get(&[2, 0]), 0.5, epsilon = 1e-15);

    assert!(a.merge(&NpdmSparseArray::new(2)).is_err());

    let mut c = NpdmSparseArray::new(1);
    c.accumulate_elements(b.iter().map(|(key, value)| (key.clone(), *value)))
        .unwrap();
    assert_eq!(c.sorted_elements(), b.sorted_elements());
    assert!(c
        .accumulate_elements(vec![(NpdmKey(vec![0, 1, 2, 3]), 1.0)])
        .is_err());
}

#[test]
fn test_sparse_array_drain_sorted_then_cleared() {
    let mut store = NpdmSparseArray::new(1);
    store.accumulate(&[3, 1], 2.0).unwrap();
    store.accumulate(&[0, 1], 1.0).unwrap();
    store.accumulate(&[1, 0], 1.0).unwrap();
    let sorted = store.sorted_elements();
    assert_eq!(
        sorted.iter().map(|(key, _)| key.clone()).collect_vec(),
        vec![vec![0, 1], vec![1, 0], vec![3, 1]]
    );

    let mut dense = DenseNpdmArray::new(1, std::env::temp_dir());
    dense.resize(4);
    let n = store.drain_to(&mut dense, 0, 0).unwrap();
    assert_eq!(n, 3);
    assert!(store.is_empty());
    assert_abs_diff_eq!(dense.array()[&[3, 1][..]], 2.0, epsilon = 1e-15);
}

proptest! {
    #[test]
    fn test_sparse_array_permutation_invariance(
        cres in proptest::sample::subsequence((0..8usize).collect::<Vec<_>>(), 2),
        dess in proptest::sample::subsequence((0..8usize).collect::<Vec<_>>(), 2),
        value in -1.0f64..1.0,
        swap_cre in any::<bool>(),
        swap_des in any::<bool>(),
    ) {
        let mut reference = NpdmSparseArray::new(2);
        let indices = cres.iter().chain(dess.iter()).copied().collect_vec();
        reference.accumulate(&indices, value).unwrap();

        let mut permuted_cres = cres.clone();
        let mut permuted_dess = dess.clone();
        let mut sign = 1.0;
        if swap_cre {
            permuted_cres.swap(0, 1);
            sign = -sign;
        }
        if swap_des {
            permuted_dess.swap(0, 1);
            sign = -sign;
        }
        let mut permuted = NpdmSparseArray::new(2);
        let permuted_indices = permuted_cres
            .iter()
            .chain(permuted_dess.iter())
            .copied()
            .collect_vec();
        permuted.accumulate(&permuted_indices, sign * value).unwrap();

        prop_assert_eq!(reference.sorted_elements(), permuted.sorted_elements());
    }
}

/// Returns contribution lists over a four-spin-orbital space, with repeated and permuted tuples,
/// paired with a shuffled copy.
fn contribution_lists() -> impl Strategy<Value = (Vec<([usize; 4], f64)>, Vec<([usize; 4], f64)>)>
{
    proptest::collection::vec((proptest::array::uniform4(0..4usize), -1.0f64..1.0), 1..48)
        .prop_flat_map(|list| (Just(list.clone()), Just(list).prop_shuffle()))
}

proptest! {
    #[test]
    fn test_sparse_array_call_order_invariance((list, shuffled) in contribution_lists()) {
        let mut forward = NpdmSparseArray::new(2);
        list.iter()
            .try_for_each(|(indices, value)| forward.accumulate(indices, *value))
            .unwrap();
        let mut reordered = NpdmSparseArray::new(2);
        shuffled
            .iter()
            .try_for_each(|(indices, value)| reordered.accumulate(indices, *value))
            .unwrap();

        for (key, _) in forward.sorted_elements().iter().chain(reordered.sorted_elements().iter()) {
            prop_assert!((forward.get(key) - reordered.get(key)).abs() < 1e-12);
        }
    }

    #[test]
    fn test_sparse_array_drained_sums_match_contributions(
        (list, _) in contribution_lists(),
    ) {
        let mut store = NpdmSparseArray::new(2);
        list.iter()
            .try_for_each(|(indices, value)| store.accumulate(indices, *value))
            .unwrap();
        let direct_total = list
            .iter()
            .filter_map(|(indices, value)| {
                canonical_key(indices).map(|(_, sign)| sign * value)
            })
            .sum::<f64>();
        let stored = store.sorted_elements();

        let mut dense = DenseNpdmArray::new(2, std::env::temp_dir());
        dense.resize(4);
        store.drain_to(&mut dense, 0, 0).unwrap();
        prop_assert!(store.is_empty());

        for (key, value) in stored.iter() {
            prop_assert!((dense.array()[&key[..]] - value).abs() < 1e-12);
        }
        let canonical_total = (0..4usize)
            .combinations(2)
            .cartesian_product((0..4usize).combinations(2))
            .map(|(cres, dess)| {
                let key = cres.into_iter().chain(dess).collect_vec();
                dense.array()[&key[..]]
            })
            .sum::<f64>();
        prop_assert!((canonical_total - direct_total).abs() < 1e-10);
    }
}
