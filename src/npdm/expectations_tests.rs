use approx::assert_abs_diff_eq;
use itertools::Itertools;

use crate::block::fock::{FockBlock, FockSpace, FockSuperblock, FockWavefunction, Residency};
use crate::block::Superblock;
use crate::npdm::expectations::NpdmExpectations;
use crate::npdm::sparse_array::canonical_key;
use crate::npdm::wrappers::{NpdmOpWrapper, NpdmSpinOps, NpdmSpinOpsBase};

fn instance(wrapper: NpdmOpWrapper, block: &FockBlock, idx: usize) -> NpdmSpinOpsBase {
    let mut ops = NpdmSpinOps::new(wrapper, Some(block)).unwrap();
    ops.set_local_ops(idx).unwrap();
    ops.base().clone()
}

fn n_instances(wrapper: NpdmOpWrapper, block: &FockBlock) -> usize {
    NpdmSpinOps::new(wrapper, Some(block)).unwrap().n_instances()
}

/// Checks decomposed elements of one triple against brute-force Fock-space values.
fn check_triple(
    superblock: &FockSuperblock,
    wfn: &FockWavefunction,
    triple: [(NpdmOpWrapper, &NpdmSpinOpsBase); 3],
    order: usize,
) {
    let space = superblock.space();
    let evaluator = NpdmExpectations::new(
        superblock,
        wfn,
        wfn,
        triple.map(|(_, base)| base),
        order,
        0.0,
        1e-10,
    );
    let elements = evaluator.get_nonspin_adapted_expectations().unwrap();
    let c = wfn.coefficients();
    for (indices, value) in elements.iter() {
        assert_abs_diff_eq!(*value, space.npdm_element(c, c, indices), epsilon = 1e-10);
    }

    let (cre_orbs, des_orbs) = triple.iter().fold(
        (vec![], vec![]),
        |(mut cres, mut dess), (wrapper, base)| {
            let (c, d) = wrapper.split_indices(&base.indices).unwrap();
            cres.extend(c);
            dess.extend(d);
            (cres, dess)
        },
    );
    let orbs = cre_orbs.into_iter().chain(des_orbs).collect_vec();
    for spins in 0..(1usize << orbs.len()) {
        let indices = orbs
            .iter()
            .enumerate()
            .map(|(pos, orb)| 2 * orb + ((spins >> pos) & 1))
            .collect_vec();
        let Some((key, _)) = canonical_key(&indices) else {
            continue;
        };
        let brute = space.npdm_element(c, c, key.indices());
        if brute.abs() > 1e-8 {
            assert!(
                elements.iter().any(|(indices, _)| indices == key.indices()),
                "Element {key} = {brute} is missing."
            );
        }
    }
}

#[test]
fn test_expectations_cd_alone_gives_two_channels() {
    let space = FockSpace::new(3).unwrap();
    let superblock = FockSuperblock::new(space.clone(), 1, Residency::Replicated).unwrap();
    let wfn = FockWavefunction::random(&space, 3, 1, 11).unwrap();
    let null_dot = instance(NpdmOpWrapper::Null, superblock.dot_block(), 0);
    let null_rhs = instance(NpdmOpWrapper::Null, superblock.right_block(), 0);
    let cd = instance(NpdmOpWrapper::CD, superblock.left_block(), 0);

    let evaluator = NpdmExpectations::new(
        &superblock,
        &wfn,
        &wfn,
        [&cd, &null_dot, &null_rhs],
        1,
        0.0,
        1e-10,
    );
    let expectations = evaluator.get_spin_adapted_expectations().unwrap();
    assert_eq!(expectations.len(), 2);
    assert_eq!(
        expectations
            .iter()
            .map(|exp| (exp.twice_s12, exp.twice_k))
            .collect_vec(),
        vec![(0, 0), (2, 2)]
    );
    assert!(expectations[0].to_string().starts_with("channels (0, 0, 0) S12 = 0 K = 0"));

    // Values and expansions are kept in lockstep.
    let c = wfn.coefficients();
    for expectation in expectations.iter() {
        let from_expansion = expectation
            .expansion()
            .terms()
            .iter()
            .map(|(string, coeff)| coeff * space.string_expectation(c, c, string))
            .sum::<f64>();
        assert_abs_diff_eq!(expectation.value, from_expansion, epsilon = 1e-12);
    }
    let n_alpha = space.npdm_element(c, c, &[0, 0]);
    let n_beta = space.npdm_element(c, c, &[1, 1]);
    assert_abs_diff_eq!(
        expectations[0].value.abs(),
        (n_alpha - n_beta).abs() / 2f64.sqrt(),
        epsilon = 1e-12
    );
    assert_abs_diff_eq!(
        expectations[1].value.abs(),
        (n_alpha + n_beta) / 2f64.sqrt(),
        epsilon = 1e-12
    );

    check_triple(
        &superblock,
        &wfn,
        [
            (NpdmOpWrapper::CD, &cd),
            (NpdmOpWrapper::Null, &null_dot),
            (NpdmOpWrapper::Null, &null_rhs),
        ],
        1,
    );
}

#[test]
fn test_expectations_one_particle_triples() {
    let space = FockSpace::new(4).unwrap();
    let superblock = FockSuperblock::new(space.clone(), 1, Residency::Replicated).unwrap();
    let wfn = FockWavefunction::random(&space, 4, 0, 5).unwrap();
    let left = superblock.left_block();
    let dot = superblock.dot_block();
    let right = superblock.right_block();
    let null = |block: &FockBlock| instance(NpdmOpWrapper::Null, block, 0);

    for idx in 0..n_instances(NpdmOpWrapper::CD, right) {
        let cd = instance(NpdmOpWrapper::CD, right, idx);
        check_triple(
            &superblock,
            &wfn,
            [
                (NpdmOpWrapper::Null, &null(left)),
                (NpdmOpWrapper::Null, &null(dot)),
                (NpdmOpWrapper::CD, &cd),
            ],
            1,
        );
    }

    let c0 = instance(NpdmOpWrapper::C, left, 0);
    let d1 = instance(NpdmOpWrapper::D, dot, 0);
    check_triple(
        &superblock,
        &wfn,
        [
            (NpdmOpWrapper::C, &c0),
            (NpdmOpWrapper::D, &d1),
            (NpdmOpWrapper::Null, &null(right)),
        ],
        1,
    );
    for idx in 0..n_instances(NpdmOpWrapper::C, right) {
        let d = instance(NpdmOpWrapper::D, right, idx);
        let c = instance(NpdmOpWrapper::C, dot, 0);
        check_triple(
            &superblock,
            &wfn,
            [
                (NpdmOpWrapper::Null, &null(left)),
                (NpdmOpWrapper::C, &c),
                (NpdmOpWrapper::D, &d),
            ],
            1,
        );
    }
}

#[test]
fn test_expectations_two_particle_triples() {
    let space = FockSpace::new(4).unwrap();
    let superblock = FockSuperblock::new(space.clone(), 1, Residency::Replicated).unwrap();
    let wfn = FockWavefunction::random(&space, 3, -1, 23).unwrap();
    let left = superblock.left_block();
    let dot = superblock.dot_block();
    let right = superblock.right_block();
    let null = |block: &FockBlock| instance(NpdmOpWrapper::Null, block, 0);

    // C | D | CD
    let c0 = instance(NpdmOpWrapper::C, left, 0);
    let d1 = instance(NpdmOpWrapper::D, dot, 0);
    for idx in 0..n_instances(NpdmOpWrapper::CD, right) {
        let cd = instance(NpdmOpWrapper::CD, right, idx);
        check_triple(
            &superblock,
            &wfn,
            [
                (NpdmOpWrapper::C, &c0),
                (NpdmOpWrapper::D, &d1),
                (NpdmOpWrapper::CD, &cd),
            ],
            2,
        );
    }

    // CC | - | DD
    let cc = instance(NpdmOpWrapper::CC, left, 0);
    for idx in 0..n_instances(NpdmOpWrapper::DD, right) {
        let dd = instance(NpdmOpWrapper::DD, right, idx);
        check_triple(
            &superblock,
            &wfn,
            [
                (NpdmOpWrapper::CC, &cc),
                (NpdmOpWrapper::Null, &null(dot)),
                (NpdmOpWrapper::DD, &dd),
            ],
            2,
        );
    }

    // - | CCD | D and CCD | - | D on single-site blocks
    let ccd_dot = instance(NpdmOpWrapper::CompoundCCD, dot, 0);
    let ccd_left = instance(NpdmOpWrapper::CompoundCCD, left, 0);
    for idx in 0..n_instances(NpdmOpWrapper::D, right) {
        let d = instance(NpdmOpWrapper::D, right, idx);
        check_triple(
            &superblock,
            &wfn,
            [
                (NpdmOpWrapper::Null, &null(left)),
                (NpdmOpWrapper::CompoundCCD, &ccd_dot),
                (NpdmOpWrapper::D, &d),
            ],
            2,
        );
        check_triple(
            &superblock,
            &wfn,
            [
                (NpdmOpWrapper::CompoundCCD, &ccd_left),
                (NpdmOpWrapper::Null, &null(dot)),
                (NpdmOpWrapper::D, &d),
            ],
            2,
        );
    }

    // C | CDD | -
    let cdd = instance(NpdmOpWrapper::CompoundCDD, dot, 0);
    check_triple(
        &superblock,
        &wfn,
        [
            (NpdmOpWrapper::C, &c0),
            (NpdmOpWrapper::CompoundCDD, &cdd),
            (NpdmOpWrapper::Null, &null(right)),
        ],
        2,
    );

    // - | CCDD | -
    let ccdd = instance(NpdmOpWrapper::CompoundCCDD, dot, 0);
    check_triple(
        &superblock,
        &wfn,
        [
            (NpdmOpWrapper::Null, &null(left)),
            (NpdmOpWrapper::CompoundCCDD, &ccdd),
            (NpdmOpWrapper::Null, &null(right)),
        ],
        2,
    );
}

#[test]
fn test_expectations_wrong_order_is_fatal() {
    let space = FockSpace::new(3).unwrap();
    let superblock = FockSuperblock::new(space.clone(), 1, Residency::Replicated).unwrap();
    let wfn = FockWavefunction::random(&space, 2, 0, 3).unwrap();
    let null_dot = instance(NpdmOpWrapper::Null, superblock.dot_block(), 0);
    let null_rhs = instance(NpdmOpWrapper::Null, superblock.right_block(), 0);
    let cd = instance(NpdmOpWrapper::CD, superblock.left_block(), 0);
    let evaluator = NpdmExpectations::new(
        &superblock,
        &wfn,
        &wfn,
        [&cd, &null_dot, &null_rhs],
        2,
        0.0,
        1e-10,
    );
    assert!(evaluator.get_nonspin_adapted_expectations().is_err());
}

#[test]
fn test_expectations_screening() {
    let space = FockSpace::new(3).unwrap();
    let superblock = FockSuperblock::new(space.clone(), 1, Residency::Replicated).unwrap();
    // A single closed-shell determinant has no density on empty orbitals.
    let wfn = FockWavefunction::from_determinants(&space, &[(vec![0, 1], 1.0)]).unwrap();
    let null_dot = instance(NpdmOpWrapper::Null, superblock.dot_block(), 0);
    let null_rhs = instance(NpdmOpWrapper::Null, superblock.right_block(), 0);
    let cd = instance(NpdmOpWrapper::CD, superblock.left_block(), 0);
    let screened = NpdmExpectations::new(
        &superblock,
        &wfn,
        &wfn,
        [&cd, &null_dot, &null_rhs],
        1,
        1e-12,
        1e-10,
    )
    .get_nonspin_adapted_expectations()
    .unwrap();
    assert_eq!(screened.len(), 2);
    for (_, value) in screened {
        assert_abs_diff_eq!(value, 1.0, epsilon = 1e-12);
    }

    let cd_right = instance(NpdmOpWrapper::CD, superblock.right_block(), 0);
    let null_lhs = instance(NpdmOpWrapper::Null, superblock.left_block(), 0);
    let empty = NpdmExpectations::new(
        &superblock,
        &wfn,
        &wfn,
        [&null_lhs, &null_dot, &cd_right],
        1,
        1e-12,
        1e-10,
    )
    .get_nonspin_adapted_expectations()
    .unwrap();
    assert!(empty.is_empty());
}
