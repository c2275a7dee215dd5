use approx::assert_abs_diff_eq;
use ndarray::{array, Array2};

use crate::operator::{
    normal_order, parse_build_pattern, twice_delta_m, BuildToken, DeltaQuantum, ElementaryOp,
    OpKind, OperatorComponent, OperatorExpansion, SpinOperator,
};

fn cre(orb: usize, twice_ms: i32) -> ElementaryOp {
    ElementaryOp::new(OpKind::Cre, orb, twice_ms)
}

fn des(orb: usize, twice_ms: i32) -> ElementaryOp {
    ElementaryOp::new(OpKind::Des, orb, twice_ms)
}

/// A spin-half creation-like operator on `orb` with scalar component matrices.
fn doublet(orb: usize, beta: f64, alpha: f64) -> SpinOperator {
    SpinOperator::builder()
        .orbs(vec![orb])
        .delta_quantum(DeltaQuantum {
            particles: 1,
            twice_s: 1,
        })
        .fermion(true)
        .components(vec![
            OperatorComponent::new(
                -1,
                array![[beta]],
                OperatorExpansion::elementary(cre(orb, -1)),
            ),
            OperatorComponent::new(
                1,
                array![[alpha]],
                OperatorExpansion::elementary(cre(orb, 1)),
            ),
        ])
        .build()
        .unwrap()
}

#[test]
fn test_operator_build_pattern_parsing() {
    let tokens = parse_build_pattern("((CC) D)").unwrap();
    assert_eq!(
        tokens,
        vec![
            BuildToken::Open,
            BuildToken::Open,
            BuildToken::Op(OpKind::Cre),
            BuildToken::Op(OpKind::Cre),
            BuildToken::Close,
            BuildToken::Op(OpKind::Des),
            BuildToken::Close,
        ]
    );
    assert_eq!(
        tokens.iter().map(|t| t.to_string()).collect::<String>(),
        "((CC)D)"
    );
    assert!(parse_build_pattern("(CX)").is_err());
}

#[test]
fn test_operator_elementary_quantum_numbers() {
    assert_eq!(cre(3, 1).spin_orbital, 6);
    assert_eq!(cre(3, -1).spin_orbital, 7);
    assert_eq!(cre(3, -1).orb(), 3);
    assert_eq!(twice_delta_m(&[cre(0, 1), des(1, 1)]), 0);
    assert_eq!(twice_delta_m(&[cre(0, 1), cre(1, 1)]), 2);
    assert_eq!(twice_delta_m(&[des(0, -1)]), 1);
    assert_eq!(cre(2, 1).to_string(), "C2a");
}

#[test]
fn test_operator_normal_order_signs() {
    let (cres, dess, sign) = normal_order(&[cre(0, 1), des(1, 1)]).unwrap();
    assert_eq!((cres, dess, sign), (vec![0], vec![2], 1.0));

    let (cres, dess, sign) = normal_order(&[des(0, 1), cre(1, 1)]).unwrap();
    assert_eq!((cres, dess, sign), (vec![2], vec![0], -1.0));

    let (cres, dess, sign) = normal_order(&[des(0, 1), cre(1, 1), cre(2, -1)]).unwrap();
    assert_eq!((cres, dess, sign), (vec![2, 5], vec![0], 1.0));

    assert!(normal_order(&[des(1, -1), cre(1, -1)]).is_err());
}

#[test]
fn test_operator_expansion_algebra() {
    let a = OperatorExpansion::elementary(cre(0, 1));
    let b = OperatorExpansion::elementary(des(1, -1));
    let ab = a.product(&b);
    assert_eq!(ab.terms(), &[(vec![cre(0, 1), des(1, -1)], 1.0)]);

    let abt = ab.transposed();
    assert_eq!(abt.terms(), &[(vec![cre(1, -1), des(0, 1)], 1.0)]);

    let mut sum = ab.scaled(2.0);
    sum.add_scaled(&ab, -2.0);
    assert!(sum.simplified(1e-14).is_empty());
    assert_eq!(OperatorExpansion::identity().product(&a), a);
}

#[test]
fn test_operator_delta_quantum_coupling() {
    let c = DeltaQuantum {
        particles: 1,
        twice_s: 1,
    };
    let sum = c + c;
    assert_eq!(
        sum,
        vec![
            DeltaQuantum {
                particles: 2,
                twice_s: 0
            },
            DeltaQuantum {
                particles: 2,
                twice_s: 2
            },
        ]
    );
    let diff = c - c;
    assert!(diff.iter().all(|dq| dq.particles == 0));
    assert_eq!(diff.len(), 2);
    assert_eq!(c.transposed().particles, -1);
}

#[test]
fn test_operator_builder_validation() {
    let res = SpinOperator::builder()
        .orbs(vec![0])
        .delta_quantum(DeltaQuantum {
            particles: 1,
            twice_s: 1,
        })
        .fermion(true)
        .components(vec![OperatorComponent::new(
            1,
            Array2::zeros((2, 2)),
            OperatorExpansion::default(),
        )])
        .build();
    assert!(res.is_err());
}

#[test]
fn test_operator_component_lookup_and_transpose_view() {
    let op = doublet(0, 2.0, 3.0);
    assert_eq!(op.dim(), 1);
    assert_eq!(op.component(1).unwrap().matrix()[(0, 0)], 3.0);
    assert!(op.component(0).is_none());
    assert!(op.component(3).is_none());

    let view = op.view(true);
    assert_eq!(view.delta_quantum().particles, -1);
    let comp = view.component(1).unwrap();
    assert_eq!(comp.matrix[(0, 0)], 2.0);
    assert_eq!(comp.expansion.terms(), &[(vec![des(0, -1)], 1.0)]);
    // The underlying operator is untouched.
    assert_eq!(
        op.component(-1).unwrap().expansion().terms(),
        &[(vec![cre(0, -1)], 1.0)]
    );
}

#[test]
fn test_operator_coupling_to_singlet_and_triplet() {
    let a = doublet(0, 2.0, 3.0);
    let b = doublet(1, 5.0, 7.0);
    let r2 = 0.5f64.sqrt();

    let singlet = SpinOperator::coupled(
        &a.view(false),
        &b.view(false),
        DeltaQuantum {
            particles: 2,
            twice_s: 0,
        },
        vec![0, 1],
    )
    .unwrap();
    assert_eq!(singlet.components().len(), 1);
    assert!(!singlet.fermion());
    let comp = singlet.component(0).unwrap();
    assert_abs_diff_eq!(comp.matrix()[(0, 0)], r2 * (3.0 * 5.0 - 2.0 * 7.0), epsilon = 1e-14);
    assert_eq!(comp.expansion().terms().len(), 2);
    for (string, coeff) in comp.expansion().terms() {
        assert_eq!(twice_delta_m(string), 0);
        assert_abs_diff_eq!(coeff.abs(), r2, epsilon = 1e-14);
    }

    let triplet = SpinOperator::coupled(
        &a.view(false),
        &b.view(false),
        DeltaQuantum {
            particles: 2,
            twice_s: 2,
        },
        vec![0, 1],
    )
    .unwrap();
    assert_eq!(triplet.components().len(), 3);
    assert_abs_diff_eq!(
        triplet.component(2).unwrap().matrix()[(0, 0)],
        21.0,
        epsilon = 1e-14
    );
    assert_abs_diff_eq!(
        triplet.component(-2).unwrap().matrix()[(0, 0)],
        10.0,
        epsilon = 1e-14
    );

    let forbidden = SpinOperator::coupled(
        &a.view(false),
        &b.view(false),
        DeltaQuantum {
            particles: 2,
            twice_s: 4,
        },
        vec![0, 1],
    );
    assert!(forbidden.is_err());
}
