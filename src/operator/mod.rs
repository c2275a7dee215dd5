//! Spin-adapted block operators.
//!
//! A [`SpinOperator`] is a spherical-tensor operator of doubled spin $`2S`$ acting inside one
//! renormalised block. It stores one matrix per spin projection $`M`$ together with the
//! second-quantised [`OperatorExpansion`] that the matrix represents, so that every algebraic
//! manipulation (products, transposition, spin coupling) is applied to both in lockstep.

use std::borrow::Cow;
use std::fmt;
use std::ops::{Add, Sub};

use anyhow::{self, ensure, format_err};
use derive_builder::Builder;
use indexmap::IndexMap;
use itertools::Itertools;
use ndarray::{Array2, ArrayView2};
use serde::{Deserialize, Serialize};

use crate::angmom::{clebsch_gordan, coupled_spins, spin_label, twice_projections};

#[cfg(test)]
#[path = "operator_tests.rs"]
mod operator_tests;

// ================
// Enum definitions
// ================

/// An enumerated type for the kinds of elementary fermionic operators.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum OpKind {
    /// Variant for creation operators.
    Cre,

    /// Variant for destruction operators.
    Des,
}

impl OpKind {
    /// Returns the kind obtained under Hermitian transposition.
    pub fn transposed(&self) -> Self {
        match self {
            OpKind::Cre => OpKind::Des,
            OpKind::Des => OpKind::Cre,
        }
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpKind::Cre => write!(f, "C"),
            OpKind::Des => write!(f, "D"),
        }
    }
}

/// An enumerated type for the tokens of an operator build pattern such as `((CC)D)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BuildToken {
    /// Variant for an opening group.
    Open,

    /// Variant for a closing group.
    Close,

    /// Variant for an elementary operator.
    Op(OpKind),
}

impl fmt::Display for BuildToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BuildToken::Open => write!(f, "("),
            BuildToken::Close => write!(f, ")"),
            BuildToken::Op(kind) => write!(f, "{kind}"),
        }
    }
}

/// Parses a build pattern written with `(`, `)`, `C` and `D`. Whitespace is ignored.
pub fn parse_build_pattern(pattern: &str) -> Result<Vec<BuildToken>, anyhow::Error> {
    pattern
        .chars()
        .filter(|c| !c.is_whitespace())
        .map(|c| match c {
            '(' => Ok(BuildToken::Open),
            ')' => Ok(BuildToken::Close),
            'C' => Ok(BuildToken::Op(OpKind::Cre)),
            'D' => Ok(BuildToken::Op(OpKind::Des)),
            _ => Err(format_err!("Invalid build-pattern token `{c}`.")),
        })
        .collect()
}

// ==================
// Struct definitions
// ==================

// ------------------
// Elementary strings
// ------------------

/// A structure representing an elementary creation or destruction operator on one
/// spin-orbital. The spin-orbital index is `2 * orbital + spin`, where spin `0` is $`\alpha`$
/// and spin `1` is $`\beta`$.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ElementaryOp {
    /// The kind of the operator.
    pub kind: OpKind,

    /// The spin-orbital the operator acts on.
    pub spin_orbital: usize,
}

impl ElementaryOp {
    /// Constructs an elementary operator on spatial orbital `orb` with doubled spin projection
    /// `twice_ms` of the *orbital*, *i.e.* $`+1`$ for $`\alpha`$ and $`-1`$ for $`\beta`$.
    pub fn new(kind: OpKind, orb: usize, twice_ms: i32) -> Self {
        let spin = if twice_ms > 0 { 0 } else { 1 };
        Self {
            kind,
            spin_orbital: 2 * orb + spin,
        }
    }

    /// Returns the spatial orbital of this operator.
    pub fn orb(&self) -> usize {
        self.spin_orbital / 2
    }

    /// Returns the doubled change in $`M_S`$ that this operator effects.
    pub fn twice_delta_m(&self) -> i32 {
        let twice_ms = if self.spin_orbital % 2 == 0 { 1 } else { -1 };
        match self.kind {
            OpKind::Cre => twice_ms,
            OpKind::Des => -twice_ms,
        }
    }

    /// Returns the Hermitian transpose of this operator.
    pub fn transposed(&self) -> Self {
        Self {
            kind: self.kind.transposed(),
            spin_orbital: self.spin_orbital,
        }
    }
}

impl fmt::Display for ElementaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let spin = if self.spin_orbital % 2 == 0 { "a" } else { "b" };
        write!(f, "{}{}{}", self.kind, self.orb(), spin)
    }
}

/// Returns the doubled change in $`M_S`$ effected by a product of elementary operators.
pub fn twice_delta_m(string: &[ElementaryOp]) -> i32 {
    string.iter().map(ElementaryOp::twice_delta_m).sum()
}

/// Brings a product of elementary operators into normal order (all creators to the left of all
/// destroyers) by anticommutation.
///
/// # Arguments
///
/// * `string` - The operator product to be reordered.
///
/// # Returns
///
/// A tuple of the creation spin-orbitals, the destruction spin-orbitals (both in their original
/// relative order) and the fermionic sign of the reordering.
///
/// # Errors
///
/// Errors if a destroyer must pass a creator on the same spin-orbital, since the reordering
/// would then generate a contraction that is not a pure string.
pub fn normal_order(
    string: &[ElementaryOp],
) -> Result<(Vec<usize>, Vec<usize>, f64), anyhow::Error> {
    let mut swaps = 0usize;
    for (i, op_i) in string.iter().enumerate() {
        if op_i.kind != OpKind::Des {
            continue;
        }
        for op_j in string[i + 1..].iter() {
            if op_j.kind == OpKind::Cre {
                ensure!(
                    op_j.spin_orbital != op_i.spin_orbital,
                    "Normal ordering `{}` would generate a contraction on spin-orbital {}.",
                    string.iter().map(|op| op.to_string()).join(" "),
                    op_i.spin_orbital
                );
                swaps += 1;
            }
        }
    }
    let (cres, dess): (Vec<&ElementaryOp>, Vec<&ElementaryOp>) =
        string.iter().partition(|op| op.kind == OpKind::Cre);
    let sign = if swaps % 2 == 0 { 1.0 } else { -1.0 };
    Ok((
        cres.into_iter().map(|op| op.spin_orbital).collect(),
        dess.into_iter().map(|op| op.spin_orbital).collect(),
        sign,
    ))
}

// ---------
// Expansion
// ---------

/// A structure holding the second-quantised form of an operator as a linear combination of
/// products of elementary operators.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct OperatorExpansion {
    terms: Vec<(Vec<ElementaryOp>, f64)>,
}

impl OperatorExpansion {
    /// Returns the identity, *i.e.* the empty product with unit coefficient.
    pub fn identity() -> Self {
        Self {
            terms: vec![(vec![], 1.0)],
        }
    }

    /// Returns the expansion of a single elementary operator.
    pub fn elementary(op: ElementaryOp) -> Self {
        Self {
            terms: vec![(vec![op], 1.0)],
        }
    }

    /// Returns the terms of the expansion.
    pub fn terms(&self) -> &[(Vec<ElementaryOp>, f64)] {
        &self.terms
    }

    /// Returns `true` if the expansion has no terms.
    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }

    /// Returns the expansion of the operator product `self * rhs`.
    pub fn product(&self, rhs: &Self) -> Self {
        let terms = self
            .terms
            .iter()
            .cartesian_product(rhs.terms.iter())
            .map(|((lstr, lcoeff), (rstr, rcoeff))| {
                let string = lstr.iter().chain(rstr.iter()).copied().collect_vec();
                (string, lcoeff * rcoeff)
            })
            .collect_vec();
        Self { terms }
    }

    /// Returns the expansion of the Hermitian transpose of this operator.
    pub fn transposed(&self) -> Self {
        let terms = self
            .terms
            .iter()
            .map(|(string, coeff)| {
                (
                    string.iter().rev().map(ElementaryOp::transposed).collect_vec(),
                    *coeff,
                )
            })
            .collect_vec();
        Self { terms }
    }

    /// Returns this expansion multiplied by a scalar.
    pub fn scaled(&self, factor: f64) -> Self {
        Self {
            terms: self
                .terms
                .iter()
                .map(|(string, coeff)| (string.clone(), coeff * factor))
                .collect_vec(),
        }
    }

    /// Adds `factor * other` into this expansion.
    pub fn add_scaled(&mut self, other: &Self, factor: f64) {
        self.terms.extend(
            other
                .terms
                .iter()
                .map(|(string, coeff)| (string.clone(), coeff * factor)),
        );
    }

    /// Collects identical strings and removes terms whose coefficients fall below `thresh` in
    /// magnitude.
    pub fn simplified(&self, thresh: f64) -> Self {
        let mut collected: IndexMap<Vec<ElementaryOp>, f64> = IndexMap::new();
        for (string, coeff) in self.terms.iter() {
            *collected.entry(string.clone()).or_insert(0.0) += coeff;
        }
        Self {
            terms: collected
                .into_iter()
                .filter(|(_, coeff)| coeff.abs() > thresh)
                .collect_vec(),
        }
    }
}

impl fmt::Display for OperatorExpansion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.terms.is_empty() {
            return write!(f, "0");
        }
        let terms = self
            .terms
            .iter()
            .map(|(string, coeff)| {
                if string.is_empty() {
                    format!("{coeff:+.6}")
                } else {
                    format!(
                        "{coeff:+.6} {}",
                        string.iter().map(|op| op.to_string()).join(" ")
                    )
                }
            })
            .join(" ");
        write!(f, "{terms}")
    }
}

// ----------------
// Quantum numbers
// ----------------

/// A structure holding the change in particle number and the doubled spin of an operator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeltaQuantum {
    /// The change in particle number.
    pub particles: i32,

    /// The doubled spin of the operator.
    pub twice_s: u32,
}

impl DeltaQuantum {
    /// Returns the quantum numbers of the Hermitian transpose.
    pub fn transposed(&self) -> Self {
        Self {
            particles: -self.particles,
            twice_s: self.twice_s,
        }
    }
}

impl Add for DeltaQuantum {
    type Output = Vec<DeltaQuantum>;

    /// Couples two operators in product, giving every allowed total spin.
    fn add(self, rhs: Self) -> Self::Output {
        coupled_spins(self.twice_s, rhs.twice_s)
            .into_iter()
            .map(|twice_s| DeltaQuantum {
                particles: self.particles + rhs.particles,
                twice_s,
            })
            .collect()
    }
}

impl Sub for DeltaQuantum {
    type Output = Vec<DeltaQuantum>;

    /// Couples an operator with the transpose of another, giving every allowed total spin.
    fn sub(self, rhs: Self) -> Self::Output {
        self + rhs.transposed()
    }
}

impl fmt::Display for DeltaQuantum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ΔN = {:+}, S = {}",
            self.particles,
            spin_label(self.twice_s)
        )
    }
}

// ---------
// Operators
// ---------

/// A structure holding one spin-projection component of a [`SpinOperator`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OperatorComponent {
    twice_m: i32,
    matrix: Array2<f64>,
    expansion: OperatorExpansion,
}

impl OperatorComponent {
    /// Creates a new component.
    pub fn new(twice_m: i32, matrix: Array2<f64>, expansion: OperatorExpansion) -> Self {
        Self {
            twice_m,
            matrix,
            expansion,
        }
    }

    /// Returns the doubled spin projection of this component.
    pub fn twice_m(&self) -> i32 {
        self.twice_m
    }

    /// Returns the matrix of this component in the block basis.
    pub fn matrix(&self) -> &Array2<f64> {
        &self.matrix
    }

    /// Returns the second-quantised expansion represented by [`Self::matrix`].
    pub fn expansion(&self) -> &OperatorExpansion {
        &self.expansion
    }
}

/// A borrowed, possibly transposed, spin-projection component of a [`SpinOperator`].
#[derive(Clone, Debug)]
pub struct ComponentView<'a> {
    /// The doubled spin projection of the viewed component.
    pub twice_m: i32,

    /// The viewed matrix.
    pub matrix: ArrayView2<'a, f64>,

    /// The expansion represented by the viewed matrix.
    pub expansion: Cow<'a, OperatorExpansion>,
}

/// A structure representing a spin-adapted block operator.
#[derive(Clone, Builder, Debug, Serialize, Deserialize)]
#[builder(build_fn(validate = "Self::validate"))]
pub struct SpinOperator {
    /// The spatial orbitals labelling this operator.
    orbs: Vec<usize>,

    /// The particle-number change and doubled spin of this operator.
    delta_quantum: DeltaQuantum,

    /// Boolean indicating if this operator has fermionic character.
    fermion: bool,

    /// The spin-projection components in ascending order of projection.
    components: Vec<OperatorComponent>,
}

impl SpinOperatorBuilder {
    fn validate(&self) -> Result<(), String> {
        let delta_quantum = self
            .delta_quantum
            .ok_or_else(|| "No quantum numbers found.".to_string())?;
        let components = self
            .components
            .as_ref()
            .ok_or_else(|| "No components found.".to_string())?;
        let twice_ms = components.iter().map(|comp| comp.twice_m).collect_vec();
        let expected = twice_projections(delta_quantum.twice_s).collect_vec();
        if twice_ms != expected {
            return Err(format!(
                "Component projections {twice_ms:?} do not match spin {}.",
                spin_label(delta_quantum.twice_s)
            ));
        }
        let square = components.iter().all(|comp| {
            comp.matrix.is_square() && comp.matrix.dim() == components[0].matrix.dim()
        });
        if !square {
            return Err("Component matrices must be square and of equal size.".to_string());
        }
        Ok(())
    }
}

impl SpinOperator {
    /// Returns a builder to construct a new [`SpinOperator`].
    pub fn builder() -> SpinOperatorBuilder {
        SpinOperatorBuilder::default()
    }

    /// Returns the spatial orbitals labelling this operator.
    pub fn orbs(&self) -> &[usize] {
        &self.orbs
    }

    /// Returns the particle-number change and doubled spin of this operator.
    pub fn delta_quantum(&self) -> DeltaQuantum {
        self.delta_quantum
    }

    /// Returns the doubled spin of this operator.
    pub fn twice_s(&self) -> u32 {
        self.delta_quantum.twice_s
    }

    /// Returns `true` if this operator is fermionic.
    pub fn fermion(&self) -> bool {
        self.fermion
    }

    /// Returns the components of this operator.
    pub fn components(&self) -> &[OperatorComponent] {
        &self.components
    }

    /// Returns the dimension of the block basis this operator acts on.
    pub fn dim(&self) -> usize {
        self.components
            .first()
            .map(|comp| comp.matrix.nrows())
            .unwrap_or(0)
    }

    /// Returns the component with doubled projection `twice_m`, if any.
    pub fn component(&self, twice_m: i32) -> Option<&OperatorComponent> {
        let twice_s = self.twice_s() as i32;
        if twice_m.abs() > twice_s || (twice_m + twice_s) % 2 != 0 {
            return None;
        }
        let idx = usize::try_from((twice_m + twice_s) / 2).ok()?;
        self.components.get(idx)
    }

    /// Returns a view of this operator, optionally transposed.
    pub fn view(&self, transpose: bool) -> OperatorView<'_> {
        OperatorView {
            op: self,
            transpose,
        }
    }

    /// Couples two operators into a new operator of definite spin.
    ///
    /// The component with projection $`M`$ of the result is
    /// $`\sum_{m_a} \langle S_a m_a; S_b M - m_a | S M \rangle A_{m_a} B_{M - m_a}`$.
    ///
    /// # Arguments
    ///
    /// * `lhs` - The left operand.
    /// * `rhs` - The right operand.
    /// * `delta_quantum` - The quantum numbers of the coupled operator. The spin must be allowed
    /// by the triangle rule.
    /// * `orbs` - The orbital labels of the coupled operator.
    ///
    /// # Returns
    ///
    /// The coupled operator, which owns newly allocated component matrices. The operands are
    /// only read.
    pub fn coupled(
        lhs: &OperatorView,
        rhs: &OperatorView,
        delta_quantum: DeltaQuantum,
        orbs: Vec<usize>,
    ) -> Result<Self, anyhow::Error> {
        let twice_sa = lhs.twice_s();
        let twice_sb = rhs.twice_s();
        let twice_s = delta_quantum.twice_s;
        ensure!(
            coupled_spins(twice_sa, twice_sb).contains(&twice_s),
            "Spins {} and {} cannot couple to {}.",
            spin_label(twice_sa),
            spin_label(twice_sb),
            spin_label(twice_s)
        );
        ensure!(
            lhs.op.dim() == rhs.op.dim(),
            "Operands act on blocks of different dimensions ({} and {}).",
            lhs.op.dim(),
            rhs.op.dim()
        );
        let dim = lhs.op.dim();

        let components = twice_projections(twice_s)
            .map(|twice_m| {
                let mut matrix = Array2::<f64>::zeros((dim, dim));
                let mut expansion = OperatorExpansion::default();
                for twice_ma in twice_projections(twice_sa) {
                    let twice_mb = twice_m - twice_ma;
                    let cg =
                        clebsch_gordan(twice_sa, twice_ma, twice_sb, twice_mb, twice_s, twice_m);
                    if cg == 0.0 {
                        continue;
                    }
                    let comp_a = lhs.component(twice_ma).ok_or_else(|| {
                        format_err!("Missing component with 2M = {twice_ma} in left operand.")
                    })?;
                    let comp_b = rhs.component(twice_mb).ok_or_else(|| {
                        format_err!("Missing component with 2M = {twice_mb} in right operand.")
                    })?;
                    matrix.scaled_add(cg, &comp_a.matrix.dot(&comp_b.matrix));
                    expansion.add_scaled(&comp_a.expansion.product(&comp_b.expansion), cg);
                }
                Ok::<_, anyhow::Error>(OperatorComponent::new(
                    twice_m,
                    matrix,
                    expansion.simplified(1e-14),
                ))
            })
            .collect::<Result<Vec<_>, anyhow::Error>>()?;

        SpinOperator::builder()
            .orbs(orbs)
            .delta_quantum(delta_quantum)
            .fermion(lhs.op.fermion ^ rhs.op.fermion)
            .components(components)
            .build()
            .map_err(|err| format_err!(err))
    }
}

impl fmt::Display for SpinOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Operator on orbitals ({}) with {}{}",
            self.orbs.iter().join(", "),
            self.delta_quantum,
            if self.fermion { " (fermionic)" } else { "" }
        )
    }
}

/// A borrowed view of a [`SpinOperator`], optionally Hermitian-transposed.
///
/// Component $`M`$ of the transposed view is the matrix transpose of component $`-M`$ of the
/// underlying operator. The underlying operator is never modified.
#[derive(Clone, Copy, Debug)]
pub struct OperatorView<'a> {
    op: &'a SpinOperator,
    transpose: bool,
}

impl<'a> OperatorView<'a> {
    /// Returns the viewed operator.
    pub fn operator(&self) -> &'a SpinOperator {
        self.op
    }

    /// Returns the doubled spin of the viewed operator.
    pub fn twice_s(&self) -> u32 {
        self.op.twice_s()
    }

    /// Returns the quantum numbers of the viewed operator.
    pub fn delta_quantum(&self) -> DeltaQuantum {
        if self.transpose {
            self.op.delta_quantum.transposed()
        } else {
            self.op.delta_quantum
        }
    }

    /// Returns the viewed component with doubled projection `twice_m`, if any.
    pub fn component(&self, twice_m: i32) -> Option<ComponentView<'a>> {
        if self.transpose {
            self.op.component(-twice_m).map(|comp| ComponentView {
                twice_m,
                matrix: comp.matrix.t(),
                expansion: Cow::Owned(comp.expansion.transposed()),
            })
        } else {
            self.op.component(twice_m).map(|comp| ComponentView {
                twice_m,
                matrix: comp.matrix.view(),
                expansion: Cow::Borrowed(&comp.expansion),
            })
        }
    }
}
