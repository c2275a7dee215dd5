//! Exact block operators on the full Fock space of a short orbital chain.
//!
//! Every operator here acts on the full $`4^n`$-dimensional Fock space of an $`n`$-orbital chain,
//! with Jordan--Wigner signs taken over the spin-orbital ordering `2 * orbital + spin`. No basis
//! truncation takes place, so expectation values are exact and can be checked against
//! [`FockSpace::string_expectation`].

use std::fmt;

use anyhow::{self, ensure, format_err};
use itertools::Itertools;
use log;
use ndarray::{Array1, Array2, ArrayView2};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::angmom::TWICE_SPIN_HALF;
use crate::block::{OpArrayKind, OperatorArray, RenormalisedBlock, Superblock};
use crate::operator::{
    DeltaQuantum, ElementaryOp, OpKind, OperatorComponent, OperatorExpansion, SpinOperator,
};

#[cfg(test)]
#[path = "fock_tests.rs"]
mod fock_tests;

/// The largest chain for which dense Fock-space operators are built.
const MAX_FOCK_ORBITALS: usize = 6;

// ==================
// Struct definitions
// ==================

// ----------
// Fock space
// ----------

/// A structure describing the Fock space of a chain of spatial orbitals.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FockSpace {
    n_orbitals: usize,
}

impl FockSpace {
    /// Creates the Fock space of `n_orbitals` spatial orbitals.
    pub fn new(n_orbitals: usize) -> Result<Self, anyhow::Error> {
        ensure!(n_orbitals > 0, "A Fock space needs at least one orbital.");
        ensure!(
            n_orbitals <= MAX_FOCK_ORBITALS,
            "Dense Fock-space operators are limited to {MAX_FOCK_ORBITALS} orbitals, but \
            {n_orbitals} were requested."
        );
        Ok(Self { n_orbitals })
    }

    /// Returns the number of spatial orbitals.
    pub fn n_orbitals(&self) -> usize {
        self.n_orbitals
    }

    /// Returns the number of spin-orbitals.
    pub fn n_spin_orbitals(&self) -> usize {
        2 * self.n_orbitals
    }

    /// Returns the dimension of the Fock space.
    pub fn dim(&self) -> usize {
        1 << self.n_spin_orbitals()
    }

    /// Applies an elementary operator to an occupation-number basis state.
    ///
    /// # Returns
    ///
    /// The resulting basis state and its Jordan--Wigner sign, or `None` if the state is
    /// annihilated.
    pub fn apply(&self, op: &ElementaryOp, state: usize) -> Option<(usize, f64)> {
        let bit = 1usize << op.spin_orbital;
        let sign = if (state & (bit - 1)).count_ones() % 2 == 0 {
            1.0
        } else {
            -1.0
        };
        match op.kind {
            OpKind::Cre if state & bit == 0 => Some((state | bit, sign)),
            OpKind::Des if state & bit != 0 => Some((state & !bit, sign)),
            _ => None,
        }
    }

    /// Returns the matrix of $`a^{\dagger}_{s}`$ for spin-orbital `spin_orbital`.
    pub fn cre_matrix(&self, spin_orbital: usize) -> Array2<f64> {
        let op = ElementaryOp {
            kind: OpKind::Cre,
            spin_orbital,
        };
        let mut matrix = Array2::<f64>::zeros((self.dim(), self.dim()));
        (0..self.dim()).for_each(|state| {
            if let Some((image, sign)) = self.apply(&op, state) {
                matrix[(image, state)] = sign;
            }
        });
        matrix
    }

    /// Returns the spin-half creation operator on spatial orbital `orb`.
    pub fn cre_operator(&self, orb: usize) -> Result<SpinOperator, anyhow::Error> {
        ensure!(
            orb < self.n_orbitals,
            "Orbital {orb} lies outside a chain of {} orbitals.",
            self.n_orbitals
        );
        let components = [-1, 1]
            .into_iter()
            .map(|twice_ms| {
                let op = ElementaryOp::new(OpKind::Cre, orb, twice_ms);
                OperatorComponent::new(
                    twice_ms,
                    self.cre_matrix(op.spin_orbital),
                    OperatorExpansion::elementary(op),
                )
            })
            .collect_vec();
        SpinOperator::builder()
            .orbs(vec![orb])
            .delta_quantum(DeltaQuantum {
                particles: 1,
                twice_s: TWICE_SPIN_HALF,
            })
            .fermion(true)
            .components(components)
            .build()
            .map_err(|err| format_err!(err))
    }

    /// Evaluates $`\langle \mathrm{bra} | O_1 O_2 \cdots O_k | \mathrm{ket} \rangle`$ for a
    /// product of elementary operators by direct action on occupation-number states.
    pub fn string_expectation(
        &self,
        bra: &Array1<f64>,
        ket: &Array1<f64>,
        string: &[ElementaryOp],
    ) -> f64 {
        ket.iter()
            .enumerate()
            .filter(|(_, amp)| **amp != 0.0)
            .filter_map(|(state, amp)| {
                string
                    .iter()
                    .rev()
                    .try_fold((state, *amp), |(state, amp), op| {
                        self.apply(op, state).map(|(image, sign)| (image, amp * sign))
                    })
            })
            .map(|(state, amp)| bra[state] * amp)
            .sum()
    }

    /// Evaluates the density-matrix element
    /// $`\langle \mathrm{bra} | a^{\dagger}_{p} \cdots a_{s} | \mathrm{ket} \rangle`$ whose first
    /// half of `indices` are creation spin-orbitals and second half destruction spin-orbitals.
    pub fn npdm_element(&self, bra: &Array1<f64>, ket: &Array1<f64>, indices: &[usize]) -> f64 {
        let order = indices.len() / 2;
        let string = indices
            .iter()
            .enumerate()
            .map(|(pos, &spin_orbital)| ElementaryOp {
                kind: if pos < order { OpKind::Cre } else { OpKind::Des },
                spin_orbital,
            })
            .collect_vec();
        self.string_expectation(bra, ket, &string)
    }
}

// ---------
// Residency
// ---------

/// An enumerated type describing which operator-array elements are resident on a rank.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Residency {
    /// Variant for arrays whose elements are resident on every rank.
    Replicated,

    /// Variant for arrays whose element `idx` is resident only on rank `idx % size`.
    RoundRobin { rank: usize, size: usize },
}

impl Residency {
    /// Returns `true` if element `idx` is resident on this rank.
    pub fn is_local(&self, idx: usize) -> bool {
        match self {
            Residency::Replicated => true,
            Residency::RoundRobin { rank, size } => *size <= 1 || idx % size == *rank,
        }
    }
}

// ---------------
// Operator arrays
// ---------------

/// A structure holding one kind of exact block operator for every orbital label set of a block.
#[derive(Clone, Debug)]
pub struct FockOpArray {
    kind: OpArrayKind,
    labels: Vec<Vec<usize>>,
    elements: Vec<Option<Vec<SpinOperator>>>,
    residency: Residency,
}

impl OperatorArray for FockOpArray {
    fn kind(&self) -> OpArrayKind {
        self.kind
    }

    fn size(&self) -> usize {
        self.labels.len()
    }

    fn orbs(&self, idx: usize) -> Result<&[usize], anyhow::Error> {
        self.labels
            .get(idx)
            .map(|labels| labels.as_slice())
            .ok_or_else(|| format_err!("Index {idx} is out of range for a {} array.", self.kind))
    }

    fn is_local(&self, idx: usize) -> bool {
        idx < self.labels.len() && self.residency.is_local(idx)
    }

    fn local_element(&self, idx: usize) -> Result<&[SpinOperator], anyhow::Error> {
        self.elements
            .get(idx)
            .ok_or_else(|| format_err!("Index {idx} is out of range for a {} array.", self.kind))?
            .as_deref()
            .ok_or_else(|| {
                format_err!(
                    "Element {idx} of the {} array is not resident on this rank.",
                    self.kind
                )
            })
    }
}

// ------
// Blocks
// ------

/// A structure representing an exact block spanning a contiguous set of chain orbitals.
#[derive(Clone, Debug)]
pub struct FockBlock {
    orbitals: Vec<usize>,
    cre: FockOpArray,
    cre_cre: FockOpArray,
    cre_des: FockOpArray,
}

impl FockBlock {
    /// Builds all operator arrays of a block.
    ///
    /// # Arguments
    ///
    /// * `space` - The Fock space of the whole chain.
    /// * `orbitals` - The orbitals spanned by the block, in ascending order.
    /// * `residency` - The rule deciding which array elements this rank materialises.
    ///
    /// # Returns
    ///
    /// The constructed block. Elements that are not resident carry labels only.
    pub fn new(
        space: &FockSpace,
        orbitals: Vec<usize>,
        residency: Residency,
    ) -> Result<Self, anyhow::Error> {
        ensure!(!orbitals.is_empty(), "A block needs at least one orbital.");
        ensure!(
            orbitals.windows(2).all(|pair| pair[0] < pair[1]),
            "Block orbitals must be strictly ascending."
        );
        let cres = orbitals
            .iter()
            .map(|&orb| space.cre_operator(orb))
            .collect::<Result<Vec<_>, _>>()?;

        let cre_labels = orbitals.iter().map(|&orb| vec![orb]).collect_vec();
        let cre_elements = cres
            .iter()
            .enumerate()
            .map(|(idx, op)| residency.is_local(idx).then(|| vec![op.clone()]))
            .collect_vec();

        let cre_cre_pairs = (0..orbitals.len())
            .flat_map(|a| (0..=a).map(move |b| (a, b)))
            .collect_vec();
        let cre_cre_labels = cre_cre_pairs
            .iter()
            .map(|&(a, b)| vec![orbitals[a], orbitals[b]])
            .collect_vec();
        let cre_cre_elements = cre_cre_pairs
            .iter()
            .enumerate()
            .map(|(idx, &(a, b))| {
                residency
                    .is_local(idx)
                    .then(|| couple_pair(&cres[a], &cres[b], false))
                    .transpose()
            })
            .collect::<Result<Vec<_>, _>>()?;

        let cre_des_pairs = (0..orbitals.len())
            .cartesian_product(0..orbitals.len())
            .collect_vec();
        let cre_des_labels = cre_des_pairs
            .iter()
            .map(|&(a, b)| vec![orbitals[a], orbitals[b]])
            .collect_vec();
        let cre_des_elements = cre_des_pairs
            .iter()
            .enumerate()
            .map(|(idx, &(a, b))| {
                residency
                    .is_local(idx)
                    .then(|| couple_pair(&cres[a], &cres[b], true))
                    .transpose()
            })
            .collect::<Result<Vec<_>, _>>()?;

        log::debug!(
            "Built exact block over orbitals ({}) with {} CRE, {} CRE_CRE and {} CRE_DES elements.",
            orbitals.iter().join(", "),
            cre_labels.len(),
            cre_cre_labels.len(),
            cre_des_labels.len()
        );

        Ok(Self {
            orbitals,
            cre: FockOpArray {
                kind: OpArrayKind::Cre,
                labels: cre_labels,
                elements: cre_elements,
                residency,
            },
            cre_cre: FockOpArray {
                kind: OpArrayKind::CreCre,
                labels: cre_cre_labels,
                elements: cre_cre_elements,
                residency,
            },
            cre_des: FockOpArray {
                kind: OpArrayKind::CreDes,
                labels: cre_des_labels,
                elements: cre_des_elements,
                residency,
            },
        })
    }
}

/// Couples $`a^{\dagger}_{i}`$ with $`a^{\dagger}_{j}`$ (or with $`a_{j}`$ if `transpose_rhs`)
/// into its singlet and triplet channels.
fn couple_pair(
    lhs: &SpinOperator,
    rhs: &SpinOperator,
    transpose_rhs: bool,
) -> Result<Vec<SpinOperator>, anyhow::Error> {
    let lhs_view = lhs.view(false);
    let rhs_view = rhs.view(transpose_rhs);
    let orbs = lhs.orbs().iter().chain(rhs.orbs().iter()).copied().collect_vec();
    let quanta = lhs_view.delta_quantum() + rhs_view.delta_quantum();
    quanta
        .into_iter()
        .map(|delta_quantum| {
            SpinOperator::coupled(&lhs_view, &rhs_view, delta_quantum, orbs.clone())
        })
        .collect()
}

impl RenormalisedBlock for FockBlock {
    type Array = FockOpArray;

    fn orbitals(&self) -> &[usize] {
        &self.orbitals
    }

    fn op_array(&self, kind: OpArrayKind) -> Result<&Self::Array, anyhow::Error> {
        Ok(match kind {
            OpArrayKind::Cre => &self.cre,
            OpArrayKind::CreCre => &self.cre_cre,
            OpArrayKind::CreDes => &self.cre_des,
        })
    }
}

// -------------
// Wavefunctions
// -------------

/// A structure holding a wavefunction on the full Fock space of a chain.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FockWavefunction {
    n_electrons: usize,
    twice_sz: i32,
    coefficients: Array1<f64>,
}

/// Returns the particle number and doubled $`S_z`$ of an occupation-number basis state.
fn occupation_quanta(state: usize) -> (usize, i32) {
    let alpha = (state & 0x5555_5555).count_ones() as i32;
    let beta = (state & 0xAAAA_AAAA).count_ones() as i32;
    ((alpha + beta) as usize, alpha - beta)
}

impl FockWavefunction {
    /// Generates a normalised wavefunction with random coefficients in one $`(N, S_z)`$ sector.
    ///
    /// # Arguments
    ///
    /// * `space` - The Fock space.
    /// * `n_electrons` - The number of electrons.
    /// * `twice_sz` - The doubled $`S_z`$ projection.
    /// * `seed` - The seed of the random number generator.
    pub fn random(
        space: &FockSpace,
        n_electrons: usize,
        twice_sz: i32,
        seed: u64,
    ) -> Result<Self, anyhow::Error> {
        let mut rng = StdRng::seed_from_u64(seed);
        let coefficients = Array1::from_iter((0..space.dim()).map(|state| {
            if occupation_quanta(state) == (n_electrons, twice_sz) {
                rng.gen_range(-1.0..1.0)
            } else {
                0.0
            }
        }));
        Self::normalised(n_electrons, twice_sz, coefficients)
    }

    /// Builds a normalised wavefunction from a linear combination of determinants.
    ///
    /// # Arguments
    ///
    /// * `space` - The Fock space.
    /// * `determinants` - Pairs of occupied spin-orbitals and coefficients. All determinants must
    /// share the same particle number and $`S_z`$.
    pub fn from_determinants(
        space: &FockSpace,
        determinants: &[(Vec<usize>, f64)],
    ) -> Result<Self, anyhow::Error> {
        let mut coefficients = Array1::<f64>::zeros(space.dim());
        let mut quanta = None;
        for (occupied, coeff) in determinants.iter() {
            ensure!(
                occupied.iter().all(|&s| s < space.n_spin_orbitals()),
                "Determinant ({}) has spin-orbitals outside the chain.",
                occupied.iter().join(", ")
            );
            ensure!(
                occupied.iter().all_unique(),
                "Determinant ({}) occupies a spin-orbital twice.",
                occupied.iter().join(", ")
            );
            let state = occupied.iter().fold(0usize, |acc, &s| acc | (1 << s));
            let state_quanta = occupation_quanta(state);
            ensure!(
                *quanta.get_or_insert(state_quanta) == state_quanta,
                "Determinants with different particle numbers or Sz cannot be mixed."
            );
            // Bring the determinant from creation order into ascending spin-orbital order.
            let inversions = occupied
                .iter()
                .tuple_combinations()
                .filter(|(a, b)| a > b)
                .count();
            let sign = if inversions % 2 == 0 { 1.0 } else { -1.0 };
            coefficients[state] += sign * coeff;
        }
        let (n_electrons, twice_sz) =
            quanta.ok_or_else(|| format_err!("At least one determinant is required."))?;
        Self::normalised(n_electrons, twice_sz, coefficients)
    }

    fn normalised(
        n_electrons: usize,
        twice_sz: i32,
        coefficients: Array1<f64>,
    ) -> Result<Self, anyhow::Error> {
        let norm = coefficients.dot(&coefficients).sqrt();
        ensure!(
            norm > 0.0,
            "The sector with N = {n_electrons} and 2Sz = {twice_sz} is empty."
        );
        Ok(Self {
            n_electrons,
            twice_sz,
            coefficients: coefficients / norm,
        })
    }

    /// Returns the number of electrons.
    pub fn n_electrons(&self) -> usize {
        self.n_electrons
    }

    /// Returns the doubled $`S_z`$ projection.
    pub fn twice_sz(&self) -> i32 {
        self.twice_sz
    }

    /// Returns the coefficients in the occupation-number basis.
    pub fn coefficients(&self) -> &Array1<f64> {
        &self.coefficients
    }
}

impl fmt::Display for FockWavefunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let nonzero = self.coefficients.iter().filter(|c| **c != 0.0).count();
        write!(
            f,
            "Fock-space wavefunction with N = {}, 2Sz = {} ({nonzero} nonzero coefficients)",
            self.n_electrons, self.twice_sz
        )
    }
}

// -----------
// Superblocks
// -----------

/// A structure representing the exact superblock of a chain at one sweep position.
#[derive(Clone, Debug)]
pub struct FockSuperblock {
    space: FockSpace,
    sweep_pos: usize,
    left: FockBlock,
    dot: FockBlock,
    right: FockBlock,
}

impl FockSuperblock {
    /// Builds the superblock at a sweep position.
    ///
    /// # Arguments
    ///
    /// * `space` - The Fock space of the chain.
    /// * `sweep_pos` - The dot orbital. The left block holds all orbitals below it and the right
    /// block all orbitals above it.
    /// * `left_residency` - The residency rule of left-block operators on this rank. Dot and
    /// right-block operators are replicated.
    pub fn new(
        space: FockSpace,
        sweep_pos: usize,
        left_residency: Residency,
    ) -> Result<Self, anyhow::Error> {
        let n = space.n_orbitals();
        ensure!(n >= 3, "A superblock needs at least three orbitals, but got {n}.");
        ensure!(
            (1..=n - 2).contains(&sweep_pos),
            "Sweep position {sweep_pos} is outside 1..={}.",
            n - 2
        );
        let left = FockBlock::new(&space, (0..sweep_pos).collect_vec(), left_residency)?;
        let dot = FockBlock::new(&space, vec![sweep_pos], Residency::Replicated)?;
        let right = FockBlock::new(&space, (sweep_pos + 1..n).collect_vec(), Residency::Replicated)?;
        Ok(Self {
            space,
            sweep_pos,
            left,
            dot,
            right,
        })
    }

    /// Returns the Fock space of the chain.
    pub fn space(&self) -> &FockSpace {
        &self.space
    }

    /// Returns the sweep position.
    pub fn sweep_pos(&self) -> usize {
        self.sweep_pos
    }
}

impl Superblock for FockSuperblock {
    type Block = FockBlock;

    type Wavefunction = FockWavefunction;

    fn n_orbitals(&self) -> usize {
        self.space.n_orbitals()
    }

    fn left_block(&self) -> &Self::Block {
        &self.left
    }

    fn dot_block(&self) -> &Self::Block {
        &self.dot
    }

    fn right_block(&self) -> &Self::Block {
        &self.right
    }

    fn expectation(
        &self,
        bra: &Self::Wavefunction,
        ket: &Self::Wavefunction,
        ops: [Option<ArrayView2<'_, f64>>; 3],
    ) -> Result<f64, anyhow::Error> {
        let dim = self.space.dim();
        ensure!(
            bra.coefficients.len() == dim && ket.coefficients.len() == dim,
            "Wavefunctions do not live in a Fock space of dimension {dim}."
        );
        let mut vec = ket.coefficients.clone();
        for op in ops.iter().rev().flatten() {
            ensure!(
                op.dim() == (dim, dim),
                "Block operator of shape {:?} does not act on a Fock space of dimension {dim}.",
                op.dim()
            );
            vec = op.dot(&vec);
        }
        Ok(bra.coefficients.dot(&vec))
    }
}
