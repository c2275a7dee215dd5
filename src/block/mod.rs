//! Interfaces to renormalised blocks and superblocks.
//!
//! The NPDM machinery only ever reads block operators and contracts them against a wavefunction.
//! These traits describe exactly that surface. [`fock`] provides an exact implementation on the
//! full Fock space of a short orbital chain.

use std::fmt;

use anyhow;
use ndarray::ArrayView2;
use serde::{Deserialize, Serialize};

use crate::operator::SpinOperator;

pub mod fock;

// ================
// Enum definitions
// ================

/// An enumerated type for the kinds of operator arrays stored by a renormalised block.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OpArrayKind {
    /// Variant for single creation operators $`a^{\dagger}_{i}`$, one spin-half channel per
    /// orbital.
    Cre,

    /// Variant for coupled pairs $`(a^{\dagger}_{i} a^{\dagger}_{j})^{S}`$ with $`j \le i`$,
    /// holding the $`S = 0`$ and $`S = 1`$ channels.
    CreCre,

    /// Variant for coupled pairs $`(a^{\dagger}_{i} a_{j})^{S}`$ over all ordered orbital pairs,
    /// holding the $`S = 0`$ and $`S = 1`$ channels.
    CreDes,
}

impl fmt::Display for OpArrayKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpArrayKind::Cre => write!(f, "CRE"),
            OpArrayKind::CreCre => write!(f, "CRE_CRE"),
            OpArrayKind::CreDes => write!(f, "CRE_DES"),
        }
    }
}

// =================
// Trait definitions
// =================

/// Trait for arrays of block operators distributed over compute ranks.
pub trait OperatorArray: Sync {
    /// Returns the kind of this operator array.
    fn kind(&self) -> OpArrayKind;

    /// Returns the global number of elements in this array.
    fn size(&self) -> usize;

    /// Returns the orbital labels of element `idx` without touching its matrices.
    fn orbs(&self, idx: usize) -> Result<&[usize], anyhow::Error>;

    /// Returns `true` if element `idx` is resident on this rank.
    fn is_local(&self, idx: usize) -> bool;

    /// Returns the spin channels of the resident element `idx`.
    ///
    /// # Errors
    ///
    /// Errors if `idx` is out of range or not resident on this rank.
    fn local_element(&self, idx: usize) -> Result<&[SpinOperator], anyhow::Error>;
}

/// Trait for renormalised blocks.
pub trait RenormalisedBlock: Sync {
    /// The type of the operator arrays held by this block.
    type Array: OperatorArray;

    /// Returns the spatial orbitals spanned by this block.
    fn orbitals(&self) -> &[usize];

    /// Returns the operator array of a given kind.
    fn op_array(&self, kind: OpArrayKind) -> Result<&Self::Array, anyhow::Error>;
}

/// Trait for superblocks made up of a left block, a single-site dot block and a right block.
pub trait Superblock: Sync {
    /// The type of the three blocks.
    type Block: RenormalisedBlock;

    /// The type of the wavefunctions living in this superblock.
    type Wavefunction: Sync;

    /// Returns the total number of spatial orbitals in the chain.
    fn n_orbitals(&self) -> usize;

    /// Returns the left block.
    fn left_block(&self) -> &Self::Block;

    /// Returns the dot block.
    fn dot_block(&self) -> &Self::Block;

    /// Returns the right block.
    fn right_block(&self) -> &Self::Block;

    /// Contracts block operators against a pair of wavefunctions.
    ///
    /// # Arguments
    ///
    /// * `bra` - The bra wavefunction.
    /// * `ket` - The ket wavefunction.
    /// * `ops` - The left, dot and right operator matrices, in that order. `None` stands for the
    /// identity on that block.
    ///
    /// # Returns
    ///
    /// The value $`\langle \mathrm{bra} | L D R | \mathrm{ket} \rangle`$.
    fn expectation(
        &self,
        bra: &Self::Wavefunction,
        ket: &Self::Wavefunction,
        ops: [Option<ArrayView2<'_, f64>>; 3],
    ) -> Result<f64, anyhow::Error>;
}
