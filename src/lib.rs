//! # NPDM: spin-adapted n-particle reduced density matrices
//!
//! This crate evaluates one- and two-particle reduced density matrices of wavefunctions expressed
//! in the left/dot/right block basis of a DMRG sweep. At every sweep position, products of
//! spin-adapted block operators are coupled to definite total spin, their expectation values are
//! computed, and the results are decomposed onto the nonredundant spin-orbital elements
//! $`E[p, q, \ldots, r, s] = \langle \mathrm{bra} | \hat{a}^{\dagger}_p \hat{a}^{\dagger}_q
//! \ldots \hat{a}_r \hat{a}_s | \mathrm{ket} \rangle`$.
//!
//! The crate provides:
//! - the family of spin-adapted operator wrappers for zero- to four-body operator patterns and
//! the dispatch table selecting them,
//! - the distribution of left-block operators over ranks,
//! - the inner loop evaluating and decomposing operator triples,
//! - a sparse store of nonredundant elements with export hooks to dense arrays, and
//! - an exact Fock-space implementation of the block collaborators for small chains, together
//! with a reference sweep driver.
//!
//! ## Getting started
//!
//! The `npdm` binary runs a reference sweep described by a YAML input file:
//!
//! ```bash
//! npdm -c input.yml -o output.txt
//! ```
//!
//! A minimal input file reads
//!
//! ```yaml
//! system:
//!   n_orbitals: 4
//!   n_electrons: 4
//!   n_ranks: 2
//! npdm:
//!   npdm_order: 2
//! ```
//!
//! Within Rust, [`npdm::driver::NpdmDriver`] accepts any [`block::Superblock`], any
//! [`npdm::distribution::Communicator`] and any [`npdm::export::NpdmExporter`].

pub mod angmom;
pub mod block;
pub mod drivers;
pub mod interfaces;
pub mod io;
pub mod npdm;
pub mod operator;
