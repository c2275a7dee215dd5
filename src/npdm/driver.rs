//! Driver entry point for accumulating density-matrix elements over a sweep.

use std::fmt;
use std::path::PathBuf;

use anyhow::{self, bail, ensure, format_err};
use derive_builder::Builder;
use itertools::Itertools;
use log;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::block::{RenormalisedBlock, Superblock};
use crate::io::format::{log_subtitle, nice_bool, npdm_output};
use crate::io::{npdm_file_stem, write_npdm_binary, write_npdm_text, NpdmFileType};
use crate::npdm::dispatch::init_npdm_operators;
use crate::npdm::distribution::{all_gather_serde, get_all_mpi_ops, Communicator};
use crate::npdm::expectations::NpdmExpectations;
use crate::npdm::export::NpdmExporter;
use crate::npdm::patterns::{npdm_patterns, owner_position};
use crate::npdm::sparse_array::NpdmSparseArray;
use crate::npdm::wrappers::{NpdmOpWrapper, NpdmSpinOps, NpdmSpinOpsBase};

#[cfg(test)]
#[path = "driver_tests.rs"]
mod driver_tests;

// ==================
// Struct definitions
// ==================

// ----------
// Parameters
// ----------

const fn default_npdm_order() -> usize {
    2
}
const fn default_true() -> bool {
    true
}
const fn default_screening_threshold() -> f64 {
    1e-12
}
const fn default_spin_adaptation_threshold() -> f64 {
    1e-10
}
fn default_output_directory() -> PathBuf {
    PathBuf::from(".")
}

/// A structure containing control parameters for NPDM computations.
#[derive(Clone, Builder, Debug, PartialEq, Serialize, Deserialize)]
pub struct NpdmParams {
    /// The order of the density matrix (`1` or `2`).
    #[builder(default = "2")]
    #[serde(default = "default_npdm_order")]
    pub npdm_order: usize,

    /// Boolean indicating if elements are saved as dense arrays through the exporter rather than
    /// as a sparse list of nonredundant elements.
    #[builder(default = "true")]
    #[serde(default = "default_true")]
    pub use_full_array: bool,

    /// Elements smaller than this in magnitude are not stored.
    #[builder(default = "1e-12")]
    #[serde(default = "default_screening_threshold")]
    pub screening_threshold: f64,

    /// The largest residual tolerated when decomposing spin-adapted expectation values onto
    /// spin-orbital elements.
    #[builder(default = "1e-10")]
    #[serde(default = "default_spin_adaptation_threshold")]
    pub spin_adaptation_threshold: f64,

    /// The largest number of left-block operator instances evaluated on one rank. If `None`, the
    /// instances are spread evenly.
    #[builder(default = "None")]
    #[serde(default)]
    pub max_lhs_per_rank: Option<usize>,

    /// The directory into which density matrices are saved.
    #[builder(setter(into), default = "PathBuf::from(\".\")")]
    #[serde(default = "default_output_directory")]
    pub output_directory: PathBuf,

    /// Boolean indicating if text files are written alongside binary files.
    #[builder(default = "false")]
    #[serde(default)]
    pub write_text: bool,

    /// Boolean indicating if spin-summed density matrices are also saved.
    #[builder(default = "true")]
    #[serde(default = "default_true")]
    pub write_spatial: bool,
}

impl NpdmParams {
    /// Returns a builder to construct a [`NpdmParams`] structure.
    pub fn builder() -> NpdmParamsBuilder {
        NpdmParamsBuilder::default()
    }
}

impl Default for NpdmParams {
    fn default() -> Self {
        Self::builder()
            .build()
            .expect("Unable to construct a default `NpdmParams`.")
    }
}

impl fmt::Display for NpdmParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Density-matrix order: {}", self.npdm_order)?;
        writeln!(f, "Screening threshold: {:.3e}", self.screening_threshold)?;
        writeln!(
            f,
            "Spin-adaptation threshold: {:.3e}",
            self.spin_adaptation_threshold
        )?;
        writeln!(
            f,
            "Max left-block instances per rank: {}",
            self.max_lhs_per_rank
                .map(|bound| bound.to_string())
                .unwrap_or_else(|| "even split".to_string())
        )?;
        writeln!(f)?;
        writeln!(f, "Save dense arrays: {}", nice_bool(self.use_full_array))?;
        writeln!(f, "Save spin-summed arrays: {}", nice_bool(self.write_spatial))?;
        writeln!(f, "Write text files: {}", nice_bool(self.write_text))?;
        writeln!(f, "Output directory: {}", self.output_directory.display())?;
        Ok(())
    }
}

// ------
// Driver
// ------

/// A driver accumulating the nonredundant elements of one density matrix over the sweep
/// positions of a chain.
#[derive(Builder)]
#[builder(pattern = "owned")]
pub struct NpdmDriver<'a, E: NpdmExporter> {
    /// The control parameters.
    parameters: &'a NpdmParams,

    /// The export hooks receiving the accumulated elements.
    exporter: E,

    /// The elements accumulated on this rank since the last save.
    #[builder(setter(skip), default = "None")]
    sparse_array: Option<NpdmSparseArray>,

    /// The number of spatial orbitals of the chain, known after the first sweep position.
    #[builder(setter(skip), default = "0")]
    n_orbitals: usize,
}

impl<'a, E: NpdmExporter> NpdmDriver<'a, E> {
    /// Returns a builder to construct a [`NpdmDriver`] structure.
    pub fn builder() -> NpdmDriverBuilder<'a, E> {
        NpdmDriverBuilder::default()
    }

    /// Returns the control parameters.
    pub fn parameters(&self) -> &NpdmParams {
        self.parameters
    }

    /// Returns the export hooks.
    pub fn exporter(&self) -> &E {
        &self.exporter
    }

    /// Returns the elements accumulated on this rank, if any position has been processed.
    pub fn sparse_array(&self) -> Option<&NpdmSparseArray> {
        self.sparse_array.as_ref()
    }

    /// Builds every instance of a replicated block wrapper.
    fn local_instances<B: RenormalisedBlock>(
        ops: &mut NpdmSpinOps<'_, B>,
    ) -> Result<Vec<NpdmSpinOpsBase>, anyhow::Error> {
        (0..ops.n_instances())
            .map(|idx| {
                ops.set_local_ops(idx)?;
                Ok(ops.base().clone())
            })
            .collect()
    }

    /// Computes the density-matrix elements owned by one sweep position and adds them to the
    /// elements accumulated so far.
    ///
    /// Left-block operators are distributed over the ranks of `comm`. Dot and right-block
    /// operators must be resident on every rank.
    ///
    /// # Arguments
    ///
    /// * `wavefunctions` - Either one wavefunction, used as both bra and ket, or a bra and a
    /// ket.
    /// * `big` - The superblock at this sweep position.
    /// * `comm` - The communicator connecting the ranks.
    /// * `sweep_pos` - The sweep position.
    /// * `end_pos` - The last sweep position of the sweep.
    ///
    /// # Errors
    ///
    /// Errors on a wrong number of wavefunctions, an invalid sweep position, an unsupported
    /// operator pattern, a spin-coupling inconsistency or a communication failure.
    pub fn compute_npdm_elements<S, C>(
        &mut self,
        wavefunctions: &[S::Wavefunction],
        big: &S,
        comm: &C,
        sweep_pos: usize,
        end_pos: usize,
    ) -> Result<(), anyhow::Error>
    where
        S: Superblock,
        C: Communicator + ?Sized,
    {
        let (bra, ket) = match wavefunctions {
            [wfn] => (wfn, wfn),
            [bra, ket] => (bra, ket),
            _ => bail!(
                "Expected one or two wavefunctions, but got {}.",
                wavefunctions.len()
            ),
        };
        let params = self.parameters;
        let order = params.npdm_order;
        let n_orbitals = big.n_orbitals();
        ensure!(
            n_orbitals >= 3 && sweep_pos <= end_pos && end_pos <= n_orbitals - 2,
            "Sweep position {sweep_pos} with end position {end_pos} does not fit a chain of {n_orbitals} orbitals."
        );
        let patterns = npdm_patterns(order, n_orbitals, sweep_pos)?;

        let store = self
            .sparse_array
            .get_or_insert_with(|| NpdmSparseArray::new(order));
        ensure!(
            store.order() == order,
            "Accumulated elements are of order {}, but order {order} was requested.",
            store.order()
        );
        ensure!(
            self.n_orbitals == 0 || self.n_orbitals == n_orbitals,
            "Accumulated elements span {} orbitals, but the superblock spans {n_orbitals}.",
            self.n_orbitals
        );
        self.n_orbitals = n_orbitals;

        let mut n_triples = 0;
        let mut n_elements = 0;
        for pattern in patterns.iter() {
            let mut lhs_ops = init_npdm_operators(&pattern.lhs, big.left_block())?;
            let mut dot_ops = init_npdm_operators(&pattern.dot, big.dot_block())?;
            let mut rhs_ops = init_npdm_operators(&pattern.rhs, big.right_block())?;
            let wrappers = [lhs_ops.wrapper(), dot_ops.wrapper(), rhs_ops.wrapper()];

            let lhs_bases = get_all_mpi_ops(comm, &mut lhs_ops, params.max_lhs_per_rank)?;
            let dot_bases = Self::local_instances(&mut dot_ops)?;
            let rhs_bases = Self::local_instances(&mut rhs_ops)?;

            let triples = itertools::iproduct!(lhs_bases.iter(), dot_bases.iter(), rhs_bases.iter())
                .map(|(lhs, dot, rhs)| {
                    let owner = owned_position(wrappers, [lhs, dot, rhs], n_orbitals, end_pos)?;
                    Ok((owner == Some(sweep_pos)).then_some([lhs, dot, rhs]))
                })
                .filter_map(|triple| triple.transpose())
                .collect::<Result<Vec<_>, anyhow::Error>>()?;

            let elements = triples
                .par_iter()
                .map(|ops| {
                    NpdmExpectations::new(
                        big,
                        bra,
                        ket,
                        *ops,
                        order,
                        params.screening_threshold,
                        params.spin_adaptation_threshold,
                    )
                    .get_nonspin_adapted_expectations()
                })
                .collect::<Result<Vec<_>, _>>()?;

            for (indices, value) in elements.iter().flatten() {
                store.accumulate(indices, *value)?;
                n_elements += 1;
            }
            log::debug!(
                "Pattern {pattern} at sweep position {sweep_pos}: {} owned triple(s) on rank {}.",
                triples.len(),
                comm.rank()
            );
            n_triples += triples.len();
        }

        if comm.rank() == 0 {
            npdm_output!(
                "Sweep position {sweep_pos:>3}: {:>3} pattern(s), {n_triples:>6} triple(s), {n_elements:>8} element(s) on rank 0",
                patterns.len()
            );
        }
        Ok(())
    }

    /// Gathers the elements accumulated on all ranks into one store.
    ///
    /// # Returns
    ///
    /// The merged store, identical on every rank. The local stores are left untouched.
    pub fn collect_sparse_array<C: Communicator + ?Sized>(
        &self,
        comm: &C,
    ) -> Result<NpdmSparseArray, anyhow::Error> {
        let order = self.parameters.npdm_order;
        let local = self
            .sparse_array
            .clone()
            .unwrap_or_else(|| NpdmSparseArray::new(order));
        let mut merged = NpdmSparseArray::new(order);
        for store in all_gather_serde(comm, &local)?.iter() {
            merged.merge(store)?;
        }
        Ok(merged)
    }

    /// Drains the accumulated elements into the exporter, sums the exported arrays over all
    /// ranks and saves them on rank 0.
    ///
    /// # Arguments
    ///
    /// * `comm` - The communicator connecting the ranks.
    /// * `i` - The bra state index.
    /// * `j` - The ket state index.
    pub fn save_full_array<C: Communicator + ?Sized>(
        &mut self,
        comm: &C,
        i: usize,
        j: usize,
    ) -> Result<(), anyhow::Error> {
        let params = self.parameters;
        if comm.rank() == 0 {
            log_subtitle(&format!("Dense {}-particle density matrix", params.npdm_order));
        }
        self.exporter.resize(2 * self.n_orbitals);
        self.exporter.clear();
        if let Some(store) = self.sparse_array.as_mut() {
            store.drain_to(&mut self.exporter, i, j)?;
        }
        self.exporter.accumulate(comm)?;
        if comm.rank() == 0 {
            self.exporter.save_binary(i, j)?;
            if params.write_text {
                self.exporter.save_text(i, j)?;
            }
            if params.write_spatial {
                self.exporter.save_spatial_binary(i, j)?;
                if params.write_text {
                    self.exporter.save_spatial_text(i, j)?;
                }
            }
            npdm_output!(
                "Saved dense {}-particle density matrix for state pair ({i}, {j}) to {}",
                params.npdm_order,
                params.output_directory.display()
            );
        }
        Ok(())
    }

    /// Gathers the accumulated elements of all ranks and saves them as a sparse list on rank 0.
    /// The local stores are cleared afterwards.
    ///
    /// # Arguments
    ///
    /// * `comm` - The communicator connecting the ranks.
    /// * `i` - The bra state index.
    /// * `j` - The ket state index.
    pub fn save_sparse_array<C: Communicator + ?Sized>(
        &mut self,
        comm: &C,
        i: usize,
        j: usize,
    ) -> Result<(), anyhow::Error> {
        let params = self.parameters;
        if comm.rank() == 0 {
            log_subtitle(&format!("Sparse {}-particle density matrix", params.npdm_order));
        }
        let merged = self.collect_sparse_array(comm)?;
        if comm.rank() == 0 {
            let stem = npdm_file_stem(
                &params.output_directory,
                params.npdm_order,
                Some("sparse"),
                i,
                j,
            );
            write_npdm_binary(&stem, NpdmFileType::Sparse, &merged)?;
            if params.write_text {
                write_npdm_text(&stem, 2 * self.n_orbitals, merged.sorted_elements())?;
            }
            npdm_output!(
                "Saved {} nonredundant {}-particle element(s) for state pair ({i}, {j}) to {}",
                merged.len(),
                params.npdm_order,
                params.output_directory.display()
            );
        }
        if let Some(store) = self.sparse_array.as_mut() {
            store.clear();
        }
        Ok(())
    }

    /// Saves the accumulated elements in the form selected by [`NpdmParams::use_full_array`].
    pub fn save_npdm<C: Communicator + ?Sized>(
        &mut self,
        comm: &C,
        i: usize,
        j: usize,
    ) -> Result<(), anyhow::Error> {
        if self.parameters.use_full_array {
            self.save_full_array(comm, i, j)
        } else {
            self.save_sparse_array(comm, i, j)
        }
    }
}

/// Returns the owner position of the element spanned by an operator triple.
fn owned_position(
    wrappers: [NpdmOpWrapper; 3],
    ops: [&NpdmSpinOpsBase; 3],
    n_orbitals: usize,
    end_pos: usize,
) -> Result<Option<usize>, anyhow::Error> {
    let (cres, dess) = wrappers.iter().zip(ops.iter()).try_fold(
        (vec![], vec![]),
        |(mut cres, mut dess), (wrapper, op)| {
            let (c, d) = wrapper.split_indices(&op.indices).map_err(|err| {
                format_err!("Cannot read the orbitals of {wrapper} instance: {err}")
            })?;
            cres.extend(c);
            dess.extend(d);
            Ok::<_, anyhow::Error>((cres, dess))
        },
    )?;
    log::trace!(
        "Triple with creators ({}) and destroyers ({}).",
        cres.iter().join(", "),
        dess.iter().join(", ")
    );
    Ok(owner_position(&cres, &dess, n_orbitals, end_pos))
}
