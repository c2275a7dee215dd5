//! Driver sweeping an exact Fock-space chain through the NPDM machinery.
//!
//! Every sweep position of a small orbital chain is turned into an exact superblock, the
//! density-matrix elements are accumulated over one or more in-process ranks, and the result is
//! checked against brute-force Fock-space expectation values.

use std::fmt;
use std::thread;

use anyhow::{self, ensure, format_err};
use derive_builder::Builder;
use itertools::Itertools;
use log;
use ndarray::ArrayD;
use serde::{Deserialize, Serialize};

use crate::block::fock::{FockSpace, FockSuperblock, FockWavefunction, Residency};
use crate::drivers::Driver;
use crate::io::format::{
    log_micsec_begin, log_micsec_end, log_title, npdm_output, write_subtitle, NpdmOutput,
};
use crate::npdm::distribution::{Communicator, LocalWorld, PeerAborted};
use crate::npdm::driver::{NpdmDriver, NpdmParams};
use crate::npdm::export::{DenseNpdmArray, NpdmExporter};
use crate::npdm::sparse_array::NpdmSparseArray;

#[cfg(test)]
#[path = "reference_sweep_tests.rs"]
mod reference_sweep_tests;

// ==================
// Struct definitions
// ==================

// ----------
// Parameters
// ----------

const fn default_n_orbitals() -> usize {
    4
}
const fn default_n_electrons() -> usize {
    4
}
const fn default_n_ranks() -> usize {
    1
}
const fn default_true() -> bool {
    true
}

/// A structure containing control parameters for a reference sweep over an exact Fock-space
/// chain.
#[derive(Clone, Builder, Debug, PartialEq, Serialize, Deserialize)]
pub struct FockSweepParams {
    /// The number of spatial orbitals in the chain. At least three are needed.
    #[builder(default = "4")]
    #[serde(default = "default_n_orbitals")]
    pub n_orbitals: usize,

    /// The number of electrons.
    #[builder(default = "4")]
    #[serde(default = "default_n_electrons")]
    pub n_electrons: usize,

    /// The doubled $`S_z`$ projection of the wavefunctions.
    #[builder(default = "0")]
    #[serde(default)]
    pub twice_sz: i32,

    /// The seed of the random ket wavefunction.
    #[builder(default = "0")]
    #[serde(default)]
    pub seed: u64,

    /// The seed of a separate random bra wavefunction. If `None`, the bra is the ket and the
    /// ordinary density matrix is computed. Otherwise, a transition density matrix is computed.
    #[builder(default = "None")]
    #[serde(default)]
    pub bra_seed: Option<u64>,

    /// The number of in-process ranks sharing the left-block operators.
    #[builder(default = "1")]
    #[serde(default = "default_n_ranks")]
    pub n_ranks: usize,

    /// Boolean indicating if the swept elements are compared against brute-force values.
    #[builder(default = "true")]
    #[serde(default = "default_true")]
    pub verify: bool,

    /// Boolean indicating if the density matrix is saved through the export hooks.
    #[builder(default = "false")]
    #[serde(default)]
    pub save: bool,
}

impl FockSweepParams {
    /// Returns a builder to construct a [`FockSweepParams`] structure.
    pub fn builder() -> FockSweepParamsBuilder {
        FockSweepParamsBuilder::default()
    }

    /// Returns the bra and ket state indices used for file names.
    fn state_pair(&self) -> (usize, usize) {
        if self.bra_seed.is_some() {
            (0, 1)
        } else {
            (0, 0)
        }
    }
}

impl Default for FockSweepParams {
    fn default() -> Self {
        Self::builder()
            .build()
            .expect("Unable to construct a default `FockSweepParams`.")
    }
}

impl fmt::Display for FockSweepParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Chain length: {} orbital(s)", self.n_orbitals)?;
        writeln!(f, "Electrons: {}", self.n_electrons)?;
        writeln!(f, "Doubled Sz: {}", self.twice_sz)?;
        writeln!(f, "Ket seed: {}", self.seed)?;
        if let Some(bra_seed) = self.bra_seed {
            writeln!(f, "Bra seed: {bra_seed}")?;
        }
        writeln!(f, "Ranks: {}", self.n_ranks)?;
        writeln!(f)?;
        Ok(())
    }
}

// ------
// Result
// ------

/// A structure containing the results of a reference sweep.
#[derive(Clone, Builder, Debug)]
pub struct FockSweepResult {
    /// The control parameters used to obtain this set of results.
    pub parameters: FockSweepParams,

    /// The nonredundant elements gathered from all ranks.
    pub elements: NpdmSparseArray,

    /// The spin-summed density matrix.
    pub spatial: ArrayD<f64>,

    /// The full trace of the spin-summed density matrix: $`\sum_i \gamma_{ii}`$ for one-particle
    /// and $`\sum_{ij} \Gamma_{ijji}`$ for two-particle density matrices.
    pub spatial_trace: f64,

    /// The largest deviation of any element from its brute-force value, if verified.
    #[builder(default = "None")]
    pub max_deviation: Option<f64>,
}

impl FockSweepResult {
    /// Returns a builder to construct a [`FockSweepResult`] structure.
    fn builder() -> FockSweepResultBuilder {
        FockSweepResultBuilder::default()
    }
}

impl fmt::Display for FockSweepResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_subtitle(f, "Reference sweep summary")?;
        writeln!(f)?;
        writeln!(
            f,
            "Nonredundant {}-particle elements: {}",
            self.elements.order(),
            self.elements.len()
        )?;
        writeln!(f, "Spin-summed trace: {:+.10}", self.spatial_trace)?;
        if let Some(deviation) = self.max_deviation {
            writeln!(f, "Max deviation from brute force: {deviation:.3e}")?;
        }
        writeln!(f)?;
        Ok(())
    }
}

// ------
// Driver
// ------

/// A driver for reference sweeps over exact Fock-space chains.
#[derive(Clone, Builder)]
pub struct FockSweepDriver<'a> {
    /// The control parameters for the chain and the sweep.
    parameters: &'a FockSweepParams,

    /// The control parameters for the density-matrix computation.
    npdm_parameters: &'a NpdmParams,

    /// The result of the sweep.
    #[builder(setter(skip), default = "None")]
    result: Option<FockSweepResult>,
}

impl<'a> FockSweepDriver<'a> {
    /// Returns a builder to construct a [`FockSweepDriver`] structure.
    pub fn builder() -> FockSweepDriverBuilder<'a> {
        FockSweepDriverBuilder::default()
    }

    /// Runs every sweep position on one rank. A rank that fails leaves its world, so that its
    /// peers fail too.
    ///
    /// # Returns
    ///
    /// The elements gathered from all ranks.
    fn sweep_rank<C: Communicator>(
        &self,
        comm: &C,
        space: &FockSpace,
        wavefunctions: &[FockWavefunction],
    ) -> Result<NpdmSparseArray, anyhow::Error> {
        self.sweep_rank_positions(comm, space, wavefunctions)
            .map_err(|err| {
                if !err.is::<PeerAborted>() {
                    log::error!("Rank {} failed: {err:#}", comm.rank());
                    comm.abort();
                }
                err
            })
    }

    fn sweep_rank_positions<C: Communicator>(
        &self,
        comm: &C,
        space: &FockSpace,
        wavefunctions: &[FockWavefunction],
    ) -> Result<NpdmSparseArray, anyhow::Error> {
        let npdm_params = self.npdm_parameters;
        let mut driver = NpdmDriver::builder()
            .parameters(npdm_params)
            .exporter(DenseNpdmArray::new(
                npdm_params.npdm_order,
                &npdm_params.output_directory,
            ))
            .build()?;
        let residency = if comm.size() > 1 {
            Residency::RoundRobin {
                rank: comm.rank(),
                size: comm.size(),
            }
        } else {
            Residency::Replicated
        };
        let end_pos = space.n_orbitals() - 2;
        for sweep_pos in 1..=end_pos {
            let superblock = FockSuperblock::new(space.clone(), sweep_pos, residency)?;
            driver.compute_npdm_elements(wavefunctions, &superblock, comm, sweep_pos, end_pos)?;
        }
        let elements = driver.collect_sparse_array(comm)?;
        if self.parameters.save {
            let (i, j) = self.parameters.state_pair();
            driver.save_npdm(comm, i, j)?;
        }
        Ok(elements)
    }

    /// Executes the reference sweep.
    fn sweep(&mut self) -> Result<(), anyhow::Error> {
        log_title("NPDM Reference Sweep");
        npdm_output!("");
        let params = self.parameters;
        let npdm_params = self.npdm_parameters;
        params.log_output_display();
        npdm_params.log_output_display();
        npdm_output!("");

        ensure!(
            params.n_orbitals >= 3,
            "A reference sweep needs at least three orbitals, but got {}.",
            params.n_orbitals
        );
        let space = FockSpace::new(params.n_orbitals)?;
        let ket = FockWavefunction::random(&space, params.n_electrons, params.twice_sz, params.seed)?;
        let wavefunctions = match params.bra_seed {
            Some(bra_seed) => vec![
                FockWavefunction::random(&space, params.n_electrons, params.twice_sz, bra_seed)?,
                ket,
            ],
            None => vec![ket],
        };

        log_micsec_begin("Sweep");
        let comms = LocalWorld::new(params.n_ranks)?;
        let this = &*self;
        let gathered = thread::scope(|s| {
            let handles = comms
                .into_iter()
                .map(|comm| {
                    let (space, wavefunctions) = (&space, &wavefunctions);
                    s.spawn(move || this.sweep_rank(&comm, space, wavefunctions))
                })
                .collect_vec();
            let outcomes = handles
                .into_iter()
                .map(|handle| {
                    handle
                        .join()
                        .map_err(|_| format_err!("A sweeping rank panicked."))?
                })
                .collect_vec();
            // Failures of ranks that left the world come before those of their blocked peers.
            let (gathered, errors): (Vec<NpdmSparseArray>, Vec<anyhow::Error>) =
                outcomes.into_iter().partition_result();
            match errors
                .into_iter()
                .sorted_by_key(|err| err.is::<PeerAborted>())
                .next()
            {
                Some(err) => Err(err),
                None => Ok(gathered),
            }
        })?;
        log_micsec_end("Sweep");
        npdm_output!("");

        let elements = gathered
            .into_iter()
            .next()
            .ok_or_else(|| format_err!("No rank returned any elements."))?;

        let order = npdm_params.npdm_order;
        let mut dense = DenseNpdmArray::new(order, &npdm_params.output_directory);
        dense.resize(space.n_spin_orbitals());
        dense.assign_elements(&elements.sorted_elements())?;
        let spatial = dense.spatial_array()?;
        let n = space.n_orbitals();
        let spatial_trace = match order {
            1 => (0..n).map(|i| spatial[[i, i].as_slice()]).sum::<f64>(),
            _ => (0..n)
                .cartesian_product(0..n)
                .map(|(i, j)| spatial[[i, j, j, i].as_slice()])
                .sum::<f64>(),
        };

        let max_deviation = if params.verify {
            let (bra, ket) = match wavefunctions.as_slice() {
                [bra, ket] => (bra, ket),
                _ => (&wavefunctions[0], &wavefunctions[0]),
            };
            let halves = (0..space.n_spin_orbitals())
                .combinations(order)
                .collect_vec();
            let deviation = halves
                .iter()
                .cartesian_product(halves.iter())
                .map(|(cres, dess)| {
                    let indices = cres.iter().chain(dess.iter()).copied().collect_vec();
                    let brute =
                        space.npdm_element(bra.coefficients(), ket.coefficients(), &indices);
                    (elements.get(&indices) - brute).abs()
                })
                .fold(0.0, f64::max);
            log::debug!("Largest deviation from brute-force elements: {deviation:.3e}.");
            Some(deviation)
        } else {
            None
        };

        self.result = Some(
            FockSweepResult::builder()
                .parameters(params.clone())
                .elements(elements)
                .spatial(spatial)
                .spatial_trace(spatial_trace)
                .max_deviation(max_deviation)
                .build()?,
        );
        if let Some(res) = self.result.as_ref() {
            res.log_output_display();
        }
        Ok(())
    }
}

impl Driver for FockSweepDriver<'_> {
    type Params = FockSweepParams;

    type Outcome = FockSweepResult;

    fn result(&self) -> Result<&Self::Outcome, anyhow::Error> {
        self.result
            .as_ref()
            .ok_or_else(|| format_err!("No reference sweep results found."))
    }

    fn run(&mut self) -> Result<(), anyhow::Error> {
        self.sweep()
    }
}
