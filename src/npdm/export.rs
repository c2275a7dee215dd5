//! Export hooks for accumulated density-matrix elements.

use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::{self, bail, ensure};
use itertools::Itertools;
use log;
use ndarray::{ArrayD, Dimension, IxDyn};

use crate::io::{
    npdm_file_stem, read_npdm_binary, write_npdm_binary, write_npdm_text, NpdmFileType,
};
use crate::npdm::distribution::{all_gather_serde, Communicator};

#[cfg(test)]
#[path = "export_tests.rs"]
mod export_tests;

// =================
// Trait definitions
// =================

/// Trait for consumers of nonredundant density-matrix elements.
///
/// The indices `i` and `j` taken by the saving and loading methods label the bra and ket states.
pub trait NpdmExporter {
    /// Resets the exporter to hold a density matrix over `dim` spin-orbitals.
    fn resize(&mut self, dim: usize);

    /// Zeroes all elements.
    fn clear(&mut self);

    /// Assigns canonical spin-orbital elements, together with every element related to them by
    /// permutational antisymmetry.
    fn assign_elements(&mut self, elements: &[(Vec<usize>, f64)]) -> Result<(), anyhow::Error>;

    /// Saves the spin-orbital density matrix as text.
    fn save_text(&self, i: usize, j: usize) -> Result<(), anyhow::Error>;

    /// Saves the spin-orbital density matrix in binary form.
    fn save_binary(&self, i: usize, j: usize) -> Result<(), anyhow::Error>;

    /// Saves the spin-summed density matrix as text.
    fn save_spatial_text(&self, i: usize, j: usize) -> Result<(), anyhow::Error>;

    /// Saves the spin-summed density matrix in binary form.
    fn save_spatial_binary(&self, i: usize, j: usize) -> Result<(), anyhow::Error>;

    /// Loads a spin-orbital density matrix previously saved by [`Self::save_binary`].
    fn load_binary(&mut self, i: usize, j: usize) -> Result<(), anyhow::Error>;

    /// Sums the density matrices held by all ranks, leaving the total on every rank.
    fn accumulate<C: Communicator + ?Sized>(&mut self, comm: &C) -> Result<(), anyhow::Error>;
}

// ==================
// Struct definitions
// ==================

/// A structure holding a dense spin-orbital density matrix.
#[derive(Clone, Debug)]
pub struct DenseNpdmArray {
    /// The order of the density matrix.
    order: usize,

    /// The directory into which files are saved.
    directory: PathBuf,

    /// The elements $`E[p, q, \ldots, r, s]`$, with one axis per operator.
    array: ArrayD<f64>,
}

/// Returns all permutations of `0..n` together with their parities.
fn signed_permutations(n: usize) -> Vec<(Vec<usize>, f64)> {
    (0..n)
        .permutations(n)
        .map(|perm| {
            let inversions = perm
                .iter()
                .tuple_combinations()
                .filter(|(a, b)| a > b)
                .count();
            let sign = if inversions % 2 == 0 { 1.0 } else { -1.0 };
            (perm, sign)
        })
        .collect_vec()
}

impl DenseNpdmArray {
    /// Creates an empty dense density matrix.
    ///
    /// # Arguments
    ///
    /// * `order` - The order of the density matrix.
    /// * `directory` - The directory into which files are saved.
    pub fn new<P: AsRef<Path>>(order: usize, directory: P) -> Self {
        Self {
            order,
            directory: directory.as_ref().to_path_buf(),
            array: ArrayD::zeros(IxDyn(&vec![0; 2 * order])),
        }
    }

    /// Returns the order of the density matrix.
    pub fn order(&self) -> usize {
        self.order
    }

    /// Returns the number of spin-orbitals.
    pub fn dim(&self) -> usize {
        self.array.shape().first().copied().unwrap_or(0)
    }

    /// Returns the spin-orbital elements.
    pub fn array(&self) -> &ArrayD<f64> {
        &self.array
    }

    /// Returns the spin-summed density matrix.
    ///
    /// The one-particle form is $`\gamma_{ij} = \sum_{\sigma} E[i\sigma, j\sigma]`$ and the
    /// two-particle form is $`\Gamma_{ijkl} = \sum_{\sigma\tau} E[i\sigma, j\tau, k\tau, l\sigma]`$.
    pub fn spatial_array(&self) -> Result<ArrayD<f64>, anyhow::Error> {
        let dim = self.dim();
        ensure!(
            dim % 2 == 0,
            "A spin-orbital dimension of {dim} does not pair up into spatial orbitals."
        );
        let n_orbs = dim / 2;
        let spatial = match self.order {
            1 => ArrayD::from_shape_fn(IxDyn(&[n_orbs, n_orbs]), |idx| {
                (0..2)
                    .map(|s| self.array[[2 * idx[0] + s, 2 * idx[1] + s].as_slice()])
                    .sum::<f64>()
            }),
            2 => ArrayD::from_shape_fn(IxDyn(&[n_orbs; 4]), |idx| {
                (0..2)
                    .cartesian_product(0..2)
                    .map(|(s, t)| {
                        self.array[[
                            2 * idx[0] + s,
                            2 * idx[1] + t,
                            2 * idx[2] + t,
                            2 * idx[3] + s,
                        ]
                        .as_slice()]
                    })
                    .sum::<f64>()
            }),
            order => bail!("Spin summation of {order}-particle density matrices is not available."),
        };
        Ok(spatial)
    }

    fn stem(&self, prefix: Option<&str>, i: usize, j: usize) -> PathBuf {
        npdm_file_stem(&self.directory, self.order, prefix, i, j)
    }
}

/// Returns the nonzero entries of a dense array as index-value rows.
fn nonzero_rows(array: &ArrayD<f64>) -> Vec<(Vec<usize>, f64)> {
    array
        .indexed_iter()
        .filter(|(_, value)| **value != 0.0)
        .map(|(idx, value)| (idx.slice().to_vec(), *value))
        .collect_vec()
}

impl NpdmExporter for DenseNpdmArray {
    fn resize(&mut self, dim: usize) {
        self.array = ArrayD::zeros(IxDyn(&vec![dim; 2 * self.order]));
    }

    fn clear(&mut self) {
        self.array.fill(0.0);
    }

    fn assign_elements(&mut self, elements: &[(Vec<usize>, f64)]) -> Result<(), anyhow::Error> {
        let dim = self.dim();
        let perms = signed_permutations(self.order);
        for (indices, value) in elements.iter() {
            ensure!(
                indices.len() == 2 * self.order && indices.iter().all(|&idx| idx < dim),
                "Element ({}) does not fit a {}-particle density matrix over {dim} spin-orbitals.",
                indices.iter().join(", "),
                self.order
            );
            let (cres, dess) = indices.split_at(self.order);
            for ((cperm, csign), (dperm, dsign)) in perms.iter().cartesian_product(perms.iter()) {
                let idx = cperm
                    .iter()
                    .map(|&k| cres[k])
                    .chain(dperm.iter().map(|&k| dess[k]))
                    .collect_vec();
                self.array[idx.as_slice()] = csign * dsign * value;
            }
        }
        log::debug!(
            "Assigned {} nonredundant element(s) to a dense {}-particle array.",
            elements.len(),
            self.order
        );
        Ok(())
    }

    fn save_text(&self, i: usize, j: usize) -> Result<(), anyhow::Error> {
        write_npdm_text(self.stem(None, i, j), self.dim(), nonzero_rows(&self.array))
    }

    fn save_binary(&self, i: usize, j: usize) -> Result<(), anyhow::Error> {
        write_npdm_binary(self.stem(None, i, j), NpdmFileType::Full, &self.array)
    }

    fn save_spatial_text(&self, i: usize, j: usize) -> Result<(), anyhow::Error> {
        let spatial = self.spatial_array()?;
        write_npdm_text(
            self.stem(Some("spatial"), i, j),
            self.dim() / 2,
            nonzero_rows(&spatial),
        )
    }

    fn save_spatial_binary(&self, i: usize, j: usize) -> Result<(), anyhow::Error> {
        let spatial = self.spatial_array()?;
        write_npdm_binary(self.stem(Some("spatial"), i, j), NpdmFileType::Spatial, &spatial)
    }

    fn load_binary(&mut self, i: usize, j: usize) -> Result<(), anyhow::Error> {
        let array: ArrayD<f64> = read_npdm_binary(self.stem(None, i, j), NpdmFileType::Full)?;
        ensure!(
            array.ndim() == 2 * self.order && array.shape().iter().all_equal(),
            "Loaded array of shape {:?} is not a {}-particle density matrix.",
            array.shape(),
            self.order
        );
        self.array = array;
        Ok(())
    }

    fn accumulate<C: Communicator + ?Sized>(&mut self, comm: &C) -> Result<(), anyhow::Error> {
        let arrays = all_gather_serde(comm, &self.array)?;
        let mut total = ArrayD::<f64>::zeros(self.array.raw_dim());
        for (rank, array) in arrays.iter().enumerate() {
            ensure!(
                array.shape() == total.shape(),
                "Rank {rank} holds an array of shape {:?}, but {:?} was expected.",
                array.shape(),
                total.shape()
            );
            total += array;
        }
        self.array = total;
        Ok(())
    }
}

impl fmt::Display for DenseNpdmArray {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Dense {}-particle density matrix over {} spin-orbital(s) in {}",
            self.order,
            self.dim(),
            self.directory.display()
        )
    }
}
