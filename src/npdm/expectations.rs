//! Evaluation of spin-adapted expectation values and their decomposition onto spin-orbital
//! density-matrix elements.
//!
//! For one (left, dot, right) operator triple, every combination of spin channels is coupled as
//! $`[[L \otimes D]^{S_{12}} \otimes R]^{K}_{Q = 0}`$. Each such coupled operator is kept as a
//! pair of an expectation value and a second-quantised expansion, so that
//!
//! ```math
//! \langle \mathrm{bra} | [[L \otimes D]^{S_{12}} \otimes R]^{K}_{0} | \mathrm{ket} \rangle
//!   = \sum_{\mathbf{k}} A_{\mathbf{k}} E_{\mathbf{k}},
//! ```
//!
//! where $`E_{\mathbf{k}}`$ are the canonical spin-orbital elements. Collecting one such equation
//! per coupled operator gives a linear system for the $`E_{\mathbf{k}}`$.

use std::collections::HashMap;
use std::fmt;

use anyhow::{self, ensure, format_err};
use indexmap::IndexMap;
use itertools::Itertools;
use log;
use nalgebra::{DMatrix, DVector};

use crate::angmom::{clebsch_gordan, coupled_spins, spin_label, twice_projections};
use crate::block::Superblock;
use crate::npdm::sparse_array::{canonical_key, NpdmKey};
use crate::npdm::wrappers::{NpdmChannel, NpdmSpinOpsBase};
use crate::operator::{normal_order, twice_delta_m, OperatorExpansion};

#[cfg(test)]
#[path = "expectations_tests.rs"]
mod expectations_tests;

/// Singular values below this are treated as zero when ranking the decomposition.
const RANK_TOLERANCE: f64 = 1e-8;

/// Expansion coefficients below this are dropped.
const EXPANSION_THRESHOLD: f64 = 1e-14;

/// A structure holding one coupled-spin expectation value of an operator triple.
#[derive(Clone, Debug)]
pub struct SpinAdaptedExpectation {
    /// The spin channels of the left, dot and right operators.
    pub channels: [usize; 3],

    /// The doubled intermediate spin of the left and dot operators.
    pub twice_s12: u32,

    /// The doubled total spin.
    pub twice_k: u32,

    /// The expectation value of the $`Q = 0`$ component.
    pub value: f64,

    /// The second-quantised form of the $`Q = 0`$ component.
    expansion: OperatorExpansion,
}

impl SpinAdaptedExpectation {
    /// Returns the second-quantised form of the coupled operator.
    pub fn expansion(&self) -> &OperatorExpansion {
        &self.expansion
    }
}

impl fmt::Display for SpinAdaptedExpectation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "channels ({}) S12 = {} K = {}: {:+.10e}",
            self.channels.iter().join(", "),
            spin_label(self.twice_s12),
            spin_label(self.twice_k),
            self.value
        )
    }
}

/// A structure evaluating one (left, dot, right) operator triple against a pair of wavefunctions.
pub struct NpdmExpectations<'a, S: Superblock> {
    /// The superblock providing the contraction machinery.
    superblock: &'a S,

    /// The bra wavefunction.
    bra: &'a S::Wavefunction,

    /// The ket wavefunction.
    ket: &'a S::Wavefunction,

    /// The left, dot and right operator instances.
    ops: [&'a NpdmSpinOpsBase; 3],

    /// The density-matrix order.
    order: usize,

    /// Elements smaller than this in magnitude are dropped.
    screening_threshold: f64,

    /// The largest residual tolerated when decomposing onto spin-orbital elements.
    spin_adaptation_threshold: f64,
}

impl<'a, S: Superblock> NpdmExpectations<'a, S> {
    /// Creates an evaluator for one operator triple.
    ///
    /// # Arguments
    ///
    /// * `superblock` - The superblock the operators act on.
    /// * `bra` - The bra wavefunction.
    /// * `ket` - The ket wavefunction.
    /// * `ops` - The left, dot and right operator instances.
    /// * `order` - The density-matrix order.
    /// * `screening_threshold` - The magnitude below which elements are dropped.
    /// * `spin_adaptation_threshold` - The largest tolerated decomposition residual.
    pub fn new(
        superblock: &'a S,
        bra: &'a S::Wavefunction,
        ket: &'a S::Wavefunction,
        ops: [&'a NpdmSpinOpsBase; 3],
        order: usize,
        screening_threshold: f64,
        spin_adaptation_threshold: f64,
    ) -> Self {
        Self {
            superblock,
            bra,
            ket,
            ops,
            order,
            screening_threshold,
            spin_adaptation_threshold,
        }
    }

    /// Returns the combined sign factor of the triple.
    fn factor(&self) -> f64 {
        self.ops.iter().map(|op| op.factor).product()
    }

    /// Computes every coupled-spin expectation value of the triple.
    ///
    /// Raw block expectation values are computed once per combination of channels and
    /// projections, then reused by every coupling they enter.
    pub fn get_spin_adapted_expectations(
        &self,
    ) -> Result<Vec<SpinAdaptedExpectation>, anyhow::Error> {
        let [lhs, dot, rhs] = self.ops.map(|op| op.channels());
        let factor = self.factor();
        let mut raw_cache = HashMap::<([usize; 3], [i32; 3]), f64>::new();
        let mut results = Vec::new();

        for ((il, lch), (id, dch), (ir, rch)) in itertools::iproduct!(
            lhs.iter().enumerate(),
            dot.iter().enumerate(),
            rhs.iter().enumerate()
        ) {
            for twice_s12 in coupled_spins(lch.twice_s, dch.twice_s) {
                for twice_k in coupled_spins(twice_s12, rch.twice_s) {
                    if twice_k % 2 != 0 {
                        continue;
                    }
                    let channels = [il, id, ir];
                    let (value, expansion) = self.couple(
                        [lch, dch, rch],
                        channels,
                        twice_s12,
                        twice_k,
                        &mut raw_cache,
                    )?;
                    results.push(SpinAdaptedExpectation {
                        channels,
                        twice_s12,
                        twice_k,
                        value: factor * value,
                        expansion: expansion.scaled(factor),
                    });
                }
            }
        }
        log::trace!(
            "Triple ({}) | ({}) | ({}) gave {} coupled expectation value(s) from {} raw value(s).",
            self.ops[0].indices.iter().join(", "),
            self.ops[1].indices.iter().join(", "),
            self.ops[2].indices.iter().join(", "),
            results.len(),
            raw_cache.len()
        );
        Ok(results)
    }

    /// Forms the $`Q = 0`$ component of one channel coupling.
    fn couple(
        &self,
        chans: [&NpdmChannel<'_>; 3],
        channels: [usize; 3],
        twice_s12: u32,
        twice_k: u32,
        raw_cache: &mut HashMap<([usize; 3], [i32; 3]), f64>,
    ) -> Result<(f64, OperatorExpansion), anyhow::Error> {
        let [lch, dch, rch] = chans;
        let mut value = 0.0;
        let mut expansion = OperatorExpansion::default();
        for (ml, md) in twice_projections(lch.twice_s).cartesian_product(twice_projections(dch.twice_s))
        {
            let m12 = ml + md;
            let mr = -m12;
            if m12.unsigned_abs() > twice_s12 || mr.unsigned_abs() > rch.twice_s {
                continue;
            }
            let coeff = clebsch_gordan(lch.twice_s, ml, dch.twice_s, md, twice_s12, m12)
                * clebsch_gordan(twice_s12, m12, rch.twice_s, mr, twice_k, 0);
            if coeff.abs() < EXPANSION_THRESHOLD {
                continue;
            }
            let missing = |m: i32| format_err!("Operator component with 2M = {m} is missing.");
            let (lmat, lexp) = lch.component(ml).ok_or_else(|| missing(ml))?;
            let (dmat, dexp) = dch.component(md).ok_or_else(|| missing(md))?;
            let (rmat, rexp) = rch.component(mr).ok_or_else(|| missing(mr))?;

            let raw = match raw_cache.get(&(channels, [ml, md, mr])) {
                Some(raw) => *raw,
                None => {
                    let raw = self
                        .superblock
                        .expectation(self.bra, self.ket, [lmat, dmat, rmat])?;
                    raw_cache.insert((channels, [ml, md, mr]), raw);
                    raw
                }
            };
            value += coeff * raw;
            expansion.add_scaled(&lexp.product(&dexp).product(&rexp), coeff);
        }
        let expansion = expansion.simplified(EXPANSION_THRESHOLD);
        for (string, _) in expansion.terms() {
            ensure!(
                twice_delta_m(string) == 0,
                "Coupled operator S12 = {}, K = {} contains the string `{}` with nonzero spin change.",
                spin_label(twice_s12),
                spin_label(twice_k),
                string.iter().map(|op| op.to_string()).join(" ")
            );
        }
        Ok((value, expansion))
    }

    /// Decomposes the coupled-spin expectation values of the triple onto canonical spin-orbital
    /// elements.
    ///
    /// # Returns
    ///
    /// The canonical spin-orbital index tuples and their values, screened by the screening
    /// threshold, in order of first appearance.
    ///
    /// # Errors
    ///
    /// Errors if a coupled operator does not reduce to pure normal-ordered strings of the
    /// expected order, if the decomposition is rank-deficient, or if its residual exceeds the
    /// spin-adaptation threshold.
    pub fn get_nonspin_adapted_expectations(
        &self,
    ) -> Result<Vec<(Vec<usize>, f64)>, anyhow::Error> {
        let expectations = self.get_spin_adapted_expectations()?;

        let mut keys = IndexMap::<NpdmKey, usize>::new();
        let mut rows = Vec::with_capacity(expectations.len());
        for expectation in expectations.iter() {
            let mut row = Vec::<(usize, f64)>::new();
            for (string, coeff) in expectation.expansion.terms() {
                let (cres, dess, sign) = normal_order(string)?;
                ensure!(
                    cres.len() == self.order && dess.len() == self.order,
                    "String `{}` does not belong to a density matrix of order {}.",
                    string.iter().map(|op| op.to_string()).join(" "),
                    self.order
                );
                let indices = cres.into_iter().chain(dess).collect_vec();
                let Some((key, key_sign)) = canonical_key(&indices) else {
                    continue;
                };
                let n_keys = keys.len();
                let col = *keys.entry(key).or_insert(n_keys);
                row.push((col, coeff * sign * key_sign));
            }
            rows.push((row, expectation.value));
        }

        if keys.is_empty() {
            let max_value = rows
                .iter()
                .map(|(_, value)| value.abs())
                .fold(0.0, f64::max);
            ensure!(
                max_value <= self.spin_adaptation_threshold,
                "Coupled expectation value {max_value:+.3e} has no spin-orbital strings to carry it."
            );
            return Ok(vec![]);
        }

        let (nrows, ncols) = (rows.len(), keys.len());
        let mut a = DMatrix::<f64>::zeros(nrows, ncols);
        let b = DVector::<f64>::from_iterator(nrows, rows.iter().map(|(_, value)| *value));
        for (i, (row, _)) in rows.iter().enumerate() {
            for (j, coeff) in row.iter() {
                a[(i, *j)] += coeff;
            }
        }

        let svd = a.clone().svd(true, true);
        let rank = svd.rank(RANK_TOLERANCE);
        ensure!(
            rank == ncols,
            "Spin decomposition is rank-deficient: rank {rank} for {ncols} element(s) from {nrows} coupled value(s)."
        );
        let x = svd
            .solve(&b, RANK_TOLERANCE)
            .map_err(|err| format_err!("Spin decomposition failed: {err}"))?;
        let residual = (&a * &x - &b).norm();
        ensure!(
            residual <= self.spin_adaptation_threshold,
            "Spin decomposition residual {residual:.3e} exceeds {:.3e}.",
            self.spin_adaptation_threshold
        );

        Ok(keys
            .into_iter()
            .zip(x.iter())
            .filter(|(_, value)| value.abs() >= self.screening_threshold)
            .map(|((key, _), value)| (key.0, *value))
            .collect_vec())
    }
}
