//! Nonredundant sparse storage of density-matrix elements.

use std::fmt;

use anyhow::{self, ensure};
use indexmap::IndexMap;
use itertools::Itertools;
use log;
use serde::{Deserialize, Serialize};

use crate::npdm::export::NpdmExporter;

#[cfg(test)]
#[path = "sparse_array_tests.rs"]
mod sparse_array_tests;

/// A canonical spin-orbital index tuple of a density-matrix element.
///
/// The first half holds creation indices and the second half destruction indices, each sorted
/// ascending without repetitions.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NpdmKey(pub Vec<usize>);

impl NpdmKey {
    /// Returns the spin-orbital indices of this key.
    pub fn indices(&self) -> &[usize] {
        &self.0
    }
}

impl fmt::Display for NpdmKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.0.iter().join(", "))
    }
}

/// Sorts a slice ascending and returns the parity of the sorting permutation, or `None` if the
/// slice contains a repeated value.
fn sort_with_parity(values: &[usize]) -> Option<(Vec<usize>, f64)> {
    let inversions = values
        .iter()
        .tuple_combinations()
        .map(|(a, b)| match a.cmp(b) {
            std::cmp::Ordering::Greater => Some(1usize),
            std::cmp::Ordering::Less => Some(0),
            std::cmp::Ordering::Equal => None,
        })
        .sum::<Option<usize>>()?;
    let sign = if inversions % 2 == 0 { 1.0 } else { -1.0 };
    Some((values.iter().copied().sorted().collect_vec(), sign))
}

/// Brings a spin-orbital index tuple into canonical form.
///
/// # Arguments
///
/// * `indices` - The creation indices followed by the destruction indices. The tuple must have
/// even length.
///
/// # Returns
///
/// The canonical key and the fermionic sign picked up by the reordering, or `None` if the
/// element vanishes identically because an index repeats within one half.
pub fn canonical_key(indices: &[usize]) -> Option<(NpdmKey, f64)> {
    if indices.len() % 2 != 0 {
        return None;
    }
    let (cres, dess) = indices.split_at(indices.len() / 2);
    let (cres, cre_sign) = sort_with_parity(cres)?;
    let (dess, des_sign) = sort_with_parity(dess)?;
    Some((
        NpdmKey(cres.into_iter().chain(dess).collect_vec()),
        cre_sign * des_sign,
    ))
}

/// A structure accumulating the nonredundant elements of one density matrix.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct NpdmSparseArray {
    /// The order of the density matrix.
    order: usize,

    /// The accumulated elements keyed by canonical index tuples. Explicit zeros are never kept.
    elements: IndexMap<NpdmKey, f64>,
}

impl NpdmSparseArray {
    /// Creates an empty store for a density matrix of the given order.
    pub fn new(order: usize) -> Self {
        Self {
            order,
            elements: IndexMap::new(),
        }
    }

    /// Returns the order of the density matrix.
    pub fn order(&self) -> usize {
        self.order
    }

    /// Returns the number of stored elements.
    pub fn len(&self) -> usize {
        self.elements.len()
    }

    /// Returns `true` if no element is stored.
    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// Returns the value of the element with the given (not necessarily canonical) indices.
    /// Absent elements are zero.
    pub fn get(&self, indices: &[usize]) -> f64 {
        if indices.len() != 2 * self.order {
            return 0.0;
        }
        canonical_key(indices)
            .and_then(|(key, sign)| self.elements.get(&key).map(|value| sign * value))
            .unwrap_or(0.0)
    }

    /// Iterates over the stored elements in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&NpdmKey, &f64)> {
        self.elements.iter()
    }

    /// Adds a contribution into the canonical element of `indices`.
    ///
    /// Contributions to identically vanishing elements are dropped. An element whose sum becomes
    /// exactly zero is removed.
    pub fn accumulate(&mut self, indices: &[usize], value: f64) -> Result<(), anyhow::Error> {
        ensure!(
            indices.len() == 2 * self.order,
            "Index tuple ({}) does not belong to a {}-particle density matrix.",
            indices.iter().join(", "),
            self.order
        );
        if let Some((key, sign)) = canonical_key(indices) {
            let sum = self.elements.get(&key).copied().unwrap_or(0.0) + sign * value;
            if sum == 0.0 {
                self.elements.shift_remove(&key);
            } else {
                self.elements.insert(key, sum);
            }
        }
        Ok(())
    }

    /// Adds a batch of canonical elements.
    pub fn accumulate_elements<I>(&mut self, elements: I) -> Result<(), anyhow::Error>
    where
        I: IntoIterator<Item = (NpdmKey, f64)>,
    {
        elements
            .into_iter()
            .try_for_each(|(key, value)| self.accumulate(key.indices(), value))
    }

    /// Folds another store of the same order into this one.
    pub fn merge(&mut self, other: &NpdmSparseArray) -> Result<(), anyhow::Error> {
        ensure!(
            self.order == other.order,
            "Cannot merge a {}-particle store into a {}-particle store.",
            other.order,
            self.order
        );
        self.accumulate_elements(
            other
                .elements
                .iter()
                .map(|(key, value)| (key.clone(), *value)),
        )
    }

    /// Returns all stored elements sorted by key.
    pub fn sorted_elements(&self) -> Vec<(Vec<usize>, f64)> {
        self.elements
            .iter()
            .sorted_by(|(a, _), (b, _)| a.cmp(b))
            .map(|(key, value)| (key.0.clone(), *value))
            .collect_vec()
    }

    /// Removes all stored elements.
    pub fn clear(&mut self) {
        self.elements.clear();
    }

    /// Exports all stored elements into an exporter and clears this store.
    ///
    /// # Arguments
    ///
    /// * `exporter` - The exporter receiving the elements through
    /// [`NpdmExporter::assign_elements`].
    /// * `i` - The bra state index.
    /// * `j` - The ket state index.
    ///
    /// # Returns
    ///
    /// The number of exported elements.
    pub fn drain_to<E: NpdmExporter>(
        &mut self,
        exporter: &mut E,
        i: usize,
        j: usize,
    ) -> Result<usize, anyhow::Error> {
        let elements = self.sorted_elements();
        log::debug!(
            "Exporting {} nonredundant {}-particle elements for state pair ({i}, {j}).",
            elements.len(),
            self.order
        );
        exporter.assign_elements(&elements)?;
        self.clear();
        Ok(elements.len())
    }
}
