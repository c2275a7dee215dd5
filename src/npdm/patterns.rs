//! Operator patterns per sweep position and ownership of density-matrix elements.
//!
//! At sweep position $`p`$ of an $`n`$-orbital chain, the left block spans orbitals
//! $`0, \ldots, p - 1`$, the dot spans $`p`$ and the right block spans $`p + 1, \ldots, n - 1`$.
//! The normal-ordered string $`(a^{\dagger})^k a^k`$ of a $`k`$-particle density matrix is split
//! into per-block strings $`(a^{\dagger})^{c} a^{d}`$ with $`c, d \le 2`$. A block carrying more
//! than two operators must span a single orbital. Every element is evaluated at exactly one
//! position, its owner, which is the smallest position at which its orbitals fit these rules.

use std::fmt;

use anyhow::{self, ensure};
use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::operator::OpKind;

#[cfg(test)]
#[path = "patterns_tests.rs"]
mod patterns_tests;

/// The largest density-matrix order whose block strings stay within four operators.
pub const MAX_NPDM_ORDER: usize = 2;

/// The largest number of operators of one kind that a single block may carry.
const MAX_KIND_PER_BLOCK: usize = 2;

/// The largest number of operators that a multi-orbital block may carry.
const MAX_OPS_PER_WIDE_BLOCK: usize = 2;

/// A structure holding the operator kinds contributed by the three blocks of a superblock.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NpdmPattern {
    /// The kinds contributed by the left block.
    pub lhs: Vec<OpKind>,

    /// The kinds contributed by the dot block.
    pub dot: Vec<OpKind>,

    /// The kinds contributed by the right block.
    pub rhs: Vec<OpKind>,
}

fn block_kinds(n_cre: usize, n_des: usize) -> Vec<OpKind> {
    std::iter::repeat(OpKind::Cre)
        .take(n_cre)
        .chain(std::iter::repeat(OpKind::Des).take(n_des))
        .collect_vec()
}

impl fmt::Display for NpdmPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let show = |kinds: &[OpKind]| kinds.iter().map(|kind| kind.to_string()).join("");
        write!(
            f,
            "[{}|{}|{}]",
            show(&self.lhs),
            show(&self.dot),
            show(&self.rhs)
        )
    }
}

/// Returns `true` if a block spanning one or several orbitals may carry `n_cre` creators and
/// `n_des` destroyers.
fn block_admits(n_cre: usize, n_des: usize, single_site: bool) -> bool {
    n_cre <= MAX_KIND_PER_BLOCK
        && n_des <= MAX_KIND_PER_BLOCK
        && (single_site || n_cre + n_des <= MAX_OPS_PER_WIDE_BLOCK)
}

/// Returns which of the left and right blocks span a single orbital at a sweep position.
fn single_sites(n_orbitals: usize, sweep_pos: usize) -> (bool, bool) {
    (sweep_pos == 1, sweep_pos + 2 == n_orbitals)
}

fn check_layout(order: usize, n_orbitals: usize, sweep_pos: usize) -> Result<(), anyhow::Error> {
    ensure!(
        (1..=MAX_NPDM_ORDER).contains(&order),
        "Density matrices of order {order} are not supported (1..={MAX_NPDM_ORDER})."
    );
    ensure!(
        n_orbitals >= 3,
        "A chain of {n_orbitals} orbitals is too short for a left/dot/right split."
    );
    ensure!(
        (1..=n_orbitals - 2).contains(&sweep_pos),
        "Sweep position {sweep_pos} is outside 1..={}.",
        n_orbitals - 2
    );
    Ok(())
}

/// Enumerates the operator patterns to evaluate at one sweep position.
///
/// # Arguments
///
/// * `order` - The density-matrix order.
/// * `n_orbitals` - The number of orbitals in the chain.
/// * `sweep_pos` - The sweep position (the dot orbital).
///
/// # Returns
///
/// The admissible patterns in a fixed order.
pub fn npdm_patterns(
    order: usize,
    n_orbitals: usize,
    sweep_pos: usize,
) -> Result<Vec<NpdmPattern>, anyhow::Error> {
    check_layout(order, n_orbitals, sweep_pos)?;
    let (left_single, right_single) = single_sites(n_orbitals, sweep_pos);
    let splits = (0..=MAX_KIND_PER_BLOCK)
        .cartesian_product(0..=MAX_KIND_PER_BLOCK)
        .filter(|(l, d)| l + d <= order)
        .map(|(l, d)| (l, d, order - l - d))
        .filter(|(_, _, r)| *r <= MAX_KIND_PER_BLOCK)
        .collect_vec();
    let patterns = splits
        .iter()
        .cartesian_product(splits.iter())
        .filter(|((cl, cd, cr), (dl, dd, dr))| {
            block_admits(*cl, *dl, left_single)
                && block_admits(*cd, *dd, true)
                && block_admits(*cr, *dr, right_single)
        })
        .map(|((cl, cd, cr), (dl, dd, dr))| NpdmPattern {
            lhs: block_kinds(*cl, *dl),
            dot: block_kinds(*cd, *dd),
            rhs: block_kinds(*cr, *dr),
        })
        .collect_vec();
    Ok(patterns)
}

/// Returns the sweep position that owns an element with the given creation and destruction
/// orbitals.
///
/// # Arguments
///
/// * `cre_orbs` - The spatial orbitals of the creation operators.
/// * `des_orbs` - The spatial orbitals of the destruction operators.
/// * `n_orbitals` - The number of orbitals in the chain.
/// * `end_pos` - The last sweep position considered.
///
/// # Returns
///
/// The smallest position in `1..=end_pos` at which the orbitals fit the block rules, or `None`
/// if there is none.
pub fn owner_position(
    cre_orbs: &[usize],
    des_orbs: &[usize],
    n_orbitals: usize,
    end_pos: usize,
) -> Option<usize> {
    if n_orbitals < 3 {
        return None;
    }
    (1..=end_pos.min(n_orbitals - 2)).find(|&pos| {
        let (left_single, right_single) = single_sites(n_orbitals, pos);
        let count = |orbs: &[usize], pred: &dyn Fn(usize) -> bool| {
            orbs.iter().filter(|&&orb| pred(orb)).count()
        };
        let left = |orb: usize| orb < pos;
        let dot = |orb: usize| orb == pos;
        let right = |orb: usize| orb > pos;
        block_admits(count(cre_orbs, &left), count(des_orbs, &left), left_single)
            && block_admits(count(cre_orbs, &dot), count(des_orbs, &dot), true)
            && block_admits(count(cre_orbs, &right), count(des_orbs, &right), right_single)
    })
}
