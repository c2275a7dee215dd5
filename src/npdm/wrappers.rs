//! Spin-adapted operator wrappers for NPDM evaluation.
//!
//! A wrapper presents the operators of one renormalised block that match a fixed operator-type
//! pattern (for example `C`, `CD` or `CCD`) as an indexable sequence. Setting a local index
//! materialises the spin channels of one instance together with its orbital indices, its sign
//! factor and whether it is used in transposed form.

use std::borrow::Cow;
use std::fmt;

use anyhow::{self, bail, ensure, format_err};
use itertools::Itertools;
use ndarray::ArrayView2;
use serde::{Deserialize, Serialize};

use crate::angmom::{multiplicity, twice_spin_from_mult};
use crate::block::{OpArrayKind, OperatorArray, RenormalisedBlock};
use crate::operator::{BuildToken, OpKind, OperatorExpansion, OperatorView, SpinOperator};

#[cfg(test)]
#[path = "wrappers_tests.rs"]
mod wrappers_tests;

const OPEN: BuildToken = BuildToken::Open;
const CLOSE: BuildToken = BuildToken::Close;
const CRE: BuildToken = BuildToken::Op(OpKind::Cre);
const DES: BuildToken = BuildToken::Op(OpKind::Des);

// ================
// Enum definitions
// ================

/// An enumerated type for the supported block operator-type patterns.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NpdmOpWrapper {
    /// Variant for the identity on a block.
    Null,

    /// Variant for $`a^{\dagger}`$.
    C,

    /// Variant for $`a`$, the transpose of $`a^{\dagger}`$.
    D,

    /// Variant for $`a^{\dagger} a^{\dagger}`$.
    CC,

    /// Variant for $`a^{\dagger} a`$.
    CD,

    /// Variant for $`a a`$, the transpose of $`a^{\dagger} a^{\dagger}`$.
    DD,

    /// Variant for single-site $`((a^{\dagger} a^{\dagger}) a)`$.
    CompoundCCD,

    /// Variant for single-site $`(a^{\dagger} (a a))`$, the transpose of `CompoundCCD`.
    CompoundCDD,

    /// Variant for single-site $`((a^{\dagger} a^{\dagger}) (a a))`$.
    CompoundCCDD,
}

impl NpdmOpWrapper {
    /// Returns the elementary operator kinds of this pattern in normal order.
    pub fn op_kinds(&self) -> Vec<OpKind> {
        use OpKind::{Cre, Des};
        match self {
            NpdmOpWrapper::Null => vec![],
            NpdmOpWrapper::C => vec![Cre],
            NpdmOpWrapper::D => vec![Des],
            NpdmOpWrapper::CC => vec![Cre, Cre],
            NpdmOpWrapper::CD => vec![Cre, Des],
            NpdmOpWrapper::DD => vec![Des, Des],
            NpdmOpWrapper::CompoundCCD => vec![Cre, Cre, Des],
            NpdmOpWrapper::CompoundCDD => vec![Cre, Des, Des],
            NpdmOpWrapper::CompoundCCDD => vec![Cre, Cre, Des, Des],
        }
    }

    /// Returns the build pattern of this wrapper.
    pub fn build_pattern(&self) -> Vec<BuildToken> {
        match self {
            NpdmOpWrapper::Null => vec![OPEN, CLOSE],
            NpdmOpWrapper::C => vec![OPEN, CRE, CLOSE],
            NpdmOpWrapper::D => vec![OPEN, DES, CLOSE],
            NpdmOpWrapper::CC => vec![OPEN, CRE, CRE, CLOSE],
            NpdmOpWrapper::CD => vec![OPEN, CRE, DES, CLOSE],
            NpdmOpWrapper::DD => vec![OPEN, DES, DES, CLOSE],
            NpdmOpWrapper::CompoundCCD => vec![OPEN, OPEN, CRE, CRE, CLOSE, DES, CLOSE],
            NpdmOpWrapper::CompoundCDD => vec![OPEN, CRE, OPEN, DES, DES, CLOSE, CLOSE],
            NpdmOpWrapper::CompoundCCDD => {
                vec![OPEN, OPEN, CRE, CRE, CLOSE, OPEN, DES, DES, CLOSE, CLOSE]
            }
        }
    }

    /// Returns the spin multiplicities of the output channels of this wrapper.
    pub fn mults(&self) -> Vec<u32> {
        match self {
            NpdmOpWrapper::Null => vec![1],
            NpdmOpWrapper::C | NpdmOpWrapper::D => vec![2],
            NpdmOpWrapper::CC | NpdmOpWrapper::CD | NpdmOpWrapper::DD => vec![1, 3],
            NpdmOpWrapper::CompoundCCD | NpdmOpWrapper::CompoundCDD => vec![2, 2, 4],
            NpdmOpWrapper::CompoundCCDD => vec![1, 1],
        }
    }

    /// Returns `true` if the stored operators are used in transposed form.
    pub fn transpose(&self) -> bool {
        matches!(
            self,
            NpdmOpWrapper::D | NpdmOpWrapper::CD | NpdmOpWrapper::DD | NpdmOpWrapper::CompoundCDD
        )
    }

    /// Returns `true` if this wrapper builds its operators by single-site compounding.
    pub fn is_compound(&self) -> bool {
        matches!(
            self,
            NpdmOpWrapper::CompoundCCD | NpdmOpWrapper::CompoundCDD | NpdmOpWrapper::CompoundCCDD
        )
    }

    /// Returns the block operator array that indexes the instances of this wrapper.
    pub fn array_kind(&self) -> Option<OpArrayKind> {
        match self {
            NpdmOpWrapper::Null => None,
            NpdmOpWrapper::C | NpdmOpWrapper::D => Some(OpArrayKind::Cre),
            NpdmOpWrapper::CC | NpdmOpWrapper::DD => Some(OpArrayKind::CreCre),
            NpdmOpWrapper::CD => Some(OpArrayKind::CreDes),
            NpdmOpWrapper::CompoundCCD
            | NpdmOpWrapper::CompoundCDD
            | NpdmOpWrapper::CompoundCCDD => Some(OpArrayKind::CreCre),
        }
    }

    /// Splits the orbital indices of an instance into those of its creation and destruction
    /// operators, in the order in which the operators are used.
    pub fn split_indices(
        &self,
        indices: &[i32],
    ) -> Result<(Vec<usize>, Vec<usize>), anyhow::Error> {
        if *self == NpdmOpWrapper::Null {
            return Ok((vec![], vec![]));
        }
        let kinds = self.op_kinds();
        ensure!(
            indices.len() == kinds.len(),
            "Pattern {self} expects {} indices, but got {}.",
            kinds.len(),
            indices.len()
        );
        let orbs = indices
            .iter()
            .map(|&idx| {
                usize::try_from(idx).map_err(|_| format_err!("Invalid orbital index {idx}."))
            })
            .collect::<Result<Vec<_>, _>>()?;
        let n_cre = kinds.iter().filter(|kind| **kind == OpKind::Cre).count();
        let (cres, dess) = orbs.split_at(n_cre);
        Ok((cres.to_vec(), dess.to_vec()))
    }
}

impl fmt::Display for NpdmOpWrapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}",
            self.build_pattern().iter().map(|t| t.to_string()).join("")
        )
    }
}

// ==================
// Struct definitions
// ==================

/// A structure holding the per-instance state of an operator wrapper. This is what gets shipped
/// between ranks when an instance is evaluated away from its resident rank.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NpdmSpinOpsBase {
    /// The build pattern of the operators.
    pub build_pattern: Vec<BuildToken>,

    /// The spin multiplicities of the output channels.
    pub mults: Vec<u32>,

    /// The sign factor applied to the operators of the current instance.
    pub factor: f64,

    /// Boolean indicating if the operators are used in transposed form.
    pub transpose: bool,

    /// The orbital indices of the current instance in the order the operators are used. The
    /// identity carries the single sentinel `-1`.
    pub indices: Vec<i32>,

    /// The number of instances the wrapper enumerates on its block.
    pub size: usize,

    /// The spin channels of the current instance. The identity has none.
    pub op_reps: Vec<SpinOperator>,
}

impl NpdmSpinOpsBase {
    fn new(wrapper: NpdmOpWrapper, size: usize) -> Self {
        Self {
            build_pattern: wrapper.build_pattern(),
            mults: wrapper.mults(),
            factor: 1.0,
            transpose: wrapper.transpose(),
            indices: if wrapper == NpdmOpWrapper::Null {
                vec![-1]
            } else {
                vec![]
            },
            size,
            op_reps: vec![],
        }
    }

    /// Returns the spin channels of the current instance, with transposition applied. The
    /// identity yields a single spin-zero channel.
    pub fn channels(&self) -> Vec<NpdmChannel<'_>> {
        if self.op_reps.is_empty() {
            vec![NpdmChannel {
                twice_s: 0,
                view: None,
            }]
        } else {
            self.op_reps
                .iter()
                .map(|op| NpdmChannel {
                    twice_s: op.twice_s(),
                    view: Some(op.view(self.transpose)),
                })
                .collect_vec()
        }
    }
}

/// A structure representing one spin channel of a wrapper instance.
#[derive(Clone, Copy, Debug)]
pub struct NpdmChannel<'a> {
    /// The doubled spin of the channel.
    pub twice_s: u32,

    /// The viewed operator, or `None` for the identity.
    view: Option<OperatorView<'a>>,
}

impl<'a> NpdmChannel<'a> {
    /// Returns the matrix and expansion of the component with doubled projection `twice_m`. The
    /// matrix is `None` for the identity.
    pub fn component(
        &self,
        twice_m: i32,
    ) -> Option<(Option<ArrayView2<'a, f64>>, Cow<'a, OperatorExpansion>)> {
        match self.view {
            None => (twice_m == 0).then(|| (None, Cow::Owned(OperatorExpansion::identity()))),
            Some(view) => view
                .component(twice_m)
                .map(|comp| (Some(comp.matrix), comp.expansion)),
        }
    }
}

/// A structure presenting the operators of a block that match one pattern.
pub struct NpdmSpinOps<'a, B: RenormalisedBlock> {
    /// The pattern of this wrapper.
    wrapper: NpdmOpWrapper,

    /// The block the operators are drawn from.
    spin_block: Option<&'a B>,

    /// The state of the current instance.
    base: NpdmSpinOpsBase,
}

impl<'a, B: RenormalisedBlock> NpdmSpinOps<'a, B> {
    /// Creates a wrapper over a block.
    ///
    /// # Arguments
    ///
    /// * `wrapper` - The operator-type pattern.
    /// * `spin_block` - The block to draw operators from. This may only be `None` for the
    /// identity.
    pub fn new(wrapper: NpdmOpWrapper, spin_block: Option<&'a B>) -> Result<Self, anyhow::Error> {
        let size = match (wrapper, wrapper.array_kind()) {
            (NpdmOpWrapper::Null, _) => 0,
            (_, None) => 0,
            (_, Some(_)) if wrapper.is_compound() => 1,
            (_, Some(kind)) => spin_block
                .ok_or_else(|| format_err!("Pattern {wrapper} needs a block."))?
                .op_array(kind)?
                .size(),
        };
        if wrapper != NpdmOpWrapper::Null {
            ensure!(spin_block.is_some(), "Pattern {wrapper} needs a block.");
        }
        Ok(Self {
            wrapper,
            spin_block,
            base: NpdmSpinOpsBase::new(wrapper, size),
        })
    }

    /// Returns the pattern of this wrapper.
    pub fn wrapper(&self) -> NpdmOpWrapper {
        self.wrapper
    }

    /// Returns the number of instances as recorded in the descriptor. The identity records zero.
    pub fn size(&self) -> usize {
        self.base.size
    }

    /// Returns the number of instances to iterate over. The identity enumerates exactly one.
    pub fn n_instances(&self) -> usize {
        if self.wrapper == NpdmOpWrapper::Null {
            1
        } else {
            self.base.size
        }
    }

    /// Returns the state of the current instance.
    pub fn base(&self) -> &NpdmSpinOpsBase {
        &self.base
    }

    fn block(&self) -> Result<&'a B, anyhow::Error> {
        self.spin_block
            .ok_or_else(|| format_err!("Pattern {} needs a block.", self.wrapper))
    }

    fn array(&self, kind: OpArrayKind) -> Result<&'a B::Array, anyhow::Error> {
        self.block()?.op_array(kind)
    }

    /// Returns `true` if every operator needed by instance `idx` is resident on this rank.
    pub fn is_local(&self, idx: usize) -> bool {
        let resident = |kind: OpArrayKind| {
            self.array(kind)
                .map(|array| array.is_local(idx))
                .unwrap_or(false)
        };
        match self.wrapper {
            NpdmOpWrapper::Null => idx == 0,
            wrapper if wrapper.is_compound() => {
                resident(OpArrayKind::CreCre) && resident(OpArrayKind::Cre)
            }
            wrapper => wrapper.array_kind().map(resident).unwrap_or(false),
        }
    }

    /// Returns the orbital indices that instance `idx` would take, using labels only.
    ///
    /// # Errors
    ///
    /// Errors if `idx` is out of range or if the labels of a compound instance do not all refer
    /// to the same orbital.
    pub fn describe(&self, idx: usize) -> Result<Vec<i32>, anyhow::Error> {
        let to_i32 = |orb: usize| {
            i32::try_from(orb).map_err(|_| format_err!("Orbital {orb} does not fit an index."))
        };
        match self.wrapper {
            NpdmOpWrapper::Null => {
                ensure!(idx == 0, "The identity has a single instance, but {idx} was requested.");
                Ok(vec![-1])
            }
            NpdmOpWrapper::C | NpdmOpWrapper::D => {
                let labels = self.array(OpArrayKind::Cre)?.orbs(idx)?;
                labels.iter().map(|&orb| to_i32(orb)).collect()
            }
            NpdmOpWrapper::CC | NpdmOpWrapper::CD | NpdmOpWrapper::DD => {
                let kind = if self.wrapper == NpdmOpWrapper::CD {
                    OpArrayKind::CreDes
                } else {
                    OpArrayKind::CreCre
                };
                match self.array(kind)?.orbs(idx)? {
                    [ix, jx] => Ok(vec![to_i32(*jx)?, to_i32(*ix)?]),
                    labels => bail!(
                        "A {kind} element must carry two orbital labels, but got ({}).",
                        labels.iter().join(", ")
                    ),
                }
            }
            NpdmOpWrapper::CompoundCCD
            | NpdmOpWrapper::CompoundCDD
            | NpdmOpWrapper::CompoundCCDD => {
                let two_labels = self.array(OpArrayKind::CreCre)?.orbs(idx)?;
                let one_labels = self.array(OpArrayKind::Cre)?.orbs(idx)?;
                let ix = *two_labels
                    .first()
                    .ok_or_else(|| format_err!("A CRE_CRE element has no labels."))?;
                ensure!(
                    two_labels.iter().chain(one_labels.iter()).all(|&orb| orb == ix),
                    "Compound pattern {} needs all operators on one orbital, but got ({}) and ({}).",
                    self.wrapper,
                    two_labels.iter().join(", "),
                    one_labels.iter().join(", ")
                );
                let rank = self.wrapper.op_kinds().len();
                Ok(vec![to_i32(ix)?; rank])
            }
        }
    }

    /// Materialises instance `idx`, replacing the operators of any previous instance.
    ///
    /// # Errors
    ///
    /// Errors if instance `idx` is not resident on this rank, or if a compound instance spans
    /// more than one orbital.
    pub fn set_local_ops(&mut self, idx: usize) -> Result<(), anyhow::Error> {
        let indices = self.describe(idx)?;
        let (op_reps, factor) = match self.wrapper {
            NpdmOpWrapper::Null => (vec![], 1.0),
            NpdmOpWrapper::C | NpdmOpWrapper::D | NpdmOpWrapper::CD | NpdmOpWrapper::DD => {
                let kind = self
                    .wrapper
                    .array_kind()
                    .ok_or_else(|| format_err!("Pattern {} has no array.", self.wrapper))?;
                (self.array(kind)?.local_element(idx)?.to_vec(), 1.0)
            }
            NpdmOpWrapper::CC => {
                let factor = if indices[0] != indices[1] { -1.0 } else { 1.0 };
                (
                    self.array(OpArrayKind::CreCre)?.local_element(idx)?.to_vec(),
                    factor,
                )
            }
            NpdmOpWrapper::CompoundCCD | NpdmOpWrapper::CompoundCDD => {
                let ix = usize::try_from(indices[0])?;
                let two_ops = self.array(OpArrayKind::CreCre)?.local_element(idx)?;
                let one_ops = self.array(OpArrayKind::Cre)?.local_element(idx)?;
                let op_reps = [(0, 0, 0), (1, 0, 0), (1, 0, 1)]
                    .into_iter()
                    .map(|(ilhs, irhs, ispin)| {
                        build_compound_operator(two_ops, ilhs, one_ops, irhs, ispin, ix, true)
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                (op_reps, 1.0)
            }
            NpdmOpWrapper::CompoundCCDD => {
                let ix = usize::try_from(indices[0])?;
                let two_ops = self.array(OpArrayKind::CreCre)?.local_element(idx)?;
                let op_reps = [(0, 0, 0), (1, 1, 0)]
                    .into_iter()
                    .map(|(ilhs, irhs, ispin)| {
                        build_compound_operator(two_ops, ilhs, two_ops, irhs, ispin, ix, true)
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                (op_reps, 1.0)
            }
        };
        ensure!(
            op_reps.is_empty() || op_reps.len() == self.base.mults.len(),
            "Pattern {} expects {} spin channels, but {} were built.",
            self.wrapper,
            self.base.mults.len(),
            op_reps.len()
        );
        ensure!(
            op_reps
                .iter()
                .zip(self.base.mults.iter())
                .all(|(op, &mult)| op.twice_s() == twice_spin_from_mult(mult)),
            "Pattern {} expects channel multiplicities ({}), but ({}) were built.",
            self.wrapper,
            self.base.mults.iter().join(", "),
            op_reps.iter().map(|op| multiplicity(op.twice_s())).join(", ")
        );
        self.base.indices = indices;
        self.base.factor = factor;
        self.base.op_reps = op_reps;
        Ok(())
    }
}

/// Builds a single-site compound operator by coupling one channel of `lhs` with one channel of
/// `rhs`.
///
/// # Arguments
///
/// * `lhs` - The spin channels of the left operand.
/// * `ilhs` - The channel of `lhs` to use.
/// * `rhs` - The spin channels of the right operand.
/// * `irhs` - The channel of `rhs` to use.
/// * `ispin` - The position of the target spin among the spins allowed by the coupling.
/// * `ix` - The orbital shared by all operators.
/// * `transpose` - Boolean indicating if `rhs` enters in transposed form.
///
/// # Returns
///
/// A new operator owning its matrices. Neither operand is modified.
pub fn build_compound_operator(
    lhs: &[SpinOperator],
    ilhs: usize,
    rhs: &[SpinOperator],
    irhs: usize,
    ispin: usize,
    ix: usize,
    transpose: bool,
) -> Result<SpinOperator, anyhow::Error> {
    let lhs_op = lhs
        .get(ilhs)
        .ok_or_else(|| format_err!("Left operand has no channel {ilhs}."))?;
    let rhs_op = rhs
        .get(irhs)
        .ok_or_else(|| format_err!("Right operand has no channel {irhs}."))?;
    let quanta = if transpose {
        lhs_op.delta_quantum() - rhs_op.delta_quantum()
    } else {
        lhs_op.delta_quantum() + rhs_op.delta_quantum()
    };
    let delta_quantum = *quanta.get(ispin).ok_or_else(|| {
        format_err!(
            "Spin position {ispin} is not available when coupling {} with {}.",
            lhs_op.delta_quantum(),
            rhs_op.delta_quantum()
        )
    })?;
    let orbs = vec![ix; lhs_op.orbs().len() + rhs_op.orbs().len()];
    SpinOperator::coupled(
        &lhs_op.view(false),
        &rhs_op.view(transpose),
        delta_quantum,
        orbs,
    )
}
