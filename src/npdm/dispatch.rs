//! Selection of operator wrappers from operator-type signatures.

use anyhow::{self, bail};
use itertools::Itertools;
use log;

use crate::block::RenormalisedBlock;
use crate::npdm::wrappers::{NpdmOpWrapper, NpdmSpinOps};
use crate::operator::OpKind;

#[cfg(test)]
#[path = "dispatch_tests.rs"]
mod dispatch_tests;

impl NpdmOpWrapper {
    /// Returns the wrapper handling a normal-ordered operator-type signature.
    ///
    /// # Errors
    ///
    /// Errors if the signature is not one of the supported patterns.
    pub fn from_op_kinds(kinds: &[OpKind]) -> Result<Self, anyhow::Error> {
        use OpKind::{Cre, Des};
        let wrapper = match kinds {
            [] => NpdmOpWrapper::Null,
            [Cre] => NpdmOpWrapper::C,
            [Des] => NpdmOpWrapper::D,
            [Cre, Cre] => NpdmOpWrapper::CC,
            [Cre, Des] => NpdmOpWrapper::CD,
            [Des, Des] => NpdmOpWrapper::DD,
            [Cre, Cre, Des] => NpdmOpWrapper::CompoundCCD,
            [Cre, Des, Des] => NpdmOpWrapper::CompoundCDD,
            [Cre, Cre, Des, Des] => NpdmOpWrapper::CompoundCCDD,
            _ => bail!(
                "Operator pattern `{}` is not supported.",
                kinds.iter().map(|kind| kind.to_string()).join("")
            ),
        };
        Ok(wrapper)
    }
}

/// Builds the operator wrapper for an operator-type signature on a block.
///
/// # Arguments
///
/// * `kinds` - The normal-ordered operator kinds the block contributes.
/// * `spin_block` - The block to draw operators from.
///
/// # Returns
///
/// The configured wrapper.
///
/// # Errors
///
/// Errors if the signature is unsupported.
pub fn init_npdm_operators<'a, B: RenormalisedBlock>(
    kinds: &[OpKind],
    spin_block: &'a B,
) -> Result<NpdmSpinOps<'a, B>, anyhow::Error> {
    let wrapper = NpdmOpWrapper::from_op_kinds(kinds)?;
    log::trace!("Dispatching operator pattern {wrapper}.");
    NpdmSpinOps::new(wrapper, Some(spin_block))
}
