//! YAML input of the `npdm` binary.

use anyhow;
use serde::{Deserialize, Serialize};

use crate::drivers::reference_sweep::{FockSweepDriver, FockSweepParams};
use crate::drivers::Driver;
use crate::interfaces::InputHandle;
use crate::io::format::{npdm_error, npdm_output};
use crate::npdm::driver::NpdmParams;


/// A structure containing NPDM input parameters which can be serialised into and deserialised
/// from a YAML input file.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Input {
    /// Specification of the exact Fock-space chain to be swept.
    ///
    /// # Default
    ///
    /// If not specified, [`FockSweepParams::default`] is used.
    #[serde(default)]
    pub system: FockSweepParams,

    /// Specification of the density-matrix computation.
    ///
    /// # Default
    ///
    /// If not specified, [`NpdmParams::default`] is used.
    #[serde(default)]
    pub npdm: NpdmParams,
}

impl InputHandle for Input {
    fn handle(&self) -> Result<(), anyhow::Error> {
        let mut driver = FockSweepDriver::builder()
            .parameters(&self.system)
            .npdm_parameters(&self.npdm)
            .build()?;
        driver.run().map_err(|err| {
            npdm_error!("Reference sweep failed: {err}");
            err
        })?;
        if let Some(deviation) = driver.result()?.max_deviation {
            npdm_output!("Reference sweep completed with a largest deviation of {deviation:.3e}.");
        }
        Ok(())
    }
}
