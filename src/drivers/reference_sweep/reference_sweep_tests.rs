use approx::assert_abs_diff_eq;
use tempfile::tempdir;

use crate::drivers::reference_sweep::{FockSweepDriver, FockSweepParams};
use crate::drivers::Driver;
use crate::npdm::driver::NpdmParams;

#[test]
fn test_drivers_reference_sweep_one_particle() {
    let dir = tempdir().unwrap();
    let params = FockSweepParams::builder()
        .n_orbitals(4)
        .n_electrons(3)
        .twice_sz(1)
        .seed(9)
        .build()
        .unwrap();
    let npdm_params = NpdmParams::builder()
        .npdm_order(1)
        .output_directory(dir.path())
        .build()
        .unwrap();
    let mut driver = FockSweepDriver::builder()
        .parameters(&params)
        .npdm_parameters(&npdm_params)
        .build()
        .unwrap();
    assert!(driver.result().is_err());
    driver.run().unwrap();
    let res = driver.result().unwrap();
    assert_eq!(res.spatial.shape(), &[4, 4]);
    assert_abs_diff_eq!(res.spatial_trace, 3.0, epsilon = 1e-9);
    assert!(res.max_deviation.unwrap() < 1e-9);
    assert!(res.to_string().contains("Nonredundant 1-particle elements"));
}

#[test]
fn test_drivers_reference_sweep_two_particle_distributed() {
    let dir = tempdir().unwrap();
    let params = FockSweepParams::builder()
        .n_orbitals(4)
        .n_electrons(4)
        .seed(21)
        .n_ranks(2)
        .build()
        .unwrap();
    let npdm_params = NpdmParams::builder()
        .output_directory(dir.path())
        .build()
        .unwrap();
    let mut driver = FockSweepDriver::builder()
        .parameters(&params)
        .npdm_parameters(&npdm_params)
        .build()
        .unwrap();
    driver.run().unwrap();
    let res = driver.result().unwrap();
    assert_eq!(res.spatial.shape(), &[4, 4, 4, 4]);
    assert_abs_diff_eq!(res.spatial_trace, 12.0, epsilon = 1e-9);
    assert!(res.max_deviation.unwrap() < 1e-9);
}

#[test]
fn test_drivers_reference_sweep_transition_and_save() {
    let dir = tempdir().unwrap();
    let params = FockSweepParams::builder()
        .n_orbitals(3)
        .n_electrons(2)
        .seed(1)
        .bra_seed(Some(2))
        .save(true)
        .build()
        .unwrap();
    let npdm_params = NpdmParams::builder()
        .npdm_order(1)
        .output_directory(dir.path())
        .build()
        .unwrap();
    let mut driver = FockSweepDriver::builder()
        .parameters(&params)
        .npdm_parameters(&npdm_params)
        .build()
        .unwrap();
    driver.run().unwrap();
    let res = driver.result().unwrap();
    assert!(res.max_deviation.unwrap() < 1e-9);
    assert!(dir.path().join("onepdm.0.1.npdm.bin").exists());
    assert!(dir.path().join("spatial_onepdm.0.1.npdm.spatial.bin").exists());
}

#[test]
fn test_drivers_reference_sweep_rejects_short_chain() {
    let params = FockSweepParams::builder().n_orbitals(2).build().unwrap();
    let npdm_params = NpdmParams::default();
    let mut driver = FockSweepDriver::builder()
        .parameters(&params)
        .npdm_parameters(&npdm_params)
        .build()
        .unwrap();
    assert!(driver.run().is_err());
    assert!(driver.result().is_err());
}
