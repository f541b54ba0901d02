//! Standard simulated setups

use crate::drift_profiles::DriftProfile;
use crate::sim_devices::{SimulatorCamera, SimulatorMount, SimulatorStepGuider};
use crate::sky::{AoSimConfig, SimulatedSky, SkyConfig};
use guider::{Equipment, GuiderConfig, WorkerConfig};
use std::sync::Arc;

/// Build a sky and the equipment that observes it. An AO unit is attached
/// when the sky config has one.
pub fn create_simulated_equipment(
    config: SkyConfig,
    drift: Box<dyn DriftProfile>,
) -> (Equipment, SimulatedSky) {
    let sky = SimulatedSky::new(config, drift);
    let mut equipment = Equipment::new(
        Arc::new(SimulatorCamera::new(sky.clone())),
        Arc::new(SimulatorMount::new(sky.clone())),
    );
    if sky.config().ao.is_some() {
        equipment = equipment.with_step_guider(Arc::new(SimulatorStepGuider::new(sky.clone())));
    }
    (equipment, sky)
}

/// Sky with a rotated camera, a little Dec backlash and mild seeing
pub fn create_test_sky(seed: u64) -> SkyConfig {
    SkyConfig {
        dec_backlash_ms: 200,
        seed,
        ..SkyConfig::default()
    }
}

/// Same sky with an AO unit in the light path
pub fn create_test_sky_with_ao(seed: u64) -> SkyConfig {
    SkyConfig {
        ao: Some(AoSimConfig::default()),
        ..create_test_sky(seed)
    }
}

/// Guider config for simulated runs: short exposures, quick polling and a
/// fixed dither seed.
pub fn create_test_guider_config() -> GuiderConfig {
    GuiderConfig {
        exposure_ms: 10,
        worker: WorkerConfig {
            poll_interval_ms: 2,
            ..WorkerConfig::default()
        },
        dither_seed: Some(11),
        ..GuiderConfig::default()
    }
}
