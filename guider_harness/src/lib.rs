//! Guider harness for simulation and end-to-end testing
//!
//! Provides a simulated sky with camera, mount and AO drivers that observe
//! it, drift profiles, and a session runner that drives a
//! [`guider::Guider`] through selection, calibration and guiding.

pub mod drift_profiles;
pub mod helpers;
pub mod runner;
pub mod sim_devices;
pub mod sky;

pub use drift_profiles::{DriftProfile, TestDrifts};
pub use helpers::{
    create_simulated_equipment, create_test_guider_config, create_test_sky,
    create_test_sky_with_ao,
};
pub use runner::{run_session, unguided_rms, SessionOptions, SessionResults};
pub use sim_devices::{SimulatorCamera, SimulatorMount, SimulatorStepGuider};
pub use sky::{AoSimConfig, SimulatedSky, SkyConfig};
