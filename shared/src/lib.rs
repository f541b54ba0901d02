//! Shared components for the guiding workspace.
//!
//! Device-role traits (camera, mount, AO), image geometry and the reference
//! collaborators the guider depends on: star detection and dark calibration.

pub mod camera_interface;
pub mod dark_calibration;
pub mod image_proc;
pub mod mount_interface;
pub mod star_detector;
