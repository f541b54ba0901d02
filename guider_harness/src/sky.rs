//! Simulated sky shared by the simulated camera, mount and AO unit
//!
//! One guide star sits at a base position. Its true position is the base
//! plus the drift profile at the current simulated time, plus everything the
//! mount and AO unit have done to it. Frames add seeing jitter and sensor
//! noise on top of the true position.

use crate::drift_profiles::DriftProfile;
use ndarray::Array2;
use rand::Rng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use shared::image_proc::AABB;
use shared::mount_interface::{GuideAxis, GuideDirection, StepResult};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Simulated AO unit geometry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AoSimConfig {
    /// Travel limit from center in steps, both axes
    pub max_position: u32,
    /// Star motion per step (pixels)
    pub px_per_step: f64,
    /// Angle of the AO X axis on the sensor (degrees)
    pub angle_deg: f64,
}

impl Default for AoSimConfig {
    fn default() -> Self {
        Self {
            max_position: 40,
            px_per_step: 0.5,
            angle_deg: 10.0,
        }
    }
}

/// Sensor, star and mount geometry for a simulated session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkyConfig {
    pub width: usize,
    pub height: usize,
    /// Initial star position (pixels)
    pub star_x: f64,
    pub star_y: f64,
    /// Star peak above background (ADU)
    pub star_peak: f64,
    /// Gaussian PSF sigma (pixels)
    pub star_sigma_px: f64,
    /// Sky background level (ADU)
    pub background: f64,
    /// Read noise sigma (ADU)
    pub read_noise: f64,
    /// Per-frame seeing jitter sigma (pixels)
    pub seeing_sigma_px: f64,
    /// Angle of the mount RA axis on the sensor (degrees)
    pub camera_angle_deg: f64,
    /// Star motion per ms of RA pulse
    pub ra_rate_px_per_ms: f64,
    /// Star motion per ms of Dec pulse
    pub dec_rate_px_per_ms: f64,
    /// Dec pulse time lost after each Dec reversal (ms)
    pub dec_backlash_ms: u32,
    /// Simulated time between frames (ms)
    pub frame_interval_ms: u64,
    /// Mount declination reported to the guider (radians)
    pub declination: Option<f64>,
    pub ao: Option<AoSimConfig>,
    /// Noise seed
    pub seed: u64,
}

impl Default for SkyConfig {
    fn default() -> Self {
        Self {
            width: 256,
            height: 256,
            star_x: 128.0,
            star_y: 128.0,
            star_peak: 12_000.0,
            star_sigma_px: 1.6,
            background: 800.0,
            read_noise: 5.0,
            seeing_sigma_px: 0.1,
            camera_angle_deg: 20.0,
            ra_rate_px_per_ms: 0.004,
            dec_rate_px_per_ms: 0.004,
            dec_backlash_ms: 0,
            frame_interval_ms: 2000,
            declination: Some(0.35),
            ao: None,
            seed: 42,
        }
    }
}

struct SkyState {
    elapsed: Duration,
    /// Star displacement caused by mount pulses (pixels)
    mount_offset: (f64, f64),
    ao_position: (i32, i32),
    last_dec_direction: Option<GuideDirection>,
    pulses: usize,
}

/// Shared sky model. Clones refer to the same sky.
#[derive(Clone)]
pub struct SimulatedSky {
    config: Arc<SkyConfig>,
    drift: Arc<dyn DriftProfile>,
    state: Arc<Mutex<SkyState>>,
}

fn unit(angle_deg: f64) -> ((f64, f64), (f64, f64)) {
    let a = angle_deg.to_radians();
    ((a.cos(), a.sin()), (-a.sin(), a.cos()))
}

impl SimulatedSky {
    pub fn new(config: SkyConfig, drift: Box<dyn DriftProfile>) -> Self {
        Self {
            config: Arc::new(config),
            drift: Arc::from(drift),
            state: Arc::new(Mutex::new(SkyState {
                elapsed: Duration::ZERO,
                mount_offset: (0.0, 0.0),
                ao_position: (0, 0),
                last_dec_direction: None,
                pulses: 0,
            })),
        }
    }

    pub fn config(&self) -> &SkyConfig {
        &self.config
    }

    pub fn drift_description(&self) -> &str {
        self.drift.description()
    }

    pub fn elapsed(&self) -> Duration {
        self.state.lock().unwrap().elapsed
    }

    /// Advance simulated time by one frame interval.
    pub fn advance_frame(&self) {
        let dt = Duration::from_millis(self.config.frame_interval_ms);
        self.state.lock().unwrap().elapsed += dt;
    }

    /// Number of mount pulses applied so far
    pub fn pulse_count(&self) -> usize {
        self.state.lock().unwrap().pulses
    }

    /// Star position without seeing or noise.
    pub fn true_position(&self) -> (f64, f64) {
        let state = self.state.lock().unwrap();
        let (dx, dy) = self.drift.offset(state.elapsed);
        let (ao_x, ao_y) = self.ao_offset(state.ao_position);
        (
            self.config.star_x + dx + state.mount_offset.0 + ao_x,
            self.config.star_y + dy + state.mount_offset.1 + ao_y,
        )
    }

    /// Star position with drift only, as if nothing were guiding.
    pub fn unguided_position(&self, t: Duration) -> (f64, f64) {
        let (dx, dy) = self.drift.offset(t);
        (self.config.star_x + dx, self.config.star_y + dy)
    }

    fn ao_offset(&self, position: (i32, i32)) -> (f64, f64) {
        let Some(ao) = &self.config.ao else {
            return (0.0, 0.0);
        };
        let (ux, uy) = unit(ao.angle_deg);
        let sx = position.0 as f64 * ao.px_per_step;
        let sy = position.1 as f64 * ao.px_per_step;
        (sx * ux.0 + sy * uy.0, sx * ux.1 + sy * uy.1)
    }

    /// Apply a mount guide pulse. West and North move the star along the
    /// RA and Dec axes on the sensor.
    pub fn pulse(&self, direction: GuideDirection, duration_ms: u32) {
        let mut state = self.state.lock().unwrap();
        state.pulses += 1;
        let (ra_axis, dec_axis) = unit(self.config.camera_angle_deg);
        let mut ms = duration_ms;
        let (axis, rate) = match direction.axis() {
            GuideAxis::Axis1 => (ra_axis, self.config.ra_rate_px_per_ms),
            GuideAxis::Axis2 => {
                let reversed = state
                    .last_dec_direction
                    .is_some_and(|last| last != direction);
                if reversed {
                    ms = ms.saturating_sub(self.config.dec_backlash_ms);
                }
                state.last_dec_direction = Some(direction);
                (dec_axis, self.config.dec_rate_px_per_ms)
            }
        };
        let distance = direction.sign() as f64 * ms as f64 * rate;
        state.mount_offset.0 += distance * axis.0;
        state.mount_offset.1 += distance * axis.1;
    }

    /// Step the AO unit, stopping at its travel limit.
    pub fn step_ao(&self, direction: GuideDirection, count: u32) -> StepResult {
        let Some(ao) = &self.config.ao else {
            return StepResult::Error;
        };
        let limit = ao.max_position as i32;
        let mut state = self.state.lock().unwrap();
        let position = match direction.axis() {
            GuideAxis::Axis1 => &mut state.ao_position.0,
            GuideAxis::Axis2 => &mut state.ao_position.1,
        };
        let target = *position + direction.sign() * count as i32;
        *position = target.clamp(-limit, limit);
        if *position == target {
            StepResult::Ok
        } else {
            StepResult::LimitReached
        }
    }

    pub fn ao_position(&self) -> (i32, i32) {
        self.state.lock().unwrap().ao_position
    }

    pub fn center_ao(&self) {
        self.state.lock().unwrap().ao_position = (0, 0);
    }

    /// Render a full-size frame. Outside `subframe` the image is zero.
    pub fn render<R: Rng>(&self, subframe: Option<&AABB>, rng: &mut R) -> Array2<u16> {
        let config = &self.config;
        let (mut x, mut y) = self.true_position();
        if config.seeing_sigma_px > 0.0 {
            if let Ok(seeing) = Normal::new(0.0, config.seeing_sigma_px) {
                x += seeing.sample(rng);
                y += seeing.sample(rng);
            }
        }
        let noise = Normal::new(0.0, config.read_noise.max(1e-6)).ok();

        let region = subframe
            .copied()
            .unwrap_or_else(|| AABB::full_frame(config.height, config.width));
        let two_sigma2 = 2.0 * config.star_sigma_px.powi(2);
        let mut image = Array2::<u16>::zeros((config.height, config.width));
        for row in region.min_row..=region.max_row.min(config.height - 1) {
            for col in region.min_col..=region.max_col.min(config.width - 1) {
                let d2 = (col as f64 - x).powi(2) + (row as f64 - y).powi(2);
                let mut value = config.background + config.star_peak * (-d2 / two_sigma2).exp();
                if let Some(noise) = &noise {
                    value += noise.sample(rng);
                }
                image[[row, col]] = value.clamp(0.0, u16::MAX as f64) as u16;
            }
        }
        image
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drift_profiles::{LinearDrift, NoDrift};
    use approx::assert_relative_eq;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn square_sky() -> SkyConfig {
        SkyConfig {
            camera_angle_deg: 0.0,
            ra_rate_px_per_ms: 0.01,
            dec_rate_px_per_ms: 0.01,
            ..SkyConfig::default()
        }
    }

    #[test]
    fn test_pulses_move_star_along_axes() {
        let sky = SimulatedSky::new(square_sky(), Box::new(NoDrift));
        sky.pulse(GuideDirection::West, 100);
        sky.pulse(GuideDirection::South, 200);
        let (x, y) = sky.true_position();
        assert_relative_eq!(x, 129.0, epsilon = 1e-9);
        assert_relative_eq!(y, 126.0, epsilon = 1e-9);
        assert_eq!(sky.pulse_count(), 2);
    }

    #[test]
    fn test_dec_backlash_absorbs_reversal() {
        let config = SkyConfig {
            dec_backlash_ms: 300,
            ..square_sky()
        };
        let sky = SimulatedSky::new(config, Box::new(NoDrift));
        sky.pulse(GuideDirection::North, 500);
        sky.pulse(GuideDirection::South, 500);
        let (_, y) = sky.true_position();
        assert_relative_eq!(y, 128.0 + 5.0 - 2.0, epsilon = 1e-9);
    }

    #[test]
    fn test_ao_stops_at_limit() {
        let config = SkyConfig {
            ao: Some(AoSimConfig {
                max_position: 10,
                px_per_step: 0.5,
                angle_deg: 0.0,
            }),
            ..square_sky()
        };
        let sky = SimulatedSky::new(config, Box::new(NoDrift));
        assert_eq!(sky.step_ao(GuideDirection::West, 8), StepResult::Ok);
        assert_eq!(
            sky.step_ao(GuideDirection::West, 8),
            StepResult::LimitReached
        );
        assert_eq!(sky.ao_position(), (10, 0));
        let (x, _) = sky.true_position();
        assert_relative_eq!(x, 133.0, epsilon = 1e-9);
        sky.center_ao();
        assert_eq!(sky.ao_position(), (0, 0));
    }

    #[test]
    fn test_drift_follows_simulated_time() {
        let sky = SimulatedSky::new(square_sky(), Box::new(LinearDrift::new(0.5, 0.0)));
        sky.advance_frame();
        sky.advance_frame();
        let (x, _) = sky.true_position();
        assert_relative_eq!(x, 130.0, epsilon = 1e-9);
        assert_eq!(sky.elapsed(), Duration::from_secs(4));
    }

    #[test]
    fn test_subframe_render_blanks_outside() {
        let sky = SimulatedSky::new(square_sky(), Box::new(NoDrift));
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let roi = AABB::around(128.0, 128.0, 10, 256, 256).unwrap();
        let image = sky.render(Some(&roi), &mut rng);
        assert_eq!(image.dim(), (256, 256));
        assert_eq!(image[[0, 0]], 0);
        assert!(image[[128, 128]] > 10_000);
    }
}
