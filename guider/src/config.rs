use crate::algorithms::{AlgorithmConfig, AlgorithmKind};
use crate::backlash::BacklashConfig;
use crate::bump::BumpConfig;
use crate::calibration::{AssistantThresholds, CalibrationConfig, StepGuiderCalibrationConfig};
use crate::error::{GuideError, GuideResult};
use crate::watchdog::{DEFAULT_DOWNLOAD_ALLOWANCE_MS, DEFAULT_SETTLE_ALLOWANCE_MS};
use serde::{Deserialize, Serialize};
use shared::star_detector::StarDetectorConfig;

/// Worker lane timing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Sleep between device polls (ms)
    pub poll_interval_ms: u64,
    /// Allowance for frame readout on top of the exposure time (ms)
    pub download_allowance_ms: u64,
    /// Allowance for a move to settle on top of its pulse length (ms)
    pub settle_allowance_ms: u64,
    /// Time a lane is given to exit on shutdown before it is detached (ms)
    pub shutdown_grace_ms: u64,
    /// Consecutive failed status polls before a move is abandoned
    pub max_poll_failures: u32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 50,
            download_allowance_ms: DEFAULT_DOWNLOAD_ALLOWANCE_MS,
            settle_allowance_ms: DEFAULT_SETTLE_ALLOWANCE_MS,
            shutdown_grace_ms: 2000,
            max_poll_failures: 3,
        }
    }
}

impl WorkerConfig {
    pub fn validate(&self) -> GuideResult<()> {
        if self.poll_interval_ms == 0 {
            return Err(GuideError::InvalidConfig(
                "poll interval must be at least 1 ms".to_string(),
            ));
        }
        if self.max_poll_failures == 0 {
            return Err(GuideError::InvalidConfig(
                "max_poll_failures must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Complete guider configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuiderConfig {
    /// Guide exposure (ms)
    pub exposure_ms: u64,
    /// Read only a window around the guide star while guiding
    pub use_subframes: bool,
    /// Half size of the guiding subframe (pixels)
    pub subframe_half_size: usize,
    /// Worker lane timing
    pub worker: WorkerConfig,
    /// Mount calibration
    pub calibration: CalibrationConfig,
    /// AO calibration
    pub step_guider_calibration: StepGuiderCalibrationConfig,
    /// Calibration sanity check thresholds
    pub assistant: AssistantThresholds,
    /// AO bump behaviour
    pub bump: BumpConfig,
    /// Mount RA algorithm
    pub ra_algorithm: AlgorithmConfig,
    /// Mount Dec algorithm
    pub dec_algorithm: AlgorithmConfig,
    /// AO X algorithm
    pub ao_x_algorithm: AlgorithmConfig,
    /// AO Y algorithm
    pub ao_y_algorithm: AlgorithmConfig,
    /// Longest RA pulse (ms)
    pub max_ra_duration_ms: u32,
    /// Longest Dec pulse (ms)
    pub max_dec_duration_ms: u32,
    /// Rescale the RA rate for the declination the mount points at when
    /// guiding starts
    pub dec_compensation: bool,
    /// Dec backlash compensation
    pub backlash: BacklashConfig,
    /// Guide steps kept in history
    pub history_len: usize,
    /// Star detection tuning
    pub detector: StarDetectorConfig,
    /// Seed for the dither generator, random when absent
    pub dither_seed: Option<u64>,
}

impl Default for GuiderConfig {
    fn default() -> Self {
        Self {
            exposure_ms: 2000,
            use_subframes: false,
            subframe_half_size: 32,
            worker: WorkerConfig::default(),
            calibration: CalibrationConfig::default(),
            step_guider_calibration: StepGuiderCalibrationConfig::default(),
            assistant: AssistantThresholds::default(),
            bump: BumpConfig::default(),
            ra_algorithm: AlgorithmConfig::default_for(AlgorithmKind::Hysteresis),
            dec_algorithm: AlgorithmConfig::default_for(AlgorithmKind::ResistSwitch),
            ao_x_algorithm: AlgorithmConfig::default_for(AlgorithmKind::Identity),
            ao_y_algorithm: AlgorithmConfig::default_for(AlgorithmKind::Identity),
            max_ra_duration_ms: 2500,
            max_dec_duration_ms: 2500,
            dec_compensation: true,
            backlash: BacklashConfig::default(),
            history_len: 500,
            detector: StarDetectorConfig::default(),
            dither_seed: None,
        }
    }
}

impl GuiderConfig {
    pub fn validate(&self) -> GuideResult<()> {
        if self.exposure_ms == 0 {
            return Err(GuideError::InvalidConfig(
                "exposure must be at least 1 ms".to_string(),
            ));
        }
        if self.max_ra_duration_ms == 0 || self.max_dec_duration_ms == 0 {
            return Err(GuideError::InvalidConfig(
                "maximum pulse durations must be at least 1 ms".to_string(),
            ));
        }
        let max_pulse = self.max_ra_duration_ms.min(self.max_dec_duration_ms);
        if self.calibration.calibration_step_ms > max_pulse {
            return Err(GuideError::InvalidConfig(format!(
                "calibration step of {} ms exceeds the maximum pulse duration",
                self.calibration.calibration_step_ms
            )));
        }
        if self.history_len == 0 {
            return Err(GuideError::InvalidConfig(
                "history_len must be at least 1".to_string(),
            ));
        }
        if self.use_subframes && self.subframe_half_size <= self.detector.search_radius {
            return Err(GuideError::InvalidConfig(format!(
                "subframe half size {} must exceed the search radius {}",
                self.subframe_half_size, self.detector.search_radius
            )));
        }
        self.worker.validate()?;
        self.calibration.validate()?;
        self.step_guider_calibration.validate()?;
        self.assistant.validate()?;
        self.bump.validate()?;
        self.backlash.validate()?;
        for algorithm in [
            &self.ra_algorithm,
            &self.dec_algorithm,
            &self.ao_x_algorithm,
            &self.ao_y_algorithm,
        ] {
            algorithm.build()?;
        }
        Ok(())
    }

    pub fn from_json(json: &str) -> GuideResult<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| GuideError::InvalidConfig(format!("failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> GuideResult<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| GuideError::InvalidConfig(format!("failed to serialize config: {e}")))
    }
}
