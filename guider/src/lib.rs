//! Autoguiding controller.
//!
//! The [`Guider`] state machine owns the lock position, calibration data and
//! per-axis guide algorithms. Every device call runs on a worker lane
//! ([`worker::WorkDispatcher`]); the control thread only submits requests and
//! waits for their outcomes.

pub mod algorithms;
pub mod backlash;
pub mod bump;
pub mod calibration;
pub mod callback;
pub mod config;
pub mod equipment;
pub mod error;
pub mod state;
pub mod watchdog;
pub mod worker;

pub use callback::{AxisCorrection, CallbackId, GuideStep, GuiderCallback, GuiderEvent};
pub use config::{GuiderConfig, WorkerConfig};
pub use equipment::Equipment;
pub use error::{GuideError, GuideResult, ReasonCode};
pub use state::GuiderState;

use algorithms::{AxisStats, GuideAlgorithm};
use backlash::BacklashCompensator;
use bump::{BumpController, BumpRequest};
use calibration::{
    CalibrationAction, CalibrationAssistant, CalibrationData, CalibrationEngine,
    CalibrationSample, CalibrationState,
};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::Serialize;
use shared::camera_interface::Frame;
use shared::image_proc::AABB;
use shared::mount_interface::{GuideAxis, GuideDirection};
use shared::star_detector::{CentroidStarDetector, StarDetector, StarPosition};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use worker::{
    ConnectReport, ExposureRequest, MoveReport, MoveRequest, MoveTarget, Pending, WorkDispatcher,
};

/// Fraction of the camera offset the mount corrects when the AO unit is
/// pinned at its travel limit.
const AO_LIMIT_MOUNT_FRACTION: f64 = 0.7;
/// Bump pulses are capped at this fraction of the mount max move.
const BUMP_MAX_MOVE_FRACTION: f64 = 0.5;

/// Running guide error statistics, pixels along the device axes
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct GuideStats {
    pub samples: usize,
    pub ra_rms: f64,
    pub dec_rms: f64,
    pub total_rms: f64,
    pub ra_peak: f64,
    pub dec_peak: f64,
}

/// Result of one control loop iteration
#[derive(Debug, Clone, PartialEq)]
pub enum FrameOutcome {
    /// Frame taken outside calibration and guiding
    Looping { star: Option<StarPosition> },
    /// Calibration advanced by one step
    Calibrating { state: CalibrationState },
    /// Calibration of a device finished
    CalibrationDone { target: MoveTarget },
    /// Guide step taken
    Guided(GuideStep),
}

/// Planned move on one axis.
#[derive(Debug, Clone, Copy, PartialEq)]
struct AxisPlan {
    direction: Option<GuideDirection>,
    amount: u32,
    limited: bool,
}

impl AxisPlan {
    const IDLE: AxisPlan = AxisPlan {
        direction: None,
        amount: 0,
        limited: false,
    };

    /// A positive correction means the star sits on the plus side of the
    /// axis, so the move goes in the minus direction (East / South).
    fn for_correction(axis: GuideAxis, correction: f64, rate: f64, max_amount: u32) -> Self {
        if correction == 0.0 || !correction.is_finite() || rate <= 0.0 {
            return Self::IDLE;
        }
        let wanted = (correction.abs() / rate).round();
        let limited = wanted > max_amount as f64;
        let amount = wanted.min(max_amount as f64) as u32;
        if amount == 0 {
            return Self::IDLE;
        }
        Self {
            direction: Some(GuideDirection::along(axis, correction < 0.0)),
            amount,
            limited,
        }
    }

    fn request(&self, target: MoveTarget) -> Option<MoveRequest> {
        let direction = self.direction?;
        Some(match target {
            MoveTarget::Mount => MoveRequest::mount(direction, self.amount),
            MoveTarget::StepGuider => MoveRequest::step_guider(direction, self.amount),
        })
    }

    fn correction(&self, offset: f64, correction: f64) -> AxisCorrection {
        AxisCorrection {
            offset,
            correction,
            direction: self.direction,
            amount: self.amount,
            limited: self.limited,
        }
    }
}

/// Autoguider state machine
pub struct Guider {
    config: GuiderConfig,
    equipment: Equipment,
    detector: Box<dyn StarDetector>,
    dispatcher: Option<WorkDispatcher>,
    connection: Option<ConnectReport>,
    state: GuiderState,
    lock: Option<(f64, f64)>,
    star: Option<StarPosition>,
    calibration: Option<CalibrationData>,
    secondary_calibration: Option<CalibrationData>,
    engine: Option<CalibrationEngine>,
    /// Amount actually moved by the last calibration move
    last_moved: Option<u32>,
    assistant: CalibrationAssistant,
    ra_algorithm: Box<dyn GuideAlgorithm>,
    dec_algorithm: Box<dyn GuideAlgorithm>,
    ao_x_algorithm: Box<dyn GuideAlgorithm>,
    ao_y_algorithm: Box<dyn GuideAlgorithm>,
    bump: Option<BumpController>,
    backlash: BacklashCompensator,
    /// Mount declination read when guiding started
    pointing: Option<f64>,
    pending_bumps: Vec<Pending<MoveReport>>,
    ao_position: Option<(i32, i32)>,
    history: VecDeque<GuideStep>,
    ra_stats: AxisStats,
    dec_stats: AxisStats,
    frame_number: u64,
    last_error: Option<GuideError>,
    rng: ChaCha8Rng,
    /// Registered callbacks
    callbacks: Arc<Mutex<HashMap<CallbackId, GuiderCallback>>>,
    /// Next callback ID
    next_callback_id: Arc<Mutex<CallbackId>>,
}

impl Guider {
    /// Create a guider using the built-in centroid star detector.
    pub fn new(equipment: Equipment, config: GuiderConfig) -> GuideResult<Self> {
        let detector = Box::new(CentroidStarDetector::new(config.detector.clone()));
        Self::with_detector(equipment, config, detector)
    }

    pub fn with_detector(
        equipment: Equipment,
        config: GuiderConfig,
        detector: Box<dyn StarDetector>,
    ) -> GuideResult<Self> {
        config.validate()?;
        let seed = config.dither_seed.unwrap_or_else(rand::random);
        Ok(Self {
            ra_algorithm: config.ra_algorithm.build()?,
            dec_algorithm: config.dec_algorithm.build()?,
            ao_x_algorithm: config.ao_x_algorithm.build()?,
            ao_y_algorithm: config.ao_y_algorithm.build()?,
            assistant: CalibrationAssistant::new(config.assistant.clone()),
            history: VecDeque::with_capacity(config.history_len),
            ra_stats: AxisStats::new(config.history_len),
            dec_stats: AxisStats::new(config.history_len),
            rng: ChaCha8Rng::seed_from_u64(seed),
            backlash: BacklashCompensator::new(&config.backlash),
            config,
            equipment,
            detector,
            dispatcher: None,
            connection: None,
            state: GuiderState::Uninitialized,
            lock: None,
            star: None,
            calibration: None,
            secondary_calibration: None,
            engine: None,
            last_moved: None,
            bump: None,
            pointing: None,
            pending_bumps: Vec::new(),
            ao_position: None,
            frame_number: 0,
            last_error: None,
            callbacks: Arc::new(Mutex::new(HashMap::new())),
            next_callback_id: Arc::new(Mutex::new(0)),
        })
    }

    /// Register a callback for guider events
    pub fn register_callback<F>(&self, callback: F) -> CallbackId
    where
        F: Fn(&GuiderEvent) + Send + Sync + 'static,
    {
        let mut callbacks = self.callbacks.lock().unwrap();
        let mut next_id = self.next_callback_id.lock().unwrap();

        let callback_id = *next_id;
        *next_id += 1;

        callbacks.insert(callback_id, Arc::new(callback));
        callback_id
    }

    /// Deregister a callback
    pub fn deregister_callback(&self, callback_id: CallbackId) -> bool {
        let mut callbacks = self.callbacks.lock().unwrap();
        callbacks.remove(&callback_id).is_some()
    }

    /// Get the number of registered callbacks
    pub fn callback_count(&self) -> usize {
        self.callbacks.lock().unwrap().len()
    }

    /// Emit an event to all registered callbacks
    fn emit_event(&self, event: &GuiderEvent) {
        let callbacks = self.callbacks.lock().unwrap();
        for callback in callbacks.values() {
            callback(event);
        }
    }

    pub fn state(&self) -> GuiderState {
        self.state
    }

    pub fn config(&self) -> &GuiderConfig {
        &self.config
    }

    pub fn lock_position(&self) -> Option<(f64, f64)> {
        self.lock
    }

    pub fn star_position(&self) -> Option<StarPosition> {
        self.star
    }

    pub fn last_error(&self) -> Option<&GuideError> {
        self.last_error.as_ref()
    }

    /// Mount calibration
    pub fn calibration(&self) -> Option<&CalibrationData> {
        self.calibration.as_ref()
    }

    /// AO calibration
    pub fn secondary_calibration(&self) -> Option<&CalibrationData> {
        self.secondary_calibration.as_ref()
    }

    pub fn calibration_state(&self) -> Option<CalibrationState> {
        self.engine.as_ref().map(|e| e.state())
    }

    pub fn connection(&self) -> Option<&ConnectReport> {
        self.connection.as_ref()
    }

    pub fn frame_number(&self) -> u64 {
        self.frame_number
    }

    pub fn ao_position(&self) -> Option<(i32, i32)> {
        self.ao_position
    }

    pub fn history(&self) -> &VecDeque<GuideStep> {
        &self.history
    }

    pub fn is_bumping(&self) -> bool {
        self.bump.as_ref().is_some_and(|b| b.is_active())
    }

    /// Current Dec backlash compensation pulse (ms).
    pub fn backlash_pulse_ms(&self) -> u32 {
        self.backlash.pulse_ms()
    }

    /// Declination the mount reported when guiding last started (radians).
    pub fn guiding_declination(&self) -> Option<f64> {
        self.pointing
    }

    fn set_state(&mut self, to: GuiderState) {
        let from = self.state;
        if from == to {
            return;
        }
        log::info!("Guider state {from} -> {to}");
        self.state = to;
        self.emit_event(&GuiderEvent::StateChanged { from, to });
    }

    /// Record, log and return an error.
    fn fail<T>(&mut self, error: GuideError) -> GuideResult<T> {
        let reason = error.reason_code();
        log::warn!("{error} [{reason}]");
        self.emit_event(&GuiderEvent::Error {
            reason,
            message: error.to_string(),
        });
        self.last_error = Some(error.clone());
        Err(error)
    }

    fn invalid_state<T>(&mut self, operation: &'static str) -> GuideResult<T> {
        let error = GuideError::InvalidState {
            operation,
            state: self.state.to_string(),
        };
        self.fail(error)
    }

    fn clear_selection(&mut self) {
        self.lock = None;
        self.star = None;
        self.engine = None;
        self.last_moved = None;
        if let Some(bump) = &mut self.bump {
            bump.reset();
        }
    }

    fn reset_algorithms(&mut self) {
        self.ra_algorithm.reset();
        self.dec_algorithm.reset();
        self.ao_x_algorithm.reset();
        self.ao_y_algorithm.reset();
    }

    /// Start the worker lanes and connect every device.
    pub fn connect(&mut self) -> GuideResult<()> {
        if self.state.is_connected() {
            return self.invalid_state("connect");
        }
        log::info!("Connecting {}", self.equipment.describe());
        let dispatcher = match WorkDispatcher::start(&self.equipment, &self.config.worker) {
            Ok(dispatcher) => dispatcher,
            Err(e) => return self.fail(e),
        };
        let report = match dispatcher.connect() {
            Ok(report) => report,
            Err(e) => {
                drop(dispatcher);
                return self.fail(e);
            }
        };
        if self.config.use_subframes && !report.camera.has_subframes {
            log::info!("Camera cannot read subframes, guiding on full frames");
        }
        self.bump = report
            .ao_max_position
            .map(|max| BumpController::new(self.config.bump.clone(), max));
        self.connection = Some(report);
        self.dispatcher = Some(dispatcher);
        self.last_error = None;
        self.clear_selection();
        self.set_state(GuiderState::Selecting);
        Ok(())
    }

    /// Disconnect every device and stop the worker lanes.
    pub fn disconnect(&mut self) -> GuideResult<()> {
        let result = match self.dispatcher.take() {
            Some(mut dispatcher) => {
                dispatcher.interrupt();
                let result = dispatcher.disconnect();
                dispatcher.stop();
                result
            }
            None => Ok(()),
        };
        self.pending_bumps.clear();
        self.connection = None;
        self.clear_selection();
        self.set_state(GuiderState::Uninitialized);
        match result {
            Ok(()) => Ok(()),
            Err(e) => self.fail(e),
        }
    }

    /// Terminate the worker lanes without disconnecting devices.
    pub fn shutdown(&mut self) {
        if let Some(mut dispatcher) = self.dispatcher.take() {
            dispatcher.stop();
        }
        self.pending_bumps.clear();
        self.connection = None;
        self.clear_selection();
        self.set_state(GuiderState::Stopped);
    }

    fn frame_size(&self) -> Option<(usize, usize)> {
        self.connection.as_ref().map(|c| c.frame_size)
    }

    /// Hold the guide star at `(x, y)`.
    pub fn set_lock_position(&mut self, x: f64, y: f64) -> GuideResult<()> {
        match self.state {
            GuiderState::Selecting
            | GuiderState::Selected
            | GuiderState::Calibrated
            | GuiderState::Guiding => {}
            _ => return self.invalid_state("set lock position"),
        }
        let inside = match self.frame_size() {
            Some((height, width)) => {
                (0.0..width as f64).contains(&x) && (0.0..height as f64).contains(&y)
            }
            None => x.is_finite() && y.is_finite(),
        };
        if !inside {
            return self.fail(GuideError::InvalidConfig(format!(
                "lock position ({x:.1}, {y:.1}) is outside the frame"
            )));
        }
        log::info!("Lock position set to ({x:.2}, {y:.2})");
        self.lock = Some((x, y));
        if self.star.is_none() {
            self.star = Some(StarPosition::new(x, y, 0.0));
        }
        if self.state == GuiderState::Selecting {
            self.set_state(GuiderState::Selected);
        }
        Ok(())
    }

    /// Take a frame and lock on the best star, or the star inside `roi`.
    pub fn auto_select_star(&mut self, roi: Option<AABB>) -> GuideResult<StarPosition> {
        match self.state {
            GuiderState::Selecting | GuiderState::Selected | GuiderState::Calibrated => {}
            _ => return self.invalid_state("select a star"),
        }
        let frame = match self.expose(None) {
            Ok(frame) => frame,
            Err(e) => return self.fail(e),
        };
        self.frame_number += 1;
        let image = frame.image.view();
        let found = match &roi {
            Some(roi) => self.detector.find_star(&image, roi),
            None => self.detector.auto_select(&image),
        };
        let Some(star) = found else {
            return self.fail(GuideError::StarLost);
        };
        log::info!(
            "Selected star at ({:.2}, {:.2}), SNR {:.1}",
            star.x,
            star.y,
            star.quality
        );
        self.lock = Some((star.x, star.y));
        self.star = Some(star);
        self.emit_event(&GuiderEvent::StarSelected {
            x: star.x,
            y: star.y,
            snr: star.quality,
        });
        if self.state == GuiderState::Selecting {
            self.set_state(GuiderState::Selected);
        }
        Ok(star)
    }

    /// Load a previously measured mount calibration.
    pub fn set_calibration(&mut self, data: CalibrationData) -> GuideResult<()> {
        self.load_calibration(data, MoveTarget::Mount)
    }

    /// Load a previously measured AO calibration.
    pub fn set_secondary_calibration(&mut self, data: CalibrationData) -> GuideResult<()> {
        self.load_calibration(data, MoveTarget::StepGuider)
    }

    fn load_calibration(&mut self, data: CalibrationData, target: MoveTarget) -> GuideResult<()> {
        if self.state.is_calibrating() || self.state == GuiderState::Guiding {
            return self.invalid_state("load calibration");
        }
        if !data.valid {
            return self.fail(GuideError::CalibrationInvalid(
                "refusing to load calibration marked invalid".to_string(),
            ));
        }
        if let Err(e) = data.camera_to_mount(1.0, 0.0) {
            return self.fail(e);
        }
        log::info!("Loaded {target:?} calibration: {data}");
        match target {
            MoveTarget::Mount => self.calibration = Some(data),
            MoveTarget::StepGuider => self.secondary_calibration = Some(data),
        }
        Ok(())
    }

    /// Start calibrating the mount, followed by the AO unit when present.
    pub fn begin_calibration(&mut self) -> GuideResult<()> {
        match self.state {
            GuiderState::Selected | GuiderState::Calibrated => {}
            _ => return self.invalid_state("begin calibration"),
        }
        let declination = self.connection.as_ref().and_then(|c| c.declination);
        self.engine = Some(CalibrationEngine::for_mount(
            self.config.calibration.clone(),
            declination,
        ));
        self.last_moved = None;
        self.backlash.reset_baseline();
        self.set_state(GuiderState::CalibratingPrimary);
        Ok(())
    }

    /// Run frames until calibration finishes or fails.
    pub fn run_calibration(&mut self) -> GuideResult<()> {
        if !self.state.is_calibrating() {
            self.begin_calibration()?;
        }
        while self.state.is_calibrating() {
            self.process_frame()?;
        }
        Ok(())
    }

    /// Abandon calibration. Calibration data already stored is kept.
    pub fn abort_calibration(&mut self) -> GuideResult<()> {
        if !self.state.is_calibrating() {
            return self.invalid_state("abort calibration");
        }
        if let Some(mut engine) = self.engine.take() {
            engine.abort();
        }
        if let Some(dispatcher) = &self.dispatcher {
            dispatcher.interrupt();
        }
        self.last_moved = None;
        self.set_state(GuiderState::Selected);
        Ok(())
    }

    fn mount_calibration(&self) -> Option<CalibrationData> {
        self.calibration.clone().filter(|c| c.valid)
    }

    /// Mount calibration with the RA rate adjusted for the declination read
    /// when guiding started.
    fn guide_calibration(&self) -> Option<CalibrationData> {
        let mut cal = self.mount_calibration()?;
        if self.config.dec_compensation {
            cal.ra_rate = cal.ra_rate_at(self.pointing);
        }
        Some(cal)
    }

    fn ao_calibration(&self) -> Option<CalibrationData> {
        if !self.equipment.has_step_guider() {
            return None;
        }
        self.secondary_calibration.clone().filter(|c| c.valid)
    }

    pub fn start_guiding(&mut self) -> GuideResult<()> {
        match self.state {
            GuiderState::Calibrated | GuiderState::Selected => {}
            _ => return self.invalid_state("start guiding"),
        }
        let Some(cal) = self.mount_calibration() else {
            return self.fail(GuideError::NotCalibrated);
        };
        if self.lock.is_none() || self.star.is_none() {
            return self.invalid_state("start guiding without a star");
        }
        if self.equipment.has_step_guider() && self.ao_calibration().is_none() {
            log::warn!("AO unit is not calibrated, guiding with the mount only");
        }
        self.pointing = match self.dispatcher.as_ref().map(|d| d.declination()) {
            Some(Ok(declination)) => declination,
            Some(Err(e)) => {
                log::warn!("Mount declination unavailable: {e}");
                None
            }
            None => None,
        };
        if self.config.dec_compensation {
            self.log_dec_compensation(&cal);
        }
        self.reset_algorithms();
        self.backlash.reset_baseline();
        self.ra_stats.clear();
        self.dec_stats.clear();
        if let Some(bump) = &mut self.bump {
            bump.reset();
        }
        log::info!(
            "Guiding started, RA: {}, Dec: {}",
            self.ra_algorithm.configuration_string(),
            self.dec_algorithm.configuration_string()
        );
        self.set_state(GuiderState::Guiding);
        Ok(())
    }

    fn log_dec_compensation(&self, cal: &CalibrationData) {
        let (Some(cal_dec), Some(dec)) = (cal.declination, self.pointing) else {
            log::debug!("Declination unknown, RA rate not adjusted");
            return;
        };
        if !cal.supports_dec_compensation() {
            log::warn!(
                "Calibration taken at dec {:.1}, too close to the pole to adjust the RA rate",
                cal_dec.to_degrees()
            );
            return;
        }
        log::info!(
            "RA rate {:.4} -> {:.4} px/ms, dec {:.1} -> {:.1}",
            cal.ra_rate,
            cal.ra_rate_at(Some(dec)),
            cal_dec.to_degrees(),
            dec.to_degrees()
        );
    }

    pub fn stop_guiding(&mut self) -> GuideResult<()> {
        if self.state != GuiderState::Guiding {
            return self.invalid_state("stop guiding");
        }
        self.finish_pending_bumps();
        self.set_state(GuiderState::Selected);
        Ok(())
    }

    /// Shift the lock position by a random offset of up to `amount` pixels
    /// per axis. Returns the applied shift.
    pub fn dither(&mut self, amount: f64) -> GuideResult<(f64, f64)> {
        match self.state {
            GuiderState::Guiding | GuiderState::Selected | GuiderState::Calibrated => {}
            _ => return self.invalid_state("dither"),
        }
        if !(amount > 0.0 && amount.is_finite()) {
            return self.fail(GuideError::InvalidConfig(format!(
                "dither amount must be positive, got {amount}"
            )));
        }
        let Some((x, y)) = self.lock else {
            return self.invalid_state("dither without a lock position");
        };
        let dx = self.rng.gen_range(-amount..=amount);
        let dy = self.rng.gen_range(-amount..=amount);
        let (new_x, new_y) = match self.frame_size() {
            Some((height, width)) => (
                (x + dx).clamp(0.0, width.saturating_sub(1) as f64),
                (y + dy).clamp(0.0, height.saturating_sub(1) as f64),
            ),
            None => (x + dx, y + dy),
        };
        log::info!("Dither by ({dx:.2}, {dy:.2}), lock now ({new_x:.2}, {new_y:.2})");
        self.lock = Some((new_x, new_y));
        self.reset_algorithms();
        self.backlash.reset_baseline();
        if let Some(bump) = &mut self.bump {
            bump.force();
        }
        let applied = (new_x - x, new_y - y);
        self.emit_event(&GuiderEvent::Dithered {
            dx: applied.0,
            dy: applied.1,
        });
        Ok(applied)
    }

    pub fn guide_stats(&self) -> GuideStats {
        let ra_rms = self.ra_stats.rms();
        let dec_rms = self.dec_stats.rms();
        GuideStats {
            samples: self.ra_stats.count(),
            ra_rms,
            dec_rms,
            total_rms: ra_rms.hypot(dec_rms),
            ra_peak: self.ra_stats.max_abs(),
            dec_peak: self.dec_stats.max_abs(),
        }
    }

    /// Human-readable summary of the active settings.
    pub fn settings_summary(&self) -> String {
        let mut lines = vec![
            format!("Equipment: {}", self.equipment.describe()),
            format!("State: {}", self.state),
            format!(
                "Exposure: {} ms, subframes: {}",
                self.config.exposure_ms, self.config.use_subframes
            ),
            format!(
                "Max pulse: RA {} ms, Dec {} ms",
                self.config.max_ra_duration_ms, self.config.max_dec_duration_ms
            ),
            format!("RA algorithm: {}", self.ra_algorithm.configuration_string()),
            format!("Dec algorithm: {}", self.dec_algorithm.configuration_string()),
            format!(
                "Dec compensation: {}, backlash compensation: {} ({} ms)",
                self.config.dec_compensation,
                self.backlash.is_enabled(),
                self.backlash.pulse_ms()
            ),
        ];
        match &self.calibration {
            Some(cal) if cal.valid => lines.push(format!("Mount calibration: {cal}")),
            _ => lines.push("Mount calibration: none".to_string()),
        }
        if self.equipment.has_step_guider() {
            lines.push(format!(
                "AO X algorithm: {}",
                self.ao_x_algorithm.configuration_string()
            ));
            lines.push(format!(
                "AO Y algorithm: {}",
                self.ao_y_algorithm.configuration_string()
            ));
            match &self.secondary_calibration {
                Some(cal) if cal.valid => lines.push(format!("AO calibration: {cal}")),
                _ => lines.push("AO calibration: none".to_string()),
            }
            let bump = &self.config.bump;
            lines.push(format!(
                "Bump: at {:.0}% of travel, {:.1} steps/frame, on dither: {}",
                bump.bump_percentage, bump.bump_max_steps_per_cycle, bump.bump_on_dither
            ));
        }
        lines.join("\n")
    }

    fn expose(&self, subframe: Option<AABB>) -> GuideResult<Frame> {
        let dispatcher = self.dispatcher.as_ref().ok_or(GuideError::NotConnected)?;
        let mut request = ExposureRequest::new(self.config.exposure_ms);
        if let Some(roi) = subframe {
            request = request.with_subframe(roi);
        }
        dispatcher.expose(request)
    }

    fn run_move(&self, request: MoveRequest) -> GuideResult<MoveReport> {
        let dispatcher = self.dispatcher.as_ref().ok_or(GuideError::NotConnected)?;
        dispatcher.move_blocking(request)
    }

    /// Issue moves in order on their lanes, then wait for all of them.
    fn run_moves(&self, requests: Vec<MoveRequest>) -> GuideResult<Vec<MoveReport>> {
        let dispatcher = self.dispatcher.as_ref().ok_or(GuideError::NotConnected)?;
        let pending: Vec<Pending<MoveReport>> = requests
            .into_iter()
            .map(|request| dispatcher.enqueue_move(request))
            .collect();
        let mut reports = Vec::with_capacity(pending.len());
        let mut first_error = None;
        for p in pending {
            match p.wait() {
                Ok(report) => reports.push(report),
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(reports),
        }
    }

    /// Run one control loop iteration: take a frame and act on it according
    /// to the current state.
    pub fn process_frame(&mut self) -> GuideResult<FrameOutcome> {
        match self.state {
            GuiderState::Uninitialized | GuiderState::Stopped => {
                self.fail(GuideError::NotConnected)
            }
            GuiderState::Selecting | GuiderState::Selected | GuiderState::Calibrated => {
                self.handle_looping_frame()
            }
            GuiderState::CalibratingPrimary | GuiderState::CalibratingSecondary => {
                self.handle_calibration_frame()
            }
            GuiderState::Guiding => self.handle_guiding_frame(),
        }
    }

    fn handle_looping_frame(&mut self) -> GuideResult<FrameOutcome> {
        let frame = match self.expose(None) {
            Ok(frame) => frame,
            Err(e) => return self.fail(e),
        };
        self.frame_number += 1;
        let Some(last) = self.star else {
            return Ok(FrameOutcome::Looping { star: None });
        };
        match self.detector.track_star(&frame.image.view(), &last) {
            Some(star) if star.valid => {
                self.star = Some(star);
                Ok(FrameOutcome::Looping { star: Some(star) })
            }
            _ => self.star_lost(last),
        }
    }

    /// Leave the current activity, drop the lock and report `StarLost`. No
    /// move is issued for the frame.
    fn star_lost<T>(&mut self, last: StarPosition) -> GuideResult<T> {
        log::warn!(
            "Star lost near ({:.1}, {:.1}) on frame {}",
            last.x,
            last.y,
            self.frame_number
        );
        self.emit_event(&GuiderEvent::StarLost {
            frame_number: self.frame_number,
            last_position: (last.x, last.y),
        });
        if self.state.is_calibrating() {
            let target = self.calibrating_target();
            self.emit_event(&GuiderEvent::CalibrationFailed {
                target,
                error: GuideError::StarLost,
            });
        }
        self.clear_selection();
        self.set_state(GuiderState::Selecting);
        self.fail(GuideError::StarLost)
    }

    fn calibrating_target(&self) -> MoveTarget {
        if self.state == GuiderState::CalibratingSecondary {
            MoveTarget::StepGuider
        } else {
            MoveTarget::Mount
        }
    }

    fn handle_calibration_frame(&mut self) -> GuideResult<FrameOutcome> {
        let frame = match self.expose(None) {
            Ok(frame) => frame,
            Err(e) => return self.calibration_failed(e),
        };
        self.frame_number += 1;
        let Some(last) = self.star else {
            return self.calibration_failed(GuideError::StarLost);
        };
        let star = match self.detector.track_star(&frame.image.view(), &last) {
            Some(star) if star.valid => star,
            _ => return self.star_lost(last),
        };
        self.star = Some(star);

        let Some(mut engine) = self.engine.take() else {
            return self.invalid_state("calibrate without an engine");
        };
        let mut sample = CalibrationSample::new(star.x, star.y);
        if let Some(moved) = self.last_moved.take() {
            sample = sample.with_moved(moved);
        }

        let mut action = engine.advance(sample);
        loop {
            match action {
                CalibrationAction::Move { direction, amount } => {
                    let request = self.calibration_request(engine.target(), direction, amount);
                    match self.run_move(request) {
                        Ok(report) => {
                            self.last_moved = Some(report.amount_moved);
                            if report.ao_position.is_some() {
                                self.ao_position = report.ao_position;
                            }
                            let state = engine.state();
                            self.engine = Some(engine);
                            return Ok(FrameOutcome::Calibrating { state });
                        }
                        Err(e) => action = engine.move_failed(e),
                    }
                }
                CalibrationAction::Sample => {
                    let state = engine.state();
                    self.engine = Some(engine);
                    return Ok(FrameOutcome::Calibrating { state });
                }
                CalibrationAction::Done(data) => {
                    return self.calibration_done(engine.target(), data);
                }
                CalibrationAction::Failed(e) => return self.calibration_failed(e),
            }
        }
    }

    fn calibration_request(
        &self,
        target: MoveTarget,
        direction: GuideDirection,
        amount: u32,
    ) -> MoveRequest {
        match target {
            MoveTarget::Mount => {
                let max = match direction.axis() {
                    GuideAxis::Axis1 => self.config.max_ra_duration_ms,
                    GuideAxis::Axis2 => self.config.max_dec_duration_ms,
                };
                MoveRequest::mount(direction, amount.min(max)).calibration()
            }
            MoveTarget::StepGuider => MoveRequest::step_guider(direction, amount).calibration(),
        }
    }

    fn calibration_done(
        &mut self,
        target: MoveTarget,
        data: CalibrationData,
    ) -> GuideResult<FrameOutcome> {
        let label = match target {
            MoveTarget::Mount => "mount",
            MoveTarget::StepGuider => "AO",
        };
        let issues = self.assistant.review(&data, label);
        self.emit_event(&GuiderEvent::CalibrationComplete {
            target,
            data: data.clone(),
        });
        for issue in issues {
            self.emit_event(&GuiderEvent::Advisory(issue));
        }

        match target {
            MoveTarget::Mount => {
                self.calibration = Some(data);
                let ao_max = self.connection.as_ref().and_then(|c| c.ao_max_position);
                match ao_max {
                    Some(max_position) if self.equipment.has_step_guider() => {
                        self.set_state(GuiderState::CalibratingSecondary);
                        let centered = match &self.dispatcher {
                            Some(dispatcher) => dispatcher.center_step_guider(),
                            None => Err(GuideError::NotConnected),
                        };
                        match centered {
                            Ok(report) => self.ao_position = report.ao_position,
                            Err(e) => return self.calibration_failed(e),
                        }
                        self.engine = Some(CalibrationEngine::for_step_guider(
                            self.config.step_guider_calibration.clone(),
                            max_position,
                        ));
                        self.last_moved = None;
                    }
                    _ => self.set_state(GuiderState::Calibrated),
                }
            }
            MoveTarget::StepGuider => {
                self.secondary_calibration = Some(data);
                self.set_state(GuiderState::Calibrated);
            }
        }
        Ok(FrameOutcome::CalibrationDone { target })
    }

    fn calibration_failed<T>(&mut self, error: GuideError) -> GuideResult<T> {
        let target = self.calibrating_target();
        log::warn!("{target:?} calibration failed: {error}");
        self.engine = None;
        self.last_moved = None;
        self.emit_event(&GuiderEvent::CalibrationFailed {
            target,
            error: error.clone(),
        });
        if self.state.is_calibrating() {
            self.set_state(GuiderState::Selected);
        }
        self.fail(error)
    }

    fn guide_subframe(&self, star: &StarPosition) -> Option<AABB> {
        if !self.config.use_subframes {
            return None;
        }
        let report = self.connection.as_ref()?;
        if !report.camera.has_subframes {
            return None;
        }
        let (height, width) = report.frame_size;
        AABB::around(
            star.x,
            star.y,
            self.config.subframe_half_size,
            height,
            width,
        )
    }

    fn finish_pending_bumps(&mut self) {
        for pending in self.pending_bumps.drain(..) {
            if let Err(e) = pending.wait() {
                log::warn!("Bump move failed: {e} [{}]", e.reason_code());
            }
        }
    }

    fn handle_guiding_frame(&mut self) -> GuideResult<FrameOutcome> {
        self.finish_pending_bumps();
        let (Some(last), Some(lock)) = (self.star, self.lock) else {
            return self.invalid_state("guide without a star");
        };
        let subframe = self.guide_subframe(&last);
        let frame = match self.expose(subframe) {
            Ok(frame) => frame,
            Err(e) => return self.guide_failed(e),
        };
        self.frame_number += 1;

        let star = match self.detector.track_star(&frame.image.view(), &last) {
            Some(star) if star.valid => star,
            _ => return self.star_lost(last),
        };
        self.star = Some(star);
        let camera_offset = (star.x - lock.0, star.y - lock.1);

        let outcome = match self.ao_calibration() {
            Some(ao_cal) => self.correct_with_ao(camera_offset, &ao_cal),
            None => self.correct_with_mount(camera_offset),
        };
        let (target, mount_offset, axis1, axis2) = match outcome {
            Ok(result) => result,
            Err(e) => return self.guide_failed(e),
        };

        let step = GuideStep {
            frame_number: self.frame_number,
            star: (star.x, star.y),
            camera_offset,
            mount_offset,
            target,
            axis1,
            axis2,
            ao_position: self.ao_position,
            snr: star.quality,
        };
        self.record_step(&step);
        Ok(FrameOutcome::Guided(step))
    }

    fn guide_failed<T>(&mut self, error: GuideError) -> GuideResult<T> {
        if error == GuideError::SlewDetected {
            log::warn!("Mount is slewing, guiding stopped");
            self.pending_bumps.clear();
            self.set_state(GuiderState::Selected);
        }
        self.fail(error)
    }

    fn record_step(&mut self, step: &GuideStep) {
        log::debug!(
            "Frame {}: offset ({:.2}, {:.2}) px, axis1 {:?} {} axis2 {:?} {}",
            step.frame_number,
            step.mount_offset.0,
            step.mount_offset.1,
            step.axis1.direction,
            step.axis1.amount,
            step.axis2.direction,
            step.axis2.amount
        );
        self.history.push_back(step.clone());
        while self.history.len() > self.config.history_len {
            self.history.pop_front();
        }
        let t = step.frame_number as f64;
        self.ra_stats.add(t, step.mount_offset.0);
        self.dec_stats.add(t, step.mount_offset.1);
        self.emit_event(&GuiderEvent::GuideStep(step.clone()));
    }

    /// Run the mount algorithms on a camera offset and issue the pulses.
    fn correct_with_mount(
        &mut self,
        camera_offset: (f64, f64),
    ) -> GuideResult<(MoveTarget, (f64, f64), AxisCorrection, AxisCorrection)> {
        let cal = self.guide_calibration().ok_or(GuideError::NotCalibrated)?;
        let (ra_offset, dec_offset) = cal.camera_to_mount(camera_offset.0, camera_offset.1)?;
        let dec_min_move = self.dec_algorithm.min_move();
        self.backlash.track(dec_offset, dec_min_move, cal.dec_rate);
        let ra = self.ra_algorithm.result(ra_offset);
        let dec = self.dec_algorithm.result(dec_offset);
        let ra_plan = AxisPlan::for_correction(
            GuideAxis::Axis1,
            ra,
            cal.ra_rate,
            self.config.max_ra_duration_ms,
        );
        let mut dec_plan = AxisPlan::for_correction(
            GuideAxis::Axis2,
            dec,
            cal.dec_rate,
            self.config.max_dec_duration_ms,
        );
        if let Some(direction) = dec_plan.direction {
            dec_plan.amount = self.backlash.apply(direction, dec_plan.amount);
        }
        let requests: Vec<MoveRequest> = [ra_plan, dec_plan]
            .iter()
            .filter_map(|plan| plan.request(MoveTarget::Mount))
            .collect();
        if !requests.is_empty() {
            self.run_moves(requests)?;
        }
        Ok((
            MoveTarget::Mount,
            (ra_offset, dec_offset),
            ra_plan.correction(ra_offset, ra),
            dec_plan.correction(dec_offset, dec),
        ))
    }

    /// Run the AO algorithms on a camera offset, step the AO unit and hand
    /// over to the mount when the unit runs out of travel.
    fn correct_with_ao(
        &mut self,
        camera_offset: (f64, f64),
        ao_cal: &CalibrationData,
    ) -> GuideResult<(MoveTarget, (f64, f64), AxisCorrection, AxisCorrection)> {
        let (x_offset, y_offset) = ao_cal.camera_to_mount(camera_offset.0, camera_offset.1)?;
        let x = self.ao_x_algorithm.result(x_offset);
        let y = self.ao_y_algorithm.result(y_offset);
        let (max_x, max_y) = self
            .connection
            .as_ref()
            .and_then(|c| c.ao_max_position)
            .unwrap_or((0, 0));
        let x_plan = AxisPlan::for_correction(GuideAxis::Axis1, x, ao_cal.ra_rate, 2 * max_x);
        let y_plan = AxisPlan::for_correction(GuideAxis::Axis2, y, ao_cal.dec_rate, 2 * max_y);
        let requests: Vec<MoveRequest> = [x_plan, y_plan]
            .iter()
            .filter_map(|plan| plan.request(MoveTarget::StepGuider))
            .collect();

        let mut limit_reached = false;
        if !requests.is_empty() {
            for report in self.run_moves(requests)? {
                limit_reached |= report.limit_reached;
                if report.ao_position.is_some() {
                    self.ao_position = report.ao_position;
                }
            }
        }

        if limit_reached {
            log::info!("AO at its travel limit, mount takes over the correction");
            self.mount_assist(camera_offset)?;
        }
        if let Some(position) = self.ao_position {
            let request = self.bump.as_mut().and_then(|bump| bump.update(position));
            if let Some(request) = request {
                self.issue_bump(request, ao_cal)?;
            }
        }

        Ok((
            MoveTarget::StepGuider,
            (x_offset, y_offset),
            x_plan.correction(x_offset, x),
            y_plan.correction(y_offset, y),
        ))
    }

    /// Correct a fixed fraction of the camera offset with the mount.
    fn mount_assist(&mut self, camera_offset: (f64, f64)) -> GuideResult<()> {
        let cal = self.guide_calibration().ok_or(GuideError::NotCalibrated)?;
        let (ra, dec) = cal.camera_to_mount(
            AO_LIMIT_MOUNT_FRACTION * camera_offset.0,
            AO_LIMIT_MOUNT_FRACTION * camera_offset.1,
        )?;
        let ra_max = self.ra_algorithm.max_move();
        let ra = ra.clamp(-ra_max, ra_max);
        let dec_max = self.dec_algorithm.max_move();
        let dec = dec.clamp(-dec_max, dec_max);
        let plans = [
            AxisPlan::for_correction(
                GuideAxis::Axis1,
                ra,
                cal.ra_rate,
                self.config.max_ra_duration_ms,
            ),
            AxisPlan::for_correction(
                GuideAxis::Axis2,
                dec,
                cal.dec_rate,
                self.config.max_dec_duration_ms,
            ),
        ];
        if plans[1].direction.is_some() {
            self.backlash.reset_baseline();
        }
        let requests: Vec<MoveRequest> = plans
            .iter()
            .filter_map(|plan| plan.request(MoveTarget::Mount))
            .collect();
        if !requests.is_empty() {
            self.run_moves(requests)?;
        }
        Ok(())
    }

    /// Queue a mount move that lets AO guiding walk the unit back towards
    /// centre by the requested number of steps.
    fn issue_bump(&mut self, request: BumpRequest, ao_cal: &CalibrationData) -> GuideResult<()> {
        let Some(cal) = self.guide_calibration() else {
            return Ok(());
        };
        // Star motion the AO travel would cause. The mount shifts the star
        // the opposite way so the AO follows it back.
        let (cx, cy) = ao_cal.mount_to_camera(
            request.axis1_steps * ao_cal.ra_rate,
            request.axis2_steps * ao_cal.dec_rate,
        );
        let (ra, dec) = cal.camera_to_mount(-cx, -cy)?;
        let ra_cap = BUMP_MAX_MOVE_FRACTION * self.ra_algorithm.max_move();
        let dec_cap = BUMP_MAX_MOVE_FRACTION * self.dec_algorithm.max_move();
        let plans = [
            AxisPlan::for_correction(
                GuideAxis::Axis1,
                -ra.clamp(-ra_cap, ra_cap),
                cal.ra_rate,
                self.config.max_ra_duration_ms,
            ),
            AxisPlan::for_correction(
                GuideAxis::Axis2,
                -dec.clamp(-dec_cap, dec_cap),
                cal.dec_rate,
                self.config.max_dec_duration_ms,
            ),
        ];
        if plans[1].direction.is_some() {
            self.backlash.reset_baseline();
        }
        let dispatcher = self.dispatcher.as_ref().ok_or(GuideError::NotConnected)?;
        for plan in plans {
            if let Some(move_request) = plan.request(MoveTarget::Mount) {
                log::debug!("Bump: {} {} ms", move_request.direction, plan.amount);
                let pending = dispatcher.enqueue_move(move_request);
                self.pending_bumps.push(pending);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use calibration::MoveUnits;
    use shared::camera_interface::mock::MockCamera;
    use shared::mount_interface::mock::MockMount;
    use std::f64::consts::FRAC_PI_2;

    fn blank_equipment() -> Equipment {
        let camera = MockCamera::new_repeating(ndarray::Array2::from_elem((64, 64), 100u16));
        Equipment::new(Arc::new(camera), Arc::new(MockMount::new()))
    }

    fn calibration() -> CalibrationData {
        CalibrationData {
            ra_angle: 0.0,
            dec_angle: FRAC_PI_2,
            ra_rate: 0.01,
            dec_rate: 0.01,
            valid: true,
            step_size: 750,
            ..CalibrationData::invalid(MoveUnits::Milliseconds)
        }
    }

    #[test]
    fn test_axis_plan_direction_and_limit() {
        let plan = AxisPlan::for_correction(GuideAxis::Axis1, 2.0, 0.01, 2500);
        assert_eq!(plan.direction, Some(GuideDirection::East));
        assert_eq!(plan.amount, 200);
        assert!(!plan.limited);

        let plan = AxisPlan::for_correction(GuideAxis::Axis2, -40.0, 0.01, 2500);
        assert_eq!(plan.direction, Some(GuideDirection::North));
        assert_eq!(plan.amount, 2500);
        assert!(plan.limited);

        assert_eq!(
            AxisPlan::for_correction(GuideAxis::Axis1, 0.0, 0.01, 2500),
            AxisPlan::IDLE
        );
    }

    #[test]
    fn test_operations_require_connection() {
        let mut guider = Guider::new(blank_equipment(), GuiderConfig::default()).unwrap();
        assert_eq!(guider.state(), GuiderState::Uninitialized);
        assert!(matches!(
            guider.process_frame(),
            Err(GuideError::NotConnected)
        ));
        assert!(matches!(
            guider.start_guiding(),
            Err(GuideError::InvalidState { .. })
        ));
        assert_eq!(
            guider.last_error().map(|e| e.reason_code()),
            Some(ReasonCode::InvalidState)
        );
    }

    #[test]
    fn test_start_guiding_needs_calibration() {
        let mut guider = Guider::new(blank_equipment(), GuiderConfig::default()).unwrap();
        guider.connect().unwrap();
        guider.set_lock_position(32.0, 32.0).unwrap();
        assert_eq!(guider.state(), GuiderState::Selected);
        assert!(matches!(
            guider.start_guiding(),
            Err(GuideError::NotCalibrated)
        ));
        guider.set_calibration(calibration()).unwrap();
        guider.start_guiding().unwrap();
        assert_eq!(guider.state(), GuiderState::Guiding);
        guider.stop_guiding().unwrap();
        assert_eq!(guider.state(), GuiderState::Selected);
        guider.disconnect().unwrap();
        assert_eq!(guider.state(), GuiderState::Uninitialized);
        assert!(guider.lock_position().is_none());
    }

    #[test]
    fn test_state_change_callbacks() {
        let mut guider = Guider::new(blank_equipment(), GuiderConfig::default()).unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let id = guider.register_callback(move |event| {
            if let GuiderEvent::StateChanged { to, .. } = event {
                sink.lock().unwrap().push(*to);
            }
        });
        guider.connect().unwrap();
        guider.set_lock_position(10.0, 10.0).unwrap();
        guider.shutdown();
        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                GuiderState::Selecting,
                GuiderState::Selected,
                GuiderState::Stopped
            ]
        );
        assert!(guider.deregister_callback(id));
        assert_eq!(guider.callback_count(), 0);
    }

    #[test]
    fn test_lock_outside_frame_rejected() {
        let mut guider = Guider::new(blank_equipment(), GuiderConfig::default()).unwrap();
        guider.connect().unwrap();
        assert!(matches!(
            guider.set_lock_position(100.0, 5.0),
            Err(GuideError::InvalidConfig(_))
        ));
        assert_eq!(guider.state(), GuiderState::Selecting);
    }

    #[test]
    fn test_dither_moves_lock_within_amount() {
        let config = GuiderConfig {
            dither_seed: Some(3),
            ..GuiderConfig::default()
        };
        let mut guider = Guider::new(blank_equipment(), config).unwrap();
        guider.connect().unwrap();
        guider.set_lock_position(32.0, 32.0).unwrap();
        let (dx, dy) = guider.dither(3.0).unwrap();
        assert!(dx.abs() <= 3.0 && dy.abs() <= 3.0);
        let (x, y) = guider.lock_position().unwrap();
        assert!((x - 32.0 - dx).abs() < 1e-12);
        assert!((y - 32.0 - dy).abs() < 1e-12);
        assert!(guider.dither(-1.0).is_err());
    }

    #[test]
    fn test_settings_summary_lists_algorithms() {
        let guider = Guider::new(blank_equipment(), GuiderConfig::default()).unwrap();
        let summary = guider.settings_summary();
        assert!(summary.contains("RA algorithm: Hysteresis"));
        assert!(summary.contains("Dec algorithm: Resist Switch"));
        assert!(summary.contains("Mount calibration: none"));
    }
}
