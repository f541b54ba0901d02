//! Runner for a complete guiding session against the simulated sky
//!
//! Connects, selects the star, optionally calibrates, then guides for a
//! fixed number of frames while measuring the true star error.

use crate::sky::SimulatedSky;
use anyhow::{bail, Context};
use guider::{GuideError, GuideStats, Guider, GuiderEvent, GuiderState};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// What a session should do
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Run calibration before guiding. Otherwise the guider must already
    /// hold a valid calibration.
    pub calibrate: bool,
    /// Guide frames to run
    pub frames: usize,
    /// Dither every N guide frames
    pub dither_every: Option<usize>,
    /// Dither amount (pixels)
    pub dither_amount: f64,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            calibrate: true,
            frames: 100,
            dither_every: None,
            dither_amount: 3.0,
        }
    }
}

/// Results from a session
#[derive(Debug, Clone)]
pub struct SessionResults {
    /// Frames that produced a guide step
    pub frames_guided: usize,
    /// Frames where the star was lost
    pub frames_lost: usize,
    /// Errors returned by the guider, one line per frame
    pub errors: Vec<String>,
    /// All events emitted during the session
    pub events: Vec<GuiderEvent>,
    /// True star position minus lock position after each guide frame
    pub true_offsets: Vec<(f64, f64)>,
    /// Guider's own statistics at the end of the run
    pub stats: GuideStats,
    pub final_state: GuiderState,
    /// Largest AO excursion seen, in steps
    pub max_ao_excursion: u32,
}

impl SessionResults {
    /// RMS of the true star error (pixels)
    pub fn true_rms(&self) -> f64 {
        rms(&self.true_offsets)
    }

    pub fn advisories(&self) -> usize {
        self.events
            .iter()
            .filter(|e| matches!(e, GuiderEvent::Advisory(_)))
            .count()
    }
}

pub fn rms(offsets: &[(f64, f64)]) -> f64 {
    if offsets.is_empty() {
        return 0.0;
    }
    let sum: f64 = offsets.iter().map(|(x, y)| x * x + y * y).sum();
    (sum / offsets.len() as f64).sqrt()
}

/// RMS distance the star would wander from its start over `frames` frames
/// with nothing guiding.
pub fn unguided_rms(sky: &SimulatedSky, frames: usize) -> f64 {
    let interval = Duration::from_millis(sky.config().frame_interval_ms);
    let (x0, y0) = sky.unguided_position(Duration::ZERO);
    let offsets: Vec<(f64, f64)> = (1..=frames)
        .map(|i| {
            let (x, y) = sky.unguided_position(interval * i as u32);
            (x - x0, y - y0)
        })
        .collect();
    rms(&offsets)
}

/// Run a guiding session.
///
/// # Arguments
/// * `guider` - Guider built on equipment observing `sky`
/// * `sky` - The simulated sky, used to measure the true error
/// * `options` - What to run
pub fn run_session(
    guider: &mut Guider,
    sky: &SimulatedSky,
    options: &SessionOptions,
) -> anyhow::Result<SessionResults> {
    let events = Arc::new(Mutex::new(Vec::new()));
    let events_clone = events.clone();
    let callback_id = guider.register_callback(move |event| {
        events_clone.lock().unwrap().push(event.clone());
    });

    if !guider.state().is_connected() {
        guider.connect().context("connecting equipment")?;
    }
    let star = guider
        .auto_select_star(None)
        .context("selecting a guide star")?;
    log::info!("Guiding on star at ({:.2}, {:.2})", star.x, star.y);

    if options.calibrate {
        guider.run_calibration().context("calibrating")?;
        // Calibration leaves the star away from where it was selected.
        let star = guider
            .star_position()
            .context("no star after calibration")?;
        guider.set_lock_position(star.x, star.y)?;
    } else if guider.calibration().is_none() {
        bail!("no calibration loaded and calibration disabled");
    }
    log::info!("{}", guider.settings_summary());
    guider.start_guiding().context("starting guiding")?;

    let mut results = SessionResults {
        frames_guided: 0,
        frames_lost: 0,
        errors: Vec::new(),
        events: Vec::new(),
        true_offsets: Vec::with_capacity(options.frames),
        stats: GuideStats::default(),
        final_state: guider.state(),
        max_ao_excursion: 0,
    };

    for frame in 0..options.frames {
        if let Some(every) = options.dither_every {
            if frame > 0 && frame % every == 0 {
                guider.dither(options.dither_amount)?;
            }
        }
        match guider.process_frame() {
            Ok(_) => results.frames_guided += 1,
            Err(GuideError::StarLost) => {
                results.frames_lost += 1;
                results.errors.push(format!("Frame {frame}: star lost"));
                break;
            }
            Err(e) => results.errors.push(format!("Frame {frame} error: {e}")),
        }
        if guider.state() != GuiderState::Guiding {
            break;
        }
        if let Some((lock_x, lock_y)) = guider.lock_position() {
            let (x, y) = sky.true_position();
            results.true_offsets.push((x - lock_x, y - lock_y));
        }
        let (ao_x, ao_y) = sky.ao_position();
        results.max_ao_excursion = results
            .max_ao_excursion
            .max(ao_x.unsigned_abs())
            .max(ao_y.unsigned_abs());
    }

    results.stats = guider.guide_stats();
    results.final_state = guider.state();
    guider.deregister_callback(callback_id);
    results.events = Arc::try_unwrap(events)
        .map(|mutex| mutex.into_inner().unwrap())
        .unwrap_or_else(|arc| arc.lock().unwrap().clone());
    Ok(results)
}
