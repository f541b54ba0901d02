//! Worker lanes that run exposures and moves off the control thread.
//!
//! There are exactly two lanes per session. The primary lane runs camera
//! exposures and mount moves in order, so a correction never overlaps the
//! exposure that measured it. The secondary lane runs AO steps, which may
//! overlap an exposure. Devices flagged `synchronous_only` are always
//! serviced on the primary lane.

mod cancel;
mod executor;
mod lane;
mod request;

pub use cancel::CancellationToken;
pub use request::{
    ConnectReport, ExposureOutcome, ExposureRequest, LaneId, MoveOutcome, MoveReport,
    MoveRequest, MoveTarget, Pending,
};

use crate::config::WorkerConfig;
use crate::equipment::Equipment;
use crate::error::GuideResult;
use crossbeam_channel::bounded;
use lane::{Job, WorkerLane};
use shared::camera_interface::Frame;

pub struct WorkDispatcher {
    primary: WorkerLane,
    secondary: WorkerLane,
    token: CancellationToken,
    mount_synchronous_only: bool,
    ao_synchronous_only: bool,
}

impl WorkDispatcher {
    /// Spawn both lanes for a session.
    pub fn start(equipment: &Equipment, config: &WorkerConfig) -> GuideResult<Self> {
        config.validate()?;
        let token = CancellationToken::new();
        let primary = WorkerLane::spawn(
            LaneId::Primary,
            equipment.clone(),
            config.clone(),
            token.clone(),
        )?;
        let secondary = WorkerLane::spawn(
            LaneId::Secondary,
            equipment.clone(),
            config.clone(),
            token.clone(),
        )?;
        Ok(Self {
            primary,
            secondary,
            token,
            mount_synchronous_only: equipment.mount.capabilities().synchronous_only,
            ao_synchronous_only: equipment
                .step_guider
                .as_ref()
                .is_some_and(|ao| ao.capabilities().synchronous_only),
        })
    }

    /// Default lane for a device.
    pub fn default_lane(target: MoveTarget) -> LaneId {
        match target {
            MoveTarget::Mount => LaneId::Primary,
            MoveTarget::StepGuider => LaneId::Secondary,
        }
    }

    /// Lane a move actually runs on. Synchronous-only devices always go to
    /// the primary lane regardless of the requested lane.
    pub fn route(&self, target: MoveTarget, requested: LaneId) -> LaneId {
        let synchronous_only = match target {
            MoveTarget::Mount => self.mount_synchronous_only,
            MoveTarget::StepGuider => self.ao_synchronous_only,
        };
        if synchronous_only {
            LaneId::Primary
        } else {
            requested
        }
    }

    fn lane(&self, id: LaneId) -> &WorkerLane {
        match id {
            LaneId::Primary => &self.primary,
            LaneId::Secondary => &self.secondary,
        }
    }

    /// Queue an exposure on the primary lane.
    pub fn enqueue_exposure(&self, request: ExposureRequest) -> Pending<Frame> {
        let (reply, rx) = bounded(1);
        self.primary.submit(Job::Expose {
            request,
            token: self.token.scoped(),
            reply,
        });
        Pending::new(rx)
    }

    /// Run an exposure and block until it completes.
    pub fn expose(&self, request: ExposureRequest) -> ExposureOutcome {
        self.enqueue_exposure(request).wait()
    }

    /// Queue a move on the requested lane, subject to routing.
    pub fn enqueue_move_on(&self, request: MoveRequest, requested: LaneId) -> Pending<MoveReport> {
        let lane = self.lane(self.route(request.target, requested));
        log::debug!("Queueing {} on {} lane", request.describe(), lane.id());
        let (reply, rx) = bounded(1);
        lane.submit(Job::Move {
            request,
            token: self.token.scoped(),
            reply,
        });
        Pending::new(rx)
    }

    /// Queue a move on its device's default lane.
    pub fn enqueue_move(&self, request: MoveRequest) -> Pending<MoveReport> {
        let requested = Self::default_lane(request.target);
        self.enqueue_move_on(request, requested)
    }

    /// Run a move and block until it completes.
    pub fn move_blocking(&self, request: MoveRequest) -> MoveOutcome {
        self.enqueue_move(request).wait()
    }

    /// Recenter the AO unit and block until done.
    pub fn center_step_guider(&self) -> MoveOutcome {
        let lane = self.lane(self.route(MoveTarget::StepGuider, LaneId::Secondary));
        let (reply, rx) = bounded(1);
        lane.submit(Job::Center {
            token: self.token.scoped(),
            reply,
        });
        Pending::new(rx).wait()
    }

    /// Connect every device, on the primary lane.
    pub fn connect(&self) -> GuideResult<ConnectReport> {
        let (reply, rx) = bounded(1);
        self.primary.submit(Job::Connect { reply });
        Pending::new(rx).wait()
    }

    /// Disconnect every device, on the primary lane.
    pub fn disconnect(&self) -> GuideResult<()> {
        let (reply, rx) = bounded(1);
        self.primary.submit(Job::Disconnect { reply });
        Pending::new(rx).wait()
    }

    /// Current mount declination in radians, read on the primary lane.
    pub fn declination(&self) -> GuideResult<Option<f64>> {
        let (reply, rx) = bounded(1);
        self.primary.submit(Job::Declination { reply });
        Pending::new(rx).wait()
    }

    /// Abort whatever is running or queued right now on both lanes.
    pub fn interrupt(&self) {
        self.token.interrupt();
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Terminate both lanes.
    pub fn stop(&mut self) {
        self.token.terminate();
        self.primary.stop();
        self.secondary.stop();
    }
}

impl Drop for WorkDispatcher {
    fn drop(&mut self) {
        self.stop();
    }
}
