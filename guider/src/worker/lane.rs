//! A single worker thread with a high-priority move queue and a
//! low-priority exposure queue.

use super::cancel::CancellationToken;
use super::executor;
use super::request::{
    ConnectReport, ExposureOutcome, ExposureRequest, LaneId, MoveOutcome, MoveRequest,
};
use crate::config::WorkerConfig;
use crate::equipment::Equipment;
use crate::error::{GuideError, GuideResult};
use crossbeam_channel::{bounded, select, unbounded, Receiver, Sender};
use std::thread::JoinHandle;
use std::time::Duration;

pub(crate) enum Job {
    Expose {
        request: ExposureRequest,
        token: CancellationToken,
        reply: Sender<ExposureOutcome>,
    },
    Move {
        request: MoveRequest,
        token: CancellationToken,
        reply: Sender<MoveOutcome>,
    },
    Center {
        token: CancellationToken,
        reply: Sender<MoveOutcome>,
    },
    Connect {
        reply: Sender<GuideResult<ConnectReport>>,
    },
    Disconnect {
        reply: Sender<GuideResult<()>>,
    },
    Declination {
        reply: Sender<GuideResult<Option<f64>>>,
    },
    Terminate,
}

impl Job {
    fn name(&self) -> &'static str {
        match self {
            Job::Expose { .. } => "expose",
            Job::Move { .. } => "move",
            Job::Center { .. } => "center",
            Job::Connect { .. } => "connect",
            Job::Disconnect { .. } => "disconnect",
            Job::Declination { .. } => "declination",
            Job::Terminate => "terminate",
        }
    }

    /// Reply to a job that will never run.
    fn cancel(self) {
        // A closed reply channel only means the caller stopped waiting.
        match self {
            Job::Expose { reply, .. } => drop(reply.send(Err(GuideError::TerminateRequested))),
            Job::Move { reply, .. } | Job::Center { reply, .. } => {
                drop(reply.send(Err(GuideError::TerminateRequested)))
            }
            Job::Connect { reply } => drop(reply.send(Err(GuideError::TerminateRequested))),
            Job::Disconnect { reply } => drop(reply.send(Err(GuideError::TerminateRequested))),
            Job::Declination { reply } => drop(reply.send(Err(GuideError::TerminateRequested))),
            Job::Terminate => {}
        }
    }
}

pub(crate) struct WorkerLane {
    id: LaneId,
    high: Sender<Job>,
    low: Sender<Job>,
    handle: Option<JoinHandle<()>>,
    exited: Receiver<()>,
    grace: Duration,
}

impl WorkerLane {
    pub(crate) fn spawn(
        id: LaneId,
        equipment: Equipment,
        config: WorkerConfig,
        token: CancellationToken,
    ) -> GuideResult<Self> {
        let (high, high_rx) = unbounded::<Job>();
        let (low, low_rx) = unbounded::<Job>();
        let (exited_tx, exited) = bounded::<()>(1);
        let grace = Duration::from_millis(config.shutdown_grace_ms);

        let handle = std::thread::Builder::new()
            .name(format!("guider-{id}"))
            .spawn(move || {
                log::info!("Worker lane {id} started");
                run_lane(id, &equipment, &config, &token, &high_rx, &low_rx);
                log::info!("Worker lane {id} exiting");
                let _ = exited_tx.send(());
            })
            .map_err(|e| GuideError::HardwareError(format!("cannot spawn {id} lane: {e}")))?;

        Ok(Self {
            id,
            high,
            low,
            handle: Some(handle),
            exited,
            grace,
        })
    }

    pub(crate) fn id(&self) -> LaneId {
        self.id
    }

    /// Queue a job. Moves and control jobs go on the high-priority queue.
    pub(crate) fn submit(&self, job: Job) {
        let queue = match job {
            Job::Expose { .. } => &self.low,
            _ => &self.high,
        };
        if let Err(e) = queue.send(job) {
            log::warn!("Lane {} is gone, dropping {} request", self.id, e.0.name());
            e.0.cancel();
        }
    }

    /// Send the terminate sentinel and wait up to the grace period for the thread.
    pub(crate) fn stop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        let _ = self.high.send(Job::Terminate);
        match self.exited.recv_timeout(self.grace) {
            Ok(()) => {
                if handle.join().is_err() {
                    log::warn!("Worker lane {} panicked", self.id);
                }
            }
            Err(_) => {
                log::warn!(
                    "Worker lane {} did not stop within {:?}; detaching",
                    self.id,
                    self.grace
                );
            }
        }
    }
}

impl Drop for WorkerLane {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Next job to run: queued moves first, then a deferred exposure, then
/// whichever queue delivers first.
fn next_job(high: &Receiver<Job>, low: &Receiver<Job>, deferred: &mut Option<Job>) -> Option<Job> {
    if let Ok(job) = high.try_recv() {
        return Some(job);
    }
    if let Some(job) = deferred.take() {
        return Some(job);
    }
    select! {
        recv(high) -> job => job.ok(),
        recv(low) -> job => match (job, high.try_recv()) {
            (Ok(exposure), Ok(urgent)) => {
                *deferred = Some(exposure);
                Some(urgent)
            }
            (Ok(exposure), Err(_)) => Some(exposure),
            (Err(_), urgent) => urgent.ok(),
        },
    }
}

fn run_lane(
    id: LaneId,
    equipment: &Equipment,
    config: &WorkerConfig,
    token: &CancellationToken,
    high: &Receiver<Job>,
    low: &Receiver<Job>,
) {
    let mut deferred = None;
    while let Some(job) = next_job(high, low, &mut deferred) {
        if matches!(job, Job::Terminate) {
            break;
        }
        if token.terminate_requested() {
            job.cancel();
            continue;
        }
        match job {
            Job::Expose {
                request,
                token,
                reply,
            } => {
                let outcome = executor::run_exposure(equipment, &request, config, &token);
                let _ = reply.send(outcome);
            }
            Job::Move {
                request,
                token,
                reply,
            } => {
                let outcome = executor::run_move(equipment, &request, id, config, &token);
                if let Err(e) = &outcome {
                    log::debug!("{} failed on {id} lane: {e}", request.describe());
                }
                let _ = reply.send(outcome);
            }
            Job::Center { token, reply } => {
                let _ = reply.send(executor::run_center(equipment, id, config, &token));
            }
            Job::Connect { reply } => {
                let _ = reply.send(executor::run_connect(equipment));
            }
            Job::Disconnect { reply } => {
                let _ = reply.send(executor::run_disconnect(equipment));
            }
            Job::Declination { reply } => {
                let _ = reply.send(executor::run_declination(equipment));
            }
            Job::Terminate => break,
        }
    }

    for job in deferred
        .into_iter()
        .chain(high.try_iter())
        .chain(low.try_iter())
    {
        job.cancel();
    }
}
