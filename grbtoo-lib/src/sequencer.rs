//! Observation trigger: take control of the observatory, point at the target and run the
//! configured exposure plan.
use std::fs;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{error, info, warn};

use crate::{astro::Equatorial, cancel::Flag, Error, Result};

/// Exclusive control over the observatory, e.g., stopping the nightly scheduler so nothing
/// else moves the telescope.
pub trait Supervisor: Send + Sync {
    fn acquire(&self) -> Result<()>;
    fn release(&self) -> Result<()>;
}

pub trait Telescope: Send + Sync {
    fn slew_to_ra_dec(&self, target: Equatorial) -> Result<()>;
}

pub trait FilterWheel: Send + Sync {
    fn set_filter(&self, filter: &str) -> Result<()>;
}

pub trait Camera: Send + Sync {
    /// Take the exposures described by `request`, blocking until they are done.
    fn expose(&self, request: &ExposureRequest) -> Result<()>;
}

/// The set of devices a trigger commands.
#[derive(Clone)]
pub struct Devices {
    pub supervisor: Arc<dyn Supervisor>,
    pub telescope: Arc<dyn Telescope>,
    pub filterwheel: Arc<dyn FilterWheel>,
    pub camera: Arc<dyn Camera>,
}

fn default_exptime() -> f64 {
    1.0
}

fn default_frames() -> u32 {
    1
}

/// One step of an [ExposurePlan].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExposureRequest {
    pub filter: String,
    /// Exposure time in seconds.
    #[serde(default = "default_exptime")]
    pub exptime: f64,
    #[serde(default = "default_frames")]
    pub frames: u32,
    /// Camera specific parameters, passed through untouched.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ExposureRequest {
    fn validate(&self, step: usize) -> Result<()> {
        if self.filter.trim().is_empty() {
            return Err(Error::Plan(format!("step {step}: empty filter name")));
        }
        if !self.exptime.is_finite() || self.exptime < 0.0 {
            return Err(Error::Plan(format!(
                "step {step}: exptime must be >= 0, got {}",
                self.exptime
            )));
        }
        if self.frames < 1 {
            return Err(Error::Plan(format!("step {step}: frames must be >= 1")));
        }
        Ok(())
    }
}

/// Ordered exposure steps run for each trigger.
///
/// Stored as a JSON array of objects, e.g.,
/// ```json
/// [{"filter": "R", "exptime": 30, "frames": 3}, {"filter": "I", "exptime": 60}]
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExposurePlan {
    pub steps: Vec<ExposureRequest>,
}

impl ExposurePlan {
    /// Parse and validate a plan from JSON.
    ///
    /// # Errors
    /// [Error::Plan] if the JSON is not a list of valid steps or the list is empty.
    pub fn from_json(json: &str) -> Result<Self> {
        let plan: ExposurePlan =
            serde_json::from_str(json).map_err(|err| Error::Plan(err.to_string()))?;
        plan.validate()?;
        Ok(plan)
    }

    /// # Errors
    /// [Error::Plan] if the file cannot be read or does not contain a valid plan.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let json = fs::read_to_string(path)
            .map_err(|err| Error::Plan(format!("failed to read {}: {err}", path.display())))?;
        Self::from_json(&json)
            .map_err(|err| Error::Plan(format!("{}: {err}", path.display())))
    }

    /// # Errors
    /// [Error::Plan] describing the first invalid step.
    pub fn validate(&self) -> Result<()> {
        if self.steps.is_empty() {
            return Err(Error::Plan("plan has no steps".into()));
        }
        for (i, step) in self.steps.iter().enumerate() {
            step.validate(i)?;
        }
        Ok(())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// Runs triggers one at a time against a single observatory.
///
/// An abort is cooperative: it is observed after each exposure step, so the exposure in
/// flight completes and only the remaining steps are skipped.
pub struct Sequencer {
    devices: Devices,
    plan_path: PathBuf,
    abort: Flag,
}

impl Sequencer {
    pub fn new<P: Into<PathBuf>>(devices: Devices, plan_path: P) -> Self {
        Sequencer {
            devices,
            plan_path: plan_path.into(),
            abort: Flag::new(),
        }
    }

    #[must_use]
    pub fn plan_path(&self) -> &Path {
        &self.plan_path
    }

    /// Request that the running trigger stop after its current step. Safe to call from any
    /// thread; never touches the devices.
    pub fn abort(&self) {
        info!("trigger abort requested");
        self.abort.set();
    }

    /// Handle that aborts triggers run by this sequencer.
    #[must_use]
    pub fn abort_handle(&self) -> Flag {
        self.abort.clone()
    }

    /// Point at `target` and run the exposure plan.
    ///
    /// Returns `true` if every step completed and `false` if aborted. Control of the
    /// observatory is released before returning whenever it was acquired. Completed
    /// exposures are never rolled back.
    ///
    /// # Errors
    /// Any device or plan error. The remaining steps are skipped. A device that panics is
    /// reported as [Error::Task].
    pub fn trigger(&self, target: Equatorial) -> Result<bool> {
        self.abort.clear();
        self.devices.supervisor.acquire()?;
        let zult = catch_unwind(AssertUnwindSafe(|| self.run(target)))
            .unwrap_or_else(|_| Err(Error::Task("device panicked during trigger".into())));
        if let Err(err) = self.devices.supervisor.release() {
            error!(%err, "failed to release observatory control");
        }
        zult
    }

    fn run(&self, target: Equatorial) -> Result<bool> {
        info!(ra = target.ra, dec = target.dec, "slewing to target");
        self.devices.telescope.slew_to_ra_dec(target)?;

        let plan = ExposurePlan::load(&self.plan_path)?;
        for (i, step) in plan.steps.iter().enumerate() {
            info!(
                step = i,
                filter = %step.filter,
                exptime = step.exptime,
                frames = step.frames,
                "exposing"
            );
            self.devices.filterwheel.set_filter(&step.filter)?;
            self.devices.camera.expose(step)?;
            if self.abort.is_set() {
                warn!(
                    completed = i + 1,
                    total = plan.len(),
                    "trigger aborted"
                );
                return Ok(false);
            }
        }
        info!(steps = plan.len(), "trigger complete");
        Ok(true)
    }
}
