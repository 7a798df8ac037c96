//! Stand-in observatory that logs every command instead of moving hardware.
use std::sync::Arc;
use std::time::{Duration, TryFromFloatSecsError};

use grbtoo::{
    astro::Equatorial,
    cancel::Flag,
    config::DevicesConfig,
    sequencer::{Camera, Devices, ExposureRequest, FilterWheel, Supervisor, Telescope},
    Error, Result,
};
use tracing::info;

pub struct Simulated {
    names: DevicesConfig,
    realtime: bool,
    /// Interrupts a realtime exposure wait when the program exits.
    shutdown: Flag,
}

impl Simulated {
    /// With `realtime`, exposures take their requested time so that aborts can be exercised.
    pub fn devices(names: DevicesConfig, realtime: bool, shutdown: Flag) -> Devices {
        let sim = Arc::new(Simulated {
            names,
            realtime,
            shutdown,
        });
        Devices {
            supervisor: sim.clone(),
            telescope: sim.clone(),
            filterwheel: sim.clone(),
            camera: sim,
        }
    }
}

impl Supervisor for Simulated {
    fn acquire(&self) -> Result<()> {
        info!("acquired observatory control");
        Ok(())
    }

    fn release(&self) -> Result<()> {
        info!("released observatory control");
        Ok(())
    }
}

impl Telescope for Simulated {
    fn slew_to_ra_dec(&self, target: Equatorial) -> Result<()> {
        info!(device = %self.names.telescope, ra = target.ra, dec = target.dec, "slew");
        Ok(())
    }
}

impl FilterWheel for Simulated {
    fn set_filter(&self, filter: &str) -> Result<()> {
        info!(device = %self.names.filterwheel, filter, "set filter");
        Ok(())
    }
}

impl Camera for Simulated {
    fn expose(&self, request: &ExposureRequest) -> Result<()> {
        info!(
            device = %self.names.camera,
            exptime = request.exptime,
            frames = request.frames,
            extra = %serde_json::Value::Object(request.extra.clone()),
            "expose"
        );
        if self.realtime {
            let total = exposure_time(request)
                .map_err(|err| Error::device(&self.names.camera, "expose", err))?;
            self.shutdown.sleep(total, Duration::from_millis(200));
        }
        Ok(())
    }
}

/// Total time of all frames of `request`.
fn exposure_time(
    request: &ExposureRequest,
) -> std::result::Result<Duration, TryFromFloatSecsError> {
    Duration::try_from_secs_f64(request.exptime * f64::from(request.frames))
}
