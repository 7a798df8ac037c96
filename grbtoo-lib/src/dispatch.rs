use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tracing::{error, info, warn};

use crate::{
    archive::Archiver,
    astro::Equatorial,
    decision::{AdmissionDecision, DecisionEngine},
    sequencer::Sequencer,
    voevent::AlertDocument,
    vtp::Handler,
};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerOutcome {
    Completed,
    Aborted,
    Failed(String),
}

/// What happened to one alert.
#[derive(Debug, Clone, Serialize)]
pub struct Outcome {
    /// `None` if the alert could not be evaluated.
    pub decision: Option<AdmissionDecision>,
    /// `None` unless the alert was accepted.
    pub trigger: Option<TriggerOutcome>,
    /// Public URL of the archived alert.
    pub url: Option<String>,
}

/// Alert handler that evaluates each alert, triggers an observation for accepted ones, and
/// then archives it.
///
/// Failures are logged and never escape, so one bad alert cannot stop the listener.
pub struct Dispatcher {
    engine: DecisionEngine,
    sequencer: Arc<Sequencer>,
    archiver: Option<Archiver>,
}

impl Dispatcher {
    pub fn new(engine: DecisionEngine, sequencer: Arc<Sequencer>) -> Self {
        Dispatcher {
            engine,
            sequencer,
            archiver: None,
        }
    }

    /// Archive every alert after it is handled.
    pub fn with_archiver(mut self, archiver: Archiver) -> Self {
        self.archiver = Some(archiver);
        self
    }

    #[must_use]
    pub fn sequencer(&self) -> &Arc<Sequencer> {
        &self.sequencer
    }

    pub fn dispatch(&self, alert: &AlertDocument) -> Outcome {
        let t0 = Instant::now();
        info!(ivorn = %alert.ivorn, packet_type = alert.packet_type, "handling alert");

        let decision = match self.engine.evaluate(alert) {
            Ok(decision) => Some(decision),
            Err(err) => {
                error!(ivorn = %alert.ivorn, %err, "failed to evaluate alert");
                None
            }
        };

        let trigger = match decision {
            Some(ref d) if d.is_accepted() => d.position.map(|target| self.trigger(alert, target)),
            _ => None,
        };

        let url = self.archiver.as_ref().and_then(|archiver| {
            match archiver.archive(alert) {
                Ok(archived) => Some(archived.url),
                Err(err) => {
                    error!(ivorn = %alert.ivorn, %err, "failed to archive alert");
                    None
                }
            }
        });

        info!(ivorn = %alert.ivorn, elapsed = ?t0.elapsed(), "alert done");
        Outcome {
            decision,
            trigger,
            url,
        }
    }

    fn trigger(&self, alert: &AlertDocument, target: Equatorial) -> TriggerOutcome {
        if alert.is_test() {
            warn!(ivorn = %alert.ivorn, "triggering on a test alert");
        }
        match self.sequencer.trigger(target) {
            Ok(true) => TriggerOutcome::Completed,
            Ok(false) => TriggerOutcome::Aborted,
            Err(err) => {
                error!(ivorn = %alert.ivorn, %err, "trigger failed");
                TriggerOutcome::Failed(err.to_string())
            }
        }
    }
}

impl Handler for Dispatcher {
    fn handle(&mut self, alert: &AlertDocument) {
        self.dispatch(alert);
    }
}
