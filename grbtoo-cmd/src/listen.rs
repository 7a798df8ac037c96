use std::io::{stdin, BufRead};
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use grbtoo::{
    archive::Archiver,
    cancel::Flag,
    config::Config,
    decision::DecisionEngine,
    dispatch::Dispatcher,
    listener::Listener,
    sequencer::Sequencer,
};
use tracing::{info, warn};

use crate::devices::Simulated;

/// Operator commands read from stdin while listening.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Abort,
    Status,
    Stop,
}

fn parse_command(line: &str) -> Option<Command> {
    match line.trim() {
        "abort" => Some(Command::Abort),
        "status" => Some(Command::Status),
        "stop" | "quit" | "exit" => Some(Command::Stop),
        _ => None,
    }
}

pub fn archiver(config: &Config) -> Option<Archiver> {
    match (&config.gcn.events_dir, &config.gcn.www) {
        (Some(dir), Some(www)) => Some(Archiver::new(dir, www.as_str())),
        _ => None,
    }
}

pub fn listen(config_path: &Path, realtime: bool) -> Result<()> {
    let config = Config::load(config_path).context("loading config")?;
    if config.telegram_token.is_some() {
        warn!("telegram_token is set but no chat interface is available; ignoring");
    }

    let shutdown = Flag::new();
    let devices = Simulated::devices(config.devices.clone(), realtime, shutdown.clone());
    let sequencer = Arc::new(Sequencer::new(devices, &config.observability.sequence));
    let engine = DecisionEngine::new(
        config.criteria(),
        Box::new(config.site),
        Box::new(config.dust()),
    );
    let mut dispatcher = Dispatcher::new(engine, sequencer.clone());
    match archiver(&config) {
        Some(archiver) => {
            info!(dir = %archiver.events_dir().display(), "archiving alerts");
            dispatcher = dispatcher.with_archiver(archiver);
        }
        None => warn!("gcn.events_dir or gcn.www not set; alerts will not be archived"),
    }

    let opts = config.listen_opts().context("building listener options")?;
    let mut listener = Listener::new(opts, dispatcher);
    listener.start().context("starting listener")?;
    info!("commands: abort, status, stop");

    for line in stdin().lock().lines() {
        let line = line.context("reading stdin")?;
        match parse_command(&line) {
            Some(Command::Abort) => sequencer.abort(),
            Some(Command::Status) => info!(state = ?listener.state(), "listener"),
            Some(Command::Stop) => break,
            None if line.trim().is_empty() => {}
            None => warn!(command = line.trim(), "unknown command"),
        }
    }

    info!("stopping");
    sequencer.abort();
    shutdown.set();
    listener.stop().context("stopping listener")
}
