#![doc = include_str!("../README.md")]

mod error;

pub mod archive;
pub mod astro;
pub mod cancel;
pub mod config;
pub mod decision;
pub mod dispatch;
pub mod listener;
pub mod sequencer;
pub mod transport;
pub mod voevent;
pub mod vtp;

pub use error::{Error, Result};
