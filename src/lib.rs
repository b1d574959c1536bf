//! Core library for the hv_daq test bench controller.
//!
//! Every hardware touch goes through the [`bridge::CommandBridge`], a single actor
//! that owns the instruments. The [`sequencer`] runs voltage ramps, the
//! [`controller`] regulates a measured current, and the [`telemetry`] hub snapshots
//! the bench for the HTTP surface, the console and any snapshot sink.

#[cfg(feature = "networking")]
pub mod api;
pub mod app;
pub mod bridge;
pub mod config;
pub mod console;
pub mod controller;
pub mod error;
pub mod instrument;
pub mod logging;
pub mod params;
pub mod sequencer;
pub mod session;
pub mod telemetry;

pub use app::HvApp;
pub use error::{AppResult, DaqError};
