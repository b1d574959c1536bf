//! Message types for the command bridge
//!
//! Callers never touch an instrument directly. They build a [`HardwareCommand`],
//! and the bridge wraps it in an [`Envelope`] that carries a correlation id, a
//! deadline and the oneshot sender the owner task answers on.

use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::oneshot;
use tokio::time::Instant;
use uuid::Uuid;

use crate::controller::ControllerState;
use crate::error::{AppResult, DaqError};
use crate::instrument::{CurrentSource, InstrumentSlot, OutputChannel, Reading};
use crate::sequencer::SequencerState;

/// Sessions that can hold an output claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionKind {
    /// Ramp test sequencer
    Sequencer,
    /// Current stabilization controller
    Controller,
}

impl fmt::Display for SessionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionKind::Sequencer => f.write_str("ramp test"),
            SessionKind::Controller => f.write_str("stabilization"),
        }
    }
}

/// Commands executed by the bridge owner, one at a time
#[derive(Debug, Clone, PartialEq)]
pub enum HardwareCommand {
    /// Open the instrument in `slot` on `port`
    Connect {
        /// Slot to connect
        slot: InstrumentSlot,
        /// Serial port or VISA resource
        port: String,
    },

    /// Close the instrument in `slot`
    Disconnect {
        /// Slot to disconnect
        slot: InstrumentSlot,
    },

    /// Change the reading coefficient of `slot`
    SetCoefficient {
        /// Slot to update
        slot: InstrumentSlot,
        /// New coefficient
        coefficient: f64,
    },

    /// Command an output voltage
    SetVoltage {
        /// Output to drive
        output: OutputChannel,
        /// Volts
        volts: f64,
    },

    /// Read back an output voltage
    ReadVoltage(OutputChannel),

    /// Read a current meter or the vacuum gauge
    ReadMeter(InstrumentSlot),

    /// Read the source-meter's own current
    ReadSourceMeterCurrent,

    /// Switch the source-meter HV output
    SetSourceMeterOutput(bool),

    /// Read a current source normalised to µA
    ReadCurrent(CurrentSource),

    /// Reserve an output for a session
    ClaimOutput {
        /// Output to reserve
        output: OutputChannel,
        /// Claiming session
        session: SessionKind,
    },

    /// Give an output back
    ReleaseOutput {
        /// Output to release
        output: OutputChannel,
        /// Releasing session
        session: SessionKind,
    },

    /// Replace the published sequencer state
    PublishSequencer(SequencerState),

    /// Replace the published controller state
    PublishController(ControllerState),
}

impl HardwareCommand {
    /// Short name for logs.
    pub fn label(&self) -> &'static str {
        match self {
            HardwareCommand::Connect { .. } => "connect",
            HardwareCommand::Disconnect { .. } => "disconnect",
            HardwareCommand::SetCoefficient { .. } => "set_coefficient",
            HardwareCommand::SetVoltage { .. } => "set_voltage",
            HardwareCommand::ReadVoltage(_) => "read_voltage",
            HardwareCommand::ReadMeter(_) => "read_meter",
            HardwareCommand::ReadSourceMeterCurrent => "read_source_meter_current",
            HardwareCommand::SetSourceMeterOutput(_) => "set_source_meter_output",
            HardwareCommand::ReadCurrent(_) => "read_current",
            HardwareCommand::ClaimOutput { .. } => "claim_output",
            HardwareCommand::ReleaseOutput { .. } => "release_output",
            HardwareCommand::PublishSequencer(_) => "publish_sequencer",
            HardwareCommand::PublishController(_) => "publish_controller",
        }
    }
}

/// Successful result of a [`HardwareCommand`]
#[derive(Debug, Clone, PartialEq)]
pub enum CommandOutput {
    /// Command had no value to return
    Done,
    /// A voltage in volts
    Voltage(f64),
    /// A scaled instrument reading
    Reading(Reading),
    /// A current in µA
    Microamps(f64),
}

impl CommandOutput {
    /// Unwraps a voltage result.
    pub fn into_voltage(self) -> AppResult<f64> {
        match self {
            CommandOutput::Voltage(v) => Ok(v),
            other => Err(unexpected("voltage", &other)),
        }
    }

    /// Unwraps a reading result.
    pub fn into_reading(self) -> AppResult<Reading> {
        match self {
            CommandOutput::Reading(r) => Ok(r),
            other => Err(unexpected("reading", &other)),
        }
    }

    /// Unwraps a normalised current result.
    pub fn into_microamps(self) -> AppResult<f64> {
        match self {
            CommandOutput::Microamps(ua) => Ok(ua),
            other => Err(unexpected("current", &other)),
        }
    }
}

fn unexpected(expected: &str, got: &CommandOutput) -> DaqError {
    DaqError::Device(format!("expected {} result, got {:?}", expected, got))
}

/// A submitted command on its way to the owner
#[derive(Debug)]
pub struct Envelope {
    /// Correlation id, logged on both sides
    pub id: Uuid,
    /// What to execute
    pub command: HardwareCommand,
    /// Commands dequeued after this instant are discarded unexecuted
    pub deadline: Instant,
    /// Reply channel of the submitting caller
    pub response: oneshot::Sender<AppResult<CommandOutput>>,
}

impl Envelope {
    /// Wraps `command` and returns the receiver for its reply.
    pub fn new(
        command: HardwareCommand,
        deadline: Instant,
    ) -> (Self, oneshot::Receiver<AppResult<CommandOutput>>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                id: Uuid::new_v4(),
                command,
                deadline,
                response: tx,
            },
            rx,
        )
    }
}

/// Messages accepted by the bridge owner
#[derive(Debug)]
pub enum BridgeMessage {
    /// Execute a command
    Submit(Envelope),

    /// Disconnect every instrument and stop the owner
    Shutdown {
        /// Acknowledged once the owner has stopped
        response: oneshot::Sender<()>,
    },
}

impl BridgeMessage {
    /// Helper to create a Shutdown message
    pub fn shutdown() -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (Self::Shutdown { response: tx }, rx)
    }
}
