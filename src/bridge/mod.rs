//! Command bridge: the single gate to the instruments.
//!
//! Any number of tasks hold a cloned [`CommandBridge`] and call [`CommandBridge::submit`].
//! Commands travel over a bounded channel to one owner task ([`actor::BridgeActor`]) that
//! executes them one at a time and answers each caller on its own oneshot channel.
//!
//! Submission never waits for queue capacity: a full queue, or an owner that has gone
//! away, fails immediately with [`DaqError::HardwareBusy`]. The caller's wait for a reply
//! is bounded by `command_timeout`; the owner drops commands whose deadline passed or
//! whose caller stopped listening before they reach an instrument.
//!
//! The owner republishes its state after every command; [`CommandBridge::read`] returns
//! a copy of the latest version without any hardware traffic.

pub mod actor;
pub mod messages;

use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tracing::{debug, warn};

use crate::config::BridgeConfig;
use crate::controller::ControllerState;
use crate::error::{AppResult, DaqError};
use crate::instrument::{
    CurrentSource, InstrumentHandle, InstrumentSet, InstrumentSlot, OutputChannel, Reading,
};
use crate::sequencer::SequencerState;

use actor::BridgeActor;
pub use messages::{BridgeMessage, CommandOutput, Envelope, HardwareCommand, SessionKind};

/// Everything the bridge owner publishes.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BridgeState {
    /// One handle per slot, in slot order
    pub instruments: Vec<InstrumentHandle>,
    /// Latest sequencer state
    pub sequencer: SequencerState,
    /// Latest controller state
    pub controller: ControllerState,
    /// Outputs currently reserved by a session
    pub claims: BTreeMap<OutputChannel, SessionKind>,
    /// Commands executed since start
    pub commands_executed: u64,
    /// Commands dropped unexecuted (stale or abandoned)
    pub commands_discarded: u64,
}

impl BridgeState {
    /// State before the owner has run any command.
    pub fn initial() -> Self {
        Self {
            instruments: InstrumentSlot::ALL
                .into_iter()
                .map(InstrumentHandle::new)
                .collect(),
            sequencer: SequencerState::default(),
            controller: ControllerState::default(),
            claims: BTreeMap::new(),
            commands_executed: 0,
            commands_discarded: 0,
        }
    }

    /// Handle of `slot`.
    pub fn instrument(&self, slot: InstrumentSlot) -> Option<&InstrumentHandle> {
        self.instruments.iter().find(|h| h.slot == slot)
    }
}

/// Cloneable handle to the bridge owner
#[derive(Clone)]
pub struct CommandBridge {
    sender: mpsc::Sender<BridgeMessage>,
    state: watch::Receiver<BridgeState>,
    command_timeout: Duration,
}

impl CommandBridge {
    /// Starts the owner task on the current runtime.
    ///
    /// ```
    /// use hv_daq::bridge::CommandBridge;
    /// use hv_daq::config::BridgeConfig;
    /// use hv_daq::instrument::mock::SimulatedBench;
    /// use hv_daq::instrument::{InstrumentSlot, OutputChannel};
    ///
    /// # tokio_test::block_on(async {
    /// let bench = SimulatedBench::new();
    /// let (bridge, _owner) = CommandBridge::spawn(bench.instruments(), &BridgeConfig::default());
    /// bridge.connect(InstrumentSlot::HvSource, "COM1").await?;
    /// bridge.set_voltage(OutputChannel::HvSource, 250.0).await?;
    /// assert_eq!(bridge.read_voltage(OutputChannel::HvSource).await?, 250.0);
    /// # Ok::<(), hv_daq::DaqError>(())
    /// # }).unwrap();
    /// ```
    pub fn spawn(instruments: InstrumentSet, config: &BridgeConfig) -> (Self, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(config.queue_capacity.max(1));
        let (state_tx, state_rx) = watch::channel(BridgeState::initial());
        let actor = BridgeActor::new(instruments, config.device_timeout, state_tx);
        let task = tokio::spawn(actor.run(receiver));
        (
            Self {
                sender,
                state: state_rx,
                command_timeout: config.command_timeout,
            },
            task,
        )
    }

    /// Submits a command and waits for its result.
    pub async fn submit(&self, command: HardwareCommand) -> AppResult<CommandOutput> {
        let label = command.label();
        let (envelope, reply) = Envelope::new(command, Instant::now() + self.command_timeout);
        let id = envelope.id;

        match self.sender.try_send(BridgeMessage::Submit(envelope)) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                debug!(%id, command = label, "Command queue full");
                return Err(DaqError::HardwareBusy("command queue is full".to_string()));
            }
            Err(TrySendError::Closed(_)) => {
                return Err(DaqError::HardwareBusy(
                    "command bridge is not running".to_string(),
                ));
            }
        }

        match timeout(self.command_timeout, reply).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(DaqError::HardwareBusy(
                "command bridge stopped before answering".to_string(),
            )),
            Err(_) => {
                warn!(%id, command = label, timeout = ?self.command_timeout, "Command timed out");
                Err(DaqError::Timeout(self.command_timeout))
            }
        }
    }

    /// Copy of the owner's latest published state.
    pub fn read(&self) -> BridgeState {
        self.state.borrow().clone()
    }

    /// A receiver notified whenever the owner publishes.
    pub fn watch(&self) -> watch::Receiver<BridgeState> {
        self.state.clone()
    }

    /// Bound on a caller's wait for a reply.
    pub fn command_timeout(&self) -> Duration {
        self.command_timeout
    }

    /// Asks the owner to disconnect everything and stop, then waits for it.
    pub async fn shutdown(&self) -> AppResult<()> {
        let (message, ack) = BridgeMessage::shutdown();
        if self.sender.send(message).await.is_err() {
            return Ok(());
        }
        timeout(self.command_timeout, ack)
            .await
            .map_err(|_| DaqError::Timeout(self.command_timeout))?
            .map_err(|_| DaqError::HardwareBusy("command bridge stopped".to_string()))
    }

    // Typed wrappers over `submit`.

    /// Opens `slot` on `port`.
    pub async fn connect(&self, slot: InstrumentSlot, port: impl Into<String>) -> AppResult<()> {
        self.submit(HardwareCommand::Connect {
            slot,
            port: port.into(),
        })
        .await
        .map(drop)
    }

    /// Closes `slot`.
    pub async fn disconnect(&self, slot: InstrumentSlot) -> AppResult<()> {
        self.submit(HardwareCommand::Disconnect { slot })
            .await
            .map(drop)
    }

    /// Changes the reading coefficient of `slot`.
    pub async fn set_coefficient(&self, slot: InstrumentSlot, coefficient: f64) -> AppResult<()> {
        self.submit(HardwareCommand::SetCoefficient { slot, coefficient })
            .await
            .map(drop)
    }

    /// Commands an output voltage.
    pub async fn set_voltage(&self, output: OutputChannel, volts: f64) -> AppResult<()> {
        self.submit(HardwareCommand::SetVoltage { output, volts })
            .await
            .map(drop)
    }

    /// Reads back an output voltage.
    pub async fn read_voltage(&self, output: OutputChannel) -> AppResult<f64> {
        self.submit(HardwareCommand::ReadVoltage(output))
            .await?
            .into_voltage()
    }

    /// Reads a meter slot, scaled by its coefficient.
    pub async fn read_meter(&self, slot: InstrumentSlot) -> AppResult<Reading> {
        self.submit(HardwareCommand::ReadMeter(slot))
            .await?
            .into_reading()
    }

    /// Reads the source-meter current, scaled by its coefficient.
    pub async fn read_source_meter_current(&self) -> AppResult<Reading> {
        self.submit(HardwareCommand::ReadSourceMeterCurrent)
            .await?
            .into_reading()
    }

    /// Switches the source-meter HV output.
    pub async fn set_source_meter_output(&self, enabled: bool) -> AppResult<()> {
        self.submit(HardwareCommand::SetSourceMeterOutput(enabled))
            .await
            .map(drop)
    }

    /// Reads a current source in µA.
    pub async fn read_current(&self, source: CurrentSource) -> AppResult<f64> {
        self.submit(HardwareCommand::ReadCurrent(source))
            .await?
            .into_microamps()
    }

    /// Reserves `output` for `session`; fails with `Conflict` when it is taken.
    pub async fn claim_output(&self, output: OutputChannel, session: SessionKind) -> AppResult<()> {
        self.submit(HardwareCommand::ClaimOutput { output, session })
            .await
            .map(drop)
    }

    /// Releases `output` if `session` holds it.
    pub async fn release_output(
        &self,
        output: OutputChannel,
        session: SessionKind,
    ) -> AppResult<()> {
        self.submit(HardwareCommand::ReleaseOutput { output, session })
            .await
            .map(drop)
    }

    /// Publishes a new sequencer state.
    pub async fn publish_sequencer(&self, state: SequencerState) -> AppResult<()> {
        self.submit(HardwareCommand::PublishSequencer(state))
            .await
            .map(drop)
    }

    /// Publishes a new controller state.
    pub async fn publish_controller(&self, state: ControllerState) -> AppResult<()> {
        self.submit(HardwareCommand::PublishController(state))
            .await
            .map(drop)
    }
}
