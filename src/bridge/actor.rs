//! The bridge owner task
//!
//! All instrument I/O happens here, one command at a time, in dequeue order.
//! The owner also holds the instrument handles, both session states and the
//! output claims, and republishes them on a `watch` channel after every command.

use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{timeout, Instant};
use tracing::{debug, info, trace, warn};

use super::messages::{BridgeMessage, CommandOutput, Envelope, HardwareCommand, SessionKind};
use super::BridgeState;
use crate::config::validate_coefficient;
use crate::controller::ControllerState;
use crate::error::{AppResult, DaqError};
use crate::instrument::{
    ConnectionState, CurrentSource, InstrumentHandle, InstrumentSet, InstrumentSlot,
    OutputChannel, Reading,
};
use crate::sequencer::SequencerState;

/// Actor that owns the instruments
pub struct BridgeActor {
    instruments: InstrumentSet,
    handles: BTreeMap<InstrumentSlot, InstrumentHandle>,
    sequencer: SequencerState,
    controller: ControllerState,
    claims: BTreeMap<OutputChannel, SessionKind>,
    device_timeout: Duration,
    state_tx: watch::Sender<BridgeState>,
    executed: u64,
    discarded: u64,
}

impl BridgeActor {
    /// Creates the owner with every slot disconnected
    pub fn new(
        instruments: InstrumentSet,
        device_timeout: Duration,
        state_tx: watch::Sender<BridgeState>,
    ) -> Self {
        let handles = InstrumentSlot::ALL
            .into_iter()
            .map(|slot| (slot, InstrumentHandle::new(slot)))
            .collect();
        Self {
            instruments,
            handles,
            sequencer: SequencerState::default(),
            controller: ControllerState::default(),
            claims: BTreeMap::new(),
            device_timeout,
            state_tx,
            executed: 0,
            discarded: 0,
        }
    }

    /// Runs the actor event loop, processing commands until shutdown
    pub async fn run(mut self, mut receiver: mpsc::Receiver<BridgeMessage>) {
        info!("Command bridge started");

        let mut acknowledge = None;
        while let Some(message) = receiver.recv().await {
            match message {
                BridgeMessage::Submit(envelope) => self.handle(envelope).await,
                BridgeMessage::Shutdown { response } => {
                    info!("Shutdown command received");
                    acknowledge = Some(response);
                    break;
                }
            }
        }

        self.shutdown().await;
        if let Some(response) = acknowledge {
            let _ = response.send(());
        }
        info!(
            executed = self.executed,
            discarded = self.discarded,
            "Command bridge stopped"
        );
    }

    async fn handle(&mut self, envelope: Envelope) {
        let Envelope {
            id,
            command,
            deadline,
            response,
        } = envelope;
        let label = command.label();

        if response.is_closed() {
            self.discarded += 1;
            debug!(%id, command = label, "Discarding command, caller went away");
            self.publish();
            return;
        }
        if Instant::now() >= deadline {
            self.discarded += 1;
            warn!(%id, command = label, "Discarding command past its deadline");
            self.publish();
            return;
        }

        let result = self.execute(command).await;
        self.executed += 1;
        match &result {
            Ok(_) => trace!(%id, command = label, "Command executed"),
            Err(err) => warn!(%id, command = label, error = %err, "Command failed"),
        }

        self.publish();
        let _ = response.send(result);
    }

    async fn execute(&mut self, command: HardwareCommand) -> AppResult<CommandOutput> {
        match command {
            HardwareCommand::Connect { slot, port } => self.connect(slot, port).await,
            HardwareCommand::Disconnect { slot } => self.disconnect(slot).await,
            HardwareCommand::SetCoefficient { slot, coefficient } => {
                validate_coefficient(coefficient)?;
                self.handle_mut(slot).coefficient = coefficient;
                info!(%slot, coefficient, "Coefficient updated");
                Ok(CommandOutput::Done)
            }
            HardwareCommand::SetVoltage { output, volts } => self.set_voltage(output, volts).await,
            HardwareCommand::ReadVoltage(output) => self.read_voltage(output).await,
            HardwareCommand::ReadMeter(slot) => {
                self.read_meter(slot).await.map(CommandOutput::Reading)
            }
            HardwareCommand::ReadSourceMeterCurrent => self
                .read_source_meter_current()
                .await
                .map(CommandOutput::Reading),
            HardwareCommand::SetSourceMeterOutput(enabled) => {
                self.set_source_meter_output(enabled).await
            }
            HardwareCommand::ReadCurrent(source) => self.read_current(source).await,
            HardwareCommand::ClaimOutput { output, session } => self.claim(output, session),
            HardwareCommand::ReleaseOutput { output, session } => {
                if self.claims.get(&output) == Some(&session) {
                    self.claims.remove(&output);
                    info!(%output, %session, "Output released");
                }
                Ok(CommandOutput::Done)
            }
            HardwareCommand::PublishSequencer(state) => {
                self.sequencer = state;
                Ok(CommandOutput::Done)
            }
            HardwareCommand::PublishController(state) => {
                self.controller = state;
                Ok(CommandOutput::Done)
            }
        }
    }

    async fn connect(&mut self, slot: InstrumentSlot, port: String) -> AppResult<CommandOutput> {
        if port.trim().is_empty() {
            return Err(DaqError::ConfigInvalid(format!("{}: no port bound", slot)));
        }
        let result = device_call(
            self.device_timeout,
            slot,
            self.instruments.connect(slot, &port),
        )
        .await;
        let handle = self.handle_mut(slot);
        match result {
            Ok(()) => {
                info!(%slot, port = %port, "Instrument connected");
                handle.state = ConnectionState::Connected;
                handle.port = Some(port);
                Ok(CommandOutput::Done)
            }
            Err(err) => {
                handle.state = ConnectionState::Error(err.to_string());
                Err(err)
            }
        }
    }

    async fn disconnect(&mut self, slot: InstrumentSlot) -> AppResult<CommandOutput> {
        let result = device_call(self.device_timeout, slot, self.instruments.disconnect(slot)).await;
        let handle = self.handle_mut(slot);
        match result {
            Ok(()) => {
                info!(%slot, "Instrument disconnected");
                handle.state = ConnectionState::Disconnected;
                handle.setpoint = None;
                Ok(CommandOutput::Done)
            }
            Err(err) => {
                handle.state = ConnectionState::Error(err.to_string());
                Err(err)
            }
        }
    }

    async fn set_voltage(&mut self, output: OutputChannel, volts: f64) -> AppResult<CommandOutput> {
        if !volts.is_finite() {
            return Err(DaqError::ConfigInvalid(format!(
                "{}: voltage must be finite",
                output
            )));
        }
        let slot = output.slot();
        self.ensure_connected(slot)?;
        let result = device_call(
            self.device_timeout,
            slot,
            self.instruments.set_voltage(output, volts),
        )
        .await;
        self.record(slot, result)?;
        self.handle_mut(slot).setpoint = Some(volts);
        debug!(%output, volts, "Voltage set");
        Ok(CommandOutput::Done)
    }

    async fn read_voltage(&mut self, output: OutputChannel) -> AppResult<CommandOutput> {
        let slot = output.slot();
        self.ensure_connected(slot)?;
        let result =
            device_call(self.device_timeout, slot, self.instruments.read_voltage(output)).await;
        let volts = self.record(slot, result)?;
        self.handle_mut(slot).last_reading = Some(Reading::new(volts, "V"));
        Ok(CommandOutput::Voltage(volts))
    }

    async fn read_meter(&mut self, slot: InstrumentSlot) -> AppResult<Reading> {
        if !slot.is_meter() {
            return Err(DaqError::ConfigInvalid(format!("{} is not a meter", slot)));
        }
        self.ensure_connected(slot)?;
        let instruments = &self.instruments;
        let result = device_call(self.device_timeout, slot, async move {
            instruments.meter(slot)?.read().await
        })
        .await;
        let raw = self.record(slot, result)?;
        let handle = self.handle_mut(slot);
        let reading = raw.scaled(handle.coefficient);
        handle.last_reading = Some(reading.clone());
        Ok(reading)
    }

    async fn read_source_meter_current(&mut self) -> AppResult<Reading> {
        let slot = InstrumentSlot::SourceMeter;
        self.ensure_connected(slot)?;
        let result = device_call(
            self.device_timeout,
            slot,
            self.instruments.source_meter.read_current(),
        )
        .await;
        let raw = self.record(slot, result)?;
        Ok(raw.scaled(self.handle_mut(slot).coefficient))
    }

    async fn set_source_meter_output(&mut self, enabled: bool) -> AppResult<CommandOutput> {
        let slot = InstrumentSlot::SourceMeter;
        self.ensure_connected(slot)?;
        let result = device_call(
            self.device_timeout,
            slot,
            self.instruments.source_meter.set_output_enabled(enabled),
        )
        .await;
        self.record(slot, result)?;
        info!(enabled, "Source-meter output switched");
        Ok(CommandOutput::Done)
    }

    async fn read_current(&mut self, source: CurrentSource) -> AppResult<CommandOutput> {
        let reading = match source {
            CurrentSource::SourceMeter => self.read_source_meter_current().await?,
            meter => self.read_meter(meter.slot()).await?,
        };
        reading
            .to_microamps()
            .map(CommandOutput::Microamps)
            .ok_or_else(|| {
                DaqError::Device(format!(
                    "{} reported unsupported current unit '{}'",
                    source.slot(),
                    reading.unit
                ))
            })
    }

    fn claim(&mut self, output: OutputChannel, session: SessionKind) -> AppResult<CommandOutput> {
        if let Some(holder) = self.claims.get(&output) {
            let message = if *holder == session {
                format!("{} is already running", session)
            } else {
                format!("{} is held by {}", output, holder)
            };
            return Err(DaqError::Conflict(message));
        }
        if let Some((held, _)) = self.claims.iter().find(|(_, holder)| **holder == session) {
            return Err(DaqError::Conflict(format!(
                "{} is already running on {}",
                session, held
            )));
        }
        self.claims.insert(output, session);
        info!(%output, %session, "Output claimed");
        Ok(CommandOutput::Done)
    }

    fn ensure_connected(&self, slot: InstrumentSlot) -> AppResult<()> {
        match self.handles.get(&slot).map(|h| &h.state) {
            Some(ConnectionState::Connected) => Ok(()),
            _ => Err(DaqError::Device(format!("{} is not connected", slot))),
        }
    }

    fn handle_mut(&mut self, slot: InstrumentSlot) -> &mut InstrumentHandle {
        self.handles
            .entry(slot)
            .or_insert_with(|| InstrumentHandle::new(slot))
    }

    /// Marks the slot as errored when a device call faulted.
    fn record<T>(&mut self, slot: InstrumentSlot, result: AppResult<T>) -> AppResult<T> {
        if let Err(err) = &result {
            if err.is_fault() {
                self.handle_mut(slot).state = ConnectionState::Error(err.to_string());
            }
        }
        result
    }

    fn publish(&self) {
        self.state_tx.send_replace(BridgeState {
            instruments: self.handles.values().cloned().collect(),
            sequencer: self.sequencer.clone(),
            controller: self.controller.clone(),
            claims: self.claims.clone(),
            commands_executed: self.executed,
            commands_discarded: self.discarded,
        });
    }

    async fn shutdown(&mut self) {
        let connected: Vec<InstrumentSlot> = self
            .handles
            .values()
            .filter(|h| h.state != ConnectionState::Disconnected)
            .map(|h| h.slot)
            .collect();
        for slot in connected {
            if let Err(err) = self.disconnect(slot).await {
                warn!(%slot, error = %err, "Failed to disconnect during shutdown");
            }
        }
        self.claims.clear();
        self.publish();
    }
}

/// Bounds one instrument call and converts its failure into a [`DaqError`].
async fn device_call<T, F>(limit: Duration, slot: InstrumentSlot, call: F) -> AppResult<T>
where
    F: Future<Output = anyhow::Result<T>>,
{
    match timeout(limit, call).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => Err(DaqError::Device(format!("{}: {:#}", slot, err))),
        Err(_) => {
            warn!(%slot, ?limit, "Instrument call timed out");
            Err(DaqError::Timeout(limit))
        }
    }
}
