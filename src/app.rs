//! Application wiring: one bridge, both sessions, the telemetry hub and its workers.
//!
//! [`HvApp`] is what the HTTP surface and the console talk to. It adds no behavior
//! of its own beyond resolving stored parameters and port bindings before handing
//! an explicit request to the sequencer, the controller or the bridge.

use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::bridge::CommandBridge;
use crate::config::store::{ConfigStore, SettingsStore};
use crate::config::{validate_coefficient, PortBinding, Settings};
use crate::controller::{ControllerState, StabilizationController};
use crate::error::{AppResult, DaqError};
use crate::instrument::{InstrumentSet, InstrumentSlot};
use crate::params::{StabilizationParameters, TestParameters};
use crate::sequencer::{SequencerState, TestSequencer};
use crate::session::SessionTask;
use crate::telemetry::sink::{self, JsonLinesSink};
use crate::telemetry::{poller, PlotSample, TelemetryHub, TelemetrySnapshot};

/// Outcome of connecting one slot
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectOutcome {
    /// Slot that was connected
    pub slot: InstrumentSlot,
    /// Port it was bound to
    pub port: Option<String>,
    /// Error message if the connection failed
    pub error: Option<String>,
}

/// The running bench
pub struct HvApp {
    store: SettingsStore,
    bridge: CommandBridge,
    sequencer: TestSequencer,
    controller: StabilizationController,
    telemetry: Arc<TelemetryHub>,
    workers: Mutex<Vec<(&'static str, SessionTask)>>,
    bridge_task: Mutex<Option<JoinHandle<()>>>,
}

impl HvApp {
    /// Starts the bridge over `instruments`, applies configured coefficients and
    /// launches the telemetry workers.
    pub async fn start(store: SettingsStore, instruments: InstrumentSet) -> AppResult<Arc<Self>> {
        let settings = store.settings();
        settings.validate()?;

        let (bridge, bridge_task) = CommandBridge::spawn(instruments, &settings.bridge);
        for (slot, binding) in &settings.instruments {
            bridge.set_coefficient(*slot, binding.coefficient).await?;
        }

        let telemetry = Arc::new(TelemetryHub::new(bridge.clone(), settings.telemetry.clone()));
        let workers = Self::spawn_workers(&settings, &bridge, &telemetry).await;

        info!(
            name = %settings.application.name,
            bindings = settings.instruments.len(),
            workers = workers.len(),
            "Application started"
        );
        Ok(Arc::new(Self {
            sequencer: TestSequencer::new(bridge.clone(), settings.safety.safe_voltage),
            controller: StabilizationController::new(bridge.clone()),
            store,
            bridge,
            telemetry,
            workers: Mutex::new(workers),
            bridge_task: Mutex::new(Some(bridge_task)),
        }))
    }

    async fn spawn_workers(
        settings: &Settings,
        bridge: &CommandBridge,
        telemetry: &Arc<TelemetryHub>,
    ) -> Vec<(&'static str, SessionTask)> {
        let mut workers = Vec::new();

        let hub = Arc::clone(telemetry);
        workers.push(("telemetry", SessionTask::spawn(move |stop| hub.run(stop))));

        let poll = settings.telemetry.poll_interval;
        if !poll.is_zero() {
            let bridge = bridge.clone();
            workers.push((
                "poller",
                SessionTask::spawn(move |stop| poller::run(bridge, poll, stop)),
            ));
        }

        if let Some(journal) = &settings.telemetry.journal {
            match JsonLinesSink::open(&journal.path).await {
                Ok(journal_sink) => {
                    let frames = telemetry.subscribe();
                    let (batch_size, flush) = (journal.batch_size, journal.flush_interval);
                    workers.push((
                        "journal",
                        SessionTask::spawn(move |stop| {
                            sink::run_batching(Box::new(journal_sink), frames, batch_size, flush, stop)
                        }),
                    ));
                }
                Err(err) => {
                    error!(path = %journal.path.display(), error = %err, "Snapshot journal disabled");
                }
            }
        }
        workers
    }

    /// Command bridge shared by every component.
    pub fn bridge(&self) -> &CommandBridge {
        &self.bridge
    }

    /// Parameter store.
    pub fn store(&self) -> &SettingsStore {
        &self.store
    }

    /// Telemetry hub.
    pub fn telemetry(&self) -> &Arc<TelemetryHub> {
        &self.telemetry
    }

    /// Current snapshot of the bench.
    pub fn snapshot(&self) -> TelemetrySnapshot {
        self.telemetry.snapshot_now()
    }

    /// Chart history.
    pub fn plot(&self) -> Vec<PlotSample> {
        self.telemetry.history()
    }

    /// Clears the chart history.
    pub fn clear_plot(&self) {
        self.telemetry.clear_history();
    }

    // -- Instruments ---------------------------------------------------------

    /// Connects `slot` using its stored binding, or `port` when given (which is
    /// then stored as the new binding).
    pub async fn connect(&self, slot: InstrumentSlot, port: Option<String>) -> AppResult<()> {
        let binding = match (port, self.store.get_port_binding(slot)) {
            (Some(port), existing) => {
                let binding = PortBinding {
                    port,
                    ..existing.unwrap_or_else(|| PortBinding::new(""))
                };
                self.store.set_port_binding(slot, binding.clone())?;
                binding
            }
            (None, Some(binding)) => binding,
            (None, None) => {
                return Err(DaqError::ConfigInvalid(format!(
                    "no port configured for {}",
                    slot
                )))
            }
        };
        self.bridge.set_coefficient(slot, binding.coefficient).await?;
        self.bridge.connect(slot, binding.port).await
    }

    /// Connects every slot that has a binding; failures do not stop the others.
    pub async fn connect_all(&self) -> Vec<ConnectOutcome> {
        let mut outcomes = Vec::new();
        for slot in InstrumentSlot::ALL {
            let Some(binding) = self.store.get_port_binding(slot) else {
                continue;
            };
            let error = match self.connect(slot, None).await {
                Ok(()) => None,
                Err(err) => {
                    warn!(%slot, error = %err, "Connect failed");
                    Some(err.to_string())
                }
            };
            outcomes.push(ConnectOutcome {
                slot,
                port: Some(binding.port),
                error,
            });
        }
        outcomes
    }

    /// Disconnects `slot`.
    pub async fn disconnect(&self, slot: InstrumentSlot) -> AppResult<()> {
        self.bridge.disconnect(slot).await
    }

    /// Disconnects every connected slot.
    pub async fn disconnect_all(&self) -> AppResult<()> {
        let state = self.bridge.read();
        for handle in state.instruments.iter().filter(|h| h.is_connected()) {
            self.bridge.disconnect(handle.slot).await?;
        }
        Ok(())
    }

    /// Changes the coefficient of `slot` and stores it with the slot's binding.
    pub async fn set_coefficient(&self, slot: InstrumentSlot, coefficient: f64) -> AppResult<()> {
        validate_coefficient(coefficient)?;
        self.bridge.set_coefficient(slot, coefficient).await?;
        if let Some(binding) = self.store.get_port_binding(slot) {
            self.store.set_port_binding(
                slot,
                PortBinding {
                    coefficient,
                    ..binding
                },
            )?;
        }
        Ok(())
    }

    // -- Ramp tests ----------------------------------------------------------

    /// Stores `params` as the current ramp parameters.
    pub fn set_test_params(&self, params: TestParameters) -> AppResult<()> {
        self.store.set_test_params(params)
    }

    /// Runs one pass with the stored parameters, ignoring their cycle time.
    pub async fn start_test(&self) -> AppResult<()> {
        self.sequencer
            .start(self.store.get_test_params().single_pass())
            .await
    }

    /// Runs the stored parameters as a cyclic test.
    pub async fn start_cycle_test(&self) -> AppResult<()> {
        let params = self.store.get_test_params();
        if !params.is_cyclic() {
            return Err(DaqError::ConfigInvalid(
                "cycle_time must be > 0 for a cycle test".to_string(),
            ));
        }
        self.sequencer.start(params).await
    }

    /// Stops the ramp test.
    pub async fn stop_test(&self) -> AppResult<SequencerState> {
        self.sequencer.stop().await
    }

    /// Drives the HV output to the safe voltage.
    pub async fn reset_voltage(&self) -> AppResult<()> {
        self.sequencer.reset_voltage().await
    }

    // -- Stabilization -------------------------------------------------------

    /// Stores `params` as the current stabilization parameters.
    pub fn set_stabilization_params(&self, params: StabilizationParameters) -> AppResult<()> {
        self.store.set_stabilization_params(params)
    }

    /// Starts stabilization with the stored parameters.
    pub async fn start_stabilization(&self) -> AppResult<()> {
        self.controller
            .start(self.store.get_stabilization_params())
            .await
    }

    /// Stops stabilization.
    pub async fn stop_stabilization(&self) -> AppResult<ControllerState> {
        self.controller.stop().await
    }

    /// Stops sessions and workers, then disconnects everything and stops the bridge.
    pub async fn shutdown(&self) {
        info!("Shutting down");
        let sequencer = self.sequencer.state();
        if sequencer.is_active() {
            if let Err(err) = self.sequencer.stop().await {
                warn!(error = %err, "Ramp test did not stop cleanly");
            }
        }
        if self.controller.state().is_active() {
            if let Err(err) = self.controller.stop().await {
                warn!(error = %err, "Stabilization did not stop cleanly");
            }
        }

        let grace = self.bridge.command_timeout();
        let workers = std::mem::take(&mut *self.workers.lock().await);
        for (name, worker) in workers {
            if !worker.stop(grace).await {
                warn!(worker = name, "Worker aborted");
            }
        }

        if let Err(err) = self.bridge.shutdown().await {
            warn!(error = %err, "Command bridge did not shut down cleanly");
        }
        if let Some(task) = self.bridge_task.lock().await.take() {
            if let Err(err) = task.await {
                warn!(error = %err, "Command bridge task failed");
            }
        }
        info!("Shutdown complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::mock::SimulatedBench;

    fn settings() -> Settings {
        let mut settings = Settings::default();
        settings.telemetry.poll_interval = std::time::Duration::ZERO;
        settings
            .instruments
            .insert(InstrumentSlot::Cathode, PortBinding::new("COM3"));
        settings
    }

    #[tokio::test]
    async fn connect_uses_stored_binding_and_coefficient() {
        let mut settings = settings();
        if let Some(binding) = settings.instruments.get_mut(&InstrumentSlot::Cathode) {
            binding.coefficient = 2.0;
        }
        let bench = SimulatedBench::new();
        bench.cathode.set_value(1.5).await;
        let app = HvApp::start(SettingsStore::new(settings), bench.instruments())
            .await
            .unwrap();

        let outcomes = app.connect_all().await;
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].error, None);

        let reading = app.bridge().read_meter(InstrumentSlot::Cathode).await.unwrap();
        assert_eq!(reading.value, 3.0);
        app.shutdown().await;
    }

    #[tokio::test]
    async fn connect_without_binding_is_rejected() {
        let bench = SimulatedBench::new();
        let app = HvApp::start(SettingsStore::new(settings()), bench.instruments())
            .await
            .unwrap();
        let err = app.connect(InstrumentSlot::Gate, None).await.unwrap_err();
        assert!(matches!(err, DaqError::ConfigInvalid(_)));

        app.connect(InstrumentSlot::Gate, Some("COM5".into()))
            .await
            .unwrap();
        assert_eq!(
            app.store().get_port_binding(InstrumentSlot::Gate).unwrap().port,
            "COM5"
        );
        app.shutdown().await;
    }

    #[tokio::test]
    async fn cycle_test_requires_cycle_time() {
        let bench = SimulatedBench::new();
        let mut settings = settings();
        settings.test.cycle_time = 0.0;
        let app = HvApp::start(SettingsStore::new(settings), bench.instruments())
            .await
            .unwrap();
        let err = app.start_cycle_test().await.unwrap_err();
        assert!(matches!(err, DaqError::ConfigInvalid(_)));
        app.shutdown().await;
    }
}
