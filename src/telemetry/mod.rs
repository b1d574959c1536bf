//! Telemetry hub: periodic snapshots of the whole bench for observers.
//!
//! The hub never talks to hardware. On every tick it copies the command bridge's
//! published state, stamps it with a sequence number, derives a plot sample and
//! fans the resulting [`TelemetryFrame`] out to subscribers.
//!
//! Delivery follows the tap pattern: each subscriber owns a bounded queue and the
//! hub uses `try_send`. A subscriber that falls behind loses frames, never the hub's
//! time; a subscriber that went away is removed on the next send.

pub mod poller;
pub mod sink;

use chrono::{DateTime, Utc};
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::task::{Context, Poll};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info};

use crate::bridge::{BridgeState, CommandBridge, SessionKind};
use crate::config::TelemetryConfig;
use crate::controller::ControllerState;
use crate::instrument::{InstrumentHandle, InstrumentSlot, OutputChannel};
use crate::sequencer::SequencerState;
use crate::session::StopSignal;

/// Consistent copy of the bench at one instant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySnapshot {
    /// Strictly increasing per hub
    pub sequence: u64,
    /// When the snapshot was taken
    pub timestamp: DateTime<Utc>,
    /// Instrument handles in slot order
    pub instruments: Vec<InstrumentHandle>,
    /// Sequencer state
    pub sequencer: SequencerState,
    /// Controller state
    pub controller: ControllerState,
    /// Output reservations
    pub claims: BTreeMap<OutputChannel, SessionKind>,
}

impl TelemetrySnapshot {
    fn from_state(sequence: u64, state: BridgeState) -> Self {
        Self {
            sequence,
            timestamp: Utc::now(),
            instruments: state.instruments,
            sequencer: state.sequencer,
            controller: state.controller,
            claims: state.claims,
        }
    }

    /// Handle of `slot`.
    pub fn instrument(&self, slot: InstrumentSlot) -> Option<&InstrumentHandle> {
        self.instruments.iter().find(|h| h.slot == slot)
    }

    fn value(&self, slot: InstrumentSlot) -> Option<f64> {
        self.instrument(slot).and_then(InstrumentHandle::value)
    }
}

/// One point of the live chart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlotSample {
    /// Snapshot sequence the sample was taken from
    pub sequence: u64,
    /// Sample time
    pub timestamp: DateTime<Utc>,
    /// Cathode current
    pub cathode: Option<f64>,
    /// Gate current
    pub gate: Option<f64>,
    /// Anode current
    pub anode: Option<f64>,
    /// Backup current
    pub backup: Option<f64>,
    /// HV source readback, or its setpoint before the first readback
    pub hv_voltage: Option<f64>,
    /// Source-meter voltage readback, or its setpoint
    pub source_meter_voltage: Option<f64>,
    /// Vacuum pressure
    pub vacuum: Option<f64>,
    /// Gate + anode + backup
    pub leakage_sum: Option<f64>,
    /// Anode / cathode × 100
    pub anode_ratio: Option<f64>,
}

impl PlotSample {
    /// Derives the chart point for `snapshot`.
    pub fn from_snapshot(snapshot: &TelemetrySnapshot) -> Self {
        let cathode = snapshot.value(InstrumentSlot::Cathode);
        let gate = snapshot.value(InstrumentSlot::Gate);
        let anode = snapshot.value(InstrumentSlot::Anode);
        let backup = snapshot.value(InstrumentSlot::Backup);
        let output = |slot| {
            snapshot
                .instrument(slot)
                .and_then(|h| h.value().or(h.setpoint))
        };

        let leakage_sum = if gate.is_some() || anode.is_some() || backup.is_some() {
            Some(gate.unwrap_or(0.0) + anode.unwrap_or(0.0) + backup.unwrap_or(0.0))
        } else {
            None
        };
        let anode_ratio = match (anode, cathode) {
            (Some(anode), Some(cathode)) if cathode != 0.0 => Some(anode / cathode * 100.0),
            _ => None,
        };

        Self {
            sequence: snapshot.sequence,
            timestamp: snapshot.timestamp,
            cathode,
            gate,
            anode,
            backup,
            hv_voltage: output(InstrumentSlot::HvSource),
            source_meter_voltage: output(InstrumentSlot::SourceMeter),
            vacuum: snapshot.value(InstrumentSlot::VacuumGauge),
            leakage_sum,
            anode_ratio,
        }
    }
}

/// What subscribers receive every period.
#[derive(Debug, Clone, Serialize)]
pub struct TelemetryFrame {
    /// Current snapshot
    pub snapshot: Arc<TelemetrySnapshot>,
    /// Most recent plot samples, oldest first
    pub history: Arc<[PlotSample]>,
}

/// Hub counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TelemetryStats {
    /// Frames built
    pub frames_published: u64,
    /// Deliveries skipped because a subscriber queue was full
    pub frames_dropped: u64,
    /// Live subscribers
    pub subscribers: usize,
    /// Plot samples retained
    pub history_len: usize,
}

struct Subscriber {
    id: u64,
    sender: mpsc::Sender<TelemetryFrame>,
}

type SubscriberList = Mutex<Vec<Subscriber>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Stream of frames for one subscriber. Dropping it unsubscribes.
pub struct Subscription {
    id: u64,
    frames: ReceiverStream<TelemetryFrame>,
    subscribers: Weak<SubscriberList>,
}

impl Subscription {
    /// Subscriber id, unique per hub.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Removes this subscriber from the hub.
    pub fn unsubscribe(self) {}
}

impl Stream for Subscription {
    type Item = TelemetryFrame;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.frames).poll_next(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(subscribers) = self.subscribers.upgrade() {
            lock(&subscribers).retain(|s| s.id != self.id);
            debug!(id = self.id, "Telemetry subscriber removed");
        }
    }
}

/// Builds snapshots and distributes them
pub struct TelemetryHub {
    bridge: CommandBridge,
    config: TelemetryConfig,
    sequence: Mutex<u64>,
    next_subscriber: AtomicU64,
    history: Mutex<VecDeque<PlotSample>>,
    subscribers: Arc<SubscriberList>,
    frames_published: AtomicU64,
    frames_dropped: AtomicU64,
}

impl TelemetryHub {
    /// Creates a hub reading from `bridge`.
    pub fn new(bridge: CommandBridge, config: TelemetryConfig) -> Self {
        Self {
            bridge,
            history: Mutex::new(VecDeque::with_capacity(config.history_capacity)),
            config,
            sequence: Mutex::new(0),
            next_subscriber: AtomicU64::new(0),
            subscribers: Arc::new(Mutex::new(Vec::new())),
            frames_published: AtomicU64::new(0),
            frames_dropped: AtomicU64::new(0),
        }
    }

    /// Adds a subscriber; frames arrive from the next tick on.
    pub fn subscribe(&self) -> Subscription {
        let id = self.next_subscriber.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::channel(self.config.subscriber_capacity.max(1));
        lock(&self.subscribers).push(Subscriber { id, sender });
        debug!(id, "Telemetry subscriber added");
        Subscription {
            id,
            frames: ReceiverStream::new(receiver),
            subscribers: Arc::downgrade(&self.subscribers),
        }
    }

    /// A fresh snapshot of the bridge's published state.
    ///
    /// The state is copied while the sequence counter is held, so a higher
    /// sequence never carries older state.
    pub fn snapshot_now(&self) -> TelemetrySnapshot {
        let mut sequence = lock(&self.sequence);
        let state = self.bridge.read();
        *sequence += 1;
        TelemetrySnapshot::from_state(*sequence, state)
    }

    /// Retained plot samples, oldest first.
    pub fn history(&self) -> Vec<PlotSample> {
        lock(&self.history).iter().cloned().collect()
    }

    /// Empties the chart history.
    pub fn clear_history(&self) {
        lock(&self.history).clear();
        info!("Telemetry history cleared");
    }

    /// Counters for diagnostics.
    pub fn stats(&self) -> TelemetryStats {
        TelemetryStats {
            frames_published: self.frames_published.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            subscribers: lock(&self.subscribers).len(),
            history_len: lock(&self.history).len(),
        }
    }

    /// Takes one snapshot, records its plot sample and delivers the frame.
    pub fn tick(&self) -> TelemetryFrame {
        let snapshot = Arc::new(self.snapshot_now());
        let sample = PlotSample::from_snapshot(&snapshot);

        let history: Arc<[PlotSample]> = {
            let mut history = lock(&self.history);
            history.push_back(sample);
            while history.len() > self.config.history_capacity {
                history.pop_front();
            }
            let skip = history.len().saturating_sub(self.config.frame_history);
            history.iter().skip(skip).cloned().collect()
        };

        let frame = TelemetryFrame { snapshot, history };
        self.deliver(&frame);
        self.frames_published.fetch_add(1, Ordering::Relaxed);
        frame
    }

    fn deliver(&self, frame: &TelemetryFrame) {
        let mut subscribers = lock(&self.subscribers);
        subscribers.retain(|subscriber| match subscriber.sender.try_send(frame.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.frames_dropped.fetch_add(1, Ordering::Relaxed);
                debug!(id = subscriber.id, "Dropped telemetry frame for slow subscriber");
                true
            }
            Err(TrySendError::Closed(_)) => {
                debug!(id = subscriber.id, "Telemetry subscriber closed");
                false
            }
        });
    }

    /// Ticks every configured period until stopped.
    pub async fn run(self: Arc<Self>, mut stop: StopSignal) {
        info!(period = ?self.config.period, "Telemetry hub started");
        loop {
            if stop.sleep(self.config.period).await {
                break;
            }
            self.tick();
        }
        info!(frames = self.frames_published.load(Ordering::Relaxed), "Telemetry hub stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BridgeConfig;
    use crate::instrument::mock::SimulatedBench;
    use futures::StreamExt;
    use tracing_test::traced_test;

    fn hub(history_capacity: usize, subscriber_capacity: usize) -> (TelemetryHub, SimulatedBench) {
        let bench = SimulatedBench::new();
        let (bridge, _task) = CommandBridge::spawn(bench.instruments(), &BridgeConfig::default());
        let config = TelemetryConfig {
            history_capacity,
            frame_history: 2,
            subscriber_capacity,
            ..TelemetryConfig::default()
        };
        (TelemetryHub::new(bridge, config), bench)
    }

    #[tokio::test]
    async fn history_is_bounded_and_frames_carry_the_tail() {
        let (hub, _bench) = hub(5, 4);
        let mut last = None;
        for _ in 0..12 {
            last = Some(hub.tick());
        }
        assert_eq!(hub.history().len(), 5);

        let frame = last.unwrap();
        assert_eq!(frame.history.len(), 2);
        assert_eq!(frame.snapshot.sequence, 12);
        assert_eq!(frame.history[1].sequence, 12);

        hub.clear_history();
        assert!(hub.history().is_empty());
    }

    #[tokio::test]
    #[traced_test]
    async fn slow_subscriber_loses_frames_without_blocking_others() {
        let (hub, _bench) = hub(100, 2);
        let _stalled = hub.subscribe();
        let mut live = hub.subscribe();

        for _ in 0..5 {
            hub.tick();
            let frame = live.next().await.unwrap();
            assert!(frame.snapshot.sequence > 0);
        }

        let stats = hub.stats();
        assert_eq!(stats.frames_published, 5);
        assert_eq!(stats.frames_dropped, 3);
        assert_eq!(stats.subscribers, 2);
        assert!(logs_contain("Dropped telemetry frame for slow subscriber"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn sequence_order_matches_state_order() {
        let (hub, _bench) = hub(10, 2);
        let hub = Arc::new(hub);
        hub.bridge
            .connect(InstrumentSlot::HvSource, "COM1")
            .await
            .unwrap();

        let readers: Vec<_> = (0..3)
            .map(|_| {
                let hub = Arc::clone(&hub);
                tokio::task::spawn_blocking(move || {
                    (0..200)
                        .map(|_| {
                            let snapshot = hub.snapshot_now();
                            let setpoint = snapshot
                                .instrument(InstrumentSlot::HvSource)
                                .and_then(|h| h.setpoint);
                            (snapshot.sequence, setpoint)
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        for volts in 1..=50 {
            hub.bridge
                .set_voltage(OutputChannel::HvSource, f64::from(volts))
                .await
                .unwrap();
        }

        let mut seen = Vec::new();
        for reader in readers {
            seen.extend(reader.await.unwrap());
        }
        seen.sort_by_key(|(sequence, _)| *sequence);
        assert_eq!(seen.len(), 600);
        assert!(seen.windows(2).all(|w| w[0].0 < w[1].0));
        assert!(seen.windows(2).all(|w| w[0].1 <= w[1].1));
    }

    #[tokio::test]
    async fn dropped_subscription_is_removed() {
        let (hub, _bench) = hub(10, 2);
        let first = hub.subscribe();
        let second = hub.subscribe();
        assert_ne!(first.id(), second.id());
        first.unsubscribe();
        assert_eq!(hub.stats().subscribers, 1);
        drop(second);
        assert_eq!(hub.stats().subscribers, 0);
    }

    #[test]
    fn plot_sample_derives_sum_and_ratio() {
        let mut state = BridgeState::initial();
        for handle in &mut state.instruments {
            let value = match handle.slot {
                InstrumentSlot::Cathode => 2.0,
                InstrumentSlot::Gate => 0.25,
                InstrumentSlot::Anode => 1.5,
                InstrumentSlot::Backup => 0.25,
                _ => continue,
            };
            handle.last_reading = Some(crate::instrument::Reading::new(value, "uA"));
        }
        let snapshot = TelemetrySnapshot::from_state(1, state);
        let sample = PlotSample::from_snapshot(&snapshot);
        assert_eq!(sample.leakage_sum, Some(2.0));
        assert_eq!(sample.anode_ratio, Some(75.0));
        assert_eq!(sample.hv_voltage, None);
    }
}
