//! Snapshot sinks: read-only consumers fed in batches.
//!
//! A sink never writes back into the bench. The batching worker subscribes to the
//! hub like any other observer, so a slow sink loses frames instead of delaying
//! the hub.

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{info, warn};

use super::{Subscription, TelemetrySnapshot};
use crate::session::StopSignal;

/// Consumer of snapshot batches
#[async_trait]
pub trait SnapshotSink: Send {
    /// Short name for logs.
    fn name(&self) -> &str;

    /// Receives snapshots in sequence order.
    async fn write_batch(&mut self, batch: &[Arc<TelemetrySnapshot>]) -> Result<()>;

    /// Called once before the worker exits.
    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Appends each snapshot as one JSON line.
pub struct JsonLinesSink {
    path: PathBuf,
    file: File,
}

impl JsonLinesSink {
    /// Opens `path` for appending, creating it and its directory if needed.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .with_context(|| format!("opening journal {}", path.display()))?;
        Ok(Self { path, file })
    }

    /// Journal file path.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl SnapshotSink for JsonLinesSink {
    fn name(&self) -> &str {
        "json_lines"
    }

    async fn write_batch(&mut self, batch: &[Arc<TelemetrySnapshot>]) -> Result<()> {
        let mut buffer = Vec::with_capacity(batch.len() * 512);
        for snapshot in batch {
            serde_json::to_writer(&mut buffer, snapshot.as_ref())?;
            buffer.push(b'\n');
        }
        self.file.write_all(&buffer).await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.file.flush().await?;
        self.file.sync_all().await?;
        Ok(())
    }
}

/// Feeds `sink` from `frames` until stopped or the hub goes away.
///
/// A batch is written when it reaches `batch_size` or when `flush_interval` passes,
/// whichever comes first. Write failures are logged and the batch is dropped.
pub async fn run_batching(
    mut sink: Box<dyn SnapshotSink>,
    mut frames: Subscription,
    batch_size: usize,
    flush_interval: Duration,
    mut stop: StopSignal,
) {
    let batch_size = batch_size.max(1);
    let mut batch: Vec<Arc<TelemetrySnapshot>> = Vec::with_capacity(batch_size);
    let mut flush = interval(flush_interval);
    flush.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!(sink = sink.name(), batch_size, ?flush_interval, "Snapshot sink started");

    loop {
        tokio::select! {
            frame = frames.next() => match frame {
                Some(frame) => {
                    batch.push(frame.snapshot);
                    if batch.len() >= batch_size {
                        write(sink.as_mut(), &mut batch).await;
                    }
                }
                None => break,
            },
            _ = flush.tick() => write(sink.as_mut(), &mut batch).await,
            _ = stop.stopped() => break,
        }
    }

    write(sink.as_mut(), &mut batch).await;
    if let Err(err) = sink.close().await {
        warn!(sink = sink.name(), error = %err, "Snapshot sink close failed");
    }
    info!(sink = sink.name(), "Snapshot sink stopped");
}

async fn write(sink: &mut dyn SnapshotSink, batch: &mut Vec<Arc<TelemetrySnapshot>>) {
    if batch.is_empty() {
        return;
    }
    if let Err(err) = sink.write_batch(batch).await {
        warn!(sink = sink.name(), error = %err, dropped = batch.len(), "Snapshot batch write failed");
    }
    batch.clear();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::CommandBridge;
    use crate::config::{BridgeConfig, TelemetryConfig};
    use crate::instrument::mock::SimulatedBench;
    use crate::session::SessionTask;
    use crate::telemetry::TelemetryHub;
    use std::sync::Mutex;

    #[derive(Clone, Default)]
    struct Recorder {
        batches: Arc<Mutex<Vec<Vec<u64>>>>,
    }

    #[async_trait]
    impl SnapshotSink for Recorder {
        fn name(&self) -> &str {
            "recorder"
        }

        async fn write_batch(&mut self, batch: &[Arc<TelemetrySnapshot>]) -> Result<()> {
            self.batches
                .lock()
                .unwrap()
                .push(batch.iter().map(|s| s.sequence).collect());
            Ok(())
        }
    }

    fn hub() -> TelemetryHub {
        let bench = SimulatedBench::new();
        let (bridge, _task) = CommandBridge::spawn(bench.instruments(), &BridgeConfig::default());
        TelemetryHub::new(bridge, TelemetryConfig::default())
    }

    #[tokio::test(start_paused = true)]
    async fn batches_by_size_then_flushes_remainder_on_stop() {
        let hub = hub();
        let recorder = Recorder::default();
        let frames = hub.subscribe();
        let sink: Box<dyn SnapshotSink> = Box::new(recorder.clone());
        let worker = SessionTask::spawn(move |stop| {
            run_batching(sink, frames, 3, Duration::from_secs(3600), stop)
        });
        // Let the first interval tick (immediate) pass on an empty batch.
        tokio::time::sleep(Duration::from_millis(1)).await;

        for _ in 0..4 {
            hub.tick();
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(worker.stop(Duration::from_secs(1)).await);

        let batches = recorder.batches.lock().unwrap().clone();
        assert_eq!(batches, vec![vec![1, 2, 3], vec![4]]);
    }

    #[tokio::test]
    async fn json_lines_sink_appends_one_line_per_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("journal").join("snapshots.jsonl");
        let hub = hub();
        let batch = vec![Arc::new(hub.snapshot_now()), Arc::new(hub.snapshot_now())];

        let mut sink = JsonLinesSink::open(&path).await.unwrap();
        sink.write_batch(&batch).await.unwrap();
        sink.close().await.unwrap();

        let text = tokio::fs::read_to_string(&path).await.unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        let second: TelemetrySnapshot = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second.sequence, 2);
    }
}
