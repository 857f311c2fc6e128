//! Single-actor tracker service
//!
//! One tokio task owns the [`BatteryTracker`]. Periodic ticks, retry ticks
//! and administrative commands all pass through the same queue, so a tick
//! never overlaps another tick or a command. Snapshots are published on a
//! watch channel.

use crate::commands::Command;
use crate::error::TrackerError;
use crate::mapping::{EntityMapper, SensorSource};
use crate::persistence::PersistedTotals;
use crate::tracker::BatteryTracker;
use crate::types::Snapshot;
use chrono::Utc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

const QUEUE_CAPACITY: usize = 64;

#[derive(Debug)]
pub enum ServiceCommand {
    /// Run a tick now
    Tick,
    /// Scheduled re-run after unavailable sources; dropped once retries were reset
    RetryTick,
    Admin(Command, oneshot::Sender<Result<(), TrackerError>>),
    Persisted(oneshot::Sender<PersistedTotals>),
    Shutdown,
}

#[derive(Debug, Clone)]
pub struct TrackerHandle {
    tx: mpsc::Sender<ServiceCommand>,
    snapshots: watch::Receiver<Option<Snapshot>>,
}

impl TrackerHandle {
    /// Most recently published snapshot
    pub fn latest(&self) -> Option<Snapshot> {
        self.snapshots.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<Snapshot>> {
        self.snapshots.clone()
    }

    pub async fn tick_now(&self) -> Result<(), TrackerError> {
        self.send(ServiceCommand::Tick).await
    }

    /// Run an administrative command; on success a fresh snapshot is
    /// published before this returns
    pub async fn execute(&self, command: Command) -> Result<(), TrackerError> {
        let (reply, rx) = oneshot::channel();
        self.send(ServiceCommand::Admin(command, reply)).await?;
        rx.await.map_err(|_| TrackerError::ServiceStopped)?
    }

    pub async fn persisted(&self) -> Result<PersistedTotals, TrackerError> {
        let (reply, rx) = oneshot::channel();
        self.send(ServiceCommand::Persisted(reply)).await?;
        rx.await.map_err(|_| TrackerError::ServiceStopped)
    }

    pub async fn shutdown(&self) -> Result<(), TrackerError> {
        self.send(ServiceCommand::Shutdown).await
    }

    async fn send(&self, command: ServiceCommand) -> Result<(), TrackerError> {
        self.tx
            .send(command)
            .await
            .map_err(|_| TrackerError::ServiceStopped)
    }
}

/// Tick once, publish, and schedule a retry if sources were unavailable
fn run_tick(
    tracker: &mut BatteryTracker,
    source: &dyn SensorSource,
    mapper: &dyn EntityMapper,
    snapshot_tx: &watch::Sender<Option<Snapshot>>,
    retry_tx: &mpsc::WeakSender<ServiceCommand>,
    retry_delay: Duration,
) {
    let outcome = tracker.tick(Utc::now(), source, mapper);
    snapshot_tx.send_replace(Some(outcome.snapshot));

    if outcome.retry_requested {
        let retry_tx = retry_tx.clone();
        // Fire and forget; a later successful tick makes it a no-op
        tokio::spawn(async move {
            tokio::time::sleep(retry_delay).await;
            if let Some(tx) = retry_tx.upgrade() {
                let _ = tx.send(ServiceCommand::RetryTick).await;
            }
        });
    }
}

pub struct TrackerService;

impl TrackerService {
    /// Start the actor task.
    ///
    /// The task returns the tracker when it shuts down, so callers can
    /// persist its final state.
    pub fn spawn<S, M>(
        tracker: BatteryTracker,
        source: S,
        mapper: M,
    ) -> (TrackerHandle, JoinHandle<BatteryTracker>)
    where
        S: SensorSource + Send + 'static,
        M: EntityMapper + Send + 'static,
    {
        let (tx, mut rx) = mpsc::channel(QUEUE_CAPACITY);
        let (snapshot_tx, snapshot_rx) = watch::channel(None);
        let retry_tx = tx.downgrade();

        let task = tokio::spawn(async move {
            let mut tracker = tracker;
            let config = tracker.config().clone();
            let retry_delay = config.retry_delay();

            if !config.startup_delay().is_zero() {
                tracing::info!(delay_secs = config.startup_delay_secs, "delaying first tick");
                tokio::time::sleep(config.startup_delay()).await;
            }

            let mut ticker = tokio::time::interval(config.tick_interval());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => run_tick(&mut tracker, &source, &mapper, &snapshot_tx, &retry_tx, retry_delay),
                    cmd = rx.recv() => {
                        match cmd {
                            Some(ServiceCommand::Tick) => run_tick(&mut tracker, &source, &mapper, &snapshot_tx, &retry_tx, retry_delay),
                            Some(ServiceCommand::RetryTick) => {
                                if tracker.retry_count() > 0 {
                                    tracing::debug!(attempt = tracker.retry_count(), "running retry tick");
                                    run_tick(&mut tracker, &source, &mapper, &snapshot_tx, &retry_tx, retry_delay);
                                }
                            }
                            Some(ServiceCommand::Admin(command, reply)) => {
                                let name = command.name();
                                let result = tracker.execute(command, Utc::now());
                                match &result {
                                    Ok(()) => run_tick(&mut tracker, &source, &mapper, &snapshot_tx, &retry_tx, retry_delay),
                                    Err(err) => tracing::warn!(command = name, error = %err, "command rejected"),
                                }
                                let _ = reply.send(result);
                            }
                            Some(ServiceCommand::Persisted(reply)) => {
                                let _ = reply.send(tracker.persisted());
                            }
                            Some(ServiceCommand::Shutdown) | None => {
                                tracing::info!("tracker service stopping");
                                break;
                            }
                        }
                    }
                }
            }

            tracker
        });

        (
            TrackerHandle {
                tx,
                snapshots: snapshot_rx,
            },
            task,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TrackerConfig;
    use crate::mapping::{EntityMapping, StaticSource};
    use crate::types::{Reading, SignalKind};
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct SharedSource(Arc<Mutex<StaticSource>>);

    impl SensorSource for SharedSource {
        fn read(&self, handle: &str) -> Reading {
            self.0
                .lock()
                .map(|source| source.read(handle))
                .unwrap_or(Reading::Unavailable)
        }
    }

    fn mapping() -> EntityMapping {
        let mut mapping = EntityMapping::new();
        for signal in SignalKind::ALL {
            mapping.insert(1, signal, signal.as_str());
        }
        mapping
    }

    fn source(with_voltage: bool) -> SharedSource {
        let shared = SharedSource::default();
        {
            let mut source = shared.0.lock().unwrap();
            source.set("discharge_counter", Reading::Value(100.0));
            source.set("charge_counter", Reading::Value(100.0));
            source.set("current", Reading::Value(0.0));
            if with_voltage {
                source.set("voltage", Reading::Value(52.0));
            }
        }
        shared
    }

    fn config() -> TrackerConfig {
        TrackerConfig {
            battery_count: 1,
            tick_interval_secs: 3600,
            max_retries: 2,
            ..TrackerConfig::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_admin_command_publishes_snapshot() {
        let (handle, _task) =
            TrackerService::spawn(BatteryTracker::new(config()), source(true), mapping());

        handle.execute(Command::InitializeAll).await.unwrap();

        let snapshot = handle.latest().unwrap();
        assert!((snapshot.total_stored_energy_kwh - 2.56).abs() < 1e-9);
        assert_eq!(snapshot.retry_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_command_reports_error() {
        let (handle, _task) =
            TrackerService::spawn(BatteryTracker::new(config()), source(true), mapping());

        let result = handle
            .execute(Command::SetCapacity {
                battery: 1,
                capacity_kwh: 0.0,
            })
            .await;
        assert!(matches!(result, Err(TrackerError::Validation(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_until_persistent_unavailability() {
        let (handle, _task) =
            TrackerService::spawn(BatteryTracker::new(config()), source(false), mapping());
        let mut snapshots = handle.subscribe();

        let published = tokio::time::timeout(Duration::from_secs(600), async {
            let mut published = Vec::new();
            loop {
                if snapshots.changed().await.is_err() {
                    return published;
                }
                let snapshot = snapshots.borrow_and_update().clone();
                if let Some(snapshot) = snapshot {
                    let exhausted = snapshot.diagnostics.persistent_unavailability;
                    published.push(snapshot);
                    if exhausted {
                        return published;
                    }
                }
            }
        })
        .await
        .unwrap();

        let retry_counts: Vec<u32> = published.iter().map(|s| s.retry_count).collect();
        assert_eq!(retry_counts, vec![1, 2, 2]);
        // Only the tick that found no retry left reports persistence
        assert!(!published[1].diagnostics.persistent_unavailability);
        assert!(published[2].diagnostics.persistent_unavailability);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_retry_dropped_after_recovery() {
        let shared = source(false);
        let (handle, _task) =
            TrackerService::spawn(BatteryTracker::new(config()), shared.clone(), mapping());
        let mut snapshots = handle.subscribe();

        snapshots.changed().await.unwrap();
        let first = snapshots.borrow_and_update().clone().unwrap();
        assert_eq!(first.retry_count, 1);

        shared
            .0
            .lock()
            .unwrap()
            .set("voltage", Reading::Value(52.0));
        handle.tick_now().await.unwrap();
        snapshots.changed().await.unwrap();
        let recovered = snapshots.borrow_and_update().clone().unwrap();
        assert_eq!(recovered.retry_count, 0);

        // The retry scheduled by the first tick fires here and is ignored
        tokio::time::sleep(config().retry_delay() + Duration::from_secs(5)).await;
        assert!(!snapshots.has_changed().unwrap());
        assert_eq!(handle.latest().unwrap().computed_at, recovered.computed_at);
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_charge_state_survives_publish() {
        let (handle, _task) =
            TrackerService::spawn(BatteryTracker::new(config()), source(true), mapping());
        // Let the immediate first periodic tick run; the next one is an hour away
        let mut snapshots = handle.subscribe();
        snapshots.changed().await.unwrap();
        assert!(!snapshots.borrow_and_update().as_ref().unwrap().is_charging);

        handle
            .execute(Command::SetChargeState { is_charging: true })
            .await
            .unwrap();

        let snapshot = handle.latest().unwrap();
        assert!(snapshot.is_charging);
        assert!(snapshot.charge_start_time.is_some());
        assert_eq!(snapshot.last_charge_completed, None);
        assert_eq!(snapshot.last_charge_duration_hours, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_returns_tracker() {
        let (handle, task) =
            TrackerService::spawn(BatteryTracker::new(config()), source(true), mapping());

        handle
            .execute(Command::AdjustCounters {
                discharge_delta: Some(250.0),
                charge_delta: None,
            })
            .await
            .unwrap();
        let persisted = handle.persisted().await.unwrap();
        assert_eq!(persisted.total_discharge_counter, 250.0);

        handle.shutdown().await.unwrap();
        let tracker = task.await.unwrap();
        assert_eq!(tracker.totals().total_discharge_counter, 250.0);

        let result = handle.execute(Command::ResetCounters).await;
        assert!(matches!(result, Err(TrackerError::ServiceStopped)));
    }
}
