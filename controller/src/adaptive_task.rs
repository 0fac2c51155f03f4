//! Periodic task and shared handle around the adaptive engine.
//!
//! Readers never wait long on the engine lock: `setpoint` falls back to
//! the last value the task published, sensor notifications are dropped
//! with a warning, and blob I/O runs on the blocking pool with the lock
//! released.

use std::{
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc,
    },
    time::Duration,
};

use hearth_common::{
    adaptive::PresenceTransition, AdaptiveEngine, AdaptiveInputs, AdaptiveTick, BlobStore,
    ControlLimits, PendingBlob, StoreError,
};
use thiserror::Error;
use tokio::{
    sync::{watch, Mutex},
    task::JoinHandle,
    time::{timeout, MissedTickBehavior},
};
use tracing::{debug, info, warn};

use crate::blob_store::with_store;

const TICK_PERIOD: Duration = Duration::from_secs(1);
const TICK_LOCK_TIMEOUT: Duration = Duration::from_millis(50);
const NOTIFY_LOCK_TIMEOUT: Duration = Duration::from_millis(50);
const READ_LOCK_TIMEOUT: Duration = Duration::from_millis(20);
const WRITE_LOCK_TIMEOUT: Duration = Duration::from_millis(200);
const SHUTDOWN_LOCK_TIMEOUT: Duration = Duration::from_secs(2);
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(100);
const STOP_POLL_ATTEMPTS: u32 = 20;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AdaptiveError {
    #[error("heat rate must be a positive number of degrees per hour")]
    InvalidHeatRate,
    #[error("adaptive engine busy")]
    Busy,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub written: usize,
    pub failed: usize,
}

/// Snapshot for the status endpoint. Fields other than the setpoint are
/// `None` when the engine was busy.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdaptiveStatus {
    pub setpoint: f32,
    pub heat_rate: Option<f32>,
    pub presence_valid: Option<bool>,
    pub preheat: Option<bool>,
    pub absence_timeout_minutes: Option<u32>,
}

#[derive(Clone)]
pub struct AdaptiveService {
    engine: Arc<Mutex<AdaptiveEngine>>,
    store: Arc<dyn BlobStore>,
    limits: Arc<watch::Sender<ControlLimits>>,
    last_setpoint: Arc<AtomicU32>,
    stop: Arc<AtomicBool>,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl AdaptiveService {
    /// Loads the persisted model and spawns the 1 s engine task.
    pub async fn start(store: Arc<dyn BlobStore>, limits: ControlLimits) -> Self {
        let (engine, failures) =
            match with_store(&store, move |store| AdaptiveEngine::load(store, &limits)).await {
                Ok(loaded) => loaded,
                Err(err) => {
                    warn!("adaptive model load failed ({err}), starting from defaults");
                    (AdaptiveEngine::new(&limits), Vec::new())
                }
            };
        for (blob, err) in failures {
            if err.is_not_found() {
                info!("adaptive {} not stored yet, using default", blob.key());
            } else {
                warn!("failed to load adaptive {}: {err}", blob.key());
            }
        }
        info!(
            "adaptive engine loaded: setpoint {:.2}C, heat rate {:.2}C/h",
            engine.setpoint(),
            engine.heat_rate()
        );

        let last_setpoint = Arc::new(AtomicU32::new(engine.setpoint().to_bits()));
        let engine = Arc::new(Mutex::new(engine));
        let stop = Arc::new(AtomicBool::new(false));
        let (limits_tx, limits_rx) = watch::channel(limits);

        let handle = tokio::spawn(run_engine_loop(
            engine.clone(),
            store.clone(),
            limits_rx,
            last_setpoint.clone(),
            stop.clone(),
        ));

        Self {
            engine,
            store,
            limits: Arc::new(limits_tx),
            last_setpoint,
            stop,
            task: Arc::new(Mutex::new(Some(handle))),
        }
    }

    /// Limits used from the next engine tick on.
    pub fn set_limits(&self, limits: ControlLimits) {
        self.limits.send_replace(limits);
    }

    /// Returns `false` when the engine was busy and the readings were dropped.
    pub async fn notify_sensor(&self, inputs: AdaptiveInputs) -> bool {
        match timeout(NOTIFY_LOCK_TIMEOUT, self.engine.lock()).await {
            Ok(mut engine) => {
                engine.notify_sensor(inputs);
                true
            }
            Err(_) => {
                warn!("adaptive engine busy, sensor update dropped");
                false
            }
        }
    }

    pub async fn setpoint(&self) -> f32 {
        match timeout(READ_LOCK_TIMEOUT, self.engine.lock()).await {
            Ok(engine) => {
                let setpoint = engine.setpoint();
                self.last_setpoint
                    .store(setpoint.to_bits(), Ordering::Relaxed);
                setpoint
            }
            Err(_) => f32::from_bits(self.last_setpoint.load(Ordering::Relaxed)),
        }
    }

    pub async fn status(&self) -> AdaptiveStatus {
        match timeout(READ_LOCK_TIMEOUT, self.engine.lock()).await {
            Ok(engine) => {
                let setpoint = engine.setpoint();
                self.last_setpoint
                    .store(setpoint.to_bits(), Ordering::Relaxed);
                AdaptiveStatus {
                    setpoint,
                    heat_rate: Some(engine.heat_rate()),
                    presence_valid: Some(engine.presence_valid()),
                    preheat: Some(engine.preheat_active()),
                    absence_timeout_minutes: Some(engine.absence_timeout_minutes()),
                }
            }
            Err(_) => AdaptiveStatus {
                setpoint: f32::from_bits(self.last_setpoint.load(Ordering::Relaxed)),
                heat_rate: None,
                presence_valid: None,
                preheat: None,
                absence_timeout_minutes: None,
            },
        }
    }

    pub async fn set_heat_rate(&self, degrees_per_hour: f32) -> Result<(), AdaptiveError> {
        if !degrees_per_hour.is_finite() || degrees_per_hour <= 0.0 {
            return Err(AdaptiveError::InvalidHeatRate);
        }
        let mut engine = timeout(WRITE_LOCK_TIMEOUT, self.engine.lock())
            .await
            .map_err(|_| AdaptiveError::Busy)?;
        if engine.set_heat_rate(degrees_per_hour) {
            Ok(())
        } else {
            Err(AdaptiveError::InvalidHeatRate)
        }
    }

    /// Stops the task and writes every blob. Returns `None` when the
    /// engine lock could not be taken and the flush was skipped.
    pub async fn deinit(&self) -> Option<FlushReport> {
        self.stop.store(true, Ordering::Release);

        if let Some(handle) = self.task.lock().await.take() {
            for _ in 0..STOP_POLL_ATTEMPTS {
                if handle.is_finished() {
                    break;
                }
                tokio::time::sleep(STOP_POLL_INTERVAL).await;
            }
            if !handle.is_finished() {
                warn!("adaptive task did not stop in time, aborting it");
                handle.abort();
            }
        }

        let report = flush(&self.engine, &self.store, true, SHUTDOWN_LOCK_TIMEOUT).await;
        match report {
            Some(report) => info!(
                "adaptive model flushed on shutdown: {} written, {} failed",
                report.written, report.failed
            ),
            None => warn!("adaptive engine busy, shutdown flush skipped"),
        }
        report
    }
}

async fn run_engine_loop(
    engine: Arc<Mutex<AdaptiveEngine>>,
    store: Arc<dyn BlobStore>,
    limits: watch::Receiver<ControlLimits>,
    last_setpoint: Arc<AtomicU32>,
    stop: Arc<AtomicBool>,
) {
    let mut interval = tokio::time::interval(TICK_PERIOD);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    while !stop.load(Ordering::Acquire) {
        interval.tick().await;
        if stop.load(Ordering::Acquire) {
            break;
        }

        let current_limits = *limits.borrow();
        let report = match timeout(TICK_LOCK_TIMEOUT, engine.lock()).await {
            Ok(mut engine) => engine.tick(&current_limits),
            Err(_) => {
                debug!("adaptive tick skipped, engine busy");
                continue;
            }
        };

        last_setpoint.store(report.setpoint.to_bits(), Ordering::Relaxed);
        log_tick(&report);

        if report.flush_due {
            match flush(&engine, &store, false, TICK_LOCK_TIMEOUT).await {
                Some(flushed) => debug!(
                    "adaptive model saved: {} written, {} failed",
                    flushed.written, flushed.failed
                ),
                None => debug!("adaptive save postponed, engine busy"),
            }
        }
    }

    debug!("adaptive task stopped");
}

/// Snapshots pending blobs under the lock, writes them on the blocking
/// pool with the lock released, then clears the flags of the blobs that
/// did not change.
async fn flush(
    engine: &Mutex<AdaptiveEngine>,
    store: &Arc<dyn BlobStore>,
    force: bool,
    lock_timeout: Duration,
) -> Option<FlushReport> {
    let pending = timeout(lock_timeout, engine.lock())
        .await
        .ok()?
        .pending_writes(force);
    if pending.is_empty() {
        return Some(FlushReport::default());
    }

    let count = pending.len();
    let results = match with_store(store, move |store| write_all(pending, store)).await {
        Ok(results) => results,
        Err(err) => {
            warn!("adaptive save aborted: {err}");
            return Some(FlushReport {
                written: 0,
                failed: count,
            });
        }
    };

    let mut report = FlushReport::default();
    let mut persisted = Vec::with_capacity(results.len());
    for (blob, result) in results {
        match result {
            Ok(()) => {
                report.written += 1;
                persisted.push(blob);
            }
            Err(err) => {
                report.failed += 1;
                warn!("failed to persist adaptive {}: {err}", blob.blob.key());
            }
        }
    }

    if !persisted.is_empty() {
        match timeout(lock_timeout, engine.lock()).await {
            Ok(mut engine) => {
                for blob in &persisted {
                    if !engine.mark_persisted(blob) {
                        debug!("adaptive {} changed while saving", blob.blob.key());
                    }
                }
            }
            Err(_) => debug!("engine busy after save, blobs stay dirty"),
        }
    }

    Some(report)
}

fn write_all(
    pending: Vec<PendingBlob>,
    store: &dyn BlobStore,
) -> Vec<(PendingBlob, Result<(), StoreError>)> {
    pending
        .into_iter()
        .map(|blob| {
            let result = blob.write(store);
            (blob, result)
        })
        .collect()
}

fn log_tick(report: &AdaptiveTick) {
    match report.presence {
        Some(PresenceTransition::Validated) => info!("presence validated"),
        Some(PresenceTransition::Expired {
            stay_s,
            timeout_minutes,
        }) => info!("presence expired after {stay_s}s, absence timeout {timeout_minutes} min"),
        None => {}
    }

    if let Some(active) = report.preheat {
        if active {
            info!("preheat started, target {:.2}C", report.target);
        } else {
            info!("preheat stopped");
        }
    }

    if let Some(step) = report.learned {
        debug!("bias {:?} {:02}h -> {:.3}", step.day, step.hour, step.bias);
    }
}
