//! Measurement aggregation
//!
//! Measures with a non-zero interval are not published per sample. Samples
//! are queued per `(measure, entity)` key and a single background flush loop
//! publishes one record per key and interval: the bare value when only one
//! sample arrived, otherwise a window of count, mean, min, max and duration.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::constants::channel;
use crate::error::RtiResult;
use crate::proto::{Measure, Measurement, measurement};

/// Intervals at or below this are published immediately
pub const IMMEDIATE_INTERVAL: f64 = 1e-5;

/// Destination for flushed measurements
pub trait MeasurementSink: Send + Sync {
    fn is_connected(&self) -> bool;
    fn publish_measurement(&self, channel: &str, measurement: &Measurement) -> RtiResult<()>;
}

type Key = (String, Option<String>);

#[derive(Default)]
struct Queue {
    values: HashMap<Key, Vec<f64>>,
    last_flush: HashMap<Key, Instant>,
    definitions: HashMap<String, Measure>,
}

/// Shared queue plus the flush loop that drains it
pub struct MeasurementAggregator {
    client_id: String,
    tick: Duration,
    time_scale: RwLock<f64>,
    queue: Mutex<Queue>,
    started: AtomicBool,
    shutdown: CancellationToken,
}

/// True when `measure` is published per sample instead of aggregated
pub fn is_immediate(measure: &Measure) -> bool {
    measure.interval <= IMMEDIATE_INTERVAL
}

/// Channel a measure's records are published on
pub fn target_channel(measure: &Measure) -> &str {
    if measure.channel.is_empty() {
        channel::MEASUREMENT
    } else {
        &measure.channel
    }
}

/// Scalar record for one sample
pub fn scalar(measure_id: &str, client_id: &str, entity_id: Option<&str>, value: f64) -> Measurement {
    Measurement {
        measure_id: measure_id.to_string(),
        client_id: client_id.to_string(),
        entity_id: entity_id.unwrap_or_default().to_string(),
        value,
        window: None,
    }
}

/// Reduce several samples to a window
pub fn window(values: &[f64], duration: f64) -> measurement::Window {
    let count = values.len();
    let (min, max, sum) = values.iter().fold(
        (f64::INFINITY, f64::NEG_INFINITY, 0.0),
        |(min, max, sum), &v| (min.min(v), max.max(v), sum + v),
    );
    measurement::Window {
        count: count as i32,
        mean: if count > 0 { sum / count as f64 } else { 0.0 },
        min,
        max,
        duration,
    }
}

impl MeasurementAggregator {
    pub fn new(client_id: impl Into<String>, tick: Duration, time_scale: f64) -> Self {
        let client_id = client_id.into();
        debug!(%client_id, ?tick, time_scale, "MeasurementAggregator::new: called");
        Self {
            client_id,
            tick,
            time_scale: RwLock::new(time_scale),
            queue: Mutex::new(Queue::default()),
            started: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn time_scale(&self) -> f64 {
        *self.time_scale.read()
    }

    /// Factor applied to elapsed time before comparing it with an interval
    pub fn set_time_scale(&self, time_scale: f64) {
        *self.time_scale.write() = time_scale;
    }

    /// Queue one sample under `(measure.id, entity_id)`
    pub fn enqueue(&self, measure: &Measure, value: f64, entity_id: Option<&str>) {
        let mut queue = self.queue.lock();
        queue.definitions.insert(measure.id.clone(), measure.clone());
        queue
            .values
            .entry((measure.id.clone(), entity_id.map(str::to_string)))
            .or_default()
            .push(value);
    }

    /// Drain every key whose scaled elapsed time exceeds its measure's interval
    ///
    /// The first time a key is seen only its baseline is recorded.
    pub fn collect(&self, now: Instant) -> Vec<(String, Measurement)> {
        let scale = self.time_scale();
        let mut due = Vec::new();
        let mut queue = self.queue.lock();
        let Queue {
            values,
            last_flush,
            definitions,
        } = &mut *queue;

        for (key, samples) in values.iter_mut() {
            let Some(previous) = last_flush.get(key).copied() else {
                last_flush.insert(key.clone(), now);
                continue;
            };
            let Some(measure) = definitions.get(&key.0) else {
                continue;
            };
            let elapsed = now.saturating_duration_since(previous).as_secs_f64() * scale;
            if elapsed <= measure.interval {
                continue;
            }
            let entity_id = key.1.as_deref();
            match samples.len() {
                0 => {}
                1 => due.push((
                    target_channel(measure).to_string(),
                    scalar(&measure.id, &self.client_id, entity_id, samples[0]),
                )),
                _ => {
                    let mut record = scalar(&measure.id, &self.client_id, entity_id, 0.0);
                    record.window = Some(window(samples, elapsed));
                    due.push((target_channel(measure).to_string(), record));
                }
            }
            samples.clear();
            last_flush.insert(key.clone(), now);
        }
        due
    }

    /// Start the shared flush loop once; later calls are no-ops
    pub fn start(self: &Arc<Self>, sink: Weak<dyn MeasurementSink>) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!("MeasurementAggregator::start: no tokio runtime, flush loop deferred");
            self.started.store(false, Ordering::SeqCst);
            return;
        };
        debug!(tick = ?self.tick, "MeasurementAggregator::start: spawning flush loop");
        let aggregator = Arc::clone(self);
        handle.spawn(async move { aggregator.run(sink).await });
    }

    async fn run(self: Arc<Self>, sink: Weak<dyn MeasurementSink>) {
        let mut ticker = tokio::time::interval(self.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let Some(sink) = sink.upgrade() else {
                break;
            };
            let due = self.collect(Instant::now());
            if due.is_empty() {
                continue;
            }
            if !sink.is_connected() {
                debug!(dropped = due.len(), "MeasurementAggregator: not connected, dropping flushed records");
                continue;
            }
            for (channel, record) in due {
                if let Err(e) = sink.publish_measurement(&channel, &record) {
                    warn!(measure = %record.measure_id, error = %e, "Failed to publish measurement");
                }
            }
        }
        debug!("MeasurementAggregator: flush loop stopped");
    }

    pub fn is_running(&self) -> bool {
        self.started.load(Ordering::SeqCst) && !self.shutdown.is_cancelled()
    }

    /// Stop the flush loop
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Samples waiting under a key
    pub fn pending(&self, measure_id: &str, entity_id: Option<&str>) -> usize {
        self.queue
            .lock()
            .values
            .get(&(measure_id.to_string(), entity_id.map(str::to_string)))
            .map(Vec::len)
            .unwrap_or(0)
    }
}

impl Drop for MeasurementAggregator {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
