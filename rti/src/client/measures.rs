//! Measure registration and sampling on the client

use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};

use tracing::{debug, warn};

use super::{ClientInner, RtiClient};
use crate::constants::channel;
use crate::error::RtiResult;
use crate::measure::{self, MeasurementSink};
use crate::proto::{Measure, Measurement, Measures, measures};

impl MeasurementSink for ClientInner {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn publish_measurement(&self, channel: &str, measurement: &Measurement) -> RtiResult<()> {
        match self.handle() {
            Some(client) => client.publish(channel, measurement),
            None => Ok(()),
        }
    }
}

impl RtiClient {
    /// Register a measure definition; the first registration of an id is announced
    pub fn register_measure(&self, mut measure: Measure) {
        measure.application = self.application();
        debug!(measure = %measure.id, interval = measure.interval, "RtiClient::register_measure: called");
        let newly_known = self.inner.directory.write().register_measure(measure.clone());
        if newly_known && self.is_connected() && !self.inner.incognito {
            let message = Measures::of(measures::Which::Measure(measure));
            if let Err(e) = self.publish(channel::MEASURES, &message) {
                warn!(error = %e, "Failed to announce measure");
            }
        }
    }

    /// Record a sample for a measure id
    ///
    /// The definition is looked up among used then known measures; an unknown
    /// id gets an immediate (interval 0) definition.
    pub fn measure(&self, measure_id: &str, value: f64) -> RtiResult<()> {
        let definition = self.resolve_measure(measure_id);
        self.measure_with(&definition, value, None)
    }

    /// Record a sample for one entity of an entity-scoped measure
    pub fn measure_entity(&self, measure_id: &str, entity_id: &str, value: f64) -> RtiResult<()> {
        let definition = self.resolve_measure(measure_id);
        self.measure_with(&definition, value, Some(entity_id))
    }

    fn resolve_measure(&self, measure_id: &str) -> Measure {
        self.inner
            .directory
            .read()
            .lookup_measure(measure_id)
            .unwrap_or_else(|| Measure {
                application: self.application(),
                ..Measure::new(measure_id)
            })
    }

    /// Record a sample against a full definition
    ///
    /// Immediate measures are published before this returns; others are
    /// queued for the shared flush loop.
    pub fn measure_with(&self, measure: &Measure, value: f64, entity_id: Option<&str>) -> RtiResult<()> {
        let used = self.inner.directory.read().used_measures.contains_key(&measure.id);
        if !used {
            self.register_measure(measure.clone());
        }

        if measure::is_immediate(measure) {
            if !self.is_connected() {
                debug!(measure = %measure.id, "RtiClient::measure: not connected, sample dropped");
                return Ok(());
            }
            let record = measure::scalar(&measure.id, &self.client_id(), entity_id, value);
            return self.publish(measure::target_channel(measure), &record);
        }

        self.inner.aggregator.enqueue(measure, value, entity_id);
        let sink: Weak<dyn MeasurementSink> = Arc::downgrade(&self.inner) as Weak<dyn MeasurementSink>;
        self.inner.aggregator.start(sink);
        Ok(())
    }

    pub fn measurement_time_scale(&self) -> f64 {
        self.inner.aggregator.time_scale()
    }

    /// Scale applied to elapsed time when deciding whether an interval has passed
    pub fn set_measurement_time_scale(&self, time_scale: f64) {
        self.inner.aggregator.set_time_scale(time_scale);
    }
}
