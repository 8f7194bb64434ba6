//! Minimal run-time metrics sink.
//!
//! Prometheus export is intentionally left out; counters and gauges are
//! forwarded to the `log` facade so the embedding process can scrape them
//! from whatever sink it already drains.

use log::debug;
use metrics::{
    Counter, Gauge, Histogram, Key, KeyName, Metadata, Recorder, SharedString, Unit,
};
use std::sync::Arc;

struct LogRecorder;

#[derive(Clone)]
struct LogCounter {
    key: Key,
}
#[derive(Clone)]
struct LogGauge {
    key: Key,
}
#[derive(Clone)]
struct LogHistogram {
    key: Key,
}

impl Recorder for LogRecorder {
    fn describe_counter(&self, _key: KeyName, _unit: Option<Unit>, _description: SharedString) {}
    fn describe_gauge(&self, _key: KeyName, _unit: Option<Unit>, _description: SharedString) {}
    fn describe_histogram(&self, _key: KeyName, _unit: Option<Unit>, _description: SharedString) {}

    fn register_counter(&self, key: &Key, _metadata: &Metadata<'_>) -> Counter {
        Counter::from_arc(Arc::new(LogCounter { key: key.clone() }))
    }
    fn register_gauge(&self, key: &Key, _metadata: &Metadata<'_>) -> Gauge {
        Gauge::from_arc(Arc::new(LogGauge { key: key.clone() }))
    }
    fn register_histogram(&self, key: &Key, _metadata: &Metadata<'_>) -> Histogram {
        Histogram::from_arc(Arc::new(LogHistogram { key: key.clone() }))
    }
}

impl metrics::CounterFn for LogCounter {
    fn increment(&self, value: u64) {
        debug!(target: "art_metrics", "{} +{value}", self.key.name());
    }
    fn absolute(&self, value: u64) {
        debug!(target: "art_metrics", "{} ={value}", self.key.name());
    }
}

impl metrics::GaugeFn for LogGauge {
    fn set(&self, value: f64) {
        debug!(target: "art_metrics", "{} ={value}", self.key.name());
    }
    fn increment(&self, value: f64) {
        debug!(target: "art_metrics", "{} +{value}", self.key.name());
    }
    fn decrement(&self, value: f64) {
        debug!(target: "art_metrics", "{} -{value}", self.key.name());
    }
}

impl metrics::HistogramFn for LogHistogram {
    fn record(&self, value: f64) {
        debug!(target: "art_metrics", "{} ~{value}", self.key.name());
    }
}

/// Install exactly once; later roots share the recorder.
pub fn init() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let _ = metrics::set_global_recorder(LogRecorder);
    });
}
