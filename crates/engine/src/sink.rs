use std::cell::RefCell;
use std::rc::Rc;

use instrumentation::Timestamp;

use crate::error::CollectError;
use crate::node::MetricId;

/// Consumer of everything the engine produces for its requesters
pub trait SampleSink {
    /// A top-level metric's aggregated value advanced over `[start, end)`
    fn on_sample(&mut self, metric: MetricId, start: Timestamp, end: Timestamp, value: f64);

    /// A trace record from instrumentation belonging to `metric`
    fn on_trace(&mut self, _metric: MetricId, _timestamp: Timestamp, _payload: &[u8]) {}

    /// A collection request gave up after exhausting its attempts
    fn on_collect_failed(&mut self, _metric: MetricId, _error: &CollectError) {}
}

/// One delivered sample
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SampleRecord {
    pub metric: MetricId,
    pub start: Timestamp,
    pub end: Timestamp,
    pub value: f64,
}

#[derive(Debug, Default)]
struct Recorded {
    samples: Vec<SampleRecord>,
    traces: Vec<(MetricId, Timestamp, Vec<u8>)>,
    failures: Vec<(MetricId, CollectError)>,
}

/// Sink keeping everything it receives; clones share the same record
#[derive(Debug, Clone, Default)]
pub struct RecordingSink {
    inner: Rc<RefCell<Recorded>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn samples(&self) -> Vec<SampleRecord> {
        self.inner.borrow().samples.clone()
    }

    /// Samples of one metric
    pub fn samples_of(&self, metric: MetricId) -> Vec<SampleRecord> {
        self.inner
            .borrow()
            .samples
            .iter()
            .filter(|s| s.metric == metric)
            .copied()
            .collect()
    }

    /// Sum of every value delivered for `metric`
    pub fn total(&self, metric: MetricId) -> f64 {
        self.samples_of(metric).iter().map(|s| s.value).sum()
    }

    pub fn traces(&self) -> Vec<(MetricId, Timestamp, Vec<u8>)> {
        self.inner.borrow().traces.clone()
    }

    pub fn failures(&self) -> Vec<(MetricId, CollectError)> {
        self.inner.borrow().failures.clone()
    }

    /// Removes and returns the samples received so far
    pub fn drain_samples(&self) -> Vec<SampleRecord> {
        std::mem::take(&mut self.inner.borrow_mut().samples)
    }
}

impl SampleSink for RecordingSink {
    fn on_sample(&mut self, metric: MetricId, start: Timestamp, end: Timestamp, value: f64) {
        self.inner.borrow_mut().samples.push(SampleRecord {
            metric,
            start,
            end,
            value,
        });
    }

    fn on_trace(&mut self, metric: MetricId, timestamp: Timestamp, payload: &[u8]) {
        self.inner
            .borrow_mut()
            .traces
            .push((metric, timestamp, payload.to_vec()));
    }

    fn on_collect_failed(&mut self, metric: MetricId, error: &CollectError) {
        self.inner
            .borrow_mut()
            .failures
            .push((metric, error.clone()));
    }
}
