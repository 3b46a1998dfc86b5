use aggregation::Sample;
use instrumentation::message::{self, Message};
use instrumentation::{Address, Pid, RegionError, SourceFamily, Timestamp};
use log::{debug, error, warn};

use crate::engine::Engine;
use crate::error::SampleError;
use crate::node::{MetricId, NodeId, NodeKind, NodeState};

impl Engine {
    /// Reads every active polled value and routes the increment since the
    /// previous poll
    pub fn poll(&mut self, now: Timestamp) {
        for (pid, address, id) in self.registry.sampled() {
            let Some(node) = self.registry.node_mut(id) else {
                continue;
            };
            if node.state != NodeState::Active {
                continue;
            }
            let Some(request) = node.sampled_request_mut() else {
                continue;
            };
            if request.family() != SourceFamily::Polled || request.get_address() != Some(address) {
                continue;
            }
            let Some(region) = self.control.poll_region(pid) else {
                continue;
            };

            match request.read_polled(&region, now) {
                Ok(cumulative) => {
                    if let Some((start, end, delta)) = request.take_delta(now, cumulative) {
                        self.stats.samples_processed += 1;
                        self.route(id, Sample::new(start, end, delta));
                    }
                }
                Err(RegionError::TornRead(slot)) => {
                    self.stats.torn_reads += 1;
                    debug!("discarded torn read of slot {} in process {}", slot, pid);
                }
                Err(e) => warn!("cannot poll {} in process {}: {}", id, pid, e),
            }
        }
    }

    /// Decodes one record from a target and routes it
    pub fn handle_message(&mut self, data: &[u8]) -> Result<(), SampleError> {
        let record = match message::parse(data) {
            Ok(record) => record,
            Err(e) => {
                self.stats.malformed_messages += 1;
                error!("lost record from target: {}", e);
                return Err(e.into());
            }
        };

        match record {
            Message::SampleReport(report) => {
                self.handle_report(report.pid, report.address, report.header.timestamp, report.value)
            }
            Message::Trace(trace, payload) => {
                self.handle_trace(trace.pid, trace.address, trace.header.timestamp, payload)
            }
        }
        Ok(())
    }

    fn handle_report(&mut self, pid: Pid, address: Address, timestamp: Timestamp, value: i64) {
        if self.registry.is_unreliable(pid, address) {
            self.stats.samples_unreliable += 1;
            debug!("discarded sample from stale instrumentation at {:#x} in process {}", address, pid);
            return;
        }
        let Some(id) = self.registry.by_address(pid, address) else {
            self.stats.samples_dropped += 1;
            debug!("dropped sample for unknown value {:#x} in process {}", address, pid);
            return;
        };
        let delta = self
            .registry
            .node_mut(id)
            .and_then(|n| n.sampled_request_mut())
            .and_then(|r| r.take_delta(timestamp, value as f64));
        if let Some((start, end, delta)) = delta {
            self.stats.samples_processed += 1;
            self.route(id, Sample::new(start, end, delta));
        }
    }

    fn handle_trace(&mut self, pid: Pid, address: Address, timestamp: Timestamp, payload: &[u8]) {
        let metrics = self
            .registry
            .by_address(pid, address)
            .map(|id| self.metrics_above(id))
            .unwrap_or_default();
        if metrics.is_empty() {
            self.stats.traces_dropped += 1;
            debug!("dropped trace for unknown value {:#x} in process {}", address, pid);
            return;
        }
        for metric in metrics {
            self.sink.on_trace(metric, timestamp, payload);
        }
        self.stats.traces_routed += 1;
    }

    /// Every top-level metric that transitively contains `id`
    fn metrics_above(&self, id: NodeId) -> Vec<MetricId> {
        let mut metrics = Vec::new();
        let mut stack = vec![id];
        let mut seen = std::collections::BTreeSet::new();
        while let Some(current) = stack.pop() {
            if !seen.insert(current) {
                continue;
            }
            let Some(node) = self.registry.node(current) else {
                continue;
            };
            if let Some(metric) = node.metric_id {
                metrics.push(metric);
            }
            stack.extend(node.parents.iter().copied());
        }
        metrics.sort();
        metrics
    }

    /// Nodes whose aggregators consume the samples of `source`
    fn consumers_of(&self, source: NodeId) -> Vec<NodeId> {
        let Some(node) = self.registry.node(source) else {
            return Vec::new();
        };
        if node.kind == NodeKind::ThreadLevel {
            node.parents
                .iter()
                .filter_map(|p| self.registry.node(*p))
                .flat_map(|p| p.parents.iter().copied())
                .collect()
        } else {
            node.parents.clone()
        }
    }

    /// Feeds an increment of `source` into every consumer
    pub(crate) fn route(&mut self, source: NodeId, sample: Sample) {
        for consumer in self.consumers_of(source) {
            let Some(agg) = self
                .registry
                .node_mut(consumer)
                .and_then(|n| n.aggregator.as_mut())
            else {
                continue;
            };
            if !agg.contains(source.0) {
                continue;
            }
            match agg.update(source.0, sample.start, sample.end, sample.value) {
                Ok(Some(out)) => self.publish(consumer, out),
                Ok(None) => {}
                Err(e) => {
                    self.stats.aggregation_errors += 1;
                    warn!("{} rejected sample of {}: {}", consumer, source, e);
                }
            }
        }
    }

    /// Records an aggregated interval of `id` and passes it upward. Top-level
    /// nodes hand it to the sink.
    pub(crate) fn publish(&mut self, id: NodeId, sample: Sample) {
        let Some(node) = self.registry.node_mut(id) else {
            return;
        };
        node.mark_started(sample.start, sample.value);
        if node.kind == NodeKind::Aggregate {
            if let Some(metric) = node.metric_id {
                self.stats.samples_emitted += 1;
                self.sink.on_sample(metric, sample.start, sample.end, sample.value);
            }
        }
        self.route(id, sample);
    }
}
