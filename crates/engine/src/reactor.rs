use std::collections::VecDeque;

use instrumentation::{Focus, ForkMap, Pid, Tid, Timestamp};
use log::{debug, error};
use thiserror::Error;

use crate::engine::Engine;
use crate::error::{CollectError, ForkConsistencyError, SampleError};
use crate::node::MetricId;

/// Errors returned by an event handler
#[derive(Error, Debug)]
pub enum ReactorError {
    #[error("sample error: {0}")]
    Sample(#[from] SampleError),

    #[error("collect error: {0}")]
    Collect(#[from] CollectError),

    #[error("{} inherited instrumentation removals failed", .0.len())]
    ForkConsistency(Vec<ForkConsistencyError>),
}

/// Something that happened to the targets or was asked of the engine
#[derive(Debug, Clone)]
pub enum Event {
    /// A raw record from a target's message channel
    Message(Vec<u8>),

    /// Time to poll values and drain retry queues
    Tick(Timestamp),

    ProcessStarted(Pid),

    Fork {
        parent: Pid,
        child: Pid,
        map: ForkMap,
    },

    Exec(Pid),
    Exited(Pid),
    ThreadCreated { pid: Pid, tid: Tid },
    ThreadExited { pid: Pid, tid: Tid },
    ProcessStopped(Pid),
    ProcessContinued(Pid),

    /// Start collecting a metric; the id is available from
    /// [`Reactor::take_started`] once handled
    StartCollecting { metric: String, focus: Focus },

    /// Stop collecting a metric
    Disable(MetricId),
}

/// Tracks statistics for the reactor
#[derive(Debug, Default, Clone, Copy)]
pub struct Stats {
    /// Events handled, successfully or not
    pub events_processed: usize,

    /// Records from targets handled
    pub messages_processed: usize,

    /// Process and thread lifecycle events handled
    pub lifecycle_events: usize,

    /// Number of errors returned from handlers
    pub handler_errors: usize,
}

/// Sequential event loop in front of an [`Engine`].
///
/// Every tree mutation happens inside one `dispatch` call, so handlers never
/// observe a half-updated tree.
pub struct Reactor {
    engine: Engine,
    queue: VecDeque<Event>,
    started: Vec<(String, MetricId)>,
    stats: Stats,
}

impl Reactor {
    pub fn new(engine: Engine) -> Self {
        Reactor {
            engine,
            queue: VecDeque::new(),
            started: Vec::new(),
            stats: Stats::default(),
        }
    }

    /// Returns the current statistics
    pub fn stats(&self) -> Stats {
        self.stats
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut Engine {
        &mut self.engine
    }

    /// Metrics started by handled [`Event::StartCollecting`] events since
    /// the last call, by name
    pub fn take_started(&mut self) -> Vec<(String, MetricId)> {
        std::mem::take(&mut self.started)
    }

    /// Queues an event behind everything already queued
    pub fn push(&mut self, event: Event) {
        self.queue.push_back(event);
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Handles the oldest queued event. Returns `Ok(false)` when the queue
    /// was empty.
    pub fn dispatch(&mut self) -> Result<bool, ReactorError> {
        let Some(event) = self.queue.pop_front() else {
            return Ok(false);
        };
        self.stats.events_processed += 1;
        let result = self.handle(event);
        if result.is_err() {
            self.stats.handler_errors += 1;
        }
        result.map(|_| true)
    }

    /// Handles events until the queue is empty. Handler errors are logged
    /// and do not stop the loop.
    pub fn dispatch_all(&mut self) {
        loop {
            match self.dispatch() {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) => error!("event handler failed: {}", e),
            }
        }
    }

    fn handle(&mut self, event: Event) -> Result<(), ReactorError> {
        debug!("handling {:?}", event);
        match event {
            Event::Message(data) => {
                self.stats.messages_processed += 1;
                self.engine.handle_message(&data)?;
            }
            Event::Tick(now) => self.engine.tick(now),
            Event::ProcessStarted(pid) => {
                self.stats.lifecycle_events += 1;
                self.engine.propagate_to_new_process(pid);
            }
            Event::Fork { parent, child, map } => {
                self.stats.lifecycle_events += 1;
                let errors = self.engine.handle_fork(parent, child, &map);
                if !errors.is_empty() {
                    return Err(ReactorError::ForkConsistency(errors));
                }
            }
            Event::Exec(pid) => {
                self.stats.lifecycle_events += 1;
                self.engine.handle_exec(pid);
            }
            Event::Exited(pid) => {
                self.stats.lifecycle_events += 1;
                self.engine.handle_exit(pid);
            }
            Event::ThreadCreated { pid, tid } => {
                self.stats.lifecycle_events += 1;
                self.engine.add_thread(pid, tid);
            }
            Event::ThreadExited { pid, tid } => {
                self.stats.lifecycle_events += 1;
                self.engine.remove_thread(pid, tid);
            }
            Event::ProcessStopped(pid) | Event::ProcessContinued(pid) => {
                self.stats.lifecycle_events += 1;
                self.engine.handle_process_boundary(pid);
            }
            Event::StartCollecting { metric, focus } => {
                let id = self.engine.start_collecting(&metric, &focus)?;
                self.started.push((metric, id));
            }
            Event::Disable(metric) => self.engine.disable(metric)?,
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{EngineConfig, MetricCatalog, RecordingSink};
    use instrumentation::message;
    use instrumentation::sim::SimTarget;
    use instrumentation::Focus;

    fn reactor_with(sim: &SimTarget, sink: &RecordingSink) -> Reactor {
        let engine = Engine::new(
            EngineConfig::default(),
            MetricCatalog::builtin(),
            Box::new(sim.clone()),
            Box::new(sim.clone()),
            Box::new(sink.clone()),
        );
        Reactor::new(engine)
    }

    #[test]
    fn test_empty_queue() {
        let sim = SimTarget::new();
        let mut reactor = reactor_with(&sim, &RecordingSink::new());
        assert!(reactor.is_empty());
        assert!(!reactor.dispatch().unwrap());
        assert_eq!(reactor.stats().events_processed, 0);
    }

    #[test]
    fn test_events_run_in_order() {
        let sim = SimTarget::new();
        let sink = RecordingSink::new();
        let pid = sim.spawn(&["work"]);
        let mut reactor = reactor_with(&sim, &sink);
        let metric = reactor
            .engine_mut()
            .start_collecting("procedure_calls", &Focus::whole_program())
            .unwrap();
        assert_eq!(reactor.engine().count_nodes(crate::NodeKind::Primitive), 1);

        reactor.push(Event::Disable(metric));
        reactor.push(Event::Exited(pid));
        assert_eq!(reactor.len(), 2);
        reactor.dispatch_all();

        assert!(reactor.is_empty());
        assert_eq!(reactor.engine().count_nodes(crate::NodeKind::Primitive), 0);
        let stats = reactor.stats();
        assert_eq!(stats.events_processed, 2);
        assert_eq!(stats.lifecycle_events, 1);
        assert_eq!(stats.handler_errors, 0);
    }

    #[test]
    fn test_handler_error_does_not_stop_loop() {
        let sim = SimTarget::new();
        let sink = RecordingSink::new();
        sim.spawn(&[]);
        let mut reactor = reactor_with(&sim, &sink);

        reactor.push(Event::Message(vec![1, 0, 0, 0]));
        reactor.push(Event::Disable(MetricId(42)));
        reactor.push(Event::Message(message::encode_sample_report(5, 100, 0xdead, 3)));
        reactor.dispatch_all();

        let stats = reactor.stats();
        assert_eq!(stats.events_processed, 3);
        assert_eq!(stats.messages_processed, 2);
        assert_eq!(stats.handler_errors, 2);
        assert_eq!(reactor.engine().stats().malformed_messages, 1);
        assert_eq!(reactor.engine().stats().samples_dropped, 1);
    }

    #[test]
    fn test_start_collecting_through_queue() {
        let sim = SimTarget::new();
        let sink = RecordingSink::new();
        sim.spawn(&["work"]);
        let mut reactor = reactor_with(&sim, &sink);

        reactor.push(Event::StartCollecting {
            metric: "procedure_calls".to_string(),
            focus: Focus::whole_program(),
        });
        reactor.push(Event::StartCollecting {
            metric: "no_such_metric".to_string(),
            focus: Focus::whole_program(),
        });
        reactor.dispatch_all();

        let started = reactor.take_started();
        assert_eq!(started.len(), 1);
        assert_eq!(started[0].0, "procedure_calls");
        assert!(reactor.engine().metric_node(started[0].1).is_some());
        assert_eq!(reactor.stats().handler_errors, 1);
        assert!(reactor.take_started().is_empty());

        reactor.push(Event::Disable(started[0].1));
        reactor.dispatch_all();
        assert_eq!(reactor.engine().count_nodes(crate::NodeKind::Primitive), 0);
    }

    #[test]
    fn test_malformed_message_is_an_error() {
        let sim = SimTarget::new();
        let mut reactor = reactor_with(&sim, &RecordingSink::new());
        reactor.push(Event::Message(vec![0u8; 3]));
        match reactor.dispatch() {
            Err(ReactorError::Sample(SampleError::Message(_))) => {}
            other => panic!("expected a sample error, got {:?}", other),
        }
    }
}
