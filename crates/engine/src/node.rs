use std::fmt;

use aggregation::Aggregator;
use instrumentation::{
    CodePatcher, DataLocation, DataRequest, Focus, InstRequest, InstallError, Pid, ProcessControl,
    SourceFamily, Tid, Timestamp,
};
use log::debug;

use crate::plan::{ComponentPlan, PrimitivePlan};

/// Stable identifier of a node in the engine's arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u64);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node#{}", self.0)
    }
}

/// Identifier handed to the originator of a collection request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MetricId(pub u32);

impl fmt::Display for MetricId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "metric#{}", self.0)
    }
}

/// Level of aggregation a node represents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKind {
    /// One per collection request, combining every process
    Aggregate,
    /// One metric in one process
    Component,
    /// Owns the instrumentation for one variable
    Primitive,
    /// One thread's share of a primitive's variable
    ThreadLevel,
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NodeKind::Aggregate => "aggregate",
            NodeKind::Component => "component",
            NodeKind::Primitive => "primitive",
            NodeKind::ThreadLevel => "thread",
        };
        f.write_str(name)
    }
}

/// Insertion lifecycle of a node.
///
/// `Created -> InsertionPending -> (Deferred <-> InsertionPending) -> Active -> Disabled`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeState {
    Created,
    InsertionPending,
    Deferred,
    Active,
    Disabled,
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NodeState::Created => "created",
            NodeState::InsertionPending => "insertion-pending",
            NodeState::Deferred => "deferred",
            NodeState::Active => "active",
            NodeState::Disabled => "disabled",
        };
        f.write_str(name)
    }
}

/// Result of one insertion attempt
#[derive(Debug, Clone, PartialEq)]
pub enum InsertOutcome {
    /// Every owned request is installed
    Active,
    /// The process could not accept patches; try again later
    Deferred,
    /// A point could not be resolved
    Failed(InstallError),
}

/// A metric at one level of aggregation
#[derive(Debug)]
pub struct MetricNode {
    pub(crate) id: NodeId,
    pub(crate) kind: NodeKind,
    pub(crate) metric_name: String,
    pub(crate) focus: Focus,
    pub(crate) flat_name: String,
    pub(crate) pid: Option<Pid>,
    pub(crate) tid: Option<Tid>,
    pub(crate) metric_id: Option<MetricId>,
    pub(crate) aggregator: Option<Aggregator>,
    /// Owned children. Thread nodes for a primitive.
    pub(crate) components: Vec<NodeId>,
    /// Owners; a shared primitive has several
    pub(crate) parents: Vec<NodeId>,
    pub(crate) data_requests: Vec<DataRequest>,
    /// Parallel to the primitive plan's snippets once bound
    pub(crate) inst_requests: Vec<InstRequest>,
    pub(crate) primitive_plan: Option<PrimitivePlan>,
    pub(crate) component_plan: Option<ComponentPlan>,
    pub(crate) start_time: Option<Timestamp>,
    pub(crate) initial_value: Option<f64>,
    pub(crate) state: NodeState,
    pub(crate) predicted_cost: f64,
    pub(crate) shareable: bool,
}

impl MetricNode {
    pub(crate) fn new(
        id: NodeId,
        kind: NodeKind,
        metric_name: impl Into<String>,
        focus: Focus,
        flat_name: impl Into<String>,
    ) -> Self {
        Self {
            id,
            kind,
            metric_name: metric_name.into(),
            focus,
            flat_name: flat_name.into(),
            pid: None,
            tid: None,
            metric_id: None,
            aggregator: None,
            components: Vec::new(),
            parents: Vec::new(),
            data_requests: Vec::new(),
            inst_requests: Vec::new(),
            primitive_plan: None,
            component_plan: None,
            start_time: None,
            initial_value: None,
            state: NodeState::Created,
            predicted_cost: 0.0,
            shareable: false,
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    pub fn metric_name(&self) -> &str {
        &self.metric_name
    }

    pub fn focus(&self) -> &Focus {
        &self.focus
    }

    pub fn flat_name(&self) -> &str {
        &self.flat_name
    }

    pub fn pid(&self) -> Option<Pid> {
        self.pid
    }

    pub fn tid(&self) -> Option<Tid> {
        self.tid
    }

    pub fn metric_id(&self) -> Option<MetricId> {
        self.metric_id
    }

    pub fn aggregator(&self) -> Option<&Aggregator> {
        self.aggregator.as_ref()
    }

    pub fn components(&self) -> &[NodeId] {
        &self.components
    }

    pub fn parents(&self) -> &[NodeId] {
        &self.parents
    }

    pub fn data_requests(&self) -> &[DataRequest] {
        &self.data_requests
    }

    pub fn inst_requests(&self) -> &[InstRequest] {
        &self.inst_requests
    }

    pub fn start_time(&self) -> Option<Timestamp> {
        self.start_time
    }

    pub fn initial_value(&self) -> Option<f64> {
        self.initial_value
    }

    pub fn state(&self) -> NodeState {
        self.state
    }

    pub fn predicted_cost(&self) -> f64 {
        self.predicted_cost
    }

    pub fn is_shareable(&self) -> bool {
        self.shareable
    }

    pub fn is_inserted(&self) -> bool {
        matches!(self.state, NodeState::Active)
    }

    /// Every owned request is installed
    pub fn is_installed(&self) -> bool {
        self.data_requests.iter().all(DataRequest::is_installed)
            && self.inst_requests.iter().all(InstRequest::is_installed)
    }

    pub fn is_deferred(&self) -> bool {
        self.state == NodeState::Deferred
    }

    /// The sampled variable this node owns, if any
    pub fn sampled_request(&self) -> Option<&DataRequest> {
        self.data_requests.iter().find(|r| r.is_sampled())
    }

    pub(crate) fn sampled_request_mut(&mut self) -> Option<&mut DataRequest> {
        self.data_requests.iter_mut().find(|r| r.is_sampled())
    }

    /// The gate flag this node owns, if any
    pub fn gate_request(&self) -> Option<&DataRequest> {
        self.data_requests
            .iter()
            .find(|r| r.family() == SourceFamily::GateOnly)
    }

    pub(crate) fn gate_location(&self) -> Option<DataLocation> {
        self.gate_request().and_then(|r| r.location().cloned())
    }

    pub(crate) fn sampled_location(&self) -> Option<DataLocation> {
        self.sampled_request().and_then(|r| r.location().cloned())
    }

    /// Reserves target storage for every owned value
    pub(crate) fn allocate_data(
        &mut self,
        patcher: &mut dyn CodePatcher,
        control: &dyn ProcessControl,
    ) -> Result<(), InstallError> {
        let Some(pid) = self.pid else {
            return Ok(());
        };
        for request in self.data_requests.iter_mut() {
            request.allocate(pid, patcher, control)?;
        }
        Ok(())
    }

    /// Moves every owned request to the installed state.
    ///
    /// Values are installed before the code writing them. Partial progress is
    /// kept, so a retry after deferral only installs what is missing.
    pub(crate) fn insert_instrumentation(
        &mut self,
        patcher: &mut dyn CodePatcher,
        control: &dyn ProcessControl,
    ) -> InsertOutcome {
        let Some(pid) = self.pid else {
            return InsertOutcome::Active;
        };
        self.state = NodeState::InsertionPending;

        let result = self
            .data_requests
            .iter_mut()
            .try_for_each(|r| r.install(pid, patcher, control))
            .and_then(|()| {
                self.inst_requests
                    .iter_mut()
                    .try_for_each(|r| r.install(pid, patcher))
            });

        match result {
            Ok(()) => {
                debug!("{} {} installed in process {}", self.kind, self.flat_name, pid);
                InsertOutcome::Active
            }
            Err(e) if e.is_transient() => {
                self.state = NodeState::Deferred;
                InsertOutcome::Deferred
            }
            Err(e) => InsertOutcome::Failed(e),
        }
    }

    /// Removes every owned patch and releases every owned value
    pub(crate) fn disable_requests(
        &mut self,
        patcher: &mut dyn CodePatcher,
        control: &dyn ProcessControl,
        points_still_reachable: bool,
    ) {
        if let Some(pid) = self.pid {
            for request in self.inst_requests.iter_mut() {
                request.disable(pid, patcher, points_still_reachable);
            }
            for request in self.data_requests.iter_mut() {
                request.disable(pid, patcher, control, points_still_reachable);
            }
        }
        self.state = NodeState::Disabled;
    }

    /// Forgets every patch and value after the process image was replaced.
    /// Values are recreated and snippets rebound by the next insertion.
    pub(crate) fn reset_requests(&mut self) {
        for request in self.inst_requests.iter_mut() {
            request.abandon();
        }
        for request in self.data_requests.iter_mut() {
            request.abandon();
            *request = DataRequest::new(request.kind(), request.family(), request.initial_value());
        }
        self.state = NodeState::InsertionPending;
    }

    /// Records the first point of this node's stream. Later calls are ignored.
    pub(crate) fn mark_started(&mut self, start: Timestamp, value: f64) {
        if self.start_time.is_none() {
            self.start_time = Some(start);
            self.initial_value = Some(value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use instrumentation::sim::SimTarget;
    use instrumentation::{
        BoundSnippet, CallOrder, CallWhen, InstPoint, SnippetEffect, SnippetOp, ValueKind,
    };

    fn primitive(pid: Pid) -> MetricNode {
        let mut node = MetricNode::new(
            NodeId(1),
            NodeKind::Primitive,
            "procedure_calls",
            Focus::whole_program(),
            "calls",
        );
        node.pid = Some(pid);
        node.data_requests
            .push(DataRequest::new(ValueKind::Counter, SourceFamily::Polled, 0));
        node
    }

    fn bind_counter(node: &mut MetricNode, function: &str) {
        let target = node.sampled_location().unwrap();
        node.inst_requests.push(InstRequest::new(
            InstPoint::entry(function),
            BoundSnippet::new(SnippetOp::AddCounter(1), SnippetEffect::ModifyInPlace, target),
            CallWhen::Before,
            CallOrder::First,
        ));
    }

    #[test]
    fn test_insert_and_disable() {
        let sim = SimTarget::new();
        let pid = sim.spawn(&["work"]);
        let mut patcher = sim.clone();

        let mut node = primitive(pid);
        node.allocate_data(&mut patcher, &sim).unwrap();
        bind_counter(&mut node, "work");

        assert_eq!(node.insert_instrumentation(&mut patcher, &sim), InsertOutcome::Active);
        assert!(node.is_installed());
        assert_eq!(sim.patch_count(pid), 1);

        node.disable_requests(&mut patcher, &sim, true);
        assert_eq!(node.state(), NodeState::Disabled);
        assert_eq!(sim.patch_count(pid), 0);
        assert_eq!(sim.region(pid).unwrap().in_use(), 0);
    }

    #[test]
    fn test_busy_process_defers() {
        let sim = SimTarget::new();
        let pid = sim.spawn(&["work"]);
        let mut patcher = sim.clone();

        let mut node = primitive(pid);
        node.allocate_data(&mut patcher, &sim).unwrap();
        bind_counter(&mut node, "work");
        sim.set_busy(pid, true);

        assert_eq!(node.insert_instrumentation(&mut patcher, &sim), InsertOutcome::Deferred);
        assert!(node.is_deferred());
        assert!(!node.is_installed());

        sim.set_busy(pid, false);
        assert_eq!(node.insert_instrumentation(&mut patcher, &sim), InsertOutcome::Active);
        assert_eq!(sim.patch_count(pid), 1);
    }

    #[test]
    fn test_unresolvable_point_fails() {
        let sim = SimTarget::new();
        let pid = sim.spawn(&[]);
        let mut patcher = sim.clone();

        let mut node = primitive(pid);
        node.allocate_data(&mut patcher, &sim).unwrap();
        bind_counter(&mut node, "missing");

        assert!(matches!(
            node.insert_instrumentation(&mut patcher, &sim),
            InsertOutcome::Failed(InstallError::Unreachable(_))
        ));
    }

    #[test]
    fn test_reset_forgets_requests() {
        let sim = SimTarget::new();
        let pid = sim.spawn(&["work"]);
        let mut patcher = sim.clone();

        let mut node = primitive(pid);
        node.allocate_data(&mut patcher, &sim).unwrap();
        bind_counter(&mut node, "work");
        node.insert_instrumentation(&mut patcher, &sim);

        node.reset_requests();
        assert_eq!(node.inst_requests().len(), 1);
        assert!(!node.inst_requests()[0].is_installed());
        assert_eq!(node.data_requests().len(), 1);
        assert!(!node.data_requests()[0].is_allocated());
        assert_eq!(node.state(), NodeState::InsertionPending);
    }

    #[test]
    fn test_start_is_set_once() {
        let mut node = primitive(1);
        node.mark_started(10, 2.0);
        node.mark_started(20, 5.0);
        assert_eq!(node.start_time(), Some(10));
        assert_eq!(node.initial_value(), Some(2.0));
    }
}
