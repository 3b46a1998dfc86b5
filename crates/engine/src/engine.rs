use std::collections::BTreeSet;

use aggregation::{Aggregator, Sample};
use instrumentation::{
    BoundSnippet, CodePatcher, DataLocation, DataRequest, Focus, InstallError, Pid,
    ProcessControl, SourceFamily, Tid, Timestamp, ValueKind,
};
use log::{debug, info, warn};

use crate::catalog::{MetricCatalog, MetricDefinition};
use crate::config::EngineConfig;
use crate::cost::CostLedger;
use crate::error::CollectError;
use crate::node::{InsertOutcome, MetricId, MetricNode, NodeId, NodeKind, NodeState};
use crate::plan::{plan_component, ComponentPlan, PrimitivePlan, ValueTarget};
use crate::registry::Registry;
use crate::retry::{PendingInsertion, RetryQueues};
use crate::sink::SampleSink;

/// Counters describing what the engine did with its inputs
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct EngineStats {
    /// Raw samples accepted from targets
    pub samples_processed: usize,

    /// Aggregated samples handed to the sink
    pub samples_emitted: usize,

    /// Samples for values no node owns
    pub samples_dropped: usize,

    /// Samples from locations with stale instrumentation
    pub samples_unreliable: usize,

    /// Polls that kept colliding with the writer
    pub torn_reads: usize,

    pub traces_routed: usize,
    pub traces_dropped: usize,

    /// Records that could not be decoded
    pub malformed_messages: usize,

    /// Samples rejected by an aggregator
    pub aggregation_errors: usize,

    pub forks_handled: usize,
    pub execs_handled: usize,
    pub exits_handled: usize,
    pub fork_consistency_errors: usize,
    pub triggers_succeeded: usize,
    pub triggers_abandoned: usize,

    /// Collection requests given up on after permanent failures
    pub insertions_abandoned: usize,
}

/// Coordinator of the metric-node tree.
///
/// Owns the node arena, the lookup tables, the overhead ledger and the retry
/// queues of one collection session. Every method runs to completion; the
/// engine is meant to be driven by one sequential event loop.
pub struct Engine {
    pub(crate) config: EngineConfig,
    pub(crate) catalog: MetricCatalog,
    pub(crate) registry: Registry,
    pub(crate) ledger: CostLedger,
    pub(crate) retry: RetryQueues,
    pub(crate) patcher: Box<dyn CodePatcher>,
    pub(crate) control: Box<dyn ProcessControl>,
    pub(crate) sink: Box<dyn SampleSink>,
    pub(crate) stats: EngineStats,
}

impl Engine {
    pub fn new(
        mut config: EngineConfig,
        catalog: MetricCatalog,
        patcher: Box<dyn CodePatcher>,
        control: Box<dyn ProcessControl>,
        sink: Box<dyn SampleSink>,
    ) -> Self {
        if config.sampling == SourceFamily::GateOnly {
            warn!("gate-only values cannot be sampled, using polled sampling");
            config.sampling = SourceFamily::Polled;
        }
        let ledger = CostLedger::new(config.cost_budget);
        Self {
            config,
            catalog,
            registry: Registry::default(),
            ledger,
            retry: RetryQueues::default(),
            patcher,
            control,
            sink,
            stats: EngineStats::default(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn catalog(&self) -> &MetricCatalog {
        &self.catalog
    }

    /// Catalog used for later requests; registered metrics apply immediately
    pub fn catalog_mut(&mut self) -> &mut MetricCatalog {
        &mut self.catalog
    }

    pub fn stats(&self) -> EngineStats {
        self.stats
    }

    /// Current total of predicted overhead
    pub fn predicted_cost(&self) -> f64 {
        self.ledger.total()
    }

    /// Overhead that collecting `metric` over `focus` would add now.
    ///
    /// Only primitives that do not exist yet are counted, since existing
    /// ones are shared.
    pub fn guess_cost(&self, metric: &str, focus: &Focus) -> Result<f64, CollectError> {
        let def = self.definition(metric)?;
        let pids = self.matching_processes(focus)?;
        Ok(self.new_primitive_cost(def, focus, &pids))
    }

    /// Starts collecting `metric` over `focus`.
    ///
    /// Rejected without touching any process when the predicted overhead
    /// does not fit the budget. A request whose points cannot be resolved is
    /// retried on later ticks under the returned id while attempts remain.
    pub fn start_collecting(&mut self, metric: &str, focus: &Focus) -> Result<MetricId, CollectError> {
        let def = self.definition(metric)?.clone();
        let id = self.registry.next_metric_id();
        match self.build_metric(id, &def, focus) {
            Ok(_) => Ok(id),
            Err(CollectError::Install(e)) if self.config.max_insert_attempts > 1 => {
                self.requeue_or_fail(PendingInsertion::new(id, metric, focus, e));
                Ok(id)
            }
            Err(e) => Err(e),
        }
    }

    /// Stops collecting. Disabling a metric twice is a no-op.
    pub fn disable(&mut self, metric: MetricId) -> Result<(), CollectError> {
        if self.retry.forget_metric(metric) {
            info!("dropped pending request {}", metric);
            return Ok(());
        }
        match self.registry.metric(metric) {
            Some(agg) => {
                self.destroy_node(agg, true);
                info!("stopped collecting {}", metric);
                Ok(())
            }
            None if self.registry.was_issued(metric) => {
                debug!("{} already disabled", metric);
                Ok(())
            }
            None => Err(CollectError::UnknownMetricId(metric)),
        }
    }

    /// Periodic work: polls sampled values and drains the retry queues
    pub fn tick(&mut self, now: Timestamp) {
        self.poll(now);
        self.retry_deferred();
        self.retry_pending();
        self.drain_triggers();
    }

    /// Re-aligns every aggregator to intervals of `interval_ns`
    pub fn set_aggregation_interval(&mut self, interval_ns: u64) {
        self.config.aggregation_interval_ns = interval_ns;
        for node in self.registry.nodes_mut() {
            if let Some(agg) = node.aggregator.as_mut() {
                agg.set_interval_width(interval_ns);
            }
        }
    }

    pub fn node(&self, id: NodeId) -> Option<&MetricNode> {
        self.registry.node(id)
    }

    /// The aggregate node of a metric
    pub fn metric_node(&self, metric: MetricId) -> Option<&MetricNode> {
        self.registry.metric(metric).and_then(|id| self.registry.node(id))
    }

    /// Lifecycle state of a metric, including requests waiting for a retry
    pub fn metric_state(&self, metric: MetricId) -> Option<NodeState> {
        if self.retry.is_pending(metric) {
            return Some(NodeState::InsertionPending);
        }
        self.registry.metric(metric).map(|id| self.node_state(id))
    }

    /// State of a node, derived from its primitives for higher levels
    pub fn node_state(&self, id: NodeId) -> NodeState {
        let Some(node) = self.registry.node(id) else {
            return NodeState::Disabled;
        };
        match node.kind {
            NodeKind::Primitive | NodeKind::ThreadLevel => node.state,
            NodeKind::Aggregate | NodeKind::Component => {
                let states: Vec<NodeState> = node.components.iter().map(|c| self.node_state(*c)).collect();
                if states.contains(&NodeState::Deferred) {
                    NodeState::Deferred
                } else if states.iter().all(|s| *s == NodeState::Active) {
                    NodeState::Active
                } else {
                    NodeState::InsertionPending
                }
            }
        }
    }

    pub fn count_nodes(&self, kind: NodeKind) -> usize {
        self.registry.count_kind(kind)
    }

    pub fn primitives_in(&self, pid: Pid) -> Vec<NodeId> {
        self.registry.primitives_of(pid)
    }

    pub fn components_in(&self, pid: Pid) -> Vec<NodeId> {
        self.registry.components_of(pid)
    }

    /// Last aggregated interval of a metric, `None` while undefined
    pub fn current_sample(&self, metric: MetricId) -> Option<Sample> {
        self.metric_node(metric)
            .and_then(|n| n.aggregator.as_ref())
            .and_then(Aggregator::current)
    }

    pub fn pending_insertions(&self) -> usize {
        self.retry.pending_len()
    }

    pub fn deferred_nodes(&self) -> usize {
        self.retry.deferred_len()
    }

    pub fn pending_triggers(&self) -> usize {
        self.retry.triggers_len()
    }

    fn definition(&self, metric: &str) -> Result<&MetricDefinition, CollectError> {
        self.catalog
            .get(metric)
            .ok_or_else(|| CollectError::UnknownMetric(metric.to_string()))
    }

    fn matching_processes(&self, focus: &Focus) -> Result<Vec<Pid>, CollectError> {
        let pids: Vec<Pid> = self
            .control
            .processes()
            .into_iter()
            .filter(|pid| self.control.resource_matches(focus, *pid))
            .collect();
        if pids.is_empty() && focus.process().is_some() {
            return Err(CollectError::NoMatchingProcess(focus.to_string()));
        }
        Ok(pids)
    }

    pub(crate) fn plan(&self, def: &MetricDefinition, focus: &Focus, pid: Pid) -> ComponentPlan {
        plan_component(def, focus, pid, self.config.sampling, self.patcher.as_ref())
    }

    fn new_primitive_cost(&self, def: &MetricDefinition, focus: &Focus, pids: &[Pid]) -> f64 {
        let mut seen = BTreeSet::new();
        let mut cost = 0.0;
        for &pid in pids {
            let plan = self.plan(def, focus, pid);
            if self.registry.component(&plan.flat_name(pid)).is_some() {
                continue;
            }
            for primitive in &plan.primitives {
                let name = primitive.flat_name(pid);
                if primitive.shareable && self.registry.primitive(&name).is_some() {
                    continue;
                }
                if seen.insert(name) {
                    cost += primitive.cost;
                }
            }
        }
        cost
    }

    /// Builds the whole tree of one collection request, or nothing
    pub(crate) fn build_metric(
        &mut self,
        id: MetricId,
        def: &MetricDefinition,
        focus: &Focus,
    ) -> Result<NodeId, CollectError> {
        let pids = self.matching_processes(focus)?;
        let cost = self.new_primitive_cost(def, focus, &pids);
        if let Err(e) = self.ledger.check(cost) {
            info!("rejected {} over {}: {}", def.name, focus, e);
            return Err(e.into());
        }

        let agg = self.create_aggregate(id, def, focus);
        for &pid in &pids {
            if let Err(e) = self.attach_process(agg, def, focus, pid) {
                warn!(
                    "{} over {} failed in process {}: {}",
                    def.name, focus, pid, e
                );
                self.destroy_node(agg, true);
                return Err(CollectError::Install(e));
            }
        }

        info!(
            "collecting {} over {} as {} in {} processes, overhead now {:.4}",
            def.name,
            focus,
            id,
            pids.len(),
            self.ledger.total()
        );
        Ok(agg)
    }

    fn create_aggregate(&mut self, metric: MetricId, def: &MetricDefinition, focus: &Focus) -> NodeId {
        let id = self.registry.next_node_id();
        let mut node = MetricNode::new(
            id,
            NodeKind::Aggregate,
            &def.name,
            focus.clone(),
            format!("{}|{}|{}", def.name, focus.flat_name(), metric.0),
        );
        node.metric_id = Some(metric);
        node.aggregator = Some(Aggregator::new(def.op, self.config.aggregation_interval_ns));
        node.state = NodeState::Active;
        self.registry.insert(node)
    }

    /// Extends an aggregate with the component for `pid`, sharing an
    /// existing one when the same metric already covers the process
    pub(crate) fn attach_process(
        &mut self,
        agg: NodeId,
        def: &MetricDefinition,
        focus: &Focus,
        pid: Pid,
    ) -> Result<(), InstallError> {
        let plan = self.plan(def, focus, pid);
        let component = match self.registry.component(&plan.flat_name(pid)) {
            Some(existing) => existing,
            None => self.create_component(&plan, def, pid)?,
        };
        self.link(agg, component);
        Ok(())
    }

    pub(crate) fn create_component(
        &mut self,
        plan: &ComponentPlan,
        def: &MetricDefinition,
        pid: Pid,
    ) -> Result<NodeId, InstallError> {
        let id = self.registry.next_node_id();
        let mut node = MetricNode::new(
            id,
            NodeKind::Component,
            &def.name,
            plan.focus.clone(),
            plan.flat_name(pid),
        );
        node.pid = Some(pid);
        node.aggregator = Some(Aggregator::new(def.op, self.config.aggregation_interval_ns));
        node.component_plan = Some(plan.clone());
        node.state = NodeState::InsertionPending;
        self.registry.insert(node);

        for primitive in &plan.primitives {
            match self.primitive_for(primitive, &def.name, &plan.focus, pid) {
                Ok(child) => self.link(id, child),
                Err(e) => {
                    self.destroy_node(id, true);
                    return Err(e);
                }
            }
        }
        Ok(id)
    }

    /// Returns the primitive for `plan` in `pid`, reusing a shareable one
    fn primitive_for(
        &mut self,
        plan: &PrimitivePlan,
        metric_name: &str,
        focus: &Focus,
        pid: Pid,
    ) -> Result<NodeId, InstallError> {
        let name = plan.flat_name(pid);
        if plan.shareable {
            if let Some(existing) = self.registry.primitive(&name) {
                debug!("sharing primitive {}", name);
                return Ok(existing);
            }
        }

        let id = self.registry.next_node_id();
        let mut node = MetricNode::new(id, NodeKind::Primitive, metric_name, focus.clone(), name);
        node.pid = Some(pid);
        node.shareable = plan.shareable;
        node.predicted_cost = plan.cost;
        node.data_requests = self.primitive_data(plan);
        node.inst_requests = plan.inst_requests();
        node.primitive_plan = Some(plan.clone());
        node.state = NodeState::InsertionPending;
        self.registry.insert(node);
        self.ledger.add(plan.cost);

        if self.config.per_thread && plan.value.is_some() {
            for tid in self.control.threads(pid) {
                self.create_thread_node(id, tid);
            }
        }

        match self.install_primitive(id) {
            InsertOutcome::Failed(e) => {
                self.destroy_node(id, true);
                Err(e)
            }
            _ => Ok(id),
        }
    }

    pub(crate) fn primitive_data(&self, plan: &PrimitivePlan) -> Vec<DataRequest> {
        let mut requests = Vec::new();
        if let Some(kind) = plan.value {
            if !self.config.per_thread {
                requests.push(DataRequest::new(kind, self.config.sampling, 0));
            }
        }
        if plan.gate {
            requests.push(DataRequest::new(ValueKind::Counter, SourceFamily::GateOnly, 0));
        }
        requests
    }

    /// Adds the variable of thread `tid` under a primitive. It is installed
    /// with the primitive's next insertion.
    pub(crate) fn create_thread_node(&mut self, primitive: NodeId, tid: Tid) -> Option<NodeId> {
        let parent = self.registry.node(primitive)?;
        let kind = parent.primitive_plan.as_ref()?.value?;
        let (metric_name, focus, pid) = (parent.metric_name.clone(), parent.focus.clone(), parent.pid);
        let flat_name = format!("{}|thread{}", parent.flat_name, tid);
        let id = self.registry.next_node_id();
        let mut node = MetricNode::new(id, NodeKind::ThreadLevel, metric_name, focus, flat_name);
        node.pid = pid;
        node.tid = Some(tid);
        node.parents.push(primitive);
        node.data_requests
            .push(DataRequest::new(kind, self.config.sampling, 0));
        node.state = NodeState::InsertionPending;
        self.registry.insert(node);
        if let Some(parent) = self.registry.node_mut(primitive) {
            parent.components.push(id);
        }
        Some(id)
    }

    /// Pauses the process and installs everything the primitive owns
    pub(crate) fn install_primitive(&mut self, id: NodeId) -> InsertOutcome {
        let Some(pid) = self.registry.node(id).and_then(|n| n.pid) else {
            return InsertOutcome::Failed(InstallError::Unreachable(format!("{} has no process", id)));
        };
        let was_running = match self.control.pause(pid) {
            Ok(was_running) => was_running,
            Err(e) if e.is_transient() => return self.defer(id, pid),
            Err(e) => return InsertOutcome::Failed(e),
        };
        let result = self.try_insert(id, pid);
        if was_running {
            self.control.resume(pid);
        }

        match result {
            Ok(()) => {
                self.activate(id);
                InsertOutcome::Active
            }
            Err(e) if e.is_transient() => self.defer(id, pid),
            Err(e) => {
                warn!("cannot instrument process {} for {}: {}", pid, id, e);
                InsertOutcome::Failed(e)
            }
        }
    }

    fn try_insert(&mut self, id: NodeId, pid: Pid) -> Result<(), InstallError> {
        // Thread variables come first: the primitive's snippets write them
        let threads = self
            .registry
            .node(id)
            .map(|n| n.components.clone())
            .unwrap_or_default();
        for thread in threads {
            if let Some(node) = self.registry.node_mut(thread) {
                outcome_to_result(node.insert_instrumentation(self.patcher.as_mut(), self.control.as_ref()))?;
            }
        }

        let node = self
            .registry
            .node_mut(id)
            .ok_or_else(|| InstallError::Unreachable(format!("{} vanished", id)))?;
        node.allocate_data(self.patcher.as_mut(), self.control.as_ref())?;
        self.bind(id, pid)?;

        match self.registry.node_mut(id) {
            Some(node) => outcome_to_result(
                node.insert_instrumentation(self.patcher.as_mut(), self.control.as_ref()),
            ),
            None => Ok(()),
        }
    }

    /// Points the primitive's snippets at its current variables, moving
    /// installed ones whose variables changed
    pub(crate) fn bind(&mut self, id: NodeId, pid: Pid) -> Result<(), InstallError> {
        let Some(node) = self.registry.node(id) else {
            return Ok(());
        };
        let Some(plan) = node.primitive_plan.clone() else {
            return Ok(());
        };

        let value = self.value_location(node);
        let gate = node.gate_location();
        let guard = if plan.gate {
            gate.clone()
        } else {
            match plan.guard_name(pid) {
                Some(name) => Some(
                    self.registry
                        .primitive(&name)
                        .and_then(|g| self.registry.node(g))
                        .and_then(MetricNode::gate_location)
                        .ok_or(InstallError::ProcessBusy)?,
                ),
                None => None,
            }
        };

        let mut snippets = Vec::with_capacity(plan.insts.len());
        for inst in &plan.insts {
            let target = match inst.target {
                ValueTarget::Value => value.clone(),
                ValueTarget::Gate => gate.clone(),
            }
            .ok_or_else(|| InstallError::Unreachable(format!("no variable for {}", inst.point)))?;
            let mut snippet = BoundSnippet::new(inst.op, inst.effect, target);
            if inst.guarded {
                if let Some(guard) = &guard {
                    snippet = snippet.guarded_by(guard.clone());
                }
            }
            snippets.push(snippet);
        }

        let Some(node) = self.registry.node_mut(id) else {
            return Ok(());
        };
        for (request, snippet) in node.inst_requests.iter_mut().zip(snippets) {
            if !request.is_bound() || request.snippet() != &snippet {
                request.rebind(pid, snippet, self.patcher.as_mut())?;
            }
        }
        Ok(())
    }

    fn value_location(&self, node: &MetricNode) -> Option<DataLocation> {
        if let Some(location) = node.sampled_location() {
            return Some(location);
        }
        if !self.config.per_thread {
            return None;
        }
        let per_thread = node
            .components
            .iter()
            .filter_map(|t| self.registry.node(*t))
            .filter_map(|t| Some((t.tid?, t.sampled_location()?)))
            .collect();
        Some(DataLocation::PerThread(per_thread))
    }

    fn defer(&mut self, id: NodeId, pid: Pid) -> InsertOutcome {
        if let Some(node) = self.registry.node_mut(id) {
            node.state = NodeState::Deferred;
        }
        self.retry.defer(id);
        info!("instrumentation of {} deferred: process {} is busy", id, pid);
        InsertOutcome::Deferred
    }

    /// Marks a freshly installed primitive active, indexes its sampled
    /// values and queues manual triggers for functions already running
    fn activate(&mut self, id: NodeId) {
        let now = self.control.now();
        let Some(node) = self.registry.node_mut(id) else {
            return;
        };
        let Some(pid) = node.pid else {
            return;
        };
        node.state = NodeState::Active;
        // Reinstalls after exec or fork do not replay calls already running
        let first_activation = node.start_time.is_none();
        let initial = node
            .sampled_request()
            .map(|r| r.initial_value() as f64)
            .unwrap_or(0.0);
        node.mark_started(now, initial);

        let mut sampled: Vec<(NodeId, Option<u64>)> = vec![(id, node.sampled_request().and_then(DataRequest::get_address))];
        let triggers: Vec<usize> = node
            .inst_requests
            .iter()
            .enumerate()
            .filter(|(_, r)| first_activation && r.is_triggerable())
            .filter(|(_, r)| {
                r.entry_function()
                    .map(|f| self.control.is_on_stack(pid, f))
                    .unwrap_or(false)
            })
            .map(|(i, _)| i)
            .collect();
        let threads = node.components.clone();

        for thread in threads {
            if let Some(t) = self.registry.node_mut(thread) {
                t.state = NodeState::Active;
                t.mark_started(now, 0.0);
                sampled.push((thread, t.sampled_request().and_then(DataRequest::get_address)));
            }
        }
        for (owner, address) in sampled {
            if let Some(address) = address {
                self.registry.register_address(pid, address, owner);
            }
        }
        for index in triggers {
            debug!("queued manual trigger of request {} of {}", index, id);
            self.retry.queue_trigger(id, index);
        }
    }

    /// Makes `child` an owned child of `parent` and feeds its samples into
    /// the parent's aggregator
    pub(crate) fn link(&mut self, parent: NodeId, child: NodeId) {
        let sources = self.sources_of(child);
        if let Some(node) = self.registry.node_mut(parent) {
            if !node.components.contains(&child) {
                node.components.push(child);
            }
            if let Some(agg) = node.aggregator.as_mut() {
                for source in sources {
                    if !agg.contains(source.0) {
                        if let Err(e) = agg.add_child(source.0) {
                            warn!("cannot add {} to {}: {}", source, parent, e);
                        }
                    }
                }
            }
        }
        if let Some(node) = self.registry.node_mut(child) {
            if !node.parents.contains(&parent) {
                node.parents.push(parent);
            }
        }
    }

    /// Removes the ownership edge. A child left without owners is destroyed.
    pub(crate) fn unlink(&mut self, parent: NodeId, child: NodeId, points_still_reachable: bool) {
        let sources = self.sources_of(child);
        if let Some(node) = self.registry.node_mut(parent) {
            node.components.retain(|c| *c != child);
        }
        self.detach_sources(parent, &sources);

        let orphan = match self.registry.node_mut(child) {
            Some(node) => {
                node.parents.retain(|p| *p != parent);
                node.parents.is_empty()
            }
            None => false,
        };
        if orphan {
            self.destroy_node(child, points_still_reachable);
        }
    }

    /// Node ids whose samples a parent of `child` aggregates
    pub(crate) fn sources_of(&self, child: NodeId) -> Vec<NodeId> {
        let Some(node) = self.registry.node(child) else {
            return Vec::new();
        };
        match node.kind {
            NodeKind::Component | NodeKind::ThreadLevel => vec![child],
            NodeKind::Primitive => {
                if node.sampled_request().is_some() {
                    vec![child]
                } else {
                    node.components.clone()
                }
            }
            NodeKind::Aggregate => Vec::new(),
        }
    }

    /// Removes sources from a consumer's aggregator, publishing whatever
    /// the removal releases
    pub(crate) fn detach_sources(&mut self, consumer: NodeId, sources: &[NodeId]) {
        let mut released = Vec::new();
        if let Some(agg) = self
            .registry
            .node_mut(consumer)
            .and_then(|n| n.aggregator.as_mut())
        {
            for source in sources {
                if !agg.contains(source.0) {
                    continue;
                }
                match agg.remove_child(source.0) {
                    Ok(Some(sample)) => released.push(sample),
                    Ok(None) => {}
                    Err(e) => warn!("cannot remove {} from {}: {}", source, consumer, e),
                }
            }
        }
        for sample in released {
            self.publish(consumer, sample);
        }
    }

    /// Destroys a node: its requests are disabled, it leaves every owner and
    /// consumer, and children left without owners are destroyed with it
    pub(crate) fn destroy_node(&mut self, id: NodeId, points_still_reachable: bool) {
        let Some(mut node) = self.registry.remove(id) else {
            return;
        };
        self.retry.forget(id);

        for parent in &node.parents {
            if let Some(p) = self.registry.node_mut(*parent) {
                p.components.retain(|c| *c != id);
            }
        }
        let consumers: Vec<NodeId> = if node.kind == NodeKind::ThreadLevel {
            node.parents
                .iter()
                .filter_map(|p| self.registry.node(*p))
                .flat_map(|p| p.parents.clone())
                .collect()
        } else {
            node.parents.clone()
        };
        for consumer in consumers {
            self.detach_sources(consumer, &[id]);
        }

        node.disable_requests(self.patcher.as_mut(), self.control.as_ref(), points_still_reachable);
        if node.kind == NodeKind::Primitive {
            self.ledger.sub(node.predicted_cost);
        }
        debug!("destroyed {} {} ({})", node.kind, node.flat_name, id);

        for child in node.components {
            let orphan = match self.registry.node_mut(child) {
                Some(c) => {
                    c.parents.retain(|p| *p != id);
                    c.parents.is_empty()
                }
                None => false,
            };
            if orphan {
                self.destroy_node(child, points_still_reachable);
            }
        }
    }

    /// Removes every component owning a primitive that cannot be installed.
    /// A metric left without components goes back to the pending queue.
    pub(crate) fn abandon_primitive(&mut self, id: NodeId, error: &InstallError) {
        let components = self
            .registry
            .node(id)
            .map(|n| n.parents.clone())
            .unwrap_or_default();
        warn!("giving up on {}: {}; removing {} components", id, error, components.len());
        let mut touched = BTreeSet::new();
        for component in components {
            let aggregates = self
                .registry
                .node(component)
                .map(|n| n.parents.clone())
                .unwrap_or_default();
            for agg in aggregates {
                self.unlink(agg, component, true);
                touched.insert(agg);
            }
        }
        self.destroy_node(id, true);

        for agg in touched {
            let pending = match self.registry.node(agg) {
                Some(node) if node.components.is_empty() => match node.metric_id {
                    Some(metric) => PendingInsertion::new(metric, &node.metric_name, &node.focus, error.clone()),
                    None => continue,
                },
                _ => continue,
            };
            self.destroy_node(agg, true);
            self.requeue_or_fail(pending);
        }
    }

    fn requeue_or_fail(&mut self, pending: PendingInsertion) {
        if pending.attempts >= self.config.max_insert_attempts {
            warn!(
                "giving up on {} over {} after {} attempts: {}",
                pending.metric_name, pending.focus, pending.attempts, pending.last_error
            );
            self.stats.insertions_abandoned += 1;
            self.sink.on_collect_failed(pending.metric, &pending.last_error);
        } else {
            info!(
                "{} over {} queued for another attempt: {}",
                pending.metric_name, pending.focus, pending.last_error
            );
            self.retry.queue_pending(pending);
        }
    }

    /// Retries primitives whose process was busy
    pub fn retry_deferred(&mut self) {
        for id in self.retry.take_deferred() {
            if self.registry.node(id).map(|n| n.state) != Some(NodeState::Deferred) {
                continue;
            }
            match self.install_primitive(id) {
                InsertOutcome::Active => info!("{} installed after deferral", id),
                InsertOutcome::Deferred => {}
                InsertOutcome::Failed(e) => self.abandon_primitive(id, &e),
            }
        }
    }

    fn retry_pending(&mut self) {
        for mut pending in self.retry.take_pending() {
            let result = match self.catalog.get(&pending.metric_name).cloned() {
                Some(def) => self.build_metric(pending.metric, &def, &pending.focus),
                None => Err(CollectError::UnknownMetric(pending.metric_name.clone())),
            };
            match result {
                Ok(_) => info!(
                    "{} over {} installed after {} attempts",
                    pending.metric_name,
                    pending.focus,
                    pending.attempts + 1
                ),
                Err(e) => {
                    pending.attempts += 1;
                    pending.last_error = e;
                    self.requeue_or_fail(pending);
                }
            }
        }
    }

    fn drain_triggers(&mut self) {
        for mut trigger in self.retry.take_triggers() {
            let Some(node) = self.registry.node(trigger.node) else {
                continue;
            };
            let (Some(pid), Some(request)) = (node.pid, node.inst_requests.get(trigger.request)) else {
                continue;
            };
            if request.trigger_once(pid, self.patcher.as_mut()) {
                debug!("manually triggered {} in process {}", request.point(), pid);
                self.stats.triggers_succeeded += 1;
                continue;
            }
            trigger.attempts += 1;
            if trigger.attempts >= self.config.max_trigger_attempts {
                warn!(
                    "manual trigger of {} in process {} failed {} times, giving up",
                    request.point(),
                    pid,
                    trigger.attempts
                );
                self.stats.triggers_abandoned += 1;
            } else {
                self.retry.requeue_trigger(trigger);
            }
        }
    }
}

fn outcome_to_result(outcome: InsertOutcome) -> Result<(), InstallError> {
    match outcome {
        InsertOutcome::Active => Ok(()),
        InsertOutcome::Deferred => Err(InstallError::ProcessBusy),
        InsertOutcome::Failed(e) => Err(e),
    }
}
