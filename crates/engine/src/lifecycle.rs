use std::collections::{BTreeMap, BTreeSet};

use aggregation::{AggregateOp, Aggregator};
use instrumentation::{
    Address, DataRequest, ForkError, ForkMap, InstRequest, Pid, SourceFamily, Tid,
};
use log::{error, info, warn};

use crate::engine::Engine;
use crate::error::ForkConsistencyError;
use crate::node::{InsertOutcome, MetricNode, NodeId, NodeKind, NodeState};
use crate::plan::ComponentPlan;

impl Engine {
    /// Brings the tree in line with a fork of `parent` into `child`.
    ///
    /// Components whose metric still covers the child are duplicated there,
    /// sharing duplicated primitives the way the parent shares them. Every
    /// other primitive of the parent is removed from the child, since fork
    /// copied its code regardless. Removal failures are returned; the
    /// affected values in the child are never aggregated.
    pub fn handle_fork(&mut self, parent: Pid, child: Pid, map: &ForkMap) -> Vec<ForkConsistencyError> {
        self.stats.forks_handled += 1;
        let mut duplicated: BTreeMap<NodeId, NodeId> = BTreeMap::new();
        // Primitives whose twin was built and destroyed again in the child
        let mut torn_down: BTreeSet<NodeId> = BTreeSet::new();
        let mut carried = 0;

        for component in self.registry.components_of(parent) {
            let aggregates: Vec<NodeId> = self
                .registry
                .node(component)
                .map(|n| n.parents.clone())
                .unwrap_or_default()
                .into_iter()
                .filter(|agg| {
                    self.registry
                        .node(*agg)
                        .map(|n| self.control.resource_matches(&n.focus, child))
                        .unwrap_or(false)
                })
                .collect();
            if aggregates.is_empty() {
                continue;
            }

            match self.fork_component(component, parent, child, map, &mut duplicated) {
                Ok(copy) => {
                    for agg in aggregates {
                        self.link(agg, copy);
                    }
                    carried += 1;
                }
                Err(e) => {
                    warn!("cannot carry {} into process {}: {}", component, child, e);
                    let dead: Vec<NodeId> = duplicated
                        .iter()
                        .filter(|(_, copy)| !self.registry.contains(**copy))
                        .map(|(original, _)| *original)
                        .collect();
                    for original in dead {
                        duplicated.remove(&original);
                        torn_down.insert(original);
                    }
                }
            }
        }

        let mut errors = Vec::new();
        for primitive in self.registry.primitives_of(parent) {
            if duplicated.contains_key(&primitive) || torn_down.contains(&primitive) {
                continue;
            }
            if let Err(e) = self.un_fork_primitive(primitive, child, map) {
                errors.push(e);
            }
        }

        info!(
            "fork {} -> {}: {} components carried over, {} primitives, {} removal errors",
            parent,
            child,
            carried,
            duplicated.len(),
            errors.len()
        );
        errors
    }

    /// Duplicates one component into the child, reusing primitives already
    /// duplicated for another component
    fn fork_component(
        &mut self,
        component: NodeId,
        parent: Pid,
        child: Pid,
        map: &ForkMap,
        duplicated: &mut BTreeMap<NodeId, NodeId>,
    ) -> Result<NodeId, ForkError> {
        let node = self.registry.node(component).ok_or(ForkError::NotInstalled)?;
        let plan = node.component_plan.clone().map(|plan| ComponentPlan {
            focus: plan.focus.for_process(child),
            ..plan
        });
        let flat_name = match &plan {
            Some(plan) => plan.flat_name(child),
            None => format!("{}|{}", node.flat_name, child),
        };
        if let Some(existing) = self.registry.component(&flat_name) {
            return Ok(existing);
        }

        let op = node
            .aggregator
            .as_ref()
            .map(Aggregator::op)
            .unwrap_or(AggregateOp::Sum);
        let mut copy = MetricNode::new(
            NodeId(0),
            NodeKind::Component,
            node.metric_name.clone(),
            node.focus.for_process(child),
            flat_name,
        );
        copy.state = node.state;
        let primitives = node.components.clone();

        let id = self.registry.next_node_id();
        copy.id = id;
        copy.pid = Some(child);
        copy.aggregator = Some(Aggregator::new(op, self.config.aggregation_interval_ns));
        copy.component_plan = plan;
        self.registry.insert(copy);

        for primitive in primitives {
            let twin = match duplicated.get(&primitive) {
                Some(twin) => *twin,
                None => match self.fork_primitive(primitive, parent, child, map) {
                    Ok(twin) => {
                        duplicated.insert(primitive, twin);
                        twin
                    }
                    Err(e) => {
                        self.destroy_node(id, true);
                        return Err(e);
                    }
                },
            };
            self.link(id, twin);
        }
        Ok(id)
    }

    /// Creates the child's bookkeeping twin of a primitive. The child
    /// already runs a copy of its code.
    fn fork_primitive(
        &mut self,
        primitive: NodeId,
        parent: Pid,
        child: Pid,
        map: &ForkMap,
    ) -> Result<NodeId, ForkError> {
        let node = self.registry.node(primitive).ok_or(ForkError::NotInstalled)?;
        let data_requests = node
            .data_requests
            .iter()
            .map(|r| r.duplicate_for_child(parent, child, map, self.control.as_ref()))
            .collect::<Result<Vec<DataRequest>, ForkError>>()?;
        let inst_requests = node
            .inst_requests
            .iter()
            .map(|r| r.duplicate_for_child(map))
            .collect::<Result<Vec<InstRequest>, ForkError>>()?;

        let flat_name = match &node.primitive_plan {
            Some(plan) => plan.flat_name(child),
            None => format!("{}|{}", node.flat_name, child),
        };
        let mut twin = MetricNode::new(
            NodeId(0),
            NodeKind::Primitive,
            node.metric_name.clone(),
            node.focus.for_process(child),
            flat_name,
        );
        twin.pid = Some(child);
        twin.shareable = node.shareable;
        twin.predicted_cost = node.predicted_cost;
        twin.primitive_plan = node.primitive_plan.clone();
        twin.data_requests = data_requests;
        twin.inst_requests = inst_requests;
        twin.state = node.state;
        twin.start_time = Some(self.control.now());
        twin.initial_value = node.initial_value;
        let threads = node.components.clone();
        let state = twin.state;
        let cost = twin.predicted_cost;
        let address = twin.sampled_request().and_then(DataRequest::get_address);

        let id = self.registry.next_node_id();
        twin.id = id;
        self.registry.insert(twin);
        self.ledger.add(cost);

        if self.config.per_thread && !threads.is_empty() {
            // Per-thread values belong to the parent's threads; the child
            // gets fresh ones for its own
            for thread in threads {
                self.un_fork_thread(thread, child, map);
            }
            for tid in self.control.threads(child) {
                self.create_thread_node(id, tid);
            }
            if let InsertOutcome::Failed(e) = self.install_primitive(id) {
                self.destroy_node(id, true);
                return Err(e.into());
            }
            return Ok(id);
        }

        match (state, address) {
            (NodeState::Active, Some(address)) => self.registry.register_address(child, address, id),
            (NodeState::Deferred, _) | (NodeState::InsertionPending, _) => self.retry.defer(id),
            _ => {}
        }
        if state == NodeState::InsertionPending {
            if let Some(node) = self.registry.node_mut(id) {
                node.state = NodeState::Deferred;
            }
        }
        Ok(id)
    }

    fn un_fork_thread(&mut self, thread: NodeId, child: Pid, map: &ForkMap) {
        let Some(node) = self.registry.node(thread) else {
            return;
        };
        for request in &node.data_requests {
            if let Err(e) = request.un_fork(child, map, self.patcher.as_mut()) {
                warn!("cannot remove thread value of {} from process {}: {}", thread, child, e);
            }
        }
    }

    /// Removes a primitive's inherited code and values from a child that
    /// must not keep them
    fn un_fork_primitive(&mut self, primitive: NodeId, child: Pid, map: &ForkMap) -> Result<(), ForkConsistencyError> {
        let Some(node) = self.registry.node(primitive) else {
            return Ok(());
        };
        let mut failures = Vec::new();
        for request in &node.inst_requests {
            if !request.remove_from_child(child, map, self.patcher.as_mut()) {
                failures.push(format!("patch at {}", request.point()));
            }
        }

        // Code left behind still writes the inherited values, so they stay
        let code_removed = failures.is_empty();

        let mut owners = vec![primitive];
        owners.extend(node.components.iter().copied());
        let mut stale: Vec<(Address, Option<usize>)> = Vec::new();
        for owner in owners {
            let Some(node) = self.registry.node(owner) else {
                continue;
            };
            for request in &node.data_requests {
                if code_removed {
                    if let Err(e) = request.un_fork(child, map, self.patcher.as_mut()) {
                        failures.push(e.to_string());
                    }
                }
                if request.is_sampled() {
                    if let Some(address) = request.get_address() {
                        let slot = match request.family() {
                            SourceFamily::Polled => request.slot(),
                            _ => None,
                        };
                        stale.push((address, slot));
                    }
                }
            }
        }

        if failures.is_empty() {
            return Ok(());
        }
        let err = ForkConsistencyError {
            child,
            node: primitive,
            detail: failures.join("; "),
        };
        error!("{}", err);
        self.stats.fork_consistency_errors += 1;
        let region = self.control.poll_region(child);
        for (address, slot) in stale {
            self.registry.mark_unreliable(child, address);
            if let (Some(region), Some(slot)) = (region.as_ref(), slot) {
                region.quarantine(slot);
            }
        }
        Err(err)
    }

    /// Rebuilds the tree of a process whose image was replaced.
    ///
    /// Components whose metrics no longer cover the process are dropped.
    /// Everything else is reinstalled from scratch; a primitive that cannot
    /// be reinstalled takes its components with it.
    pub fn handle_exec(&mut self, pid: Pid) {
        self.stats.execs_handled += 1;
        self.registry.clear_unreliable(pid);

        let mut dropped = 0;
        for component in self.registry.components_of(pid) {
            let aggregates = self
                .registry
                .node(component)
                .map(|n| n.parents.clone())
                .unwrap_or_default();
            let mut kept = false;
            for agg in aggregates {
                let matches = self
                    .registry
                    .node(agg)
                    .map(|n| self.control.resource_matches(&n.focus, pid))
                    .unwrap_or(false);
                if matches {
                    kept = true;
                } else {
                    self.unlink(agg, component, false);
                }
            }
            if !kept {
                dropped += 1;
            }
        }

        let primitives = self.registry.primitives_of(pid);
        for &primitive in &primitives {
            self.reset_primitive(primitive, pid);
        }
        let mut reinstalled = 0;
        for primitive in primitives {
            if !self.registry.contains(primitive) {
                continue;
            }
            match self.install_primitive(primitive) {
                InsertOutcome::Failed(e) => self.abandon_primitive(primitive, &e),
                _ => reinstalled += 1,
            }
        }
        info!(
            "exec in process {}: {} components dropped, {} primitives reinstalled",
            pid, dropped, reinstalled
        );
    }

    /// Forgets every request of a primitive whose image is gone and prepares
    /// fresh ones
    fn reset_primitive(&mut self, id: NodeId, pid: Pid) {
        let threads = self
            .registry
            .node(id)
            .map(|n| n.components.clone())
            .unwrap_or_default();
        for thread in threads {
            self.destroy_node(thread, false);
        }
        self.registry.unregister_addresses(id);
        self.retry.forget(id);

        let Some(node) = self.registry.node_mut(id) else {
            return;
        };
        node.reset_requests();
        let wants_threads = self.config.per_thread
            && node
                .primitive_plan
                .as_ref()
                .map(|p| p.value.is_some())
                .unwrap_or(false);
        if wants_threads {
            for tid in self.control.threads(pid) {
                self.create_thread_node(id, tid);
            }
            self.refresh_sources(id);
        }
    }

    /// Removes every component of a process that exited
    pub fn handle_exit(&mut self, pid: Pid) {
        self.stats.exits_handled += 1;
        let components = self.registry.components_of(pid);
        for &component in &components {
            let aggregates = self
                .registry
                .node(component)
                .map(|n| n.parents.clone())
                .unwrap_or_default();
            for agg in aggregates {
                self.unlink(agg, component, false);
            }
        }
        for primitive in self.registry.primitives_of(pid) {
            self.destroy_node(primitive, false);
        }
        self.registry.clear_unreliable(pid);
        info!("process {} exited: {} components removed", pid, components.len());
    }

    /// Extends every metric covering a newly started process onto it.
    ///
    /// The new instrumentation is charged to the ledger without a budget
    /// check: the metrics were already admitted.
    pub fn propagate_to_new_process(&mut self, pid: Pid) {
        let mut extended = 0;
        for (metric, agg) in self.registry.metrics() {
            let Some(node) = self.registry.node(agg) else {
                continue;
            };
            if !self.control.resource_matches(&node.focus, pid) {
                continue;
            }
            let covered = node
                .components
                .iter()
                .filter_map(|c| self.registry.node(*c))
                .any(|c| c.pid == Some(pid));
            if covered {
                continue;
            }
            let focus = node.focus.clone();
            let Some(def) = self.catalog.get(&node.metric_name).cloned() else {
                continue;
            };
            match self.attach_process(agg, &def, &focus, pid) {
                Ok(()) => extended += 1,
                Err(e) => warn!("cannot extend {} to process {}: {}", metric, pid, e),
            }
        }
        info!("process {} started: {} metrics extended", pid, extended);
    }

    /// Gives a new thread its own variable under every sampled primitive of
    /// the process
    pub fn add_thread(&mut self, pid: Pid, tid: Tid) {
        if !self.config.per_thread {
            return;
        }
        for primitive in self.registry.primitives_of(pid) {
            let needs_thread = match self.registry.node(primitive) {
                Some(node) => {
                    node.primitive_plan.as_ref().and_then(|p| p.value).is_some()
                        && !node
                            .components
                            .iter()
                            .filter_map(|t| self.registry.node(*t))
                            .any(|t| t.tid == Some(tid))
                }
                None => false,
            };
            if !needs_thread {
                continue;
            }
            self.create_thread_node(primitive, tid);
            self.refresh_sources(primitive);
            if let InsertOutcome::Failed(e) = self.install_primitive(primitive) {
                self.abandon_primitive(primitive, &e);
            }
        }
    }

    /// Drops the variable of an exited thread and moves the primitive's
    /// snippets onto the remaining ones
    pub fn remove_thread(&mut self, pid: Pid, tid: Tid) {
        if !self.config.per_thread {
            return;
        }
        for primitive in self.registry.primitives_of(pid) {
            let thread = self.registry.node(primitive).and_then(|node| {
                node.components
                    .iter()
                    .copied()
                    .find(|t| self.registry.node(*t).and_then(|t| t.tid) == Some(tid))
            });
            let Some(thread) = thread else {
                continue;
            };
            self.destroy_node(thread, true);
            if let InsertOutcome::Failed(e) = self.install_primitive(primitive) {
                self.abandon_primitive(primitive, &e);
            }
        }
    }

    /// A stop or continue boundary: busy processes may accept patches now
    pub fn handle_process_boundary(&mut self, pid: Pid) {
        let deferred = self.deferred_nodes();
        if deferred > 0 {
            info!("process {} changed state, retrying {} deferred nodes", pid, deferred);
        }
        self.retry_deferred();
    }

    /// Makes sure every consumer of a primitive aggregates its current sources
    fn refresh_sources(&mut self, primitive: NodeId) {
        let parents = self
            .registry
            .node(primitive)
            .map(|n| n.parents.clone())
            .unwrap_or_default();
        for parent in parents {
            self.link(parent, primitive);
        }
    }
}
