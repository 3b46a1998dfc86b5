use std::collections::{BTreeMap, BTreeSet};

use instrumentation::{Address, Pid};

use crate::node::{MetricId, MetricNode, NodeId, NodeKind};

/// Arena of every live node plus the lookup tables of one collection session
#[derive(Debug, Default)]
pub(crate) struct Registry {
    nodes: BTreeMap<NodeId, MetricNode>,
    metrics: BTreeMap<MetricId, NodeId>,
    primitives: BTreeMap<String, NodeId>,
    components: BTreeMap<String, NodeId>,
    /// Sampled values by their location in the target
    by_address: BTreeMap<(Pid, Address), NodeId>,
    /// Locations written by instrumentation that could not be removed
    unreliable: BTreeSet<(Pid, Address)>,
    next_node: u64,
    next_metric: u32,
}

impl Registry {
    pub fn next_node_id(&mut self) -> NodeId {
        self.next_node += 1;
        NodeId(self.next_node)
    }

    pub fn next_metric_id(&mut self) -> MetricId {
        self.next_metric += 1;
        MetricId(self.next_metric)
    }

    /// Adds a node, indexing it by flat name when it is a component or primitive
    pub fn insert(&mut self, node: MetricNode) -> NodeId {
        let id = node.id;
        match node.kind {
            NodeKind::Primitive => {
                self.primitives.insert(node.flat_name.clone(), id);
            }
            NodeKind::Component => {
                self.components.insert(node.flat_name.clone(), id);
            }
            NodeKind::Aggregate => {
                if let Some(metric) = node.metric_id {
                    self.metrics.insert(metric, id);
                }
            }
            NodeKind::ThreadLevel => {}
        }
        self.nodes.insert(id, node);
        id
    }

    /// Removes a node and every index entry pointing at it
    pub fn remove(&mut self, id: NodeId) -> Option<MetricNode> {
        let node = self.nodes.remove(&id)?;
        let index = match node.kind {
            NodeKind::Primitive => Some(&mut self.primitives),
            NodeKind::Component => Some(&mut self.components),
            _ => None,
        };
        if let Some(index) = index {
            if index.get(&node.flat_name) == Some(&id) {
                index.remove(&node.flat_name);
            }
        }
        if let Some(metric) = node.metric_id {
            if self.metrics.get(&metric) == Some(&id) {
                self.metrics.remove(&metric);
            }
        }
        self.by_address.retain(|_, owner| *owner != id);
        Some(node)
    }

    pub fn node(&self, id: NodeId) -> Option<&MetricNode> {
        self.nodes.get(&id)
    }

    pub fn node_mut(&mut self, id: NodeId) -> Option<&mut MetricNode> {
        self.nodes.get_mut(&id)
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.contains_key(&id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &MetricNode> {
        self.nodes.values()
    }

    pub fn nodes_mut(&mut self) -> impl Iterator<Item = &mut MetricNode> {
        self.nodes.values_mut()
    }

    /// Whether `metric` was ever handed out by this registry
    pub fn was_issued(&self, metric: MetricId) -> bool {
        metric.0 >= 1 && metric.0 <= self.next_metric
    }

    pub fn metric(&self, metric: MetricId) -> Option<NodeId> {
        self.metrics.get(&metric).copied()
    }

    pub fn metrics(&self) -> Vec<(MetricId, NodeId)> {
        self.metrics.iter().map(|(m, n)| (*m, *n)).collect()
    }

    pub fn primitive(&self, flat_name: &str) -> Option<NodeId> {
        self.primitives.get(flat_name).copied()
    }

    pub fn component(&self, flat_name: &str) -> Option<NodeId> {
        self.components.get(flat_name).copied()
    }

    pub fn register_address(&mut self, pid: Pid, address: Address, id: NodeId) {
        self.by_address.insert((pid, address), id);
    }

    pub fn unregister_addresses(&mut self, id: NodeId) {
        self.by_address.retain(|_, owner| *owner != id);
    }

    pub fn by_address(&self, pid: Pid, address: Address) -> Option<NodeId> {
        self.by_address.get(&(pid, address)).copied()
    }

    /// Every registered sampled value
    pub fn sampled(&self) -> Vec<(Pid, Address, NodeId)> {
        self.by_address
            .iter()
            .map(|((pid, addr), id)| (*pid, *addr, *id))
            .collect()
    }

    pub fn mark_unreliable(&mut self, pid: Pid, address: Address) {
        self.unreliable.insert((pid, address));
    }

    pub fn is_unreliable(&self, pid: Pid, address: Address) -> bool {
        self.unreliable.contains(&(pid, address))
    }

    /// Forgets a process's unreliable locations once its image is gone
    pub fn clear_unreliable(&mut self, pid: Pid) {
        self.unreliable.retain(|(p, _)| *p != pid);
    }

    pub fn of_kind_in(&self, kind: NodeKind, pid: Pid) -> Vec<NodeId> {
        self.nodes
            .values()
            .filter(|n| n.kind == kind && n.pid == Some(pid))
            .map(|n| n.id)
            .collect()
    }

    pub fn components_of(&self, pid: Pid) -> Vec<NodeId> {
        self.of_kind_in(NodeKind::Component, pid)
    }

    pub fn primitives_of(&self, pid: Pid) -> Vec<NodeId> {
        self.of_kind_in(NodeKind::Primitive, pid)
    }

    pub fn count_kind(&self, kind: NodeKind) -> usize {
        self.nodes.values().filter(|n| n.kind == kind).count()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use instrumentation::Focus;

    fn node(registry: &mut Registry, kind: NodeKind, name: &str, pid: Pid) -> NodeId {
        let id = registry.next_node_id();
        let mut node = MetricNode::new(id, kind, "m", Focus::whole_program(), name);
        node.pid = Some(pid);
        registry.insert(node)
    }

    #[test]
    fn test_indexes_follow_insert_and_remove() {
        let mut registry = Registry::default();
        let prim = node(&mut registry, NodeKind::Primitive, "p", 5);
        let comp = node(&mut registry, NodeKind::Component, "c", 5);
        registry.register_address(5, 0x40, prim);

        assert_eq!(registry.primitive("p"), Some(prim));
        assert_eq!(registry.component("c"), Some(comp));
        assert_eq!(registry.by_address(5, 0x40), Some(prim));
        assert_eq!(registry.primitives_of(5), vec![prim]);
        assert!(registry.components_of(6).is_empty());

        assert!(registry.remove(prim).is_some());
        assert_eq!(registry.primitive("p"), None);
        assert_eq!(registry.by_address(5, 0x40), None);
        assert!(registry.remove(prim).is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_aggregate_indexed_by_metric() {
        let mut registry = Registry::default();
        let metric = registry.next_metric_id();
        let id = registry.next_node_id();
        let mut agg = MetricNode::new(id, NodeKind::Aggregate, "m", Focus::whole_program(), "m|/");
        agg.metric_id = Some(metric);
        registry.insert(agg);

        assert_eq!(registry.metric(metric), Some(id));
        registry.remove(id);
        assert_eq!(registry.metric(metric), None);
    }

    #[test]
    fn test_unreliable_locations() {
        let mut registry = Registry::default();
        registry.mark_unreliable(7, 0x10);
        assert!(registry.is_unreliable(7, 0x10));
        assert!(!registry.is_unreliable(8, 0x10));
        registry.clear_unreliable(7);
        assert!(!registry.is_unreliable(7, 0x10));
    }
}
