use std::collections::VecDeque;

use instrumentation::{Focus, InstallError};

use crate::error::CollectError;
use crate::node::{MetricId, NodeId};

/// A collection request whose instrumentation could not be placed yet
#[derive(Debug, Clone)]
pub(crate) struct PendingInsertion {
    pub metric: MetricId,
    pub metric_name: String,
    pub focus: Focus,
    pub attempts: u32,
    pub last_error: CollectError,
}

/// A snippet to execute once by hand because its function is already running
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TriggerRequest {
    pub node: NodeId,
    /// Index into the node's instrumentation requests
    pub request: usize,
    pub attempts: u32,
}

/// Work the reactor drains on every tick instead of blocking on
#[derive(Debug, Default)]
pub(crate) struct RetryQueues {
    deferred: VecDeque<NodeId>,
    pending: VecDeque<PendingInsertion>,
    triggers: VecDeque<TriggerRequest>,
}

impl RetryQueues {
    pub fn defer(&mut self, node: NodeId) {
        if !self.deferred.contains(&node) {
            self.deferred.push_back(node);
        }
    }

    pub fn take_deferred(&mut self) -> Vec<NodeId> {
        self.deferred.drain(..).collect()
    }

    pub fn queue_pending(&mut self, pending: PendingInsertion) {
        self.pending.push_back(pending);
    }

    pub fn take_pending(&mut self) -> Vec<PendingInsertion> {
        self.pending.drain(..).collect()
    }

    pub fn queue_trigger(&mut self, node: NodeId, request: usize) {
        self.triggers.push_back(TriggerRequest {
            node,
            request,
            attempts: 0,
        });
    }

    pub fn requeue_trigger(&mut self, trigger: TriggerRequest) {
        self.triggers.push_back(trigger);
    }

    pub fn take_triggers(&mut self) -> Vec<TriggerRequest> {
        self.triggers.drain(..).collect()
    }

    /// Drops every queued item referring to `node`
    pub fn forget(&mut self, node: NodeId) {
        self.deferred.retain(|n| *n != node);
        self.triggers.retain(|t| t.node != node);
    }

    /// Drops a pending collection request. Returns whether one was queued.
    pub fn forget_metric(&mut self, metric: MetricId) -> bool {
        let before = self.pending.len();
        self.pending.retain(|p| p.metric != metric);
        self.pending.len() != before
    }

    pub fn is_pending(&self, metric: MetricId) -> bool {
        self.pending.iter().any(|p| p.metric == metric)
    }

    pub fn deferred_len(&self) -> usize {
        self.deferred.len()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn triggers_len(&self) -> usize {
        self.triggers.len()
    }
}

impl PendingInsertion {
    pub fn new(metric: MetricId, metric_name: &str, focus: &Focus, error: InstallError) -> Self {
        Self {
            metric,
            metric_name: metric_name.to_string(),
            focus: focus.clone(),
            attempts: 1,
            last_error: CollectError::Install(error),
        }
    }
}
