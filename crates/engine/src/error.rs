use instrumentation::message::MessageError;
use instrumentation::{InstallError, Pid};
use thiserror::Error;

use crate::node::{MetricId, NodeId};

/// A request was rejected because of the overhead budget
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CostError {
    #[error("predicted overhead {requested:.4} on top of {current:.4} exceeds budget {budget:.4}")]
    BudgetExceeded {
        requested: f64,
        current: f64,
        budget: f64,
    },
}

/// Errors surfaced to the originator of a collection request
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CollectError {
    #[error("unknown metric {0}")]
    UnknownMetric(String),

    #[error("no metric with id {0}")]
    UnknownMetricId(MetricId),

    #[error("no process matches focus {0}")]
    NoMatchingProcess(String),

    #[error(transparent)]
    Budget(#[from] CostError),

    #[error("instrumentation failed: {0}")]
    Install(#[from] InstallError),
}

/// Instrumentation a child inherited through fork could not be removed
#[derive(Error, Debug, Clone, PartialEq)]
#[error("stale instrumentation of {node} left in process {child}: {detail}")]
pub struct ForkConsistencyError {
    pub child: Pid,
    pub node: NodeId,
    pub detail: String,
}

/// Errors while handling a record from a target
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SampleError {
    #[error("malformed record: {0}")]
    Message(#[from] MessageError),
}
