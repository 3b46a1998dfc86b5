//! # engine
//!
//! Turns "collect metric M over focus F" into instrumentation inside target
//! processes and turns the resulting raw samples back into one value per
//! metric.
//!
//! Requests are expanded into a tree of [`MetricNode`]s: one `Aggregate` per
//! metric, one `Component` per process, and `Primitive` nodes that own the
//! actual instrumentation. Primitives requiring identical instrumentation are
//! shared between metrics. The tree is kept consistent across fork, exec,
//! exit and thread events by the [`Engine`]; all of it runs on the single
//! sequential [`Reactor`].

mod catalog;
mod config;
mod cost;
mod engine;
mod error;
mod lifecycle;
mod node;
mod plan;
mod reactor;
mod registry;
mod retry;
mod sampling;
mod sink;

pub use catalog::*;
pub use config::*;
pub use cost::*;
pub use engine::*;
pub use error::*;
pub use node::*;
pub use reactor::*;
pub use sink::*;
