//! # Aggregation
//!
//! Combines the sample streams of several children into one output stream.
//!
//! Every child reports *increments* over half-open time intervals. The
//! [`ProgressTracker`] records how far each child has reported, and the
//! [`Aggregator`] emits combined intervals up to the point that every
//! required child has covered, so children that start or stop contributing at
//! different times still produce a correct aggregate.

pub mod aggregator;
pub mod progress;

pub use aggregator::*;
pub use progress::*;

/// Nanosecond timestamp shared by every sample stream.
pub type Timestamp = u64;
