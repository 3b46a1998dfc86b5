use std::collections::{HashMap, VecDeque};
use std::fmt;

use thiserror::Error;

use crate::progress::{self, ProgressTracker};
use crate::Timestamp;

/// Errors that can occur when feeding an [`Aggregator`]
#[derive(Error, Debug, PartialEq)]
pub enum AggregatorError {
    #[error("invalid interval from child {child}: start={start} end={end}")]
    InvalidInterval {
        child: u64,
        start: Timestamp,
        end: Timestamp,
    },

    #[error("interval from child {child} starts at {start} before its previous end {previous_end}")]
    OverlappingInterval {
        child: u64,
        start: Timestamp,
        previous_end: Timestamp,
    },

    #[error("progress tracking error: {0}")]
    Progress(#[from] progress::Error),
}

/// Reduction applied across children for each emitted interval
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AggregateOp {
    Sum,
    /// Mean over the children that have reported so far
    Avg,
    Min,
    Max,
}

impl AggregateOp {
    fn reduce(self, values: &[f64]) -> Option<f64> {
        if values.is_empty() {
            return None;
        }
        let value = match self {
            AggregateOp::Sum => values.iter().sum(),
            AggregateOp::Avg => values.iter().sum::<f64>() / values.len() as f64,
            AggregateOp::Min => values.iter().copied().fold(f64::INFINITY, f64::min),
            AggregateOp::Max => values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        };
        Some(value)
    }
}

impl fmt::Display for AggregateOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AggregateOp::Sum => "sum",
            AggregateOp::Avg => "avg",
            AggregateOp::Min => "min",
            AggregateOp::Max => "max",
        };
        f.write_str(name)
    }
}

/// A value increment over the half-open interval `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    pub start: Timestamp,
    pub end: Timestamp,
    pub value: f64,
}

impl Sample {
    pub fn new(start: Timestamp, end: Timestamp, value: f64) -> Self {
        Self { start, end, value }
    }

    fn width(&self) -> u64 {
        self.end - self.start
    }

    /// Splits the sample at `at`, assuming the increment was spread evenly
    /// over the interval. Returns the part before `at` and the remainder.
    fn split_at(&self, at: Timestamp) -> (Sample, Sample) {
        let ratio = (at - self.start) as f64 / self.width() as f64;
        let head = self.value * ratio;
        (
            Sample::new(self.start, at, head),
            Sample::new(at, self.end, self.value - head),
        )
    }
}

#[derive(Debug, Default)]
struct ChildBuffer {
    pending: VecDeque<Sample>,
}

/// Combines the delta streams of zero or more children into one stream.
///
/// Each child delivers increments over intervals. Once every child has
/// covered some boundary, the aggregator emits one combined sample from the
/// end of its previous output up to that boundary. Increments straddling the
/// boundary are prorated and the remainder is kept for the next emission.
/// Gaps in a child's stream count as zero.
#[derive(Debug)]
pub struct Aggregator {
    op: AggregateOp,
    progress: ProgressTracker,
    buffers: HashMap<u64, ChildBuffer>,
    emitted_until: Option<Timestamp>,
    last_output: Option<Sample>,
    cumulative: f64,
}

impl Aggregator {
    pub fn new(op: AggregateOp, interval_width: u64) -> Self {
        Self {
            op,
            progress: ProgressTracker::new(interval_width),
            buffers: HashMap::new(),
            emitted_until: None,
            last_output: None,
            cumulative: 0.0,
        }
    }

    pub fn op(&self) -> AggregateOp {
        self.op
    }

    /// Adds a child.
    ///
    /// Children added before the first emission are required: the output is
    /// not defined until each has reported. Children added later join
    /// without holding back output and contribute zero until they report.
    pub fn add_child(&mut self, child: u64) -> Result<(), AggregatorError> {
        let required = self.emitted_until.is_none();
        self.progress.add_child(child, required)?;
        self.buffers.insert(child, ChildBuffer::default());
        Ok(())
    }

    /// Removes a child and recomputes from the remaining ones.
    ///
    /// Unemitted data of the removed child is discarded. Removing the last
    /// child leaves the output undefined. The removal may allow an emission
    /// that the removed child was holding back; that emission is returned.
    pub fn remove_child(&mut self, child: u64) -> Result<Option<Sample>, AggregatorError> {
        self.progress.remove_child(child)?;
        self.buffers.remove(&child);

        if self.buffers.is_empty() {
            self.last_output = None;
            return Ok(None);
        }
        Ok(self.try_emit())
    }

    /// Records an increment of `value` from `child` over `[start, end)`.
    ///
    /// Returns the newly emitted combined sample, if this update completed one.
    ///
    /// # Errors
    ///
    /// * `InvalidInterval` if `end <= start`
    /// * `OverlappingInterval` if the interval starts before the child's previous end
    /// * `Progress` if the child is unknown
    pub fn update(
        &mut self,
        child: u64,
        start: Timestamp,
        end: Timestamp,
        value: f64,
    ) -> Result<Option<Sample>, AggregatorError> {
        if end <= start {
            return Err(AggregatorError::InvalidInterval { child, start, end });
        }
        if !self.buffers.contains_key(&child) {
            return Err(progress::Error::UnknownChild(child).into());
        }
        if let Some(previous_end) = self.progress.latest(child) {
            if start < previous_end {
                return Err(AggregatorError::OverlappingInterval {
                    child,
                    start,
                    previous_end,
                });
            }
        }

        self.progress.update(child, end)?;

        // Anything before the last emission was already accounted for
        let mut sample = Sample::new(start, end, value);
        if let Some(emitted) = self.emitted_until {
            if end <= emitted {
                return Ok(None);
            }
            if start < emitted {
                sample = sample.split_at(emitted).1;
            }
        }

        if let Some(buffer) = self.buffers.get_mut(&child) {
            buffer.pending.push_back(sample);
        }
        Ok(self.try_emit())
    }

    /// Changes the aggregation interval; later emissions align to the new width
    pub fn set_interval_width(&mut self, interval_width: u64) {
        self.progress.set_interval_width(interval_width);
    }

    /// True when every required child has reported and at least one child exists
    pub fn is_ready(&self) -> bool {
        !self.buffers.is_empty() && self.progress.all_reported()
    }

    /// The most recently emitted sample, or `None` while the output is undefined
    pub fn current(&self) -> Option<Sample> {
        if self.is_ready() {
            self.last_output
        } else {
            None
        }
    }

    /// Running total of every emitted value
    pub fn cumulative(&self) -> f64 {
        self.cumulative
    }

    /// End of the last emitted interval
    pub fn emitted_until(&self) -> Option<Timestamp> {
        self.emitted_until
    }

    pub fn contains(&self, child: u64) -> bool {
        self.buffers.contains_key(&child)
    }

    pub fn children(&self) -> impl Iterator<Item = u64> + '_ {
        self.buffers.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    fn try_emit(&mut self) -> Option<Sample> {
        let bound = self.progress.get_min()?;
        let from = match self.emitted_until {
            Some(emitted) => emitted,
            None => self
                .buffers
                .values()
                .filter_map(|b| b.pending.front().map(|s| s.start))
                .min()?,
        };
        if bound <= from {
            return None;
        }

        let mut contributions = Vec::with_capacity(self.buffers.len());
        for (&child, buffer) in self.buffers.iter_mut() {
            if !self.progress.has_reported(child) {
                continue;
            }
            contributions.push(Self::drain_until(buffer, bound));
        }

        let value = self.op.reduce(&contributions)?;
        let sample = Sample::new(from, bound, value);
        self.emitted_until = Some(bound);
        self.last_output = Some(sample);
        self.cumulative += value;
        log::trace!(
            "{} over {} children emitted [{}, {}) = {}",
            self.op,
            contributions.len(),
            from,
            bound,
            value
        );
        Some(sample)
    }

    fn drain_until(buffer: &mut ChildBuffer, bound: Timestamp) -> f64 {
        let mut total = 0.0;
        while let Some(front) = buffer.pending.front().copied() {
            if front.end <= bound {
                total += front.value;
                buffer.pending.pop_front();
            } else if front.start < bound {
                let (head, tail) = front.split_at(bound);
                total += head.value;
                if let Some(slot) = buffer.pending.front_mut() {
                    *slot = tail;
                }
                break;
            } else {
                break;
            }
        }
        total
    }
}
