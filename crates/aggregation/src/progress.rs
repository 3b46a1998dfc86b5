use std::collections::{BTreeMap, HashMap};
use thiserror::Error;

use crate::Timestamp;

/// Errors that can occur during ProgressTracker operations
#[derive(Error, Debug, PartialEq)]
pub enum Error {
    /// The child is not tracked by this tracker
    #[error("child {0} is not tracked")]
    UnknownChild(u64),

    /// The child is already tracked by this tracker
    #[error("child {0} is already tracked")]
    DuplicateChild(u64),

    /// A timestamp update was attempted that would go backward in time
    #[error("Non-monotonic timestamp update for child {0}: previous={1}, new={2}")]
    NonMonotonicTimestamp(u64, u64, u64),
}

#[derive(Debug, Clone, Copy)]
struct ChildProgress {
    latest: Option<Timestamp>,
    required: bool,
}

/// Tracks how far every child of an aggregation has reported.
///
/// `ProgressTracker` records, per child, the end of the latest interval the
/// child has delivered and answers the question "up to which interval
/// boundary has every child reported?". Children come and go at runtime.
///
/// A child is either *required* or *optional*. Until every required child has
/// reported at least once the tracker has no minimum. Optional children (late
/// joiners) are ignored until their first report and then participate like any
/// other child.
///
/// # Examples
///
/// ```
/// use aggregation::ProgressTracker;
///
/// // 1ms intervals
/// let mut tracker = ProgressTracker::new(1_000_000);
/// tracker.add_child(1, true).unwrap();
/// tracker.add_child(2, true).unwrap();
///
/// tracker.update(1, 5_000_000).unwrap();
/// assert_eq!(tracker.get_min(), None);
///
/// tracker.update(2, 3_400_000).unwrap();
/// assert_eq!(tracker.get_min(), Some(3_000_000));
/// ```
#[derive(Debug)]
pub struct ProgressTracker {
    /// Width of one aggregation interval in nanoseconds
    interval_width: u64,

    /// Progress of every tracked child
    children: HashMap<u64, ChildProgress>,

    /// Map of interval index to count of children whose latest report falls in it
    boundary_counts: BTreeMap<u64, usize>,

    /// Count of required children that have not yet reported
    awaiting_first: usize,
}

impl ProgressTracker {
    /// Creates a new tracker with no children.
    ///
    /// # Arguments
    ///
    /// * `interval_width` - The width of each aggregation interval in nanoseconds.
    ///   A width of zero is treated as one.
    pub fn new(interval_width: u64) -> Self {
        Self {
            interval_width: interval_width.max(1),
            children: HashMap::new(),
            boundary_counts: BTreeMap::new(),
            awaiting_first: 0,
        }
    }

    /// Starts tracking a child.
    ///
    /// A required child holds back [`get_min`](Self::get_min) until its first
    /// report; an optional one does not.
    ///
    /// # Errors
    ///
    /// Returns `DuplicateChild` if the child is already tracked.
    pub fn add_child(&mut self, child: u64, required: bool) -> Result<(), Error> {
        if self.children.contains_key(&child) {
            return Err(Error::DuplicateChild(child));
        }
        self.children.insert(
            child,
            ChildProgress {
                latest: None,
                required,
            },
        );
        if required {
            self.awaiting_first += 1;
        }
        Ok(())
    }

    /// Stops tracking a child, releasing any hold it had on the minimum.
    ///
    /// # Errors
    ///
    /// Returns `UnknownChild` if the child is not tracked.
    pub fn remove_child(&mut self, child: u64) -> Result<(), Error> {
        let progress = self
            .children
            .remove(&child)
            .ok_or(Error::UnknownChild(child))?;

        match progress.latest {
            Some(latest) => self.decrement(latest / self.interval_width),
            None if progress.required => self.awaiting_first -= 1,
            None => {}
        }
        Ok(())
    }

    /// Records that a child has reported up to `timestamp`.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    ///
    /// * The child is not tracked (`UnknownChild`)
    /// * The timestamp update is not monotonically increasing (`NonMonotonicTimestamp`)
    pub fn update(&mut self, child: u64, timestamp: Timestamp) -> Result<(), Error> {
        let width = self.interval_width;
        let progress = self
            .children
            .get_mut(&child)
            .ok_or(Error::UnknownChild(child))?;

        let new_slot = timestamp / width;

        match progress.latest {
            None => {
                if progress.required {
                    self.awaiting_first -= 1;
                }
                progress.latest = Some(timestamp);
                *self.boundary_counts.entry(new_slot).or_insert(0) += 1;
            }
            Some(prev) => {
                if prev > timestamp {
                    return Err(Error::NonMonotonicTimestamp(child, prev, timestamp));
                }
                progress.latest = Some(timestamp);

                let current_slot = prev / width;
                if current_slot != new_slot {
                    self.decrement(current_slot);
                    *self.boundary_counts.entry(new_slot).or_insert(0) += 1;
                }
            }
        }

        Ok(())
    }

    /// Gets the interval boundary that every reporting child has reached.
    ///
    /// Returns `None` while a required child has not reported yet, or when no
    /// child has reported at all.
    pub fn get_min(&self) -> Option<Timestamp> {
        if self.awaiting_first > 0 {
            return None;
        }
        self.boundary_counts
            .keys()
            .next()
            .map(|&min_slot| min_slot * self.interval_width)
    }

    /// Changes the interval width, re-aligning every child's progress.
    pub fn set_interval_width(&mut self, interval_width: u64) {
        self.interval_width = interval_width.max(1);
        self.boundary_counts.clear();
        for latest in self.children.values().filter_map(|c| c.latest) {
            *self
                .boundary_counts
                .entry(latest / self.interval_width)
                .or_insert(0) += 1;
        }
    }

    /// Returns the interval width in nanoseconds
    pub fn interval_width(&self) -> u64 {
        self.interval_width
    }

    /// Returns the end of the latest interval reported by `child`
    pub fn latest(&self, child: u64) -> Option<Timestamp> {
        self.children.get(&child).and_then(|c| c.latest)
    }

    /// Returns true if `child` has reported at least once
    pub fn has_reported(&self, child: u64) -> bool {
        self.latest(child).is_some()
    }

    /// Returns true if every required child has reported at least once
    pub fn all_reported(&self) -> bool {
        self.awaiting_first == 0
    }

    pub fn contains(&self, child: u64) -> bool {
        self.children.contains_key(&child)
    }

    pub fn len(&self) -> usize {
        self.children.len()
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    fn decrement(&mut self, slot: u64) {
        if let Some(count) = self.boundary_counts.get_mut(&slot) {
            *count -= 1;
            if *count == 0 {
                self.boundary_counts.remove(&slot);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn tracker_with(width: u64, children: &[u64]) -> ProgressTracker {
        let mut tracker = ProgressTracker::new(width);
        for &child in children {
            tracker.add_child(child, true).unwrap();
        }
        tracker
    }

    #[test]
    fn test_initialization() {
        let tracker = tracker_with(1000, &[1, 2]);
        assert_eq!(tracker.get_min(), None, "All required children should report first");
        assert!(!tracker.all_reported());
    }

    #[test]
    fn test_empty_tracker_has_no_min() {
        let tracker = ProgressTracker::new(1000);
        assert_eq!(tracker.get_min(), None);
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_monotonic_requirement() {
        let mut tracker = tracker_with(1000, &[7]);
        tracker.update(7, 5000).unwrap();

        let result = tracker.update(7, 4000);
        assert_eq!(result, Err(Error::NonMonotonicTimestamp(7, 5000, 4000)));
    }

    #[test]
    fn test_unknown_and_duplicate_child() {
        let mut tracker = tracker_with(1000, &[1]);
        assert_eq!(tracker.update(2, 10), Err(Error::UnknownChild(2)));
        assert_eq!(tracker.add_child(1, false), Err(Error::DuplicateChild(1)));
        assert_eq!(tracker.remove_child(3), Err(Error::UnknownChild(3)));
    }

    #[test]
    fn test_optional_child_does_not_hold_back() {
        let mut tracker = tracker_with(1000, &[1]);
        tracker.update(1, 4000).unwrap();
        tracker.add_child(2, false).unwrap();
        assert_eq!(tracker.get_min(), Some(4000));

        // Once it reports, the late joiner participates
        tracker.update(2, 2500).unwrap();
        assert_eq!(tracker.get_min(), Some(2000));
    }

    #[test]
    fn test_remove_child_releases_min() {
        let mut tracker = tracker_with(1000, &[1, 2]);
        tracker.update(1, 9000).unwrap();
        tracker.update(2, 3000).unwrap();
        assert_eq!(tracker.get_min(), Some(3000));

        tracker.remove_child(2).unwrap();
        assert_eq!(tracker.get_min(), Some(9000));

        tracker.remove_child(1).unwrap();
        assert_eq!(tracker.get_min(), None);
    }

    #[test]
    fn test_remove_unreported_required_child() {
        let mut tracker = tracker_with(1000, &[1, 2]);
        tracker.update(1, 3000).unwrap();
        assert_eq!(tracker.get_min(), None);

        tracker.remove_child(2).unwrap();
        assert_eq!(tracker.get_min(), Some(3000));
    }

    #[test]
    fn test_set_interval_width_realigns() {
        let mut tracker = tracker_with(1000, &[1, 2]);
        tracker.update(1, 5432).unwrap();
        tracker.update(2, 7789).unwrap();
        assert_eq!(tracker.get_min(), Some(5000));

        tracker.set_interval_width(2000);
        assert_eq!(tracker.get_min(), Some(4000));
        assert_eq!(tracker.interval_width(), 2000);
    }

    #[rstest]
    #[case(1000, vec![(0, 5000), (1, 3000), (0, 7000)], Some(3000))]
    #[case(1000, vec![(0, 5000), (1, 6000), (0, 8000), (1, 9000)], Some(8000))]
    #[case(1000, vec![(0, 1000), (1, 2000), (2, 3000), (0, 4000), (1, 5000)], Some(3000))]
    #[case(1, vec![(0, 1234), (1, 1235)], Some(1234))]
    fn test_various_update_patterns(
        #[case] width: u64,
        #[case] updates: Vec<(u64, u64)>,
        #[case] expected_min: Option<u64>,
    ) {
        let num_children = updates.iter().map(|(c, _)| c + 1).max().unwrap_or(0);
        let children: Vec<u64> = (0..num_children).collect();
        let mut tracker = tracker_with(width, &children);

        for (child, timestamp) in updates {
            tracker.update(child, timestamp).unwrap();
        }

        assert_eq!(tracker.get_min(), expected_min);
    }
}
