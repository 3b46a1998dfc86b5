use std::fmt;

use crate::{Address, Tid};

/// Function the target runtime calls periodically to report pushed values
pub const SAMPLING_ROUTINE: &str = "__rt_sample_values";

/// Where inside a function a snippet is placed
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PointLocation {
    Entry,
    Exit,
    /// The n-th call site inside the function
    CallSite(u32),
}

/// An instrumentation point: a resolvable location in the target's code
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstPoint {
    pub function: String,
    pub location: PointLocation,
}

impl InstPoint {
    pub fn entry(function: impl Into<String>) -> Self {
        Self {
            function: function.into(),
            location: PointLocation::Entry,
        }
    }

    pub fn exit(function: impl Into<String>) -> Self {
        Self {
            function: function.into(),
            location: PointLocation::Exit,
        }
    }

    pub fn call_site(function: impl Into<String>, index: u32) -> Self {
        Self {
            function: function.into(),
            location: PointLocation::CallSite(index),
        }
    }

    /// The point every pushed data source reports from
    pub fn sampling_routine() -> Self {
        Self::entry(SAMPLING_ROUTINE)
    }

    pub fn is_entry(&self) -> bool {
        self.location == PointLocation::Entry
    }
}

impl fmt::Display for InstPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.location {
            PointLocation::Entry => write!(f, "{}:entry", self.function),
            PointLocation::Exit => write!(f, "{}:exit", self.function),
            PointLocation::CallSite(n) => write!(f, "{}:call{}", self.function, n),
        }
    }
}

/// Whether a snippet runs before or after the instruction at its point
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CallWhen {
    Before,
    After,
}

/// Ordering relative to other snippets at the same point
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CallOrder {
    First,
    Last,
}

/// What a snippet does to its target variable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SnippetOp {
    AddCounter(i64),
    SetCounter(i64),
    StartTimer,
    StopTimer,
    /// Report the target's current value back to the tool
    ReportValue,
}

impl fmt::Display for SnippetOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SnippetOp::AddCounter(n) => write!(f, "add({})", n),
            SnippetOp::SetCounter(n) => write!(f, "set({})", n),
            SnippetOp::StartTimer => f.write_str("start"),
            SnippetOp::StopTimer => f.write_str("stop"),
            SnippetOp::ReportValue => f.write_str("report"),
        }
    }
}

/// How a snippet relates to the behavior already at its point.
///
/// `ModifyInPlace` snippets only update tool variables and can be shared
/// between metrics. `Replace` snippets change what the point does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SnippetEffect {
    ModifyInPlace,
    Replace,
}

/// Where the variable a snippet operates on lives in the target
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DataLocation {
    /// Slot index in the process's poll region
    Slot(usize),
    /// Address in ordinary target memory
    Heap(Address),
    /// A distinct variable for every thread
    PerThread(Vec<(Tid, DataLocation)>),
}

impl DataLocation {
    /// Resolves the variable seen by `tid`
    pub fn for_thread(&self, tid: Tid) -> Option<&DataLocation> {
        match self {
            DataLocation::PerThread(entries) => entries
                .iter()
                .find(|(t, _)| *t == tid)
                .and_then(|(_, loc)| loc.for_thread(tid)),
            other => Some(other),
        }
    }
}

/// A snippet bound to concrete target variables
#[derive(Debug, Clone, PartialEq)]
pub struct BoundSnippet {
    pub op: SnippetOp,
    pub effect: SnippetEffect,
    pub target: DataLocation,
    /// Optional gate variable; the snippet only runs while it is positive
    pub guard: Option<DataLocation>,
}

impl BoundSnippet {
    pub fn new(op: SnippetOp, effect: SnippetEffect, target: DataLocation) -> Self {
        Self {
            op,
            effect,
            target,
            guard: None,
        }
    }

    pub fn guarded_by(mut self, guard: DataLocation) -> Self {
        self.guard = Some(guard);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_point_display() {
        assert_eq!(InstPoint::entry("main").to_string(), "main:entry");
        assert_eq!(InstPoint::exit("read").to_string(), "read:exit");
        assert_eq!(InstPoint::call_site("f", 3).to_string(), "f:call3");
    }

    #[test]
    fn test_per_thread_resolution() {
        let loc = DataLocation::PerThread(vec![
            (10, DataLocation::Slot(1)),
            (11, DataLocation::Heap(0x2000)),
        ]);
        assert_eq!(loc.for_thread(11), Some(&DataLocation::Heap(0x2000)));
        assert_eq!(loc.for_thread(12), None);
        assert_eq!(
            DataLocation::Slot(4).for_thread(99),
            Some(&DataLocation::Slot(4))
        );
    }
}
