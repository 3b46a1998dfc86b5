use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::{
    Address, BoundSnippet, CallOrder, CallWhen, Focus, InstPoint, InstallError, PatchError, Pid,
    PollRegion, SlotValue, SnippetOp, Tid, Timestamp,
};

/// Opaque handle to a patch installed in one process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PatchHandle(pub u64);

impl fmt::Display for PatchHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "patch#{}", self.0)
    }
}

/// Result of a successful install
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstalledPatch {
    pub handle: PatchHandle,
    /// Whether the patch can be executed once on demand
    pub triggerable: bool,
}

/// Code-patching engine: places and removes snippets in target processes
pub trait CodePatcher {
    /// Installs `snippet` at `point`. The process should be paused.
    fn install(
        &mut self,
        pid: Pid,
        point: &InstPoint,
        snippet: &BoundSnippet,
        when: CallWhen,
        order: CallOrder,
    ) -> Result<InstalledPatch, InstallError>;

    fn remove(&mut self, pid: Pid, handle: PatchHandle) -> Result<(), PatchError>;

    /// Executes an installed snippet once through an out-of-band call
    fn trigger(&mut self, pid: Pid, handle: PatchHandle) -> bool;

    /// Fractional overhead of running `op` at `point`
    fn estimate_cost(&self, point: &InstPoint, op: &SnippetOp) -> f64;

    /// Allocates `size` bytes of ordinary target memory
    fn alloc(&mut self, pid: Pid, size: usize) -> Result<Address, InstallError>;

    fn free(&mut self, pid: Pid, addr: Address);

    fn write_value(&mut self, pid: Pid, addr: Address, value: SlotValue)
        -> Result<(), InstallError>;
}

/// Process and resource management collaborator
pub trait ProcessControl {
    /// Live processes
    fn processes(&self) -> Vec<Pid>;

    /// Stops the process. Returns whether it was running before the call.
    fn pause(&mut self, pid: Pid) -> Result<bool, InstallError>;

    fn resume(&mut self, pid: Pid);

    fn resource_matches(&self, focus: &Focus, pid: Pid) -> bool;

    fn threads(&self, pid: Pid) -> Vec<Tid>;

    fn poll_region(&self, pid: Pid) -> Option<Arc<PollRegion>>;

    /// Reads a value cell in ordinary target memory
    fn read_value(&self, pid: Pid, addr: Address) -> Option<SlotValue>;

    fn now(&self) -> Timestamp;

    /// Whether `function` has an active frame in any thread of the process
    fn is_on_stack(&self, pid: Pid, function: &str) -> bool;
}

/// Mapping from parent patch handles to the handles of their copies in a
/// freshly forked child
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ForkMap {
    patches: HashMap<PatchHandle, PatchHandle>,
}

impl ForkMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, parent: PatchHandle, child: PatchHandle) {
        self.patches.insert(parent, child);
    }

    pub fn child_of(&self, parent: PatchHandle) -> Option<PatchHandle> {
        self.patches.get(&parent).copied()
    }

    pub fn len(&self) -> usize {
        self.patches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patches.is_empty()
    }
}

impl FromIterator<(PatchHandle, PatchHandle)> for ForkMap {
    fn from_iter<I: IntoIterator<Item = (PatchHandle, PatchHandle)>>(iter: I) -> Self {
        Self {
            patches: iter.into_iter().collect(),
        }
    }
}
