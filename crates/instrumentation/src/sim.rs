//! In-memory target processes.
//!
//! [`SimTarget`] implements both [`CodePatcher`] and [`ProcessControl`] over
//! simulated processes: installed snippets run when the simulation enters or
//! leaves functions, pushed values are reported by [`SimTarget::sampling_reports`],
//! and fork copies memory and patches the way an operating system would.
//! Useful for testing and for driving the engine without real processes.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::rc::Rc;
use std::sync::Arc;

use crate::message;
use crate::{
    Address, BoundSnippet, CallOrder, CallWhen, CodePatcher, DataLocation, Focus, ForkMap,
    InstPoint, InstallError, InstalledPatch, PatchError, PatchHandle, Pid, PointLocation,
    PollRegion, ProcessControl, SlotValue, SnippetOp, Tid, Timestamp, SAMPLING_ROUTINE,
};

const DEFAULT_REGION_SLOTS: usize = 64;
const HEAP_BASE: Address = 0x1000_0000;
const REGION_BASE: Address = 0x7f00_0000_0000;
const FIRST_PID: Pid = 100;

#[derive(Debug, Clone)]
struct SimPatch {
    point: InstPoint,
    snippet: BoundSnippet,
    when: CallWhen,
    order: CallOrder,
}

#[derive(Debug)]
struct SimProcess {
    functions: BTreeSet<String>,
    heap: HashMap<Address, SlotValue>,
    next_addr: Address,
    region: Arc<PollRegion>,
    patches: BTreeMap<PatchHandle, SimPatch>,
    /// Call stack of every thread
    threads: BTreeMap<Tid, Vec<String>>,
    busy: bool,
    paused: bool,
    failing_removals: bool,
    /// Functions whose patches cannot be removed
    pinned_functions: BTreeSet<String>,
}

impl SimProcess {
    fn new(pid: Pid, functions: &[&str], region_slots: usize) -> Self {
        let mut names: BTreeSet<String> = functions.iter().map(|f| f.to_string()).collect();
        names.insert("main".to_string());
        names.insert(SAMPLING_ROUTINE.to_string());
        let mut threads = BTreeMap::new();
        threads.insert(pid, Vec::new());
        Self {
            functions: names,
            heap: HashMap::new(),
            next_addr: HEAP_BASE,
            region: Arc::new(PollRegion::new(REGION_BASE, region_slots)),
            patches: BTreeMap::new(),
            threads,
            busy: false,
            paused: false,
            failing_removals: false,
            pinned_functions: BTreeSet::new(),
        }
    }

    fn read(&self, location: &DataLocation) -> SlotValue {
        match location {
            DataLocation::Slot(index) => self.region.read(*index).unwrap_or_default(),
            DataLocation::Heap(addr) => self.heap.get(addr).copied().unwrap_or_default(),
            DataLocation::PerThread(_) => SlotValue::default(),
        }
    }

    fn write(&mut self, location: &DataLocation, value: SlotValue) {
        match location {
            DataLocation::Slot(index) => {
                let _ = self.region.write(*index, value);
            }
            DataLocation::Heap(addr) => {
                self.heap.insert(*addr, value);
            }
            DataLocation::PerThread(_) => {}
        }
    }

    fn run_snippet(&mut self, snippet: &BoundSnippet, tid: Tid, now: Timestamp) {
        if let Some(guard) = snippet.guard.as_ref().and_then(|g| g.for_thread(tid)) {
            if self.read(guard).total <= 0 {
                return;
            }
        }
        let Some(target) = snippet.target.for_thread(tid).cloned() else {
            return;
        };
        let mut value = self.read(&target);
        match snippet.op {
            SnippetOp::AddCounter(n) => value.total += n,
            SnippetOp::SetCounter(n) => value.total = n,
            SnippetOp::StartTimer => {
                if value.active == 0 {
                    value.start = now;
                }
                value.active += 1;
            }
            SnippetOp::StopTimer => {
                if value.active > 0 {
                    value.active -= 1;
                    if value.active == 0 {
                        value.total += now.saturating_sub(value.start) as i64;
                    }
                }
            }
            SnippetOp::ReportValue => return,
        }
        self.write(&target, value);
    }

    fn patches_at(&self, point: &InstPoint) -> Vec<SimPatch> {
        let mut found: Vec<(PatchHandle, SimPatch)> = self
            .patches
            .iter()
            .filter(|(_, p)| &p.point == point)
            .map(|(h, p)| (*h, p.clone()))
            .collect();
        found.sort_by_key(|(h, p)| (p.when, p.order, *h));
        found.into_iter().map(|(_, p)| p).collect()
    }
}

#[derive(Debug)]
struct SimState {
    clock: Timestamp,
    next_pid: Pid,
    next_handle: u64,
    region_slots: usize,
    processes: BTreeMap<Pid, SimProcess>,
    unresolvable: HashSet<String>,
    failing_triggers: u32,
}

impl SimState {
    fn next_handle(&mut self) -> PatchHandle {
        self.next_handle += 1;
        PatchHandle(self.next_handle)
    }
}

/// Shared handle to a set of simulated processes
#[derive(Debug, Clone)]
pub struct SimTarget {
    state: Rc<RefCell<SimState>>,
}

impl Default for SimTarget {
    fn default() -> Self {
        Self::new()
    }
}

impl SimTarget {
    pub fn new() -> Self {
        Self::with_region_slots(DEFAULT_REGION_SLOTS)
    }

    pub fn with_region_slots(region_slots: usize) -> Self {
        Self {
            state: Rc::new(RefCell::new(SimState {
                clock: 0,
                next_pid: FIRST_PID,
                next_handle: 0,
                region_slots,
                processes: BTreeMap::new(),
                unresolvable: HashSet::new(),
                failing_triggers: 0,
            })),
        }
    }

    /// Starts a process defining `functions` in addition to `main` and the
    /// sampling routine. Its main thread id equals its pid.
    pub fn spawn(&self, functions: &[&str]) -> Pid {
        let mut state = self.state.borrow_mut();
        let pid = state.next_pid;
        state.next_pid += 1;
        let process = SimProcess::new(pid, functions, state.region_slots);
        state.processes.insert(pid, process);
        pid
    }

    /// Forks `parent`. Memory and patches are copied; the poll region is not.
    pub fn fork(&self, parent: Pid) -> Option<(Pid, ForkMap)> {
        let mut state = self.state.borrow_mut();
        let child = state.next_pid;
        state.next_pid += 1;
        let region_slots = state.region_slots;

        let source = state.processes.get(&parent)?;
        let functions = source.functions.clone();
        let heap = source.heap.clone();
        let next_addr = source.next_addr;
        let stack = source.threads.values().next().cloned().unwrap_or_default();
        let patches: Vec<(PatchHandle, SimPatch)> =
            source.patches.iter().map(|(h, p)| (*h, p.clone())).collect();

        let mut map = ForkMap::new();
        let mut child_patches = BTreeMap::new();
        for (handle, patch) in patches {
            let copy = state.next_handle();
            map.insert(handle, copy);
            child_patches.insert(copy, patch);
        }

        let mut threads = BTreeMap::new();
        threads.insert(child, stack);
        state.processes.insert(
            child,
            SimProcess {
                functions,
                heap,
                next_addr,
                region: Arc::new(PollRegion::new(REGION_BASE, region_slots)),
                patches: child_patches,
                threads,
                busy: false,
                paused: false,
                failing_removals: false,
                pinned_functions: BTreeSet::new(),
            },
        );
        Some((child, map))
    }

    /// Replaces the image of `pid`: patches, memory and region are discarded
    pub fn exec(&self, pid: Pid, functions: &[&str]) -> bool {
        let mut state = self.state.borrow_mut();
        let region_slots = state.region_slots;
        if !state.processes.contains_key(&pid) {
            return false;
        }
        state
            .processes
            .insert(pid, SimProcess::new(pid, functions, region_slots));
        true
    }

    pub fn exit(&self, pid: Pid) -> bool {
        self.state.borrow_mut().processes.remove(&pid).is_some()
    }

    pub fn is_alive(&self, pid: Pid) -> bool {
        self.state.borrow().processes.contains_key(&pid)
    }

    pub fn spawn_thread(&self, pid: Pid) -> Option<Tid> {
        let mut state = self.state.borrow_mut();
        let tid = state.next_pid;
        state.next_pid += 1;
        state
            .processes
            .get_mut(&pid)?
            .threads
            .insert(tid, Vec::new());
        Some(tid)
    }

    pub fn exit_thread(&self, pid: Pid, tid: Tid) -> bool {
        let mut state = self.state.borrow_mut();
        state
            .processes
            .get_mut(&pid)
            .map(|p| p.threads.remove(&tid).is_some())
            .unwrap_or(false)
    }

    /// Executes every snippet installed at `point` on thread `tid`
    pub fn run(&self, pid: Pid, tid: Tid, point: &InstPoint) {
        let mut state = self.state.borrow_mut();
        let now = state.clock;
        let Some(process) = state.processes.get_mut(&pid) else {
            return;
        };
        for patch in process.patches_at(point) {
            process.run_snippet(&patch.snippet, tid, now);
        }
    }

    /// Calls `function` on thread `tid`, running its entry snippets
    pub fn enter(&self, pid: Pid, tid: Tid, function: &str) {
        self.run(pid, tid, &InstPoint::entry(function));
        let mut state = self.state.borrow_mut();
        if let Some(stack) = state
            .processes
            .get_mut(&pid)
            .and_then(|p| p.threads.get_mut(&tid))
        {
            stack.push(function.to_string());
        }
    }

    /// Returns from `function` on thread `tid`, running its exit snippets
    pub fn leave(&self, pid: Pid, tid: Tid, function: &str) {
        self.run(pid, tid, &InstPoint::exit(function));
        let mut state = self.state.borrow_mut();
        if let Some(stack) = state
            .processes
            .get_mut(&pid)
            .and_then(|p| p.threads.get_mut(&tid))
        {
            if let Some(pos) = stack.iter().rposition(|f| f == function) {
                stack.truncate(pos);
            }
        }
    }

    pub fn advance(&self, nanos: u64) {
        self.state.borrow_mut().clock += nanos;
    }

    pub fn set_clock(&self, now: Timestamp) {
        self.state.borrow_mut().clock = now;
    }

    /// Runs the sampling routine of `pid`, returning one report record per
    /// pushed value
    pub fn sampling_reports(&self, pid: Pid) -> Vec<Vec<u8>> {
        let state = self.state.borrow();
        let now = state.clock;
        let Some(process) = state.processes.get(&pid) else {
            return Vec::new();
        };
        process
            .patches_at(&InstPoint::sampling_routine())
            .into_iter()
            .filter(|p| p.snippet.op == SnippetOp::ReportValue)
            .filter_map(|p| match p.snippet.target {
                DataLocation::Heap(addr) => {
                    let value = process.heap.get(&addr).copied().unwrap_or_default();
                    Some(message::encode_sample_report(now, pid, addr, value.at(now)))
                }
                _ => None,
            })
            .collect()
    }

    /// A trace record from `pid` attributed to the value at `address`
    pub fn trace(&self, pid: Pid, address: Address, payload: &[u8]) -> Vec<u8> {
        let now = self.state.borrow().clock;
        message::encode_trace(now, pid, address, payload)
    }

    pub fn set_busy(&self, pid: Pid, busy: bool) {
        if let Some(p) = self.state.borrow_mut().processes.get_mut(&pid) {
            p.busy = busy;
        }
    }

    /// Makes every point in `function` unresolvable
    pub fn set_unresolvable(&self, function: &str) {
        self.state
            .borrow_mut()
            .unresolvable
            .insert(function.to_string());
    }

    pub fn clear_unresolvable(&self, function: &str) {
        self.state.borrow_mut().unresolvable.remove(function);
    }

    /// Makes every patch removal in `pid` fail
    pub fn fail_removals(&self, pid: Pid, failing: bool) {
        if let Some(p) = self.state.borrow_mut().processes.get_mut(&pid) {
            p.failing_removals = failing;
        }
    }

    /// Makes removal of the patches placed in `function` fail in `pid`
    pub fn fail_removals_at(&self, pid: Pid, function: &str) {
        if let Some(p) = self.state.borrow_mut().processes.get_mut(&pid) {
            p.pinned_functions.insert(function.to_string());
        }
    }

    /// Makes the next `count` manual triggers fail
    pub fn fail_triggers(&self, count: u32) {
        self.state.borrow_mut().failing_triggers = count;
    }

    pub fn patch_count(&self, pid: Pid) -> usize {
        self.state
            .borrow()
            .processes
            .get(&pid)
            .map(|p| p.patches.len())
            .unwrap_or(0)
    }

    pub fn patches_at(&self, pid: Pid, point: &InstPoint) -> usize {
        self.state
            .borrow()
            .processes
            .get(&pid)
            .map(|p| p.patches_at(point).len())
            .unwrap_or(0)
    }

    pub fn heap_value(&self, pid: Pid, addr: Address) -> Option<SlotValue> {
        self.state
            .borrow()
            .processes
            .get(&pid)
            .and_then(|p| p.heap.get(&addr).copied())
    }

    pub fn region(&self, pid: Pid) -> Option<Arc<PollRegion>> {
        self.state
            .borrow()
            .processes
            .get(&pid)
            .map(|p| p.region.clone())
    }

    /// Value a thread sees at `location`
    pub fn value_at(&self, pid: Pid, tid: Tid, location: &DataLocation) -> Option<SlotValue> {
        let state = self.state.borrow();
        let process = state.processes.get(&pid)?;
        let resolved = location.for_thread(tid)?;
        Some(process.read(resolved))
    }
}

impl CodePatcher for SimTarget {
    fn install(
        &mut self,
        pid: Pid,
        point: &InstPoint,
        snippet: &BoundSnippet,
        when: CallWhen,
        order: CallOrder,
    ) -> Result<InstalledPatch, InstallError> {
        let mut state = self.state.borrow_mut();
        let unresolvable = state.unresolvable.contains(&point.function);
        let process = state
            .processes
            .get(&pid)
            .ok_or_else(|| InstallError::Unreachable(format!("process {} does not exist", pid)))?;
        if process.busy {
            return Err(InstallError::ProcessBusy);
        }
        if unresolvable || !process.functions.contains(&point.function) {
            return Err(InstallError::Unreachable(point.to_string()));
        }

        let handle = state.next_handle();
        let patch = SimPatch {
            point: point.clone(),
            snippet: snippet.clone(),
            when,
            order,
        };
        if let Some(process) = state.processes.get_mut(&pid) {
            process.patches.insert(handle, patch);
        }
        Ok(InstalledPatch {
            handle,
            triggerable: point.location == PointLocation::Entry,
        })
    }

    fn remove(&mut self, pid: Pid, handle: PatchHandle) -> Result<(), PatchError> {
        let mut state = self.state.borrow_mut();
        let process = state
            .processes
            .get_mut(&pid)
            .ok_or(PatchError::NoSuchProcess(pid))?;
        let pinned = process
            .patches
            .get(&handle)
            .is_some_and(|p| process.pinned_functions.contains(&p.point.function));
        if process.busy || process.failing_removals || pinned {
            return Err(PatchError::ProcessBusy(pid));
        }
        process
            .patches
            .remove(&handle)
            .map(|_| ())
            .ok_or(PatchError::UnknownPatch { pid, handle })
    }

    fn trigger(&mut self, pid: Pid, handle: PatchHandle) -> bool {
        let mut state = self.state.borrow_mut();
        if state.failing_triggers > 0 {
            state.failing_triggers -= 1;
            return false;
        }
        let now = state.clock;
        let Some(process) = state.processes.get_mut(&pid) else {
            return false;
        };
        if process.busy {
            return false;
        }
        let Some(patch) = process.patches.get(&handle).cloned() else {
            return false;
        };
        let tids: Vec<Tid> = process
            .threads
            .iter()
            .filter(|(_, stack)| stack.contains(&patch.point.function))
            .map(|(tid, _)| *tid)
            .collect();
        let tid = tids.first().copied().unwrap_or(pid);
        process.run_snippet(&patch.snippet, tid, now);
        true
    }

    fn estimate_cost(&self, point: &InstPoint, op: &SnippetOp) -> f64 {
        if point.function == SAMPLING_ROUTINE {
            return 0.002;
        }
        match op {
            SnippetOp::StartTimer | SnippetOp::StopTimer => 0.02,
            SnippetOp::AddCounter(_) | SnippetOp::SetCounter(_) => 0.01,
            SnippetOp::ReportValue => 0.002,
        }
    }

    fn alloc(&mut self, pid: Pid, size: usize) -> Result<Address, InstallError> {
        let mut state = self.state.borrow_mut();
        let process = state
            .processes
            .get_mut(&pid)
            .ok_or_else(|| InstallError::Unreachable(format!("process {} does not exist", pid)))?;
        let addr = process.next_addr;
        process.next_addr += (size as u64 + 7) & !7;
        process.heap.insert(addr, SlotValue::default());
        Ok(addr)
    }

    fn free(&mut self, pid: Pid, addr: Address) {
        if let Some(p) = self.state.borrow_mut().processes.get_mut(&pid) {
            p.heap.remove(&addr);
        }
    }

    fn write_value(&mut self, pid: Pid, addr: Address, value: SlotValue) -> Result<(), InstallError> {
        let mut state = self.state.borrow_mut();
        let process = state
            .processes
            .get_mut(&pid)
            .ok_or_else(|| InstallError::Unreachable(format!("process {} does not exist", pid)))?;
        process.heap.insert(addr, value);
        Ok(())
    }
}

impl ProcessControl for SimTarget {
    fn processes(&self) -> Vec<Pid> {
        self.state.borrow().processes.keys().copied().collect()
    }

    fn pause(&mut self, pid: Pid) -> Result<bool, InstallError> {
        let mut state = self.state.borrow_mut();
        let process = state
            .processes
            .get_mut(&pid)
            .ok_or_else(|| InstallError::Unreachable(format!("process {} does not exist", pid)))?;
        if process.busy {
            return Err(InstallError::ProcessBusy);
        }
        let was_running = !process.paused;
        process.paused = true;
        Ok(was_running)
    }

    fn resume(&mut self, pid: Pid) {
        if let Some(p) = self.state.borrow_mut().processes.get_mut(&pid) {
            p.paused = false;
        }
    }

    fn resource_matches(&self, focus: &Focus, pid: Pid) -> bool {
        let state = self.state.borrow();
        let Some(process) = state.processes.get(&pid) else {
            return false;
        };
        if let Some(selected) = focus.process() {
            if selected != pid {
                return false;
            }
        }
        match focus.function() {
            Some(function) => process.functions.contains(function),
            None => true,
        }
    }

    fn threads(&self, pid: Pid) -> Vec<Tid> {
        self.state
            .borrow()
            .processes
            .get(&pid)
            .map(|p| p.threads.keys().copied().collect())
            .unwrap_or_default()
    }

    fn poll_region(&self, pid: Pid) -> Option<Arc<PollRegion>> {
        self.region(pid)
    }

    fn read_value(&self, pid: Pid, addr: Address) -> Option<SlotValue> {
        self.heap_value(pid, addr)
    }

    fn now(&self) -> Timestamp {
        self.state.borrow().clock
    }

    fn is_on_stack(&self, pid: Pid, function: &str) -> bool {
        self.state
            .borrow()
            .processes
            .get(&pid)
            .map(|p| {
                p.threads
                    .values()
                    .any(|stack| stack.iter().any(|f| f == function))
            })
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SnippetEffect;

    fn timer_patches(sim: &mut SimTarget, pid: Pid, function: &str, target: DataLocation) {
        for (point, op) in [
            (InstPoint::entry(function), SnippetOp::StartTimer),
            (InstPoint::exit(function), SnippetOp::StopTimer),
        ] {
            let snippet = BoundSnippet::new(op, SnippetEffect::ModifyInPlace, target.clone());
            sim.install(pid, &point, &snippet, CallWhen::Before, CallOrder::Last)
                .unwrap();
        }
    }

    #[test]
    fn test_timer_snippets_accumulate() {
        let mut sim = SimTarget::new();
        let pid = sim.spawn(&["work"]);
        let addr = sim.alloc(pid, 24).unwrap();
        timer_patches(&mut sim, pid, "work", DataLocation::Heap(addr));

        sim.set_clock(1_000);
        sim.enter(pid, pid, "work");
        sim.advance(500);
        assert!(sim.is_on_stack(pid, "work"));
        assert_eq!(sim.heap_value(pid, addr).unwrap().at(sim.now()), 500);
        sim.leave(pid, pid, "work");
        sim.advance(100);

        assert!(!sim.is_on_stack(pid, "work"));
        assert_eq!(sim.heap_value(pid, addr).unwrap().at(sim.now()), 500);
    }

    #[test]
    fn test_guard_gates_snippet() {
        let mut sim = SimTarget::new();
        let pid = sim.spawn(&["read", "parse"]);
        let gate = sim.alloc(pid, 24).unwrap();
        let count = sim.alloc(pid, 24).unwrap();

        for (point, delta) in [(InstPoint::entry("parse"), 1), (InstPoint::exit("parse"), -1)] {
            let snippet = BoundSnippet::new(
                SnippetOp::AddCounter(delta),
                SnippetEffect::ModifyInPlace,
                DataLocation::Heap(gate),
            );
            sim.install(pid, &point, &snippet, CallWhen::Before, CallOrder::First)
                .unwrap();
        }
        let counted = BoundSnippet::new(
            SnippetOp::AddCounter(1),
            SnippetEffect::ModifyInPlace,
            DataLocation::Heap(count),
        )
        .guarded_by(DataLocation::Heap(gate));
        sim.install(pid, &InstPoint::entry("read"), &counted, CallWhen::Before, CallOrder::Last)
            .unwrap();

        sim.enter(pid, pid, "read");
        sim.leave(pid, pid, "read");
        sim.enter(pid, pid, "parse");
        sim.enter(pid, pid, "read");
        sim.leave(pid, pid, "read");
        sim.leave(pid, pid, "parse");

        assert_eq!(sim.heap_value(pid, count).unwrap().total, 1);
    }

    #[test]
    fn test_fork_copies_patches_not_region() {
        let mut sim = SimTarget::new();
        let pid = sim.spawn(&["work"]);
        let slot = sim.region(pid).unwrap().allocate().unwrap();
        timer_patches(&mut sim, pid, "work", DataLocation::Slot(slot));

        let (child, map) = sim.fork(pid).unwrap();
        assert_eq!(map.len(), 2);
        assert_eq!(sim.patch_count(child), 2);
        assert!(!sim.region(child).unwrap().is_allocated(slot));
    }

    #[test]
    fn test_exec_discards_image() {
        let mut sim = SimTarget::new();
        let pid = sim.spawn(&["work"]);
        let addr = sim.alloc(pid, 24).unwrap();
        timer_patches(&mut sim, pid, "work", DataLocation::Heap(addr));

        assert!(sim.exec(pid, &["other"]));
        assert_eq!(sim.patch_count(pid), 0);
        assert_eq!(sim.heap_value(pid, addr), None);
        assert!(!sim.resource_matches(&Focus::parse("/Code/app/work").unwrap(), pid));
        assert!(sim.resource_matches(&Focus::parse("/Code/app/other").unwrap(), pid));
    }

    #[test]
    fn test_pause_busy_process() {
        let mut sim = SimTarget::new();
        let pid = sim.spawn(&[]);
        assert_eq!(sim.pause(pid), Ok(true));
        assert_eq!(sim.pause(pid), Ok(false));
        sim.resume(pid);
        sim.set_busy(pid, true);
        assert_eq!(sim.pause(pid), Err(InstallError::ProcessBusy));
    }

    #[test]
    fn test_resource_matching() {
        let sim = SimTarget::new();
        let a = sim.spawn(&[]);
        let b = sim.spawn(&[]);
        let only_a = Focus::parse(&format!("/Process/{}", a)).unwrap();
        assert!(sim.resource_matches(&only_a, a));
        assert!(!sim.resource_matches(&only_a, b));
        assert!(sim.resource_matches(&Focus::whole_program(), b));
    }
}
