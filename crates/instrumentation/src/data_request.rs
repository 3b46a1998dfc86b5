use std::fmt;

use log::{debug, warn};

use crate::{
    Address, BoundSnippet, CallOrder, CallWhen, CodePatcher, DataLocation, ForkError, ForkMap,
    InstPoint, InstallError, PatchHandle, Pid, PollRegion, ProcessControl, RegionError, SlotValue,
    SnippetEffect, SnippetOp, Timestamp,
};

/// Bytes reserved in target memory for one value
const VALUE_BYTES: usize = 24;

/// How a data source delivers its value to the tool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceFamily {
    /// Slot in a shared region, read by the tool on its own schedule
    Polled,
    /// Ordinary target memory, reported by the target's sampling routine
    Pushed,
    /// Ordinary target memory that is never sampled; used for gating flags
    GateOnly,
}

impl fmt::Display for SourceFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SourceFamily::Polled => "polled",
            SourceFamily::Pushed => "pushed",
            SourceFamily::GateOnly => "gate",
        };
        f.write_str(name)
    }
}

/// What the sampled value measures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    Counter,
    WallTimer,
    ProcessTimer,
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValueKind::Counter => "counter",
            ValueKind::WallTimer => "wall_timer",
            ValueKind::ProcessTimer => "proc_timer",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RequestState {
    Pending,
    /// Storage exists in the target but a pushed report is not yet in place
    Allocated,
    Installed,
    Disabled,
}

/// A single value living inside a target process
#[derive(Debug, Clone)]
pub struct DataRequest {
    kind: ValueKind,
    family: SourceFamily,
    initial_value: i64,
    state: RequestState,
    location: Option<DataLocation>,
    address: Option<Address>,
    report_patch: Option<PatchHandle>,
    installed_at: Option<Timestamp>,
    /// Time and cumulative value of the last sample taken
    baseline: Option<(Timestamp, f64)>,
}

impl DataRequest {
    pub fn new(kind: ValueKind, family: SourceFamily, initial_value: i64) -> Self {
        Self {
            kind,
            family,
            initial_value,
            state: RequestState::Pending,
            location: None,
            address: None,
            report_patch: None,
            installed_at: None,
            baseline: None,
        }
    }

    pub fn kind(&self) -> ValueKind {
        self.kind
    }

    pub fn family(&self) -> SourceFamily {
        self.family
    }

    pub fn initial_value(&self) -> i64 {
        self.initial_value
    }

    pub fn is_installed(&self) -> bool {
        self.state == RequestState::Installed
    }

    pub fn is_disabled(&self) -> bool {
        self.state == RequestState::Disabled
    }

    /// Whether the value is ever delivered to the tool
    pub fn is_sampled(&self) -> bool {
        self.family != SourceFamily::GateOnly
    }

    pub fn location(&self) -> Option<&DataLocation> {
        self.location.as_ref()
    }

    pub fn slot(&self) -> Option<usize> {
        match self.location {
            Some(DataLocation::Slot(index)) => Some(index),
            _ => None,
        }
    }

    /// Address of the value inside the target
    pub fn get_address(&self) -> Option<Address> {
        self.address
    }

    pub fn installed_at(&self) -> Option<Timestamp> {
        self.installed_at
    }

    /// Storage exists in the target, so snippets can be bound to it
    pub fn is_allocated(&self) -> bool {
        matches!(self.state, RequestState::Allocated | RequestState::Installed)
    }

    /// Reserves storage for the value in `pid` and seeds it with the
    /// initial value. Allocating twice is a no-op.
    pub fn allocate(
        &mut self,
        pid: Pid,
        patcher: &mut dyn CodePatcher,
        control: &dyn ProcessControl,
    ) -> Result<(), InstallError> {
        if self.is_allocated() {
            return Ok(());
        }
        let initial = SlotValue::counter(self.initial_value);

        match self.family {
            SourceFamily::Polled => {
                let region = control.poll_region(pid).ok_or_else(|| {
                    InstallError::Unreachable(format!("process {} has no poll region", pid))
                })?;
                let slot = region.allocate()?;
                if let Err(e) = region.write(slot, initial) {
                    region.free(slot);
                    return Err(e.into());
                }
                self.location = Some(DataLocation::Slot(slot));
                self.address = Some(region.slot_address(slot));
            }
            SourceFamily::Pushed | SourceFamily::GateOnly => {
                let addr = patcher.alloc(pid, VALUE_BYTES)?;
                if let Err(e) = patcher.write_value(pid, addr, initial) {
                    patcher.free(pid, addr);
                    return Err(e);
                }
                self.location = Some(DataLocation::Heap(addr));
                self.address = Some(addr);
            }
        }

        let now = control.now();
        self.installed_at = Some(now);
        self.baseline = Some((now, self.initial_value as f64));
        self.state = RequestState::Allocated;
        Ok(())
    }

    /// Allocates the value if needed, and for pushed sources arranges for
    /// the sampling routine to report it.
    pub fn install(
        &mut self,
        pid: Pid,
        patcher: &mut dyn CodePatcher,
        control: &dyn ProcessControl,
    ) -> Result<(), InstallError> {
        if self.is_installed() {
            return Ok(());
        }
        self.allocate(pid, patcher, control)?;

        if self.family == SourceFamily::Pushed && self.report_patch.is_none() {
            let Some(addr) = self.address else {
                return Err(InstallError::Unreachable("value has no address".to_string()));
            };
            let report = BoundSnippet::new(
                SnippetOp::ReportValue,
                SnippetEffect::ModifyInPlace,
                DataLocation::Heap(addr),
            );
            let patch = patcher.install(
                pid,
                &InstPoint::sampling_routine(),
                &report,
                CallWhen::After,
                CallOrder::Last,
            )?;
            self.report_patch = Some(patch.handle);
        }

        self.state = RequestState::Installed;
        debug!(
            "installed {} {} in process {} at {:#x}",
            self.family,
            self.kind,
            pid,
            self.address.unwrap_or_default()
        );
        Ok(())
    }

    /// Releases the value. Idempotent.
    pub fn disable(
        &mut self,
        pid: Pid,
        patcher: &mut dyn CodePatcher,
        control: &dyn ProcessControl,
        points_still_reachable: bool,
    ) {
        if !self.is_allocated() {
            self.state = RequestState::Disabled;
            return;
        }

        if points_still_reachable {
            match self.family {
                SourceFamily::Polled => {
                    if let (Some(region), Some(slot)) = (control.poll_region(pid), self.slot()) {
                        region.free(slot);
                    }
                }
                SourceFamily::Pushed | SourceFamily::GateOnly => {
                    if let Some(handle) = self.report_patch {
                        if let Err(e) = patcher.remove(pid, handle) {
                            warn!("failed to remove report patch {} in process {}: {}", handle, pid, e);
                        }
                    }
                    if let Some(addr) = self.address {
                        patcher.free(pid, addr);
                    }
                }
            }
        }
        self.forget();
    }

    /// Forgets the value after the image holding it was replaced
    pub fn abandon(&mut self) {
        self.forget();
    }

    fn forget(&mut self) {
        self.state = RequestState::Disabled;
        self.location = None;
        self.address = None;
        self.report_patch = None;
        self.baseline = None;
    }

    /// Produces the equivalent request for a freshly forked child.
    ///
    /// Pushed and gate values keep their address since fork copies memory.
    /// Polled values get the same slot in the child's region, claimed and
    /// seeded with the parent's current value.
    pub fn duplicate_for_child(
        &self,
        parent: Pid,
        child: Pid,
        map: &ForkMap,
        control: &dyn ProcessControl,
    ) -> Result<DataRequest, ForkError> {
        let mut twin = DataRequest::new(self.kind, self.family, self.initial_value);
        if !self.is_allocated() {
            return Ok(twin);
        }

        let now = control.now();
        match self.family {
            SourceFamily::Polled => {
                let slot = self.slot().ok_or(ForkError::NotInstalled)?;
                let parent_region = control
                    .poll_region(parent)
                    .ok_or(ForkError::NoRegion(parent))?;
                let child_region = control.poll_region(child).ok_or(ForkError::NoRegion(child))?;
                let value = parent_region.read(slot)?;
                child_region.allocate_at(slot)?;
                child_region.write(slot, value)?;
                twin.location = Some(DataLocation::Slot(slot));
                twin.address = Some(child_region.slot_address(slot));
                twin.baseline = Some((now, value.at(now) as f64));
            }
            SourceFamily::Pushed => {
                if let Some(handle) = self.report_patch {
                    let child_handle = map.child_of(handle).ok_or(ForkError::MissingPatch(handle))?;
                    twin.report_patch = Some(child_handle);
                }
                twin.location = self.location.clone();
                twin.address = self.address;
                // The child's cell starts from the parent's value at fork
                twin.baseline = match self.address.and_then(|addr| control.read_value(child, addr)) {
                    Some(value) => Some((now, value.at(now) as f64)),
                    None => self.baseline,
                };
            }
            SourceFamily::GateOnly => {
                twin.location = self.location.clone();
                twin.address = self.address;
            }
        }
        twin.installed_at = Some(now);
        twin.state = self.state;
        Ok(twin)
    }

    /// Removes this value's traces from a child that must not keep it.
    ///
    /// Polled slots were never claimed in the child, so there is nothing to
    /// release. Pushed values lose their report patch and memory.
    pub fn un_fork(
        &self,
        child: Pid,
        map: &ForkMap,
        patcher: &mut dyn CodePatcher,
    ) -> Result<(), ForkError> {
        if !self.is_allocated() {
            return Ok(());
        }
        match self.family {
            SourceFamily::Polled => Ok(()),
            SourceFamily::Pushed => {
                if let Some(handle) = self.report_patch {
                    let child_handle = map.child_of(handle).ok_or(ForkError::MissingPatch(handle))?;
                    patcher.remove(child, child_handle)?;
                }
                if let Some(addr) = self.address {
                    patcher.free(child, addr);
                }
                Ok(())
            }
            SourceFamily::GateOnly => {
                if let Some(addr) = self.address {
                    patcher.free(child, addr);
                }
                Ok(())
            }
        }
    }

    /// Reads a polled value, as a cumulative figure at `now`
    pub fn read_polled(&self, region: &PollRegion, now: Timestamp) -> Result<f64, RegionError> {
        let slot = self.slot().ok_or(RegionError::BadSlot(usize::MAX))?;
        Ok(region.read(slot)?.at(now) as f64)
    }

    /// Turns a cumulative reading into an increment since the last one.
    ///
    /// The first reading after a fork only establishes the baseline. Readings
    /// that do not advance time are ignored.
    pub fn take_delta(&mut self, now: Timestamp, cumulative: f64) -> Option<(Timestamp, Timestamp, f64)> {
        match self.baseline {
            None => {
                self.baseline = Some((now, cumulative));
                None
            }
            Some((then, previous)) if now > then => {
                self.baseline = Some((now, cumulative));
                Some((then, now, cumulative - previous))
            }
            Some(_) => None,
        }
    }

    /// Overhead of keeping this value up to date
    pub fn cost(&self, patcher: &dyn CodePatcher) -> f64 {
        match self.family {
            SourceFamily::Pushed => {
                patcher.estimate_cost(&InstPoint::sampling_routine(), &SnippetOp::ReportValue)
            }
            SourceFamily::Polled | SourceFamily::GateOnly => 0.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{self, Message};
    use crate::sim::SimTarget;
    use rstest::rstest;

    #[rstest]
    #[case(SourceFamily::Polled)]
    #[case(SourceFamily::Pushed)]
    #[case(SourceFamily::GateOnly)]
    fn test_install_disable_idempotent(#[case] family: SourceFamily) {
        let sim = SimTarget::new();
        let pid = sim.spawn(&[]);
        let mut patcher = sim.clone();

        let mut req = DataRequest::new(ValueKind::Counter, family, 0);
        req.install(pid, &mut patcher, &sim).unwrap();
        assert!(req.is_installed());
        assert!(req.get_address().is_some());
        assert_eq!(req.is_sampled(), family != SourceFamily::GateOnly);

        req.disable(pid, &mut patcher, &sim, true);
        req.disable(pid, &mut patcher, &sim, true);
        assert!(req.is_disabled());
        assert_eq!(req.get_address(), None);
        assert_eq!(sim.patch_count(pid), 0);
        assert_eq!(sim.region(pid).map(|r| r.in_use()), Some(0));
    }

    #[test]
    fn test_pushed_value_is_reported() {
        let sim = SimTarget::new();
        let pid = sim.spawn(&[]);
        let mut patcher = sim.clone();

        let mut req = DataRequest::new(ValueKind::Counter, SourceFamily::Pushed, 7);
        req.install(pid, &mut patcher, &sim).unwrap();

        let reports = sim.sampling_reports(pid);
        assert_eq!(reports.len(), 1);
        match message::parse(&reports[0]).unwrap() {
            Message::SampleReport(msg) => {
                assert_eq!(msg.address, req.get_address().unwrap());
                assert_eq!(msg.value, 7);
            }
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[test]
    fn test_pushed_allocation_survives_busy_process() {
        let sim = SimTarget::new();
        let pid = sim.spawn(&[]);
        let mut patcher = sim.clone();
        sim.set_busy(pid, true);

        let mut req = DataRequest::new(ValueKind::Counter, SourceFamily::Pushed, 0);
        assert_eq!(req.install(pid, &mut patcher, &sim), Err(InstallError::ProcessBusy));
        assert!(req.is_allocated());
        assert!(!req.is_installed());
        let addr = req.get_address();

        sim.set_busy(pid, false);
        req.install(pid, &mut patcher, &sim).unwrap();
        assert!(req.is_installed());
        assert_eq!(req.get_address(), addr);
        assert_eq!(sim.sampling_reports(pid).len(), 1);
    }

    #[test]
    fn test_take_delta() {
        let mut req = DataRequest::new(ValueKind::Counter, SourceFamily::Polled, 0);
        assert_eq!(req.take_delta(10, 3.0), None);
        assert_eq!(req.take_delta(20, 8.0), Some((10, 20, 5.0)));
        assert_eq!(req.take_delta(20, 9.0), None);
        assert_eq!(req.take_delta(30, 9.0), Some((20, 30, 1.0)));
    }

    #[test]
    fn test_polled_duplicate_copies_value() {
        let sim = SimTarget::new();
        let pid = sim.spawn(&[]);
        let mut patcher = sim.clone();

        let mut req = DataRequest::new(ValueKind::Counter, SourceFamily::Polled, 0);
        req.install(pid, &mut patcher, &sim).unwrap();
        let slot = req.slot().unwrap();
        sim.region(pid).unwrap().write(slot, SlotValue::counter(41)).unwrap();

        let (child, map) = sim.fork(pid).unwrap();
        let twin = req.duplicate_for_child(pid, child, &map, &sim).unwrap();
        let child_region = sim.region(child).unwrap();
        assert_eq!(twin.slot(), Some(slot));
        assert!(child_region.is_allocated(slot));
        assert_eq!(twin.read_polled(&child_region, sim.now()).unwrap(), 41.0);
    }

    #[test]
    fn test_pushed_duplicate_and_un_fork() {
        let sim = SimTarget::new();
        let pid = sim.spawn(&[]);
        let mut patcher = sim.clone();

        let mut req = DataRequest::new(ValueKind::Counter, SourceFamily::Pushed, 0);
        req.install(pid, &mut patcher, &sim).unwrap();

        let (child, map) = sim.fork(pid).unwrap();
        let twin = req.duplicate_for_child(pid, child, &map, &sim).unwrap();
        assert_eq!(twin.get_address(), req.get_address());
        assert_eq!(sim.sampling_reports(child).len(), 1);

        req.un_fork(child, &map, &mut patcher).unwrap();
        assert!(sim.sampling_reports(child).is_empty());
        assert_eq!(sim.sampling_reports(pid).len(), 1);
    }

    #[test]
    fn test_pushed_twin_counts_from_fork() {
        let sim = SimTarget::new();
        let pid = sim.spawn(&[]);
        let mut patcher = sim.clone();

        let mut req = DataRequest::new(ValueKind::Counter, SourceFamily::Pushed, 0);
        req.install(pid, &mut patcher, &sim).unwrap();
        let addr = req.get_address().unwrap();
        assert_eq!(req.take_delta(5, 0.0), None);
        patcher.write_value(pid, addr, SlotValue::counter(41)).unwrap();

        sim.set_clock(10);
        let (child, map) = sim.fork(pid).unwrap();
        let mut twin = req.duplicate_for_child(pid, child, &map, &sim).unwrap();

        // The first report from the child is already a delta
        assert_eq!(twin.take_delta(20, 45.0), Some((10, 20, 4.0)));
        assert_eq!(req.take_delta(20, 43.0), Some((5, 20, 43.0)));
    }

    #[test]
    fn test_uninstalled_duplicate_is_fresh() {
        let sim = SimTarget::new();
        let pid = sim.spawn(&[]);
        let (child, map) = sim.fork(pid).unwrap();

        let req = DataRequest::new(ValueKind::WallTimer, SourceFamily::Pushed, 0);
        let twin = req.duplicate_for_child(pid, child, &map, &sim).unwrap();
        assert!(!twin.is_installed());
        assert_eq!(twin.kind(), ValueKind::WallTimer);
    }
}
