use log::{debug, warn};

use crate::{
    BoundSnippet, CallOrder, CallWhen, CodePatcher, DataLocation, ForkError, ForkMap, InstPoint,
    InstallError, PatchHandle, Pid, PointLocation, SnippetEffect, SnippetOp,
};

/// One desired code patch: a snippet placed at a point with timing and ordering.
///
/// Once installed it holds the patch handle returned by the code patcher.
#[derive(Debug, Clone)]
pub struct InstRequest {
    point: InstPoint,
    snippet: BoundSnippet,
    when: CallWhen,
    order: CallOrder,
    patch: Option<PatchHandle>,
    triggerable: bool,
    bound: bool,
}

impl InstRequest {
    pub fn new(point: InstPoint, snippet: BoundSnippet, when: CallWhen, order: CallOrder) -> Self {
        Self {
            point,
            snippet,
            when,
            order,
            patch: None,
            triggerable: false,
            bound: true,
        }
    }

    /// A request whose snippet is not yet pointed at any variable. It must
    /// be [rebound](Self::rebind) before it can be installed.
    pub fn unbound(point: InstPoint, op: SnippetOp, effect: SnippetEffect, when: CallWhen, order: CallOrder) -> Self {
        Self {
            bound: false,
            ..Self::new(
                point,
                BoundSnippet::new(op, effect, DataLocation::PerThread(Vec::new())),
                when,
                order,
            )
        }
    }

    pub fn is_bound(&self) -> bool {
        self.bound
    }

    pub fn point(&self) -> &InstPoint {
        &self.point
    }

    pub fn snippet(&self) -> &BoundSnippet {
        &self.snippet
    }

    pub fn when(&self) -> CallWhen {
        self.when
    }

    pub fn order(&self) -> CallOrder {
        self.order
    }

    pub fn patch(&self) -> Option<PatchHandle> {
        self.patch
    }

    pub fn is_installed(&self) -> bool {
        self.patch.is_some()
    }

    /// Installed and executable on demand
    pub fn is_triggerable(&self) -> bool {
        self.patch.is_some() && self.triggerable
    }

    /// Function whose entry this request instruments, if any
    pub fn entry_function(&self) -> Option<&str> {
        match self.point.location {
            PointLocation::Entry => Some(&self.point.function),
            _ => None,
        }
    }

    /// Places the snippet in `pid`. Installing twice is a no-op.
    pub fn install(&mut self, pid: Pid, patcher: &mut dyn CodePatcher) -> Result<(), InstallError> {
        if self.patch.is_some() {
            return Ok(());
        }
        if !self.is_bound() {
            return Err(InstallError::Unreachable(format!("no variable for {}", self.point)));
        }
        let installed = patcher.install(pid, &self.point, &self.snippet, self.when, self.order)?;
        debug!(
            "installed {} {} in process {} as {}",
            self.snippet.op, self.point, pid, installed.handle
        );
        self.patch = Some(installed.handle);
        self.triggerable = installed.triggerable;
        Ok(())
    }

    /// Removes the patch. When the point is known to be unreachable (the
    /// process exited or exec'd) only the bookkeeping is dropped.
    pub fn disable(&mut self, pid: Pid, patcher: &mut dyn CodePatcher, points_still_reachable: bool) {
        let Some(handle) = self.patch.take() else {
            return;
        };
        self.triggerable = false;
        if !points_still_reachable {
            return;
        }
        if let Err(e) = patcher.remove(pid, handle) {
            warn!("failed to remove {} at {} in process {}: {}", handle, self.point, pid, e);
        }
    }

    /// Forgets the patch after the image containing it was replaced
    pub fn abandon(&mut self) {
        self.patch = None;
        self.triggerable = false;
    }

    /// Runs the snippet once through an out-of-band call
    pub fn trigger_once(&self, pid: Pid, patcher: &mut dyn CodePatcher) -> bool {
        match self.patch {
            Some(handle) if self.triggerable => patcher.trigger(pid, handle),
            _ => false,
        }
    }

    /// Moves the snippet onto new variables by reinstalling it
    pub fn rebind(
        &mut self,
        pid: Pid,
        snippet: BoundSnippet,
        patcher: &mut dyn CodePatcher,
    ) -> Result<(), InstallError> {
        let was_installed = self.is_installed();
        self.disable(pid, patcher, true);
        self.snippet = snippet;
        self.bound = true;
        if was_installed {
            self.install(pid, patcher)?;
        }
        Ok(())
    }

    /// Produces the bookkeeping twin for a forked child.
    ///
    /// The child already carries a copy of the patch; the fork map tells us
    /// its handle there. A request that was never installed duplicates as
    /// an uninstalled copy.
    pub fn duplicate_for_child(&self, map: &ForkMap) -> Result<InstRequest, ForkError> {
        let mut twin = InstRequest::new(self.point.clone(), self.snippet.clone(), self.when, self.order);
        twin.bound = self.bound;
        if let Some(handle) = self.patch {
            twin.patch = Some(map.child_of(handle).ok_or(ForkError::MissingPatch(handle))?);
            twin.triggerable = self.triggerable;
        }
        Ok(twin)
    }

    /// Excises the child's copy of this patch. Returns false if the copy
    /// could not be located or removed.
    pub fn remove_from_child(&self, child: Pid, map: &ForkMap, patcher: &mut dyn CodePatcher) -> bool {
        let Some(handle) = self.patch else {
            return true;
        };
        let Some(child_handle) = map.child_of(handle) else {
            warn!("no child copy of {} in process {}", handle, child);
            return false;
        };
        match patcher.remove(child, child_handle) {
            Ok(()) => true,
            Err(e) => {
                warn!("failed to remove {} from child {}: {}", child_handle, child, e);
                false
            }
        }
    }

    pub fn cost(&self, patcher: &dyn CodePatcher) -> f64 {
        patcher.estimate_cost(&self.point, &self.snippet.op)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimTarget;

    fn counter_request(function: &str) -> InstRequest {
        InstRequest::new(
            InstPoint::entry(function),
            BoundSnippet::new(
                SnippetOp::AddCounter(1),
                SnippetEffect::ModifyInPlace,
                DataLocation::Heap(0x100),
            ),
            CallWhen::Before,
            CallOrder::Last,
        )
    }

    #[test]
    fn test_install_and_disable() {
        let sim = SimTarget::new();
        let pid = sim.spawn(&["work"]);
        let mut patcher = sim.clone();

        let mut req = counter_request("work");
        req.install(pid, &mut patcher).unwrap();
        assert!(req.is_installed());
        assert!(req.is_triggerable());
        assert_eq!(sim.patch_count(pid), 1);

        req.disable(pid, &mut patcher, true);
        req.disable(pid, &mut patcher, true);
        assert!(!req.is_installed());
        assert_eq!(sim.patch_count(pid), 0);
    }

    #[test]
    fn test_install_unresolvable_point() {
        let sim = SimTarget::new();
        let pid = sim.spawn(&[]);
        let mut patcher = sim.clone();

        let mut req = counter_request("missing");
        assert!(matches!(
            req.install(pid, &mut patcher),
            Err(InstallError::Unreachable(_))
        ));
        assert!(!req.is_installed());
    }

    #[test]
    fn test_unbound_request_installs_after_rebind() {
        let sim = SimTarget::new();
        let pid = sim.spawn(&["work"]);
        let mut patcher = sim.clone();

        let mut req = InstRequest::unbound(
            InstPoint::entry("work"),
            SnippetOp::AddCounter(1),
            SnippetEffect::ModifyInPlace,
            CallWhen::Before,
            CallOrder::Last,
        );
        assert!(!req.is_bound());
        assert!(matches!(
            req.install(pid, &mut patcher),
            Err(InstallError::Unreachable(_))
        ));
        assert_eq!(sim.patch_count(pid), 0);

        let bound = counter_request("work");
        req.rebind(pid, bound.snippet().clone(), &mut patcher).unwrap();
        assert!(req.is_bound());
        assert!(!req.is_installed());
        req.install(pid, &mut patcher).unwrap();
        assert_eq!(sim.patch_count(pid), 1);
    }

    #[test]
    fn test_install_busy_process() {
        let sim = SimTarget::new();
        let pid = sim.spawn(&["work"]);
        sim.set_busy(pid, true);
        let mut patcher = sim.clone();

        let mut req = counter_request("work");
        assert_eq!(req.install(pid, &mut patcher), Err(InstallError::ProcessBusy));
    }

    #[test]
    fn test_duplicate_and_remove_from_child() {
        let sim = SimTarget::new();
        let pid = sim.spawn(&["work"]);
        let mut patcher = sim.clone();

        let mut req = counter_request("work");
        req.install(pid, &mut patcher).unwrap();

        let (child, map) = sim.fork(pid).unwrap();
        let twin = req.duplicate_for_child(&map).unwrap();
        assert_eq!(twin.patch(), map.child_of(req.patch().unwrap()));
        assert_eq!(sim.patch_count(child), 1);

        assert!(req.remove_from_child(child, &map, &mut patcher));
        assert_eq!(sim.patch_count(child), 0);
        assert_eq!(sim.patch_count(pid), 1);

        // The child copy is gone, a second removal fails
        assert!(!req.remove_from_child(child, &map, &mut patcher));
    }

    #[test]
    fn test_duplicate_with_incomplete_map() {
        let mut req = counter_request("work");
        let sim = SimTarget::new();
        let pid = sim.spawn(&["work"]);
        let mut patcher = sim.clone();
        req.install(pid, &mut patcher).unwrap();

        let result = req.duplicate_for_child(&ForkMap::new());
        assert_eq!(result.err(), Some(ForkError::MissingPatch(req.patch().unwrap())));
    }

    #[test]
    fn test_trigger_once_runs_snippet() {
        let sim = SimTarget::new();
        let pid = sim.spawn(&["work"]);
        let mut patcher = sim.clone();
        let addr = patcher.alloc(pid, 24).unwrap();

        let mut req = InstRequest::new(
            InstPoint::entry("work"),
            BoundSnippet::new(
                SnippetOp::AddCounter(5),
                SnippetEffect::ModifyInPlace,
                DataLocation::Heap(addr),
            ),
            CallWhen::Before,
            CallOrder::First,
        );
        assert!(!req.trigger_once(pid, &mut patcher));

        req.install(pid, &mut patcher).unwrap();
        assert!(req.trigger_once(pid, &mut patcher));
        assert_eq!(sim.heap_value(pid, addr).map(|v| v.total), Some(5));
    }
}
