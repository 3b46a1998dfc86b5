use engine::Event;
use instrumentation::sim::SimTarget;
use instrumentation::Pid;

/// Functions every simulated process defines besides `main`
pub const FUNCTIONS: &[&str] = &["work", "read", "write", "pthread_mutex_lock"];

/// Deterministic activity of the simulated processes.
///
/// Each step advances the clock by one tick. Process `i` spends the tick
/// inside `work` and performs `i` reads, and every other step takes the lock
/// once. When configured, the first process forks after a number of steps.
pub struct Workload {
    pids: Vec<Pid>,
    steps: u64,
    fork_after: Option<u64>,
}

impl Workload {
    /// Spawns `processes` processes, each already running `main`
    pub fn spawn(sim: &SimTarget, processes: usize, fork_after: Option<u64>) -> Self {
        let pids: Vec<Pid> = (0..processes).map(|_| sim.spawn(FUNCTIONS)).collect();
        for &pid in &pids {
            sim.enter(pid, pid, "main");
        }
        Self {
            pids,
            steps: 0,
            fork_after,
        }
    }

    pub fn pids(&self) -> &[Pid] {
        &self.pids
    }

    pub fn steps(&self) -> u64 {
        self.steps
    }

    /// Runs one tick of activity and returns the lifecycle events it caused
    pub fn step(&mut self, sim: &SimTarget, tick_ns: u64) -> Vec<Event> {
        self.steps += 1;
        let half = tick_ns / 2;

        sim.advance(half);
        for &pid in &self.pids {
            sim.enter(pid, pid, "work");
        }
        sim.advance(tick_ns - half);
        for (i, &pid) in self.pids.iter().enumerate() {
            sim.leave(pid, pid, "work");
            for _ in 0..i {
                sim.enter(pid, pid, "read");
                sim.leave(pid, pid, "read");
            }
            if self.steps % 2 == 0 {
                sim.enter(pid, pid, "pthread_mutex_lock");
                sim.leave(pid, pid, "pthread_mutex_lock");
            }
        }

        let mut events = Vec::new();
        if self.fork_after == Some(self.steps) {
            if let Some(&parent) = self.pids.first() {
                if let Some((child, map)) = sim.fork(parent) {
                    log::info!("process {} forked into {}", parent, child);
                    self.pids.push(child);
                    events.push(Event::Fork { parent, child, map });
                }
            }
        }
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use instrumentation::ProcessControl;

    #[test]
    fn test_processes_start_in_main() {
        let sim = SimTarget::new();
        let workload = Workload::spawn(&sim, 2, None);
        assert_eq!(workload.pids().len(), 2);
        for &pid in workload.pids() {
            assert!(sim.is_on_stack(pid, "main"));
            assert!(!sim.is_on_stack(pid, "work"));
        }
    }

    #[test]
    fn test_step_advances_clock() {
        let sim = SimTarget::new();
        let mut workload = Workload::spawn(&sim, 1, None);
        assert!(workload.step(&sim, 1_000).is_empty());
        assert!(workload.step(&sim, 1_000).is_empty());
        assert_eq!(sim.now(), 2_000);
        assert_eq!(workload.steps(), 2);
    }

    #[test]
    fn test_fork_after_steps() {
        let sim = SimTarget::new();
        let mut workload = Workload::spawn(&sim, 2, Some(2));
        assert!(workload.step(&sim, 1_000).is_empty());

        let events = workload.step(&sim, 1_000);
        assert_eq!(events.len(), 1);
        match &events[0] {
            Event::Fork { parent, child, .. } => {
                assert_eq!(*parent, workload.pids()[0]);
                assert_eq!(*child, workload.pids()[2]);
                assert!(sim.is_alive(*child));
            }
            other => panic!("expected a fork, got {:?}", other),
        }
        assert!(workload.step(&sim, 1_000).is_empty());
        assert_eq!(workload.pids().len(), 3);
    }
}
