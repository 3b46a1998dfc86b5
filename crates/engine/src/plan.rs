use instrumentation::{
    CallOrder, CallWhen, CodePatcher, Focus, InstPoint, InstRequest, Pid, SnippetEffect,
    SnippetOp, SourceFamily, ValueKind,
};

use crate::catalog::{FunctionRef, MetricDefinition};

/// Which variable of its primitive a snippet operates on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ValueTarget {
    Value,
    Gate,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct InstSpec {
    pub point: InstPoint,
    pub op: SnippetOp,
    pub effect: SnippetEffect,
    pub when: CallWhen,
    pub order: CallOrder,
    pub target: ValueTarget,
    /// Runs only while the code constraint's gate is raised
    pub guarded: bool,
}

impl InstSpec {
    fn descriptor(&self) -> String {
        format!(
            "{}/{}/{:?}/{:?}/{:?}{}",
            self.point,
            self.op,
            self.when,
            self.order,
            self.target,
            if self.guarded { "/guarded" } else { "" }
        )
    }
}

/// Process-independent recipe for one primitive node
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct PrimitivePlan {
    /// Identity of the instrumentation, excluding the process
    pub key: String,
    pub shareable: bool,
    /// Sampled value, absent for constraint primitives
    pub value: Option<ValueKind>,
    /// Owns a gate flag
    pub gate: bool,
    pub insts: Vec<InstSpec>,
    /// Key of the constraint primitive whose gate guards this one, when the
    /// gate is not owned
    pub guard_key: Option<String>,
    pub cost: f64,
}

impl PrimitivePlan {
    pub fn flat_name(&self, pid: Pid) -> String {
        primitive_name(&self.key, pid)
    }

    pub fn guard_name(&self, pid: Pid) -> Option<String> {
        self.guard_key.as_ref().map(|k| primitive_name(k, pid))
    }

    /// One unbound request per planned snippet, in plan order
    pub fn inst_requests(&self) -> Vec<InstRequest> {
        self.insts
            .iter()
            .map(|inst| InstRequest::unbound(inst.point.clone(), inst.op, inst.effect, inst.when, inst.order))
            .collect()
    }
}

pub(crate) fn primitive_name(key: &str, pid: Pid) -> String {
    format!("{}|{}", pid, key)
}

/// Recipe for the component of one metric in one process
#[derive(Debug, Clone)]
pub(crate) struct ComponentPlan {
    pub key: String,
    pub focus: Focus,
    /// Constraint primitives first, the sampled base primitive last
    pub primitives: Vec<PrimitivePlan>,
}

impl ComponentPlan {
    pub fn flat_name(&self, pid: Pid) -> String {
        component_name(&self.key, pid)
    }
}

pub(crate) fn component_name(key: &str, pid: Pid) -> String {
    format!("{}|{}", key, pid)
}

/// Expands a metric definition into the primitives needed in one process.
///
/// Metrics placed in the focus function need no constraint. Metrics with
/// fixed points and a code focus get a gate raised while the focus function
/// runs, and their snippets are guarded by it. Metrics that replace
/// behavior are kept whole in one primitive that is never shared.
pub(crate) fn plan_component(
    def: &MetricDefinition,
    focus: &Focus,
    pid: Pid,
    family: SourceFamily,
    patcher: &dyn CodePatcher,
) -> ComponentPlan {
    let focus_function = focus.function().unwrap_or("main").to_string();
    let constraint = if def.follows_focus() {
        None
    } else {
        focus.function().map(str::to_string)
    };

    let value_insts: Vec<InstSpec> = def
        .insts
        .iter()
        .map(|t| {
            let function = match &t.function {
                FunctionRef::FocusOrMain => focus_function.clone(),
                FunctionRef::Named(name) => name.clone(),
            };
            InstSpec {
                point: InstPoint {
                    function,
                    location: t.location.clone(),
                },
                op: t.op,
                effect: t.effect,
                when: t.when,
                order: t.order,
                target: ValueTarget::Value,
                guarded: constraint.is_some(),
            }
        })
        .collect();

    let gate_insts: Vec<InstSpec> = constraint
        .iter()
        .flat_map(|function| {
            [
                (InstPoint::entry(function.as_str()), 1, CallWhen::Before, CallOrder::First),
                (InstPoint::exit(function.as_str()), -1, CallWhen::After, CallOrder::Last),
            ]
        })
        .map(|(point, delta, when, order)| InstSpec {
            point,
            op: SnippetOp::AddCounter(delta),
            effect: SnippetEffect::ModifyInPlace,
            when,
            order,
            target: ValueTarget::Gate,
            guarded: false,
        })
        .collect();

    let key = format!("{}|{}", def.name, focus.code_name());
    let mut primitives = Vec::new();

    if def.replaces() {
        let mut insts = gate_insts;
        insts.extend(value_insts);
        primitives.push(finish(
            PrimitivePlan {
                key: format!("{}|exclusive", key),
                shareable: false,
                value: Some(def.kind),
                gate: constraint.is_some(),
                insts,
                guard_key: None,
                cost: 0.0,
            },
            family,
            patcher,
        ));
    } else {
        let guard_key = if gate_insts.is_empty() {
            None
        } else {
            let gate = finish(
                PrimitivePlan {
                    key: shared_key("gate", &gate_insts, None),
                    shareable: true,
                    value: None,
                    gate: true,
                    insts: gate_insts,
                    guard_key: None,
                    cost: 0.0,
                },
                family,
                patcher,
            );
            let gate_key = gate.key.clone();
            primitives.push(gate);
            Some(gate_key)
        };

        let value_name = def.kind.to_string();
        primitives.push(finish(
            PrimitivePlan {
                key: shared_key(&value_name, &value_insts, guard_key.as_deref()),
                shareable: true,
                value: Some(def.kind),
                gate: false,
                insts: value_insts,
                guard_key,
                cost: 0.0,
            },
            family,
            patcher,
        ));
    }

    ComponentPlan {
        key,
        focus: focus.for_process(pid),
        primitives,
    }
}

fn shared_key(value: &str, insts: &[InstSpec], guard: Option<&str>) -> String {
    let mut descriptors: Vec<String> = insts.iter().map(InstSpec::descriptor).collect();
    descriptors.sort();
    match guard {
        Some(guard) => format!("{}|{}|guard({})", value, descriptors.join(";"), guard),
        None => format!("{}|{}", value, descriptors.join(";")),
    }
}

fn finish(mut plan: PrimitivePlan, family: SourceFamily, patcher: &dyn CodePatcher) -> PrimitivePlan {
    let inst_cost: f64 = plan
        .insts
        .iter()
        .map(|i| patcher.estimate_cost(&i.point, &i.op))
        .sum();
    let report_cost = if plan.value.is_some() && family == SourceFamily::Pushed {
        patcher.estimate_cost(&InstPoint::sampling_routine(), &SnippetOp::ReportValue)
    } else {
        0.0
    };
    plan.cost = inst_cost + report_cost;
    plan
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::MetricCatalog;
    use instrumentation::sim::SimTarget;

    fn plan(metric: &str, focus: &str) -> ComponentPlan {
        let catalog = MetricCatalog::builtin();
        let sim = SimTarget::new();
        plan_component(
            catalog.get(metric).unwrap(),
            &Focus::parse(focus).unwrap(),
            7,
            SourceFamily::Polled,
            &sim,
        )
    }

    #[test]
    fn test_focus_function_metric() {
        let plan = plan("cpu_time", "/Code/app/work");
        assert_eq!(plan.primitives.len(), 1);
        let base = &plan.primitives[0];
        assert!(base.shareable);
        assert_eq!(base.insts[0].point, InstPoint::entry("work"));
        assert!(base.insts.iter().all(|i| !i.guarded));
        assert!((base.cost - 0.04).abs() < 1e-12);
        assert_eq!(plan.flat_name(7), "cpu_time|/Code/app/work|7");
    }

    #[test]
    fn test_whole_program_uses_main() {
        let plan = plan("procedure_calls", "/");
        assert_eq!(plan.primitives[0].insts[0].point, InstPoint::entry("main"));
        assert_eq!(plan.focus.process(), Some(7));
    }

    #[test]
    fn test_code_constraint_adds_gate() {
        let plan = plan("io_wait", "/Code/app/parse");
        assert_eq!(plan.primitives.len(), 2);
        let gate = &plan.primitives[0];
        let base = &plan.primitives[1];
        assert!(gate.gate);
        assert_eq!(gate.value, None);
        assert_eq!(base.guard_key.as_deref(), Some(gate.key.as_str()));
        assert!(base.insts.iter().all(|i| i.guarded));
        assert_eq!(base.guard_name(7), Some(gate.flat_name(7)));
    }

    #[test]
    fn test_replacing_metric_is_exclusive() {
        let plan = plan("lock_wait", "/Code/app/parse");
        assert_eq!(plan.primitives.len(), 1);
        let only = &plan.primitives[0];
        assert!(!only.shareable);
        assert!(only.gate);
        assert_eq!(only.insts.len(), 4);
        assert!(only.key.starts_with("lock_wait|"));
    }

    #[test]
    fn test_shared_key_ignores_metric_name() {
        let catalog = MetricCatalog::builtin();
        let sim = SimTarget::new();
        let mut alias = catalog.get("procedure_calls").unwrap().clone();
        alias.name = "entries".to_string();
        let focus = Focus::whole_program();

        let a = plan_component(catalog.get("procedure_calls").unwrap(), &focus, 1, SourceFamily::Pushed, &sim);
        let b = plan_component(&alias, &focus, 1, SourceFamily::Pushed, &sim);
        assert_ne!(a.key, b.key);
        assert_eq!(a.primitives[0].key, b.primitives[0].key);
        assert!((a.primitives[0].cost - 0.012).abs() < 1e-12);
    }
}
