use std::collections::HashMap;

use aggregation::AggregateOp;
use instrumentation::{CallOrder, CallWhen, PointLocation, SnippetEffect, SnippetOp, ValueKind};

/// Function an instrumentation template is placed in
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FunctionRef {
    /// The function named by the focus, or `main` for whole-program foci
    FocusOrMain,
    Named(String),
}

/// One snippet of a metric, before it is bound to a process
#[derive(Debug, Clone, PartialEq)]
pub struct InstTemplate {
    pub function: FunctionRef,
    pub location: PointLocation,
    pub op: SnippetOp,
    pub when: CallWhen,
    pub order: CallOrder,
    pub effect: SnippetEffect,
}

impl InstTemplate {
    pub fn new(function: FunctionRef, location: PointLocation, op: SnippetOp) -> Self {
        let (when, order) = match location {
            PointLocation::Exit => (CallWhen::After, CallOrder::Last),
            _ => (CallWhen::Before, CallOrder::First),
        };
        Self {
            function,
            location,
            op,
            when,
            order,
            effect: SnippetEffect::ModifyInPlace,
        }
    }

    pub fn replacing(mut self) -> Self {
        self.effect = SnippetEffect::Replace;
        self
    }
}

/// How a metric is measured and combined
#[derive(Debug, Clone, PartialEq)]
pub struct MetricDefinition {
    pub name: String,
    pub kind: ValueKind,
    pub op: AggregateOp,
    pub insts: Vec<InstTemplate>,
}

impl MetricDefinition {
    pub fn new(name: impl Into<String>, kind: ValueKind, op: AggregateOp) -> Self {
        Self {
            name: name.into(),
            kind,
            op,
            insts: Vec::new(),
        }
    }

    pub fn with(mut self, template: InstTemplate) -> Self {
        self.insts.push(template);
        self
    }

    /// Start a timer on entry of `function` and stop it on exit
    pub fn timing(self, function: FunctionRef) -> Self {
        self.with(InstTemplate::new(
            function.clone(),
            PointLocation::Entry,
            SnippetOp::StartTimer,
        ))
        .with(InstTemplate::new(
            function,
            PointLocation::Exit,
            SnippetOp::StopTimer,
        ))
    }

    /// Whether the metric is placed in the focus function itself
    pub fn follows_focus(&self) -> bool {
        self.insts
            .iter()
            .any(|t| t.function == FunctionRef::FocusOrMain)
    }

    /// Whether any snippet replaces behavior at its point
    pub fn replaces(&self) -> bool {
        self.insts
            .iter()
            .any(|t| t.effect == SnippetEffect::Replace)
    }
}

/// Registry of metric definitions, keyed by name
#[derive(Debug, Clone)]
pub struct MetricCatalog {
    definitions: HashMap<String, MetricDefinition>,
}

impl MetricCatalog {
    /// A catalog without any metric
    pub fn empty() -> Self {
        Self {
            definitions: HashMap::new(),
        }
    }

    /// The standard metrics
    pub fn builtin() -> Self {
        let mut catalog = Self::empty();
        catalog.register(
            MetricDefinition::new("cpu_time", ValueKind::ProcessTimer, AggregateOp::Sum)
                .timing(FunctionRef::FocusOrMain),
        );
        catalog.register(
            MetricDefinition::new("wall_time", ValueKind::WallTimer, AggregateOp::Sum)
                .timing(FunctionRef::FocusOrMain),
        );
        catalog.register(
            MetricDefinition::new("procedure_calls", ValueKind::Counter, AggregateOp::Sum).with(
                InstTemplate::new(
                    FunctionRef::FocusOrMain,
                    PointLocation::Entry,
                    SnippetOp::AddCounter(1),
                ),
            ),
        );
        catalog.register(
            MetricDefinition::new("io_wait", ValueKind::WallTimer, AggregateOp::Sum)
                .timing(FunctionRef::Named("read".to_string()))
                .timing(FunctionRef::Named("write".to_string())),
        );

        let lock = FunctionRef::Named("pthread_mutex_lock".to_string());
        catalog.register(
            MetricDefinition::new("lock_wait", ValueKind::WallTimer, AggregateOp::Sum)
                .with(
                    InstTemplate::new(lock.clone(), PointLocation::Entry, SnippetOp::StartTimer)
                        .replacing(),
                )
                .with(
                    InstTemplate::new(lock, PointLocation::Exit, SnippetOp::StopTimer)
                        .replacing(),
                ),
        );
        catalog
    }

    /// Adds or replaces a definition, returning the previous one
    pub fn register(&mut self, definition: MetricDefinition) -> Option<MetricDefinition> {
        self.definitions
            .insert(definition.name.clone(), definition)
    }

    pub fn get(&self, name: &str) -> Option<&MetricDefinition> {
        self.definitions.get(name)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.definitions.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl Default for MetricCatalog {
    fn default() -> Self {
        Self::builtin()
    }
}
