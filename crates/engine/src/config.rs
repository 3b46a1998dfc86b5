use instrumentation::SourceFamily;

/// Runtime configuration of an [`Engine`](crate::Engine)
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Family used for every new sampled value. One deployment uses one family.
    pub sampling: SourceFamily,

    /// Decompose sampled values per thread
    pub per_thread: bool,

    /// Maximum total predicted overhead, as a fraction
    pub cost_budget: f64,

    /// Automatic attempts for a collection request whose instrumentation
    /// points cannot be resolved
    pub max_insert_attempts: u32,

    /// Attempts for one manual trigger before giving up
    pub max_trigger_attempts: u32,

    /// Width of aggregation intervals in nanoseconds
    pub aggregation_interval_ns: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sampling: SourceFamily::Polled,
            per_thread: false,
            cost_budget: 0.20,
            max_insert_attempts: 3,
            max_trigger_attempts: 5,
            aggregation_interval_ns: 1_000_000,
        }
    }
}
