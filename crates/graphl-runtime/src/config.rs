//! Runtime configuration.

/// Configuration for instantiating a [`Program`](crate::Program).
#[derive(Debug, Clone, Default)]
pub struct RuntimeConfig {
    /// Fuel budget; enables fuel metering when set.
    pub fuel: Option<u64>,
    /// Upper bound on guest linear memory, in bytes.
    pub max_memory_bytes: Option<usize>,
    /// Options blob handed to the guest's `set_init_opts` before first use.
    pub options: Option<serde_json::Value>,
}

impl RuntimeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable fuel metering with the given budget.
    pub fn with_fuel(mut self, fuel: u64) -> Self {
        self.fuel = Some(fuel);
        self
    }

    /// Limit guest linear memory.
    pub fn with_max_memory_bytes(mut self, bytes: usize) -> Self {
        self.max_memory_bytes = Some(bytes);
        self
    }

    /// Pass an options blob to the guest at instantiation.
    pub fn with_options(mut self, options: serde_json::Value) -> Self {
        self.options = Some(options);
        self
    }

    /// Build the engine configuration.
    pub(crate) fn engine_config(&self) -> wasmi::Config {
        let mut config = wasmi::Config::default();
        config.consume_fuel(self.fuel.is_some());
        config
    }
}
