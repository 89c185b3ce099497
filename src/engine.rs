//! CPU engine: the handle primitives are created against.

use crate::dispatch::{self, CpuIsa};

/// Engine-level knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineConfig {
    /// Highest tier primitives created on this engine may use. Lowers the
    /// process-wide tier, never raises it.
    pub max_isa: Option<CpuIsa>,
    /// Split `execute` work across the rayon pool.
    pub parallel: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_isa: None,
            parallel: true,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Engine {
    config: EngineConfig,
}

impl Engine {
    /// Engine with the default configuration.
    pub fn cpu() -> Self {
        Self::default()
    }

    pub fn with_config(config: EngineConfig) -> Self {
        if let (Some(cap), Some(hw)) = (config.max_isa, dispatch::max_cpu_isa()) {
            if cap < hw {
                log::debug!("engine capped at {cap} (hardware tier {hw})");
            }
        }
        Self { config }
    }

    #[inline]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Whether kernels for `isa` may be generated on this engine.
    pub fn mayiuse(&self, isa: CpuIsa) -> bool {
        dispatch::mayiuse(isa) && self.config.max_isa.map_or(true, |cap| isa <= cap)
    }

    /// Highest tier usable on this engine.
    pub fn max_isa(&self) -> Option<CpuIsa> {
        CpuIsa::ALL_DESC.into_iter().find(|&isa| self.mayiuse(isa))
    }
}
