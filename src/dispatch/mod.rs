//! Capability probe: which instruction-set tier the running CPU supports.
//!
//! Detection runs once per process and is cached; CPU features do not change
//! while the process lives. The environment variable
//! `CPU_PRIMS_MAX_CPU_ISA` lowers the ceiling (e.g. `avx2` on an AVX-512
//! machine) and is read together with the first probe.

pub mod hw_info;

pub use hw_info::IsaFeatures;

use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

/// Environment variable capping the tier kernels may use.
pub const MAX_CPU_ISA_ENV: &str = "CPU_PRIMS_MAX_CPU_ISA";

/// Ordered instruction-set tiers. Supporting a tier implies every lower one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CpuIsa {
    /// 128-bit vectors.
    Sse41,
    /// 256-bit vectors.
    Avx2,
    /// 512-bit vectors with byte/word and VL extensions.
    Avx512Core,
}

impl CpuIsa {
    /// Highest tier first, the order implementations are tried in.
    pub const ALL_DESC: [CpuIsa; 3] = [CpuIsa::Avx512Core, CpuIsa::Avx2, CpuIsa::Sse41];

    /// Vector register width in bytes.
    pub const fn vlen(self) -> usize {
        match self {
            Self::Sse41 => 16,
            Self::Avx2 => 32,
            Self::Avx512Core => 64,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Sse41 => "sse41",
            Self::Avx2 => "avx2",
            Self::Avx512Core => "avx512_core",
        }
    }

    /// Highest tier the feature set fully covers.
    pub fn highest_supported(f: &IsaFeatures) -> Option<CpuIsa> {
        if !f.sse41 {
            None
        } else if !(f.avx && f.avx2) {
            Some(Self::Sse41)
        } else if !f.avx512_core() {
            Some(Self::Avx2)
        } else {
            Some(Self::Avx512Core)
        }
    }
}

impl fmt::Display for CpuIsa {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for CpuIsa {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sse41" | "sse4.1" | "sse4_1" => Ok(Self::Sse41),
            "avx2" => Ok(Self::Avx2),
            "avx512_core" | "avx512" => Ok(Self::Avx512Core),
            other => Err(format!("unknown cpu isa `{other}`")),
        }
    }
}

static MAX_ISA: OnceLock<Option<CpuIsa>> = OnceLock::new();

/// Highest usable tier for this process, `None` when no tier is available
/// (e.g. non-x86 targets).
pub fn max_cpu_isa() -> Option<CpuIsa> {
    *MAX_ISA.get_or_init(probe)
}

/// Whether kernels specialized for `isa` may run here.
#[inline]
pub fn mayiuse(isa: CpuIsa) -> bool {
    max_cpu_isa().map_or(false, |max| isa <= max)
}

fn probe() -> Option<CpuIsa> {
    let features = IsaFeatures::detect();
    let detected = CpuIsa::highest_supported(&features);
    let capped = apply_ceiling(detected, env_ceiling());
    log::info!(
        "cpu features: {features}; kernel tier: {}",
        capped.map_or("none", CpuIsa::name)
    );
    capped
}

fn env_ceiling() -> Option<CpuIsa> {
    let value = std::env::var(MAX_CPU_ISA_ENV).ok()?;
    match value.parse::<CpuIsa>() {
        Ok(isa) => Some(isa),
        Err(e) => {
            log::warn!("ignoring {MAX_CPU_ISA_ENV}={value}: {e}");
            None
        }
    }
}

/// Lower `detected` to `ceiling`; a ceiling never raises the tier.
pub(crate) fn apply_ceiling(detected: Option<CpuIsa>, ceiling: Option<CpuIsa>) -> Option<CpuIsa> {
    match (detected, ceiling) {
        (Some(d), Some(c)) => Some(d.min(c)),
        (d, _) => d,
    }
}
