//! Raw CPU feature flags relevant to kernel selection.

use std::fmt;

/// ISA feature set reported by the running CPU and OS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct IsaFeatures {
    pub sse41: bool,
    pub avx: bool,
    pub avx2: bool,
    pub avx512f: bool,
    pub avx512bw: bool,
    pub avx512vl: bool,
    pub avx512dq: bool,
}

impl IsaFeatures {
    /// Query the hardware. Pure apart from the query itself.
    pub fn detect() -> Self {
        #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
        {
            return IsaFeatures {
                sse41: is_x86_feature_detected!("sse4.1"),
                avx: is_x86_feature_detected!("avx"),
                avx2: is_x86_feature_detected!("avx2"),
                avx512f: is_x86_feature_detected!("avx512f"),
                avx512bw: is_x86_feature_detected!("avx512bw"),
                avx512vl: is_x86_feature_detected!("avx512vl"),
                avx512dq: is_x86_feature_detected!("avx512dq"),
            };
        }
        #[allow(unreachable_code)]
        IsaFeatures::default()
    }

    /// The AVX-512 subset the widest tier relies on.
    pub fn avx512_core(&self) -> bool {
        self.avx512f && self.avx512bw && self.avx512vl && self.avx512dq
    }
}

impl fmt::Display for IsaFeatures {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut feats = Vec::new();
        if self.sse41 {
            feats.push("SSE4.1");
        }
        if self.avx {
            feats.push("AVX");
        }
        if self.avx2 {
            feats.push("AVX2");
        }
        if self.avx512_core() {
            feats.push("AVX-512(F/BW/VL/DQ)");
        } else if self.avx512f {
            feats.push("AVX-512F");
        }
        if feats.is_empty() {
            feats.push("none");
        }
        write!(f, "{}", feats.join("+"))
    }
}
