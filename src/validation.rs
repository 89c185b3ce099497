//! Shape and broadcast validation for binary elementwise operations.
//!
//! Broadcasting is one-directional: for every dimension each source extent
//! is either 1 or the destination extent, and when one source broadcasts a
//! dimension the other must match the destination there. Both sources
//! broadcasting the same non-unit destination dimension is rejected rather
//! than expanded.
//!
//! # Check order
//!
//! 1. every operand present
//! 2. algorithm belongs to the binary family
//! 3. `src0` layout is not `Any`
//! 4. no runtime extents or strides (`Unimplemented`)
//! 5. equal ranks
//! 6. per-dimension broadcast rule

use crate::desc::AlgKind;
use crate::error::{PrimError, PrimResult};
use crate::types::MemoryDesc;

/// Validate a binary request. Returns nothing on success; the caller builds
/// the descriptor from the now-validated operands.
pub fn validate_binary(
    alg: AlgKind,
    src0: Option<&MemoryDesc>,
    src1: Option<&MemoryDesc>,
    dst: Option<&MemoryDesc>,
) -> PrimResult<()> {
    let (Some(src0), Some(src1), Some(dst)) = (src0, src1, dst) else {
        return Err(PrimError::invalid("binary operand descriptor missing"));
    };
    if !alg.is_binary() {
        return Err(PrimError::invalid(format!("{alg:?} is not a binary algorithm")));
    }
    if src0.format_any() {
        return Err(PrimError::invalid("src0 layout cannot be `any`"));
    }

    if src0.has_runtime_dims_or_strides()
        || src1.has_runtime_dims_or_strides()
        || dst.has_runtime_dims_or_strides()
    {
        return Err(PrimError::unimplemented("runtime dims or strides in binary operands"));
    }

    let ndims = dst.ndims();
    if src0.ndims() != ndims || src1.ndims() != ndims {
        return Err(PrimError::invalid(format!(
            "rank mismatch: src0 {} src1 {} dst {}",
            src0.ndims(),
            src1.ndims(),
            ndims
        )));
    }

    for d in 0..ndims {
        let (a, b, c) = (src0.dims()[d], src1.dims()[d], dst.dims()[d]);
        let ok = (a == 1 || a == c) && (b == 1 || b == c) && (a == c || b == c);
        if !ok {
            return Err(PrimError::invalid(format!(
                "dim {d}: src0 {a} src1 {b} not broadcastable to dst {c}"
            )));
        }
    }

    Ok(())
}
