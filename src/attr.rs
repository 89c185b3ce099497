//! Primitive attributes: output scale and a chain of post-operations applied
//! to each destination value before it is stored.

use std::ops::BitOr;

use crate::binary::binary_fwd;
use crate::desc::AlgKind;
use crate::error::{PrimError, PrimResult};
use crate::exec::{ArgId, ExecCtx};
use crate::types::{DataType, MemoryDesc};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PostOp {
    /// `Relu`: negative slope `alpha`. `Linear`: `alpha * x + beta`.
    /// `Clip`: clamp to `[alpha, beta]`.
    Eltwise { alg: AlgKind, alpha: f32, beta: f32 },
    /// Combine with a second tensor supplied at execution time as
    /// [`ArgId::PostOpSrc1`](crate::exec::ArgId::PostOpSrc1).
    Binary { alg: AlgKind, src1_desc: MemoryDesc },
    /// Accumulate into the previous destination contents.
    Sum { scale: f32 },
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PostOps {
    entries: Vec<PostOp>,
}

impl PostOps {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append_eltwise(&mut self, alg: AlgKind, alpha: f32, beta: f32) -> PrimResult<()> {
        if !alg.is_eltwise() {
            return Err(PrimError::invalid(format!("{alg:?} is not an eltwise algorithm")));
        }
        self.entries.push(PostOp::Eltwise { alg, alpha, beta });
        Ok(())
    }

    pub fn append_binary(&mut self, alg: AlgKind, src1_desc: &MemoryDesc) -> PrimResult<()> {
        if !alg.is_binary() {
            return Err(PrimError::invalid(format!("{alg:?} is not a binary algorithm")));
        }
        self.entries.push(PostOp::Binary { alg, src1_desc: *src1_desc });
        Ok(())
    }

    pub fn append_sum(&mut self, scale: f32) {
        self.entries.push(PostOp::Sum { scale });
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[PostOp] {
        &self.entries
    }

    /// Only eltwise entries present.
    pub fn is_eltwise_only(&self) -> bool {
        self.entries.iter().all(|e| matches!(e, PostOp::Eltwise { .. }))
    }
}

/// Attribute kinds an implementation handles itself and therefore excludes
/// from the "has default values" check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SkipMask(u32);

impl SkipMask {
    pub const NONE: Self = Self(0);
    pub const POST_OPS: Self = Self(1 << 0);
    pub const SCALES: Self = Self(1 << 1);

    #[inline]
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for SkipMask {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PrimitiveAttr {
    pub post_ops: PostOps,
    pub output_scale: Option<f32>,
}

impl PrimitiveAttr {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_post_ops(post_ops: PostOps) -> Self {
        Self { post_ops, output_scale: None }
    }

    /// True when every attribute kind not in `skip` is left at its default.
    pub fn has_default_values(&self, skip: SkipMask) -> bool {
        let scales_ok = skip.contains(SkipMask::SCALES)
            || self.output_scale.map_or(true, |s| s == 1.0);
        let post_ops_ok = skip.contains(SkipMask::POST_OPS) || self.post_ops.is_empty();
        scales_ok && post_ops_ok
    }
}

/// Check that a post-op chain stays within what the integer pooling kernels
/// support for a destination of `dst` shape: eltwise relu/linear/clip, and
/// binary add/mul/max/min/sub with an `f32` operand broadcast per tensor or
/// per channel.
pub fn pooling_post_ops_ok(post_ops: &PostOps, dst: &MemoryDesc) -> PrimResult<()> {
    for (idx, entry) in post_ops.entries().iter().enumerate() {
        match *entry {
            PostOp::Eltwise { alg, .. } => {
                if !matches!(
                    alg,
                    AlgKind::EltwiseRelu | AlgKind::EltwiseLinear | AlgKind::EltwiseClip
                ) {
                    return Err(PrimError::unimplemented(format!(
                        "post-op {idx}: eltwise {alg:?}"
                    )));
                }
            }
            PostOp::Binary { alg, ref src1_desc } => {
                if !matches!(
                    alg,
                    AlgKind::BinaryAdd
                        | AlgKind::BinaryMul
                        | AlgKind::BinaryMax
                        | AlgKind::BinaryMin
                        | AlgKind::BinarySub
                ) {
                    return Err(PrimError::unimplemented(format!(
                        "post-op {idx}: binary {alg:?}"
                    )));
                }
                if src1_desc.data_type() != DataType::F32 {
                    return Err(PrimError::unimplemented(format!(
                        "post-op {idx}: binary operand must be f32"
                    )));
                }
                binary_post_op_broadcast(src1_desc, dst).ok_or_else(|| {
                    PrimError::unimplemented(format!(
                        "post-op {idx}: operand {:?} is neither per-tensor nor per-channel",
                        src1_desc.dims()
                    ))
                })?;
            }
            PostOp::Sum { .. } => {
                return Err(PrimError::unimplemented(format!("post-op {idx}: sum")));
            }
        }
    }
    Ok(())
}

/// Broadcast class of a binary post-op operand relative to `dst`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostOpBroadcast {
    PerTensor,
    PerChannel,
}

pub fn binary_post_op_broadcast(src1: &MemoryDesc, dst: &MemoryDesc) -> Option<PostOpBroadcast> {
    if src1.ndims() != dst.ndims() || src1.format_any() {
        return None;
    }
    let dims = src1.dims();
    let others_unit = dims
        .iter()
        .enumerate()
        .all(|(d, &v)| d == 1 || v == 1);
    if !others_unit {
        return None;
    }
    match dims.get(1) {
        Some(&1) => Some(PostOpBroadcast::PerTensor),
        Some(&c) if c == dst.dims()[1] => Some(PostOpBroadcast::PerChannel),
        _ => None,
    }
}

/// Scalar eltwise forward.
#[inline]
pub(crate) fn eltwise_fwd(alg: AlgKind, alpha: f32, beta: f32, x: f32) -> f32 {
    match alg {
        AlgKind::EltwiseRelu => {
            if x > 0.0 {
                x
            } else {
                x * alpha
            }
        }
        AlgKind::EltwiseLinear => alpha * x + beta,
        AlgKind::EltwiseClip => x.max(alpha).min(beta),
        _ => x,
    }
}

/// A post-op entry bound to the operand buffers of one `execute` call.
#[derive(Debug, Clone, Copy)]
pub(crate) enum BoundPostOp<'a> {
    Eltwise { alg: AlgKind, alpha: f32, beta: f32 },
    /// `stride` is the channel stride of `src1`, 0 for a per-tensor operand.
    Binary { alg: AlgKind, src1: &'a [f32], stride: usize },
}

impl BoundPostOp<'_> {
    #[inline]
    pub(crate) fn apply(&self, x: f32, channel: usize) -> f32 {
        match *self {
            Self::Eltwise { alg, alpha, beta } => eltwise_fwd(alg, alpha, beta, x),
            Self::Binary { alg, src1, stride } => binary_fwd(alg, x, src1[channel * stride]),
        }
    }
}

/// Run a bound chain over one value of output channel `channel`.
#[inline]
pub(crate) fn apply_post_ops(ops: &[BoundPostOp<'_>], x: f32, channel: usize) -> f32 {
    ops.iter().fold(x, |acc, op| op.apply(acc, channel))
}

/// Resolve the runtime operands of `post_ops` from `ctx`.
pub(crate) fn bind_post_ops<'a>(
    post_ops: &PostOps,
    dst: &MemoryDesc,
    ctx: &ExecCtx<'a>,
) -> PrimResult<Vec<BoundPostOp<'a>>> {
    post_ops
        .entries()
        .iter()
        .enumerate()
        .map(|(idx, entry)| match *entry {
            PostOp::Eltwise { alg, alpha, beta } => Ok(BoundPostOp::Eltwise { alg, alpha, beta }),
            PostOp::Binary { alg, ref src1_desc } => {
                let bytes = ctx.input_for(ArgId::PostOpSrc1(idx), src1_desc)?;
                let src1: &[f32] = bytemuck::try_cast_slice(bytes)?;
                let stride = match binary_post_op_broadcast(src1_desc, dst) {
                    Some(PostOpBroadcast::PerTensor) => 0,
                    Some(PostOpBroadcast::PerChannel) => src1_desc.strides()[1] as usize,
                    None => {
                        return Err(PrimError::runtime(format!(
                            "post-op {idx}: operand shape no longer broadcastable"
                        )))
                    }
                };
                Ok(BoundPostOp::Binary { alg, src1, stride })
            }
            PostOp::Sum { .. } => Err(PrimError::runtime(format!("post-op {idx}: sum not bound"))),
        })
        .collect()
}
