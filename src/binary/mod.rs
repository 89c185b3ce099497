//! Binary elementwise primitive: `dst = op(src0, src1)` with one-directional
//! broadcasting of size-1 source dimensions.

use crate::attr::{apply_post_ops, bind_post_ops, PostOps, PrimitiveAttr, SkipMask};
use crate::desc::{binary_desc, AlgKind, BinaryDesc};
use crate::engine::Engine;
use crate::error::{PrimError, PrimResult};
use crate::exec::{ArgId, ExecCtx, TypedView, TypedViewMut};
use crate::types::{for_each_index, DataType, MemoryDesc, MAX_NDIMS};
use crate::validation::validate_binary;

/// Scalar binary forward in `f32`. Comparisons yield 1 or 0; `prelu` uses
/// `b` as the negative slope.
#[inline]
pub(crate) fn binary_fwd(alg: AlgKind, a: f32, b: f32) -> f32 {
    let flag = |c: bool| if c { 1.0 } else { 0.0 };
    match alg {
        AlgKind::BinaryAdd => a + b,
        AlgKind::BinaryMul => a * b,
        AlgKind::BinaryMax => a.max(b),
        AlgKind::BinaryMin => a.min(b),
        AlgKind::BinaryDiv => a / b,
        AlgKind::BinarySub => a - b,
        AlgKind::BinaryGe => flag(a >= b),
        AlgKind::BinaryGt => flag(a > b),
        AlgKind::BinaryLe => flag(a <= b),
        AlgKind::BinaryLt => flag(a < b),
        AlgKind::BinaryEq => flag(a == b),
        AlgKind::BinaryNe => flag(a != b),
        AlgKind::BinaryPrelu => {
            if a > 0.0 {
                a
            } else {
                a * b
            }
        }
        _ => a,
    }
}

/// Reference binary implementation over any static-stride layout.
#[derive(Debug, Clone)]
pub struct RefBinary {
    desc: BinaryDesc,
    post_ops: PostOps,
}

impl RefBinary {
    pub const NAME: &'static str = "ref:any";

    pub fn init(_engine: &Engine, desc: &BinaryDesc, attr: &PrimitiveAttr) -> PrimResult<Self> {
        for md in desc.src.iter().chain([&desc.dst]) {
            if md.data_type() == DataType::Undef || md.format_any() {
                return Err(PrimError::unimplemented("operand type or layout unresolved"));
            }
        }
        if !attr.has_default_values(SkipMask::POST_OPS) || !attr.post_ops.is_eltwise_only() {
            return Err(PrimError::unimplemented("only eltwise post-ops are supported"));
        }
        Ok(Self {
            desc: *desc,
            post_ops: attr.post_ops.clone(),
        })
    }

    pub fn execute(&self, ctx: &mut ExecCtx<'_>) -> PrimResult<()> {
        let d = &self.desc;
        let [md0, md1] = &d.src;
        let src0 = TypedView::new(ctx.input_for(ArgId::Src0, md0)?, md0.data_type())?;
        let src1 = TypedView::new(ctx.input_for(ArgId::Src1, md1)?, md1.data_type())?;
        let post_ops = bind_post_ops(&self.post_ops, &d.dst, ctx)?;
        let mut dst = TypedViewMut::new(ctx.output_for(ArgId::Dst, &d.dst)?, d.dst.data_type())?;

        let nd = d.dst.ndims();
        let extents: Vec<usize> = d.dst.dims().iter().map(|&e| e as usize).collect();
        for_each_index(&extents, |idx| {
            let a = src0.get(broadcast_off(md0, idx)) as f32;
            let b = src1.get(broadcast_off(md1, idx)) as f32;
            let v = apply_post_ops(&post_ops, binary_fwd(d.alg, a, b), idx.get(1).copied().unwrap_or(0));
            dst.store(d.dst.off_l(&idx[..nd]), f64::from(v));
        });
        Ok(())
    }
}

/// Offset in `md` of destination index `idx`, pinning broadcast dims to 0.
#[inline]
fn broadcast_off(md: &MemoryDesc, idx: &[usize]) -> usize {
    let mut src_idx = [0usize; MAX_NDIMS];
    for (i, (&ext, &pos)) in md.dims().iter().zip(idx).enumerate() {
        src_idx[i] = if ext == 1 { 0 } else { pos };
    }
    md.off_l(&src_idx[..md.ndims()])
}

/// Binary primitive descriptor.
#[derive(Debug, Clone)]
pub struct BinaryPd {
    desc: BinaryDesc,
    imp: RefBinary,
}

impl BinaryPd {
    /// Descriptor with `Any` layouts resolved.
    pub fn desc(&self) -> &BinaryDesc {
        &self.desc
    }

    pub fn impl_name(&self) -> &'static str {
        RefBinary::NAME
    }

    pub fn execute(&self, ctx: &mut ExecCtx<'_>) -> PrimResult<()> {
        self.imp.execute(ctx)
    }
}

/// Validate a binary request and build its primitive descriptor. `src1` and
/// `dst` given as `Any` take `src0`'s layout.
pub fn create_binary(
    engine: &Engine,
    alg: AlgKind,
    src0: &MemoryDesc,
    src1: &MemoryDesc,
    dst: &MemoryDesc,
    attr: &PrimitiveAttr,
) -> PrimResult<BinaryPd> {
    validate_binary(alg, Some(src0), Some(src1), Some(dst))?;

    let resolve = |md: &MemoryDesc| if md.format_any() { md.with_format_like(src0) } else { Ok(*md) };
    let desc = binary_desc(alg, src0, &resolve(src1)?, &resolve(dst)?);

    match RefBinary::init(engine, &desc, attr) {
        Ok(imp) => {
            log::debug!("binary {alg:?}: selected {}", RefBinary::NAME);
            Ok(BinaryPd { desc, imp })
        }
        Err(e) => {
            log::trace!("binary {alg:?}: {} declined: {e}", RefBinary::NAME);
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FormatTag;

    fn md(dims: &[i64], dt: DataType) -> MemoryDesc {
        MemoryDesc::new(dims, dt, FormatTag::plain(dims.len())).unwrap()
    }

    #[test]
    fn test_binary_fwd_kinds() {
        assert_eq!(binary_fwd(AlgKind::BinaryDiv, 3.0, 2.0), 1.5);
        assert_eq!(binary_fwd(AlgKind::BinaryGe, 2.0, 2.0), 1.0);
        assert_eq!(binary_fwd(AlgKind::BinaryLt, 2.0, 2.0), 0.0);
        assert_eq!(binary_fwd(AlgKind::BinaryPrelu, -2.0, 0.25), -0.5);
        assert_eq!(binary_fwd(AlgKind::BinaryPrelu, 2.0, 0.25), 2.0);
    }

    #[test]
    fn test_broadcast_add() {
        let s0 = md(&[2, 1, 2], DataType::F32);
        let s1 = md(&[2, 3, 2], DataType::F32);
        let pd = create_binary(&Engine::cpu(), AlgKind::BinaryAdd, &s0, &s1, &s1, &PrimitiveAttr::new())
            .unwrap();

        let a = [1.0f32, 2.0, 10.0, 20.0];
        let b: Vec<f32> = (0..12).map(|v| v as f32).collect();
        let mut out = vec![0f32; 12];
        let mut ctx = ExecCtx::new()
            .with_input(ArgId::Src0, &a)
            .with_input(ArgId::Src1, &b)
            .with_output(ArgId::Dst, &mut out);
        pd.execute(&mut ctx).unwrap();
        drop(ctx);
        assert_eq!(
            out,
            vec![1.0, 3.0, 3.0, 5.0, 5.0, 7.0, 16.0, 27.0, 18.0, 29.0, 20.0, 31.0]
        );
    }

    #[test]
    fn test_any_dst_takes_src0_layout() {
        let s0 = MemoryDesc::new(&[1, 4, 2, 2], DataType::U8, FormatTag::NHWC).unwrap();
        let any = MemoryDesc::new(&[1, 4, 2, 2], DataType::U8, FormatTag::Any).unwrap();
        let pd = create_binary(&Engine::cpu(), AlgKind::BinaryMax, &s0, &any, &any, &PrimitiveAttr::new())
            .unwrap();
        assert!(pd.desc().dst.matches_tag(FormatTag::NHWC));
        assert!(pd.desc().src[1].matches_tag(FormatTag::NHWC));
    }

    #[test]
    fn test_saturating_int_output_with_relu() {
        let s = md(&[4], DataType::S8);
        let mut attr = PrimitiveAttr::new();
        attr.post_ops.append_eltwise(AlgKind::EltwiseRelu, 0.0, 0.0).unwrap();
        let pd = create_binary(&Engine::cpu(), AlgKind::BinaryAdd, &s, &s, &s, &attr).unwrap();

        let a = [100i8, -100, 3, -3];
        let b = [100i8, -100, 4, 1];
        let mut out = [0i8; 4];
        let mut ctx = ExecCtx::new()
            .with_input(ArgId::Src0, &a)
            .with_input(ArgId::Src1, &b)
            .with_output(ArgId::Dst, &mut out);
        pd.execute(&mut ctx).unwrap();
        drop(ctx);
        assert_eq!(out, [127, 0, 7, 0]);
    }

    #[test]
    fn test_unsupported_attr() {
        let s = md(&[4], DataType::F32);
        let mut attr = PrimitiveAttr::new();
        attr.post_ops.append_sum(1.0);
        let err = create_binary(&Engine::cpu(), AlgKind::BinaryAdd, &s, &s, &s, &attr).unwrap_err();
        assert!(err.is_unimplemented());

        let attr = PrimitiveAttr {
            output_scale: Some(2.0),
            ..PrimitiveAttr::default()
        };
        let err = create_binary(&Engine::cpu(), AlgKind::BinaryAdd, &s, &s, &s, &attr).unwrap_err();
        assert!(err.is_unimplemented());
    }
}
