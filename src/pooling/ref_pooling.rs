//! Reference forward pooling: any layout with static strides, f32/s32/s8/u8,
//! dilated windows.

use crate::attr::{apply_post_ops, bind_post_ops, pooling_post_ops_ok, PostOps, PrimitiveAttr, SkipMask};
use crate::desc::{AlgKind, PoolingDesc, PropKind};
use crate::engine::Engine;
use crate::error::{PrimError, PrimResult};
use crate::exec::{ArgId, ExecCtx, TypedView, TypedViewMut};
use crate::types::{for_each_index, DataType, MemoryDesc, MAX_NDIMS};

use super::resolve_dst;

#[derive(Debug, Clone)]
pub struct RefPoolingFwd {
    desc: PoolingDesc,
    post_ops: PostOps,
}

impl RefPoolingFwd {
    pub const NAME: &'static str = "ref:any";

    pub fn init(_engine: &Engine, desc: &PoolingDesc, attr: &PrimitiveAttr) -> PrimResult<Self> {
        match desc.prop_kind {
            PropKind::Backward => return Err(PrimError::unimplemented("backward pooling")),
            PropKind::ForwardTraining if desc.alg == AlgKind::PoolingMax => {
                return Err(PrimError::unimplemented("max pooling for training needs a workspace"))
            }
            _ => {}
        }
        let nd = desc.ndims();
        if !(3..=5).contains(&nd) {
            return Err(PrimError::unimplemented(format!("{nd}-d pooling")));
        }
        if !desc.alg.is_pooling() {
            return Err(PrimError::unimplemented(format!("algorithm {:?}", desc.alg)));
        }

        let mut resolved = *desc;
        resolved.dst = resolve_dst(&desc.src, &desc.dst)?;
        let (src_dt, dst_dt) = (resolved.src.data_type(), resolved.dst.data_type());
        if src_dt == DataType::Undef || dst_dt == DataType::Undef {
            return Err(PrimError::unimplemented("undefined data type"));
        }
        if desc.alg == AlgKind::PoolingMax && src_dt != dst_dt {
            return Err(PrimError::unimplemented(format!(
                "max from {} into {}",
                src_dt.name(),
                dst_dt.name()
            )));
        }

        if !attr.has_default_values(SkipMask::POST_OPS) {
            return Err(PrimError::unimplemented("attributes other than post-ops"));
        }
        pooling_post_ops_ok(&attr.post_ops, &resolved.dst)?;

        Ok(Self {
            desc: resolved,
            post_ops: attr.post_ops.clone(),
        })
    }

    #[inline]
    pub fn dst_md(&self) -> &MemoryDesc {
        &self.desc.dst
    }

    pub fn execute(&self, ctx: &mut ExecCtx<'_>) -> PrimResult<()> {
        let d = &self.desc;
        let src = TypedView::new(ctx.input_for(ArgId::Src, &d.src)?, d.src.data_type())?;
        let post_ops = bind_post_ops(&self.post_ops, &d.dst, ctx)?;
        let mut dst = TypedViewMut::new(ctx.output_for(ArgId::Dst, &d.dst)?, d.dst.data_type())?;

        let nd = d.ndims();
        let sp = d.spatial_ndims();
        let (mb, channels) = (d.src.dims()[0] as usize, d.src.dims()[1] as usize);
        let in_ext = &d.src.dims()[2..];
        let out_ext: Vec<usize> = d.dst.dims()[2..].iter().map(|&e| e as usize).collect();
        let ker: Vec<usize> = d.kernel[..sp].iter().map(|&k| k as usize).collect();
        let nominal = ker.iter().product::<usize>();
        let exclude = d.alg == AlgKind::PoolingAvgExcludePadding;

        for n in 0..mb {
            for ch in 0..channels {
                for_each_index(&out_ext, |o| {
                    let mut max = f64::NEG_INFINITY;
                    let mut sum = 0f64;
                    let mut count = 0usize;
                    for_each_index(&ker, |k| {
                        let mut idx = [0usize; MAX_NDIMS];
                        idx[0] = n;
                        idx[1] = ch;
                        for i in 0..sp {
                            let pos = (o[i] as i64) * d.strides[i] - d.padding_l[i]
                                + (k[i] as i64) * (d.dilation[i] + 1);
                            if pos < 0 || pos >= in_ext[i] {
                                return;
                            }
                            idx[2 + i] = pos as usize;
                        }
                        let v = src.get(d.src.off_l(&idx[..nd]));
                        max = max.max(v);
                        sum += v;
                        count += 1;
                    });

                    let value = if d.alg == AlgKind::PoolingMax {
                        if count == 0 {
                            0.0
                        } else if post_ops.is_empty() {
                            max
                        } else {
                            f64::from(apply_post_ops(&post_ops, max as f32, ch))
                        }
                    } else {
                        let divisor = if exclude { count } else { nominal };
                        if divisor == 0 {
                            0.0
                        } else {
                            let avg = sum as f32 / divisor as f32;
                            f64::from(apply_post_ops(&post_ops, avg, ch))
                        }
                    };

                    let mut oidx = [0usize; MAX_NDIMS];
                    oidx[0] = n;
                    oidx[1] = ch;
                    oidx[2..2 + sp].copy_from_slice(o);
                    dst.store(d.dst.off_l(&oidx[..nd]), value);
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::desc::pooling_desc;
    use crate::types::FormatTag;

    #[test]
    fn test_dilated_f32_ncw() {
        // taps at w, w+2
        let md = |w| MemoryDesc::new(&[1, 2, w], DataType::F32, FormatTag::NCW).unwrap();
        let desc = pooling_desc(
            PropKind::ForwardInference,
            AlgKind::PoolingMax,
            &md(5),
            &md(3),
            &[1],
            &[2],
            &[1],
            &[0],
            &[0],
        )
        .unwrap();
        let pd = RefPoolingFwd::init(&Engine::cpu(), &desc, &PrimitiveAttr::new()).unwrap();

        let src = [1.0f32, 5.0, 2.0, 0.0, 3.0, -1.0, -2.0, -3.0, -4.0, -5.0];
        let mut dst = [0f32; 6];
        let mut ctx = ExecCtx::new()
            .with_input(ArgId::Src, &src)
            .with_output(ArgId::Dst, &mut dst);
        pd.execute(&mut ctx).unwrap();
        drop(ctx);
        assert_eq!(dst, [2.0, 5.0, 3.0, -1.0, -2.0, -3.0]);
    }

    #[test]
    fn test_training_max_declined() {
        let md = MemoryDesc::new(&[1, 1, 4], DataType::F32, FormatTag::NCW).unwrap();
        let desc = pooling_desc(
            PropKind::ForwardTraining,
            AlgKind::PoolingMax,
            &md,
            &md,
            &[1],
            &[1],
            &[0],
            &[0],
            &[0],
        )
        .unwrap();
        let err = RefPoolingFwd::init(&Engine::cpu(), &desc, &PrimitiveAttr::new()).unwrap_err();
        assert!(err.is_unimplemented());

        let mut avg = desc;
        avg.alg = AlgKind::PoolingAvgIncludePadding;
        assert!(RefPoolingFwd::init(&Engine::cpu(), &avg, &PrimitiveAttr::new()).is_ok());
    }
}
