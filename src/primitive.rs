//! Primitive objects: an accepted primitive descriptor, ready to execute.

use crate::binary::BinaryPd;
use crate::desc::{OpDesc, PrimitiveKind};
use crate::error::PrimResult;
use crate::exec::ExecCtx;
use crate::pooling::PoolingPd;

#[derive(Debug, Clone)]
pub enum PrimitiveDesc {
    Binary(BinaryPd),
    Pooling(PoolingPd),
}

impl PrimitiveDesc {
    pub fn kind(&self) -> PrimitiveKind {
        match self {
            Self::Binary(_) => PrimitiveKind::Binary,
            Self::Pooling(_) => PrimitiveKind::Pooling,
        }
    }

    pub fn op_desc(&self) -> OpDesc {
        match self {
            Self::Binary(pd) => OpDesc::Binary(*pd.desc()),
            Self::Pooling(pd) => OpDesc::Pooling(*pd.desc()),
        }
    }

    pub fn impl_name(&self) -> &'static str {
        match self {
            Self::Binary(pd) => pd.impl_name(),
            Self::Pooling(pd) => pd.impl_name(),
        }
    }
}

impl From<BinaryPd> for PrimitiveDesc {
    fn from(pd: BinaryPd) -> Self {
        Self::Binary(pd)
    }
}

impl From<PoolingPd> for PrimitiveDesc {
    fn from(pd: PoolingPd) -> Self {
        Self::Pooling(pd)
    }
}

/// Executable primitive. Holds no per-call state: `execute` takes `&self`
/// and may run concurrently from several threads as long as each call gets
/// its own output buffers.
#[derive(Debug)]
pub struct Primitive {
    pd: PrimitiveDesc,
}

impl Primitive {
    pub fn new(pd: impl Into<PrimitiveDesc>) -> Self {
        let pd = pd.into();
        log::debug!("primitive {:?} created with {}", pd.kind(), pd.impl_name());
        Self { pd }
    }

    #[inline]
    pub fn pd(&self) -> &PrimitiveDesc {
        &self.pd
    }

    /// Run once over the buffers in `ctx`. A failure affects this call only.
    pub fn execute(&self, ctx: &mut ExecCtx<'_>) -> PrimResult<()> {
        let res = match &self.pd {
            PrimitiveDesc::Binary(pd) => pd.execute(ctx),
            PrimitiveDesc::Pooling(pd) => pd.execute(ctx),
        };
        if let Err(e) = &res {
            log::warn!("{} execute failed: {e}", self.pd.impl_name());
        }
        res
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attr::PrimitiveAttr;
    use crate::binary::create_binary;
    use crate::desc::AlgKind;
    use crate::engine::Engine;
    use crate::error::PrimError;
    use crate::exec::ArgId;
    use crate::types::{DataType, FormatTag, MemoryDesc};

    fn assert_send_sync<T: Send + Sync>() {}

    #[test]
    fn test_primitive_is_send_sync() {
        assert_send_sync::<Primitive>();
    }

    #[test]
    fn test_failed_execute_leaves_primitive_usable() {
        let md = MemoryDesc::new(&[3], DataType::F32, FormatTag::A).unwrap();
        let pd = create_binary(&Engine::cpu(), AlgKind::BinaryMul, &md, &md, &md, &PrimitiveAttr::new())
            .unwrap();
        let prim = Primitive::new(pd);
        assert_eq!(prim.pd().kind(), PrimitiveKind::Binary);

        let a = [1f32, 2.0, 3.0];
        let mut out = [0f32; 3];
        let mut ctx = ExecCtx::new().with_input(ArgId::Src0, &a).with_output(ArgId::Dst, &mut out);
        assert!(matches!(prim.execute(&mut ctx), Err(PrimError::RuntimeFailure(_))));

        ctx.set_input(ArgId::Src1, &a);
        prim.execute(&mut ctx).unwrap();
        drop(ctx);
        assert_eq!(out, [1.0, 4.0, 9.0]);
    }
}
