//! Forward pooling.
//!
//! Two implementation families:
//!
//! - [`JitUniI8i8PoolingFwd`]: integer pooling over channel-last tensors,
//!   specialized per instruction-set tier. `init` validates the request
//!   against the family's feature matrix, freezes a [`JitPoolConf`] and asks
//!   the tier's [`PoolingCodegen`] for a [`CompiledKernel`].
//! - [`RefPoolingFwd`]: strided reference fallback.
//!
//! [`create_pooling`] walks the implementation list, best first, and keeps the
//! first one that accepts the descriptor.

mod kernel;
mod ref_pooling;

pub use ref_pooling::RefPoolingFwd;

use std::fmt;

use rayon::prelude::*;

use self::kernel::{KernelArgs, PoolKernelFn, Window};
use crate::attr::{bind_post_ops, pooling_post_ops_ok, BoundPostOp, PostOps, PrimitiveAttr, SkipMask};
use crate::desc::{AlgKind, PoolingDesc, PropKind};
use crate::dispatch::CpuIsa;
use crate::engine::Engine;
use crate::error::{PrimError, PrimResult};
use crate::exec::{ArgId, ExecCtx};
use crate::types::{DataType, FormatTag, MemoryDesc};

/// Output points per parallel task, at least.
const MIN_POINTS_PER_TASK: usize = 16;

/// Configuration frozen at generation time. Spatial extents are normalized to
/// three dimensions: missing leading dimensions have extent 1, kernel 1,
/// stride 1 and no padding.
#[derive(Debug, Clone, PartialEq)]
pub struct JitPoolConf {
    pub isa: CpuIsa,
    pub alg: AlgKind,
    pub src_dt: DataType,
    pub dst_dt: DataType,
    pub ndims: usize,
    pub mb: usize,
    pub c: usize,
    pub id: usize,
    pub ih: usize,
    pub iw: usize,
    pub od: usize,
    pub oh: usize,
    pub ow: usize,
    pub kd: usize,
    pub kh: usize,
    pub kw: usize,
    pub stride_d: usize,
    pub stride_h: usize,
    pub stride_w: usize,
    pub f_pad: usize,
    pub t_pad: usize,
    pub l_pad: usize,
    /// Channels per vector register.
    pub c_block: usize,
    /// Channel blocks, the partial one included.
    pub nb_c: usize,
    /// Channels in the partial block, 0 when `c` divides evenly.
    pub c_tail: usize,
    pub parallel: bool,
}

impl JitPoolConf {
    fn new(isa: CpuIsa, desc: &PoolingDesc, parallel: bool) -> Self {
        let nd = desc.ndims();
        let sp = desc.spatial_ndims();
        let src = desc.src.dims();
        let dst = desc.dst.dims();

        // normalized 3-D slot for spatial dim i
        let mut in_ext = [1usize; 3];
        let mut out_ext = [1usize; 3];
        let mut ker = [1usize; 3];
        let mut stride = [1usize; 3];
        let mut pad = [0usize; 3];
        for i in 0..sp {
            let slot = 3 - sp + i;
            in_ext[slot] = src[2 + i] as usize;
            out_ext[slot] = dst[2 + i] as usize;
            ker[slot] = desc.kernel[i] as usize;
            stride[slot] = desc.strides[i] as usize;
            pad[slot] = desc.padding_l[i] as usize;
        }

        let c = src[1] as usize;
        let c_block = isa.vlen() / desc.src.data_type().size();
        Self {
            isa,
            alg: desc.alg,
            src_dt: desc.src.data_type(),
            dst_dt: desc.dst.data_type(),
            ndims: nd,
            mb: src[0] as usize,
            c,
            id: in_ext[0],
            ih: in_ext[1],
            iw: in_ext[2],
            od: out_ext[0],
            oh: out_ext[1],
            ow: out_ext[2],
            kd: ker[0],
            kh: ker[1],
            kw: ker[2],
            stride_d: stride[0],
            stride_h: stride[1],
            stride_w: stride[2],
            f_pad: pad[0],
            t_pad: pad[1],
            l_pad: pad[2],
            c_block,
            nb_c: c.div_ceil(c_block),
            c_tail: c % c_block,
            parallel,
        }
    }

    /// Nominal window size.
    #[inline]
    pub fn kernel_volume(&self) -> usize {
        self.kd * self.kh * self.kw
    }

    /// Output points (batch × output spatial).
    #[inline]
    pub fn work_amount(&self) -> usize {
        self.mb * self.od * self.oh * self.ow
    }

    /// Divisor used for output position `(od, oh, ow)`.
    pub fn avg_divisor(&self, od: usize, oh: usize, ow: usize) -> usize {
        match self.alg {
            AlgKind::PoolingAvgExcludePadding => self.window_at(0, od, oh, ow).count(),
            _ => self.kernel_volume(),
        }
    }

    #[inline]
    pub(crate) fn window(&self, point: usize) -> Window {
        let ow = point % self.ow;
        let rest = point / self.ow;
        let oh = rest % self.oh;
        let rest = rest / self.oh;
        let od = rest % self.od;
        let n = rest / self.od;
        self.window_at(n, od, oh, ow)
    }

    #[inline]
    fn window_at(&self, n: usize, od: usize, oh: usize, ow: usize) -> Window {
        #[inline(always)]
        fn clip(o: usize, stride: usize, pad: usize, k: usize, extent: usize) -> (usize, usize) {
            let start = (o * stride) as isize - pad as isize;
            let lo = start.max(0) as usize;
            let hi = (start + k as isize).clamp(0, extent as isize) as usize;
            (lo, hi)
        }
        Window {
            n,
            d: clip(od, self.stride_d, self.f_pad, self.kd, self.id),
            h: clip(oh, self.stride_h, self.t_pad, self.kh, self.ih),
            w: clip(ow, self.stride_w, self.l_pad, self.kw, self.iw),
        }
    }
}

/// Executable artifact produced by a [`PoolingCodegen`]: one entry point
/// specialized to a frozen configuration. Immutable once built.
#[derive(Clone)]
pub struct CompiledKernel {
    isa: CpuIsa,
    conf: JitPoolConf,
    func: PoolKernelFn,
}

impl fmt::Debug for CompiledKernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledKernel")
            .field("isa", &self.isa)
            .field("conf", &self.conf)
            .finish_non_exhaustive()
    }
}

impl CompiledKernel {
    #[inline]
    pub fn isa(&self) -> CpuIsa {
        self.isa
    }

    #[inline]
    pub fn conf(&self) -> &JitPoolConf {
        &self.conf
    }

    fn run(&self, src: &[u8], post_ops: &[BoundPostOp<'_>], dst: &mut [u8]) -> PrimResult<()> {
        let conf = &self.conf;
        let row_bytes = conf.c * conf.dst_dt.size();
        let points = conf.work_amount();
        let Some(dst) = dst.get_mut(..points * row_bytes) else {
            return Err(PrimError::runtime("destination shorter than the output"));
        };
        let args = KernelArgs { conf, src, post_ops };
        let func = self.func;
        // SAFETY: a kernel is only generated for a tier the engine reported
        // usable on this CPU.
        let call = |first: usize, chunk: &mut [u8]| unsafe { func(&args, first, chunk) };

        if conf.parallel && points > MIN_POINTS_PER_TASK {
            let tasks = rayon::current_num_threads() * 4;
            let per_task = points.div_ceil(tasks).max(MIN_POINTS_PER_TASK);
            dst.par_chunks_mut(per_task * row_bytes)
                .enumerate()
                .try_for_each(|(i, chunk)| call(i * per_task, chunk))
        } else {
            call(0, dst)
        }
    }
}

/// Kernel generator for one instruction-set tier.
pub trait PoolingCodegen: Send + Sync {
    /// Build the entry point specialized to `conf`. Pure: the same
    /// configuration always yields an equivalent kernel.
    fn generate(&self, conf: &JitPoolConf) -> PrimResult<CompiledKernel>;

    /// Target tier.
    fn isa(&self) -> CpuIsa;
}

struct TierCodegen {
    isa: CpuIsa,
    select: fn(&JitPoolConf) -> Option<PoolKernelFn>,
}

impl PoolingCodegen for TierCodegen {
    fn generate(&self, conf: &JitPoolConf) -> PrimResult<CompiledKernel> {
        if conf.isa != self.isa {
            return Err(PrimError::invalid(format!(
                "configuration frozen for {}, generator targets {}",
                conf.isa, self.isa
            )));
        }
        let func = (self.select)(conf).ok_or_else(|| {
            PrimError::unimplemented(format!(
                "no {} kernel for {:?} {} -> {}",
                self.isa,
                conf.alg,
                conf.src_dt.name(),
                conf.dst_dt.name()
            ))
        })?;
        log::debug!(
            "generated {} pooling kernel: {:?} {}->{} c={} c_block={} c_tail={}",
            self.isa,
            conf.alg,
            conf.src_dt.name(),
            conf.dst_dt.name(),
            conf.c,
            conf.c_block,
            conf.c_tail
        );
        Ok(CompiledKernel {
            isa: self.isa,
            conf: conf.clone(),
            func,
        })
    }

    fn isa(&self) -> CpuIsa {
        self.isa
    }
}

static SSE41_CODEGEN: TierCodegen = TierCodegen {
    isa: kernel::sse41::ISA,
    select: kernel::sse41::select,
};
static AVX2_CODEGEN: TierCodegen = TierCodegen {
    isa: kernel::avx2::ISA,
    select: kernel::avx2::select,
};
static AVX512_CORE_CODEGEN: TierCodegen = TierCodegen {
    isa: kernel::avx512_core::ISA,
    select: kernel::avx512_core::select,
};

/// Generator for `isa`.
pub fn select_codegen(isa: CpuIsa) -> &'static dyn PoolingCodegen {
    match isa {
        CpuIsa::Sse41 => &SSE41_CODEGEN,
        CpuIsa::Avx2 => &AVX2_CODEGEN,
        CpuIsa::Avx512Core => &AVX512_CORE_CODEGEN,
    }
}

/// Integer forward pooling over channel-last layouts for one tier.
#[derive(Debug, Clone)]
pub struct JitUniI8i8PoolingFwd {
    src_md: MemoryDesc,
    dst_md: MemoryDesc,
    post_ops: PostOps,
    kernel: CompiledKernel,
}

impl JitUniI8i8PoolingFwd {
    /// Validate `desc` against what the `isa` generator supports and build
    /// its kernel. Every decline is `Unimplemented`.
    pub fn init(
        engine: &Engine,
        isa: CpuIsa,
        desc: &PoolingDesc,
        attr: &PrimitiveAttr,
    ) -> PrimResult<Self> {
        if !engine.mayiuse(isa) {
            return Err(PrimError::unimplemented(format!("{isa} not available")));
        }
        let nd = desc.ndims();
        if !(3..=5).contains(&nd) {
            return Err(PrimError::unimplemented(format!("{nd}-d pooling")));
        }
        if desc.prop_kind != PropKind::ForwardInference {
            return Err(PrimError::unimplemented(format!("{:?} propagation", desc.prop_kind)));
        }
        if !desc.alg.is_pooling() {
            return Err(PrimError::unimplemented(format!("algorithm {:?}", desc.alg)));
        }
        let src_dt = desc.src.data_type();
        if !matches!(src_dt, DataType::S32 | DataType::S8 | DataType::U8) {
            return Err(PrimError::unimplemented(format!("source type {}", src_dt.name())));
        }
        if desc.is_dilated() {
            return Err(PrimError::unimplemented("dilated window"));
        }

        let mut resolved = *desc;
        resolved.dst = resolve_dst(&desc.src, &desc.dst)?;

        if !attr.has_default_values(SkipMask::POST_OPS) {
            return Err(PrimError::unimplemented("attributes other than post-ops"));
        }
        pooling_post_ops_ok(&attr.post_ops, &resolved.dst)?;

        let dst_dt = resolved.dst.data_type();
        if desc.alg.is_pooling_avg() {
            if !matches!(dst_dt, DataType::S8 | DataType::U8 | DataType::F32) {
                return Err(PrimError::unimplemented(format!(
                    "average into {}",
                    dst_dt.name()
                )));
            }
        } else if dst_dt != src_dt {
            return Err(PrimError::unimplemented(format!(
                "max from {} into {}",
                src_dt.name(),
                dst_dt.name()
            )));
        }

        let tag = FormatTag::channel_last(nd);
        let layout_ok = |md: &MemoryDesc| tag.is_some_and(|t| md.matches_tag(t));
        if !layout_ok(&resolved.src) || !layout_ok(&resolved.dst) {
            return Err(PrimError::unimplemented("layout is not dense channel-last"));
        }

        for i in 0..desc.spatial_ndims() {
            let k = desc.kernel[i];
            if desc.padding_l[i] >= k || desc.padding_r[i] >= k {
                return Err(PrimError::unimplemented(format!(
                    "spatial dim {i}: padding not smaller than kernel {k}"
                )));
            }
        }

        let conf = JitPoolConf::new(isa, &resolved, engine.config().parallel);
        let kernel = select_codegen(isa).generate(&conf)?;
        Ok(Self {
            src_md: resolved.src,
            dst_md: resolved.dst,
            post_ops: attr.post_ops.clone(),
            kernel,
        })
    }

    pub fn name(&self) -> &'static str {
        match self.kernel.isa() {
            CpuIsa::Sse41 => "jit_int8:sse41",
            CpuIsa::Avx2 => "jit_int8:avx2",
            CpuIsa::Avx512Core => "jit_int8:avx512_core",
        }
    }

    #[inline]
    pub fn kernel(&self) -> &CompiledKernel {
        &self.kernel
    }

    #[inline]
    pub fn dst_md(&self) -> &MemoryDesc {
        &self.dst_md
    }

    pub fn execute(&self, ctx: &mut ExecCtx<'_>) -> PrimResult<()> {
        let src = ctx.input_for(ArgId::Src, &self.src_md)?;
        let post_ops = bind_post_ops(&self.post_ops, &self.dst_md, ctx)?;
        let dst = ctx.output_for(ArgId::Dst, &self.dst_md)?;
        self.kernel.run(src, &post_ops, dst)
    }
}

/// `dst` with an `Any` layout replaced by the source's layout.
pub(crate) fn resolve_dst(src: &MemoryDesc, dst: &MemoryDesc) -> PrimResult<MemoryDesc> {
    if src.format_any() {
        return Err(PrimError::unimplemented("source layout `any`"));
    }
    if dst.format_any() {
        dst.with_format_like(src)
    } else {
        Ok(*dst)
    }
}

#[derive(Debug, Clone)]
pub enum PoolingImpl {
    Jit(JitUniI8i8PoolingFwd),
    Ref(RefPoolingFwd),
}

/// Pooling primitive descriptor: the accepted descriptor plus the
/// implementation that accepted it.
#[derive(Debug, Clone)]
pub struct PoolingPd {
    desc: PoolingDesc,
    imp: PoolingImpl,
}

impl PoolingPd {
    /// Descriptor with the destination layout resolved.
    pub fn desc(&self) -> &PoolingDesc {
        &self.desc
    }

    pub fn implementation(&self) -> &PoolingImpl {
        &self.imp
    }

    pub fn impl_name(&self) -> &'static str {
        match &self.imp {
            PoolingImpl::Jit(j) => j.name(),
            PoolingImpl::Ref(_) => RefPoolingFwd::NAME,
        }
    }

    pub fn execute(&self, ctx: &mut ExecCtx<'_>) -> PrimResult<()> {
        match &self.imp {
            PoolingImpl::Jit(j) => j.execute(ctx),
            PoolingImpl::Ref(r) => r.execute(ctx),
        }
    }
}

/// Create a pooling primitive descriptor from the first implementation that
/// accepts `desc`: JIT tiers from widest to narrowest, then the reference.
/// `Unimplemented` moves on to the next candidate; any other error stops.
pub fn create_pooling(
    engine: &Engine,
    desc: &PoolingDesc,
    attr: &PrimitiveAttr,
) -> PrimResult<PoolingPd> {
    for isa in CpuIsa::ALL_DESC {
        match JitUniI8i8PoolingFwd::init(engine, isa, desc, attr) {
            Ok(jit) => {
                log::debug!("pooling: selected {}", jit.name());
                let mut desc = *desc;
                desc.dst = *jit.dst_md();
                return Ok(PoolingPd { desc, imp: PoolingImpl::Jit(jit) });
            }
            Err(e) if e.is_unimplemented() => log::trace!("pooling: jit {isa} declined: {e}"),
            Err(e) => return Err(e),
        }
    }
    match RefPoolingFwd::init(engine, desc, attr) {
        Ok(r) => {
            log::debug!("pooling: selected {}", RefPoolingFwd::NAME);
            let mut desc = *desc;
            desc.dst = *r.dst_md();
            Ok(PoolingPd { desc, imp: PoolingImpl::Ref(r) })
        }
        Err(e) if e.is_unimplemented() => {
            log::trace!("pooling: {} declined: {e}", RefPoolingFwd::NAME);
            Err(PrimError::unimplemented("no pooling implementation accepts the descriptor"))
        }
        Err(e) => Err(e),
    }
}
