//! Integer pooling kernel bodies and their per-tier instantiations.
//!
//! Every kernel processes a run of consecutive output points of a
//! channel-last tensor. Channels are handled `CB` lanes at a time with
//! fixed-size accumulators, so each monomorphized body compiles down to
//! straight vector code for the tier it is instantiated under; the
//! remainder block exists only in the `TAIL = true` variants.
//!
//! `pooling_tier!` stamps out one module per instruction-set tier. Each
//! module compiles the same bodies with that tier's `target_feature` set and
//! exposes `select`, which maps a frozen [`JitPoolConf`] to one entry point.

use std::ops::Add;

use bytemuck::Pod;

use super::JitPoolConf;
use crate::attr::{apply_post_ops, BoundPostOp};
use crate::error::PrimResult;

/// Everything a kernel reads during one call.
pub(crate) struct KernelArgs<'a> {
    pub conf: &'a JitPoolConf,
    pub src: &'a [u8],
    pub post_ops: &'a [BoundPostOp<'a>],
}

/// Entry point of a generated kernel: computes output points
/// `first..first + dst.len() / row_bytes` into `dst`.
///
/// # Safety
/// The CPU must support the tier the kernel was generated for.
pub(crate) type PoolKernelFn = unsafe fn(&KernelArgs<'_>, usize, &mut [u8]) -> PrimResult<()>;

pub(crate) trait PoolSrc: Pod + PartialOrd + Send + Sync {
    type Acc: Copy + Default + Add<Output = Self::Acc>;
    const LOWEST: Self;

    fn widen(self) -> Self::Acc;
    fn acc_to_f32(acc: Self::Acc) -> f32;
    fn to_f32(self) -> f32;
}

pub(crate) trait PoolDst: Pod + Send + Sync {
    /// Round half to even and saturate for integer types.
    fn from_f32(v: f32) -> Self;
}

impl PoolSrc for i8 {
    type Acc = i32;
    const LOWEST: Self = i8::MIN;

    #[inline(always)]
    fn widen(self) -> i32 {
        i32::from(self)
    }
    #[inline(always)]
    fn acc_to_f32(acc: i32) -> f32 {
        acc as f32
    }
    #[inline(always)]
    fn to_f32(self) -> f32 {
        f32::from(self)
    }
}

impl PoolSrc for u8 {
    type Acc = i32;
    const LOWEST: Self = u8::MIN;

    #[inline(always)]
    fn widen(self) -> i32 {
        i32::from(self)
    }
    #[inline(always)]
    fn acc_to_f32(acc: i32) -> f32 {
        acc as f32
    }
    #[inline(always)]
    fn to_f32(self) -> f32 {
        f32::from(self)
    }
}

impl PoolSrc for i32 {
    type Acc = i64;
    const LOWEST: Self = i32::MIN;

    #[inline(always)]
    fn widen(self) -> i64 {
        i64::from(self)
    }
    #[inline(always)]
    fn acc_to_f32(acc: i64) -> f32 {
        acc as f32
    }
    #[inline(always)]
    fn to_f32(self) -> f32 {
        self as f32
    }
}

impl PoolDst for i8 {
    #[inline(always)]
    fn from_f32(v: f32) -> Self {
        v.round_ties_even() as i8
    }
}

impl PoolDst for u8 {
    #[inline(always)]
    fn from_f32(v: f32) -> Self {
        v.round_ties_even() as u8
    }
}

impl PoolDst for i32 {
    #[inline(always)]
    fn from_f32(v: f32) -> Self {
        v.round_ties_even() as i32
    }
}

impl PoolDst for f32 {
    #[inline(always)]
    fn from_f32(v: f32) -> Self {
        v
    }
}

/// Clipped window of one output point, in source coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Window {
    pub n: usize,
    pub d: (usize, usize),
    pub h: (usize, usize),
    pub w: (usize, usize),
}

impl Window {
    /// In-bounds taps.
    #[inline]
    pub fn count(&self) -> usize {
        (self.d.1.saturating_sub(self.d.0))
            * (self.h.1.saturating_sub(self.h.0))
            * (self.w.1.saturating_sub(self.w.0))
    }
}

/// Call `f` with the element offset of every in-bounds tap, channel 0.
#[inline(always)]
fn for_each_tap(conf: &JitPoolConf, win: &Window, mut f: impl FnMut(usize)) {
    for d in win.d.0..win.d.1 {
        for h in win.h.0..win.h.1 {
            let row = ((win.n * conf.id + d) * conf.ih + h) * conf.iw;
            for w in win.w.0..win.w.1 {
                f((row + w) * conf.c);
            }
        }
    }
}

#[inline(always)]
fn store_max<S: PoolSrc + PoolDst>(acc: &[S], out: &mut [S], c0: usize, ops: &[BoundPostOp<'_>]) {
    if ops.is_empty() {
        out.copy_from_slice(acc);
        return;
    }
    for (l, (o, &a)) in out.iter_mut().zip(acc).enumerate() {
        *o = S::from_f32(apply_post_ops(ops, a.to_f32(), c0 + l));
    }
}

#[inline(always)]
fn store_avg<S: PoolSrc, D: PoolDst>(
    acc: &[S::Acc],
    out: &mut [D],
    c0: usize,
    divisor: f32,
    ops: &[BoundPostOp<'_>],
) {
    for (l, (o, &a)) in out.iter_mut().zip(acc).enumerate() {
        let v = S::acc_to_f32(a) / divisor;
        let v = if ops.is_empty() { v } else { apply_post_ops(ops, v, c0 + l) };
        *o = D::from_f32(v);
    }
}

#[inline(always)]
pub(crate) fn max_body<S, const TAIL: bool, const CB: usize>(
    args: &KernelArgs<'_>,
    first: usize,
    dst: &mut [u8],
) -> PrimResult<()>
where
    S: PoolSrc + PoolDst,
{
    let conf = args.conf;
    let src: &[S] = bytemuck::try_cast_slice(args.src)?;
    let dst: &mut [S] = bytemuck::try_cast_slice_mut(dst)?;
    let full = conf.c / CB;

    for (i, row) in dst.chunks_exact_mut(conf.c).enumerate() {
        let win = conf.window(first + i);
        for b in 0..full {
            let c0 = b * CB;
            let mut acc = [S::LOWEST; CB];
            for_each_tap(conf, &win, |off| {
                let v = &src[off + c0..off + c0 + CB];
                for l in 0..CB {
                    if v[l] > acc[l] {
                        acc[l] = v[l];
                    }
                }
            });
            store_max(&acc, &mut row[c0..c0 + CB], c0, args.post_ops);
        }
        if TAIL {
            let c0 = full * CB;
            let len = conf.c - c0;
            let mut acc = [S::LOWEST; CB];
            for_each_tap(conf, &win, |off| {
                let v = &src[off + c0..off + c0 + len];
                for l in 0..len {
                    if v[l] > acc[l] {
                        acc[l] = v[l];
                    }
                }
            });
            store_max(&acc[..len], &mut row[c0..], c0, args.post_ops);
        }
    }
    Ok(())
}

#[inline(always)]
pub(crate) fn avg_body<S, D, const EXCL: bool, const TAIL: bool, const CB: usize>(
    args: &KernelArgs<'_>,
    first: usize,
    dst: &mut [u8],
) -> PrimResult<()>
where
    S: PoolSrc,
    D: PoolDst,
{
    let conf = args.conf;
    let src: &[S] = bytemuck::try_cast_slice(args.src)?;
    let dst: &mut [D] = bytemuck::try_cast_slice_mut(dst)?;
    let full = conf.c / CB;
    let nominal = conf.kernel_volume() as f32;

    for (i, row) in dst.chunks_exact_mut(conf.c).enumerate() {
        let win = conf.window(first + i);
        let divisor = if EXCL { win.count() as f32 } else { nominal };
        for b in 0..full {
            let c0 = b * CB;
            let mut acc = [S::Acc::default(); CB];
            for_each_tap(conf, &win, |off| {
                let v = &src[off + c0..off + c0 + CB];
                for l in 0..CB {
                    acc[l] = acc[l] + v[l].widen();
                }
            });
            store_avg::<S, D>(&acc, &mut row[c0..c0 + CB], c0, divisor, args.post_ops);
        }
        if TAIL {
            let c0 = full * CB;
            let len = conf.c - c0;
            let mut acc = [S::Acc::default(); CB];
            for_each_tap(conf, &win, |off| {
                let v = &src[off + c0..off + c0 + len];
                for l in 0..len {
                    acc[l] = acc[l] + v[l].widen();
                }
            });
            store_avg::<S, D>(&acc[..len], &mut row[c0..], c0, divisor, args.post_ops);
        }
    }
    Ok(())
}

macro_rules! pick {
    ($tail:expr; $f:ident) => {
        if $tail {
            $f::<true> as PoolKernelFn
        } else {
            $f::<false> as PoolKernelFn
        }
    };
    ($excl:expr, $tail:expr; $f:ident, $dst:ty) => {
        match ($excl, $tail) {
            (true, true) => $f::<$dst, true, true> as PoolKernelFn,
            (true, false) => $f::<$dst, true, false> as PoolKernelFn,
            (false, true) => $f::<$dst, false, true> as PoolKernelFn,
            (false, false) => $f::<$dst, false, false> as PoolKernelFn,
        }
    };
}

macro_rules! pooling_tier {
    ($module:ident, $isa:expr, $features:literal) => {
        pub(crate) mod $module {
            use super::*;
            use crate::desc::AlgKind;
            use crate::dispatch::CpuIsa;
            use crate::types::DataType;

            pub(crate) const ISA: CpuIsa = $isa;
            const VLEN: usize = CpuIsa::vlen(ISA);

            #[cfg_attr(
                any(target_arch = "x86", target_arch = "x86_64"),
                target_feature(enable = $features)
            )]
            unsafe fn max_s8<const TAIL: bool>(
                args: &KernelArgs<'_>,
                first: usize,
                dst: &mut [u8],
            ) -> PrimResult<()> {
                max_body::<i8, TAIL, { VLEN }>(args, first, dst)
            }

            #[cfg_attr(
                any(target_arch = "x86", target_arch = "x86_64"),
                target_feature(enable = $features)
            )]
            unsafe fn max_u8<const TAIL: bool>(
                args: &KernelArgs<'_>,
                first: usize,
                dst: &mut [u8],
            ) -> PrimResult<()> {
                max_body::<u8, TAIL, { VLEN }>(args, first, dst)
            }

            #[cfg_attr(
                any(target_arch = "x86", target_arch = "x86_64"),
                target_feature(enable = $features)
            )]
            unsafe fn max_s32<const TAIL: bool>(
                args: &KernelArgs<'_>,
                first: usize,
                dst: &mut [u8],
            ) -> PrimResult<()> {
                max_body::<i32, TAIL, { VLEN / 4 }>(args, first, dst)
            }

            #[cfg_attr(
                any(target_arch = "x86", target_arch = "x86_64"),
                target_feature(enable = $features)
            )]
            unsafe fn avg_s8<D: PoolDst, const EXCL: bool, const TAIL: bool>(
                args: &KernelArgs<'_>,
                first: usize,
                dst: &mut [u8],
            ) -> PrimResult<()> {
                avg_body::<i8, D, EXCL, TAIL, { VLEN }>(args, first, dst)
            }

            #[cfg_attr(
                any(target_arch = "x86", target_arch = "x86_64"),
                target_feature(enable = $features)
            )]
            unsafe fn avg_u8<D: PoolDst, const EXCL: bool, const TAIL: bool>(
                args: &KernelArgs<'_>,
                first: usize,
                dst: &mut [u8],
            ) -> PrimResult<()> {
                avg_body::<u8, D, EXCL, TAIL, { VLEN }>(args, first, dst)
            }

            #[cfg_attr(
                any(target_arch = "x86", target_arch = "x86_64"),
                target_feature(enable = $features)
            )]
            unsafe fn avg_s32<D: PoolDst, const EXCL: bool, const TAIL: bool>(
                args: &KernelArgs<'_>,
                first: usize,
                dst: &mut [u8],
            ) -> PrimResult<()> {
                avg_body::<i32, D, EXCL, TAIL, { VLEN / 4 }>(args, first, dst)
            }

            /// Entry point for `conf`, `None` for a type/algorithm pair this
            /// tier has no body for.
            pub(crate) fn select(conf: &JitPoolConf) -> Option<PoolKernelFn> {
                let tail = conf.c_tail != 0;
                let excl = conf.alg == AlgKind::PoolingAvgExcludePadding;
                let f = match (conf.alg, conf.src_dt, conf.dst_dt) {
                    (AlgKind::PoolingMax, DataType::S8, DataType::S8) => pick!(tail; max_s8),
                    (AlgKind::PoolingMax, DataType::U8, DataType::U8) => pick!(tail; max_u8),
                    (AlgKind::PoolingMax, DataType::S32, DataType::S32) => pick!(tail; max_s32),
                    (AlgKind::PoolingMax, _, _) => return None,
                    (_, DataType::S8, DataType::S8) => pick!(excl, tail; avg_s8, i8),
                    (_, DataType::S8, DataType::U8) => pick!(excl, tail; avg_s8, u8),
                    (_, DataType::S8, DataType::F32) => pick!(excl, tail; avg_s8, f32),
                    (_, DataType::U8, DataType::S8) => pick!(excl, tail; avg_u8, i8),
                    (_, DataType::U8, DataType::U8) => pick!(excl, tail; avg_u8, u8),
                    (_, DataType::U8, DataType::F32) => pick!(excl, tail; avg_u8, f32),
                    (_, DataType::S32, DataType::S8) => pick!(excl, tail; avg_s32, i8),
                    (_, DataType::S32, DataType::U8) => pick!(excl, tail; avg_s32, u8),
                    (_, DataType::S32, DataType::F32) => pick!(excl, tail; avg_s32, f32),
                    _ => return None,
                };
                Some(f)
            }
        }
    };
}

pooling_tier!(sse41, CpuIsa::Sse41, "sse4.1");
pooling_tier!(avx2, CpuIsa::Avx2, "avx,avx2");
pooling_tier!(avx512_core, CpuIsa::Avx512Core, "avx512f,avx512bw,avx512vl,avx512dq");
