//! End-to-end pooling tests.
//!
//! Tier-specific tests run every tier the host supports and skip the rest;
//! on hosts without any tier only the reference path is exercised.

use std::thread;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use cpu_prims::{
    create_pooling, pooling_desc, AlgKind, ArgId, CpuIsa, DataType, Engine, EngineConfig, ExecCtx,
    FormatTag, JitUniI8i8PoolingFwd, MemoryDesc, PoolingDesc, PostOps, PrimError, PrimResult,
    Primitive, PrimitiveAttr, PropKind, RefPoolingFwd,
};

// ═══════════════════════════════════════════════════════════════════════
// Helpers
// ═══════════════════════════════════════════════════════════════════════

struct Case {
    src: Vec<i64>,
    kernel: Vec<i64>,
    stride: Vec<i64>,
    pad_l: Vec<i64>,
    pad_r: Vec<i64>,
    alg: AlgKind,
    src_dt: DataType,
    dst_dt: DataType,
}

impl Case {
    fn desc(&self, prop: PropKind) -> PoolingDesc {
        let nd = self.src.len();
        let sp = nd - 2;
        let mut dst = self.src.clone();
        for i in 0..sp {
            dst[2 + i] =
                (self.src[2 + i] + self.pad_l[i] + self.pad_r[i] - self.kernel[i]) / self.stride[i] + 1;
        }
        let tag = FormatTag::channel_last(nd).unwrap();
        pooling_desc(
            prop,
            self.alg,
            &MemoryDesc::new(&self.src, self.src_dt, tag).unwrap(),
            &MemoryDesc::new(&dst, self.dst_dt, tag).unwrap(),
            &self.stride,
            &self.kernel,
            &vec![0; sp],
            &self.pad_l,
            &self.pad_r,
        )
        .unwrap()
    }
}

/// Word-backed buffer so every element type stays aligned.
fn random_words(md: &MemoryDesc, rng: &mut StdRng) -> Vec<u32> {
    let mut words = vec![0u32; md.size_bytes().div_ceil(4)];
    match md.data_type() {
        DataType::S32 => {
            for w in &mut words {
                *w = rng.gen_range(-1_000_000i32..1_000_000) as u32;
            }
        }
        _ => rng.fill(bytemuck::cast_slice_mut::<u32, u8>(&mut words)),
    }
    words
}

fn run<F>(exec: F, desc: &PoolingDesc, src: &[u32], post_src: &[(usize, Vec<f32>)]) -> PrimResult<Vec<u32>>
where
    F: Fn(&mut ExecCtx<'_>) -> PrimResult<()>,
{
    let mut dst = vec![0u32; desc.dst.size_bytes().div_ceil(4)];
    let mut ctx = ExecCtx::new().with_input(ArgId::Src, src);
    for (idx, data) in post_src {
        ctx.set_input(ArgId::PostOpSrc1(*idx), data);
    }
    ctx.set_output(ArgId::Dst, &mut dst);
    exec(&mut ctx)?;
    drop(ctx);
    Ok(dst)
}

fn usable_tiers(engine: &Engine) -> Vec<CpuIsa> {
    let tiers: Vec<_> = CpuIsa::ALL_DESC.into_iter().filter(|&i| engine.mayiuse(i)).collect();
    if tiers.is_empty() {
        eprintln!("no jit tier on this host, jit checks skipped");
    }
    tiers
}

fn nwc(dims: &[i64], dt: DataType) -> MemoryDesc {
    MemoryDesc::new(dims, dt, FormatTag::NWC).unwrap()
}

fn avg_1d(alg: AlgKind) -> PoolingDesc {
    pooling_desc(
        PropKind::ForwardInference,
        alg,
        &nwc(&[1, 1, 4], DataType::S8),
        &nwc(&[1, 1, 4], DataType::F32),
        &[1],
        &[3],
        &[0],
        &[1],
        &[1],
    )
    .unwrap()
}

// ═══════════════════════════════════════════════════════════════════════
// Averaging divisors
// ═══════════════════════════════════════════════════════════════════════

#[test]
fn test_border_divisor_exclude_vs_include() {
    let src: [i8; 4] = [3, 6, 9, 12];
    let engine = Engine::cpu();

    let mut results = Vec::new();
    for alg in [AlgKind::PoolingAvgExcludePadding, AlgKind::PoolingAvgIncludePadding] {
        let desc = avg_1d(alg);
        let prim = Primitive::new(create_pooling(&engine, &desc, &PrimitiveAttr::new()).unwrap());
        let mut dst = [0f32; 4];
        let mut ctx = ExecCtx::new().with_input(ArgId::Src, &src).with_output(ArgId::Dst, &mut dst);
        prim.execute(&mut ctx).unwrap();
        drop(ctx);
        results.push(dst);
    }
    // first window: one padding slot and two real slots
    assert_eq!(results[0], [4.5, 6.0, 9.0, 10.5]);
    assert_eq!(results[1], [3.0, 6.0, 9.0, 7.0]);
}

#[test]
fn test_avg_rounds_half_to_even() {
    let desc = {
        let mut d = avg_1d(AlgKind::PoolingAvgExcludePadding);
        d.dst = nwc(&[1, 1, 4], DataType::S8);
        d
    };
    let prim = Primitive::new(create_pooling(&Engine::cpu(), &desc, &PrimitiveAttr::new()).unwrap());
    let src: [i8; 4] = [3, 6, 9, 12];
    let mut dst = [0i8; 4];
    let mut ctx = ExecCtx::new().with_input(ArgId::Src, &src).with_output(ArgId::Dst, &mut dst);
    prim.execute(&mut ctx).unwrap();
    drop(ctx);
    // 4.5 -> 4, 10.5 -> 10
    assert_eq!(dst, [4, 6, 9, 10]);
}

// ═══════════════════════════════════════════════════════════════════════
// JIT init rejections
// ═══════════════════════════════════════════════════════════════════════

fn probe_isa() -> CpuIsa {
    Engine::cpu().max_isa().unwrap_or(CpuIsa::Sse41)
}

#[test]
fn test_jit_rejects_rank_outside_3_to_5() {
    let engine = Engine::cpu();
    let mut desc = avg_1d(AlgKind::PoolingMax);
    desc.dst = nwc(&[1, 1, 4], DataType::S8);

    let mut flat = desc;
    flat.src = MemoryDesc::new(&[1, 4], DataType::S8, FormatTag::Ab).unwrap();
    flat.dst = flat.src;
    let err = JitUniI8i8PoolingFwd::init(&engine, probe_isa(), &flat, &PrimitiveAttr::new()).unwrap_err();
    assert!(err.is_unimplemented());

    let mut deep = desc;
    deep.src = MemoryDesc::new(&[1, 4, 1, 1, 1, 1], DataType::S8, FormatTag::Abcdef).unwrap();
    deep.dst = deep.src;
    let err = JitUniI8i8PoolingFwd::init(&engine, probe_isa(), &deep, &PrimitiveAttr::new()).unwrap_err();
    assert!(err.is_unimplemented());
}

#[test]
fn test_jit_rejects_dilation_and_ref_takes_over() {
    let engine = Engine::cpu();
    let desc = pooling_desc(
        PropKind::ForwardInference,
        AlgKind::PoolingMax,
        &nwc(&[1, 16, 9], DataType::S8),
        &nwc(&[1, 16, 5], DataType::S8),
        &[1],
        &[3],
        &[1],
        &[0],
        &[0],
    )
    .unwrap();
    let err = JitUniI8i8PoolingFwd::init(&engine, probe_isa(), &desc, &PrimitiveAttr::new()).unwrap_err();
    assert!(err.is_unimplemented());

    let pd = create_pooling(&engine, &desc, &PrimitiveAttr::new()).unwrap();
    assert_eq!(pd.impl_name(), RefPoolingFwd::NAME);
}

#[test]
fn test_backward_rejected_everywhere() {
    let engine = Engine::cpu();
    let mut desc = avg_1d(AlgKind::PoolingAvgIncludePadding);
    desc.prop_kind = PropKind::Backward;
    for isa in CpuIsa::ALL_DESC {
        let err = JitUniI8i8PoolingFwd::init(&engine, isa, &desc, &PrimitiveAttr::new()).unwrap_err();
        assert!(err.is_unimplemented());
    }
    let err = create_pooling(&engine, &desc, &PrimitiveAttr::new()).unwrap_err();
    assert!(matches!(err, PrimError::Unimplemented(_)));
}

#[test]
fn test_jit_rejects_unsupported_matrix() {
    let engine = Engine::cpu();
    let isa = probe_isa();
    let attr = PrimitiveAttr::new();
    let base = avg_1d(AlgKind::PoolingAvgIncludePadding);

    // training
    let mut d = base;
    d.prop_kind = PropKind::ForwardTraining;
    assert!(JitUniI8i8PoolingFwd::init(&engine, isa, &d, &attr).unwrap_err().is_unimplemented());

    // f32 source
    let mut d = base;
    d.src = nwc(&[1, 1, 4], DataType::F32);
    assert!(JitUniI8i8PoolingFwd::init(&engine, isa, &d, &attr).unwrap_err().is_unimplemented());

    // average into s32
    let mut d = base;
    d.dst = nwc(&[1, 1, 4], DataType::S32);
    assert!(JitUniI8i8PoolingFwd::init(&engine, isa, &d, &attr).unwrap_err().is_unimplemented());

    // channel-first layout; with one channel ncw and nwc strides coincide
    let mut d = base;
    d.src = MemoryDesc::new(&[1, 2, 4], DataType::S8, FormatTag::NCW).unwrap();
    d.dst = MemoryDesc::new(&[1, 2, 4], DataType::F32, FormatTag::NCW).unwrap();
    assert!(JitUniI8i8PoolingFwd::init(&engine, isa, &d, &attr).unwrap_err().is_unimplemented());

    // sum post-op
    let mut po = PostOps::new();
    po.append_sum(1.0);
    let err = JitUniI8i8PoolingFwd::init(&engine, isa, &base, &PrimitiveAttr::with_post_ops(po)).unwrap_err();
    assert!(err.is_unimplemented());

    // output scale
    let scaled = PrimitiveAttr { output_scale: Some(0.5), ..PrimitiveAttr::new() };
    assert!(JitUniI8i8PoolingFwd::init(&engine, isa, &base, &scaled).unwrap_err().is_unimplemented());
}

#[test]
fn test_jit_rejects_padding_as_wide_as_kernel() {
    let desc = pooling_desc(
        PropKind::ForwardInference,
        AlgKind::PoolingAvgExcludePadding,
        &nwc(&[1, 8, 4], DataType::U8),
        &nwc(&[1, 8, 7], DataType::U8),
        &[1],
        &[2],
        &[0],
        &[2],
        &[2],
    )
    .unwrap();
    let err = JitUniI8i8PoolingFwd::init(&Engine::cpu(), probe_isa(), &desc, &PrimitiveAttr::new())
        .unwrap_err();
    assert!(err.is_unimplemented());
}

// ═══════════════════════════════════════════════════════════════════════
// Implementation selection
// ═══════════════════════════════════════════════════════════════════════

#[test]
fn test_selection_prefers_widest_usable_tier() {
    let case = Case {
        src: vec![2, 24, 6, 6],
        kernel: vec![2, 2],
        stride: vec![2, 2],
        pad_l: vec![0, 0],
        pad_r: vec![0, 0],
        alg: AlgKind::PoolingMax,
        src_dt: DataType::S8,
        dst_dt: DataType::S8,
    };
    let desc = case.desc(PropKind::ForwardInference);

    let engine = Engine::cpu();
    let pd = create_pooling(&engine, &desc, &PrimitiveAttr::new()).unwrap();
    match engine.max_isa() {
        Some(isa) => assert_eq!(pd.impl_name(), format!("jit_int8:{isa}")),
        None => assert_eq!(pd.impl_name(), RefPoolingFwd::NAME),
    }

    let capped = Engine::with_config(EngineConfig { max_isa: Some(CpuIsa::Sse41), parallel: false });
    let pd = create_pooling(&capped, &desc, &PrimitiveAttr::new()).unwrap();
    if capped.mayiuse(CpuIsa::Sse41) {
        assert_eq!(pd.impl_name(), "jit_int8:sse41");
    }
}

#[test]
fn test_dst_any_takes_source_layout() {
    let src = MemoryDesc::new(&[1, 8, 4, 4], DataType::U8, FormatTag::NHWC).unwrap();
    let dst = MemoryDesc::new(&[1, 8, 2, 2], DataType::U8, FormatTag::Any).unwrap();
    let desc = pooling_desc(
        PropKind::ForwardInference,
        AlgKind::PoolingMax,
        &src,
        &dst,
        &[2, 2],
        &[2, 2],
        &[0, 0],
        &[0, 0],
        &[0, 0],
    )
    .unwrap();
    let pd = create_pooling(&Engine::cpu(), &desc, &PrimitiveAttr::new()).unwrap();
    assert!(pd.desc().dst.matches_tag(FormatTag::NHWC));
}

// ═══════════════════════════════════════════════════════════════════════
// JIT vs reference
// ═══════════════════════════════════════════════════════════════════════

fn cases() -> Vec<Case> {
    vec![
        // 1-D, tail on every tier
        Case {
            src: vec![2, 37, 11],
            kernel: vec![3],
            stride: vec![2],
            pad_l: vec![1],
            pad_r: vec![1],
            alg: AlgKind::PoolingAvgExcludePadding,
            src_dt: DataType::S8,
            dst_dt: DataType::U8,
        },
        Case {
            src: vec![1, 70, 9, 7],
            kernel: vec![3, 2],
            stride: vec![2, 1],
            pad_l: vec![1, 1],
            pad_r: vec![2, 0],
            alg: AlgKind::PoolingMax,
            src_dt: DataType::U8,
            dst_dt: DataType::U8,
        },
        Case {
            src: vec![2, 64, 5, 5],
            kernel: vec![2, 2],
            stride: vec![1, 1],
            pad_l: vec![1, 0],
            pad_r: vec![0, 1],
            alg: AlgKind::PoolingMax,
            src_dt: DataType::S8,
            dst_dt: DataType::S8,
        },
        Case {
            src: vec![1, 21, 6, 6],
            kernel: vec![3, 3],
            stride: vec![1, 1],
            pad_l: vec![1, 1],
            pad_r: vec![1, 1],
            alg: AlgKind::PoolingAvgIncludePadding,
            src_dt: DataType::S32,
            dst_dt: DataType::F32,
        },
        Case {
            src: vec![1, 19, 4, 5, 6],
            kernel: vec![2, 3, 2],
            stride: vec![2, 1, 2],
            pad_l: vec![0, 1, 1],
            pad_r: vec![1, 1, 0],
            alg: AlgKind::PoolingMax,
            src_dt: DataType::S32,
            dst_dt: DataType::S32,
        },
        Case {
            src: vec![1, 33, 3, 4, 4],
            kernel: vec![2, 2, 2],
            stride: vec![1, 2, 2],
            pad_l: vec![1, 0, 1],
            pad_r: vec![0, 0, 1],
            alg: AlgKind::PoolingAvgExcludePadding,
            src_dt: DataType::U8,
            dst_dt: DataType::S8,
        },
    ]
}

#[test]
fn test_jit_matches_reference_on_every_tier() {
    let engine = Engine::cpu();
    let attr = PrimitiveAttr::new();
    let mut rng = StdRng::seed_from_u64(0x5eed);

    for case in cases() {
        let desc = case.desc(PropKind::ForwardInference);
        let src = random_words(&desc.src, &mut rng);
        let reference = RefPoolingFwd::init(&engine, &desc, &attr).unwrap();
        let want = run(|ctx| reference.execute(ctx), &desc, &src, &[]).unwrap();

        for isa in usable_tiers(&engine) {
            let jit = JitUniI8i8PoolingFwd::init(&engine, isa, &desc, &attr).unwrap();
            let got = run(|ctx| jit.execute(ctx), &desc, &src, &[]).unwrap();
            assert_eq!(got, want, "{isa} {:?} {:?}->{:?} {:?}", case.alg, case.src_dt, case.dst_dt, case.src);
        }
    }
}

#[test]
fn test_jit_post_ops_match_reference() {
    let engine = Engine::cpu();
    let mut rng = StdRng::seed_from_u64(7);
    let case = Case {
        src: vec![2, 40, 7, 7],
        kernel: vec![3, 3],
        stride: vec![2, 2],
        pad_l: vec![1, 1],
        pad_r: vec![1, 1],
        alg: AlgKind::PoolingAvgIncludePadding,
        src_dt: DataType::S8,
        dst_dt: DataType::S8,
    };
    let desc = case.desc(PropKind::ForwardInference);

    let per_channel = MemoryDesc::new(&[1, 40, 1, 1], DataType::F32, FormatTag::NCHW).unwrap();
    let per_tensor = MemoryDesc::new(&[1, 1, 1, 1], DataType::F32, FormatTag::NCHW).unwrap();
    let mut po = PostOps::new();
    po.append_binary(AlgKind::BinaryMul, &per_channel).unwrap();
    po.append_eltwise(AlgKind::EltwiseRelu, 0.25, 0.0).unwrap();
    po.append_binary(AlgKind::BinaryAdd, &per_tensor).unwrap();
    po.append_eltwise(AlgKind::EltwiseClip, -100.0, 100.0).unwrap();
    let attr = PrimitiveAttr::with_post_ops(po);

    let scales: Vec<f32> = (0..40).map(|c| (c as f32 - 20.0) / 8.0).collect();
    let post = vec![(0, scales), (2, vec![3.5f32])];
    let src = random_words(&desc.src, &mut rng);

    let reference = RefPoolingFwd::init(&engine, &desc, &attr).unwrap();
    let want = run(|ctx| reference.execute(ctx), &desc, &src, &post).unwrap();
    for isa in usable_tiers(&engine) {
        let jit = JitUniI8i8PoolingFwd::init(&engine, isa, &desc, &attr).unwrap();
        let got = run(|ctx| jit.execute(ctx), &desc, &src, &post).unwrap();
        assert_eq!(got, want, "{isa}");

        // operand missing at execute time
        let err = run(|ctx| jit.execute(ctx), &desc, &src, &[]).unwrap_err();
        assert!(matches!(err, PrimError::RuntimeFailure(_)));
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Primitive execution properties
// ═══════════════════════════════════════════════════════════════════════

fn big_case() -> PoolingDesc {
    Case {
        src: vec![4, 48, 16, 16],
        kernel: vec![3, 3],
        stride: vec![1, 1],
        pad_l: vec![1, 1],
        pad_r: vec![1, 1],
        alg: AlgKind::PoolingAvgExcludePadding,
        src_dt: DataType::U8,
        dst_dt: DataType::U8,
    }
    .desc(PropKind::ForwardInference)
}

#[test]
fn test_execute_is_deterministic() {
    let desc = big_case();
    let prim = Primitive::new(create_pooling(&Engine::cpu(), &desc, &PrimitiveAttr::new()).unwrap());
    let src = random_words(&desc.src, &mut StdRng::seed_from_u64(11));
    let first = run(|ctx| prim.execute(ctx), &desc, &src, &[]).unwrap();
    for _ in 0..3 {
        assert_eq!(run(|ctx| prim.execute(ctx), &desc, &src, &[]).unwrap(), first);
    }
}

#[test]
fn test_parallel_matches_sequential() {
    let desc = big_case();
    let src = random_words(&desc.src, &mut StdRng::seed_from_u64(3));
    let seq_engine = Engine::with_config(EngineConfig { max_isa: None, parallel: false });
    let seq = Primitive::new(create_pooling(&seq_engine, &desc, &PrimitiveAttr::new()).unwrap());
    let par = Primitive::new(create_pooling(&Engine::cpu(), &desc, &PrimitiveAttr::new()).unwrap());
    assert_eq!(
        run(|ctx| seq.execute(ctx), &desc, &src, &[]).unwrap(),
        run(|ctx| par.execute(ctx), &desc, &src, &[]).unwrap()
    );
}

#[test]
fn test_concurrent_execute_on_shared_primitive() {
    let desc = big_case();
    let prim = Primitive::new(create_pooling(&Engine::cpu(), &desc, &PrimitiveAttr::new()).unwrap());
    let inputs: Vec<Vec<u32>> = (0..4)
        .map(|seed| random_words(&desc.src, &mut StdRng::seed_from_u64(100 + seed)))
        .collect();
    let sequential: Vec<Vec<u32>> = inputs
        .iter()
        .map(|src| run(|ctx| prim.execute(ctx), &desc, src, &[]).unwrap())
        .collect();

    let concurrent: Vec<Vec<u32>> = thread::scope(|s| {
        let handles: Vec<_> = inputs
            .iter()
            .map(|src| {
                let prim = &prim;
                let desc = &desc;
                s.spawn(move || run(|ctx| prim.execute(ctx), desc, src, &[]).unwrap())
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });
    assert_eq!(concurrent, sequential);
}

#[test]
fn test_short_buffers_fail_only_that_call() {
    let desc = big_case();
    let prim = Primitive::new(create_pooling(&Engine::cpu(), &desc, &PrimitiveAttr::new()).unwrap());
    let src = random_words(&desc.src, &mut StdRng::seed_from_u64(5));

    let short = &src[..src.len() / 2];
    let err = run(|ctx| prim.execute(ctx), &desc, short, &[]).unwrap_err();
    assert!(matches!(err, PrimError::RuntimeFailure(_)));

    assert!(run(|ctx| prim.execute(ctx), &desc, &src, &[]).is_ok());
}
