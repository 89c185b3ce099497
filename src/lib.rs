//! cpu-prims: CPU compute primitives for binary elementwise ops and integer
//! pooling.
//!
//! This crate provides:
//! - **Eager validation**: malformed requests fail at creation with
//!   `InvalidArguments`; legal but unsupported ones fail with
//!   `Unimplemented` so the caller can fall back
//! - **ISA-specialized pooling**: kernels generated per instruction-set tier
//!   (SSE4.1, AVX2, AVX-512) from a frozen configuration
//! - **Reentrant primitives**: `execute(&self)` runs concurrently on disjoint
//!   buffers
//!
//! # Quick Start
//!
//! ```ignore
//! use cpu_prims::{create_pooling, pooling_desc, AlgKind, ArgId, Engine, ExecCtx, Primitive};
//!
//! let engine = Engine::cpu();
//! let desc = pooling_desc(PropKind::ForwardInference, AlgKind::PoolingMax, &src_md, &dst_md,
//!                         &[2, 2], &[2, 2], &[0, 0], &[0, 0], &[0, 0])?;
//! let prim = Primitive::new(create_pooling(&engine, &desc, &PrimitiveAttr::new())?);
//! let mut ctx = ExecCtx::new().with_input(ArgId::Src, &src).with_output(ArgId::Dst, &mut dst);
//! prim.execute(&mut ctx)?;
//! ```

pub mod attr;
pub mod binary;
pub mod desc;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod exec;
pub mod pooling;
pub mod primitive;
pub mod types;
pub mod validation;

pub use attr::{PostOp, PostOps, PrimitiveAttr, SkipMask};
pub use binary::{create_binary, BinaryPd, RefBinary};
pub use desc::{
    binary_desc, pooling_desc, AlgKind, BinaryDesc, OpDesc, PoolingDesc, PrimitiveKind, PropKind,
};
pub use dispatch::{max_cpu_isa, mayiuse, CpuIsa, IsaFeatures};
pub use engine::{Engine, EngineConfig};
pub use error::{status_of, PrimError, PrimResult, Status};
pub use exec::{ArgId, ExecCtx};
pub use pooling::{
    create_pooling, select_codegen, CompiledKernel, JitPoolConf, JitUniI8i8PoolingFwd,
    PoolingCodegen, PoolingImpl, PoolingPd, RefPoolingFwd,
};
pub use primitive::{Primitive, PrimitiveDesc};
pub use types::{DataType, FormatKind, FormatTag, MemoryDesc, MAX_NDIMS, RUNTIME_DIM_VAL};
pub use validation::validate_binary;
