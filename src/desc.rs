//! Operation descriptors: immutable, by-value descriptions of one requested
//! operation. Built once from validated inputs and consumed by kernel
//! generation.

use crate::error::{PrimError, PrimResult};
use crate::types::MemoryDesc;

/// Maximum number of spatial dimensions a pooling window spans.
pub const MAX_SPATIAL: usize = 3;

pub type SpatialDims = [i64; MAX_SPATIAL];

/// Algorithm kinds across every primitive family. A kind belonging to the
/// wrong family is an invalid request, not an unsupported one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AlgKind {
    BinaryAdd,
    BinaryMul,
    BinaryMax,
    BinaryMin,
    BinaryDiv,
    BinarySub,
    BinaryGe,
    BinaryGt,
    BinaryLe,
    BinaryLt,
    BinaryEq,
    BinaryNe,
    BinaryPrelu,
    PoolingMax,
    PoolingAvgIncludePadding,
    PoolingAvgExcludePadding,
    EltwiseRelu,
    EltwiseLinear,
    EltwiseClip,
}

impl AlgKind {
    pub fn is_binary(self) -> bool {
        matches!(
            self,
            Self::BinaryAdd
                | Self::BinaryMul
                | Self::BinaryMax
                | Self::BinaryMin
                | Self::BinaryDiv
                | Self::BinarySub
                | Self::BinaryGe
                | Self::BinaryGt
                | Self::BinaryLe
                | Self::BinaryLt
                | Self::BinaryEq
                | Self::BinaryNe
                | Self::BinaryPrelu
        )
    }

    pub fn is_pooling(self) -> bool {
        matches!(
            self,
            Self::PoolingMax | Self::PoolingAvgIncludePadding | Self::PoolingAvgExcludePadding
        )
    }

    pub fn is_pooling_avg(self) -> bool {
        matches!(self, Self::PoolingAvgIncludePadding | Self::PoolingAvgExcludePadding)
    }

    pub fn is_eltwise(self) -> bool {
        matches!(self, Self::EltwiseRelu | Self::EltwiseLinear | Self::EltwiseClip)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PropKind {
    ForwardTraining,
    ForwardInference,
    Backward,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PrimitiveKind {
    Binary,
    Pooling,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BinaryDesc {
    pub alg: AlgKind,
    pub src: [MemoryDesc; 2],
    pub dst: MemoryDesc,
}

/// Pooling descriptor. Spatial arrays hold `ndims - 2` meaningful entries.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PoolingDesc {
    pub prop_kind: PropKind,
    pub alg: AlgKind,
    pub src: MemoryDesc,
    pub dst: MemoryDesc,
    pub strides: SpatialDims,
    pub kernel: SpatialDims,
    /// Zero-based: 0 means adjacent taps.
    pub dilation: SpatialDims,
    pub padding_l: SpatialDims,
    pub padding_r: SpatialDims,
}

impl PoolingDesc {
    #[inline]
    pub fn ndims(&self) -> usize {
        self.src.ndims()
    }

    #[inline]
    pub fn spatial_ndims(&self) -> usize {
        self.ndims().saturating_sub(2)
    }

    pub fn is_dilated(&self) -> bool {
        self.dilation.iter().take(self.spatial_ndims()).any(|&d| d != 0)
    }

    pub fn is_forward(&self) -> bool {
        matches!(self.prop_kind, PropKind::ForwardTraining | PropKind::ForwardInference)
    }
}

/// Tagged union over primitive families.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OpDesc {
    Binary(BinaryDesc),
    Pooling(PoolingDesc),
}

impl OpDesc {
    pub fn kind(&self) -> PrimitiveKind {
        match self {
            Self::Binary(_) => PrimitiveKind::Binary,
            Self::Pooling(_) => PrimitiveKind::Pooling,
        }
    }
}

impl From<BinaryDesc> for OpDesc {
    fn from(d: BinaryDesc) -> Self {
        Self::Binary(d)
    }
}

impl From<PoolingDesc> for OpDesc {
    fn from(d: PoolingDesc) -> Self {
        Self::Pooling(d)
    }
}

/// Assemble a binary descriptor from operands that already passed
/// [`validate_binary`](crate::validation::validate_binary). Copies by value.
pub fn binary_desc(
    alg: AlgKind,
    src0: &MemoryDesc,
    src1: &MemoryDesc,
    dst: &MemoryDesc,
) -> BinaryDesc {
    BinaryDesc {
        alg,
        src: [*src0, *src1],
        dst: *dst,
    }
}

/// Build and check a pooling descriptor. Any propagation kind is accepted
/// here; implementations decide which directions they support.
///
/// Only the leading `src.ndims() - 2` entries of each spatial slice are
/// used; slices shorter than that are an error.
#[allow(clippy::too_many_arguments)]
pub fn pooling_desc(
    prop_kind: PropKind,
    alg: AlgKind,
    src: &MemoryDesc,
    dst: &MemoryDesc,
    strides: &[i64],
    kernel: &[i64],
    dilation: &[i64],
    padding_l: &[i64],
    padding_r: &[i64],
) -> PrimResult<PoolingDesc> {
    if !alg.is_pooling() {
        return Err(PrimError::invalid(format!("{alg:?} is not a pooling algorithm")));
    }
    let ndims = src.ndims();
    if !(3..=5).contains(&ndims) || dst.ndims() != ndims {
        return Err(PrimError::invalid(format!(
            "pooling needs matching ranks in 3..=5, got src {} dst {}",
            ndims,
            dst.ndims()
        )));
    }
    if src.has_runtime_dims_or_strides() || dst.has_runtime_dims_or_strides() {
        return Err(PrimError::unimplemented("runtime dims or strides in pooling"));
    }
    let sp = ndims - 2;
    for (name, v) in [
        ("strides", strides),
        ("kernel", kernel),
        ("dilation", dilation),
        ("padding_l", padding_l),
        ("padding_r", padding_r),
    ] {
        if v.len() < sp {
            return Err(PrimError::invalid(format!(
                "{name} has {} entries, {sp} spatial dims",
                v.len()
            )));
        }
    }
    if src.dims()[0] != dst.dims()[0] || src.dims()[1] != dst.dims()[1] {
        return Err(PrimError::invalid("batch and channel extents must match"));
    }

    let mut desc = PoolingDesc {
        prop_kind,
        alg,
        src: *src,
        dst: *dst,
        strides: [1; MAX_SPATIAL],
        kernel: [1; MAX_SPATIAL],
        dilation: [0; MAX_SPATIAL],
        padding_l: [0; MAX_SPATIAL],
        padding_r: [0; MAX_SPATIAL],
    };

    for i in 0..sp {
        let (k, s, dl, pl, pr) = (kernel[i], strides[i], dilation[i], padding_l[i], padding_r[i]);
        if k <= 0 || s <= 0 || dl < 0 || pl < 0 || pr < 0 {
            return Err(PrimError::invalid(format!(
                "spatial dim {i}: kernel {k}, stride {s}, dilation {dl}, padding {pl}/{pr}"
            )));
        }
        let src_ext = src.dims()[2 + i];
        let dst_ext = dst.dims()[2 + i];
        let span = dl
            .checked_add(1)
            .and_then(|taps| (k - 1).checked_mul(taps))
            .and_then(|r| r.checked_add(1))
            .and_then(|ker_range| src_ext.checked_add(pl)?.checked_add(pr)?.checked_sub(ker_range))
            .ok_or_else(|| {
                PrimError::invalid(format!("spatial dim {i}: window arithmetic overflows"))
            })?;
        if span < 0 || span / s + 1 != dst_ext {
            return Err(PrimError::invalid(format!(
                "spatial dim {i}: output extent {dst_ext} inconsistent with input {src_ext}"
            )));
        }
        desc.kernel[i] = k;
        desc.strides[i] = s;
        desc.dilation[i] = dl;
        desc.padding_l[i] = pl;
        desc.padding_r[i] = pr;
    }

    Ok(desc)
}
