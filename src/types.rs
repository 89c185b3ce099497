//! Memory descriptors: the static shape, stride, data type and layout of one
//! tensor argument.
//!
//! A descriptor is in exactly one of three states: fully specified (dense or
//! explicit strides), `Any` (layout left to the implementation), or carrying
//! runtime extents/strides marked with [`RUNTIME_DIM_VAL`].

use crate::error::{PrimError, PrimResult};

/// Maximum tensor rank.
pub const MAX_NDIMS: usize = 6;

/// Marker for an extent or stride only known at execution time.
pub const RUNTIME_DIM_VAL: i64 = i64::MIN;

pub type Dims = [i64; MAX_NDIMS];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DataType {
    #[default]
    Undef,
    F32,
    S32,
    S8,
    U8,
}

impl DataType {
    /// Element size in bytes (0 for `Undef`).
    pub const fn size(self) -> usize {
        match self {
            Self::Undef => 0,
            Self::F32 | Self::S32 => 4,
            Self::S8 | Self::U8 => 1,
        }
    }

    pub const fn is_integral(self) -> bool {
        matches!(self, Self::S32 | Self::S8 | Self::U8)
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Undef => "undef",
            Self::F32 => "f32",
            Self::S32 => "s32",
            Self::S8 => "s8",
            Self::U8 => "u8",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FormatKind {
    Undef,
    Any,
    Blocked,
}

/// Layout tags. Letters name logical dimensions (`a` = dim 0, ...) in the
/// order they are laid out in memory, outermost first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FormatTag {
    Undef,
    Any,
    A,
    Ab,
    Abc,
    Abcd,
    Abcde,
    Abcdef,
    Acb,
    Acdb,
    Acdeb,
}

impl FormatTag {
    pub const NCW: Self = Self::Abc;
    pub const NCHW: Self = Self::Abcd;
    pub const NCDHW: Self = Self::Abcde;
    pub const NWC: Self = Self::Acb;
    pub const NHWC: Self = Self::Acdb;
    pub const NDHWC: Self = Self::Acdeb;

    /// Dimension order, outermost first. Empty for `Undef`/`Any`.
    pub fn perm(self) -> &'static [usize] {
        match self {
            Self::Undef | Self::Any => &[],
            Self::A => &[0],
            Self::Ab => &[0, 1],
            Self::Abc => &[0, 1, 2],
            Self::Abcd => &[0, 1, 2, 3],
            Self::Abcde => &[0, 1, 2, 3, 4],
            Self::Abcdef => &[0, 1, 2, 3, 4, 5],
            Self::Acb => &[0, 2, 1],
            Self::Acdb => &[0, 2, 3, 1],
            Self::Acdeb => &[0, 2, 3, 4, 1],
        }
    }

    pub fn ndims(self) -> Option<usize> {
        match self {
            Self::Undef | Self::Any => None,
            t => Some(t.perm().len()),
        }
    }

    /// Row-major tag for the given rank.
    pub fn plain(ndims: usize) -> Self {
        match ndims {
            1 => Self::A,
            2 => Self::Ab,
            3 => Self::Abc,
            4 => Self::Abcd,
            5 => Self::Abcde,
            6 => Self::Abcdef,
            _ => Self::Undef,
        }
    }

    /// Channel-last tag (`nwc`, `nhwc`, `ndhwc`) for ranks 3..=5.
    pub fn channel_last(ndims: usize) -> Option<Self> {
        match ndims {
            3 => Some(Self::Acb),
            4 => Some(Self::Acdb),
            5 => Some(Self::Acdeb),
            _ => None,
        }
    }

    /// Every concrete tag of the given rank.
    pub fn tags_for_rank(ndims: usize) -> &'static [FormatTag] {
        match ndims {
            1 => &[Self::A],
            2 => &[Self::Ab],
            3 => &[Self::Abc, Self::Acb],
            4 => &[Self::Abcd, Self::Acdb],
            5 => &[Self::Abcde, Self::Acdeb],
            6 => &[Self::Abcdef],
            _ => &[],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryDesc {
    ndims: usize,
    dims: Dims,
    data_type: DataType,
    format_kind: FormatKind,
    strides: Dims,
}

impl MemoryDesc {
    /// Build a descriptor from extents and a layout tag.
    pub fn new(dims: &[i64], data_type: DataType, tag: FormatTag) -> PrimResult<Self> {
        let ndims = dims.len();
        check_dims(dims)?;
        if data_type == DataType::Undef {
            return Err(PrimError::invalid("data type must be defined"));
        }

        let mut d = [0i64; MAX_NDIMS];
        d[..ndims].copy_from_slice(dims);

        match tag {
            FormatTag::Undef => Err(PrimError::invalid("undefined format tag")),
            FormatTag::Any => {
                dims.iter()
                    .filter(|&&e| e != RUNTIME_DIM_VAL)
                    .try_fold(data_type.size() as i64, |acc, &e| acc.checked_mul(e))
                    .ok_or_else(size_overflow)?;
                Ok(Self {
                    ndims,
                    dims: d,
                    data_type,
                    format_kind: FormatKind::Any,
                    strides: [0; MAX_NDIMS],
                })
            }
            tag => {
                if tag.ndims() != Some(ndims) {
                    return Err(PrimError::invalid(format!(
                        "format tag {tag:?} does not fit {ndims} dimensions"
                    )));
                }
                let strides = dense_strides(&d[..ndims], tag.perm()).ok_or_else(size_overflow)?;
                span_bytes(&d[..ndims], &strides[..ndims], data_type).ok_or_else(size_overflow)?;
                Ok(Self {
                    ndims,
                    dims: d,
                    data_type,
                    format_kind: FormatKind::Blocked,
                    strides,
                })
            }
        }
    }

    /// Build a descriptor with explicit strides (in elements).
    pub fn with_strides(dims: &[i64], data_type: DataType, strides: &[i64]) -> PrimResult<Self> {
        let ndims = dims.len();
        check_dims(dims)?;
        if data_type == DataType::Undef {
            return Err(PrimError::invalid("data type must be defined"));
        }
        if strides.len() != ndims {
            return Err(PrimError::invalid(format!(
                "{} strides given for {} dimensions",
                strides.len(),
                ndims
            )));
        }
        if let Some(s) = strides.iter().find(|&&s| s != RUNTIME_DIM_VAL && s <= 0) {
            return Err(PrimError::invalid(format!("stride {s} must be positive")));
        }

        let mut d = [0i64; MAX_NDIMS];
        let mut s = [0i64; MAX_NDIMS];
        d[..ndims].copy_from_slice(dims);
        s[..ndims].copy_from_slice(strides);
        span_bytes(dims, strides, data_type).ok_or_else(size_overflow)?;
        Ok(Self {
            ndims,
            dims: d,
            data_type,
            format_kind: FormatKind::Blocked,
            strides: s,
        })
    }

    #[inline]
    pub fn ndims(&self) -> usize {
        self.ndims
    }

    #[inline]
    pub fn dims(&self) -> &[i64] {
        &self.dims[..self.ndims]
    }

    #[inline]
    pub fn strides(&self) -> &[i64] {
        &self.strides[..self.ndims]
    }

    #[inline]
    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    #[inline]
    pub fn format_kind(&self) -> FormatKind {
        self.format_kind
    }

    #[inline]
    pub fn format_any(&self) -> bool {
        self.format_kind == FormatKind::Any
    }

    pub fn has_runtime_dims(&self) -> bool {
        self.dims().contains(&RUNTIME_DIM_VAL)
    }

    pub fn has_runtime_strides(&self) -> bool {
        self.format_kind == FormatKind::Blocked && self.strides().contains(&RUNTIME_DIM_VAL)
    }

    pub fn has_runtime_dims_or_strides(&self) -> bool {
        self.has_runtime_dims() || self.has_runtime_strides()
    }

    /// Logical element count. Zero while any extent is runtime-determined.
    pub fn nelems(&self) -> usize {
        if self.has_runtime_dims() {
            return 0;
        }
        self.dims().iter().map(|&d| d as usize).product()
    }

    /// Bytes spanned by the tensor (0 for `Any` or runtime descriptors).
    pub fn size_bytes(&self) -> usize {
        if self.format_kind != FormatKind::Blocked || self.has_runtime_dims_or_strides() {
            return 0;
        }
        // construction rejected any span that does not fit
        span_bytes(self.dims(), self.strides(), self.data_type).unwrap_or(0)
    }

    /// Whether the strides are exactly the dense strides of `tag`.
    pub fn matches_tag(&self, tag: FormatTag) -> bool {
        if self.format_kind != FormatKind::Blocked
            || self.has_runtime_dims_or_strides()
            || tag.ndims() != Some(self.ndims)
        {
            return false;
        }
        dense_strides(self.dims(), tag.perm())
            .is_some_and(|dense| dense[..self.ndims] == self.strides[..self.ndims])
    }

    pub fn matches_one_of_tag(&self, tags: &[FormatTag]) -> Option<FormatTag> {
        tags.iter().copied().find(|&t| self.matches_tag(t))
    }

    /// Offset (in elements) of a logical index.
    #[inline]
    pub fn off_l(&self, idx: &[usize]) -> usize {
        idx.iter()
            .zip(self.strides())
            .map(|(&i, &s)| i * s as usize)
            .sum()
    }

    /// Same extents and type, dense layout given by `tag`.
    pub fn with_tag(&self, tag: FormatTag) -> PrimResult<Self> {
        Self::new(self.dims(), self.data_type, tag)
    }

    /// Same extents and type, laid out like `other` when `other` has a known
    /// dense tag of the same rank, row-major otherwise.
    pub fn with_format_like(&self, other: &MemoryDesc) -> PrimResult<Self> {
        let tag = if other.ndims == self.ndims {
            other.matches_one_of_tag(FormatTag::tags_for_rank(self.ndims))
        } else {
            None
        };
        self.with_tag(tag.unwrap_or_else(|| FormatTag::plain(self.ndims)))
    }
}

fn check_dims(dims: &[i64]) -> PrimResult<()> {
    if dims.is_empty() || dims.len() > MAX_NDIMS {
        return Err(PrimError::invalid(format!(
            "rank {} outside 1..={MAX_NDIMS}",
            dims.len()
        )));
    }
    if let Some(d) = dims.iter().find(|&&d| d != RUNTIME_DIM_VAL && d <= 0) {
        return Err(PrimError::invalid(format!("extent {d} must be positive")));
    }
    Ok(())
}

fn size_overflow() -> PrimError {
    PrimError::invalid("tensor size overflows")
}

/// Dense strides for `dims` laid out in `perm` order (outermost first).
/// Any runtime extent makes every stride runtime. `None` when the element
/// count does not fit in `i64`.
fn dense_strides(dims: &[i64], perm: &[usize]) -> Option<Dims> {
    let mut strides = [0i64; MAX_NDIMS];
    if dims.contains(&RUNTIME_DIM_VAL) {
        strides[..dims.len()].fill(RUNTIME_DIM_VAL);
        return Some(strides);
    }
    let mut acc = 1i64;
    for &d in perm.iter().rev() {
        strides[d] = acc;
        acc = acc.checked_mul(dims[d])?;
    }
    Some(strides)
}

/// Bytes from the first to one past the last element. Runtime extents or
/// strides span 0 bytes. `None` when the span does not fit in `i64` or
/// `usize`.
fn span_bytes(dims: &[i64], strides: &[i64], data_type: DataType) -> Option<usize> {
    if dims.contains(&RUNTIME_DIM_VAL) || strides.contains(&RUNTIME_DIM_VAL) {
        return Some(0);
    }
    let last = dims
        .iter()
        .zip(strides)
        .try_fold(0i64, |acc, (&d, &s)| acc.checked_add((d - 1).checked_mul(s)?))?;
    let span = last.checked_add(1)?.checked_mul(data_type.size() as i64)?;
    usize::try_from(span).ok()
}

/// Visit every multi-index below `extents` in row-major order.
pub(crate) fn for_each_index(extents: &[usize], mut f: impl FnMut(&[usize])) {
    if extents.is_empty() || extents.len() > MAX_NDIMS || extents.contains(&0) {
        return;
    }
    let mut buf = [0usize; MAX_NDIMS];
    let idx = &mut buf[..extents.len()];
    loop {
        f(idx);
        let mut dim = extents.len();
        loop {
            if dim == 0 {
                return;
            }
            dim -= 1;
            idx[dim] += 1;
            if idx[dim] < extents[dim] {
                break;
            }
            idx[dim] = 0;
        }
    }
}
