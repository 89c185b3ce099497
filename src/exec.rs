//! Execution context: the runtime buffers one `execute` call reads and
//! writes, keyed by abstract argument identifiers. The context borrows the
//! buffers; it never allocates or owns them.

use std::collections::HashMap;

use bytemuck::Pod;

use crate::error::{PrimError, PrimResult};
use crate::types::{DataType, MemoryDesc};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArgId {
    Src,
    Src0,
    Src1,
    Dst,
    /// Second operand of the binary post-op at this index in the chain.
    PostOpSrc1(usize),
}

#[derive(Debug, Default)]
pub struct ExecCtx<'a> {
    inputs: HashMap<ArgId, &'a [u8]>,
    outputs: HashMap<ArgId, &'a mut [u8]>,
}

impl<'a> ExecCtx<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_input<T: Pod>(mut self, id: ArgId, data: &'a [T]) -> Self {
        self.set_input(id, data);
        self
    }

    pub fn with_output<T: Pod>(mut self, id: ArgId, data: &'a mut [T]) -> Self {
        self.set_output(id, data);
        self
    }

    pub fn set_input<T: Pod>(&mut self, id: ArgId, data: &'a [T]) {
        self.inputs.insert(id, bytemuck::cast_slice(data));
    }

    pub fn set_output<T: Pod>(&mut self, id: ArgId, data: &'a mut [T]) {
        self.outputs.insert(id, bytemuck::cast_slice_mut(data));
    }

    /// Raw bytes of an input argument.
    pub fn input(&self, id: ArgId) -> PrimResult<&'a [u8]> {
        self.inputs
            .get(&id)
            .copied()
            .ok_or_else(|| PrimError::runtime(format!("missing input argument {id:?}")))
    }

    /// Raw bytes of an output argument.
    pub fn output(&mut self, id: ArgId) -> PrimResult<&mut [u8]> {
        self.outputs
            .get_mut(&id)
            .map(|b| &mut **b)
            .ok_or_else(|| PrimError::runtime(format!("missing output argument {id:?}")))
    }

    /// Input bytes covering exactly the span `md` addresses. Longer buffers
    /// are cut to that span.
    pub(crate) fn input_for(&self, id: ArgId, md: &MemoryDesc) -> PrimResult<&'a [u8]> {
        let bytes = self.input(id)?;
        let need = check_len(id, bytes.len(), md)?;
        Ok(&bytes[..need])
    }

    /// Output bytes covering exactly the span `md` addresses.
    pub(crate) fn output_for(&mut self, id: ArgId, md: &MemoryDesc) -> PrimResult<&mut [u8]> {
        let bytes = self.output(id)?;
        let need = check_len(id, bytes.len(), md)?;
        Ok(&mut bytes[..need])
    }
}

fn check_len(id: ArgId, len: usize, md: &MemoryDesc) -> PrimResult<usize> {
    let need = md.size_bytes();
    if len < need {
        return Err(PrimError::runtime(format!(
            "argument {id:?}: buffer holds {len} bytes, descriptor spans {need}"
        )));
    }
    Ok(need)
}

/// Read-only buffer reinterpreted by data type.
#[derive(Debug, Clone, Copy)]
pub(crate) enum TypedView<'a> {
    F32(&'a [f32]),
    S32(&'a [i32]),
    S8(&'a [i8]),
    U8(&'a [u8]),
}

impl<'a> TypedView<'a> {
    pub(crate) fn new(bytes: &'a [u8], dt: DataType) -> PrimResult<Self> {
        Ok(match dt {
            DataType::F32 => Self::F32(bytemuck::try_cast_slice(bytes)?),
            DataType::S32 => Self::S32(bytemuck::try_cast_slice(bytes)?),
            DataType::S8 => Self::S8(bytemuck::try_cast_slice(bytes)?),
            DataType::U8 => Self::U8(bytes),
            DataType::Undef => return Err(PrimError::runtime("undefined data type")),
        })
    }

    /// Element `i` widened to `f64`; exact for every supported type.
    #[inline]
    pub(crate) fn get(&self, i: usize) -> f64 {
        match self {
            Self::F32(s) => f64::from(s[i]),
            Self::S32(s) => f64::from(s[i]),
            Self::S8(s) => f64::from(s[i]),
            Self::U8(s) => f64::from(s[i]),
        }
    }
}

/// Writable buffer reinterpreted by data type.
#[derive(Debug)]
pub(crate) enum TypedViewMut<'a> {
    F32(&'a mut [f32]),
    S32(&'a mut [i32]),
    S8(&'a mut [i8]),
    U8(&'a mut [u8]),
}

impl<'a> TypedViewMut<'a> {
    pub(crate) fn new(bytes: &'a mut [u8], dt: DataType) -> PrimResult<Self> {
        Ok(match dt {
            DataType::F32 => Self::F32(bytemuck::try_cast_slice_mut(bytes)?),
            DataType::S32 => Self::S32(bytemuck::try_cast_slice_mut(bytes)?),
            DataType::S8 => Self::S8(bytemuck::try_cast_slice_mut(bytes)?),
            DataType::U8 => Self::U8(bytes),
            DataType::Undef => return Err(PrimError::runtime("undefined data type")),
        })
    }

    /// Store `v`; integer destinations round half to even and saturate.
    #[inline]
    pub(crate) fn store(&mut self, i: usize, v: f64) {
        match self {
            Self::F32(d) => d[i] = v as f32,
            Self::S32(d) => d[i] = v.round_ties_even() as i32,
            Self::S8(d) => d[i] = v.round_ties_even() as i8,
            Self::U8(d) => d[i] = v.round_ties_even() as u8,
        }
    }
}
