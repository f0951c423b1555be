//! Strided host tensors.
//!
//! A [`TensorMeta`] is a layout: sizes and element strides of some storage.
//! A [`HostTensor`] pairs a layout with a shared byte [`Storage`]; every view
//! derived from a tensor keeps pointing at the same storage, which is what
//! [`HostTensor::is_alias_of`] compares.

use std::sync::Arc;

use parking_lot::RwLock;
use smallvec::{SmallVec, smallvec};
use snafu::ensure;

use fusor_dtype::DType;
use fusor_ir::TensorArg;

use crate::error::*;
use crate::shape::get_contiguous_strides;

/// Sizes or strides, inline for the ranks fusions usually see.
pub type Dims = SmallVec<[i64; 6]>;

// ============================================================================
// LAYOUT
// ============================================================================

/// Sizes and element strides of a tensor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorMeta {
    pub sizes: Dims,
    pub strides: Dims,
    pub dtype: DType,
}

impl TensorMeta {
    pub fn new(sizes: &[i64], strides: &[i64], dtype: DType) -> Result<Self> {
        ensure!(
            sizes.len() == strides.len(),
            RankMismatchSnafu { what: "strides", expected: sizes.len(), actual: strides.len() }
        );
        if let Some(size) = sizes.iter().find(|size| **size < 0) {
            return NegativeSizeSnafu { size: *size }.fail();
        }
        Ok(Self { sizes: sizes.into(), strides: strides.into(), dtype })
    }

    /// Row-major layout of `sizes`.
    pub fn contiguous(sizes: &[i64], dtype: DType) -> Result<Self> {
        let strides = get_contiguous_strides(sizes, &vec![false; sizes.len()])?;
        Self::new(sizes, &strides, dtype)
    }

    pub fn rank(&self) -> usize {
        self.sizes.len()
    }

    pub fn numel(&self) -> i64 {
        self.sizes.iter().product()
    }

    /// Number of storage elements the layout reaches from offset zero.
    pub fn storage_span(&self) -> i64 {
        if self.numel() == 0 {
            return 0;
        }
        1 + self.sizes.iter().zip(&self.strides).map(|(size, stride)| (size - 1) * stride.abs()).sum::<i64>()
    }

    /// `true` when the layout is row-major, ignoring axes of size one.
    pub fn is_contiguous(&self) -> bool {
        let mut expected = 1;
        for (size, stride) in self.sizes.iter().zip(&self.strides).rev() {
            if *size == 1 {
                continue;
            }
            if *stride != expected {
                return false;
            }
            expected *= size;
        }
        true
    }

    /// Axis `i` of the result is axis `dims[i]` of `self`.
    pub fn permute(&self, dims: &[usize]) -> Result<Self> {
        let mut sorted = dims.to_vec();
        sorted.sort_unstable();
        ensure!(
            sorted.iter().copied().eq(0..self.rank()),
            InvalidPermutationSnafu { dims: dims.to_vec(), rank: self.rank() }
        );
        Ok(Self {
            sizes: dims.iter().map(|d| self.sizes[*d]).collect(),
            strides: dims.iter().map(|d| self.strides[*d]).collect(),
            dtype: self.dtype,
        })
    }

    /// Same elements under the sizes `shape`, one entry of which may be `-1`.
    ///
    /// Splitting an axis is always possible; merging axes only when they are
    /// laid out back to back in storage.
    pub fn view(&self, shape: &[i64]) -> Result<Self> {
        let target = infer_size(shape, self.numel())?;
        match view_strides(&self.sizes, &self.strides, &target) {
            Some(strides) => Ok(Self { sizes: target, strides, dtype: self.dtype }),
            None => NotViewableSnafu {
                sizes: self.sizes.to_vec(),
                strides: self.strides.to_vec(),
                target: target.to_vec(),
            }
            .fail(),
        }
    }

    /// Repeats axes of size one to `sizes` with stride zero; `-1` keeps an axis.
    pub fn expand(&self, sizes: &[i64]) -> Result<Self> {
        ensure!(
            sizes.len() == self.rank(),
            RankMismatchSnafu { what: "expanded sizes", expected: self.rank(), actual: sizes.len() }
        );
        let mut out = self.clone();
        for (axis, target) in sizes.iter().enumerate() {
            let size = self.sizes[axis];
            if *target == -1 || *target == size {
                continue;
            }
            ensure!(size == 1 && *target >= 0, InvalidExpandSnafu { axis, size, target: *target });
            out.sizes[axis] = *target;
            out.strides[axis] = 0;
        }
        Ok(out)
    }

    /// Inserts an axis of size one wherever `is_new` is set.
    pub fn broadcast(&self, is_new: &[bool]) -> Result<Self> {
        let kept = is_new.iter().filter(|new| !**new).count();
        ensure!(kept == self.rank(), RankMismatchSnafu { what: "kept axes", expected: self.rank(), actual: kept });
        let mut out = Self { sizes: Dims::new(), strides: Dims::new(), dtype: self.dtype };
        let mut src = 0;
        for new in is_new {
            if *new {
                // Stride of a fresh unit axis as if the layout had it all along.
                let stride = self.sizes.get(src).zip(self.strides.get(src)).map_or(1, |(size, stride)| size * stride);
                out.sizes.push(1);
                out.strides.push(stride);
            } else {
                out.sizes.push(self.sizes[src]);
                out.strides.push(self.strides[src]);
                src += 1;
            }
        }
        Ok(out)
    }

    /// Removes the unit axes flagged in `is_squeezed`.
    pub fn squeeze(&self, is_squeezed: &[bool]) -> Result<Self> {
        ensure!(
            is_squeezed.len() == self.rank(),
            RankMismatchSnafu { what: "squeeze flags", expected: self.rank(), actual: is_squeezed.len() }
        );
        let mut out = Self { sizes: Dims::new(), strides: Dims::new(), dtype: self.dtype };
        for (axis, squeezed) in is_squeezed.iter().enumerate() {
            let size = self.sizes[axis];
            if *squeezed {
                ensure!(size == 1, InvalidSqueezeSnafu { axis, size });
                continue;
            }
            out.sizes.push(size);
            out.strides.push(self.strides[axis]);
        }
        Ok(out)
    }

    /// Storage offset of every element, in row-major index order.
    pub fn element_offsets(&self) -> Vec<i64> {
        let mut offsets = Vec::with_capacity(self.numel().max(0) as usize);
        if self.sizes.contains(&0) {
            return offsets;
        }
        let mut index: Dims = smallvec![0; self.rank()];
        loop {
            offsets.push(index.iter().zip(&self.strides).map(|(i, stride)| i * stride).sum());
            let mut axis = self.rank();
            loop {
                if axis == 0 {
                    return offsets;
                }
                axis -= 1;
                index[axis] += 1;
                if index[axis] < self.sizes[axis] {
                    break;
                }
                index[axis] = 0;
            }
        }
    }

    fn offset_of(&self, index: &[i64]) -> Result<i64> {
        ensure!(
            index.len() == self.rank() && index.iter().zip(&self.sizes).all(|(i, size)| (0..*size).contains(i)),
            IndexOutOfBoundsSnafu { index: index.to_vec(), sizes: self.sizes.to_vec() }
        );
        Ok(index.iter().zip(&self.strides).map(|(i, stride)| i * stride).sum())
    }
}

/// Resolves a single `-1` in `shape` against `numel`.
fn infer_size(shape: &[i64], numel: i64) -> Result<Dims> {
    let mut inferred = None;
    let mut known: i64 = 1;
    for (axis, size) in shape.iter().enumerate() {
        match *size {
            -1 if inferred.is_none() => inferred = Some(axis),
            size if size >= 0 => known *= size,
            _ => return InvalidShapeSnafu { target: shape.to_vec(), numel }.fail(),
        }
    }
    let mut out: Dims = shape.into();
    match inferred {
        Some(axis) => {
            ensure!(known != 0 && numel % known == 0, InvalidShapeSnafu { target: shape.to_vec(), numel });
            out[axis] = numel / known;
        }
        None => ensure!(known == numel, InvalidShapeSnafu { target: shape.to_vec(), numel }),
    }
    Ok(out)
}

/// Strides that present `sizes`/`strides` as `target` without moving data.
///
/// Axes are consumed from the innermost outwards in chunks that are
/// contiguous in storage; every chunk must be rebuilt exactly by a run of
/// target axes.
fn view_strides(sizes: &[i64], strides: &[i64], target: &[i64]) -> Option<Dims> {
    let Some(mut chunk_base_stride) = strides.last().copied() else {
        return Some(smallvec![1; target.len()]);
    };
    if sizes.contains(&0) {
        if sizes == target {
            return Some(strides.into());
        }
        return get_contiguous_strides(target, &vec![false; target.len()]).ok().map(Dims::from);
    }

    let mut new_strides: Dims = smallvec![0; target.len()];
    let mut view_axis = target.len();
    let (mut tensor_numel, mut view_numel) = (1, 1);
    for axis in (0..sizes.len()).rev() {
        tensor_numel *= sizes[axis];
        let chunk_ends = axis == 0 || (sizes[axis - 1] != 1 && strides[axis - 1] != tensor_numel * chunk_base_stride);
        if !chunk_ends {
            continue;
        }
        while view_axis > 0 && (view_numel < tensor_numel || target[view_axis - 1] == 1) {
            view_axis -= 1;
            new_strides[view_axis] = view_numel * chunk_base_stride;
            view_numel *= target[view_axis];
        }
        if view_numel != tensor_numel {
            return None;
        }
        if axis > 0 {
            chunk_base_stride = strides[axis - 1];
            tensor_numel = 1;
            view_numel = 1;
        }
    }
    (view_axis == 0).then_some(new_strides)
}

// ============================================================================
// HOST TENSOR
// ============================================================================

/// Byte storage shared by a tensor and all of its views.
#[derive(Debug, Default)]
pub struct Storage {
    bytes: RwLock<Vec<u8>>,
}

impl Storage {
    fn zeroed(len: usize) -> Self {
        Self { bytes: RwLock::new(vec![0; len]) }
    }

    pub fn len(&self) -> usize {
        self.bytes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A layout over shared storage, offset in elements.
#[derive(Debug, Clone)]
pub struct HostTensor {
    storage: Arc<Storage>,
    offset: i64,
    meta: TensorMeta,
}

impl HostTensor {
    /// Zeroed storage large enough for the strided layout.
    pub fn empty_strided(sizes: &[i64], strides: &[i64], dtype: DType) -> Result<Self> {
        Ok(Self::from_meta(TensorMeta::new(sizes, strides, dtype)?))
    }

    pub fn zeros(sizes: &[i64], dtype: DType) -> Result<Self> {
        Ok(Self::from_meta(TensorMeta::contiguous(sizes, dtype)?))
    }

    pub fn from_meta(meta: TensorMeta) -> Self {
        let len = meta.storage_span() as usize * meta.dtype.bytes();
        Self { storage: Arc::new(Storage::zeroed(len)), offset: 0, meta }
    }

    pub fn meta(&self) -> &TensorMeta {
        &self.meta
    }

    pub fn sizes(&self) -> &[i64] {
        &self.meta.sizes
    }

    pub fn strides(&self) -> &[i64] {
        &self.meta.strides
    }

    pub fn dtype(&self) -> DType {
        self.meta.dtype
    }

    pub fn rank(&self) -> usize {
        self.meta.rank()
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }

    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    /// Host address of the first element.
    pub fn data_ptr(&self) -> usize {
        let base = self.storage.bytes.read().as_ptr() as usize;
        base + self.offset as usize * self.dtype().bytes()
    }

    /// `true` when both tensors read the same storage.
    pub fn is_alias_of(&self, other: &HostTensor) -> bool {
        Arc::ptr_eq(&self.storage, &other.storage)
    }

    /// Argument description consumed by the scheduler and evaluator.
    pub fn to_arg(&self) -> TensorArg {
        TensorArg {
            sizes: self.meta.sizes.to_vec(),
            strides: self.meta.strides.to_vec(),
            dtype: self.dtype(),
            data_ptr: self.data_ptr(),
        }
    }

    /// Same storage seen through `meta`.
    pub fn restride(&self, meta: TensorMeta) -> Self {
        Self { storage: Arc::clone(&self.storage), offset: self.offset, meta }
    }

    pub fn view(&self, shape: &[i64]) -> Result<Self> {
        Ok(self.restride(self.meta.view(shape)?))
    }

    pub fn permute(&self, dims: &[usize]) -> Result<Self> {
        Ok(self.restride(self.meta.permute(dims)?))
    }

    pub fn expand(&self, sizes: &[i64]) -> Result<Self> {
        Ok(self.restride(self.meta.expand(sizes)?))
    }

    pub fn broadcast(&self, is_new: &[bool]) -> Result<Self> {
        Ok(self.restride(self.meta.broadcast(is_new)?))
    }

    pub fn squeeze(&self, is_squeezed: &[bool]) -> Result<Self> {
        Ok(self.restride(self.meta.squeeze(is_squeezed)?))
    }

    /// Writes `element` to every element of the tensor.
    pub fn fill_bytes(&self, element: &[u8]) -> Result<()> {
        let width = self.dtype().bytes();
        ensure!(
            element.len() == width,
            RankMismatchSnafu { what: "element bytes", expected: width, actual: element.len() }
        );
        let mut bytes = self.storage.bytes.write();
        for offset in self.meta.element_offsets() {
            let start = (self.offset + offset) as usize * width;
            bytes[start..start + width].copy_from_slice(element);
        }
        Ok(())
    }

    pub fn element_bytes(&self, index: &[i64]) -> Result<Vec<u8>> {
        let width = self.dtype().bytes();
        let start = (self.offset + self.meta.offset_of(index)?) as usize * width;
        Ok(self.storage.bytes.read()[start..start + width].to_vec())
    }

    pub fn write_element_bytes(&self, index: &[i64], element: &[u8]) -> Result<()> {
        let width = self.dtype().bytes();
        ensure!(
            element.len() == width,
            RankMismatchSnafu { what: "element bytes", expected: width, actual: element.len() }
        );
        let start = (self.offset + self.meta.offset_of(index)?) as usize * width;
        self.storage.bytes.write()[start..start + width].copy_from_slice(element);
        Ok(())
    }
}
