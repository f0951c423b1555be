//! Global buffer descriptions of fusion outputs.

use fusor_dtype::{DType, IndexType};
use fusor_ir::{ExpressionEvaluator, Fusion, TensorArg, TvRef};

use crate::error::*;
use crate::shape::infer_shape_of_output;
use crate::tensor::TensorMeta;

/// Layout and element type of a global buffer the kernel writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobalBufferInfo {
    pub tv: TvRef,
    pub meta: TensorMeta,
}

impl GlobalBufferInfo {
    pub fn sizes(&self) -> &[i64] {
        &self.meta.sizes
    }

    pub fn strides(&self) -> &[i64] {
        &self.meta.strides
    }

    pub fn dtype(&self) -> DType {
        self.meta.dtype
    }
}

/// `dtype` with [`DType::Index`] replaced by the integer of `index_type`.
pub fn resolve_index_dtype(dtype: DType, index_type: IndexType) -> DType {
    match (dtype, index_type) {
        (DType::Index, IndexType::Int32) => DType::Int32,
        (DType::Index, IndexType::Int64) => DType::Int64,
        (dtype, _) => dtype,
    }
}

/// Layout of every tensor in `outputs`, index-typed outputs resolved to
/// `index_type`.
pub fn get_buffer_infos(
    fusion: &Fusion,
    evaluator: &ExpressionEvaluator,
    index_type: IndexType,
    outputs: &[TvRef],
) -> Result<Vec<GlobalBufferInfo>> {
    outputs
        .iter()
        .map(|tv| {
            let mut meta = infer_shape_of_output(fusion, *tv, evaluator)?;
            meta.dtype = resolve_index_dtype(meta.dtype, index_type);
            Ok(GlobalBufferInfo { tv: *tv, meta })
        })
        .collect()
}

/// 32-bit indexing unless some argument reaches past `i32::MAX` elements.
pub fn smallest_index_type_of_arguments(args: &[TensorArg]) -> IndexType {
    let fits = args.iter().all(|arg| {
        if arg.sizes.contains(&0) {
            return true;
        }
        let last = arg.sizes.iter().zip(&arg.strides).map(|(size, stride)| (size - 1) * stride.abs()).sum::<i64>();
        last < i32::MAX as i64
    });
    if fits { IndexType::Int32 } else { IndexType::Int64 }
}

/// Layouts the outputs of `fusion` will have for `args`, without allocating.
#[tracing::instrument(skip_all, fields(outputs = fusion.outputs().len()))]
pub fn infer_output_sizes(fusion: &Fusion, args: &[TensorArg]) -> Result<Vec<TensorMeta>> {
    let mut evaluator = ExpressionEvaluator::new();
    evaluator.bind_inputs(fusion, args)?;
    let index_type = smallest_index_type_of_arguments(args);
    let infos = get_buffer_infos(fusion, &evaluator, index_type, fusion.outputs())?;
    Ok(infos.into_iter().map(|info| info.meta).collect())
}
