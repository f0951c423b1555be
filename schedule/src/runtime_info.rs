//! Concrete argument information the heuristics are computed against.

use std::collections::HashMap;

use fusor_dtype::IndexType;
use fusor_ir::{ExpressionEvaluator, Fusion, TensorArg, TvRef};
use tracing::trace;

use crate::config::{DeviceProperties, PointwiseConfig};
use crate::error::Result;

/// Widest alignment any access can take advantage of, in bytes.
pub const MAX_ALIGNMENT_BYTES: usize = 16;

/// Largest power of two `<= 16` that divides `address`.
pub fn alignment_of(address: usize) -> usize {
    let mut alignment = MAX_ALIGNMENT_BYTES;
    while alignment > 1 && address % alignment != 0 {
        alignment /= 2;
    }
    alignment
}

/// Byte strides of `arg` that break the contiguous run from the innermost dimension.
///
/// Dimensions of size `<= 1` and broadcast (zero) strides do not take part.
fn discontiguous_byte_strides(arg: &TensorArg, element_size: usize) -> Vec<i64> {
    let mut strides = Vec::new();
    let mut expected = 1;
    for (size, stride) in arg.sizes.iter().zip(&arg.strides).rev() {
        if *size <= 1 || *stride == 0 {
            continue;
        }
        if *stride != expected {
            strides.push(stride * element_size as i64);
            expected = *stride;
        }
        expected *= size;
    }
    strides
}

/// Stride of the innermost dimension that takes part in addressing.
fn innermost_stride(arg: &TensorArg) -> Option<i64> {
    arg.sizes.iter().zip(&arg.strides).rev().find(|(size, stride)| **size > 1 && **stride != 0).map(|(_, stride)| *stride)
}

/// Largest element offset reachable through `arg`, plus one.
fn span(arg: &TensorArg) -> i64 {
    if arg.sizes.contains(&0) {
        return 0;
    }
    1 + arg.sizes.iter().zip(&arg.strides).map(|(size, stride)| (size - 1) * stride.abs()).sum::<i64>()
}

/// Evaluator bound to one set of arguments, plus what the heuristics derive from them.
#[derive(Debug, Clone)]
pub struct SchedulerRuntimeInfo {
    evaluator: ExpressionEvaluator,
    index_type: IndexType,
    input_alignment: HashMap<TvRef, usize>,
    pub device: DeviceProperties,
    pub pointwise: PointwiseConfig,
}

impl SchedulerRuntimeInfo {
    /// Binds `args` to the inputs of `fusion` and picks the narrowest index type.
    pub fn new(fusion: &Fusion, args: &[TensorArg]) -> Result<Self> {
        Self::with_index_type(fusion, args, None)
    }

    /// Like [`new`](Self::new), with `forced_index_type` overriding the choice.
    pub fn with_index_type(fusion: &Fusion, args: &[TensorArg], forced_index_type: Option<IndexType>) -> Result<Self> {
        let mut evaluator = ExpressionEvaluator::new();
        evaluator.bind_inputs(fusion, args)?;

        let mut input_alignment = HashMap::new();
        for (input, arg) in fusion.inputs().iter().zip(args) {
            let element_size = fusion.tv(*input).dtype.size_in_bytes(IndexType::Int64);
            let mut alignment = alignment_of(arg.data_ptr);
            for stride in discontiguous_byte_strides(arg, element_size) {
                alignment = alignment.min(alignment_of(stride.unsigned_abs() as usize));
            }
            // Elements that are not adjacent in memory cannot share a vector access.
            if innermost_stride(arg).is_some_and(|stride| stride != 1) {
                alignment = alignment.min(element_size.max(1));
            }
            trace!(tensor = %input, alignment, "input alignment");
            input_alignment.insert(*input, alignment);
        }

        let index_type = match forced_index_type {
            Some(index_type) => index_type,
            None => Self::smallest_index_type(fusion, args, &evaluator),
        };

        Ok(Self {
            evaluator,
            index_type,
            input_alignment,
            device: DeviceProperties::default(),
            pointwise: PointwiseConfig::default(),
        })
    }

    /// 32-bit indexing unless an input or a resolvable intermediate spans more
    /// than `i32::MAX` elements.
    fn smallest_index_type(fusion: &Fusion, args: &[TensorArg], evaluator: &ExpressionEvaluator) -> IndexType {
        let limit = i32::MAX as i64;
        if args.iter().any(|arg| span(arg) > limit) {
            return IndexType::Int64;
        }
        for tv in fusion.all_tvs() {
            let mut elements: i64 = 1;
            for id in fusion.no_reductions(fusion.tv(tv).logical_domain()) {
                let Ok(extent) = evaluator.evaluate_int(fusion.id(id).maybe_expanded_extent()) else {
                    continue;
                };
                elements = elements.saturating_mul(extent.max(1));
            }
            if elements > limit {
                return IndexType::Int64;
            }
        }
        IndexType::Int32
    }

    pub fn with_device(mut self, device: DeviceProperties) -> Self {
        self.device = device;
        self
    }

    pub fn with_pointwise_config(mut self, pointwise: PointwiseConfig) -> Self {
        self.pointwise = pointwise;
        self
    }

    pub fn evaluator(&self) -> &ExpressionEvaluator {
        &self.evaluator
    }

    pub fn index_type(&self) -> IndexType {
        self.index_type
    }

    /// Byte alignment of `tv`'s buffer; tensors allocated by the fusion are
    /// always maximally aligned.
    pub fn alignment_size(&self, tv: TvRef) -> usize {
        self.input_alignment.get(&tv).copied().unwrap_or(MAX_ALIGNMENT_BYTES)
    }
}
