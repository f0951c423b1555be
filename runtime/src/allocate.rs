//! Output allocation.
//!
//! Each output is produced according to its [`AllocationType`]: a fresh
//! buffer, the buffer of the input it updates in place, or a host-side
//! evaluation that yields a view of tensors already bound. Fresh buffers are
//! created first so that evaluated outputs can view them.

use std::collections::HashMap;

use snafu::{ResultExt, ensure};
use tracing::{debug, trace};

use fusor_dtype::{DType, IndexType};
use fusor_ir::{AliasInfo, AllocationType, ExpressionEvaluator, Fusion, OpKind, TensorArg, TvRef};

use crate::buffer::{GlobalBufferInfo, get_buffer_infos};
use crate::config::AllocationOptions;
use crate::error::*;
use crate::tensor::HostTensor;

// ============================================================================
// NAN FILL
// ============================================================================

/// Sentinel element for `dtype`: NaN for floating and complex types, the
/// largest value for integers and `true` for booleans.
fn nan_pattern(dtype: DType) -> Result<Vec<u8>> {
    let bytes = match dtype {
        DType::Bool => vec![1],
        DType::UInt8 => vec![u8::MAX],
        DType::Int8 => i8::MAX.to_le_bytes().to_vec(),
        DType::Int16 => i16::MAX.to_le_bytes().to_vec(),
        DType::UInt16 => u16::MAX.to_le_bytes().to_vec(),
        DType::Int32 => i32::MAX.to_le_bytes().to_vec(),
        DType::UInt32 => u32::MAX.to_le_bytes().to_vec(),
        DType::Int64 => i64::MAX.to_le_bytes().to_vec(),
        DType::UInt64 => u64::MAX.to_le_bytes().to_vec(),
        // Canonical quiet NaNs of the 16-bit formats.
        DType::Float16 => 0x7e00u16.to_le_bytes().to_vec(),
        DType::BFloat16 => 0x7fc0u16.to_le_bytes().to_vec(),
        DType::Float32 => f32::NAN.to_le_bytes().to_vec(),
        DType::Float64 => f64::NAN.to_le_bytes().to_vec(),
        DType::ComplexFloat32 => [f32::NAN.to_le_bytes(), f32::NAN.to_le_bytes()].concat(),
        DType::ComplexFloat64 => [f64::NAN.to_le_bytes(), f64::NAN.to_le_bytes()].concat(),
        DType::Index | DType::SMemAddress => return UnsupportedFillTypeSnafu { dtype }.fail(),
    };
    Ok(bytes)
}

/// Overwrites every element of `tensor` with the NaN-like sentinel of its dtype.
pub fn fill_tensor_with_nan(tensor: &HostTensor) -> Result<()> {
    tensor.fill_bytes(&nan_pattern(tensor.dtype())?)
}

// ============================================================================
// BINDINGS
// ============================================================================

/// Host tensors bound to fusion values, plus the extents the inputs imply.
#[derive(Debug)]
pub struct TensorBindings<'a> {
    fusion: &'a Fusion,
    evaluator: ExpressionEvaluator,
    tensors: HashMap<TvRef, HostTensor>,
}

impl<'a> TensorBindings<'a> {
    /// Binds `inputs` to the fusion inputs, in order.
    pub fn new(fusion: &'a Fusion, inputs: &[HostTensor]) -> Result<Self> {
        let args: Vec<TensorArg> = inputs.iter().map(HostTensor::to_arg).collect();
        let mut evaluator = ExpressionEvaluator::new();
        evaluator.bind_inputs(fusion, &args)?;
        let tensors = fusion.inputs().iter().copied().zip(inputs.iter().cloned()).collect();
        Ok(Self { fusion, evaluator, tensors })
    }

    pub fn evaluator(&self) -> &ExpressionEvaluator {
        &self.evaluator
    }

    pub fn is_known(&self, tv: TvRef) -> bool {
        self.tensors.contains_key(&tv)
    }

    pub fn get(&self, tv: TvRef) -> Option<&HostTensor> {
        self.tensors.get(&tv)
    }

    pub fn bind(&mut self, tv: TvRef, tensor: HostTensor) {
        self.tensors.insert(tv, tensor);
    }

    /// Host value of `tv`: a bound tensor, or a view derived from one
    /// through metadata operations.
    pub fn evaluate(&mut self, tv: TvRef) -> Result<HostTensor> {
        if let Some(tensor) = self.tensors.get(&tv) {
            return Ok(tensor.clone());
        }
        let fusion = self.fusion;
        let Some(def) = fusion.tv(tv).definition() else {
            return UnboundTensorSnafu { tensor: fusion.name(tv) }.fail();
        };
        let expr = fusion.expr(def);
        let not_evaluable = |reason: String| NotHostEvaluableSnafu { tensor: fusion.name(tv), reason }.fail();
        if !expr.kind.is_metadata() {
            return not_evaluable(format!("{} is not a metadata operation", expr.kind.as_ref()));
        }
        let Some(input) = expr.tensor_inputs().next() else {
            return not_evaluable(format!("{} has no tensor operand", expr.kind.as_ref()));
        };

        let source = self.evaluate(input)?;
        let tensor = match &expr.kind {
            OpKind::LoadStore { .. } => source,
            OpKind::Permute { new2old } => source.permute(new2old)?,
            OpKind::Broadcast { is_new } => source.broadcast(is_new)?,
            OpKind::Squeeze { is_squeezed } => source.squeeze(is_squeezed)?,
            OpKind::Expand => source.expand(&self.logical_sizes(tv)?)?,
            OpKind::View => source.view(&self.logical_sizes(tv)?)?,
            other => return not_evaluable(format!("{} has no host view", other.as_ref())),
        };
        trace!(tensor = %tv, sizes = ?tensor.sizes(), "evaluated on host");
        self.tensors.insert(tv, tensor.clone());
        Ok(tensor)
    }

    fn logical_sizes(&self, tv: TvRef) -> Result<Vec<i64>> {
        let fusion = self.fusion;
        fusion
            .no_reductions(fusion.tv(tv).logical_domain())
            .into_iter()
            .map(|id| {
                let extent = fusion.id(id).maybe_expanded_extent();
                self.evaluator
                    .evaluate_int(extent)
                    .context(UnresolvedSizeSnafu { tensor: fusion.name(tv), size: extent.to_string() })
            })
            .collect()
    }
}

// ============================================================================
// OUTPUTS
// ============================================================================

fn allocate_output(
    fusion: &Fusion,
    info: &GlobalBufferInfo,
    alias: &AliasInfo,
    bindings: &mut TensorBindings<'_>,
    options: AllocationOptions,
) -> Result<HostTensor> {
    let out = info.tv;
    // Duplicated outputs and outputs that are inputs.
    if let Some(known) = bindings.get(out) {
        return Ok(known.clone());
    }

    let aliased = match alias.aliased_io {
        Some(io) => {
            ensure!(
                fusion.is_input(io) || fusion.is_output(io),
                AliasNotFusionIoSnafu { output: fusion.name(out), aliased: fusion.name(io) }
            );
            Some((io, bindings.evaluate(io)?))
        }
        None => None,
    };

    match alias.kind {
        AllocationType::New => {
            let tensor = HostTensor::from_meta(info.meta.clone());
            if options.fill_allocation_with_nan {
                fill_tensor_with_nan(&tensor)?;
            }
            Ok(tensor)
        }
        AllocationType::ReuseBuffer => match aliased {
            Some((_, tensor)) => Ok(tensor),
            None => MissingAliasedIoSnafu { output: fusion.name(out) }.fail(),
        },
        AllocationType::Evaluate => {
            let tensor = bindings.evaluate(out)?;
            if let Some((io, aliased)) = aliased {
                ensure!(
                    tensor.is_alias_of(&aliased),
                    NotAnAliasSnafu { output: fusion.name(out), aliased: fusion.name(io) }
                );
                ensure!(
                    tensor.sizes() == info.sizes(),
                    LayoutMismatchSnafu {
                        tensor: fusion.name(out),
                        expected: info.sizes().to_vec(),
                        actual: tensor.sizes().to_vec(),
                    }
                );
            }
            Ok(tensor)
        }
    }
}

/// Produces one tensor per entry of `infos`, which lists the fusion outputs
/// in order.
///
/// Fresh buffers are created before aliases and evaluated outputs; every
/// result is bound so a duplicated output resolves to the same tensor.
#[tracing::instrument(skip_all, fields(outputs = infos.len()))]
pub fn allocate_outputs(
    fusion: &Fusion,
    infos: &[GlobalBufferInfo],
    bindings: &mut TensorBindings<'_>,
    options: AllocationOptions,
) -> Result<Vec<HostTensor>> {
    let mut order: Vec<usize> = (0..infos.len()).collect();
    order.sort_by_key(|index| fusion.output_alias(infos[*index].tv).kind != AllocationType::New);

    let mut tensors: Vec<Option<HostTensor>> = vec![None; infos.len()];
    for index in order {
        let info = &infos[index];
        let alias = fusion.output_alias(info.tv);
        let tensor = allocate_output(fusion, info, &alias, bindings, options)?;
        debug!(tensor = %info.tv, kind = ?alias.kind, sizes = ?tensor.sizes(), "output allocated");
        bindings.bind(info.tv, tensor.clone());
        tensors[index] = Some(tensor);
    }
    Ok(tensors.into_iter().flatten().collect())
}

/// Binds `inputs` and allocates every output of `fusion` with 64-bit indexing.
pub fn alloc_output_space(fusion: &Fusion, inputs: &[HostTensor], options: AllocationOptions) -> Result<Vec<HostTensor>> {
    let mut bindings = TensorBindings::new(fusion, inputs)?;
    let infos = get_buffer_infos(fusion, bindings.evaluator(), IndexType::Int64, fusion.outputs())?;
    allocate_outputs(fusion, &infos, &mut bindings, options)
}
