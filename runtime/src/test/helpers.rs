//! Fusion builders and bindings shared by the runtime tests.

use fusor_dtype::DType;
use fusor_ir::{Dim, ExpressionEvaluator, Fusion, TensorArg, TvRef, UnaryOp};

use crate::tensor::HostTensor;

/// `out = neg(in)` over a 2-D symbolic input.
pub fn neg_2d() -> (Fusion, [TvRef; 2]) {
    let mut fusion = Fusion::new();
    let tv0 = fusion.add_input(DType::Float32, &[Dim::Symbolic, Dim::Symbolic]);
    let tv1 = fusion.unary(UnaryOp::Neg, tv0);
    fusion.add_output(tv1);
    (fusion, [tv0, tv1])
}

/// Evaluator with contiguous float inputs of `sizes` bound.
pub fn bound_evaluator(fusion: &Fusion, sizes: &[&[i64]]) -> ExpressionEvaluator {
    let args: Vec<TensorArg> = sizes.iter().map(|s| TensorArg::contiguous(s, DType::Float32)).collect();
    let mut evaluator = ExpressionEvaluator::new();
    evaluator.bind_inputs(fusion, &args).unwrap();
    evaluator
}

/// Zeroed contiguous float inputs of `sizes`.
pub fn host_inputs(sizes: &[&[i64]]) -> Vec<HostTensor> {
    sizes.iter().map(|s| HostTensor::zeros(s, DType::Float32).unwrap()).collect()
}

pub fn f32_at(tensor: &HostTensor, index: &[i64]) -> f32 {
    let bytes = tensor.element_bytes(index).unwrap();
    f32::from_le_bytes(bytes.try_into().unwrap())
}
