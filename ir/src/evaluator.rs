//! Resolution of symbolic values against runtime arguments.

use std::collections::HashMap;

use fusor_dtype::DType;
use snafu::ensure;
use tracing::trace;

use crate::error::*;
use crate::fusion::Fusion;
use crate::val::{Scalar, Val, ValKind, ValOp};

/// Host-side description of a tensor argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorArg {
    pub sizes: Vec<i64>,
    pub strides: Vec<i64>,
    pub dtype: DType,
    /// Device address, used to detect aliasing between arguments.
    pub data_ptr: usize,
}

impl TensorArg {
    /// Contiguous tensor of `sizes`.
    pub fn contiguous(sizes: &[i64], dtype: DType) -> Self {
        let mut strides = vec![1; sizes.len()];
        for i in (0..sizes.len().saturating_sub(1)).rev() {
            strides[i] = strides[i + 1] * sizes[i + 1].max(1);
        }
        Self { sizes: sizes.to_vec(), strides, dtype, data_ptr: 0 }
    }

    pub fn rank(&self) -> usize {
        self.sizes.len()
    }
}

/// Binds symbols to integers and evaluates [`Val`] expressions.
#[derive(Debug, Clone, Default)]
pub struct ExpressionEvaluator {
    bindings: HashMap<String, i64>,
}

impl ExpressionEvaluator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `symbol`; rebinding to the same value is accepted.
    pub fn bind(&mut self, symbol: impl Into<String>, value: i64) -> Result<()> {
        let symbol = symbol.into();
        if let Some(existing) = self.bindings.get(&symbol) {
            ensure!(*existing == value, ConflictingBindingSnafu { symbol, existing: *existing, new: value });
            return Ok(());
        }
        trace!(%symbol, value, "bound");
        self.bindings.insert(symbol, value);
        Ok(())
    }

    /// Binds every symbolic input extent of `fusion` from `args`.
    ///
    /// # Arguments
    ///
    /// * `fusion` - Fusion whose inputs are described by `args`
    /// * `args` - One argument per fusion input, in input order
    pub fn bind_inputs(&mut self, fusion: &Fusion, args: &[TensorArg]) -> Result<()> {
        ensure!(
            args.len() == fusion.inputs().len(),
            InputCountSnafu { expected: fusion.inputs().len(), actual: args.len() }
        );
        for (input, arg) in fusion.inputs().iter().zip(args) {
            let logical = fusion.tv(*input).logical_domain();
            ensure!(
                logical.len() == arg.rank(),
                InputRankSnafu { tensor: fusion.name(*input).to_string(), expected: logical.len(), actual: arg.rank() }
            );
            for (id, size) in logical.iter().zip(&arg.sizes) {
                let axis = fusion.id(*id);
                let target = if axis.is_broadcast() { axis.expanded_extent.as_ref() } else { Some(&axis.extent) };
                match target.map(Val::kind) {
                    Some(ValKind::Symbol(name)) => self.bind(name.clone(), *size)?,
                    Some(ValKind::Const(Scalar::Int(fixed))) => {
                        ensure!(
                            fixed == size,
                            ConflictingBindingSnafu { symbol: id.to_string(), existing: *fixed, new: *size }
                        );
                    }
                    _ => {}
                }
            }
        }
        Ok(())
    }

    pub fn evaluate(&self, val: &Val) -> Result<Scalar> {
        match val.kind() {
            ValKind::Const(scalar) => Ok(*scalar),
            ValKind::Symbol(name) => match self.bindings.get(name) {
                Some(value) => Ok(Scalar::Int(*value)),
                None => UnresolvedValueSnafu { value: name.clone() }.fail(),
            },
            ValKind::Binary { op, lhs, rhs } => {
                let (l, r) = (self.evaluate_int(lhs)?, self.evaluate_int(rhs)?);
                if matches!(op, ValOp::Div | ValOp::CeilDiv | ValOp::Mod) && r == 0 {
                    return DivisionByZeroSnafu { value: val.to_string() }.fail();
                }
                match op.apply(l, r) {
                    Some(value) => Ok(Scalar::Int(value)),
                    None => UnresolvedValueSnafu { value: val.to_string() }.fail(),
                }
            }
        }
    }

    pub fn evaluate_int(&self, val: &Val) -> Result<i64> {
        match self.evaluate(val)?.as_int() {
            Some(value) => Ok(value),
            None => UnresolvedValueSnafu { value: val.to_string() }.fail(),
        }
    }
}
