//! Dynamic shared-memory layout.

use snafu::{OptionExt, ResultExt};
use tracing::trace;

use fusor_dtype::IndexType;
use fusor_ir::ExpressionEvaluator;
use fusor_lower::Allocate;

use crate::error::*;

/// Alignment of the first dynamic shared-memory buffer.
pub const SMEM_ALIGNMENT: i64 = 16;

/// Bytes of dynamic shared memory the kernel needs.
///
/// `base_offset` is memory already in use ahead of the buffers; buffers are
/// placed at their evaluated addresses past `base_offset` rounded up to
/// [`SMEM_ALIGNMENT`]. Buffers that alias another allocation take no space.
/// The result is the furthest byte any buffer reaches, or `base_offset`.
pub fn compute_shared_memory(
    evaluator: &ExpressionEvaluator,
    buffers: &[&Allocate],
    index_type: IndexType,
    base_offset: i64,
) -> Result<i64> {
    let mut total = base_offset;
    let aligned_offset = (base_offset + SMEM_ALIGNMENT - 1) & !(SMEM_ALIGNMENT - 1);
    for alloc in buffers.iter().filter(|alloc| alloc.alias.is_none()) {
        let tensor = alloc.buffer.to_string();
        let address = alloc.address.as_ref().context(MissingSmemAddressSnafu { tensor: tensor.clone() })?;
        let address = evaluator.evaluate_int(address).context(UnresolvedSmemValueSnafu {
            tensor: tensor.clone(),
            what: "address",
            value: address.to_string(),
        })?;
        let size = alloc.size();
        let elements = evaluator.evaluate_int(&size).context(UnresolvedSmemValueSnafu {
            tensor: tensor.clone(),
            what: "size",
            value: size.to_string(),
        })?;

        let first_byte = aligned_offset + address;
        let last_byte = first_byte + elements * alloc.dtype.size_in_bytes(index_type) as i64;
        trace!(%tensor, first_byte, last_byte, "shared buffer");
        total = total.max(last_byte);
    }
    Ok(total)
}
