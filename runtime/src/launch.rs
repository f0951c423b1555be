//! Launch-time checks of what a compiled kernel assumed about its arguments
//! and device.

use snafu::ensure;

use crate::error::*;
use crate::tensor::HostTensor;

/// Dynamic shared memory must fit the per-block opt-in limit.
pub fn validate_shared_memory(requested: i64, available: i64) -> Result<()> {
    ensure!(requested <= available, SharedMemoryExceededSnafu { requested, available });
    Ok(())
}

/// Asynchronous global-to-shared copies need compute capability 8.0 or newer.
pub fn validate_cp_async(compute_capability: (u32, u32)) -> Result<()> {
    let (major, minor) = compute_capability;
    ensure!(major >= 8, CpAsyncUnsupportedSnafu { major, minor });
    Ok(())
}

/// A tensor accessed `vector_bytes` at a time must start on a vector boundary,
/// be contiguous in its innermost dimension and keep every other stride a
/// whole number of vectors.
pub fn validate_vectorized_access(name: &str, tensor: &HostTensor, vector_bytes: usize) -> Result<()> {
    if vector_bytes <= tensor.dtype().bytes() || tensor.meta().numel() == 0 {
        return Ok(());
    }
    let element = tensor.dtype().bytes() as i64;
    let vector = vector_bytes as i64;
    let misaligned = |reason: String| MisalignedVectorAccessSnafu { tensor: name, vector_bytes, reason }.fail();

    if tensor.data_ptr() % vector_bytes != 0 {
        return misaligned(format!("address {:#x} is not aligned", tensor.data_ptr()));
    }
    let addressed: Vec<(i64, i64)> = tensor
        .sizes()
        .iter()
        .zip(tensor.strides())
        .map(|(size, stride)| (*size, *stride))
        .filter(|(size, stride)| *size > 1 && *stride != 0)
        .collect();
    let Some(((inner_size, inner_stride), outer)) = addressed.split_last() else {
        return Ok(());
    };
    if *inner_stride != 1 {
        return misaligned(format!("innermost stride is {inner_stride}"));
    }
    if (inner_size * element) % vector != 0 {
        return misaligned(format!("innermost extent {inner_size} is not a whole number of vectors"));
    }
    if let Some((_, stride)) = outer.iter().find(|(_, stride)| (stride * element) % vector != 0) {
        return misaligned(format!("stride {stride} is not a whole number of vectors"));
    }
    Ok(())
}
