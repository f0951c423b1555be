//! Execution-time buffer handling for fusor kernels.
//!
//! Turns the allocation decisions of a scheduled and lowered fusion into
//! concrete layouts once argument shapes are known: output sizes and
//! strides, host tensors for every output, and the dynamic shared memory a
//! launch needs.
//!
//! # Module Organization
//!
//! - [`tensor`] - [`TensorMeta`] layouts and [`HostTensor`] views over shared storage
//! - [`shape`] - contiguous strides, intermediate and output layouts
//! - [`buffer`] - [`GlobalBufferInfo`] of fusion outputs and output-size inference
//! - [`allocate`] - output allocation by alias kind, NaN fill, host evaluation of views
//! - [`smem`] - dynamic shared-memory size
//! - [`launch`] - launch-time argument and device checks
//! - [`config`] - [`AllocationOptions`]

pub mod allocate;
pub mod buffer;
pub mod config;
pub mod error;
pub mod launch;
pub mod shape;
pub mod smem;
pub mod tensor;


pub use allocate::{TensorBindings, alloc_output_space, allocate_outputs, fill_tensor_with_nan};
pub use buffer::{GlobalBufferInfo, get_buffer_infos, infer_output_sizes, smallest_index_type_of_arguments};
pub use config::AllocationOptions;
pub use error::{Error, Result};
pub use shape::{get_contiguous_strides, infer_shape_of_intermediate, infer_shape_of_output};
pub use smem::compute_shared_memory;
pub use tensor::{HostTensor, TensorMeta};
