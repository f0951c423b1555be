//! Lowering passes over the kernel IR.

pub mod allocation;
pub mod edits;

pub use allocation::{AllocationInformation, AllocationSizes, allocation_sizes, insert_allocations, plan_allocations};
pub use edits::{Edit, EditList, EditPosition};
