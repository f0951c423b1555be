//! Property tests for allocation placement and sizing.

use proptest::prelude::*;

use fusor_dtype::DType;
use fusor_ir::{Dim, Fusion, MemoryType, UnaryOp};

use crate::context::LoweringContext;
use crate::kir::{self, KirKind};
use crate::pass::allocation_sizes;
use crate::test::helpers::{const_extents, find_allocation, fixed_chain, lower_fusion};
use crate::utils::{AllocationPosition, flatten_scoped_exprs};

fn arb_extent() -> impl Strategy<Value = i64> {
    1i64..=64
}

fn arb_memory_type() -> impl Strategy<Value = MemoryType> {
    prop_oneof![Just(MemoryType::Local), Just(MemoryType::Shared), Just(MemoryType::Global)]
}

// ============================================================================
// Determinism
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Lowering the same fusion twice produces the same tree.
    #[test]
    fn lowering_is_deterministic(
        a in arb_extent(),
        b in arb_extent(),
        memory_type in arb_memory_type(),
        compute_at in 0usize..=2,
    ) {
        let build = || {
            let (mut fusion, [_, tv1, _]) = fixed_chain(&[a, b]);
            fusion.set_memory_type(tv1, memory_type);
            fusion.set_compute_at(tv1, compute_at).unwrap();
            fusion
        };
        let first = kir::to_string(&lower_fusion(build()).exprs);
        let second = kir::to_string(&lower_fusion(build()).exprs);
        prop_assert_eq!(first, second);
    }
}

// ============================================================================
// Sizing
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    /// Global buffers hold the whole tensor wherever they are allocated.
    #[test]
    fn global_size_ignores_position(a in arb_extent(), b in arb_extent(), pos in 0usize..=2) {
        let (mut fusion, [_, tv1, _]) = fixed_chain(&[a, b]);
        fusion.set_memory_type(tv1, MemoryType::Global);
        let ctx = LoweringContext::new(fusion);
        let sizes = allocation_sizes(&ctx, tv1, AllocationPosition::new(pos)).unwrap();
        prop_assert_eq!(const_extents(&sizes.extents), vec![a, b]);
    }

    /// A circular buffer holds one stage per depth level.
    #[test]
    fn circular_buffer_multiplies_stage(a in arb_extent(), b in arb_extent(), depth in 2usize..=4) {
        let (mut fusion, [_, tv1, _]) = fixed_chain(&[a, b]);
        fusion.set_compute_at(tv1, 1).unwrap();
        fusion.circular_buffer(tv1, depth);

        let kernel = lower_fusion(fusion);
        let alloc = find_allocation(&kernel.exprs, tv1).unwrap();
        prop_assert_eq!(alloc.size().as_int(), Some(b * depth as i64));
        prop_assert_eq!(kernel.ctx.circular_buffer_info.original_alloc_size(tv1).and_then(|v| v.as_int()), Some(b));
    }

    #[test]
    fn allocation_keeps_tensor_dtype(a in arb_extent(), dtype in DType::tensor_generator()) {
        let mut fusion = Fusion::new();
        let tv0 = fusion.add_input(dtype, &[Dim::Fixed(a)]);
        let tv1 = fusion.unary(UnaryOp::Neg, tv0);
        let tv2 = fusion.unary(UnaryOp::Neg, tv1);
        fusion.add_output(tv2);

        let kernel = lower_fusion(fusion);
        let alloc = find_allocation(&kernel.exprs, tv1).unwrap();
        prop_assert_eq!(alloc.dtype, dtype);
        prop_assert_eq!(alloc.size().as_int(), Some(a));
    }
}

// ============================================================================
// Ordering
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// A reduction buffer is allocated, then initialized, then written.
    #[test]
    fn reduction_alloc_init_use_order(a in arb_extent(), b in arb_extent(), axis in 0usize..=1) {
        let mut fusion = Fusion::new();
        let tv0 = fusion.add_input(DType::Float32, &[Dim::Fixed(a), Dim::Fixed(b)]);
        let tv1 = fusion.sum(tv0, &[axis]).unwrap();
        let tv2 = fusion.unary(UnaryOp::Neg, tv1);
        fusion.add_output(tv2);
        let reduction = fusion.exprs()[0];

        let kernel = lower_fusion(fusion);
        let flat = flatten_scoped_exprs(&kernel.exprs);
        let alloc = flat.iter().position(|e| matches!(&e.kind, KirKind::Allocate(al) if al.buffer == tv1));
        let init = flat.iter().position(|e| matches!(e.kind, KirKind::InitSet { out, .. } if out == tv1));
        let write = flat.iter().position(|e| e.tensor_op() == Some(reduction));

        prop_assert!(alloc.is_some() && init.is_some() && write.is_some());
        prop_assert!(alloc < init && init < write);
    }
}
