use strum::VariantArray;
use test_case::test_case;

use crate::{DType, IndexType};

#[test_case(DType::Bool, 1; "bool")]
#[test_case(DType::BFloat16, 2; "bf16")]
#[test_case(DType::Float32, 4; "f32")]
#[test_case(DType::ComplexFloat32, 8; "c64")]
#[test_case(DType::ComplexFloat64, 16; "c128")]
fn test_fixed_width(dtype: DType, bytes: usize) {
    assert_eq!(dtype.size_in_bytes(IndexType::Int32), bytes);
    assert_eq!(dtype.size_in_bytes(IndexType::Int64), bytes);
}

#[test]
fn test_index_follows_index_type() {
    assert_eq!(DType::Index.size_in_bytes(IndexType::Int32), 4);
    assert_eq!(DType::Index.size_in_bytes(IndexType::Int64), 8);
    assert_eq!(DType::Index.bytes(), 8);
}

#[test]
fn test_categories_are_exclusive() {
    for dtype in DType::VARIANTS {
        let categories = [dtype.is_bool(), dtype.is_int(), dtype.is_float(), dtype.is_complex()];
        assert!(categories.iter().filter(|c| **c).count() <= 1, "{dtype} is in more than one category");
    }
}
