//! Element types for fusor tensors and scalars.
//!
//! Every tensor in a fusion carries one [`DType`]. The only dtype whose width
//! is not fixed is [`DType::Index`], which follows the kernel's [`IndexType`]
//! chosen at scheduling time.

#[cfg(feature = "proptest")]
pub mod proptest_gen;

#[cfg(test)]
pub mod test;

/// Element data types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[derive(strum::EnumCount, strum::EnumIter, strum::VariantArray, strum::AsRefStr, strum::Display)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum DType {
    Bool,

    Int8,
    Int16,
    Int32,
    Int64,
    UInt8,
    UInt16,
    UInt32,
    UInt64,

    Float16,
    BFloat16,
    Float32,
    Float64,

    ComplexFloat32,
    ComplexFloat64,

    /// Kernel index type; its width is decided by [`IndexType`].
    Index,

    /// Shared-memory address of an mbarrier or token slot.
    SMemAddress,
}

/// Width of [`DType::Index`] inside a generated kernel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[derive(strum::AsRefStr, strum::Display)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum IndexType {
    Int32,
    #[default]
    Int64,
}

impl IndexType {
    pub const fn bytes(&self) -> usize {
        match self {
            Self::Int32 => 4,
            Self::Int64 => 8,
        }
    }
}

impl DType {
    /// Element size in bytes, with `Index` sized by `index_type`.
    pub const fn size_in_bytes(&self, index_type: IndexType) -> usize {
        match self {
            Self::Bool | Self::Int8 | Self::UInt8 => 1,
            Self::Int16 | Self::UInt16 | Self::Float16 | Self::BFloat16 => 2,
            Self::Int32 | Self::UInt32 | Self::Float32 | Self::SMemAddress => 4,
            Self::Int64 | Self::UInt64 | Self::Float64 | Self::ComplexFloat32 => 8,
            Self::ComplexFloat64 => 16,
            Self::Index => index_type.bytes(),
        }
    }

    /// Element size in bytes assuming a 64-bit index.
    pub const fn bytes(&self) -> usize {
        self.size_in_bytes(IndexType::Int64)
    }

    pub const fn is_bool(&self) -> bool {
        matches!(self, Self::Bool)
    }

    pub const fn is_signed(&self) -> bool {
        matches!(self, Self::Int8 | Self::Int16 | Self::Int32 | Self::Int64)
    }

    pub const fn is_unsigned(&self) -> bool {
        matches!(self, Self::UInt8 | Self::UInt16 | Self::UInt32 | Self::UInt64 | Self::SMemAddress)
    }

    pub const fn is_int(&self) -> bool {
        self.is_signed() || self.is_unsigned() || matches!(self, Self::Index)
    }

    pub const fn is_float(&self) -> bool {
        matches!(self, Self::Float16 | Self::BFloat16 | Self::Float32 | Self::Float64)
    }

    pub const fn is_complex(&self) -> bool {
        matches!(self, Self::ComplexFloat32 | Self::ComplexFloat64)
    }
}
