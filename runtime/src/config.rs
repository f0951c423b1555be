//! Allocation options.

use bon::bon;

/// How freshly allocated output buffers are initialized.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllocationOptions {
    /// Fill new outputs with a NaN-like sentinel so reads of unwritten
    /// elements stand out.
    pub fill_allocation_with_nan: bool,
}

#[bon]
impl AllocationOptions {
    #[builder]
    pub fn builder(#[builder(default = false)] fill_allocation_with_nan: bool) -> Self {
        Self { fill_allocation_with_nan }
    }

    /// Create allocation options from environment variables.
    ///
    /// # Environment Variables
    ///
    /// * `FUSOR_FILL_ALLOCATION_WITH_NAN` - `1` or `true` enables the sentinel fill (default: off)
    pub fn from_env() -> Self {
        let fill_allocation_with_nan = std::env::var("FUSOR_FILL_ALLOCATION_WITH_NAN")
            .map(|value| matches!(value.trim(), "1" | "true"))
            .unwrap_or(false);
        Self { fill_allocation_with_nan }
    }
}
