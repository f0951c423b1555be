//! Scheduler configuration types.
//!
//! Device limits and pointwise tuning knobs, each with a bon builder, a
//! [`Default`] matching the hardware the heuristics were tuned on, and an
//! environment-variable fallback.

use bon::bon;

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name).ok().and_then(|s| s.parse().ok()).unwrap_or(default)
}

// ============================================================================
// DEVICE
// ============================================================================

/// Properties of the GPU a fusion is scheduled for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceProperties {
    pub multiprocessor_count: i64,
    pub warp_size: i64,
    pub l2_cache_bytes: i64,
    /// Largest grid extent along y and z.
    pub max_grid_y: i64,
    /// Shared memory a block may request after opting in.
    pub max_shared_memory_per_block_optin: i64,
    pub compute_capability: (u32, u32),
}

impl Default for DeviceProperties {
    fn default() -> Self {
        Self {
            multiprocessor_count: 108,
            warp_size: 32,
            l2_cache_bytes: 40 * 1024 * 1024,
            max_grid_y: 65535,
            max_shared_memory_per_block_optin: 163 * 1024,
            compute_capability: (8, 0),
        }
    }
}

#[bon]
impl DeviceProperties {
    #[builder]
    pub fn builder(
        #[builder(default = 108)] multiprocessor_count: i64,
        #[builder(default = 32)] warp_size: i64,
        #[builder(default = 40 * 1024 * 1024)] l2_cache_bytes: i64,
        #[builder(default = 65535)] max_grid_y: i64,
        #[builder(default = 163 * 1024)] max_shared_memory_per_block_optin: i64,
        #[builder(default = (8, 0))] compute_capability: (u32, u32),
    ) -> Self {
        Self {
            multiprocessor_count,
            warp_size,
            l2_cache_bytes,
            max_grid_y,
            max_shared_memory_per_block_optin,
            compute_capability,
        }
    }

    /// Create device properties from environment variables.
    ///
    /// # Environment Variables
    ///
    /// * `FUSOR_DEVICE_SM_COUNT` - Multiprocessor count (default: 108)
    /// * `FUSOR_DEVICE_WARP_SIZE` - Threads per warp (default: 32)
    /// * `FUSOR_DEVICE_L2_BYTES` - L2 cache size in bytes (default: 40 MiB)
    /// * `FUSOR_DEVICE_MAX_GRID_Y` - Largest grid-y extent (default: 65535)
    /// * `FUSOR_DEVICE_SMEM_OPTIN` - Opt-in shared memory per block in bytes (default: 163 KiB)
    /// * `FUSOR_DEVICE_COMPUTE_CAPABILITY` - `major.minor` (default: 8.0)
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let compute_capability = std::env::var("FUSOR_DEVICE_COMPUTE_CAPABILITY")
            .ok()
            .and_then(|s| {
                let (major, minor) = s.split_once('.')?;
                Some((major.parse().ok()?, minor.parse().ok()?))
            })
            .unwrap_or(defaults.compute_capability);

        Self {
            multiprocessor_count: env_or("FUSOR_DEVICE_SM_COUNT", defaults.multiprocessor_count),
            warp_size: env_or("FUSOR_DEVICE_WARP_SIZE", defaults.warp_size),
            l2_cache_bytes: env_or("FUSOR_DEVICE_L2_BYTES", defaults.l2_cache_bytes),
            max_grid_y: env_or("FUSOR_DEVICE_MAX_GRID_Y", defaults.max_grid_y),
            max_shared_memory_per_block_optin: env_or(
                "FUSOR_DEVICE_SMEM_OPTIN",
                defaults.max_shared_memory_per_block_optin,
            ),
            compute_capability,
        }
    }

    /// `true` for Ampere and newer, which have asynchronous global-to-shared copies.
    pub fn supports_cp_async(&self) -> bool {
        self.compute_capability.0 >= 8
    }
}

// ============================================================================
// POINTWISE
// ============================================================================

/// Tuning knobs of the pointwise heuristic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PointwiseConfig {
    /// Threads per block the heuristic aims for.
    pub threads_per_block: i64,
    /// Widest vectorized access in bytes.
    pub max_vectorize_bytes: i64,
    /// 2-D schedules are considered once `elements * multiple` exceeds one
    /// wave of `threads_per_block`-sized blocks.
    pub min_2d_elements_multiple: i64,
}

impl Default for PointwiseConfig {
    fn default() -> Self {
        Self { threads_per_block: 128, max_vectorize_bytes: 16, min_2d_elements_multiple: 2 }
    }
}

#[bon]
impl PointwiseConfig {
    #[builder]
    pub fn builder(
        #[builder(default = 128)] threads_per_block: i64,
        #[builder(default = 16)] max_vectorize_bytes: i64,
        #[builder(default = 2)] min_2d_elements_multiple: i64,
    ) -> Self {
        Self { threads_per_block, max_vectorize_bytes, min_2d_elements_multiple }
    }

    /// Create configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// * `FUSOR_POINTWISE_THREADS` - Threads per block (default: 128)
    /// * `FUSOR_POINTWISE_MAX_VECTORIZE_BYTES` - Widest access in bytes (default: 16)
    /// * `FUSOR_POINTWISE_2D_MULTIPLE` - Element multiple enabling 2-D schedules (default: 2)
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            threads_per_block: env_or("FUSOR_POINTWISE_THREADS", defaults.threads_per_block),
            max_vectorize_bytes: env_or("FUSOR_POINTWISE_MAX_VECTORIZE_BYTES", defaults.max_vectorize_bytes),
            min_2d_elements_multiple: env_or("FUSOR_POINTWISE_2D_MULTIPLE", defaults.min_2d_elements_multiple),
        }
    }
}
