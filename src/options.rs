//! Configuration for ramstore.

/// Default seglet size (128KB). Must be a power of two.
pub const DEFAULT_SEGLET_SIZE: usize = 128 * 1024;

/// Default segment size (8MB).
pub const DEFAULT_SEGMENT_SIZE: usize = 8 * 1024 * 1024;

/// Maximum RPCs in flight during a recovery broadcast.
pub const MAX_CONCURRENT_RPCS: usize = 10;

/// Configuration knobs for the segment store and recovery coordinator.
#[derive(Debug, Clone)]
pub struct Config {
    /// Size of each seglet in bytes. Must be a power of two.
    pub seglet_size: usize,

    /// Number of seglets making up a full segment.
    pub seglets_per_segment: usize,

    /// Total seglets backing the allocator pool.
    pub pool_seglets: usize,

    /// Maximum RPCs in flight per recovery broadcast.
    pub max_concurrent_rpcs: usize,

    /// Maximum recoveries the coordinator drives at once.
    pub max_active_recoveries: usize,
}

impl Config {
    /// Configuration sized for unit tests: tiny seglets, one active
    /// recovery.
    pub fn for_testing() -> Self {
        Self {
            seglet_size: 4096,
            seglets_per_segment: 2,
            pool_seglets: 32,
            max_concurrent_rpcs: MAX_CONCURRENT_RPCS,
            max_active_recoveries: 1,
        }
    }

    /// Capacity of one full segment in bytes.
    pub fn segment_size(&self) -> usize {
        self.seglet_size * self.seglets_per_segment
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            seglet_size: DEFAULT_SEGLET_SIZE,
            seglets_per_segment: DEFAULT_SEGMENT_SIZE / DEFAULT_SEGLET_SIZE,
            pool_seglets: 4 * (DEFAULT_SEGMENT_SIZE / DEFAULT_SEGLET_SIZE),
            max_concurrent_rpcs: MAX_CONCURRENT_RPCS,
            max_active_recoveries: 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_geometry() {
        let config = Config::default();
        assert!(config.seglet_size.is_power_of_two());
        assert_eq!(config.segment_size(), DEFAULT_SEGMENT_SIZE);
    }

    #[test]
    fn test_testing_config() {
        let config = Config::for_testing();
        assert!(config.seglet_size.is_power_of_two());
        assert_eq!(config.segment_size(), 8192);
        assert_eq!(config.max_active_recoveries, 1);
    }
}
