//! Numeric constants shared across the engine

/// Fixed-point scale factors
pub mod fixed_point {
    /// Canonical scale: 8 implied decimal places
    pub const SCALE_8: i64 = 100_000_000;
}

/// Time conversion factors
pub mod time {
    /// Nanoseconds per millisecond
    pub const NANOS_PER_MILLI: u64 = 1_000_000;
    /// Nanoseconds per second
    pub const NANOS_PER_SEC: u64 = 1_000_000_000;
    /// Milliseconds per day
    pub const MILLIS_PER_DAY: u64 = 86_400_000;
}

/// Memory layout constants
pub mod memory {
    /// Cache line size on the target platforms
    pub const CACHE_LINE_SIZE: usize = 64;
}
