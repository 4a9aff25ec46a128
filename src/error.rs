//! Error types for the reconstruction runtime.

/// Result type for reconstruction operations.
pub type Result<T> = std::result::Result<T, ReconError>;

/// Failures reported by the emulated accelerator.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeviceError {
    /// Device index outside the available range.
    #[error("invalid device index {index} (device count {count})")]
    InvalidDevice { index: usize, count: usize },

    /// A context is already active on another device.
    #[error("device context already active on device {active}")]
    SetOnActiveProcess { active: usize },

    /// Allocation exceeds the remaining device memory.
    #[error("out of device memory: requested {requested} bytes, {available} available")]
    OutOfMemory { requested: usize, available: usize },

    /// Handle does not refer to a live allocation.
    #[error("invalid device buffer handle {0}")]
    InvalidHandle(u64),

    /// Source and destination extents disagree.
    #[error("extent mismatch: expected {expected:?}, got {actual:?}")]
    ExtentMismatch {
        expected: (usize, usize),
        actual: (usize, usize),
    },

    /// Host memory does not cover the requested pitched region.
    #[error("invalid host layout: {0}")]
    HostLayout(String),
}

/// Failures reported by the algorithm runtime.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ReconError {
    /// Device layer failure.
    #[error(transparent)]
    Device(#[from] DeviceError),

    /// Geometry has not been configured yet.
    #[error("geometry not configured")]
    NotConfigured,

    /// Volume or sinogram buffers are not bound.
    #[error("volume and sinogram buffers are not bound")]
    BuffersNotBound,

    /// Dimension values are unusable.
    #[error("invalid dimensions: {0}")]
    InvalidDimensions(String),

    /// Geometry arrays do not match the dimensions.
    #[error("invalid geometry: {0}")]
    InvalidGeometry(String),

    /// A host or device array has the wrong logical shape.
    #[error("shape mismatch for {what}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        what: &'static str,
        expected: (usize, usize),
        actual: (usize, usize),
    },

    /// Mask is enabled but its host data was not supplied.
    #[error("{0} mask enabled but no host data supplied")]
    MissingMask(&'static str),

    /// Mask is enabled but no mask buffer is bound.
    #[error("{0} mask enabled but no mask buffer is bound")]
    MaskNotBound(&'static str),

    /// Configuration file content is invalid.
    #[error("invalid configuration: {0}")]
    Config(String),
}
