//! Error types shared across the workspace.

use thiserror::Error;

/// Result type used throughout Sluice.
pub type Result<T> = std::result::Result<T, SluiceError>;

/// Errors raised by the event-processing pipeline.
#[derive(Debug, Error)]
pub enum SluiceError {
    /// A buffer was used before it was created or bound.
    #[error("Event buffer '{0}' used before it was created or bound")]
    BufferNotBound(String),

    /// A component was used before its `init` phase completed.
    #[error("'{0}' processed before initialization")]
    NotInitialized(&'static str),

    /// A batch or write exceeded a buffer's fixed capacity.
    #[error("Capacity exceeded: requested {requested} events, capacity is {capacity}")]
    CapacityExceeded {
        /// Events requested.
        requested: usize,
        /// Fixed capacity of the target buffer.
        capacity: usize,
    },

    /// A copy addressed more bytes than the target region holds.
    #[error("Transfer overflow: {required} bytes required, {available} available")]
    TransferOverflow {
        /// Bytes the transfer needs.
        required: usize,
        /// Bytes the region holds.
        available: usize,
    },

    /// Device memory allocation failed.
    #[error("Device allocation of {size} bytes failed")]
    AllocationFailed {
        /// Requested allocation size in bytes.
        size: usize,
    },

    /// Host memory allocation failed.
    #[error("Host allocation of {size} bytes failed")]
    HostAllocationFailed {
        /// Requested allocation size in bytes.
        size: usize,
    },

    /// A host/device transfer failed.
    #[error("Transfer error: {0}")]
    TransferError(String),

    /// A device-side operation failed.
    #[error("Device error: {0}")]
    DeviceError(String),

    /// A device allocation handle did not resolve on the device.
    #[error("Unknown device allocation {0}")]
    UnknownAllocation(u64),

    /// A filter table handle did not resolve on the device.
    #[error("Unknown filter table {0}")]
    UnknownFilterTable(u64),

    /// A buffer-registry index did not resolve in the processor context.
    #[error("Unknown result buffer index {0}")]
    UnknownBufferIndex(usize),

    /// A schema was constructed or queried inconsistently.
    #[error("Invalid schema: {0}")]
    InvalidSchema(String),

    /// The byte-buffer protocol was used before its layout was configured.
    #[error("Byte buffer layout not configured: {0}")]
    LayoutNotConfigured(&'static str),

    /// Invalid configuration value.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Underlying I/O failure (diagnostic sinks).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
