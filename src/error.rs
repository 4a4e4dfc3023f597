//! Error types for the fluid simulation.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum FluidError {
    /// The device cannot run the simulation at all (no adapter, no compute or
    /// storage support in fragment shaders).
    #[error("Unsupported device: {0}")]
    Unsupported(String),

    /// A field could not be allocated with the requested shape.
    #[error("Field allocation failed: {0}")]
    Allocation(String),

    #[error("Unknown field handle {0}")]
    UnknownField(u64),

    /// A pass was asked to read from the field it writes to.
    #[error("Pass '{pass}' reads and writes field {field}")]
    AliasedPass { pass: &'static str, field: u64 },

    #[error("Simulation has no allocated fields")]
    NotRunning,

    #[error("Surface error: {0}")]
    Surface(String),

    #[error("Device out of memory")]
    OutOfMemory,

    #[error("Read-back failed: {0}")]
    ReadBack(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),
}

pub type FluidResult<T> = Result<T, FluidError>;
