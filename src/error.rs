use std::fmt;

/// Result alias used across the collector and handle APIs.
pub type GcResult<T> = Result<T, GcError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GcError {
    /// The object or its control block could not be allocated.
    AllocationFailed { type_name: &'static str, size: usize },
    /// Allocation would exceed the configured heap ceiling, even after a full collection.
    HeapLimitExceeded { requested: usize, live: usize, limit: usize },
    /// Checked access through a null handle.
    NullHandle,
    /// Checked access through a reference whose object is already destroyed.
    Expired,
    InvalidGeneration { requested: usize, max: usize },
    InvalidMemoryPressure,
    /// The tracing backend failed to start. Fatal for the owning collector.
    BackendInit { backend: &'static str, reason: String },
    /// The tracing backend failed during a collection pass.
    Backend { backend: &'static str, reason: String },
    Config { reason: String },
}

impl fmt::Display for GcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AllocationFailed { type_name, size } => {
                write!(f, "Allocation of {} ({} bytes) failed", type_name, size)
            }
            Self::HeapLimitExceeded { requested, live, limit } => {
                write!(
                    f,
                    "Heap limit exceeded: {} bytes requested with {} live, limit is {}",
                    requested, live, limit
                )
            }
            Self::NullHandle => write!(f, "Dereference of a null handle"),
            Self::Expired => write!(f, "Referenced object has already been destroyed"),
            Self::InvalidGeneration { requested, max } => {
                write!(f, "Invalid generation {}: maximum is {}", requested, max)
            }
            Self::InvalidMemoryPressure => {
                write!(f, "Memory pressure adjustment must be greater than zero")
            }
            Self::BackendInit { backend, reason } => {
                write!(f, "Tracing backend '{}' failed to initialize: {}", backend, reason)
            }
            Self::Backend { backend, reason } => {
                write!(f, "Tracing backend '{}' failed: {}", backend, reason)
            }
            Self::Config { reason } => write!(f, "Invalid collector configuration: {}", reason),
        }
    }
}

impl std::error::Error for GcError {}

impl GcError {
    pub fn backend(backend: &'static str, reason: impl Into<String>) -> Self {
        Self::Backend { backend, reason: reason.into() }
    }

    pub fn config(reason: impl Into<String>) -> Self {
        Self::Config { reason: reason.into() }
    }

    /// Whether the error leaves the collector unusable.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::BackendInit { .. })
    }
}

impl From<toml::de::Error> for GcError {
    fn from(err: toml::de::Error) -> Self {
        Self::config(err.to_string())
    }
}

impl From<std::io::Error> for GcError {
    fn from(err: std::io::Error) -> Self {
        Self::config(err.to_string())
    }
}
