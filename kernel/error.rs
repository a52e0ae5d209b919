//! Unified kernel error type
//!
//! `KernelError` uses `#[repr(i64)]` so the discriminant doubles as the
//! wire value: a syscall reports failure by returning the negated
//! discriminant in the return register. Non-negative results are success.

/// Kernel error kinds
///
/// The syscall dispatcher is the only place that converts these to the
/// negative ABI encoding; everything below it propagates `KernelResult`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i64)]
pub enum KernelError {
    /// Path component or object does not exist
    NotFound = 1,
    /// Operation not supported by this object (e.g. create on devfs)
    NotSupported = 2,
    /// Invalid argument or malformed user pointer
    InvalidArgument = 3,
    /// File descriptor is not open
    NoSuchDescriptor = 4,
    /// Access mode forbids the operation
    AccessDenied = 5,
    /// Frame or heap allocation failed
    OutOfMemory = 6,
    /// On-disk or in-file structure failed validation
    InvalidFormat = 7,
    /// Backing device reported an error
    IoError = 8,
    /// Operation would block and non-blocking behavior was requested
    WouldBlock = 9,
}

impl KernelError {
    /// Return the negated discriminant for a syscall return register
    ///
    /// Example: `KernelError::NotFound.sysret()` returns -1 as u64.
    #[inline]
    pub const fn sysret(self) -> u64 {
        (-(self as i64)) as u64
    }

    /// Positive error value
    #[inline]
    pub const fn code(self) -> i64 {
        self as i64
    }
}

/// Result type alias for kernel operations
pub type KernelResult<T> = Result<T, KernelError>;
