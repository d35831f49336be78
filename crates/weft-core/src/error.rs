//! Error types for the weft runtime

use core::fmt;

/// Result type for runtime operations
pub type RuntimeResult<T> = Result<T, RuntimeError>;

/// Errors surfaced by the fiber runtime.
///
/// Per-operation failures are always returned as values; nothing in the
/// runtime aborts a fiber from the outside. Hooked syscalls translate these
/// into `-1` + `errno` at the C boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeError {
    /// Operation invoked on an object in a state that forbids it
    /// (resume a running fiber, register an already-registered event, ...)
    InvalidState(&'static str),

    /// A timeout timer fired before the awaited event
    Timeout,

    /// Operation on a file descriptor that has been closed
    ClosedDescriptor,

    /// Allocation or kernel-object creation failed (stack, epoll, pipe)
    ResourceExhausted(&'static str),

    /// Scheduler/IoManager has not been started
    NotStarted,

    /// Scheduler/IoManager was already started
    AlreadyStarted,

    /// A configuration value failed validation
    InvalidConfig(&'static str),

    /// Raw OS error (errno value)
    Os(i32),
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuntimeError::InvalidState(what) => write!(f, "invalid state: {}", what),
            RuntimeError::Timeout => write!(f, "operation timed out"),
            RuntimeError::ClosedDescriptor => write!(f, "file descriptor is closed"),
            RuntimeError::ResourceExhausted(what) => write!(f, "resource exhausted: {}", what),
            RuntimeError::NotStarted => write!(f, "runtime not started"),
            RuntimeError::AlreadyStarted => write!(f, "runtime already started"),
            RuntimeError::InvalidConfig(what) => write!(f, "invalid configuration: {}", what),
            RuntimeError::Os(errno) => write!(f, "os error: errno {}", errno),
        }
    }
}

impl std::error::Error for RuntimeError {}

impl RuntimeError {
    /// Capture `errno` as a runtime error.
    pub fn last_os_error() -> Self {
        RuntimeError::Os(std::io::Error::last_os_error().raw_os_error().unwrap_or(0))
    }

    /// The errno a hooked syscall should report for this error, if any.
    pub fn as_errno(&self) -> Option<i32> {
        match self {
            RuntimeError::Timeout => Some(libc_etimedout()),
            RuntimeError::ClosedDescriptor => Some(libc_ebadf()),
            RuntimeError::Os(e) => Some(*e),
            _ => None,
        }
    }
}

// Keep this crate free of the libc dependency; the values are POSIX-stable
// on Linux for both supported architectures.
const fn libc_etimedout() -> i32 {
    110
}

const fn libc_ebadf() -> i32 {
    9
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let e = RuntimeError::InvalidState("resume on RUNNING fiber");
        assert_eq!(format!("{}", e), "invalid state: resume on RUNNING fiber");

        let e = RuntimeError::Timeout;
        assert_eq!(format!("{}", e), "operation timed out");
    }

    #[test]
    fn test_as_errno() {
        assert_eq!(RuntimeError::Timeout.as_errno(), Some(110));
        assert_eq!(RuntimeError::ClosedDescriptor.as_errno(), Some(9));
        assert_eq!(RuntimeError::Os(11).as_errno(), Some(11));
        assert_eq!(RuntimeError::NotStarted.as_errno(), None);
    }
}
