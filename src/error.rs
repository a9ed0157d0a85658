// Licensed under the Apache-2.0 license

use core::fmt;

/// Error taxonomy of the crypto engine.
///
/// Every failure is reported synchronously by the call that detected it;
/// there is no background retry. Callers interfacing with an errno-based
/// framework use [`Error::errno`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// A signal arrived while blocked on a ring slot or a completion wait.
    Interrupted,
    /// A cipher-class completion wait exceeded its deadline. Hardware state
    /// for the in-flight descriptor is unspecified.
    TimedOut,
    /// Unsupported key length for the selected algorithm.
    InvalidKeyLength,
    /// Payload length not acceptable for the selected algorithm/mode.
    InvalidDataLength,
    /// A keyed transform was used before a key was installed.
    NoKey,
    /// Operation not valid in the session's current state.
    InvalidState,
    /// The requested operation is not provided by this transform.
    Unsupported,
    /// DMA arena exhausted.
    NoMemory,
    /// The engine reported a failing completion code.
    Hardware(u8),
}

impl Error {
    /// Conventional negative-errno mapping used at the framework boundary.
    #[must_use]
    pub const fn errno(&self) -> i32 {
        match self {
            Error::Interrupted => -4,         // EINTR
            Error::TimedOut => -110,          // ETIMEDOUT
            Error::InvalidKeyLength | Error::InvalidDataLength | Error::InvalidState => -22, // EINVAL
            Error::NoKey => -126,             // ENOKEY
            Error::Unsupported => -95,        // EOPNOTSUPP
            Error::NoMemory => -12,           // ENOMEM
            Error::Hardware(_) => -5,         // EIO
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Interrupted => write!(f, "operation interrupted by signal"),
            Error::TimedOut => write!(f, "engine completion wait timed out"),
            Error::InvalidKeyLength => write!(f, "invalid key length"),
            Error::InvalidDataLength => write!(f, "invalid data length"),
            Error::NoKey => write!(f, "no key installed"),
            Error::InvalidState => write!(f, "invalid session state"),
            Error::Unsupported => write!(f, "operation not supported"),
            Error::NoMemory => write!(f, "dma arena exhausted"),
            Error::Hardware(cc) => write!(f, "engine failure (completion code {cc})"),
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = core::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping() {
        assert_eq!(Error::Interrupted.errno(), -4);
        assert_eq!(Error::TimedOut.errno(), -110);
        assert_eq!(Error::InvalidKeyLength.errno(), -22);
        assert_eq!(Error::NoKey.errno(), -126);
        assert_eq!(Error::Hardware(3).errno(), -5);
    }
}
