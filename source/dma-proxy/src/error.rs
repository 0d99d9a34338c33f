use core::fmt;

use crate::{buf::AllocError, regs::Channel};

/// Errors returned by the engine, its sessions and the channel controller.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum Error {
    /// A null engine handle or bus address, a bad length, a missing buffer, or
    /// a buffer that already exists.
    InvalidArgument(&'static str),
    /// Every session slot is in use.
    ResourceExhausted,
    /// The session is not in a state where the command makes sense, such as
    /// freeing a buffer that was never allocated.
    FailedPrecondition(&'static str),
    /// Coherent memory could not be allocated.
    IoFault(AllocError),
    /// A channel never reported idle-and-complete within the configured
    /// [`PollPolicy`](crate::PollPolicy).
    Unresponsive(Channel),
}

impl Error {
    const EFAULT: i32 = 14;
    const ENOMEM: i32 = 12;
    const EBUSY: i32 = 16;
    const EINVAL: i32 = 22;
    const ETIMEDOUT: i32 = 110;

    /// The negative errno a character-device front end should hand back to
    /// its caller for this error.
    #[must_use]
    pub fn errno(&self) -> i32 {
        -match self {
            Error::InvalidArgument(_) => Self::EINVAL,
            Error::ResourceExhausted => Self::EBUSY,
            Error::FailedPrecondition(_) => Self::EFAULT,
            Error::IoFault(_) => Self::ENOMEM,
            Error::Unresponsive(_) => Self::ETIMEDOUT,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidArgument(why) => write!(f, "invalid argument: {why}"),
            Error::ResourceExhausted => f.write_str("all sessions are in use"),
            Error::FailedPrecondition(why) => write!(f, "failed precondition: {why}"),
            Error::IoFault(err) => write!(f, "coherent allocation failed: {err}"),
            Error::Unresponsive(ch) => write!(f, "{ch} channel never completed"),
        }
    }
}

impl From<AllocError> for Error {
    fn from(err: AllocError) -> Self {
        Error::IoFault(err)
    }
}
