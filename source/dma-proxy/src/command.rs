//! Session commands, and their character-device `ioctl` encoding.
use core::mem::size_of;

use crate::Error;

/// `ioctl` type byte shared by every proxy command.
pub const IOCTL_MAGIC: u8 = 0x89;

const IOC_NONE: u32 = 0;
const IOC_WRITE: u32 = 1;

const IOC_NRSHIFT: u32 = 0;
const IOC_TYPESHIFT: u32 = 8;
const IOC_SIZESHIFT: u32 = 16;
const IOC_DIRSHIFT: u32 = 30;

/// Encodes an `ioctl` request number the way Linux's `_IOC` does.
#[must_use]
pub const fn ioc(dir: u32, ty: u8, nr: u8, size: usize) -> u32 {
    (dir << IOC_DIRSHIFT)
        | ((ty as u32) << IOC_TYPESHIFT)
        | ((nr as u32) << IOC_NRSHIFT)
        | ((size as u32) << IOC_SIZESHIFT)
}

/// Allocate a coherent buffer; the argument is its size.
pub const IOCTL_CREATE_BUFFER: u32 = ioc(IOC_WRITE, IOCTL_MAGIC, 0, size_of::<usize>());
/// Free the session's buffer.
pub const IOCTL_DESTROY_BUFFER: u32 = ioc(IOC_NONE, IOCTL_MAGIC, 1, 0);
/// Start a transfer; the argument is its length.
pub const IOCTL_START_TRANSFER: u32 = ioc(IOC_WRITE, IOCTL_MAGIC, 2, size_of::<usize>());
/// Wait for the session's transfer to be received.
pub const IOCTL_WAIT_RECEIVE: u32 = ioc(IOC_NONE, IOCTL_MAGIC, 4, 0);

/// A command a session can run through [`Session::dispatch`].
///
/// [`Session::dispatch`]: crate::Session::dispatch
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Command {
    CreateBuffer(usize),
    DestroyBuffer,
    StartTransfer(usize),
    WaitForReceive,
}

impl Command {
    /// Decodes an `ioctl` request and its argument.
    pub fn from_ioctl(code: u32, arg: Option<usize>) -> Result<Self, Error> {
        const MISSING: Error = Error::InvalidArgument("missing ioctl argument");
        match code {
            IOCTL_CREATE_BUFFER => arg.map(Command::CreateBuffer).ok_or(MISSING),
            IOCTL_DESTROY_BUFFER => Ok(Command::DestroyBuffer),
            IOCTL_START_TRANSFER => arg.map(Command::StartTransfer).ok_or(MISSING),
            IOCTL_WAIT_RECEIVE => Ok(Command::WaitForReceive),
            _ => {
                tracing::debug!(code = format_args!("{code:#x}"), "unknown ioctl");
                Err(Error::InvalidArgument("unknown ioctl"))
            }
        }
    }

    /// The `ioctl` request number and argument for this command.
    #[must_use]
    pub fn to_ioctl(&self) -> (u32, Option<usize>) {
        match *self {
            Command::CreateBuffer(size) => (IOCTL_CREATE_BUFFER, Some(size)),
            Command::DestroyBuffer => (IOCTL_DESTROY_BUFFER, None),
            Command::StartTransfer(len) => (IOCTL_START_TRANSFER, Some(len)),
            Command::WaitForReceive => (IOCTL_WAIT_RECEIVE, None),
        }
    }
}
