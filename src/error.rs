use std::{fmt::Display, io, num::NonZeroU32};

/// Error returned from `rawusb` operations other than transfers.
///
/// Transfer outcomes are reported through the completion callback as a
/// [`TransferStatus`][crate::transfer::TransferStatus], never as an `Error`.
#[derive(Debug, Clone)]
pub struct Error {
    pub(crate) kind: ErrorKind,
    pub(crate) code: Option<NonZeroU32>,
    pub(crate) message: &'static str,
}

impl Error {
    pub(crate) fn new(kind: ErrorKind, message: &'static str) -> Self {
        Self {
            kind,
            code: None,
            message,
        }
    }

    pub(crate) fn with_os_code(kind: ErrorKind, message: &'static str, code: u32) -> Self {
        Self {
            kind,
            code: NonZeroU32::new(code),
            message,
        }
    }

    #[track_caller]
    pub(crate) fn log_debug(self) -> Self {
        log::debug!("{}", self);
        self
    }

    /// Get the error kind.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Get the `errno` value from the OS, if applicable.
    pub fn os_error(&self) -> Option<u32> {
        self.code.map(|c| c.get())
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(code) = self.code {
            write!(f, " (os error {})", code.get())?;
        }
        Ok(())
    }
}

impl std::error::Error for Error {}

impl From<Error> for io::Error {
    fn from(err: Error) -> Self {
        let kind = match err.kind {
            ErrorKind::Io => io::ErrorKind::Other,
            ErrorKind::InvalidParam => io::ErrorKind::InvalidInput,
            ErrorKind::Access => io::ErrorKind::PermissionDenied,
            ErrorKind::NoDevice => io::ErrorKind::NotConnected,
            ErrorKind::NotFound => io::ErrorKind::NotFound,
            ErrorKind::Busy => io::ErrorKind::Other, // TODO: ResourceBusy once stable
            ErrorKind::Timeout => io::ErrorKind::TimedOut,
            ErrorKind::Overflow => io::ErrorKind::InvalidData,
            ErrorKind::Pipe => io::ErrorKind::BrokenPipe,
            ErrorKind::Interrupted => io::ErrorKind::Interrupted,
            ErrorKind::NoMem => io::ErrorKind::OutOfMemory,
            ErrorKind::NotSupported => io::ErrorKind::Unsupported,
            ErrorKind::Other => io::ErrorKind::Other,
        };
        io::Error::new(kind, err)
    }
}

/// General category of error as part of an [`Error`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ErrorKind {
    /// Input/output error.
    Io,

    /// A parameter is out of range or otherwise invalid.
    InvalidParam,

    /// This user or application does not have permission to perform the
    /// requested operation.
    Access,

    /// Device is disconnected.
    NoDevice,

    /// Requested device, interface, or endpoint not found, or the operation
    /// targets something that is not currently active.
    NotFound,

    /// Device, interface, or resource is in use by another caller, or the
    /// event loop is already being driven by another thread.
    Busy,

    /// Operation timed out.
    Timeout,

    /// More data was received than requested.
    Overflow,

    /// Endpoint halted or control request not supported by the device.
    Pipe,

    /// A system call was interrupted by a signal.
    Interrupted,

    /// Memory allocation failed in the OS or backend.
    NoMem,

    /// The requested operation is not supported by the backend.
    NotSupported,

    /// Uncategorized error.
    Other,
}
