use thiserror::Error;

pub const PIPE_ERROR_INVAL: i32 = -1;
pub const PIPE_ERROR_AGAIN: i32 = -2;
pub const PIPE_ERROR_NOMEM: i32 = -3;
pub const PIPE_ERROR_IO: i32 = -4;

/// Failure of a pipe operation as reported to the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PipeError {
    /// Malformed command, unknown channel or duplicate open.
    #[error("invalid pipe operation")]
    Invalid,
    /// Nothing can be transferred right now; the guest should arm a wake and retry.
    #[error("pipe operation would block")]
    Again,
    #[error("out of memory")]
    NoMemory,
    /// The channel was closed by the host.
    #[error("pipe i/o error")]
    Io,
}

impl PipeError {
    /// Negative status code written to the guest.
    pub const fn status(self) -> i32 {
        match self {
            PipeError::Invalid => PIPE_ERROR_INVAL,
            PipeError::Again => PIPE_ERROR_AGAIN,
            PipeError::NoMemory => PIPE_ERROR_NOMEM,
            PipeError::Io => PIPE_ERROR_IO,
        }
    }

    pub const fn from_status(status: i32) -> Option<Self> {
        match status {
            PIPE_ERROR_INVAL => Some(PipeError::Invalid),
            PIPE_ERROR_AGAIN => Some(PipeError::Again),
            PIPE_ERROR_NOMEM => Some(PipeError::NoMemory),
            PIPE_ERROR_IO => Some(PipeError::Io),
            _ => None,
        }
    }
}

pub type PipeResult<T> = Result<T, PipeError>;

/// Collapses a transfer result into the guest status convention: byte count or negative error.
pub(crate) fn transfer_status(result: PipeResult<usize>) -> i32 {
    match result {
        Ok(n) => i32::try_from(n).unwrap_or(i32::MAX),
        Err(err) => err.status(),
    }
}
