use thiserror::Error;

/// Error codes shared by every layer of the client, representing the class of
/// failure rather than a specific site.
///
/// The set is closed; remote (server-reported) failures surface as
/// [`Error::Remote`] with a side channel carrying the decoded error code.
#[derive(Error, Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum Error {
    /// Generic failure
    #[error("generic failure")]
    Failure,
    /// Failure, can be retried
    #[error("retryable failure")]
    Retry,
    /// Request cannot be handled at the time
    #[error("busy")]
    Busy,
    /// System is in irrecoverably broken state
    #[error("irrecoverable state")]
    Fatal,
    /// Request is invalid or malformed
    #[error("invalid request")]
    Invalid,
    /// Request is unsupported
    #[error("unsupported request")]
    Unsupported,
    /// Request data invalid
    #[error("invalid data")]
    Parse,
    /// Request or data outside of allowable range
    #[error("out of range")]
    Range,
    /// Insufficient memory
    #[error("insufficient memory")]
    NoMem,
    /// No connection
    #[error("no connection")]
    NoConn,
    /// No more data available
    #[error("no more data")]
    NoData,
    /// Unknown entry or target requested
    #[error("unknown entry")]
    NoEntry,
    /// Invalid or missing configuration
    #[error("invalid configuration")]
    Config,
    /// Received remote error
    #[error("remote error")]
    Remote,
    /// Expected non-ok status
    #[error("expected non-ok status")]
    Expected,
    /// Request timed out
    #[error("timed out")]
    Timeout,
}

impl Error {
    /// Stable uppercase name, matching the wire-compatible peer's log output.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Failure => "FAILURE",
            Self::Retry => "RETRY",
            Self::Busy => "BUSY",
            Self::Fatal => "FATAL",
            Self::Invalid => "INVALID",
            Self::Unsupported => "UNSUPPORTED",
            Self::Parse => "PARSE",
            Self::Range => "RANGE",
            Self::NoMem => "NOMEM",
            Self::NoConn => "NOCONN",
            Self::NoData => "NODATA",
            Self::NoEntry => "NOENTRY",
            Self::Config => "CONFIG",
            Self::Remote => "REMOTE",
            Self::Expected => "EXPECTED",
            Self::Timeout => "TIMEOUT",
        }
    }
}

pub type Result<T> = core::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_stable() {
        assert_eq!(Error::NoEntry.as_str(), "NOENTRY");
        assert_eq!(Error::Timeout.as_str(), "TIMEOUT");
        assert_eq!(Error::Parse.to_string(), "invalid data");
    }
}
