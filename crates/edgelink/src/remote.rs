use edgelink_object::{Error, Result, Value, json, map_get};

/// Server error codes, mapped from the closed set of `_errorCode` strings.
/// Unknown strings fold into [`IpcErrorCode::ServiceError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IpcErrorCode {
    #[default]
    ServiceError,
    ResourceNotFound,
    ComponentNotFound,
    InvalidArguments,
    InvalidToken,
    Unauthorized,
    Conflict,
    FailedUpdateConditionCheck,
    InvalidClientDeviceAuthToken,
}

impl IpcErrorCode {
    pub fn from_code(code: &[u8]) -> Self {
        match code {
            b"ResourceNotFoundError" => Self::ResourceNotFound,
            b"ComponentNotFoundError" => Self::ComponentNotFound,
            b"InvalidArgumentsError" => Self::InvalidArguments,
            b"InvalidTokenError" => Self::InvalidToken,
            b"UnauthorizedError" => Self::Unauthorized,
            b"ConflictError" => Self::Conflict,
            b"FailedUpdateConditionCheckError" => Self::FailedUpdateConditionCheck,
            b"InvalidClientDeviceAuthTokenError" => Self::InvalidClientDeviceAuthToken,
            _ => Self::ServiceError,
        }
    }

    /// Closest local error class, for callers that fold remote failures into
    /// the common taxonomy.
    pub const fn as_error(self) -> Error {
        match self {
            Self::ResourceNotFound | Self::ComponentNotFound => Error::NoEntry,
            Self::InvalidArguments => Error::Invalid,
            Self::Conflict => Error::Busy,
            Self::ServiceError
            | Self::InvalidToken
            | Self::Unauthorized
            | Self::FailedUpdateConditionCheck
            | Self::InvalidClientDeviceAuthToken => Error::Failure,
        }
    }
}

/// Side channel filled when a call returns [`Error::Remote`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteError {
    pub code: IpcErrorCode,
    pub message: String,
}

/// Parses an error payload of the shape
/// `{"_errorCode": <string>, "_message": <string?>}`.
pub(crate) fn parse_error_payload(payload: &mut [u8]) -> Result<RemoteError> {
    let value = json::decode_destructive(payload)?;
    let pairs = value.as_map().ok_or(Error::Parse)?;

    let code = match map_get(pairs, b"_errorCode") {
        Some(Value::Buf(code)) => *code,
        _ => return Err(Error::Parse),
    };
    let message = match map_get(pairs, b"_message") {
        Some(Value::Buf(msg)) => String::from_utf8_lossy(msg).into_owned(),
        None => String::new(),
        Some(_) => return Err(Error::Parse),
    };

    Ok(RemoteError { code: IpcErrorCode::from_code(code), message })
}
