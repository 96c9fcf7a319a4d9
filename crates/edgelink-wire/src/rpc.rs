use bitflags::bitflags;
use edgelink_object::{Error, Result};

use crate::frame::Message;
use crate::header::HeaderValue;

// Well-known header names.
pub const HEADER_MESSAGE_TYPE: &[u8] = b":message-type";
pub const HEADER_MESSAGE_FLAGS: &[u8] = b":message-flags";
pub const HEADER_STREAM_ID: &[u8] = b":stream-id";
pub const HEADER_VERSION: &[u8] = b":version";
pub const HEADER_OPERATION: &[u8] = b"operation";
pub const HEADER_SERVICE_MODEL_TYPE: &[u8] = b"service-model-type";
pub const HEADER_SVCUID: &[u8] = b"svcuid";

/// `:message-type` values. Frozen wire contract with the runtime's IPC
/// server; do not renumber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum MessageType {
    ApplicationMessage = 0,
    ApplicationError = 1,
    Ping = 2,
    PingResponse = 3,
    Connect = 4,
    ConnectAck = 5,
}

impl MessageType {
    #[inline]
    pub const fn as_i32(self) -> i32 {
        self as i32
    }
}

impl TryFrom<i32> for MessageType {
    type Error = Error;

    fn try_from(raw: i32) -> Result<Self> {
        match raw {
            0 => Ok(Self::ApplicationMessage),
            1 => Ok(Self::ApplicationError),
            2 => Ok(Self::Ping),
            3 => Ok(Self::PingResponse),
            4 => Ok(Self::Connect),
            5 => Ok(Self::ConnectAck),
            _ => Err(Error::Parse),
        }
    }
}

bitflags! {
    /// `:message-flags` bits. Frozen wire contract.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MessageFlags: i32 {
        const CONNECTION_ACCEPTED = 1;
        const TERMINATE_STREAM = 2;
    }
}

/// The three headers every routed message must carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommonHeaders {
    pub message_type: i32,
    pub message_flags: MessageFlags,
    pub stream_id: i32,
}

/// Extracts the required common headers; `Parse` if any is missing or not an
/// i32.
pub fn common_headers(msg: &Message<'_>) -> Result<CommonHeaders> {
    let mut message_type = None;
    let mut message_flags = None;
    let mut stream_id = None;

    for header in msg.headers() {
        let slot = match header.name {
            n if n == HEADER_MESSAGE_TYPE => &mut message_type,
            n if n == HEADER_MESSAGE_FLAGS => &mut message_flags,
            n if n == HEADER_STREAM_ID => &mut stream_id,
            _ => continue,
        };
        match header.value {
            HeaderValue::I32(v) => *slot = Some(v),
            _ => return Err(Error::Parse),
        }
    }

    match (message_type, message_flags, stream_id) {
        (Some(message_type), Some(flags), Some(stream_id)) => Ok(CommonHeaders {
            message_type,
            message_flags: MessageFlags::from_bits_retain(flags),
            stream_id,
        }),
        _ => Err(Error::Parse),
    }
}
