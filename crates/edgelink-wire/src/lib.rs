//! On-wire packet format for the runtime's local IPC server.
//!
//! A packet is a 12-byte prelude (total length, header block length, prelude
//! CRC), a block of self-describing headers, an opaque payload, and a
//! trailing CRC over everything before it. All integers are big-endian;
//! CRC-32 is the IEEE polynomial with running state starting at 0.

mod crc;
mod frame;
mod header;
mod rpc;

pub use crc::update_crc;
pub use frame::{Message, PRELUDE_LEN, Prelude, decode, decode_prelude, encode};
pub use header::{Header, HeaderIter, HeaderValue, MAX_HEADER_NAME_LEN};
pub use rpc::{
    CommonHeaders, HEADER_MESSAGE_FLAGS, HEADER_MESSAGE_TYPE, HEADER_OPERATION,
    HEADER_SERVICE_MODEL_TYPE, HEADER_STREAM_ID, HEADER_SVCUID, HEADER_VERSION, MessageFlags,
    MessageType, common_headers,
};
