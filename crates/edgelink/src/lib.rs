//! Client library for an edge-device runtime's local IPC server.
//!
//! A component process connects over a Unix-domain socket, authenticates,
//! and multiplexes unary calls and long-lived subscriptions over one
//! connection of length-prefixed, CRC-guarded frames carrying JSON payloads.
//!
//! ```no_run
//! use edgelink::Connection;
//!
//! # fn main() -> edgelink::Result<()> {
//! let conn = Connection::connect()?;
//! let greeting = conn.get_config_str(&["greeting"], None)?;
//! println!("configured greeting: {greeting}");
//! # Ok(())
//! # }
//! ```

mod connection;
mod ops;
mod remote;
mod socket;
mod streams;

pub use connection::{
    Connection, ENV_AUTH_TOKEN, ENV_SOCKET_PATH, Identity, MAX_MSG_LEN, RESPONSE_TIMEOUT,
};
pub use edgelink_object::{
    Arena, Error, Kv, MAX_OBJECT_DEPTH, MAX_OBJECT_SUBOBJECTS, Result, Value, buffer, canonicalize,
    canonicalize_pairs, is_canonical, json, map_get, pairs_canonical,
};
pub use edgelink_wire as wire;
pub use ops::{ComponentState, Qos, TopicMessage};
pub use remote::{IpcErrorCode, RemoteError};
pub use streams::{MAX_STREAMS, SubscriptionHandle};
