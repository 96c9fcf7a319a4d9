//! Scripted mock IPC server driving the client over a socketpair.
#![allow(dead_code)] // not every scenario binary uses every helper

use std::io::{Read, Write};
use std::os::unix::net::UnixStream;

use edgelink::buffer::SliceWriter;
use edgelink::wire::{
    self, CommonHeaders, Header, HeaderValue, MessageFlags, MessageType, PRELUDE_LEN,
};

pub const MAX_MSG_LEN: usize = 10_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OwnedHeaderValue {
    Bool(bool),
    I32(i32),
    Str(Vec<u8>),
}

#[derive(Debug)]
pub struct Frame {
    pub common: CommonHeaders,
    pub headers: Vec<(Vec<u8>, OwnedHeaderValue)>,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn header_str(&self, name: &[u8]) -> Option<&[u8]> {
        self.headers.iter().find_map(|(n, v)| match v {
            OwnedHeaderValue::Str(s) if n == name => Some(s.as_slice()),
            _ => None,
        })
    }

    pub fn json(&self) -> serde_json::Value {
        serde_json::from_slice(&self.payload).expect("frame payload is JSON")
    }
}

pub struct MockServer {
    stream: UnixStream,
}

impl MockServer {
    pub fn new(stream: UnixStream) -> Self {
        Self { stream }
    }

    /// Closes the server side, as a crashed or restarting runtime would.
    pub fn shutdown(&mut self) {
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
    }

    pub fn read_frame(&mut self) -> Frame {
        let mut prelude_buf = [0u8; PRELUDE_LEN];
        self.stream.read_exact(&mut prelude_buf).expect("read prelude");
        let prelude = wire::decode_prelude(&prelude_buf).expect("valid prelude");

        let mut data = vec![0u8; prelude.data_len()];
        self.stream.read_exact(&mut data).expect("read frame body");
        let msg = wire::decode(&prelude, &data).expect("valid frame");

        let headers = msg
            .headers()
            .map(|h| {
                let value = match h.value {
                    HeaderValue::Bool(b) => OwnedHeaderValue::Bool(b),
                    HeaderValue::I32(i) => OwnedHeaderValue::I32(i),
                    HeaderValue::Str(s) => OwnedHeaderValue::Str(s.to_vec()),
                };
                (h.name.to_vec(), value)
            })
            .collect();

        Frame {
            common: wire::common_headers(&msg).expect("routable frame"),
            headers,
            payload: msg.payload.to_vec(),
        }
    }

    pub fn send_frame(&mut self, headers: &[Header<'_>], payload: &[u8]) {
        let mut scratch = vec![0u8; MAX_MSG_LEN];
        let len = wire::encode(&mut scratch, headers, |w: &mut SliceWriter<'_>| {
            std::io::Write::write_all(w, payload).map_err(|_| edgelink::Error::NoMem)
        })
        .expect("encode frame");
        self.stream.write_all(&scratch[..len]).expect("write frame");
    }

    /// Reads the CONNECT frame and acknowledges it, returning its payload.
    pub fn accept_connect(&mut self, svcuid: Option<&str>) -> Frame {
        let connect = self.read_frame();
        assert_eq!(connect.common.message_type, MessageType::Connect.as_i32());
        assert_eq!(connect.common.stream_id, 0);
        assert_eq!(connect.header_str(wire::HEADER_VERSION), Some(&b"0.1.0"[..]));

        let mut headers = vec![
            Header::i32(wire::HEADER_MESSAGE_TYPE, MessageType::ConnectAck.as_i32()),
            Header::i32(wire::HEADER_MESSAGE_FLAGS, MessageFlags::CONNECTION_ACCEPTED.bits()),
            Header::i32(wire::HEADER_STREAM_ID, 0),
        ];
        if let Some(svcuid) = svcuid {
            headers.push(Header::string(wire::HEADER_SVCUID, svcuid.as_bytes()));
        }
        self.send_frame(&headers, b"");
        connect
    }

    /// Sends a successful application reply on `stream_id`.
    pub fn send_response(&mut self, stream_id: i32, payload: &[u8]) {
        let headers = [
            Header::i32(wire::HEADER_MESSAGE_TYPE, MessageType::ApplicationMessage.as_i32()),
            Header::i32(wire::HEADER_MESSAGE_FLAGS, 0),
            Header::i32(wire::HEADER_STREAM_ID, stream_id),
        ];
        self.send_frame(&headers, payload);
    }

    /// Sends an application error on `stream_id`.
    pub fn send_error(&mut self, stream_id: i32, payload: &[u8]) {
        let headers = [
            Header::i32(wire::HEADER_MESSAGE_TYPE, MessageType::ApplicationError.as_i32()),
            Header::i32(wire::HEADER_MESSAGE_FLAGS, 0),
            Header::i32(wire::HEADER_STREAM_ID, stream_id),
        ];
        self.send_frame(&headers, payload);
    }

    /// Sends a subscription payload event; `terminate` marks the stream's
    /// last frame.
    pub fn send_event(&mut self, stream_id: i32, payload: &[u8], terminate: bool) {
        let flags = if terminate { MessageFlags::TERMINATE_STREAM.bits() } else { 0 };
        let headers = [
            Header::i32(wire::HEADER_MESSAGE_TYPE, MessageType::ApplicationMessage.as_i32()),
            Header::i32(wire::HEADER_MESSAGE_FLAGS, flags),
            Header::i32(wire::HEADER_STREAM_ID, stream_id),
        ];
        self.send_frame(&headers, payload);
    }

    /// Reads a request frame, asserting its operation header.
    pub fn expect_request(&mut self, operation: &[u8]) -> Frame {
        let frame = self.read_frame();
        assert_eq!(
            frame.common.message_type,
            MessageType::ApplicationMessage.as_i32(),
            "expected an application request"
        );
        assert_eq!(frame.header_str(wire::HEADER_OPERATION), Some(operation));
        frame
    }
}
