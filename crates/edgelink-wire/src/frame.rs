use std::io::Write;

use edgelink_object::buffer::SliceWriter;
use edgelink_object::{Error, Result};
use tracing::debug;

use crate::crc::update_crc;
use crate::header::{Header, HeaderIter, validate_block};

/// Prelude layout: `total_len:u32 BE | header_block_len:u32 BE | crc:u32 BE`.
pub const PRELUDE_LEN: usize = 12;

// Prelude, plus the trailing message CRC.
const MIN_FRAME_LEN: usize = PRELUDE_LEN + 4;

/// Validated frame prelude.
#[derive(Debug, Clone, Copy)]
pub struct Prelude {
    total_len: u32,
    headers_len: u32,
    /// Running CRC over the full 12 prelude bytes, for chaining into the
    /// message CRC check.
    crc: u32,
}

impl Prelude {
    /// Bytes remaining after the prelude (headers + payload + message CRC).
    #[inline]
    pub fn data_len(&self) -> usize {
        self.total_len as usize - PRELUDE_LEN
    }

    #[inline]
    pub fn total_len(&self) -> usize {
        self.total_len as usize
    }
}

/// Decoded frame: validated headers and the borrowed payload.
#[derive(Debug, Clone, Copy)]
pub struct Message<'a> {
    headers: &'a [u8],
    pub payload: &'a [u8],
}

impl<'a> Message<'a> {
    #[inline]
    pub fn headers(&self) -> HeaderIter<'a> {
        HeaderIter::new(self.headers)
    }
}

/// Encodes a frame into `buf`: zeroed prelude placeholder, headers, payload
/// streamed by `payload`, then both CRCs backfilled. Returns the total frame
/// length.
///
/// Fails with `NoMem` when the frame does not fit `buf` (the configured
/// maximum message size).
pub fn encode(
    buf: &mut [u8],
    headers: &[Header<'_>],
    payload: impl FnOnce(&mut SliceWriter<'_>) -> Result<()>,
) -> Result<usize> {
    if buf.len() < MIN_FRAME_LEN {
        return Err(Error::NoMem);
    }

    let data_end;
    let headers_len;
    {
        let mut w = SliceWriter::new(buf);
        w.write_all(&[0u8; PRELUDE_LEN]).map_err(|_| Error::NoMem)?;
        for header in headers {
            header.encode_into(&mut w)?;
        }
        headers_len = w.pos() - PRELUDE_LEN;
        payload(&mut w)?;
        data_end = w.pos();
    }

    if buf.len() - data_end < 4 {
        return Err(Error::NoMem);
    }
    let total_len = data_end + 4;

    buf[0..4].copy_from_slice(&(total_len as u32).to_be_bytes());
    buf[4..8].copy_from_slice(&(headers_len as u32).to_be_bytes());
    let prelude_crc = update_crc(0, &buf[..8]);
    buf[8..12].copy_from_slice(&prelude_crc.to_be_bytes());

    let message_crc = update_crc(0, &buf[..data_end]);
    buf[data_end..total_len].copy_from_slice(&message_crc.to_be_bytes());

    Ok(total_len)
}

/// Validates and decodes a frame prelude.
pub fn decode_prelude(bytes: &[u8; PRELUDE_LEN]) -> Result<Prelude> {
    let total_len = u32::from_be_bytes(bytes[0..4].try_into().unwrap());
    let headers_len = u32::from_be_bytes(bytes[4..8].try_into().unwrap());
    let expected_crc = u32::from_be_bytes(bytes[8..12].try_into().unwrap());

    let crc = update_crc(0, &bytes[..8]);
    if crc != expected_crc {
        debug!(computed = crc, expected = expected_crc, "prelude CRC mismatch");
        return Err(Error::Parse);
    }

    if (total_len as usize) < MIN_FRAME_LEN {
        debug!(total_len, "frame shorter than minimum");
        return Err(Error::Parse);
    }
    if headers_len as usize > total_len as usize - MIN_FRAME_LEN {
        debug!(total_len, headers_len, "header block exceeds frame");
        return Err(Error::Parse);
    }

    Ok(Prelude { total_len, headers_len, crc: update_crc(crc, &bytes[8..12]) })
}

/// Decodes the post-prelude bytes of a frame against its `prelude`.
///
/// `data` must be exactly `prelude.data_len()` bytes. The returned message
/// borrows `data`; nothing is copied.
pub fn decode<'a>(prelude: &Prelude, data: &'a [u8]) -> Result<Message<'a>> {
    if data.len() != prelude.data_len() {
        return Err(Error::Parse);
    }

    let crc_at = data.len() - 4;
    let expected_crc = u32::from_be_bytes(data[crc_at..].try_into().unwrap());
    if update_crc(prelude.crc, &data[..crc_at]) != expected_crc {
        debug!(expected = expected_crc, "message CRC mismatch");
        return Err(Error::Parse);
    }

    let headers = &data[..prelude.headers_len as usize];
    validate_block(headers)?;

    Ok(Message { headers, payload: &data[prelude.headers_len as usize..crc_at] })
}
