//! Incremental msgpack frame decoding.
//!
//! msgpack values are self-delimiting, so there is no length prefix on the
//! wire: a frame ends where its value ends. The decoder keeps every byte it
//! has not consumed yet and walks the msgpack headers of the pending frame as
//! input arrives, resuming where the last chunk ran out. A frame is decoded
//! only once all of its bytes are buffered, so a large frame costs the same
//! however finely it is chunked.
//!
//! # Failure model
//!
//! Partial input is never an error. Bytes that cannot start or continue a
//! valid msgpack value are: the stream has lost its framing and cannot be
//! resynchronized, so the decoder latches the error and refuses to produce
//! further messages.

use crate::message::Message;
use crate::rpc::DecodeError;
use crate::value::Value;

/// Maximum size (100MB) of a single buffered frame, to prevent OOM from a
/// malicious or buggy peer.
pub const MAX_FRAME_SIZE: usize = 100 * 1024 * 1024;

/// Streaming decoder turning raw byte chunks into [`Message`]s.
#[derive(Debug)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    /// Start of the unconsumed region of `buf`.
    pos: usize,
    max_frame_size: usize,
    scan: FrameScan,
    failed: Option<DecodeError>,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::with_max_frame_size(MAX_FRAME_SIZE)
    }

    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self {
            buf: Vec::with_capacity(8 * 1024),
            pos: 0,
            max_frame_size,
            scan: FrameScan::default(),
            failed: None,
        }
    }

    /// Append raw bytes received from the transport.
    pub fn feed(&mut self, chunk: &[u8]) {
        if self.failed.is_none() {
            self.buf.extend_from_slice(chunk);
        }
    }

    /// Number of received bytes not yet consumed by a complete message.
    pub fn buffered_len(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn is_failed(&self) -> bool {
        self.failed.is_some()
    }

    /// Decode the next complete message, if the buffer holds one.
    ///
    /// Returns `Ok(None)` when more bytes are needed.
    ///
    /// # Errors
    ///
    /// Returns a `DecodeError` if the buffered bytes are not valid msgpack,
    /// decode to something that is not a msgpack-RPC message, or an
    /// incomplete frame grows beyond the maximum frame size. Once an error
    /// is returned, every later call returns it again.
    pub fn next_message(&mut self) -> Result<Option<Message>, DecodeError> {
        if let Some(err) = &self.failed {
            return Err(err.clone());
        }

        if self.pos == self.buf.len() {
            self.compact();
            return Ok(None);
        }

        let available = self.buf.len() - self.pos;
        let frame_len = match self.scan.advance(&self.buf[self.pos..]) {
            Ok(Some(len)) => len,
            Ok(None) => {
                if available > self.max_frame_size {
                    return Err(self.fail(DecodeError::FrameTooLarge {
                        size: available,
                        max: self.max_frame_size,
                    }));
                }
                self.compact();
                return Ok(None);
            }
            Err(err) => return Err(self.fail(err)),
        };
        self.scan = FrameScan::default();

        let mut frame = &self.buf[self.pos..self.pos + frame_len];
        let value = match rmpv::decode::read_value(&mut frame) {
            Ok(value) => value,
            Err(err) => return Err(self.fail(DecodeError::InvalidData(err.to_string()))),
        };
        self.pos += frame_len;

        match Message::from_value(Value::from(value)) {
            Ok(msg) => Ok(Some(msg)),
            Err(err) => Err(self.fail(err)),
        }
    }

    /// Feed a chunk and drain every message it completes, in order.
    pub fn decode_chunk(&mut self, chunk: &[u8]) -> Result<Vec<Message>, DecodeError> {
        self.feed(chunk);
        let mut messages = Vec::new();
        while let Some(msg) = self.next_message()? {
            messages.push(msg);
        }
        Ok(messages)
    }

    fn fail(&mut self, err: DecodeError) -> DecodeError {
        self.buf = Vec::new();
        self.pos = 0;
        self.scan = FrameScan::default();
        self.failed = Some(err.clone());
        err
    }

    /// Drop the consumed prefix of the buffer.
    fn compact(&mut self) {
        if self.pos > 0 {
            self.buf.drain(..self.pos);
            self.pos = 0;
        }
    }
}

/// Progress through the headers of the frame at the front of the buffer.
///
/// msgpack is prefix encoded, so the only state needed is the offset reached
/// and how many values are still owed: each header pays for one value and
/// adds its children (array elements, map keys and values).
#[derive(Debug, Default)]
struct FrameScan {
    scanned: usize,
    remaining: u64,
}

impl FrameScan {
    /// Continue scanning `bytes`, the buffered frame and whatever follows it.
    /// Returns the frame length once its last value is buffered.
    fn advance(&mut self, bytes: &[u8]) -> Result<Option<usize>, DecodeError> {
        if self.scanned == 0 {
            self.remaining = 1;
        }

        while self.remaining > 0 {
            let rest = &bytes[self.scanned..];
            let Some((&marker, after)) = rest.split_first() else {
                return Ok(None);
            };
            let Some(header) = Header::parse(marker, after)? else {
                return Ok(None);
            };
            let size = header.len.saturating_add(header.payload);
            if rest.len() < size {
                return Ok(None);
            }
            self.scanned += size;
            self.remaining = self.remaining - 1 + header.children;
        }
        Ok(Some(self.scanned))
    }
}

/// Shape of one msgpack value header.
struct Header {
    /// Marker plus length and type bytes.
    len: usize,
    /// Raw bytes following the header (str, bin, ext data and scalars).
    payload: usize,
    /// Nested values following the header.
    children: u64,
}

impl Header {
    /// Returns `Ok(None)` if the length bytes of the header are not all
    /// buffered yet.
    fn parse(marker: u8, after: &[u8]) -> Result<Option<Self>, DecodeError> {
        let scalar = |payload: usize| Header {
            len: 1,
            payload,
            children: 0,
        };
        // Length prefix of `width` bytes, then `extra` bytes before the data.
        let sized = |width: usize, extra: usize| {
            read_be(after, width).map(|n| Header {
                len: 1 + width + extra,
                payload: usize::try_from(n).unwrap_or(usize::MAX),
                children: 0,
            })
        };
        let nested = |width: usize, per_item: u64| {
            read_be(after, width).map(|n| Header {
                len: 1 + width,
                payload: 0,
                children: n * per_item,
            })
        };
        let fixext = |size: usize| Header {
            len: 2,
            payload: size,
            children: 0,
        };

        let header = match marker {
            0x00..=0x7f | 0xe0..=0xff | 0xc0 | 0xc2 | 0xc3 => Some(scalar(0)),
            0x80..=0x8f => Some(Header {
                len: 1,
                payload: 0,
                children: 2 * u64::from(marker & 0x0f),
            }),
            0x90..=0x9f => Some(Header {
                len: 1,
                payload: 0,
                children: u64::from(marker & 0x0f),
            }),
            0xa0..=0xbf => Some(scalar(usize::from(marker & 0x1f))),
            0xc1 => return Err(DecodeError::InvalidData("reserved marker 0xc1".into())),
            0xc4 | 0xd9 => sized(1, 0),
            0xc5 | 0xda => sized(2, 0),
            0xc6 | 0xdb => sized(4, 0),
            0xc7 => sized(1, 1),
            0xc8 => sized(2, 1),
            0xc9 => sized(4, 1),
            0xcc | 0xd0 => Some(scalar(1)),
            0xcd | 0xd1 => Some(scalar(2)),
            0xca | 0xce | 0xd2 => Some(scalar(4)),
            0xcb | 0xcf | 0xd3 => Some(scalar(8)),
            0xd4 => Some(fixext(1)),
            0xd5 => Some(fixext(2)),
            0xd6 => Some(fixext(4)),
            0xd7 => Some(fixext(8)),
            0xd8 => Some(fixext(16)),
            0xdc => nested(2, 1),
            0xdd => nested(4, 1),
            0xde => nested(2, 2),
            0xdf => nested(4, 2),
        };
        Ok(header)
    }
}

/// Big-endian unsigned integer of `width` bytes at the start of `bytes`.
fn read_be(bytes: &[u8], width: usize) -> Option<u64> {
    bytes
        .get(..width)
        .map(|b| b.iter().fold(0u64, |n, &byte| (n << 8) | u64::from(byte)))
}
