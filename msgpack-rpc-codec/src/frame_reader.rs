use bytes::{Buf, BytesMut};
use rmp::Marker;

use crate::{decode_one, DecodeError, MalformedMessage, Message};

const BUFFER_INCREMENT: usize = 32 * 1024;

/// Turns a byte stream into messages.
///
/// Bytes go in through `feed` or by reading straight into `receive_buffer`.
/// Messages come out of `drain_messages` as soon as their frame is complete; a
/// partial frame stays buffered until the rest of it arrives.
#[derive(Debug)]
pub struct FrameReader {
    buffer: BytesMut,
    max_buffer_length: usize,
    scan: FrameScan,
}

impl FrameReader {
    /// A reader that gives up on frames longer than `max_buffer_length`.
    pub fn new(max_buffer_length: usize) -> Self {
        Self {
            buffer: BytesMut::new(),
            max_buffer_length,
            scan: FrameScan::default(),
        }
    }

    /// Append bytes received from the stream.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// The buffer to read the next bytes into, with some spare capacity.
    ///
    /// Use with `AsyncReadExt::read_buf` or `BufMut` writes; anything appended
    /// is treated exactly like `feed`.
    pub fn receive_buffer(&mut self) -> &mut BytesMut {
        if self.buffer.capacity() - self.buffer.len() < BUFFER_INCREMENT {
            // Reclaims the already-consumed prefix when it can.
            self.buffer.reserve(BUFFER_INCREMENT);
        }
        &mut self.buffer
    }

    /// How many bytes are waiting for the rest of their frame.
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// Decode the next complete message, if there is one.
    ///
    /// A partial frame is only walked as far as its bytes go, and the walk picks
    /// up from there on the next call. The message is decoded once the whole
    /// frame is buffered.
    pub fn next_message(&mut self) -> Result<Option<Message>, MalformedMessage> {
        if self.buffer.is_empty() {
            return Ok(None);
        }
        let frame_length = match self.scan.scan(&self.buffer) {
            Scan::Complete(length) => length,
            Scan::Incomplete => {
                if self.max_buffer_length < self.buffer.len() {
                    log::error!(
                        "partial frame is too long. max: {}, buffered: {}",
                        self.max_buffer_length,
                        self.buffer.len()
                    );
                    return Err(MalformedMessage::FrameTooLarge {
                        limit: self.max_buffer_length,
                    });
                }
                log::trace!("waiting for the rest of a {}b frame", self.buffer.len());
                return Ok(None);
            }
            // Let the decoder describe what is wrong.
            Scan::Invalid => self.buffer.len(),
        };
        match decode_one(&self.buffer[..frame_length]) {
            Ok((length, message)) => {
                self.buffer.advance(length);
                log::trace!(
                    "consumed {length}b frame, {}b remain buffered",
                    self.buffer.len()
                );
                Ok(Some(message))
            }
            Err(DecodeError::Incomplete) => Err(MalformedMessage::InvalidValue(format!(
                "{frame_length}b frame ended early"
            ))),
            Err(DecodeError::Malformed(e)) => Err(e),
        }
    }

    /// Iterate over every complete message in the buffer.
    ///
    /// The iterator ends at the first incomplete frame, or right after yielding
    /// the first malformed one.
    pub fn drain_messages(&mut self) -> DrainMessages<'_> {
        DrainMessages {
            reader: self,
            failed: false,
        }
    }
}

enum Scan {
    Complete(usize),
    Incomplete,
    Invalid,
}

/// How much of the leading frame's msgpack structure has been walked.
#[derive(Debug, Default)]
struct FrameScan {
    // Offset of the next item header.
    offset: usize,
    // Items left to read at each open nesting level.
    remaining: Vec<u64>,
}

impl FrameScan {
    fn scan(&mut self, buffer: &[u8]) -> Scan {
        if self.remaining.is_empty() {
            self.remaining.push(1);
        }
        loop {
            while self.remaining.last() == Some(&0) {
                self.remaining.pop();
            }
            if self.remaining.is_empty() {
                let length = self.offset;
                *self = Self::default();
                return Scan::Complete(length);
            }
            let Some(item) = item_header(&buffer[self.offset..]) else {
                return Scan::Incomplete;
            };
            let (length, items) = match item {
                Item::Scalar(length) => (length, None),
                Item::Container { header, items } => (header, Some(items)),
                Item::Invalid => {
                    *self = Self::default();
                    return Scan::Invalid;
                }
            };
            if buffer.len() - self.offset < length {
                return Scan::Incomplete;
            }
            self.offset += length;
            if let Some(open) = self.remaining.last_mut() {
                *open -= 1;
            }
            if let Some(items) = items {
                self.remaining.push(items);
            }
        }
    }
}

enum Item {
    /// A whole value of this many bytes.
    Scalar(usize),
    /// A header of this many bytes followed by `items` values.
    Container { header: usize, items: u64 },
    Invalid,
}

/// `None` until the marker and its length field are buffered.
fn item_header(bytes: &[u8]) -> Option<Item> {
    let marker = Marker::from_u8(*bytes.first()?);
    let length = |width: usize| {
        bytes.get(1..1 + width).map(|field| {
            field
                .iter()
                .fold(0_usize, |length, byte| (length << 8) | usize::from(*byte))
        })
    };
    let item = match marker {
        Marker::FixPos(_) | Marker::FixNeg(_) | Marker::Null | Marker::True | Marker::False => {
            Item::Scalar(1)
        }
        Marker::U8 | Marker::I8 => Item::Scalar(2),
        Marker::U16 | Marker::I16 => Item::Scalar(3),
        Marker::U32 | Marker::I32 | Marker::F32 => Item::Scalar(5),
        Marker::U64 | Marker::I64 | Marker::F64 => Item::Scalar(9),
        Marker::FixStr(length) => Item::Scalar(1 + usize::from(length)),
        Marker::Str8 | Marker::Bin8 => Item::Scalar(2 + length(1)?),
        Marker::Str16 | Marker::Bin16 => Item::Scalar(3 + length(2)?),
        Marker::Str32 | Marker::Bin32 => Item::Scalar(5 + length(4)?),
        // marker, ext type, data
        Marker::FixExt1 => Item::Scalar(3),
        Marker::FixExt2 => Item::Scalar(4),
        Marker::FixExt4 => Item::Scalar(6),
        Marker::FixExt8 => Item::Scalar(10),
        Marker::FixExt16 => Item::Scalar(18),
        Marker::Ext8 => Item::Scalar(3 + length(1)?),
        Marker::Ext16 => Item::Scalar(4 + length(2)?),
        Marker::Ext32 => Item::Scalar(6 + length(4)?),
        Marker::FixArray(items) => Item::Container {
            header: 1,
            items: u64::from(items),
        },
        Marker::Array16 => Item::Container {
            header: 3,
            items: length(2)? as u64,
        },
        Marker::Array32 => Item::Container {
            header: 5,
            items: length(4)? as u64,
        },
        Marker::FixMap(entries) => Item::Container {
            header: 1,
            items: 2 * u64::from(entries),
        },
        Marker::Map16 => Item::Container {
            header: 3,
            items: 2 * length(2)? as u64,
        },
        Marker::Map32 => Item::Container {
            header: 5,
            items: 2 * length(4)? as u64,
        },
        Marker::Reserved => Item::Invalid,
    };
    Some(item)
}

/// Iterator returned by [`FrameReader::drain_messages`].
#[derive(Debug)]
pub struct DrainMessages<'a> {
    reader: &'a mut FrameReader,
    failed: bool,
}

impl Iterator for DrainMessages<'_> {
    type Item = Result<Message, MalformedMessage>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        match self.reader.next_message() {
            Ok(message) => message.map(Ok),
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}
