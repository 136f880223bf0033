use std::io::{self, Cursor};

use crate::{DecodeError, MalformedMessage, Message, Value};

type WriteError = Box<dyn std::error::Error + Send + Sync>;

/// Serialize a message to a new buffer.
pub fn encode(message: &Message) -> Vec<u8> {
    let mut buffer = Vec::new();
    encode_into(message, &mut buffer);
    buffer
}

/// Serialize a message onto the end of a buffer.
#[allow(clippy::expect_used)]
pub fn encode_into(message: &Message, buffer: &mut Vec<u8>) {
    log::debug!("encoding {message:?}");
    write_message(message, buffer).expect("messages must be encodable");
}

fn write_message(message: &Message, buffer: &mut Vec<u8>) -> Result<(), WriteError> {
    rmp::encode::write_array_len(buffer, message.message_type().arity() as u32)?;
    rmp::encode::write_uint(buffer, message.message_type() as u64)?;
    match message {
        Message::Request { id, method, params } => {
            rmp::encode::write_uint(buffer, u64::from(*id))?;
            rmp::encode::write_str(buffer, method)?;
            write_params(buffer, params)?;
        }
        Message::Response { id, outcome } => {
            rmp::encode::write_uint(buffer, u64::from(*id))?;
            match outcome {
                Ok(result) => {
                    rmp::encode::write_nil(buffer)?;
                    rmpv::encode::write_value(buffer, result)?;
                }
                Err(error) => {
                    rmpv::encode::write_value(buffer, error)?;
                    rmp::encode::write_nil(buffer)?;
                }
            }
        }
        Message::Notification { method, params } => {
            rmp::encode::write_str(buffer, method)?;
            write_params(buffer, params)?;
        }
    }
    Ok(())
}

fn write_params(buffer: &mut Vec<u8>, params: &[Value]) -> Result<(), WriteError> {
    rmp::encode::write_array_len(buffer, u32::try_from(params.len())?)?;
    for param in params {
        rmpv::encode::write_value(buffer, param)?;
    }
    Ok(())
}

/// Decode exactly one message from the front of the buffer.
///
/// On success you get the number of bytes the message occupied; advance past them
/// before decoding the next one. `Incomplete` means the buffer holds the start of
/// a message and nothing is wrong yet.
pub fn decode_one(buffer: &[u8]) -> Result<(usize, Message), DecodeError> {
    let mut cursor = Cursor::new(buffer);
    let value = match rmpv::decode::read_value(&mut cursor) {
        Ok(value) => value,
        Err(e) if is_truncated(&e) => {
            log::trace!("incomplete frame in {}b", buffer.len());
            return Err(DecodeError::Incomplete);
        }
        Err(e) => {
            log::error!("decode error after {}b: {e:?}", cursor.position());
            return Err(MalformedMessage::InvalidValue(e.to_string()).into());
        }
    };
    let length = cursor.position() as usize;
    let message = Message::try_from(value).map_err(|e| {
        log::error!("decoded {length}b that is not a message: {e}");
        e
    })?;
    log::debug!("decoded {length}: {message:?}");
    Ok((length, message))
}

fn is_truncated(error: &rmpv::decode::Error) -> bool {
    match error {
        rmpv::decode::Error::InvalidMarkerRead(e) | rmpv::decode::Error::InvalidDataRead(e) => {
            e.kind() == io::ErrorKind::UnexpectedEof
        }
        #[allow(unreachable_patterns)]
        _ => false,
    }
}
