use crate::{value::kind, MalformedMessage, Value};

/// The type tag at the front of every message array.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    /// `[0, id, method, params]`
    Request = 0,
    /// `[1, id, error, result]`
    Response = 1,
    /// `[2, method, params]`
    Notification = 2,
}

impl MessageType {
    /// Interpret a wire tag.
    pub fn from_tag(tag: u64) -> Option<Self> {
        match tag {
            0 => Some(Self::Request),
            1 => Some(Self::Response),
            2 => Some(Self::Notification),
            _ => None,
        }
    }

    /// The number of elements in this message type's array.
    pub fn arity(&self) -> usize {
        match self {
            Self::Request | Self::Response => 4,
            Self::Notification => 3,
        }
    }
}

/// A msgpack-rpc message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// A call that expects a response with the same id.
    Request {
        /// Correlates the eventual response with this request.
        id: u32,
        /// The remote procedure to invoke.
        method: String,
        /// Positional arguments.
        params: Vec<Value>,
    },
    /// The outcome of a request.
    ///
    /// On the wire this is an error field and a result field, exactly one of which
    /// is meaningful. `Ok` is the result, `Err` is the remote error payload.
    Response {
        /// Id of the request this answers.
        id: u32,
        /// Result or remote error. An `Err(Value::Nil)` is sent as a nil result.
        outcome: Result<Value, Value>,
    },
    /// A one-way message. Nothing answers it.
    Notification {
        /// The event or procedure name.
        method: String,
        /// Positional arguments.
        params: Vec<Value>,
    },
}

impl Message {
    /// Build a request.
    pub fn request(id: u32, method: impl Into<String>, params: Vec<Value>) -> Self {
        Self::Request {
            id,
            method: method.into(),
            params,
        }
    }

    /// Build a notification.
    pub fn notification(method: impl Into<String>, params: Vec<Value>) -> Self {
        Self::Notification {
            method: method.into(),
            params,
        }
    }

    /// Build a successful response.
    pub fn result(id: u32, result: Value) -> Self {
        Self::Response {
            id,
            outcome: Ok(result),
        }
    }

    /// Build an error response.
    ///
    /// A nil error payload means success on the wire, so `error(id, Value::Nil)`
    /// is the same message as `result(id, Value::Nil)`.
    pub fn error(id: u32, error: Value) -> Self {
        let outcome = match error {
            Value::Nil => Ok(Value::Nil),
            error => Err(error),
        };
        Self::Response { id, outcome }
    }

    /// This message's type tag.
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::Request { .. } => MessageType::Request,
            Self::Response { .. } => MessageType::Response,
            Self::Notification { .. } => MessageType::Notification,
        }
    }

    /// The correlation id, if this message type carries one.
    pub fn id(&self) -> Option<u32> {
        match self {
            Self::Request { id, .. } | Self::Response { id, .. } => Some(*id),
            Self::Notification { .. } => None,
        }
    }
}

impl TryFrom<Value> for Message {
    type Error = MalformedMessage;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        let fields = match value {
            Value::Array(fields) => fields,
            other => return Err(MalformedMessage::NotAnArray(kind(&other))),
        };
        let tag = match fields.first() {
            Some(Value::Integer(tag)) => tag
                .as_u64()
                .ok_or(MalformedMessage::InvalidType("negative integer"))?,
            Some(other) => return Err(MalformedMessage::InvalidType(kind(other))),
            None => return Err(MalformedMessage::Empty),
        };
        let message_type = MessageType::from_tag(tag).ok_or(MalformedMessage::UnknownType(tag))?;
        if fields.len() != message_type.arity() {
            return Err(MalformedMessage::WrongArity {
                message_type: tag,
                length: fields.len(),
            });
        }

        let mut fields = fields.into_iter().skip(1);
        let mut next = || fields.next().unwrap_or(Value::Nil);
        match message_type {
            MessageType::Request => Ok(Self::Request {
                id: read_id(next())?,
                method: read_method(next())?,
                params: read_params(next())?,
            }),
            MessageType::Response => {
                let id = read_id(next())?;
                let error = next();
                let result = next();
                let outcome = match (error, result) {
                    (Value::Nil, result) => Ok(result),
                    (error, Value::Nil) => Err(error),
                    (_, _) => return Err(MalformedMessage::AmbiguousResponse { id }),
                };
                Ok(Self::Response { id, outcome })
            }
            MessageType::Notification => Ok(Self::Notification {
                method: read_method(next())?,
                params: read_params(next())?,
            }),
        }
    }
}

fn read_id(value: Value) -> Result<u32, MalformedMessage> {
    value
        .as_u64()
        .and_then(|id| u32::try_from(id).ok())
        .ok_or_else(|| MalformedMessage::InvalidId(value.to_string()))
}

fn read_method(value: Value) -> Result<String, MalformedMessage> {
    match value {
        Value::String(method) => method
            .into_str()
            .ok_or(MalformedMessage::InvalidMethod("invalid utf-8")),
        other => Err(MalformedMessage::InvalidMethod(kind(&other))),
    }
}

fn read_params(value: Value) -> Result<Vec<Value>, MalformedMessage> {
    match value {
        Value::Array(params) => Ok(params),
        other => Err(MalformedMessage::InvalidParams(kind(&other))),
    }
}
