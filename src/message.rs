//! msgpack-RPC message types.
//!
//! Every frame on the wire is a msgpack array whose first element is the
//! message type tag:
//!
//! ```text
//! Request       [0, msgid, method, params]
//! Response      [1, msgid, error, result]
//! Notification  [2, method, params]
//! ```
//!
//! These tags are the only bit-exact contract with the peer.

use std::io;

use crate::rpc::DecodeError;
use crate::value::Value;

/// Wire tag of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Request = 0,
    Response = 1,
    Notification = 2,
}

impl MessageKind {
    pub fn from_tag(tag: u64) -> Option<Self> {
        match tag {
            0 => Some(MessageKind::Request),
            1 => Some(MessageKind::Response),
            2 => Some(MessageKind::Notification),
            _ => None,
        }
    }

    /// Number of array elements in the encoded frame, tag included.
    pub fn arity(self) -> usize {
        match self {
            MessageKind::Request | MessageKind::Response => 4,
            MessageKind::Notification => 3,
        }
    }
}

/// A single decoded (or to-be-encoded) msgpack-RPC frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Request {
        id: u32,
        method: String,
        args: Vec<Value>,
    },
    Response {
        id: u32,
        /// `None` when the wire carried nil.
        error: Option<Value>,
        result: Value,
    },
    Notification {
        topic: Value,
        payload: Value,
    },
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Request { .. } => MessageKind::Request,
            Message::Response { .. } => MessageKind::Response,
            Message::Notification { .. } => MessageKind::Notification,
        }
    }

    /// Build the array value for this message.
    pub fn into_value(self) -> Value {
        let tag = Value::from(self.kind() as u8);
        match self {
            Message::Request { id, method, args } => Value::Array(vec![
                tag,
                Value::from(id),
                Value::String(method),
                Value::Array(args),
            ]),
            Message::Response { id, error, result } => Value::Array(vec![
                tag,
                Value::from(id),
                error.unwrap_or(Value::Nil),
                result,
            ]),
            Message::Notification { topic, payload } => Value::Array(vec![tag, topic, payload]),
        }
    }

    /// Serialize this message into a msgpack frame.
    pub fn encode(&self) -> io::Result<Vec<u8>> {
        let value = rmpv::Value::from(self.clone().into_value());
        let mut buf = Vec::with_capacity(64);
        rmpv::encode::write_value(&mut buf, &value).map_err(io::Error::other)?;
        Ok(buf)
    }

    /// Classify a decoded frame.
    ///
    /// # Errors
    ///
    /// Returns `DecodeError::InvalidMessage` if the value is not an array of
    /// the right arity, carries an unknown tag, or has mistyped fields.
    pub fn from_value(value: Value) -> Result<Self, DecodeError> {
        let items = match value {
            Value::Array(items) => items,
            other => {
                return Err(DecodeError::InvalidMessage(format!(
                    "expected array, got {}",
                    other.type_name()
                )))
            }
        };

        let tag = items
            .first()
            .and_then(Value::as_u64)
            .ok_or_else(|| DecodeError::InvalidMessage("missing message type tag".to_string()))?;
        let kind = MessageKind::from_tag(tag)
            .ok_or_else(|| DecodeError::InvalidMessage(format!("unknown message type {tag}")))?;

        if items.len() != kind.arity() {
            return Err(DecodeError::InvalidMessage(format!(
                "{kind:?} must have {} elements, got {}",
                kind.arity(),
                items.len()
            )));
        }

        let mut fields = items.into_iter().skip(1);
        let mut next = || fields.next().unwrap_or_default();

        match kind {
            MessageKind::Request => {
                let id = parse_id(&next())?;
                let method = next().into_string().ok_or_else(|| {
                    DecodeError::InvalidMessage("request method must be a string".to_string())
                })?;
                let args = next().into_array().ok_or_else(|| {
                    DecodeError::InvalidMessage("request params must be an array".to_string())
                })?;
                Ok(Message::Request { id, method, args })
            }
            MessageKind::Response => {
                let id = parse_id(&next())?;
                let error = Some(next()).filter(|e| !e.is_nil());
                let result = next();
                Ok(Message::Response { id, error, result })
            }
            MessageKind::Notification => {
                let topic = next();
                let payload = next();
                Ok(Message::Notification { topic, payload })
            }
        }
    }
}

fn parse_id(value: &Value) -> Result<u32, DecodeError> {
    value
        .as_u64()
        .and_then(|id| u32::try_from(id).ok())
        .ok_or_else(|| DecodeError::InvalidMessage(format!("invalid message id {value}")))
}

/// Error payload of a response, as sent by Neovim.
///
/// Neovim reports errors as `[type, message]`, where type is 0 for
/// exceptions and 1 for validation errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteError {
    pub code: Option<i64>,
    pub message: String,
}

impl RemoteError {
    pub fn from_value(error: &Value) -> Self {
        match error.as_array() {
            Some(items) if !items.is_empty() => {
                let code = if items.len() > 1 {
                    items[0].as_i64()
                } else {
                    None
                };
                let message = match items.last() {
                    Some(Value::String(s)) => s.clone(),
                    Some(other) => other.to_string(),
                    None => String::new(),
                };
                Self { code, message }
            }
            _ => Self {
                code: None,
                message: match error {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                },
            },
        }
    }
}
