use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use super::delivery::BrokerMessage;

/// Header table: ordered key/value pairs.
pub type Headers = BTreeMap<String, HeaderValue>;

/// A typed header value.
///
/// Broker-side integer widths are widened to [`HeaderValue::Int`] and single
/// precision floats to [`HeaderValue::Float`]; long strings that are not valid
/// UTF-8 are kept as [`HeaderValue::Bytes`].
///
/// Floats compare by their bit pattern, so a NaN header equals itself and
/// `0.0` differs from `-0.0`.
#[derive(Debug, Clone)]
pub enum HeaderValue {
    String(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Bytes(Vec<u8>),
    /// Seconds since the UNIX epoch.
    Timestamp(u64),
    Table(Headers),
    Array(Vec<HeaderValue>),
    Decimal { scale: u8, value: u32 },
    Void,
}

impl PartialEq for HeaderValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (HeaderValue::String(a), HeaderValue::String(b)) => a == b,
            (HeaderValue::Int(a), HeaderValue::Int(b)) => a == b,
            (HeaderValue::Float(a), HeaderValue::Float(b)) => a.to_bits() == b.to_bits(),
            (HeaderValue::Bool(a), HeaderValue::Bool(b)) => a == b,
            (HeaderValue::Bytes(a), HeaderValue::Bytes(b)) => a == b,
            (HeaderValue::Timestamp(a), HeaderValue::Timestamp(b)) => a == b,
            (HeaderValue::Table(a), HeaderValue::Table(b)) => a == b,
            (HeaderValue::Array(a), HeaderValue::Array(b)) => a == b,
            (
                HeaderValue::Decimal { scale, value },
                HeaderValue::Decimal {
                    scale: other_scale,
                    value: other_value,
                },
            ) => scale == other_scale && value == other_value,
            (HeaderValue::Void, HeaderValue::Void) => true,
            _ => false,
        }
    }
}

impl Eq for HeaderValue {}

impl HeaderValue {
    pub fn timestamp(at: DateTime<Utc>) -> Self {
        HeaderValue::Timestamp(at.timestamp().max(0) as u64)
    }

    /// Returns the timestamp as a UTC date, if this is a representable
    /// timestamp value.
    pub fn as_datetime(&self) -> Option<DateTime<Utc>> {
        match self {
            HeaderValue::Timestamp(secs) => {
                i64::try_from(*secs).ok().and_then(|s| DateTime::from_timestamp(s, 0))
            }
            _ => None,
        }
    }
}

impl From<&str> for HeaderValue {
    fn from(value: &str) -> Self {
        HeaderValue::String(value.to_string())
    }
}

impl From<String> for HeaderValue {
    fn from(value: String) -> Self {
        HeaderValue::String(value)
    }
}

impl From<i64> for HeaderValue {
    fn from(value: i64) -> Self {
        HeaderValue::Int(value)
    }
}

impl From<f64> for HeaderValue {
    fn from(value: f64) -> Self {
        HeaderValue::Float(value)
    }
}

impl From<bool> for HeaderValue {
    fn from(value: bool) -> Self {
        HeaderValue::Bool(value)
    }
}

impl From<Headers> for HeaderValue {
    fn from(value: Headers) -> Self {
        HeaderValue::Table(value)
    }
}

/// AMQP delivery mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DeliveryMode {
    /// The publisher did not set a delivery mode.
    #[default]
    Unspecified = 0,
    Transient = 1,
    Persistent = 2,
}

impl DeliveryMode {
    /// Maps a broker-supplied delivery mode. Values the protocol does not
    /// define collapse to [`DeliveryMode::Unspecified`].
    pub fn from_wire(mode: u8) -> Self {
        match mode {
            1 => DeliveryMode::Transient,
            2 => DeliveryMode::Persistent,
            _ => DeliveryMode::Unspecified,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for DeliveryMode {
    type Error = u8;

    fn try_from(mode: u8) -> Result<Self, Self::Error> {
        match mode {
            0 => Ok(DeliveryMode::Unspecified),
            1 => Ok(DeliveryMode::Transient),
            2 => Ok(DeliveryMode::Persistent),
            other => Err(other),
        }
    }
}

/// A message detached from any broker session.
///
/// Built either from a delivery ([`PersistentMessage::capture`]) or from a
/// saved record, and immutable afterwards: the `with_*` builders consume the
/// value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PersistentMessage {
    body: Vec<u8>,
    content_type: String,
    delivery_mode: DeliveryMode,
    headers: Headers,
}

impl PersistentMessage {
    pub fn new(body: impl Into<Vec<u8>>) -> Self {
        Self {
            body: body.into(),
            ..Self::default()
        }
    }

    /// Captures the replayable part of a delivery. Routing information and
    /// the acknowledgment handle are left behind.
    pub fn capture(message: &BrokerMessage) -> Self {
        Self {
            body: message.body.clone(),
            content_type: message.content_type.clone().unwrap_or_default(),
            delivery_mode: message.delivery_mode,
            headers: message.headers.clone(),
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = content_type.into();
        self
    }

    pub fn with_delivery_mode(mut self, mode: DeliveryMode) -> Self {
        self.delivery_mode = mode;
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<HeaderValue>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Empty when the message carried no content type.
    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    pub fn delivery_mode(&self) -> DeliveryMode {
        self.delivery_mode
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn into_body(self) -> Vec<u8> {
        self.body
    }
}

impl From<&BrokerMessage> for PersistentMessage {
    fn from(message: &BrokerMessage) -> Self {
        PersistentMessage::capture(message)
    }
}
