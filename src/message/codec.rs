//! Binary record format for persistent messages.
//!
//! A record is laid out as follows, all integers big-endian:
//!
//! ```text
//! u32 body length | body
//! u16 content-type length | content-type (UTF-8)
//! u8  delivery mode
//! u32 header count | (u8 key length | key | value) *
//! ```
//!
//! A value is a one byte tag followed by its payload:
//!
//! | tag | type      | payload                          |
//! |-----|-----------|----------------------------------|
//! | `S` | string    | u32 length, UTF-8 bytes          |
//! | `L` | int64     | i64                              |
//! | `d` | float64   | f64                              |
//! | `t` | bool      | u8 (0 or 1)                      |
//! | `x` | bytes     | u32 length, bytes                |
//! | `T` | timestamp | u64 seconds since the epoch      |
//! | `F` | table     | u32 count, (key, value) pairs    |
//! | `A` | array     | u32 count, values                |
//! | `D` | decimal   | u8 scale, u32 value              |
//! | `V` | void      | nothing                          |
//!
//! In a stream every record is preceded by its own u32 length so that a
//! record that fails to decode does not take the rest of the stream with it.

use std::io::{self, Read, Write};

use super::persistent::{DeliveryMode, HeaderValue, Headers, PersistentMessage};
use crate::utils::error::CodecError;

/// Nesting limit for tables and arrays.
pub const MAX_DEPTH: usize = 64;

const TAG_STRING: u8 = b'S';
const TAG_INT: u8 = b'L';
const TAG_FLOAT: u8 = b'd';
const TAG_BOOL: u8 = b't';
const TAG_BYTES: u8 = b'x';
const TAG_TIMESTAMP: u8 = b'T';
const TAG_TABLE: u8 = b'F';
const TAG_ARRAY: u8 = b'A';
const TAG_DECIMAL: u8 = b'D';
const TAG_VOID: u8 = b'V';

/// Serializes one message into a record (without the stream frame).
pub fn encode_record(message: &PersistentMessage) -> Result<Vec<u8>, CodecError> {
    let mut buf = Vec::with_capacity(message.body().len() + 64);

    long_bytes("body", message.body(), &mut buf)?;

    let content_type = message.content_type().as_bytes();
    let len = u16::try_from(content_type.len()).map_err(|_| CodecError::TooLong {
        field: "content type",
        len: content_type.len(),
        max: u16::MAX as usize,
    })?;
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(content_type);

    buf.push(message.delivery_mode().as_u8());

    table(message.headers(), &mut buf, 0)?;

    Ok(buf)
}

/// Parses exactly one record. Trailing bytes are an error.
pub fn decode_record(bytes: &[u8]) -> Result<PersistentMessage, CodecError> {
    let mut cursor = Cursor { buf: bytes };

    let body = cursor.long_bytes()?.to_vec();

    let ct_len = u16::from_be_bytes(cursor.array()?) as usize;
    let content_type = std::str::from_utf8(cursor.take(ct_len)?)
        .map_err(|_| CodecError::InvalidUtf8("content type"))?
        .to_string();

    let mode = cursor.u8()?;
    let delivery_mode = DeliveryMode::try_from(mode).map_err(CodecError::InvalidDeliveryMode)?;

    let headers = cursor.table(0)?;

    if !cursor.buf.is_empty() {
        return Err(CodecError::TrailingBytes(cursor.buf.len()));
    }

    Ok(PersistentMessage::new(body)
        .with_content_type(content_type)
        .with_delivery_mode(delivery_mode)
        .with_headers(headers))
}

/// Writes one length-framed record to `writer`.
pub fn write_frame<W: Write>(writer: &mut W, message: &PersistentMessage) -> Result<(), CodecError> {
    let record = encode_record(message)?;
    let len = frame_len(record.len())?;
    writer.write_all(&len.to_be_bytes())?;
    writer.write_all(&record)?;
    Ok(())
}

fn frame_len(len: usize) -> Result<u32, CodecError> {
    u32::try_from(len).map_err(|_| CodecError::TooLong {
        field: "record",
        len,
        max: u32::MAX as usize,
    })
}

fn long_bytes(field: &'static str, bytes: &[u8], buf: &mut Vec<u8>) -> Result<(), CodecError> {
    let len = u32::try_from(bytes.len()).map_err(|_| CodecError::TooLong {
        field,
        len: bytes.len(),
        max: u32::MAX as usize,
    })?;
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(bytes);
    Ok(())
}

fn count(field: &'static str, n: usize, buf: &mut Vec<u8>) -> Result<(), CodecError> {
    let n = u32::try_from(n).map_err(|_| CodecError::TooLong {
        field,
        len: n,
        max: u32::MAX as usize,
    })?;
    buf.extend_from_slice(&n.to_be_bytes());
    Ok(())
}

fn table(headers: &Headers, buf: &mut Vec<u8>, depth: usize) -> Result<(), CodecError> {
    if depth > MAX_DEPTH {
        return Err(CodecError::TooDeep(MAX_DEPTH));
    }
    count("header table", headers.len(), buf)?;
    for (key, value) in headers {
        let len = u8::try_from(key.len()).map_err(|_| CodecError::TooLong {
            field: "header key",
            len: key.len(),
            max: u8::MAX as usize,
        })?;
        buf.push(len);
        buf.extend_from_slice(key.as_bytes());
        field_value(value, buf, depth)?;
    }
    Ok(())
}

fn field_value(value: &HeaderValue, buf: &mut Vec<u8>, depth: usize) -> Result<(), CodecError> {
    match value {
        HeaderValue::String(s) => {
            buf.push(TAG_STRING);
            long_bytes("string header", s.as_bytes(), buf)?;
        }
        HeaderValue::Int(int) => {
            buf.push(TAG_INT);
            buf.extend_from_slice(&int.to_be_bytes());
        }
        HeaderValue::Float(float) => {
            buf.push(TAG_FLOAT);
            buf.extend_from_slice(&float.to_be_bytes());
        }
        HeaderValue::Bool(b) => {
            buf.extend_from_slice(&[TAG_BOOL, u8::from(*b)]);
        }
        HeaderValue::Bytes(bytes) => {
            buf.push(TAG_BYTES);
            long_bytes("byte array header", bytes, buf)?;
        }
        HeaderValue::Timestamp(secs) => {
            buf.push(TAG_TIMESTAMP);
            buf.extend_from_slice(&secs.to_be_bytes());
        }
        HeaderValue::Table(nested) => {
            buf.push(TAG_TABLE);
            table(nested, buf, depth + 1)?;
        }
        HeaderValue::Array(values) => {
            if depth + 1 > MAX_DEPTH {
                return Err(CodecError::TooDeep(MAX_DEPTH));
            }
            buf.push(TAG_ARRAY);
            count("header array", values.len(), buf)?;
            for value in values {
                field_value(value, buf, depth + 1)?;
            }
        }
        HeaderValue::Decimal { scale, value } => {
            buf.extend_from_slice(&[TAG_DECIMAL, *scale]);
            buf.extend_from_slice(&value.to_be_bytes());
        }
        HeaderValue::Void => buf.push(TAG_VOID),
    }
    Ok(())
}

struct Cursor<'a> {
    buf: &'a [u8],
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        if self.buf.len() < n {
            return Err(CodecError::Truncated {
                needed: n - self.buf.len(),
                remaining: self.buf.len(),
            });
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], CodecError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32, CodecError> {
        Ok(u32::from_be_bytes(self.array()?))
    }

    fn long_bytes(&mut self) -> Result<&'a [u8], CodecError> {
        let len = self.u32()? as usize;
        self.take(len)
    }

    fn table(&mut self, depth: usize) -> Result<Headers, CodecError> {
        if depth > MAX_DEPTH {
            return Err(CodecError::TooDeep(MAX_DEPTH));
        }
        let n = self.u32()?;
        let mut headers = Headers::new();
        for _ in 0..n {
            let key_len = self.u8()? as usize;
            let key = std::str::from_utf8(self.take(key_len)?)
                .map_err(|_| CodecError::InvalidUtf8("header key"))?
                .to_string();
            let value = self.field_value(depth)?;
            if headers.contains_key(&key) {
                return Err(CodecError::DuplicateKey(key));
            }
            headers.insert(key, value);
        }
        Ok(headers)
    }

    fn field_value(&mut self, depth: usize) -> Result<HeaderValue, CodecError> {
        let value = match self.u8()? {
            TAG_STRING => {
                let s = std::str::from_utf8(self.long_bytes()?)
                    .map_err(|_| CodecError::InvalidUtf8("string header"))?;
                HeaderValue::String(s.to_string())
            }
            TAG_INT => HeaderValue::Int(i64::from_be_bytes(self.array()?)),
            TAG_FLOAT => HeaderValue::Float(f64::from_be_bytes(self.array()?)),
            TAG_BOOL => HeaderValue::Bool(self.u8()? != 0),
            TAG_BYTES => HeaderValue::Bytes(self.long_bytes()?.to_vec()),
            TAG_TIMESTAMP => HeaderValue::Timestamp(u64::from_be_bytes(self.array()?)),
            TAG_TABLE => HeaderValue::Table(self.table(depth + 1)?),
            TAG_ARRAY => {
                if depth + 1 > MAX_DEPTH {
                    return Err(CodecError::TooDeep(MAX_DEPTH));
                }
                let n = self.u32()?;
                let mut values = Vec::new();
                for _ in 0..n {
                    values.push(self.field_value(depth + 1)?);
                }
                HeaderValue::Array(values)
            }
            TAG_DECIMAL => {
                let scale = self.u8()?;
                let value = self.u32()?;
                HeaderValue::Decimal { scale, value }
            }
            TAG_VOID => HeaderValue::Void,
            other => return Err(CodecError::UnknownTag(other)),
        };
        Ok(value)
    }
}

/// Iterates over the length-framed records of a stream.
///
/// A record that fails to decode yields an error and the reader moves on to
/// the next frame. A truncated frame or an I/O error ends the iteration.
#[derive(Debug)]
pub struct RecordReader<R> {
    reader: R,
    done: bool,
}

impl<R: Read> RecordReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            done: false,
        }
    }

    fn read_frame(&mut self) -> Result<Option<Vec<u8>>, CodecError> {
        let mut len_buf = [0u8; 4];
        let mut filled = 0;
        while filled < len_buf.len() {
            match self.reader.read(&mut len_buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        if filled == 0 {
            return Ok(None);
        }
        if filled < len_buf.len() {
            return Err(CodecError::Truncated {
                needed: len_buf.len() - filled,
                remaining: 0,
            });
        }

        let len = u32::from_be_bytes(len_buf) as usize;
        let mut frame = Vec::new();
        (&mut self.reader).take(len as u64).read_to_end(&mut frame)?;
        if frame.len() < len {
            return Err(CodecError::Truncated {
                needed: len - frame.len(),
                remaining: 0,
            });
        }
        Ok(Some(frame))
    }
}

impl<R: Read> Iterator for RecordReader<R> {
    type Item = Result<PersistentMessage, CodecError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.read_frame() {
            Ok(Some(frame)) => Some(decode_record(&frame)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}
