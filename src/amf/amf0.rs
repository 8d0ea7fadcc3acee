//! AMF0 encoder and decoder
//!
//! Only the AMF0 markers that appear in RTMP command and data messages are
//! decoded. Markers that carry no payload we care about (unsupported,
//! movieclip, recordset) decode as `Undefined` when lenient.
//!
//! ```text
//! 0x00 Number      0x01 Boolean     0x02 String      0x03 Object
//! 0x05 Null        0x06 Undefined   0x07 Reference   0x08 ECMA Array
//! 0x09 Object End  0x0A Strict Arr  0x0B Date        0x0C Long String
//! 0x0D Unsupported 0x10 Typed Obj
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::value::{AmfValue, Properties};
use crate::error::AmfError;

const MARKER_NUMBER: u8 = 0x00;
const MARKER_BOOLEAN: u8 = 0x01;
const MARKER_STRING: u8 = 0x02;
const MARKER_OBJECT: u8 = 0x03;
const MARKER_MOVIECLIP: u8 = 0x04;
const MARKER_NULL: u8 = 0x05;
const MARKER_UNDEFINED: u8 = 0x06;
const MARKER_REFERENCE: u8 = 0x07;
const MARKER_ECMA_ARRAY: u8 = 0x08;
const MARKER_OBJECT_END: u8 = 0x09;
const MARKER_STRICT_ARRAY: u8 = 0x0A;
const MARKER_DATE: u8 = 0x0B;
const MARKER_LONG_STRING: u8 = 0x0C;
const MARKER_UNSUPPORTED: u8 = 0x0D;
const MARKER_TYPED_OBJECT: u8 = 0x10;

const MAX_NESTING_DEPTH: usize = 32;

/// AMF0 decoder
pub struct Amf0Decoder {
    /// Complex values seen so far, for 0x07 references
    references: Vec<AmfValue>,
    lenient: bool,
    depth: usize,
}

impl Amf0Decoder {
    pub fn new() -> Self {
        Self::with_lenient(true)
    }

    pub fn with_lenient(lenient: bool) -> Self {
        Self {
            references: Vec::new(),
            lenient,
            depth: 0,
        }
    }

    /// Decode one value from the front of `buf`
    pub fn decode(&mut self, buf: &mut Bytes) -> Result<AmfValue, AmfError> {
        if !buf.has_remaining() {
            return Err(AmfError::UnexpectedEof);
        }

        self.depth += 1;
        if self.depth > MAX_NESTING_DEPTH {
            self.depth -= 1;
            return Err(AmfError::NestingTooDeep);
        }

        let marker = buf.get_u8();
        let result = self.decode_value(marker, buf);
        self.depth -= 1;
        result
    }

    /// Decode until the buffer is exhausted
    pub fn decode_all(&mut self, buf: &mut Bytes) -> Result<Vec<AmfValue>, AmfError> {
        let mut values = Vec::new();
        while buf.has_remaining() {
            values.push(self.decode(buf)?);
        }
        Ok(values)
    }

    fn decode_value(&mut self, marker: u8, buf: &mut Bytes) -> Result<AmfValue, AmfError> {
        match marker {
            MARKER_NUMBER => Ok(AmfValue::Number(read_f64(buf)?)),
            MARKER_BOOLEAN => {
                ensure(buf, 1)?;
                Ok(AmfValue::Boolean(buf.get_u8() != 0))
            }
            MARKER_STRING => Ok(AmfValue::String(read_utf8(buf)?)),
            MARKER_LONG_STRING => Ok(AmfValue::String(read_utf8_long(buf)?)),
            MARKER_OBJECT => {
                let props = self.read_properties(buf)?;
                let value = AmfValue::Object(props);
                self.references.push(value.clone());
                Ok(value)
            }
            MARKER_TYPED_OBJECT => {
                // class name is dropped, the properties are what commands use
                let _class = read_utf8(buf)?;
                let props = self.read_properties(buf)?;
                let value = AmfValue::Object(props);
                self.references.push(value.clone());
                Ok(value)
            }
            MARKER_ECMA_ARRAY => {
                ensure(buf, 4)?;
                // the count is advisory, the end marker terminates
                let _count = buf.get_u32();
                let props = self.read_properties(buf)?;
                let value = AmfValue::EcmaArray(props);
                self.references.push(value.clone());
                Ok(value)
            }
            MARKER_STRICT_ARRAY => {
                ensure(buf, 4)?;
                let count = buf.get_u32() as usize;
                let mut items = Vec::with_capacity(count.min(1024));
                for _ in 0..count {
                    items.push(self.decode(buf)?);
                }
                let value = AmfValue::StrictArray(items);
                self.references.push(value.clone());
                Ok(value)
            }
            MARKER_DATE => {
                let millis = read_f64(buf)?;
                ensure(buf, 2)?;
                buf.advance(2); // timezone, always zero
                Ok(AmfValue::Date(millis))
            }
            MARKER_REFERENCE => {
                ensure(buf, 2)?;
                let idx = buf.get_u16();
                self.references
                    .get(idx as usize)
                    .cloned()
                    .ok_or(AmfError::InvalidReference(idx))
            }
            MARKER_NULL => Ok(AmfValue::Null),
            MARKER_UNDEFINED => Ok(AmfValue::Undefined),
            MARKER_UNSUPPORTED | MARKER_MOVIECLIP if self.lenient => Ok(AmfValue::Undefined),
            other => {
                if self.lenient {
                    tracing::debug!(marker = other, "Skipping unknown AMF0 marker");
                    Ok(AmfValue::Undefined)
                } else {
                    Err(AmfError::UnknownMarker(other))
                }
            }
        }
    }

    fn read_properties(&mut self, buf: &mut Bytes) -> Result<Properties, AmfError> {
        let mut props = Vec::new();
        loop {
            let key = read_utf8(buf)?;
            if key.is_empty() {
                ensure(buf, 1)?;
                let end = buf.get_u8();
                if end == MARKER_OBJECT_END {
                    return Ok(props);
                }
                if !self.lenient {
                    return Err(AmfError::InvalidObjectEnd);
                }
                // some encoders emit an empty key with a real value
                let value = self.decode_value(end, buf)?;
                props.push((key, value));
                continue;
            }
            let value = self.decode(buf)?;
            props.push((key, value));
        }
    }
}

impl Default for Amf0Decoder {
    fn default() -> Self {
        Self::new()
    }
}

fn ensure(buf: &Bytes, n: usize) -> Result<(), AmfError> {
    if buf.remaining() < n {
        Err(AmfError::UnexpectedEof)
    } else {
        Ok(())
    }
}

fn read_f64(buf: &mut Bytes) -> Result<f64, AmfError> {
    ensure(buf, 8)?;
    Ok(buf.get_f64())
}

fn read_utf8(buf: &mut Bytes) -> Result<String, AmfError> {
    ensure(buf, 2)?;
    let len = buf.get_u16() as usize;
    ensure(buf, len)?;
    let raw = buf.split_to(len);
    String::from_utf8(raw.to_vec()).map_err(|_| AmfError::InvalidUtf8)
}

fn read_utf8_long(buf: &mut Bytes) -> Result<String, AmfError> {
    ensure(buf, 4)?;
    let len = buf.get_u32() as usize;
    ensure(buf, len)?;
    let raw = buf.split_to(len);
    String::from_utf8(raw.to_vec()).map_err(|_| AmfError::InvalidUtf8)
}

/// AMF0 encoder writing into a reusable buffer
pub struct Amf0Encoder {
    buf: BytesMut,
}

impl Amf0Encoder {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(256),
        }
    }

    /// Take the encoded bytes, leaving the encoder empty for reuse
    pub fn finish(&mut self) -> Bytes {
        self.buf.split().freeze()
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn encode(&mut self, value: &AmfValue) {
        match value {
            AmfValue::Null => self.buf.put_u8(MARKER_NULL),
            AmfValue::Undefined => self.buf.put_u8(MARKER_UNDEFINED),
            AmfValue::Boolean(b) => {
                self.buf.put_u8(MARKER_BOOLEAN);
                self.buf.put_u8(u8::from(*b));
            }
            AmfValue::Number(n) => {
                self.buf.put_u8(MARKER_NUMBER);
                self.buf.put_f64(*n);
            }
            AmfValue::String(s) => {
                if s.len() > u16::MAX as usize {
                    self.buf.put_u8(MARKER_LONG_STRING);
                    self.buf.put_u32(s.len() as u32);
                } else {
                    self.buf.put_u8(MARKER_STRING);
                    self.buf.put_u16(s.len() as u16);
                }
                self.buf.put_slice(s.as_bytes());
            }
            AmfValue::Object(props) => {
                self.buf.put_u8(MARKER_OBJECT);
                self.write_properties(props);
            }
            AmfValue::EcmaArray(props) => {
                self.buf.put_u8(MARKER_ECMA_ARRAY);
                self.buf.put_u32(props.len() as u32);
                self.write_properties(props);
            }
            AmfValue::StrictArray(items) => {
                self.buf.put_u8(MARKER_STRICT_ARRAY);
                self.buf.put_u32(items.len() as u32);
                for item in items {
                    self.encode(item);
                }
            }
            AmfValue::Date(millis) => {
                self.buf.put_u8(MARKER_DATE);
                self.buf.put_f64(*millis);
                self.buf.put_i16(0);
            }
        }
    }

    pub fn encode_all(&mut self, values: &[AmfValue]) {
        for value in values {
            self.encode(value);
        }
    }

    fn write_properties(&mut self, props: &Properties) {
        for (key, value) in props {
            self.write_key(key);
            self.encode(value);
        }
        self.buf.put_u16(0);
        self.buf.put_u8(MARKER_OBJECT_END);
    }

    fn write_key(&mut self, key: &str) {
        let len = key.len().min(u16::MAX as usize);
        self.buf.put_u16(len as u16);
        self.buf.put_slice(&key.as_bytes()[..len]);
    }
}

impl Default for Amf0Encoder {
    fn default() -> Self {
        Self::new()
    }
}

pub fn encode_all(values: &[AmfValue]) -> Bytes {
    let mut encoder = Amf0Encoder::new();
    encoder.encode_all(values);
    encoder.finish()
}

pub fn decode_all(data: &[u8]) -> Result<Vec<AmfValue>, AmfError> {
    let mut decoder = Amf0Decoder::new();
    let mut buf = Bytes::copy_from_slice(data);
    decoder.decode_all(&mut buf)
}
