// BER (X.690) element model, encoder and one-shot decoder.
// Knows nothing about LDAP: it only deals in tags, lengths and values.

use crate::error::{LdapError, Result};
use crate::stream::StreamDecoder;
use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;

/// Default upper bound for a single decoded element (including nested ones).
pub const DEFAULT_MAX_ELEMENT_SIZE: usize = 20 * 1024 * 1024;

/// Default upper bound for constructed-element nesting.
pub const DEFAULT_MAX_DEPTH: usize = 64;

/// Bounds applied while decoding untrusted input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodeLimits {
    /// Largest declared length (or total size, for indefinite form) accepted.
    pub max_element_size: usize,
    /// Deepest nesting of constructed elements accepted.
    pub max_depth: usize,
}

impl Default for DecodeLimits {
    fn default() -> Self {
        Self {
            max_element_size: DEFAULT_MAX_ELEMENT_SIZE,
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TagClass {
    Universal,
    Application,
    ContextSpecific,
    Private,
}

impl TagClass {
    fn bits(self) -> u8 {
        match self {
            TagClass::Universal => 0x00,
            TagClass::Application => 0x40,
            TagClass::ContextSpecific => 0x80,
            TagClass::Private => 0xC0,
        }
    }
}

/// Single-byte BER identifier octet: class, constructed bit and tag number (< 31).
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Tag(u8);

impl Tag {
    pub const END_OF_CONTENTS: Tag = Tag(0x00);
    pub const BOOLEAN: Tag = Tag(0x01);
    pub const INTEGER: Tag = Tag(0x02);
    pub const OCTET_STRING: Tag = Tag(0x04);
    pub const NULL: Tag = Tag(0x05);
    pub const ENUMERATED: Tag = Tag(0x0A);
    pub const SEQUENCE: Tag = Tag(0x30);
    pub const SET: Tag = Tag(0x31);

    const CONSTRUCTED: u8 = 0x20;
    const NUMBER_MASK: u8 = 0x1F;

    /// Wrap a raw identifier octet.
    pub const fn from_u8(byte: u8) -> Tag {
        Tag(byte)
    }

    pub fn new(class: TagClass, constructed: bool, number: u8) -> Result<Tag> {
        if number >= Self::NUMBER_MASK {
            return Err(LdapError::malformed(format!(
                "tag number {} requires the multi-byte form, which is not supported",
                number
            )));
        }
        let c = if constructed { Self::CONSTRUCTED } else { 0 };
        Ok(Tag(class.bits() | c | number))
    }

    /// `[APPLICATION n]` primitive.
    pub const fn application(number: u8) -> Tag {
        Tag(0x40 | (number & Self::NUMBER_MASK))
    }

    /// `[APPLICATION n]` constructed.
    pub const fn application_constructed(number: u8) -> Tag {
        Tag(0x60 | (number & Self::NUMBER_MASK))
    }

    /// `[n]` context-specific primitive.
    pub const fn context(number: u8) -> Tag {
        Tag(0x80 | (number & Self::NUMBER_MASK))
    }

    /// `[n]` context-specific constructed.
    pub const fn context_constructed(number: u8) -> Tag {
        Tag(0xA0 | (number & Self::NUMBER_MASK))
    }

    pub const fn as_u8(self) -> u8 {
        self.0
    }

    pub fn class(self) -> TagClass {
        match self.0 & 0xC0 {
            0x00 => TagClass::Universal,
            0x40 => TagClass::Application,
            0x80 => TagClass::ContextSpecific,
            _ => TagClass::Private,
        }
    }

    pub const fn is_constructed(self) -> bool {
        self.0 & Self::CONSTRUCTED != 0
    }

    pub const fn number(self) -> u8 {
        self.0 & Self::NUMBER_MASK
    }

    pub(crate) const fn uses_long_form(self) -> bool {
        self.0 & Self::NUMBER_MASK == Self::NUMBER_MASK
    }

    pub(crate) const fn with_constructed(self, constructed: bool) -> Tag {
        if constructed {
            Tag(self.0 | Self::CONSTRUCTED)
        } else {
            Tag(self.0 & !Self::CONSTRUCTED)
        }
    }
}

impl fmt::Debug for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Tag(0x{:02X})", self.0)
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:02X}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Primitive(Bytes),
    Constructed(Vec<Element>),
}

/// One tag-length-value unit. The constructed bit of `tag` always agrees with
/// the kind of `value`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Element {
    tag: Tag,
    value: Value,
}

impl Element {
    pub fn primitive(tag: Tag, payload: impl Into<Bytes>) -> Self {
        Self {
            tag: tag.with_constructed(false),
            value: Value::Primitive(payload.into()),
        }
    }

    pub fn constructed(tag: Tag, children: Vec<Element>) -> Self {
        Self {
            tag: tag.with_constructed(true),
            value: Value::Constructed(children),
        }
    }

    pub fn boolean(value: bool) -> Self {
        Self::primitive(Tag::BOOLEAN, vec![if value { 0xFF } else { 0x00 }])
    }

    pub fn integer(value: i64) -> Self {
        Self::primitive(Tag::INTEGER, encode_integer(value))
    }

    pub fn enumerated(value: i64) -> Self {
        Self::primitive(Tag::ENUMERATED, encode_integer(value))
    }

    pub fn octet_string(value: impl Into<Bytes>) -> Self {
        Self::primitive(Tag::OCTET_STRING, value)
    }

    pub fn string(value: &str) -> Self {
        Self::octet_string(Bytes::copy_from_slice(value.as_bytes()))
    }

    pub fn null() -> Self {
        Self::primitive(Tag::NULL, Bytes::new())
    }

    pub fn sequence(children: Vec<Element>) -> Self {
        Self::constructed(Tag::SEQUENCE, children)
    }

    pub fn set(children: Vec<Element>) -> Self {
        Self::constructed(Tag::SET, children)
    }

    /// Re-tag (IMPLICIT tagging). The constructed bit follows the value.
    pub fn with_tag(self, tag: Tag) -> Self {
        let constructed = matches!(self.value, Value::Constructed(_));
        Self {
            tag: tag.with_constructed(constructed),
            value: self.value,
        }
    }

    pub fn tag(&self) -> Tag {
        self.tag
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn into_value(self) -> Value {
        self.value
    }

    pub fn is_constructed(&self) -> bool {
        matches!(self.value, Value::Constructed(_))
    }

    pub fn payload(&self) -> Option<&Bytes> {
        match &self.value {
            Value::Primitive(b) => Some(b),
            Value::Constructed(_) => None,
        }
    }

    pub fn children(&self) -> Option<&[Element]> {
        match &self.value {
            Value::Constructed(c) => Some(c),
            Value::Primitive(_) => None,
        }
    }

    pub fn into_children(self) -> Result<Vec<Element>> {
        match self.value {
            Value::Constructed(c) => Ok(c),
            Value::Primitive(_) => Err(LdapError::decoding(format!(
                "expected a constructed element, got primitive tag {}",
                self.tag
            ))),
        }
    }

    /// Fails with a decoding error unless the element carries `tag`.
    pub fn expect_tag(&self, tag: Tag) -> Result<&Self> {
        if self.tag != tag {
            return Err(LdapError::decoding(format!(
                "expected tag {}, got {}",
                tag, self.tag
            )));
        }
        Ok(self)
    }

    pub fn as_bytes(&self) -> Result<&Bytes> {
        self.payload().ok_or_else(|| {
            LdapError::decoding(format!(
                "expected a primitive element, got constructed tag {}",
                self.tag
            ))
        })
    }

    pub fn as_str(&self) -> Result<&str> {
        std::str::from_utf8(self.as_bytes()?)
            .map_err(|e| LdapError::decoding(format!("invalid UTF-8 string: {}", e)))
    }

    pub fn as_integer(&self) -> Result<i64> {
        decode_integer(self.as_bytes()?)
    }

    pub fn as_enumerated(&self) -> Result<i64> {
        decode_integer(self.as_bytes()?)
    }

    /// Any non-zero content byte is true.
    pub fn as_bool(&self) -> Result<bool> {
        let bytes = self.as_bytes()?;
        if bytes.len() != 1 {
            return Err(LdapError::malformed(format!(
                "boolean must be 1 byte, got {}",
                bytes.len()
            )));
        }
        Ok(bytes[0] != 0)
    }

    pub fn as_null(&self) -> Result<()> {
        let bytes = self.as_bytes()?;
        if !bytes.is_empty() {
            return Err(LdapError::malformed(format!(
                "null must be empty, got {} bytes",
                bytes.len()
            )));
        }
        Ok(())
    }

    pub fn as_sequence(&self) -> Result<&[Element]> {
        self.children().ok_or_else(|| {
            LdapError::decoding(format!(
                "expected a constructed element, got primitive tag {}",
                self.tag
            ))
        })
    }

    /// Length of the contents octets.
    pub fn content_len(&self) -> usize {
        match &self.value {
            Value::Primitive(b) => b.len(),
            Value::Constructed(children) => children.iter().map(Element::encoded_len).sum(),
        }
    }

    /// Length of the full definite-form encoding.
    pub fn encoded_len(&self) -> usize {
        let content = self.content_len();
        1 + length_octets(content) + content
    }

    /// Definite-length encoding. Deterministic: equal elements give equal bytes.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode_into(&mut buf);
        buf.freeze()
    }

    pub fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_u8(self.tag.as_u8());
        write_length(buf, self.content_len());
        match &self.value {
            Value::Primitive(b) => buf.put_slice(b),
            Value::Constructed(children) => {
                for child in children {
                    child.encode_into(buf);
                }
            }
        }
    }
}

/// Decode one element from the start of `input`; returns it with the number of
/// bytes it occupied. Trailing bytes are left alone.
pub fn decode(input: &[u8], limits: &DecodeLimits) -> Result<(Element, usize)> {
    let mut decoder = StreamDecoder::new(*limits);
    match decoder.decode(input)? {
        (Some(element), consumed) => Ok((element, consumed)),
        (None, _) => Err(LdapError::malformed(format!(
            "declared length runs past the end of the {}-byte buffer",
            input.len()
        ))),
    }
}

/// Like [`decode`], but the element must occupy all of `input`.
pub fn decode_exact(input: &[u8], limits: &DecodeLimits) -> Result<Element> {
    let (element, consumed) = decode(input, limits)?;
    if consumed != input.len() {
        return Err(LdapError::malformed(format!(
            "{} trailing bytes after element",
            input.len() - consumed
        )));
    }
    Ok(element)
}

fn length_octets(len: usize) -> usize {
    if len < 0x80 {
        1
    } else {
        let significant = (usize::BITS - len.leading_zeros()).div_ceil(8) as usize;
        1 + significant
    }
}

fn write_length(buf: &mut BytesMut, len: usize) {
    if len < 0x80 {
        // Short form
        buf.put_u8(len as u8);
    } else {
        // Long form
        let bytes = (len as u64).to_be_bytes();
        let skip = bytes.iter().take_while(|&&b| b == 0).count();
        buf.put_u8(0x80 | (bytes.len() - skip) as u8);
        buf.put_slice(&bytes[skip..]);
    }
}

/// Minimal two's-complement big-endian encoding.
pub fn encode_integer(value: i64) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    let mut start = 0;
    while start < bytes.len() - 1 {
        let redundant = (bytes[start] == 0x00 && bytes[start + 1] & 0x80 == 0)
            || (bytes[start] == 0xFF && bytes[start + 1] & 0x80 != 0);
        if !redundant {
            break;
        }
        start += 1;
    }
    bytes[start..].to_vec()
}

/// Two's-complement big-endian; rejects empty contents, more than 8 bytes, and
/// leading octets that only pad.
pub fn decode_integer(bytes: &[u8]) -> Result<i64> {
    if bytes.is_empty() {
        return Err(LdapError::malformed("integer has no content octets"));
    }
    if bytes.len() > 8 {
        return Err(LdapError::malformed(format!(
            "integer of {} bytes does not fit in 64 bits",
            bytes.len()
        )));
    }
    if bytes.len() > 1 {
        let padded = (bytes[0] == 0x00 && bytes[1] & 0x80 == 0)
            || (bytes[0] == 0xFF && bytes[1] & 0x80 != 0);
        if padded {
            return Err(LdapError::malformed("integer has redundant leading octet"));
        }
    }
    let mut value: i64 = if bytes[0] & 0x80 != 0 { -1 } else { 0 };
    for &b in bytes {
        value = (value << 8) | i64::from(b);
    }
    Ok(value)
}

/// Hex preview of the first `max` bytes, for log lines.
pub(crate) fn hex_preview(bytes: &[u8], max: usize) -> String {
    let mut out = bytes
        .iter()
        .take(max)
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(" ");
    if bytes.len() > max {
        out.push_str(" ...");
    }
    out
}
