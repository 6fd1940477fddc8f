// Incremental BER decoding for byte streams.
//
// `StreamDecoder` is push-based: feed it whatever bytes have arrived and it
// either yields one complete element or keeps its partial state for the next
// call. `ElementReader` drives it from any `AsyncRead`.

use crate::ber::{DecodeLimits, Element, Tag};
use crate::error::{LdapError, Result};
use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

const READ_CHUNK: usize = 8 * 1024;

enum Length {
    Definite(usize),
    Indefinite,
}

struct Header {
    tag: Tag,
    length: Length,
    header_len: usize,
}

/// A constructed element whose contents are still arriving.
struct Frame {
    tag: Tag,
    /// `None` for the indefinite form.
    declared: Option<usize>,
    /// Content bytes consumed so far, including nested headers.
    consumed: usize,
    children: Vec<Element>,
}

pub struct StreamDecoder {
    limits: DecodeLimits,
    stack: Vec<Frame>,
}

impl StreamDecoder {
    pub fn new(limits: DecodeLimits) -> Self {
        Self {
            limits,
            stack: Vec::new(),
        }
    }

    pub fn limits(&self) -> &DecodeLimits {
        &self.limits
    }

    /// True when no element is partially decoded.
    pub fn is_idle(&self) -> bool {
        self.stack.is_empty()
    }

    /// Drop any partial state. After an error the decoder must be reset (or
    /// discarded) before reuse.
    pub fn reset(&mut self) {
        self.stack.clear();
    }

    /// Consume as much of `input` as possible.
    ///
    /// Returns the completed element, if any, and how many bytes of `input`
    /// were consumed. Consumed bytes belong to the decoder even when no element
    /// is returned; the caller must not feed them again. Primitive contents are
    /// only consumed once all of their bytes are present.
    pub fn decode(&mut self, input: &[u8]) -> Result<(Option<Element>, usize)> {
        let mut pos = 0;
        loop {
            if let Some(done) = self.close_completed_frames() {
                return Ok((Some(done), pos));
            }

            let rest = &input[pos..];
            let header = match parse_header(rest, &self.limits)? {
                Some(header) => header,
                None => return Ok((None, pos)),
            };

            if header.tag == Tag::END_OF_CONTENTS {
                let closes_indefinite = matches!(header.length, Length::Definite(0))
                    && self.stack.last().is_some_and(|f| f.declared.is_none());
                if !closes_indefinite {
                    return Err(LdapError::malformed("unexpected end-of-contents marker"));
                }
                // the marker itself counts against enclosing definite lengths
                self.check_fits(header.header_len)?;
                self.account(header.header_len)?;
                pos += header.header_len;
                if let Some(frame) = self.stack.pop() {
                    let element = Element::constructed(frame.tag, frame.children);
                    if let Some(done) = self.push_child(element) {
                        return Ok((Some(done), pos));
                    }
                }
                continue;
            }

            match header.length {
                Length::Definite(len) => {
                    let total = header.header_len + len;
                    self.check_fits(total)?;
                    if header.tag.is_constructed() {
                        self.check_depth()?;
                        self.account(header.header_len)?;
                        pos += header.header_len;
                        self.stack.push(Frame {
                            tag: header.tag,
                            declared: Some(len),
                            consumed: 0,
                            children: Vec::new(),
                        });
                    } else {
                        if rest.len() < total {
                            return Ok((None, pos));
                        }
                        let payload = Bytes::copy_from_slice(&rest[header.header_len..total]);
                        self.account(total)?;
                        pos += total;
                        let element = Element::primitive(header.tag, payload);
                        if let Some(done) = self.push_child(element) {
                            return Ok((Some(done), pos));
                        }
                    }
                }
                Length::Indefinite => {
                    if !header.tag.is_constructed() {
                        return Err(LdapError::malformed(format!(
                            "indefinite length on primitive tag {}",
                            header.tag
                        )));
                    }
                    self.check_depth()?;
                    self.check_fits(header.header_len)?;
                    self.account(header.header_len)?;
                    pos += header.header_len;
                    self.stack.push(Frame {
                        tag: header.tag,
                        declared: None,
                        consumed: 0,
                        children: Vec::new(),
                    });
                }
            }
        }
    }

    fn close_completed_frames(&mut self) -> Option<Element> {
        while self
            .stack
            .last()
            .is_some_and(|top| top.declared == Some(top.consumed))
        {
            let frame = self.stack.pop()?;
            let element = Element::constructed(frame.tag, frame.children);
            if let Some(done) = self.push_child(element) {
                return Some(done);
            }
        }
        None
    }

    fn push_child(&mut self, element: Element) -> Option<Element> {
        match self.stack.last_mut() {
            Some(parent) => {
                parent.children.push(element);
                None
            }
            None => Some(element),
        }
    }

    fn check_depth(&self) -> Result<()> {
        if self.stack.len() >= self.limits.max_depth {
            return Err(LdapError::malformed(format!(
                "nesting exceeds maximum depth of {}",
                self.limits.max_depth
            )));
        }
        Ok(())
    }

    /// An element of `size` bytes must fit inside every enclosing definite frame.
    fn check_fits(&self, size: usize) -> Result<()> {
        for frame in &self.stack {
            if let Some(declared) = frame.declared {
                if frame.consumed + size > declared {
                    return Err(LdapError::malformed(format!(
                        "child of {} bytes overruns parent {} ({} of {} bytes used)",
                        size, frame.tag, frame.consumed, declared
                    )));
                }
            }
        }
        Ok(())
    }

    fn account(&mut self, n: usize) -> Result<()> {
        for frame in &mut self.stack {
            frame.consumed += n;
        }
        if let Some(root) = self.stack.first() {
            if root.consumed > self.limits.max_element_size {
                return Err(LdapError::malformed(format!(
                    "element exceeds maximum size of {} bytes",
                    self.limits.max_element_size
                )));
            }
        }
        Ok(())
    }
}

fn parse_header(input: &[u8], limits: &DecodeLimits) -> Result<Option<Header>> {
    let Some(&tag_byte) = input.first() else {
        return Ok(None);
    };
    let tag = Tag::from_u8(tag_byte);
    if tag.uses_long_form() {
        return Err(LdapError::malformed(format!(
            "multi-byte tag 0x{:02X} is not supported",
            tag_byte
        )));
    }
    let Some(&first) = input.get(1) else {
        return Ok(None);
    };
    if first & 0x80 == 0 {
        return Ok(Some(Header {
            tag,
            length: Length::Definite(usize::from(first)),
            header_len: 2,
        }));
    }
    let count = usize::from(first & 0x7F);
    if count == 0 {
        return Ok(Some(Header {
            tag,
            length: Length::Indefinite,
            header_len: 2,
        }));
    }
    if count > 4 {
        return Err(LdapError::malformed(format!(
            "length uses {} octets, at most 4 supported",
            count
        )));
    }
    if input.len() < 2 + count {
        return Ok(None);
    }
    let mut len: usize = 0;
    for &b in &input[2..2 + count] {
        len = (len << 8) | usize::from(b);
    }
    if len > limits.max_element_size {
        return Err(LdapError::malformed(format!(
            "declared length {} exceeds maximum of {} bytes",
            len, limits.max_element_size
        )));
    }
    Ok(Some(Header {
        tag,
        length: Length::Definite(len),
        header_len: 2 + count,
    }))
}

/// Reads whole BER elements from an async byte source.
///
/// `read_element` is cancel-safe: dropping its future never loses bytes, since
/// all decode state lives in the reader.
pub struct ElementReader<R> {
    inner: R,
    decoder: StreamDecoder,
    buf: BytesMut,
}

impl<R: AsyncRead + Unpin> ElementReader<R> {
    pub fn new(inner: R, limits: DecodeLimits) -> Self {
        Self {
            inner,
            decoder: StreamDecoder::new(limits),
            buf: BytesMut::with_capacity(READ_CHUNK),
        }
    }

    /// Next complete element, or `None` on a clean end of stream between
    /// elements. End of stream inside an element is a malformed-encoding error.
    pub async fn read_element(&mut self) -> Result<Option<Element>> {
        loop {
            if !self.buf.is_empty() {
                let (element, used) = self.decoder.decode(&self.buf)?;
                self.buf.advance(used);
                if let Some(element) = element {
                    return Ok(Some(element));
                }
            }
            self.buf.reserve(READ_CHUNK);
            let n = self.inner.read_buf(&mut self.buf).await?;
            if n == 0 {
                if self.buf.is_empty() && self.decoder.is_idle() {
                    return Ok(None);
                }
                return Err(LdapError::malformed(format!(
                    "stream ended inside an element ({} bytes buffered)",
                    self.buf.len()
                )));
            }
        }
    }

    /// True when no element is partially read.
    pub fn is_idle(&self) -> bool {
        self.buf.is_empty() && self.decoder.is_idle()
    }

    pub fn get_ref(&self) -> &R {
        &self.inner
    }

    /// Give back the byte source together with any bytes read but not yet
    /// decoded.
    pub fn into_parts(self) -> (R, BytesMut) {
        (self.inner, self.buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    fn sample() -> Element {
        Element::sequence(vec![
            Element::integer(7),
            Element::constructed(
                Tag::application_constructed(0),
                vec![
                    Element::integer(3),
                    Element::string("cn=admin,dc=example,dc=com"),
                    Element::primitive(Tag::context(0), &b"secret"[..]),
                ],
            ),
        ])
    }

    #[test]
    fn test_byte_at_a_time_matches_one_shot() {
        let element = sample();
        let bytes = element.encode();
        let mut decoder = StreamDecoder::new(DecodeLimits::default());
        let mut pending = Vec::new();
        let mut result = None;
        for &b in bytes.iter() {
            pending.push(b);
            let (el, used) = decoder.decode(&pending).unwrap();
            pending.drain(..used);
            if el.is_some() {
                result = el;
            }
        }
        assert_eq!(result, Some(element));
        assert!(decoder.is_idle());
        assert!(pending.is_empty());
    }

    #[test]
    fn test_two_elements_in_one_buffer() {
        let a = Element::integer(1);
        let b = Element::string("two");
        let mut bytes = a.encode().to_vec();
        bytes.extend_from_slice(&b.encode());
        let mut decoder = StreamDecoder::new(DecodeLimits::default());
        let (first, used) = decoder.decode(&bytes).unwrap();
        assert_eq!(first, Some(a));
        let (second, used2) = decoder.decode(&bytes[used..]).unwrap();
        assert_eq!(second, Some(b));
        assert_eq!(used + used2, bytes.len());
    }

    #[test]
    fn test_primitive_waits_for_full_payload() {
        let mut decoder = StreamDecoder::new(DecodeLimits::default());
        let (el, used) = decoder.decode(&[0x04, 0x03, b'a', b'b']).unwrap();
        assert!(el.is_none());
        assert_eq!(used, 0);
    }

    #[test]
    fn test_empty_constructed_completes() {
        let mut decoder = StreamDecoder::new(DecodeLimits::default());
        let (el, used) = decoder.decode(&[0x30, 0x00]).unwrap();
        assert_eq!(el, Some(Element::sequence(vec![])));
        assert_eq!(used, 2);
    }

    #[test]
    fn test_end_of_contents_overrunning_definite_parent_rejected() {
        // definite SEQUENCE of 3 holding an indefinite SEQUENCE whose marker needs 4
        let mut decoder = StreamDecoder::new(DecodeLimits::default());
        let err = decoder
            .decode(&[0x30, 0x03, 0x30, 0x80, 0x00, 0x00])
            .unwrap_err();
        match err {
            LdapError::MalformedEncoding { reason } => assert!(reason.contains("overruns"), "{reason}"),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_indefinite_inside_definite_exact_fit() {
        let mut decoder = StreamDecoder::new(DecodeLimits::default());
        let (el, used) = decoder.decode(&[0x30, 0x04, 0x30, 0x80, 0x00, 0x00]).unwrap();
        assert_eq!(el, Some(Element::sequence(vec![Element::sequence(vec![])])));
        assert_eq!(used, 6);
    }

    #[tokio::test]
    async fn test_reader_over_split_writes() {
        let element = sample();
        let bytes = element.encode();
        let (mut client, server) = tokio::io::duplex(64);
        let writer = tokio::spawn(async move {
            for chunk in bytes.chunks(5) {
                client.write_all(chunk).await.unwrap();
                tokio::task::yield_now().await;
            }
            client.write_all(&Element::null().encode()).await.unwrap();
        });
        let mut reader = ElementReader::new(server, DecodeLimits::default());
        assert_eq!(reader.read_element().await.unwrap(), Some(element));
        assert_eq!(reader.read_element().await.unwrap(), Some(Element::null()));
        writer.await.unwrap();
        assert_eq!(reader.read_element().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_reader_eof_mid_element_is_error() {
        let (mut client, server) = tokio::io::duplex(64);
        client.write_all(&[0x30, 0x05, 0x02, 0x01]).await.unwrap();
        drop(client);
        let mut reader = ElementReader::new(server, DecodeLimits::default());
        let err = reader.read_element().await.unwrap_err();
        assert!(matches!(err, LdapError::MalformedEncoding { .. }));
    }
}
