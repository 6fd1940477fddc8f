// LDAPMessage envelope: framing and unframing of protocol operations.
//
// LDAPMessage ::= SEQUENCE { messageID INTEGER, protocolOp, controls [0] OPTIONAL }
//
// The protocol operation is carried as an opaque `Element`; typed payloads live
// in `protocol`.

use crate::ber::{DecodeLimits, Element, Tag};
use crate::error::{LdapError, Result};
use bytes::Bytes;

/// Context [0] IMPLICIT SEQUENCE OF Control
pub const LDAP_TAG_CONTROLS: Tag = Tag::context_constructed(0);

/// Largest message id the protocol allows.
pub const MAX_MESSAGE_ID: i32 = i32::MAX;

/// Control ::= SEQUENCE { controlType LDAPOID, criticality BOOLEAN DEFAULT FALSE, controlValue OCTET STRING OPTIONAL }
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Control {
    pub oid: String,
    pub critical: bool,
    pub value: Option<Bytes>,
}

impl Control {
    pub fn new(oid: impl Into<String>, critical: bool, value: Option<Bytes>) -> Self {
        Self {
            oid: oid.into(),
            critical,
            value,
        }
    }

    pub fn to_element(&self) -> Element {
        let mut children = vec![Element::string(&self.oid)];
        // DEFAULT FALSE is omitted
        if self.critical {
            children.push(Element::boolean(true));
        }
        if let Some(value) = &self.value {
            children.push(Element::octet_string(value.clone()));
        }
        Element::sequence(children)
    }

    pub fn from_element(element: &Element) -> Result<Self> {
        element.expect_tag(Tag::SEQUENCE)?;
        let children = element.as_sequence()?;
        let (oid_el, rest) = children
            .split_first()
            .ok_or_else(|| LdapError::decoding("control has no type"))?;
        let oid = oid_el.expect_tag(Tag::OCTET_STRING)?.as_str()?.to_string();
        if oid.is_empty() {
            return Err(LdapError::decoding("control type is empty"));
        }

        let mut critical = false;
        let mut value = None;
        let mut rest = rest.iter().peekable();
        if let Some(el) = rest.next_if(|el| el.tag() == Tag::BOOLEAN) {
            critical = el.as_bool()?;
        }
        if let Some(el) = rest.next_if(|el| el.tag() == Tag::OCTET_STRING) {
            value = Some(el.as_bytes()?.clone());
        }
        if let Some(extra) = rest.next() {
            return Err(LdapError::decoding(format!(
                "unexpected element {} in control {}",
                extra.tag(),
                oid
            )));
        }
        Ok(Self {
            oid,
            critical,
            value,
        })
    }
}

/// One framed protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LdapMessage {
    pub message_id: i32,
    pub protocol_op: Element,
    pub controls: Vec<Control>,
}

impl LdapMessage {
    pub fn new(message_id: i32, protocol_op: Element) -> Self {
        Self {
            message_id,
            protocol_op,
            controls: Vec::new(),
        }
    }

    pub fn with_controls(mut self, controls: Vec<Control>) -> Self {
        self.controls = controls;
        self
    }

    pub fn op_tag(&self) -> Tag {
        self.protocol_op.tag()
    }

    pub fn control(&self, oid: &str) -> Option<&Control> {
        self.controls.iter().find(|c| c.oid == oid)
    }

    pub fn to_element(&self) -> Element {
        frame(self.message_id, self.protocol_op.clone(), &self.controls)
    }

    pub fn encode(&self) -> Bytes {
        self.to_element().encode()
    }

    pub fn decode(input: &[u8], limits: &DecodeLimits) -> Result<Self> {
        let element = crate::ber::decode_exact(input, limits)?;
        unframe(element)
    }
}

/// Wrap a protocol operation in the envelope. The controls element is present
/// only when `controls` is non-empty.
pub fn frame(message_id: i32, protocol_op: Element, controls: &[Control]) -> Element {
    let mut children = vec![Element::integer(i64::from(message_id)), protocol_op];
    if !controls.is_empty() {
        children.push(Element::constructed(
            LDAP_TAG_CONTROLS,
            controls.iter().map(Control::to_element).collect(),
        ));
    }
    Element::sequence(children)
}

/// Split an envelope into its parts.
///
/// Structural problems with the envelope itself yield a `Decoding` error with
/// no message id (fatal for the connection). A bad control yields a `Decoding`
/// error carrying the message id, so only that request fails.
pub fn unframe(element: Element) -> Result<LdapMessage> {
    if element.tag() != Tag::SEQUENCE {
        return Err(LdapError::decoding(format!(
            "message envelope must be a SEQUENCE, got {}",
            element.tag()
        )));
    }
    let children = element.into_children()?;
    if children.len() < 2 || children.len() > 3 {
        return Err(LdapError::decoding(format!(
            "message envelope has {} elements, expected 2 or 3",
            children.len()
        )));
    }
    let mut children = children.into_iter();
    let (Some(id_el), Some(protocol_op)) = (children.next(), children.next()) else {
        return Err(LdapError::decoding("message envelope is incomplete"));
    };

    let message_id = parse_message_id(&id_el)?;

    let controls = match children.next() {
        None => Vec::new(),
        Some(ctrl_el) => parse_controls(&ctrl_el).map_err(|e| LdapError::Decoding {
            message_id: Some(message_id),
            reason: e.to_string(),
        })?,
    };

    Ok(LdapMessage {
        message_id,
        protocol_op,
        controls,
    })
}

fn parse_message_id(element: &Element) -> Result<i32> {
    if element.tag() != Tag::INTEGER {
        return Err(LdapError::decoding(format!(
            "message id must be an INTEGER, got {}",
            element.tag()
        )));
    }
    let raw = element
        .as_integer()
        .map_err(|e| LdapError::decoding(format!("message id: {}", e)))?;
    i32::try_from(raw)
        .ok()
        .filter(|id| *id >= 0)
        .ok_or_else(|| LdapError::decoding(format!("message id {} out of range", raw)))
}

fn parse_controls(element: &Element) -> Result<Vec<Control>> {
    if element.tag() != LDAP_TAG_CONTROLS {
        return Err(LdapError::decoding(format!(
            "expected controls tag {}, got {}",
            LDAP_TAG_CONTROLS,
            element.tag()
        )));
    }
    element
        .as_sequence()?
        .iter()
        .map(Control::from_element)
        .collect()
}
