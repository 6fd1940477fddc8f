// Typed LDAP v3 protocol operations used by the connection core.
//
// Payloads convert to and from `Element` through `ToElement` / `FromElement`,
// so the framer and the codec never need to know their shapes.

use crate::ber::{Element, Tag};
use crate::error::{LdapError, Result};
use bytes::Bytes;
use std::fmt;

pub trait ToElement {
    fn to_element(&self) -> Element;
}

pub trait FromElement: Sized {
    fn from_element(element: &Element) -> Result<Self>;
}

pub const LDAP_VERSION: i64 = 3;

pub const LDAP_TAG_BIND_REQUEST: Tag = Tag::from_u8(0x60);
pub const LDAP_TAG_BIND_RESPONSE: Tag = Tag::from_u8(0x61);
pub const LDAP_TAG_UNBIND_REQUEST: Tag = Tag::from_u8(0x42);
pub const LDAP_TAG_SEARCH_REQUEST: Tag = Tag::from_u8(0x63);
pub const LDAP_TAG_SEARCH_RESULT_ENTRY: Tag = Tag::from_u8(0x64);
pub const LDAP_TAG_SEARCH_RESULT_DONE: Tag = Tag::from_u8(0x65);
pub const LDAP_TAG_MODIFY_REQUEST: Tag = Tag::from_u8(0x66);
pub const LDAP_TAG_MODIFY_RESPONSE: Tag = Tag::from_u8(0x67);
pub const LDAP_TAG_ADD_REQUEST: Tag = Tag::from_u8(0x68);
pub const LDAP_TAG_ADD_RESPONSE: Tag = Tag::from_u8(0x69);
pub const LDAP_TAG_DEL_REQUEST: Tag = Tag::from_u8(0x4A);
pub const LDAP_TAG_DEL_RESPONSE: Tag = Tag::from_u8(0x6B);
pub const LDAP_TAG_MODIFY_DN_REQUEST: Tag = Tag::from_u8(0x6C);
pub const LDAP_TAG_MODIFY_DN_RESPONSE: Tag = Tag::from_u8(0x6D);
pub const LDAP_TAG_COMPARE_REQUEST: Tag = Tag::from_u8(0x6E);
pub const LDAP_TAG_COMPARE_RESPONSE: Tag = Tag::from_u8(0x6F);
pub const LDAP_TAG_ABANDON_REQUEST: Tag = Tag::from_u8(0x50);
pub const LDAP_TAG_SEARCH_RESULT_REFERENCE: Tag = Tag::from_u8(0x73);
pub const LDAP_TAG_EXTENDED_REQUEST: Tag = Tag::from_u8(0x77);
pub const LDAP_TAG_EXTENDED_RESPONSE: Tag = Tag::from_u8(0x78);
pub const LDAP_TAG_INTERMEDIATE_RESPONSE: Tag = Tag::from_u8(0x79);

/// RFC 4511 StartTLS extended operation
pub const START_TLS_OID: &str = "1.3.6.1.4.1.1466.20037";
/// RFC 4532 "Who am I?" extended operation
pub const WHO_AM_I_OID: &str = "1.3.6.1.4.1.4203.1.11.3";
/// RFC 3909 cancel extended operation
pub const CANCEL_OID: &str = "1.3.6.1.1.8";
/// RFC 4511 notice of disconnection (unsolicited, message id 0)
pub const NOTICE_OF_DISCONNECTION_OID: &str = "1.3.6.1.4.1.1466.20036";

/// Message id reserved for unsolicited notifications.
pub const UNSOLICITED_MESSAGE_ID: i32 = 0;

const TAG_SIMPLE_AUTH: Tag = Tag::context(0);
const TAG_SASL_AUTH: Tag = Tag::context_constructed(3);
const TAG_REFERRAL: Tag = Tag::context_constructed(3);
const TAG_SERVER_SASL_CREDS: Tag = Tag::context(7);
const TAG_EXTENDED_REQUEST_NAME: Tag = Tag::context(0);
const TAG_EXTENDED_REQUEST_VALUE: Tag = Tag::context(1);
const TAG_EXTENDED_RESPONSE_NAME: Tag = Tag::context(10);
const TAG_EXTENDED_RESPONSE_VALUE: Tag = Tag::context(11);
const TAG_INTERMEDIATE_NAME: Tag = Tag::context(0);
const TAG_INTERMEDIATE_VALUE: Tag = Tag::context(1);

/// True when a response with this tag completes its request. Search entries,
/// references and intermediate responses are followed by more messages.
pub fn is_final_response(tag: Tag) -> bool {
    tag != LDAP_TAG_SEARCH_RESULT_ENTRY
        && tag != LDAP_TAG_SEARCH_RESULT_REFERENCE
        && tag != LDAP_TAG_INTERMEDIATE_RESPONSE
}

/// Short operation name for logs and metric labels.
pub fn operation_name(tag: Tag) -> &'static str {
    match tag {
        LDAP_TAG_BIND_REQUEST | LDAP_TAG_BIND_RESPONSE => "bind",
        LDAP_TAG_UNBIND_REQUEST => "unbind",
        LDAP_TAG_SEARCH_REQUEST
        | LDAP_TAG_SEARCH_RESULT_ENTRY
        | LDAP_TAG_SEARCH_RESULT_DONE
        | LDAP_TAG_SEARCH_RESULT_REFERENCE => "search",
        LDAP_TAG_MODIFY_REQUEST | LDAP_TAG_MODIFY_RESPONSE => "modify",
        LDAP_TAG_ADD_REQUEST | LDAP_TAG_ADD_RESPONSE => "add",
        LDAP_TAG_DEL_REQUEST | LDAP_TAG_DEL_RESPONSE => "delete",
        LDAP_TAG_MODIFY_DN_REQUEST | LDAP_TAG_MODIFY_DN_RESPONSE => "modify_dn",
        LDAP_TAG_COMPARE_REQUEST | LDAP_TAG_COMPARE_RESPONSE => "compare",
        LDAP_TAG_ABANDON_REQUEST => "abandon",
        LDAP_TAG_EXTENDED_REQUEST | LDAP_TAG_EXTENDED_RESPONSE => "extended",
        LDAP_TAG_INTERMEDIATE_RESPONSE => "intermediate",
        _ => "other",
    }
}

// -----------------------------------------------------------------------------
// Result codes
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResultCode(pub i32);

impl ResultCode {
    pub const SUCCESS: ResultCode = ResultCode(0);
    pub const OPERATIONS_ERROR: ResultCode = ResultCode(1);
    pub const PROTOCOL_ERROR: ResultCode = ResultCode(2);
    pub const TIME_LIMIT_EXCEEDED: ResultCode = ResultCode(3);
    pub const COMPARE_FALSE: ResultCode = ResultCode(5);
    pub const COMPARE_TRUE: ResultCode = ResultCode(6);
    pub const AUTH_METHOD_NOT_SUPPORTED: ResultCode = ResultCode(7);
    pub const STRONGER_AUTH_REQUIRED: ResultCode = ResultCode(8);
    pub const REFERRAL: ResultCode = ResultCode(10);
    pub const SASL_BIND_IN_PROGRESS: ResultCode = ResultCode(14);
    pub const NO_SUCH_OBJECT: ResultCode = ResultCode(32);
    pub const INAPPROPRIATE_AUTHENTICATION: ResultCode = ResultCode(48);
    pub const INVALID_CREDENTIALS: ResultCode = ResultCode(49);
    pub const INSUFFICIENT_ACCESS_RIGHTS: ResultCode = ResultCode(50);
    pub const BUSY: ResultCode = ResultCode(51);
    pub const UNAVAILABLE: ResultCode = ResultCode(52);
    pub const UNWILLING_TO_PERFORM: ResultCode = ResultCode(53);
    pub const OTHER: ResultCode = ResultCode(80);
    pub const CANCELED: ResultCode = ResultCode(118);
    pub const NO_SUCH_OPERATION: ResultCode = ResultCode(119);
    pub const TOO_LATE: ResultCode = ResultCode(120);
    pub const CANNOT_CANCEL: ResultCode = ResultCode(121);

    pub fn is_success(self) -> bool {
        self == Self::SUCCESS
    }

    pub fn name(self) -> &'static str {
        match self.0 {
            0 => "success",
            1 => "operationsError",
            2 => "protocolError",
            3 => "timeLimitExceeded",
            5 => "compareFalse",
            6 => "compareTrue",
            7 => "authMethodNotSupported",
            8 => "strongerAuthRequired",
            10 => "referral",
            14 => "saslBindInProgress",
            32 => "noSuchObject",
            48 => "inappropriateAuthentication",
            49 => "invalidCredentials",
            50 => "insufficientAccessRights",
            51 => "busy",
            52 => "unavailable",
            53 => "unwillingToPerform",
            80 => "other",
            118 => "canceled",
            119 => "noSuchOperation",
            120 => "tooLate",
            121 => "cannotCancel",
            _ => "unknown",
        }
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.0, self.name())
    }
}

/// LDAPResult ::= SEQUENCE { resultCode, matchedDN, diagnosticMessage, referral [3] OPTIONAL }
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LdapResult {
    pub result_code: ResultCode,
    pub matched_dn: String,
    pub diagnostic_message: String,
    pub referrals: Vec<String>,
}

impl LdapResult {
    pub fn success() -> Self {
        Self::new(ResultCode::SUCCESS, "")
    }

    pub fn new(result_code: ResultCode, diagnostic_message: impl Into<String>) -> Self {
        Self {
            result_code,
            matched_dn: String::new(),
            diagnostic_message: diagnostic_message.into(),
            referrals: Vec::new(),
        }
    }

    /// Decode the LDAPResult components at the start of a response's children;
    /// returns the remaining children.
    pub fn parse_components(children: &[Element]) -> Result<(Self, &[Element])> {
        if children.len() < 3 {
            return Err(LdapError::decoding(format!(
                "LDAPResult needs 3 components, got {}",
                children.len()
            )));
        }
        let code = children[0].expect_tag(Tag::ENUMERATED)?.as_enumerated()?;
        let result_code = i32::try_from(code)
            .map(ResultCode)
            .map_err(|_| LdapError::decoding(format!("result code {} out of range", code)))?;
        let matched_dn = children[1].expect_tag(Tag::OCTET_STRING)?.as_str()?.to_string();
        let diagnostic_message = children[2].expect_tag(Tag::OCTET_STRING)?.as_str()?.to_string();
        let mut rest = &children[3..];
        let mut referrals = Vec::new();
        if let Some(first) = rest.first() {
            if first.tag() == TAG_REFERRAL {
                for uri in first.as_sequence()? {
                    referrals.push(uri.as_str()?.to_string());
                }
                rest = &rest[1..];
            }
        }
        Ok((
            Self {
                result_code,
                matched_dn,
                diagnostic_message,
                referrals,
            },
            rest,
        ))
    }

    /// The LDAPResult of any response operation that starts with one.
    pub fn from_response(element: &Element) -> Result<Self> {
        Self::parse_components(element.as_sequence()?).map(|(result, _)| result)
    }

    fn components(&self) -> Vec<Element> {
        let mut children = vec![
            Element::enumerated(i64::from(self.result_code.0)),
            Element::string(&self.matched_dn),
            Element::string(&self.diagnostic_message),
        ];
        if !self.referrals.is_empty() {
            children.push(Element::constructed(
                TAG_REFERRAL,
                self.referrals.iter().map(|r| Element::string(r)).collect(),
            ));
        }
        children
    }

    /// A response operation consisting only of this result.
    pub fn to_response(&self, tag: Tag) -> Element {
        Element::constructed(tag, self.components())
    }
}

// -----------------------------------------------------------------------------
// Bind
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindAuthentication {
    Simple(Bytes),
    Sasl {
        mechanism: String,
        credentials: Option<Bytes>,
    },
}

/// BindRequest ::= [APPLICATION 0] SEQUENCE { version, name, authentication }
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindRequest {
    pub version: i64,
    pub name: String,
    pub authentication: BindAuthentication,
}

impl BindRequest {
    pub fn simple(name: impl Into<String>, password: impl Into<Bytes>) -> Self {
        Self {
            version: LDAP_VERSION,
            name: name.into(),
            authentication: BindAuthentication::Simple(password.into()),
        }
    }

    pub fn sasl(name: impl Into<String>, mechanism: impl Into<String>, credentials: Option<Bytes>) -> Self {
        Self {
            version: LDAP_VERSION,
            name: name.into(),
            authentication: BindAuthentication::Sasl {
                mechanism: mechanism.into(),
                credentials,
            },
        }
    }

    pub fn mechanism_name(&self) -> &str {
        match &self.authentication {
            BindAuthentication::Simple(_) => "SIMPLE",
            BindAuthentication::Sasl { mechanism, .. } => mechanism,
        }
    }
}

impl ToElement for BindRequest {
    fn to_element(&self) -> Element {
        let auth = match &self.authentication {
            BindAuthentication::Simple(password) => {
                Element::primitive(TAG_SIMPLE_AUTH, password.clone())
            }
            BindAuthentication::Sasl {
                mechanism,
                credentials,
            } => {
                let mut children = vec![Element::string(mechanism)];
                if let Some(creds) = credentials {
                    children.push(Element::octet_string(creds.clone()));
                }
                Element::constructed(TAG_SASL_AUTH, children)
            }
        };
        Element::constructed(
            LDAP_TAG_BIND_REQUEST,
            vec![Element::integer(self.version), Element::string(&self.name), auth],
        )
    }
}

impl FromElement for BindRequest {
    fn from_element(element: &Element) -> Result<Self> {
        element.expect_tag(LDAP_TAG_BIND_REQUEST)?;
        let children = element.as_sequence()?;
        let [version, name, auth] = children else {
            return Err(LdapError::decoding("bind request must have 3 components"));
        };
        let version = version.expect_tag(Tag::INTEGER)?.as_integer()?;
        let name = name.expect_tag(Tag::OCTET_STRING)?.as_str()?.to_string();
        let authentication = match auth.tag() {
            TAG_SIMPLE_AUTH => BindAuthentication::Simple(auth.as_bytes()?.clone()),
            TAG_SASL_AUTH => {
                let parts = auth.as_sequence()?;
                let mechanism = parts
                    .first()
                    .ok_or_else(|| LdapError::decoding("SASL credentials without mechanism"))?
                    .as_str()?
                    .to_string();
                let credentials = parts.get(1).map(|c| c.as_bytes().cloned()).transpose()?;
                BindAuthentication::Sasl {
                    mechanism,
                    credentials,
                }
            }
            other => {
                return Err(LdapError::decoding(format!(
                    "unsupported bind authentication tag {}",
                    other
                )))
            }
        };
        Ok(Self {
            version,
            name,
            authentication,
        })
    }
}

/// BindResponse ::= [APPLICATION 1] SEQUENCE { COMPONENTS OF LDAPResult, serverSaslCreds [7] OPTIONAL }
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindResponse {
    pub result: LdapResult,
    pub server_sasl_creds: Option<Bytes>,
}

impl ToElement for BindResponse {
    fn to_element(&self) -> Element {
        let mut children = self.result.components();
        if let Some(creds) = &self.server_sasl_creds {
            children.push(Element::primitive(TAG_SERVER_SASL_CREDS, creds.clone()));
        }
        Element::constructed(LDAP_TAG_BIND_RESPONSE, children)
    }
}

impl FromElement for BindResponse {
    fn from_element(element: &Element) -> Result<Self> {
        element.expect_tag(LDAP_TAG_BIND_RESPONSE)?;
        let (result, rest) = LdapResult::parse_components(element.as_sequence()?)?;
        let server_sasl_creds = rest
            .iter()
            .find(|el| el.tag() == TAG_SERVER_SASL_CREDS)
            .map(|el| el.as_bytes().cloned())
            .transpose()?;
        Ok(Self {
            result,
            server_sasl_creds,
        })
    }
}

// -----------------------------------------------------------------------------
// Unbind / Abandon
// -----------------------------------------------------------------------------

/// UnbindRequest ::= [APPLICATION 2] NULL
pub fn unbind_request() -> Element {
    Element::primitive(LDAP_TAG_UNBIND_REQUEST, Bytes::new())
}

/// AbandonRequest ::= [APPLICATION 16] MessageID
pub fn abandon_request(message_id: i32) -> Element {
    Element::integer(i64::from(message_id)).with_tag(LDAP_TAG_ABANDON_REQUEST)
}

// -----------------------------------------------------------------------------
// Extended operations
// -----------------------------------------------------------------------------

/// ExtendedRequest ::= [APPLICATION 23] SEQUENCE { requestName [0], requestValue [1] OPTIONAL }
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtendedRequest {
    pub oid: String,
    pub value: Option<Bytes>,
}

impl ExtendedRequest {
    pub fn new(oid: impl Into<String>, value: Option<Bytes>) -> Self {
        Self {
            oid: oid.into(),
            value,
        }
    }

    pub fn start_tls() -> Self {
        Self::new(START_TLS_OID, None)
    }

    pub fn who_am_i() -> Self {
        Self::new(WHO_AM_I_OID, None)
    }

    /// cancelRequestValue ::= SEQUENCE { cancelID MessageID }
    pub fn cancel(message_id: i32) -> Self {
        let value = Element::sequence(vec![Element::integer(i64::from(message_id))]).encode();
        Self::new(CANCEL_OID, Some(value))
    }
}

impl ToElement for ExtendedRequest {
    fn to_element(&self) -> Element {
        let mut children = vec![Element::primitive(
            TAG_EXTENDED_REQUEST_NAME,
            Bytes::copy_from_slice(self.oid.as_bytes()),
        )];
        if let Some(value) = &self.value {
            children.push(Element::primitive(TAG_EXTENDED_REQUEST_VALUE, value.clone()));
        }
        Element::constructed(LDAP_TAG_EXTENDED_REQUEST, children)
    }
}

impl FromElement for ExtendedRequest {
    fn from_element(element: &Element) -> Result<Self> {
        element.expect_tag(LDAP_TAG_EXTENDED_REQUEST)?;
        let children = element.as_sequence()?;
        let oid = children
            .first()
            .ok_or_else(|| LdapError::decoding("extended request without name"))?
            .expect_tag(TAG_EXTENDED_REQUEST_NAME)?
            .as_str()?
            .to_string();
        let value = children
            .get(1)
            .map(|v| v.expect_tag(TAG_EXTENDED_REQUEST_VALUE)?.as_bytes().cloned())
            .transpose()?;
        Ok(Self { oid, value })
    }
}

/// ExtendedResponse ::= [APPLICATION 24] SEQUENCE { COMPONENTS OF LDAPResult, responseName [10] OPTIONAL, responseValue [11] OPTIONAL }
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtendedResponse {
    pub result: LdapResult,
    pub oid: Option<String>,
    pub value: Option<Bytes>,
}

impl ExtendedResponse {
    /// Authorization identity carried by a "Who am I?" response.
    pub fn authz_id(&self) -> Option<String> {
        self.value
            .as_ref()
            .map(|v| String::from_utf8_lossy(v).into_owned())
    }
}

impl ToElement for ExtendedResponse {
    fn to_element(&self) -> Element {
        let mut children = self.result.components();
        if let Some(oid) = &self.oid {
            children.push(Element::primitive(
                TAG_EXTENDED_RESPONSE_NAME,
                Bytes::copy_from_slice(oid.as_bytes()),
            ));
        }
        if let Some(value) = &self.value {
            children.push(Element::primitive(TAG_EXTENDED_RESPONSE_VALUE, value.clone()));
        }
        Element::constructed(LDAP_TAG_EXTENDED_RESPONSE, children)
    }
}

impl FromElement for ExtendedResponse {
    fn from_element(element: &Element) -> Result<Self> {
        element.expect_tag(LDAP_TAG_EXTENDED_RESPONSE)?;
        let (result, rest) = LdapResult::parse_components(element.as_sequence()?)?;
        let mut oid = None;
        let mut value = None;
        for el in rest {
            match el.tag() {
                TAG_EXTENDED_RESPONSE_NAME => oid = Some(el.as_str()?.to_string()),
                TAG_EXTENDED_RESPONSE_VALUE => value = Some(el.as_bytes()?.clone()),
                other => {
                    return Err(LdapError::decoding(format!(
                        "unexpected element {} in extended response",
                        other
                    )))
                }
            }
        }
        Ok(Self { result, oid, value })
    }
}

/// IntermediateResponse ::= [APPLICATION 25] SEQUENCE { responseName [0] OPTIONAL, responseValue [1] OPTIONAL }
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct IntermediateResponse {
    pub oid: Option<String>,
    pub value: Option<Bytes>,
}

impl ToElement for IntermediateResponse {
    fn to_element(&self) -> Element {
        let mut children = Vec::new();
        if let Some(oid) = &self.oid {
            children.push(Element::primitive(
                TAG_INTERMEDIATE_NAME,
                Bytes::copy_from_slice(oid.as_bytes()),
            ));
        }
        if let Some(value) = &self.value {
            children.push(Element::primitive(TAG_INTERMEDIATE_VALUE, value.clone()));
        }
        Element::constructed(LDAP_TAG_INTERMEDIATE_RESPONSE, children)
    }
}

impl FromElement for IntermediateResponse {
    fn from_element(element: &Element) -> Result<Self> {
        element.expect_tag(LDAP_TAG_INTERMEDIATE_RESPONSE)?;
        let mut response = Self::default();
        for el in element.as_sequence()? {
            match el.tag() {
                TAG_INTERMEDIATE_NAME => response.oid = Some(el.as_str()?.to_string()),
                TAG_INTERMEDIATE_VALUE => response.value = Some(el.as_bytes()?.clone()),
                other => {
                    return Err(LdapError::decoding(format!(
                        "unexpected element {} in intermediate response",
                        other
                    )))
                }
            }
        }
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simple_bind_request_encoding() {
        let req = BindRequest::simple("cn=admin", Bytes::from_static(b"pw"));
        let bytes = req.to_element().encode();
        assert_eq!(
            bytes.as_ref(),
            &[
                0x60, 0x11, 0x02, 0x01, 0x03, 0x04, 0x08, b'c', b'n', b'=', b'a', b'd', b'm', b'i',
                b'n', 0x80, 0x02, b'p', b'w'
            ]
        );
        assert_eq!(BindRequest::from_element(&req.to_element()).unwrap(), req);
    }

    #[test]
    fn test_sasl_bind_request_shape() {
        let req = BindRequest::sasl("", "PLAIN", Some(Bytes::from_static(b"\0u\0p")));
        let element = req.to_element();
        let auth = &element.as_sequence().unwrap()[2];
        assert_eq!(auth.tag(), Tag::from_u8(0xA3));
        assert_eq!(auth.as_sequence().unwrap().len(), 2);
        assert_eq!(BindRequest::from_element(&element).unwrap(), req);
        assert_eq!(req.mechanism_name(), "PLAIN");
    }

    #[test]
    fn test_bind_response_with_server_creds() {
        let resp = BindResponse {
            result: LdapResult::new(ResultCode::SASL_BIND_IN_PROGRESS, ""),
            server_sasl_creds: Some(Bytes::from_static(b"challenge")),
        };
        let element = resp.to_element();
        assert_eq!(element.as_sequence().unwrap()[3].tag(), Tag::from_u8(0x87));
        let parsed = BindResponse::from_element(&element).unwrap();
        assert_eq!(parsed, resp);
    }

    #[test]
    fn test_ldap_result_with_referrals() {
        let mut result = LdapResult::new(ResultCode::REFERRAL, "see elsewhere");
        result.referrals = vec!["ldap://other:389/dc=example".to_string()];
        let element = result.to_response(LDAP_TAG_SEARCH_RESULT_DONE);
        assert_eq!(LdapResult::from_response(&element).unwrap(), result);
    }

    #[test]
    fn test_ldap_result_requires_three_components() {
        let element = Element::constructed(LDAP_TAG_BIND_RESPONSE, vec![Element::enumerated(0)]);
        assert!(BindResponse::from_element(&element).is_err());
    }

    #[test]
    fn test_cancel_request_value() {
        let req = ExtendedRequest::cancel(5);
        assert_eq!(req.oid, CANCEL_OID);
        assert_eq!(req.value.as_deref(), Some(&[0x30, 0x03, 0x02, 0x01, 0x05][..]));
    }

    #[test]
    fn test_start_tls_request_encoding() {
        let bytes = ExtendedRequest::start_tls().to_element().encode();
        assert_eq!(bytes[0], 0x77);
        assert_eq!(bytes[2], 0x80);
        assert_eq!(&bytes[4..], START_TLS_OID.as_bytes());
    }

    #[test]
    fn test_extended_response_parse() {
        let resp = ExtendedResponse {
            result: LdapResult::success(),
            oid: Some(WHO_AM_I_OID.to_string()),
            value: Some(Bytes::from_static(b"dn:cn=admin")),
        };
        let parsed = ExtendedResponse::from_element(&resp.to_element()).unwrap();
        assert_eq!(parsed.authz_id().as_deref(), Some("dn:cn=admin"));
        assert_eq!(parsed, resp);
    }

    #[test]
    fn test_intermediate_response_parse() {
        let resp = IntermediateResponse {
            oid: Some("1.3.6.1.4.1.4203.1.9.1.4".to_string()),
            value: None,
        };
        let element = resp.to_element();
        assert_eq!(element.tag(), LDAP_TAG_INTERMEDIATE_RESPONSE);
        assert_eq!(IntermediateResponse::from_element(&element).unwrap(), resp);
    }

    #[test]
    fn test_abandon_and_unbind_are_primitive() {
        assert_eq!(abandon_request(7).encode().as_ref(), &[0x50, 0x01, 0x07]);
        assert_eq!(unbind_request().encode().as_ref(), &[0x42, 0x00]);
    }

    #[test]
    fn test_final_response_tags() {
        assert!(is_final_response(LDAP_TAG_BIND_RESPONSE));
        assert!(is_final_response(LDAP_TAG_SEARCH_RESULT_DONE));
        assert!(!is_final_response(LDAP_TAG_SEARCH_RESULT_ENTRY));
        assert!(!is_final_response(LDAP_TAG_SEARCH_RESULT_REFERENCE));
        assert!(!is_final_response(LDAP_TAG_INTERMEDIATE_RESPONSE));
        assert_eq!(operation_name(LDAP_TAG_DEL_RESPONSE), "delete");
    }
}
