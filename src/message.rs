//! Typed LDAP message model.
//!
//! [`Message::decode`] turns one BER [`Packet`] into a typed request
//! variant by dispatching on the protocolOp application tag (RFC 4511):
//! bind (0), search (3), modify (6), add (8), extended (23). Anything else
//! is [`Error::UnsupportedOperation`]. The response direction lives in
//! [`crate::response`]; the result-parsing helpers at the bottom of this
//! module exist so test harnesses can assert on emitted PDUs.

use std::collections::HashMap;
use std::fmt;

use crate::ber::{BerReader, Packet};
use crate::error::{Error, Result};

// Application tags for the protocolOp CHOICE (constructed, class APPLICATION).
pub const APP_BIND_REQUEST: u8 = 0x60;
pub const APP_BIND_RESPONSE: u8 = 0x61;
pub const APP_UNBIND_REQUEST: u8 = 0x42;
pub const APP_SEARCH_REQUEST: u8 = 0x63;
pub const APP_SEARCH_RESULT_ENTRY: u8 = 0x64;
pub const APP_SEARCH_RESULT_DONE: u8 = 0x65;
pub const APP_MODIFY_REQUEST: u8 = 0x66;
pub const APP_MODIFY_RESPONSE: u8 = 0x67;
pub const APP_ADD_REQUEST: u8 = 0x68;
pub const APP_ADD_RESPONSE: u8 = 0x69;
pub const APP_ABANDON_REQUEST: u8 = 0x50;
pub const APP_EXTENDED_REQUEST: u8 = 0x77;
pub const APP_EXTENDED_RESPONSE: u8 = 0x78;

/// Application tag *numbers* (low five bits) used when building responses.
pub(crate) const APP_CODE_BIND_RESPONSE: u8 = 1;
pub(crate) const APP_CODE_SEARCH_RESULT_DONE: u8 = 5;
pub(crate) const APP_CODE_MODIFY_RESPONSE: u8 = 7;
pub(crate) const APP_CODE_ADD_RESPONSE: u8 = 9;
pub(crate) const APP_CODE_EXTENDED_RESPONSE: u8 = 24;

/// Search scope (RFC 4511 SearchRequest.scope).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    BaseObject = 0,
    SingleLevel = 1,
    WholeSubtree = 2,
}

impl TryFrom<u8> for Scope {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Scope::BaseObject),
            1 => Ok(Scope::SingleLevel),
            2 => Ok(Scope::WholeSubtree),
            other => Err(Error::protocol(format!("invalid search scope: {}", other))),
        }
    }
}

/// Authentication choice inside a BindRequest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthChoice {
    Simple,
    Sasl,
}

/// One attribute with its values. Values are raw octets; LDAP does not
/// promise UTF-8 for attribute values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    pub name: String,
    pub values: Vec<Vec<u8>>,
}

impl Attribute {
    pub fn new(name: impl Into<String>, values: Vec<Vec<u8>>) -> Self {
        Attribute {
            name: name.into(),
            values,
        }
    }

    /// Values as strings, lossy on non-UTF-8 octets.
    pub fn string_values(&self) -> Vec<String> {
        self.values
            .iter()
            .map(|v| String::from_utf8_lossy(v).into_owned())
            .collect()
    }
}

/// Search filter (RFC 4511 Filter CHOICE). The canonical string form via
/// [`fmt::Display`] is what route predicates compare against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
    EqualityMatch { attribute: String, value: Vec<u8> },
    Substrings { attribute: String, substrings: Vec<SubstringItem> },
    GreaterOrEqual { attribute: String, value: Vec<u8> },
    LessOrEqual { attribute: String, value: Vec<u8> },
    Present(String),
    ApproxMatch { attribute: String, value: Vec<u8> },
    ExtensibleMatch {
        matching_rule: Option<String>,
        attribute: Option<String>,
        value: Vec<u8>,
        dn_attributes: bool,
    },
    /// Unknown filter choice kept as (tag, raw contents).
    Raw(u8, Vec<u8>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubstringItem {
    Initial(Vec<u8>),
    Any(Vec<u8>),
    Final(Vec<u8>),
}

fn escape_assertion(value: &[u8]) -> String {
    String::from_utf8_lossy(value)
        .replace('\\', "\\5c")
        .replace('*', "\\2a")
        .replace('(', "\\28")
        .replace(')', "\\29")
        .replace('\x00', "\\00")
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Filter::And(items) => {
                write!(f, "(&")?;
                for item in items {
                    write!(f, "{}", item)?;
                }
                write!(f, ")")
            }
            Filter::Or(items) => {
                write!(f, "(|")?;
                for item in items {
                    write!(f, "{}", item)?;
                }
                write!(f, ")")
            }
            Filter::Not(inner) => write!(f, "(!{})", inner),
            Filter::EqualityMatch { attribute, value } => {
                write!(f, "({}={})", attribute, escape_assertion(value))
            }
            Filter::Present(attribute) => write!(f, "({}=*)", attribute),
            Filter::Substrings { attribute, substrings } => {
                write!(f, "({}=", attribute)?;
                let mut wrote_initial = false;
                for item in substrings {
                    match item {
                        SubstringItem::Initial(v) => {
                            write!(f, "{}", escape_assertion(v))?;
                            wrote_initial = true;
                        }
                        SubstringItem::Any(v) => {
                            write!(f, "*{}", escape_assertion(v))?;
                        }
                        SubstringItem::Final(v) => {
                            write!(f, "*{}", escape_assertion(v))?;
                            wrote_initial = true;
                        }
                    }
                }
                if !wrote_initial && substrings.is_empty() {
                    write!(f, "*")?;
                }
                write!(f, ")")
            }
            Filter::GreaterOrEqual { attribute, value } => {
                write!(f, "({}>={})", attribute, escape_assertion(value))
            }
            Filter::LessOrEqual { attribute, value } => {
                write!(f, "({}<={})", attribute, escape_assertion(value))
            }
            Filter::ApproxMatch { attribute, value } => {
                write!(f, "({}~={})", attribute, escape_assertion(value))
            }
            Filter::ExtensibleMatch {
                matching_rule,
                attribute,
                value,
                dn_attributes,
            } => {
                write!(f, "(")?;
                if let Some(attr) = attribute {
                    write!(f, "{}", attr)?;
                }
                if *dn_attributes {
                    write!(f, ":dn")?;
                }
                if let Some(rule) = matching_rule {
                    write!(f, ":{}", rule)?;
                }
                write!(f, ":={})", escape_assertion(value))
            }
            Filter::Raw(_, _) => write!(f, "(objectClass=*)"),
        }
    }
}

/// Simple or SASL bind. SASL mechanism and credentials are carried
/// passively; the framework never interprets them.
#[derive(Debug, Clone)]
pub struct SimpleBindMessage {
    pub message_id: i32,
    pub version: i32,
    pub auth_choice: AuthChoice,
    pub user_name: String,
    pub password: String,
    pub sasl_mechanism: Option<String>,
    pub sasl_credentials: Option<Vec<u8>>,
}

#[derive(Debug, Clone)]
pub struct SearchMessage {
    pub message_id: i32,
    pub base_dn: String,
    pub scope: Scope,
    pub deref_aliases: i32,
    pub size_limit: i32,
    pub time_limit: i32,
    pub types_only: bool,
    pub filter: Filter,
    pub attributes: Vec<String>,
}

impl SearchMessage {
    /// Canonical string form of the filter, e.g. `(cn=admin)`.
    pub fn filter_string(&self) -> String {
        self.filter.to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModifyOperation {
    Add = 0,
    Delete = 1,
    Replace = 2,
}

#[derive(Debug, Clone)]
pub struct ModifyChange {
    pub operation: ModifyOperation,
    pub modification: Attribute,
}

#[derive(Debug, Clone)]
pub struct ModifyMessage {
    pub message_id: i32,
    pub dn: String,
    pub changes: Vec<ModifyChange>,
}

#[derive(Debug, Clone)]
pub struct AddMessage {
    pub message_id: i32,
    pub dn: String,
    pub attributes: Vec<Attribute>,
}

#[derive(Debug, Clone)]
pub struct ExtendedOperationMessage {
    pub message_id: i32,
    /// The requestName OID, e.g. `1.3.6.1.4.1.1466.20037` for StartTLS.
    pub name: String,
    pub value: Option<Vec<u8>>,
}

/// One decoded inbound request.
#[derive(Debug, Clone)]
pub enum Message {
    SimpleBind(SimpleBindMessage),
    Search(SearchMessage),
    Modify(ModifyMessage),
    Add(AddMessage),
    Extended(ExtendedOperationMessage),
}

impl Message {
    /// The LDAP messageID this request arrived with.
    pub fn id(&self) -> i32 {
        match self {
            Message::SimpleBind(m) => m.message_id,
            Message::Search(m) => m.message_id,
            Message::Modify(m) => m.message_id,
            Message::Add(m) => m.message_id,
            Message::Extended(m) => m.message_id,
        }
    }

    /// Decode the protocolOp of `packet` into a typed message.
    pub fn decode(packet: &Packet) -> Result<Message> {
        let mut reader = BerReader::new(packet.bytes());
        let _envelope_len = reader.read_sequence()?;
        let message_id = reader.read_integer()?;
        let tag = reader.read_tag()?;
        match tag {
            APP_BIND_REQUEST => parse_bind(&mut reader, message_id),
            APP_SEARCH_REQUEST => parse_search(&mut reader, message_id),
            APP_MODIFY_REQUEST => parse_modify(&mut reader, message_id),
            APP_ADD_REQUEST => parse_add(&mut reader, message_id),
            APP_EXTENDED_REQUEST => parse_extended(&mut reader, message_id),
            other => Err(Error::UnsupportedOperation(other)),
        }
    }
}

fn parse_bind(reader: &mut BerReader, message_id: i32) -> Result<Message> {
    let _len = reader.read_length()?;
    let version = reader.read_integer()?;
    let user_name = reader.read_string()?;

    // RFC 4511 says simple is [0] IMPLICIT OCTET STRING (0x80), but clients
    // send a spread of tags; anything that is not SASL ([3], 0xA3) is
    // treated as a simple password.
    let auth_tag = reader.read_tag()?;
    if auth_tag == 0xA3 {
        let sasl_len = reader.read_length()?;
        let sasl_end = reader.position() + sasl_len;
        let mechanism = reader.read_string()?;
        let credentials = if reader.position() < sasl_end {
            reader.read_octet_string().ok()
        } else {
            None
        };
        return Ok(Message::SimpleBind(SimpleBindMessage {
            message_id,
            version,
            auth_choice: AuthChoice::Sasl,
            user_name,
            password: String::new(),
            sasl_mechanism: Some(mechanism),
            sasl_credentials: credentials,
        }));
    }
    let password_bytes = reader.read_octet_string_value()?;
    let password = String::from_utf8(password_bytes)
        .map_err(|_| Error::protocol("bind password is not valid UTF-8"))?;
    Ok(Message::SimpleBind(SimpleBindMessage {
        message_id,
        version,
        auth_choice: AuthChoice::Simple,
        user_name,
        password,
        sasl_mechanism: None,
        sasl_credentials: None,
    }))
}

fn parse_search(reader: &mut BerReader, message_id: i32) -> Result<Message> {
    let _len = reader.read_length()?;
    let base_dn = reader.read_string()?;
    let scope = Scope::try_from(reader.read_enumerated()?)?;
    let deref_aliases = reader.read_enumerated()? as i32;
    let size_limit = reader.read_integer()?;
    let time_limit = reader.read_integer()?;
    let types_only = reader.read_boolean()?;
    let filter = parse_filter(reader)?;

    let attrs_len = reader.read_sequence()?;
    let attrs_end = reader.position() + attrs_len;
    let mut attributes = Vec::new();
    while reader.position() < attrs_end {
        attributes.push(reader.read_string()?);
    }

    Ok(Message::Search(SearchMessage {
        message_id,
        base_dn,
        scope,
        deref_aliases,
        size_limit,
        time_limit,
        types_only,
        filter,
        attributes,
    }))
}

/// Filter CHOICE tags: [0] and, [1] or, [2] not, [3] equalityMatch,
/// [4] substrings, [5] greaterOrEqual, [6] lessOrEqual, [7] present,
/// [8] approxMatch, [9] extensibleMatch.
fn parse_filter(reader: &mut BerReader) -> Result<Filter> {
    let tag = reader.read_tag()?;
    let len = reader.read_length()?;
    let content = reader.read_raw(len)?;
    parse_filter_content(tag, &content)
}

fn parse_filter_content(tag: u8, content: &[u8]) -> Result<Filter> {
    let mut sub = BerReader::new(content);
    match tag {
        0xA0 | 0x80 => {
            let mut items = Vec::new();
            while sub.remaining() > 0 {
                items.push(parse_filter(&mut sub)?);
            }
            Ok(Filter::And(items))
        }
        0xA1 | 0x81 => {
            let mut items = Vec::new();
            while sub.remaining() > 0 {
                items.push(parse_filter(&mut sub)?);
            }
            Ok(Filter::Or(items))
        }
        0xA2 | 0x82 => Ok(Filter::Not(Box::new(parse_filter(&mut sub)?))),
        0xA3 => {
            let attribute = sub.read_string()?;
            let value = sub.read_octet_string()?;
            Ok(Filter::EqualityMatch { attribute, value })
        }
        0xA4 => {
            let attribute = sub.read_string()?;
            let _seq_len = sub.read_sequence()?;
            let mut substrings = Vec::new();
            while sub.remaining() > 0 {
                let item_tag = sub.read_tag()?;
                let value = sub.read_octet_string_value()?;
                let item = match item_tag {
                    0x80 => SubstringItem::Initial(value),
                    0x81 => SubstringItem::Any(value),
                    0x82 => SubstringItem::Final(value),
                    _ => continue,
                };
                substrings.push(item);
            }
            Ok(Filter::Substrings { attribute, substrings })
        }
        0xA5 => {
            let attribute = sub.read_string()?;
            let value = sub.read_octet_string()?;
            Ok(Filter::GreaterOrEqual { attribute, value })
        }
        0xA6 => {
            let attribute = sub.read_string()?;
            let value = sub.read_octet_string()?;
            Ok(Filter::LessOrEqual { attribute, value })
        }
        0x87 => {
            // present [7] IMPLICIT AttributeDescription: content is the raw name
            let attribute = if !content.is_empty() && content[0] == 0x04 {
                sub.read_string()?
            } else {
                String::from_utf8_lossy(content).into_owned()
            };
            Ok(Filter::Present(attribute))
        }
        0xA8 => {
            let attribute = sub.read_string()?;
            let value = sub.read_octet_string()?;
            Ok(Filter::ApproxMatch { attribute, value })
        }
        0xA9 => {
            let mut matching_rule = None;
            let mut attribute = None;
            let mut value = Vec::new();
            let mut dn_attributes = false;
            while sub.remaining() > 0 {
                let item_tag = sub.read_tag()?;
                match item_tag {
                    0x81 => matching_rule = Some(String::from_utf8_lossy(&sub.read_octet_string_value()?).into_owned()),
                    0x82 => attribute = Some(String::from_utf8_lossy(&sub.read_octet_string_value()?).into_owned()),
                    0x83 => value = sub.read_octet_string_value()?,
                    0x84 => {
                        let bytes = sub.read_octet_string_value()?;
                        dn_attributes = bytes.first().copied().unwrap_or(0) != 0;
                    }
                    _ => {
                        let _ = sub.read_octet_string_value()?;
                    }
                }
            }
            Ok(Filter::ExtensibleMatch {
                matching_rule,
                attribute,
                value,
                dn_attributes,
            })
        }
        other => Ok(Filter::Raw(other, content.to_vec())),
    }
}

fn parse_attribute(reader: &mut BerReader) -> Result<Attribute> {
    let _attr_len = reader.read_sequence()?;
    let name = reader.read_string()?;
    // vals is SET OF (0x31); some encoders emit SEQUENCE
    let set_tag = reader.read_tag()?;
    if set_tag != 0x31 && set_tag != 0x30 {
        return Err(Error::protocol(format!(
            "expected SET of attribute values, got 0x{:02X}",
            set_tag
        )));
    }
    let set_len = reader.read_length()?;
    let values_end = reader.position() + set_len;
    let mut values = Vec::new();
    while reader.position() < values_end {
        values.push(reader.read_octet_string()?);
    }
    Ok(Attribute { name, values })
}

fn parse_modify(reader: &mut BerReader, message_id: i32) -> Result<Message> {
    let _len = reader.read_length()?;
    let dn = reader.read_string()?;
    let changes_len = reader.read_sequence()?;
    let changes_end = reader.position() + changes_len;
    let mut changes = Vec::new();
    while reader.position() < changes_end {
        let _change_len = reader.read_sequence()?;
        let operation = match reader.read_enumerated()? {
            0 => ModifyOperation::Add,
            1 => ModifyOperation::Delete,
            2 => ModifyOperation::Replace,
            other => return Err(Error::protocol(format!("invalid modify operation: {}", other))),
        };
        let modification = parse_attribute(reader)?;
        changes.push(ModifyChange {
            operation,
            modification,
        });
    }
    Ok(Message::Modify(ModifyMessage {
        message_id,
        dn,
        changes,
    }))
}

fn parse_add(reader: &mut BerReader, message_id: i32) -> Result<Message> {
    let _len = reader.read_length()?;
    let dn = reader.read_string()?;
    let attrs_len = reader.read_sequence()?;
    let attrs_end = reader.position() + attrs_len;
    let mut attributes = Vec::new();
    while reader.position() < attrs_end {
        attributes.push(parse_attribute(reader)?);
    }
    Ok(Message::Add(AddMessage {
        message_id,
        dn,
        attributes,
    }))
}

fn parse_extended(reader: &mut BerReader, message_id: i32) -> Result<Message> {
    let len = reader.read_length()?;
    let op_end = reader.position() + len;
    // requestName [0] IMPLICIT LDAPOID
    let name_tag = reader.read_tag()?;
    if name_tag != 0x80 {
        return Err(Error::protocol(format!(
            "expected extended requestName [0], got 0x{:02X}",
            name_tag
        )));
    }
    let name_bytes = reader.read_octet_string_value()?;
    let name = String::from_utf8(name_bytes)
        .map_err(|_| Error::protocol("extended requestName is not valid UTF-8"))?;
    // requestValue [1] IMPLICIT OCTET STRING OPTIONAL
    let value = if reader.position() < op_end {
        let _value_tag = reader.read_tag()?;
        Some(reader.read_octet_string_value()?)
    } else {
        None
    };
    Ok(Message::Extended(ExtendedOperationMessage {
        message_id,
        name,
        value,
    }))
}

/// The LDAPResult fields of a response PDU, decoded back out of the wire
/// form. Intended for test clients built on this crate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LdapResult {
    pub message_id: i32,
    pub application_tag: u8,
    pub code: i16,
    pub matched_dn: String,
    pub diagnostic_message: String,
}

/// Decode the LDAPResult body of a response packet (bind/search-done/
/// modify/add/extended responses all share the shape).
pub fn parse_result(packet: &Packet) -> Result<LdapResult> {
    let mut reader = BerReader::new(packet.bytes());
    let _envelope_len = reader.read_sequence()?;
    let message_id = reader.read_integer()?;
    let application_tag = reader.read_tag()?;
    let _len = reader.read_length()?;
    let code = reader.read_enumerated()? as i16;
    let matched_dn = reader.read_string()?;
    let diagnostic_message = reader.read_string()?;
    Ok(LdapResult {
        message_id,
        application_tag,
        code,
        matched_dn,
        diagnostic_message,
    })
}

/// One decoded SearchResultEntry PDU.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchEntry {
    pub message_id: i32,
    pub dn: String,
    pub attributes: Vec<Attribute>,
}

/// Decode a SearchResultEntry packet.
pub fn parse_search_entry(packet: &Packet) -> Result<SearchEntry> {
    let mut reader = BerReader::new(packet.bytes());
    let _envelope_len = reader.read_sequence()?;
    let message_id = reader.read_integer()?;
    let tag = reader.read_tag()?;
    if tag != APP_SEARCH_RESULT_ENTRY {
        return Err(Error::protocol(format!(
            "expected SearchResultEntry (0x64), got 0x{:02X}",
            tag
        )));
    }
    let _len = reader.read_length()?;
    let dn = reader.read_string()?;
    let attrs_len = reader.read_sequence()?;
    let attrs_end = reader.position() + attrs_len;
    let mut attributes = Vec::new();
    while reader.position() < attrs_end {
        attributes.push(parse_attribute(&mut reader)?);
    }
    Ok(SearchEntry {
        message_id,
        dn,
        attributes,
    })
}

/// Attribute list in map form, mirroring the `with_attributes` builder.
pub fn attributes_to_map(attributes: &[Attribute]) -> HashMap<String, Vec<String>> {
    attributes
        .iter()
        .map(|a| (a.name.clone(), a.string_values()))
        .collect()
}
