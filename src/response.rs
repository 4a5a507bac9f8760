//! Response variants and the per-request [`ResponseWriter`].
//!
//! Every variant carries the LDAPResult fields `{code, matchedDN,
//! diagnosticMessage}` correlated to one messageID. matchedDN and
//! diagnosticMessage default to the literal `"Unused"` until set.

use std::collections::HashMap;
use std::sync::Arc;

use crate::ber::BerWriter;
use crate::codes;
use crate::conn::ConnShared;
use crate::error::{Error, Result};
use crate::message::{
    Attribute, APP_CODE_ADD_RESPONSE, APP_CODE_BIND_RESPONSE, APP_CODE_EXTENDED_RESPONSE,
    APP_CODE_MODIFY_RESPONSE, APP_CODE_SEARCH_RESULT_DONE, APP_SEARCH_RESULT_ENTRY,
};

const UNSET: &str = "Unused";

#[derive(Debug, Clone)]
struct ResultFields {
    message_id: i32,
    code: i16,
    matched_dn: String,
    diagnostic_message: String,
}

impl ResultFields {
    fn new(message_id: i32, code: i16) -> Self {
        ResultFields {
            message_id,
            code,
            matched_dn: UNSET.to_string(),
            diagnostic_message: UNSET.to_string(),
        }
    }
}

fn encode_result_pdu(
    fields: &ResultFields,
    application_code: u8,
    trailer: impl FnOnce(&mut BerWriter),
) -> Vec<u8> {
    let mut writer = BerWriter::new();
    let envelope = writer.start_sequence();
    writer.write_integer(fields.message_id);
    writer.write_tag(0x60 | application_code);
    let op = writer.reserve_length();
    writer.write_enumerated(fields.code as u8);
    writer.write_string(&fields.matched_dn);
    writer.write_string(&fields.diagnostic_message);
    trailer(&mut writer);
    writer.end(op);
    writer.end(envelope);
    writer.into_vec()
}

macro_rules! result_builders {
    ($ty:ty) => {
        impl $ty {
            /// Set the LDAP result code (see [`crate::codes`]).
            pub fn with_response_code(mut self, code: i16) -> Self {
                self.fields.code = code;
                self
            }

            /// Set the matchedDN field.
            pub fn with_matched_dn(mut self, dn: impl Into<String>) -> Self {
                self.fields.matched_dn = dn.into();
                self
            }

            /// Set the diagnosticMessage field.
            pub fn with_diagnostic_message(mut self, message: impl Into<String>) -> Self {
                self.fields.diagnostic_message = message.into();
                self
            }
        }
    };
}

/// A result not tied to a specific operation shape; the application tag is
/// chosen with [`GeneralResponse::with_application_code`]. Used for the
/// synthesized no-route reply and anywhere the caller wants full control.
#[derive(Debug, Clone)]
pub struct GeneralResponse {
    fields: ResultFields,
    application_code: u8,
}

impl GeneralResponse {
    pub(crate) fn new(message_id: i32) -> Self {
        GeneralResponse {
            fields: ResultFields::new(message_id, codes::UNWILLING_TO_PERFORM),
            application_code: APP_CODE_EXTENDED_RESPONSE,
        }
    }

    /// Set the application tag number the result is encoded under
    /// (e.g. 7 for ModifyResponse).
    pub fn with_application_code(mut self, code: u8) -> Self {
        self.application_code = code;
        self
    }
}
result_builders!(GeneralResponse);

#[derive(Debug, Clone)]
pub struct BindResponse {
    fields: ResultFields,
}

impl BindResponse {
    pub(crate) fn new(message_id: i32) -> Self {
        BindResponse {
            fields: ResultFields::new(message_id, codes::SUCCESS),
        }
    }
}
result_builders!(BindResponse);

/// One directory entry returned from a search handler.
#[derive(Debug, Clone)]
pub struct SearchResponseEntry {
    message_id: i32,
    dn: String,
    attributes: Vec<Attribute>,
}

impl SearchResponseEntry {
    pub(crate) fn new(message_id: i32, dn: String) -> Self {
        SearchResponseEntry {
            message_id,
            dn,
            attributes: Vec::new(),
        }
    }

    /// Append one attribute with its values.
    pub fn with_attribute(mut self, name: impl Into<String>, values: &[&str]) -> Self {
        self.attributes.push(Attribute::new(
            name,
            values.iter().map(|v| v.as_bytes().to_vec()).collect(),
        ));
        self
    }

    /// Append attributes from a name-to-values map.
    pub fn with_attributes(mut self, attributes: HashMap<String, Vec<String>>) -> Self {
        for (name, values) in attributes {
            self.attributes.push(Attribute::new(
                name,
                values.into_iter().map(String::into_bytes).collect(),
            ));
        }
        self
    }
}

#[derive(Debug, Clone)]
pub struct SearchResponseDone {
    fields: ResultFields,
}

impl SearchResponseDone {
    pub(crate) fn new(message_id: i32) -> Self {
        SearchResponseDone {
            fields: ResultFields::new(message_id, codes::SUCCESS),
        }
    }
}
result_builders!(SearchResponseDone);

#[derive(Debug, Clone)]
pub struct ExtendedResponse {
    fields: ResultFields,
    response_name: Option<String>,
    response_value: Option<Vec<u8>>,
}

impl ExtendedResponse {
    pub(crate) fn new(message_id: i32) -> Self {
        ExtendedResponse {
            fields: ResultFields::new(message_id, codes::SUCCESS),
            response_name: None,
            response_value: None,
        }
    }

    /// Set the responseName OID.
    pub fn with_response_name(mut self, name: impl Into<String>) -> Self {
        self.response_name = Some(name.into());
        self
    }

    /// Set the responseValue octets (e.g. the WhoAmI authzId).
    pub fn with_response_value(mut self, value: Vec<u8>) -> Self {
        self.response_value = Some(value);
        self
    }
}
result_builders!(ExtendedResponse);

#[derive(Debug, Clone)]
pub struct ModifyResponse {
    fields: ResultFields,
}

impl ModifyResponse {
    pub(crate) fn new(message_id: i32) -> Self {
        ModifyResponse {
            fields: ResultFields::new(message_id, codes::SUCCESS),
        }
    }
}
result_builders!(ModifyResponse);

#[derive(Debug, Clone)]
pub struct AddResponse {
    fields: ResultFields,
}

impl AddResponse {
    pub(crate) fn new(message_id: i32) -> Self {
        AddResponse {
            fields: ResultFields::new(message_id, codes::SUCCESS),
        }
    }
}
result_builders!(AddResponse);

/// Any encodable response PDU.
#[derive(Debug, Clone)]
pub enum Response {
    General(GeneralResponse),
    Bind(BindResponse),
    SearchEntry(SearchResponseEntry),
    SearchDone(SearchResponseDone),
    Extended(ExtendedResponse),
    Modify(ModifyResponse),
    Add(AddResponse),
}

impl Response {
    /// The messageID the response correlates to.
    pub fn message_id(&self) -> i32 {
        match self {
            Response::General(r) => r.fields.message_id,
            Response::Bind(r) => r.fields.message_id,
            Response::SearchEntry(r) => r.message_id,
            Response::SearchDone(r) => r.fields.message_id,
            Response::Extended(r) => r.fields.message_id,
            Response::Modify(r) => r.fields.message_id,
            Response::Add(r) => r.fields.message_id,
        }
    }

    /// Encode the response as one BER PDU.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Response::General(r) => encode_result_pdu(&r.fields, r.application_code, |_| {}),
            Response::Bind(r) => encode_result_pdu(&r.fields, APP_CODE_BIND_RESPONSE, |_| {}),
            Response::SearchDone(r) => {
                encode_result_pdu(&r.fields, APP_CODE_SEARCH_RESULT_DONE, |_| {})
            }
            Response::Modify(r) => encode_result_pdu(&r.fields, APP_CODE_MODIFY_RESPONSE, |_| {}),
            Response::Add(r) => encode_result_pdu(&r.fields, APP_CODE_ADD_RESPONSE, |_| {}),
            Response::Extended(r) => {
                encode_result_pdu(&r.fields, APP_CODE_EXTENDED_RESPONSE, |writer| {
                    // responseName [10], responseValue [11]
                    if let Some(name) = &r.response_name {
                        writer.write_context_string(0x8A, name.as_bytes());
                    }
                    if let Some(value) = &r.response_value {
                        writer.write_context_string(0x8B, value);
                    }
                })
            }
            Response::SearchEntry(r) => {
                let mut writer = BerWriter::new();
                let envelope = writer.start_sequence();
                writer.write_integer(r.message_id);
                writer.write_tag(APP_SEARCH_RESULT_ENTRY);
                let op = writer.reserve_length();
                writer.write_string(&r.dn);
                let attrs = writer.start_sequence();
                for attribute in &r.attributes {
                    let attr = writer.start_sequence();
                    writer.write_string(&attribute.name);
                    writer.write_tag(0x31); // SET OF AttributeValue
                    let values = writer.reserve_length();
                    for value in &attribute.values {
                        writer.write_octet_string(value);
                    }
                    writer.end(values);
                    writer.end(attr);
                }
                writer.end(attrs);
                writer.end(op);
                writer.end(envelope);
                writer.into_vec()
            }
        }
    }
}

impl From<GeneralResponse> for Response {
    fn from(r: GeneralResponse) -> Self {
        Response::General(r)
    }
}
impl From<BindResponse> for Response {
    fn from(r: BindResponse) -> Self {
        Response::Bind(r)
    }
}
impl From<SearchResponseEntry> for Response {
    fn from(r: SearchResponseEntry) -> Self {
        Response::SearchEntry(r)
    }
}
impl From<SearchResponseDone> for Response {
    fn from(r: SearchResponseDone) -> Self {
        Response::SearchDone(r)
    }
}
impl From<ExtendedResponse> for Response {
    fn from(r: ExtendedResponse) -> Self {
        Response::Extended(r)
    }
}
impl From<ModifyResponse> for Response {
    fn from(r: ModifyResponse) -> Self {
        Response::Modify(r)
    }
}
impl From<AddResponse> for Response {
    fn from(r: AddResponse) -> Self {
        Response::Add(r)
    }
}

/// Writes responses for one request, bound to its connection and messageID.
///
/// PDUs pushed through the writer never interleave on the wire; the
/// connection's write half is locked for the duration of each PDU. For
/// searches the handler writes any number of entries followed by one done
/// response; the writer does not police that ordering.
pub struct ResponseWriter {
    conn: Arc<ConnShared>,
    message_id: i32,
}

impl ResponseWriter {
    pub(crate) fn new(conn: Arc<ConnShared>, message_id: i32) -> Self {
        ResponseWriter { conn, message_id }
    }

    /// The messageID this writer is bound to.
    pub fn message_id(&self) -> i32 {
        self.message_id
    }

    /// The ID of the connection this writer is bound to.
    pub fn connection_id(&self) -> u64 {
        self.conn.id()
    }

    /// Encode `response` and write it to the connection.
    ///
    /// Fails with [`Error::InvalidParameter`] when the response's messageID
    /// does not equal the writer's bound ID, and [`Error::Closed`] when the
    /// connection has already shut down.
    pub async fn write(&mut self, response: impl Into<Response>) -> Result<()> {
        let response = response.into();
        if response.message_id() != self.message_id {
            return Err(Error::invalid(format!(
                "response message ID {} does not match request message ID {}",
                response.message_id(),
                self.message_id
            )));
        }
        self.conn.write_pdu(&response.encode()).await
    }
}
