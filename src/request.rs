//! One inbound request: the decoded message plus its connection handle.

use std::sync::Arc;

use crate::ber::Packet;
use crate::conn::ConnShared;
use crate::error::{Error, Result};
use crate::message::{
    AddMessage, ExtendedOperationMessage, Message, ModifyMessage, SearchMessage,
    SimpleBindMessage, APP_CODE_ADD_RESPONSE, APP_CODE_BIND_RESPONSE, APP_CODE_EXTENDED_RESPONSE,
    APP_CODE_MODIFY_RESPONSE, APP_CODE_SEARCH_RESULT_DONE,
};
use crate::mux::RouteOperation;
use crate::response::{
    AddResponse, BindResponse, ExtendedResponse, GeneralResponse, ModifyResponse,
    SearchResponseDone, SearchResponseEntry,
};

// Extended operation OIDs surfaced to routes.
pub const EXTENDED_OPERATION_DISCONNECTION: &str = "1.3.6.1.4.1.1466.2003";
pub const EXTENDED_OPERATION_CANCEL: &str = "1.3.6.1.1.8";
pub const EXTENDED_OPERATION_START_TLS: &str = "1.3.6.1.4.1.1466.20037";
pub const EXTENDED_OPERATION_WHO_AM_I: &str = "1.3.6.1.4.1.4203.1.11.3";
pub const EXTENDED_OPERATION_GET_CONNECTION_ID: &str = "1.3.6.1.4.1.26027.1.6.2";
pub const EXTENDED_OPERATION_PASSWORD_MODIFY: &str = "1.3.6.1.4.1.4203.1.11.1";

/// An immutable record of one decoded PDU, handed to the matched handler
/// together with a [`crate::response::ResponseWriter`]. The request ID is
/// the LDAP messageID of the inbound PDU.
pub struct Request {
    id: i32,
    conn: Arc<ConnShared>,
    message: Message,
    route_op: RouteOperation,
    extended_name: Option<String>,
}

impl Request {
    pub(crate) fn new(conn: Arc<ConnShared>, packet: &Packet) -> Result<Request> {
        let message = Message::decode(packet)?;
        let (route_op, extended_name) = match &message {
            Message::SimpleBind(_) => (RouteOperation::Bind, None),
            Message::Search(_) => (RouteOperation::Search, None),
            Message::Modify(_) => (RouteOperation::Modify, None),
            Message::Add(_) => (RouteOperation::Add, None),
            Message::Extended(m) => (RouteOperation::ExtendedOperation, Some(m.name.clone())),
        };
        Ok(Request {
            id: message.id(),
            conn,
            message,
            route_op,
            extended_name,
        })
    }

    /// The request ID, equal to the LDAP messageID of the inbound PDU.
    pub fn id(&self) -> i32 {
        self.id
    }

    /// The ID of the connection this request arrived on.
    pub fn connection_id(&self) -> u64 {
        self.conn.id()
    }

    /// Whether the connection is already TLS (LDAPS or after STARTTLS).
    pub fn tls_active(&self) -> bool {
        self.conn.tls_active()
    }

    /// The decoded message.
    pub fn message(&self) -> &Message {
        &self.message
    }

    pub(crate) fn route_operation(&self) -> RouteOperation {
        self.route_op
    }

    pub(crate) fn extended_name(&self) -> Option<&str> {
        self.extended_name.as_deref()
    }

    /// Schedule a TLS upgrade on this request's connection. The handshake
    /// runs on the connection's read loop after the handler returns, so
    /// handlers write their success response first, then call this.
    ///
    /// Fails with [`Error::InvalidParameter`] when the connection is
    /// already secured or an upgrade is already pending.
    pub fn start_tls(&self, tls_config: Arc<rustls::ServerConfig>) -> Result<()> {
        self.conn.schedule_tls(tls_config)
    }

    /// The application tag number for a result answering this request.
    pub(crate) fn response_application_code(&self) -> u8 {
        match self.message {
            Message::SimpleBind(_) => APP_CODE_BIND_RESPONSE,
            Message::Search(_) => APP_CODE_SEARCH_RESULT_DONE,
            Message::Modify(_) => APP_CODE_MODIFY_RESPONSE,
            Message::Add(_) => APP_CODE_ADD_RESPONSE,
            Message::Extended(_) => APP_CODE_EXTENDED_RESPONSE,
        }
    }

    /// A general response correlated to this request. Defaults to result
    /// code 53 (unwillingToPerform) until overridden.
    pub fn new_response(&self) -> GeneralResponse {
        GeneralResponse::new(self.id)
    }

    /// A bind response correlated to this request (default: success).
    pub fn new_bind_response(&self) -> BindResponse {
        BindResponse::new(self.id)
    }

    /// A search entry for `dn`; add attributes with the builder methods.
    pub fn new_search_response_entry(&self, dn: impl Into<String>) -> SearchResponseEntry {
        SearchResponseEntry::new(self.id, dn.into())
    }

    /// The search-done response that terminates a result sequence. Set a
    /// non-success code (e.g. [`crate::codes::NO_SUCH_OBJECT`]) for empty
    /// results as the directory semantics require.
    pub fn new_search_done_response(&self) -> SearchResponseDone {
        SearchResponseDone::new(self.id)
    }

    /// An extended response correlated to this request.
    pub fn new_extended_response(&self) -> ExtendedResponse {
        ExtendedResponse::new(self.id)
    }

    /// A modify response correlated to this request.
    pub fn new_modify_response(&self) -> ModifyResponse {
        ModifyResponse::new(self.id)
    }

    /// An add response correlated to this request.
    pub fn new_add_response(&self) -> AddResponse {
        AddResponse::new(self.id)
    }

    /// The bind message, when this is a bind request.
    pub fn simple_bind_message(&self) -> Result<&SimpleBindMessage> {
        match &self.message {
            Message::SimpleBind(m) => Ok(m),
            _ => Err(Error::invalid("request is not a simple bind")),
        }
    }

    /// The search message, when this is a search request.
    pub fn search_message(&self) -> Result<&SearchMessage> {
        match &self.message {
            Message::Search(m) => Ok(m),
            _ => Err(Error::invalid("request is not a search")),
        }
    }

    /// The modify message, when this is a modify request.
    pub fn modify_message(&self) -> Result<&ModifyMessage> {
        match &self.message {
            Message::Modify(m) => Ok(m),
            _ => Err(Error::invalid("request is not a modify")),
        }
    }

    /// The add message, when this is an add request.
    pub fn add_message(&self) -> Result<&AddMessage> {
        match &self.message {
            Message::Add(m) => Ok(m),
            _ => Err(Error::invalid("request is not an add")),
        }
    }

    /// The extended operation message, when this is an extended request.
    pub fn extended_message(&self) -> Result<&ExtendedOperationMessage> {
        match &self.message {
            Message::Extended(m) => Ok(m),
            _ => Err(Error::invalid("request is not an extended operation")),
        }
    }
}
