//! An embeddable LDAP v3 server framework.
//!
//! `ldapserve` accepts LDAP connections over TCP (plain, LDAPS, or
//! upgraded mid-session via STARTTLS), decodes BER-encoded PDUs into typed
//! requests, routes them through a [`Mux`] to async handlers, and writes
//! message-ID-correlated responses back through a serialized per-connection
//! writer. It is not a directory: persistence, schema and access control
//! are the embedding application's concern. Typical uses are test
//! directories, mocks and authentication front-ends.
//!
//! ```no_run
//! use std::sync::Arc;
//! use ldapserve::{codes, AuthChoice, Config, Mux, SearchRouteOpts, Server};
//!
//! # async fn example() -> ldapserve::Result<()> {
//! let mut mux = Mux::new();
//! mux.bind(AuthChoice::Simple, |mut writer, request| async move {
//!     let bind = request.simple_bind_message().expect("bind route");
//!     let code = if bind.password == "secret" {
//!         codes::SUCCESS
//!     } else {
//!         codes::INVALID_CREDENTIALS
//!     };
//!     let _ = writer
//!         .write(request.new_bind_response().with_response_code(code))
//!         .await;
//! });
//! mux.search(
//!     SearchRouteOpts::default().with_base_dn("dc=example,dc=org"),
//!     |mut writer, request| async move {
//!         let entry = request
//!             .new_search_response_entry("cn=alice,dc=example,dc=org")
//!             .with_attribute("cn", &["alice"]);
//!         let _ = writer.write(entry).await;
//!         let _ = writer.write(request.new_search_done_response()).await;
//!     },
//! );
//!
//! let server = Arc::new(Server::new(Config::default()));
//! server.router(mux);
//! server.run("127.0.0.1:1389").await
//! # }
//! ```

pub mod ber;
pub mod codes;
pub mod config;
mod conn;
pub mod error;
pub mod message;
pub mod mux;
pub mod request;
pub mod response;
pub mod server;
pub mod tls;

pub use config::{Config, TlsConfig};
pub use error::{Error, Result};
pub use message::{
    AddMessage, Attribute, AuthChoice, ExtendedOperationMessage, Filter, Message, ModifyChange,
    ModifyMessage, ModifyOperation, Scope, SearchMessage, SimpleBindMessage,
};
pub use mux::{HandlerFunc, Mux, RouteOperation, SearchRouteOpts};
pub use request::{
    Request, EXTENDED_OPERATION_CANCEL, EXTENDED_OPERATION_DISCONNECTION,
    EXTENDED_OPERATION_GET_CONNECTION_ID, EXTENDED_OPERATION_PASSWORD_MODIFY,
    EXTENDED_OPERATION_START_TLS, EXTENDED_OPERATION_WHO_AM_I,
};
pub use response::{
    AddResponse, BindResponse, ExtendedResponse, GeneralResponse, ModifyResponse, Response,
    ResponseWriter, SearchResponseDone, SearchResponseEntry,
};
pub use server::{OnCloseHandler, Server};
