//! Route multiplexer: matches decoded requests to handlers.
//!
//! Routes are kept in registration order and the first route whose
//! operation, message variant and predicates all match wins. Unset
//! predicates are wildcards. A single default route catches requests no
//! operation route matched; without one the connection synthesizes an
//! unwillingToPerform (53) reply.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::message::{AuthChoice, Message, Scope};
use crate::request::Request;
use crate::response::ResponseWriter;

/// The operation category a route (or request) belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOperation {
    Bind,
    Search,
    ExtendedOperation,
    Modify,
    Add,
}

impl fmt::Display for RouteOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RouteOperation::Bind => "bind",
            RouteOperation::Search => "search",
            RouteOperation::ExtendedOperation => "extendedOperation",
            RouteOperation::Modify => "modify",
            RouteOperation::Add => "add",
        };
        f.write_str(name)
    }
}

/// A boxed async handler invoked with the request and a writer bound to
/// its messageID.
pub type HandlerFunc =
    Arc<dyn Fn(ResponseWriter, Request) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

fn box_handler<F, Fut>(handler: F) -> HandlerFunc
where
    F: Fn(ResponseWriter, Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |writer, request| Box::pin(handler(writer, request)))
}

/// Predicates for a search route. Unset fields match anything; base DN and
/// filter compare ASCII-case-insensitively against the request.
#[derive(Debug, Clone, Default)]
pub struct SearchRouteOpts {
    pub base_dn: Option<String>,
    pub filter: Option<String>,
    pub scope: Option<Scope>,
    /// Free-form label shown in dispatch logs.
    pub label: Option<String>,
}

impl SearchRouteOpts {
    pub fn with_base_dn(mut self, base_dn: impl Into<String>) -> Self {
        self.base_dn = Some(base_dn.into());
        self
    }

    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    pub fn with_scope(mut self, scope: Scope) -> Self {
        self.scope = Some(scope);
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }
}

enum RouteKind {
    Bind {
        auth_choice: AuthChoice,
    },
    Search {
        base_dn: Option<String>,
        filter: Option<String>,
        scope: Option<Scope>,
    },
    Extended {
        name: String,
    },
    Modify,
    Add,
    Default,
}

struct Route {
    operation: Option<RouteOperation>,
    label: Option<String>,
    kind: RouteKind,
    handler: HandlerFunc,
}

impl Route {
    fn matches(&self, request: &Request) -> bool {
        match &self.kind {
            RouteKind::Default => return true,
            _ => {
                if self.operation != Some(request.route_operation()) {
                    return false;
                }
            }
        }
        match &self.kind {
            RouteKind::Default => true,
            RouteKind::Bind { auth_choice } => match request.message() {
                Message::SimpleBind(bind) => bind.auth_choice == *auth_choice,
                _ => false,
            },
            RouteKind::Modify => matches!(request.message(), Message::Modify(_)),
            RouteKind::Add => matches!(request.message(), Message::Add(_)),
            RouteKind::Extended { name } => {
                matches!(request.message(), Message::Extended(_))
                    && request.extended_name() == Some(name.as_str())
            }
            RouteKind::Search {
                base_dn,
                filter,
                scope,
            } => {
                let search = match request.message() {
                    Message::Search(search) => search,
                    _ => return false,
                };
                if let Some(base_dn) = base_dn {
                    if !base_dn.eq_ignore_ascii_case(&search.base_dn) {
                        return false;
                    }
                }
                if let Some(filter) = filter {
                    if !filter.eq_ignore_ascii_case(&search.filter_string()) {
                        return false;
                    }
                }
                if let Some(scope) = scope {
                    if *scope != search.scope {
                        return false;
                    }
                }
                true
            }
        }
    }
}

/// The route table. Build one, register routes, then install it with
/// [`crate::server::Server::router`].
#[derive(Default)]
pub struct Mux {
    routes: Vec<Route>,
    default_route: Option<Route>,
}

impl Mux {
    pub fn new() -> Mux {
        Mux::default()
    }

    /// Route simple or SASL binds with the given authentication choice.
    pub fn bind<F, Fut>(&mut self, auth_choice: AuthChoice, handler: F)
    where
        F: Fn(ResponseWriter, Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.routes.push(Route {
            operation: Some(RouteOperation::Bind),
            label: None,
            kind: RouteKind::Bind { auth_choice },
            handler: box_handler(handler),
        });
    }

    /// Route searches whose base DN, filter and scope satisfy `opts`.
    pub fn search<F, Fut>(&mut self, opts: SearchRouteOpts, handler: F)
    where
        F: Fn(ResponseWriter, Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.routes.push(Route {
            operation: Some(RouteOperation::Search),
            label: opts.label,
            kind: RouteKind::Search {
                base_dn: opts.base_dn,
                filter: opts.filter,
                scope: opts.scope,
            },
            handler: box_handler(handler),
        });
    }

    /// Route extended operations with the given OID (see the
    /// `EXTENDED_OPERATION_*` constants in [`crate::request`]).
    pub fn extended_operation<F, Fut>(&mut self, name: impl Into<String>, handler: F)
    where
        F: Fn(ResponseWriter, Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.routes.push(Route {
            operation: Some(RouteOperation::ExtendedOperation),
            label: None,
            kind: RouteKind::Extended { name: name.into() },
            handler: box_handler(handler),
        });
    }

    /// Route modify requests.
    pub fn modify<F, Fut>(&mut self, handler: F)
    where
        F: Fn(ResponseWriter, Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.routes.push(Route {
            operation: Some(RouteOperation::Modify),
            label: None,
            kind: RouteKind::Modify,
            handler: box_handler(handler),
        });
    }

    /// Route add requests.
    pub fn add<F, Fut>(&mut self, handler: F)
    where
        F: Fn(ResponseWriter, Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.routes.push(Route {
            operation: Some(RouteOperation::Add),
            label: None,
            kind: RouteKind::Add,
            handler: box_handler(handler),
        });
    }

    /// Install the default route, matched when no operation route matches.
    /// Registering it again replaces the previous default.
    pub fn default_route<F, Fut>(&mut self, handler: F)
    where
        F: Fn(ResponseWriter, Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.default_route = Some(Route {
            operation: None,
            label: None,
            kind: RouteKind::Default,
            handler: box_handler(handler),
        });
    }

    /// Resolve `request` to a handler: first matching route in
    /// registration order, else the default route, else `None`.
    pub(crate) fn route(&self, request: &Request) -> Option<HandlerFunc> {
        for route in &self.routes {
            if route.matches(request) {
                if let Some(label) = &route.label {
                    tracing::debug!("route {} matched request {}", label, request.id());
                }
                return Some(Arc::clone(&route.handler));
            }
        }
        self.default_route
            .as_ref()
            .map(|route| Arc::clone(&route.handler))
    }

    /// Number of registered operation routes (default excluded).
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty() && self.default_route.is_none()
    }
}
