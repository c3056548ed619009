//! Declarative routes with a permission gate.
//!
//! A [`Router`] is a named, ordered list of [`Route`]s. Every route binds one
//! or more `(method, path)` aliases to a handler, and declares what the
//! caller must hold to reach it. Lookup is ordered first-match over all
//! aliases in registration order.
//!
//! ```rust
//! use kiln::{Json, Method, Request, Route, Router};
//!
//! async fn get_user(req: Request) -> Json<serde_json::Value> {
//!     Json(serde_json::json!({ "id": req.param("id") }))
//! }
//!
//! async fn delete_user(_req: Request) -> u16 { 204 }
//!
//! let users = Router::new("users")
//!     .route(Route::new(Method::Get, "/users/:id", get_user).permission("read"))
//!     .route(
//!         Route::new(Method::Delete, "/users/:id", delete_user)
//!             .alias(Method::Post, "/users/:id/delete")
//!             .permission("write"),
//!     );
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use tracing::info;

use crate::context::Context;
use crate::error::Error;
use crate::handler::{catch_fault, default_error_handler, BoxedHandler, ErrorHandler, Handler};
use crate::method::Method;
use crate::pattern::Pattern;
use crate::permission::{check_permissions, missing_scope_message};
use crate::request::Request;
use crate::response::{Envelope, Reply, Response};
use crate::status::Status;

/// Scope key used in 403 messages when a request carries no context.
const UNSET_SCOPE_KEY: &str = "unset-unset";

/// One endpoint: its aliases, requirements and handler.
pub struct Route {
    aliases: Vec<(Method, String)>,
    permissions: Vec<String>,
    require_account: bool,
    handler: BoxedHandler,
}

impl Route {
    /// A route requiring an authenticated account and no particular
    /// permission.
    pub fn new(method: Method, path: &str, handler: impl Handler) -> Self {
        Self {
            aliases: vec![(method, path.to_owned())],
            permissions: Vec::new(),
            require_account: true,
            handler: handler.into_boxed_handler(),
        }
    }

    /// Binds the same handler to another method and path.
    pub fn alias(mut self, method: Method, path: &str) -> Self {
        self.aliases.push((method, path.to_owned()));
        self
    }

    /// Adds a permission the caller may hold. Holding any one of a route's
    /// permissions is enough.
    pub fn permission(mut self, permission: impl Into<String>) -> Self {
        self.permissions.push(permission.into());
        self
    }

    pub fn permissions<I, S>(mut self, permissions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.permissions.extend(permissions.into_iter().map(Into::into));
        self
    }

    /// Whether anonymous callers are turned away. Defaults to `true`.
    pub fn require_account(mut self, required: bool) -> Self {
        self.require_account = required;
        self
    }

    pub fn required_permissions(&self) -> &[String] {
        &self.permissions
    }
}

impl std::fmt::Debug for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Route")
            .field("aliases", &self.aliases)
            .field("permissions", &self.permissions)
            .field("require_account", &self.require_account)
            .finish_non_exhaustive()
    }
}

struct Binding {
    method: Method,
    pattern: Pattern,
    route: Arc<Route>,
}

/// The result of offering a request to a router.
#[derive(Debug)]
pub enum Routed {
    Handled(Response),
    /// No alias matched; the request is handed back untouched.
    Unmatched(Request),
}

/// A named group of routes sharing one error handler.
pub struct Router {
    name: String,
    bindings: Vec<Binding>,
    on_error: ErrorHandler,
}

impl Router {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), bindings: Vec::new(), on_error: default_error_handler() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Registers every alias of `route`, in declaration order.
    ///
    /// # Panics
    ///
    /// Panics if an alias path is not a valid pattern.
    pub fn route(mut self, route: Route) -> Self {
        if let Err(e) = self.try_route(route) {
            panic!("invalid route on router `{}`: {e}", self.name);
        }
        self
    }

    /// Fallible form of [`route`](Self::route). Nothing is registered if any
    /// alias is invalid.
    pub fn try_route(&mut self, route: Route) -> Result<(), Error> {
        let route = Arc::new(route);
        let compiled = route.aliases.iter()
            .map(|(method, path)| Ok((*method, Pattern::compile(path)?)))
            .collect::<Result<Vec<_>, Error>>()?;

        for (method, pattern) in compiled {
            info!(router = %self.name, %method, route = %pattern.as_str(), "registered route");
            self.bindings.push(Binding { method, pattern, route: Arc::clone(&route) });
        }
        Ok(())
    }

    /// Replaces the default error handler (log + 500).
    pub fn on_error(mut self, handler: impl Fn(&anyhow::Error) -> Response + Send + Sync + 'static) -> Self {
        self.on_error = Arc::new(handler);
        self
    }

    /// `(method, pattern)` of every binding, in match order.
    pub fn bindings(&self) -> impl Iterator<Item = (Method, &str)> {
        self.bindings.iter().map(|b| (b.method, b.pattern.as_str()))
    }

    fn find(&self, req: &Request) -> Option<(&Arc<Route>, HashMap<String, String>)> {
        self.bindings.iter()
            .filter(|b| b.method.matches(req.method()))
            .find_map(|b| b.pattern.captures(req.path()).map(|params| (&b.route, params)))
    }

    /// Routes `req` to the first matching alias.
    ///
    /// 1. Permission gate: a caller failing it gets 403 naming the missing
    ///    scope(s); the handler never runs.
    /// 2. The handler's reply is normalised into an envelope, except a raw
    ///    [`Response`], which is sent as-is.
    /// 3. A fault or a panic goes to the router's error handler.
    pub async fn dispatch(&self, mut req: Request) -> Routed {
        let Some((route, params)) = self.find(&req) else {
            return Routed::Unmatched(req);
        };

        if !check_permissions(req.principal(), &route.permissions, route.require_account) {
            let scope_key = req.context().map_or_else(|| UNSET_SCOPE_KEY.to_owned(), |c| c.scope_key());
            let message = missing_scope_message(&scope_key, &route.permissions);
            return Routed::Handled(Envelope::new(Status::Forbidden, message).into_response());
        }

        req.params = params;
        let response = match catch_fault(route.handler.call(req)).await {
            Reply::Payload(payload) => Envelope::normalize(payload).into_response(),
            Reply::Raw(response) => response,
            Reply::Fault(fault) => {
                tracing::debug!(router = %self.name, "route fault");
                (self.on_error)(&fault)
            }
        };
        Routed::Handled(response)
    }
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("name", &self.name)
            .field("bindings", &self.bindings().collect::<Vec<_>>())
            .finish()
    }
}

// ── Built-in routers ──────────────────────────────────────────────────────────

/// `ALL /` answers `{version, message}`; `ALL /permnode` answers
/// `{apiIdentifier, permNodes}` when a manifest was loaded. Both are public.
pub fn service_router(ctx: &Context) -> Router {
    let info = serde_json::json!({
        "version": ctx.info.version,
        "message": format!("Welcome to the {} API", ctx.info.name),
    });
    let mut router = Router::new("Service").route(
        Route::new(Method::All, "/", move |_req: Request| {
            let info = info.clone();
            async move { info }
        })
        .require_account(false),
    );

    if let Some(nodes) = &ctx.perm_nodes {
        let body = serde_json::json!({ "apiIdentifier": ctx.scope_key(), "permNodes": nodes });
        router = router.route(
            Route::new(Method::All, "/permnode", move |_req: Request| {
                let body = body.clone();
                async move { body }
            })
            .require_account(false),
        );
    }
    router
}

/// Catches every request and answers 404. Always attached last.
pub fn not_found_router() -> Router {
    async fn not_found(_req: Request) -> Status {
        Status::NotFound
    }
    Router::new("Wildcard").route(Route::new(Method::All, "*", not_found).require_account(false))
}
