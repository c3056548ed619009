//! Incoming HTTP request type.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http::{HeaderMap, Uri};

use crate::context::Context;
use crate::permission::Principal;

/// An incoming HTTP request as seen by middleware and handlers.
///
/// Besides the wire data it carries request-scoped state: the authenticated
/// [`Principal`] (set by the auth stage, enriched by the permission stage)
/// and a shared handle to the application [`Context`].
///
/// Build one from an `http::Request<Bytes>` in tests:
///
/// ```rust
/// use bytes::Bytes;
/// use kiln::Request;
///
/// let req = Request::from(
///     http::Request::get("/users/42")
///         .header("authorization", "Bearer abc")
///         .body(Bytes::new())
///         .unwrap(),
/// );
/// assert_eq!(req.header("Authorization"), Some("Bearer abc"));
/// ```
#[derive(Debug)]
pub struct Request {
    pub(crate) method: http::Method,
    pub(crate) uri: Uri,
    pub(crate) headers: HeaderMap,
    pub(crate) body: Bytes,
    pub(crate) params: HashMap<String, String>,
    pub(crate) remote_addr: Option<SocketAddr>,
    pub(crate) principal: Option<Principal>,
    pub(crate) context: Option<Arc<Context>>,
}

impl Request {
    pub(crate) fn from_parts(parts: http::request::Parts, body: Bytes, remote_addr: SocketAddr) -> Self {
        let mut req = Self::from(http::Request::from_parts(parts, body));
        req.remote_addr = Some(remote_addr);
        req
    }

    pub fn method(&self) -> &http::Method { &self.method }
    pub fn path(&self) -> &str { self.uri.path() }
    pub fn query(&self) -> Option<&str> { self.uri.query() }
    pub fn uri(&self) -> &Uri { &self.uri }
    pub fn headers(&self) -> &HeaderMap { &self.headers }
    pub fn body(&self) -> &[u8] { &self.body }
    pub fn remote_addr(&self) -> Option<SocketAddr> { self.remote_addr }

    /// Case-insensitive header lookup. Non-UTF-8 values read as absent.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Returns a named path parameter of the matched route.
    ///
    /// For a route `/users/:id`, `req.param("id")` on `/users/42` returns `Some("42")`.
    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    /// The authenticated principal, if the auth stage attached one.
    pub fn principal(&self) -> Option<&Principal> {
        self.principal.as_ref()
    }

    pub fn principal_mut(&mut self) -> Option<&mut Principal> {
        self.principal.as_mut()
    }

    pub fn set_principal(&mut self, principal: Principal) {
        self.principal = Some(principal);
    }

    /// The application context. Present on every request dispatched by a
    /// [`Pipeline`](crate::Pipeline).
    pub fn context(&self) -> Option<&Arc<Context>> {
        self.context.as_ref()
    }

    pub fn with_remote_addr(mut self, addr: SocketAddr) -> Self {
        self.remote_addr = Some(addr);
        self
    }

    pub fn with_context(mut self, context: Arc<Context>) -> Self {
        self.context = Some(context);
        self
    }
}

impl From<http::Request<Bytes>> for Request {
    fn from(req: http::Request<Bytes>) -> Self {
        let (parts, body) = req.into_parts();
        Self {
            method: parts.method,
            uri: parts.uri,
            headers: parts.headers,
            body,
            params: HashMap::new(),
            remote_addr: None,
            principal: None,
            context: None,
        }
    }
}
