//! Middleware layer.
//!
//! A [`Middleware`] is one named stage of the request pipeline: a list of
//! whitelist entries that bypass it, an [`Executor`] holding its check or
//! side effect, and an error handler. Stages run strictly in the order they
//! were attached; each one either lets the request through or answers it.
//!
//! ```rust
//! use kiln::middleware::{Executor, Middleware};
//! use kiln::{Method, Reply, Request, Status};
//!
//! struct RequireJson;
//!
//! #[async_trait::async_trait]
//! impl Executor for RequireJson {
//!     async fn exec(&self, req: &mut Request) -> Reply {
//!         match req.header("content-type") {
//!             Some(ct) if ct.starts_with("application/json") => Reply::ok(),
//!             _ => Reply::status(Status::UnsupportedMediaType),
//!         }
//!     }
//! }
//!
//! let mw = Middleware::with_executor("RequireJson", RequireJson)
//!     .whitelist("/health")
//!     .whitelist_method("/uploads/*", Method::Put);
//! ```
//!
//! Built-in stages: [`auth`] (token validation), [`track`] (page-view
//! analytics) and [`perm`] (scope → permission derivation).

pub mod auth;
pub mod perm;
pub mod track;

use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use crate::error::Error;
use crate::handler::{catch_fault, default_error_handler, ErrorHandler};
use crate::method::Method;
use crate::pattern::Pattern;
use crate::request::Request;
use crate::response::{Envelope, Reply, Response};

/// The check or side effect of a middleware.
///
/// Return an OK reply (`Reply::ok()`, `()`-equivalent `Payload::Empty`, or
/// an object without a status) to let the request continue; anything else is
/// sent to the caller and ends the pipeline.
#[async_trait]
pub trait Executor: Send + Sync + 'static {
    async fn exec(&self, req: &mut Request) -> Reply;
}

/// A path/method pair that skips a middleware entirely.
#[derive(Debug)]
pub struct WhitelistEntry {
    pub pattern: Pattern,
    pub method: Method,
}

impl WhitelistEntry {
    pub fn matches(&self, req: &Request) -> bool {
        self.method.matches(req.method()) && self.pattern.is_match(req.path())
    }
}

/// The outcome of one middleware for one request. Exactly one of the two.
#[derive(Debug)]
pub enum Flow {
    /// Hand the request to the next stage.
    Proceed,
    /// Answer now; later stages never see the request.
    Respond(Response),
}

/// A named pipeline stage.
pub struct Middleware {
    name: String,
    whitelist: Vec<WhitelistEntry>,
    executor: Option<Arc<dyn Executor>>,
    on_error: ErrorHandler,
}

impl Middleware {
    /// A middleware without an executor. It lets every request through and
    /// warns that nothing was plugged in.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            whitelist: Vec::new(),
            executor: None,
            on_error: default_error_handler(),
        }
    }

    pub fn with_executor(name: impl Into<String>, executor: impl Executor) -> Self {
        let mut mw = Self::new(name);
        mw.executor = Some(Arc::new(executor));
        mw
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Bypass this middleware for `pattern` on every method.
    ///
    /// # Panics
    ///
    /// Panics if `pattern` is not a valid path pattern.
    pub fn whitelist(self, pattern: &str) -> Self {
        self.whitelist_method(pattern, Method::All)
    }

    /// Bypass this middleware for `pattern` on `method` only.
    ///
    /// # Panics
    ///
    /// Panics if `pattern` is not a valid path pattern.
    pub fn whitelist_method(mut self, pattern: &str, method: Method) -> Self {
        self.try_whitelist(pattern, method)
            .unwrap_or_else(|e| panic!("invalid whitelist entry on `{}`: {e}", self.name));
        self
    }

    /// Fallible form of [`whitelist_method`](Self::whitelist_method), for
    /// entries coming from configuration.
    pub fn try_whitelist(&mut self, pattern: &str, method: Method) -> Result<(), Error> {
        let pattern = Pattern::compile(pattern)?;
        self.whitelist.push(WhitelistEntry { pattern, method });
        Ok(())
    }

    /// Replaces the default error handler (log + 500).
    pub fn on_error(mut self, handler: impl Fn(&anyhow::Error) -> Response + Send + Sync + 'static) -> Self {
        self.on_error = Arc::new(handler);
        self
    }

    pub fn whitelist_entries(&self) -> &[WhitelistEntry] {
        &self.whitelist
    }

    /// Whether any whitelist entry covers `req`. Entries are checked in
    /// registration order.
    pub fn is_whitelisted(&self, req: &Request) -> bool {
        self.whitelist.iter().any(|entry| entry.matches(req))
    }

    /// Runs the executor without whitelist or error handling.
    pub async fn exec(&self, req: &mut Request) -> Reply {
        match &self.executor {
            Some(executor) => executor.exec(req).await,
            None => {
                warn!(middleware = %self.name, "middleware has no executor, letting request through");
                Reply::ok()
            }
        }
    }

    /// Pipeline entry point.
    ///
    /// 1. Whitelisted → [`Flow::Proceed`] without running the executor.
    /// 2. Executor reply normalises to 200 → [`Flow::Proceed`].
    /// 3. Any other reply → [`Flow::Respond`] with the normalised envelope.
    /// 4. A fault or a panic → [`Flow::Respond`] with the error handler's
    ///    response.
    pub async fn dispatch(&self, req: &mut Request) -> Flow {
        if self.is_whitelisted(req) {
            return Flow::Proceed;
        }

        match catch_fault(Box::pin(self.exec(req))).await {
            Reply::Payload(payload) => {
                let envelope = Envelope::normalize(payload);
                if envelope.is_ok() {
                    Flow::Proceed
                } else {
                    Flow::Respond(envelope.into_response())
                }
            }
            Reply::Raw(response) => Flow::Respond(response),
            Reply::Fault(fault) => {
                tracing::debug!(middleware = %self.name, "middleware fault");
                Flow::Respond((self.on_error)(&fault))
            }
        }
    }
}

impl std::fmt::Debug for Middleware {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Middleware")
            .field("name", &self.name)
            .field("whitelist", &self.whitelist)
            .field("has_executor", &self.executor.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::response::Payload;
    use crate::status::Status;
    use bytes::Bytes;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting {
        calls: Arc<AtomicUsize>,
        reply: fn() -> Reply,
    }

    #[async_trait]
    impl Executor for Counting {
        async fn exec(&self, _req: &mut Request) -> Reply {
            self.calls.fetch_add(1, Ordering::SeqCst);
            (self.reply)()
        }
    }

    fn counting(reply: fn() -> Reply) -> (Middleware, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let mw = Middleware::with_executor("Counting", Counting { calls: Arc::clone(&calls), reply });
        (mw, calls)
    }

    fn request(method: http::Method, path: &str) -> Request {
        Request::from(http::Request::builder().method(method).uri(path).body(Bytes::new()).unwrap())
    }

    async fn body_of(flow: Flow) -> (u16, serde_json::Value) {
        match flow {
            Flow::Respond(resp) => (resp.status(), serde_json::from_slice(resp.body()).unwrap()),
            Flow::Proceed => panic!("expected a response"),
        }
    }

    #[tokio::test]
    async fn whitelisted_requests_skip_exec() {
        let (mw, calls) = counting(|| Reply::status(Status::Unauthorized));
        let mw = mw.whitelist("/public/*");
        let mut req = request(http::Method::GET, "/Public/logo.png");
        assert!(matches!(mw.dispatch(&mut req).await, Flow::Proceed));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn whitelist_respects_method() {
        let (mw, calls) = counting(|| Reply::status(Status::Unauthorized));
        let mw = mw.whitelist_method("/hooks", Method::Post);
        let mut req = request(http::Method::GET, "/hooks");
        assert!(matches!(mw.dispatch(&mut req).await, Flow::Respond(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn ok_reply_proceeds() {
        let (mw, calls) = counting(|| Reply::Payload(Payload::Empty));
        let mut req = request(http::Method::GET, "/");
        assert!(matches!(mw.dispatch(&mut req).await, Flow::Proceed));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn non_ok_reply_short_circuits_with_envelope() {
        let (mw, _) = counting(|| Reply::status(Status::Unauthorized));
        let mut req = request(http::Method::GET, "/");
        let (status, body) = body_of(mw.dispatch(&mut req).await).await;
        assert_eq!(status, 401);
        assert_eq!(body, serde_json::json!({"status": 401, "message": "Unauthorized"}));
    }

    #[tokio::test]
    async fn faults_go_to_the_error_handler() {
        let (mw, _) = counting(|| Reply::Fault(anyhow::anyhow!("upstream exploded")));
        let mw = mw.on_error(|_| Envelope::new(502u16, "custom").into_response());
        let mut req = request(http::Method::GET, "/");
        let (status, body) = body_of(mw.dispatch(&mut req).await).await;
        assert_eq!(status, 502);
        assert_eq!(body["message"], "custom");
    }

    struct Panicking;

    #[async_trait]
    impl Executor for Panicking {
        async fn exec(&self, _req: &mut Request) -> Reply {
            panic!("executor bug")
        }
    }

    #[tokio::test]
    async fn panics_become_500() {
        let mw = Middleware::with_executor("Panicking", Panicking);
        let mut req = request(http::Method::GET, "/");
        let (status, body) = body_of(mw.dispatch(&mut req).await).await;
        assert_eq!(status, 500);
        assert_eq!(body["message"], "Internal Server Error");
    }

    #[tokio::test]
    async fn missing_executor_lets_requests_through() {
        let mw = Middleware::new("Noop");
        let mut req = request(http::Method::DELETE, "/anything");
        assert!(matches!(mw.dispatch(&mut req).await, Flow::Proceed));
    }
}
