//! Handler trait and type erasure.
//!
//! Routes store handlers of different concrete types in one `Vec`, so each
//! handler is wrapped in a trait object. The chain from user code to call:
//!
//! ```text
//! async fn hello(req: Request) -> impl IntoReply { … }   ← user writes this
//!        ↓ Route::new(Method::Get, "/", hello)
//! hello.into_boxed_handler()                             ← Handler blanket impl
//!        ↓
//! Arc::new(FnHandler(hello))                             ← stored as BoxedHandler
//!        ↓
//! handler.call(req)  at request time                     ← one vtable dispatch
//!        ↓
//! Box::pin(async { hello(req).await.into_reply() })      ← BoxFuture<Reply>
//! ```

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;

use futures_util::FutureExt;

use crate::request::Request;
use crate::response::{Envelope, IntoReply, Reply, Response};
use crate::status::Status;
use crate::telemetry;

/// A heap-allocated, type-erased, `Send` future.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Internal dispatch interface.
///
/// `#[doc(hidden)] pub` because it appears in the return type of the public
/// [`Handler`] trait.
#[doc(hidden)]
pub trait ErasedHandler {
    fn call(&self, req: Request) -> BoxFuture<'static, Reply>;
}

#[doc(hidden)]
pub type BoxedHandler = Arc<dyn ErasedHandler + Send + Sync + 'static>;

/// Implemented for every valid route handler:
///
/// ```text
/// async fn name(req: Request) -> impl IntoReply
/// ```
///
/// Sealed; only the blanket impl below satisfies it.
pub trait Handler: private::Sealed + Send + Sync + 'static {
    #[doc(hidden)]
    fn into_boxed_handler(self) -> BoxedHandler;
}

mod private {
    pub trait Sealed {}
}

impl<F, Fut, R> private::Sealed for F
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = R> + Send + 'static,
    R: IntoReply + Send + 'static,
{
}

impl<F, Fut, R> Handler for F
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = R> + Send + 'static,
    R: IntoReply + Send + 'static,
{
    fn into_boxed_handler(self) -> BoxedHandler {
        Arc::new(FnHandler(self))
    }
}

struct FnHandler<F>(F);

impl<F, Fut, R> ErasedHandler for FnHandler<F>
where
    F: Fn(Request) -> Fut + Send + Sync,
    Fut: Future<Output = R> + Send + 'static,
    R: IntoReply + Send + 'static,
{
    fn call(&self, req: Request) -> BoxFuture<'static, Reply> {
        let fut = (self.0)(req);
        Box::pin(async move { fut.await.into_reply() })
    }
}

/// Turns a request-pipeline fault into the response sent to the caller.
///
/// Middleware and routers each hold one. Details of the fault belong in the
/// log, never in the response body.
pub type ErrorHandler = Arc<dyn Fn(&anyhow::Error) -> Response + Send + Sync>;

/// Logs the fault, hands it to the error reporter, and answers with the
/// normalised 500 envelope. Panics were already reported by the panic hook.
pub fn default_error_handler() -> ErrorHandler {
    Arc::new(|fault: &anyhow::Error| {
        let detail = format!("{fault:#}");
        tracing::error!(error = %detail, "request failed");
        if !fault.is::<Panicked>() {
            telemetry::report(&detail);
        }
        Envelope::from_status(Status::InternalServerError).into_response()
    })
}

/// A handler or executor panic caught by the pipeline.
#[derive(Debug, thiserror::Error)]
#[error("panicked: {0}")]
pub(crate) struct Panicked(String);

/// Awaits `fut`, turning a panic into [`Reply::Fault`].
pub(crate) async fn catch_fault(fut: BoxFuture<'_, Reply>) -> Reply {
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(reply) => reply,
        Err(panic) => Reply::Fault(Panicked(panic_message(&*panic).to_owned()).into()),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s
    } else {
        "non-string panic payload"
    }
}
