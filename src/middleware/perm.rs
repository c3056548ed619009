//! Permission-derivation stage.
//!
//! Runs after authentication. Requests without a principal pass untouched;
//! otherwise the principal's scopes are resolved against the service's scope
//! key and stored on it, ready for the routers' permission gate.

use async_trait::async_trait;

use crate::middleware::{Executor, Middleware};
use crate::permission::derive_perms;
use crate::request::Request;
use crate::response::Reply;

pub const NAME: &str = "PermMiddleware";

struct PermExecutor {
    scope_key: String,
}

#[async_trait]
impl Executor for PermExecutor {
    async fn exec(&self, req: &mut Request) -> Reply {
        if let Some(principal) = req.principal_mut() {
            principal.perms = Some(derive_perms(&self.scope_key, &principal.scopes));
        }
        Reply::ok()
    }
}

/// Builds the stage for `scope_key` (`{service}-{environment}`).
pub fn middleware(scope_key: impl Into<String>) -> Middleware {
    Middleware::with_executor(NAME, PermExecutor { scope_key: scope_key.into() })
}
