//! The ordered chain of middleware and routers a request travels through.

use std::sync::Arc;

use tracing::{debug, info};

use crate::context::Context;
use crate::middleware::{Flow, Middleware};
use crate::request::Request;
use crate::response::{Envelope, Response};
use crate::router::{Routed, Router};
use crate::status::Status;

enum Stage {
    Middleware(Middleware),
    Router(Router),
}

impl Stage {
    fn name(&self) -> &str {
        match self {
            Self::Middleware(mw) => mw.name(),
            Self::Router(router) => router.name(),
        }
    }
}

/// Middleware and routers in attachment order, bound to one [`Context`].
///
/// Each request visits the stages strictly in order. A middleware lets it
/// through or answers it; a router answers it if one of its routes matches.
/// The first answer is the response; later stages never see the request.
pub struct Pipeline {
    context: Arc<Context>,
    stages: Vec<Stage>,
}

impl Pipeline {
    pub fn new(context: Arc<Context>) -> Self {
        Self { context, stages: Vec::new() }
    }

    pub fn middleware(mut self, middleware: Middleware) -> Self {
        info!(middleware = %middleware.name(), "registered middleware");
        self.stages.push(Stage::Middleware(middleware));
        self
    }

    pub fn router(mut self, router: Router) -> Self {
        info!(router = %router.name(), "registered router");
        self.stages.push(Stage::Router(router));
        self
    }

    pub fn context(&self) -> &Arc<Context> {
        &self.context
    }

    /// Stage names in visiting order.
    pub fn stage_names(&self) -> impl Iterator<Item = &str> {
        self.stages.iter().map(Stage::name)
    }

    /// Runs `req` through the stages. A request no stage answers gets 404.
    pub async fn handle(&self, mut req: Request) -> Response {
        req.context = Some(Arc::clone(&self.context));

        for stage in &self.stages {
            match stage {
                Stage::Middleware(mw) => match mw.dispatch(&mut req).await {
                    Flow::Proceed => {}
                    Flow::Respond(response) => {
                        debug!(middleware = %mw.name(), status = response.status(), "request answered by middleware");
                        return response;
                    }
                },
                Stage::Router(router) => match router.dispatch(req).await {
                    Routed::Handled(response) => return response,
                    Routed::Unmatched(unmatched) => req = unmatched,
                },
            }
        }

        Envelope::from_status(Status::NotFound).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::context::ServiceInfo;
    use crate::method::Method;
    use crate::middleware::{auth, perm, Executor};
    use crate::middleware::auth::{Credential, TokenValidator, ValidationError};
    use crate::permission::Principal;
    use crate::response::Reply;
    use crate::router::{not_found_router, service_router, Route};
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::sync::Mutex;

    struct Scoped;

    #[async_trait]
    impl TokenValidator for Scoped {
        async fn validate(&self, credential: &Credential) -> Result<Principal, ValidationError> {
            match credential.token() {
                "reader" => Ok(Principal::new("1", ["svc-prod:read"])),
                "admin" => Ok(Principal::new("2", ["admin"])),
                _ => Err(ValidationError::Unauthorized),
            }
        }
    }

    struct Record(&'static str, Arc<Mutex<Vec<&'static str>>>);

    #[async_trait]
    impl Executor for Record {
        async fn exec(&self, _req: &mut Request) -> Reply {
            self.1.lock().unwrap().push(self.0);
            Reply::ok()
        }
    }

    fn context() -> Arc<Context> {
        Arc::new(Context::new(ServiceInfo::new("svc", "1.0.0"), Config::new("127.0.0.1", 0, "prod")))
    }

    async fn write(_req: Request) -> u16 {
        201
    }

    fn pipeline(log: &Arc<Mutex<Vec<&'static str>>>) -> Pipeline {
        let ctx = context();
        Pipeline::new(Arc::clone(&ctx))
            .middleware(auth::middleware(Arc::new(Scoped), &[]).unwrap().whitelist("/"))
            .middleware(perm::middleware(ctx.scope_key()))
            .middleware(Middleware::with_executor("Record", Record("user", Arc::clone(log))))
            .router(service_router(&ctx))
            .router(Router::new("items").route(Route::new(Method::Post, "/items", write).permission("write")))
            .router(not_found_router())
    }

    fn request(method: http::Method, path: &str, token: Option<&str>) -> Request {
        let mut builder = http::Request::builder().method(method).uri(path);
        if let Some(token) = token {
            builder = builder.header("authorization", format!("Bearer {token}"));
        }
        Request::from(builder.body(Bytes::new()).unwrap())
    }

    fn body(resp: &Response) -> serde_json::Value {
        serde_json::from_slice(resp.body()).unwrap()
    }

    #[tokio::test]
    async fn stages_keep_attachment_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let names: Vec<_> = pipeline(&log).stage_names().map(str::to_owned).collect();
        assert_eq!(names, ["AuthMiddleware", "PermMiddleware", "Record", "Service", "items", "Wildcard"]);
    }

    #[tokio::test]
    async fn missing_credentials_stop_at_auth() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let resp = pipeline(&log).handle(request(http::Method::POST, "/items", None)).await;
        assert_eq!(resp.status(), 401);
        assert!(log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn reader_lacks_write_scope() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let resp = pipeline(&log).handle(request(http::Method::POST, "/items", Some("reader"))).await;
        assert_eq!(resp.status(), 403);
        assert_eq!(body(&resp)["message"], "Missing scope svc-prod:write");
        assert_eq!(*log.lock().unwrap(), ["user"]);
    }

    #[tokio::test]
    async fn admin_reaches_the_handler() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let resp = pipeline(&log).handle(request(http::Method::POST, "/items", Some("admin"))).await;
        assert_eq!(resp.status(), 201);
    }

    #[tokio::test]
    async fn whitelisted_root_is_public() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let resp = pipeline(&log).handle(request(http::Method::GET, "/", None)).await;
        assert_eq!(resp.status(), 200);
        assert_eq!(body(&resp)["version"], "1.0.0");
    }

    #[tokio::test]
    async fn unknown_paths_fall_to_the_wildcard() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let resp = pipeline(&log).handle(request(http::Method::GET, "/nope", Some("reader"))).await;
        assert_eq!(resp.status(), 404);
        assert_eq!(body(&resp), serde_json::json!({"status": 404, "message": "Not Found"}));
    }

    #[tokio::test]
    async fn empty_pipeline_answers_404() {
        let resp = Pipeline::new(context()).handle(request(http::Method::GET, "/", None)).await;
        assert_eq!(resp.status(), 404);
    }
}
