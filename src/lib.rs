//! # kiln
//!
//! A small toolkit for internal HTTP services: authenticated, permission
//! gated JSON endpoints behind a reverse proxy, registered with a discovery
//! agent, with a boot and shutdown sequence you can rely on.
//!
//! ## The request pipeline
//!
//! Every request walks the same ordered chain:
//!
//! ```text
//! auth ─▶ track* ─▶ perm ─▶ your middleware ─▶ service router ─▶ your routers ─▶ 404
//! ```
//!
//! - **auth** validates the `Authorization` header against the account
//!   service and attaches the [`Principal`].
//! - **track** (only when `track` is configured) sends a page view.
//! - **perm** turns the principal's scopes into permissions for this
//!   service (`{name}-{env}:{permission}`).
//! - Routers gate each [`Route`] on its permissions before the handler runs.
//!
//! Whatever a stage or handler returns is normalised into one envelope:
//! `{"status": 403, "message": "Missing scope svc-prod:write"}`.
//!
//! ## Lifecycle
//!
//! [`App::run`] loads `config/main.json`, opens the configured resources,
//! starts the listener, registers with Consul and waits for SIGTERM. Then it
//! unregisters, drains in-flight requests, closes resources and returns the
//! process exit code.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use kiln::{App, Method, Request, Route, Router, ServiceInfo, Status};
//!
//! #[tokio::main]
//! async fn main() -> std::process::ExitCode {
//!     let users = Router::new("users")
//!         .route(Route::new(Method::Get, "/users/:id", get_user).permission("read"))
//!         .route(Route::new(Method::Post, "/users", create_user).permission("write"));
//!
//!     App::new(ServiceInfo::new(env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION")))
//!         .router(users)
//!         .run()
//!         .await
//! }
//!
//! async fn get_user(req: Request) -> serde_json::Value {
//!     serde_json::json!({ "id": req.param("id") })
//! }
//!
//! async fn create_user(req: Request) -> Status {
//!     if req.body().is_empty() {
//!         return Status::BadRequest;
//!     }
//!     Status::Created
//! }
//! ```

mod app;
mod context;
mod error;
mod handler;
mod method;
mod pipeline;
mod request;
mod response;
mod router;
mod server;

pub mod config;
pub mod discovery;
pub mod middleware;
pub mod pattern;
pub mod permission;
pub mod resource;
pub mod status;
pub mod telemetry;

pub use app::{App, DiscoveryFactory, Hooks, Phase, ShutdownReport};
pub use config::Config;
pub use context::{Context, ServiceInfo};
pub use error::Error;
pub use handler::{default_error_handler, ErrorHandler, Handler};
pub use method::{Method, UnknownMethod};
pub use pipeline::Pipeline;
pub use permission::{Perms, Principal};
pub use request::Request;
pub use response::{Envelope, IntoReply, Json, Payload, Reply, Response, ResponseBuilder};
pub use router::{not_found_router, service_router, Route, Routed, Router};
pub use server::{shutdown_signal, Server};
pub use status::Status;
