//! Minimal kiln service: a notes API backed by an in-memory "cache".
//!
//! Run with:
//!   RUST_LOG=info cargo run --example basic
//!
//! Try:
//!   curl http://localhost:3000/
//!   curl http://localhost:3000/permnode
//!   curl http://localhost:3000/notes/1
//!   curl -X POST http://localhost:3000/notes \
//!        -H 'authorization: Bearer <token>' \
//!        -d 'buy milk'
//!
//! Write routes need a token the account service at `validation_host`
//! accepts, carrying the `basic-dev:write` scope.

use std::any::Any;
use std::collections::HashMap;
use std::process::ExitCode;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use kiln::resource::{CacheTarget, Capability, Connector, Resource};
use kiln::{App, Json, Method, Request, Route, Router, ServiceInfo, Status};

#[tokio::main]
async fn main() -> ExitCode {
    let notes = Router::new("notes")
        .route(Route::new(Method::Get, "/notes/:id", get_note).require_account(false))
        .route(Route::new(Method::Post, "/notes", create_note).permission("write"))
        .route(
            Route::new(Method::Delete, "/notes/:id", delete_note)
                .alias(Method::Post, "/notes/:id/delete")
                .permission("write"),
        );

    App::new(ServiceInfo::new("basic", env!("CARGO_PKG_VERSION")))
        .config_path(concat!(env!("CARGO_MANIFEST_DIR"), "/demos/config/main.json"))
        .perm_nodes_path(concat!(env!("CARGO_MANIFEST_DIR"), "/demos/permNodes.json"))
        .connector(Capability::Cache, MemoryConnector)
        .router(notes)
        .run()
        .await
}

// ── Handlers ──────────────────────────────────────────────────────────────────

fn store(req: &Request) -> anyhow::Result<&MemoryCache> {
    req.context()
        .and_then(|ctx| ctx.cache_as::<MemoryCache>())
        .ok_or_else(|| anyhow::anyhow!("cache is not connected"))
}

// GET /notes/:id → {status: 200, id, text} or 404
async fn get_note(req: Request) -> anyhow::Result<Json<serde_json::Value>> {
    let id = req.param("id").unwrap_or_default();
    Ok(Json(match store(&req)?.get(id) {
        Some(text) => serde_json::json!({ "id": id, "text": text }),
        None => serde_json::json!({ "status": 404 }),
    }))
}

// POST /notes → 201 {id}
async fn create_note(req: Request) -> anyhow::Result<Json<serde_json::Value>> {
    let text = std::str::from_utf8(req.body())?.trim();
    if text.is_empty() {
        return Ok(Json(serde_json::json!({ "status": 400, "message": "note text is required" })));
    }
    let id = store(&req)?.insert(text);
    Ok(Json(serde_json::json!({ "status": 201, "id": id })))
}

// DELETE /notes/:id → 204, or 404
async fn delete_note(req: Request) -> anyhow::Result<Status> {
    let removed = store(&req)?.remove(req.param("id").unwrap_or_default());
    Ok(if removed { Status::NoContent } else { Status::NotFound })
}

// ── In-memory cache resource ──────────────────────────────────────────────────

struct MemoryCache {
    prefix: String,
    next: AtomicU64,
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryCache {
    fn key(&self, id: &str) -> String {
        format!("{}:{id}", self.prefix)
    }

    fn get(&self, id: &str) -> Option<String> {
        self.entries.lock().ok()?.get(&self.key(id)).cloned()
    }

    fn insert(&self, text: &str) -> String {
        let id = (self.next.fetch_add(1, Ordering::Relaxed) + 1).to_string();
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert(self.key(&id), text.to_owned());
        }
        id
    }

    fn remove(&self, id: &str) -> bool {
        self.entries.lock().map(|mut e| e.remove(&self.key(id)).is_some()).unwrap_or(false)
    }
}

#[async_trait::async_trait]
impl Resource for MemoryCache {
    fn name(&self) -> &str {
        "memory-cache"
    }

    async fn close(&self) -> anyhow::Result<()> {
        let entries = self.entries.lock().map(|e| e.len()).unwrap_or(0);
        tracing::info!(entries, "dropping in-memory cache");
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

struct MemoryConnector;

#[async_trait::async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, url: &str) -> anyhow::Result<Arc<dyn Resource>> {
        let target = CacheTarget::parse(url)?;
        tracing::info!(host = %target.host, port = target.port, "pretending to connect to cache");
        Ok(Arc::new(MemoryCache {
            prefix: target.prefix.unwrap_or_else(|| "notes".into()),
            next: AtomicU64::new(0),
            entries: Mutex::new(HashMap::new()),
        }))
    }
}
