//! Logging and error reporting around boot failures and request faults.
//!
//! Runs in its own binary: the subscriber and the reporter are process-wide.

mod common;

use std::sync::Mutex;

use common::{base_config, missing_path, temp_json, TokenScopes};
use kiln::telemetry::Reporter;
use kiln::{App, Method, Request, Route, Router, ServiceInfo};
use reqwest::StatusCode;

static CAPTURED: Mutex<Vec<String>> = Mutex::new(Vec::new());

/// Every test installs the same reporter type, so concurrent tests append
/// to one list and assert with `contains`.
struct Recording;

impl Reporter for Recording {
    fn capture(&self, message: &str) {
        CAPTURED.lock().unwrap().push(message.to_owned());
    }
}

fn captured_any(needle: &str) -> bool {
    CAPTURED.lock().unwrap().iter().any(|m| m.contains(needle))
}

#[tokio::test]
async fn config_failures_are_logged_and_reported() {
    let code = App::new(ServiceInfo::new("svc", "1.0.0"))
        .config_path(missing_path())
        .reporter(Recording)
        .run()
        .await;

    assert_eq!(format!("{code:?}"), format!("{:?}", std::process::ExitCode::FAILURE));
    // The subscriber exists before the config file is read.
    assert!(tracing::dispatcher::has_been_set());
    assert!(captured_any("boot failed: configuration"));
}

#[tokio::test]
async fn handler_errors_and_panics_are_reported_once() {
    async fn failing(_req: Request) -> anyhow::Result<u16> {
        anyhow::bail!("db down")
    }
    async fn panicking(_req: Request) -> u16 {
        panic!("handler bug")
    }

    let app = App::new(ServiceInfo::new("svc", "1.0.0"))
        .config_path(temp_json(&base_config()))
        .perm_nodes_path(missing_path())
        .validator(TokenScopes)
        .reporter(Recording)
        .router(
            Router::new("faulty")
                .route(Route::new(Method::Get, "/failing", failing).require_account(false))
                .route(Route::new(Method::Get, "/panicking", panicking).require_account(false)),
        );
    app.init().await.unwrap();
    let addr = app.local_addr().await.unwrap();
    let client = reqwest::Client::new();

    for path in ["/failing", "/panicking"] {
        let resp = client.get(format!("http://{addr}{path}")).bearer_auth("gina:").send().await.unwrap();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
    app.shutdown().await;

    assert!(captured_any("db down"));
    let panics = CAPTURED.lock().unwrap().iter().filter(|m| m.contains("handler bug")).count();
    assert_eq!(panics, 1);
}
