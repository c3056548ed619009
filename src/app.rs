//! Application lifecycle: boot, serve, shut down.
//!
//! ```text
//! Uninitialized ─init─▶ Loading ─▶ Loaded ─▶ Starting ─▶ Initialized
//!                          │          │          │             │
//!                          └──────────┴──────────┴─▶ Failed    │
//!                                                   shutdown ◀─┘
//!                                                       ▼
//!                                          ShuttingDown ─▶ Terminated
//! ```
//!
//! [`App::init`] is run-once and fail-fast: any failing step tears down what
//! was already started and leaves the app in [`Phase::Failed`].
//! [`App::shutdown`] runs its teardown exactly once no matter how many
//! callers race it; every caller receives the same [`ShutdownReport`].
//! From `init` on, SIGTERM or SIGINT triggers the same shutdown.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify, OnceCell};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{load_perm_nodes, Config, Paths, RegistrationConfig};
use crate::context::{Context, ServiceInfo};
use crate::discovery::{ConsulRegistrator, Discovery, Registration};
use crate::error::Error;
use crate::middleware::auth::{self, HttpValidator, TokenValidator};
use crate::middleware::track::{self, AnalyticsTracker, Tracker};
use crate::middleware::{perm, Middleware};
use crate::pipeline::Pipeline;
use crate::resource::{Capability, Connector, Resources};
use crate::router::{not_found_router, service_router, Router};
use crate::server::{shutdown_signal, Server};
use crate::telemetry::{self, Reporter, SentryReporter};

/// Callbacks at the lifecycle milestones. Every method defaults to a no-op;
/// an error from any of them aborts boot.
#[async_trait]
pub trait Hooks: Send + Sync + 'static {
    /// Before configuration is read.
    async fn on_load(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// After configuration is read, before resources are opened. The
    /// context carries no resources yet.
    async fn on_loaded(&self, _ctx: &Context) -> anyhow::Result<()> {
        Ok(())
    }

    /// After the listener is up and the service is registered.
    async fn on_initialized(&self, _ctx: &Context) -> anyhow::Result<()> {
        Ok(())
    }
}

struct NoHooks;

impl Hooks for NoHooks {}

/// Builds the discovery client from the registration settings.
pub type DiscoveryFactory = Box<dyn Fn(&RegistrationConfig) -> Result<Arc<dyn Discovery>, Error> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Uninitialized,
    Loading,
    Loaded,
    Starting,
    Initialized,
    Failed,
    ShuttingDown,
    Terminated,
}

/// Outcome of [`App::shutdown`]: one message per failed teardown step.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    pub errors: Vec<String>,
}

impl ShutdownReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }

    /// `0` when clean, `1` otherwise.
    pub fn code(&self) -> u8 {
        u8::from(!self.is_clean())
    }

    pub fn exit_code(&self) -> ExitCode {
        ExitCode::from(self.code())
    }
}

struct Listener {
    addr: SocketAddr,
    stop: CancellationToken,
    task: JoinHandle<Result<(), Error>>,
}

/// User stages, moved into the pipeline at boot.
#[derive(Default)]
struct Staged {
    middlewares: Vec<Middleware>,
    routers: Vec<Router>,
}

/// Everything `init` creates and `shutdown` destroys.
struct Lifecycle {
    phase: Phase,
    context: Option<Arc<Context>>,
    resources: Resources,
    listener: Option<Listener>,
    registration: Option<(Arc<dyn Discovery>, String)>,
}

impl Lifecycle {
    /// Unregister, stop the listener, close resources. Each step runs even
    /// if an earlier one failed; each is skipped when there is nothing to
    /// undo.
    async fn teardown(&mut self) -> Vec<String> {
        let mut errors = Vec::new();

        if let Some((discovery, id)) = self.registration.take() {
            if let Err(e) = discovery.unregister(&id).await {
                errors.push(format!("unregistering {id}: {e}"));
            }
        }

        if let Some(listener) = self.listener.take() {
            listener.stop.cancel();
            match listener.task.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => errors.push(format!("listener on {}: {e}", listener.addr)),
                Err(e) => errors.push(format!("listener task on {}: {e}", listener.addr)),
            }
        }

        errors.extend(self.resources.close_all().await);
        errors
    }
}

/// Lifecycle state shared with the signal watcher.
struct Shared {
    state: Mutex<Lifecycle>,
    stopped: OnceCell<ShutdownReport>,
    done: CancellationToken,
}

impl Shared {
    async fn shutdown(&self) -> ShutdownReport {
        let report = self.stopped
            .get_or_init(|| async {
                let mut state = self.state.lock().await;
                info!("shutting down");
                state.phase = Phase::ShuttingDown;
                let errors = state.teardown().await;
                state.phase = Phase::Terminated;

                for e in &errors {
                    error!(error = %e, "shutdown step failed");
                    telemetry::report(&format!("shutdown step failed: {e}"));
                }
                if errors.is_empty() {
                    info!("shutdown complete");
                }
                telemetry::flush_reporter().await;
                ShutdownReport { errors }
            })
            .await
            .clone();
        self.done.cancel();
        report
    }
}

/// A kiln service.
///
/// ```rust,no_run
/// use kiln::{App, Method, Request, Route, Router, ServiceInfo};
///
/// async fn hello(_req: Request) -> serde_json::Value {
///     serde_json::json!({ "message": "hello" })
/// }
///
/// #[tokio::main]
/// async fn main() -> std::process::ExitCode {
///     App::new(ServiceInfo::new(env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION")))
///         .router(Router::new("hello").route(Route::new(Method::Get, "/hello", hello)))
///         .run()
///         .await
/// }
/// ```
pub struct App {
    info: ServiceInfo,
    paths: Paths,
    preset_config: Option<Config>,
    json_logs: bool,
    hooks: Arc<dyn Hooks>,
    connectors: HashMap<Capability, Arc<dyn Connector>>,
    validator: Option<Arc<dyn TokenValidator>>,
    tracker: Option<Arc<dyn Tracker>>,
    reporter: Option<Arc<dyn Reporter>>,
    discovery: Option<DiscoveryFactory>,
    staged: Mutex<Staged>,
    shared: Arc<Shared>,
    watcher: StdMutex<Option<JoinHandle<()>>>,
    fault: Arc<Notify>,
}

impl App {
    pub fn new(info: ServiceInfo) -> Self {
        Self {
            info,
            paths: Paths::default(),
            preset_config: None,
            json_logs: false,
            hooks: Arc::new(NoHooks),
            connectors: HashMap::new(),
            validator: None,
            tracker: None,
            reporter: None,
            discovery: None,
            staged: Mutex::new(Staged::default()),
            shared: Arc::new(Shared {
                state: Mutex::new(Lifecycle {
                    phase: Phase::Uninitialized,
                    context: None,
                    resources: Resources::default(),
                    listener: None,
                    registration: None,
                }),
                stopped: OnceCell::new(),
                done: CancellationToken::new(),
            }),
            watcher: StdMutex::new(None),
            fault: Arc::new(Notify::new()),
        }
    }

    // ── Builder ───────────────────────────────────────────────────────────────

    /// Main configuration file. Defaults to `config/main.json`.
    pub fn config_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.paths.config = path.into();
        self
    }

    /// Permission-node manifest. Defaults to `permNodes.json`.
    pub fn perm_nodes_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.paths.perm_nodes = path.into();
        self
    }

    /// Uses `config` instead of reading the configuration file.
    pub fn with_config(mut self, config: Config) -> Self {
        self.preset_config = Some(config);
        self
    }

    /// JSON log lines instead of human-readable ones.
    pub fn json_logs(mut self, json: bool) -> Self {
        self.json_logs = json;
        self
    }

    pub fn hooks(mut self, hooks: impl Hooks) -> Self {
        self.hooks = Arc::new(hooks);
        self
    }

    /// Attaches a middleware after the built-in ones, in call order.
    pub fn middleware(mut self, middleware: Middleware) -> Self {
        self.staged.get_mut().middlewares.push(middleware);
        self
    }

    /// Attaches a router after the service router, in call order.
    pub fn router(mut self, router: Router) -> Self {
        self.staged.get_mut().routers.push(router);
        self
    }

    /// Registers the client used when `capability`'s URL is configured.
    pub fn connector(mut self, capability: Capability, connector: impl Connector) -> Self {
        self.connectors.insert(capability, Arc::new(connector));
        self
    }

    /// Replaces the HTTP account validator.
    pub fn validator(mut self, validator: impl TokenValidator) -> Self {
        self.validator = Some(Arc::new(validator));
        self
    }

    /// Replaces the analytics tracker.
    pub fn tracker(mut self, tracker: impl Tracker) -> Self {
        self.tracker = Some(Arc::new(tracker));
        self
    }

    /// Replaces the error reporter built from the `sentry` DSN. Installed
    /// before configuration is read, so it also sees config failures.
    pub fn reporter(mut self, reporter: impl Reporter) -> Self {
        self.reporter = Some(Arc::new(reporter));
        self
    }

    /// Replaces the Consul registrator.
    pub fn discovery(
        mut self,
        factory: impl Fn(&RegistrationConfig) -> Result<Arc<dyn Discovery>, Error> + Send + Sync + 'static,
    ) -> Self {
        self.discovery = Some(Box::new(factory));
        self
    }

    // ── Introspection ─────────────────────────────────────────────────────────

    pub async fn phase(&self) -> Phase {
        self.shared.state.lock().await.phase
    }

    /// The bound address, while the listener runs.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.shared.state.lock().await.listener.as_ref().map(|l| l.addr)
    }

    pub async fn context(&self) -> Option<Arc<Context>> {
        self.shared.state.lock().await.context.clone()
    }

    // ── Lifecycle ─────────────────────────────────────────────────────────────

    /// Boots the application. Returns immediately if already initialised.
    ///
    /// # Errors
    ///
    /// Returns the first failing step's error. Whatever had been started is
    /// torn down first, and later calls fail with [`Error::BootFailed`].
    pub async fn init(&self) -> Result<(), Error> {
        let mut state = self.shared.state.lock().await;
        match state.phase {
            Phase::Initialized => return Ok(()),
            Phase::Failed => return Err(Error::BootFailed),
            Phase::ShuttingDown | Phase::Terminated => return Err(Error::ShutDown),
            _ => {}
        }

        // Logging and fault capture come first so that a bad config file is
        // still visible.
        if telemetry::init(telemetry::DEFAULT_LOG_LEVEL, self.json_logs).is_err() {
            debug!("keeping existing subscriber");
        }
        telemetry::install_panic_hook();
        if let Some(reporter) = &self.reporter {
            telemetry::set_reporter(Arc::clone(reporter));
        }
        self.watch_signals();

        match self.boot(&mut state).await {
            Ok(()) => Ok(()),
            Err(e) => {
                error!(error = %e, "boot failed");
                telemetry::report(&format!("boot failed: {e}"));
                for err in state.teardown().await {
                    warn!(error = %err, "cleanup after failed boot");
                }
                state.phase = Phase::Failed;
                self.stop_watching();
                Err(e)
            }
        }
    }

    async fn boot(&self, state: &mut Lifecycle) -> Result<(), Error> {
        state.phase = Phase::Loading;
        self.hooks.on_load().await.map_err(|source| Error::Hook { hook: "on_load", source })?;

        let config = match &self.preset_config {
            Some(config) => {
                config.validate()?;
                config.clone()
            }
            None => Config::load(&self.paths.config)?,
        };
        if let Err(e) = telemetry::set_level(&config.log_level) {
            debug!("log level left unchanged: {e}");
        }
        if let (None, Some(dsn)) = (&self.reporter, config.sentry_dsn()) {
            telemetry::set_reporter(Arc::new(SentryReporter::new(dsn, &self.info.version, &config.env)?));
            info!("error reporting enabled");
        }
        let perm_nodes = load_perm_nodes(&self.paths.perm_nodes).await;

        state.phase = Phase::Loaded;
        let loaded = Context::new(self.info.clone(), config).with_perm_nodes(perm_nodes);
        self.hooks.on_loaded(&loaded).await.map_err(|source| Error::Hook { hook: "on_loaded", source })?;

        state.phase = Phase::Starting;
        let discovery = match loaded.config.registration() {
            Some(registration) => Some(self.discovery_client(registration)?),
            None => None,
        };
        state.resources = Resources::open(&loaded.config, &self.connectors).await?;
        let ctx = Arc::new(loaded.with_resources(state.resources.clone()));
        state.context = Some(Arc::clone(&ctx));

        let pipeline = self.pipeline(&ctx).await?;
        let server = Server::bind(&ctx.config.host, ctx.config.port).await?;
        let addr = server.local_addr();
        let stop = CancellationToken::new();
        let task = {
            let stop = stop.clone();
            let fault = Arc::clone(&self.fault);
            tokio::spawn(async move {
                let result = server.serve(Arc::new(pipeline), stop.clone()).await;
                if !stop.is_cancelled() {
                    fault.notify_one();
                }
                result
            })
        };
        state.listener = Some(Listener { addr, stop, task });

        if let (Some(discovery), Some(settings)) = (discovery, ctx.config.registration()) {
            let registration = Registration::new(
                ctx.info.service_name(),
                &ctx.config.env,
                addr.port(),
                settings.checks.clone(),
            );
            discovery.register(&registration).await?;
            state.registration = Some((discovery, registration.id));
        }

        state.phase = Phase::Initialized;
        info!(%addr, service = %ctx.info.name, version = %ctx.info.version, "application initialized");
        self.hooks.on_initialized(&ctx).await.map_err(|source| Error::Hook { hook: "on_initialized", source })?;
        Ok(())
    }

    fn discovery_client(&self, registration: &RegistrationConfig) -> Result<Arc<dyn Discovery>, Error> {
        match &self.discovery {
            Some(factory) => factory(registration),
            None => Ok(Arc::new(ConsulRegistrator::new(registration)?)),
        }
    }

    /// auth → track (when configured) → perm → user middleware → service
    /// router → user routers → not-found router.
    async fn pipeline(&self, ctx: &Arc<Context>) -> Result<Pipeline, Error> {
        let validator: Arc<dyn TokenValidator> = match &self.validator {
            Some(validator) => Arc::clone(validator),
            None => Arc::new(HttpValidator::new(&ctx.config.validation_host, ctx.user_agent())?),
        };

        let mut pipeline = Pipeline::new(Arc::clone(ctx))
            .middleware(auth::middleware(validator, &ctx.config.whitelist)?);

        if let Some(property) = &ctx.config.track {
            let tracker: Arc<dyn Tracker> = match &self.tracker {
                Some(tracker) => Arc::clone(tracker),
                None => Arc::new(AnalyticsTracker::new()?),
            };
            pipeline = pipeline.middleware(track::middleware(tracker, property, ctx.app_name(), &ctx.info.version));
        }

        let mut staged = self.staged.lock().await;
        pipeline = pipeline.middleware(perm::middleware(ctx.scope_key()));
        for middleware in staged.middlewares.drain(..) {
            pipeline = pipeline.middleware(middleware);
        }

        pipeline = pipeline.router(service_router(ctx));
        for router in staged.routers.drain(..) {
            pipeline = pipeline.router(router);
        }
        Ok(pipeline.router(not_found_router()))
    }

    /// Tears the application down: unregister from discovery, drain and
    /// stop the listener, close resources.
    ///
    /// Safe to call any number of times from any number of tasks. The
    /// teardown runs once; every caller gets its report.
    pub async fn shutdown(&self) -> ShutdownReport {
        let report = self.shared.shutdown().await;
        self.stop_watching();
        report
    }

    /// Starts the task that shuts the app down on SIGTERM/SIGINT. Once per
    /// app.
    fn watch_signals(&self) {
        let Ok(mut slot) = self.watcher.lock() else { return };
        if slot.is_some() || self.shared.stopped.initialized() {
            return;
        }
        let shared = Arc::clone(&self.shared);
        *slot = Some(tokio::spawn(async move {
            shutdown_signal().await;
            info!("termination signal received");
            shared.shutdown().await;
        }));
    }

    fn stop_watching(&self) {
        let watcher = self.watcher.lock().ok().and_then(|mut slot| slot.take());
        if let Some(watcher) = watcher {
            watcher.abort();
        }
    }

    /// Boots, serves until SIGTERM/SIGINT or until the listener dies, then
    /// shuts down. The exit code is non-zero on a boot failure, a listener
    /// failure or any shutdown error.
    pub async fn run(self) -> ExitCode {
        if let Err(e) = self.init().await {
            error!(error = %e, "fatal boot error");
            self.shutdown().await;
            return ExitCode::FAILURE;
        }

        let faulted = tokio::select! {
            () = self.shared.done.cancelled() => false,
            () = self.fault.notified() => {
                error!("listener stopped unexpectedly");
                telemetry::report("listener stopped unexpectedly");
                true
            }
        };

        let report = self.shutdown().await;
        if faulted { ExitCode::FAILURE } else { report.exit_code() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::auth::{Credential, ValidationError};
    use crate::permission::Principal;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct AcceptAll;

    #[async_trait]
    impl TokenValidator for AcceptAll {
        async fn validate(&self, _credential: &Credential) -> Result<Principal, ValidationError> {
            Ok(Principal::new("1", ["admin"]))
        }
    }

    #[derive(Default)]
    struct CountingHooks {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Hooks for CountingHooks {
        async fn on_load(&self) -> anyhow::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        async fn on_initialized(&self, _ctx: &Context) -> anyhow::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct FailingLoaded;

    #[async_trait]
    impl Hooks for FailingLoaded {
        async fn on_loaded(&self, _ctx: &Context) -> anyhow::Result<()> {
            anyhow::bail!("not today")
        }
    }

    fn app() -> App {
        App::new(ServiceInfo::new("svc", "1.0.0"))
            .with_config(Config::new("127.0.0.1", 0, "test"))
            .perm_nodes_path(std::env::temp_dir().join("kiln-app-no-perm-nodes.json"))
            .validator(AcceptAll)
    }

    #[test]
    fn report_codes() {
        assert_eq!(ShutdownReport::default().code(), 0);
        assert_eq!(ShutdownReport { errors: vec!["x".into()] }.code(), 1);
    }

    #[tokio::test]
    async fn init_is_idempotent() {
        let hooks = CountingHooks::default();
        let calls = Arc::clone(&hooks.calls);
        let app = app().hooks(hooks);

        app.init().await.unwrap();
        let addr = app.local_addr().await;
        app.init().await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(app.local_addr().await, addr);
        assert_eq!(app.phase().await, Phase::Initialized);
        assert!(app.shutdown().await.is_clean());
        assert_eq!(app.phase().await, Phase::Terminated);
    }

    #[tokio::test]
    async fn failing_hook_aborts_boot_without_listener() {
        let app = app().hooks(FailingLoaded);
        let err = app.init().await.unwrap_err();
        assert!(matches!(err, Error::Hook { hook: "on_loaded", .. }));
        assert_eq!(app.phase().await, Phase::Failed);
        assert!(app.local_addr().await.is_none());
        assert!(matches!(app.init().await, Err(Error::BootFailed)));
    }

    #[tokio::test]
    async fn init_after_shutdown_is_refused() {
        let app = app();
        assert!(app.shutdown().await.is_clean());
        assert!(matches!(app.init().await, Err(Error::ShutDown)));
    }

    #[tokio::test]
    async fn invalid_preset_config_fails_boot() {
        let app = App::new(ServiceInfo::new("svc", "1.0.0")).with_config(Config::new("127.0.0.1", 0, ""));
        assert!(matches!(app.init().await, Err(Error::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn init_watches_signals_until_shutdown() {
        let app = app();
        app.init().await.unwrap();
        assert!(app.watcher.lock().unwrap().is_some());
        assert!(!app.shared.done.is_cancelled());

        assert!(app.shutdown().await.is_clean());
        assert!(app.watcher.lock().unwrap().is_none());
        assert!(app.shared.done.is_cancelled());
    }

    #[tokio::test]
    async fn failed_boot_stops_watching_signals() {
        let app = app().hooks(FailingLoaded);
        assert!(app.init().await.is_err());
        assert!(app.watcher.lock().unwrap().is_none());
    }

    #[tokio::test]
    async fn watcher_shutdown_is_shared_with_callers() {
        let app = app();
        app.init().await.unwrap();
        // What the watcher runs on a signal.
        let from_signal = Arc::clone(&app.shared).shutdown().await;
        assert_eq!(app.phase().await, Phase::Terminated);
        assert_eq!(app.shutdown().await, from_signal);
    }
}
