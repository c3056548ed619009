//! Page-view tracking stage.
//!
//! Records one analytics hit per request that reaches it. Hits are sent in
//! the background; a slow or failing analytics endpoint never delays or
//! fails the request.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use crate::config::DEFAULT_OUTBOUND_TIMEOUT_MS;
use crate::error::Error;
use crate::middleware::{Executor, Middleware};
use crate::request::Request;
use crate::response::Reply;

pub const NAME: &str = "TrackMiddleware";

/// Measurement-protocol endpoint used by [`AnalyticsTracker`].
pub const DEFAULT_COLLECT_URL: &str = "https://www.google-analytics.com/collect";

/// One page-view hit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageView {
    /// Analytics property id.
    pub property: String,
    pub user_id: Option<String>,
    pub ip: Option<String>,
    pub user_agent: Option<String>,
    pub url: String,
    pub app_name: String,
    pub app_version: String,
    pub discord_user_id: Option<String>,
    pub account_name: Option<String>,
}

impl PageView {
    /// Measurement-protocol form fields.
    pub fn form_fields(&self) -> Vec<(&'static str, String)> {
        let client_id = self.user_id.clone().unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let mut fields = vec![
            ("v", "1".to_owned()),
            ("t", "pageview".to_owned()),
            ("tid", self.property.clone()),
            ("cid", client_id),
            ("dl", self.url.clone()),
            ("an", self.app_name.clone()),
            ("av", self.app_version.clone()),
        ];
        let optional = [
            ("uid", &self.user_id),
            ("uip", &self.ip),
            ("ua", &self.user_agent),
            ("cd1", &self.discord_user_id),
            ("cd2", &self.user_id),
            ("cd3", &self.account_name),
        ];
        fields.extend(optional.into_iter().filter_map(|(k, v)| v.clone().map(|v| (k, v))));
        fields
    }
}

/// Delivers page-view hits.
#[async_trait]
pub trait Tracker: Send + Sync + 'static {
    async fn pageview(&self, hit: PageView) -> anyhow::Result<()>;
}

/// Posts hits to a measurement-protocol endpoint.
pub struct AnalyticsTracker {
    client: reqwest::Client,
    endpoint: String,
}

impl AnalyticsTracker {
    pub fn new() -> Result<Self, Error> {
        Self::with_endpoint(DEFAULT_COLLECT_URL)
    }

    pub fn with_endpoint(endpoint: impl Into<String>) -> Result<Self, Error> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(DEFAULT_OUTBOUND_TIMEOUT_MS))
            .build()?;
        Ok(Self { client, endpoint: endpoint.into() })
    }
}

#[async_trait]
impl Tracker for AnalyticsTracker {
    async fn pageview(&self, hit: PageView) -> anyhow::Result<()> {
        self.client
            .post(&self.endpoint)
            .form(&hit.form_fields())
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

/// First address of `CF-Connecting-IP`, else `X-Forwarded-For`, else the
/// peer address.
pub fn client_ip(req: &Request) -> Option<String> {
    req.header("cf-connecting-ip")
        .or_else(|| req.header("x-forwarded-for"))
        .and_then(|list| list.split(',').next())
        .map(|ip| ip.trim().to_owned())
        .filter(|ip| !ip.is_empty())
        .or_else(|| req.remote_addr().map(|addr| addr.ip().to_string()))
}

/// `{proto}://{host}{path}[?query]` as the client saw it.
pub fn full_url(req: &Request) -> String {
    let proto = req.header("x-forwarded-proto").unwrap_or("http");
    let host = req.header("host").or_else(|| req.uri().host()).unwrap_or("localhost");
    let target = req.uri().path_and_query().map_or("/", |pq| pq.as_str());
    format!("{proto}://{host}{target}")
}

struct TrackExecutor {
    tracker: Arc<dyn Tracker>,
    property: String,
    app_name: String,
    app_version: String,
}

impl TrackExecutor {
    fn hit(&self, req: &Request) -> PageView {
        let principal = req.principal();
        PageView {
            property: self.property.clone(),
            user_id: principal.map(|p| p.id.clone()),
            ip: client_ip(req),
            user_agent: req.header("user-agent").map(str::to_owned),
            url: full_url(req),
            app_name: self.app_name.clone(),
            app_version: self.app_version.clone(),
            discord_user_id: principal.and_then(|p| p.discord_user_id.clone()),
            account_name: principal.and_then(|p| p.name.clone()),
        }
    }
}

#[async_trait]
impl Executor for TrackExecutor {
    async fn exec(&self, req: &mut Request) -> Reply {
        let hit = self.hit(req);
        let tracker = Arc::clone(&self.tracker);
        tokio::spawn(async move {
            if let Err(e) = tracker.pageview(hit).await {
                warn!(error = %e, "failed to send page view");
            }
        });
        Reply::ok()
    }
}

/// Builds the stage. `app_name` is conventionally `{service}_{environment}`.
pub fn middleware(
    tracker: Arc<dyn Tracker>,
    property: impl Into<String>,
    app_name: impl Into<String>,
    app_version: impl Into<String>,
) -> Middleware {
    Middleware::with_executor(NAME, TrackExecutor {
        tracker,
        property: property.into(),
        app_name: app_name.into(),
        app_version: app_version.into(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::Flow;
    use crate::permission::Principal;
    use bytes::Bytes;
    use tokio::sync::mpsc;

    struct ChannelTracker(mpsc::UnboundedSender<PageView>);

    #[async_trait]
    impl Tracker for ChannelTracker {
        async fn pageview(&self, hit: PageView) -> anyhow::Result<()> {
            self.0.send(hit)?;
            Ok(())
        }
    }

    struct FailingTracker;

    #[async_trait]
    impl Tracker for FailingTracker {
        async fn pageview(&self, _hit: PageView) -> anyhow::Result<()> {
            anyhow::bail!("analytics down")
        }
    }

    fn request(headers: &[(&str, &str)]) -> Request {
        let mut builder = http::Request::get("/items?page=2");
        for (k, v) in headers {
            builder = builder.header(*k, *v);
        }
        Request::from(builder.body(Bytes::new()).unwrap())
            .with_remote_addr("10.0.0.9:5555".parse().unwrap())
    }

    #[test]
    fn client_ip_prefers_cloudflare_header() {
        let req = request(&[("cf-connecting-ip", "1.1.1.1"), ("x-forwarded-for", "2.2.2.2")]);
        assert_eq!(client_ip(&req).as_deref(), Some("1.1.1.1"));
    }

    #[test]
    fn client_ip_takes_first_forwarded_entry() {
        let req = request(&[("x-forwarded-for", "3.3.3.3, 10.0.0.1")]);
        assert_eq!(client_ip(&req).as_deref(), Some("3.3.3.3"));
    }

    #[test]
    fn client_ip_falls_back_to_peer() {
        assert_eq!(client_ip(&request(&[])).as_deref(), Some("10.0.0.9"));
    }

    #[test]
    fn full_url_uses_forwarded_proto_and_host() {
        let req = request(&[("host", "api.example.com"), ("x-forwarded-proto", "https")]);
        assert_eq!(full_url(&req), "https://api.example.com/items?page=2");
    }

    #[test]
    fn form_fields_skip_absent_values() {
        let hit = PageView { property: "UA-1".into(), url: "http://x/".into(), ..PageView::default() };
        let fields = hit.form_fields();
        assert!(fields.contains(&("t", "pageview".to_owned())));
        assert!(!fields.iter().any(|(k, _)| *k == "uid"));
    }

    #[tokio::test]
    async fn records_hit_with_principal_dimensions() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mw = middleware(Arc::new(ChannelTracker(tx)), "UA-1", "svc_prod", "1.2.3");
        let mut req = request(&[("host", "svc"), ("user-agent", "curl/8")]);
        let mut alice = Principal::new("42", ["svc-prod"]);
        alice.name = Some("alice".into());
        req.set_principal(alice);

        assert!(matches!(mw.dispatch(&mut req).await, Flow::Proceed));
        let hit = rx.recv().await.unwrap();
        assert_eq!(hit.user_id.as_deref(), Some("42"));
        assert_eq!(hit.account_name.as_deref(), Some("alice"));
        assert_eq!(hit.app_name, "svc_prod");
        assert_eq!(hit.url, "http://svc/items?page=2");
    }

    #[tokio::test]
    async fn unreachable_collector_is_an_error() {
        let tracker = AnalyticsTracker::with_endpoint("http://127.0.0.1:9/collect").unwrap();
        let hit = PageView { property: "UA-1".into(), url: "http://x/".into(), ..PageView::default() };
        assert!(tracker.pageview(hit).await.is_err());
    }

    #[tokio::test]
    async fn tracker_failure_does_not_fail_request() {
        let mw = middleware(Arc::new(FailingTracker), "UA-1", "svc_prod", "1.2.3");
        let mut req = request(&[]);
        assert!(matches!(mw.dispatch(&mut req).await, Flow::Proceed));
    }
}
