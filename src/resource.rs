//! Auxiliary resources: the cache and data-store handles opened at boot.
//!
//! kiln does not ship a redis or mongo client. The application plugs a
//! [`Connector`] in for each capability it uses; kiln opens the handle once
//! when the matching URL is configured, shares it through the
//! [`Context`](crate::Context), and closes it last during shutdown.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::config::Config;
use crate::error::Error;

/// An opened connection owned by the application lifecycle.
#[async_trait]
pub trait Resource: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Releases the connection. Called at most once, during shutdown.
    async fn close(&self) -> anyhow::Result<()>;

    /// Downcast hook; implement as `self`.
    fn as_any(&self) -> &dyn Any;
}

/// Opens a [`Resource`] from its configured URL.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, url: &str) -> anyhow::Result<Arc<dyn Resource>>;
}

/// The optional resources a service may configure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    /// Key-value cache, configured by `redis`.
    Cache,
    /// Document store, configured by `mongo`.
    Store,
}

impl Capability {
    /// Boot order. Shutdown closes in reverse.
    pub const ALL: [Capability; 2] = [Capability::Cache, Capability::Store];

    /// The configuration key holding this capability's URL.
    pub fn config_key(self) -> &'static str {
        match self {
            Self::Cache => "redis",
            Self::Store => "mongo",
        }
    }

    pub fn url(self, config: &Config) -> Option<&str> {
        match self {
            Self::Cache => config.redis.as_deref(),
            Self::Store => config.mongo.as_deref(),
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.config_key())
    }
}

/// The resources opened for one application instance. Clones share the
/// same handles.
#[derive(Default, Clone)]
pub struct Resources {
    opened: Vec<(Capability, Arc<dyn Resource>)>,
}

impl Resources {
    /// Opens every configured capability in [`Capability::ALL`] order.
    ///
    /// Unconfigured capabilities are skipped. A configured capability without
    /// a connector, or whose connector fails, is an error; whatever was
    /// already opened is closed before returning it.
    pub async fn open(config: &Config, connectors: &HashMap<Capability, Arc<dyn Connector>>) -> Result<Self, Error> {
        let mut resources = Self::default();
        for capability in Capability::ALL {
            let Some(url) = capability.url(config) else { continue };
            match Self::connect(capability, url, connectors).await {
                Ok(resource) => {
                    info!(capability = %capability, resource = resource.name(), "resource connected");
                    resources.opened.push((capability, resource));
                }
                Err(e) => {
                    for err in resources.close_all().await {
                        warn!(error = %err, "cleanup after failed connect");
                    }
                    return Err(e);
                }
            }
        }
        Ok(resources)
    }

    async fn connect(
        capability: Capability,
        url: &str,
        connectors: &HashMap<Capability, Arc<dyn Connector>>,
    ) -> Result<Arc<dyn Resource>, Error> {
        let connector = connectors.get(&capability).ok_or_else(|| Error::Resource {
            name: capability.to_string(),
            source: anyhow::anyhow!("`{}` is configured but no connector is registered", capability.config_key()),
        })?;
        connector
            .connect(url)
            .await
            .map_err(|source| Error::Resource { name: capability.to_string(), source })
    }

    pub fn get(&self, capability: Capability) -> Option<&Arc<dyn Resource>> {
        self.opened.iter().find(|(c, _)| *c == capability).map(|(_, r)| r)
    }

    /// Typed access to an opened resource.
    pub fn downcast<T: Any>(&self, capability: Capability) -> Option<&T> {
        self.get(capability).and_then(|r| r.as_any().downcast_ref::<T>())
    }

    pub fn is_empty(&self) -> bool {
        self.opened.is_empty()
    }

    /// Closes every resource, newest first, and empties the set. Returns
    /// one message per failed close; a failure never stops the others.
    pub async fn close_all(&mut self) -> Vec<String> {
        let mut errors = Vec::new();
        while let Some((capability, resource)) = self.opened.pop() {
            match resource.close().await {
                Ok(()) => info!(capability = %capability, "resource closed"),
                Err(e) => errors.push(format!("closing {capability}: {e:#}")),
            }
        }
        errors
    }
}

impl fmt::Debug for Resources {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.opened.iter().map(|(c, r)| format!("{c}={}", r.name())))
            .finish()
    }
}

/// Default cache port.
pub const DEFAULT_CACHE_PORT: u16 = 6379;

/// A parsed `redis://[password@]host[:port][/prefix]` URL, for connectors
/// that need the pieces rather than the string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheTarget {
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
    /// Key prefix applied by the client, without the leading slash.
    pub prefix: Option<String>,
}

impl CacheTarget {
    pub fn parse(url: &str) -> Result<Self, Error> {
        let invalid = |why: &str| Error::InvalidConfig(format!("redis url `{url}`: {why}"));
        let rest = url.strip_prefix("redis://").ok_or_else(|| invalid("expected the redis:// scheme"))?;

        let (password, rest) = match rest.rsplit_once('@') {
            // `user:password@` and `:password@` carry the password last.
            Some((auth, rest)) => {
                let password = auth.rsplit_once(':').map_or(auth, |(_, p)| p);
                (Some(password.to_owned()).filter(|p| !p.is_empty()), rest)
            }
            None => (None, rest),
        };

        let (authority, prefix) = match rest.split_once('/') {
            Some((authority, prefix)) => (authority, Some(prefix.to_owned()).filter(|p| !p.is_empty())),
            None => (rest, None),
        };

        let (host, port) = match authority.rsplit_once(':') {
            Some((host, port)) => (host, port.parse().map_err(|_| invalid("port is not a number"))?),
            None => (authority, DEFAULT_CACHE_PORT),
        };
        let host = if host.is_empty() { "127.0.0.1" } else { host };

        Ok(Self { host: host.to_owned(), port, password, prefix })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Memory {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
        fail_close: bool,
    }

    #[async_trait]
    impl Resource for Memory {
        fn name(&self) -> &str {
            self.name
        }
        async fn close(&self) -> anyhow::Result<()> {
            self.log.lock().unwrap().push(format!("close {}", self.name));
            if self.fail_close {
                anyhow::bail!("{} refused to close", self.name);
            }
            Ok(())
        }
        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    struct MemoryConnector {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
        fail_close: bool,
    }

    #[async_trait]
    impl Connector for MemoryConnector {
        async fn connect(&self, url: &str) -> anyhow::Result<Arc<dyn Resource>> {
            self.log.lock().unwrap().push(format!("open {} {url}", self.name));
            Ok(Arc::new(Memory { name: self.name, log: Arc::clone(&self.log), fail_close: self.fail_close }))
        }
    }

    struct Refusing;

    #[async_trait]
    impl Connector for Refusing {
        async fn connect(&self, _url: &str) -> anyhow::Result<Arc<dyn Resource>> {
            anyhow::bail!("connection refused")
        }
    }

    fn connector(name: &'static str, log: &Arc<Mutex<Vec<String>>>, fail_close: bool) -> Arc<dyn Connector> {
        Arc::new(MemoryConnector { name, log: Arc::clone(log), fail_close })
    }

    #[tokio::test]
    async fn unconfigured_capabilities_are_skipped() {
        let resources = Resources::open(&Config::new("127.0.0.1", 0, "test"), &HashMap::new()).await.unwrap();
        assert!(resources.is_empty());
    }

    #[tokio::test]
    async fn configured_capability_without_connector_is_fatal() {
        let mut config = Config::new("127.0.0.1", 0, "test");
        config.redis = Some("redis://localhost".into());
        let err = Resources::open(&config, &HashMap::new()).await.unwrap_err();
        assert!(matches!(err, Error::Resource { .. }));
    }

    #[tokio::test]
    async fn failed_connect_closes_earlier_resources() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut config = Config::new("127.0.0.1", 0, "test");
        config.redis = Some("redis://localhost".into());
        config.mongo = Some("mongodb://localhost".into());
        let connectors = HashMap::from([
            (Capability::Cache, connector("cache", &log, false)),
            (Capability::Store, Arc::new(Refusing) as Arc<dyn Connector>),
        ]);

        assert!(Resources::open(&config, &connectors).await.is_err());
        assert_eq!(*log.lock().unwrap(), ["open cache redis://localhost", "close cache"]);
    }

    #[tokio::test]
    async fn close_all_runs_newest_first_and_collects_errors() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut config = Config::new("127.0.0.1", 0, "test");
        config.redis = Some("redis://localhost".into());
        config.mongo = Some("mongodb://localhost".into());
        let connectors = HashMap::from([
            (Capability::Cache, connector("cache", &log, true)),
            (Capability::Store, connector("store", &log, false)),
        ]);

        let mut resources = Resources::open(&config, &connectors).await.unwrap();
        assert!(resources.downcast::<Memory>(Capability::Store).is_some());

        let errors = resources.close_all().await;
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("cache refused to close"));
        assert_eq!(log.lock().unwrap()[2..], ["close store", "close cache"]);
        assert!(resources.close_all().await.is_empty());
    }

    #[test]
    fn cache_target_defaults() {
        let target = CacheTarget::parse("redis://").unwrap();
        assert_eq!(target, CacheTarget { host: "127.0.0.1".into(), port: 6379, password: None, prefix: None });
    }

    #[test]
    fn cache_target_full_form() {
        let target = CacheTarget::parse("redis://secret@cache.internal:6380/svc").unwrap();
        assert_eq!(target.host, "cache.internal");
        assert_eq!(target.port, 6380);
        assert_eq!(target.password.as_deref(), Some("secret"));
        assert_eq!(target.prefix.as_deref(), Some("svc"));
    }

    #[test]
    fn cache_target_user_password_form() {
        let target = CacheTarget::parse("redis://:hunter2@cache").unwrap();
        assert_eq!(target.password.as_deref(), Some("hunter2"));
        assert_eq!(target.port, 6379);
    }

    #[test]
    fn cache_target_rejects_other_schemes() {
        assert!(CacheTarget::parse("mongodb://localhost").is_err());
        assert!(CacheTarget::parse("redis://host:port").is_err());
    }
}
