#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use kiln::discovery::{Discovery, Registration};
use kiln::middleware::auth::{Credential, TokenValidator, ValidationError};
use kiln::{Error, Principal};

/// Tokens are `{id}:{scope},{scope}`; `down` simulates an outage.
pub struct TokenScopes;

#[async_trait]
impl TokenValidator for TokenScopes {
    async fn validate(&self, credential: &Credential) -> Result<Principal, ValidationError> {
        if credential.token() == "down" {
            return Err(ValidationError::Unavailable("connection refused".into()));
        }
        let (id, scopes) = credential.token().split_once(':').ok_or(ValidationError::Unauthorized)?;
        Ok(Principal::new(id, scopes.split(',').filter(|s| !s.is_empty())))
    }
}

/// Records registrations; optionally fails to unregister.
#[derive(Default)]
pub struct RecordingDiscovery {
    pub registered: Mutex<Vec<Registration>>,
    pub unregistered: AtomicUsize,
    pub fail_unregister: bool,
}

impl RecordingDiscovery {
    pub fn unregister_calls(&self) -> usize {
        self.unregistered.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Discovery for RecordingDiscovery {
    async fn register(&self, registration: &Registration) -> Result<(), Error> {
        self.registered.lock().unwrap().push(registration.clone());
        Ok(())
    }

    async fn unregister(&self, _id: &str) -> Result<(), Error> {
        self.unregistered.fetch_add(1, Ordering::SeqCst);
        // Give concurrent shutdown callers a chance to pile up.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        if self.fail_unregister {
            return Err(Error::Upstream { service: "consul", status: 500 });
        }
        Ok(())
    }
}

/// Writes `contents` to a fresh file under the temp dir.
pub fn temp_json(contents: &serde_json::Value) -> PathBuf {
    let path = std::env::temp_dir().join(format!("kiln-it-{}.json", uuid::Uuid::new_v4()));
    std::fs::write(&path, serde_json::to_vec_pretty(contents).unwrap()).unwrap();
    path
}

pub fn missing_path() -> PathBuf {
    std::env::temp_dir().join(format!("kiln-it-missing-{}.json", uuid::Uuid::new_v4()))
}

/// Config for `svc` in `prod` on an ephemeral port.
pub fn base_config() -> serde_json::Value {
    serde_json::json!({ "host": "127.0.0.1", "port": 0, "env": "prod" })
}
