//! Token authentication stage.
//!
//! Reads the `Authorization` header, asks the account validation service
//! whether the token is valid, and attaches the returned account to the
//! request as its [`Principal`].
//!
//! | Request | Outcome |
//! |---|---|
//! | no header, unknown scheme, empty token | 401, validator not called |
//! | validator answers 401 or 403, or 200 without an account | 401 |
//! | validator unreachable, slow, or answering anything else | 500 `Failed to contact Account API` |
//! | validator accepts | principal attached, request continues |

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::config::{WhitelistConfig, DEFAULT_OUTBOUND_TIMEOUT_MS};
use crate::error::Error;
use crate::middleware::{Executor, Middleware};
use crate::permission::Principal;
use crate::request::Request;
use crate::response::{Envelope, IntoReply, Reply};
use crate::status::Status;

pub const NAME: &str = "AuthMiddleware";

/// Message sent when the validation service cannot be reached.
pub const UNAVAILABLE_MESSAGE: &str = "Failed to contact Account API";

/// A credential extracted from the `Authorization` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credential {
    /// `Bearer <token>`
    Bearer(String),
    /// `Wolke <token>`, the legacy scheme.
    Legacy(String),
}

impl Credential {
    /// Parses an `Authorization` header value. Returns `None` for other
    /// schemes and for empty tokens.
    pub fn parse(header: &str) -> Option<Self> {
        let credential = if let Some(token) = header.strip_prefix("Bearer ") {
            Self::Bearer(token.trim().to_owned())
        } else if let Some(token) = header.strip_prefix("Wolke ") {
            Self::Legacy(token.trim().to_owned())
        } else {
            return None;
        };
        (!credential.token().is_empty()).then_some(credential)
    }

    pub fn token(&self) -> &str {
        match self {
            Self::Bearer(t) | Self::Legacy(t) => t,
        }
    }

    pub fn is_legacy(&self) -> bool {
        matches!(self, Self::Legacy(_))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("token rejected")]
    Unauthorized,
    #[error("validation service unavailable: {0}")]
    Unavailable(String),
}

/// Decides whether a credential belongs to a known account.
#[async_trait]
pub trait TokenValidator: Send + Sync + 'static {
    async fn validate(&self, credential: &Credential) -> Result<Principal, ValidationError>;
}

/// Validates tokens against `GET {base}/validate/{token}[?legacy=true]`.
pub struct HttpValidator {
    client: reqwest::Client,
    base: Url,
    user_agent: String,
}

#[derive(Deserialize)]
struct ValidateBody {
    #[serde(default)]
    account: Option<Value>,
}

impl HttpValidator {
    pub fn new(base: &str, user_agent: impl Into<String>) -> Result<Self, Error> {
        let base = Url::parse(base)
            .map_err(|e| Error::InvalidConfig(format!("validation_host `{base}`: {e}")))?;
        if base.cannot_be_a_base() {
            return Err(Error::InvalidConfig(format!("validation_host `{base}` cannot carry a path")));
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(DEFAULT_OUTBOUND_TIMEOUT_MS))
            .build()?;
        Ok(Self { client, base, user_agent: user_agent.into() })
    }

    /// The URL queried for `credential`. The token is percent-encoded as a
    /// single path segment.
    pub fn validation_url(&self, credential: &Credential) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().push("validate").push(credential.token());
        }
        if credential.is_legacy() {
            url.query_pairs_mut().append_pair("legacy", "true");
        }
        url
    }
}

#[async_trait]
impl TokenValidator for HttpValidator {
    async fn validate(&self, credential: &Credential) -> Result<Principal, ValidationError> {
        let response = self.client
            .get(self.validation_url(credential))
            .header(reqwest::header::USER_AGENT, &self.user_agent)
            .send()
            .await
            .map_err(|e| ValidationError::Unavailable(e.to_string()))?;

        match response.status() {
            StatusCode::OK => {}
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                debug!(status = %response.status(), "token rejected by validation service");
                return Err(ValidationError::Unauthorized);
            }
            other => return Err(ValidationError::Unavailable(format!("validation service answered {other}"))),
        }

        let body: ValidateBody = response.json().await
            .map_err(|e| ValidationError::Unavailable(format!("malformed validation response: {e}")))?;
        let account = body.account.filter(|a| a.is_object()).ok_or(ValidationError::Unauthorized)?;
        serde_json::from_value(account).map_err(|e| {
            debug!("account object rejected: {e}");
            ValidationError::Unauthorized
        })
    }
}

struct AuthExecutor {
    validator: Arc<dyn TokenValidator>,
}

#[async_trait]
impl Executor for AuthExecutor {
    async fn exec(&self, req: &mut Request) -> Reply {
        let Some(credential) = req.header("authorization").and_then(Credential::parse) else {
            return Reply::status(Status::Unauthorized);
        };

        match self.validator.validate(&credential).await {
            Ok(principal) => {
                req.set_principal(principal);
                Reply::ok()
            }
            Err(ValidationError::Unauthorized) => Reply::status(Status::Unauthorized),
            Err(ValidationError::Unavailable(cause)) => {
                tracing::warn!(%cause, "account validation unavailable");
                Envelope::new(Status::InternalServerError, UNAVAILABLE_MESSAGE).into_reply()
            }
        }
    }
}

/// Builds the auth stage with `whitelist` entries from configuration.
pub fn middleware(validator: Arc<dyn TokenValidator>, whitelist: &[WhitelistConfig]) -> Result<Middleware, Error> {
    let mut mw = Middleware::with_executor(NAME, AuthExecutor { validator });
    for entry in whitelist {
        mw.try_whitelist(&entry.path, entry.method()?)?;
    }
    Ok(mw)
}
