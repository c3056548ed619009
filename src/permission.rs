//! Scope-derived permissions.
//!
//! A scope is a claim of the form `{service}-{environment}[:{permission}]`.
//! The part before the colon is the *scope key* of one deployment of one
//! service; the optional suffix names a single permission inside it. A bare
//! scope key grants everything, and so does the literal `admin` scope.
//!
//! ```rust
//! use kiln::permission::{check_permissions, derive_perms, Principal};
//!
//! let mut alice = Principal::new("alice", ["svc-prod:read"]);
//! alice.perms = Some(derive_perms("svc-prod", &alice.scopes));
//!
//! assert!(check_permissions(Some(&alice), &["read".into()], true));
//! assert!(!check_permissions(Some(&alice), &["write".into()], true));
//! ```

use std::collections::BTreeSet;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// The scope that grants every permission on every service.
pub const ADMIN_SCOPE: &str = "admin";

/// The authenticated entity attached to a request.
///
/// Deserialised from the `account` object of the validation service. Only
/// `id` and `scopes` are interpreted; everything else is kept in `extra`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Principal {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, rename = "discordUserId", skip_serializing_if = "Option::is_none")]
    pub discord_user_id: Option<String>,
    /// `None` until the permission stage ran; `Some` (possibly empty) after.
    #[serde(skip)]
    pub perms: Option<Perms>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Principal {
    pub fn new<I, S>(id: impl Into<String>, scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            id: id.into(),
            scopes: scopes.into_iter().map(Into::into).collect(),
            name: None,
            discord_user_id: None,
            perms: None,
            extra: Map::new(),
        }
    }
}

fn string_or_number<'de, D: Deserializer<'de>>(de: D) -> Result<String, D::Error> {
    match Value::deserialize(de)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!("account id must be a string or number, got {other}"))),
    }
}

/// A derived capability set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Perms {
    all: bool,
    named: BTreeSet<String>,
}

impl Perms {
    /// Grants everything.
    pub fn everything() -> Self {
        Self { all: true, named: BTreeSet::new() }
    }

    pub fn grant(&mut self, permission: impl Into<String>) {
        self.named.insert(permission.into());
    }

    pub fn grant_all(&mut self) {
        self.all = true;
    }

    pub fn is_all(&self) -> bool {
        self.all
    }

    pub fn is_empty(&self) -> bool {
        !self.all && self.named.is_empty()
    }

    /// Whether `permission` is held, directly or through "all".
    pub fn allows(&self, permission: &str) -> bool {
        self.all || self.named.contains(permission)
    }

    pub fn named(&self) -> impl Iterator<Item = &str> {
        self.named.iter().map(String::as_str)
    }
}

/// Derives the permissions granted to `scope_key` by `scopes`.
///
/// - `{scope_key}` (or `{scope_key}:`) grants "all".
/// - `{scope_key}:{name}` grants `name`.
/// - `admin` anywhere grants "all".
/// - Everything else, including scopes with more than one extra segment and
///   scopes of other services, is ignored.
pub fn derive_perms<S: AsRef<str>>(scope_key: &str, scopes: &[S]) -> Perms {
    let mut perms = Perms::default();
    for scope in scopes.iter().map(AsRef::as_ref) {
        if scope == ADMIN_SCOPE {
            perms.grant_all();
            continue;
        }
        let Some(rest) = scope.strip_prefix(scope_key) else { continue };
        if rest.is_empty() {
            perms.grant_all();
            continue;
        }
        let Some(name) = rest.strip_prefix(':') else { continue };
        if name.is_empty() {
            perms.grant_all();
        } else if !name.contains(':') {
            perms.grant(name);
        }
    }
    perms
}

/// Whether `principal` may call a route requiring any of `required`.
///
/// Multiple required permissions are alternatives: holding one is enough.
/// A principal whose permissions were never derived holds none.
pub fn check_permissions(principal: Option<&Principal>, required: &[String], require_account: bool) -> bool {
    let Some(principal) = principal else {
        return !require_account;
    };
    if required.is_empty() {
        return true;
    }
    match &principal.perms {
        Some(perms) => required.iter().any(|p| perms.allows(p)),
        None => false,
    }
}

/// `{scope_key}` or `{scope_key}:{permission}`.
pub fn fully_qualified_scope(scope_key: &str, permission: &str) -> String {
    if permission.is_empty() {
        scope_key.to_owned()
    } else {
        format!("{scope_key}:{permission}")
    }
}

/// The 403 message naming what the caller lacks, e.g.
/// `Missing scopes svc-prod:read or svc-prod:write`.
pub fn missing_scope_message(scope_key: &str, required: &[String]) -> String {
    let scopes: Vec<String> = if required.is_empty() {
        vec![fully_qualified_scope(scope_key, "")]
    } else {
        required.iter().map(|p| fully_qualified_scope(scope_key, p)).collect()
    };
    let noun = if scopes.len() > 1 { "Missing scopes" } else { "Missing scope" };
    format!("{noun} {}", scopes.join(" or "))
}
