//! Path patterns for routes and whitelist entries.
//!
//! A pattern is a `/`-separated list of segments:
//!
//! | Segment | Matches |
//! |---|---|
//! | `users` | the literal segment, case-insensitively |
//! | `:id` or `{id}` | one segment, captured as `id` |
//! | trailing `*` | any suffix, including the empty one |
//!
//! Matching is anchored to the whole path unless the pattern ends in `*`.
//! A wildcard only extends whole segments: `/api*` matches `/api`, `/api/`
//! and `/api/v1/x`, but not `/apix`.
//! Each pattern compiles to a single-entry [`matchit`] tree. The request path
//! is ASCII-lowercased before lookup (byte offsets are preserved), so
//! captured parameters can be sliced back out of the original path with
//! their case intact.

use std::collections::HashMap;

use matchit::Router as MatchitRouter;

use crate::error::Error;

/// Name under which the trailing wildcard's suffix is captured.
pub const WILDCARD_PARAM: &str = "*";

const CATCH_ALL: &str = "__kiln_rest";

/// A compiled path pattern.
pub struct Pattern {
    source: String,
    tree: MatchitRouter<()>,
}

impl Pattern {
    /// Compiles `pattern`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidPattern`] if the segments cannot be expressed
    /// as a route (for example two parameters sharing one segment).
    pub fn compile(pattern: &str) -> Result<Self, Error> {
        let mut tree = MatchitRouter::new();
        for route in translate(pattern) {
            tree.insert(route, ()).map_err(|source| Error::InvalidPattern {
                pattern: pattern.to_owned(),
                source,
            })?;
        }
        Ok(Self { source: pattern.to_owned(), tree })
    }

    /// The pattern as it was written.
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Whether `path` matches.
    pub fn is_match(&self, path: &str) -> bool {
        self.tree.at(&path.to_ascii_lowercase()).is_ok()
    }

    /// Matches `path` and returns the captured parameters.
    ///
    /// For a pattern `/users/:id`, `/Users/Ab12` yields `{"id": "Ab12"}`.
    /// A trailing wildcard is captured under [`WILDCARD_PARAM`].
    pub fn captures(&self, path: &str) -> Option<HashMap<String, String>> {
        let lowered = path.to_ascii_lowercase();
        let matched = self.tree.at(&lowered).ok()?;
        let base = lowered.as_ptr() as usize;

        let params = matched.params.iter()
            .map(|(name, value)| {
                // `value` borrows from `lowered`; the same byte range of the
                // original path carries the caller's casing.
                let start = value.as_ptr() as usize - base;
                let original = &path[start..start + value.len()];
                let name = if name == CATCH_ALL { WILDCARD_PARAM } else { name };
                (name.to_owned(), original.to_owned())
            })
            .collect();
        Some(params)
    }
}

impl std::fmt::Debug for Pattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Pattern").field(&self.source).finish()
    }
}

/// Rewrites kiln pattern syntax into one or two matchit routes.
fn translate(pattern: &str) -> Vec<String> {
    let trimmed = pattern.trim();
    let (body, wildcard) = match trimmed.strip_suffix('*') {
        Some(rest) => (rest, true),
        None => (trimmed, false),
    };

    let mut route = String::with_capacity(body.len() + 1);
    if !body.starts_with('/') {
        route.push('/');
    }
    for (i, segment) in body.split('/').enumerate() {
        if i > 0 {
            route.push('/');
        }
        if let Some(name) = segment.strip_prefix(':') {
            route.push('{');
            route.push_str(name);
            route.push('}');
        } else if segment.starts_with('{') && segment.ends_with('}') {
            route.push_str(segment);
        } else {
            route.push_str(&segment.to_ascii_lowercase());
        }
    }

    if !wildcard {
        return vec![route];
    }
    // matchit catch-alls never match the empty suffix, so the bare prefix is
    // registered as its own route.
    let mut routes = Vec::with_capacity(3);
    if !route.ends_with('/') {
        routes.push(route.clone());
        route.push('/');
    }
    let catch_all = format!("{route}{{*{CATCH_ALL}}}");
    routes.push(route);
    routes.push(catch_all);
    routes
}
