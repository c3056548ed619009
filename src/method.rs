//! Route and whitelist methods as a typed enum.
//!
//! Routes bind one of the standard methods or [`Method::All`], which matches
//! every incoming method. Whitelist entries use the same type; their config
//! spelling is lowercase (`"get"`, `"all"`).

use std::fmt;
use std::str::FromStr;

/// A method a route or whitelist entry can be bound to.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Method {
    Delete,
    Get,
    Head,
    Options,
    Patch,
    Post,
    Put,
    /// Matches any request method.
    All,
}

impl Method {
    /// Returns the uppercase representation (e.g. `"GET"`, `"ALL"`).
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Delete  => "DELETE",
            Self::Get     => "GET",
            Self::Head    => "HEAD",
            Self::Options => "OPTIONS",
            Self::Patch   => "PATCH",
            Self::Post    => "POST",
            Self::Put     => "PUT",
            Self::All     => "ALL",
        }
    }

    /// Whether a request carrying `method` is covered by this binding.
    pub fn matches(self, method: &http::Method) -> bool {
        self == Self::All || self.as_str() == method.as_str()
    }
}

/// Parses a method name. Case-insensitive, so both `"GET"` and the
/// whitelist spelling `"get"` are accepted.
impl FromStr for Method {
    type Err = UnknownMethod;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "DELETE"  => Ok(Self::Delete),
            "GET"     => Ok(Self::Get),
            "HEAD"    => Ok(Self::Head),
            "OPTIONS" => Ok(Self::Options),
            "PATCH"   => Ok(Self::Patch),
            "POST"    => Ok(Self::Post),
            "PUT"     => Ok(Self::Put),
            "ALL"     => Ok(Self::All),
            _         => Err(UnknownMethod(s.to_owned())),
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned by [`Method::from_str`] for names outside the supported set.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown method `{0}`")]
pub struct UnknownMethod(pub String);
