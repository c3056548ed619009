//! HTTP status codes as a typed enum, plus the default message table.
//!
//! Every non-200 envelope carries a human message. When a middleware or a
//! handler does not provide one, it comes from [`default_message`].
//!
//! ```rust
//! use kiln::{status, Status};
//!
//! assert_eq!(status::default_message(401), "Unauthorized");
//! assert_eq!(u16::from(Status::Forbidden), 403);
//! ```

/// Fallback for codes without an entry in the table.
pub const UNKNOWN_STATUS_MESSAGE: &str = "Unknown Status";

/// The status codes kiln knows a default message for.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[allow(clippy::enum_variant_names)]
pub enum Status {
    // ── 2xx Success ───────────────────────────────────────────────────────────
    Ok,                            // 200
    Created,                       // 201
    Accepted,                      // 202
    NoContent,                     // 204

    // ── 3xx Redirection ───────────────────────────────────────────────────────
    MovedPermanently,              // 301
    Found,                         // 302
    NotModified,                   // 304

    // ── 4xx Client errors ─────────────────────────────────────────────────────
    BadRequest,                    // 400
    Unauthorized,                  // 401
    PaymentRequired,               // 402
    Forbidden,                     // 403
    NotFound,                      // 404
    MethodNotAllowed,              // 405
    RequestTimeout,                // 408
    Conflict,                      // 409
    Gone,                          // 410
    ContentTooLarge,               // 413
    UnsupportedMediaType,          // 415
    UnprocessableContent,          // 422
    TooManyRequests,               // 429

    // ── 5xx Server errors ─────────────────────────────────────────────────────
    InternalServerError,           // 500
    NotImplemented,                // 501
    BadGateway,                    // 502
    ServiceUnavailable,            // 503
    GatewayTimeout,                // 504
}

impl Status {
    const ALL: [Status; 25] = [
        Status::Ok,
        Status::Created,
        Status::Accepted,
        Status::NoContent,
        Status::MovedPermanently,
        Status::Found,
        Status::NotModified,
        Status::BadRequest,
        Status::Unauthorized,
        Status::PaymentRequired,
        Status::Forbidden,
        Status::NotFound,
        Status::MethodNotAllowed,
        Status::RequestTimeout,
        Status::Conflict,
        Status::Gone,
        Status::ContentTooLarge,
        Status::UnsupportedMediaType,
        Status::UnprocessableContent,
        Status::TooManyRequests,
        Status::InternalServerError,
        Status::NotImplemented,
        Status::BadGateway,
        Status::ServiceUnavailable,
        Status::GatewayTimeout,
    ];

    /// Looks up a code in the table.
    pub fn from_code(code: u16) -> Option<Self> {
        Self::ALL.into_iter().find(|s| u16::from(*s) == code)
    }

    /// The default human message for this status.
    pub fn message(self) -> &'static str {
        match self {
            Self::Ok                   => "OK",
            Self::Created              => "Created",
            Self::Accepted             => "Accepted",
            Self::NoContent            => "No Content",
            Self::MovedPermanently     => "Moved Permanently",
            Self::Found                => "Found",
            Self::NotModified          => "Not Modified",
            Self::BadRequest           => "Bad Request",
            Self::Unauthorized         => "Unauthorized",
            Self::PaymentRequired      => "Payment Required",
            Self::Forbidden            => "Forbidden",
            Self::NotFound             => "Not Found",
            Self::MethodNotAllowed     => "Method Not Allowed",
            Self::RequestTimeout       => "Request Timeout",
            Self::Conflict             => "Conflict",
            Self::Gone                 => "Gone",
            Self::ContentTooLarge      => "Payload Too Large",
            Self::UnsupportedMediaType => "Unsupported Media Type",
            Self::UnprocessableContent => "Unprocessable Entity",
            Self::TooManyRequests      => "Too Many Requests",
            Self::InternalServerError  => "Internal Server Error",
            Self::NotImplemented       => "Not Implemented",
            Self::BadGateway           => "Bad Gateway",
            Self::ServiceUnavailable   => "Service Unavailable",
            Self::GatewayTimeout       => "Gateway Timeout",
        }
    }
}

impl From<Status> for u16 {
    fn from(s: Status) -> u16 {
        match s {
            Status::Ok                   => 200,
            Status::Created              => 201,
            Status::Accepted             => 202,
            Status::NoContent            => 204,
            Status::MovedPermanently     => 301,
            Status::Found                => 302,
            Status::NotModified          => 304,
            Status::BadRequest           => 400,
            Status::Unauthorized         => 401,
            Status::PaymentRequired      => 402,
            Status::Forbidden            => 403,
            Status::NotFound             => 404,
            Status::MethodNotAllowed     => 405,
            Status::RequestTimeout       => 408,
            Status::Conflict             => 409,
            Status::Gone                 => 410,
            Status::ContentTooLarge      => 413,
            Status::UnsupportedMediaType => 415,
            Status::UnprocessableContent => 422,
            Status::TooManyRequests      => 429,
            Status::InternalServerError  => 500,
            Status::NotImplemented       => 501,
            Status::BadGateway           => 502,
            Status::ServiceUnavailable   => 503,
            Status::GatewayTimeout       => 504,
        }
    }
}

/// Default message for an arbitrary code. Total: unknown codes get
/// [`UNKNOWN_STATUS_MESSAGE`].
pub fn default_message(code: u16) -> &'static str {
    Status::from_code(code).map_or(UNKNOWN_STATUS_MESSAGE, Status::message)
}
