//! Outgoing responses, the `{status, message}` envelope, and the
//! [`IntoReply`] conversion trait.
//!
//! Handlers and middleware executors do not build HTTP responses directly.
//! They return something that converts into a [`Reply`]: nothing, a status
//! code, a partial JSON object, a raw [`Response`], or a fault. Everything
//! except raw responses and faults goes through [`Envelope::normalize`].

use bytes::Bytes;
use http_body_util::Full;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::status::{self, Status};

// ── Response ─────────────────────────────────────────────────────────────────

/// An outgoing HTTP response.
///
/// ```rust
/// use kiln::{Response, Status};
///
/// Response::json(br#"{"id":1}"#.to_vec());
/// Response::text("hello");
/// Response::builder()
///     .status(Status::Created)
///     .header("location", "/users/42")
///     .json(br#"{"id":42}"#.to_vec());
/// ```
#[derive(Debug, Clone)]
pub struct Response {
    pub(crate) body: Bytes,
    pub(crate) headers: Vec<(String, String)>,
    pub(crate) status: u16,
}

impl Response {
    /// `200 OK` — `application/json`.
    pub fn json(body: impl Into<Bytes>) -> Self {
        Self::builder().json(body)
    }

    /// `200 OK` — `text/plain; charset=utf-8`.
    pub fn text(body: impl Into<String>) -> Self {
        Self::builder().text(body)
    }

    /// Builder for responses that need a custom status or extra headers.
    pub fn builder() -> ResponseBuilder {
        ResponseBuilder { headers: Vec::new(), status: Status::Ok.into() }
    }

    pub fn status(&self) -> u16 { self.status }
    pub fn body(&self) -> &[u8] { &self.body }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub(crate) fn into_inner(self) -> http::Response<Full<Bytes>> {
        let mut builder = http::Response::builder().status(self.status);
        for (name, value) in &self.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        match builder.body(Full::new(self.body)) {
            Ok(resp) => resp,
            Err(e) => {
                // Only reachable with an out-of-range status or a malformed
                // header pair supplied through `Reply::Raw`.
                tracing::error!("invalid response parts: {e}");
                let mut resp = http::Response::new(Full::new(Bytes::new()));
                *resp.status_mut() = http::StatusCode::INTERNAL_SERVER_ERROR;
                resp
            }
        }
    }
}

// ── ResponseBuilder ───────────────────────────────────────────────────────────

/// Fluent builder for [`Response`].
///
/// Obtain via [`Response::builder()`]. Defaults to `200`.
pub struct ResponseBuilder {
    headers: Vec<(String, String)>,
    status: u16,
}

impl ResponseBuilder {
    pub fn status(mut self, code: impl Into<u16>) -> Self {
        self.status = code.into();
        self
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_owned(), value.to_owned()));
        self
    }

    /// Terminate with a JSON body (`application/json`).
    pub fn json(self, body: impl Into<Bytes>) -> Response {
        self.finish("application/json", body.into())
    }

    /// Terminate with a plain-text body (`text/plain; charset=utf-8`).
    pub fn text(self, body: impl Into<String>) -> Response {
        self.finish("text/plain; charset=utf-8", Bytes::from(body.into()))
    }

    /// Terminate with an arbitrary content type.
    pub fn bytes(self, content_type: &str, body: impl Into<Bytes>) -> Response {
        self.finish(content_type, body.into())
    }

    /// Terminate with no body.
    pub fn no_body(self) -> Response {
        Response { body: Bytes::new(), headers: self.headers, status: self.status }
    }

    fn finish(self, content_type: &str, body: Bytes) -> Response {
        let mut headers = vec![("content-type".to_owned(), content_type.to_owned())];
        headers.extend(self.headers);
        Response { body, headers, status: self.status }
    }
}

// ── Envelope ──────────────────────────────────────────────────────────────────

/// The canonical response body: `{"status": <code>, "message": "..."}` plus
/// any extra fields the handler supplied.
///
/// `message` is always present when `status != 200`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Normaliser input: what a handler or executor produced, before defaults.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// Nothing was returned.
    Empty,
    /// A bare status code.
    Status(u16),
    /// A (possibly partial) JSON object.
    Object(Map<String, Value>),
}

impl Envelope {
    /// An envelope for `code` carrying its default message.
    pub fn from_status(code: impl Into<u16>) -> Self {
        let status = code.into();
        Self { status, message: Some(status::default_message(status).to_owned()), extra: Map::new() }
    }

    /// An envelope with an explicit message.
    pub fn new(code: impl Into<u16>, message: impl Into<String>) -> Self {
        Self { status: code.into(), message: Some(message.into()), extra: Map::new() }
    }

    /// Adds an extra top-level field.
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.extra.insert(key.to_owned(), value.into());
        self
    }

    /// Turns any payload into an envelope. Never fails.
    ///
    /// - `Empty` → `200` with the default message.
    /// - `Status(code)` → `code` with the default message.
    /// - `Object` → `status` defaults to `200` when absent, `null` or `0`; a
    ///   `status` that is not an HTTP code (`"abc"`, `1.5`, `1000`) is logged
    ///   and becomes `500`. A non-200 status without a message gets the
    ///   default one; every other field passes through.
    pub fn normalize(payload: Payload) -> Self {
        match payload {
            Payload::Empty => Self::from_status(Status::Ok),
            Payload::Status(code) => Self::from_status(code),
            Payload::Object(mut fields) => {
                let status = match fields.remove("status") {
                    None | Some(Value::Null) => 200,
                    Some(value) => match value.as_u64() {
                        Some(0) => 200,
                        Some(code @ 100..=999) => code as u16,
                        _ => {
                            tracing::warn!(status = %value, "handler returned an unusable status, answering 500");
                            500
                        }
                    },
                };
                let message = match fields.remove("message") {
                    None | Some(Value::Null) => None,
                    Some(Value::String(s)) => Some(s),
                    Some(other) => Some(other.to_string()),
                };
                let message = match message {
                    None if status != 200 => Some(status::default_message(status).to_owned()),
                    m => m,
                };
                Self { status, message, extra: fields }
            }
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == 200
    }

    /// Serialises the envelope as the JSON body of a response with the same
    /// status.
    pub fn into_response(self) -> Response {
        let status = self.status;
        match serde_json::to_vec(&self) {
            Ok(body) => Response::builder().status(status).json(body),
            Err(e) => {
                tracing::error!("failed to serialise envelope: {e}");
                Response::builder().status(Status::InternalServerError).no_body()
            }
        }
    }
}

// ── Reply ─────────────────────────────────────────────────────────────────────

/// What a handler or middleware executor hands back to the pipeline.
#[derive(Debug)]
pub enum Reply {
    /// To be normalised into an [`Envelope`].
    Payload(Payload),
    /// A fully built response, written as-is. Use this when the handler owns
    /// the wire format (files, streams, non-JSON bodies).
    Raw(Response),
    /// A failure, forwarded to the stage's error handler.
    Fault(anyhow::Error),
}

impl Reply {
    pub fn ok() -> Self {
        Reply::Payload(Payload::Status(200))
    }

    pub fn status(code: impl Into<u16>) -> Self {
        Reply::Payload(Payload::Status(code.into()))
    }
}

/// Conversion into a [`Reply`].
///
/// ```rust
/// use kiln::{IntoReply, Json, Reply, Status};
///
/// async fn delete(_req: kiln::Request) -> Status { Status::NoContent }
/// async fn get(_req: kiln::Request) -> Json<Vec<u32>> { Json(vec![1, 2]) }
/// async fn fallible(_req: kiln::Request) -> anyhow::Result<u16> { Ok(204) }
/// ```
pub trait IntoReply {
    fn into_reply(self) -> Reply;
}

impl IntoReply for Reply {
    fn into_reply(self) -> Reply { self }
}

impl IntoReply for () {
    fn into_reply(self) -> Reply { Reply::Payload(Payload::Empty) }
}

impl IntoReply for u16 {
    fn into_reply(self) -> Reply { Reply::status(self) }
}

impl IntoReply for Status {
    fn into_reply(self) -> Reply { Reply::status(self) }
}

impl IntoReply for Envelope {
    fn into_reply(self) -> Reply {
        let mut fields = self.extra;
        fields.insert("status".to_owned(), self.status.into());
        if let Some(message) = self.message {
            fields.insert("message".to_owned(), message.into());
        }
        Reply::Payload(Payload::Object(fields))
    }
}

impl IntoReply for Response {
    fn into_reply(self) -> Reply { Reply::Raw(self) }
}

/// `null` is an empty reply, a number is a status, an object is a partial
/// envelope. Any other JSON value is a fault: it has no envelope shape.
impl IntoReply for Value {
    fn into_reply(self) -> Reply {
        match self {
            Value::Null => Reply::Payload(Payload::Empty),
            Value::Object(fields) => Reply::Payload(Payload::Object(fields)),
            Value::Number(n) => match n.as_u64().and_then(|n| u16::try_from(n).ok()) {
                Some(code) => Reply::status(code),
                None => Reply::Fault(anyhow::anyhow!("reply status {n} is not an HTTP status")),
            },
            other => Reply::Fault(anyhow::anyhow!("reply must be a JSON object, got {other}")),
        }
    }
}

/// Serialises `T` with serde and treats the result as a JSON reply.
pub struct Json<T>(pub T);

impl<T: Serialize> IntoReply for Json<T> {
    fn into_reply(self) -> Reply {
        match serde_json::to_value(&self.0) {
            Ok(value) => value.into_reply(),
            Err(e) => Reply::Fault(e.into()),
        }
    }
}

impl<T: IntoReply> IntoReply for Option<T> {
    fn into_reply(self) -> Reply {
        match self {
            Some(inner) => inner.into_reply(),
            None => Reply::Payload(Payload::Empty),
        }
    }
}

impl<T, E> IntoReply for Result<T, E>
where
    T: IntoReply,
    E: Into<anyhow::Error>,
{
    fn into_reply(self) -> Reply {
        match self {
            Ok(inner) => inner.into_reply(),
            Err(e) => Reply::Fault(e.into()),
        }
    }
}
