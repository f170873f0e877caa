use crate::context::{QueryItem, RequestContext};
use crate::query::{EntireSpec, QueryParserSpec, QueryValue, SerialSpec};
use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use indexmap::IndexMap;
use std::any::Any;
use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::SystemTime;

pub type HeaderValidator = dyn Fn(&HeaderMap) -> Result<(), String> + Send + Sync;

/// Error type responders may fail with; surfaced as `ProcessingFailed`.
pub type ResponderError = Box<dyn std::error::Error + Send + Sync>;

pub type Responder =
    dyn Fn(RespondInput<'_>) -> Result<ResponseContent, ResponderError> + Send + Sync;

pub type ReduceInit = dyn Fn() -> Box<dyn Any + Send> + Send + Sync;
pub type ReduceStep = dyn Fn(&mut (dyn Any + Send), &[u8]) + Send + Sync;

/// How the request body is to be handled for a response.
#[derive(Clone)]
pub enum BodyPlan {
    /// Reject any request with a non-empty body.
    Prohibit,
    /// Accumulate raw bytes up to the effective length limit.
    Collect { limit: Option<u64> },
    /// Stream each chunk through a folding function into a typed value.
    Reduce {
        limit: Option<u64>,
        init: Arc<ReduceInit>,
        step: Arc<ReduceStep>,
    },
    /// Collect bytes, then decode as JSON.
    Json { limit: Option<u64> },
}

impl fmt::Debug for BodyPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BodyPlan::Prohibit => f.write_str("Prohibit"),
            BodyPlan::Collect { limit } => write!(f, "Collect {{ limit: {limit:?} }}"),
            BodyPlan::Reduce { limit, .. } => write!(f, "Reduce {{ limit: {limit:?}, .. }}"),
            BodyPlan::Json { limit } => write!(f, "Json {{ limit: {limit:?} }}"),
        }
    }
}

/// The request body after the plan ran to completion.
pub enum BodyOutcome {
    None,
    Bytes(Bytes),
    Json(serde_json::Value),
    Reduced(Box<dyn Any + Send>),
}

impl fmt::Debug for BodyOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BodyOutcome::None => f.write_str("None"),
            BodyOutcome::Bytes(b) => write!(f, "Bytes({} bytes)", b.len()),
            BodyOutcome::Json(v) => write!(f, "Json({v})"),
            BodyOutcome::Reduced(_) => f.write_str("Reduced(..)"),
        }
    }
}

/// Everything a responder sees when producing content.
pub struct RespondInput<'a> {
    pub context: &'a RequestContext,
    /// Trailing path components, non-empty only for subpath-capable
    /// responses matched above the request's full path.
    pub subpath: &'a [String],
    pub query: QueryValue,
    pub body: BodyOutcome,
}

/// A response implementation: the handler side of a dispatch entry.
///
/// Identity is referential; inserting two identical `ResponseImpl`s
/// registers two distinct responses.
pub struct ResponseImpl {
    pub(crate) query: QueryParserSpec,
    pub(crate) header_validator: Option<Arc<HeaderValidator>>,
    pub(crate) body_plan: BodyPlan,
    pub(crate) entity_tag: Option<String>,
    pub(crate) modified_at: Option<SystemTime>,
    pub(crate) accepts_subpath: bool,
    pub(crate) responder: Arc<Responder>,
}

impl ResponseImpl {
    /// A response with the empty query parser, no header validation, a
    /// prohibited body, and the given producer.
    pub fn new(
        responder: impl Fn(RespondInput<'_>) -> Result<ResponseContent, ResponderError>
        + Send
        + Sync
        + 'static,
    ) -> Self {
        ResponseImpl {
            query: QueryParserSpec::Empty,
            header_validator: None,
            body_plan: BodyPlan::Prohibit,
            entity_tag: None,
            modified_at: None,
            accepts_subpath: false,
            responder: Arc::new(responder),
        }
    }

    pub fn serial_query(mut self, spec: SerialSpec) -> Self {
        self.query = QueryParserSpec::Serial(spec);
        self
    }

    pub fn entire_query(
        mut self,
        apply: impl Fn(&[QueryItem]) -> Option<QueryValue> + Send + Sync + 'static,
    ) -> Self {
        self.query = QueryParserSpec::Entire(EntireSpec::new(apply));
        self
    }

    pub fn header_validator(
        mut self,
        validate: impl Fn(&HeaderMap) -> Result<(), String> + Send + Sync + 'static,
    ) -> Self {
        self.header_validator = Some(Arc::new(validate));
        self
    }

    pub fn body(mut self, plan: BodyPlan) -> Self {
        self.body_plan = plan;
        self
    }

    pub fn entity_tag(mut self, tag: impl Into<String>) -> Self {
        self.entity_tag = Some(tag.into());
        self
    }

    pub fn modified_at(mut self, when: SystemTime) -> Self {
        self.modified_at = Some(when);
        self
    }

    /// Marks the response as also applying to any path extending its own;
    /// the trailing components arrive via [`RespondInput::subpath`].
    pub fn with_subpath(mut self) -> Self {
        self.accepts_subpath = true;
        self
    }
}

impl fmt::Debug for ResponseImpl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseImpl")
            .field("query", &self.query)
            .field("body_plan", &self.body_plan)
            .field("accepts_subpath", &self.accepts_subpath)
            .finish_non_exhaustive()
    }
}

/// The body of produced content.
pub enum ResponseBody {
    Empty,
    Bytes(Bytes),
    /// A blocking byte source, streamed out in chunks.
    Stream(Box<dyn io::Read + Send>),
    /// A producer invoked with a scratch buffer; returns bytes written,
    /// `Ok(0)` meaning end of body.
    Callback(Box<dyn FnMut(&mut [u8]) -> io::Result<usize> + Send>),
}

impl fmt::Debug for ResponseBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResponseBody::Empty => f.write_str("Empty"),
            ResponseBody::Bytes(b) => write!(f, "Bytes({} bytes)", b.len()),
            ResponseBody::Stream(_) => f.write_str("Stream(..)"),
            ResponseBody::Callback(_) => f.write_str("Callback(..)"),
        }
    }
}

/// Produced response content, protocol-agnostic. The wire layer turns this
/// into a response head plus body, emitting `Content-Type`,
/// `Content-Length`, `ETag` and `Last-Modified` when set here.
#[derive(Debug)]
pub struct ResponseContent {
    pub status: StatusCode,
    /// Custom headers, emitted in insertion order.
    pub headers: IndexMap<String, String>,
    pub content_type: Option<String>,
    pub entity_tag: Option<String>,
    pub last_modified: Option<SystemTime>,
    pub body: ResponseBody,
}

impl ResponseContent {
    pub fn new(status: StatusCode) -> Self {
        ResponseContent {
            status,
            headers: IndexMap::new(),
            content_type: None,
            entity_tag: None,
            last_modified: None,
            body: ResponseBody::Empty,
        }
    }

    /// `200 OK` with a `text/plain` body.
    pub fn text(body: impl Into<String>) -> Self {
        ResponseContent::new(StatusCode::OK)
            .content_type("text/plain; charset=utf-8")
            .bytes(Bytes::from(body.into()))
    }

    /// `200 OK` with a JSON body.
    pub fn json(value: &serde_json::Value) -> Self {
        ResponseContent::new(StatusCode::OK)
            .content_type("application/json")
            .bytes(Bytes::from(value.to_string()))
    }

    pub fn content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn bytes(mut self, bytes: Bytes) -> Self {
        self.body = ResponseBody::Bytes(bytes);
        self
    }

    pub fn stream(mut self, source: impl io::Read + Send + 'static) -> Self {
        self.body = ResponseBody::Stream(Box::new(source));
        self
    }

    pub fn callback(
        mut self,
        produce: impl FnMut(&mut [u8]) -> io::Result<usize> + Send + 'static,
    ) -> Self {
        self.body = ResponseBody::Callback(Box::new(produce));
        self
    }

    pub fn entity_tag(mut self, tag: impl Into<String>) -> Self {
        self.entity_tag = Some(tag.into());
        self
    }

    pub fn last_modified(mut self, when: SystemTime) -> Self {
        self.last_modified = Some(when);
        self
    }

    /// Known body length, when the body is fully buffered.
    pub fn content_length(&self) -> Option<u64> {
        match &self.body {
            ResponseBody::Empty => Some(0),
            ResponseBody::Bytes(b) => Some(b.len() as u64),
            ResponseBody::Stream(_) | ResponseBody::Callback(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_content_shape() {
        let content = ResponseContent::text("hello");
        assert_eq!(content.status, StatusCode::OK);
        assert_eq!(
            content.content_type.as_deref(),
            Some("text/plain; charset=utf-8")
        );
        assert_eq!(content.content_length(), Some(5));
    }

    #[test]
    fn test_custom_headers_keep_insertion_order() {
        let content = ResponseContent::new(StatusCode::OK)
            .header("x-first", "1")
            .header("x-second", "2")
            .header("x-third", "3");
        let names: Vec<&str> = content.headers.keys().map(String::as_str).collect();
        assert_eq!(names, vec!["x-first", "x-second", "x-third"]);
    }

    #[test]
    fn test_streamed_bodies_have_unknown_length() {
        let content = ResponseContent::new(StatusCode::OK).callback(|_| Ok(0));
        assert_eq!(content.content_length(), None);
    }
}
