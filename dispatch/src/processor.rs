use crate::attributes::GroupAttributes;
use crate::context::RequestContext;
use crate::response::{
    BodyOutcome, BodyPlan, ReduceStep, RespondInput, ResponseContent, ResponseImpl,
};
use crate::tree::Selection;
use bytes::Bytes;
use http::header::{
    CONTENT_LENGTH, HeaderMap, IF_MATCH, IF_MODIFIED_SINCE, IF_NONE_MATCH, IF_UNMODIFIED_SINCE,
};
use http::{Method, StatusCode};
use metrics::counter;
use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Body-length limit applied when neither the response's plan nor an
/// enclosing group sets one.
pub const DEFAULT_BODY_LIMIT: u64 = 16 * 1024;

/// A named failure condition surfaced to the nearest enclosing incident
/// callback, each with a default HTTP status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Incident {
    ResponseNotFound,
    AmbiguousRequest,
    InvalidHeaders(String),
    /// The collected request body failed to decode (JSON plan).
    MalformedBody(String),
    ProcessingFailed(String),
    PayloadTooLarge,
    PreconditionFailed,
    NotModified,
}

impl Incident {
    /// Metric label for this incident kind.
    pub fn label(&self) -> &'static str {
        match self {
            Incident::ResponseNotFound => "response_not_found",
            Incident::AmbiguousRequest => "ambiguous_request",
            Incident::InvalidHeaders(_) => "invalid_headers",
            Incident::MalformedBody(_) => "malformed_body",
            Incident::ProcessingFailed(_) => "processing_failed",
            Incident::PayloadTooLarge => "payload_too_large",
            Incident::PreconditionFailed => "precondition_failed",
            Incident::NotModified => "not_modified",
        }
    }

    pub fn default_status(&self) -> StatusCode {
        match self {
            Incident::ResponseNotFound => StatusCode::NOT_FOUND,
            Incident::AmbiguousRequest => StatusCode::BAD_REQUEST,
            Incident::InvalidHeaders(_) => StatusCode::BAD_REQUEST,
            Incident::MalformedBody(_) => StatusCode::BAD_REQUEST,
            Incident::ProcessingFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Incident::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            Incident::PreconditionFailed => StatusCode::PRECONDITION_FAILED,
            Incident::NotModified => StatusCode::NOT_MODIFIED,
        }
    }
}

impl fmt::Display for Incident {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Incident::ResponseNotFound => f.write_str("no response matched the request"),
            Incident::AmbiguousRequest => f.write_str("request matched more than one response"),
            Incident::InvalidHeaders(cause) => write!(f, "invalid headers: {cause}"),
            Incident::MalformedBody(cause) => write!(f, "malformed request body: {cause}"),
            Incident::ProcessingFailed(cause) => write!(f, "response processing failed: {cause}"),
            Incident::PayloadTooLarge => f.write_str("request body exceeds the length limit"),
            Incident::PreconditionFailed => f.write_str("request precondition failed"),
            Incident::NotModified => f.write_str("not modified"),
        }
    }
}

/// Renders an incident: the resolved attributes' callback is consulted
/// first; otherwise the default status is emitted with a `text/plain` body
/// (empty for `304`).
pub fn render_incident(
    incident: &Incident,
    context: &RequestContext,
    attrs: &GroupAttributes,
) -> ResponseContent {
    counter!("dispatch.incidents", "incident" => incident.label()).increment(1);
    if let Some(callback) = &attrs.incident_callback
        && let Some(content) = callback(incident, context)
    {
        return content;
    }
    let status = incident.default_status();
    if status == StatusCode::NOT_MODIFIED {
        return ResponseContent::new(status);
    }
    ResponseContent::new(status)
        .content_type("text/plain; charset=utf-8")
        .bytes(Bytes::from(format!("{incident}\n")))
}

enum BodyState {
    Prohibited,
    Collect {
        buf: Vec<u8>,
        limit: u64,
        json: bool,
    },
    Reduce {
        acc: Box<dyn Any + Send>,
        step: Arc<ReduceStep>,
        received: u64,
        limit: u64,
    },
}

/// Wraps a selected response for one request: header validation, the
/// request-body plan, HTTP preconditions, and incident mapping.
///
/// The wire layer drives it with [`on_chunk`](Self::on_chunk) in arrival
/// order on a single task, then closes with [`on_end`](Self::on_end) or
/// [`on_error`](Self::on_error).
pub struct RequestProcessor {
    response: Arc<ResponseImpl>,
    context: RequestContext,
    subpath: Vec<String>,
    query: crate::query::QueryValue,
    attributes: GroupAttributes,
    body: BodyState,
}

impl RequestProcessor {
    /// Validates headers and preconditions and sets up the body handler.
    /// `Err` carries an already-rendered short-circuit response.
    pub fn start(
        selection: Selection,
        attributes: GroupAttributes,
        context: RequestContext,
        headers: &HeaderMap,
    ) -> Result<RequestProcessor, ResponseContent> {
        let response = selection.response;

        if let Some(validate) = &response.header_validator
            && let Err(cause) = validate(headers)
        {
            return Err(render_incident(
                &Incident::InvalidHeaders(cause),
                &context,
                &attributes,
            ));
        }

        if let Some(incident) = check_preconditions(&response, &context.method, headers) {
            let mut content = render_incident(&incident, &context, &attributes);
            if content.entity_tag.is_none() {
                content.entity_tag = response.entity_tag.clone();
            }
            return Err(content);
        }

        let limit = |plan_limit: Option<u64>| {
            plan_limit
                .or(attributes.body_length_limit)
                .unwrap_or(DEFAULT_BODY_LIMIT)
        };

        let body = match &response.body_plan {
            BodyPlan::Prohibit => {
                let declared = headers
                    .get(CONTENT_LENGTH)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse::<u64>().ok());
                if declared.is_some_and(|len| len > 0) {
                    return Err(render_incident(
                        &Incident::PayloadTooLarge,
                        &context,
                        &attributes,
                    ));
                }
                BodyState::Prohibited
            }
            BodyPlan::Collect { limit: plan_limit } => BodyState::Collect {
                buf: Vec::new(),
                limit: limit(*plan_limit),
                json: false,
            },
            BodyPlan::Json { limit: plan_limit } => BodyState::Collect {
                buf: Vec::new(),
                limit: limit(*plan_limit),
                json: true,
            },
            BodyPlan::Reduce {
                limit: plan_limit,
                init,
                step,
            } => BodyState::Reduce {
                acc: init(),
                step: step.clone(),
                received: 0,
                limit: limit(*plan_limit),
            },
        };

        Ok(RequestProcessor {
            response,
            context,
            subpath: selection.subpath,
            query: selection.query,
            attributes,
            body,
        })
    }

    /// Accepts one request-body chunk. `Err` carries the rendered overflow
    /// or rejection response; the caller stops feeding afterwards.
    pub fn on_chunk(&mut self, chunk: &[u8]) -> Result<(), ResponseContent> {
        match &mut self.body {
            BodyState::Prohibited => {
                if chunk.is_empty() {
                    Ok(())
                } else {
                    Err(render_incident(
                        &Incident::PayloadTooLarge,
                        &self.context,
                        &self.attributes,
                    ))
                }
            }
            BodyState::Collect { buf, limit, .. } => {
                if (buf.len() + chunk.len()) as u64 > *limit {
                    Err(render_incident(
                        &Incident::PayloadTooLarge,
                        &self.context,
                        &self.attributes,
                    ))
                } else {
                    buf.extend_from_slice(chunk);
                    Ok(())
                }
            }
            BodyState::Reduce {
                acc,
                step,
                received,
                limit,
            } => {
                *received += chunk.len() as u64;
                if *received > *limit {
                    Err(render_incident(
                        &Incident::PayloadTooLarge,
                        &self.context,
                        &self.attributes,
                    ))
                } else {
                    step(acc.as_mut(), chunk);
                    Ok(())
                }
            }
        }
    }

    /// Closes the body and produces the response content.
    pub fn on_end(self) -> ResponseContent {
        let outcome = match self.body {
            BodyState::Prohibited => BodyOutcome::None,
            BodyState::Collect {
                buf, json: false, ..
            } => BodyOutcome::Bytes(Bytes::from(buf)),
            BodyState::Collect {
                buf, json: true, ..
            } => match serde_json::from_slice(&buf) {
                Ok(value) => BodyOutcome::Json(value),
                Err(error) => {
                    return render_incident(
                        &Incident::MalformedBody(error.to_string()),
                        &self.context,
                        &self.attributes,
                    );
                }
            },
            BodyState::Reduce { acc, .. } => BodyOutcome::Reduced(acc),
        };

        let input = RespondInput {
            context: &self.context,
            subpath: &self.subpath,
            query: self.query,
            body: outcome,
        };

        match (self.response.responder)(input) {
            Ok(mut content) => {
                // The declared validators apply unless the responder set
                // its own.
                if content.entity_tag.is_none() {
                    content.entity_tag = self.response.entity_tag.clone();
                }
                if content.last_modified.is_none() {
                    content.last_modified = self.response.modified_at;
                }
                content
            }
            Err(error) => {
                if let Some(callback) = &self.attributes.error_callback {
                    callback(error.as_ref(), &self.context);
                }
                render_incident(
                    &Incident::ProcessingFailed(error.to_string()),
                    &self.context,
                    &self.attributes,
                )
            }
        }
    }

    /// Body transport failed; the in-progress response is dropped.
    pub fn on_error(self, cause: &str) -> ResponseContent {
        render_incident(
            &Incident::ProcessingFailed(cause.to_owned()),
            &self.context,
            &self.attributes,
        )
    }

    pub fn context(&self) -> &RequestContext {
        &self.context
    }
}

/// RFC 9110 conditional-request checks against the response's declared
/// entity tag and modification date, when declared.
fn check_preconditions(
    response: &ResponseImpl,
    method: &Method,
    headers: &HeaderMap,
) -> Option<Incident> {
    let is_read = *method == Method::GET || *method == Method::HEAD;

    if let Some(tag) = &response.entity_tag {
        if let Some(raw) = headers.get(IF_MATCH).and_then(|v| v.to_str().ok())
            && !etag_list_matches(raw, tag)
        {
            return Some(Incident::PreconditionFailed);
        }
        if let Some(raw) = headers.get(IF_NONE_MATCH).and_then(|v| v.to_str().ok()) {
            if etag_list_matches(raw, tag) {
                return Some(if is_read {
                    Incident::NotModified
                } else {
                    Incident::PreconditionFailed
                });
            }
            // A present If-None-Match suppresses If-Modified-Since.
            return None;
        }
    }

    if let Some(modified) = response.modified_at {
        let modified = to_http_seconds(modified);
        if is_read
            && let Some(since) = parse_date(headers, IF_MODIFIED_SINCE)
            && modified <= to_http_seconds(since)
        {
            return Some(Incident::NotModified);
        }
        if let Some(since) = parse_date(headers, IF_UNMODIFIED_SINCE)
            && modified > to_http_seconds(since)
        {
            return Some(Incident::PreconditionFailed);
        }
    }

    None
}

fn parse_date(headers: &HeaderMap, name: http::header::HeaderName) -> Option<SystemTime> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| httpdate::parse_http_date(v).ok())
}

// HTTP dates carry second resolution.
fn to_http_seconds(when: SystemTime) -> u64 {
    when.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn etag_list_matches(raw: &str, tag: &str) -> bool {
    raw.split(',')
        .map(str::trim)
        .any(|candidate| candidate == "*" || normalize_etag(candidate) == tag)
}

fn normalize_etag(raw: &str) -> &str {
    let raw = raw.strip_prefix("W/").unwrap_or(raw);
    raw.strip_prefix('"')
        .and_then(|r| r.strip_suffix('"'))
        .unwrap_or(raw)
}
