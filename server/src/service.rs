use crate::body;
use bytes::Bytes;
use dispatch::{
    DispatchTree, Incident, Match, ParserArena, Redirect, RequestContext, RequestProcessor,
    ResponseBody, ResponseContent, render_incident,
};
use http::header::{CONNECTION, CONTENT_LENGTH, CONTENT_TYPE, ETAG, LAST_MODIFIED};
use http::{Method, StatusCode, Version};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::Body;
use hyper::service::Service;
use hyper::{Request, Response};
use metrics::counter;
use std::convert::Infallible;
use std::future::Future;
use std::io::Read;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::{Mutex, Notify};
use tracing::{debug, warn};

type WireBody = BoxBody<Bytes, Infallible>;

/// Hyper service for one connection: decodes the request head, walks the
/// dispatch tree, drives the body pipeline, and renders wire responses.
///
/// The parser arena is per connection; requests on a connection are
/// processed sequentially, so the lock is uncontended and parser state is
/// reused without reallocation.
pub struct ConnectionService {
    tree: Arc<DispatchTree>,
    arena: Arc<Mutex<ParserArena>>,
    budget: Arc<AtomicUsize>,
    exhausted: Arc<Notify>,
    scheme: &'static str,
}

impl ConnectionService {
    pub fn new(tree: Arc<DispatchTree>, request_limit: usize, secure: bool) -> Self {
        let arena = Arc::new(Mutex::new(tree.new_arena()));
        ConnectionService {
            tree,
            arena,
            budget: Arc::new(AtomicUsize::new(request_limit)),
            exhausted: Arc::new(Notify::new()),
            scheme: if secure { "https" } else { "http" },
        }
    }

    /// Notified once when the request budget is spent; the connection
    /// driver reacts with a graceful shutdown.
    pub(crate) fn exhausted(&self) -> Arc<Notify> {
        self.exhausted.clone()
    }
}

impl<B> Service<Request<B>> for ConnectionService
where
    B: Body<Data = Bytes> + Send + Unpin + 'static,
    B::Error: std::fmt::Display,
{
    type Response = Response<WireBody>;
    type Error = Infallible;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn call(&self, request: Request<B>) -> Self::Future {
        let tree = self.tree.clone();
        let arena = self.arena.clone();
        let scheme = self.scheme;

        let budget = self
            .budget
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        let last = match budget {
            Ok(1) => {
                self.exhausted.notify_one();
                true
            }
            Ok(_) => false,
            Err(_) => {
                return Box::pin(async move {
                    Ok(simple_response(
                        StatusCode::SERVICE_UNAVAILABLE,
                        "connection request limit reached",
                        true,
                    ))
                });
            }
        };

        Box::pin(async move {
            let (parts, request_body) = request.into_parts();
            let is_head = parts.method == Method::HEAD;
            let close = last && parts.version <= Version::HTTP_11;

            let ctx = match RequestContext::from_head(&parts.method, &parts.uri, &parts.headers) {
                Ok(ctx) => ctx,
                Err(error) => {
                    debug!(%error, "rejecting undecodable request target");
                    counter!("server.requests", "outcome" => "malformed").increment(1);
                    return Ok(simple_response(
                        StatusCode::BAD_REQUEST,
                        "malformed request URI",
                        close,
                    ));
                }
            };

            let outcome = {
                let mut arena = arena.lock().await;
                tree.dispatch(&ctx, &mut arena)
            };

            let content = match outcome.verdict {
                Match::Unambiguous(selection) => {
                    counter!("server.requests", "outcome" => "match").increment(1);
                    match RequestProcessor::start(
                        selection,
                        outcome.attributes,
                        ctx,
                        &parts.headers,
                    ) {
                        Ok(processor) => body::drive(processor, request_body).await,
                        Err(short_circuit) => short_circuit,
                    }
                }
                Match::NotFound => match outcome.redirect {
                    Some(redirect) => {
                        counter!("server.requests", "outcome" => "redirect").increment(1);
                        redirect_content(&redirect, scheme)
                    }
                    None => {
                        counter!("server.requests", "outcome" => "not_found").increment(1);
                        render_incident(&Incident::ResponseNotFound, &ctx, &outcome.attributes)
                    }
                },
                Match::Ambiguous => {
                    counter!("server.requests", "outcome" => "ambiguous").increment(1);
                    render_incident(&Incident::AmbiguousRequest, &ctx, &outcome.attributes)
                }
            };

            Ok(to_wire(content, is_head, close))
        })
    }
}

fn redirect_content(redirect: &Redirect, scheme: &str) -> ResponseContent {
    let location = format!(
        "{scheme}://{}{}",
        redirect.canonical_host, redirect.path_and_query
    );
    ResponseContent::new(StatusCode::FOUND).header("location", location)
}

/// Assembles the wire response: automatic headers first, then custom ones
/// in their declared order. HEAD responses keep every header (including
/// `Content-Length`) but carry no body.
fn to_wire(content: ResponseContent, is_head: bool, close: bool) -> Response<WireBody> {
    let mut builder = Response::builder().status(content.status);

    if let Some(content_type) = &content.content_type {
        builder = builder.header(CONTENT_TYPE, content_type.as_str());
    }
    if let Some(length) = content.content_length()
        && content.status != StatusCode::NOT_MODIFIED
        && content.status != StatusCode::NO_CONTENT
    {
        builder = builder.header(CONTENT_LENGTH, length);
    }
    if let Some(tag) = &content.entity_tag {
        builder = builder.header(ETAG, format!("\"{tag}\""));
    }
    if let Some(when) = content.last_modified {
        builder = builder.header(LAST_MODIFIED, httpdate::fmt_http_date(when));
    }
    for (name, value) in &content.headers {
        builder = builder.header(name.as_str(), value.as_str());
    }
    if close {
        builder = builder.header(CONNECTION, "close");
    }

    let wire_body: WireBody = if is_head {
        empty_body()
    } else {
        match content.body {
            ResponseBody::Empty => empty_body(),
            ResponseBody::Bytes(bytes) => Full::new(bytes).map_err(|never| match never {}).boxed(),
            ResponseBody::Stream(mut source) => {
                body::pumped_body(move |buf| source.read(buf)).boxed()
            }
            ResponseBody::Callback(produce) => body::pumped_body(produce).boxed(),
        }
    };

    builder.body(wire_body).unwrap_or_else(|error| {
        warn!(%error, "failed to assemble response head");
        Response::builder()
            .status(StatusCode::INTERNAL_SERVER_ERROR)
            .body(empty_body())
            .unwrap()
    })
}

fn simple_response(status: StatusCode, message: &str, close: bool) -> Response<WireBody> {
    let mut builder = Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "text/plain; charset=utf-8");
    if close {
        builder = builder.header(CONNECTION, "close");
    }
    builder
        .body(
            Full::new(Bytes::from(format!("{message}\n")))
                .map_err(|never| match never {})
                .boxed(),
        )
        .unwrap()
}

fn empty_body() -> WireBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use dispatch::{
        BodyOutcome, BodyPlan, DispatchSpec, GroupAttributes, ResponseImpl, SchemaBuilder,
    };
    use http::header::{HOST, LOCATION};

    fn text_response(text: &str) -> ResponseImpl {
        let text = text.to_owned();
        ResponseImpl::new(move |_| Ok(ResponseContent::text(text.clone())))
    }

    fn service(builder: SchemaBuilder, secure: bool) -> ConnectionService {
        ConnectionService::new(Arc::new(builder.build()), 128, secure)
    }

    fn request(
        method: Method,
        uri: &str,
        host: Option<&str>,
        content: &'static [u8],
    ) -> Request<BoxBody<Bytes, Infallible>> {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(host) = host {
            builder = builder.header(HOST, host);
        }
        let request_body = if content.is_empty() {
            Empty::<Bytes>::new()
                .map_err(|never| match never {})
                .boxed()
        } else {
            Full::new(Bytes::from_static(content))
                .map_err(|never| match never {})
                .boxed()
        };
        builder.body(request_body).unwrap()
    }

    async fn body_string(response: Response<WireBody>) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8_lossy(&bytes).into_owned()
    }

    #[tokio::test]
    async fn test_get_and_not_found() {
        let mut builder = SchemaBuilder::new();
        builder.insert(text_response("x"), &DispatchSpec::new().path("/x"));
        let service = service(builder, false);

        let response = service
            .call(request(Method::GET, "/x", None, b""))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers().get(CONTENT_LENGTH).unwrap(), "1");
        assert_eq!(body_string(response).await, "x");

        let response = service
            .call(request(Method::GET, "/missing", None, b""))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_head_shares_get_headers_with_empty_body() {
        let mut builder = SchemaBuilder::new();
        builder.insert(
            text_response("x"),
            &DispatchSpec::new().method(Method::GET).path("/x"),
        );
        let service = service(builder, false);

        let get = service
            .call(request(Method::GET, "/x", None, b""))
            .await
            .unwrap();
        let head = service
            .call(request(Method::HEAD, "/x", None, b""))
            .await
            .unwrap();

        assert_eq!(head.status(), StatusCode::OK);
        assert_eq!(
            head.headers().get(CONTENT_LENGTH),
            get.headers().get(CONTENT_LENGTH)
        );
        assert_eq!(
            head.headers().get(CONTENT_TYPE),
            get.headers().get(CONTENT_TYPE)
        );
        assert_eq!(body_string(get).await, "x");
        assert_eq!(body_string(head).await, "");
    }

    #[tokio::test]
    async fn test_alias_redirect() {
        let mut builder = SchemaBuilder::new();
        builder.insert(
            text_response("api"),
            &DispatchSpec::new()
                .host("api.example.com")
                .alias("example.com")
                .path("/foo"),
        );
        let service = service(builder, true);

        let response = service
            .call(request(Method::GET, "/foo", Some("example.com"), b""))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(
            response.headers().get(LOCATION).unwrap(),
            "https://api.example.com/foo"
        );
    }

    #[tokio::test]
    async fn test_body_limit_cascade() {
        let mut builder = SchemaBuilder::new();
        builder.insert_attributes(
            GroupAttributes::new().body_length_limit(7),
            &DispatchSpec::new().path("/g7"),
        );
        builder.insert(
            ResponseImpl::new(|input| {
                let BodyOutcome::Bytes(bytes) = input.body else {
                    panic!("expected collected bytes");
                };
                Ok(ResponseContent::text(bytes.len().to_string()))
            })
            .body(BodyPlan::Collect { limit: None }),
            &DispatchSpec::new().method(Method::POST).path("/g7/r"),
        );
        let service = service(builder, false);

        let response = service
            .call(request(Method::POST, "/g7/r", None, b"1234567"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_string(response).await, "7");

        let response = service
            .call(request(Method::POST, "/g7/r", None, b"12345678"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn test_ambiguous_is_bad_request() {
        let mut builder = SchemaBuilder::new();
        builder.insert(
            text_response("one").entire_query(|_| Some(dispatch::QueryValue::Unit)),
            &DispatchSpec::new().path("/a"),
        );
        builder.insert(
            text_response("two").entire_query(|_| Some(dispatch::QueryValue::Unit)),
            &DispatchSpec::new().path("/a"),
        );
        let service = service(builder, false);

        let response = service
            .call(request(Method::GET, "/a?x=1", None, b""))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_undecodable_target_is_bad_request() {
        let service = service(SchemaBuilder::new(), false);
        let response = service
            .call(request(Method::GET, "/%FF", None, b""))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_request_limit_closes_connection() {
        let mut builder = SchemaBuilder::new();
        builder.insert(text_response("x"), &DispatchSpec::new().path("/x"));
        let service = ConnectionService::new(Arc::new(builder.build()), 1, false);

        let first = service
            .call(request(Method::GET, "/x", None, b""))
            .await
            .unwrap();
        assert_eq!(first.status(), StatusCode::OK);
        assert_eq!(first.headers().get(CONNECTION).unwrap(), "close");

        let second = service
            .call(request(Method::GET, "/x", None, b""))
            .await
            .unwrap();
        assert_eq!(second.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_custom_incident_callback_is_used() {
        let mut builder = SchemaBuilder::new();
        builder.insert_attributes(
            GroupAttributes::new().on_incident(|incident, _| {
                matches!(incident, Incident::ResponseNotFound)
                    .then(|| ResponseContent::new(StatusCode::GONE))
            }),
            &DispatchSpec::new().path("/area"),
        );
        builder.insert(
            text_response("inside"),
            &DispatchSpec::new().path("/area/present"),
        );
        let service = service(builder, false);

        let response = service
            .call(request(Method::GET, "/area/absent", None, b""))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::GONE);
    }
}
