use http::header::HOST;
use http::{HeaderMap, Method, Uri};
use percent_encoding::percent_decode_str;
use thiserror::Error;

/// A single decoded `name[=value]` pair from the URL query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryItem {
    pub name: String,
    pub value: Option<String>,
}

impl QueryItem {
    pub fn new(name: impl Into<String>, value: Option<&str>) -> Self {
        QueryItem {
            name: name.into(),
            value: value.map(str::to_owned),
        }
    }
}

/// Errors raised while decoding the request target.
///
/// A malformed target yields `400 Bad Request` unconditionally; no user
/// callback is consulted because there is no context to dispatch.
#[derive(Error, Debug)]
pub enum ContextError {
    #[error("malformed request URI: {0}")]
    MalformedUri(String),
}

/// Decoded request target: everything the dispatch tree keys on besides the
/// method.
#[derive(Debug, Clone)]
pub struct RequestTarget {
    pub user_info: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    /// Normalised path components. Leading/trailing empties are stripped,
    /// interior empties and `.` are removed, `..` pops (clamped at root).
    pub path: Vec<String>,
    /// Whether the raw path ended at a directory boundary (trailing `/`).
    pub directory: bool,
    pub query: Vec<QueryItem>,
    /// Raw path-and-query, kept verbatim for redirect targets.
    pub raw_path_and_query: String,
}

/// Per-request immutable view the dispatcher works from.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub method: Method,
    pub target: RequestTarget,
}

impl RequestContext {
    /// Decodes a context from a parsed request head.
    ///
    /// The host comes from the URI authority when the request is in absolute
    /// form, falling back to the `Host` header (the common HTTP/1.1 case).
    /// Any port suffix is stripped before matching.
    pub fn from_head(
        method: &Method,
        uri: &Uri,
        headers: &HeaderMap,
    ) -> Result<Self, ContextError> {
        let mut user_info = None;
        let mut port = None;

        let host = match uri.authority() {
            Some(authority) => {
                let raw = authority.as_str();
                let host_part = match raw.rsplit_once('@') {
                    Some((info, rest)) => {
                        user_info = Some(decode(info)?);
                        rest
                    }
                    None => raw,
                };
                port = authority.port_u16();
                Some(strip_port(host_part).to_ascii_lowercase())
            }
            None => headers
                .get(HOST)
                .and_then(|h| h.to_str().ok())
                .map(|h| strip_port(h).to_ascii_lowercase()),
        };

        let (path, directory) = normalize_path(uri.path())?;
        let query = parse_query(uri.query())?;

        let raw_path_and_query = uri
            .path_and_query()
            .map(|pq| pq.as_str().to_owned())
            .unwrap_or_else(|| "/".to_owned());

        Ok(RequestContext {
            method: method.clone(),
            target: RequestTarget {
                user_info,
                host,
                port,
                path,
                directory,
                query,
                raw_path_and_query,
            },
        })
    }
}

fn strip_port(host: &str) -> &str {
    host.rsplit_once(':')
        .filter(|(_, p)| p.chars().all(|c| c.is_ascii_digit()))
        .map(|(h, _)| h)
        .unwrap_or(host)
}

fn decode(raw: &str) -> Result<String, ContextError> {
    percent_decode_str(raw)
        .decode_utf8()
        .map(|s| s.into_owned())
        .map_err(|_| ContextError::MalformedUri(raw.to_owned()))
}

/// Normalises a raw URI path into its component sequence.
///
/// Percent-decoding happens before splitting, so an encoded `/` produces a
/// component boundary. `..` never escapes the root. The result is idempotent
/// under re-normalisation.
pub fn normalize_path(raw: &str) -> Result<(Vec<String>, bool), ContextError> {
    let decoded = decode(raw)?;
    let directory = decoded.ends_with('/');

    let mut components: Vec<String> = Vec::new();
    for segment in decoded.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                components.pop();
            }
            other => components.push(other.to_owned()),
        }
    }
    Ok((components, directory))
}

/// Splits and decodes the raw query string into items.
///
/// Empty pieces are dropped, so `"?"` and `"?&"` both decode to an empty
/// item list, which parsers treat the same as an absent query. Item order is
/// preserved; it only matters as the order serial parsers observe items.
pub fn parse_query(raw: Option<&str>) -> Result<Vec<QueryItem>, ContextError> {
    let Some(raw) = raw else {
        return Ok(Vec::new());
    };

    let mut items = Vec::new();
    for piece in raw.split('&').filter(|p| !p.is_empty()) {
        let (name, value) = match piece.split_once('=') {
            Some((n, v)) => (decode(n)?, Some(decode(v)?)),
            None => (decode(piece)?, None),
        };
        items.push(QueryItem { name, value });
    }
    Ok(items)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn components(raw: &str) -> Vec<String> {
        normalize_path(raw).unwrap().0
    }

    #[test]
    fn test_path_normalization() {
        assert_eq!(components("///a/./b/../c//"), vec!["a", "c"]);
        assert_eq!(components("/"), Vec::<String>::new());
        assert_eq!(components(""), Vec::<String>::new());
        assert_eq!(components("/a/b"), vec!["a", "b"]);
    }

    #[test]
    fn test_dot_dot_clamps_at_root() {
        assert_eq!(components(".a/../../uuid.txt"), vec!["uuid.txt"]);
        assert_eq!(components("/../.."), Vec::<String>::new());
    }

    #[test]
    fn test_normalization_is_idempotent() {
        for raw in ["///a/./b/../c//", "/x/y/", ".a/../../uuid.txt", "/"] {
            let (first, dir) = normalize_path(raw).unwrap();
            let rejoined = if dir || first.is_empty() {
                format!("/{}/", first.join("/"))
            } else {
                format!("/{}", first.join("/"))
            };
            let (second, _) = normalize_path(&rejoined).unwrap();
            assert_eq!(first, second, "renormalising {raw:?}");
        }
    }

    #[test]
    fn test_percent_decoding_precedes_splitting() {
        // An encoded slash introduces a component boundary.
        assert_eq!(components("/a%2Fb"), vec!["a", "b"]);
        assert_eq!(components("/caf%C3%A9"), vec!["café"]);
    }

    #[test]
    fn test_trailing_slash_marks_directory_without_component() {
        let (path, directory) = normalize_path("/a/").unwrap();
        assert_eq!(path, vec!["a"]);
        assert!(directory);

        let (path, directory) = normalize_path("/a").unwrap();
        assert_eq!(path, vec!["a"]);
        assert!(!directory);
    }

    #[test]
    fn test_query_parsing() {
        let items = parse_query(Some("a=1&flag&b=two")).unwrap();
        assert_eq!(
            items,
            vec![
                QueryItem::new("a", Some("1")),
                QueryItem::new("flag", None),
                QueryItem::new("b", Some("two")),
            ]
        );
    }

    #[test]
    fn test_bare_question_mark_is_empty_query() {
        assert!(parse_query(Some("")).unwrap().is_empty());
        assert!(parse_query(Some("&")).unwrap().is_empty());
        assert!(parse_query(None).unwrap().is_empty());
    }

    #[test]
    fn test_query_values_are_percent_decoded() {
        let items = parse_query(Some("name=hello%20world")).unwrap();
        assert_eq!(items[0].value.as_deref(), Some("hello world"));
    }

    #[test]
    fn test_context_host_from_header() {
        let uri: Uri = "/a/b?x=1".parse().unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(HOST, "API.Example.com:8080".parse().unwrap());

        let ctx = RequestContext::from_head(&Method::GET, &uri, &headers).unwrap();
        assert_eq!(ctx.target.host.as_deref(), Some("api.example.com"));
        assert_eq!(ctx.target.path, vec!["a", "b"]);
        assert_eq!(ctx.target.query.len(), 1);
    }

    #[test]
    fn test_context_user_info_from_authority() {
        let uri: Uri = "http://alice@example.com/".parse().unwrap();
        let ctx = RequestContext::from_head(&Method::GET, &uri, &HeaderMap::new()).unwrap();
        assert_eq!(ctx.target.user_info.as_deref(), Some("alice"));
        assert_eq!(ctx.target.host.as_deref(), Some("example.com"));
    }
}
