use crate::http::parser::RequestHead;
use crate::server::ConnectionToken;
use bytes::Bytes;
use percent_encoding::percent_decode_str;
use std::borrow::Cow;
use std::fmt;
use std::net::SocketAddr;

/// Header list with case-insensitive lookup. Order and duplicates are kept.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// First value for `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn get_all<'a, 'n>(&'a self, name: &'n str) -> impl Iterator<Item = &'a str> + 'n
    where
        'a: 'n,
    {
        self.0
            .iter()
            .filter(move |(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.push((name.into(), value.into()));
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<(String, String)>> for Headers {
    fn from(headers: Vec<(String, String)>) -> Self {
        Headers(headers)
    }
}

/// A request whose head has been fully parsed.
#[derive(Debug, Clone)]
pub struct Request {
    method: String,
    path: String,
    query: Option<String>,
    fragment: Option<String>,
    protocol: String,
    headers: Headers,
    body: Bytes,
    streamed: bool,
    token: ConnectionToken,
    peer_addr: SocketAddr,
}

impl Request {
    pub(crate) fn from_head(head: RequestHead, token: ConnectionToken, peer_addr: SocketAddr) -> Self {
        let (path, query, fragment) = split_target(&head.target);
        Self {
            method: head.method,
            path,
            query,
            fragment,
            protocol: format!("HTTP/1.{}", head.version),
            headers: head.headers.into(),
            body: Bytes::new(),
            streamed: false,
            token,
            peer_addr,
        }
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    /// Percent-decoded path, without query or fragment.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Raw query string, without the `?`.
    pub fn query(&self) -> Option<&str> {
        self.query.as_deref()
    }

    pub fn fragment(&self) -> Option<&str> {
        self.fragment.as_deref()
    }

    /// Decoded `key=value` pairs of the query string.
    pub fn query_pairs(&self) -> Vec<(String, String)> {
        self.query
            .as_deref()
            .map(|q| {
                url::form_urlencoded::parse(q.as_bytes())
                    .map(|(k, v)| (k.into_owned(), v.into_owned()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// First decoded value for `name` in the query string.
    pub fn query_param(&self, name: &str) -> Option<String> {
        let query = self.query.as_deref()?;
        url::form_urlencoded::parse(query.as_bytes())
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.into_owned())
    }

    /// `HTTP/1.0` or `HTTP/1.1`
    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    /// Buffered body. Empty when the body was streamed to a sink.
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn is_streamed(&self) -> bool {
        self.streamed
    }

    pub fn token(&self) -> ConnectionToken {
        self.token
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Whether the connection should close after this request's response.
    pub fn wants_close(&self) -> bool {
        let connection = self.header("connection");
        let has = |token: &str| {
            connection
                .map(|v| v.split(',').any(|t| t.trim().eq_ignore_ascii_case(token)))
                .unwrap_or(false)
        };
        if self.protocol == "HTTP/1.0" {
            !has("keep-alive")
        } else {
            has("close")
        }
    }

    /// Body would use a streaming sink: chunked transfer or a multipart upload.
    pub(crate) fn wants_stream(&self) -> bool {
        let chunked = self
            .header("transfer-encoding")
            .map(|te| te.to_ascii_lowercase().contains("chunked"))
            .unwrap_or(false);
        let multipart = self
            .header("content-type")
            .map(|ct| ct.trim_start().to_ascii_lowercase().starts_with("multipart/"))
            .unwrap_or(false);
        chunked || multipart
    }

    pub(crate) fn set_streamed(&mut self) {
        self.streamed = true;
    }

    pub(crate) fn set_body(&mut self, body: Bytes) {
        self.body = body;
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.method, self.path, self.protocol)
    }
}

/// `path?query#fragment` split, path percent-decoded.
fn split_target(target: &str) -> (String, Option<String>, Option<String>) {
    let (rest, fragment) = match target.split_once('#') {
        Some((rest, fragment)) => (rest, Some(fragment.to_string())),
        None => (target, None),
    };
    let (path, query) = match rest.split_once('?') {
        Some((path, query)) => (path, Some(query.to_string())),
        None => (rest, None),
    };

    let path = match percent_decode_str(path).decode_utf8_lossy() {
        Cow::Borrowed(p) => p.to_string(),
        Cow::Owned(p) => p,
    };
    (path, query, fragment)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(target: &str, headers: &[(&str, &str)], version: u8) -> Request {
        let head = RequestHead {
            method: "GET".to_string(),
            target: target.to_string(),
            version,
            headers: headers
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        };
        Request::from_head(
            head,
            ConnectionToken::new(1, 1),
            SocketAddr::from(([127, 0, 0, 1], 4000)),
        )
    }

    #[test]
    fn test_target_split() {
        let req = request("/search%20page?q=rust+lang&page=2#results", &[], 1);
        assert_eq!(req.path(), "/search page");
        assert_eq!(req.query(), Some("q=rust+lang&page=2"));
        assert_eq!(req.fragment(), Some("results"));
        assert_eq!(
            req.query_pairs(),
            vec![
                ("q".to_string(), "rust lang".to_string()),
                ("page".to_string(), "2".to_string())
            ]
        );
        assert_eq!(req.query_param("page").as_deref(), Some("2"));
        assert_eq!(req.query_param("missing"), None);

        let req = request("/only#frag", &[], 1);
        assert_eq!(req.path(), "/only");
        assert_eq!(req.query(), None);
        assert_eq!(req.fragment(), Some("frag"));
    }

    #[test]
    fn test_headers_case_insensitive() {
        let req = request("/", &[("Content-Type", "text/plain"), ("X-Tag", "a"), ("x-tag", "b")], 1);
        assert_eq!(req.header("content-type"), Some("text/plain"));
        assert_eq!(req.headers().get_all("X-TAG").collect::<Vec<_>>(), vec!["a", "b"]);
        assert!(!req.headers().contains("accept"));
    }

    #[test]
    fn test_header_value_outlives_lookup_name() {
        let req = request("/", &[("Host", "example")], 1);
        let host = {
            let name = String::from("host");
            req.header(&name)
        };
        assert_eq!(host, Some("example"));

        let tags: Vec<&str> = {
            let name = String::from("host");
            req.headers().get_all(&name).collect()
        };
        assert_eq!(tags, vec!["example"]);
    }

    #[test]
    fn test_wants_close() {
        assert!(!request("/", &[], 1).wants_close());
        assert!(request("/", &[("Connection", "Close")], 1).wants_close());
        assert!(request("/", &[], 0).wants_close());
        assert!(!request("/", &[("Connection", "keep-alive")], 0).wants_close());
    }

    #[test]
    fn test_wants_stream() {
        assert!(request("/", &[("Transfer-Encoding", "chunked")], 1).wants_stream());
        assert!(request("/", &[("Content-Type", "multipart/form-data; boundary=x")], 1).wants_stream());
        assert!(!request("/", &[("Content-Type", "text/plain")], 1).wants_stream());
    }
}
