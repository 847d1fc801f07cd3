//! Request model.
//!
//! # Responsibilities
//! - Describe one outbound request (origin, method, path, headers, body)
//! - Carry per-request policy: idempotency, blocking, cancellation, timeouts
//! - Reject malformed requests before they are queued

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;
use std::str::FromStr;
use std::time::Duration;

use bytes::Bytes;
use http::Method;
use url::Url;

use crate::dispatcher::abort::AbortSignal;
use crate::error::DispatchError;

/// Scheme, host and port of one logical upstream endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Origin {
    scheme: String,
    host: String,
    port: u16,
}

impl Origin {
    /// Parse an origin such as `http://example.com:8080`.
    ///
    /// Any path, query or fragment in `input` is ignored.
    pub fn parse(input: &str) -> Result<Self, DispatchError> {
        let url = Url::parse(input)
            .map_err(|e| DispatchError::InvalidArgument(format!("invalid origin {input}: {e}")))?;
        Self::from_url(&url)
    }

    /// Extract the origin of an absolute URL.
    pub fn from_url(url: &Url) -> Result<Self, DispatchError> {
        let scheme = url.scheme();
        if scheme != "http" && scheme != "https" {
            return Err(DispatchError::InvalidArgument(format!(
                "unsupported scheme {scheme}"
            )));
        }
        let host = url
            .host_str()
            .ok_or_else(|| DispatchError::InvalidArgument(format!("missing host in {url}")))?;
        let port = url
            .port_or_known_default()
            .ok_or_else(|| DispatchError::InvalidArgument(format!("missing port in {url}")))?;
        Ok(Self {
            scheme: scheme.to_string(),
            host: host.to_string(),
            port,
        })
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// `host:port`, suitable for a socket connect.
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Value of the `host` header: the port is omitted when it is the
    /// scheme's default.
    pub fn host_header(&self) -> String {
        let default_port = match self.scheme.as_str() {
            "https" => 443,
            _ => 80,
        };
        if self.port == default_port {
            self.host.clone()
        } else {
            self.authority()
        }
    }

    /// Absolute URL of `path` on this origin.
    pub fn url(&self, path: &str) -> Result<Url, DispatchError> {
        let raw = format!("{self}{path}");
        Url::parse(&raw).map_err(|e| DispatchError::InvalidArgument(format!("invalid url {raw}: {e}")))
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.scheme, self.host_header())
    }
}

impl FromStr for Origin {
    type Err = DispatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Origin::parse(s)
    }
}

/// Ordered, case-preserving header multimap.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a header, keeping any existing values for `name`.
    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.push((name.into(), value.into()));
    }

    /// First value for `name`, compared case-insensitively.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.0
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Remove every value for `name`.
    pub fn remove(&mut self, name: &str) {
        self.0.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Headers {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Headers(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

impl IntoIterator for Headers {
    type Item = (String, String);
    type IntoIter = std::vec::IntoIter<(String, String)>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

/// Producer of outbound body chunks.
pub type ChunkStream = Box<dyn Iterator<Item = Result<Bytes, DispatchError>>>;

/// A streaming body. Clones share one cursor; once taken it cannot be
/// replayed.
#[derive(Clone)]
pub struct StreamBody(Rc<RefCell<Option<ChunkStream>>>);

impl StreamBody {
    pub fn new(stream: impl Iterator<Item = Result<Bytes, DispatchError>> + 'static) -> Self {
        Self(Rc::new(RefCell::new(Some(Box::new(stream)))))
    }

    pub(crate) fn take(&self) -> Option<ChunkStream> {
        self.0.borrow_mut().take()
    }
}

/// Request body.
#[derive(Clone, Default)]
pub enum Body {
    #[default]
    Empty,
    Bytes(Bytes),
    Stream(StreamBody),
}

impl Body {
    /// A body produced by an iterator of chunks.
    pub fn stream(chunks: impl Iterator<Item = Result<Bytes, DispatchError>> + 'static) -> Self {
        Body::Stream(StreamBody::new(chunks))
    }

    /// Length when known up front.
    pub fn known_len(&self) -> Option<u64> {
        match self {
            Body::Empty => Some(0),
            Body::Bytes(b) => Some(b.len() as u64),
            Body::Stream(_) => None,
        }
    }

    /// Whether the body can be sent again from the start.
    pub fn is_replayable(&self) -> bool {
        !matches!(self, Body::Stream(_))
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Body::Empty => true,
            Body::Bytes(b) => b.is_empty(),
            Body::Stream(_) => false,
        }
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Body::Empty => f.write_str("Empty"),
            Body::Bytes(b) => write!(f, "Bytes({} bytes)", b.len()),
            Body::Stream(_) => f.write_str("Stream"),
        }
    }
}

impl From<Bytes> for Body {
    fn from(b: Bytes) -> Self {
        Body::Bytes(b)
    }
}

impl From<Vec<u8>> for Body {
    fn from(b: Vec<u8>) -> Self {
        Body::Bytes(Bytes::from(b))
    }
}

impl From<String> for Body {
    fn from(s: String) -> Self {
        Body::Bytes(Bytes::from(s))
    }
}

impl From<&'static str> for Body {
    fn from(s: &'static str) -> Self {
        Body::Bytes(Bytes::from_static(s.as_bytes()))
    }
}

/// One outbound request.
#[derive(Debug, Clone)]
pub struct Request {
    /// Target origin. Required by routing dispatchers; a single-origin
    /// dispatcher fills in its own when absent.
    pub origin: Option<Origin>,
    pub method: Method,
    /// Path and query, e.g. `/search?q=1`.
    pub path: String,
    pub headers: Headers,
    pub body: Body,
    /// Safe to re-send after a collateral failure. Defaults to GET/HEAD.
    pub idempotent: Option<bool>,
    /// Nothing is written behind this request until its response completes.
    pub blocking: bool,
    /// Protocol for an `Upgrade` request.
    pub upgrade: Option<String>,
    /// Discard the socket after this request.
    pub reset: bool,
    pub signal: Option<AbortSignal>,
    pub headers_timeout: Option<Duration>,
    pub body_timeout: Option<Duration>,
    pub max_redirections: Option<u32>,
}

impl Request {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            origin: None,
            method,
            path: path.into(),
            headers: Headers::new(),
            body: Body::Empty,
            idempotent: None,
            blocking: false,
            upgrade: None,
            reset: false,
            signal: None,
            headers_timeout: None,
            body_timeout: None,
            max_redirections: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    /// Build a request from an absolute URL, splitting origin and path.
    pub fn from_url(method: Method, url: &str) -> Result<Self, DispatchError> {
        let url = Url::parse(url)
            .map_err(|e| DispatchError::InvalidArgument(format!("invalid url {url}: {e}")))?;
        let origin = Origin::from_url(&url)?;
        Ok(Self::new(method, path_of(&url)).origin(origin))
    }

    pub fn origin(mut self, origin: Origin) -> Self {
        self.origin = Some(origin);
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.append(name, value);
        self
    }

    pub fn body(mut self, body: impl Into<Body>) -> Self {
        self.body = body.into();
        self
    }

    pub fn idempotent(mut self, idempotent: bool) -> Self {
        self.idempotent = Some(idempotent);
        self
    }

    pub fn blocking(mut self, blocking: bool) -> Self {
        self.blocking = blocking;
        self
    }

    pub fn upgrade(mut self, protocol: impl Into<String>) -> Self {
        self.upgrade = Some(protocol.into());
        self
    }

    pub fn reset(mut self, reset: bool) -> Self {
        self.reset = reset;
        self
    }

    pub fn signal(mut self, signal: AbortSignal) -> Self {
        self.signal = Some(signal);
        self
    }

    pub fn headers_timeout(mut self, timeout: Duration) -> Self {
        self.headers_timeout = Some(timeout);
        self
    }

    pub fn body_timeout(mut self, timeout: Duration) -> Self {
        self.body_timeout = Some(timeout);
        self
    }

    pub fn max_redirections(mut self, max: u32) -> Self {
        self.max_redirections = Some(max);
        self
    }

    /// Whether a collateral failure may transparently re-send this request.
    pub fn is_idempotent(&self) -> bool {
        let declared = self
            .idempotent
            .unwrap_or(self.method == Method::GET || self.method == Method::HEAD);
        declared && self.body.is_replayable()
    }

    /// Upgrade and CONNECT requests take over the socket.
    pub fn is_upgrade(&self) -> bool {
        self.upgrade.is_some() || self.method == Method::CONNECT
    }

    /// Whether the socket must be discarded after this request.
    pub fn wants_reset(&self) -> bool {
        self.reset
            || self
                .headers
                .get("connection")
                .is_some_and(|v| v.trim().eq_ignore_ascii_case("close"))
    }

    pub fn is_aborted(&self) -> bool {
        self.signal.as_ref().is_some_and(AbortSignal::is_aborted)
    }

    /// Absolute URL of this request. Requires an origin.
    pub fn url(&self) -> Result<Url, DispatchError> {
        match &self.origin {
            Some(origin) => origin.url(&self.path),
            None => Err(DispatchError::InvalidArgument("missing origin".into())),
        }
    }

    /// Check the request shape before it is queued.
    pub(crate) fn validate(&self, strict_content_length: bool) -> Result<(), DispatchError> {
        validate_path(&self.method, &self.path)?;

        let mut content_length: Option<u64> = None;
        for (name, value) in self.headers.iter() {
            if !is_token(name) {
                return Err(DispatchError::InvalidArgument(format!(
                    "invalid header name {name:?}"
                )));
            }
            if value.bytes().any(|b| b == b'\r' || b == b'\n' || b == 0) {
                return Err(DispatchError::InvalidArgument(format!(
                    "invalid {name} header value"
                )));
            }
            let lower = name.to_ascii_lowercase();
            match lower.as_str() {
                "transfer-encoding" | "keep-alive" | "upgrade" => {
                    return Err(DispatchError::InvalidArgument(format!("invalid {lower} header")));
                }
                "connection" => {
                    let v = value.trim().to_ascii_lowercase();
                    if v != "close" && v != "keep-alive" {
                        return Err(DispatchError::InvalidArgument(
                            "invalid connection header".into(),
                        ));
                    }
                }
                "content-length" => {
                    if content_length.is_some() {
                        return Err(DispatchError::InvalidArgument(
                            "duplicate content-length header".into(),
                        ));
                    }
                    let parsed = value.trim().parse::<u64>().map_err(|_| {
                        DispatchError::InvalidArgument("invalid content-length header".into())
                    })?;
                    content_length = Some(parsed);
                }
                "expect" => {
                    return Err(DispatchError::NotSupported("expect header".into()));
                }
                _ => {}
            }
        }

        if let (Some(declared), Some(actual)) = (content_length, self.body.known_len()) {
            if declared != actual && strict_content_length {
                return Err(DispatchError::ContentLengthMismatch { declared, actual });
            }
        }

        if let Some(protocol) = &self.upgrade {
            if !is_token(protocol) {
                return Err(DispatchError::InvalidArgument("invalid upgrade protocol".into()));
            }
        }

        if matches!(self.headers_timeout, Some(d) if d.is_zero())
            || matches!(self.body_timeout, Some(d) if d.is_zero())
        {
            return Err(DispatchError::InvalidArgument("timeouts must be positive".into()));
        }

        Ok(())
    }
}

pub(crate) fn path_of(url: &Url) -> String {
    match url.query() {
        Some(q) => format!("{}?{}", url.path(), q),
        None => url.path().to_string(),
    }
}

fn validate_path(method: &Method, path: &str) -> Result<(), DispatchError> {
    if path.is_empty() {
        return Err(DispatchError::InvalidArgument("path must not be empty".into()));
    }
    if path.bytes().any(|b| b <= 0x20 || b == 0x7f) {
        return Err(DispatchError::InvalidArgument("invalid request path".into()));
    }
    let origin_form = path.starts_with('/');
    let asterisk = path == "*" && method == Method::OPTIONS;
    if origin_form || asterisk || method == Method::CONNECT {
        Ok(())
    } else {
        Err(DispatchError::InvalidArgument("invalid request path".into()))
    }
}

/// RFC 9110 token characters.
pub(crate) fn is_token(s: &str) -> bool {
    !s.is_empty()
        && s.bytes().all(|b| {
            b.is_ascii_alphanumeric()
                || matches!(
                    b,
                    b'!' | b'#'
                        | b'$'
                        | b'%'
                        | b'&'
                        | b'\''
                        | b'*'
                        | b'+'
                        | b'-'
                        | b'.'
                        | b'^'
                        | b'_'
                        | b'`'
                        | b'|'
                        | b'~'
                )
        })
}
