//! Dispatch error taxonomy.
//!
//! # Responsibilities
//! - Name every way a dispatched request can fail
//! - Classify errors into coarse kinds for retry policies
//!
//! # Design Decisions
//! - Errors are `Clone`: one socket failure fans out to many handlers
//! - Transport errors keep their `io::ErrorKind` but not the source object

use std::io;

use url::Url;

/// Errors delivered to a handler's `on_error` callback.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    /// Malformed request, rejected before it was queued.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The socket did not connect within `connect_timeout`.
    #[error("connect timeout")]
    ConnectTimeout,

    /// No response head arrived within `headers_timeout`.
    #[error("headers timeout")]
    HeadersTimeout,

    /// No body chunk arrived within `body_timeout`.
    #[error("body timeout")]
    BodyTimeout,

    /// Transport-level failure.
    #[error("socket error: {message}")]
    Socket { kind: io::ErrorKind, message: String },

    /// The caller cancelled the request.
    #[error("request aborted")]
    RequestAborted,

    /// Non-fatal session notice (e.g. socket reset after abort, GOAWAY).
    #[error("{0}")]
    Informational(String),

    /// The request uses a feature the engine does not implement.
    #[error("not supported: {0}")]
    NotSupported(String),

    /// The dispatcher was destroyed while the request was pending.
    #[error("client destroyed")]
    ClientDestroyed,

    /// The dispatcher is closing and accepts no new requests.
    #[error("client closed")]
    ClientClosed,

    /// The response could not be parsed.
    #[error("http parser error: {0}")]
    HttpParser(String),

    /// The response head exceeded `max_header_size`.
    #[error("response headers exceed {0} bytes")]
    HeadersOverflow(usize),

    /// A declared content-length disagrees with the body.
    #[error("request body length {actual} does not match content-length {declared}")]
    ContentLengthMismatch { declared: u64, actual: u64 },

    /// A balanced pool had no upstream to dispatch to.
    #[error("no upstream available")]
    NoUpstream,

    /// A request failed after following redirects.
    #[error("{source} (after {} redirects)", redirects.len())]
    Redirect {
        source: Box<DispatchError>,
        /// URLs visited before the failing hop, in visitation order.
        redirects: Vec<Url>,
    },
}

/// Coarse classification of a [`DispatchError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidArgument,
    ConnectTimeout,
    HeadersTimeout,
    BodyTimeout,
    Socket,
    RequestAborted,
    Informational,
    NotSupported,
    ClientDestroyed,
    ClientClosed,
    Parser,
    NoUpstream,
}

impl DispatchError {
    /// Build a socket error from an I/O error.
    pub fn socket(err: &io::Error) -> Self {
        DispatchError::Socket {
            kind: err.kind(),
            message: err.to_string(),
        }
    }

    /// A socket closed by the peer.
    pub fn socket_closed() -> Self {
        DispatchError::Socket {
            kind: io::ErrorKind::ConnectionReset,
            message: "other side closed".to_string(),
        }
    }

    /// The kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            DispatchError::InvalidArgument(_) | DispatchError::ContentLengthMismatch { .. } => {
                ErrorKind::InvalidArgument
            }
            DispatchError::ConnectTimeout => ErrorKind::ConnectTimeout,
            DispatchError::HeadersTimeout => ErrorKind::HeadersTimeout,
            DispatchError::BodyTimeout => ErrorKind::BodyTimeout,
            DispatchError::Socket { .. } => ErrorKind::Socket,
            DispatchError::RequestAborted => ErrorKind::RequestAborted,
            DispatchError::Informational(_) => ErrorKind::Informational,
            DispatchError::NotSupported(_) => ErrorKind::NotSupported,
            DispatchError::ClientDestroyed => ErrorKind::ClientDestroyed,
            DispatchError::ClientClosed => ErrorKind::ClientClosed,
            DispatchError::HttpParser(_) | DispatchError::HeadersOverflow(_) => ErrorKind::Parser,
            DispatchError::NoUpstream => ErrorKind::NoUpstream,
            DispatchError::Redirect { source, .. } => source.kind(),
        }
    }

    /// URLs visited before a failed redirect hop. Empty for other errors.
    pub fn redirects(&self) -> &[Url] {
        match self {
            DispatchError::Redirect { redirects, .. } => redirects,
            _ => &[],
        }
    }
}

impl From<io::Error> for DispatchError {
    fn from(err: io::Error) -> Self {
        DispatchError::socket(&err)
    }
}
