//! HTTP/2 session seam.
//!
//! Framing, HPACK and flow control belong to the session implementation.
//! The connection only opens streams, forwards socket bytes and maps
//! session events back to requests by stream id.

use bytes::Bytes;

use crate::dispatcher::request::{Headers, Origin, Request};
use crate::error::DispatchError;

pub type StreamId = u32;

/// Event decoded by a session from inbound bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Headers {
        stream: StreamId,
        status: u16,
        headers: Headers,
    },
    Data {
        stream: StreamId,
        chunk: Bytes,
    },
    Complete {
        stream: StreamId,
        trailers: Headers,
    },
    /// The peer reset one stream.
    Reset {
        stream: StreamId,
        error: DispatchError,
    },
    /// The peer is shutting the session down.
    GoAway {
        last_stream: StreamId,
        error: Option<DispatchError>,
    },
    /// Peer settings changed the concurrent stream limit.
    MaxConcurrentStreams(usize),
}

/// Sans-IO HTTP/2 client session. Bytes to write are appended to `out`.
pub trait H2Session {
    /// Connection preface and initial settings.
    fn start(&mut self, out: &mut Vec<Bytes>);

    /// Open a stream carrying the request head. The body follows through
    /// [`H2Session::send_data`] unless `end_stream` is set.
    fn open_stream(
        &mut self,
        request: &Request,
        origin: &Origin,
        end_stream: bool,
        out: &mut Vec<Bytes>,
    ) -> Result<StreamId, DispatchError>;

    fn send_data(
        &mut self,
        stream: StreamId,
        chunk: Bytes,
        end_stream: bool,
        out: &mut Vec<Bytes>,
    ) -> Result<(), DispatchError>;

    /// Cancel one stream.
    fn reset_stream(&mut self, stream: StreamId, out: &mut Vec<Bytes>);

    /// Consume inbound bytes.
    fn receive(
        &mut self,
        data: &[u8],
        events: &mut Vec<SessionEvent>,
        out: &mut Vec<Bytes>,
    ) -> Result<(), DispatchError>;
}

/// Creates a session for each socket that negotiated `h2`.
pub trait SessionFactory {
    fn create(&self, origin: &Origin) -> Box<dyn H2Session>;
}
