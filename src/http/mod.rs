//! Wire protocol layer.
//!
//! # Data Flow
//! ```text
//! Connection writes a request
//!     → h1.rs encode_head() + body framing
//!     → ResponseParser::expect() (one expectation per written request)
//! Socket bytes arrive
//!     → ResponseParser::feed() → ParserEvent (in response order)
//!     → Connection maps each event to the oldest in-flight request
//!
//! HTTP/2 sockets use h2.rs instead: an H2Session maps frames to streams.
//! ```
//!
//! # Design Decisions
//! - Parsers are sans-IO: bytes in, events out
//! - Parse errors are returned after the events decoded before them

pub mod h1;
pub mod h2;

use bytes::Bytes;

use crate::dispatcher::request::Headers;
use crate::error::DispatchError;

/// What the parser should expect from the response to a written request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Expectation {
    /// The request was HEAD: the response has no body.
    pub head: bool,
    /// The request asked for a protocol upgrade.
    pub upgrade: bool,
    /// The request was CONNECT: a 2xx response hands over the socket.
    pub connect: bool,
}

/// A decoded response event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParserEvent {
    /// Final response head. Interim 1xx responses are not reported.
    Headers {
        status: u16,
        headers: Headers,
        /// HTTP minor version (`0` or `1`).
        version: u8,
        /// Whether the socket may carry another response afterwards.
        keep_alive: bool,
    },
    Body(Bytes),
    Complete {
        trailers: Headers,
    },
    /// The server switched protocols. `rest` holds bytes received after the
    /// head; the parser accepts no further input.
    Upgrade {
        status: u16,
        headers: Headers,
        rest: Bytes,
    },
}

/// Incremental HTTP/1.x response parser.
pub trait ResponseParser {
    /// Register the next written request, in write order.
    fn expect(&mut self, expectation: Expectation);

    /// Consume inbound bytes.
    fn feed(&mut self, data: &[u8], events: &mut Vec<ParserEvent>) -> Result<(), DispatchError>;

    /// The peer closed the socket. Completes a close-delimited body.
    fn finish(&mut self, events: &mut Vec<ParserEvent>) -> Result<(), DispatchError>;
}
