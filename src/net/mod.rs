//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! dispatch()
//!     → connection.rs (queue, pipelining, timeouts, recovery)
//!     → transport.rs Connector::connect(origin, SocketEvents)
//!     → tcp.rs (tokio socket tasks) or a test double
//!
//! Connection States:
//!     Disconnected → Connecting → Connected → Draining → Closed
//!     (Destroyed from any state)
//! ```
//!
//! # Design Decisions
//! - The connection never touches a runtime; sockets and timers are
//!   reached through traits
//! - TLS is left to custom connectors implementing `Connector`

pub mod connection;
pub mod tcp;
pub mod transport;

pub use connection::{Connection, ConnectionOptions, ConnectionState, ConnectionStats};
pub use tcp::{install_timer_driver, TcpConnector, TcpTransport, TimerDriverHandle};
pub use transport::{Connector, SocketEvents, Transport};
