//! Tokio-backed plain TCP connector and timer driver.
//!
//! # Responsibilities
//! - Open TCP sockets and report them through `SocketEvents`
//! - Pump socket reads into the engine and engine writes onto the socket
//! - Advance the timer wheel from the tokio clock
//!
//! # Design Decisions
//! - Everything runs on a `LocalSet` (`spawn_local`); engine state is `!Send`
//! - Writes go through an unbounded channel so `Transport::write` never
//!   blocks the engine
//! - Reading stops as soon as the owner severs the link

use std::cell::Cell;
use std::rc::Rc;
use std::time::Instant;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;

use crate::dispatcher::request::Origin;
use crate::error::DispatchError;
use crate::net::transport::{Connector, SocketEvents, Transport};
use crate::resilience::timeouts::{self, TimerDriver};

const READ_BUFFER_SIZE: usize = 16 * 1024;

/// Connector for `http://` origins. Must be used from inside a `LocalSet`.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    nodelay: bool,
}

impl TcpConnector {
    pub fn new() -> Self {
        Self { nodelay: true }
    }

    pub fn nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl Connector for TcpConnector {
    fn connect(&self, origin: &Origin, events: SocketEvents) {
        if origin.scheme() != "http" {
            events.connect_failed(DispatchError::NotSupported(format!(
                "{} origins need a TLS connector",
                origin.scheme()
            )));
            return;
        }
        let authority = origin.authority();
        let nodelay = self.nodelay;
        tokio::task::spawn_local(async move {
            match TcpStream::connect(&authority).await {
                Ok(stream) => {
                    if let Err(e) = stream.set_nodelay(nodelay) {
                        tracing::debug!(error = %e, "failed to set TCP_NODELAY");
                    }
                    if events.is_severed() {
                        return;
                    }
                    let transport = TcpTransport::start(stream, events.clone());
                    events.connected(Box::new(transport));
                }
                Err(e) => {
                    tracing::debug!(authority = %authority, error = %e, "tcp connect failed");
                    events.connect_failed(DispatchError::socket(&e));
                }
            }
        });
    }
}

/// A connected TCP socket driven by two local tasks.
pub struct TcpTransport {
    tx: Option<mpsc::UnboundedSender<Bytes>>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl TcpTransport {
    fn start(stream: TcpStream, events: SocketEvents) -> Self {
        let (mut read_half, mut write_half) = stream.into_split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();

        let writer_events = events.clone();
        let writer = tokio::task::spawn_local(async move {
            while let Some(bytes) = rx.recv().await {
                if let Err(e) = write_half.write_all(&bytes).await {
                    writer_events.closed(Some(DispatchError::socket(&e)));
                    return;
                }
            }
            let _ = write_half.shutdown().await;
        });

        let reader = tokio::task::spawn_local(async move {
            let mut buf = vec![0u8; READ_BUFFER_SIZE];
            loop {
                if events.is_severed() {
                    return;
                }
                match read_half.read(&mut buf).await {
                    Ok(0) => {
                        events.closed(None);
                        return;
                    }
                    Ok(n) => events.data(&buf[..n]),
                    Err(e) => {
                        events.closed(Some(DispatchError::socket(&e)));
                        return;
                    }
                }
            }
        });

        Self {
            tx: Some(tx),
            reader,
            writer,
        }
    }
}

impl Transport for TcpTransport {
    fn write(&mut self, data: Bytes) -> Result<(), DispatchError> {
        match &self.tx {
            Some(tx) => tx.send(data).map_err(|_| DispatchError::socket_closed()),
            None => Err(DispatchError::socket_closed()),
        }
    }

    fn destroy(&mut self) {
        self.tx = None;
        self.reader.abort();
        self.writer.abort();
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.destroy();
    }
}

struct TokioTimerDriver {
    notify: Rc<Notify>,
}

impl TimerDriver for TokioTimerDriver {
    fn wake(&self) {
        self.notify.notify_one();
    }
}

/// Drive the thread's timer wheel from the tokio clock.
///
/// Must be called from inside a `LocalSet`. Dropping the returned handle
/// stops the driver.
pub fn install_timer_driver() -> TimerDriverHandle {
    let notify = Rc::new(Notify::new());
    let running = Rc::new(Cell::new(true));
    timeouts::install_driver(Rc::new(TokioTimerDriver {
        notify: notify.clone(),
    }));

    let alive = running.clone();
    let task = tokio::task::spawn_local(async move {
        while alive.get() {
            match timeouts::next_wakeup() {
                Some(at) => {
                    tokio::select! {
                        _ = tokio::time::sleep_until(tokio::time::Instant::from_std(at)) => {
                            timeouts::advance(Instant::now());
                        }
                        _ = notify.notified() => {}
                    }
                }
                None => notify.notified().await,
            }
        }
    });
    TimerDriverHandle { running, task }
}

/// Keeps the timer driver task alive.
pub struct TimerDriverHandle {
    running: Rc<Cell<bool>>,
    task: JoinHandle<()>,
}

impl Drop for TimerDriverHandle {
    fn drop(&mut self) {
        self.running.set(false);
        self.task.abort();
    }
}
