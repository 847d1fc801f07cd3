//! pipeliner command line client
//!
//! Sends one or more requests to a URL through the dispatch engine and
//! prints each response in dispatch order.
//!
//! ```text
//! pipeliner http://localhost:3000/items -n 10 --pipelining 4 --json
//! ```

use std::cell::{Cell, RefCell};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::rc::Rc;

use bytes::Bytes;
use clap::Parser;
use http::Method;
use serde::Serialize;
use tokio::sync::Notify;
use tokio::task::LocalSet;

use pipeliner::config::{load_config, validate_config, ClientConfig, ConfigError};
use pipeliner::dispatcher::{compose, Completion, Dispatcher, EventKind, Handler, Headers, Request};
use pipeliner::net::{install_timer_driver, TcpConnector};
use pipeliner::observability::{logging, metrics};
use pipeliner::resilience::{redirect, retry};
use pipeliner::routing::{Agent, AgentOptions};
use pipeliner::{DispatchError, Interceptor};

#[derive(Parser, Debug)]
#[command(name = "pipeliner", version, about = "Pipelining HTTP/1.1 client")]
struct Cli {
    /// Absolute http:// URL to request.
    url: String,

    /// Request method.
    #[arg(short = 'X', long, default_value = "GET")]
    method: String,

    /// Extra header as 'name: value'. Repeatable.
    #[arg(short = 'H', long = "header")]
    headers: Vec<String>,

    /// Request body.
    #[arg(short = 'd', long)]
    data: Option<String>,

    /// Number of times to send the request.
    #[arg(short = 'n', long, default_value_t = 1)]
    repeat: usize,

    /// TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long)]
    pipelining: Option<usize>,

    #[arg(long)]
    connections: Option<usize>,

    #[arg(long)]
    max_redirections: Option<u32>,

    #[arg(long)]
    max_retries: Option<u32>,

    /// Serve Prometheus metrics on this address while running.
    #[arg(long)]
    metrics_address: Option<SocketAddr>,

    /// Print responses as JSON.
    #[arg(long)]
    json: bool,
}

impl Cli {
    fn load_config(&self) -> Result<ClientConfig, ConfigError> {
        let mut config = match &self.config {
            Some(path) => load_config(path)?,
            None => ClientConfig::default(),
        };
        if let Some(pipelining) = self.pipelining {
            config.connection.pipelining = pipelining;
        }
        if self.connections.is_some() {
            config.pool.connections = self.connections;
        }
        if let Some(max) = self.max_redirections {
            config.redirect.max_redirections = max;
        }
        if let Some(max) = self.max_retries {
            config.retry.max_retries = max;
        }
        if let Some(addr) = self.metrics_address {
            config.observability.metrics_enabled = true;
            config.observability.metrics_address = addr.to_string();
        }
        validate_config(&config).map_err(ConfigError::Validation)?;
        Ok(config)
    }

    fn request(&self) -> Result<Request, Box<dyn std::error::Error>> {
        let method = Method::from_bytes(self.method.to_ascii_uppercase().as_bytes())?;
        let mut request = Request::from_url(method, &self.url)?;
        for header in &self.headers {
            let (name, value) = header
                .split_once(':')
                .ok_or_else(|| format!("header {header:?} is not 'name: value'"))?;
            request = request.header(name.trim(), value.trim());
        }
        if let Some(data) = &self.data {
            request = request.body(Bytes::from(data.clone()));
        }
        Ok(request)
    }
}

/// One finished exchange, as printed.
#[derive(Debug, Default, Serialize)]
struct Exchange {
    status: Option<u16>,
    headers: Vec<(String, String)>,
    body: String,
    redirects: Vec<String>,
    error: Option<String>,
}

struct PrintHandler {
    exchange: Rc<RefCell<Exchange>>,
    body: Vec<u8>,
    remaining: Rc<Cell<usize>>,
    done: Rc<Notify>,
}

impl PrintHandler {
    fn finish(&self) {
        self.remaining.set(self.remaining.get() - 1);
        self.done.notify_one();
    }
}

impl Handler for PrintHandler {
    fn on_headers(&mut self, status: u16, headers: Headers) {
        let mut exchange = self.exchange.borrow_mut();
        exchange.status = Some(status);
        exchange.headers = headers.into_iter().collect();
    }

    fn on_data(&mut self, chunk: Bytes) {
        self.body.extend_from_slice(&chunk);
    }

    fn on_complete(self: Box<Self>, completion: Completion) {
        {
            let mut exchange = self.exchange.borrow_mut();
            exchange.body = String::from_utf8_lossy(&self.body).into_owned();
            exchange.redirects = completion.redirects.iter().map(|u| u.to_string()).collect();
        }
        self.finish();
    }

    fn on_error(self: Box<Self>, error: DispatchError) {
        self.exchange.borrow_mut().error = Some(error.to_string());
        self.finish();
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    LocalSet::new().run_until(run(cli)).await
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let config = cli.load_config()?;
    logging::init(&config.observability.log_level);

    tracing::info!(
        url = %cli.url,
        repeat = cli.repeat,
        pipelining = config.connection.pipelining,
        connections = ?config.pool.connections,
        "pipeliner v0.1.0 starting"
    );

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let _timers = install_timer_driver();
    let agent = Agent::new(
        Rc::new(TcpConnector::new()),
        AgentOptions {
            pool: config.pool_options(),
        },
    );

    let drained = Rc::new(Notify::new());
    let on_drain = drained.clone();
    let _subscription = agent.subscribe(Box::new(move |event| {
        if event.kind == EventKind::Drain {
            on_drain.notify_one();
        }
    }));

    let mut interceptors: Vec<Interceptor> = Vec::new();
    if config.redirect.max_redirections > 0 {
        interceptors.push(redirect(config.redirect.to_options()));
    }
    if config.retry.enabled {
        interceptors.push(retry(config.retry.to_options()));
    }
    let client = compose(Rc::new(agent.clone()), interceptors);

    let remaining = Rc::new(Cell::new(cli.repeat));
    let done = Rc::new(Notify::new());
    let mut exchanges = Vec::with_capacity(cli.repeat);
    for _ in 0..cli.repeat {
        let exchange = Rc::new(RefCell::new(Exchange::default()));
        exchanges.push(exchange.clone());
        let handler = PrintHandler {
            exchange,
            body: Vec::new(),
            remaining: remaining.clone(),
            done: done.clone(),
        };
        if !client.dispatch(cli.request()?, Box::new(handler)) {
            tracing::debug!("client saturated; waiting for drain");
            drained.notified().await;
        }
    }
    while remaining.get() > 0 {
        done.notified().await;
    }

    let closed = Rc::new(Notify::new());
    let on_closed = closed.clone();
    agent.close(Some(Box::new(move || on_closed.notify_one())));
    closed.notified().await;

    let exchanges: Vec<Exchange> = exchanges
        .into_iter()
        .map(|e| std::mem::take(&mut *e.borrow_mut()))
        .collect();
    let failures = exchanges.iter().filter(|e| e.error.is_some()).count();
    print(&exchanges, cli.json)?;

    tracing::info!(requests = exchanges.len(), failures, "Shutdown complete");
    if failures > 0 {
        return Err(format!("{failures} of {} requests failed", exchanges.len()).into());
    }
    Ok(())
}

fn print(exchanges: &[Exchange], json: bool) -> Result<(), serde_json::Error> {
    if json {
        println!("{}", serde_json::to_string_pretty(exchanges)?);
        return Ok(());
    }
    for exchange in exchanges {
        match (&exchange.error, exchange.status) {
            (Some(error), _) => println!("error: {error}"),
            (None, Some(status)) => {
                for url in &exchange.redirects {
                    println!("redirected from {url}");
                }
                println!("HTTP {status}");
                for (name, value) in &exchange.headers {
                    println!("{name}: {value}");
                }
                println!();
                println!("{}", exchange.body);
            }
            (None, None) => println!("error: no response"),
        }
    }
    Ok(())
}
