//! Redirect and retry interceptors composed over an agent.

mod common;

use std::rc::Rc;
use std::time::Duration;

use common::*;
use pipeliner::routing::{Agent, AgentOptions};
use pipeliner::{
    compose, redirect, retry, DispatchError, Dispatcher, ErrorKind, Origin, RedirectOptions,
    Request, RetryOptions,
};

fn client(connector: &FakeConnector, max_redirections: u32) -> Rc<dyn Dispatcher> {
    let agent = Agent::new(Rc::new(connector.clone()), AgentOptions::default());
    compose(
        Rc::new(agent),
        vec![
            redirect(RedirectOptions { max_redirections }),
            retry(RetryOptions::default()),
        ],
    )
}

fn redirect_to(status: u16, location: &str) -> String {
    format!("HTTP/1.1 {status} Moved\r\nlocation: {location}\r\ncontent-length: 0\r\n\r\n")
}

#[test]
fn test_redirect_to_other_origin() {
    let connector = FakeConnector::new();
    let client = client(&connector, 5);
    let (handler, record) = Recorder::new();
    let request = Request::get("/start")
        .origin(Origin::parse("http://a.test").unwrap())
        .header("authorization", "secret");
    client.dispatch(request, handler);

    connector
        .socket(0)
        .respond(&redirect_to(302, "http://b.test/end"));
    let hop = connector.socket(1);
    assert_eq!(hop.origin, Origin::parse("http://b.test").unwrap());
    let written = hop.written();
    assert!(written.starts_with("GET /end HTTP/1.1\r\n"));
    assert!(written.contains("host: b.test\r\n"));
    assert!(!written.contains("authorization"));

    hop.respond(&ok("landed"));
    let record = record.borrow();
    assert_eq!(record.connected, 1);
    assert_eq!(record.status, Some(200));
    assert_eq!(record.body_text(), "landed");
    let redirects: Vec<String> = record
        .completion
        .as_ref()
        .unwrap()
        .redirects
        .iter()
        .map(|u| u.to_string())
        .collect();
    assert_eq!(redirects, vec!["http://a.test/start"]);
}

#[test]
fn test_redirect_chain_stops_at_budget() {
    let connector = FakeConnector::new();
    let client = client(&connector, 3);
    let (handler, record) = Recorder::new();
    client.dispatch(get("/0"), handler);

    let socket = connector.socket(0);
    for hop in 1..=4 {
        socket.respond(&redirect_to(307, &format!("/{hop}")));
    }
    assert_eq!(connector.connects(), 1);
    assert_eq!(socket.requests_written(), 4);

    let record = record.borrow();
    assert_eq!(record.status, Some(307));
    assert_eq!(record.completion.as_ref().unwrap().redirects.len(), 3);
    assert_eq!(record.terminals, 1);
}

#[test]
fn test_request_overrides_redirect_budget() {
    let connector = FakeConnector::new();
    let client = client(&connector, 5);
    let (handler, record) = Recorder::new();
    client.dispatch(get("/").max_redirections(0), handler);

    connector.socket(0).respond(&redirect_to(301, "/moved"));
    assert_eq!(record.borrow().status, Some(301));
    assert!(record.borrow().completion.as_ref().unwrap().redirects.is_empty());
    assert_eq!(connector.socket(0).requests_written(), 1);
}

#[test]
fn test_retry_after_server_error() {
    let connector = FakeConnector::new();
    let client = client(&connector, 5);
    let (handler, record) = Recorder::new();
    client.dispatch(get("/flaky"), handler);

    let socket = connector.socket(0);
    socket.respond("HTTP/1.1 503 Service Unavailable\r\ncontent-length: 4\r\n\r\nbusy");
    assert!(!record.borrow().is_done());
    assert_eq!(socket.requests_written(), 1);

    advance_timers(Duration::from_secs(1));
    assert_eq!(socket.requests_written(), 2);
    socket.respond(&ok("recovered"));

    let record = record.borrow();
    assert_eq!(record.connected, 1);
    assert_eq!(record.status, Some(200));
    assert_eq!(record.body_text(), "recovered");
    assert_eq!(connector.connects(), 1);
}

#[test]
fn test_retry_honors_retry_after_header() {
    let connector = FakeConnector::new();
    let client = client(&connector, 5);
    let (handler, record) = Recorder::new();
    client.dispatch(get("/limited"), handler);

    let socket = connector.socket(0);
    socket.respond("HTTP/1.1 429 Too Many Requests\r\nretry-after: 3\r\ncontent-length: 0\r\n\r\n");
    advance_timers(Duration::from_secs(2));
    assert_eq!(socket.requests_written(), 1);
    // Before the 4s keep-alive timeout would close the socket.
    advance_timers(Duration::from_millis(3600));
    assert_eq!(socket.requests_written(), 2);

    socket.respond(&ok("ok"));
    assert_eq!(record.borrow().status, Some(200));
}

#[test]
fn test_retry_after_refused_connect() {
    let connector = FakeConnector::new();
    connector.refuse_next(DispatchError::Socket {
        kind: std::io::ErrorKind::ConnectionRefused,
        message: "connection refused".into(),
    });
    let client = client(&connector, 5);
    let (handler, record) = Recorder::new();
    client.dispatch(get("/"), handler);
    assert_eq!(connector.connects(), 1);
    assert!(!record.borrow().is_done());

    advance_timers(Duration::from_secs(1));
    assert_eq!(connector.connects(), 2);
    connector.socket(1).respond(&ok("up"));
    assert_eq!(record.borrow().body_text(), "up");
}

#[test]
fn test_post_failure_is_not_retried() {
    let connector = FakeConnector::new();
    let client = client(&connector, 5);
    let (handler, record) = Recorder::new();
    client.dispatch(Request::post("/submit").origin(origin()).body("x"), handler);

    connector.socket(0).fail(DispatchError::socket_closed());
    assert_eq!(
        record.borrow().error.as_ref().map(|e| e.kind()),
        Some(ErrorKind::Socket)
    );
    advance_timers(Duration::from_secs(60));
    assert_eq!(connector.connects(), 1);
}

#[test]
fn test_retried_redirect_target() {
    let connector = FakeConnector::new();
    let client = client(&connector, 5);
    let (handler, record) = Recorder::new();
    client.dispatch(get("/old"), handler);

    let socket = connector.socket(0);
    socket.respond(&redirect_to(308, "/new"));
    socket.respond("HTTP/1.1 502 Bad Gateway\r\ncontent-length: 0\r\n\r\n");
    advance_timers(Duration::from_secs(1));
    assert_eq!(socket.written().matches("GET /new").count(), 2);

    socket.respond(&ok("moved"));
    let record = record.borrow();
    assert_eq!(record.body_text(), "moved");
    assert_eq!(record.completion.as_ref().unwrap().redirects.len(), 1);
}

#[test]
fn test_failed_hop_reports_visited_urls() {
    let connector = FakeConnector::new();
    let client = client(&connector, 5);
    let (handler, record) = Recorder::new();
    client.dispatch(Request::post("/submit").origin(origin()).body("x"), handler);

    let socket = connector.socket(0);
    socket.respond(&redirect_to(307, "/elsewhere"));
    assert!(socket.written().contains("POST /elsewhere HTTP/1.1"));
    socket.fail(DispatchError::socket_closed());

    let record = record.borrow();
    let error = record.error.as_ref().unwrap();
    assert_eq!(error.kind(), ErrorKind::Socket);
    let visited: Vec<String> = error.redirects().iter().map(|u| u.to_string()).collect();
    assert_eq!(visited, vec!["http://backend.test/submit"]);
    assert_eq!(record.terminals, 1);
}
