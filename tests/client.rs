use std::{
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use crossbeam_channel::unbounded;
use nbhttp::{
    client::{HttpService, HttpSession},
    error::Error,
    mock::{MockProvider, MockReceive},
    request::Request,
    service::ServiceConfig,
    session::SessionState,
};

const TIMEOUT: Duration = Duration::from_secs(5);

fn ok_provider() -> MockProvider {
    MockProvider::new().with_responder(|_, request| {
        let path = String::from_utf8_lossy(request)
            .split(' ')
            .nth(1)
            .unwrap_or("/")
            .to_owned();
        vec![MockReceive::bytes(format!(
            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n{path}",
            path.len()
        ))]
    })
}

fn wait_for_state(session: &HttpSession, state: SessionState) {
    let deadline = Instant::now() + TIMEOUT;
    while session.state().unwrap() != state {
        assert!(Instant::now() < deadline, "timed out waiting for {state:?}");
        thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn test_threaded_round_trip() {
    let service = HttpService::with_provider(ok_provider(), ServiceConfig::default()).unwrap();
    let session = service
        .session(Request::get("http://example.test/hello").unwrap())
        .unwrap();
    assert_eq!(session.state().unwrap(), SessionState::Inited);

    let (tx, rx) = unbounded();
    session
        .start(Box::new(move |result| {
            tx.send((thread::current().name().map(str::to_owned), result))
                .unwrap();
        }))
        .unwrap();

    let (thread_name, result) = rx.recv_timeout(TIMEOUT).unwrap();
    assert_eq!(result.unwrap().body(), b"/hello");
    assert_eq!(thread_name.as_deref(), Some("nbhttp-callback"));

    // closed by the callback thread after dispatch
    wait_for_state(&session, SessionState::Closed);
    assert!(session.snapshot().unwrap().is_none());
}

#[test]
fn test_start_twice_is_rejected() {
    let service = HttpService::with_provider(ok_provider(), ServiceConfig::default()).unwrap();
    let session = service
        .session(Request::get("http://example.test/").unwrap())
        .unwrap();
    let (tx, rx) = unbounded();
    session
        .start(Box::new(move |result| tx.send(result).unwrap()))
        .unwrap();
    assert!(matches!(
        session.start(Box::new(|_| {})),
        Err(Error::SessionAlreadyStarted)
    ));
    assert!(rx.recv_timeout(TIMEOUT).unwrap().is_ok());
}

#[test]
fn test_handler_may_start_new_session() {
    let service = Arc::new(
        HttpService::with_provider(ok_provider(), ServiceConfig::default()).unwrap(),
    );
    let (tx, rx) = unbounded();

    let first = service
        .session(Request::get("http://example.test/first").unwrap())
        .unwrap();
    let chained = Arc::clone(&service);
    first
        .start(Box::new(move |result| {
            assert!(result.is_ok());
            let second = chained
                .session(Request::get("http://example.test/second").unwrap())
                .unwrap();
            second
                .start(Box::new(move |result| {
                    tx.send(result).unwrap();
                }))
                .unwrap();
        }))
        .unwrap();

    let response = rx.recv_timeout(TIMEOUT).unwrap().unwrap();
    assert_eq!(response.body(), b"/second");
}

#[test]
fn test_close_pending_session() {
    let provider = MockProvider::new();
    let service = HttpService::with_provider(provider.clone(), ServiceConfig::default()).unwrap();
    let session = service
        .session(Request::get("http://example.test/").unwrap())
        .unwrap();
    let (tx, rx) = unbounded();
    session
        .start(Box::new(move |result| tx.send(result).unwrap()))
        .unwrap();
    wait_for_state(&session, SessionState::ResponseHeaderReceive);

    session.close().unwrap();
    assert!(matches!(
        rx.recv_timeout(TIMEOUT).unwrap(),
        Err(Error::AbnormalTermination)
    ));
    assert_eq!(session.state().unwrap(), SessionState::Closed);
    assert!(provider.opened()[0].close_requested());
}

#[test]
fn test_redirect_history_visible_from_handle() {
    let provider = MockProvider::new().with_responder(|_, request| {
        if request.starts_with(b"GET /old ") {
            vec![MockReceive::bytes(
                "HTTP/1.1 301 Moved\r\nLocation: /new\r\nContent-Length: 0\r\n\r\n",
            )]
        } else {
            vec![MockReceive::bytes("HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n")]
        }
    });
    let service = HttpService::with_provider(provider, ServiceConfig::default()).unwrap();
    let session = service
        .session(Request::get("http://example.test/old").unwrap())
        .unwrap();

    // the handler observes the history before the session is closed
    let (tx, rx) = unbounded();
    let (resume_tx, resume_rx) = unbounded::<()>();
    session
        .start(Box::new(move |result| {
            tx.send(result).unwrap();
            resume_rx.recv_timeout(TIMEOUT).ok();
        }))
        .unwrap();
    assert!(rx.recv_timeout(TIMEOUT).unwrap().is_ok());

    let snapshot = session.snapshot().unwrap().unwrap();
    assert_eq!(snapshot.state, SessionState::Completed);
    assert_eq!(snapshot.url.path(), "/new");
    assert_eq!(snapshot.redirects.len(), 1);
    assert_eq!(snapshot.redirects[0].request().url().path(), "/old");
    assert_eq!(session.redirects().unwrap().len(), 1);
    resume_tx.send(()).unwrap();
}

#[test]
fn test_drop_service_terminates_pending_sessions() {
    let provider = MockProvider::new().with_close_after(3);
    let service = HttpService::with_provider(provider.clone(), ServiceConfig::default()).unwrap();
    let (tx, rx) = unbounded();
    let mut sessions = Vec::new();
    for path in ["/1", "/2"] {
        let session = service
            .session(Request::get(&format!("http://example.test{path}")).unwrap())
            .unwrap();
        let tx = tx.clone();
        session
            .start(Box::new(move |result| tx.send(result).unwrap()))
            .unwrap();
        sessions.push(session);
    }
    wait_for_state(&sessions[0], SessionState::ResponseHeaderReceive);

    drop(service);
    for _ in 0..2 {
        assert!(matches!(
            rx.try_recv().unwrap(),
            Err(Error::AbnormalTermination)
        ));
    }
    assert!(provider.opened()[0].close_requested());
    assert!(matches!(sessions[0].state(), Err(Error::ServiceShutdown)));
    assert!(matches!(
        sessions[1].start(Box::new(|_| {})),
        Err(Error::ServiceShutdown)
    ));
}
