use std::{
    io::ErrorKind,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use crossbeam_channel::{unbounded, Receiver};
use nbhttp::{
    connection::ConnectionState,
    error::Error,
    header::Form,
    mock::{MockProvider, MockReceive},
    request::{Endpoint, Request},
    response::Response,
    service::{Service, ServiceConfig},
    session::{SessionId, SessionState},
    TransportProvider,
};
use tracing_test::traced_test;

fn response(status: u16, body: &str) -> Vec<u8> {
    format!(
        "HTTP/1.1 {status} Status\r\nContent-Length: {}\r\n\r\n{body}",
        body.len()
    )
    .into_bytes()
}

fn redirect(status: u16, location: &str) -> Vec<u8> {
    format!("HTTP/1.1 {status} Moved\r\nLocation: {location}\r\nContent-Length: 0\r\n\r\n")
        .into_bytes()
}

fn start<P: TransportProvider>(
    service: &mut Service<P>,
    request: Request,
) -> (SessionId, Receiver<Result<Response, Error>>) {
    let (tx, rx) = unbounded();
    let id = service.create_session(request);
    service
        .start_session(
            id,
            Box::new(move |result| {
                tx.send(result).unwrap();
            }),
        )
        .unwrap();
    (id, rx)
}

fn pump<P: TransportProvider>(service: &mut Service<P>, iterations: usize) {
    for _ in 0..iterations {
        service.drive();
        for completion in service.take_completions() {
            completion.dispatch();
        }
    }
}

struct Published {
    method: String,
    path: String,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}
impl Published {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(x, _)| x == name)
            .map(|(_, v)| v.as_str())
    }
}

fn parse_published(bytes: &[u8]) -> Published {
    let mut headers = [httparse::EMPTY_HEADER; 32];
    let mut request = httparse::Request::new(&mut headers);
    let header_len = match request.parse(bytes).unwrap() {
        httparse::Status::Complete(x) => x,
        httparse::Status::Partial => panic!("partial request"),
    };
    assert_eq!(request.version, Some(1));
    Published {
        method: request.method.unwrap().to_owned(),
        path: request.path.unwrap().to_owned(),
        headers: request
            .headers
            .iter()
            .map(|x| {
                (
                    x.name.to_owned(),
                    String::from_utf8(x.value.to_vec()).unwrap(),
                )
            })
            .collect(),
        body: bytes[header_len..].to_vec(),
    }
}

#[test]
#[traced_test]
fn test_round_trip() {
    let provider = MockProvider::new().with_responder(|_, _| vec![MockReceive::bytes(response(200, "hello"))]);
    let mut service = Service::new(provider.clone(), ServiceConfig::default());
    let (id, rx) = start(
        &mut service,
        Request::get("http://example.test/index?x=1").unwrap(),
    );
    pump(&mut service, 10);

    let response = rx.try_recv().unwrap().unwrap();
    assert_eq!(response.status_code(), 200);
    assert_eq!(response.status_message(), "Status");
    assert_eq!(response.body(), b"hello");
    assert!(rx.try_recv().is_err());
    assert_eq!(service.session(id).unwrap().state(), SessionState::Completed);

    let published = parse_published(&provider.opened()[0].published());
    assert_eq!(published.method, "GET");
    assert_eq!(published.path, "/index?x=1");
    assert_eq!(published.header("Host"), Some("example.test"));
    assert_eq!(published.header("Connection"), Some("keep-alive"));
    assert_eq!(published.header("User-Agent"), Some("nbhttp"));
    assert!(published.body.is_empty());

    // the connection goes back to the pool
    service.close_session(id);
    assert_eq!(service.session_count(), 0);
    assert_eq!(service.connection_count(), 1);
    assert!(service.connections().all(|x| x.is_idle()));
}

#[test]
fn test_post_body_fragmented_by_transport_and_chunk_size() {
    let provider = MockProvider::new()
        .with_publish_limit(3)
        .with_responder(|_, _| vec![MockReceive::bytes(response(201, ""))]);
    let config = ServiceConfig::default().with_max_chunk_size(4);
    let mut service = Service::new(provider.clone(), config);

    let mut form = Form::new();
    form.set("name", "a b");
    form.set("flag", "1");
    let mut request = Request::post("http://example.test/submit").unwrap();
    request.set_form(&form);
    let expected = request.body().unwrap().to_vec();
    let (id, rx) = start(&mut service, request);
    pump(&mut service, 200);

    assert_eq!(rx.try_recv().unwrap().unwrap().status_code(), 201);
    assert_eq!(service.session(id).unwrap().sent_body_size(), expected.len());

    let published = parse_published(&provider.opened()[0].published());
    assert_eq!(published.method, "POST");
    assert_eq!(
        published.header("Content-Type"),
        Some("application/x-www-form-urlencoded")
    );
    assert_eq!(
        published.header("Content-Length"),
        Some(expected.len().to_string().as_str())
    );
    assert_eq!(published.body, expected);
}

#[test]
fn test_response_split_across_receives() {
    let provider = MockProvider::new();
    let mut service = Service::new(provider.clone(), ServiceConfig::default());
    let (_, rx) = start(&mut service, Request::get("http://example.test/").unwrap());
    pump(&mut service, 5);

    let handle = &provider.opened()[0];
    // separator split between receives, body split across three more
    for chunk in [
        "HTTP/1.1 200 OK\r\nContent-",
        "Length: 10\r\n\r",
        "\n0123",
        "456",
        "789",
    ] {
        handle.push_receive(chunk);
    }
    pump(&mut service, 20);

    let response = rx.try_recv().unwrap().unwrap();
    assert_eq!(response.header().content_length(), Some(10));
    assert_eq!(response.body(), b"0123456789");
}

#[test]
fn test_header_and_body_in_one_receive_with_empty_body() {
    let provider = MockProvider::new().with_responder(|_, _| {
        vec![MockReceive::bytes(
            "HTTP/1.1 204 No Content\r\nX-Trace: abc\r\n\r\n",
        )]
    });
    let mut service = Service::new(provider, ServiceConfig::default());
    let (_, rx) = start(&mut service, Request::get("http://example.test/").unwrap());
    pump(&mut service, 10);

    let response = rx.try_recv().unwrap().unwrap();
    assert_eq!(response.status_code(), 204);
    assert_eq!(response.header().get("X-Trace"), Some("abc"));
    assert!(response.body().is_empty());
}

#[test]
fn test_header_too_large() {
    let provider = MockProvider::new()
        .with_responder(|_, _| vec![MockReceive::bytes(vec![b'a'; 64])]);
    let config = ServiceConfig::default().with_max_header_size(32);
    let mut service = Service::new(provider, config);
    let (id, rx) = start(&mut service, Request::get("http://example.test/").unwrap());
    pump(&mut service, 10);

    assert!(matches!(rx.try_recv().unwrap(), Err(Error::HeaderTooLarge)));
    assert_eq!(service.session(id).unwrap().state(), SessionState::Failed);
    pump(&mut service, 5);
    assert_eq!(service.connection_count(), 0);
}

#[test]
fn test_header_too_large_at_default_cap() {
    let provider = MockProvider::new().with_responder(|_, _| {
        vec![
            MockReceive::Bytes(vec![b'a'; 600_000]),
            MockReceive::Bytes(vec![b'a'; 400_001]),
        ]
    });
    let mut service = Service::new(provider, ServiceConfig::default());
    let (_, rx) = start(&mut service, Request::get("http://example.test/").unwrap());
    // each receive is bounded by the chunk size, so the cap is hit after ten of them
    pump(&mut service, 30);

    assert!(matches!(rx.try_recv().unwrap(), Err(Error::HeaderTooLarge)));
}

#[test]
fn test_stream_ends_before_header() {
    let provider = MockProvider::new().with_responder(|_, _| {
        vec![MockReceive::bytes("HTTP/1.1 200 OK\r\n"), MockReceive::End]
    });
    let mut service = Service::new(provider, ServiceConfig::default());
    let (_, rx) = start(&mut service, Request::get("http://example.test/").unwrap());
    pump(&mut service, 10);

    assert!(matches!(rx.try_recv().unwrap(), Err(Error::NoResponseHeader)));
}

#[test]
fn test_stream_ends_mid_body() {
    let provider = MockProvider::new().with_responder(|_, _| {
        vec![
            MockReceive::bytes("HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\n0123"),
            MockReceive::End,
        ]
    });
    let mut service = Service::new(provider, ServiceConfig::default());
    let (_, rx) = start(&mut service, Request::get("http://example.test/").unwrap());
    pump(&mut service, 10);

    assert!(matches!(rx.try_recv().unwrap(), Err(Error::ConnectionClosed)));
}

#[test]
fn test_missing_content_length() {
    let provider = MockProvider::new().with_responder(|_, _| {
        vec![MockReceive::bytes("HTTP/1.1 200 OK\r\nServer: x\r\n\r\nbody")]
    });
    let mut service = Service::new(provider, ServiceConfig::default());
    let (_, rx) = start(&mut service, Request::get("http://example.test/").unwrap());
    pump(&mut service, 10);

    assert!(matches!(
        rx.try_recv().unwrap(),
        Err(Error::ResponseHasNoContentLength)
    ));
}

#[test]
fn test_status_code_failure_carries_response() {
    let provider = MockProvider::new()
        .with_responder(|_, _| vec![MockReceive::bytes(response(404, "missing"))]);
    let mut service = Service::new(provider, ServiceConfig::default());
    let (id, rx) = start(&mut service, Request::get("http://example.test/").unwrap());
    pump(&mut service, 10);

    let err = rx.try_recv().unwrap().unwrap_err();
    let response = err.response().unwrap();
    assert_eq!(response.status_code(), 404);
    assert_eq!(response.status_message(), "Status");
    assert_eq!(response.body(), b"missing");
    assert_eq!(service.session(id).unwrap().state(), SessionState::Failed);
    // a complete exchange keeps the connection reusable
    assert!(service.connections().all(|x| x.is_idle()));
}

fn redirect_chain(hops: usize) -> MockProvider {
    MockProvider::new().with_responder(move |_, request| {
        let text = String::from_utf8_lossy(request).into_owned();
        let path = text.split(' ').nth(1).unwrap_or("/").to_owned();
        let hop: usize = path.trim_start_matches("/hop/").parse().unwrap_or(0);
        if hop < hops {
            vec![MockReceive::bytes(redirect(302, &format!("/hop/{}", hop + 1)))]
        } else {
            vec![MockReceive::bytes(response(200, &path))]
        }
    })
}

#[test]
fn test_redirects_up_to_limit() {
    for hops in [0, 1, 5, 16] {
        let provider = redirect_chain(hops);
        let mut service = Service::new(provider.clone(), ServiceConfig::default());
        let (id, rx) = start(&mut service, Request::get("http://example.test/hop/0").unwrap());
        pump(&mut service, 20 + hops * 10);

        let response = rx.try_recv().unwrap().unwrap();
        assert_eq!(response.body(), format!("/hop/{hops}").as_bytes());

        let session = service.session(id).unwrap();
        assert_eq!(session.redirects().len(), hops);
        for (index, entry) in session.redirects().iter().enumerate() {
            assert_eq!(entry.request().url().path(), format!("/hop/{index}"));
            assert_eq!(entry.response().status_code(), 302);
        }
        assert_eq!(session.current_request().url().path(), format!("/hop/{hops}"));
        // every hop reused the same keep-alive connection
        assert_eq!(provider.open_count(), 1);
    }
}

#[test]
fn test_too_many_redirects() {
    let provider = redirect_chain(17);
    let mut service = Service::new(provider, ServiceConfig::default());
    let (id, rx) = start(&mut service, Request::get("http://example.test/hop/0").unwrap());
    pump(&mut service, 300);

    assert!(matches!(rx.try_recv().unwrap(), Err(Error::TooManyRedirects)));
    assert_eq!(service.session(id).unwrap().redirects().len(), 16);
}

#[test]
fn test_redirect_to_other_endpoint() {
    let provider = MockProvider::new().with_responder(|endpoint, _| {
        if endpoint.host == "first.test" {
            vec![MockReceive::bytes(redirect(
                301,
                "http://second.test:8080/landing",
            ))]
        } else {
            vec![MockReceive::bytes(response(200, "landed"))]
        }
    });
    let mut service = Service::new(provider.clone(), ServiceConfig::default());
    let (id, rx) = start(&mut service, Request::get("http://first.test/").unwrap());
    pump(&mut service, 20);

    assert_eq!(rx.try_recv().unwrap().unwrap().body(), b"landed");
    let opened: Vec<Endpoint> = provider.opened().iter().map(|x| x.endpoint()).collect();
    assert_eq!(opened.len(), 2);
    assert_eq!(opened[1].host, "second.test");
    assert_eq!(opened[1].port, 8080);

    let published = parse_published(&provider.opened()[1].published());
    assert_eq!(published.path, "/landing");
    assert_eq!(published.header("Host"), Some("second.test:8080"));
    assert_eq!(
        service.session(id).unwrap().current_request().host(),
        "second.test"
    );
}

#[test]
fn test_redirect_303_drops_post_body() {
    let provider = MockProvider::new().with_responder(|_, request| {
        if request.starts_with(b"POST") {
            vec![MockReceive::bytes(redirect(303, "/done"))]
        } else {
            vec![MockReceive::bytes(response(200, "ok"))]
        }
    });
    let mut service = Service::new(provider.clone(), ServiceConfig::default());
    let request = Request::post("http://example.test/form")
        .unwrap()
        .with_post_body("text/plain", "payload");
    let (_, rx) = start(&mut service, request);
    pump(&mut service, 20);

    assert!(rx.try_recv().unwrap().is_ok());
    let published = provider.opened()[0].published();
    let second = &published[published
        .windows(4)
        .position(|x| x == b"GET ")
        .unwrap()..];
    let second = parse_published(second);
    assert_eq!(second.path, "/done");
    assert_eq!(second.header("Content-Length"), None);
    assert!(second.body.is_empty());
}

#[test]
fn test_sessions_wait_for_connecting_connection() {
    let provider = MockProvider::new()
        .with_establish_after(3)
        .with_responder(|_, _| vec![MockReceive::bytes(response(200, "x"))]);
    let mut service = Service::new(provider.clone(), ServiceConfig::default());
    let (_, first) = start(&mut service, Request::get("http://example.test/1").unwrap());
    let (_, second) = start(&mut service, Request::get("http://example.test/2").unwrap());
    assert_eq!(provider.open_count(), 1);

    pump(&mut service, 30);
    assert!(first.try_recv().unwrap().is_ok());
    assert!(second.try_recv().unwrap().is_ok());
    // both ran one after the other on the single connection
    assert_eq!(provider.open_count(), 1);
}

#[test]
fn test_connection_serves_one_session_at_a_time() {
    let provider = MockProvider::new();
    let mut service = Service::new(provider.clone(), ServiceConfig::default());
    let (first, first_rx) = start(&mut service, Request::get("http://example.test/1").unwrap());
    let (second, second_rx) = start(&mut service, Request::get("http://example.test/2").unwrap());
    pump(&mut service, 5);

    let handle = provider.opened()[0].clone();
    assert_eq!(service.session(first).unwrap().state(), SessionState::ResponseHeaderReceive);
    assert_eq!(service.session(second).unwrap().state(), SessionState::Connecting);
    let published = handle.take_published();
    assert_eq!(parse_published(&published).path, "/1");

    handle.push_receive(response(200, "one"));
    pump(&mut service, 5);
    assert_eq!(first_rx.try_recv().unwrap().unwrap().body(), b"one");
    assert_eq!(parse_published(&handle.take_published()).path, "/2");

    handle.push_receive(response(200, "two"));
    pump(&mut service, 5);
    assert_eq!(second_rx.try_recv().unwrap().unwrap().body(), b"two");
}

#[test]
fn test_keep_alive_reuse_across_sessions() {
    let provider = MockProvider::new()
        .with_responder(|_, _| vec![MockReceive::bytes(response(200, "again"))]);
    let mut service = Service::new(provider.clone(), ServiceConfig::default());
    for _ in 0..3 {
        let (id, rx) = start(&mut service, Request::get("http://example.test/").unwrap());
        pump(&mut service, 10);
        assert!(rx.try_recv().unwrap().is_ok());
        service.close_session(id);
    }
    assert_eq!(provider.open_count(), 1);
}

#[test]
#[traced_test]
fn test_close_mid_body_is_abnormal() {
    let provider = MockProvider::new().with_responder(|_, _| {
        vec![MockReceive::bytes(
            "HTTP/1.1 200 OK\r\nContent-Length: 100\r\n\r\npartial",
        )]
    });
    let mut service = Service::new(provider.clone(), ServiceConfig::default());
    let (id, rx) = start(&mut service, Request::get("http://example.test/").unwrap());
    pump(&mut service, 10);
    assert_eq!(
        service.session(id).unwrap().state(),
        SessionState::ResponseBodyReceive
    );

    service.close_session(id);
    pump(&mut service, 5);
    assert!(matches!(
        rx.try_recv().unwrap(),
        Err(Error::AbnormalTermination)
    ));
    assert!(rx.try_recv().is_err());
    // the connection could not be reused mid-body
    assert!(provider.opened()[0].close_requested());
    assert_eq!(service.connection_count(), 0);
}

#[test]
fn test_close_unstarted_session_dispatches_nothing() {
    let mut service = Service::new(MockProvider::new(), ServiceConfig::default());
    let id = service.create_session(Request::get("http://example.test/").unwrap());
    service.close_session(id);
    assert!(!service.has_completions());
    assert!(matches!(
        service.start_session(id, Box::new(|_| {})),
        Err(Error::SessionAlreadyStarted)
    ));
}

#[test]
fn test_start_twice() {
    let mut service = Service::new(MockProvider::new(), ServiceConfig::default());
    let (id, _rx) = start(&mut service, Request::get("http://example.test/").unwrap());
    assert!(matches!(
        service.start_session(id, Box::new(|_| {})),
        Err(Error::SessionAlreadyStarted)
    ));
}

#[test]
fn test_non_post_request_with_body_sends_nothing() {
    let provider = MockProvider::new();
    let mut service = Service::new(provider.clone(), ServiceConfig::default());
    let mut request = Request::get("http://example.test/").unwrap();
    request.set_post_body("text/plain", "body");
    let (_, rx) = start(&mut service, request);
    pump(&mut service, 10);

    assert!(matches!(
        rx.try_recv().unwrap(),
        Err(Error::NonPostRequestHasBody)
    ));
    assert!(provider.opened()[0].published().is_empty());
    assert!(provider.opened()[0].close_requested());
    assert_eq!(service.connection_count(), 0);
}

#[test]
fn test_open_failure_fails_waiting_sessions() {
    let provider = MockProvider::new();
    provider.fail_next_open(ErrorKind::ConnectionRefused);
    let mut service = Service::new(provider.clone(), ServiceConfig::default());
    let (_, rx) = start(&mut service, Request::get("http://example.test/").unwrap());
    pump(&mut service, 1);

    match rx.try_recv().unwrap() {
        Err(Error::Transport(err)) => assert_eq!(err.kind(), ErrorKind::ConnectionRefused),
        x => panic!("unexpected {x:?}"),
    }
    assert_eq!(service.connection_count(), 0);
}

#[test]
fn test_connect_failure_fans_out() {
    let provider = MockProvider::new().with_establish_after(2);
    let mut service = Service::new(provider.clone(), ServiceConfig::default());
    let (_, first) = start(&mut service, Request::get("http://example.test/1").unwrap());
    let (_, second) = start(&mut service, Request::get("http://example.test/2").unwrap());
    provider.opened()[0].fail_connect(ErrorKind::TimedOut);
    pump(&mut service, 5);

    for rx in [first, second] {
        match rx.try_recv().unwrap() {
            Err(Error::Transport(err)) => assert_eq!(err.kind(), ErrorKind::TimedOut),
            x => panic!("unexpected {x:?}"),
        }
    }
    assert_eq!(service.connection_count(), 0);
}

#[test]
fn test_transport_error_fails_only_attached_session() {
    let provider = MockProvider::new();
    let mut service = Service::new(provider.clone(), ServiceConfig::default());
    let (_, first) = start(&mut service, Request::get("http://a.test/").unwrap());
    let (_, second) = start(&mut service, Request::get("http://b.test/").unwrap());
    pump(&mut service, 5);

    let handles = provider.opened();
    handles[0].push_error(ErrorKind::ConnectionReset);
    handles[1].push_receive(response(200, "b"));
    pump(&mut service, 5);

    assert!(matches!(first.try_recv().unwrap(), Err(Error::Transport(_))));
    assert_eq!(second.try_recv().unwrap().unwrap().body(), b"b");
}

#[test]
fn test_unsolicited_bytes_close_idle_connection() {
    let provider = MockProvider::new()
        .with_responder(|_, _| vec![MockReceive::bytes(response(200, "x"))]);
    let mut service = Service::new(provider.clone(), ServiceConfig::default());
    let (_, rx) = start(&mut service, Request::get("http://example.test/").unwrap());
    pump(&mut service, 10);
    assert!(rx.try_recv().unwrap().is_ok());
    assert_eq!(service.connection_count(), 1);

    provider.opened()[0].push_receive("garbage");
    pump(&mut service, 5);
    assert_eq!(service.connection_count(), 0);
}

#[test]
fn test_server_close_reclaims_idle_connection() {
    let provider = MockProvider::new()
        .with_close_after(2)
        .with_responder(|_, _| vec![MockReceive::bytes(response(200, "x"))]);
    let mut service = Service::new(provider.clone(), ServiceConfig::default());
    let (_, rx) = start(&mut service, Request::get("http://example.test/").unwrap());
    pump(&mut service, 10);
    assert!(rx.try_recv().unwrap().is_ok());

    provider.opened()[0].push_end();
    pump(&mut service, 2);
    let closing: Vec<ConnectionState> = service.connections().map(|x| x.state()).collect();
    assert_eq!(closing, vec![ConnectionState::Closing]);
    pump(&mut service, 5);
    assert_eq!(service.connection_count(), 0);

    // a new session opens a fresh connection
    let (_, rx) = start(&mut service, Request::get("http://example.test/").unwrap());
    pump(&mut service, 10);
    assert!(rx.try_recv().unwrap().is_ok());
    assert_eq!(provider.open_count(), 2);
}

#[test]
fn test_close_waiting_session_closes_unneeded_connection() {
    let provider = MockProvider::new().with_establish_after(10);
    let mut service = Service::new(provider.clone(), ServiceConfig::default());
    let (id, rx) = start(&mut service, Request::get("http://example.test/").unwrap());
    pump(&mut service, 2);
    assert_eq!(
        service.connections().next().unwrap().state(),
        ConnectionState::Connecting
    );

    service.close_session(id);
    pump(&mut service, 2);
    assert!(matches!(
        rx.try_recv().unwrap(),
        Err(Error::AbnormalTermination)
    ));
    assert!(provider.opened()[0].close_requested());
    assert_eq!(service.connection_count(), 0);
}

#[test]
fn test_close_all_terminates_everything_once() {
    let provider = MockProvider::new().with_close_after(1);
    let mut service = Service::new(provider.clone(), ServiceConfig::default());
    let fired = Arc::new(AtomicUsize::new(0));
    for path in ["/1", "/2", "/3"] {
        let id = service.create_session(Request::get(&format!("http://example.test{path}")).unwrap());
        let fired = Arc::clone(&fired);
        service
            .start_session(
                id,
                Box::new(move |result| {
                    assert!(matches!(result, Err(Error::AbnormalTermination)));
                    fired.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();
    }
    pump(&mut service, 3);

    service.close_all();
    assert_eq!(service.session_count(), 0);
    pump(&mut service, 10);
    assert_eq!(fired.load(Ordering::SeqCst), 3);
    assert_eq!(service.connection_count(), 0);
}

#[test]
fn test_body_larger_than_chunk_size() {
    let body = "x".repeat(1000);
    let reply = response(200, &body);
    let provider = MockProvider::new().with_responder(move |_, _| {
        reply.chunks(7).map(MockReceive::bytes).collect()
    });
    let config = ServiceConfig::default().with_max_chunk_size(8);
    let mut service = Service::new(provider, config);
    let (_, rx) = start(&mut service, Request::get("http://example.test/").unwrap());
    pump(&mut service, 400);

    assert_eq!(rx.try_recv().unwrap().unwrap().body(), body.as_bytes());
}

#[test]
fn test_bytes_past_response_are_not_handed_to_next_session() {
    let provider = MockProvider::new();
    let mut service = Service::new(provider.clone(), ServiceConfig::default());
    let (_, first) = start(&mut service, Request::get("http://example.test/1").unwrap());
    let (second_id, second) = start(&mut service, Request::get("http://example.test/2").unwrap());
    pump(&mut service, 5);

    // the second response arrives before the second request was sent
    let stale = provider.opened()[0].clone();
    stale.push_receive(
        "HTTP/1.1 200 OK\r\nContent-Length: 3\r\n\r\noneHTTP/1.1 200 OK\r\nContent-Length: 4\r\n\r\nevil",
    );
    pump(&mut service, 10);

    assert_eq!(first.try_recv().unwrap().unwrap().body(), b"one");
    assert!(second.try_recv().is_err());
    assert!(stale.close_requested());
    assert_eq!(parse_published(&stale.published()).path, "/1");
    assert!(!String::from_utf8_lossy(&stale.published()).contains("GET /2 "));

    // the waiting session moves to a fresh connection
    assert_eq!(provider.open_count(), 2);
    let fresh = provider.opened()[1].clone();
    assert_eq!(parse_published(&fresh.published()).path, "/2");
    assert_eq!(
        service.session(second_id).unwrap().state(),
        SessionState::ResponseHeaderReceive
    );
    fresh.push_receive(response(200, "two"));
    pump(&mut service, 5);
    assert_eq!(second.try_recv().unwrap().unwrap().body(), b"two");
}

#[test]
fn test_publish_failure_during_header() {
    let provider = MockProvider::new();
    let mut service = Service::new(provider.clone(), ServiceConfig::default());
    let (id, rx) = start(&mut service, Request::get("http://example.test/").unwrap());
    let handle = provider.opened()[0].clone();
    handle.fail_publish(ErrorKind::BrokenPipe);
    pump(&mut service, 10);

    match rx.try_recv().unwrap() {
        Err(Error::Transport(err)) => assert_eq!(err.kind(), ErrorKind::BrokenPipe),
        x => panic!("unexpected {x:?}"),
    }
    assert!(rx.try_recv().is_err());
    assert!(handle.published().is_empty());
    assert_eq!(service.session(id).unwrap().state(), SessionState::Failed);
    assert!(handle.close_requested());
    assert_eq!(service.connection_count(), 0);
}

#[test]
fn test_publish_failure_during_body() {
    let provider = MockProvider::new().with_publish_limit(4);
    let config = ServiceConfig::default().with_max_chunk_size(16);
    let mut service = Service::new(provider.clone(), config);
    let request = Request::post("http://example.test/upload")
        .unwrap()
        .with_post_body("application/octet-stream", vec![7u8; 64]);
    let (id, rx) = start(&mut service, request);
    let handle = provider.opened()[0].clone();

    // send until the body has started
    let mut drives = 0;
    while service.session(id).unwrap().sent_body_size() == 0 {
        service.drive();
        drives += 1;
        assert!(drives < 1000, "body never started");
    }
    handle.fail_publish(ErrorKind::ConnectionReset);
    let published = handle.published().len();
    pump(&mut service, 20);

    match rx.try_recv().unwrap() {
        Err(Error::Transport(err)) => assert_eq!(err.kind(), ErrorKind::ConnectionReset),
        x => panic!("unexpected {x:?}"),
    }
    assert!(rx.try_recv().is_err());
    // no retry after the failure
    assert_eq!(handle.published().len(), published);
    assert!(service.session(id).unwrap().sent_body_size() < 64);
    assert!(handle.close_requested());
    assert_eq!(service.connection_count(), 0);
}

#[test]
fn test_receive_bounded_by_chunk_size() {
    let body = "y".repeat(100);
    let reply = response(200, &body);
    let provider = MockProvider::new()
        .with_responder(move |_, _| vec![MockReceive::bytes(&reply)]);
    let config = ServiceConfig::default().with_max_chunk_size(16);
    let mut service = Service::new(provider.clone(), config);
    let (_, rx) = start(&mut service, Request::get("http://example.test/").unwrap());
    assert_eq!(provider.opened()[0].lock().max_receive_size, 16);

    // one receive per drive: the response needs at least ceil(len / 16) drives
    pump(&mut service, 5);
    assert!(rx.try_recv().is_err());
    pump(&mut service, 20);
    assert_eq!(rx.try_recv().unwrap().unwrap().body(), body.as_bytes());
}
