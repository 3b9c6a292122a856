//! Mock transports, most useful for testing

use std::{
    collections::VecDeque,
    fmt::Debug,
    io::{Error, ErrorKind},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use crate::{
    request::Endpoint, DriveOutcome, Publish, PublishOutcome, Receive, ReceiveOutcome, Transport,
    TransportProvider, TransportStatus,
};

/// One scripted result for [`MockTransport::receive`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockReceive {
    Bytes(Vec<u8>),
    End,
    Error(ErrorKind),
}
impl MockReceive {
    pub fn bytes(bytes: impl AsRef<[u8]>) -> Self {
        Self::Bytes(bytes.as_ref().to_vec())
    }
}

/// Called with every complete request a [`MockTransport`] receives, returning what the transport will receive in response.
///
/// A request is complete once its header and `Content-Length` body bytes were published.
pub type Responder = Box<dyn FnMut(&Endpoint, &[u8]) -> Vec<MockReceive> + Send>;

/// Shared state of one [`MockTransport`], scripted and inspected by tests through a [`MockHandle`].
///
/// Results returned from [`MockTransport::receive`] are popped from the public `receive_queue`.
/// Bytes accepted by [`MockTransport::publish`] are appended to the public `published` buffer.
#[derive(Debug)]
pub struct MockState {
    pub endpoint: Endpoint,
    pub status: TransportStatus,
    /// drives spent in `Establishing` before becoming `Established`
    pub establish_after: usize,
    /// fail the next drive while establishing
    pub connect_error: Option<ErrorKind>,
    pub receive_queue: VecDeque<MockReceive>,
    /// scripted byte chunks larger than this are returned over several receives
    pub max_receive_size: usize,
    pub published: Vec<u8>,
    /// max bytes accepted per publish call, `None` for unlimited
    pub publish_limit: Option<usize>,
    pub publish_error: Option<ErrorKind>,
    /// drives spent in teardown after close
    pub close_after: usize,
    pub close_requested: bool,
    ended: bool,
    pending_request: Vec<u8>,
}

/// Shared handle to a [`MockTransport`]'s state
#[derive(Debug, Clone)]
pub struct MockHandle(Arc<Mutex<MockState>>);
impl MockHandle {
    pub fn lock(&self) -> MutexGuard<'_, MockState> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn endpoint(&self) -> Endpoint {
        self.lock().endpoint.clone()
    }

    pub fn status(&self) -> TransportStatus {
        self.lock().status
    }

    pub fn push_receive(&self, bytes: impl AsRef<[u8]>) {
        self.lock()
            .receive_queue
            .push_back(MockReceive::bytes(bytes));
    }

    pub fn push_end(&self) {
        self.lock().receive_queue.push_back(MockReceive::End);
    }

    pub fn push_error(&self, kind: ErrorKind) {
        self.lock().receive_queue.push_back(MockReceive::Error(kind));
    }

    /// Become established on the next drive
    pub fn establish(&self) {
        self.lock().establish_after = 0;
    }

    pub fn fail_connect(&self, kind: ErrorKind) {
        self.lock().connect_error = Some(kind);
    }

    pub fn set_publish_limit(&self, limit: Option<usize>) {
        self.lock().publish_limit = limit;
    }

    /// Fail the next publish
    pub fn fail_publish(&self, kind: ErrorKind) {
        self.lock().publish_error = Some(kind);
    }

    pub fn published(&self) -> Vec<u8> {
        self.lock().published.clone()
    }

    pub fn take_published(&self) -> Vec<u8> {
        std::mem::take(&mut self.lock().published)
    }

    pub fn close_requested(&self) -> bool {
        self.lock().close_requested
    }
}

/// A mock transport driven entirely by its [`MockState`].
pub struct MockTransport {
    state: MockHandle,
    responder: Option<Arc<Mutex<Responder>>>,
    received: Vec<u8>,
}
impl MockTransport {
    pub fn handle(&self) -> MockHandle {
        self.state.clone()
    }

    fn respond(&self, state: &mut MockState) {
        let responder = match self.responder.as_ref() {
            Some(x) => x,
            None => return,
        };
        while let Some(len) = complete_request_len(&state.pending_request) {
            let request: Vec<u8> = state.pending_request.drain(..len).collect();
            let mut responder = responder.lock().unwrap_or_else(PoisonError::into_inner);
            let replies = (responder)(&state.endpoint, &request);
            state.receive_queue.extend(replies);
        }
    }
}
impl Transport for MockTransport {
    fn status(&self) -> TransportStatus {
        self.state.status()
    }

    fn close(&mut self) {
        let mut state = self.state.lock();
        state.close_requested = true;
        if state.close_after == 0 {
            state.status = TransportStatus::Terminated;
        }
    }

    fn drive(&mut self) -> Result<DriveOutcome, Error> {
        let mut state = self.state.lock();
        if state.close_requested {
            if state.status == TransportStatus::Terminated {
                return Ok(DriveOutcome::Idle);
            }
            if state.close_after > 0 {
                state.close_after -= 1;
            } else {
                state.status = TransportStatus::Terminated;
            }
            return Ok(DriveOutcome::Active);
        }
        if state.status != TransportStatus::Establishing {
            return Ok(DriveOutcome::Idle);
        }
        if let Some(kind) = state.connect_error.take() {
            state.status = TransportStatus::Terminated;
            return Err(Error::new(kind, "mock connect failure"));
        }
        if state.establish_after > 0 {
            state.establish_after -= 1;
            return Ok(DriveOutcome::Idle);
        }
        state.status = TransportStatus::Established;
        Ok(DriveOutcome::Active)
    }
}
impl Publish for MockTransport {
    fn publish<'a>(&mut self, payload: &'a [u8]) -> Result<PublishOutcome<&'a [u8]>, Error> {
        let mut state = self.state.lock();
        if state.status != TransportStatus::Established {
            return Err(Error::new(ErrorKind::NotConnected, "not established"));
        }
        if let Some(kind) = state.publish_error.take() {
            return Err(Error::new(kind, "mock publish failure"));
        }
        let accepted = usize::min(payload.len(), state.publish_limit.unwrap_or(usize::MAX));
        state.published.extend_from_slice(&payload[..accepted]);
        state.pending_request.extend_from_slice(&payload[..accepted]);
        self.respond(&mut state);
        if accepted < payload.len() {
            Ok(PublishOutcome::Incomplete(&payload[accepted..]))
        } else {
            Ok(PublishOutcome::Published)
        }
    }
}
impl Receive for MockTransport {
    fn receive(&mut self) -> Result<ReceiveOutcome<&[u8]>, Error> {
        let mut state = self.state.lock();
        if state.status != TransportStatus::Established {
            return Err(Error::new(ErrorKind::NotConnected, "not established"));
        }
        if state.ended {
            return Ok(ReceiveOutcome::Ended);
        }
        match state.receive_queue.pop_front() {
            None => Ok(ReceiveOutcome::Idle),
            Some(MockReceive::End) => {
                state.ended = true;
                Ok(ReceiveOutcome::Ended)
            }
            Some(MockReceive::Error(kind)) => Err(Error::new(kind, "mock receive failure")),
            Some(MockReceive::Bytes(mut bytes)) => {
                let max_receive_size = usize::max(state.max_receive_size, 1);
                if bytes.len() > max_receive_size {
                    let rest = bytes.split_off(max_receive_size);
                    state.receive_queue.push_front(MockReceive::Bytes(rest));
                }
                drop(state);
                self.received = bytes;
                Ok(ReceiveOutcome::Payload(&self.received))
            }
        }
    }
}
impl Debug for MockTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("MockTransport")
    }
}

#[derive(Default)]
struct ProviderState {
    opened: Vec<MockHandle>,
    open_errors: VecDeque<ErrorKind>,
}

/// A [`TransportProvider`] that opens [`MockTransport`]s.
///
/// Every opened transport is recorded and can be scripted through its [`MockHandle`].
/// Clones share the same record, so a test can keep a clone after moving the provider into a service.
#[derive(Clone)]
pub struct MockProvider {
    state: Arc<Mutex<ProviderState>>,
    responder: Option<Arc<Mutex<Responder>>>,
    establish_after: usize,
    publish_limit: Option<usize>,
    close_after: usize,
}
impl Default for MockProvider {
    fn default() -> Self {
        Self::new()
    }
}
impl MockProvider {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(ProviderState::default())),
            responder: None,
            establish_after: 0,
            publish_limit: None,
            close_after: 0,
        }
    }

    /// Answer every complete request with the receive results returned by `responder`
    pub fn with_responder<F>(mut self, responder: F) -> Self
    where
        F: FnMut(&Endpoint, &[u8]) -> Vec<MockReceive> + Send + 'static,
    {
        self.responder = Some(Arc::new(Mutex::new(Box::new(responder))));
        self
    }

    /// Opened transports spend `drives` drive calls establishing
    pub fn with_establish_after(mut self, drives: usize) -> Self {
        self.establish_after = drives;
        self
    }

    /// Opened transports accept at most `limit` bytes per publish
    pub fn with_publish_limit(mut self, limit: usize) -> Self {
        self.publish_limit = Some(limit);
        self
    }

    /// Opened transports spend `drives` drive calls tearing down
    pub fn with_close_after(mut self, drives: usize) -> Self {
        self.close_after = drives;
        self
    }

    /// Fail the next call to [`TransportProvider::open`]
    pub fn fail_next_open(&self, kind: ErrorKind) {
        self.lock().open_errors.push_back(kind);
    }

    /// Handles of every transport opened so far, oldest first
    pub fn opened(&self) -> Vec<MockHandle> {
        self.lock().opened.clone()
    }

    pub fn open_count(&self) -> usize {
        self.lock().opened.len()
    }

    fn lock(&self) -> MutexGuard<'_, ProviderState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
impl TransportProvider for MockProvider {
    type Transport = MockTransport;

    fn open(&mut self, endpoint: &Endpoint, max_receive_size: usize) -> Result<Self::Transport, Error> {
        let mut state = self.lock();
        if let Some(kind) = state.open_errors.pop_front() {
            return Err(Error::new(kind, "mock open failure"));
        }
        let handle = MockHandle(Arc::new(Mutex::new(MockState {
            endpoint: endpoint.clone(),
            status: TransportStatus::Establishing,
            establish_after: self.establish_after,
            connect_error: None,
            receive_queue: VecDeque::new(),
            max_receive_size,
            published: Vec::new(),
            publish_limit: self.publish_limit,
            publish_error: None,
            close_after: self.close_after,
            close_requested: false,
            ended: false,
            pending_request: Vec::new(),
        })));
        state.opened.push(handle.clone());
        Ok(MockTransport {
            state: handle,
            responder: self.responder.clone(),
            received: Vec::new(),
        })
    }
}
impl Debug for MockProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("MockProvider")
    }
}

/// Length of the first complete request in `buf`: header, separator and `Content-Length` body bytes.
fn complete_request_len(buf: &[u8]) -> Option<usize> {
    let header_len = buf.windows(4).position(|x| x == b"\r\n\r\n")?;
    let content_length = String::from_utf8_lossy(&buf[..header_len])
        .split("\r\n")
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.trim().parse::<usize>().ok())
        .unwrap_or(0);
    let total = header_len + 4 + content_length;
    if buf.len() >= total {
        Some(total)
    } else {
        None
    }
}
