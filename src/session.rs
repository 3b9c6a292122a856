//! Per-request state machine: request serialization, response assembly and redirect chaining

use std::fmt::{self, Debug, Display};

use tracing::debug;

use crate::{
    error::Error,
    header::{CONNECTION, LOCATION, USER_AGENT},
    request::{Endpoint, Method, Request},
    response::{RedirectEntry, Response},
};

/// Identifies a [`Session`] within the [`crate::service::Service`] that created it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub(crate) u64);
impl Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session#{}", self.0)
    }
}

/// Lifecycle of a [`Session`].
///
/// `RequestBodySend` is skipped for requests without a body.
/// `Completed` is transient: it is followed by a redirect restart back to `Connecting`, or by the handler being dispatched.
/// `Failed` and `Closed` are absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Inited,
    Connecting,
    Connected,
    RequestBodySend,
    ResponseHeaderReceive,
    ResponseHeaderReceived,
    ResponseBodyReceive,
    Completed,
    Failed,
    Closed,
}

/// The user-facing completion handler. It receives either a fully assembled [`Response`] or an [`Error`].
pub type Handler = Box<dyn FnOnce(Result<Response, Error>) + Send>;

/// A terminal outcome paired with the handler it must be delivered to.
///
/// Completions are produced inside the work context and dispatched outside of it.
pub struct Completion {
    session: SessionId,
    handler: Handler,
    outcome: Result<Response, Error>,
}
impl Completion {
    pub fn session(&self) -> SessionId {
        self.session
    }

    pub fn outcome(&self) -> &Result<Response, Error> {
        &self.outcome
    }

    /// Invoke the handler with the outcome.
    pub fn dispatch(self) {
        (self.handler)(self.outcome)
    }
}
impl Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion")
            .field("session", &self.session)
            .field("outcome", &self.outcome)
            .finish()
    }
}

/// One logical request/response exchange, including every redirect it follows.
///
/// The effective request is the original request, or the most recent redirect target once a redirect was followed.
/// The redirect history is append-only and its entries are never modified.
pub struct Session {
    id: SessionId,
    request: Request,
    redirect_request: Option<Request>,
    state: SessionState,
    sent_body_size: usize,
    response: Option<Response>,
    redirects: Vec<RedirectEntry>,
    handler: Option<Handler>,
}
impl Session {
    pub(crate) fn new(id: SessionId, request: Request) -> Self {
        Self {
            id,
            request,
            redirect_request: None,
            state: SessionState::Inited,
            sent_body_size: 0,
            response: None,
            redirects: Vec::new(),
            handler: None,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// The request the session was created with
    pub fn request(&self) -> &Request {
        &self.request
    }

    /// The request currently being sent, which is the latest redirect target if any redirect was followed
    pub fn current_request(&self) -> &Request {
        self.redirect_request.as_ref().unwrap_or(&self.request)
    }

    fn current_request_mut(&mut self) -> &mut Request {
        self.redirect_request.as_mut().unwrap_or(&mut self.request)
    }

    pub fn endpoint(&self) -> &Endpoint {
        self.current_request().endpoint()
    }

    pub fn redirects(&self) -> &[RedirectEntry] {
        &self.redirects
    }

    /// The response being assembled, `None` until its header was parsed
    pub fn response(&self) -> Option<&Response> {
        self.response.as_ref()
    }

    pub fn sent_body_size(&self) -> usize {
        self.sent_body_size
    }

    /// Whether the completion handler has yet to fire
    pub fn is_pending(&self) -> bool {
        self.handler.is_some()
    }

    pub(crate) fn start(&mut self, handler: Handler) -> Result<(), Error> {
        if self.state != SessionState::Inited {
            return Err(Error::SessionAlreadyStarted);
        }
        self.handler = Some(handler);
        self.state = SessionState::Connecting;
        Ok(())
    }

    /// Move to `Closed`, returning an [`Error::AbnormalTermination`] completion if the handler never fired.
    pub(crate) fn close(&mut self) -> Option<Completion> {
        self.state = SessionState::Closed;
        self.complete(Err(Error::AbnormalTermination))
    }

    pub(crate) fn on_attach_connection(&mut self) {
        debug!(session = %self.id, endpoint = %self.endpoint(), "attach");
        debug_assert_eq!(self.state, SessionState::Connecting);
        self.state = SessionState::Connected;
    }

    /// Serialize the request line and header of the current request.
    ///
    /// `Connection` and `User-Agent` are written into the stored request so they persist in the redirect history.
    pub(crate) fn on_request_header_send(&mut self, user_agent: &str) -> Result<Vec<u8>, Error> {
        let request = self.current_request_mut();
        let has_body = request.body().is_some();
        if has_body && request.method() != Method::Post {
            return Err(Error::NonPostRequestHasBody);
        }
        request.header_mut().set(CONNECTION, "keep-alive");
        request.header_mut().set(USER_AGENT, user_agent);

        let mut buf = Vec::new();
        buf.extend_from_slice(request.method().as_str().as_bytes());
        buf.push(b' ');
        buf.extend_from_slice(request.path().as_bytes());
        buf.extend_from_slice(b" HTTP/1.1\r\n");
        request.header().write_to(&mut buf);
        buf.extend_from_slice(b"\r\n");

        self.state = if has_body {
            SessionState::RequestBodySend
        } else {
            SessionState::ResponseHeaderReceive
        };
        Ok(buf)
    }

    /// The next unsent body slice of at most `max_chunk_size` bytes, or `None` once the body was fully sent.
    pub(crate) fn on_request_body_send(&mut self, max_chunk_size: usize) -> Option<&[u8]> {
        let start = self.sent_body_size;
        let body = self
            .redirect_request
            .as_ref()
            .unwrap_or(&self.request)
            .body()
            .unwrap_or_default();
        let chunk_size = usize::min(body.len() - start, max_chunk_size);
        if chunk_size == 0 {
            self.state = SessionState::ResponseHeaderReceive;
            return None;
        }
        self.sent_body_size += chunk_size;
        Some(&body[start..start + chunk_size])
    }

    pub(crate) fn on_response_header(&mut self, response: Response) {
        debug!(
            session = %self.id,
            status = response.status_code(),
            "response header"
        );
        self.response = Some(response);
        self.state = SessionState::ResponseHeaderReceived;
        self.state = SessionState::ResponseBodyReceive;
    }

    /// Append a body chunk, or mark the body complete when `chunk` is `None`.
    pub(crate) fn on_response_body(&mut self, chunk: Option<&[u8]>) {
        debug_assert_eq!(self.state, SessionState::ResponseBodyReceive);
        match (chunk, self.response.as_mut()) {
            (Some(chunk), Some(response)) => response.append_body(chunk),
            (None, _) => self.state = SessionState::Completed,
            (Some(_), None) => {}
        }
    }

    /// Decide the outcome of a completed exchange.
    ///
    /// Returns `None` when a redirect is being followed, in which case the session is back in `Connecting`
    /// and must be rescheduled.
    pub(crate) fn on_detach_connection(&mut self, max_redirects: usize) -> Option<Completion> {
        debug!(session = %self.id, endpoint = %self.endpoint(), "detach");
        let response = match self.response.take() {
            Some(x) => x,
            None => return self.on_error(Error::NoResponseHeader),
        };
        let code = response.status_code();
        if response.is_success() {
            return self.complete(Ok(response));
        }
        if !response.is_redirect() {
            self.state = SessionState::Failed;
            return self.complete(Err(Error::StatusCodeFailure(Box::new(response))));
        }

        if self.redirects.len() < max_redirects {
            let target = response
                .header()
                .get(LOCATION)
                .and_then(|location| self.current_request().url().join(location).ok())
                .and_then(|url| self.current_request().redirected(url, code).ok());
            if let Some(target) = target {
                debug!(
                    session = %self.id,
                    status = code,
                    location = %target.url(),
                    count = self.redirects.len() + 1,
                    "redirect"
                );
                let sent = self.current_request().clone();
                self.redirects.push(RedirectEntry::new(sent, response));
                self.redirect_request = Some(target);
                self.sent_body_size = 0;
                self.state = SessionState::Connecting;
                return None;
            }
        }
        self.state = SessionState::Failed;
        self.complete(Err(Error::TooManyRedirects))
    }

    /// Fail the session, returning a completion if the handler has not fired yet.
    pub(crate) fn on_error(&mut self, error: Error) -> Option<Completion> {
        if self.state != SessionState::Closed {
            self.state = SessionState::Failed;
        }
        self.complete(Err(error))
    }

    fn complete(&mut self, outcome: Result<Response, Error>) -> Option<Completion> {
        self.handler.take().map(|handler| Completion {
            session: self.id,
            handler,
            outcome,
        })
    }
}
impl Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("url", &self.current_request().url().as_str())
            .field("redirects", &self.redirects.len())
            .finish()
    }
}
