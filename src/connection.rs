//! Per-transport request/response framing

use std::fmt::{self, Debug, Display};

use tracing::{debug, trace};

use crate::{
    buf::SendBuffer,
    error::Error,
    header::Header,
    request::Endpoint,
    response::Response,
    session::{Session, SessionId, SessionState},
    DriveOutcome, Publish, PublishOutcome, Receive, ReceiveOutcome, Transport, TransportStatus,
};

const HEADER_SEPARATOR: &[u8] = b"\r\n\r\n";

/// Identifies a [`Connection`] within the [`crate::service::Service`] that opened it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub(crate) u64);
impl Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "connection#{}", self.0)
    }
}

/// Linear lifecycle of a [`Connection`]. `Closing` and `Closed` are absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Inited,
    Connecting,
    Active,
    Closing,
    Closed,
}

/// What a call to [`Connection::drive`] accomplished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionEvent {
    /// No work was done
    Idle,
    /// Work was done, nothing for the scheduler to act on
    Active,
    /// The transport became ready
    Opened,
    /// The attached session received its response header and its body may now be received
    ReceiveContent(SessionId),
    /// The attached session completed its exchange and was detached
    Detached(SessionId),
    /// The transport confirmed teardown
    Closed,
}

/// Settings a [`Connection`] needs from its service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FramingLimits {
    pub max_chunk_size: usize,
    pub max_header_size: usize,
}

/// One transport stream to a single [`Endpoint`], framing at most one attached [`Session`] exchange at a time.
///
/// The connection does not own its session. It only records the attached [`SessionId`], and the service passes the
/// session in on every [`Connection::drive`].
pub struct Connection<T> {
    id: ConnectionId,
    endpoint: Endpoint,
    state: ConnectionState,
    transport: Option<T>,
    session: Option<SessionId>,
    limits: FramingLimits,
    send_buffer: SendBuffer,
    sending: bool,
    receive_buffer: Vec<u8>,
    header_scan_offset: usize,
    end_of_stream: bool,
    receive_looping: bool,
}
impl<T> Connection<T>
where
    T: Publish + Receive,
{
    pub(crate) fn new(
        id: ConnectionId,
        endpoint: Endpoint,
        limits: FramingLimits,
    ) -> Result<Self, Error> {
        Ok(Self {
            id,
            endpoint,
            state: ConnectionState::Inited,
            transport: None,
            session: None,
            limits,
            send_buffer: SendBuffer::new(limits.max_chunk_size)?,
            sending: false,
            receive_buffer: Vec::new(),
            header_scan_offset: 0,
            end_of_stream: false,
            receive_looping: false,
        })
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// The attached session, if any
    pub fn session(&self) -> Option<SessionId> {
        self.session
    }

    /// Whether this connection is ready to take a session
    ///
    /// Bytes left over from the previous exchange make the connection unusable: they belong to no session.
    pub fn is_idle(&self) -> bool {
        self.state == ConnectionState::Active
            && self.session.is_none()
            && self.receive_buffer.is_empty()
    }

    /// Start connecting with a transport opened by the provider.
    pub(crate) fn open(&mut self, transport: T) {
        debug!(connection = %self.id, endpoint = %self.endpoint, "open");
        self.transport = Some(transport);
        self.state = ConnectionState::Connecting;
    }

    /// Begin teardown. The connection reports [`ConnectionEvent::Closed`] from [`Connection::drive`] once the transport confirms it.
    pub(crate) fn close(&mut self) {
        if matches!(
            self.state,
            ConnectionState::Closing | ConnectionState::Closed
        ) {
            return;
        }
        debug!(connection = %self.id, endpoint = %self.endpoint, "close");
        self.session = None;
        self.sending = false;
        self.receive_looping = false;
        match self.transport.as_mut() {
            Some(transport) => {
                transport.close();
                self.state = ConnectionState::Closing;
            }
            None => self.state = ConnectionState::Closed,
        }
    }

    /// Bind `session` and begin sending its request header.
    ///
    /// A request that cannot be serialized is not bound and nothing is sent. The caller must close the connection.
    pub(crate) fn attach(&mut self, session: &mut Session, user_agent: &str) -> Result<(), Error> {
        debug_assert!(self.is_idle());
        session.on_attach_connection();
        let header = session.on_request_header_send(user_agent)?;
        trace!(connection = %self.id, bytes = header.len(), "request header");
        // an idle connection has nothing buffered, so any size is accepted
        if !self.send_buffer.try_write(&header)? {
            return Err(Error::ConnectionClosed);
        }
        self.session = Some(session.id());
        self.sending = true;
        self.receive_looping = false;
        Ok(())
    }

    /// Clear the attachment, leaving the connection idle.
    pub(crate) fn detach(&mut self) -> Option<SessionId> {
        self.sending = false;
        self.session.take()
    }

    /// Resume the receive loop. A loop that is already running ignores the trigger.
    pub(crate) fn resume_receive(&mut self) {
        self.receive_looping = true;
    }

    /// Progress the connection.
    ///
    /// `session` must be the attached session when there is one.
    /// An [`Err`] is a terminal failure for the connection, which the caller must close.
    pub(crate) fn drive(&mut self, session: Option<&mut Session>) -> Result<ConnectionEvent, Error> {
        debug_assert_eq!(session.as_ref().map(|x| x.id()), self.session);
        if self.state == ConnectionState::Closed {
            return Ok(ConnectionEvent::Closed);
        }
        let transport = match self.transport.as_mut() {
            Some(x) => x,
            None => return Ok(ConnectionEvent::Idle),
        };
        match self.state {
            ConnectionState::Inited | ConnectionState::Closed => Ok(ConnectionEvent::Idle),
            ConnectionState::Closing => {
                if transport.status() == TransportStatus::Terminated {
                    self.state = ConnectionState::Closed;
                    self.transport = None;
                    debug!(connection = %self.id, "closed");
                    return Ok(ConnectionEvent::Closed);
                }
                match transport.drive() {
                    Ok(x) => Ok(activity(x)),
                    Err(err) => {
                        trace!(connection = %self.id, "error during teardown: {err}");
                        self.state = ConnectionState::Closed;
                        self.transport = None;
                        Ok(ConnectionEvent::Closed)
                    }
                }
            }
            ConnectionState::Connecting => {
                let outcome = transport.drive()?;
                match transport.status() {
                    TransportStatus::Established => {
                        debug!(connection = %self.id, endpoint = %self.endpoint, "ready");
                        self.state = ConnectionState::Active;
                        self.receive_looping = true;
                        Ok(ConnectionEvent::Opened)
                    }
                    TransportStatus::Establishing => Ok(activity(outcome)),
                    TransportStatus::Terminated => Err(Error::ConnectionClosed),
                }
            }
            ConnectionState::Active => {
                let mut outcome = transport.drive()?;
                if let Some(session) = session {
                    if self.sending {
                        outcome = outcome.or(self.drive_send(session)?);
                    }
                    if self.receive_looping {
                        return self.receive_loop(Some(session), outcome);
                    }
                } else if self.receive_looping {
                    return self.receive_loop(None, outcome);
                }
                Ok(activity(outcome))
            }
        }
    }

    /// Flush the send buffer, refilling it from the session body, until the transport stops accepting bytes or the request is fully sent.
    fn drive_send(&mut self, session: &mut Session) -> Result<DriveOutcome, Error> {
        let mut outcome = DriveOutcome::Idle;
        loop {
            if !self.flush()? {
                return Ok(outcome);
            }
            outcome = DriveOutcome::Active;
            if session.state() != SessionState::RequestBodySend {
                self.sending = false;
                self.receive_looping = true;
                return Ok(outcome);
            }
            match session.on_request_body_send(self.limits.max_chunk_size) {
                Some(chunk) => {
                    trace!(connection = %self.id, bytes = chunk.len(), "request body");
                    if !self.send_buffer.try_write(chunk)? {
                        return Err(Error::ConnectionClosed);
                    }
                }
                None => {
                    self.sending = false;
                    self.receive_looping = true;
                    return Ok(outcome);
                }
            }
        }
    }

    /// Publish buffered bytes, returning true once the buffer is drained.
    fn flush(&mut self) -> Result<bool, Error> {
        let transport = match self.transport.as_mut() {
            Some(x) => x,
            None => return Err(Error::ConnectionClosed),
        };
        while !self.send_buffer.is_empty() {
            let pending = self.send_buffer.peek();
            let pending_len = pending.len();
            match transport.publish(pending)? {
                PublishOutcome::Published => self.send_buffer.advance(pending_len)?,
                PublishOutcome::Incomplete(rest) => {
                    let written = pending_len - rest.len();
                    self.send_buffer.advance(written)?;
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }

    /// One pass of the receive loop: parse what is buffered, then receive at most once.
    fn receive_loop(
        &mut self,
        mut session: Option<&mut Session>,
        mut outcome: DriveOutcome,
    ) -> Result<ConnectionEvent, Error> {
        let mut received = false;
        loop {
            match session.as_deref_mut() {
                None => {
                    if !self.receive_buffer.is_empty() {
                        return Err(Error::ProtocolViolation);
                    }
                }
                Some(session) => match session.state() {
                    SessionState::ResponseHeaderReceive => {
                        if let Some(response) = self.try_parse_response()? {
                            session.on_response_header(response);
                            self.receive_looping = false;
                            return Ok(ConnectionEvent::ReceiveContent(session.id()));
                        }
                    }
                    SessionState::ResponseBodyReceive => match self.receive_body(session)? {
                        BodyProgress::Completed => {
                            let id = session.id();
                            if !self.receive_buffer.is_empty() {
                                debug!(
                                    connection = %self.id,
                                    bytes = self.receive_buffer.len(),
                                    "bytes past the response body, not reusable"
                                );
                            }
                            self.detach();
                            return Ok(ConnectionEvent::Detached(id));
                        }
                        BodyProgress::Delivered => {
                            outcome = DriveOutcome::Active;
                            continue;
                        }
                        BodyProgress::Pending => {}
                    },
                    _ => return Ok(activity(outcome)),
                },
            }

            if self.end_of_stream {
                return Err(Error::ConnectionClosed);
            }
            if received {
                return Ok(ConnectionEvent::Active);
            }

            let transport = match self.transport.as_mut() {
                Some(x) => x,
                None => return Err(Error::ConnectionClosed),
            };
            match transport.receive()? {
                ReceiveOutcome::Payload(bytes) => {
                    trace!(connection = %self.id, bytes = bytes.len(), "receive");
                    self.receive_buffer.extend_from_slice(bytes);
                    received = true;
                }
                ReceiveOutcome::Ended => {
                    trace!(connection = %self.id, "end of stream");
                    self.end_of_stream = true;
                    received = true;
                }
                ReceiveOutcome::Idle => return Ok(activity(outcome)),
            }
        }
    }

    /// Parse a response header from the receive buffer, consuming it along with the separator.
    ///
    /// The separator search resumes where the previous attempt stopped.
    fn try_parse_response(&mut self) -> Result<Option<Response>, Error> {
        let separator = find_separator(&self.receive_buffer, self.header_scan_offset);
        let header_len = match separator {
            Some(x) => x,
            None => {
                if self.receive_buffer.len() > self.limits.max_header_size {
                    return Err(Error::HeaderTooLarge);
                }
                if self.end_of_stream {
                    return Err(Error::NoResponseHeader);
                }
                self.header_scan_offset = self
                    .receive_buffer
                    .len()
                    .saturating_sub(HEADER_SEPARATOR.len() - 1);
                return Ok(None);
            }
        };
        if header_len > self.limits.max_header_size {
            return Err(Error::HeaderTooLarge);
        }

        let header_bytes: Vec<u8> = self
            .receive_buffer
            .drain(..header_len + HEADER_SEPARATOR.len())
            .take(header_len)
            .collect();
        self.header_scan_offset = 0;
        let response = parse_response_header(&header_bytes)?;
        trace!(
            connection = %self.id,
            status = response.status_code(),
            fields = response.header().len(),
            "parsed response header"
        );
        Ok(Some(response))
    }

    /// Deliver buffered body bytes to `session`, bounded by its remaining `Content-Length`.
    fn receive_body(&mut self, session: &mut Session) -> Result<BodyProgress, Error> {
        let response = match session.response() {
            Some(x) => x,
            None => return Err(Error::NoResponseHeader),
        };
        let total = response
            .expected_body_len()
            .ok_or(Error::ResponseHasNoContentLength)?;
        let remaining = total.saturating_sub(response.body().len());
        if remaining == 0 {
            session.on_response_body(None);
            return Ok(BodyProgress::Completed);
        }
        if self.receive_buffer.is_empty() {
            return Ok(BodyProgress::Pending);
        }
        let take = usize::min(self.receive_buffer.len(), remaining);
        let chunk: Vec<u8> = self.receive_buffer.drain(..take).collect();
        session.on_response_body(Some(&chunk));
        trace!(
            connection = %self.id,
            received = total - remaining + take,
            total,
            "response body"
        );
        Ok(BodyProgress::Delivered)
    }
}
impl<T> Debug for Connection<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("endpoint", &self.endpoint)
            .field("state", &self.state)
            .field("session", &self.session)
            .finish()
    }
}

enum BodyProgress {
    Delivered,
    Pending,
    Completed,
}

fn activity(outcome: DriveOutcome) -> ConnectionEvent {
    match outcome {
        DriveOutcome::Active => ConnectionEvent::Active,
        DriveOutcome::Idle => ConnectionEvent::Idle,
    }
}

/// Index of the first CRLFCRLF at or after `from`
fn find_separator(buf: &[u8], from: usize) -> Option<usize> {
    if buf.len() < HEADER_SEPARATOR.len() {
        return None;
    }
    let from = usize::min(from, buf.len());
    buf[from..]
        .windows(HEADER_SEPARATOR.len())
        .position(|x| x == HEADER_SEPARATOR)
        .map(|x| x + from)
}

/// Parse `<version> <code> <message...>` followed by CRLF separated fields.
fn parse_response_header(bytes: &[u8]) -> Result<Response, Error> {
    let text = std::str::from_utf8(bytes).map_err(|_| Error::InvalidResponseHeader)?;
    let (status_line, fields) = match text.split_once("\r\n") {
        Some((status_line, fields)) => (status_line, fields),
        None => (text, ""),
    };
    let tokens: Vec<&str> = status_line.split(' ').collect();
    if tokens.len() < 3 {
        return Err(Error::InvalidResponseHeader);
    }
    let status_code: u16 = tokens[1]
        .parse()
        .map_err(|_| Error::InvalidResponseHeader)?;
    let status_message = tokens[2..].join(" ").trim().to_owned();
    Ok(Response::new(
        status_code,
        status_message,
        Header::parse(fields),
    ))
}
