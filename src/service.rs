//! The connection pool and session scheduler

use std::{
    collections::{BTreeMap, VecDeque},
    time::Duration,
};

use tracing::{debug, warn};

use crate::{
    connection::{Connection, ConnectionEvent, ConnectionId, ConnectionState, FramingLimits},
    error::Error,
    request::{Endpoint, Request},
    session::{Completion, Handler, Session, SessionId, SessionState},
    DriveOutcome, TransportProvider,
};

/// Configuration for a [`Service`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceConfig {
    user_agent: String,
    max_chunk_size: usize,
    max_header_size: usize,
    max_redirects: usize,
    idle_interval: Duration,
}
impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            user_agent: "nbhttp".to_owned(),
            max_chunk_size: 100 * 1024,
            max_header_size: 1_000_000,
            max_redirects: 16,
            idle_interval: Duration::from_millis(1),
        }
    }
}
impl ServiceConfig {
    /// Value sent in the `User-Agent` field of every request
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    /// Upper bound for a single request body chunk and a single transport receive
    pub fn with_max_chunk_size(mut self, max_chunk_size: usize) -> Self {
        self.max_chunk_size = max_chunk_size;
        self
    }

    /// Bytes that may be buffered while searching for the end of a response header
    pub fn with_max_header_size(mut self, max_header_size: usize) -> Self {
        self.max_header_size = max_header_size;
        self
    }

    /// Redirects a session may follow before failing with [`Error::TooManyRedirects`]
    pub fn with_max_redirects(mut self, max_redirects: usize) -> Self {
        self.max_redirects = max_redirects;
        self
    }

    /// How long a worker thread waits for commands when the engine is idle
    pub fn with_idle_interval(mut self, idle_interval: Duration) -> Self {
        self.idle_interval = idle_interval;
        self
    }

    pub fn user_agent(&self) -> &str {
        &self.user_agent
    }

    pub fn max_chunk_size(&self) -> usize {
        self.max_chunk_size
    }

    pub fn max_header_size(&self) -> usize {
        self.max_header_size
    }

    pub fn max_redirects(&self) -> usize {
        self.max_redirects
    }

    pub fn idle_interval(&self) -> Duration {
        self.idle_interval
    }

    fn framing_limits(&self) -> FramingLimits {
        FramingLimits {
            max_chunk_size: self.max_chunk_size,
            max_header_size: self.max_header_size,
        }
    }
}

/// Owns the connection pool and the registry of live sessions.
///
/// A [`Service`] is a single serialized work context. All state changes happen inside `&mut self` calls and
/// progress is made by calling [`Service::drive`]. Completion handlers are never run inside the service:
/// they are queued and must be collected with [`Service::take_completions`] and dispatched by the caller.
///
/// ## Scheduling
///
/// After every state-affecting event the service runs a scheduling pass. Each session waiting for a connection is
/// attached to an idle connection of its endpoint, or a new connection is opened when none of that endpoint is
/// connecting or active. Connections still connecting with no waiting session left are closed.
pub struct Service<P: TransportProvider> {
    provider: P,
    config: ServiceConfig,
    sessions: BTreeMap<SessionId, Session>,
    connections: Vec<Connection<P::Transport>>,
    completions: VecDeque<Completion>,
    next_session_id: u64,
    next_connection_id: u64,
}
impl<P: TransportProvider> Service<P> {
    pub fn new(provider: P, config: ServiceConfig) -> Self {
        Self {
            provider,
            config,
            sessions: BTreeMap::new(),
            connections: Vec::new(),
            completions: VecDeque::new(),
            next_session_id: 1,
            next_connection_id: 1,
        }
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    pub fn provider_mut(&mut self) -> &mut P {
        &mut self.provider
    }

    /// Create a session for `request`. The session does nothing until started.
    pub fn create_session(&mut self, request: Request) -> SessionId {
        let id = SessionId(self.next_session_id);
        self.next_session_id += 1;
        self.sessions.insert(id, Session::new(id, request));
        id
    }

    /// Register `handler` and schedule the session onto a connection.
    pub fn start_session(&mut self, id: SessionId, handler: Handler) -> Result<(), Error> {
        let session = match self.sessions.get_mut(&id) {
            Some(x) => x,
            None => return Err(Error::SessionAlreadyStarted),
        };
        session.start(handler)?;
        debug!(session = %id, url = %session.request().url(), "start");
        self.update();
        Ok(())
    }

    /// Close and deregister a session.
    ///
    /// A pending handler receives [`Error::AbnormalTermination`]. A connection the session was attached to is closed
    /// so it is never left pointing at a dead session.
    pub fn close_session(&mut self, id: SessionId) {
        let mut session = match self.sessions.remove(&id) {
            Some(x) => x,
            None => return,
        };
        debug!(session = %id, state = ?session.state(), "close");
        if let Some(completion) = session.close() {
            self.completions.push_back(completion);
        }
        if let Some(index) = self.connections.iter().position(|x| x.session() == Some(id)) {
            self.on_connection_error(index, Error::ConnectionClosed);
        }
        self.update();
    }

    pub fn session(&self, id: SessionId) -> Option<&Session> {
        self.sessions.get(&id)
    }

    /// Number of sessions that were created and not closed yet
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn connections(&self) -> impl Iterator<Item = &Connection<P::Transport>> {
        self.connections.iter()
    }

    /// Number of connections in any state before `Closed`
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Collect queued completions. Each must be dispatched outside of the service.
    pub fn take_completions(&mut self) -> Vec<Completion> {
        self.completions.drain(..).collect()
    }

    pub fn has_completions(&self) -> bool {
        !self.completions.is_empty()
    }

    /// Close every session and connection. Pending handlers receive [`Error::AbnormalTermination`].
    ///
    /// Keep calling [`Service::drive`] until [`Service::connection_count`] reaches zero for teardown to finish.
    pub fn close_all(&mut self) {
        for (_, mut session) in std::mem::take(&mut self.sessions) {
            if let Some(completion) = session.close() {
                self.completions.push_back(completion);
            }
        }
        for connection in self.connections.iter_mut() {
            connection.close();
        }
    }

    /// Drive every connection once, handling the events they report.
    pub fn drive(&mut self) -> DriveOutcome {
        let mut outcome = DriveOutcome::Idle;
        let ids: Vec<ConnectionId> = self.connections.iter().map(|x| x.id()).collect();
        for id in ids {
            let index = match self.connections.iter().position(|x| x.id() == id) {
                Some(x) => x,
                None => continue,
            };
            let connection = &mut self.connections[index];
            let session = match connection.session() {
                Some(session) => self.sessions.get_mut(&session),
                None => None,
            };
            let connecting = connection.state() == ConnectionState::Connecting;
            match connection.drive(session) {
                Ok(ConnectionEvent::Idle) => {}
                Ok(ConnectionEvent::Active) => outcome = DriveOutcome::Active,
                Ok(ConnectionEvent::Opened) => {
                    outcome = DriveOutcome::Active;
                    self.update();
                }
                Ok(ConnectionEvent::ReceiveContent(session)) => {
                    outcome = DriveOutcome::Active;
                    self.on_session_receive_content(session);
                }
                Ok(ConnectionEvent::Detached(session)) => {
                    outcome = DriveOutcome::Active;
                    self.on_session_detached(session);
                }
                Ok(ConnectionEvent::Closed) => {
                    outcome = DriveOutcome::Active;
                    self.connections.remove(index);
                }
                Err(err) => {
                    outcome = DriveOutcome::Active;
                    if connecting {
                        self.on_open_connection_error(index, err);
                    } else {
                        self.on_connection_error(index, err);
                    }
                    self.update();
                }
            }
        }
        outcome
    }

    /// The scheduling pass
    fn update(&mut self) {
        let waiting: Vec<SessionId> = self
            .sessions
            .values()
            .filter(|x| x.state() == SessionState::Connecting)
            .map(|x| x.id())
            .collect();
        for id in waiting {
            self.open_or_attach_connection(id);
        }

        for index in 0..self.connections.len() {
            let connection = &self.connections[index];
            if connection.state() == ConnectionState::Connecting
                && self.waiting_sessions(connection.endpoint()).is_empty()
            {
                debug!(connection = %connection.id(), "no waiting session");
                self.connections[index].close();
            }
        }
    }

    fn open_or_attach_connection(&mut self, id: SessionId) {
        let session = match self.sessions.get_mut(&id) {
            Some(x) if x.state() == SessionState::Connecting => x,
            _ => return,
        };
        let endpoint = session.endpoint();
        let mut matching = false;
        let mut idle = None;
        for (index, connection) in self.connections.iter().enumerate() {
            if connection.endpoint() != endpoint
                || !matches!(
                    connection.state(),
                    ConnectionState::Connecting | ConnectionState::Active
                )
            {
                continue;
            }
            matching = true;
            if connection.is_idle() {
                idle = Some(index);
                break;
            }
        }
        if !matching {
            let endpoint = endpoint.clone();
            self.open_connection(endpoint);
            return;
        }
        let index = match idle {
            Some(x) => x,
            None => return,
        };

        let connection = &mut self.connections[index];
        if let Err(err) = connection.attach(session, &self.config.user_agent) {
            warn!(session = %id, connection = %connection.id(), "request not sent: {err}");
            connection.close();
            if let Some(completion) = session.on_error(err) {
                self.completions.push_back(completion);
            }
        }
    }

    fn open_connection(&mut self, endpoint: Endpoint) {
        let id = ConnectionId(self.next_connection_id);
        self.next_connection_id += 1;
        let opened = Connection::new(id, endpoint.clone(), self.config.framing_limits())
            .and_then(|mut connection| {
                let transport = self.provider.open(&endpoint, self.config.max_chunk_size)?;
                connection.open(transport);
                Ok(connection)
            });
        match opened {
            Ok(connection) => self.connections.push(connection),
            Err(err) => {
                warn!(connection = %id, endpoint = %endpoint, "open failed: {err}");
                self.fail_waiting_sessions(&endpoint, err);
            }
        }
    }

    fn on_session_receive_content(&mut self, id: SessionId) {
        debug_assert_eq!(
            self.sessions.get(&id).map(|x| x.state()),
            Some(SessionState::ResponseBodyReceive)
        );
        if let Some(connection) = self
            .connections
            .iter_mut()
            .find(|x| x.session() == Some(id))
        {
            connection.resume_receive();
        }
    }

    fn on_session_detached(&mut self, id: SessionId) {
        if let Some(session) = self.sessions.get_mut(&id) {
            if let Some(completion) = session.on_detach_connection(self.config.max_redirects) {
                self.completions.push_back(completion);
            }
        }
        self.update();
    }

    /// A connection failed before becoming ready: every session waiting on its endpoint fails.
    fn on_open_connection_error(&mut self, index: usize, err: Error) {
        let connection = &mut self.connections[index];
        warn!(
            connection = %connection.id(),
            endpoint = %connection.endpoint(),
            "connect failed: {err}"
        );
        connection.close();
        let endpoint = connection.endpoint().clone();
        self.fail_waiting_sessions(&endpoint, err);
    }

    /// A live connection failed: only its attached session, if any, fails.
    fn on_connection_error(&mut self, index: usize, err: Error) {
        let connection = &mut self.connections[index];
        let session = connection.session();
        match session {
            Some(session) => {
                warn!(connection = %connection.id(), session = %session, "connection failed: {err}")
            }
            None => debug!(connection = %connection.id(), "idle connection ended: {err}"),
        }
        connection.close();
        if let Some(completion) = session
            .and_then(|x| self.sessions.get_mut(&x))
            .and_then(|x| x.on_error(err))
        {
            self.completions.push_back(completion);
        }
    }

    fn fail_waiting_sessions(&mut self, endpoint: &Endpoint, err: Error) {
        for session in self.sessions.values_mut() {
            if session.state() == SessionState::Connecting && session.endpoint() == endpoint {
                if let Some(completion) = session.on_error(err.clone()) {
                    self.completions.push_back(completion);
                }
            }
        }
    }

    fn waiting_sessions(&self, endpoint: &Endpoint) -> Vec<SessionId> {
        self.sessions
            .values()
            .filter(|x| x.state() == SessionState::Connecting && x.endpoint() == endpoint)
            .map(|x| x.id())
            .collect()
    }
}
