//! A threaded front end for the [`Service`].
//!
//! [`HttpService`] moves a [`Service`] onto a dedicated worker thread, which becomes the single serialized work context.
//! Every [`HttpSession`] call hops onto that thread over a channel and blocks until its effect was applied.
//! Completion handlers run on a separate callback thread, so user code never runs inside the engine and may
//! freely start new sessions from within a handler.

use std::{
    thread::{self, JoinHandle},
    time::Duration,
};

use crossbeam_channel::{
    bounded, unbounded, Receiver, RecvTimeoutError, Sender, TryRecvError,
};
use tracing::{debug, warn};
use url::Url;

use crate::{
    error::Error,
    request::Request,
    response::RedirectEntry,
    service::{Service, ServiceConfig},
    session::{Completion, Handler, SessionId, SessionState},
    DriveOutcome, TransportProvider,
};

enum Command {
    Create(Request, Sender<SessionId>),
    Start(SessionId, Handler, Sender<Result<(), Error>>),
    Close(SessionId, Option<Sender<()>>),
    Discard(SessionId),
    Inspect(SessionId, Sender<Option<SessionSnapshot>>),
    Shutdown,
}

/// A point-in-time view of a session, as seen by the worker thread
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub state: SessionState,
    pub url: Url,
    pub redirects: Vec<RedirectEntry>,
}

/// Owns the worker thread that runs a [`Service`] and the thread that runs completion handlers.
///
/// Dropping the [`HttpService`] closes every session, pending handlers receive [`Error::AbnormalTermination`],
/// and all connections are torn down before the worker exits.
pub struct HttpService {
    commands: Sender<Command>,
    worker: Option<JoinHandle<()>>,
    callback: Option<JoinHandle<()>>,
}
impl HttpService {
    /// Create a service over [`crate::tcp::TcpTransportProvider`].
    #[cfg(any(feature = "tcp"))]
    pub fn new(config: ServiceConfig) -> Result<Self, Error> {
        Self::with_provider(crate::tcp::TcpTransportProvider::new(), config)
    }

    /// Create a service over the given [`TransportProvider`].
    pub fn with_provider<P>(provider: P, config: ServiceConfig) -> Result<Self, Error>
    where
        P: TransportProvider + Send + 'static,
    {
        let (commands, command_rx) = unbounded();
        let (completion_tx, completion_rx) = unbounded();

        let callback_commands = commands.clone();
        let callback = thread::Builder::new()
            .name("nbhttp-callback".to_owned())
            .spawn(move || run_callbacks(completion_rx, callback_commands))?;

        let worker = thread::Builder::new()
            .name("nbhttp-worker".to_owned())
            .spawn(move || run_worker(Service::new(provider, config), command_rx, completion_tx))?;

        Ok(Self {
            commands,
            worker: Some(worker),
            callback: Some(callback),
        })
    }

    /// Create a session for `request`. It does nothing until [`HttpSession::start`] is called.
    pub fn session(&self, request: Request) -> Result<HttpSession, Error> {
        let (ack, ack_rx) = bounded(1);
        self.commands
            .send(Command::Create(request, ack))
            .map_err(|_| Error::ServiceShutdown)?;
        let id = ack_rx.recv().map_err(|_| Error::ServiceShutdown)?;
        Ok(HttpSession {
            id,
            commands: self.commands.clone(),
        })
    }
}
impl Drop for HttpService {
    fn drop(&mut self) {
        self.commands.send(Command::Shutdown).ok();
        if let Some(worker) = self.worker.take() {
            worker.join().ok();
        }
        // a handler may drop the service from the callback thread itself
        if let Some(callback) = self.callback.take() {
            if callback.thread().id() != thread::current().id() {
                callback.join().ok();
            }
        }
    }
}

/// A handle to one session running on an [`HttpService`].
///
/// The session stays registered until its handler was dispatched or it is closed.
/// Dropping a handle that was never started discards the session.
pub struct HttpSession {
    id: SessionId,
    commands: Sender<Command>,
}
impl HttpSession {
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Start the session, blocking until it was scheduled on the worker thread.
    ///
    /// `handler` is called exactly once on the callback thread, after which the session is closed.
    pub fn start(&self, handler: Handler) -> Result<(), Error> {
        let (ack, ack_rx) = bounded(1);
        self.commands
            .send(Command::Start(self.id, handler, ack))
            .map_err(|_| Error::ServiceShutdown)?;
        ack_rx.recv().map_err(|_| Error::ServiceShutdown)?
    }

    /// Close the session, blocking until the worker thread applied it.
    ///
    /// A handler that has not fired yet receives [`Error::AbnormalTermination`].
    pub fn close(&self) -> Result<(), Error> {
        let (ack, ack_rx) = bounded(1);
        self.commands
            .send(Command::Close(self.id, Some(ack)))
            .map_err(|_| Error::ServiceShutdown)?;
        ack_rx.recv().map_err(|_| Error::ServiceShutdown)
    }

    /// The session's current state, `None` once it was closed
    pub fn snapshot(&self) -> Result<Option<SessionSnapshot>, Error> {
        let (ack, ack_rx) = bounded(1);
        self.commands
            .send(Command::Inspect(self.id, ack))
            .map_err(|_| Error::ServiceShutdown)?;
        ack_rx.recv().map_err(|_| Error::ServiceShutdown)
    }

    pub fn state(&self) -> Result<SessionState, Error> {
        Ok(self
            .snapshot()?
            .map(|x| x.state)
            .unwrap_or(SessionState::Closed))
    }

    pub fn redirects(&self) -> Result<Vec<RedirectEntry>, Error> {
        Ok(self.snapshot()?.map(|x| x.redirects).unwrap_or_default())
    }
}
impl Drop for HttpSession {
    fn drop(&mut self) {
        self.commands.send(Command::Discard(self.id)).ok();
    }
}

fn run_worker<P: TransportProvider>(
    mut service: Service<P>,
    commands: Receiver<Command>,
    completions: Sender<Completion>,
) {
    debug!("worker started");
    let idle_interval = service.config().idle_interval();
    let mut outcome = DriveOutcome::Active;
    loop {
        match next_command(&commands, outcome, idle_interval) {
            Some(Command::Shutdown) => break,
            Some(command) => handle_command(&mut service, command),
            None => {}
        }
        outcome = service.drive();
        forward_completions(&mut service, &completions);
    }

    debug!(
        sessions = service.session_count(),
        connections = service.connection_count(),
        "worker shutting down"
    );
    service.close_all();
    forward_completions(&mut service, &completions);
    while service.connection_count() > 0 {
        if service.drive() == DriveOutcome::Idle {
            thread::sleep(idle_interval);
        }
    }
    debug!("worker stopped");
}

fn next_command(
    commands: &Receiver<Command>,
    outcome: DriveOutcome,
    idle_interval: Duration,
) -> Option<Command> {
    if outcome.is_active() {
        match commands.try_recv() {
            Ok(x) => Some(x),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(Command::Shutdown),
        }
    } else {
        match commands.recv_timeout(idle_interval) {
            Ok(x) => Some(x),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => Some(Command::Shutdown),
        }
    }
}

fn handle_command<P: TransportProvider>(service: &mut Service<P>, command: Command) {
    match command {
        Command::Create(request, ack) => {
            ack.send(service.create_session(request)).ok();
        }
        Command::Start(id, handler, ack) => {
            ack.send(service.start_session(id, handler)).ok();
        }
        Command::Close(id, ack) => {
            service.close_session(id);
            if let Some(ack) = ack {
                ack.send(()).ok();
            }
        }
        Command::Discard(id) => {
            if service.session(id).map(|x| x.state()) == Some(SessionState::Inited) {
                service.close_session(id);
            }
        }
        Command::Inspect(id, ack) => {
            let snapshot = service.session(id).map(|x| SessionSnapshot {
                state: x.state(),
                url: x.current_request().url().clone(),
                redirects: x.redirects().to_vec(),
            });
            ack.send(snapshot).ok();
        }
        Command::Shutdown => {}
    }
}

fn forward_completions<P: TransportProvider>(
    service: &mut Service<P>,
    completions: &Sender<Completion>,
) {
    for completion in service.take_completions() {
        if let Err(err) = completions.send(completion) {
            warn!(session = %err.0.session(), "callback thread is gone, dropping completion");
        }
    }
}

/// Dispatch every completion, then close its session.
fn run_callbacks(completions: Receiver<Completion>, commands: Sender<Command>) {
    debug!("callback thread started");
    for completion in completions {
        let id = completion.session();
        completion.dispatch();
        commands.send(Command::Close(id, None)).ok();
    }
    debug!("callback thread stopped");
}
