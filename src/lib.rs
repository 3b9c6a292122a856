//! # Description
//!
//! A non-blocking HTTP/1.1 client engine.
//!
//! Requests are carried by [`session::Session`]s, which are scheduled onto pooled keep-alive [`connection::Connection`]s
//! by a [`service::Service`]. The service is a single serialized work context: every state transition happens inside
//! `&mut self` calls and progress is made by calling [`service::Service::drive`], following the same duty-cycle model
//! as the [`Transport`] implementations it consumes.
//!
//! # Transports
//!
//! The engine does not open sockets itself. It consumes a [`TransportProvider`], which opens one [`Transport`] per
//! [`request::Endpoint`]. A [`Transport`] is also [`Publish`] and [`Receive`] over raw bytes, and all of its operations are
//! non-blocking: partial writes are reported as [`PublishOutcome::Incomplete`] and a receive with nothing to return
//! reports [`ReceiveOutcome::Idle`] instead of a [`std::io::ErrorKind::WouldBlock`] error.
//!
//! # Errors
//!
//! An [`Err`] returned by a [`Transport`] always represents a transport-level failure. The engine routes it to the session
//! that depended on the transport as an [`error::Error::Transport`]. Every session's completion handler fires exactly once.
//!
//! # Features
//!
//! - `tcp`: [`tcp::TcpTransportProvider`], non-blocking TCP with TLS for `https`, and `HttpService::new` built on it
//! - `mock`: [`mock::MockProvider`], a scriptable in-memory provider for tests
//!
//! # Examples
//!
//! ## Threaded client
//!
//! ```no_run
//! use std::sync::mpsc;
//! use nbhttp::client::HttpService;
//! use nbhttp::request::Request;
//! use nbhttp::service::ServiceConfig;
//!
//! let service = HttpService::new(ServiceConfig::default()).unwrap();
//! let session = service
//!     .session(Request::get("http://icanhazip.com").unwrap())
//!     .unwrap();
//!
//! let (tx, rx) = mpsc::channel();
//! session
//!     .start(Box::new(move |result| {
//!         tx.send(result).ok();
//!     }))
//!     .unwrap();
//!
//! let response = rx.recv().unwrap().unwrap();
//! println!("Response Body: {}", String::from_utf8_lossy(response.body()));
//! ```
//!
//! ## Driving the engine directly
//!
//! ```no_run
//! use nbhttp::request::Request;
//! use nbhttp::service::{Service, ServiceConfig};
//! use nbhttp::tcp::TcpTransportProvider;
//! use nbhttp::DriveOutcome;
//!
//! let mut service = Service::new(TcpTransportProvider::new(), ServiceConfig::default());
//! let id = service.create_session(Request::get("http://icanhazip.com").unwrap());
//! service
//!     .start_session(id, Box::new(|result| println!("{result:?}")))
//!     .unwrap();
//!
//! while service.session_count() > 0 {
//!     if service.drive() == DriveOutcome::Idle {
//!         std::thread::yield_now();
//!     }
//!     for completion in service.take_completions() {
//!         let id = completion.session();
//!         completion.dispatch();
//!         service.close_session(id);
//!     }
//! }
//! ```

#[cfg(any(feature = "tcp"))]
pub extern crate tcp_stream;

pub mod buf;
pub mod client;
pub mod connection;
pub mod error;
pub mod header;
#[cfg(any(feature = "mock"))]
pub mod mock;
pub mod request;
pub mod response;
pub mod service;
pub mod session;
#[cfg(any(feature = "tcp"))]
pub mod tcp;

use std::{fmt::Debug, io::Error};

use request::Endpoint;

/// An instance of a byte-stream connection to a single [`Endpoint`].
///
/// ## Connecting
///
/// A transport returned by [`TransportProvider::open`] usually starts in [`TransportStatus::Establishing`].
/// The engine calls [`Transport::drive`] until [`Transport::status`] returns [`TransportStatus::Established`], or until an [`Err`] is returned,
/// which fails the connection attempt.
///
/// ## Closing
///
/// [`Transport::close`] requests teardown. Teardown is confirmed once [`Transport::status`] reports [`TransportStatus::Terminated`],
/// which may take additional calls to [`Transport::drive`].
pub trait Transport: Debug {
    /// Check the current transport status.
    fn status(&self) -> TransportStatus;

    /// Request teardown. Subsequent [`Transport::drive`] calls progress it until [`TransportStatus::Terminated`].
    fn close(&mut self);

    /// Drive connecting, handshaking, buffered writes or teardown.
    /// Returns [`DriveOutcome::Active`] if work was done, indicating more work may be pending.
    fn drive(&mut self) -> Result<DriveOutcome, Error>;
}

/// Returned by the [`Transport::status`] function, providing the current connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportStatus {
    /// Connecting or handshaking, will move to `Established` or `Terminated` as [`Transport::drive`] is called.
    Establishing,
    /// Ready to publish and receive
    Established,
    /// Fully torn down
    Terminated,
}

/// Returned by `drive` functions, telling a scheduler whether work was done
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DriveOutcome {
    /// Work was done, `drive` should be called again as soon as possible.
    Active,
    /// No work was done, the caller may yield or back off.
    Idle,
}
impl DriveOutcome {
    pub fn is_active(&self) -> bool {
        *self == DriveOutcome::Active
    }

    /// Combine two outcomes, staying [`DriveOutcome::Active`] if either was.
    pub fn or(self, other: DriveOutcome) -> DriveOutcome {
        if self.is_active() || other.is_active() {
            DriveOutcome::Active
        } else {
            DriveOutcome::Idle
        }
    }
}

/// A [`Transport`] that can receive bytes via polling.
pub trait Receive: Transport {
    /// Attempt to receive bytes.
    ///
    /// The returned slice borrows the transport's internal read buffer and is valid until the next call.
    fn receive(&mut self) -> Result<ReceiveOutcome<&[u8]>, Error>;
}

/// Returned by the [`Receive::receive`] function.
pub enum ReceiveOutcome<T> {
    /// Bytes were received.
    Payload(T),

    /// The peer closed its side of the stream. No more bytes will follow.
    Ended,

    /// No work was done. This is useful to signal to a scheduler or idle strategy that it may be time to yield.
    Idle,
}
impl<T: Debug> Debug for ReceiveOutcome<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReceiveOutcome::Payload(x) => f.write_str(&format!("ReceiveOutcome::Payload({x:?})")),
            ReceiveOutcome::Ended => f.write_str("ReceiveOutcome::Ended"),
            ReceiveOutcome::Idle => f.write_str("ReceiveOutcome::Idle"),
        }
    }
}

/// A [`Transport`] that can publish bytes.
pub trait Publish: Transport {
    /// Write the given `payload` to the transport.
    ///
    /// This will return [`PublishOutcome::Incomplete`] if the payload was not fully accepted,
    /// in which case the returned remainder must be passed back in on a later attempt.
    fn publish<'a>(&mut self, payload: &'a [u8]) -> Result<PublishOutcome<&'a [u8]>, Error>;
}

/// Returned by the [`Publish::publish`] function, providing the outcome of the publish action.
pub enum PublishOutcome<T> {
    /// The publish action completed fully
    Published,

    /// The publish action was not performed or was partially performed.
    ///
    /// The returned remainder must be passed back into the [`Publish::publish`] function for the publish action to complete.
    Incomplete(T),
}
impl<T: Debug> Debug for PublishOutcome<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PublishOutcome::Published => f.write_str("PublishOutcome::Published"),
            PublishOutcome::Incomplete(x) => {
                f.write_str(&format!("PublishOutcome::Incomplete({x:?})"))
            }
        }
    }
}

/// Opens [`Transport`]s toward an [`Endpoint`].
///
/// TLS must be used iff the endpoint scheme is `https`.
/// A single [`Receive::receive`] on the returned transport must not return more than `max_receive_size` bytes.
/// Failures that are only known after connecting are reported by [`Transport::drive`] instead.
pub trait TransportProvider {
    type Transport: Publish + Receive;

    fn open(&mut self, endpoint: &Endpoint, max_receive_size: usize)
        -> Result<Self::Transport, Error>;
}
