//! The flat error taxonomy shared by connections, sessions and the service.

use std::{io, sync::Arc};

use crate::response::Response;

/// Every failure a session can report through its completion handler.
///
/// The taxonomy is flat: parsing/framing errors, scheduling errors and status failures all live side by side.
/// [`Error`] is [`Clone`] because a single failed connection attempt is reported to every session that was waiting on it.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// The response header did not terminate before the configured header size cap.
    #[error("response header is too large")]
    HeaderTooLarge,

    /// The stream ended before a complete response header was received.
    #[error("no response header")]
    NoResponseHeader,

    /// The status line or header fields could not be parsed.
    #[error("response header is invalid format")]
    InvalidResponseHeader,

    /// A response that carries a body did not declare a valid `Content-Length`.
    #[error("response header has no content length")]
    ResponseHasNoContentLength,

    /// The server sent bytes while no request was outstanding.
    #[error("server violates protocol")]
    ProtocolViolation,

    /// The session was closed before it produced an outcome.
    #[error("abnormal termination")]
    AbnormalTermination,

    /// The connection ended while a response was still expected.
    #[error("connection closed")]
    ConnectionClosed,

    /// The server answered with a non-2xx, non-redirect status. The fully received response is attached.
    #[error("{} {}", .0.status_code(), .0.status_message())]
    StatusCodeFailure(Box<Response>),

    /// The redirect chain exceeded its bound, or a redirect response had no usable target.
    #[error("too many redirects")]
    TooManyRedirects,

    /// A request body was attached to a method other than POST.
    #[error("non post request has body")]
    NonPostRequestHasBody,

    /// The URL cannot be used for a request: unsupported scheme or missing host.
    #[error("invalid url: {0}")]
    InvalidUrl(String),

    /// The request method is not one of the supported methods.
    #[error("unsupported method: {0}")]
    UnsupportedMethod(String),

    /// The underlying transport failed.
    #[error("transport error: {0}")]
    Transport(Arc<io::Error>),

    /// `start` was called on a session that is not in its initial state.
    #[error("session already started")]
    SessionAlreadyStarted,

    /// The service that owns the session is no longer running.
    #[error("service is shut down")]
    ServiceShutdown,
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Transport(Arc::new(err))
    }
}

impl From<url::ParseError> for Error {
    fn from(err: url::ParseError) -> Self {
        Error::InvalidUrl(err.to_string())
    }
}

impl Error {
    /// The response carried by a [`Error::StatusCodeFailure`].
    pub fn response(&self) -> Option<&Response> {
        match self {
            Error::StatusCodeFailure(response) => Some(response),
            _ => None,
        }
    }
}

#[cfg(test)]
mod test {
    use std::io::{self, ErrorKind};

    use super::Error;
    use crate::{header::Header, response::Response};

    #[test]
    fn test_status_code_failure_display() {
        let response = Response::new(404, "Not Found".into(), Header::new());
        let err = Error::StatusCodeFailure(Box::new(response));
        assert_eq!(err.to_string(), "404 Not Found");
        assert_eq!(err.response().unwrap().status_code(), 404);
    }

    #[test]
    fn test_io_error_is_shared_on_clone() {
        let err: Error = io::Error::new(ErrorKind::ConnectionRefused, "refused").into();
        let cloned = err.clone();
        match (err, cloned) {
            (Error::Transport(a), Error::Transport(b)) => {
                assert!(std::sync::Arc::ptr_eq(&a, &b));
                assert_eq!(a.kind(), ErrorKind::ConnectionRefused);
            }
            _ => panic!("expected transport errors"),
        }
    }
}
