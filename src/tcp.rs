//! Provides the default [`TransportProvider`]: non-blocking TCP, with TLS for `https` endpoints

use std::{
    fmt::Debug,
    io::{Error, ErrorKind, Read, Write},
    net::{Shutdown, SocketAddr, ToSocketAddrs},
    time::Duration,
};

use tcp_stream::{
    HandshakeError, MidHandshakeTlsStream, OwnedIdentity, OwnedTLSConfig, TLSConfig, TcpStream,
};
use tracing::{debug, trace};

use crate::{
    request::Endpoint, DriveOutcome, Publish, PublishOutcome, Receive, ReceiveOutcome, Transport,
    TransportProvider, TransportStatus,
};

/// Internal state machine of a TCP connection
enum TcpConnection {
    Resolving(String, u16),
    Initializing(mio::net::TcpStream, mio::Poll, mio::Events),
    MidTlsHandshake(MidHandshakeTlsStream),
    Connected(TcpStream),
}
impl Debug for TcpConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Resolving(_, _) => "Resolving",
            Self::Initializing(_, _, _) => "Initializing",
            Self::MidTlsHandshake(_) => "MidTlsHandshake",
            Self::Connected(_) => "Connected",
        };
        f.write_str(s)
    }
}

/// A [`Transport`] over a non-blocking [`TcpStream`].
///
/// Connecting happens in stages, each progressed by [`Transport::drive`]: address resolution, a non-blocking `mio` connect,
/// then the TLS handshake when the endpoint is `https`. [`Transport::status`] returns [`TransportStatus::Establishing`] until all of them complete.
///
/// Reads are returned as they arrive from the socket, at most `max_receive_size` bytes at a time.
/// Writes may be partially completed, with the remaining slice returned as [`PublishOutcome::Incomplete`].
pub struct TcpTransport {
    connection: Option<TcpConnection>,
    tls: Option<(String, OwnedTLSConfig)>,
    read_buffer: Vec<u8>,
}
impl TcpTransport {
    /// Start connecting to `endpoint`. Nothing blocks until [`Transport::drive`] is called.
    pub fn connect(
        endpoint: &Endpoint,
        tls_config: TLSConfig<'_, '_, '_>,
        max_receive_size: usize,
    ) -> Self {
        let tls = if endpoint.scheme.is_tls() {
            Some((endpoint.host.clone(), to_owned_config(tls_config)))
        } else {
            None
        };
        Self {
            connection: Some(TcpConnection::Resolving(
                endpoint.host.clone(),
                endpoint.port,
            )),
            tls,
            read_buffer: vec![0; max_receive_size],
        }
    }

    fn addr_to_stream(addrs: Vec<SocketAddr>) -> Result<(mio::net::TcpStream, mio::Poll), Error> {
        let mut err = None;
        for addr in addrs {
            match mio::net::TcpStream::connect(addr) {
                Ok(mut stream) => {
                    let poll = mio::Poll::new()?;
                    poll.registry()
                        .register(&mut stream, mio::Token(0), mio::Interest::WRITABLE)?;
                    return Ok((stream, poll));
                }
                Err(x) => err = Some(x),
            }
        }
        Err(err.unwrap_or_else(|| Error::new(ErrorKind::Other, "could not resolve address")))
    }

    fn connected(&mut self, stream: TcpStream) -> Result<DriveOutcome, Error> {
        stream.set_nonblocking(true)?;
        stream.set_nodelay(true)?;
        match self.tls.take() {
            None => self.connection = Some(TcpConnection::Connected(stream)),
            Some((domain, config)) => match stream.into_tls(&domain, config.as_ref()) {
                Ok(x) => self.connection = Some(TcpConnection::Connected(x)),
                Err(HandshakeError::WouldBlock(x)) => {
                    self.connection = Some(TcpConnection::MidTlsHandshake(x))
                }
                Err(HandshakeError::Failure(err)) => return Err(err),
            },
        }
        Ok(DriveOutcome::Active)
    }

    fn stream(&mut self) -> Result<&mut TcpStream, Error> {
        match self.connection.as_mut() {
            Some(TcpConnection::Connected(x)) => Ok(x),
            Some(TcpConnection::Resolving(_, _)) => Err(Error::new(
                ErrorKind::NotConnected,
                "stream is resolving addresses",
            )),
            Some(TcpConnection::Initializing(_, _, _)) => Err(Error::new(
                ErrorKind::NotConnected,
                "stream is initializing",
            )),
            Some(TcpConnection::MidTlsHandshake(_)) => Err(Error::new(
                ErrorKind::NotConnected,
                "stream is mid-handshake",
            )),
            None => Err(Error::new(ErrorKind::NotConnected, "stream not connected")),
        }
    }
}
impl Transport for TcpTransport {
    fn status(&self) -> TransportStatus {
        match &self.connection {
            None => TransportStatus::Terminated,
            Some(TcpConnection::Connected(_)) => TransportStatus::Established,
            Some(TcpConnection::Resolving(_, _))
            | Some(TcpConnection::Initializing(_, _, _))
            | Some(TcpConnection::MidTlsHandshake(_)) => TransportStatus::Establishing,
        }
    }

    fn close(&mut self) {
        if let Some(connection) = self.connection.take() {
            shutdown(connection);
        }
    }

    fn drive(&mut self) -> Result<DriveOutcome, Error> {
        match self.connection.take() {
            Some(TcpConnection::Resolving(host, port)) => {
                let addrs: Vec<SocketAddr> = (host.as_str(), port).to_socket_addrs()?.collect();
                trace!(%host, port, ?addrs, "resolved");
                let (stream, poll) = Self::addr_to_stream(addrs)?;
                let events = mio::Events::with_capacity(1);
                self.connection = Some(TcpConnection::Initializing(stream, poll, events));
                Ok(DriveOutcome::Active)
            }
            Some(TcpConnection::Initializing(stream, mut poll, mut events)) => {
                poll.poll(&mut events, Some(Duration::ZERO))?;
                if let Ok(Some(err)) | Err(err) = stream.take_error() {
                    return Err(err);
                }
                match stream.peer_addr() {
                    Ok(addr) => {
                        debug!(%addr, tls = self.tls.is_some(), "tcp connected");
                        // SAFETY: the fd is moved out of `stream`, which is never used again
                        let stream: TcpStream = unsafe { into_tcpstream(stream) };
                        self.connected(stream)
                    }
                    Err(err) => {
                        // `NotConnected`/`ENOTCONN` => still connecting
                        // `ECONNREFUSED` => failed
                        if err.kind() == ErrorKind::NotConnected
                            || err.raw_os_error() == Some(libc::EINPROGRESS)
                        {
                            self.connection = Some(TcpConnection::Initializing(stream, poll, events));
                            Ok(DriveOutcome::Idle)
                        } else {
                            Err(err)
                        }
                    }
                }
            }
            Some(TcpConnection::MidTlsHandshake(x)) => match x.handshake() {
                Ok(x) => {
                    debug!("tls handshake complete");
                    self.connection = Some(TcpConnection::Connected(x));
                    Ok(DriveOutcome::Active)
                }
                Err(HandshakeError::WouldBlock(x)) => {
                    self.connection = Some(TcpConnection::MidTlsHandshake(x));
                    Ok(DriveOutcome::Idle)
                }
                Err(HandshakeError::Failure(err)) => Err(err),
            },
            Some(TcpConnection::Connected(x)) => {
                self.connection = Some(TcpConnection::Connected(x));
                Ok(DriveOutcome::Idle)
            }
            None => Ok(DriveOutcome::Idle),
        }
    }
}
impl Publish for TcpTransport {
    fn publish<'a>(&mut self, data: &'a [u8]) -> Result<PublishOutcome<&'a [u8]>, Error> {
        let stream = self.stream()?;
        if data.is_empty() {
            // nothing to write, nothing to do
            return Ok(PublishOutcome::Published);
        }
        let wrote = match stream.write(data) {
            Ok(0) => {
                // per rust docs: A return value of 0 typically means that the underlying object is no longer
                // able to accept bytes and will likely not be able to in the future as well
                self.close();
                return Err(Error::new(
                    ErrorKind::UnexpectedEof,
                    "stream underlying write returned 0 instead of WouldBlock",
                ));
            }
            Ok(x) => x,
            Err(err) => match err.kind() {
                ErrorKind::WouldBlock => 0,
                _ => {
                    self.close();
                    return Err(err);
                }
            },
        };
        if wrote == data.len() {
            Ok(PublishOutcome::Published)
        } else {
            Ok(PublishOutcome::Incomplete(&data[wrote..]))
        }
    }
}
impl Receive for TcpTransport {
    fn receive(&mut self) -> Result<ReceiveOutcome<&[u8]>, Error> {
        let stream = match self.connection.as_mut() {
            Some(TcpConnection::Connected(x)) => x,
            _ => return Err(Error::new(ErrorKind::NotConnected, "stream not connected")),
        };
        let read = match stream.read(self.read_buffer.as_mut_slice()) {
            Ok(x) => x,
            Err(err) => match err.kind() {
                ErrorKind::WouldBlock => return Ok(ReceiveOutcome::Idle),
                _ => {
                    self.close();
                    return Err(err);
                }
            },
        };
        match read {
            0 => Ok(ReceiveOutcome::Ended),
            read => Ok(ReceiveOutcome::Payload(&self.read_buffer[..read])),
        }
    }
}
impl Debug for TcpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpTransport")
            .field("connection", &self.connection)
            .finish()
    }
}
impl Drop for TcpTransport {
    fn drop(&mut self) {
        if let Some(connection) = self.connection.take() {
            shutdown(connection);
        }
    }
}

fn shutdown(mut connection: TcpConnection) {
    match &mut connection {
        TcpConnection::Initializing(stream, _, _) => stream.shutdown(Shutdown::Both).ok(),
        TcpConnection::Connected(stream) => stream.shutdown(Shutdown::Both).ok(),
        TcpConnection::MidTlsHandshake(x) => x.get_mut().shutdown(Shutdown::Both).ok(),
        TcpConnection::Resolving(_, _) => Some(()),
    };
}

fn to_owned_config(config: TLSConfig<'_, '_, '_>) -> OwnedTLSConfig {
    OwnedTLSConfig {
        identity: config.identity.map(|x| OwnedIdentity {
            der: x.der.to_vec(),
            password: x.password.to_owned(),
        }),
        cert_chain: config.cert_chain.map(|x| x.to_owned()),
    }
}

#[cfg(unix)]
unsafe fn into_tcpstream(stream: mio::net::TcpStream) -> TcpStream {
    use std::os::fd::{FromRawFd, IntoRawFd};
    TcpStream::from_raw_fd(stream.into_raw_fd())
}

#[cfg(windows)]
unsafe fn into_tcpstream(stream: mio::net::TcpStream) -> TcpStream {
    use std::os::windows::io::{FromRawSocket, IntoRawSocket};
    TcpStream::from_raw_socket(stream.into_raw_socket())
}

/// Opens a [`TcpTransport`] per endpoint, wrapping it in TLS iff the scheme is `https`.
pub struct TcpTransportProvider {
    tls_config: OwnedTLSConfig,
}
impl Default for TcpTransportProvider {
    fn default() -> Self {
        Self::new()
    }
}
impl TcpTransportProvider {
    pub fn new() -> Self {
        Self {
            tls_config: OwnedTLSConfig::default(),
        }
    }

    /// Identity and root certificates used for `https` endpoints
    pub fn with_tls_config(mut self, tls_config: OwnedTLSConfig) -> Self {
        self.tls_config = tls_config;
        self
    }
}
impl TransportProvider for TcpTransportProvider {
    type Transport = TcpTransport;

    fn open(&mut self, endpoint: &Endpoint, max_receive_size: usize) -> Result<Self::Transport, Error> {
        if max_receive_size == 0 {
            return Err(Error::new(
                ErrorKind::InvalidInput,
                "max receive size must be greater than zero",
            ));
        }
        Ok(TcpTransport::connect(
            endpoint,
            self.tls_config.as_ref(),
            max_receive_size,
        ))
    }
}
impl Debug for TcpTransportProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("TcpTransportProvider")
    }
}

#[cfg(test)]
mod test {
    use std::{io::Read, io::Write, net::TcpListener};

    use super::TcpTransportProvider;
    use crate::{
        request::{Endpoint, Scheme},
        Publish, PublishOutcome, Receive, ReceiveOutcome, Transport, TransportProvider,
        TransportStatus,
    };

    #[test]
    fn test_connect_publish_receive() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let mut provider = TcpTransportProvider::new();
        let mut transport = provider
            .open(&Endpoint::new(Scheme::Http, "127.0.0.1", port), 64)
            .unwrap();
        // resolve and start the non-blocking connect
        transport.drive().unwrap();
        let (mut server, _) = listener.accept().unwrap();

        while transport.status() == TransportStatus::Establishing {
            transport.drive().unwrap();
        }
        assert_eq!(transport.status(), TransportStatus::Established);

        let mut pending: &[u8] = b"ping";
        while let PublishOutcome::Incomplete(rest) = transport.publish(pending).unwrap() {
            pending = rest;
        }
        let mut buf = [0; 4];
        server.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");

        server.write_all(b"pong").unwrap();
        let mut received = Vec::new();
        while received.len() < 4 {
            if let ReceiveOutcome::Payload(x) = transport.receive().unwrap() {
                received.extend_from_slice(x);
            }
        }
        assert_eq!(received, b"pong");

        drop(server);
        loop {
            match transport.receive().unwrap() {
                ReceiveOutcome::Ended => break,
                ReceiveOutcome::Payload(x) => panic!("unexpected {x:?}"),
                ReceiveOutcome::Idle => {}
            }
        }
        transport.close();
        assert_eq!(transport.status(), TransportStatus::Terminated);
    }
}
