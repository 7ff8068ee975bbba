//! Socket abstraction consumed by the stream machinery.
//!
//! The stream never talks to the OS directly; it drives a [`Socket`]
//! trait object. The production implementation, [`TcpSocket`], wraps a
//! non-blocking `socket2` socket. Tests substitute scripted fakes.

use socket2::{Domain, Protocol, Socket as Socket2, Type};
use std::io::{self, Read, Write};
use std::net::{SocketAddr, ToSocketAddrs};
use std::os::fd::{AsRawFd, RawFd};

/// Socket-layer connection state, distinct from the stream-level state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketStatus {
    /// No connection in progress.
    Disconnected,
    /// A non-blocking connect has been issued and not yet verified.
    Connecting,
    /// The connect has been verified successful.
    Connected,
}

/// The socket surface the stream machinery consumes.
pub trait Socket: Send {
    /// Prepares the socket for a fresh connection attempt, discarding
    /// any previous one.
    fn initialize(&mut self) -> io::Result<()>;

    /// Issues a non-blocking connect to `host:port`. Returns once the
    /// connect is in flight; completion is signalled by the first
    /// write-readiness event and verified with [`Socket::take_error`].
    fn connect(&mut self, host: &str, port: u16) -> io::Result<()>;

    /// Closes the socket. Safe to call on an already-closed socket.
    fn close(&mut self);

    /// File descriptor, for poller registration. -1 when closed.
    fn fd(&self) -> RawFd;

    /// Fetches and clears the pending socket error (`SO_ERROR`).
    /// `Ok(None)` means the async connect succeeded.
    fn take_error(&self) -> io::Result<Option<i32>>;

    /// Socket-layer status.
    fn status(&self) -> SocketStatus;

    /// Sets the socket-layer status.
    fn set_status(&mut self, status: SocketStatus);

    /// Writes as many bytes as the socket accepts.
    fn send(&mut self, buf: &[u8]) -> io::Result<usize>;

    /// Reads as many bytes as are available.
    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Address of the peer the socket is connected (or connecting) to.
    fn server_address(&self) -> Option<SocketAddr>;

    /// Local address of the socket.
    fn sock_name(&self) -> Option<SocketAddr>;

    /// Blocks until the socket is writable. Used only by the
    /// synchronous sub-stream establishment path; the reactor never
    /// blocks here.
    fn wait_writable(&mut self, _timeout_secs: u64) -> io::Result<()> {
        Ok(())
    }

    /// Blocks until the socket is readable. Same caveat as
    /// [`Socket::wait_writable`].
    fn wait_readable(&mut self, _timeout_secs: u64) -> io::Result<()> {
        Ok(())
    }

    /// Blocks until the pending non-blocking connect resolves, then
    /// verifies it.
    fn wait_connected(&mut self, timeout_secs: u64) -> io::Result<()> {
        self.wait_writable(timeout_secs)?;
        match self.take_error()? {
            Some(errno) => Err(io::Error::from_raw_os_error(errno)),
            None => {
                self.set_status(SocketStatus::Connected);
                Ok(())
            }
        }
    }
}

/// Mints sockets for additional sub-streams of a physical connection.
pub trait SocketFactory: Send + Sync {
    /// Creates a fresh, uninitialized socket.
    fn create(&self) -> Box<dyn Socket>;
}

/// Non-blocking TCP socket backed by `socket2`.
pub struct TcpSocket {
    inner: Option<Socket2>,
    status: SocketStatus,
    peer: Option<SocketAddr>,
}

impl TcpSocket {
    /// Creates a closed socket.
    pub fn new() -> Self {
        Self { inner: None, status: SocketStatus::Disconnected, peer: None }
    }

    fn resolve(host: &str, port: u16) -> io::Result<SocketAddr> {
        (host, port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "host resolved to no address"))
    }
}

impl Default for TcpSocket {
    fn default() -> Self {
        Self::new()
    }
}

impl Socket for TcpSocket {
    fn initialize(&mut self) -> io::Result<()> {
        self.inner = None;
        self.peer = None;
        self.status = SocketStatus::Disconnected;
        Ok(())
    }

    fn connect(&mut self, host: &str, port: u16) -> io::Result<()> {
        let addr = Self::resolve(host, port)?;
        let domain = match addr {
            SocketAddr::V4(_) => Domain::IPV4,
            SocketAddr::V6(_) => Domain::IPV6,
        };
        let sock = Socket2::new(domain, Type::STREAM, Some(Protocol::TCP))?;
        sock.set_nonblocking(true)?;
        sock.set_nodelay(true)?;

        match sock.connect(&addr.into()) {
            Ok(()) => {}
            Err(e)
                if e.raw_os_error() == Some(libc::EINPROGRESS)
                    || e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => return Err(e),
        }

        self.inner = Some(sock);
        self.peer = Some(addr);
        self.status = SocketStatus::Connecting;
        Ok(())
    }

    fn close(&mut self) {
        self.inner = None;
        self.status = SocketStatus::Disconnected;
    }

    fn fd(&self) -> RawFd {
        self.inner.as_ref().map(|s| s.as_raw_fd()).unwrap_or(-1)
    }

    fn take_error(&self) -> io::Result<Option<i32>> {
        let sock = self
            .inner
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "socket closed"))?;
        Ok(sock.take_error()?.and_then(|e| e.raw_os_error()))
    }

    fn status(&self) -> SocketStatus {
        self.status
    }

    fn set_status(&mut self, status: SocketStatus) {
        self.status = status;
    }

    fn send(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.inner.as_ref() {
            Some(mut sock) => sock.write(buf),
            None => Err(io::Error::new(io::ErrorKind::NotConnected, "socket closed")),
        }
    }

    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.inner.as_ref() {
            Some(mut sock) => sock.read(buf),
            None => Err(io::Error::new(io::ErrorKind::NotConnected, "socket closed")),
        }
    }

    fn server_address(&self) -> Option<SocketAddr> {
        self.peer
    }

    fn sock_name(&self) -> Option<SocketAddr> {
        self.inner
            .as_ref()
            .and_then(|s| s.local_addr().ok())
            .and_then(|a| a.as_socket())
    }

    fn wait_writable(&mut self, timeout_secs: u64) -> io::Result<()> {
        poll_ready(self.fd(), libc::POLLOUT, timeout_secs)
    }

    fn wait_readable(&mut self, timeout_secs: u64) -> io::Result<()> {
        poll_ready(self.fd(), libc::POLLIN, timeout_secs)
    }
}

fn poll_ready(fd: RawFd, events: libc::c_short, timeout_secs: u64) -> io::Result<()> {
    if fd < 0 {
        return Err(io::Error::new(io::ErrorKind::NotConnected, "socket closed"));
    }
    let mut pfd = libc::pollfd { fd, events, revents: 0 };
    let timeout_ms = i32::try_from(timeout_secs.saturating_mul(1000)).unwrap_or(i32::MAX);
    loop {
        let rc = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
        if rc > 0 {
            return Ok(());
        }
        if rc == 0 {
            return Err(io::Error::from(io::ErrorKind::TimedOut));
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

/// Factory producing [`TcpSocket`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpSocketFactory;

impl SocketFactory for TcpSocketFactory {
    fn create(&self) -> Box<dyn Socket> {
        Box::new(TcpSocket::new())
    }
}
