//! Readiness-poller interface.
//!
//! The reactor that watches sockets is an external collaborator: the
//! stream registers its socket and reacts to the events delivered to
//! its [`EventListener`]. A registration failure is always treated as
//! fatal by the caller.

use std::io;
use std::os::fd::RawFd;
use std::sync::Arc;

/// Readiness and timeout events delivered by the poller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEvent {
    /// The socket has bytes to read.
    ReadyToRead,
    /// The socket accepts writes.
    ReadyToWrite,
    /// No read activity within the configured resolution.
    ReadTimeout,
    /// No write activity within the configured resolution.
    WriteTimeout,
}

/// Receiver of poller events for one socket.
pub trait EventListener: Send + Sync {
    /// Called by the reactor thread for each event on the socket.
    fn event(&self, kind: StreamEvent, fd: RawFd);
}

/// The poller surface the stream machinery consumes.
pub trait Poller: Send + Sync {
    /// Registers a socket; events go to `listener` until removal.
    fn add_socket(&self, fd: RawFd, listener: Arc<dyn EventListener>) -> io::Result<()>;

    /// Unregisters a socket. Unknown sockets are ignored.
    fn remove_socket(&self, fd: RawFd) -> io::Result<()>;

    /// Enables or disables read notification. While enabled, a
    /// `ReadTimeout` fires if no data arrives within `timeout_secs`.
    fn enable_read_notification(&self, fd: RawFd, enable: bool, timeout_secs: u64)
        -> io::Result<()>;

    /// Enables or disables write notification. While enabled, a
    /// `WriteTimeout` fires if the socket stays unwritable for
    /// `timeout_secs`.
    fn enable_write_notification(&self, fd: RawFd, enable: bool, timeout_secs: u64)
        -> io::Result<()>;
}
