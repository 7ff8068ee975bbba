//! Per-socket connection state machine.
//!
//! One `Stream` owns one TCP connection of a logical session: it
//! establishes the connection asynchronously, drives the transport's
//! multi-step handshake, multiplexes outgoing and incoming messages
//! over the socket, and recovers from transient faults with a bounded
//! retry budget. Application threads enqueue messages concurrently;
//! the poller's reactor thread drives all socket I/O.
//!
//! Locking: a single per-stream mutex (`inner`) covers status, both
//! outbound queues, the in-flight entry, the handshake scratch, and
//! the counters. The socket sits behind its own lock so the stream
//! mutex is released across `send`/`recv` syscalls; only the reactor
//! thread reaches the syscall sites. Lock order is `inner` before
//! `socket`/`channel`, never the reverse. Handlers are always invoked
//! with no stream lock held.

use crate::config::LinkConfig;
use crate::error::{Fault, FatalError, LinkError, Progress, SendOutcome, StreamResult};
use crate::inqueue::InQueue;
use crate::message::Message;
use crate::poller::{EventListener, Poller, StreamEvent};
use crate::socket::{Socket, SocketStatus};
use crate::task::{Clock, Task, TaskManager};
use crate::transport::{ChannelData, HandshakeData, TransportHandler};
use crate::url::ServerUrl;
use serde::Serialize;
use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::sync::{Arc, Mutex, Weak};

/// Stream-level connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamStatus {
    /// No connection and no attempt in progress.
    Disconnected,
    /// A connect attempt or handshake is in progress.
    Connecting,
    /// Handshake finished; application traffic flows.
    Connected,
    /// Terminal failure; sticky for the error window.
    Error,
}

/// Receiver of the terminal status of one outbound message.
pub trait OutboundHandler: Send + Sync {
    /// Called exactly once per accepted message: `Ok(())` after the
    /// last byte reached the socket, or one terminal error.
    fn on_status(&self, msg: &Message, status: SendOutcome);
}

/// Traffic counters for one stream.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StreamStats {
    /// Messages fully written to the socket.
    pub messages_sent: u64,
    /// Messages delivered to the incoming queue.
    pub messages_received: u64,
    /// Payload bytes sent.
    pub bytes_sent: u64,
    /// Payload bytes received.
    pub bytes_received: u64,
    /// Connect attempts issued over the stream's lifetime.
    pub connection_attempts: u64,
    /// Faults routed through the fault handler.
    pub faults: u64,
}

/// A queued outgoing message.
struct OutboundEntry {
    msg: Message,
    handler: Option<Arc<dyn OutboundHandler>>,
    expires: u64,
    from_handshake: bool,
}

/// Handshake scratch plus the drain flag: `done` means the transport
/// finished negotiating but handshake bytes are still queued; the
/// stream flips to `Connected` once they are out.
struct HandshakeScratch {
    data: HandshakeData,
    done: bool,
}

struct StreamInner {
    status: StreamStatus,
    out_queue: VecDeque<OutboundEntry>,
    connect_queue: VecDeque<OutboundEntry>,
    current_out: Option<OutboundEntry>,
    handshake: Option<HandshakeScratch>,
    incoming: Option<Message>,
    connection_count: u32,
    connection_init_time: u64,
    last_activity: u64,
    error_time: u64,
    last_error: Option<Fault>,
    stats: StreamStats,
}

/// Handler invocations collected under the stream lock and dispatched
/// after it is released.
#[derive(Default)]
struct Cleanup {
    fault: Option<Fault>,
    fail_inqueue: bool,
    entries: Vec<OutboundEntry>,
}

/// Everything a stream needs at construction.
pub struct StreamParams {
    /// Endpoint the stream connects to.
    pub url: ServerUrl,
    /// Stream number within the session (0 = primary).
    pub stream_num: u16,
    /// The socket the stream owns.
    pub socket: Box<dyn Socket>,
    /// Protocol plug-in.
    pub transport: Arc<dyn TransportHandler>,
    /// Readiness poller.
    pub poller: Arc<dyn Poller>,
    /// Deferred-task scheduler for reconnect attempts.
    pub task_manager: Arc<dyn TaskManager>,
    /// Wall-clock source.
    pub clock: Arc<dyn Clock>,
    /// Session-wide incoming queue.
    pub in_queue: Arc<InQueue>,
    /// Transport-owned per-session state.
    pub channel: Arc<Mutex<ChannelData>>,
    /// Configuration, read once.
    pub config: LinkConfig,
}

/// The per-socket state machine.
pub struct Stream {
    self_ref: Weak<Stream>,
    url: ServerUrl,
    stream_num: u16,
    config: LinkConfig,
    transport: Arc<dyn TransportHandler>,
    poller: Arc<dyn Poller>,
    task_manager: Arc<dyn TaskManager>,
    clock: Arc<dyn Clock>,
    in_queue: Arc<InQueue>,
    channel: Arc<Mutex<ChannelData>>,
    inner: Mutex<StreamInner>,
    socket: Mutex<Box<dyn Socket>>,
}

enum WriteOutcome {
    Complete,
    WouldBlock,
    Failed(io::Error),
}

enum ConnectVerdict {
    AlreadyVerified,
    SockOptFailed,
    ConnectFailed(i32),
    Connected(Option<SocketAddr>, Option<SocketAddr>),
}

impl Stream {
    /// Creates a stream in `Disconnected` state. Nothing touches the
    /// network until [`Stream::connect`] or the first
    /// [`Stream::queue_out`].
    pub fn new(params: StreamParams) -> Arc<Self> {
        let now = params.clock.now();
        Arc::new_cyclic(|weak| Stream {
            self_ref: weak.clone(),
            url: params.url,
            stream_num: params.stream_num,
            config: params.config,
            transport: params.transport,
            poller: params.poller,
            task_manager: params.task_manager,
            clock: params.clock,
            in_queue: params.in_queue,
            channel: params.channel,
            inner: Mutex::new(StreamInner {
                status: StreamStatus::Disconnected,
                out_queue: VecDeque::new(),
                connect_queue: VecDeque::new(),
                current_out: None,
                handshake: None,
                incoming: None,
                connection_count: 0,
                connection_init_time: 0,
                last_activity: now,
                error_time: 0,
                last_error: None,
                stats: StreamStats::default(),
            }),
            socket: Mutex::new(params.socket),
        })
    }

    /// Endpoint this stream talks to.
    pub fn url(&self) -> &ServerUrl {
        &self.url
    }

    /// Stream number within the session.
    pub fn stream_num(&self) -> u16 {
        self.stream_num
    }

    /// Current stream-level status.
    pub fn status(&self) -> StreamStatus {
        self.inner.lock().unwrap().status
    }

    /// Connect attempts in the current error episode; zeroed when a
    /// handshake completes.
    pub fn connection_count(&self) -> u32 {
        self.inner.lock().unwrap().connection_count
    }

    /// Snapshot of the traffic counters.
    pub fn stats(&self) -> StreamStats {
        self.inner.lock().unwrap().stats.clone()
    }

    //--------------------------------------------------------------
    // Enqueue
    //--------------------------------------------------------------

    /// Queues `msg` for sending. If the stream is neither connected
    /// nor connectable the error is returned and the handler is *not*
    /// invoked; once a message is accepted its handler sees exactly
    /// one terminal status.
    pub fn queue_out(
        self: &Arc<Self>,
        msg: Message,
        handler: Option<Arc<dyn OutboundHandler>>,
        timeout_secs: u64,
    ) -> StreamResult<()> {
        let mut cleanup = Cleanup::default();
        let result = {
            let mut inner = self.inner.lock().unwrap();
            self.queue_out_locked(&mut inner, msg, handler, timeout_secs, &mut cleanup)
        };
        self.dispatch_cleanup(cleanup);
        result
    }

    fn queue_out_locked(
        self: &Arc<Self>,
        inner: &mut StreamInner,
        msg: Message,
        handler: Option<Arc<dyn OutboundHandler>>,
        timeout_secs: u64,
        cleanup: &mut Cleanup,
    ) -> StreamResult<()> {
        self.check_connection_locked(inner, cleanup)?;

        // First message of an idle connected stream: arm the write
        // notification so the reactor drives the drain.
        if inner.status == StreamStatus::Connected
            && inner.out_queue.is_empty()
            && inner.current_out.is_none()
        {
            let fd = self.socket.lock().unwrap().fd();
            if self
                .poller
                .enable_write_notification(fd, true, self.config.timeout_resolution_secs)
                .is_err()
            {
                let fault = Fault::Fatal(FatalError::PollerError);
                self.fault_locked(inner, fault.clone(), cleanup);
                return Err(fault);
            }
        }

        inner.out_queue.push_back(OutboundEntry {
            msg,
            handler,
            expires: self.clock.now() + timeout_secs,
            from_handshake: false,
        });
        Ok(())
    }

    /// The gate in front of every enqueue: pass through while the
    /// stream is live, reject while a terminal error is fresh, start a
    /// new connection episode otherwise.
    fn check_connection_locked(
        self: &Arc<Self>,
        inner: &mut StreamInner,
        cleanup: &mut Cleanup,
    ) -> StreamResult<()> {
        match inner.status {
            StreamStatus::Connected | StreamStatus::Connecting => Ok(()),
            StreamStatus::Error => {
                let now = self.clock.now();
                if now.saturating_sub(inner.error_time) <= self.config.stream_error_window_secs {
                    Err(inner
                        .last_error
                        .clone()
                        .unwrap_or_else(|| LinkError::ConnectionError.into()))
                } else {
                    // Fresh episode, fresh retry budget.
                    inner.connection_count = 0;
                    self.connect_locked(inner, cleanup)
                }
            }
            StreamStatus::Disconnected => self.connect_locked(inner, cleanup),
        }
    }

    //--------------------------------------------------------------
    // Connect
    //--------------------------------------------------------------

    /// Starts an asynchronous connect attempt.
    pub fn connect(self: &Arc<Self>) -> StreamResult<()> {
        let mut cleanup = Cleanup::default();
        let result = {
            let mut inner = self.inner.lock().unwrap();
            self.connect_locked(&mut inner, &mut cleanup)
        };
        self.dispatch_cleanup(cleanup);
        result
    }

    fn connect_locked(
        self: &Arc<Self>,
        inner: &mut StreamInner,
        cleanup: &mut Cleanup,
    ) -> StreamResult<()> {
        let now = self.clock.now();
        inner.connection_init_time = now;
        inner.connection_count += 1;
        inner.stats.connection_attempts += 1;
        tracing::debug!(
            host = %self.url,
            stream = self.stream_num,
            attempt = inner.connection_count,
            "initiating connection"
        );

        let fd = {
            let mut socket = self.socket.lock().unwrap();
            let res = socket
                .initialize()
                .and_then(|()| socket.connect(&self.url.host, self.url.port));
            if let Err(e) = res {
                tracing::error!(
                    host = %self.url,
                    stream = self.stream_num,
                    error = %e,
                    "unable to initiate connection"
                );
                let fault = Fault::from_io(&e);
                inner.status = StreamStatus::Error;
                inner.error_time = now;
                inner.last_error = Some(fault.clone());
                return Err(fault);
            }
            socket.fd()
        };
        inner.status = StreamStatus::Connecting;

        // The readiness signal for a completed async connect is the
        // socket turning writable.
        if self.poller.add_socket(fd, self.listener()).is_err() {
            let fault = Fault::Fatal(FatalError::PollerError);
            self.fault_locked(inner, fault.clone(), cleanup);
            return Err(fault);
        }
        if self
            .poller
            .enable_write_notification(fd, true, self.config.timeout_resolution_secs)
            .is_err()
        {
            let fault = Fault::Fatal(FatalError::PollerError);
            self.fault_locked(inner, fault.clone(), cleanup);
            return Err(fault);
        }
        Ok(())
    }

    fn listener(self: &Arc<Self>) -> Arc<dyn EventListener> {
        self.clone()
    }

    //--------------------------------------------------------------
    // Disconnect
    //--------------------------------------------------------------

    /// Tears the connection down. Without `force` this is a no-op
    /// while outbound messages are pending: a concurrent enqueuer has
    /// work for us.
    pub fn disconnect(&self, force: bool) {
        let entries = {
            let mut inner = self.inner.lock().unwrap();
            if !force && (!inner.out_queue.is_empty() || inner.current_out.is_some()) {
                return;
            }
            tracing::debug!(host = %self.url, stream = self.stream_num, "disconnecting");
            {
                let mut socket = self.socket.lock().unwrap();
                let fd = socket.fd();
                if fd >= 0 {
                    let _ = self.poller.remove_socket(fd);
                }
                socket.close();
            }
            inner.connect_queue.clear();
            inner.handshake = None;
            inner.incoming = None;
            inner.status = StreamStatus::Disconnected;
            if let Some(entry) = inner.current_out.take() {
                if !entry.from_handshake {
                    inner.out_queue.push_front(entry);
                }
            }
            inner.out_queue.drain(..).collect::<Vec<_>>()
        };

        let fault: Fault = LinkError::StreamDisconnect.into();
        if self.stream_num == 0 {
            self.in_queue.fail_all_handlers(&fault);
        }
        for entry in entries {
            if let Some(handler) = entry.handler {
                handler.on_status(&entry.msg, Err(fault.clone()));
            }
        }
        let mut channel = self.channel.lock().unwrap();
        self.transport.disconnect(channel.as_mut(), self.stream_num);
    }

    //--------------------------------------------------------------
    // Clock tick
    //--------------------------------------------------------------

    /// Times out queued outbound entries. The in-flight entry is never
    /// timed out: cancelling it mid-write would desynchronize the
    /// wire. The primary stream also drives the incoming queue's
    /// handler timeouts.
    pub fn tick(&self, now: u64) {
        if self.stream_num == 0 {
            self.in_queue.timeout_handlers(now);
        }

        let expired = {
            let mut inner = self.inner.lock().unwrap();
            let mut expired = Vec::new();
            let mut kept = VecDeque::with_capacity(inner.out_queue.len());
            while let Some(entry) = inner.out_queue.pop_front() {
                if entry.expires <= now {
                    expired.push(entry);
                } else {
                    kept.push_back(entry);
                }
            }
            inner.out_queue = kept;
            expired
        };

        for entry in expired {
            tracing::debug!(
                host = %self.url,
                stream = self.stream_num,
                "timing out a queued message"
            );
            if let Some(handler) = entry.handler {
                handler.on_status(&entry.msg, Err(LinkError::SocketTimeout.into()));
            }
        }
    }

    //--------------------------------------------------------------
    // Event dispatch
    //--------------------------------------------------------------

    fn handle_event(self: &Arc<Self>, kind: StreamEvent) {
        let status = {
            let mut inner = self.inner.lock().unwrap();
            if matches!(kind, StreamEvent::ReadyToRead | StreamEvent::ReadyToWrite) {
                inner.last_activity = self.clock.now();
            }
            inner.status
        };

        // Events can race teardown; a stream that is neither connected
        // nor connecting has nothing to do with them.
        if matches!(status, StreamStatus::Disconnected | StreamStatus::Error) {
            tracing::trace!(stream = self.stream_num, ?kind, "ignoring stale socket event");
            return;
        }

        match (kind, status) {
            (StreamEvent::ReadyToRead, StreamStatus::Connected) => self.connected_ready_to_read(),
            (StreamEvent::ReadyToRead, _) => self.connecting_ready_to_read(),
            (StreamEvent::ReadyToWrite, StreamStatus::Connected) => self.connected_ready_to_write(),
            (StreamEvent::ReadyToWrite, _) => self.connecting_ready_to_write(),
            (_, StreamStatus::Connected) => self.handle_ttl_timeout(),
            (_, _) => self.handle_connecting_timeout(),
        }
    }

    //--------------------------------------------------------------
    // Write path
    //--------------------------------------------------------------

    fn connected_ready_to_write(self: &Arc<Self>) {
        if let Err(fault) = self.write_message() {
            self.handle_stream_fault(fault);
        }
    }

    fn connecting_ready_to_write(self: &Arc<Self>) {
        let verdict = {
            let mut socket = self.socket.lock().unwrap();
            if socket.status() != SocketStatus::Connecting {
                ConnectVerdict::AlreadyVerified
            } else {
                match socket.take_error() {
                    Err(_) => ConnectVerdict::SockOptFailed,
                    Ok(Some(errno)) => ConnectVerdict::ConnectFailed(errno),
                    Ok(None) => {
                        socket.set_status(SocketStatus::Connected);
                        ConnectVerdict::Connected(socket.server_address(), socket.sock_name())
                    }
                }
            }
        };

        match verdict {
            ConnectVerdict::AlreadyVerified => {}
            ConnectVerdict::SockOptFailed => {
                tracing::error!(
                    host = %self.url,
                    stream = self.stream_num,
                    "unable to read the status of the connect operation"
                );
                self.handle_stream_fault(FatalError::SocketOptError.into());
                return;
            }
            ConnectVerdict::ConnectFailed(errno) => {
                tracing::error!(
                    host = %self.url,
                    stream = self.stream_num,
                    errno,
                    "unable to connect"
                );
                self.handle_stream_fault(LinkError::ConnectionError.into());
                return;
            }
            ConnectVerdict::Connected(server_addr, client_name) => {
                let mut cleanup = Cleanup::default();
                let proceed = {
                    let mut inner = self.inner.lock().unwrap();
                    self.start_handshake_locked(&mut inner, server_addr, client_name, &mut cleanup)
                };
                self.dispatch_cleanup(cleanup);
                if !proceed {
                    return;
                }
            }
        }

        if let Err(fault) = self.write_message() {
            self.handle_stream_fault(fault);
        }
    }

    /// First handshake steps after the async connect verified. Loops
    /// while the transport asks for an immediate retry, queueing any
    /// outbound it produces.
    fn start_handshake_locked(
        self: &Arc<Self>,
        inner: &mut StreamInner,
        server_addr: Option<SocketAddr>,
        client_name: Option<SocketAddr>,
        cleanup: &mut Cleanup,
    ) -> bool {
        let mut hs = HandshakeData::new(self.url.clone(), self.stream_num);
        hs.server_addr = server_addr;
        hs.client_name = client_name;

        let progress = loop {
            let step = {
                let mut channel = self.channel.lock().unwrap();
                self.transport.handshake(&mut hs, channel.as_mut())
            };
            hs.step += 1;
            let progress = match step {
                Ok(p) => p,
                Err(fault) => {
                    tracing::error!(
                        host = %self.url,
                        stream = self.stream_num,
                        "connection negotiation failed"
                    );
                    self.fault_locked(inner, fault, cleanup);
                    return false;
                }
            };
            if let Some(out) = hs.out_msg.take() {
                inner.connect_queue.push_back(OutboundEntry {
                    msg: out,
                    handler: None,
                    expires: u64::MAX,
                    from_handshake: true,
                });
            }
            if progress != Progress::Retry {
                break progress;
            }
        };

        inner.handshake = Some(HandshakeScratch { data: hs, done: false });

        let fd = self.socket.lock().unwrap().fd();
        if self
            .poller
            .enable_read_notification(fd, true, self.config.timeout_resolution_secs)
            .is_err()
        {
            self.fault_locked(inner, FatalError::PollerError.into(), cleanup);
            return false;
        }

        if progress == Progress::Done {
            if inner.connect_queue.is_empty() && inner.current_out.is_none() {
                if let Err(fault) = self.complete_handshake_locked(inner) {
                    self.fault_locked(inner, fault, cleanup);
                    return false;
                }
            } else if let Some(scratch) = inner.handshake.as_mut() {
                scratch.done = true;
            }
        }
        true
    }

    /// Negotiation finished and every handshake byte is out: flip to
    /// `Connected`, reset the retry budget, free the scratch, and arm
    /// the write notification for whatever the application queued in
    /// the meantime.
    fn complete_handshake_locked(&self, inner: &mut StreamInner) -> StreamResult<()> {
        inner.status = StreamStatus::Connected;
        inner.connection_count = 0;
        inner.handshake = None;

        let fd = self.socket.lock().unwrap().fd();
        let want_write = !inner.out_queue.is_empty() || inner.current_out.is_some();
        self.poller
            .enable_write_notification(fd, want_write, self.config.timeout_resolution_secs)
            .map_err(|_| Fault::from(FatalError::PollerError))?;

        tracing::info!(host = %self.url, stream = self.stream_num, "connected");
        Ok(())
    }

    /// Writes the current message, or picks the next one off the
    /// active queue. One message per readiness event; the syscall runs
    /// with the stream lock released.
    fn write_message(self: &Arc<Self>) -> StreamResult<()> {
        let mut entry = {
            let mut inner = self.inner.lock().unwrap();
            let handshake_phase = inner.status != StreamStatus::Connected;
            match inner.current_out.take() {
                Some(entry) => entry,
                None => {
                    let queue = if handshake_phase {
                        &mut inner.connect_queue
                    } else {
                        &mut inner.out_queue
                    };
                    match queue.pop_front() {
                        Some(mut entry) => {
                            entry.msg.set_cursor(0);
                            entry
                        }
                        None => {
                            // Nothing to write: quiesce the poller.
                            let fd = self.socket.lock().unwrap().fd();
                            if fd >= 0 {
                                self.poller
                                    .enable_write_notification(
                                        fd,
                                        false,
                                        self.config.timeout_resolution_secs,
                                    )
                                    .map_err(|_| Fault::from(FatalError::PollerError))?;
                            }
                            let drained_handshake = handshake_phase
                                && inner.handshake.as_ref().map(|h| h.done).unwrap_or(false);
                            if drained_handshake {
                                self.complete_handshake_locked(&mut inner)?;
                            }
                            return Ok(());
                        }
                    }
                }
            }
        };

        let outcome = {
            let mut socket = self.socket.lock().unwrap();
            loop {
                if entry.msg.remaining() == 0 {
                    break WriteOutcome::Complete;
                }
                match socket.send(entry.msg.bytes_at_cursor()) {
                    Ok(0) => break WriteOutcome::WouldBlock,
                    Ok(n) => entry.msg.advance_cursor(n),
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        break WriteOutcome::WouldBlock
                    }
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => break WriteOutcome::Failed(e),
                }
            }
        };

        match outcome {
            WriteOutcome::WouldBlock => {
                // Cursor keeps its position; the poller calls us again.
                self.inner.lock().unwrap().current_out = Some(entry);
                Ok(())
            }
            WriteOutcome::Failed(e) => {
                entry.msg.set_cursor(0);
                self.inner.lock().unwrap().current_out = Some(entry);
                Err(Fault::from_io(&e))
            }
            WriteOutcome::Complete => {
                tracing::trace!(
                    host = %self.url,
                    stream = self.stream_num,
                    size = entry.msg.len(),
                    "wrote a message"
                );
                if let Some(handler) = entry.handler.as_ref() {
                    handler.on_status(&entry.msg, Ok(()));
                }

                let mut inner = self.inner.lock().unwrap();
                inner.stats.messages_sent += 1;
                inner.stats.bytes_sent += entry.msg.len() as u64;

                let handshake_phase = inner.status != StreamStatus::Connected;
                let queue_empty = if handshake_phase {
                    inner.connect_queue.is_empty()
                } else {
                    inner.out_queue.is_empty()
                };
                if queue_empty {
                    let fd = self.socket.lock().unwrap().fd();
                    if fd >= 0 {
                        self.poller
                            .enable_write_notification(
                                fd,
                                false,
                                self.config.timeout_resolution_secs,
                            )
                            .map_err(|_| Fault::from(FatalError::PollerError))?;
                    }
                    let drained_handshake = handshake_phase
                        && inner.handshake.as_ref().map(|h| h.done).unwrap_or(false);
                    if drained_handshake {
                        self.complete_handshake_locked(&mut inner)?;
                    }
                }
                Ok(())
            }
        }
    }

    //--------------------------------------------------------------
    // Read path
    //--------------------------------------------------------------

    fn connected_ready_to_read(self: &Arc<Self>) {
        match self.read_message() {
            Ok(Some(msg)) => {
                {
                    let mut inner = self.inner.lock().unwrap();
                    inner.stats.messages_received += 1;
                    inner.stats.bytes_received += msg.len() as u64;
                }
                tracing::trace!(
                    host = %self.url,
                    stream = self.stream_num,
                    size = msg.len(),
                    "got a message"
                );
                self.in_queue.add_message(msg);
            }
            Ok(None) => {}
            Err(fault) => self.handle_stream_fault(fault),
        }
    }

    fn connecting_ready_to_read(self: &Arc<Self>) {
        match self.read_message() {
            Ok(Some(msg)) => {
                let mut cleanup = Cleanup::default();
                {
                    let mut inner = self.inner.lock().unwrap();
                    self.handshake_step_locked(&mut inner, msg, &mut cleanup);
                }
                self.dispatch_cleanup(cleanup);
            }
            Ok(None) => {}
            Err(fault) => self.handle_stream_fault(fault),
        }
    }

    /// Feeds one framed inbound message to the transport's handshake
    /// step and routes whatever comes back.
    fn handshake_step_locked(
        self: &Arc<Self>,
        inner: &mut StreamInner,
        msg: Message,
        cleanup: &mut Cleanup,
    ) {
        let Some(mut scratch) = inner.handshake.take() else {
            self.fault_locked(
                inner,
                LinkError::InvalidMessage("frame outside negotiation".into()).into(),
                cleanup,
            );
            return;
        };

        scratch.data.in_msg = Some(msg);
        let step = {
            let mut channel = self.channel.lock().unwrap();
            self.transport.handshake(&mut scratch.data, channel.as_mut())
        };
        scratch.data.step += 1;
        scratch.data.in_msg = None;

        let progress = match step {
            Ok(p) => p,
            Err(fault) => {
                tracing::error!(
                    host = %self.url,
                    stream = self.stream_num,
                    "connection negotiation failed"
                );
                self.fault_locked(inner, fault, cleanup);
                return;
            }
        };

        if let Some(out) = scratch.data.out_msg.take() {
            inner.connect_queue.push_back(OutboundEntry {
                msg: out,
                handler: None,
                expires: u64::MAX,
                from_handshake: true,
            });
            let fd = self.socket.lock().unwrap().fd();
            if self
                .poller
                .enable_write_notification(fd, true, self.config.timeout_resolution_secs)
                .is_err()
            {
                self.fault_locked(inner, FatalError::PollerError.into(), cleanup);
                return;
            }
        }

        if progress == Progress::Done {
            if inner.connect_queue.is_empty() && inner.current_out.is_none() {
                if let Err(fault) = self.complete_handshake_locked(inner) {
                    self.fault_locked(inner, fault, cleanup);
                }
                return;
            }
            scratch.done = true;
        }
        inner.handshake = Some(scratch);
    }

    /// Reads bytes into the partial inbound message, allocating it
    /// lazily. `Some` means a complete frame; `None` means more bytes
    /// are needed. The stream lock is not held across the syscall.
    fn read_message(&self) -> StreamResult<Option<Message>> {
        let mut msg = {
            let mut inner = self.inner.lock().unwrap();
            inner.incoming.take().unwrap_or_default()
        };

        let result = {
            let mut socket = self.socket.lock().unwrap();
            self.transport.get_message(&mut msg, &mut **socket)
        };

        match result {
            Ok(Progress::Done) => Ok(Some(msg)),
            Ok(_) => {
                self.inner.lock().unwrap().incoming = Some(msg);
                Ok(None)
            }
            Err(fault) => Err(fault),
        }
    }

    //--------------------------------------------------------------
    // Timeouts
    //--------------------------------------------------------------

    /// Read/write timeout while connected: a legitimate idle period
    /// unless the transport says the stream TTL elapsed.
    fn handle_ttl_timeout(self: &Arc<Self>) {
        let idle = {
            let inner = self.inner.lock().unwrap();
            self.clock.now().saturating_sub(inner.last_activity)
        };
        let elapsed = {
            let mut channel = self.channel.lock().unwrap();
            self.transport.is_stream_ttl_elapsed(idle, channel.as_mut())
        };
        if elapsed {
            tracing::debug!(
                host = %self.url,
                stream = self.stream_num,
                idle_secs = idle,
                "stream ttl elapsed"
            );
            self.disconnect(false);
        }
    }

    /// Timeout while connecting: one failed attempt once the
    /// connection window is exhausted.
    fn handle_connecting_timeout(self: &Arc<Self>) {
        let now = self.clock.now();
        let mut cleanup = Cleanup::default();
        {
            let mut inner = self.inner.lock().unwrap();
            if now >= inner.connection_init_time + self.config.connection_window_secs {
                // Handshake entries are transport-synthesized and have
                // no user handlers; they are simply dropped.
                inner.connect_queue.clear();
                self.fault_locked(&mut inner, LinkError::ConnectionError.into(), &mut cleanup);
            }
        }
        self.dispatch_cleanup(cleanup);
    }

    //--------------------------------------------------------------
    // Fault handling
    //--------------------------------------------------------------

    /// Public choke point for stream faults.
    fn handle_stream_fault(self: &Arc<Self>, fault: Fault) {
        let mut cleanup = Cleanup::default();
        {
            let mut inner = self.inner.lock().unwrap();
            self.fault_locked(&mut inner, fault, &mut cleanup);
        }
        self.dispatch_cleanup(cleanup);
    }

    /// Cleans up the socket and decides between reconnecting now,
    /// reconnecting at the edge of the connection window, and giving
    /// up. Handler invocations are deferred into `cleanup`.
    fn fault_locked(
        self: &Arc<Self>,
        inner: &mut StreamInner,
        fault: Fault,
        cleanup: &mut Cleanup,
    ) {
        let now = self.clock.now();
        tracing::error!(
            host = %self.url,
            stream = self.stream_num,
            error = %fault,
            "stream fault, cleaning up"
        );

        {
            let mut socket = self.socket.lock().unwrap();
            let fd = socket.fd();
            if fd >= 0 {
                let _ = self.poller.remove_socket(fd);
            }
            socket.close();
        }

        inner.incoming = None;
        inner.handshake = None;
        inner.connect_queue.clear();
        inner.stats.faults += 1;

        // The in-flight application message goes back to the head of
        // the queue; a reconnect re-sends it from byte zero.
        if let Some(entry) = inner.current_out.take() {
            if !entry.from_handshake {
                inner.out_queue.push_front(entry);
            }
        }

        {
            let mut channel = self.channel.lock().unwrap();
            self.transport.disconnect(channel.as_mut(), self.stream_num);
        }

        if !fault.is_fatal() && inner.connection_count < self.config.connection_retry {
            inner.status = StreamStatus::Connecting;
            let retry_at = inner.connection_init_time + self.config.connection_window_secs;
            if retry_at <= now {
                tracing::info!(
                    host = %self.url,
                    stream = self.stream_num,
                    "attempting reconnection now"
                );
                let _ = self.connect_locked(inner, cleanup);
            } else {
                tracing::info!(
                    host = %self.url,
                    stream = self.stream_num,
                    in_secs = retry_at - now,
                    "scheduling reconnection"
                );
                let task = Arc::new(ConnectorTask { stream: Arc::downgrade(self) });
                self.task_manager.register_task(task, retry_at);
            }
            return;
        }

        tracing::error!(
            host = %self.url,
            stream = self.stream_num,
            "unrecoverable fault, failing the stream"
        );
        inner.status = StreamStatus::Error;
        inner.error_time = now;
        inner.last_error = Some(fault.clone());
        cleanup.fail_inqueue = self.stream_num == 0;
        cleanup.entries.extend(inner.out_queue.drain(..));
        cleanup.fault = Some(fault);
    }

    /// Runs the handler invocations collected under the lock.
    fn dispatch_cleanup(&self, cleanup: Cleanup) {
        let Some(fault) = cleanup.fault else { return };
        if cleanup.fail_inqueue {
            self.in_queue.fail_all_handlers(&fault);
        }
        for entry in cleanup.entries {
            if let Some(handler) = entry.handler {
                handler.on_status(&entry.msg, Err(fault.clone()));
            }
        }
    }
}

impl EventListener for Stream {
    fn event(&self, kind: StreamEvent, _fd: RawFd) {
        if let Some(this) = self.self_ref.upgrade() {
            this.handle_event(kind);
        }
    }
}

/// Deferred one-shot that re-enters `Stream::connect` at the edge of
/// the connection window. Holds only a weak back-reference: the task
/// manager must never keep a dead stream alive.
struct ConnectorTask {
    stream: Weak<Stream>,
}

impl Task for ConnectorTask {
    fn run(&self, _now: u64) -> Option<u64> {
        if let Some(stream) = self.stream.upgrade() {
            let _ = stream.connect();
        }
        None
    }
}
