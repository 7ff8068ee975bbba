//! Scripted collaborators for driving a stream end to end: a manual
//! clock, a recording poller, a capturing task manager, a socket whose
//! send/recv/SO_ERROR behavior is scripted per call, and a transport
//! with scripted handshake steps and length-scripted framing.

#![allow(dead_code)]

use std::any::Any;
use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use xrdlink::{
    ChannelData, Clock, EventListener, Fault, HandshakeData, InQueue, LinkConfig, LinkError,
    Message, OutboundHandler, Poller, Progress, SendOutcome, Socket, SocketStatus, Stream,
    StreamParams, StreamResult, Task, TaskManager, TransportHandler,
};

pub const TEST_FD: RawFd = 21;

/// Routes the crate's tracing output into the per-test capture so
/// failures show the stream's own log lines. Only the first call
/// installs the subscriber; later calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::TRACE)
        .try_init();
}

//----------------------------------------------------------------------
// Clock
//----------------------------------------------------------------------

pub struct ManualClock(AtomicU64);

impl ManualClock {
    pub fn new(start: u64) -> Arc<Self> {
        Arc::new(Self(AtomicU64::new(start)))
    }

    pub fn advance(&self, secs: u64) {
        self.0.fetch_add(secs, Ordering::SeqCst);
    }

    pub fn set(&self, secs: u64) {
        self.0.store(secs, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }
}

//----------------------------------------------------------------------
// Poller
//----------------------------------------------------------------------

#[derive(Default)]
pub struct PollerState {
    pub registered: Vec<RawFd>,
    pub read_on: bool,
    pub write_on: bool,
    pub fail_add: bool,
    pub fail_enable: bool,
}

#[derive(Default)]
pub struct MockPoller {
    pub state: Mutex<PollerState>,
}

impl MockPoller {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn write_enabled(&self) -> bool {
        self.state.lock().unwrap().write_on
    }

    pub fn read_enabled(&self) -> bool {
        self.state.lock().unwrap().read_on
    }

    pub fn registered(&self) -> Vec<RawFd> {
        self.state.lock().unwrap().registered.clone()
    }
}

impl Poller for MockPoller {
    fn add_socket(&self, fd: RawFd, _listener: Arc<dyn EventListener>) -> io::Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.fail_add {
            return Err(io::Error::from(io::ErrorKind::Other));
        }
        state.registered.push(fd);
        Ok(())
    }

    fn remove_socket(&self, fd: RawFd) -> io::Result<()> {
        let mut state = self.state.lock().unwrap();
        state.registered.retain(|&f| f != fd);
        state.read_on = false;
        state.write_on = false;
        Ok(())
    }

    fn enable_read_notification(
        &self,
        _fd: RawFd,
        enable: bool,
        _timeout_secs: u64,
    ) -> io::Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.fail_enable {
            return Err(io::Error::from(io::ErrorKind::Other));
        }
        state.read_on = enable;
        Ok(())
    }

    fn enable_write_notification(
        &self,
        _fd: RawFd,
        enable: bool,
        _timeout_secs: u64,
    ) -> io::Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.fail_enable {
            return Err(io::Error::from(io::ErrorKind::Other));
        }
        state.write_on = enable;
        Ok(())
    }
}

//----------------------------------------------------------------------
// Task manager
//----------------------------------------------------------------------

#[derive(Default)]
pub struct MockTaskManager {
    tasks: Mutex<Vec<(Arc<dyn Task>, u64)>>,
    pub fire_log: Mutex<Vec<u64>>,
}

impl MockTaskManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Runs every task whose fire time has arrived, like the real
    /// manager's clock loop would.
    pub fn run_due(&self, now: u64) {
        let due: Vec<Arc<dyn Task>> = {
            let mut tasks = self.tasks.lock().unwrap();
            let mut due = Vec::new();
            tasks.retain(|(task, fire_at)| {
                if *fire_at <= now {
                    due.push(task.clone());
                    false
                } else {
                    true
                }
            });
            due
        };
        for task in due {
            task.run(now);
        }
    }

    pub fn fire_times(&self) -> Vec<u64> {
        self.fire_log.lock().unwrap().clone()
    }

    pub fn pending(&self) -> usize {
        self.tasks.lock().unwrap().len()
    }
}

impl TaskManager for MockTaskManager {
    fn register_task(&self, task: Arc<dyn Task>, fire_at: u64) {
        self.fire_log.lock().unwrap().push(fire_at);
        self.tasks.lock().unwrap().push((task, fire_at));
    }
}

//----------------------------------------------------------------------
// Socket
//----------------------------------------------------------------------

/// One scripted outcome for a `send` call.
pub enum SendStep {
    /// Accept at most this many bytes.
    Accept(usize),
    /// Report EAGAIN.
    WouldBlock,
    /// Fail with this errno.
    Fail(i32),
}

#[derive(Default)]
pub struct SocketScript {
    pub sent: Vec<u8>,
    pub send_steps: VecDeque<SendStep>,
    pub recv_chunks: VecDeque<Vec<u8>>,
    pub so_errors: VecDeque<Option<i32>>,
    pub fail_take_error: bool,
    /// With no scripted step: block instead of accepting everything.
    pub block_when_empty: bool,
    pub connects: usize,
}

/// Socket driven by a shared script so tests keep a handle after the
/// stream takes ownership.
pub struct ScriptedSocket {
    pub script: Arc<Mutex<SocketScript>>,
    status: SocketStatus,
}

impl ScriptedSocket {
    pub fn new(script: Arc<Mutex<SocketScript>>) -> Box<Self> {
        Box::new(Self { script, status: SocketStatus::Disconnected })
    }
}

impl Socket for ScriptedSocket {
    fn initialize(&mut self) -> io::Result<()> {
        self.status = SocketStatus::Disconnected;
        Ok(())
    }

    fn connect(&mut self, _host: &str, _port: u16) -> io::Result<()> {
        self.script.lock().unwrap().connects += 1;
        self.status = SocketStatus::Connecting;
        Ok(())
    }

    fn close(&mut self) {
        self.status = SocketStatus::Disconnected;
    }

    fn fd(&self) -> RawFd {
        TEST_FD
    }

    fn take_error(&self) -> io::Result<Option<i32>> {
        let mut script = self.script.lock().unwrap();
        if script.fail_take_error {
            return Err(io::Error::from(io::ErrorKind::Other));
        }
        Ok(script.so_errors.pop_front().unwrap_or(None))
    }

    fn status(&self) -> SocketStatus {
        self.status
    }

    fn set_status(&mut self, status: SocketStatus) {
        self.status = status;
    }

    fn send(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut script = self.script.lock().unwrap();
        match script.send_steps.pop_front() {
            Some(SendStep::Accept(limit)) => {
                let n = limit.min(buf.len());
                script.sent.extend_from_slice(&buf[..n]);
                Ok(n)
            }
            Some(SendStep::WouldBlock) => Err(io::Error::from(io::ErrorKind::WouldBlock)),
            Some(SendStep::Fail(errno)) => Err(io::Error::from_raw_os_error(errno)),
            None => {
                if script.block_when_empty {
                    Err(io::Error::from(io::ErrorKind::WouldBlock))
                } else {
                    script.sent.extend_from_slice(buf);
                    Ok(buf.len())
                }
            }
        }
    }

    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut script = self.script.lock().unwrap();
        let Some(chunk) = script.recv_chunks.front_mut() else {
            return Err(io::Error::from(io::ErrorKind::WouldBlock));
        };
        let n = chunk.len().min(buf.len());
        buf[..n].copy_from_slice(&chunk[..n]);
        chunk.drain(..n);
        if chunk.is_empty() {
            script.recv_chunks.pop_front();
        }
        Ok(n)
    }

    fn server_address(&self) -> Option<SocketAddr> {
        None
    }

    fn sock_name(&self) -> Option<SocketAddr> {
        None
    }
}

//----------------------------------------------------------------------
// Transport
//----------------------------------------------------------------------

/// One scripted handshake step, indexed by `hs.step`.
pub enum HsStep {
    /// Return this progress, optionally emitting an outbound message
    /// of the given size.
    Step(Progress, Option<usize>),
    /// Fail the negotiation.
    Fail,
}

/// Transport with scripted negotiation and size-scripted framing: each
/// expected inbound frame's total size is taken from `frame_sizes`.
pub struct MockTransport {
    pub steps: Mutex<Vec<HsStep>>,
    pub frame_sizes: Mutex<VecDeque<usize>>,
    pub ttl_elapsed: AtomicBool,
    pub disconnects: Mutex<Vec<u16>>,
}

impl MockTransport {
    pub fn new(steps: Vec<HsStep>) -> Arc<Self> {
        Arc::new(Self {
            steps: Mutex::new(steps),
            frame_sizes: Mutex::new(VecDeque::new()),
            ttl_elapsed: AtomicBool::new(false),
            disconnects: Mutex::new(Vec::new()),
        })
    }

    pub fn expect_frame(&self, size: usize) {
        self.frame_sizes.lock().unwrap().push_back(size);
    }
}

impl TransportHandler for MockTransport {
    fn handshake(
        &self,
        hs: &mut HandshakeData,
        _channel: &mut (dyn Any + Send),
    ) -> StreamResult<Progress> {
        let steps = self.steps.lock().unwrap();
        match steps.get(hs.step as usize) {
            Some(HsStep::Step(progress, out)) => {
                if let Some(size) = out {
                    hs.out_msg = Some(Message::from_bytes(vec![0xA5; *size]));
                }
                Ok(*progress)
            }
            Some(HsStep::Fail) | None => {
                Err(LinkError::HandshakeFailed("scripted failure".into()).into())
            }
        }
    }

    fn get_message(&self, msg: &mut Message, socket: &mut dyn Socket) -> StreamResult<Progress> {
        if msg.is_empty() {
            let size = self
                .frame_sizes
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| Fault::from(LinkError::InvalidMessage("unexpected frame".into())))?;
            msg.grow_to(size);
        }
        while msg.remaining() > 0 {
            match socket.recv(msg.bytes_at_cursor_mut()) {
                Ok(0) => return Err(LinkError::StreamDisconnect.into()),
                Ok(n) => msg.advance_cursor(n),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(Progress::Continue)
                }
                Err(ref e) => return Err(Fault::from_io(e)),
            }
        }
        Ok(Progress::Done)
    }

    fn disconnect(&self, _channel: &mut (dyn Any + Send), stream_num: u16) {
        self.disconnects.lock().unwrap().push(stream_num);
    }

    fn is_stream_ttl_elapsed(&self, _idle_secs: u64, _channel: &mut (dyn Any + Send)) -> bool {
        self.ttl_elapsed.load(Ordering::SeqCst)
    }
}

//----------------------------------------------------------------------
// Outbound handler
//----------------------------------------------------------------------

#[derive(Default)]
pub struct CollectingHandler {
    pub outcomes: Mutex<Vec<SendOutcome>>,
}

impl CollectingHandler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn outcomes(&self) -> Vec<SendOutcome> {
        self.outcomes.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.outcomes.lock().unwrap().len()
    }
}

impl OutboundHandler for CollectingHandler {
    fn on_status(&self, _msg: &Message, status: SendOutcome) {
        self.outcomes.lock().unwrap().push(status);
    }
}

//----------------------------------------------------------------------
// Harness
//----------------------------------------------------------------------

pub struct Harness {
    pub stream: Arc<Stream>,
    pub poller: Arc<MockPoller>,
    pub clock: Arc<ManualClock>,
    pub tasks: Arc<MockTaskManager>,
    pub socket: Arc<Mutex<SocketScript>>,
    pub transport: Arc<MockTransport>,
    pub in_queue: Arc<InQueue>,
}

impl Harness {
    pub fn new(config: LinkConfig, steps: Vec<HsStep>) -> Self {
        init_tracing();
        let poller = MockPoller::new();
        let clock = ManualClock::new(1_000);
        let tasks = MockTaskManager::new();
        let script = Arc::new(Mutex::new(SocketScript::default()));
        let transport = MockTransport::new(steps);
        let in_queue = Arc::new(InQueue::new());

        let stream = Stream::new(StreamParams {
            url: xrdlink::ServerUrl::new("data.example.org", 1094),
            stream_num: 0,
            socket: ScriptedSocket::new(script.clone()),
            transport: transport.clone(),
            poller: poller.clone(),
            task_manager: tasks.clone(),
            clock: clock.clone(),
            in_queue: in_queue.clone(),
            channel: Arc::new(Mutex::new(Box::new(()) as ChannelData)),
            config,
        });

        Harness { stream, poller, clock, tasks, socket: script, transport, in_queue }
    }

    /// Handshake finishing on the first step with nothing to send.
    pub fn instant(config: LinkConfig) -> Self {
        Self::new(config, vec![HsStep::Step(Progress::Done, None)])
    }

    pub fn ready_to_write(&self) {
        self.stream.event(xrdlink::StreamEvent::ReadyToWrite, TEST_FD);
    }

    pub fn ready_to_read(&self) {
        self.stream.event(xrdlink::StreamEvent::ReadyToRead, TEST_FD);
    }

    pub fn read_timeout(&self) {
        self.stream.event(xrdlink::StreamEvent::ReadTimeout, TEST_FD);
    }

    pub fn write_timeout(&self) {
        self.stream.event(xrdlink::StreamEvent::WriteTimeout, TEST_FD);
    }

    pub fn sent_bytes(&self) -> Vec<u8> {
        self.socket.lock().unwrap().sent.clone()
    }

    pub fn clear_sent(&self) {
        self.socket.lock().unwrap().sent.clear();
    }
}
