//! Physical connection: the sub-stream slot table of one logical
//! session.
//!
//! The primary stream lives in its own [`crate::stream::Stream`]; this
//! structure tracks the additional sockets bonded to the session.
//! A new sub-stream occupies a *pending* slot (server id
//! [`TEMP_SUBSTREAM_ID`]) until the bind round-trip yields the
//! server-assigned id and the slot is promoted. Slot identity is two
//! numbers: the server-assigned sub-stream id used on the wire, and
//! the local stream ordinal, which is fixed at connect time and is
//! what the transport and the read splitter see.
//!
//! Establishment runs synchronously on the caller's thread; the
//! reader side learns about slot changes through the fd-table
//! generation counter.

use crate::config::LinkConfig;
use crate::error::{Fault, LinkError, Progress, StreamResult};
use crate::message::Message;
use crate::socket::{Socket, SocketFactory};
use crate::transport::{ChannelData, HandshakeData, TransportHandler};
use crate::url::ServerUrl;
use std::io;
use std::sync::atomic::{AtomicU16, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Server id a sub-stream carries between connect and bind.
pub const TEMP_SUBSTREAM_ID: u16 = 0xFFFF;

struct ParallelSlot {
    /// Server-assigned sub-stream id; `TEMP_SUBSTREAM_ID` while
    /// pending.
    server_id: u16,
    /// Local stream ordinal, fixed for the slot's lifetime.
    stream_num: u16,
    socket: Box<dyn Socket>,
}

/// The sub-stream socket table of one logical session.
pub struct PhysicalConnection {
    url: ServerUrl,
    transport: Arc<dyn TransportHandler>,
    channel: Arc<Mutex<ChannelData>>,
    factory: Arc<dyn SocketFactory>,
    config: LinkConfig,
    slots: Mutex<Vec<ParallelSlot>>,
    next_ordinal: AtomicU16,
    round_robin: AtomicUsize,
    fd_generation: AtomicU64,
}

impl PhysicalConnection {
    /// Creates an empty slot table for the session at `url`.
    pub fn new(
        url: ServerUrl,
        transport: Arc<dyn TransportHandler>,
        channel: Arc<Mutex<ChannelData>>,
        factory: Arc<dyn SocketFactory>,
        config: LinkConfig,
    ) -> Self {
        Self {
            url,
            transport,
            channel,
            factory,
            config,
            slots: Mutex::new(Vec::new()),
            next_ordinal: AtomicU16::new(1),
            round_robin: AtomicUsize::new(0),
            fd_generation: AtomicU64::new(0),
        }
    }

    /// Opens a new socket to the session peer and parks it in a
    /// pending slot. Returns the local stream ordinal. Fails if a
    /// pending slot already exists.
    pub fn try_connect_parallel_stream(&self) -> StreamResult<u16> {
        {
            let slots = self.slots.lock().unwrap();
            if slots.iter().any(|s| s.server_id == TEMP_SUBSTREAM_ID) {
                return Err(LinkError::ConnectionError.into());
            }
        }

        let mut socket = self.factory.create();
        let timeout = self.config.connection_window_secs;
        socket.initialize().map_err(|e| Fault::from_io(&e))?;
        socket
            .connect(&self.url.host, self.url.port)
            .map_err(|e| Fault::from_io(&e))?;
        socket.wait_connected(timeout).map_err(|e| Fault::from_io(&e))?;

        let stream_num = self.next_ordinal.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(
            host = %self.url,
            stream = stream_num,
            "parallel stream socket connected, pending bind"
        );
        self.slots.lock().unwrap().push(ParallelSlot {
            server_id: TEMP_SUBSTREAM_ID,
            stream_num,
            socket,
        });
        Ok(stream_num)
    }

    /// Drives the transport handshake synchronously over the pending
    /// slot's socket.
    pub fn handshake_pending(&self) -> StreamResult<()> {
        let mut slots = self.slots.lock().unwrap();
        let slot = slots
            .iter_mut()
            .find(|s| s.server_id == TEMP_SUBSTREAM_ID)
            .ok_or_else(|| Fault::from(LinkError::ConnectionError))?;

        let timeout = self.config.connection_window_secs;
        let mut hs = HandshakeData::new(self.url.clone(), slot.stream_num);
        hs.server_addr = slot.socket.server_address();
        hs.client_name = slot.socket.sock_name();

        loop {
            let step = {
                let mut channel = self.channel.lock().unwrap();
                self.transport.handshake(&mut hs, channel.as_mut())
            };
            hs.step += 1;
            let progress = step?;
            if let Some(mut out) = hs.out_msg.take() {
                send_fully(slot.socket.as_mut(), &mut out, timeout)?;
            }
            match progress {
                Progress::Done => break,
                Progress::Retry => continue,
                Progress::Continue => {
                    let reply = self.read_frame(slot.socket.as_mut(), timeout)?;
                    hs.in_msg = Some(reply);
                }
            }
        }
        tracing::debug!(host = %self.url, stream = slot.stream_num, "parallel stream negotiated");
        Ok(())
    }

    /// Sends `request` over the pending slot and reads one framed
    /// reply back. Used for the bind round-trip.
    pub fn exchange_on_pending(&self, request: &mut Message) -> StreamResult<Message> {
        let mut slots = self.slots.lock().unwrap();
        let slot = slots
            .iter_mut()
            .find(|s| s.server_id == TEMP_SUBSTREAM_ID)
            .ok_or_else(|| Fault::from(LinkError::ConnectionError))?;

        let timeout = self.config.connection_window_secs;
        send_fully(slot.socket.as_mut(), request, timeout)?;
        self.read_frame(slot.socket.as_mut(), timeout)
    }

    fn read_frame(&self, socket: &mut dyn Socket, timeout: u64) -> StreamResult<Message> {
        let mut msg = Message::new();
        loop {
            match self.transport.get_message(&mut msg, socket)? {
                Progress::Done => return Ok(msg),
                _ => socket.wait_readable(timeout).map_err(|e| Fault::from_io(&e))?,
            }
        }
    }

    /// Promotes the pending slot to the server-assigned `server_id`.
    pub fn establish_pending_parallel_stream(&self, server_id: u16) -> StreamResult<()> {
        let mut slots = self.slots.lock().unwrap();
        let slot = slots
            .iter_mut()
            .find(|s| s.server_id == TEMP_SUBSTREAM_ID)
            .ok_or_else(|| Fault::from(LinkError::ConnectionError))?;
        slot.server_id = server_id;
        tracing::info!(
            host = %self.url,
            stream = slot.stream_num,
            server_id,
            "parallel stream established"
        );
        Ok(())
    }

    /// Removes the slot carrying `server_id`, closing its socket and
    /// notifying the transport. Unknown ids are ignored.
    pub fn remove_parallel_stream(&self, server_id: u16) {
        let removed = {
            let mut slots = self.slots.lock().unwrap();
            match slots.iter().position(|s| s.server_id == server_id) {
                Some(idx) => Some(slots.remove(idx)),
                None => None,
            }
        };
        if let Some(mut slot) = removed {
            slot.socket.close();
            self.reinit_fd_table();
            {
                let mut channel = self.channel.lock().unwrap();
                self.transport.disconnect(channel.as_mut(), slot.stream_num);
            }
            tracing::debug!(
                host = %self.url,
                stream = slot.stream_num,
                server_id,
                "parallel stream removed"
            );
        }
    }

    /// Active streams of the session: the primary plus every bound
    /// slot.
    pub fn parallel_stream_count(&self) -> usize {
        let slots = self.slots.lock().unwrap();
        1 + slots.iter().filter(|s| s.server_id != TEMP_SUBSTREAM_ID).count()
    }

    /// Round-robin pick among the primary stream and the bound
    /// sub-streams, by local ordinal.
    pub fn next_stream_to_use(&self) -> u16 {
        let slots = self.slots.lock().unwrap();
        let mut ordinals = vec![0u16];
        ordinals.extend(
            slots
                .iter()
                .filter(|s| s.server_id != TEMP_SUBSTREAM_ID)
                .map(|s| s.stream_num),
        );
        let idx = self.round_robin.fetch_add(1, Ordering::SeqCst) % ordinals.len();
        ordinals[idx]
    }

    /// Signals the reader side that the slot set changed.
    pub fn reinit_fd_table(&self) {
        self.fd_generation.fetch_add(1, Ordering::SeqCst);
    }

    /// Generation counter bumped by [`Self::reinit_fd_table`].
    pub fn fd_table_generation(&self) -> u64 {
        self.fd_generation.load(Ordering::SeqCst)
    }
}

/// Writes the whole message, blocking on the socket when it pushes
/// back.
fn send_fully(socket: &mut dyn Socket, msg: &mut Message, timeout_secs: u64) -> StreamResult<()> {
    msg.set_cursor(0);
    while msg.remaining() > 0 {
        match socket.send(msg.bytes_at_cursor()) {
            Ok(0) => return Err(LinkError::StreamDisconnect.into()),
            Ok(n) => msg.advance_cursor(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                socket.wait_writable(timeout_secs).map_err(|e| Fault::from_io(&e))?;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(Fault::from_io(&e)),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FatalError;
    use crate::socket::SocketStatus;
    use crate::transport::HandshakeData;
    use std::net::SocketAddr;
    use std::os::fd::RawFd;

    /// Socket that records sent bytes and replays scripted reads.
    struct LoopSocket {
        sent: Vec<u8>,
        replies: Vec<Vec<u8>>,
    }

    impl Socket for LoopSocket {
        fn initialize(&mut self) -> io::Result<()> {
            Ok(())
        }
        fn connect(&mut self, _host: &str, _port: u16) -> io::Result<()> {
            Ok(())
        }
        fn close(&mut self) {}
        fn fd(&self) -> RawFd {
            11
        }
        fn take_error(&self) -> io::Result<Option<i32>> {
            Ok(None)
        }
        fn status(&self) -> SocketStatus {
            SocketStatus::Connected
        }
        fn set_status(&mut self, _status: SocketStatus) {}
        fn send(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.sent.extend_from_slice(buf);
            Ok(buf.len())
        }
        fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.replies.is_empty() {
                return Err(io::Error::from(io::ErrorKind::WouldBlock));
            }
            let chunk = &mut self.replies[0];
            let n = chunk.len().min(buf.len());
            buf[..n].copy_from_slice(&chunk[..n]);
            chunk.drain(..n);
            if chunk.is_empty() {
                self.replies.remove(0);
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

    struct LoopFactory {
        replies: Mutex<Vec<Vec<Vec<u8>>>>,
    }

    impl SocketFactory for LoopFactory {
        fn create(&self) -> Box<dyn Socket> {
            let replies = self.replies.lock().unwrap().pop().unwrap_or_default();
            Box::new(LoopSocket { sent: Vec::new(), replies })
        }
    }

    /// Transport finishing its handshake in one client-driven step.
    struct OneShotTransport;

    impl TransportHandler for OneShotTransport {
        fn handshake(
            &self,
            hs: &mut HandshakeData,
            _channel: &mut (dyn std::any::Any + Send),
        ) -> StreamResult<Progress> {
            if hs.step == 0 {
                hs.out_msg = Some(Message::from_bytes(vec![0xAA; 4]));
            }
            Ok(Progress::Done)
        }
        fn get_message(
            &self,
            msg: &mut Message,
            socket: &mut dyn Socket,
        ) -> StreamResult<Progress> {
            // Fixed four-byte frames, enough for the exchange test.
            msg.grow_to(4);
            while msg.remaining() > 0 {
                match socket.recv(msg.bytes_at_cursor_mut()) {
                    Ok(0) => return Err(LinkError::StreamDisconnect.into()),
                    Ok(n) => msg.advance_cursor(n),
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        return Ok(Progress::Continue)
                    }
                    Err(e) => return Err(Fault::from_io(&e)),
                }
            }
            Ok(Progress::Done)
        }
        fn disconnect(&self, _channel: &mut (dyn std::any::Any + Send), _stream_num: u16) {}
        fn is_stream_ttl_elapsed(
            &self,
            _idle_secs: u64,
            _channel: &mut (dyn std::any::Any + Send),
        ) -> bool {
            false
        }
    }

    fn phyconn(replies_per_socket: Vec<Vec<Vec<u8>>>) -> PhysicalConnection {
        PhysicalConnection::new(
            ServerUrl::new("srv", 1094),
            Arc::new(OneShotTransport),
            Arc::new(Mutex::new(Box::new(()) as ChannelData)),
            Arc::new(LoopFactory { replies: Mutex::new(replies_per_socket) }),
            LinkConfig::default(),
        )
    }

    #[test]
    fn test_connect_handshake_promote() {
        let phy = phyconn(vec![vec![]]);
        assert_eq!(phy.parallel_stream_count(), 1);

        let ordinal = phy.try_connect_parallel_stream().unwrap();
        assert_eq!(ordinal, 1);
        // Pending slots do not count as active.
        assert_eq!(phy.parallel_stream_count(), 1);

        phy.handshake_pending().unwrap();
        phy.establish_pending_parallel_stream(4).unwrap();
        assert_eq!(phy.parallel_stream_count(), 2);
    }

    #[test]
    fn test_single_pending_slot() {
        let phy = phyconn(vec![vec![], vec![]]);
        phy.try_connect_parallel_stream().unwrap();
        assert!(phy.try_connect_parallel_stream().is_err());
    }

    #[test]
    fn test_remove_pending_slot() {
        let phy = phyconn(vec![vec![], vec![]]);
        phy.try_connect_parallel_stream().unwrap();
        phy.remove_parallel_stream(TEMP_SUBSTREAM_ID);
        assert_eq!(phy.parallel_stream_count(), 1);
        // A new pending slot can be opened after the removal, with a
        // fresh ordinal.
        assert_eq!(phy.try_connect_parallel_stream().unwrap(), 2);
    }

    #[test]
    fn test_exchange_on_pending() {
        let phy = phyconn(vec![vec![vec![1, 2, 3, 4]]]);
        phy.try_connect_parallel_stream().unwrap();

        let mut req = Message::from_bytes(vec![9, 9]);
        let reply = phy.exchange_on_pending(&mut req).unwrap();
        assert_eq!(reply.as_bytes(), &[1, 2, 3, 4]);
    }

    #[test]
    fn test_round_robin_covers_all_streams() {
        let phy = phyconn(vec![vec![], vec![]]);
        for server_id in [7, 8] {
            phy.try_connect_parallel_stream().unwrap();
            phy.handshake_pending().unwrap();
            phy.establish_pending_parallel_stream(server_id).unwrap();
        }
        assert_eq!(phy.parallel_stream_count(), 3);

        let picks: Vec<u16> = (0..6).map(|_| phy.next_stream_to_use()).collect();
        assert_eq!(picks, vec![0, 1, 2, 0, 1, 2]);
    }

    #[test]
    fn test_fd_generation_bumps() {
        let phy = phyconn(vec![]);
        let gen = phy.fd_table_generation();
        phy.reinit_fd_table();
        assert_eq!(phy.fd_table_generation(), gen + 1);
    }

    #[test]
    fn test_handshake_without_pending_slot_fails() {
        let phy = phyconn(vec![]);
        let err = phy.handshake_pending().unwrap_err();
        assert_ne!(err, Fault::Fatal(FatalError::PollerError));
        assert!(!err.is_fatal());
    }
}
