//! Concrete transport for the xroot wire protocol.
//!
//! Covers the initial protocol negotiation (fixed client greeting,
//! server version/flavor reply), incremental response framing, the
//! per-flavor idle TTL, and the bind request used to bond parallel
//! sub-streams.

use crate::error::{Fault, LinkError, Progress, StreamResult};
use crate::message::Message;
use crate::socket::Socket;
use crate::transport::{HandshakeData, TransportHandler};
use std::any::Any;
use std::io;

/// Size of the server response header on the wire.
pub const RESPONSE_HEADER_SIZE: usize = 8;
/// Size of the fixed client greeting.
pub const GREETING_SIZE: usize = 20;
/// Body length of the server's greeting reply.
pub const GREETING_REPLY_DLEN: u32 = 8;

/// Request id of the bind request.
pub const XR_BIND: u16 = 3024;
/// Status code of a successful response.
pub const XR_OK: u16 = 0;
/// Status code of an error response.
pub const XR_ERROR: u16 = 4003;

/// Server flavor announced in the greeting reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerFlavor {
    /// Flavor not yet negotiated.
    Unknown,
    /// Redirector; connections are kept on a long idle leash.
    LoadBalancer,
    /// Data server; idle connections are recycled sooner.
    DataServer,
}

/// Header of every server response frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerResponseHeader {
    /// Echo of the request's stream id.
    pub stream_id: [u8; 2],
    /// Response status code.
    pub status: u16,
    /// Length of the body following the header.
    pub dlen: u32,
}

impl ServerResponseHeader {
    /// Encodes the header into its 8-byte wire form.
    pub fn encode(&self) -> [u8; RESPONSE_HEADER_SIZE] {
        let mut out = [0u8; RESPONSE_HEADER_SIZE];
        out[0..2].copy_from_slice(&self.stream_id);
        out[2..4].copy_from_slice(&self.status.to_be_bytes());
        out[4..8].copy_from_slice(&self.dlen.to_be_bytes());
        out
    }

    /// Decodes a header from the first 8 bytes of `buf`.
    pub fn decode(buf: &[u8]) -> Result<Self, LinkError> {
        if buf.len() < RESPONSE_HEADER_SIZE {
            return Err(LinkError::InvalidMessage(format!(
                "response header truncated at {} bytes",
                buf.len()
            )));
        }
        Ok(Self {
            stream_id: [buf[0], buf[1]],
            status: u16::from_be_bytes([buf[2], buf[3]]),
            dlen: u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]),
        })
    }
}

/// Per-session state owned by the xroot transport, threaded through
/// every transport call as the opaque channel blob.
#[derive(Debug)]
pub struct XRootDChannelInfo {
    /// Protocol version announced by the server.
    pub protocol_version: u32,
    /// Server flavor announced by the server.
    pub flavor: ServerFlavor,
    /// Session id assigned at login; zeroed until then.
    pub session_id: [u8; 16],
    /// Stream numbers currently holding a live connection.
    pub live_streams: Vec<u16>,
}

impl XRootDChannelInfo {
    /// Creates a blob for a not-yet-negotiated channel.
    pub fn new() -> Self {
        Self {
            protocol_version: 0,
            flavor: ServerFlavor::Unknown,
            session_id: [0; 16],
            live_streams: Vec::new(),
        }
    }
}

impl Default for XRootDChannelInfo {
    fn default() -> Self {
        Self::new()
    }
}

/// The xroot protocol transport.
#[derive(Debug, Clone)]
pub struct XRootDTransport {
    data_server_ttl_secs: u64,
    lb_server_ttl_secs: u64,
}

impl XRootDTransport {
    /// Creates a transport with the given per-flavor idle TTLs.
    pub fn new(data_server_ttl_secs: u64, lb_server_ttl_secs: u64) -> Self {
        Self { data_server_ttl_secs, lb_server_ttl_secs }
    }

    /// Creates a transport with the TTLs from `config`.
    pub fn from_config(config: &crate::config::LinkConfig) -> Self {
        Self::new(config.data_server_ttl_secs, config.lb_server_ttl_secs)
    }

    /// The fixed 20-byte client greeting: five big-endian words,
    /// `0 0 0 4 2012`.
    pub fn initial_greeting() -> Message {
        let mut data = Vec::with_capacity(GREETING_SIZE);
        for word in [0i32, 0, 0, 4, 2012] {
            data.extend_from_slice(&word.to_be_bytes());
        }
        Message::from_bytes(data)
    }

    fn process_greeting_reply(
        &self,
        msg: &Message,
        channel: &mut XRootDChannelInfo,
    ) -> StreamResult<()> {
        let hdr = ServerResponseHeader::decode(msg.as_bytes())
            .map_err(|e| Fault::Recoverable(LinkError::HandshakeFailed(e.to_string())))?;

        if hdr.status != XR_OK || hdr.dlen != GREETING_REPLY_DLEN {
            return Err(LinkError::HandshakeFailed(format!(
                "greeting rejected: status {} dlen {}",
                hdr.status, hdr.dlen
            ))
            .into());
        }

        let body = &msg.as_bytes()[RESPONSE_HEADER_SIZE..];
        if body.len() < GREETING_REPLY_DLEN as usize {
            return Err(LinkError::HandshakeFailed("greeting reply truncated".into()).into());
        }

        channel.protocol_version = u32::from_be_bytes([body[0], body[1], body[2], body[3]]);
        let flavor_word = u32::from_be_bytes([body[4], body[5], body[6], body[7]]);
        channel.flavor = if flavor_word == 0 {
            ServerFlavor::LoadBalancer
        } else {
            ServerFlavor::DataServer
        };

        tracing::debug!(
            protocol = channel.protocol_version,
            flavor = ?channel.flavor,
            "negotiated server protocol"
        );
        Ok(())
    }

    fn downcast<'a>(channel: &'a mut (dyn Any + Send)) -> StreamResult<&'a mut XRootDChannelInfo> {
        channel
            .downcast_mut::<XRootDChannelInfo>()
            .ok_or_else(|| LinkError::HandshakeFailed("foreign channel data".into()).into())
    }
}

impl TransportHandler for XRootDTransport {
    fn handshake(
        &self,
        hs: &mut HandshakeData,
        channel: &mut (dyn Any + Send),
    ) -> StreamResult<Progress> {
        let info = Self::downcast(channel)?;
        match hs.step {
            // First step is client-driven: emit the greeting, wait for
            // the reply.
            0 => {
                hs.out_msg = Some(Self::initial_greeting());
                Ok(Progress::Continue)
            }
            1 => {
                let reply = hs.in_msg.take().ok_or_else(|| {
                    Fault::from(LinkError::HandshakeFailed("greeting reply missing".into()))
                })?;
                self.process_greeting_reply(&reply, info)?;
                if !info.live_streams.contains(&hs.stream_num) {
                    info.live_streams.push(hs.stream_num);
                }
                Ok(Progress::Done)
            }
            step => Err(LinkError::HandshakeFailed(format!("unexpected step {step}")).into()),
        }
    }

    fn get_message(&self, msg: &mut Message, socket: &mut dyn Socket) -> StreamResult<Progress> {
        // Header first; its dlen field tells us the exact frame size.
        if msg.len() < RESPONSE_HEADER_SIZE {
            msg.grow_to(RESPONSE_HEADER_SIZE);
        }

        loop {
            if msg.cursor() == msg.len() {
                if msg.cursor() > RESPONSE_HEADER_SIZE {
                    return Ok(Progress::Done);
                }
                // Header complete: size the buffer for the body.
                let hdr = ServerResponseHeader::decode(msg.as_bytes())
                    .map_err(|e| Fault::Recoverable(e))?;
                if hdr.dlen == 0 {
                    return Ok(Progress::Done);
                }
                msg.grow_to(RESPONSE_HEADER_SIZE + hdr.dlen as usize);
            }

            let read = match socket.recv(msg.bytes_at_cursor_mut()) {
                Ok(0) => return Err(LinkError::StreamDisconnect.into()),
                Ok(n) => n,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(Progress::Continue)
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(ref e) => return Err(Fault::from_io(e)),
            };
            msg.advance_cursor(read);
        }
    }

    fn disconnect(&self, channel: &mut (dyn Any + Send), stream_num: u16) {
        if let Ok(info) = Self::downcast(channel) {
            info.live_streams.retain(|&s| s != stream_num);
            tracing::debug!(stream = stream_num, "transport notified of disconnect");
        }
    }

    fn is_stream_ttl_elapsed(&self, idle_secs: u64, channel: &mut (dyn Any + Send)) -> bool {
        let ttl = match Self::downcast(channel) {
            Ok(info) if info.flavor == ServerFlavor::LoadBalancer => self.lb_server_ttl_secs,
            _ => self.data_server_ttl_secs,
        };
        idle_secs > ttl
    }
}

/// Builds a bind request carrying `session_id`, to be sent over the
/// sub-stream being bonded.
pub fn build_bind_request(stream_id: [u8; 2], session_id: [u8; 16]) -> Message {
    let mut data = Vec::with_capacity(24);
    data.extend_from_slice(&stream_id);
    data.extend_from_slice(&XR_BIND.to_be_bytes());
    data.extend_from_slice(&session_id);
    data.extend_from_slice(&0i32.to_be_bytes());
    Message::from_bytes(data)
}

/// Extracts the server-assigned sub-stream id from a bind response.
pub fn parse_bind_response(msg: &Message) -> Result<u16, LinkError> {
    let hdr = ServerResponseHeader::decode(msg.as_bytes())?;
    if hdr.status != XR_OK {
        return Err(LinkError::HandshakeFailed(format!(
            "bind rejected with status {}",
            hdr.status
        )));
    }
    let body = &msg.as_bytes()[RESPONSE_HEADER_SIZE..];
    if body.is_empty() {
        return Err(LinkError::InvalidMessage("bind response without body".into()));
    }
    Ok(body[0] as u16)
}
