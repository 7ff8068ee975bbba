//! Transport plug-in interface.
//!
//! The wire protocol is a plug-in: the stream drives connection
//! establishment and byte shuffling, the transport decides what the
//! bytes mean. One concrete variant ships with the crate
//! ([`crate::xroot::XRootDTransport`]); the seam is a trait so tests
//! and future protocol revisions can substitute their own.

use crate::error::{Progress, StreamResult};
use crate::message::Message;
use crate::socket::Socket;
use crate::url::ServerUrl;
use std::any::Any;
use std::net::SocketAddr;

/// Opaque per-session state owned by the transport. The session
/// allocates it once and threads it through every transport call.
pub type ChannelData = Box<dyn Any + Send>;

/// Scratchpad for one connection's handshake, passed to the
/// transport's step function across readiness events. Created when the
/// async connect is verified, destroyed when the stream reaches
/// `Connected`.
#[derive(Debug)]
pub struct HandshakeData {
    /// Endpoint being negotiated with.
    pub url: ServerUrl,
    /// Stream number within the session (0 = primary).
    pub stream_num: u16,
    /// Steps taken so far; incremented by the stream after every call.
    pub step: u32,
    /// Resolved address of the server.
    pub server_addr: Option<SocketAddr>,
    /// Local address, used as the client name in the negotiation.
    pub client_name: Option<SocketAddr>,
    /// The last fully-framed inbound message, owned here for the
    /// duration of one step.
    pub in_msg: Option<Message>,
    /// An outbound message the transport wants sent; the stream moves
    /// it into the handshake queue after the step returns.
    pub out_msg: Option<Message>,
}

impl HandshakeData {
    /// Creates a fresh scratchpad for `url`/`stream_num`.
    pub fn new(url: ServerUrl, stream_num: u16) -> Self {
        Self {
            url,
            stream_num,
            step: 0,
            server_addr: None,
            client_name: None,
            in_msg: None,
            out_msg: None,
        }
    }
}

/// Protocol-specific behavior the stream machinery consumes.
pub trait TransportHandler: Send + Sync {
    /// Performs one step of the connection negotiation. The transport
    /// may deposit an outbound message in `hs.out_msg` and will find
    /// the last inbound message in `hs.in_msg`. Returns `Done` when
    /// negotiation is complete, `Retry` to be called again immediately,
    /// `Continue` to wait for the peer.
    fn handshake(
        &self,
        hs: &mut HandshakeData,
        channel: &mut (dyn Any + Send),
    ) -> StreamResult<Progress>;

    /// Reads one framed message from `socket` into `msg`, advancing the
    /// message cursor across calls. Returns `Done` when a complete
    /// frame is buffered, `Continue` when more bytes are needed.
    fn get_message(&self, msg: &mut Message, socket: &mut dyn Socket) -> StreamResult<Progress>;

    /// Notifies the transport that `stream_num` of this channel lost
    /// its connection.
    fn disconnect(&self, channel: &mut (dyn Any + Send), stream_num: u16);

    /// Whether an idle period of `idle_secs` exceeds the stream TTL for
    /// this channel.
    fn is_stream_ttl_elapsed(&self, idle_secs: u64, channel: &mut (dyn Any + Send)) -> bool;
}
