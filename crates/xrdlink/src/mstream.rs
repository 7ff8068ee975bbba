//! Multi-stream bonding and read splitting.
//!
//! Bonds additional parallel sub-streams onto an established session
//! to spread bulk-transfer bandwidth, and splits large read requests
//! into per-stream chunks. Establishment is best-effort: the first
//! failure stops adding streams but keeps the ones already bonded.

use crate::error::StreamResult;
use crate::phyconn::{PhysicalConnection, TEMP_SUBSTREAM_ID};
use crate::xroot::{self, ServerResponseHeader};
use serde::{Deserialize, Serialize};

/// The session surface the bonding flow drives: identity for the bind
/// request plus the caller-visible last-response slot the bind must
/// not clobber.
pub trait BondSession: Send {
    /// Session id assigned at login.
    fn session_id(&self) -> [u8; 16];

    /// Allocates a request stream id for one outgoing request.
    fn next_request_sid(&mut self) -> [u8; 2];

    /// The last response header observed by the caller.
    fn last_response(&self) -> Option<ServerResponseHeader>;

    /// Overwrites the last response header.
    fn set_last_response(&mut self, resp: Option<ServerResponseHeader>);
}

/// One chunk of a split read request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadChunk {
    /// Absolute offset of the chunk.
    pub offset: u64,
    /// Chunk length in bytes.
    pub len: u32,
    /// Local stream ordinal the chunk should be sent on.
    pub stream: u16,
}

/// Bonds up to `max_streams` parallel sub-streams onto the session.
/// Returns the number actually added; stops at the first failure and
/// keeps the streams bonded so far.
pub fn establish_parallel_streams(
    session: &mut dyn BondSession,
    phy: &PhysicalConnection,
    max_streams: u32,
) -> u32 {
    let mut added = 0;
    for n in 0..max_streams {
        tracing::debug!(substream = n + 1, "trying to establish a parallel stream");
        if let Err(e) = add_parallel_stream(session, phy) {
            tracing::info!(
                error = %e,
                established = added,
                "stopping parallel stream establishment"
            );
            break;
        }
        added += 1;
    }
    added
}

/// Adds one parallel sub-stream: connect a pending slot, negotiate the
/// transport handshake over it, bind it to the session, and promote it
/// to the server-assigned id. Any failure removes the pending slot.
pub fn add_parallel_stream(
    session: &mut dyn BondSession,
    phy: &PhysicalConnection,
) -> StreamResult<()> {
    phy.try_connect_parallel_stream()?;

    let result = (|| {
        phy.handshake_pending()?;
        // The reader thread must see the new socket before the bind
        // reply can arrive on it.
        phy.reinit_fd_table();

        let server_id = bind_pending_stream(session, phy)?;
        phy.establish_pending_parallel_stream(server_id)?;
        phy.reinit_fd_table();
        Ok(())
    })();

    if result.is_err() {
        phy.remove_parallel_stream(TEMP_SUBSTREAM_ID);
    } else {
        tracing::info!("parallel stream bonded");
    }
    result
}

/// Runs the bind round-trip over the pending slot and returns the
/// server-assigned sub-stream id. The exchange goes through the
/// session's last-response slot like any other request, but the value
/// observed by the caller before the bind is restored afterwards.
pub fn bind_pending_stream(
    session: &mut dyn BondSession,
    phy: &PhysicalConnection,
) -> StreamResult<u16> {
    let saved = session.last_response();

    let result = (|| {
        let sid = session.next_request_sid();
        let mut request = xroot::build_bind_request(sid, session.session_id());
        let reply = phy.exchange_on_pending(&mut request)?;

        let header = ServerResponseHeader::decode(reply.as_bytes())?;
        session.set_last_response(Some(header));

        Ok(xroot::parse_bind_response(&reply)?)
    })();

    session.set_last_response(saved);
    result
}

/// Splits a long read into chunks to be issued in parallel across the
/// session's streams. Chunks are maximum-sized: at least the
/// configured split size, and large enough that every active stream
/// gets at most one when the request allows it.
pub fn split_read_request(
    phy: &PhysicalConnection,
    offset: u64,
    len: u32,
    split_size: u32,
) -> Vec<ReadChunk> {
    let mut chunk_size = split_size.max(1);
    let streams = phy.parallel_stream_count() as u32;
    if streams > 1 {
        chunk_size = chunk_size.max(len / streams + 1);
    }

    let mut chunks = Vec::new();
    let mut pos = 0u32;
    while pos < len {
        chunks.push(ReadChunk {
            offset: offset + pos as u64,
            len: (len - pos).min(chunk_size),
            stream: phy.next_stream_to_use(),
        });
        pos = pos.saturating_add(chunk_size);
    }
    chunks
}
