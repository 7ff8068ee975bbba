#![warn(missing_docs)]

//! Connection-stream core for clients of xroot-family storage servers.
//!
//! One [`stream::Stream`] drives a single TCP connection of a logical
//! session: asynchronous connect, multi-step protocol handshake,
//! multiplexed send/receive over an external readiness poller, and
//! bounded fault recovery. [`mstream`] bonds additional parallel
//! sub-streams onto the session and splits bulk reads across them.
//!
//! The OS socket, the poller, the deferred-task scheduler, and the
//! wire protocol are consumed through traits; one concrete protocol
//! variant ships in [`xroot`].

pub mod config;
pub mod error;
pub mod inqueue;
pub mod message;
pub mod mstream;
pub mod phyconn;
pub mod poller;
pub mod socket;
pub mod stream;
pub mod task;
pub mod transport;
pub mod url;
pub mod xroot;

pub use config::LinkConfig;
pub use error::{Fault, FatalError, LinkError, Progress, SendOutcome, StreamResult};
pub use inqueue::{InQueue, ResponseHandler};
pub use message::Message;
pub use mstream::{establish_parallel_streams, split_read_request, BondSession, ReadChunk};
pub use phyconn::PhysicalConnection;
pub use poller::{EventListener, Poller, StreamEvent};
pub use socket::{Socket, SocketFactory, SocketStatus, TcpSocket, TcpSocketFactory};
pub use stream::{OutboundHandler, Stream, StreamParams, StreamStats, StreamStatus};
pub use task::{Clock, SystemClock, Task, TaskManager};
pub use transport::{ChannelData, HandshakeData, TransportHandler};
pub use url::ServerUrl;
pub use xroot::{ServerResponseHeader, XRootDChannelInfo, XRootDTransport};
