//! Peer protocol, transports and chain synchronization

pub mod protocol;
pub mod sync;
pub mod transport;

pub use protocol::{Message, ProtocolHandler};
pub use sync::{PeerInfo, PeerTable, SyncConfig, Synchronizer};
pub use transport::{MemoryTransport, PeerTransport, TcpTransport};
