pub mod actor;
pub mod protocol;
pub mod writer;

pub use actor::{
    Connect, ConnectionActor, ConnectionActorArgs, Disconnect, GetConnectionState,
    GetConnectionStats, SendLocation,
};
pub use protocol::{InboundMessage, OutboundMessage, decode_inbound};
pub use writer::{CloseSocket, FrameWriter, WriteFrame};
