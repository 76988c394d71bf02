//! Network Layer
//!
//! Sessions, the packet pipeline and the WebSocket adapter.
//! Transport code only enqueues input and reads committed state.

pub mod pipeline;
pub mod protocol;
pub mod server;
pub mod session;

pub use pipeline::{ActionBindings, InputContext, InputQueue, OutboundChannel, PushMode, SequenceCounter};
pub use protocol::{
    ClientMessage, ClientPacket, DeltaPacket, PacketReceipt, PendingAck, ServerPacket, StateFrame, TransportEvent,
};
pub use server::{ConfigError, GameServer, GameServerError, ServerConfig};
pub use session::{
    GameSession, PlayerId, SessionConfig, SessionError, SessionHooks, SessionId, SessionManager, SessionState,
    TickReport,
};
