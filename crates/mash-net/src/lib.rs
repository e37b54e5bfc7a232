//! Networking layer of the scheduler: the line oriented wire codec, framed
//! connections over TCP, in-process communication channels and the
//! connection acceptor used by every listening component.

mod codec;
pub use codec::{Message, Param};

mod transport;
pub use transport::{Client, Connection, TransportError};

pub mod channel;
pub use channel::{ChannelKind, Endpoint};

pub mod server;
pub use server::{Action, BusyListener, Listener, ListenerFactory, Server, ServerState, Session};
