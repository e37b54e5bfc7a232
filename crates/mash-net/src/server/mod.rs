//! Connection acceptor shared by every listening component.
//!
//! The [`Server`] accepts connections and runs one tokio task per client,
//! driving a [`Listener`]. Handlers report back to the accept loop through a
//! multiplexing [`channel`](crate::channel): `SLEEP <id>` when a client asked
//! the server to sleep, `DONE <id>` when the connection ended.

mod listener;
pub use listener::{Action, BusyListener, Listener, ListenerFactory, Session};

mod acceptor;
pub use acceptor::{Server, ServerState};
