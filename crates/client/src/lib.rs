//! Client runtime for a GTP engine reached through a JSON-lines bridge.

pub mod channel;
pub mod config;
pub mod renderers;
pub mod session;
pub mod sink;
pub mod transport;
pub mod viewer;

pub use channel::{CommandChannel, CommandError, CommandResult, PendingReply};
pub use config::{Cli, ClientConfig};
pub use session::{connect, LineEntry, NodeView, Session, SessionHandle, TreeSnapshot};
pub use sink::{LogKind, LogSink, TranscriptSink};
pub use transport::{TcpTransport, Transport, TransportError};

#[cfg(test)]
mod tests;
