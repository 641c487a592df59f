mod connector;
mod peer;

pub use connector::{ConnectionVariant, PollEvent, SendBehavior, TcpConnector};
pub use peer::{ConnState, PeerStream, SOCKET_BW_LIMIT};
