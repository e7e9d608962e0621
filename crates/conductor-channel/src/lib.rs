//! Framed, bidirectional message transport over Unix-domain sockets, plus
//! the request/response protocol layered on top of it.
//!
//! The broker side ([`ChannelServer`]) accepts any number of peers, routes
//! frames by `receiver_id`, and fans out broadcasts. Agents connect with
//! [`ChannelClient`]. Both ends implement [`MessageTransport`], the narrow
//! seam the [`Protocol`] layer is written against.

pub mod channel;
pub mod frame;
pub mod protocol;

pub use channel::{ChannelClient, ChannelServer};
pub use protocol::{MessageHandler, MessageTransport, Protocol};
