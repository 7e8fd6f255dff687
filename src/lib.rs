//! SockRelay - Minimal TCP event relay
//!
//! A relay server rebroadcasts the bytes each peer sends to every other
//! peer. Clients exchange named events over a compact frame format and
//! dispatch what they receive to registered handlers.
//!
//! - [`protocol`] defines the frame format and the stream decoder.
//! - [`dispatch`] maps event names to handlers.
//! - [`network`] holds the relay server, its connection registry and the client.
//! - [`config`] loads TOML configuration.

pub mod config;
pub mod dispatch;
pub mod network;
pub mod protocol;

pub use config::Config;
pub use dispatch::{Dispatcher, Handler, HandlerRef};
pub use network::{RelayClient, Server};
pub use protocol::{encode, CodecError, Frame, FrameReader};
