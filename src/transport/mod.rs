//! The channel between home servers, treated as an opaque request/response pipe.
mod api;
mod loopback;

pub use api::Transport;
pub use api::TransportError;
pub use api::TransportRequestHandler;
pub use loopback::LoopbackNetwork;
pub use loopback::LoopbackTransport;
