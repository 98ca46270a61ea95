//! WebSocket adapters for the push channel and the message streams.

mod frame;
mod push_transport_ws;
mod stream_transport_ws;

pub use push_transport_ws::*;
pub use stream_transport_ws::*;
