mod push_transport;
mod room_api;
mod stream_transport;

pub use push_transport::*;
pub use room_api::*;
pub use stream_transport::*;
