//! In-process adapters for every port. Backing the `fake` backend, the demo
//! binary and the tests.

mod push_transport_memory;
mod room_api_memory;
mod stream_transport_memory;

pub use push_transport_memory::*;
pub use room_api_memory::*;
pub use stream_transport_memory::*;
