mod message;
mod room;
mod stream;
mod user;

pub use message::*;
pub use room::*;
pub use stream::*;
pub use user::*;
