//! The sync engine: transport-facing clients plus the coordinator that
//! merges them into one [`ConversationStore`].

mod backoff;
mod conversation_store;
mod coordinator;
mod event_channel;
mod message_stream;
mod snapshot_fetcher;

pub use backoff::*;
pub use conversation_store::*;
pub use coordinator::*;
pub use event_channel::*;
pub use message_stream::*;
pub use snapshot_fetcher::*;
