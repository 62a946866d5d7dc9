pub mod queue;

pub use queue::{MessageQueue, NewMessage, QueuedMessage};
