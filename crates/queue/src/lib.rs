//! `civicbrief-queue`: job message delivery (mechanics only).

pub mod in_memory;
pub mod message;
pub mod queue;

pub use in_memory::InMemoryJobQueue;
pub use message::{Delivery, JobMessage, ReceiptHandle};
pub use queue::{MessageQueue, QueueError};
