//! Asynchronous message bus between the coordinator and agent workers.

pub mod mailbox;
pub mod message;

pub use mailbox::{DeliveryMode, MessageBus, RedeliveryReport};
pub use message::{DeliveryKey, Message, MessageKind, MessagePayload, Recipient, COORDINATOR};
