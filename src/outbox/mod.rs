//! Durable queue of mutations made while offline.

mod item;
mod store;

pub use item::{DeadLetter, NewOperation, OutboxItem};
pub use store::OutboxStore;
