//! Persistence layer for task records
//!
//! This module provides:
//! - [`TaskStore`] trait for saving and recovering task records
//! - [`InMemoryTaskStore`] for testing and single-process use
//! - `StoreWriter`, which applies the queue's writes in order on a background task

mod memory;
mod store;
mod writer;

pub use memory::InMemoryTaskStore;
pub use store::{StoreError, TaskStore};
pub(crate) use writer::{PendingWrite, StoreWriter};
