//! Persistent task store — records, indexes, and atomic file writes.

pub mod atomic;
pub mod model;
pub mod repository;

pub use model::{IndexEntry, PendingIndex, Priority, Task, TaskStatus, TerminalRecord};
pub use repository::{RetryOutcome, TaskRepository};
