//! Durable multi-priority buffering between the audit pipeline and its
//! outputs.
//!
//! The queue persists every event to append-only segment files, one set
//! per priority band, and gives each registered output an independent,
//! durable cursor. Delivery to a cursor is highest-priority-band first and
//! FIFO within a band; segments are reclaimed once every cursor has
//! acknowledged past them.

mod queue;
mod record;

pub use queue::{Item, OpenError, PutError, Queue, QueueConfig, QueueCursor};
pub use record::RECORD_HEADER_LEN;
