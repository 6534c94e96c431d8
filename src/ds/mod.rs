pub mod arena;
pub mod queue;
pub mod staging;

pub use arena::{EntryId, SlotBank};
pub use queue::{AccessOrder, IndexDeque, IndexLinks, WriteOrder, NIL};
pub use staging::{RecencyBuffer, ReclaimChannel, RECLAIM_DRAIN_MAX};
