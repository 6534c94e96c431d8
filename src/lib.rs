//! stripecache: a concurrent in-process key→value cache with bounded weight,
//! time-based expiration, refresh-ahead, and at-most-one-load coordination.
//!
//! See `DESIGN.md` for internal architecture and invariants.

pub mod ds;

pub mod builder;
pub mod cache;
pub mod error;
pub mod notify;
pub mod prelude;
pub mod stats;
pub mod time;
pub mod traits;
