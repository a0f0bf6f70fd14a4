//! Local mirror of remote records.
//!
//! This module keeps the last-known value of every record the process has
//! observed, whether it came from a read, a write or a realtime push:
//! - One entry per (collection, id), last write wins
//! - Incoming records with a lower `version` than the cached one are ignored
//! - Results carry their source so callers can tell degraded data apart

mod mirror;
mod traits;

pub use mirror::{CachedRecord, MirrorCache};
pub use traits::{Source, Sourced};
