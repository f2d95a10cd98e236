//! The `persistence` module keeps captured messages around for later replay.
//!
//! Two forms are supported:
//!
//! - capture files ([`CaptureFileSink`], [`CaptureFileSource`]), a flat
//!   sequence of framed records that can be handed to someone else or
//!   replayed with the produce loop, and
//! - a `sled` backed [`CaptureStore`] holding the recent traffic of every tap
//!   source, bounded by age and count.

pub mod file;
pub mod sled_store;

pub use file::{CaptureFileSink, CaptureFileSource};
pub use sled_store::{CaptureStore, StoreSource, StoredCapture};
