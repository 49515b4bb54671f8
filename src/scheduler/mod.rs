//! Bounded scheduler: dequeues session-run requests, guarantees at-most-one
//! active supervisor per session id, and releases its slot early (§4.8).

pub mod queue;

pub use queue::{Slot, SlotQueue};
