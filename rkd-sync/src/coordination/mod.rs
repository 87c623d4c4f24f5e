//! Coordination primitives
//!
//! All engine coordination goes through these: a generation slot per logical
//! operation (lookup, session, reconciliation, onboarding fetch), a
//! cancellable-future combinator and a debounce combinator. No component
//! checks ad hoc "is stale" flags.

mod debounce;
mod slot;

pub use debounce::{cancellable, Debouncer};
pub use slot::{GenerationSlot, Lease};
