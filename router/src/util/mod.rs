//! Small data structures shared across the router.

pub mod decaying;

pub use decaying::DecayingHashSet;
