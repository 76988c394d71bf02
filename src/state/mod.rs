//! Session State
//!
//! Everything a single session owns between ticks:
//! - `mutation` - pending intents and the atomic commit point
//! - `observer` - watches fired between consecutive committed snapshots
//! - `ack`      - named acknowledgements and their completion strategies

pub mod ack;
pub mod mutation;
pub mod observer;

pub use ack::{AckCallback, AckContext, AckDefinition, AckEngine, AckRegistry, AckStrategy};
pub use mutation::{Mutation, MutationEngine, MutationError, IMMUTABLE_KEY};
pub use observer::{ChangeTracker, Condition, Change, ElementChange, Focus, WatchHandle};
