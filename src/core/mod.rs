//! Core primitives over the JSON state tree.
//!
//! Pure functions with no session or transport knowledge: path resolution,
//! the merge algebra and payload digests.

pub mod hash;
pub mod merge;
pub mod path;

// Re-export core types
pub use hash::{deltas_digest, snapshot_digest, PayloadHasher, StateHash};
pub use merge::{deep_merge, is_noop};
pub use path::{PathCache, PathError, PathExpr, Segment};
