//! # Save Sync Server
//!
//! Authoritative save-state synchronization for real-time multiplayer
//! sessions. Each save is a JSON state tree mutated by game logic once per
//! tick and streamed to clients as change deltas.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     SAVE SYNC SERVER                         │
//! ├─────────────────────────────────────────────────────────────┤
//! │  core/           - Pure tree primitives                      │
//! │  ├── path.rs     - Dot-path resolver (field, :id, *)         │
//! │  ├── merge.rs    - Deep merge and record identity            │
//! │  └── hash.rs     - Payload digests                           │
//! │                                                              │
//! │  state/          - Per-session state                         │
//! │  ├── mutation.rs - Intents, pending buffer, atomic commit    │
//! │  ├── observer.rs - Change detection and watches              │
//! │  └── ack.rs      - Named acknowledgements                    │
//! │                                                              │
//! │  network/        - Sessions and transport                    │
//! │  ├── pipeline.rs - Input queue, bindings, outbound channel   │
//! │  ├── session.rs  - Session tick and manager                  │
//! │  ├── protocol.rs - Wire messages                             │
//! │  └── server.rs   - WebSocket server                          │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Tick Atomicity
//!
//! Intents submitted during a tick collect in a pending buffer and are
//! merged into the committed tree exactly once, at the end of the tick.
//! Readers, watchers and push loops only ever see committed trees.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod core;
pub mod network;
pub mod state;

// Re-export commonly used types
pub use crate::core::path::PathExpr;
pub use network::{GameServer, GameSession, ServerConfig, SessionHooks, SessionManager};
pub use state::{AckDefinition, AckRegistry, AckStrategy, ChangeTracker, Mutation, MutationEngine};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Simulation tick rate (Hz)
pub const TICK_RATE: u32 = 30;

/// Outbound push rate per connection (Hz)
pub const PUSH_RATE: u32 = 10;
