//! Acknowledgement Tracking
//!
//! Clients acknowledge named server facts ("intro_seen", "round_ready", ...).
//! Each name is registered once with a completion strategy; progress is kept
//! per session.
//!
//! | strategy       | on_progress                    | on_complete                         |
//! |----------------|--------------------------------|-------------------------------------|
//! | `every`        | never                          | every ack                           |
//! | `once-each`    | first ack of each player       | once, when every player has acked   |
//! | `once-for-all` | every ack (toggles the player) | once, when the set first fills up   |
//! | `first-only`   | never                          | first ack of the session, only      |

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::state::mutation::Mutation;

/// Completion strategy of a named acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AckStrategy {
    /// Complete on every ack, no deduplication.
    Every,
    /// Toggle per player; complete once when all connected players are in.
    OnceForAll,
    /// Count each player once; complete once when all known players acked.
    OnceEach,
    /// Complete on the first ack only.
    FirstOnly,
}

/// Arguments passed to ack callbacks.
#[derive(Debug)]
pub struct AckContext<'a> {
    /// Session the ack belongs to.
    pub session_id: &'a str,
    /// Player that sent the ack.
    pub player_id: &'a str,
    /// Ack name.
    pub name: &'a str,
    /// Extra fields sent with the ack.
    pub payload: &'a Value,
    /// Players currently counted as acked.
    pub acked: &'a BTreeSet<String>,
    /// Static data from the definition.
    pub data: &'a Value,
}

/// Ack callback. A returned mutation is fed to the session's engine.
pub type AckCallback = Arc<dyn Fn(&AckContext<'_>) -> Option<Mutation> + Send + Sync>;

/// A named acknowledgement.
pub struct AckDefinition {
    /// Ack name as sent by clients.
    pub name: String,
    /// Completion strategy.
    pub strategy: AckStrategy,
    on_progress: Option<AckCallback>,
    on_complete: AckCallback,
    data: Value,
}

impl AckDefinition {
    /// New definition with a completion callback.
    pub fn new<F>(name: impl Into<String>, strategy: AckStrategy, on_complete: F) -> Self
    where
        F: Fn(&AckContext<'_>) -> Option<Mutation> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            strategy,
            on_progress: None,
            on_complete: Arc::new(on_complete),
            data: Value::Null,
        }
    }

    /// Add a progress callback.
    pub fn with_progress<F>(mut self, on_progress: F) -> Self
    where
        F: Fn(&AckContext<'_>) -> Option<Mutation> + Send + Sync + 'static,
    {
        self.on_progress = Some(Arc::new(on_progress));
        self
    }

    /// Attach static data handed to every callback.
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }
}

impl fmt::Debug for AckDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AckDefinition")
            .field("name", &self.name)
            .field("strategy", &self.strategy)
            .field("has_progress", &self.on_progress.is_some())
            .field("data", &self.data)
            .finish()
    }
}

/// Ack definitions shared by every session.
#[derive(Debug, Default)]
pub struct AckRegistry {
    definitions: BTreeMap<String, Arc<AckDefinition>>,
}

impl AckRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a definition, replacing one with the same name.
    pub fn register(&mut self, definition: AckDefinition) -> &mut Self {
        self.definitions
            .insert(definition.name.clone(), Arc::new(definition));
        self
    }

    /// Look up a definition.
    pub fn get(&self, name: &str) -> Option<&Arc<AckDefinition>> {
        self.definitions.get(name)
    }

    /// Number of definitions.
    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    /// True if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }
}

#[derive(Debug, Default, Clone)]
struct AckProgress {
    acked: BTreeSet<String>,
    completed: bool,
}

/// Per-session acknowledgement progress.
pub struct AckEngine {
    session_id: String,
    registry: Arc<AckRegistry>,
    progress: BTreeMap<String, AckProgress>,
}

impl AckEngine {
    /// Engine for one session.
    pub fn new(session_id: impl Into<String>, registry: Arc<AckRegistry>) -> Self {
        Self {
            session_id: session_id.into(),
            registry,
            progress: BTreeMap::new(),
        }
    }

    /// Record an ack from `player_id`.
    ///
    /// `players` is the set of players currently connected to the session.
    /// Returns the mutations produced by the fired callbacks.
    pub fn handle_ack(
        &mut self,
        player_id: &str,
        name: &str,
        payload: &Value,
        players: &BTreeSet<String>,
    ) -> Vec<Mutation> {
        let Some(definition) = self.registry.get(name).cloned() else {
            warn!(session = %self.session_id, ack = name, "unknown acknowledgement");
            return Vec::new();
        };

        let progress = self.progress.entry(name.to_string()).or_default();
        let mut fire_progress = false;
        let mut fire_complete = false;

        match definition.strategy {
            AckStrategy::Every => {
                progress.acked.insert(player_id.to_string());
                fire_complete = true;
            }
            AckStrategy::OnceEach => {
                if progress.acked.insert(player_id.to_string()) {
                    fire_progress = true;
                    let everyone = !players.is_empty()
                        && players.iter().all(|p| progress.acked.contains(p));
                    if everyone && !progress.completed {
                        progress.completed = true;
                        fire_complete = true;
                    }
                }
            }
            AckStrategy::OnceForAll => {
                // A repeat ack withdraws the player's earlier ack.
                if !progress.acked.remove(player_id) {
                    progress.acked.insert(player_id.to_string());
                }
                fire_progress = true;
                if !progress.completed
                    && !players.is_empty()
                    && progress.acked.len() >= players.len()
                {
                    progress.completed = true;
                    fire_complete = true;
                }
            }
            AckStrategy::FirstOnly => {
                if !progress.completed {
                    progress.completed = true;
                    progress.acked.insert(player_id.to_string());
                    fire_complete = true;
                }
            }
        }

        let ctx = AckContext {
            session_id: &self.session_id,
            player_id,
            name,
            payload,
            acked: &progress.acked,
            data: &definition.data,
        };

        let mut reactions = Vec::new();
        if fire_progress {
            if let Some(on_progress) = &definition.on_progress {
                reactions.extend(on_progress(&ctx));
            }
        }
        if fire_complete {
            debug!(session = %self.session_id, ack = name, player = player_id, "acknowledgement complete");
            reactions.extend((definition.on_complete)(&ctx));
        }
        reactions
    }

    /// Has the named ack completed in this session?
    pub fn is_complete(&self, name: &str) -> bool {
        self.progress.get(name).is_some_and(|p| p.completed)
    }

    /// Players currently counted for the named ack.
    pub fn acked_players(&self, name: &str) -> BTreeSet<String> {
        self.progress
            .get(name)
            .map(|p| p.acked.clone())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn players(ids: &[&str]) -> BTreeSet<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    fn counting(strategy: AckStrategy) -> (Arc<AckRegistry>, Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let completes = Arc::new(AtomicUsize::new(0));
        let progresses = Arc::new(AtomicUsize::new(0));
        let (c, p) = (completes.clone(), progresses.clone());
        let mut registry = AckRegistry::new();
        registry.register(
            AckDefinition::new("ready", strategy, move |_| {
                c.fetch_add(1, Ordering::SeqCst);
                None
            })
            .with_progress(move |_| {
                p.fetch_add(1, Ordering::SeqCst);
                None
            }),
        );
        (Arc::new(registry), completes, progresses)
    }

    #[test]
    fn test_every_fires_each_time() {
        let (registry, completes, progresses) = counting(AckStrategy::Every);
        let mut engine = AckEngine::new("s", registry);
        let all = players(&["a", "b"]);
        for _ in 0..3 {
            engine.handle_ack("a", "ready", &Value::Null, &all);
        }
        assert_eq!(completes.load(Ordering::SeqCst), 3);
        assert_eq!(progresses.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_once_for_all_completes_once() {
        let (registry, completes, _) = counting(AckStrategy::OnceForAll);
        let mut engine = AckEngine::new("s", registry);
        let all = players(&["a", "b", "c"]);

        engine.handle_ack("a", "ready", &Value::Null, &all);
        engine.handle_ack("b", "ready", &Value::Null, &all);
        assert_eq!(completes.load(Ordering::SeqCst), 0);
        engine.handle_ack("c", "ready", &Value::Null, &all);
        assert_eq!(completes.load(Ordering::SeqCst), 1);
        assert!(engine.is_complete("ready"));

        // second round: toggles everyone out, then back in
        for p in ["a", "b", "c", "a", "b", "c"] {
            engine.handle_ack(p, "ready", &Value::Null, &all);
        }
        assert_eq!(completes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_once_for_all_repeat_ack_toggles() {
        let (registry, _, progresses) = counting(AckStrategy::OnceForAll);
        let mut engine = AckEngine::new("s", registry);
        let all = players(&["a", "b"]);

        engine.handle_ack("a", "ready", &Value::Null, &all);
        assert_eq!(engine.acked_players("ready"), players(&["a"]));
        engine.handle_ack("a", "ready", &Value::Null, &all);
        assert!(engine.acked_players("ready").is_empty());
        assert_eq!(progresses.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_once_each_ignores_repeats() {
        let (registry, completes, progresses) = counting(AckStrategy::OnceEach);
        let mut engine = AckEngine::new("s", registry);
        let all = players(&["a", "b"]);

        engine.handle_ack("a", "ready", &Value::Null, &all);
        engine.handle_ack("a", "ready", &Value::Null, &all);
        assert_eq!(progresses.load(Ordering::SeqCst), 1);
        assert_eq!(completes.load(Ordering::SeqCst), 0);

        engine.handle_ack("b", "ready", &Value::Null, &all);
        engine.handle_ack("b", "ready", &Value::Null, &all);
        assert_eq!(progresses.load(Ordering::SeqCst), 2);
        assert_eq!(completes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_first_only() {
        let (registry, completes, _) = counting(AckStrategy::FirstOnly);
        let mut engine = AckEngine::new("s", registry);
        let all = players(&["a", "b"]);
        engine.handle_ack("b", "ready", &Value::Null, &all);
        engine.handle_ack("a", "ready", &Value::Null, &all);
        engine.handle_ack("b", "ready", &Value::Null, &all);
        assert_eq!(completes.load(Ordering::SeqCst), 1);
        assert_eq!(engine.acked_players("ready"), players(&["b"]));
    }

    #[test]
    fn test_unknown_ack_ignored() {
        let (registry, completes, _) = counting(AckStrategy::Every);
        let mut engine = AckEngine::new("s", registry);
        let out = engine.handle_ack("a", "nope", &Value::Null, &players(&["a"]));
        assert!(out.is_empty());
        assert_eq!(completes.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_callbacks_see_player_and_data() {
        let mut registry = AckRegistry::new();
        registry.register(
            AckDefinition::new("intro", AckStrategy::Every, |ctx| {
                Some(Mutation::set(
                    format!("seen.{}", ctx.player_id),
                    json!({ "step": ctx.data["step"], "at": ctx.payload["at"] }),
                ))
            })
            .with_data(json!({ "step": 2 })),
        );
        let mut engine = AckEngine::new("s", Arc::new(registry));
        let out = engine.handle_ack("p1", "intro", &json!({ "at": 40 }), &players(&["p1"]));
        assert_eq!(out.len(), 1);
        match &out[0] {
            Mutation::Set { path, value } => {
                assert_eq!(path, "seen.p1");
                assert_eq!(value, &json!({ "step": 2, "at": 40 }));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_strategy_names() {
        assert_eq!(serde_json::to_value(AckStrategy::OnceForAll).unwrap(), json!("once-for-all"));
        assert_eq!(
            serde_json::from_value::<AckStrategy>(json!("first-only")).unwrap(),
            AckStrategy::FirstOnly
        );
    }
}
