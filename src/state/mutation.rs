//! Mutation Engine
//!
//! Owns the canonical state tree of one session.
//!
//! Intents are lowered into concrete partial trees, buffered, and merged into
//! the committed tree only by [`MutationEngine::apply_pending_merges`]. Readers
//! never observe a half-applied tick.
//!
//! ## Path operators
//!
//! ```text
//! ("list+",      v)     push v (arrays are spliced in)
//! ("list-",      v)     remove records matching v
//! ("list!",      rec)   replace the record sharing rec.id
//! ("list:4",     v)     deep-merge v into the record with id 4
//! ("list:4.sub", v)     set `sub` on the record with id 4
//! ```

use std::borrow::Cow;
use std::fmt;
use std::sync::{Arc, Mutex};

use futures_util::future::BoxFuture;
use futures_util::stream::FuturesUnordered;
use futures_util::{FutureExt, StreamExt};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, warn};

use crate::core::merge::{
    deep_merge, is_noop, merge_maps, merged, nest, push_entries, remove_matching, replace_by_id,
};
use crate::core::path::{id_matches, PathCache, PathError, PathExpr, Segment};

/// Root field that mutations can set once and never overwrite.
pub const IMMUTABLE_KEY: &str = "_id";

/// Pure function of the current value at a path.
pub type ComputeFn = Arc<dyn Fn(&Value) -> Value + Send + Sync>;

/// Mutation that becomes available later.
pub type DeferredMutation = BoxFuture<'static, Result<Mutation, MutationError>>;

// =============================================================================
// INTENTS
// =============================================================================

/// A mutation intent.
pub enum Mutation {
    /// Partial tree deep-merged into the state (arrays replace).
    Merge(Value),
    /// Literal value at a path. The path may end in `+`, `-` or `!`, or
    /// address a record with `field:id`.
    Set {
        /// Target path, optionally with a trailing operator.
        path: String,
        /// Value to apply.
        value: Value,
    },
    /// Value computed from the current value at a path.
    Compute {
        /// Target path (operators are not allowed).
        path: String,
        /// Receives the current value, `Value::Null` when absent.
        f: ComputeFn,
    },
    /// Intents applied in order.
    Batch(Vec<Mutation>),
    /// Intent resolved asynchronously.
    Deferred(DeferredMutation),
}

impl Mutation {
    /// Partial-tree merge.
    pub fn merge(value: Value) -> Self {
        Self::Merge(value)
    }

    /// Path assignment.
    pub fn set(path: impl Into<String>, value: Value) -> Self {
        Self::Set {
            path: path.into(),
            value,
        }
    }

    /// Path assignment from the current value.
    pub fn compute<F>(path: impl Into<String>, f: F) -> Self
    where
        F: Fn(&Value) -> Value + Send + Sync + 'static,
    {
        Self::Compute {
            path: path.into(),
            f: Arc::new(f),
        }
    }

    /// Ordered batch.
    pub fn batch(items: impl IntoIterator<Item = Mutation>) -> Self {
        Self::Batch(items.into_iter().collect())
    }

    /// Intent produced by a future.
    pub fn deferred<F>(future: F) -> Self
    where
        F: std::future::Future<Output = Result<Mutation, MutationError>> + Send + 'static,
    {
        Self::Deferred(future.boxed())
    }
}

impl fmt::Debug for Mutation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Merge(value) => f.debug_tuple("Merge").field(value).finish(),
            Self::Set { path, value } => f
                .debug_struct("Set")
                .field("path", path)
                .field("value", value)
                .finish(),
            Self::Compute { path, .. } => f.debug_struct("Compute").field("path", path).finish(),
            Self::Batch(items) => f.debug_tuple("Batch").field(items).finish(),
            Self::Deferred(_) => f.write_str("Deferred(..)"),
        }
    }
}

impl From<Value> for Mutation {
    fn from(value: Value) -> Self {
        Self::Merge(value)
    }
}

impl<P: Into<String>> From<(P, Value)> for Mutation {
    fn from((path, value): (P, Value)) -> Self {
        Self::set(path, value)
    }
}

impl From<Vec<Mutation>> for Mutation {
    fn from(items: Vec<Mutation>) -> Self {
        Self::Batch(items)
    }
}

/// Mutation errors. All of them are logged and the intent dropped, unless the
/// caller went through [`MutationEngine::mutate_async`].
#[derive(Debug, Error)]
pub enum MutationError {
    /// Path failed to parse.
    #[error("invalid path: {0}")]
    InvalidPath(#[from] PathError),
    /// Value is null or an empty object.
    #[error("empty value for path '{0}'")]
    EmptyValue(String),
    /// Merge intent was not an object.
    #[error("merge intent must be an object, got {0}")]
    MalformedMerge(String),
    /// Function supplied with `+`, `-` or `!`.
    #[error("function values are not allowed with operator '{op}' on '{path}'")]
    FunctionOnOperator {
        /// Target path.
        path: String,
        /// Operator character.
        op: char,
    },
    /// Write through a `field*` projection.
    #[error("projection path '{0}' is read-only")]
    ProjectionNotWritable(String),
    /// Array operator on a non-array value.
    #[error("value at '{0}' is not an array")]
    NotAnArray(String),
    /// No record with the requested id.
    #[error("no record with id '{id}' at '{path}'")]
    RecordNotFound {
        /// Array path.
        path: String,
        /// Requested id.
        id: String,
    },
    /// Replacement record without an `id`.
    #[error("replacement record for '{0}' has no id")]
    MissingRecordId(String),
    /// Deferred intent failed to resolve.
    #[error("deferred mutation rejected: {0}")]
    Rejected(String),
}

// =============================================================================
// LOWERING
// =============================================================================

/// Array operator carried by the last character of a path.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Operator {
    Assign,
    Push,
    Remove,
    ReplaceById,
}

impl Operator {
    fn split(path: &str) -> (&str, Self) {
        match path.as_bytes().last() {
            Some(b'+') => (&path[..path.len() - 1], Self::Push),
            Some(b'-') => (&path[..path.len() - 1], Self::Remove),
            Some(b'!') => (&path[..path.len() - 1], Self::ReplaceById),
            _ => (path, Self::Assign),
        }
    }

    fn symbol(self) -> char {
        match self {
            Self::Assign => '=',
            Self::Push => '+',
            Self::Remove => '-',
            Self::ReplaceById => '!',
        }
    }
}

enum Operand {
    Literal(Value),
    Compute(ComputeFn),
}

impl Operand {
    fn resolve(self, current: &Value) -> Value {
        match self {
            Self::Literal(value) => value,
            Self::Compute(f) => f(current),
        }
    }
}

/// Apply `operand` at `segments` below `target`, building objects as needed.
fn apply_in(
    target: &mut Value,
    segments: &[Segment],
    operand: Operand,
    path: &str,
) -> Result<(), MutationError> {
    let Some((segment, rest)) = segments.split_first() else {
        let value = operand.resolve(target);
        deep_merge(target, value);
        return Ok(());
    };

    match segment {
        Segment::Key(key) => {
            if !target.is_object() {
                *target = Value::Object(Map::new());
            }
            let child = target
                .as_object_mut()
                .map(|map| map.entry(key.clone()).or_insert(Value::Null))
                .ok_or_else(|| MutationError::NotAnArray(path.to_string()))?;
            apply_in(child, rest, operand, path)
        }
        Segment::ById { field, id } => {
            let records = target
                .get_mut(field)
                .and_then(Value::as_array_mut)
                .ok_or_else(|| MutationError::NotAnArray(path.to_string()))?;
            let record = records
                .iter_mut()
                .find(|r| id_matches(r, id))
                .ok_or_else(|| MutationError::RecordNotFound {
                    path: path.to_string(),
                    id: id.clone(),
                })?;
            apply_in(record, rest, operand, path)
        }
        Segment::Project { .. } => Err(MutationError::ProjectionNotWritable(path.to_string())),
    }
}

fn leading_key(segment: &Segment) -> &str {
    match segment {
        Segment::Key(key) => key,
        Segment::ById { field, .. } | Segment::Project { field } => field,
    }
}

// =============================================================================
// ENGINE
// =============================================================================

/// Canonical state tree plus pending buffer for one session.
pub struct MutationEngine {
    /// Committed tree. Shared with snapshot holders, copied on write.
    state: Arc<Value>,
    /// Partial tree accumulated since the last commit.
    pending: Map<String, Value>,
    /// Lowered partials since the last flush.
    changes: Vec<Value>,
    /// Parked deferred intents.
    deferred: Mutex<FuturesUnordered<DeferredMutation>>,
    paths: PathCache,
}

impl Default for MutationEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl MutationEngine {
    /// Create an engine with an empty tree.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Value::Object(Map::new())),
            pending: Map::new(),
            changes: Vec::new(),
            deferred: Mutex::new(FuturesUnordered::new()),
            paths: PathCache::new(),
        }
    }

    /// Submit an intent. Malformed intents are logged and dropped.
    pub fn mutate(&mut self, mutation: impl Into<Mutation>) {
        match mutation.into() {
            Mutation::Batch(items) => {
                for item in items {
                    self.mutate(item);
                }
            }
            Mutation::Deferred(future) => self.park(future),
            other => {
                if let Err(e) = self.try_apply(other) {
                    warn!(error = %e, "dropping mutation");
                }
            }
        }
    }

    /// Submit an intent and wait for it, deferred parts included.
    ///
    /// Errors propagate through the returned result instead of being logged.
    pub fn mutate_async(&mut self, mutation: Mutation) -> BoxFuture<'_, Result<(), MutationError>> {
        async move {
            match mutation {
                Mutation::Deferred(future) => {
                    let resolved = future.await?;
                    self.mutate_async(resolved).await
                }
                Mutation::Batch(items) => {
                    for item in items {
                        self.mutate_async(item).await?;
                    }
                    Ok(())
                }
                other => self.try_apply(other),
            }
        }
        .boxed()
    }

    /// Fold in deferred intents that have already resolved, without waiting.
    /// Rejected intents are dropped. Returns how many were applied.
    pub fn resolve_deferred(&mut self) -> usize {
        let mut applied = 0;
        loop {
            let polled = {
                let parked = self.deferred.get_mut().unwrap_or_else(|e| e.into_inner());
                if parked.is_empty() {
                    break;
                }
                parked.next().now_or_never()
            };
            match polled {
                Some(Some(Ok(mutation))) => {
                    self.mutate(mutation);
                    applied += 1;
                }
                Some(Some(Err(e))) => debug!(error = %e, "deferred mutation dropped"),
                Some(None) | None => break,
            }
        }
        applied
    }

    /// Number of deferred intents still waiting.
    pub fn pending_deferred(&mut self) -> usize {
        self.deferred.get_mut().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Merge the pending buffer into the committed tree. The only commit
    /// point. Returns false if there was nothing to commit.
    pub fn apply_pending_merges(&mut self) -> bool {
        if self.pending.is_empty() {
            return false;
        }
        let pending = std::mem::take(&mut self.pending);
        let state = Arc::make_mut(&mut self.state);
        match state {
            Value::Object(map) => merge_maps(map, pending),
            other => *other = Value::Object(pending),
        }
        true
    }

    /// True if intents are waiting for the next commit.
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Read from the committed tree. Absent values are logged: after seeding
    /// every path a reader asks for should exist.
    pub fn get(&self, path: &str) -> Option<Cow<'_, Value>> {
        let found = self.paths.resolve(&self.state, path);
        if found.is_none() {
            warn!(path, "read of absent state path");
        }
        found
    }

    /// Committed tree. Callers must not hold on to it across a commit.
    pub fn all(&self) -> &Value {
        &self.state
    }

    /// Alias of [`MutationEngine::all`].
    pub fn raw(&self) -> &Value {
        self.all()
    }

    /// Shared handle to the committed tree. Later commits never alter it.
    pub fn snapshot(&self) -> Arc<Value> {
        self.state.clone()
    }

    /// Drain the lowered partials applied since the last flush, in order.
    pub fn flush_changes(&mut self) -> Vec<Value> {
        std::mem::take(&mut self.changes)
    }

    /// Replace the whole tree, dropping anything pending.
    pub fn replace_state(&mut self, state: Value) {
        self.pending.clear();
        self.changes.clear();
        self.state = Arc::new(match state {
            Value::Object(map) => Value::Object(map),
            _ => Value::Object(Map::new()),
        });
    }

    fn park(&mut self, future: DeferredMutation) {
        self.deferred
            .get_mut()
            .unwrap_or_else(|e| e.into_inner())
            .push(future);
    }

    fn try_apply(&mut self, mutation: Mutation) -> Result<(), MutationError> {
        match mutation {
            Mutation::Merge(value) => {
                if is_noop(&value) {
                    return Ok(());
                }
                if !value.is_object() {
                    return Err(MutationError::MalformedMerge(value.to_string()));
                }
                self.stage(value);
                Ok(())
            }
            Mutation::Set { path, value } => {
                if is_noop(&value) {
                    return Err(MutationError::EmptyValue(path));
                }
                let partial = self.lower(&path, Operand::Literal(value))?;
                self.stage(partial);
                Ok(())
            }
            Mutation::Compute { path, f } => {
                let partial = self.lower(&path, Operand::Compute(f))?;
                self.stage(partial);
                Ok(())
            }
            Mutation::Batch(items) => {
                for item in items {
                    self.try_apply(item)?;
                }
                Ok(())
            }
            Mutation::Deferred(future) => {
                self.park(future);
                Ok(())
            }
        }
    }

    /// Merge a lowered partial into the pending buffer and the change log.
    fn stage(&mut self, partial: Value) {
        let Value::Object(mut map) = partial else {
            return;
        };
        let id_taken = self.state.get(IMMUTABLE_KEY).is_some() || self.pending.contains_key(IMMUTABLE_KEY);
        if id_taken && map.remove(IMMUTABLE_KEY).is_some() {
            debug!("ignored write to {}", IMMUTABLE_KEY);
        }
        if map.is_empty() {
            return;
        }

        #[cfg(feature = "debug-tracing")]
        debug!(partial = %Value::Object(map.clone()), "staged mutation");

        self.changes.push(Value::Object(map.clone()));
        merge_maps(&mut self.pending, map);
    }

    /// Lower a `(path, operand)` pair to a partial tree.
    fn lower(&self, raw_path: &str, operand: Operand) -> Result<Value, MutationError> {
        let (path, op) = Operator::split(raw_path);
        let expr = self.paths.get_or_parse(path)?;
        if expr.has_projection() {
            return Err(MutationError::ProjectionNotWritable(path.to_string()));
        }

        let value = match (op, operand) {
            (Operator::Assign, operand) => return self.write(&expr, operand),
            (_, Operand::Literal(value)) => value,
            (_, Operand::Compute(_)) => {
                return Err(MutationError::FunctionOnOperator {
                    path: path.to_string(),
                    op: op.symbol(),
                })
            }
        };
        if op == Operator::ReplaceById && value.get("id").is_none() {
            return Err(MutationError::MissingRecordId(path.to_string()));
        }

        let mut entries = match self.view_get(&expr) {
            None => Vec::new(),
            Some(current) => match current.into_owned() {
                Value::Array(items) => items,
                _ => return Err(MutationError::NotAnArray(path.to_string())),
            },
        };

        match op {
            Operator::Assign => return self.write(&expr, Operand::Literal(value)),
            Operator::Push => push_entries(&mut entries, value),
            Operator::Remove => {
                remove_matching(&mut entries, &value);
            }
            Operator::ReplaceById => {
                if !replace_by_id(&mut entries, value) {
                    debug!(path, "replace-by-id matched no record");
                }
            }
        }

        self.write(&expr, Operand::Literal(Value::Array(entries)))
    }

    /// Build the partial tree that assigns `operand` at `expr`.
    fn write(&self, expr: &PathExpr, operand: Operand) -> Result<Value, MutationError> {
        let segments = expr.segments();
        let first_record = segments
            .iter()
            .position(|s| matches!(s, Segment::ById { .. }));

        let Some(idx) = first_record else {
            let keys: Vec<String> = segments.iter().map(|s| leading_key(s).to_string()).collect();
            let value = match operand {
                Operand::Literal(value) => value,
                Operand::Compute(f) => {
                    let current = self.view_get(expr);
                    f(current.as_deref().unwrap_or(&Value::Null))
                }
            };
            return Ok(nest(&keys, value));
        };

        // Arrays replace on merge, so the whole array holding the record is
        // copied, edited, and written back.
        let prefix: Vec<String> = segments[..idx]
            .iter()
            .map(|s| leading_key(s).to_string())
            .collect();
        let field = leading_key(&segments[idx]).to_string();

        let mut array_path = prefix.clone();
        array_path.push(field.clone());
        let array_expr = PathExpr::parse(&array_path.join("."))?;
        let records = match self.view_get(&array_expr) {
            Some(value) if value.is_array() => value.into_owned(),
            _ => return Err(MutationError::NotAnArray(array_expr.as_str().to_string())),
        };

        let mut holder = Map::new();
        holder.insert(field, records);
        let mut holder = Value::Object(holder);
        apply_in(&mut holder, &segments[idx..], operand, expr.as_str())?;

        Ok(nest(&prefix, holder))
    }

    /// Read through the committed tree with the pending buffer layered on top.
    fn view_get(&self, expr: &PathExpr) -> Option<Cow<'_, Value>> {
        let top = leading_key(expr.segments().first()?);
        let Some(staged) = self.pending.get(top) else {
            return expr.resolve(&self.state);
        };

        let combined = match self.state.get(top) {
            Some(committed) => merged(committed, staged),
            None => staged.clone(),
        };
        let mut root = Map::new();
        root.insert(top.to_string(), combined);
        let root = Value::Object(root);
        expr.resolve(&root).map(|v| Cow::Owned(v.into_owned()))
    }
}

impl fmt::Debug for MutationEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutationEngine")
            .field("state", &self.state)
            .field("pending", &self.pending)
            .field("changes", &self.changes.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn engine_with(seed: Value) -> MutationEngine {
        let mut engine = MutationEngine::new();
        engine.mutate(seed);
        engine.apply_pending_merges();
        engine.flush_changes();
        engine
    }

    fn read(engine: &MutationEngine, path: &str) -> Value {
        engine.get(path).map(Cow::into_owned).unwrap_or(Value::Null)
    }

    #[test]
    fn test_noop_mutations() {
        let mut engine = engine_with(json!({ "a": 1 }));
        engine.mutate(Value::Null);
        engine.mutate(json!({}));
        engine.mutate(Mutation::set("a", Value::Null));
        engine.mutate(Mutation::set("a", json!({})));
        assert!(!engine.apply_pending_merges());
        assert_eq!(engine.all(), &json!({ "a": 1 }));
    }

    #[test]
    fn test_object_merge() {
        let mut engine = MutationEngine::new();
        engine.mutate(json!({ "a": { "b": 1 } }));
        engine.mutate(json!({ "a": { "c": 2 } }));
        engine.apply_pending_merges();
        assert_eq!(read(&engine, "a.b"), json!(1));
        assert_eq!(read(&engine, "a.c"), json!(2));
    }

    #[test]
    fn test_array_replace_on_merge() {
        let mut engine = engine_with(json!({ "list": [1, 2] }));
        engine.mutate(json!({ "list": [3] }));
        engine.apply_pending_merges();
        assert_eq!(read(&engine, "list"), json!([3]));
    }

    #[test]
    fn test_push() {
        let mut engine = engine_with(json!({ "list": [4] }));
        engine.mutate(("list+", json!(5)));
        engine.apply_pending_merges();
        assert_eq!(read(&engine, "list"), json!([4, 5]));
    }

    #[test]
    fn test_push_to_absent_array() {
        let mut engine = engine_with(json!({ "a": {} }));
        engine.mutate(("a.items+", json!({ "id": 1 })));
        engine.apply_pending_merges();
        assert_eq!(read(&engine, "a.items"), json!([{ "id": 1 }]));
    }

    #[test]
    fn test_push_twice_in_one_tick() {
        let mut engine = engine_with(json!({ "list": [] }));
        engine.mutate(("list+", json!(1)));
        engine.mutate(("list+", json!(2)));
        engine.apply_pending_merges();
        assert_eq!(read(&engine, "list"), json!([1, 2]));
    }

    #[test]
    fn test_remove() {
        let mut engine = engine_with(json!({ "idList": [{ "id": 4 }, { "id": 3 }] }));
        engine.mutate(("idList-", json!({ "id": 3 })));
        engine.apply_pending_merges();
        assert_eq!(read(&engine, "idList"), json!([{ "id": 4 }]));
    }

    #[test]
    fn test_replace_by_id() {
        let mut engine = engine_with(json!({ "recs": [{ "id": 1, "v": 1, "w": 1 }, { "id": 2, "v": 2 }] }));
        engine.mutate(("recs!", json!({ "id": 1, "v": 10 })));
        engine.apply_pending_merges();
        assert_eq!(read(&engine, "recs"), json!([{ "id": 1, "v": 10 }, { "id": 2, "v": 2 }]));
    }

    #[test]
    fn test_modify_by_id_sub_path() {
        let mut engine = engine_with(json!({ "idList": [{ "id": 4 }, { "id": 3 }] }));
        engine.mutate(("idList:4.n", json!("z")));
        engine.apply_pending_merges();
        assert_eq!(read(&engine, "idList:4"), json!({ "id": 4, "n": "z" }));
        assert_eq!(read(&engine, "idList:3"), json!({ "id": 3 }));
    }

    #[test]
    fn test_modify_by_id_merges_record() {
        let mut engine = engine_with(json!({ "p": [{ "id": "a", "hp": 3, "pos": { "x": 1, "y": 1 } }] }));
        engine.mutate(("p:a", json!({ "pos": { "x": 5 } })));
        engine.apply_pending_merges();
        assert_eq!(read(&engine, "p:a"), json!({ "id": "a", "hp": 3, "pos": { "x": 5, "y": 1 } }));
    }

    #[test]
    fn test_nested_record_paths() {
        let mut engine = engine_with(json!({
            "world": { "teams": [{ "id": 1, "members": [{ "id": 7, "hp": 1 }] }] }
        }));
        engine.mutate(("world.teams:1.members:7.hp", json!(9)));
        engine.apply_pending_merges();
        assert_eq!(read(&engine, "world.teams:1.members:7.hp"), json!(9));
    }

    #[test]
    fn test_compute_plain_path() {
        let mut engine = engine_with(json!({ "score": 2 }));
        engine.mutate(Mutation::compute("score", |v| json!(v.as_i64().unwrap_or(0) + 3)));
        engine.apply_pending_merges();
        assert_eq!(read(&engine, "score"), json!(5));
    }

    #[test]
    fn test_compute_sees_pending_value() {
        let mut engine = engine_with(json!({ "score": 1 }));
        engine.mutate(json!({ "score": 10 }));
        engine.mutate(Mutation::compute("score", |v| json!(v.as_i64().unwrap_or(0) * 2)));
        engine.apply_pending_merges();
        assert_eq!(read(&engine, "score"), json!(20));
    }

    #[test]
    fn test_compute_by_id() {
        let mut engine = engine_with(json!({ "p": [{ "id": 1, "hp": 4 }] }));
        engine.mutate(Mutation::compute("p:1.hp", |v| json!(v.as_i64().unwrap_or(0) - 1)));
        engine.apply_pending_merges();
        assert_eq!(read(&engine, "p:1.hp"), json!(3));
    }

    #[test]
    fn test_function_on_operator_rejected() {
        let mut engine = engine_with(json!({ "list": [1] }));
        for path in ["list+", "list-", "list!"] {
            let err = engine
                .try_apply(Mutation::compute(path, |_| json!(2)))
                .unwrap_err();
            assert!(matches!(err, MutationError::FunctionOnOperator { .. }), "{path}");
            engine.mutate(Mutation::compute(path, |_| json!(2)));
        }
        assert!(!engine.apply_pending_merges());
        assert_eq!(read(&engine, "list"), json!([1]));
        assert!(engine.flush_changes().is_empty());
    }

    #[test]
    fn test_replace_by_id_requires_id() {
        let mut engine = engine_with(json!({ "recs": [{ "id": 1, "n": 0 }] }));
        let err = engine
            .try_apply(Mutation::set("recs!", json!({ "n": 5 })))
            .unwrap_err();
        assert!(matches!(err, MutationError::MissingRecordId(_)));

        engine.mutate(("recs!", json!({ "n": 5 })));
        assert!(!engine.apply_pending_merges());
        assert_eq!(read(&engine, "recs"), json!([{ "id": 1, "n": 0 }]));
    }

    #[test]
    fn test_missing_record_dropped() {
        let mut engine = engine_with(json!({ "list": [{ "id": 1 }] }));
        engine.mutate(("list:2.n", json!(1)));
        engine.mutate(("other", json!(true)));
        engine.apply_pending_merges();
        assert_eq!(read(&engine, "list"), json!([{ "id": 1 }]));
        assert_eq!(read(&engine, "other"), json!(true));
    }

    #[test]
    fn test_projection_not_writable() {
        let mut engine = engine_with(json!({ "list": [{ "id": 1 }] }));
        let err = engine.try_apply(Mutation::set("list*.n", json!(1))).unwrap_err();
        assert!(matches!(err, MutationError::ProjectionNotWritable(_)));
    }

    #[test]
    fn test_immutable_id() {
        let mut engine = engine_with(json!({ "_id": 1, "name": "save" }));
        engine.mutate(json!({ "_id": 99, "name": "renamed" }));
        engine.mutate(("_id", json!(100)));
        engine.apply_pending_merges();
        assert_eq!(read(&engine, "_id"), json!(1));
        assert_eq!(read(&engine, "name"), json!("renamed"));
    }

    #[test]
    fn test_id_set_once_when_absent() {
        let mut engine = MutationEngine::new();
        engine.mutate(json!({ "name": "save" }));
        engine.apply_pending_merges();
        engine.mutate(("_id", json!(7)));
        engine.mutate(json!({ "_id": 8 }));
        engine.apply_pending_merges();
        assert_eq!(read(&engine, "_id"), json!(7));
    }

    #[test]
    fn test_tick_atomicity() {
        let mut engine = engine_with(json!({ "a": 0, "b": 0 }));
        engine.mutate(json!({ "a": 1 }));
        engine.mutate(("b", json!(1)));
        assert_eq!(read(&engine, "a"), json!(0));
        assert_eq!(read(&engine, "b"), json!(0));
        engine.apply_pending_merges();
        assert_eq!(read(&engine, "a"), json!(1));
        assert_eq!(read(&engine, "b"), json!(1));
    }

    #[test]
    fn test_snapshot_unaffected_by_commit() {
        let mut engine = engine_with(json!({ "a": 1 }));
        let before = engine.snapshot();
        engine.mutate(json!({ "a": 2 }));
        engine.apply_pending_merges();
        assert_eq!(before.as_ref(), &json!({ "a": 1 }));
        assert_eq!(engine.all(), &json!({ "a": 2 }));
    }

    #[test]
    fn test_batch_in_order() {
        let mut engine = engine_with(json!({ "list": [] }));
        engine.mutate(Mutation::batch([
            Mutation::set("list+", json!(1)),
            Mutation::set("list+", json!(2)),
            Mutation::set("list-", json!(1)),
        ]));
        engine.apply_pending_merges();
        assert_eq!(read(&engine, "list"), json!([2]));
    }

    #[test]
    fn test_flush_changes() {
        let mut engine = engine_with(json!({ "list": [4] }));
        engine.mutate(json!({ "a": 1 }));
        engine.mutate(("list+", json!(5)));
        let changes = engine.flush_changes();
        assert_eq!(changes, vec![json!({ "a": 1 }), json!({ "list": [4, 5] })]);
        assert!(engine.flush_changes().is_empty());
    }

    #[test]
    fn test_resolve_ready_deferred() {
        let mut engine = engine_with(json!({ "a": 0 }));
        engine.mutate(Mutation::deferred(async { Ok(Mutation::set("a", json!(7))) }));
        engine.mutate(Mutation::deferred(async {
            Err(MutationError::Rejected("nope".into()))
        }));
        assert_eq!(engine.pending_deferred(), 2);
        assert_eq!(engine.resolve_deferred(), 1);
        assert_eq!(engine.pending_deferred(), 0);
        engine.apply_pending_merges();
        assert_eq!(read(&engine, "a"), json!(7));
    }

    #[test]
    fn test_unresolved_deferred_stays_parked() {
        let mut engine = MutationEngine::new();
        let (tx, rx) = tokio::sync::oneshot::channel::<Mutation>();
        engine.mutate(Mutation::deferred(async move {
            rx.await.map_err(|e| MutationError::Rejected(e.to_string()))
        }));
        assert_eq!(engine.resolve_deferred(), 0);
        assert_eq!(engine.pending_deferred(), 1);

        tx.send(Mutation::set("late", json!(true))).unwrap();
        assert_eq!(engine.resolve_deferred(), 1);
        engine.apply_pending_merges();
        assert_eq!(read(&engine, "late"), json!(true));
    }

    #[tokio::test]
    async fn test_mutate_async_propagates_rejection() {
        let mut engine = MutationEngine::new();
        let result = engine
            .mutate_async(Mutation::deferred(async {
                Err(MutationError::Rejected("boom".into()))
            }))
            .await;
        assert!(matches!(result, Err(MutationError::Rejected(_))));

        engine
            .mutate_async(Mutation::deferred(async { Ok(Mutation::merge(json!({ "x": 1 }))) }))
            .await
            .unwrap();
        engine.apply_pending_merges();
        assert_eq!(read(&engine, "x"), json!(1));
    }

    #[tokio::test]
    async fn test_mutate_async_reports_malformed() {
        let mut engine = MutationEngine::new();
        let result = engine.mutate_async(Mutation::merge(json!(3))).await;
        assert!(matches!(result, Err(MutationError::MalformedMerge(_))));
    }

    #[test]
    fn test_replace_state() {
        let mut engine = engine_with(json!({ "a": 1 }));
        engine.mutate(json!({ "b": 1 }));
        engine.replace_state(json!({ "c": 3 }));
        assert!(!engine.has_pending());
        assert_eq!(engine.all(), &json!({ "c": 3 }));
    }

    proptest! {
        #[test]
        fn prop_noop_mutations_never_change_reads(key in "[a-z]{1,6}", n in any::<i64>()) {
            let mut engine = engine_with(json!({ (key.clone()): { "n": n } }));
            let before = engine.all().clone();
            engine.mutate(Value::Null);
            engine.mutate(json!({}));
            engine.mutate(Mutation::set(key.clone(), Value::Null));
            engine.mutate(Mutation::set(format!("{key}.n"), json!({})));
            engine.apply_pending_merges();
            prop_assert_eq!(engine.all(), &before);
        }
    }
}
