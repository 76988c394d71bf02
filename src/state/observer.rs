//! Change Detection
//!
//! Holds the previous and current committed snapshots and fires registered
//! watches whose projected values differ between them.
//!
//! Two watch families:
//! - object watches compare `focus(current)` with `focus(prior)`
//! - array watches compare records of `focus(..)` keyed by their `id` field
//!
//! Callbacks may return a [`Mutation`]. Reactions are collected and handed back
//! to the caller, which submits them for the next commit.

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tracing::error;

use crate::core::path::{PathCache, PathExpr};
use crate::state::mutation::Mutation;

/// Closure focus: projects a value out of a snapshot.
pub type SelectFn = Arc<dyn Fn(&Value) -> Option<Value> + Send + Sync>;

/// What a watch looks at.
#[derive(Clone)]
pub enum Focus {
    /// Dot-string path, parsed once.
    Path(String),
    /// Arbitrary projection.
    Select(SelectFn),
}

impl Focus {
    /// Closure focus.
    pub fn select<F>(f: F) -> Self
    where
        F: Fn(&Value) -> Option<Value> + Send + Sync + 'static,
    {
        Self::Select(Arc::new(f))
    }
}

impl From<&str> for Focus {
    fn from(path: &str) -> Self {
        Self::Path(path.to_string())
    }
}

impl From<String> for Focus {
    fn from(path: String) -> Self {
        Self::Path(path)
    }
}

/// Gate for [`ChangeTracker::on_change_to`].
#[derive(Clone)]
pub enum Condition {
    /// Projected value equals this literal.
    Equals(Value),
    /// Projected value satisfies a predicate.
    Predicate(Arc<dyn Fn(Option<&Value>) -> bool + Send + Sync>),
}

impl Condition {
    /// Predicate condition.
    pub fn when<F>(f: F) -> Self
    where
        F: Fn(Option<&Value>) -> bool + Send + Sync + 'static,
    {
        Self::Predicate(Arc::new(f))
    }

    fn holds(&self, value: Option<&Value>) -> bool {
        match self {
            Self::Equals(expected) => value == Some(expected),
            Self::Predicate(f) => f(value),
        }
    }
}

impl From<Value> for Condition {
    fn from(value: Value) -> Self {
        Self::Equals(value)
    }
}

/// Arguments of an object-watch callback.
#[derive(Debug)]
pub struct Change<'a> {
    /// Projection of the current snapshot.
    pub current: Option<&'a Value>,
    /// Projection of the prior snapshot, `None` if absent or no prior exists.
    pub prior: Option<&'a Value>,
    /// Static data given at registration.
    pub data: &'a Value,
}

/// Arguments of an array-watch callback.
#[derive(Debug)]
pub struct ElementChange<'a> {
    /// The record's `id`.
    pub id: &'a Value,
    /// Record in the current snapshot.
    pub current: Option<&'a Value>,
    /// Record in the prior snapshot.
    pub prior: Option<&'a Value>,
    /// Static data given at registration.
    pub data: &'a Value,
}

type ChangeCallback = Box<dyn FnMut(&Change<'_>) -> Option<Mutation> + Send + Sync>;
type ElementCallback = Box<dyn FnMut(&ElementChange<'_>) -> Option<Mutation> + Send + Sync>;

/// Disposal handle returned by every registration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WatchHandle(u64);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ElementKind {
    Added,
    Changed,
    Removed,
}

enum Projector {
    Path(Arc<PathExpr>),
    Select(SelectFn),
    Invalid,
}

impl Projector {
    fn project<'a>(&self, snapshot: &'a Value) -> Option<Cow<'a, Value>> {
        match self {
            Self::Path(expr) => expr.resolve(snapshot),
            Self::Select(f) => f(snapshot).map(Cow::Owned),
            Self::Invalid => None,
        }
    }

    fn records<'a>(&self, snapshot: &'a Value) -> Cow<'a, [Value]> {
        match self.project(snapshot) {
            Some(Cow::Borrowed(Value::Array(items))) => Cow::Borrowed(items.as_slice()),
            Some(Cow::Owned(Value::Array(items))) => Cow::Owned(items),
            _ => Cow::Borrowed(&[]),
        }
    }
}

enum WatchKind {
    Object {
        condition: Option<Condition>,
        callback: ChangeCallback,
    },
    Array {
        kind: ElementKind,
        callback: ElementCallback,
    },
}

struct Watch {
    focus: Projector,
    data: Value,
    kind: WatchKind,
}

fn record_id<'a>(record: &'a Value, focus: &str) -> Option<&'a Value> {
    let id = record.get("id");
    if id.is_none() {
        error!(focus, record = %record, "array watch record has no id, skipping");
    }
    id
}

fn find_record<'a>(records: &'a [Value], id: &Value) -> Option<&'a Value> {
    records.iter().find(|r| r.get("id") == Some(id))
}

impl Watch {
    fn label(&self) -> &str {
        match &self.focus {
            Projector::Path(expr) => expr.as_str(),
            Projector::Select(_) => "<select>",
            Projector::Invalid => "<invalid>",
        }
    }

    fn detect(&mut self, current: &Value, prior: Option<&Value>, reactions: &mut Vec<Mutation>) {
        let label = self.label().to_string();
        let data = &self.data;

        match &mut self.kind {
            WatchKind::Object {
                condition,
                callback,
            } => {
                let now = self.focus.project(current);
                let before = prior.and_then(|p| self.focus.project(p));
                let changed = prior.is_none() || now.as_deref() != before.as_deref();
                let matched = condition
                    .as_ref()
                    .map_or(true, |c| c.holds(now.as_deref()));

                if changed && matched {
                    reactions.extend(callback(&Change {
                        current: now.as_deref(),
                        prior: before.as_deref(),
                        data,
                    }));
                }
            }
            WatchKind::Array { kind, callback } => {
                let now = self.focus.records(current);
                let before = prior.map(|p| self.focus.records(p));

                match kind {
                    ElementKind::Added => {
                        for record in now.iter() {
                            let Some(id) = record_id(record, &label) else {
                                continue;
                            };
                            let existed = before
                                .as_ref()
                                .is_some_and(|b| find_record(b, id).is_some());
                            if !existed {
                                reactions.extend(callback(&ElementChange {
                                    id,
                                    current: Some(record),
                                    prior: None,
                                    data,
                                }));
                            }
                        }
                    }
                    ElementKind::Changed => {
                        for record in now.iter() {
                            let Some(id) = record_id(record, &label) else {
                                continue;
                            };
                            let old = match &before {
                                None => None,
                                Some(b) => match find_record(b, id) {
                                    Some(old) if old != record => Some(old),
                                    _ => continue,
                                },
                            };
                            reactions.extend(callback(&ElementChange {
                                id,
                                current: Some(record),
                                prior: old,
                                data,
                            }));
                        }
                    }
                    ElementKind::Removed => {
                        let Some(before) = &before else {
                            return;
                        };
                        for record in before.iter() {
                            let Some(id) = record_id(record, &label) else {
                                continue;
                            };
                            if find_record(&now, id).is_none() {
                                reactions.extend(callback(&ElementChange {
                                    id,
                                    current: None,
                                    prior: Some(record),
                                    data,
                                }));
                            }
                        }
                    }
                }
            }
        }
    }
}

// =============================================================================
// TRACKER
// =============================================================================

/// Prior/current snapshot pair plus watch list.
pub struct ChangeTracker {
    prior: Option<Arc<Value>>,
    current: Option<Arc<Value>>,
    watches: BTreeMap<WatchHandle, Watch>,
    next_handle: u64,
    /// Reactions produced while registering, returned by the next detect pass.
    queued: Mutex<Vec<Mutation>>,
    paths: PathCache,
}

impl Default for ChangeTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ChangeTracker {
    /// Create a tracker with no snapshots.
    pub fn new() -> Self {
        Self {
            prior: None,
            current: None,
            watches: BTreeMap::new(),
            next_handle: 0,
            queued: Mutex::new(Vec::new()),
            paths: PathCache::new(),
        }
    }

    /// Shift current to prior and install a new current snapshot.
    pub fn update_state(&mut self, snapshot: Arc<Value>) {
        self.prior = self.current.replace(snapshot);
    }

    /// Current snapshot, if any.
    pub fn current(&self) -> Option<&Value> {
        self.current.as_deref()
    }

    /// Prior snapshot, if any.
    pub fn prior(&self) -> Option<&Value> {
        self.prior.as_deref()
    }

    /// Fire every watch whose projection changed. Returns the reactions of all
    /// callbacks, registration-time ones first.
    pub fn detect_changes_and_notify_observers(&mut self) -> Vec<Mutation> {
        let mut reactions = std::mem::take(self.queued.get_mut().unwrap_or_else(|e| e.into_inner()));
        let Some(current) = self.current.clone() else {
            return reactions;
        };
        let prior = self.prior.clone();

        for watch in self.watches.values_mut() {
            watch.detect(&current, prior.as_deref(), &mut reactions);
        }
        reactions
    }

    /// Watch a projected value. Invoked right away against the snapshots
    /// already installed.
    pub fn on_change_of<F>(&mut self, focus: impl Into<Focus>, callback: F, data: Value) -> WatchHandle
    where
        F: FnMut(&Change<'_>) -> Option<Mutation> + Send + Sync + 'static,
    {
        self.register_object(focus.into(), None, Box::new(callback), data)
    }

    /// Watch a projected value, firing only while `condition` holds. A literal
    /// condition means equality.
    pub fn on_change_to<F>(
        &mut self,
        focus: impl Into<Focus>,
        condition: impl Into<Condition>,
        callback: F,
        data: Value,
    ) -> WatchHandle
    where
        F: FnMut(&Change<'_>) -> Option<Mutation> + Send + Sync + 'static,
    {
        self.register_object(focus.into(), Some(condition.into()), Box::new(callback), data)
    }

    /// Watch records appearing in an array. Fires once per record already
    /// present at registration.
    pub fn on_element_added<F>(&mut self, focus: impl Into<Focus>, callback: F, data: Value) -> WatchHandle
    where
        F: FnMut(&ElementChange<'_>) -> Option<Mutation> + Send + Sync + 'static,
    {
        self.register_array(focus.into(), ElementKind::Added, Box::new(callback), data)
    }

    /// Watch records whose content changed between snapshots.
    pub fn on_element_changed<F>(&mut self, focus: impl Into<Focus>, callback: F, data: Value) -> WatchHandle
    where
        F: FnMut(&ElementChange<'_>) -> Option<Mutation> + Send + Sync + 'static,
    {
        self.register_array(focus.into(), ElementKind::Changed, Box::new(callback), data)
    }

    /// Watch records disappearing from an array.
    pub fn on_element_removed<F>(&mut self, focus: impl Into<Focus>, callback: F, data: Value) -> WatchHandle
    where
        F: FnMut(&ElementChange<'_>) -> Option<Mutation> + Send + Sync + 'static,
    {
        self.register_array(focus.into(), ElementKind::Removed, Box::new(callback), data)
    }

    /// Added, changed and removed watches on the same array.
    pub fn on_element<A, C, R>(
        &mut self,
        focus: impl Into<Focus>,
        added: A,
        changed: C,
        removed: R,
        data: Value,
    ) -> [WatchHandle; 3]
    where
        A: FnMut(&ElementChange<'_>) -> Option<Mutation> + Send + Sync + 'static,
        C: FnMut(&ElementChange<'_>) -> Option<Mutation> + Send + Sync + 'static,
        R: FnMut(&ElementChange<'_>) -> Option<Mutation> + Send + Sync + 'static,
    {
        let focus = focus.into();
        [
            self.on_element_added(focus.clone(), added, data.clone()),
            self.on_element_changed(focus.clone(), changed, data.clone()),
            self.on_element_removed(focus, removed, data),
        ]
    }

    /// Project `focus` over the current snapshot.
    pub fn current_value(&self, focus: impl Into<Focus>) -> Option<Value> {
        let current = self.current.as_deref()?;
        self.projector(focus.into())
            .project(current)
            .map(Cow::into_owned)
    }

    /// Dispose of a watch. Returns false if the handle was unknown.
    pub fn remove_watch(&mut self, handle: WatchHandle) -> bool {
        self.watches.remove(&handle).is_some()
    }

    /// Number of live watches.
    pub fn watch_count(&self) -> usize {
        self.watches.len()
    }

    fn projector(&self, focus: Focus) -> Projector {
        match focus {
            Focus::Select(f) => Projector::Select(f),
            Focus::Path(raw) => match self.paths.get_or_parse(&raw) {
                Ok(expr) => Projector::Path(expr),
                Err(e) => {
                    error!(path = %raw, error = %e, "invalid watch focus");
                    Projector::Invalid
                }
            },
        }
    }

    fn insert(&mut self, watch: Watch) -> WatchHandle {
        let handle = WatchHandle(self.next_handle);
        self.next_handle += 1;
        self.watches.insert(handle, watch);
        handle
    }

    fn queue(&mut self, reaction: Option<Mutation>) {
        if let Some(mutation) = reaction {
            self.queued
                .get_mut()
                .unwrap_or_else(|e| e.into_inner())
                .push(mutation);
        }
    }

    fn register_object(
        &mut self,
        focus: Focus,
        condition: Option<Condition>,
        mut callback: ChangeCallback,
        data: Value,
    ) -> WatchHandle {
        let focus = self.projector(focus);

        if let Some(current) = self.current.clone() {
            let prior = self.prior.clone();
            let now = focus.project(&current);
            let before = prior.as_deref().and_then(|p| focus.project(p));
            let matched = condition
                .as_ref()
                .map_or(true, |c| c.holds(now.as_deref()));
            if matched {
                let reaction = callback(&Change {
                    current: now.as_deref(),
                    prior: before.as_deref(),
                    data: &data,
                });
                self.queue(reaction);
            }
        }

        self.insert(Watch {
            focus,
            data,
            kind: WatchKind::Object {
                condition,
                callback,
            },
        })
    }

    fn register_array(
        &mut self,
        focus: Focus,
        kind: ElementKind,
        mut callback: ElementCallback,
        data: Value,
    ) -> WatchHandle {
        let focus = self.projector(focus);

        if kind == ElementKind::Added {
            if let Some(current) = self.current.clone() {
                let label = match &focus {
                    Projector::Path(expr) => expr.as_str().to_string(),
                    _ => String::from("<select>"),
                };
                for record in focus.records(&current).iter() {
                    let Some(id) = record_id(record, &label) else {
                        continue;
                    };
                    let reaction = callback(&ElementChange {
                        id,
                        current: Some(record),
                        prior: None,
                        data: &data,
                    });
                    self.queue(reaction);
                }
            }
        }

        self.insert(Watch {
            focus,
            data,
            kind: WatchKind::Array { kind, callback },
        })
    }
}
