//! Path Expressions
//!
//! Dot-separated addressing into a JSON state tree.
//!
//! ```text
//! players.count          plain field access
//! players.list:7.hp      record with `id == 7` in `players.list`, then `hp`
//! players.list*.hp       `hp` of every record in `players.list`
//! ```
//!
//! Parsing is memoized per literal path string through [`PathCache`].

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use serde_json::Value;
use thiserror::Error;

// =============================================================================
// SEGMENTS
// =============================================================================

/// One step of a parsed path.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Segment {
    /// Descend into an object field.
    Key(String),
    /// Select the record whose `id` matches, from the array at `field`.
    ById {
        /// Field holding the array.
        field: String,
        /// Raw id text as written in the path.
        id: String,
    },
    /// Project the remaining path over every record of the array at `field`.
    Project {
        /// Field holding the array.
        field: String,
    },
}

/// Path parse errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PathError {
    /// Path string is empty.
    #[error("empty path")]
    Empty,
    /// A segment between two dots is empty.
    #[error("empty segment in path '{0}'")]
    EmptySegment(String),
    /// `field:` with nothing after the colon.
    #[error("missing record id in path '{0}'")]
    MissingId(String),
}

/// A parsed path expression.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PathExpr {
    raw: String,
    segments: Vec<Segment>,
}

impl PathExpr {
    /// Parse a dot-separated path.
    ///
    /// `:` and `*` are only interpreted when they occur in the raw string, so
    /// plain paths take a straight split.
    pub fn parse(raw: &str) -> Result<Self, PathError> {
        if raw.is_empty() {
            return Err(PathError::Empty);
        }

        let special = raw.contains(':') || raw.contains('*');
        let mut segments = Vec::new();

        for part in raw.split('.') {
            if part.is_empty() {
                return Err(PathError::EmptySegment(raw.to_string()));
            }

            if !special {
                segments.push(Segment::Key(part.to_string()));
                continue;
            }

            if let Some((field, id)) = part.split_once(':') {
                if id.is_empty() {
                    return Err(PathError::MissingId(raw.to_string()));
                }
                if field.is_empty() {
                    return Err(PathError::EmptySegment(raw.to_string()));
                }
                segments.push(Segment::ById {
                    field: field.to_string(),
                    id: id.to_string(),
                });
            } else if let Some(field) = part.strip_suffix('*') {
                if field.is_empty() {
                    return Err(PathError::EmptySegment(raw.to_string()));
                }
                segments.push(Segment::Project {
                    field: field.to_string(),
                });
            } else {
                segments.push(Segment::Key(part.to_string()));
            }
        }

        Ok(Self {
            raw: raw.to_string(),
            segments,
        })
    }

    /// Path text as given.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Parsed segments.
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// True if the path contains a wildcard projection.
    pub fn has_projection(&self) -> bool {
        self.segments
            .iter()
            .any(|s| matches!(s, Segment::Project { .. }))
    }

    /// Resolve this path against a tree.
    pub fn resolve<'a>(&self, root: &'a Value) -> Option<Cow<'a, Value>> {
        resolve_segments(&self.segments, root)
    }
}

// =============================================================================
// RESOLUTION
// =============================================================================

/// Does `record.id` match the id text from a path?
///
/// Numeric ids compare by their decimal form, string ids by exact text.
pub fn id_matches(record: &Value, id: &str) -> bool {
    match record.get("id") {
        Some(Value::Number(n)) => n.to_string() == id,
        Some(Value::String(s)) => s == id,
        _ => false,
    }
}

/// Find the first record in `array` whose `id` matches.
pub fn find_by_id<'a>(array: &'a [Value], id: &str) -> Option<&'a Value> {
    array.iter().find(|r| id_matches(r, id))
}

/// Walk `segments` from `root`.
pub fn resolve_segments<'a>(segments: &[Segment], root: &'a Value) -> Option<Cow<'a, Value>> {
    let mut current = root;

    for (idx, segment) in segments.iter().enumerate() {
        match segment {
            Segment::Key(key) => {
                current = current.as_object()?.get(key)?;
            }
            Segment::ById { field, id } => {
                let array = current.as_object()?.get(field)?.as_array()?;
                current = find_by_id(array, id)?;
            }
            Segment::Project { field } => {
                let array = current.as_object()?.get(field)?.as_array()?;
                let rest = &segments[idx + 1..];
                let projected = array
                    .iter()
                    .filter_map(|record| resolve_segments(rest, record).map(Cow::into_owned))
                    .collect();
                return Some(Cow::Owned(Value::Array(projected)));
            }
        }
    }

    Some(Cow::Borrowed(current))
}

/// Parse and resolve in one step. Invalid paths resolve to `None`.
pub fn get<'a>(root: &'a Value, path: &str) -> Option<Cow<'a, Value>> {
    PathExpr::parse(path).ok()?.resolve(root)
}

// =============================================================================
// CACHE
// =============================================================================

/// Distinct paths a [`PathCache`] holds before it starts over.
pub const PATH_CACHE_CAPACITY: usize = 4096;

/// Memoized path parsing, keyed by the literal path string.
///
/// Pure memoization: entries do not depend on any particular tree. Paths
/// built per player or per record (`players:{id}.score`) add one entry
/// each, so the cache is cleared once it reaches its capacity.
#[derive(Debug)]
pub struct PathCache {
    entries: RwLock<BTreeMap<String, Arc<PathExpr>>>,
    capacity: usize,
}

impl Default for PathCache {
    fn default() -> Self {
        Self::with_capacity(PATH_CACHE_CAPACITY)
    }
}

impl PathCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty cache holding at most `capacity` paths.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: RwLock::new(BTreeMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Return the cached parse of `raw`, parsing it on first use.
    pub fn get_or_parse(&self, raw: &str) -> Result<Arc<PathExpr>, PathError> {
        {
            let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
            if let Some(expr) = entries.get(raw) {
                return Ok(expr.clone());
            }
        }

        let expr = Arc::new(PathExpr::parse(raw)?);
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        if entries.len() >= self.capacity && !entries.contains_key(raw) {
            entries.clear();
        }
        Ok(entries.entry(raw.to_string()).or_insert(expr).clone())
    }

    /// Resolve `raw` against `root` using the cache.
    pub fn resolve<'a>(&self, root: &'a Value, raw: &str) -> Option<Cow<'a, Value>> {
        self.get_or_parse(raw).ok()?.resolve(root)
    }

    /// Number of distinct paths parsed so far.
    pub fn cached_len(&self) -> usize {
        self.entries.read().unwrap_or_else(|e| e.into_inner()).len()
    }
}
