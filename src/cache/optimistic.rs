//! Field-scoped optimistic patches and the ledger that rolls them back.
//!
//! Every pending mutation leaves one layer per cache entry it touched. A
//! layer records the operations it applied and, for each addressed field,
//! the value that field held before. Rolling back a mutation undoes the
//! newer layers on that entry, drops its own, then replays the newer ones,
//! so other pending mutations keep their speculative state.

use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;

use super::key::QueryKey;

/// Identifies one run of a mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MutationId(pub u64);

/// Closure used by [`PatchOp::Update`]: receives the current field value.
pub type UpdateFn = Arc<dyn Fn(Option<&Value>) -> Value + Send + Sync>;

/// One field edit, addressed by a JSON pointer (`""` is the whole payload).
#[derive(Clone)]
pub enum PatchOp {
  Set { path: String, value: Value },
  /// Integer add; a missing or non-integer field counts as 0
  Increment { path: String, by: i64 },
  /// Push onto an array, creating it if missing
  Append { path: String, value: Value },
  /// Drop array elements whose `field` pointer equals `equals`
  RemoveWhere {
    path: String,
    field: String,
    equals: Value,
  },
  Remove { path: String },
  Update { path: String, f: UpdateFn },
}

impl PatchOp {
  pub fn set(path: impl Into<String>, value: Value) -> Self {
    PatchOp::Set {
      path: path.into(),
      value,
    }
  }

  pub fn increment(path: impl Into<String>, by: i64) -> Self {
    PatchOp::Increment {
      path: path.into(),
      by,
    }
  }

  pub fn append(path: impl Into<String>, value: Value) -> Self {
    PatchOp::Append {
      path: path.into(),
      value,
    }
  }

  pub fn remove_where(path: impl Into<String>, field: impl Into<String>, equals: Value) -> Self {
    PatchOp::RemoveWhere {
      path: path.into(),
      field: field.into(),
      equals,
    }
  }

  pub fn remove(path: impl Into<String>) -> Self {
    PatchOp::Remove { path: path.into() }
  }

  pub fn update<F>(path: impl Into<String>, f: F) -> Self
  where
    F: Fn(Option<&Value>) -> Value + Send + Sync + 'static,
  {
    PatchOp::Update {
      path: path.into(),
      f: Arc::new(f),
    }
  }

  pub fn path(&self) -> &str {
    match self {
      PatchOp::Set { path, .. }
      | PatchOp::Increment { path, .. }
      | PatchOp::Append { path, .. }
      | PatchOp::RemoveWhere { path, .. }
      | PatchOp::Remove { path }
      | PatchOp::Update { path, .. } => path,
    }
  }

  fn apply(&self, root: &mut Value) {
    match self {
      PatchOp::Set { path, value } => write_pointer(root, path, value.clone()),
      PatchOp::Increment { path, by } => {
        let current = root.pointer(path).and_then(Value::as_i64).unwrap_or(0);
        write_pointer(root, path, Value::from(current.saturating_add(*by)));
      }
      PatchOp::Append { path, value } => match root.pointer_mut(path) {
        Some(Value::Array(items)) => items.push(value.clone()),
        _ => write_pointer(root, path, Value::Array(vec![value.clone()])),
      },
      PatchOp::RemoveWhere {
        path,
        field,
        equals,
      } => {
        if let Some(Value::Array(items)) = root.pointer_mut(path) {
          items.retain(|item| item.pointer(field) != Some(equals));
        }
      }
      PatchOp::Remove { path } => remove_pointer(root, path),
      PatchOp::Update { path, f } => {
        let next = f(root.pointer(path));
        write_pointer(root, path, next);
      }
    }
  }
}

impl fmt::Debug for PatchOp {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      PatchOp::Set { path, value } => write!(f, "Set({path} = {value})"),
      PatchOp::Increment { path, by } => write!(f, "Increment({path} += {by})"),
      PatchOp::Append { path, value } => write!(f, "Append({path} << {value})"),
      PatchOp::RemoveWhere {
        path,
        field,
        equals,
      } => write!(f, "RemoveWhere({path}[{field} == {equals}])"),
      PatchOp::Remove { path } => write!(f, "Remove({path})"),
      PatchOp::Update { path, .. } => write!(f, "Update({path})"),
    }
  }
}

/// Optimistic edits to apply to every cache entry a matcher selects.
#[derive(Debug, Clone)]
pub struct OptimisticPatch {
  pub target: super::key::KeyMatcher,
  pub ops: Vec<PatchOp>,
}

impl OptimisticPatch {
  pub fn new(target: impl Into<super::key::KeyMatcher>, ops: Vec<PatchOp>) -> Self {
    Self {
      target: target.into(),
      ops,
    }
  }
}

/// How to put a field back the way it was.
#[derive(Debug, Clone)]
enum Previous {
  /// Nothing was there; the op created it
  Missing,
  /// Overwrite with the old value
  Value(Value),
  /// An array element was removed; insert it back at its index
  Element(Value),
}

/// The state of the shallowest location a single op changed.
#[derive(Debug, Clone)]
struct FieldSnapshot {
  path: String,
  previous: Previous,
}

impl FieldSnapshot {
  /// Capture what `op` is about to change in `root`.
  ///
  /// Writes through missing parents create them, and writes through a
  /// scalar parent replace it with an object, so the snapshot is taken at
  /// the deepest part of the path that already exists.
  fn capture(op: &PatchOp, root: &Value) -> Self {
    let path = op.path();
    if let PatchOp::Remove { .. } = op {
      let previous = match root.pointer(path) {
        Some(prev) if parent_is_array(root, path) => Previous::Element(prev.clone()),
        Some(prev) => Previous::Value(prev.clone()),
        None => Previous::Missing,
      };
      return Self {
        path: path.to_string(),
        previous,
      };
    }

    let mut existing = String::new();
    for token in path.split('/').skip(1) {
      let next = format!("{existing}/{token}");
      if root.pointer(&next).is_some() {
        existing = next;
        continue;
      }
      return match root.pointer(&existing) {
        Some(Value::Object(_)) | Some(Value::Array(_)) | None => Self {
          path: next,
          previous: Previous::Missing,
        },
        Some(scalar) => Self {
          path: existing,
          previous: Previous::Value(scalar.clone()),
        },
      };
    }
    Self {
      path: path.to_string(),
      previous: root
        .pointer(path)
        .cloned()
        .map_or(Previous::Missing, Previous::Value),
    }
  }

  fn restore(&self, root: &mut Value) {
    match &self.previous {
      Previous::Missing => remove_pointer(root, &self.path),
      Previous::Value(prev) => write_pointer(root, &self.path, prev.clone()),
      Previous::Element(prev) => insert_element(root, &self.path, prev.clone()),
    }
  }
}

#[derive(Debug)]
struct Layer {
  mutation: MutationId,
  key: QueryKey,
  ops: Vec<PatchOp>,
  snapshots: Vec<FieldSnapshot>,
}

fn apply_ops(ops: &[PatchOp], value: &mut Value) -> Vec<FieldSnapshot> {
  ops
    .iter()
    .map(|op| {
      let snapshot = FieldSnapshot::capture(op, value);
      op.apply(value);
      snapshot
    })
    .collect()
}

fn undo(snapshots: &[FieldSnapshot], value: &mut Value) {
  for snap in snapshots.iter().rev() {
    snap.restore(value);
  }
}

/// Pending optimistic layers, in mutation call order.
#[derive(Debug, Default)]
pub struct OptimisticLedger {
  layers: Vec<Layer>,
}

impl OptimisticLedger {
  pub fn new() -> Self {
    Self::default()
  }

  /// Apply `ops` to `current` on behalf of `mutation` and record the layer.
  pub fn apply(
    &mut self,
    mutation: MutationId,
    key: &QueryKey,
    ops: Vec<PatchOp>,
    current: &Value,
  ) -> Value {
    let mut value = current.clone();
    let snapshots = apply_ops(&ops, &mut value);
    self.layers.push(Layer {
      mutation,
      key: key.clone(),
      ops,
      snapshots,
    });
    value
  }

  /// Remove `mutation`'s layer on `key` and return the resulting payload,
  /// or `None` if that mutation never patched `key`.
  pub fn rollback(&mut self, mutation: MutationId, key: &QueryKey, current: &Value) -> Option<Value> {
    let positions: Vec<usize> = self
      .layers
      .iter()
      .enumerate()
      .filter(|(_, l)| &l.key == key)
      .map(|(i, _)| i)
      .collect();
    let at = positions
      .iter()
      .position(|&i| self.layers[i].mutation == mutation)?;

    let mut value = current.clone();
    for &i in positions[at..].iter().rev() {
      undo(&self.layers[i].snapshots, &mut value);
    }

    self.layers.remove(positions[at]);

    // Everything after the removed layer shifted down by one
    for &i in &positions[at + 1..] {
      let layer = &mut self.layers[i - 1];
      layer.snapshots = apply_ops(&layer.ops, &mut value);
    }
    Some(value)
  }

  /// Forget `mutation`'s snapshots once its write has been confirmed.
  pub fn commit(&mut self, mutation: MutationId) {
    self.layers.retain(|l| l.mutation != mutation);
  }

  /// Replay pending layers for `key` over freshly fetched server data.
  pub fn rebase(&mut self, key: &QueryKey, fresh: &Value) -> Value {
    let mut value = fresh.clone();
    for layer in self.layers.iter_mut().filter(|l| &l.key == key) {
      layer.snapshots = apply_ops(&layer.ops, &mut value);
    }
    value
  }

  pub fn has_pending(&self, key: &QueryKey) -> bool {
    self.layers.iter().any(|l| &l.key == key)
  }

  /// Keys `mutation` currently holds layers on.
  pub fn keys_for(&self, mutation: MutationId) -> Vec<QueryKey> {
    self
      .layers
      .iter()
      .filter(|l| l.mutation == mutation)
      .map(|l| l.key.clone())
      .collect()
  }

  pub fn clear(&mut self) {
    self.layers.clear();
  }
}

fn unescape(token: &str) -> String {
  token.replace("~1", "/").replace("~0", "~")
}

fn tokens(path: &str) -> Vec<String> {
  path.split('/').skip(1).map(unescape).collect()
}

/// Write `value` at `path`, creating intermediate objects as needed.
fn write_pointer(root: &mut Value, path: &str, value: Value) {
  if path.is_empty() {
    *root = value;
    return;
  }
  let tokens = tokens(path);
  let Some((last, parents)) = tokens.split_last() else {
    return;
  };

  let mut node = root;
  for token in parents {
    node = match node {
      Value::Array(items) => match token.parse::<usize>() {
        Ok(i) if i < items.len() => &mut items[i],
        _ => return,
      },
      other => {
        if !other.is_object() {
          *other = Value::Object(Map::new());
        }
        match other {
          Value::Object(map) => map.entry(token.clone()).or_insert(Value::Null),
          _ => return,
        }
      }
    };
  }

  match node {
    Value::Array(items) => match last.parse::<usize>() {
      Ok(i) if i < items.len() => items[i] = value,
      Ok(i) if i == items.len() => items.push(value),
      _ => {}
    },
    other => {
      if !other.is_object() {
        *other = Value::Object(Map::new());
      }
      if let Value::Object(map) = other {
        map.insert(last.clone(), value);
      }
    }
  }
}

/// Split a non-root pointer into its parent pointer and unescaped last token.
fn split_parent(path: &str) -> Option<(&str, String)> {
  let i = path.rfind('/')?;
  Some((&path[..i], unescape(&path[i + 1..])))
}

fn parent_is_array(root: &Value, path: &str) -> bool {
  split_parent(path).is_some_and(|(parent, _)| matches!(root.pointer(parent), Some(Value::Array(_))))
}

/// Put `value` back into the array at `path`, shifting later elements up.
fn insert_element(root: &mut Value, path: &str, value: Value) {
  let Some((parent, last)) = split_parent(path) else {
    return;
  };
  if let (Some(Value::Array(items)), Ok(i)) = (root.pointer_mut(parent), last.parse::<usize>()) {
    if i <= items.len() {
      items.insert(i, value);
    }
  }
}

fn remove_pointer(root: &mut Value, path: &str) {
  if path.is_empty() {
    *root = Value::Null;
    return;
  }
  let Some((parent, last)) = split_parent(path) else {
    return;
  };
  match root.pointer_mut(parent) {
    Some(Value::Object(map)) => {
      map.remove(&last);
    }
    Some(Value::Array(items)) => {
      if let Ok(i) = last.parse::<usize>() {
        if i < items.len() {
          items.remove(i);
        }
      }
    }
    _ => {}
  }
}
