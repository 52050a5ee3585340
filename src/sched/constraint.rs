//! Constraint extraction between task buckets.

use std::hash::Hash;

use crate::core::{ArcStr, Blake3Hasher, Hash32};
use crate::task::{AttrKey, Task};

/// Relative order of two bucket representatives, seen from the first one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Order {
    Before,
    After,
    /// Declarations pointing both ways, which can never be satisfied.
    Both,
    Unrelated,
}

/// Hash over everything that can influence the position of a task in the
/// partial order. Tasks with equal keys share a bucket.
pub(crate) fn constraint_key(task: &Task) -> Hash32 {
    let mut hasher = Blake3Hasher::new();
    hasher.field(task.kind().name());
    for key in [AttrKey::Before, AttrKey::After, AttrKey::ExtIn, AttrKey::ExtOut] {
        task.list(key).hash(&mut hasher);
    }
    task.maxjobs().hash(&mut hasher);
    hasher.finish32()
}

fn intersects(a: &[ArcStr], b: &[ArcStr]) -> bool {
    a.iter().any(|x| b.contains(x))
}

/// Production/consumption of extensions: a consumer runs after a producer.
fn compare_exts(a: &Task, b: &Task) -> Order {
    if intersects(a.list(AttrKey::ExtIn), b.list(AttrKey::ExtOut)) {
        Order::After
    } else if intersects(b.list(AttrKey::ExtIn), a.list(AttrKey::ExtOut)) {
        Order::Before
    } else {
        Order::Unrelated
    }
}

/// Explicit `before` / `after` declarations naming the other kind.
fn compare_partial(a: &Task, b: &Task) -> Order {
    let mentions = |task: &Task, key: AttrKey, name: &str| {
        task.list(key).iter().any(|k| k.as_ref() == name)
    };

    let a_name = a.kind().name();
    let b_name = b.kind().name();
    let before = mentions(a, AttrKey::Before, b_name) || mentions(b, AttrKey::After, a_name);
    let after = mentions(a, AttrKey::After, b_name) || mentions(b, AttrKey::Before, a_name);

    match (before, after) {
        (true, true) => Order::Both,
        (true, false) => Order::Before,
        (false, true) => Order::After,
        (false, false) => Order::Unrelated,
    }
}

/// The extension relation wins outright; explicit declarations are consulted
/// only when it says nothing.
pub(crate) fn compare(a: &Task, b: &Task) -> Order {
    match compare_exts(a, b) {
        Order::Unrelated => compare_partial(a, b),
        order => order,
    }
}
