//! Reconciliation diff primitives.
//!
//! This library computes the change sets a reconciliation pass has to push to
//! a device in order to converge applied state to desired state. Key concepts:
//!
//! - **Desired state**: What the controller says the router should look like.
//! - **Applied state**: What has been successfully pushed to the device.
//! - **Plan**: The ordered list of additions, removals and replacements.
//!
//! # Invariants
//!
//! - Planning is pure; nothing here talks to a device
//! - Plans are deterministic given the same inputs (desired order, then applied order)
//! - An empty plan means applied already equals desired

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Result of diffing two keyed collections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyedPlan<T> {
    /// Entries whose key is desired but not applied, in desired order.
    pub added: Vec<T>,

    /// Entries whose key is applied but no longer desired, in applied order.
    pub removed: Vec<T>,

    /// Entries present on both sides whose payload changed.
    pub changed: Vec<Changed<T>>,
}

/// An entry whose key stayed the same but whose payload moved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Changed<T> {
    pub old: T,
    pub new: T,
}

impl<T> KeyedPlan<T> {
    /// True when there is nothing to push.
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty()
    }
}

/// Diff two collections by key.
///
/// `is_changed(old, new)` decides whether an entry present on both sides has to
/// be re-pushed; pass `|_, _| false` for pure membership diffs.
pub fn diff_keyed<T, K, FK, FC>(
    applied: &[T],
    desired: &[T],
    key: FK,
    is_changed: FC,
) -> KeyedPlan<T>
where
    T: Clone,
    K: Ord,
    FK: Fn(&T) -> K,
    FC: Fn(&T, &T) -> bool,
{
    let applied_by_key: BTreeMap<K, &T> = applied.iter().map(|item| (key(item), item)).collect();
    let desired_keys: BTreeSet<K> = desired.iter().map(&key).collect();

    let mut added = Vec::new();
    let mut changed = Vec::new();
    for item in desired {
        match applied_by_key.get(&key(item)) {
            None => added.push(item.clone()),
            Some(old) if is_changed(old, item) => changed.push(Changed {
                old: (*old).clone(),
                new: item.clone(),
            }),
            Some(_) => {}
        }
    }

    let removed = applied
        .iter()
        .filter(|item| !desired_keys.contains(&key(item)))
        .cloned()
        .collect();

    KeyedPlan {
        added,
        removed,
        changed,
    }
}

/// Route table operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RouteAction {
    /// Upsert; safe whether or not the route already exists.
    Replace,

    /// Remove the route.
    Delete,
}

impl RouteAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            RouteAction::Replace => "replace",
            RouteAction::Delete => "delete",
        }
    }
}

impl fmt::Display for RouteAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Route table changes for one pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutePlan<R> {
    /// Routes to upsert, in desired order.
    pub replace: Vec<R>,

    /// Routes to delete, in applied order.
    pub delete: Vec<R>,
}

impl<R> RoutePlan<R> {
    /// True when the route table is already converged.
    pub fn is_empty(&self) -> bool {
        self.replace.is_empty() && self.delete.is_empty()
    }

    /// Flatten into `(action, route)` pairs, replacements first.
    pub fn into_actions(self) -> impl Iterator<Item = (RouteAction, R)> {
        self.replace
            .into_iter()
            .map(|r| (RouteAction::Replace, r))
            .chain(self.delete.into_iter().map(|r| (RouteAction::Delete, r)))
    }
}

/// Plan route table changes.
///
/// Every desired route that is not applied verbatim is replaced. Every applied
/// route that is not desired verbatim is deleted, unless a replacement for the
/// same destination is issued in this pass: the upsert already overwrote it.
pub fn plan_route_changes<R, F>(applied: &[R], desired: &[R], destination: F) -> RoutePlan<R>
where
    R: Clone + PartialEq,
    F: Fn(&R) -> &str,
{
    let replace: Vec<R> = desired
        .iter()
        .filter(|route| !applied.contains(route))
        .cloned()
        .collect();

    let replaced: BTreeSet<&str> = replace.iter().map(&destination).collect();

    let delete = applied
        .iter()
        .filter(|route| !desired.contains(route))
        .filter(|route| !replaced.contains(destination(route)))
        .cloned()
        .collect();

    RoutePlan { replace, delete }
}
