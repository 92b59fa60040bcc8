//! Operations over a single collection and the patches they form

use crate::tracked::Tracked;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt::Debug;

/// Key type of an entity collection
pub trait EntityId: Ord + Clone + Debug + Serialize + DeserializeOwned {}

impl<T> EntityId for T where T: Ord + Clone + Debug + Serialize + DeserializeOwned {}

/// Ordered list of operations describing a state delta
pub type Patch<Op> = Vec<Op>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Add,
    Replace,
    Delete,
    Update,
}

/// A structural or property-level change to one collection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound = "")]
pub enum Operation<Id: EntityId, E: Tracked> {
    /// Insert or overwrite entities with their full current value
    Add(Vec<(Id, E)>),
    /// Clear the collection, then insert. Used for bootstraps.
    Replace(Vec<(Id, E)>),
    Delete(BTreeSet<Id>),
    /// Property-level changes for entities the receiver already holds
    Update(Vec<(Id, E::Partial)>),
}

impl<Id: EntityId, E: Tracked> Operation<Id, E> {
    pub fn kind(&self) -> OperationKind {
        match self {
            Operation::Add(_) => OperationKind::Add,
            Operation::Replace(_) => OperationKind::Replace,
            Operation::Delete(_) => OperationKind::Delete,
            Operation::Update(_) => OperationKind::Update,
        }
    }

    /// Number of entities the operation touches
    pub fn len(&self) -> usize {
        match self {
            Operation::Add(items) | Operation::Replace(items) => items.len(),
            Operation::Delete(ids) => ids.len(),
            Operation::Update(items) => items.len(),
        }
    }

    /// A `Replace` with no entities still clears the receiver, so it is never
    /// considered empty.
    pub fn is_empty(&self) -> bool {
        match self {
            Operation::Replace(_) => false,
            _ => self.len() == 0,
        }
    }

    pub fn ids(&self) -> Vec<&Id> {
        match self {
            Operation::Add(items) | Operation::Replace(items) => {
                items.iter().map(|(id, _)| id).collect()
            }
            Operation::Delete(ids) => ids.iter().collect(),
            Operation::Update(items) => items.iter().map(|(id, _)| id).collect(),
        }
    }

    pub fn contains(&self, id: &Id) -> bool {
        self.ids().into_iter().any(|candidate| candidate == id)
    }

    /// Keep only the entries whose id passes `keep`. Returns `None` when
    /// nothing survives.
    pub fn restrict(self, mut keep: impl FnMut(&Id) -> bool) -> Option<Self> {
        let restricted = match self {
            Operation::Add(items) => {
                Operation::Add(items.into_iter().filter(|(id, _)| keep(id)).collect())
            }
            Operation::Replace(items) => {
                return Some(Operation::Replace(
                    items.into_iter().filter(|(id, _)| keep(id)).collect(),
                ));
            }
            Operation::Delete(ids) => Operation::Delete(ids.into_iter().filter(|id| keep(id)).collect()),
            Operation::Update(items) => {
                Operation::Update(items.into_iter().filter(|(id, _)| keep(id)).collect())
            }
        };
        (!restricted.is_empty()).then_some(restricted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracked_entity;
    use crate::TrackingMode;

    tracked_entity! {
        struct Crate => CratePartial {
            weight: u32,
        }
    }

    fn crate_of(weight: u32) -> Crate {
        Crate::new(TrackingMode::Exact, weight)
    }

    #[test]
    fn test_restrict_drops_hidden_ids() {
        let op: Operation<u32, Crate> = Operation::Add(vec![(1, crate_of(1)), (2, crate_of(2))]);
        let restricted = op.restrict(|id| *id == 2).unwrap();
        assert_eq!(restricted.ids(), vec![&2]);
        assert_eq!(restricted.kind(), OperationKind::Add);
    }

    #[test]
    fn test_restrict_to_nothing_is_none() {
        let op: Operation<u32, Crate> = Operation::Delete([1, 2].into_iter().collect());
        assert!(op.restrict(|_| false).is_none());
    }

    #[test]
    fn test_empty_replace_survives_restriction() {
        let op: Operation<u32, Crate> = Operation::Replace(vec![(1, crate_of(1))]);
        let restricted = op.restrict(|_| false).unwrap();
        assert_eq!(restricted.kind(), OperationKind::Replace);
        assert_eq!(restricted.len(), 0);
        assert!(!restricted.is_empty());
    }

    #[test]
    fn test_update_ids() {
        let op: Operation<u32, Crate> = Operation::Update(vec![(
            7,
            CratePartial { weight: Some(3) },
        )]);
        assert!(op.contains(&7));
        assert!(!op.contains(&8));
        assert_eq!(op.len(), 1);
    }
}
