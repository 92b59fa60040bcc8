//! Observable id -> entity map with structural diffing between flushes

use crate::patch::{EntityId, Operation};
use crate::tracked::Tracked;
use crate::ApplyError;
use std::collections::{btree_map, BTreeMap, BTreeSet};
use std::fmt;
use tracing::trace;

/// Entities keyed by id, plus the key set observed at the last flush
///
/// Reads always reflect the current map. The flushed key set is only
/// bookkeeping for deriving adds and deletes.
#[derive(Clone)]
pub struct EntityCollection<Id, E> {
    entities: BTreeMap<Id, E>,
    flushed_ids: BTreeSet<Id>,
}

impl<Id, E> Default for EntityCollection<Id, E> {
    fn default() -> Self {
        Self {
            entities: BTreeMap::new(),
            flushed_ids: BTreeSet::new(),
        }
    }
}

impl<Id: fmt::Debug, E: fmt::Debug> fmt::Debug for EntityCollection<Id, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.entities.iter()).finish()
    }
}

/// Two collections are equal when they hold the same entities, regardless of
/// flush bookkeeping.
impl<Id: PartialEq, E: PartialEq> PartialEq for EntityCollection<Id, E> {
    fn eq(&self, other: &Self) -> bool {
        self.entities == other.entities
    }
}

impl<Id: EntityId, E: Tracked> EntityCollection<Id, E> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: Id, entity: E) -> Option<E> {
        self.entities.insert(id, entity)
    }

    pub fn remove(&mut self, id: &Id) -> Option<E> {
        self.entities.remove(id)
    }

    pub fn get(&self, id: &Id) -> Option<&E> {
        self.entities.get(id)
    }

    pub fn get_mut(&mut self, id: &Id) -> Option<&mut E> {
        self.entities.get_mut(id)
    }

    pub fn contains(&self, id: &Id) -> bool {
        self.entities.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn iter(&self) -> btree_map::Iter<'_, Id, E> {
        self.entities.iter()
    }

    pub fn iter_mut(&mut self) -> btree_map::IterMut<'_, Id, E> {
        self.entities.iter_mut()
    }

    pub fn ids(&self) -> btree_map::Keys<'_, Id, E> {
        self.entities.keys()
    }

    pub fn values(&self) -> btree_map::Values<'_, Id, E> {
        self.entities.values()
    }

    pub fn values_mut(&mut self) -> btree_map::ValuesMut<'_, Id, E> {
        self.entities.values_mut()
    }

    pub fn clear(&mut self) {
        self.entities.clear();
    }

    /// Diff the current key set against the last flush and collect every
    /// recorded property change.
    ///
    /// Emits at most one `Add`, one `Delete` and one `Update`, in that order.
    /// Entities added since the last flush have their pending changes
    /// discarded; the `Add` already carries their current values.
    pub fn flush(&mut self, name: &'static str) -> Vec<Operation<Id, E>> {
        let mut ops = Vec::new();
        let mut added = Vec::new();
        let mut updated = Vec::new();

        for (id, entity) in self.entities.iter_mut() {
            if self.flushed_ids.contains(id) {
                if let Some(partial) = entity.flush() {
                    updated.push((id.clone(), partial));
                }
            } else {
                let _ = entity.flush();
                added.push((id.clone(), entity.clone()));
            }
        }

        let removed: BTreeSet<Id> = self
            .flushed_ids
            .iter()
            .filter(|id| !self.entities.contains_key(id))
            .cloned()
            .collect();

        trace!(
            collection = name,
            added = added.len(),
            removed = removed.len(),
            updated = updated.len(),
            "Flushed collection"
        );

        if !added.is_empty() {
            ops.push(Operation::Add(added));
        }
        if !removed.is_empty() {
            ops.push(Operation::Delete(removed));
        }
        if !updated.is_empty() {
            ops.push(Operation::Update(updated));
        }

        self.flushed_ids = self.entities.keys().cloned().collect();
        ops
    }

    /// Apply an inbound operation without recording anything for the next
    /// flush of this collection's own changes.
    pub fn apply_operation(
        &mut self,
        name: &'static str,
        op: Operation<Id, E>,
    ) -> Result<(), ApplyError> {
        match op {
            Operation::Add(items) => {
                self.entities.extend(items);
            }
            Operation::Replace(items) => {
                self.entities.clear();
                self.entities.extend(items);
            }
            Operation::Delete(ids) => {
                for id in &ids {
                    self.entities.remove(id);
                }
            }
            Operation::Update(items) => {
                for (id, partial) in items {
                    let entity =
                        self.entities
                            .get_mut(&id)
                            .ok_or_else(|| ApplyError::EntityNotFound {
                                collection: name,
                                id: format!("{id:?}"),
                            })?;
                    entity.update(partial).map_err(|source| ApplyError::Update {
                        collection: name,
                        id: format!("{id:?}"),
                        source,
                    })?;
                }
            }
        }
        Ok(())
    }

    /// `Add` of the current values of every resolvable id in `ids`
    pub fn select<'a>(&self, ids: impl IntoIterator<Item = &'a Id>) -> Option<Operation<Id, E>>
    where
        Id: 'a,
    {
        let items = self.resolve(ids);
        (!items.is_empty()).then_some(Operation::Add(items))
    }

    /// `Replace` holding the current values of every resolvable id in `ids`
    pub fn snapshot<'a>(&self, ids: impl IntoIterator<Item = &'a Id>) -> Operation<Id, E>
    where
        Id: 'a,
    {
        Operation::Replace(self.resolve(ids))
    }

    fn resolve<'a>(&self, ids: impl IntoIterator<Item = &'a Id>) -> Vec<(Id, E)>
    where
        Id: 'a,
    {
        ids.into_iter()
            .filter_map(|id| self.entities.get(id).map(|e| (id.clone(), e.clone())))
            .collect()
    }
}

impl<Id: EntityId, E: Tracked> FromIterator<(Id, E)> for EntityCollection<Id, E> {
    fn from_iter<I: IntoIterator<Item = (Id, E)>>(iter: I) -> Self {
        Self {
            entities: iter.into_iter().collect(),
            flushed_ids: BTreeSet::new(),
        }
    }
}
