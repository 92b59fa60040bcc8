//! Fixed, compile-time declared replication schemas
//!
//! A schema is a struct of named [`EntityCollection`](crate::EntityCollection)s.
//! [`sync_schema!`](crate::sync_schema) generates the struct, a tagged
//! operation enum with one variant per collection, a per-collection
//! visibility struct, and the visitor code the broadcaster and mirror run
//! over them.

use crate::ApplyError;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Debug;

/// Per-collection sets of entity ids a client may observe
pub trait Visibility: Clone + Debug + Default + PartialEq {
    /// True when every id in `other` is also in `self`, per collection
    fn covers(&self, other: &Self) -> bool;

    /// Ids in `self` that are not in `other`
    fn difference(&self, other: &Self) -> Self;

    /// Total number of ids across collections
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Visitor operations over every collection of a schema
pub trait Schema {
    type Operation: Clone + Debug + PartialEq + Serialize + DeserializeOwned;
    type Visibility: Visibility;

    /// Shared structural and property diff of all collections since the last
    /// flush
    fn flush(&mut self) -> Vec<Self::Operation>;

    /// One replace-semantics operation per collection, holding the current
    /// values of the visible entities
    fn snapshot(&self, visible: &Self::Visibility) -> Vec<Self::Operation>;

    /// Adds with current values for `entered` and deletes for `left`
    fn transitions(
        &self,
        entered: &Self::Visibility,
        left: &Self::Visibility,
    ) -> Vec<Self::Operation>;

    /// Narrow a shared operation to ids in `visible` that are not in
    /// `entered`. `None` when nothing is left.
    fn restrict(
        op: Self::Operation,
        visible: &Self::Visibility,
        entered: &Self::Visibility,
    ) -> Option<Self::Operation>;

    fn apply(&mut self, op: Self::Operation) -> Result<(), ApplyError>;

    /// Drop ids that do not resolve to an entity. Returns how many were
    /// dropped.
    fn prune(&self, visibility: &mut Self::Visibility) -> usize;
}

/// Declare a replication schema
///
/// ```
/// use tether_state::{sync_schema, tracked_entity, Schema, TrackingMode};
///
/// tracked_entity! {
///     pub struct Door => DoorPartial { open: bool }
/// }
///
/// sync_schema! {
///     pub struct Level {
///         doors: u32 => Door as Doors,
///     }
///     pub enum LevelOp;
///     pub struct LevelVisibility;
/// }
///
/// let mut level = Level::default();
/// level.doors.insert(1, Door::new(TrackingMode::Exact, false));
/// let patch = level.flush();
/// assert_eq!(patch.len(), 1);
/// assert_eq!(patch[0].collection(), "doors");
/// ```
#[macro_export]
macro_rules! sync_schema {
    (
        $(#[$meta:meta])*
        $vis:vis struct $name:ident {
            $(
                $(#[$fmeta:meta])*
                $field:ident : $id:ty => $entity:ty as $variant:ident
            ),* $(,)?
        }
        $(#[$ometa:meta])*
        $ovis:vis enum $op:ident;
        $(#[$vmeta:meta])*
        $vvis:vis struct $visibility:ident;
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Default, PartialEq)]
        $vis struct $name {
            $(
                $(#[$fmeta])*
                pub $field: $crate::EntityCollection<$id, $entity>,
            )*
        }

        $(#[$ometa])*
        #[derive(Debug, Clone, PartialEq, ::serde::Serialize, ::serde::Deserialize)]
        $ovis enum $op {
            $( $variant($crate::Operation<$id, $entity>), )*
        }

        impl $op {
            /// Name of the collection the operation targets
            $ovis fn collection(&self) -> &'static str {
                match self {
                    $( $op::$variant(_) => ::core::stringify!($field), )*
                }
            }

            $ovis fn kind(&self) -> $crate::OperationKind {
                match self {
                    $( $op::$variant(inner) => inner.kind(), )*
                }
            }

            $ovis fn len(&self) -> usize {
                match self {
                    $( $op::$variant(inner) => inner.len(), )*
                }
            }

            $ovis fn is_empty(&self) -> bool {
                match self {
                    $( $op::$variant(inner) => inner.is_empty(), )*
                }
            }
        }

        $(#[$vmeta])*
        #[derive(Debug, Clone, Default, PartialEq, Eq, ::serde::Serialize, ::serde::Deserialize)]
        $vvis struct $visibility {
            $( pub $field: ::std::collections::BTreeSet<$id>, )*
        }

        impl $crate::Visibility for $visibility {
            fn covers(&self, other: &Self) -> bool {
                true $( && other.$field.is_subset(&self.$field) )*
            }

            fn difference(&self, other: &Self) -> Self {
                Self {
                    $( $field: self.$field.difference(&other.$field).cloned().collect(), )*
                }
            }

            fn len(&self) -> usize {
                0 $( + self.$field.len() )*
            }
        }

        impl $crate::Schema for $name {
            type Operation = $op;
            type Visibility = $visibility;

            fn flush(&mut self) -> ::std::vec::Vec<$op> {
                let mut patch = ::std::vec::Vec::new();
                $(
                    patch.extend(
                        self.$field
                            .flush(::core::stringify!($field))
                            .into_iter()
                            .map($op::$variant),
                    );
                )*
                patch
            }

            fn snapshot(&self, visible: &$visibility) -> ::std::vec::Vec<$op> {
                ::std::vec![
                    $( $op::$variant(self.$field.snapshot(&visible.$field)), )*
                ]
            }

            fn transitions(
                &self,
                entered: &$visibility,
                left: &$visibility,
            ) -> ::std::vec::Vec<$op> {
                let mut patch = ::std::vec::Vec::new();
                $(
                    if let ::core::option::Option::Some(op) = self.$field.select(&entered.$field) {
                        patch.push($op::$variant(op));
                    }
                    if !left.$field.is_empty() {
                        patch.push($op::$variant($crate::Operation::Delete(left.$field.clone())));
                    }
                )*
                patch
            }

            fn restrict(
                op: $op,
                visible: &$visibility,
                entered: &$visibility,
            ) -> ::core::option::Option<$op> {
                match op {
                    $(
                        $op::$variant(inner) => inner
                            .restrict(|id| visible.$field.contains(id) && !entered.$field.contains(id))
                            .map($op::$variant),
                    )*
                }
            }

            fn apply(&mut self, op: $op) -> ::core::result::Result<(), $crate::ApplyError> {
                match op {
                    $(
                        $op::$variant(inner) => {
                            self.$field.apply_operation(::core::stringify!($field), inner)
                        }
                    )*
                }
            }

            fn prune(&self, visibility: &mut $visibility) -> usize {
                let mut pruned = 0;
                $(
                    let before = visibility.$field.len();
                    visibility.$field.retain(|id| self.$field.contains(id));
                    pruned += before - visibility.$field.len();
                )*
                pruned
            }
        }
    };
}
