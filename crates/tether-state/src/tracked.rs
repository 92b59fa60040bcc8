//! Property-level change tracking for replicated entities
//!
//! A [`Property`] holds the live value that simulation code reads and writes,
//! plus the change recorded for the next flush. Entities declared with
//! [`tracked_entity!`](crate::tracked_entity) are plain structs of properties
//! and nested entities with a generated partial type and [`Tracked`] impl.

use crate::UpdateError;
use serde::de::DeserializeOwned;
use serde::{Serialize, Serializer};
use std::fmt;
use std::ops::Deref;

/// How writes to a property are recorded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
pub enum TrackingMode {
    /// Record every write that changes the value
    #[default]
    #[cfg_attr(feature = "clap", value(name = "exact"))]
    Exact,
    /// Run the property's transform and filter before recording
    #[cfg_attr(feature = "clap", value(name = "optimized"))]
    Optimized,
}

/// Per-property hooks deciding whether and what to record
pub struct PropertyOptions<T> {
    /// `(prev, next) -> bool`, both already transformed. A write is recorded
    /// only when this returns true.
    pub filter: fn(&T, &T) -> bool,
    /// Maps the written value to the value that gets recorded
    pub transform: fn(&T) -> T,
    /// Rejects inbound values during [`Tracked::update`]
    pub validate: fn(&T) -> bool,
}

fn changed<T: PartialEq>(prev: &T, next: &T) -> bool {
    prev != next
}

fn identity<T: Clone>(value: &T) -> T {
    value.clone()
}

fn accept<T>(_: &T) -> bool {
    true
}

impl<T: Clone + PartialEq> Default for PropertyOptions<T> {
    fn default() -> Self {
        Self {
            filter: changed::<T>,
            transform: identity::<T>,
            validate: accept::<T>,
        }
    }
}

impl<T> PropertyOptions<T> {
    pub fn with_filter(mut self, filter: fn(&T, &T) -> bool) -> Self {
        self.filter = filter;
        self
    }

    pub fn with_transform(mut self, transform: fn(&T) -> T) -> Self {
        self.transform = transform;
        self
    }

    pub fn with_validate(mut self, validate: fn(&T) -> bool) -> Self {
        self.validate = validate;
        self
    }
}

impl<T> Clone for PropertyOptions<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for PropertyOptions<T> {}

/// A single observed value
///
/// The live value is always the raw write. Filters and transforms only decide
/// what ends up in the next flush, never what local reads see.
#[derive(Clone)]
pub struct Property<T> {
    value: T,
    change: Option<T>,
    options: PropertyOptions<T>,
    mode: TrackingMode,
}

impl<T: Clone + PartialEq> Property<T> {
    /// Create a property with default options in exact mode
    pub fn new(value: T) -> Self {
        Self::with_options(value, PropertyOptions::default(), TrackingMode::Exact)
    }

    pub fn with_options(value: T, options: PropertyOptions<T>, mode: TrackingMode) -> Self {
        Self {
            value,
            change: None,
            options,
            mode,
        }
    }

    pub fn get(&self) -> &T {
        &self.value
    }

    /// Write a new value, recording it for the next flush if it passes the
    /// filter
    pub fn set(&mut self, next: T) {
        let recorded = match self.mode {
            TrackingMode::Exact => (self.value != next).then(|| next.clone()),
            TrackingMode::Optimized => {
                let previous = (self.options.transform)(&self.value);
                let candidate = (self.options.transform)(&next);
                (self.options.filter)(&previous, &candidate).then_some(candidate)
            }
        };

        if recorded.is_some() {
            self.change = recorded;
        }
        self.value = next;
    }

    /// Edit the value in place and record the result like [`Property::set`]
    pub fn modify(&mut self, f: impl FnOnce(&mut T)) {
        let mut next = self.value.clone();
        f(&mut next);
        self.set(next);
    }

    /// Overwrite the value without recording a change
    pub fn replace(&mut self, value: T) -> T {
        std::mem::replace(&mut self.value, value)
    }

    /// Apply an inbound value after validating it. Never records a change.
    pub fn apply(&mut self, name: &str, value: T) -> Result<(), UpdateError> {
        if !(self.options.validate)(&value) {
            return Err(UpdateError::Malformed {
                property: name.to_string(),
            });
        }
        self.value = value;
        Ok(())
    }

    /// Take the recorded change, leaving the property clean
    pub fn take_change(&mut self) -> Option<T> {
        self.change.take()
    }

    pub fn is_dirty(&self) -> bool {
        self.change.is_some()
    }

    pub fn mode(&self) -> TrackingMode {
        self.mode
    }
}

impl<T> Deref for Property<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.value
    }
}

impl<T: PartialEq> PartialEq for Property<T> {
    fn eq(&self, other: &Self) -> bool {
        self.value == other.value
    }
}

impl<T: fmt::Debug> fmt::Debug for Property<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Property")
            .field("value", &self.value)
            .field("dirty", &self.change.is_some())
            .finish()
    }
}

impl<T: Serialize> Serialize for Property<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.value.serialize(serializer)
    }
}

/// An entity whose writes are observed property by property
pub trait Tracked: Clone + fmt::Debug + PartialEq + Serialize + DeserializeOwned {
    /// Subset of properties changed since the last flush. Nested entities
    /// contribute their own partials at their field.
    type Partial: Clone + fmt::Debug + PartialEq + Serialize + DeserializeOwned;

    /// Take all recorded changes. Returns `None` when nothing was recorded.
    fn flush(&mut self) -> Option<Self::Partial>;

    /// Apply an external partial without recording it
    fn update(&mut self, partial: Self::Partial) -> Result<(), UpdateError>;

    fn is_dirty(&self) -> bool;
}

/// Declare a tracked entity and its partial type
///
/// ```
/// use tether_state::{tracked_entity, Tracked, TrackingMode};
///
/// tracked_entity! {
///     pub struct Wallet => WalletPartial {
///         cash: u64,
///         owner: String,
///     }
/// }
///
/// let mut wallet = Wallet::new(TrackingMode::Exact, 10, "ann".into());
/// wallet.cash.set(15);
/// let partial = wallet.flush().unwrap();
/// assert_eq!(partial.cash, Some(15));
/// assert_eq!(partial.owner, None);
/// assert!(wallet.flush().is_none());
/// ```
///
/// Properties may name their [`PropertyOptions`] after `=>`. Nested entities
/// go in a trailing `nested { .. }` block and must implement [`Tracked`].
/// The generated struct derives `Debug`, `Clone`, `PartialEq` and `Serialize`.
/// Its `Deserialize` rebuilds the entity through `new` in exact mode, so a
/// decoded copy validates updates with the declared options. The calling
/// crate needs `serde` as a dependency.
#[macro_export]
macro_rules! tracked_entity {
    (@options) => {
        $crate::PropertyOptions::default()
    };
    (@options $options:expr) => {
        $options
    };
    (
        $(#[$meta:meta])*
        $vis:vis struct $name:ident => $partial:ident {
            $(
                $(#[$fmeta:meta])*
                $field:ident : $ty:ty $( => $options:expr )?
            ),* $(,)?
        }
        $(
            nested {
                $(
                    $(#[$nmeta:meta])*
                    $nfield:ident : $nty:ty
                ),* $(,)?
            }
        )?
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, ::serde::Serialize)]
        $vis struct $name {
            $(
                $(#[$fmeta])*
                pub $field: $crate::Property<$ty>,
            )*
            $($(
                $(#[$nmeta])*
                pub $nfield: $nty,
            )*)?
        }

        #[derive(Debug, Clone, Default, PartialEq, ::serde::Serialize, ::serde::Deserialize)]
        $vis struct $partial {
            $( pub $field: ::core::option::Option<$ty>, )*
            $($( pub $nfield: ::core::option::Option<<$nty as $crate::Tracked>::Partial>, )*)?
        }

        impl $name {
            #[allow(clippy::too_many_arguments)]
            $vis fn new(
                mode: $crate::TrackingMode,
                $( $field: $ty, )*
                $($( $nfield: $nty, )*)?
            ) -> Self {
                Self {
                    $(
                        $field: $crate::Property::with_options(
                            $field,
                            $crate::tracked_entity!(@options $($options)?),
                            mode,
                        ),
                    )*
                    $($( $nfield, )*)?
                }
            }
        }

        impl<'de> ::serde::Deserialize<'de> for $name {
            fn deserialize<D>(deserializer: D) -> ::core::result::Result<Self, D::Error>
            where
                D: ::serde::Deserializer<'de>,
            {
                #[derive(::serde::Deserialize)]
                struct Fields {
                    $( $field: $ty, )*
                    $($( $nfield: $nty, )*)?
                }

                let fields = <Fields as ::serde::Deserialize>::deserialize(deserializer)?;
                ::core::result::Result::Ok(Self::new(
                    $crate::TrackingMode::Exact,
                    $( fields.$field, )*
                    $($( fields.$nfield, )*)?
                ))
            }
        }

        impl $crate::Tracked for $name {
            type Partial = $partial;

            fn flush(&mut self) -> ::core::option::Option<$partial> {
                let partial = $partial {
                    $( $field: self.$field.take_change(), )*
                    $($( $nfield: $crate::Tracked::flush(&mut self.$nfield), )*)?
                };
                let changed = false
                    $( || partial.$field.is_some() )*
                    $($( || partial.$nfield.is_some() )*)?;
                changed.then_some(partial)
            }

            fn update(
                &mut self,
                partial: $partial,
            ) -> ::core::result::Result<(), $crate::UpdateError> {
                $(
                    if let ::core::option::Option::Some(value) = partial.$field {
                        self.$field.apply(::core::stringify!($field), value)?;
                    }
                )*
                $($(
                    if let ::core::option::Option::Some(nested) = partial.$nfield {
                        $crate::Tracked::update(&mut self.$nfield, nested)
                            .map_err(|e| e.within(::core::stringify!($nfield)))?;
                    }
                )*)?
                ::core::result::Result::Ok(())
            }

            fn is_dirty(&self) -> bool {
                false
                    $( || self.$field.is_dirty() )*
                    $($( || $crate::Tracked::is_dirty(&self.$nfield) )*)?
            }
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rounded(value: &f32) -> f32 {
        (value * 10.0).round() / 10.0
    }

    tracked_entity! {
        struct Stats => StatsPartial {
            health: u32 => PropertyOptions::default().with_validate(|h: &u32| *h <= 100),
            label: String,
        }
    }

    tracked_entity! {
        struct Unit => UnitPartial {
            x: f32 => PropertyOptions::default().with_transform(rounded),
        }
        nested {
            stats: Stats,
        }
    }

    #[test]
    fn test_set_records_only_observable_changes() {
        let mut prop = Property::new(5u32);
        prop.set(5);
        assert!(!prop.is_dirty());

        prop.set(6);
        assert!(prop.is_dirty());
        assert_eq!(prop.take_change(), Some(6));
        assert_eq!(prop.take_change(), None);
    }

    #[test]
    fn test_filter_never_affects_live_value() {
        let options = PropertyOptions::default().with_transform(rounded);
        let mut prop = Property::with_options(1.0f32, options, TrackingMode::Optimized);

        prop.set(1.01);
        assert_eq!(*prop, 1.01);
        assert!(!prop.is_dirty());

        prop.set(1.26);
        assert_eq!(*prop, 1.26);
        assert_eq!(prop.take_change(), Some(1.3));
    }

    #[test]
    fn test_exact_mode_bypasses_transform() {
        let options = PropertyOptions::default().with_transform(rounded);
        let mut prop = Property::with_options(1.0f32, options, TrackingMode::Exact);

        prop.set(1.01);
        assert_eq!(prop.take_change(), Some(1.01));
    }

    #[test]
    fn test_replace_does_not_dirty() {
        let mut prop = Property::new(String::from("a"));
        let old = prop.replace("b".into());
        assert_eq!(old, "a");
        assert_eq!(prop.get(), "b");
        assert!(!prop.is_dirty());
    }

    #[test]
    fn test_nested_flush_and_update() {
        let stats = Stats::new(TrackingMode::Exact, 100, "grunt".into());
        let mut unit = Unit::new(TrackingMode::Optimized, 0.0, stats);

        unit.stats.health.set(90);
        assert!(unit.is_dirty());

        let partial = unit.flush().unwrap();
        assert_eq!(partial.x, None);
        assert_eq!(
            partial.stats,
            Some(StatsPartial {
                health: Some(90),
                label: None
            })
        );
        assert!(!unit.is_dirty());
        assert!(unit.flush().is_none());

        let mut mirror = Unit::new(TrackingMode::Exact, 0.0, Stats::new(TrackingMode::Exact, 100, "grunt".into()));
        mirror.update(partial).unwrap();
        assert_eq!(*mirror.stats.health, 90);
        assert!(!mirror.is_dirty());
    }

    #[test]
    fn test_update_rejects_malformed_values() {
        let stats = Stats::new(TrackingMode::Exact, 100, "grunt".into());
        let mut unit = Unit::new(TrackingMode::Exact, 0.0, stats);

        let partial = UnitPartial {
            x: None,
            stats: Some(StatsPartial {
                health: Some(500),
                label: None,
            }),
        };

        let err = unit.update(partial).unwrap_err();
        assert_eq!(
            err,
            UpdateError::Malformed {
                property: "stats.health".into()
            }
        );
        assert_eq!(*unit.stats.health, 100);
    }

    #[test]
    fn test_property_serializes_as_bare_value() {
        let prop = Property::new(42u32);
        let bytes = bincode::serialize(&prop).unwrap();
        assert_eq!(bytes, bincode::serialize(&42u32).unwrap());
    }

    #[test]
    fn test_decoded_entity_keeps_validation() {
        let mut stats = Stats::new(TrackingMode::Optimized, 80, "grunt".into());
        stats.label.set("veteran".into());
        let unit = Unit::new(TrackingMode::Optimized, 1.5, stats);

        let bytes = bincode::serialize(&unit).unwrap();
        let mut decoded: Unit = bincode::deserialize(&bytes).unwrap();
        assert_eq!(decoded, unit);
        assert!(!decoded.is_dirty());
        assert_eq!(decoded.stats.health.mode(), TrackingMode::Exact);

        let malformed = UnitPartial {
            x: None,
            stats: Some(StatsPartial {
                health: Some(500),
                label: None,
            }),
        };
        assert_eq!(
            decoded.update(malformed),
            Err(UpdateError::Malformed {
                property: "stats.health".into()
            })
        );
        assert_eq!(*decoded.stats.health, 80);
    }
}
