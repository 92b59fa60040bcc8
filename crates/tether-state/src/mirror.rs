//! Client-side mirror of a replicated schema
//!
//! The mirror is populated solely by applying received patches. With patch
//! optimization on, a [`Reconciler`] may strip individual fields from inbound
//! operations before they land, in favor of values the client predicts
//! locally.

use crate::patch::Patch;
use crate::schema::Schema;
use crate::SyncError;
use std::marker::PhantomData;
use std::time::Duration;
use tracing::trace;

/// Client-side prediction hooks for one schema
pub trait Reconciler<S: Schema> {
    type Event;

    /// Adjust an inbound operation before it is applied. Only called when
    /// patch optimization is enabled.
    fn reconcile(&self, state: &S, op: &mut S::Operation, events: &[Self::Event]);

    /// Runs after every patch, optimized or not
    fn after_apply(&self, _state: &mut S, _events: &[Self::Event]) {}

    /// Local interpolation between patches
    fn advance(&self, _state: &mut S, _dt: Duration) {}
}

/// Applies every operation as received
pub struct Verbatim<Ev>(PhantomData<fn() -> Ev>);

impl<Ev> Default for Verbatim<Ev> {
    fn default() -> Self {
        Self(PhantomData)
    }
}

impl<S: Schema, Ev> Reconciler<S> for Verbatim<Ev> {
    type Event = Ev;

    fn reconcile(&self, _state: &S, _op: &mut S::Operation, _events: &[Ev]) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MirrorSettings {
    /// Let the reconciler strip updates that local prediction covers
    pub optimize_patches: bool,
    /// Advance local interpolation between patches
    pub interpolate: bool,
}

impl MirrorSettings {
    /// Apply patches verbatim with no local prediction
    pub fn exact() -> Self {
        Self {
            optimize_patches: false,
            interpolate: false,
        }
    }

    pub fn optimized() -> Self {
        Self {
            optimize_patches: true,
            interpolate: true,
        }
    }
}

impl Default for MirrorSettings {
    fn default() -> Self {
        Self::optimized()
    }
}

pub struct ClientMirror<S, R> {
    state: S,
    reconciler: R,
    settings: MirrorSettings,
}

impl<S, R> ClientMirror<S, R>
where
    S: Schema + Default,
    R: Reconciler<S>,
{
    pub fn new(reconciler: R, settings: MirrorSettings) -> Self {
        Self {
            state: S::default(),
            reconciler,
            settings,
        }
    }

    /// Apply a patch in order
    ///
    /// Stops at the first operation that fails. Operations before it stay
    /// applied, so callers should request a full resync on error.
    pub fn apply_patch(
        &mut self,
        patch: Patch<S::Operation>,
        events: &[R::Event],
    ) -> Result<(), SyncError> {
        let ops = patch.len();
        for mut op in patch {
            if self.settings.optimize_patches {
                self.reconciler.reconcile(&self.state, &mut op, events);
            }
            self.state.apply(op).map_err(SyncError::PatchApplication)?;
        }
        self.reconciler.after_apply(&mut self.state, events);
        trace!(ops, events = events.len(), "Applied patch");
        Ok(())
    }

    /// Advance interpolation by `dt`. No-op when interpolation is off.
    pub fn advance(&mut self, dt: Duration) {
        if self.settings.interpolate {
            self.reconciler.advance(&mut self.state, dt);
        }
    }

    pub fn state(&self) -> &S {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut S {
        &mut self.state
    }

    pub fn settings(&self) -> MirrorSettings {
        self.settings
    }

    /// Forget everything. The next bootstrap repopulates the mirror.
    pub fn reset(&mut self) {
        self.state = S::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{sync_schema, tracked_entity, ApplyError, Operation, TrackingMode};

    tracked_entity! {
        struct Lamp => LampPartial { lit: bool, watts: u32 }
    }

    sync_schema! {
        struct Room {
            lamps: u8 => Lamp as Lamps,
        }
        enum RoomOp;
        struct RoomVisibility;
    }

    /// Never lets the server change wattage
    struct KeepWatts;

    impl Reconciler<Room> for KeepWatts {
        type Event = ();

        fn reconcile(&self, _state: &Room, op: &mut RoomOp, _events: &[()]) {
            let RoomOp::Lamps(Operation::Update(items)) = op else {
                return;
            };
            for (_, partial) in items.iter_mut() {
                partial.watts = None;
            }
        }
    }

    fn lamp(lit: bool, watts: u32) -> Lamp {
        Lamp::new(TrackingMode::Exact, lit, watts)
    }

    fn update(id: u8, lit: bool, watts: u32) -> RoomOp {
        RoomOp::Lamps(Operation::Update(vec![(
            id,
            LampPartial {
                lit: Some(lit),
                watts: Some(watts),
            },
        )]))
    }

    #[test]
    fn test_verbatim_mirror() {
        let mut mirror: ClientMirror<Room, Verbatim<()>> =
            ClientMirror::new(Verbatim::default(), MirrorSettings::exact());

        let patch = vec![
            RoomOp::Lamps(Operation::Add(vec![(1, lamp(false, 40))])),
            update(1, true, 60),
        ];
        mirror.apply_patch(patch, &[]).unwrap();

        let lamp = mirror.state().lamps.get(&1).unwrap();
        assert!(*lamp.lit);
        assert_eq!(*lamp.watts, 60);
    }

    #[test]
    fn test_reconciler_only_runs_when_optimizing() {
        let base = vec![RoomOp::Lamps(Operation::Add(vec![(1, lamp(false, 40))]))];

        let mut optimized = ClientMirror::new(KeepWatts, MirrorSettings::optimized());
        optimized.apply_patch(base.clone(), &[]).unwrap();
        optimized.apply_patch(vec![update(1, true, 60)], &[]).unwrap();
        assert_eq!(*optimized.state().lamps.get(&1).unwrap().watts, 40);
        assert!(*optimized.state().lamps.get(&1).unwrap().lit);

        let mut exact = ClientMirror::new(KeepWatts, MirrorSettings::exact());
        exact.apply_patch(base, &[]).unwrap();
        exact.apply_patch(vec![update(1, true, 60)], &[]).unwrap();
        assert_eq!(*exact.state().lamps.get(&1).unwrap().watts, 60);
    }

    #[test]
    fn test_failure_is_typed() {
        let mut mirror: ClientMirror<Room, Verbatim<()>> =
            ClientMirror::new(Verbatim::default(), MirrorSettings::exact());

        let err = mirror.apply_patch(vec![update(3, true, 1)], &[]).unwrap_err();
        match err {
            SyncError::PatchApplication(ApplyError::EntityNotFound { collection, id }) => {
                assert_eq!(collection, "lamps");
                assert_eq!(id, "3");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_reset_clears_state() {
        let mut mirror: ClientMirror<Room, Verbatim<()>> =
            ClientMirror::new(Verbatim::default(), MirrorSettings::default());
        mirror
            .apply_patch(vec![RoomOp::Lamps(Operation::Add(vec![(1, lamp(true, 5))]))], &[])
            .unwrap();
        assert_eq!(mirror.state().lamps.len(), 1);

        mirror.reset();
        assert!(mirror.state().lamps.is_empty());
    }
}
