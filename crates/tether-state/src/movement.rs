//! Movement component and the client-side heuristics that reconcile it
//!
//! The server sends coordinates and paths for moving entities every tick. A
//! client that interpolates along the path on its own would be yanked back by
//! every one of those updates, so the optimized mirror drops the ones its
//! interpolation is already covering:
//!
//! * coordinates are applied only when they are farther away than the entity
//!   could travel within [`TELEPORT_THRESHOLD`];
//! * paths are applied when they are new, when the entity was stopped this
//!   flush, or when the local path is not already about to finish;
//! * facing is never taken from the server.

use crate::collection::EntityCollection;
use crate::patch::{EntityId, Operation};
use crate::tracked::{PropertyOptions, Tracked};
use crate::tracked_entity;
use glam::Vec2;
use serde::{Deserialize, Serialize};
use std::f32::consts::{FRAC_PI_4, SQRT_2};
use std::time::Duration;

/// How far ahead of the local position a server coordinate may be before it
/// is treated as a teleport, expressed as travel time at the entity's speed
pub const TELEPORT_THRESHOLD: Duration = Duration::from_millis(1500);

/// Diagonal of one tile
pub const TILE_MARGIN: f32 = SQRT_2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Direction {
    North,
    East,
    #[default]
    South,
    West,
}

/// Direction closest to `angle`, in radians, with y growing downward
pub fn nearest_cardinal_direction(angle: f32) -> Direction {
    let angle = angle.rem_euclid(std::f32::consts::TAU);
    if !(FRAC_PI_4..7.0 * FRAC_PI_4).contains(&angle) {
        Direction::East
    } else if angle < 3.0 * FRAC_PI_4 {
        Direction::South
    } else if angle < 5.0 * FRAC_PI_4 {
        Direction::West
    } else {
        Direction::North
    }
}

/// Direction from `from` toward `to`. `None` when the points coincide.
pub fn facing(from: Vec2, to: Vec2) -> Option<Direction> {
    let delta = to - from;
    (delta.length_squared() > f32::EPSILON).then(|| nearest_cardinal_direction(delta.y.atan2(delta.x)))
}

fn round_coords(coords: &Vec2) -> Vec2 {
    (*coords * 100.0).round() / 100.0
}

fn finite_coords(coords: &Vec2) -> bool {
    coords.is_finite()
}

fn valid_speed(speed: &f32) -> bool {
    speed.is_finite() && *speed >= 0.0
}

fn finite_path(path: &Option<Vec<Vec2>>) -> bool {
    path.as_ref()
        .map_or(true, |steps| steps.iter().all(|step| step.is_finite()))
}

tracked_entity! {
    /// Position, speed and remaining path of a moving entity
    pub struct Movement => MovementPartial {
        coords: Vec2 => PropertyOptions::default()
            .with_transform(round_coords)
            .with_validate(finite_coords),
        /// Tiles per second
        speed: f32 => PropertyOptions::default().with_validate(valid_speed),
        /// Remaining waypoints. `None` when standing still.
        path: Option<Vec<Vec2>> => PropertyOptions::default().with_validate(finite_path),
        dir: Direction,
    }
}

/// Advance along the path by `speed * dt`. Returns true when the final
/// waypoint was reached during this step.
pub fn move_along_path(movement: &mut Movement, dt: Duration) -> bool {
    let Some(path) = movement.path.get().clone() else {
        return false;
    };

    let mut budget = *movement.speed * dt.as_secs_f32();
    let mut coords = *movement.coords;
    let mut reached = 0;

    for target in &path {
        let distance = coords.distance(*target);
        if distance > budget {
            coords += (*target - coords) / distance * budget;
            break;
        }
        coords = *target;
        budget -= distance;
        reached += 1;
    }

    movement.coords.set(coords);
    if reached == path.len() {
        movement.path.set(None);
        true
    } else {
        if reached > 0 {
            movement.path.set(Some(path[reached..].to_vec()));
        }
        false
    }
}

/// An entity carrying a [`Movement`] component
pub trait Movable: Tracked {
    fn movement(&self) -> &Movement;

    fn movement_mut(&mut self) -> &mut Movement;

    /// The movement part of an inbound partial, if it has one
    fn movement_partial(partial: &mut Self::Partial) -> Option<&mut MovementPartial>;

    /// Dead entities are not interpolated
    fn is_alive(&self) -> bool {
        true
    }
}

/// Events the movement heuristics react to
pub trait MovementEvent<Id> {
    /// The entity the server explicitly stopped
    fn stopped_entity(&self) -> Option<&Id> {
        None
    }

    /// `(attacker, target)`; the attacker turns to face the target
    fn facing_target(&self) -> Option<(&Id, &Id)> {
        None
    }
}

/// Whether an inbound coordinate is far enough away to be a teleport
pub fn should_apply_coords(local: &Movement, incoming: Vec2) -> bool {
    let threshold = *local.speed * TELEPORT_THRESHOLD.as_secs_f32();
    incoming.distance(*local.coords) > threshold
}

pub fn should_apply_path(local: &Movement, incoming: Option<&[Vec2]>, stopped: bool) -> bool {
    if stopped {
        return true;
    }

    let local_path = local.path.as_deref();
    if matches!(incoming, Some(steps) if !steps.is_empty()) && incoming != local_path {
        return true;
    }

    // Let interpolation finish the last step instead of snapping
    if let Some(next_step) = local_path.and_then(|steps| steps.first()) {
        if next_step.distance(*local.coords) <= TILE_MARGIN {
            return false;
        }
    }

    incoming != local_path
}

/// Strip the movement fields of `update` that local interpolation already
/// covers. Facing is always stripped.
pub fn reconcile_partial(local: &Movement, update: &mut MovementPartial, stopped: bool) {
    if let Some(coords) = update.coords {
        if !should_apply_coords(local, coords) {
            update.coords = None;
        }
    }

    if let Some(path) = &update.path {
        if !should_apply_path(local, path.as_deref(), stopped) {
            update.path = None;
        }
    }

    update.dir = None;
}

/// Run the movement heuristics over an inbound operation for `collection`
///
/// Only updates for entities the client already holds are touched. Adds,
/// replaces and deletes pass through unchanged.
pub fn reconcile_movement<Id, E, Ev>(
    collection: &EntityCollection<Id, E>,
    op: &mut Operation<Id, E>,
    events: &[Ev],
) where
    Id: EntityId,
    E: Movable,
    Ev: MovementEvent<Id>,
{
    let Operation::Update(items) = op else {
        return;
    };

    for (id, partial) in items.iter_mut() {
        let id: &Id = id;
        let Some(local) = collection.get(id) else {
            continue;
        };
        let Some(update) = E::movement_partial(partial) else {
            continue;
        };
        let stopped = events
            .iter()
            .any(|event| event.stopped_entity() == Some(id));
        reconcile_partial(local.movement(), update, stopped);
    }
}

/// Move every living entity along its path and face it toward its next
/// waypoint
pub fn interpolate<Id: EntityId, E: Movable>(collection: &mut EntityCollection<Id, E>, dt: Duration) {
    for entity in collection.values_mut() {
        if !entity.is_alive() || entity.movement().path.is_none() {
            continue;
        }

        let movement = entity.movement_mut();
        move_along_path(movement, dt);

        let next_step = movement.path.as_ref().and_then(|steps| steps.first().copied());
        if let Some(dir) = next_step.and_then(|step| facing(*movement.coords, step)) {
            movement.dir.set(dir);
        }
    }
}

/// Turn attackers toward their targets
pub fn face_targets<Id, E, Ev>(collection: &mut EntityCollection<Id, E>, events: &[Ev])
where
    Id: EntityId,
    E: Movable,
    Ev: MovementEvent<Id>,
{
    for (attacker, target) in events.iter().filter_map(|event| event.facing_target()) {
        let Some(target_coords) = collection.get(target).map(|e| *e.movement().coords) else {
            continue;
        };
        if let Some(entity) = collection.get_mut(attacker) {
            let movement = entity.movement_mut();
            if let Some(dir) = facing(*movement.coords, target_coords) {
                movement.dir.set(dir);
            }
        }
    }
}
