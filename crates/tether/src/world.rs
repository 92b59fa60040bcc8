//! The simulated world: actors walking around a square map and items lying
//! on the ground

use glam::Vec2;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tether_state::movement::{self, Movable, Movement, MovementEvent, MovementPartial};
use tether_state::{
    sync_schema, tracked_entity, PropertyOptions, Reconciler, Schema, TrackingMode,
    VisibilityPolicy,
};

pub type ActorId = u32;
pub type ItemId = u32;

/// Clients are identified by the actor they control
pub type ClientId = ActorId;

pub const MAX_HEALTH: u32 = 100;

fn capped_health(health: &u32) -> bool {
    *health <= MAX_HEALTH
}

tracked_entity! {
    pub struct Actor => ActorPartial {
        name: String,
        health: u32 => PropertyOptions::default().with_validate(capped_health),
        cash: u64,
    }
    nested {
        movement: Movement,
    }
}

impl Actor {
    pub fn spawn(mode: TrackingMode, name: impl Into<String>, at: Vec2, speed: f32) -> Self {
        Actor::new(
            mode,
            name.into(),
            MAX_HEALTH,
            0,
            Movement::new(mode, at, speed, None, movement::Direction::default()),
        )
    }

    pub fn coords(&self) -> Vec2 {
        *self.movement.coords
    }
}

impl Movable for Actor {
    fn movement(&self) -> &Movement {
        &self.movement
    }

    fn movement_mut(&mut self) -> &mut Movement {
        &mut self.movement
    }

    fn movement_partial(partial: &mut ActorPartial) -> Option<&mut MovementPartial> {
        partial.movement.as_mut()
    }

    fn is_alive(&self) -> bool {
        *self.health > 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ItemKind {
    Coin,
    Potion,
}

tracked_entity! {
    pub struct Item => ItemPartial {
        kind: ItemKind,
        position: Vec2,
    }
}

sync_schema! {
    /// Authoritative world on the server, mirrored on each client
    pub struct World {
        actors: ActorId => Actor as Actors,
        items: ItemId => Item as Items,
    }
    pub enum WorldOp;
    pub struct WorldVisibility;
}

impl World {
    pub fn visibility_of(actors: &[ActorId]) -> WorldVisibility {
        WorldVisibility {
            actors: actors.iter().copied().collect(),
            ..WorldVisibility::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WorldEvent {
    /// The actor was stopped where it stands
    Stop(ActorId),
    Attack {
        attacker: ActorId,
        target: ActorId,
        damage: u32,
    },
    Pickup {
        actor: ActorId,
        kind: ItemKind,
    },
}

impl MovementEvent<ActorId> for WorldEvent {
    fn stopped_entity(&self) -> Option<&ActorId> {
        match self {
            WorldEvent::Stop(id) => Some(id),
            _ => None,
        }
    }

    fn facing_target(&self) -> Option<(&ActorId, &ActorId)> {
        match self {
            WorldEvent::Attack {
                attacker, target, ..
            } => Some((attacker, target)),
            _ => None,
        }
    }
}

/// A client sees everything within `radius` of the actor it controls
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RadiusPolicy {
    pub radius: f32,
}

impl VisibilityPolicy<World, ClientId> for RadiusPolicy {
    fn visibility(&self, client: &ClientId, world: &World) -> WorldVisibility {
        let Some(center) = world.actors.get(client).map(Actor::coords) else {
            return WorldVisibility::default();
        };
        let near = |at: Vec2| at.distance(center) <= self.radius;

        WorldVisibility {
            actors: world
                .actors
                .iter()
                .filter(|(_, actor)| near(actor.coords()))
                .map(|(id, _)| *id)
                .collect(),
            items: world
                .items
                .iter()
                .filter(|(_, item)| near(*item.position))
                .map(|(id, _)| *id)
                .collect(),
        }
    }
}

/// Client-side movement handling for the world
#[derive(Debug, Clone, Copy, Default)]
pub struct WorldReconciler;

impl Reconciler<World> for WorldReconciler {
    type Event = WorldEvent;

    fn reconcile(&self, state: &World, op: &mut WorldOp, events: &[WorldEvent]) {
        match op {
            WorldOp::Actors(op) => movement::reconcile_movement(&state.actors, op, events),
            WorldOp::Items(_) => {}
        }
    }

    fn after_apply(&self, state: &mut World, events: &[WorldEvent]) {
        movement::face_targets(&mut state.actors, events);
    }

    fn advance(&self, state: &mut World, dt: Duration) {
        movement::interpolate(&mut state.actors, dt);
    }
}

/// Number of visible entities a mirror gets wrong
///
/// Counts entities the client should hold but does not, entities it holds
/// outside its visibility, and actors whose name, health or cash differ.
/// Movement is left out since interpolation legitimately diverges from the
/// server between ticks.
pub fn divergence(truth: &World, mirror: &World, visible: &WorldVisibility) -> usize {
    let mut visible = visible.clone();
    truth.prune(&mut visible);

    let missing_actors = visible
        .actors
        .iter()
        .filter(|id| match (truth.actors.get(id), mirror.actors.get(id)) {
            (Some(real), Some(seen)) => {
                real.name != seen.name || real.health != seen.health || real.cash != seen.cash
            }
            _ => true,
        })
        .count();
    let extra_actors = mirror
        .actors
        .ids()
        .filter(|id| !visible.actors.contains(*id))
        .count();

    let missing_items = visible
        .items
        .iter()
        .filter(|id| match (truth.items.get(id), mirror.items.get(id)) {
            (Some(real), Some(seen)) => real != seen,
            _ => true,
        })
        .count();
    let extra_items = mirror
        .items
        .ids()
        .filter(|id| !visible.items.contains(*id))
        .count();

    missing_actors + extra_actors + missing_items + extra_items
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_state::Tracked;

    fn world_with(actors: &[(ActorId, Vec2)]) -> World {
        let mut world = World::default();
        for (id, at) in actors {
            world.actors.insert(
                *id,
                Actor::spawn(TrackingMode::Exact, format!("actor-{id}"), *at, 2.0),
            );
        }
        world
    }

    #[test]
    fn test_radius_policy() {
        let mut world = world_with(&[(1, Vec2::ZERO), (2, Vec2::new(3.0, 4.0)), (3, Vec2::new(9.0, 0.0))]);
        world.items.insert(
            7,
            Item::new(TrackingMode::Exact, ItemKind::Coin, Vec2::new(0.0, 5.0)),
        );

        let policy = RadiusPolicy { radius: 5.0 };
        let vis = policy.visibility(&1, &world);
        assert_eq!(vis.actors.into_iter().collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(vis.items.into_iter().collect::<Vec<_>>(), vec![7]);

        assert_eq!(policy.visibility(&42, &world), WorldVisibility::default());
    }

    #[test]
    fn test_health_is_capped() {
        let mut actor = Actor::spawn(TrackingMode::Exact, "a", Vec2::ZERO, 1.0);
        let result = actor.update(ActorPartial {
            health: Some(MAX_HEALTH + 1),
            ..ActorPartial::default()
        });
        assert!(result.is_err());
        assert_eq!(*actor.health, MAX_HEALTH);
    }

    #[test]
    fn test_dead_actors_do_not_move() {
        let mut actor = Actor::spawn(TrackingMode::Exact, "a", Vec2::ZERO, 1.0);
        actor.health.set(0);
        assert!(!actor.is_alive());
    }

    #[test]
    fn test_attack_faces_target() {
        let event = WorldEvent::Attack {
            attacker: 1,
            target: 2,
            damage: 5,
        };
        assert_eq!(event.facing_target(), Some((&1, &2)));
        assert_eq!(event.stopped_entity(), None);
        assert_eq!(WorldEvent::Stop(4).stopped_entity(), Some(&4));
    }

    #[test]
    fn test_divergence_counts_mistakes() {
        let truth = world_with(&[(1, Vec2::ZERO), (2, Vec2::ONE)]);
        let visible = World::visibility_of(&[1, 2]);
        assert_eq!(divergence(&truth, &truth, &visible), 0);

        let mut mirror = world_with(&[(1, Vec2::ZERO), (5, Vec2::ONE)]);
        mirror.actors.get_mut(&1).unwrap().cash.set(10);
        // 1 differs, 2 is missing, 5 is extra
        assert_eq!(divergence(&truth, &mirror, &visible), 3);
    }

    #[test]
    fn test_divergence_ignores_movement() {
        let truth = world_with(&[(1, Vec2::ZERO)]);
        let mut mirror = truth.clone();
        mirror.actors.get_mut(&1).unwrap().movement.coords.set(Vec2::ONE);
        assert_eq!(divergence(&truth, &mirror, &World::visibility_of(&[1])), 0);
    }
}
