//! Authoritative side of the simulation
//!
//! The server owns the [`World`], steps it once per tick and hands every
//! connected client the bundle the broadcaster produced for it.

use crate::world::{
    Actor, ActorId, ClientId, Item, ItemId, ItemKind, RadiusPolicy, World, WorldEvent, WorldOp,
    MAX_HEALTH,
};
use glam::Vec2;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::Duration;
use tether_network::{ControlMessage, PROTOCOL_VERSION};
use tether_state::movement::{self, facing};
use tether_state::sync::timestamp_now;
use tether_state::{Broadcaster, SyncMessage, TrackingMode};
use tracing::{debug, info, warn};

pub type WorldMessage = SyncMessage<WorldOp, WorldEvent>;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ServerConfig {
    pub actors: u32,
    pub world_size: f32,
    pub view_radius: f32,
    /// Tiles per second
    pub speed: f32,
    pub tracking: TrackingMode,
    pub seed: u64,
    /// Per actor and tick
    pub wander_chance: f64,
    /// Per moving actor and tick
    pub stop_chance: f64,
    /// Per tick
    pub attack_chance: f64,
    /// Per tick
    pub item_chance: f64,
    pub max_items: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            actors: 16,
            world_size: 64.0,
            view_radius: 12.0,
            speed: 3.0,
            tracking: TrackingMode::Optimized,
            seed: 0,
            wander_chance: 0.2,
            stop_chance: 0.02,
            attack_chance: 0.3,
            item_chance: 0.25,
            max_items: 32,
        }
    }
}

const ATTACK_RANGE: f32 = 3.0;
const ATTACK_DAMAGE: u32 = 10;
const PICKUP_RANGE: f32 = 0.75;

pub struct Server {
    config: ServerConfig,
    world: World,
    broadcaster: Broadcaster<World, ClientId, WorldEvent, RadiusPolicy>,
    rng: StdRng,
    tick: u64,
    next_item: ItemId,
    resync_requests: u64,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        let mut rng = StdRng::seed_from_u64(config.seed);
        let mut world = World::default();
        for id in 0..config.actors {
            let at = random_point(&mut rng, config.world_size);
            let actor = Actor::spawn(config.tracking, format!("actor-{id}"), at, config.speed);
            world.actors.insert(id, actor);
        }

        info!(
            actors = config.actors,
            world_size = config.world_size,
            view_radius = config.view_radius,
            "World created"
        );

        Self {
            broadcaster: Broadcaster::new(RadiusPolicy {
                radius: config.view_radius,
            }),
            config,
            world,
            rng,
            tick: 0,
            next_item: 0,
            resync_requests: 0,
        }
    }

    pub fn world(&self) -> &World {
        &self.world
    }

    pub fn world_mut(&mut self) -> &mut World {
        &mut self.world
    }

    pub fn tick(&self) -> u64 {
        self.tick
    }

    pub fn broadcaster(&self) -> &Broadcaster<World, ClientId, WorldEvent, RadiusPolicy> {
        &self.broadcaster
    }

    pub fn resync_requests(&self) -> u64 {
        self.resync_requests
    }

    /// React to a control message from `client`. Returns the reply, if any.
    pub fn handle_control(
        &mut self,
        client: ClientId,
        message: ControlMessage,
    ) -> Option<ControlMessage> {
        match message {
            ControlMessage::Hello { version, client_id } => {
                if version != PROTOCOL_VERSION {
                    warn!(client, version, "Unsupported protocol version");
                    return Some(ControlMessage::Goodbye);
                }
                if client_id != client {
                    warn!(client, client_id, "Client announced a different id");
                }
                self.broadcaster.connect(client);
                None
            }
            ControlMessage::ResyncRequest => {
                self.resync_requests += 1;
                self.broadcaster.mark_to_resend_full_state([&client]);
                None
            }
            ControlMessage::Ping { timestamp } => Some(ControlMessage::Pong { timestamp }),
            ControlMessage::Pong { .. } => None,
            ControlMessage::Goodbye => {
                self.broadcaster.disconnect(&client);
                None
            }
        }
    }

    /// Advance the world by one tick of length `dt`
    pub fn step(&mut self, dt: Duration) {
        self.tick += 1;
        self.walk(dt);
        self.pick_up_items();
        self.fight();
        self.spawn_items();
    }

    fn walk(&mut self, dt: Duration) {
        let ids: Vec<ActorId> = self.world.actors.ids().copied().collect();
        for id in ids {
            let Some(actor) = self.world.actors.get_mut(&id) else {
                continue;
            };
            if *actor.health == 0 {
                continue;
            }

            let walking = actor.movement.path.is_some();
            if !walking && self.rng.gen_bool(self.config.wander_chance) {
                let target = random_point(&mut self.rng, self.config.world_size);
                actor.movement.path.set(Some(vec![target]));
            } else if walking && self.rng.gen_bool(self.config.stop_chance) {
                self.stop_actor(id);
                continue;
            }

            movement::move_along_path(&mut actor.movement, dt);
            let coords = *actor.movement.coords;
            let next_step = actor.movement.path.as_ref().and_then(|steps| steps.first().copied());
            if let Some(dir) = next_step.and_then(|step| facing(coords, step)) {
                actor.movement.dir.set(dir);
            }
        }
    }

    /// Halt an actor where it stands and tell the clients that see it
    pub fn stop_actor(&mut self, id: ActorId) -> bool {
        let Some(actor) = self.world.actors.get_mut(&id) else {
            return false;
        };
        actor.movement.path.set(None);
        self.broadcaster
            .add_event(WorldEvent::Stop(id), Some(World::visibility_of(&[id])));
        true
    }

    fn pick_up_items(&mut self) {
        let picked: Vec<(ItemId, ActorId)> = self
            .world
            .items
            .iter()
            .filter_map(|(item_id, item)| {
                self.world
                    .actors
                    .iter()
                    .find(|(_, actor)| {
                        *actor.health > 0 && actor.coords().distance(*item.position) <= PICKUP_RANGE
                    })
                    .map(|(actor_id, _)| (*item_id, *actor_id))
            })
            .collect();

        for (item_id, actor_id) in picked {
            let Some(item) = self.world.items.remove(&item_id) else {
                continue;
            };
            let Some(actor) = self.world.actors.get_mut(&actor_id) else {
                continue;
            };
            match *item.kind {
                ItemKind::Coin => actor.cash.modify(|cash| *cash += 1),
                ItemKind::Potion => actor
                    .health
                    .modify(|health| *health = (*health + ATTACK_DAMAGE).min(MAX_HEALTH)),
            }
            debug!(item = item_id, actor = actor_id, "Item picked up");
            self.broadcaster.add_event(
                WorldEvent::Pickup {
                    actor: actor_id,
                    kind: *item.kind,
                },
                Some(World::visibility_of(&[actor_id])),
            );
        }
    }

    fn fight(&mut self) {
        if self.world.actors.is_empty() || !self.rng.gen_bool(self.config.attack_chance) {
            return;
        }

        let living: Vec<(ActorId, Vec2)> = self
            .world
            .actors
            .iter()
            .filter(|(_, actor)| *actor.health > 0)
            .map(|(id, actor)| (*id, actor.coords()))
            .collect();
        if living.is_empty() {
            return;
        }

        let (attacker, from) = living[self.rng.gen_range(0..living.len())];
        let target = living
            .iter()
            .filter(|(id, at)| *id != attacker && at.distance(from) <= ATTACK_RANGE)
            .min_by(|(_, a), (_, b)| a.distance(from).total_cmp(&b.distance(from)))
            .map(|(id, _)| *id);
        let Some(target) = target else {
            return;
        };

        if let Some(victim) = self.world.actors.get_mut(&target) {
            victim
                .health
                .modify(|health| *health = health.saturating_sub(ATTACK_DAMAGE));
            if *victim.health == 0 {
                victim.movement.path.set(None);
                info!(attacker, target, "Actor died");
            }
        }

        self.broadcaster.add_event(
            WorldEvent::Attack {
                attacker,
                target,
                damage: ATTACK_DAMAGE,
            },
            Some(World::visibility_of(&[attacker, target])),
        );
    }

    fn spawn_items(&mut self) {
        if self.world.items.len() >= self.config.max_items
            || !self.rng.gen_bool(self.config.item_chance)
        {
            return;
        }

        let kind = if self.rng.gen_bool(0.8) {
            ItemKind::Coin
        } else {
            ItemKind::Potion
        };
        let at = random_point(&mut self.rng, self.config.world_size);
        let id = self.next_item;
        self.next_item += 1;
        self.world
            .items
            .insert(id, Item::new(self.config.tracking, kind, at));
    }

    /// Flush the world and build one message per client that has something
    /// to receive
    pub fn flush(&mut self) -> Vec<(ClientId, WorldMessage)> {
        let mut result = self.broadcaster.flush(&mut self.world);
        let server_time_micros = timestamp_now();
        let clients: Vec<ClientId> = self.broadcaster.clients().copied().collect();

        clients
            .into_iter()
            .filter_map(|client| {
                let (patch, events) = result.take_bundle(&client);
                if patch.is_none() && events.is_empty() {
                    return None;
                }
                let message = WorldMessage {
                    tick: self.tick,
                    server_time_micros,
                    patch,
                    events,
                };
                Some((client, message))
            })
            .collect()
    }
}

/// Uniform point on the map. A degenerate map collapses to the origin.
fn random_point(rng: &mut StdRng, size: f32) -> Vec2 {
    if !(size.is_finite() && size > 0.0) {
        return Vec2::ZERO;
    }
    Vec2::new(rng.gen_range(0.0..size), rng.gen_range(0.0..size))
}
