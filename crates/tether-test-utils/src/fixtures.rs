use glam::Vec2;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

pub const DEFAULT_SEED: u64 = 0x7e7e;

pub fn seeded_rng(seed: u64) -> StdRng {
    StdRng::seed_from_u64(seed)
}

/// `count` points spread uniformly over a `size` by `size` square
pub fn scatter(rng: &mut impl Rng, count: usize, size: f32) -> Vec<Vec2> {
    (0..count)
        .map(|_| Vec2::new(rng.gen_range(0.0..size), rng.gen_range(0.0..size)))
        .collect()
}

/// Straight path of unit steps from `from` toward `to`
pub fn straight_path(from: Vec2, to: Vec2) -> Vec<Vec2> {
    let steps = from.distance(to).ceil().max(1.0) as usize;
    (1..=steps)
        .map(|i| from.lerp(to, i as f32 / steps as f32))
        .collect()
}
