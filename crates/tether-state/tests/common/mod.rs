//! Shared schema for the integration tests

#![allow(dead_code)]

use std::collections::BTreeSet;
use tether_state::{sync_schema, tracked_entity, TrackingMode};

tracked_entity! {
    pub struct Citizen => CitizenPartial {
        name: String,
        cash: u64,
    }
}

sync_schema! {
    pub struct Town {
        citizens: u32 => Citizen as Citizens,
    }
    pub enum TownOp;
    pub struct TownVisibility;
}

pub const EVEN_MARK: &str = "EVENMARK";
pub const ODD_MARK: &str = "ODDMARK";

/// Every citizen's name carries a marker for the parity of its id
pub fn citizen_name(id: u32, generation: u32) -> String {
    let mark = if id % 2 == 0 { EVEN_MARK } else { ODD_MARK };
    format!("{mark}-{id}-{generation}")
}

pub fn citizen(id: u32, cash: u64) -> Citizen {
    Citizen::new(TrackingMode::Exact, citizen_name(id, 0), cash)
}

pub fn visible(ids: impl IntoIterator<Item = u32>) -> TownVisibility {
    TownVisibility {
        citizens: ids.into_iter().collect::<BTreeSet<_>>(),
    }
}

/// Client 0 sees even ids, client 1 odd ids, client 2 anyone with at least
/// 500 cash
pub fn policy(client: &u8, town: &Town) -> TownVisibility {
    let ids = town.citizens.iter().filter(|(id, citizen)| match client {
        0 => *id % 2 == 0,
        1 => *id % 2 == 1,
        _ => *citizen.cash >= 500,
    });
    visible(ids.map(|(id, _)| *id))
}

pub type Policy = fn(&u8, &Town) -> TownVisibility;

pub fn contains_bytes(haystack: &[u8], needle: &[u8]) -> bool {
    haystack
        .windows(needle.len())
        .any(|window| window == needle)
}
