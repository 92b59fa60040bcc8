//! Events queued during a tick and delivered on the next flush

use crate::schema::Visibility;

/// An event plus the ids a client must see to receive it
#[derive(Debug, Clone, PartialEq)]
pub struct PendingEvent<Ev, V> {
    pub event: Ev,
    /// `None` delivers to every client
    pub constraint: Option<V>,
}

impl<Ev, V: Visibility> PendingEvent<Ev, V> {
    pub fn new(event: Ev, constraint: Option<V>) -> Self {
        Self { event, constraint }
    }

    /// Whether a client with `visible` in view may receive the event
    pub fn is_visible_to(&self, visible: &V) -> bool {
        self.constraint
            .as_ref()
            .map_or(true, |required| visible.covers(required))
    }
}
