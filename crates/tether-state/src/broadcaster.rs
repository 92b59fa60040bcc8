//! Visibility-scoped broadcasting of schema changes
//!
//! The broadcaster turns one shared flush of the authoritative state into a
//! patch per client. Each patch is assembled from a bootstrap snapshot, the
//! transitions caused by the client's visibility changing, and the shared
//! operations restricted to what the client can see. Nothing outside a
//! client's visibility for this flush ever reaches its patch or event list.

use crate::event::PendingEvent;
use crate::patch::Patch;
use crate::schema::{Schema, Visibility};
use std::collections::BTreeMap;
use std::fmt::Debug;
use tracing::{debug, warn};

/// Derives the ids a client may observe
///
/// Must be pure and deterministic: it may be evaluated more than once per
/// flush for the same client.
pub trait VisibilityPolicy<S: Schema, C> {
    fn visibility(&self, client: &C, state: &S) -> S::Visibility;
}

impl<S, C, F> VisibilityPolicy<S, C> for F
where
    S: Schema,
    F: Fn(&C, &S) -> S::Visibility,
{
    fn visibility(&self, client: &C, state: &S) -> S::Visibility {
        self(client, state)
    }
}

/// Server-held bookkeeping for one client
#[derive(Debug, Clone, PartialEq)]
pub struct ClientSyncState<V> {
    /// Visibility used by the last flush
    pub visibility: Option<V>,
    /// Cleared by [`Broadcaster::mark_to_resend_full_state`]
    pub bootstrapped: bool,
}

impl<V> Default for ClientSyncState<V> {
    fn default() -> Self {
        Self {
            visibility: None,
            bootstrapped: false,
        }
    }
}

/// Output of one [`Broadcaster::flush`]
///
/// Clients with nothing to receive have no entry, which is distinct from an
/// entry holding an empty list.
#[derive(Debug, Clone, PartialEq)]
pub struct FlushResult<C, Op, Ev> {
    pub patches: BTreeMap<C, Patch<Op>>,
    pub events: BTreeMap<C, Vec<Ev>>,
}

impl<C: Ord, Op, Ev> Default for FlushResult<C, Op, Ev> {
    fn default() -> Self {
        Self {
            patches: BTreeMap::new(),
            events: BTreeMap::new(),
        }
    }
}

impl<C: Ord, Op, Ev> FlushResult<C, Op, Ev> {
    /// Remove and return everything destined for `client`
    pub fn take_bundle(&mut self, client: &C) -> (Option<Patch<Op>>, Vec<Ev>) {
        let patch = self.patches.remove(client);
        let events = self.events.remove(client).unwrap_or_default();
        (patch, events)
    }

    pub fn is_empty(&self) -> bool {
        self.patches.is_empty() && self.events.is_empty()
    }
}

pub struct Broadcaster<S: Schema, C, Ev, P> {
    policy: P,
    clients: BTreeMap<C, ClientSyncState<S::Visibility>>,
    events: Vec<PendingEvent<Ev, S::Visibility>>,
}

impl<S, C, Ev, P> Broadcaster<S, C, Ev, P>
where
    S: Schema,
    C: Ord + Clone + Debug,
    Ev: Clone,
    P: VisibilityPolicy<S, C>,
{
    pub fn new(policy: P) -> Self {
        Self {
            policy,
            clients: BTreeMap::new(),
            events: Vec::new(),
        }
    }

    /// Register a client. It is bootstrapped on the next flush. Returns
    /// false if the client was already connected.
    pub fn connect(&mut self, client: C) -> bool {
        if self.clients.contains_key(&client) {
            return false;
        }
        debug!(?client, "Client connected");
        self.clients.insert(client, ClientSyncState::default());
        true
    }

    /// Drop all bookkeeping for a client
    pub fn disconnect(&mut self, client: &C) -> Option<ClientSyncState<S::Visibility>> {
        let removed = self.clients.remove(client);
        if removed.is_some() {
            debug!(?client, "Client disconnected");
        }
        removed
    }

    pub fn clients(&self) -> impl Iterator<Item = &C> {
        self.clients.keys()
    }

    pub fn client_state(&self, client: &C) -> Option<&ClientSyncState<S::Visibility>> {
        self.clients.get(client)
    }

    pub fn is_bootstrapped(&self, client: &C) -> bool {
        self.clients
            .get(client)
            .map_or(false, |state| state.bootstrapped)
    }

    /// Force a full snapshot for these clients on the next flush. Visibility
    /// bookkeeping is left alone.
    pub fn mark_to_resend_full_state<'a>(&mut self, clients: impl IntoIterator<Item = &'a C>)
    where
        C: 'a,
    {
        for client in clients {
            if let Some(state) = self.clients.get_mut(client) {
                debug!(?client, "Marked to resend full state");
                state.bootstrapped = false;
            }
        }
    }

    /// Queue an event for the next flush
    pub fn add_event(&mut self, event: Ev, constraint: Option<S::Visibility>) {
        self.events.push(PendingEvent::new(event, constraint));
    }

    /// Events queued since the last flush
    pub fn peek_events(&self) -> &[PendingEvent<Ev, S::Visibility>] {
        &self.events
    }

    /// Flush the shared state once and build every client's patch and event
    /// list
    pub fn flush(&mut self, state: &mut S) -> FlushResult<C, S::Operation, Ev> {
        let mut previous = Vec::with_capacity(self.clients.len());
        for (client, sync) in self.clients.iter_mut() {
            let prev = match sync.visibility.take() {
                Some(cached) => cached,
                None => {
                    let mut fresh = self.policy.visibility(client, state);
                    state.prune(&mut fresh);
                    fresh
                }
            };
            previous.push(prev);
        }

        let shared = state.flush();
        let mut result = FlushResult::default();

        for ((client, sync), prev) in self.clients.iter_mut().zip(previous) {
            let mut next = self.policy.visibility(client, state);
            let pruned = state.prune(&mut next);
            if pruned > 0 {
                warn!(?client, pruned, "Visibility referenced unknown entities");
            }

            let patch = if sync.bootstrapped {
                let entered = next.difference(&prev);
                let left = prev.difference(&next);
                let mut patch = state.transitions(&entered, &left);
                patch.extend(
                    shared
                        .iter()
                        .cloned()
                        .filter_map(|op| S::restrict(op, &next, &entered)),
                );
                patch
            } else {
                debug!(?client, visible = next.len(), "Bootstrapping client");
                sync.bootstrapped = true;
                state.snapshot(&next)
            };

            if !patch.is_empty() {
                result.patches.insert(client.clone(), patch);
            }

            let events: Vec<Ev> = self
                .events
                .iter()
                .filter(|pending| pending.is_visible_to(&next))
                .map(|pending| pending.event.clone())
                .collect();
            if !events.is_empty() {
                result.events.insert(client.clone(), events);
            }

            sync.visibility = Some(next);
        }

        debug!(
            shared_ops = shared.len(),
            clients = self.clients.len(),
            patched = result.patches.len(),
            events = self.events.len(),
            "Broadcaster flushed"
        );
        self.events.clear();
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{sync_schema, tracked_entity, Operation, OperationKind, TrackingMode};
    use pretty_assertions::assert_eq;
    use std::collections::BTreeSet;

    tracked_entity! {
        struct Account => AccountPartial { cash: u64 }
    }

    sync_schema! {
        struct Bank {
            accounts: u32 => Account as Accounts,
        }
        enum BankOp;
        struct BankVisibility;
    }

    #[derive(Debug, Clone, PartialEq)]
    enum Notice {
        Audit(u32),
        Holiday,
    }

    fn sees(ids: &[u32]) -> BankVisibility {
        BankVisibility {
            accounts: ids.iter().copied().collect(),
        }
    }

    /// Client 1 sees everything, client 2 only sees account 2
    fn policy(client: &u32, bank: &Bank) -> BankVisibility {
        match client {
            1 => BankVisibility {
                accounts: bank.accounts.ids().copied().collect(),
            },
            _ => sees(&[2]),
        }
    }

    type Policy = fn(&u32, &Bank) -> BankVisibility;

    fn bank() -> Bank {
        let mut bank = Bank::default();
        for (id, cash) in [(1, 10), (2, 20), (3, 30)] {
            bank.accounts.insert(id, Account::new(TrackingMode::Exact, cash));
        }
        bank
    }

    fn broadcaster() -> Broadcaster<Bank, u32, Notice, Policy> {
        let mut broadcaster = Broadcaster::new(policy as Policy);
        broadcaster.connect(1);
        broadcaster.connect(2);
        broadcaster
    }

    fn only_op(patch: &[BankOp]) -> &Operation<u32, Account> {
        assert_eq!(patch.len(), 1, "expected a single op, got {patch:?}");
        match &patch[0] {
            BankOp::Accounts(op) => op,
        }
    }

    #[test]
    fn test_cash_scenario() {
        let mut bank = bank();
        let mut broadcaster = broadcaster();

        let first = broadcaster.flush(&mut bank);
        let op = only_op(&first.patches[&1]);
        assert_eq!(op.kind(), OperationKind::Replace);
        assert_eq!(op.ids(), vec![&1, &2, &3]);
        assert_eq!(only_op(&first.patches[&2]).ids(), vec![&2]);

        bank.accounts.get_mut(&1).unwrap().cash.set(15);
        let second = broadcaster.flush(&mut bank);

        assert_eq!(
            second.patches[&1],
            vec![BankOp::Accounts(Operation::Update(vec![(
                1,
                AccountPartial { cash: Some(15) }
            )]))]
        );
        assert!(!second.patches.contains_key(&2));
    }

    #[test]
    fn test_double_flush_is_noop() {
        let mut bank = bank();
        let mut broadcaster = broadcaster();
        broadcaster.flush(&mut bank);

        bank.accounts.get_mut(&2).unwrap().cash.set(21);
        bank.accounts.remove(&3);
        let changed = broadcaster.flush(&mut bank);
        assert!(changed.patches.contains_key(&1));

        assert!(broadcaster.flush(&mut bank).is_empty());
    }

    #[test]
    fn test_resend_bootstraps_again() {
        let mut bank = bank();
        let mut broadcaster = broadcaster();
        broadcaster.flush(&mut bank);
        assert!(broadcaster.is_bootstrapped(&2));
        assert!(broadcaster.flush(&mut bank).is_empty());

        broadcaster.mark_to_resend_full_state(&[2]);
        assert!(!broadcaster.is_bootstrapped(&2));
        assert_eq!(broadcaster.client_state(&2).unwrap().visibility, Some(sees(&[2])));

        let resent = broadcaster.flush(&mut bank);
        assert!(!resent.patches.contains_key(&1));
        let op = only_op(&resent.patches[&2]);
        assert_eq!(op.kind(), OperationKind::Replace);
        assert_eq!(op.ids(), vec![&2]);
    }

    #[test]
    fn test_visibility_transitions() {
        let mut bank = bank();
        let mut broadcaster = Broadcaster::new(|_: &u32, bank: &Bank| BankVisibility {
            accounts: bank
                .accounts
                .iter()
                .filter(|(_, account)| *account.cash >= 20)
                .map(|(id, _)| *id)
                .collect(),
        });
        broadcaster.connect(7);
        let _: FlushResult<u32, BankOp, Notice> = broadcaster.flush(&mut bank);

        // Account 1 becomes visible, account 3 leaves
        bank.accounts.get_mut(&1).unwrap().cash.set(25);
        bank.accounts.get_mut(&3).unwrap().cash.set(5);
        let result = broadcaster.flush(&mut bank);
        let patch = &result.patches[&7];

        assert_eq!(patch.len(), 2);
        match &patch[0] {
            BankOp::Accounts(Operation::Add(items)) => {
                assert_eq!(items.len(), 1);
                assert_eq!(items[0].0, 1);
                assert_eq!(*items[0].1.cash, 25);
            }
            other => panic!("expected add, got {other:?}"),
        }
        assert_eq!(
            patch[1],
            BankOp::Accounts(Operation::Delete(BTreeSet::from([3])))
        );

        assert!(broadcaster.flush(&mut bank).is_empty());
    }

    #[test]
    fn test_deleted_entity_leaves_visibility() {
        let mut bank = bank();
        let mut broadcaster = broadcaster();
        broadcaster.flush(&mut bank);

        bank.accounts.remove(&2);
        let result = broadcaster.flush(&mut bank);
        for client in [1, 2] {
            assert_eq!(
                result.patches[&client],
                vec![BankOp::Accounts(Operation::Delete(BTreeSet::from([2])))]
            );
        }
    }

    #[test]
    fn test_added_entity_reaches_only_observers() {
        let mut bank = bank();
        let mut broadcaster = broadcaster();
        broadcaster.flush(&mut bank);

        bank.accounts.insert(4, Account::new(TrackingMode::Exact, 40));
        let result = broadcaster.flush(&mut bank);
        assert_eq!(only_op(&result.patches[&1]).ids(), vec![&4]);
        assert!(!result.patches.contains_key(&2));
    }

    #[test]
    fn test_events_respect_constraints() {
        let mut bank = bank();
        let mut broadcaster = broadcaster();

        broadcaster.add_event(Notice::Holiday, None);
        broadcaster.add_event(Notice::Audit(3), Some(sees(&[3])));
        broadcaster.add_event(Notice::Audit(2), Some(sees(&[2])));
        assert_eq!(broadcaster.peek_events().len(), 3);

        let mut result = broadcaster.flush(&mut bank);
        assert!(broadcaster.peek_events().is_empty());

        let (_, events) = result.take_bundle(&1);
        assert_eq!(events, vec![Notice::Holiday, Notice::Audit(3), Notice::Audit(2)]);
        let (_, events) = result.take_bundle(&2);
        assert_eq!(events, vec![Notice::Holiday, Notice::Audit(2)]);

        assert!(broadcaster.flush(&mut bank).events.is_empty());
    }

    #[test]
    fn test_visibility_is_pruned() {
        let mut bank = bank();
        let mut broadcaster = Broadcaster::new(|_: &u32, _: &Bank| sees(&[2, 99]));
        broadcaster.connect(1);

        let result: FlushResult<u32, BankOp, Notice> = broadcaster.flush(&mut bank);
        assert_eq!(only_op(&result.patches[&1]).ids(), vec![&2]);
        assert_eq!(broadcaster.client_state(&1).unwrap().visibility, Some(sees(&[2])));
    }

    #[test]
    fn test_connect_and_disconnect() {
        let mut bank = bank();
        let mut broadcaster = broadcaster();
        assert!(!broadcaster.connect(1));
        broadcaster.flush(&mut bank);

        assert!(broadcaster.disconnect(&2).is_some());
        assert!(broadcaster.disconnect(&2).is_none());
        assert_eq!(broadcaster.clients().copied().collect::<Vec<_>>(), vec![1]);

        broadcaster.connect(2);
        let result = broadcaster.flush(&mut bank);
        assert_eq!(only_op(&result.patches[&2]).kind(), OperationKind::Replace);
        assert!(!result.patches.contains_key(&1));
    }
}
