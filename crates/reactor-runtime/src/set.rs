//! Insertion-ordered fiber set
//!
//! Iteration follows the order fibers entered the set, which is what makes a
//! round's snapshot run fibers in arrival order. Re-inserting a removed fiber
//! puts it at the back.

use reactor_core::id::FiberId;
use std::collections::{BTreeMap, HashMap};

#[derive(Default)]
pub(crate) struct FiberSet {
    order: BTreeMap<u64, FiberId>,
    tickets: HashMap<FiberId, u64>,
    next_ticket: u64,
}

impl FiberSet {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Returns false if the fiber was already present
    pub(crate) fn insert(&mut self, id: FiberId) -> bool {
        if self.tickets.contains_key(&id) {
            return false;
        }
        let ticket = self.next_ticket;
        self.next_ticket += 1;
        self.order.insert(ticket, id);
        self.tickets.insert(id, ticket);
        true
    }

    pub(crate) fn remove(&mut self, id: FiberId) -> bool {
        match self.tickets.remove(&id) {
            Some(ticket) => {
                self.order.remove(&ticket);
                true
            }
            None => false,
        }
    }

    pub(crate) fn contains(&self, id: FiberId) -> bool {
        self.tickets.contains_key(&id)
    }

    pub(crate) fn len(&self) -> usize {
        self.tickets.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.tickets.is_empty()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = FiberId> + '_ {
        self.order.values().copied()
    }

    /// Copy of the members, in order, unaffected by later mutation
    pub(crate) fn snapshot(&self) -> Vec<FiberId> {
        self.iter().collect()
    }
}
