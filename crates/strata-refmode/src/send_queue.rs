//! Ordered outbound queue with per-item version holds.
//!
//! An item may wait on one or more backing-store entities reaching a given
//! version. Items leave the queue strictly in enqueue order: a held item
//! blocks every item behind it, even ones that could go immediately.

use std::collections::{BTreeSet, VecDeque};

use strata_crdt::VersionMap;
use strata_types::ReferenceId;

/// A wait for entity `id` to reach at least `version`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Hold {
    pub id: ReferenceId,
    pub version: VersionMap,
}

impl Hold {
    pub fn new(id: impl Into<ReferenceId>, version: VersionMap) -> Self {
        Self {
            id: id.into(),
            version,
        }
    }
}

struct Pending<S> {
    token: u64,
    holds: Vec<Hold>,
    item: S,
}

/// FIFO of outbound items, each released once all of its holds clear.
pub struct SendQueue<S> {
    pending: VecDeque<Pending<S>>,
    next_token: u64,
}

impl<S> Default for SendQueue<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> SendQueue<S> {
    pub fn new() -> Self {
        Self {
            pending: VecDeque::new(),
            next_token: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Queue an item with no holds, returning every item now ready to go.
    pub fn enqueue(&mut self, item: S) -> Vec<S> {
        self.enqueue_blocking(Vec::new(), item).1
    }

    /// Queue an item that must wait for `holds`.
    ///
    /// Returns a token for [`SendQueue::cancel`] and every item now ready to
    /// go, in order.
    pub fn enqueue_blocking(&mut self, holds: Vec<Hold>, item: S) -> (u64, Vec<S>) {
        let token = self.next_token;
        self.next_token += 1;
        self.pending.push_back(Pending { token, holds, item });
        (token, self.flush())
    }

    /// Record that entity `id` reached `version`.
    ///
    /// Clears every hold on `id` that `version` satisfies and returns the
    /// items that became ready.
    pub fn notify(&mut self, id: &str, version: &VersionMap) -> Vec<S> {
        for pending in &mut self.pending {
            pending
                .holds
                .retain(|hold| hold.id != id || !version.dominates(&hold.version));
        }
        self.flush()
    }

    /// Drop a still-queued item.
    ///
    /// Returns `None` if the item already left the queue; otherwise the items
    /// that became ready because it no longer blocks them.
    pub fn cancel(&mut self, token: u64) -> Option<Vec<S>> {
        let position = self.pending.iter().position(|p| p.token == token)?;
        self.pending.remove(position);
        Some(self.flush())
    }

    /// Ids of every entity some queued item still waits on.
    pub fn held_ids(&self) -> BTreeSet<ReferenceId> {
        self.pending
            .iter()
            .flat_map(|pending| pending.holds.iter().map(|hold| hold.id.clone()))
            .collect()
    }

    /// Stop waiting: drop every hold and return all queued items in order.
    pub fn release_all(&mut self) -> Vec<S> {
        self.pending.drain(..).map(|pending| pending.item).collect()
    }

    fn flush(&mut self) -> Vec<S> {
        let mut ready = Vec::new();
        while self.pending.front().is_some_and(|p| p.holds.is_empty()) {
            if let Some(pending) = self.pending.pop_front() {
                ready.push(pending.item);
            }
        }
        ready
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(n: u64) -> VersionMap {
        VersionMap::from([("w", n)])
    }

    #[test]
    fn unheld_items_go_immediately() {
        let mut queue = SendQueue::new();
        assert_eq!(queue.enqueue(1), vec![1]);
        assert_eq!(queue.enqueue(2), vec![2]);
        assert!(queue.is_empty());
    }

    #[test]
    fn held_item_blocks_later_items() {
        let mut queue = SendQueue::new();
        let (_, ready) = queue.enqueue_blocking(vec![Hold::new("e1", v(2))], "held");
        assert!(ready.is_empty());
        assert!(queue.enqueue("free").is_empty());
        assert_eq!(queue.len(), 2);

        // An older version does not release the hold.
        assert!(queue.notify("e1", &v(1)).is_empty());
        assert!(queue.notify("e2", &v(9)).is_empty());
        assert_eq!(queue.notify("e1", &v(2)), vec!["held", "free"]);
        assert!(queue.is_empty());
    }

    #[test]
    fn every_hold_must_clear() {
        let mut queue = SendQueue::new();
        queue.enqueue_blocking(vec![Hold::new("a", v(1)), Hold::new("b", v(1))], 7);
        assert!(queue.notify("a", &v(3)).is_empty());
        assert_eq!(queue.notify("b", &v(1)), vec![7]);
    }

    #[test]
    fn later_hold_released_first_still_waits_its_turn() {
        let mut queue = SendQueue::new();
        queue.enqueue_blocking(vec![Hold::new("a", v(1))], 1);
        queue.enqueue_blocking(vec![Hold::new("b", v(1))], 2);
        assert!(queue.notify("b", &v(1)).is_empty());
        assert_eq!(queue.notify("a", &v(1)), vec![1, 2]);
    }

    #[test]
    fn cancel_unblocks_followers() {
        let mut queue = SendQueue::new();
        let (token, _) = queue.enqueue_blocking(vec![Hold::new("a", v(1))], 1);
        queue.enqueue(2);
        assert_eq!(queue.cancel(token), Some(vec![2]));
        assert_eq!(queue.cancel(token), None);
    }

    #[test]
    fn held_ids_lists_outstanding_holds() {
        let mut queue = SendQueue::new();
        queue.enqueue_blocking(vec![Hold::new("b", v(1)), Hold::new("a", v(1))], 1);
        queue.enqueue_blocking(vec![Hold::new("a", v(2))], 2);
        assert_eq!(queue.held_ids().into_iter().collect::<Vec<_>>(), vec!["a", "b"]);

        queue.notify("b", &v(1));
        assert_eq!(queue.held_ids().len(), 1);
        assert_eq!(queue.notify("a", &v(2)), vec![1, 2]);
        assert!(queue.held_ids().is_empty());
    }

    #[test]
    fn release_all_keeps_order() {
        let mut queue = SendQueue::new();
        queue.enqueue_blocking(vec![Hold::new("a", v(1))], 1);
        queue.enqueue(2);
        queue.enqueue_blocking(vec![Hold::new("b", v(1))], 3);
        assert_eq!(queue.release_all(), vec![1, 2, 3]);
        assert!(queue.is_empty());
    }

    #[test]
    fn cancel_after_release_is_none() {
        let mut queue = SendQueue::new();
        let (token, _) = queue.enqueue_blocking(vec![Hold::new("a", v(1))], 1);
        assert_eq!(queue.notify("a", &v(1)), vec![1]);
        assert_eq!(queue.cancel(token), None);
    }
}
