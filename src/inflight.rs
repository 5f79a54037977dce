//! In-flight transfer scheduler.
//!
//! Submitted transfers are kept in a list ordered by deadline ascending, with
//! infinite-timeout transfers forming the tail, so the nearest deadline is
//! found at the head and expiry sweeps stop at the first unexpired entry.
//! Nodes live in a [`Slab`]; the stable key stored on each transfer gives
//! O(1) unlink on completion.

use std::time::Instant;

use slab::Slab;

use crate::{deadline::Deadline, transfer::Transfer};

struct Node {
    transfer: Transfer,
    deadline: Deadline,

    /// Latched once the expiry sweep has issued an asynchronous cancel for
    /// this entry; excluded from further deadline lookups and sweeps.
    timed_out: bool,

    prev: Option<usize>,
    next: Option<usize>,
}

#[derive(Default)]
pub(crate) struct InflightQueue {
    nodes: Slab<Node>,
    head: Option<usize>,
    tail: Option<usize>,
}

impl InflightQueue {
    pub fn new() -> InflightQueue {
        InflightQueue::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Insert a transfer, keeping deadlines ascending with unset deadlines at
    /// the tail. Equal deadlines and the unset suffix stay in submission
    /// order. Returns the slab key for later removal.
    pub fn insert(&mut self, transfer: Transfer, deadline: Deadline) -> usize {
        let mut insert_before = None;
        let mut cursor = self.head;
        while let Some(key) = cursor {
            if self.nodes[key].deadline > deadline {
                insert_before = Some(key);
                break;
            }
            cursor = self.nodes[key].next;
        }

        let node = Node {
            transfer,
            deadline,
            timed_out: false,
            prev: None,
            next: None,
        };
        let key = self.nodes.insert(node);

        match insert_before {
            Some(next) => {
                let prev = self.nodes[next].prev;
                self.nodes[key].prev = prev;
                self.nodes[key].next = Some(next);
                self.nodes[next].prev = Some(key);
                match prev {
                    Some(prev) => self.nodes[prev].next = Some(key),
                    None => self.head = Some(key),
                }
            }
            None => {
                self.nodes[key].prev = self.tail;
                match self.tail {
                    Some(tail) => self.nodes[tail].next = Some(key),
                    None => self.head = Some(key),
                }
                self.tail = Some(key);
            }
        }
        key
    }

    /// Unlink by slab key.
    pub fn remove(&mut self, key: usize) -> Option<Transfer> {
        if !self.nodes.contains(key) {
            return None;
        }
        let node = self.nodes.remove(key);
        match node.prev {
            Some(prev) => self.nodes[prev].next = node.next,
            None => self.head = node.next,
        }
        match node.next {
            Some(next) => self.nodes[next].prev = node.prev,
            None => self.tail = node.prev,
        }
        Some(node.transfer)
    }

    pub fn is_timed_out(&self, key: usize) -> bool {
        self.nodes.get(key).is_some_and(|n| n.timed_out)
    }

    /// Deadline of the nearest entry that has not already been latched by the
    /// expiry sweep. [`Deadline::NONE`] if every remaining entry is latched
    /// or can never expire.
    pub fn next_deadline(&self) -> Deadline {
        let mut cursor = self.head;
        while let Some(key) = cursor {
            let node = &self.nodes[key];
            if !node.timed_out {
                return node.deadline;
            }
            cursor = node.next;
        }
        Deadline::NONE
    }

    /// Latch and return the entries whose deadline has passed. The walk stops
    /// at the first entry that is unexpired or can never expire; entries
    /// latched by an earlier sweep are skipped.
    pub fn take_expired(&mut self, now: Instant) -> Vec<Transfer> {
        let mut expired = Vec::new();
        let mut cursor = self.head;
        while let Some(key) = cursor {
            let node = &mut self.nodes[key];
            if !node.deadline.expired_at(now) {
                break;
            }
            if !node.timed_out {
                node.timed_out = true;
                expired.push(node.transfer.clone());
            }
            cursor = node.next;
        }
        expired
    }

    /// Iterate in deadline order. Used by tests to check the ordering
    /// invariant.
    #[cfg(test)]
    pub fn iter(&self) -> impl Iterator<Item = &Transfer> {
        let mut cursor = self.head;
        std::iter::from_fn(move || {
            let key = cursor?;
            cursor = self.nodes[key].next;
            Some(&self.nodes[key].transfer)
        })
    }

    #[cfg(test)]
    pub fn deadlines(&self) -> Vec<Deadline> {
        let mut out = Vec::new();
        let mut cursor = self.head;
        while let Some(key) = cursor {
            out.push(self.nodes[key].deadline);
            cursor = self.nodes[key].next;
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn deadline_in(ms: u64) -> Deadline {
        Deadline::after(Duration::from_millis(ms))
    }

    // Queue ordering is independent of the transfers carried; tests use
    // placeholder transfers from the mock context.
    fn placeholder() -> Transfer {
        crate::tests::mock::placeholder_transfer()
    }

    fn assert_sorted(q: &InflightQueue) {
        let ds = q.deadlines();
        assert!(
            ds.windows(2).all(|w| w[0] <= w[1]),
            "deadlines out of order: {ds:?}"
        );
    }

    #[test]
    fn orders_by_deadline_with_infinite_tail() {
        let mut q = InflightQueue::new();
        q.insert(placeholder(), deadline_in(200));
        q.insert(placeholder(), Deadline::NONE);
        q.insert(placeholder(), deadline_in(50));
        q.insert(placeholder(), deadline_in(500));
        q.insert(placeholder(), Deadline::NONE);
        assert_sorted(&q);

        let ds = q.deadlines();
        assert_eq!(ds.len(), 5);
        assert!(ds[..3].iter().all(|d| !d.is_none()));
        assert!(ds[3..].iter().all(|d| d.is_none()));
        assert_eq!(q.next_deadline(), ds[0]);
    }

    #[test]
    fn removal_by_key_relinks_neighbors() {
        let mut q = InflightQueue::new();
        let a = q.insert(placeholder(), deadline_in(10));
        let b = q.insert(placeholder(), deadline_in(20));
        let c = q.insert(placeholder(), deadline_in(30));

        assert!(q.remove(b).is_some());
        assert_eq!(q.len(), 2);
        assert_sorted(&q);

        assert!(q.remove(a).is_some());
        assert!(q.remove(c).is_some());
        assert_eq!(q.len(), 0);
        assert!(q.next_deadline().is_none());
        assert!(q.remove(c).is_none());
    }

    #[test]
    fn sweep_latches_expired_entries_once() {
        let mut q = InflightQueue::new();
        let a = q.insert(placeholder(), deadline_in(1));
        q.insert(placeholder(), deadline_in(2));
        q.insert(placeholder(), deadline_in(10_000));
        q.insert(placeholder(), Deadline::NONE);

        let later = Instant::now() + Duration::from_millis(100);
        let expired = q.take_expired(later);
        assert_eq!(expired.len(), 2);
        assert!(q.is_timed_out(a));

        // latched entries are skipped by both the deadline lookup and
        // subsequent sweeps
        assert!(!q.next_deadline().is_none());
        assert!(q.next_deadline() > deadline_in(1_000));
        assert!(q.take_expired(later).is_empty());
    }

    #[test]
    fn infinite_entries_never_expire() {
        let mut q = InflightQueue::new();
        q.insert(placeholder(), Deadline::NONE);
        let far = Instant::now() + Duration::from_secs(3600);
        assert!(q.take_expired(far).is_empty());
        assert!(q.next_deadline().is_none());
    }
}
