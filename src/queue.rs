//! Shared dynamic queue of work items.
//!
//! The queue also keeps the job's ledger: which items are in flight and how many finished,
//! so that `succeeded + abandoned + queued + in_flight == created` holds for every snapshot.

use std::collections::{HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkItem {
    pub id: u64,
    /// Attempts made so far; 0 for a never-tried item.
    pub attempts: u32,
}

impl WorkItem {
    pub fn new(id: u64) -> Self {
        Self { id, attempts: 0 }
    }
}

/// Consistent snapshot of the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Tally {
    pub created: u64,
    pub succeeded: u64,
    pub abandoned: u64,
    pub queued: u64,
    pub in_flight: u64,
}

impl Tally {
    /// Items not yet succeeded or abandoned.
    pub fn unfinished(&self) -> u64 {
        self.created - self.succeeded - self.abandoned
    }

    pub fn is_conserved(&self) -> bool {
        self.succeeded + self.abandoned + self.queued + self.in_flight == self.created
    }
}

#[derive(Debug, Default)]
struct Ledger {
    pending: VecDeque<WorkItem>,
    in_flight: HashSet<u64>,
    created: u64,
    succeeded: u64,
    abandoned: u64,
}

impl Ledger {
    fn tally(&self) -> Tally {
        Tally {
            created: self.created,
            succeeded: self.succeeded,
            abandoned: self.abandoned,
            queued: self.pending.len() as u64,
            in_flight: self.in_flight.len() as u64,
        }
    }
}

#[derive(Debug, Default)]
pub struct WorkQueue {
    ledger: Mutex<Ledger>,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue seeded with fresh items, in order.
    pub fn seeded(ids: impl IntoIterator<Item = u64>) -> Self {
        let queue = Self::new();
        for id in ids {
            queue.push_back(WorkItem::new(id));
        }
        queue
    }

    fn lock(&self) -> MutexGuard<'_, Ledger> {
        self.ledger.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Claims the item at the front. The caller holds it exclusively until it hands it back
    /// with [`push_back`](Self::push_back), [`succeed`](Self::succeed) or
    /// [`abandon`](Self::abandon).
    pub fn pop_front(&self) -> Option<WorkItem> {
        let mut ledger = self.lock();
        let item = ledger.pending.pop_front()?;
        ledger.in_flight.insert(item.id);
        Some(item)
    }

    /// Appends an item. A claimed item goes back to waiting; any other item is new work.
    pub fn push_back(&self, item: WorkItem) {
        let mut ledger = self.lock();
        if !ledger.in_flight.remove(&item.id) {
            ledger.created += 1;
        }
        ledger.pending.push_back(item);
    }

    /// Marks a claimed item as done. Returns false if the item was not claimed.
    pub fn succeed(&self, item: WorkItem) -> bool {
        let mut ledger = self.lock();
        let claimed = ledger.in_flight.remove(&item.id);
        if claimed {
            ledger.succeeded += 1;
        }
        claimed
    }

    /// Gives up on a claimed item for good. Returns false if the item was not claimed.
    pub fn abandon(&self, item: WorkItem) -> bool {
        let mut ledger = self.lock();
        let claimed = ledger.in_flight.remove(&item.id);
        if claimed {
            ledger.abandoned += 1;
        }
        claimed
    }

    /// Number of items waiting to be claimed.
    pub fn len(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn tally(&self) -> Tally {
        self.lock().tally()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;

    #[test]
    fn pop_front_is_fifo_and_requeue_goes_to_back() {
        let queue = WorkQueue::seeded(1..=3);
        let first = queue.pop_front().unwrap();
        assert_eq!(first.id, 1);
        queue.push_back(WorkItem {
            attempts: first.attempts + 1,
            ..first
        });
        let order: Vec<_> = std::iter::from_fn(|| queue.pop_front()).collect();
        assert_eq!(order.iter().map(|i| i.id).collect::<Vec<_>>(), vec![2, 3, 1]);
        assert_eq!(order[2].attempts, 1);
        // Requeue doesn't count as new work.
        assert_eq!(queue.tally().created, 3);
    }

    #[test]
    fn ledger_counts_terminal_states() {
        let queue = WorkQueue::seeded(0..4);
        let a = queue.pop_front().unwrap();
        let b = queue.pop_front().unwrap();
        assert!(queue.succeed(a));
        assert!(queue.abandon(b));
        assert!(!queue.succeed(a), "an item can only finish once");

        let tally = queue.tally();
        assert_eq!(tally.succeeded, 1);
        assert_eq!(tally.abandoned, 1);
        assert_eq!(tally.queued, 2);
        assert_eq!(tally.in_flight, 0);
        assert_eq!(tally.unfinished(), 2);
        assert!(tally.is_conserved());
    }

    #[test]
    fn empty_queue_pops_none() {
        let queue = WorkQueue::new();
        assert!(queue.pop_front().is_none());
        assert!(queue.is_empty());
        assert_eq!(queue.tally(), Tally::default());
    }

    #[test]
    fn concurrent_workers_never_share_an_item() {
        const WORKERS: u64 = 8;
        const ITEMS: u64 = 1000;

        let queue = Arc::new(WorkQueue::seeded(0..ITEMS));
        let held = Arc::new(Mutex::new(HashSet::new()));

        let handles: Vec<_> = (0..WORKERS)
            .map(|w| {
                let queue = Arc::clone(&queue);
                let held = Arc::clone(&held);
                std::thread::spawn(move || {
                    let mut turn = 0u64;
                    loop {
                        let item = match queue.pop_front() {
                            Some(item) => item,
                            None if queue.tally().unfinished() == 0 => break,
                            None => {
                                std::thread::yield_now();
                                continue;
                            }
                        };
                        assert!(
                            held.lock().unwrap().insert(item.id),
                            "item {} handed to two workers",
                            item.id
                        );
                        assert!(queue.tally().is_conserved());
                        turn += 1;
                        held.lock().unwrap().remove(&item.id);
                        // Every few turns, fail the attempt and requeue.
                        if (turn + w) % 5 == 0 && item.attempts < 2 {
                            queue.push_back(WorkItem {
                                attempts: item.attempts + 1,
                                ..item
                            });
                        } else {
                            queue.succeed(item);
                        }
                        assert!(queue.tally().is_conserved());
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let tally = queue.tally();
        assert_eq!(tally.succeeded, ITEMS);
        assert_eq!(tally.created, ITEMS);
        assert!(tally.is_conserved());
    }
}
