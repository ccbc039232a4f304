//! Shared per-slot work queues with stealing and node draining.
//!
//! Every runner slot has its own ordered queue. A slot takes from the front
//! of its own queue; once it runs dry it steals from the back of the most
//! loaded queue, leaving the victim's upcoming order untouched. A test is
//! either queued in exactly one slot or in flight, never both.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

use tokio::sync::Notify;
use tracing::debug;

use crate::inventory::TestCase;

/// A test case bound to a runner slot.
#[derive(Debug, Clone)]
pub struct WorkItem {
    pub case: TestCase,
    /// Slot currently holding the item.
    pub slot: usize,
    /// Position in the slot's queue when it was assigned.
    pub position: usize,
    /// Counted attempts already made.
    pub attempt: usize,
    /// Infrastructure failures already absorbed.
    pub infra_attempts: usize,
}

/// What happens to the pending work of a retired node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainMode {
    /// Spread onto the slots of the remaining nodes.
    Redistribute,
    /// Hand back to the caller.
    Abandon,
}

struct State {
    queues: Vec<VecDeque<WorkItem>>,
    owners: Vec<String>,
    retired: Vec<bool>,
    in_flight: usize,
}

impl State {
    /// Viable slot with the shortest queue.
    fn shortest_viable(&self) -> Option<usize> {
        (0..self.queues.len())
            .filter(|&i| !self.retired[i])
            .min_by_key(|&i| self.queues[i].len())
    }

    fn push(&mut self, slot: usize, mut item: WorkItem) {
        item.slot = slot;
        item.position = self.queues[slot].len();
        self.queues[slot].push_back(item);
    }
}

/// Queues shared by all workers of a session.
pub struct WorkQueues {
    state: Mutex<State>,
    notify: Notify,
}

impl WorkQueues {
    /// Builds the queues; `owners[i]` is the node hosting slot `i`.
    pub fn new(assignments: Vec<Vec<TestCase>>, owners: Vec<String>) -> Self {
        assert_eq!(
            assignments.len(),
            owners.len(),
            "one owner per slot is required"
        );

        let queues: Vec<VecDeque<WorkItem>> = assignments
            .into_iter()
            .enumerate()
            .map(|(slot, tests)| {
                tests
                    .into_iter()
                    .enumerate()
                    .map(|(position, case)| WorkItem {
                        case,
                        slot,
                        position,
                        attempt: 0,
                        infra_attempts: 0,
                    })
                    .collect()
            })
            .collect();

        let retired = vec![false; queues.len()];
        Self {
            state: Mutex::new(State {
                queues,
                owners,
                retired,
                in_flight: 0,
            }),
            notify: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Takes the next item for `slot`.
    ///
    /// Waits while other slots still have items in flight that may come back
    /// as retries. Returns `None` once nothing is queued or in flight, or when
    /// the slot has been retired.
    pub async fn next(&self, slot: usize) -> Option<WorkItem> {
        loop {
            let notified = {
                let mut state = self.lock();
                if state.retired.get(slot).copied().unwrap_or(true) {
                    return None;
                }

                if let Some(item) = state.queues[slot].pop_front() {
                    state.in_flight += 1;
                    return Some(item);
                }

                let victim = (0..state.queues.len())
                    .filter(|&i| i != slot && !state.retired[i])
                    .max_by_key(|&i| state.queues[i].len())
                    .filter(|&i| !state.queues[i].is_empty());
                if let Some(victim) = victim
                    && let Some(mut item) = state.queues[victim].pop_back()
                {
                    debug!(
                        "Slot {} steals {} from slot {}",
                        slot, item.case, victim
                    );
                    item.slot = slot;
                    state.in_flight += 1;
                    return Some(item);
                }

                if state.in_flight == 0 {
                    drop(state);
                    self.notify.notify_waiters();
                    return None;
                }

                // Registered before the lock is released so no wakeup is missed
                self.notify.notified()
            };
            notified.await;
        }
    }

    /// Marks one in-flight item as finished.
    pub fn complete(&self) {
        {
            let mut state = self.lock();
            state.in_flight = state.in_flight.saturating_sub(1);
        }
        self.notify.notify_waiters();
    }

    /// Queues a retry of an in-flight item.
    ///
    /// The item goes back to its own slot, or to the shortest viable queue
    /// when that slot has been retired. Returns the item if no slot is left.
    pub fn requeue(&self, slot: usize, item: WorkItem) -> Option<WorkItem> {
        let leftover = {
            let mut state = self.lock();
            let target = if state.retired.get(slot).copied().unwrap_or(true) {
                state.shortest_viable()
            } else {
                Some(slot)
            };
            match target {
                Some(target) => {
                    state.push(target, item);
                    None
                }
                None => Some(item),
            }
        };
        self.notify.notify_waiters();
        leftover
    }

    /// Retires every slot of `node` and drains their pending items.
    ///
    /// With [`DrainMode::Redistribute`] the items move to the shortest viable
    /// queues; only items that found no viable slot are returned. With
    /// [`DrainMode::Abandon`] all drained items are returned.
    pub fn retire_node(&self, node: &str, mode: DrainMode) -> Vec<WorkItem> {
        let leftovers = {
            let mut state = self.lock();
            let mut drained = Vec::new();
            for i in 0..state.queues.len() {
                if state.owners[i] == node {
                    state.retired[i] = true;
                    drained.extend(state.queues[i].drain(..));
                }
            }

            match mode {
                DrainMode::Abandon => drained,
                DrainMode::Redistribute => {
                    let mut leftovers = Vec::new();
                    for item in drained {
                        match state.shortest_viable() {
                            Some(target) => state.push(target, item),
                            None => leftovers.push(item),
                        }
                    }
                    leftovers
                }
            }
        };
        self.notify.notify_waiters();
        leftovers
    }

    /// Number of queued (not in-flight) items.
    pub fn pending(&self) -> usize {
        self.lock().queues.iter().map(VecDeque::len).sum()
    }

    /// Number of slots that have not been retired.
    pub fn viable_slots(&self) -> usize {
        self.lock().retired.iter().filter(|r| !**r).count()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    fn cases(prefix: &str, n: usize) -> Vec<TestCase> {
        (0..n)
            .map(|i| TestCase::new(prefix, format!("t{}", i)))
            .collect()
    }

    #[tokio::test]
    async fn test_own_queue_in_order_then_steal_from_back() {
        let queues = WorkQueues::new(
            vec![cases("A", 2), cases("B", 3)],
            vec!["n1".into(), "n1".into()],
        );

        let first = queues.next(0).await.unwrap();
        assert_eq!(first.case.identifier(), "A/t0");
        let second = queues.next(0).await.unwrap();
        assert_eq!(second.case.identifier(), "A/t1");

        let stolen = queues.next(0).await.unwrap();
        assert_eq!(stolen.case.identifier(), "B/t2");
        assert_eq!(stolen.slot, 0);

        let own = queues.next(1).await.unwrap();
        assert_eq!(own.case.identifier(), "B/t0");
    }

    #[tokio::test]
    async fn test_next_returns_none_when_all_done() {
        let queues = WorkQueues::new(vec![cases("A", 1), vec![]], vec!["n".into(), "n".into()]);
        let item = queues.next(0).await.unwrap();
        queues.complete();
        drop(item);
        assert!(queues.next(0).await.is_none());
        assert!(queues.next(1).await.is_none());
    }

    #[tokio::test]
    async fn test_idle_slot_waits_for_retry() {
        let queues = Arc::new(WorkQueues::new(
            vec![cases("A", 1), vec![]],
            vec!["n".into(), "n".into()],
        ));
        let mut item = queues.next(0).await.unwrap();

        let waiter = {
            let queues = queues.clone();
            tokio::spawn(async move { queues.next(1).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        item.attempt += 1;
        assert!(queues.requeue(0, item).is_none());
        queues.complete();

        let retried = waiter.await.unwrap().unwrap();
        assert_eq!(retried.attempt, 1);
        assert_eq!(retried.slot, 1);
    }

    #[test]
    fn test_waiter_woken_when_last_item_completes() {
        let queues = WorkQueues::new(vec![cases("A", 1), vec![]], vec!["n".into(), "n".into()]);
        let mut first = tokio_test::task::spawn(queues.next(0));
        assert!(tokio_test::assert_ready!(first.poll()).is_some());

        let mut idle = tokio_test::task::spawn(queues.next(1));
        tokio_test::assert_pending!(idle.poll());

        queues.complete();
        assert!(idle.is_woken());
        assert!(tokio_test::assert_ready!(idle.poll()).is_none());
    }

    #[tokio::test]
    async fn test_retire_node_redistributes() {
        let queues = WorkQueues::new(
            vec![cases("A", 3), cases("B", 1), cases("C", 1)],
            vec!["bad".into(), "good".into(), "good".into()],
        );
        let leftovers = queues.retire_node("bad", DrainMode::Redistribute);
        assert!(leftovers.is_empty());
        assert!(queues.next(0).await.is_none());
        assert_eq!(queues.pending(), 5);
        assert_eq!(queues.viable_slots(), 2);

        let mut seen = HashSet::new();
        while let Some(item) = queues.next(1).await {
            assert!(seen.insert(item.case.identifier()));
            queues.complete();
        }
        assert_eq!(seen.len(), 5);
    }

    #[tokio::test]
    async fn test_retire_node_abandon_and_last_node() {
        let queues = WorkQueues::new(vec![cases("A", 2)], vec!["only".into()]);
        let item = queues.next(0).await.unwrap();

        let abandoned = queues.retire_node("only", DrainMode::Abandon);
        assert_eq!(abandoned.len(), 1);

        let back = queues.requeue(0, item);
        assert!(back.is_some());
        queues.complete();
        assert_eq!(queues.pending(), 0);
    }
}
