// feed_ingestor/src/queue.rs
// FIFO handoff between the parser and the persistence workers.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::error;

use crate::record::NormalizedRecord;

/// Outcome of [`RecordQueue::try_pop`].
#[derive(Debug,)]
pub enum Pop {
    Record(NormalizedRecord,),
    /// Timed out while the producer is still running.
    Empty,
    /// The producer signalled completion and every queued record has been handed out.
    Exhausted,
}

#[derive(Default,)]
struct QueueState {
    pending: VecDeque<NormalizedRecord,>,
    done:    bool,
}

/// Unbounded multi-consumer queue with an explicit end-of-input signal.
///
/// The pending records and the done flag live under one mutex. `available` plays the role of
/// the condition variable: `push` wakes one waiter, `signal_done` wakes all of them. Waiters
/// register interest before inspecting the state, so no wakeup is lost between the check and
/// the wait.
#[derive(Default,)]
pub struct RecordQueue {
    state:     Mutex<QueueState,>,
    available: Notify,
}

impl RecordQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self,) -> MutexGuard<'_, QueueState,> {
        // Every critical section leaves the state consistent, so a poisoned lock is still usable.
        self.state.lock().unwrap_or_else(PoisonError::into_inner,)
    }

    /// Appends to the back of the queue. Never blocks.
    pub fn push(&self, record: NormalizedRecord,) {
        {
            let mut state = self.lock();
            if state.done {
                error!("Record pushed after the queue was closed; dropping it");
                return;
            }
            state.pending.push_back(record,);
        }
        self.available.notify_one();
    }

    /// Marks the end of input and wakes every blocked consumer. Idempotent.
    pub fn signal_done(&self,) {
        self.lock().done = true;
        self.available.notify_waiters();
    }

    /// Waits up to `timeout` for the next record in insertion order.
    pub async fn try_pop(&self, timeout: Duration,) -> Pop {
        let deadline = Instant::now() + timeout;
        let notified = self.available.notified();
        tokio::pin!(notified);

        loop {
            notified.as_mut().enable();

            if let Some(pop,) = self.poll_state() {
                return pop;
            }

            if tokio::time::timeout_at(deadline, notified.as_mut(),).await.is_err() {
                // A push may have raced the deadline.
                return self.poll_state().unwrap_or(Pop::Empty,);
            }

            notified.set(self.available.notified(),);
        }
    }

    fn poll_state(&self,) -> Option<Pop,> {
        let mut state = self.lock();
        match state.pending.pop_front() {
            Some(record,) => Some(Pop::Record(record,),),
            None if state.done => Some(Pop::Exhausted,),
            None => None,
        }
    }

    pub fn len(&self,) -> usize {
        self.lock().pending.len()
    }

    pub fn is_empty(&self,) -> bool {
        self.len() == 0
    }

    pub fn is_done(&self,) -> bool {
        self.lock().done
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, HashSet};
    use std::sync::Arc;

    use super::*;

    fn record(n: usize,) -> NormalizedRecord {
        let mut fields = BTreeMap::new();
        fields.insert("n".to_string(), n.to_string(),);
        NormalizedRecord::new(Arc::from("C1",), fields,)
    }

    fn number(pop: Pop,) -> Option<usize,> {
        match pop {
            Pop::Record(r,) => r.get("n",).and_then(|n| n.parse().ok(),),
            _ => None,
        }
    }

    #[tokio::test]
    async fn pops_in_insertion_order() {
        let queue = RecordQueue::new();
        for n in 0..5 {
            queue.push(record(n,),);
        }
        for n in 0..5 {
            assert_eq!(number(queue.try_pop(Duration::from_millis(10,),).await,), Some(n));
        }
        assert!(matches!(queue.try_pop(Duration::from_millis(10,),).await, Pop::Empty));
    }

    #[tokio::test]
    async fn drains_before_reporting_exhaustion() {
        let queue = RecordQueue::new();
        queue.push(record(1,),);
        queue.push(record(2,),);
        queue.signal_done();
        queue.signal_done();

        assert_eq!(number(queue.try_pop(Duration::from_millis(10,),).await,), Some(1));
        assert_eq!(number(queue.try_pop(Duration::from_millis(10,),).await,), Some(2));
        assert!(matches!(queue.try_pop(Duration::from_secs(30,),).await, Pop::Exhausted));
        assert!(matches!(queue.try_pop(Duration::from_secs(30,),).await, Pop::Exhausted));
    }

    #[tokio::test]
    async fn push_after_done_is_dropped() {
        let queue = RecordQueue::new();
        queue.signal_done();
        queue.push(record(1,),);
        assert!(queue.is_empty());
        assert!(queue.is_done());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn signal_done_wakes_blocked_consumer() {
        let queue = Arc::new(RecordQueue::new(),);
        let waiter = {
            let queue = Arc::clone(&queue,);
            tokio::spawn(async move { queue.try_pop(Duration::from_secs(60,),).await },)
        };

        tokio::time::sleep(Duration::from_millis(50,),).await;
        queue.signal_done();

        let pop = tokio::time::timeout(Duration::from_secs(5,), waiter,)
            .await
            .expect("consumer stayed blocked after signal_done",)
            .unwrap();
        assert!(matches!(pop, Pop::Exhausted));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn every_record_reaches_exactly_one_consumer() {
        let queue = Arc::new(RecordQueue::new(),);
        let mut consumers = Vec::new();
        for _ in 0..8 {
            let queue = Arc::clone(&queue,);
            consumers.push(tokio::spawn(async move {
                let mut seen = Vec::new();
                loop {
                    match queue.try_pop(Duration::from_millis(5,),).await {
                        Pop::Record(r,) => seen.push(r.get("n",).unwrap().parse::<usize>().unwrap(),),
                        Pop::Empty => continue,
                        Pop::Exhausted => return seen,
                    }
                }
            },),);
        }

        let producer = {
            let queue = Arc::clone(&queue,);
            tokio::task::spawn_blocking(move || {
                for n in 0..5000 {
                    queue.push(record(n,),);
                }
                queue.signal_done();
            },)
        };
        producer.await.unwrap();

        let mut all = Vec::new();
        for consumer in consumers {
            let seen = consumer.await.unwrap();
            // Each consumer observes its share in global FIFO order.
            assert!(seen.windows(2,).all(|w| w[0] < w[1]));
            all.extend(seen,);
        }
        assert_eq!(all.len(), 5000);
        let distinct: HashSet<usize,> = all.into_iter().collect();
        assert_eq!(distinct.len(), 5000);
    }
}
