use lutpir_common::{
    branch_opt_util,
    error::LutPIRError,
    he::SchemeParams,
    packet::{FuncNo, KeyId, QueryId, QueryRequest},
};
use std::{
    collections::BTreeMap,
    sync::{Condvar, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

/// A submitted lookup, immutable from receipt until a worker consumes it.
#[derive(Clone, Debug, PartialEq)]
pub struct Query {
    pub key_id: KeyId,
    pub func_no: FuncNo,
    pub params: SchemeParams,
    /// Serialized ciphertexts, one per table input.
    pub inputs: Vec<Vec<u8>>,
}

impl From<QueryRequest> for Query {
    fn from(request: QueryRequest) -> Self {
        Query {
            key_id: request.key_id,
            func_no: request.func_no,
            params: request.params,
            inputs: request.inputs,
        }
    }
}

/// Pending queries keyed by id. Consumers block on a condition variable instead of polling.
#[derive(Default)]
pub struct QueryQueue {
    entries: Mutex<BTreeMap<QueryId, Query>>,
    cond: Condvar,
}

impl QueryQueue {
    pub fn new() -> QueryQueue {
        QueryQueue::default()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<QueryId, Query>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push(&self, query_id: QueryId, query: Query) -> Result<(), LutPIRError> {
        self.try_push(query_id, query, usize::MAX)
    }

    /// Inserts `query` only if fewer than `capacity` queries are pending. Checked and inserted under one lock, and
    /// the queue is left untouched on rejection.
    pub fn try_push(&self, query_id: QueryId, query: Query, capacity: usize) -> Result<(), LutPIRError> {
        let mut entries = self.lock();

        if branch_opt_util::unlikely(entries.len() >= capacity) {
            return Err(LutPIRError::QueryAdmissionRejected);
        }
        if branch_opt_util::unlikely(entries.contains_key(&query_id)) {
            return Err(LutPIRError::QueryIdAlreadyExists(query_id));
        }

        entries.insert(query_id, query);
        drop(entries);

        self.cond.notify_one();
        Ok(())
    }

    /// Removes the oldest pending query, without blocking.
    pub fn pop(&self) -> Option<(QueryId, Query)> {
        self.lock().pop_first()
    }

    /// Removes the oldest pending query, waiting at most `timeout` for one to arrive.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<(QueryId, Query)> {
        let entries = self.lock();
        let (mut entries, _) = self
            .cond
            .wait_timeout_while(entries, timeout, |entries| entries.is_empty())
            .unwrap_or_else(PoisonError::into_inner);

        entries.pop_first()
    }

    /// Removes a specific query. Reports absence instead of blocking.
    pub fn take(&self, query_id: QueryId) -> Option<Query> {
        self.lock().remove(&query_id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Wakes every blocked consumer, so it can re-check for shutdown.
    pub fn wake_all(&self) {
        self.cond.notify_all();
    }
}

#[cfg(test)]
mod test {
    use super::{Query, QueryQueue};
    use lutpir_common::{error::LutPIRError, he::SchemeParams, packet::FuncNo};
    use std::{sync::Arc, thread, time::Duration};

    fn dummy_query(key_id: u32) -> Query {
        Query {
            key_id,
            func_no: FuncNo::OneInput,
            params: SchemeParams::default(),
            inputs: vec![vec![0u8; 8]],
        }
    }

    #[test]
    fn duplicate_query_id_is_rejected() {
        let queue = QueryQueue::new();

        assert_eq!(queue.push(1, dummy_query(10)), Ok(()));
        assert_eq!(queue.push(1, dummy_query(11)), Err(LutPIRError::QueryIdAlreadyExists(1)));
        assert_eq!(queue.take(1), Some(dummy_query(10)));
    }

    #[test]
    fn pop_on_empty_queue_reports_not_found() {
        let queue = QueryQueue::new();

        assert_eq!(queue.pop(), None);
        assert_eq!(queue.take(42), None);
        assert_eq!(queue.pop_timeout(Duration::from_millis(10)), None);
    }

    #[test]
    fn queries_are_popped_in_id_order() {
        let queue = QueryQueue::new();
        queue.push(3, dummy_query(3)).unwrap();
        queue.push(1, dummy_query(1)).unwrap();
        queue.push(2, dummy_query(2)).unwrap();

        let popped = std::iter::from_fn(|| queue.pop()).map(|(query_id, _)| query_id).collect::<Vec<_>>();
        assert_eq!(popped, vec![1, 2, 3]);
    }

    #[test]
    fn rejection_at_capacity_leaves_queue_untouched() {
        let queue = QueryQueue::new();
        queue.try_push(1, dummy_query(1), 2).unwrap();
        queue.try_push(2, dummy_query(2), 2).unwrap();

        assert_eq!(queue.try_push(3, dummy_query(3), 2), Err(LutPIRError::QueryAdmissionRejected));
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.take(3), None);
    }

    #[test]
    fn blocked_consumer_is_woken_by_producer() {
        let queue = Arc::new(QueryQueue::new());

        let consumer = {
            let queue = queue.clone();
            thread::spawn(move || queue.pop_timeout(Duration::from_secs(10)))
        };

        thread::sleep(Duration::from_millis(20));
        queue.push(9, dummy_query(9)).unwrap();

        assert_eq!(consumer.join().unwrap(), Some((9, dummy_query(9))));
        assert!(queue.is_empty());
    }
}
