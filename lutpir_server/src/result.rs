use lutpir_common::{branch_opt_util, error::LutPIRError, he::SchemeParams, packet::QueryId};
use std::{
    collections::HashMap,
    sync::{Condvar, Mutex, MutexGuard, PoisonError},
    time::{Duration, Instant},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResultStatus {
    Success,
    Failure,
}

/// Outcome of one query, as produced by a worker.
#[derive(Clone, Debug, PartialEq)]
pub struct QueryResult {
    pub query_id: QueryId,
    pub status: ResultStatus,
    /// Parameters the query was evaluated under.
    pub params: SchemeParams,
    /// Encrypted table output; absent on failure.
    pub ciphertext: Option<Vec<u8>>,
}

impl QueryResult {
    pub fn success(query_id: QueryId, params: SchemeParams, ciphertext: Vec<u8>) -> Self {
        QueryResult {
            query_id,
            status: ResultStatus::Success,
            params,
            ciphertext: Some(ciphertext),
        }
    }

    pub fn failure(query_id: QueryId, params: SchemeParams) -> Self {
        QueryResult {
            query_id,
            status: ResultStatus::Failure,
            params,
            ciphertext: None,
        }
    }
}

type ResultEntries = HashMap<QueryId, (QueryResult, Instant)>;

/// Finished results keyed by query id, each remembering when it was inserted.
#[derive(Default)]
pub struct ResultQueue {
    entries: Mutex<ResultEntries>,
    cond: Condvar,
}

impl ResultQueue {
    pub fn new() -> ResultQueue {
        ResultQueue::default()
    }

    fn lock(&self) -> MutexGuard<'_, ResultEntries> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push(&self, result: QueryResult) -> Result<(), LutPIRError> {
        self.push_at(result, Instant::now())
    }

    /// Inserts `result` as if it was produced at `inserted_at`.
    pub fn push_at(&self, result: QueryResult, inserted_at: Instant) -> Result<(), LutPIRError> {
        let mut entries = self.lock();

        if branch_opt_util::unlikely(entries.contains_key(&result.query_id)) {
            return Err(LutPIRError::QueryIdAlreadyExists(result.query_id));
        }

        entries.insert(result.query_id, (result, inserted_at));
        drop(entries);

        self.cond.notify_all();
        Ok(())
    }

    /// Removes and returns the result of `query_id`, if it is already there.
    pub fn take(&self, query_id: QueryId) -> Option<QueryResult> {
        self.lock().remove(&query_id).map(|(result, _)| result)
    }

    /// Like `take`, but waits at most `timeout` for the result to show up.
    pub fn take_timeout(&self, query_id: QueryId, timeout: Duration) -> Option<QueryResult> {
        let entries = self.lock();
        let (mut entries, _) = self
            .cond
            .wait_timeout_while(entries, timeout, |entries| !entries.contains_key(&query_id))
            .unwrap_or_else(PoisonError::into_inner);

        entries.remove(&query_id).map(|(result, _)| result)
    }

    /// Once the queue holds `max_results` or more entries, drops every entry older than `lifetime` at `now`.
    /// Returns how many were dropped.
    pub fn cleanup(&self, max_results: usize, lifetime: Duration, now: Instant) -> usize {
        let mut entries = self.lock();
        if entries.len() < max_results {
            return 0;
        }

        let before = entries.len();
        entries.retain(|_, (_, inserted_at)| now.saturating_duration_since(*inserted_at) <= lifetime);

        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

#[cfg(test)]
mod test {
    use super::{QueryResult, ResultQueue, ResultStatus};
    use lutpir_common::{error::LutPIRError, he::SchemeParams};
    use std::{
        sync::Arc,
        thread,
        time::{Duration, Instant},
    };

    #[test]
    fn result_is_removed_on_retrieval() {
        let queue = ResultQueue::new();
        queue.push(QueryResult::success(5, SchemeParams::default(), vec![1, 2, 3])).unwrap();

        assert_eq!(
            queue.push(QueryResult::failure(5, SchemeParams::default())),
            Err(LutPIRError::QueryIdAlreadyExists(5))
        );

        let result = queue.take(5).unwrap();
        assert_eq!(result.status, ResultStatus::Success);
        assert_eq!(result.ciphertext, Some(vec![1, 2, 3]));
        assert_eq!(queue.take(5), None);
    }

    #[test]
    fn cleanup_removes_exactly_the_expired_entries() {
        const MAX_RESULTS: usize = 4;
        let lifetime = Duration::from_secs(60);

        let queue = ResultQueue::new();
        let base = Instant::now();

        // Two old, two fresh.
        queue.push_at(QueryResult::failure(1, SchemeParams::default()), base).unwrap();
        queue.push_at(QueryResult::failure(2, SchemeParams::default()), base + Duration::from_secs(1)).unwrap();
        queue.push_at(QueryResult::failure(3, SchemeParams::default()), base + Duration::from_secs(100)).unwrap();
        queue.push_at(QueryResult::failure(4, SchemeParams::default()), base + Duration::from_secs(110)).unwrap();

        let now = base + Duration::from_secs(120);
        assert_eq!(queue.cleanup(MAX_RESULTS, lifetime, now), 2);

        assert_eq!(queue.len(), 2);
        assert!(queue.take(1).is_none());
        assert!(queue.take(2).is_none());
        assert!(queue.take(3).is_some());
        assert!(queue.take(4).is_some());
    }

    #[test]
    fn cleanup_is_skipped_below_the_size_bound() {
        let queue = ResultQueue::new();
        let base = Instant::now();
        queue.push_at(QueryResult::failure(1, SchemeParams::default()), base).unwrap();

        assert_eq!(queue.cleanup(2, Duration::from_secs(1), base + Duration::from_secs(3600)), 0);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn waiting_taker_sees_late_result() {
        let queue = Arc::new(ResultQueue::new());

        let taker = {
            let queue = queue.clone();
            thread::spawn(move || queue.take_timeout(7, Duration::from_secs(10)))
        };

        thread::sleep(Duration::from_millis(20));
        queue.push(QueryResult::failure(6, SchemeParams::default())).unwrap();
        queue.push(QueryResult::failure(7, SchemeParams::default())).unwrap();

        assert_eq!(taker.join().unwrap().map(|result| result.query_id), Some(7));
        assert_eq!(queue.len(), 1);
    }
}
