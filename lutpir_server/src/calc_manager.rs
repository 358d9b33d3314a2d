use crate::{
    calc_worker::CalcWorker,
    dec_client::{DecClient, DecryptorLink},
    lut::LookupTable,
    query::{Query, QueryQueue},
    result::{QueryResult, ResultQueue},
};
use lutpir_common::{
    branch_opt_util,
    error::LutPIRError,
    he::HeScheme,
    packet::QueryId,
    params::{
        DEFAULT_CALC_THREAD_COUNT, DEFAULT_MAX_CONCURRENT_QUERIES, DEFAULT_MAX_RESULTS, DEFAULT_RESULT_LIFETIME, DEFAULT_RETRY_INTERVAL, RetryPolicy,
    },
};
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;
use std::{
    marker::PhantomData,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, AtomicU32, Ordering},
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};
use tracing::{debug, info, warn};

/// Tunables of the computation server's admission control and worker pool.
#[derive(Clone, Debug, PartialEq)]
pub struct CalcConfig {
    pub max_concurrent_queries: usize,
    pub max_results: usize,
    pub result_lifetime: Duration,
    pub thread_count: usize,
    /// Wake-up bound of every blocking wait on the query and result queues.
    pub retry_interval: Duration,
    pub dec_retry: RetryPolicy,
    /// Seeds worker `i` with `rng_seed + i`. Fresh OS entropy per worker when `None`.
    pub rng_seed: Option<u64>,
}

impl Default for CalcConfig {
    fn default() -> Self {
        CalcConfig {
            max_concurrent_queries: DEFAULT_MAX_CONCURRENT_QUERIES,
            max_results: DEFAULT_MAX_RESULTS,
            result_lifetime: DEFAULT_RESULT_LIFETIME,
            thread_count: DEFAULT_CALC_THREAD_COUNT,
            retry_interval: DEFAULT_RETRY_INTERVAL,
            dec_retry: RetryPolicy::default(),
            rng_seed: None,
        }
    }
}

/// Owns the query and result queues, the lookup table and the worker pool of a computation server.
pub struct CalcManager {
    config: CalcConfig,
    queries: Arc<QueryQueue>,
    results: Arc<ResultQueue>,
    lut: Arc<LookupTable>,
    next_query_id: AtomicU32,
    stop: Arc<AtomicBool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl CalcManager {
    pub fn new(lut: Arc<LookupTable>, config: CalcConfig) -> CalcManager {
        CalcManager {
            config,
            queries: Arc::new(QueryQueue::new()),
            results: Arc::new(ResultQueue::new()),
            lut,
            next_query_id: AtomicU32::new(1),
            stop: Arc::new(AtomicBool::new(false)),
            workers: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &CalcConfig {
        &self.config
    }

    /// Admits `query` iff fewer than `max_concurrent_queries` are pending and fewer than `max_results` results are
    /// held. Rejection leaves both queues untouched; the caller is expected to retry later.
    pub fn push_query(&self, query: Query) -> Result<QueryId, LutPIRError> {
        self.lut.input_domains(query.func_no)?;
        self.cleanup_results();

        if branch_opt_util::unlikely(self.results.len() >= self.config.max_results) {
            debug!(results = self.results.len(), "admission rejected, result queue is full");
            return Err(LutPIRError::QueryAdmissionRejected);
        }

        let query_id = self.next_query_id.fetch_add(1, Ordering::Relaxed);
        match self.queries.try_push(query_id, query, self.config.max_concurrent_queries) {
            Ok(()) => {
                debug!(query_id, "query admitted");
                Ok(query_id)
            }
            Err(e) => {
                debug!(query_id, error = %e, "admission rejected");
                Err(e)
            }
        }
    }

    /// Blocks until the result of `query_id` exists, then removes and returns it.
    pub fn pop_result(&self, query_id: QueryId) -> QueryResult {
        loop {
            if let Some(result) = self.results.take_timeout(query_id, self.config.retry_interval) {
                return result;
            }
        }
    }

    pub fn pop_result_timeout(&self, query_id: QueryId, timeout: Duration) -> Option<QueryResult> {
        self.results.take_timeout(query_id, timeout)
    }

    /// Removes and returns the result of `query_id` if it is ready, without blocking.
    pub fn try_get_result(&self, query_id: QueryId) -> Option<QueryResult> {
        self.results.take(query_id)
    }

    /// Drops results older than the configured lifetime, once the result queue is full.
    pub fn cleanup_results(&self) -> usize {
        let removed = self.results.cleanup(self.config.max_results, self.config.result_lifetime, Instant::now());
        if removed > 0 {
            info!(removed, "expired results dropped");
        }

        removed
    }

    pub fn query_count(&self) -> usize {
        self.queries.len()
    }

    pub fn result_count(&self) -> usize {
        self.results.len()
    }

    /// Spawns `n` workers talking to the decryptor listening at `dec_addr`.
    pub fn start_threads<S: HeScheme + 'static>(&self, n: usize, dec_addr: &str) -> Result<(), LutPIRError> {
        let link: Arc<dyn DecryptorLink> = Arc::new(DecClient::new(dec_addr, self.config.dec_retry));
        self.start_threads_with_link::<S>(n, link)
    }

    /// Spawns `n` workers reaching the decryptor through `link`.
    pub fn start_threads_with_link<S: HeScheme + 'static>(&self, n: usize, link: Arc<dyn DecryptorLink>) -> Result<(), LutPIRError> {
        let mut workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
        self.stop.store(false, Ordering::Release);

        for _ in 0..n {
            let index = workers.len();
            let rng = match self.config.rng_seed {
                Some(seed) => ChaCha20Rng::seed_from_u64(seed.wrapping_add(index as u64)),
                None => ChaCha20Rng::from_os_rng(),
            };

            let worker = CalcWorker::<S> {
                index,
                queries: self.queries.clone(),
                results: self.results.clone(),
                lut: self.lut.clone(),
                link: link.clone(),
                stop: self.stop.clone(),
                poll_interval: self.config.retry_interval,
                rng,
                _scheme: PhantomData,
            };

            let handle = thread::Builder::new().name(format!("calc-worker-{}", index)).spawn(move || worker.run())?;
            workers.push(handle);
        }

        info!(started = n, total = workers.len(), "calc workers running");
        Ok(())
    }

    /// Signals every worker to stop and joins them. Each worker finishes its current query first.
    /// Idempotent, and a no-op if no worker was ever started.
    pub fn stop_threads(&self) {
        self.stop.store(true, Ordering::Release);
        self.queries.wake_all();

        let workers = std::mem::take(&mut *self.workers.lock().unwrap_or_else(PoisonError::into_inner));
        let num_workers = workers.len();

        for handle in workers {
            if handle.join().is_err() {
                warn!("calc worker panicked");
            }
        }

        if num_workers > 0 {
            info!(stopped = num_workers, "calc workers stopped");
        }
    }
}

impl Drop for CalcManager {
    fn drop(&mut self) {
        self.stop_threads();
    }
}

#[cfg(test)]
mod test {
    use super::{CalcConfig, CalcManager};
    use crate::{
        dec_client::{DecryptorLink, EvalKeys},
        lut::{LookupTable, OneInputTable, TwoInputTable},
        query::Query,
        result::ResultStatus,
    };
    use lutpir_common::{
        error::LutPIRError,
        he::{ClearBfv, HeScheme, KeyKind, SchemeParams, Serializable},
        packet::{FuncNo, KeyId, MidResultRequest, MidResultResponse},
        params::RetryPolicy,
    };
    use lutpir_decryptor::{KeyContainer, calc_pir_queries};
    use rand::prelude::*;
    use rand_chacha::ChaCha8Rng;
    use std::{collections::HashSet, net::TcpListener, sync::Arc, thread, time::Duration};

    const SMALL_PARAMS: SchemeParams = SchemeParams {
        poly_modulus_degree: 16,
        plain_modulus: 65537,
        coeff_modulus_bits: 109,
    };

    /// Decryptor reached by direct calls instead of TCP.
    struct InProcessDecryptor {
        keys: Arc<KeyContainer<ClearBfv>>,
    }

    impl DecryptorLink for InProcessDecryptor {
        fn fetch_eval_keys(&self, key_id: KeyId) -> Result<EvalKeys, LutPIRError> {
            Ok(EvalKeys {
                params: self.keys.params(key_id)?,
                galois_keys: self.keys.get(key_id, KeyKind::GaloisKeys)?,
                relin_keys: self.keys.get(key_id, KeyKind::RelinKeys)?,
            })
        }

        fn exchange_mid_result(&self, request: &MidResultRequest) -> Result<MidResultResponse, LutPIRError> {
            calc_pir_queries(&*self.keys, request, &mut ChaCha8Rng::from_os_rng())
        }
    }

    fn dummy_query() -> Query {
        Query {
            key_id: 1,
            func_no: FuncNo::OneInput,
            params: SMALL_PARAMS,
            inputs: vec![vec![]],
        }
    }

    fn one_input_lut() -> Arc<LookupTable> {
        let table = OneInputTable::from_fn((0..16).map(|x| 3 * x + 1).collect(), |x| x * x - 50);
        Arc::new(LookupTable::new(Some(table), None).unwrap())
    }

    /// Encrypts `value` replicated in every slot, as a User does.
    fn encrypt_value(keys: &KeyContainer<ClearBfv>, key_id: KeyId, value: i64) -> Vec<u8> {
        let scheme = ClearBfv::new(&SMALL_PARAMS).unwrap();
        let pt = scheme.encode(&vec![value; scheme.slot_count()]).unwrap();

        scheme
            .encrypt(&pt, &keys.public_key(key_id).unwrap(), &mut ChaCha8Rng::from_os_rng())
            .unwrap()
            .to_bytes()
    }

    fn decrypt_value(keys: &KeyContainer<ClearBfv>, key_id: KeyId, ct: &[u8]) -> i64 {
        let scheme = ClearBfv::new(&SMALL_PARAMS).unwrap();
        let ct = <ClearBfv as HeScheme>::Ciphertext::from_bytes(ct).unwrap();
        let slots = scheme.decode(&scheme.decrypt(&ct, &keys.secret_key(key_id).unwrap()).unwrap()).unwrap();

        let t = SMALL_PARAMS.plain_modulus as i64;
        let sum = slots[..scheme.row_size()].iter().fold(0i64, |acc, &v| (acc + v).rem_euclid(t));
        if sum > t / 2 { sum - t } else { sum }
    }

    #[test]
    fn query_ids_are_unique() {
        let manager = CalcManager::new(one_input_lut(), CalcConfig::default());

        let ids = (0..64).map(|_| manager.push_query(dummy_query()).unwrap()).collect::<HashSet<_>>();
        assert_eq!(ids.len(), 64);
        assert_eq!(manager.query_count(), 64);
    }

    #[test]
    fn admission_is_bounded_by_pending_queries() {
        let config = CalcConfig {
            max_concurrent_queries: 3,
            ..Default::default()
        };
        let manager = CalcManager::new(one_input_lut(), config);

        for _ in 0..3 {
            manager.push_query(dummy_query()).unwrap();
        }

        assert_eq!(manager.push_query(dummy_query()), Err(LutPIRError::QueryAdmissionRejected));
        assert_eq!(manager.query_count(), 3);
    }

    #[test]
    fn admission_is_bounded_by_held_results() {
        let config = CalcConfig {
            max_results: 2,
            ..Default::default()
        };
        let manager = CalcManager::new(one_input_lut(), config);

        manager.results.push(crate::result::QueryResult::failure(1000, SMALL_PARAMS)).unwrap();
        manager.results.push(crate::result::QueryResult::failure(1001, SMALL_PARAMS)).unwrap();

        assert_eq!(manager.push_query(dummy_query()), Err(LutPIRError::QueryAdmissionRejected));
        assert_eq!(manager.query_count(), 0);
        assert_eq!(manager.result_count(), 2);
    }

    #[test]
    fn expired_results_are_dropped_and_admission_reopens() {
        let config = CalcConfig {
            max_results: 1,
            result_lifetime: Duration::ZERO,
            ..Default::default()
        };
        let manager = CalcManager::new(one_input_lut(), config);

        manager.results.push(crate::result::QueryResult::failure(1000, SMALL_PARAMS)).unwrap();
        thread::sleep(Duration::from_millis(5));

        assert_eq!(manager.cleanup_results(), 1);
        assert_eq!(manager.result_count(), 0);
        assert_eq!(manager.try_get_result(1000), None);

        // Admission runs the same cleanup before checking the bound.
        manager.results.push(crate::result::QueryResult::failure(1001, SMALL_PARAMS)).unwrap();
        thread::sleep(Duration::from_millis(5));

        assert!(manager.push_query(dummy_query()).is_ok());
        assert_eq!(manager.result_count(), 0);
        assert_eq!(manager.query_count(), 1);
    }

    #[test]
    fn unreachable_decryptor_fails_the_query() {
        let dec_addr = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().to_string()
        };

        let manager = CalcManager::new(
            one_input_lut(),
            CalcConfig {
                retry_interval: Duration::from_millis(10),
                dec_retry: RetryPolicy {
                    interval: Duration::from_millis(10),
                    max_attempts: 2,
                },
                ..Default::default()
            },
        );
        manager.start_threads::<ClearBfv>(1, &dec_addr).unwrap();

        let query_id = manager.push_query(dummy_query()).unwrap();
        let result = manager.pop_result_timeout(query_id, Duration::from_secs(10)).unwrap();
        manager.stop_threads();

        assert_eq!(result.status, ResultStatus::Failure);
        assert_eq!(result.ciphertext, None);
    }

    #[test]
    fn query_for_unloaded_table_is_refused_upfront() {
        let manager = CalcManager::new(one_input_lut(), CalcConfig::default());
        let query = Query {
            func_no: FuncNo::TwoInput,
            inputs: vec![vec![], vec![]],
            ..dummy_query()
        };

        assert_eq!(manager.push_query(query), Err(LutPIRError::FunctionTableNotLoaded(2)));
    }

    #[test]
    fn stopping_is_idempotent_and_safe_without_workers() {
        let manager = CalcManager::new(one_input_lut(), CalcConfig::default());
        manager.stop_threads();
        manager.stop_threads();

        let keys = Arc::new(KeyContainer::<ClearBfv>::new());
        manager
            .start_threads_with_link::<ClearBfv>(2, Arc::new(InProcessDecryptor { keys }))
            .unwrap();
        manager.stop_threads();
        manager.stop_threads();
    }

    #[test]
    fn one_input_lookup_returns_matching_output() {
        let lut = one_input_lut();
        let keys = Arc::new(KeyContainer::<ClearBfv>::new());
        let key_id = keys.new_keys(&SMALL_PARAMS).unwrap();

        let manager = CalcManager::new(
            lut,
            CalcConfig {
                retry_interval: Duration::from_millis(10),
                rng_seed: Some(7),
                ..Default::default()
            },
        );
        manager
            .start_threads_with_link::<ClearBfv>(2, Arc::new(InProcessDecryptor { keys: keys.clone() }))
            .unwrap();

        // N = 16 candidates over rows of 8 slots, i.e. two chunks.
        let input = 3 * 7 + 1;
        let query_id = manager
            .push_query(Query {
                key_id,
                func_no: FuncNo::OneInput,
                params: SMALL_PARAMS,
                inputs: vec![encrypt_value(&keys, key_id, input)],
            })
            .unwrap();

        let result = manager.pop_result(query_id);
        manager.stop_threads();

        assert_eq!(result.status, ResultStatus::Success);
        assert_eq!(decrypt_value(&keys, key_id, &result.ciphertext.unwrap()), input * input - 50);
    }

    #[test]
    fn value_outside_input_domain_fails_the_query() {
        let keys = Arc::new(KeyContainer::<ClearBfv>::new());
        let key_id = keys.new_keys(&SMALL_PARAMS).unwrap();

        let manager = CalcManager::new(
            one_input_lut(),
            CalcConfig {
                retry_interval: Duration::from_millis(10),
                ..Default::default()
            },
        );
        manager
            .start_threads_with_link::<ClearBfv>(1, Arc::new(InProcessDecryptor { keys: keys.clone() }))
            .unwrap();

        // Candidates are 1, 4, 7, ..., 46; two is not among them.
        let query_id = manager
            .push_query(Query {
                key_id,
                func_no: FuncNo::OneInput,
                params: SMALL_PARAMS,
                inputs: vec![encrypt_value(&keys, key_id, 2)],
            })
            .unwrap();

        let result = manager.pop_result(query_id);
        manager.stop_threads();

        assert_eq!(result.status, ResultStatus::Failure);
        assert_eq!(result.ciphertext, None);
    }

    #[test]
    fn two_input_lookup_returns_matching_output() {
        let table = TwoInputTable::from_fn(vec![-3, -1, 0, 2, 5], vec![1, 4, 9], |a, b| a * 10 + b);
        let lut = Arc::new(LookupTable::new(None, Some(table)).unwrap());

        let keys = Arc::new(KeyContainer::<ClearBfv>::new());
        let key_id = keys.new_keys(&SMALL_PARAMS).unwrap();

        let manager = CalcManager::new(
            lut,
            CalcConfig {
                retry_interval: Duration::from_millis(10),
                ..Default::default()
            },
        );
        manager
            .start_threads_with_link::<ClearBfv>(1, Arc::new(InProcessDecryptor { keys: keys.clone() }))
            .unwrap();

        let query_id = manager
            .push_query(Query {
                key_id,
                func_no: FuncNo::TwoInput,
                params: SMALL_PARAMS,
                inputs: vec![encrypt_value(&keys, key_id, 2), encrypt_value(&keys, key_id, 9)],
            })
            .unwrap();

        let result = manager.pop_result_timeout(query_id, Duration::from_secs(30)).unwrap();
        manager.stop_threads();

        assert_eq!(result.status, ResultStatus::Success);
        assert_eq!(decrypt_value(&keys, key_id, &result.ciphertext.unwrap()), 29);
    }

    #[test]
    fn query_under_unknown_key_fails() {
        let keys = Arc::new(KeyContainer::<ClearBfv>::new());
        let manager = CalcManager::new(
            one_input_lut(),
            CalcConfig {
                retry_interval: Duration::from_millis(10),
                ..Default::default()
            },
        );
        manager.start_threads_with_link::<ClearBfv>(1, Arc::new(InProcessDecryptor { keys })).unwrap();

        let query_id = manager.push_query(dummy_query()).unwrap();
        let result = manager.pop_result(query_id);

        assert_eq!(result.status, ResultStatus::Failure);
        assert_eq!(manager.try_get_result(query_id), None);
    }
}
