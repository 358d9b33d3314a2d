#![cfg(test)]

use std::{sync::Arc, time::Duration};

use lutpir_client::{Client, FuncNo, LutPIRError};
use lutpir_common::{he::{FheBfv, SchemeParams}, listener::ServerHandle, params::RetryPolicy};
use lutpir_decryptor::{DecServer, KeyContainer};
use lutpir_server::{CalcConfig, CalcManager, CsServer, LookupTable, OneInputTable, TwoInputTable};

use rand::prelude::*;
use rand_chacha::ChaCha8Rng;
use test_case::test_case;

/// 8 slots per row, so a table holds at most 64 entries. Small enough for a quick BFV round trip.
const SMALL_PARAMS: SchemeParams = SchemeParams {
    poly_modulus_degree: 16,
    plain_modulus: 65537,
    coeff_modulus_bits: 109,
};

const RESULT_TIMEOUT: Duration = Duration::from_secs(30);

struct Deployment {
    dec_addr: String,
    cs_addr: String,
    manager: Arc<CalcManager>,
    _dec: ServerHandle,
    _cs: ServerHandle,
}

impl Deployment {
    fn start(lut: LookupTable, config: CalcConfig, num_workers: usize) -> Deployment {
        let dec = DecServer::bind("127.0.0.1:0", Arc::new(KeyContainer::<FheBfv>::new())).unwrap();
        let dec_addr = dec.local_addr().unwrap().to_string();
        let dec = dec.spawn().unwrap();

        let manager = Arc::new(CalcManager::new(Arc::new(lut), config));
        manager.start_threads::<FheBfv>(num_workers, &dec_addr).unwrap();

        let cs = CsServer::bind("127.0.0.1:0", manager.clone()).unwrap();
        let cs_addr = cs.local_addr().unwrap().to_string();
        let cs = cs.spawn().unwrap();

        Deployment {
            dec_addr,
            cs_addr,
            manager,
            _dec: dec,
            _cs: cs,
        }
    }

    fn client(&self) -> Client<FheBfv> {
        Client::new(&self.dec_addr, &self.cs_addr, RetryPolicy::default())
    }
}

impl Drop for Deployment {
    fn drop(&mut self) {
        self.manager.stop_threads();
    }
}

fn distinct_inputs(rng: &mut ChaCha8Rng, count: usize) -> Vec<i64> {
    let mut values = (-500i64..500).collect::<Vec<_>>();
    values.shuffle(rng);
    values.truncate(count);
    values
}

#[test_case(16; "Two output chunks")]
#[test_case(8; "Table fills exactly one row")]
#[test_case(5; "Padded single chunk")]
#[test_case(64; "Largest table for the slot count")]
fn one_input_lookup_over_tcp(num_entries: usize) {
    const NUM_QUERIES: usize = 4;

    let mut rng = ChaCha8Rng::from_os_rng();
    let table = OneInputTable::from_fn(distinct_inputs(&mut rng, num_entries), |x| 3 * x + 1);
    let lut = LookupTable::new(Some(table.clone()), None).unwrap();

    let deployment = Deployment::start(lut, CalcConfig::default(), 2);
    let mut client = deployment.client();
    let key_id = client.new_keys(&SMALL_PARAMS).unwrap();

    let picked = table.inputs().choose_multiple(&mut rng, NUM_QUERIES).copied().collect::<Vec<_>>();
    let query_ids = picked
        .iter()
        .map(|&x| client.submit(key_id, FuncNo::OneInput, &[x], &mut rng).unwrap())
        .collect::<Vec<_>>();

    for (&x, &query_id) in picked.iter().zip(&query_ids) {
        assert_eq!(client.wait_result(key_id, query_id, RESULT_TIMEOUT), Ok(3 * x + 1));
    }

    client.delete_keys(key_id).unwrap();
}

#[test]
fn two_input_lookup_over_tcp() {
    let mut rng = ChaCha8Rng::from_os_rng();

    let x0 = distinct_inputs(&mut rng, 5);
    let x1 = distinct_inputs(&mut rng, 6);
    let table = TwoInputTable::from_fn(x0.clone(), x1.clone(), |a, b| 2 * a - b);
    let lut = LookupTable::new(None, Some(table)).unwrap();

    let deployment = Deployment::start(lut, CalcConfig::default(), 1);
    let mut client = deployment.client();
    let key_id = client.new_keys(&SMALL_PARAMS).unwrap();

    let (a, b) = (*x0.choose(&mut rng).unwrap(), *x1.choose(&mut rng).unwrap());
    let query_id = client.submit(key_id, FuncNo::TwoInput, &[a, b], &mut rng).unwrap();

    assert_eq!(client.wait_result(key_id, query_id, RESULT_TIMEOUT), Ok(2 * a - b));
}

#[test]
fn value_outside_table_fails_query() {
    let mut rng = ChaCha8Rng::from_os_rng();
    let table = OneInputTable::from_fn((0..16).collect(), |x| x * x);
    let lut = LookupTable::new(Some(table), None).unwrap();

    let deployment = Deployment::start(lut, CalcConfig::default(), 1);
    let mut client = deployment.client();
    let key_id = client.new_keys(&SMALL_PARAMS).unwrap();

    let query_id = client.submit(key_id, FuncNo::OneInput, &[42], &mut rng).unwrap();
    assert_eq!(client.wait_result(key_id, query_id, RESULT_TIMEOUT), Err(LutPIRError::QueryFailed(query_id)));

    // Server keeps serving after a failed query.
    let query_id = client.submit(key_id, FuncNo::OneInput, &[7], &mut rng).unwrap();
    assert_eq!(client.wait_result(key_id, query_id, RESULT_TIMEOUT), Ok(49));
}

#[test]
fn unloaded_table_is_rejected_at_submission() {
    let mut rng = ChaCha8Rng::from_os_rng();
    let lut = LookupTable::new(Some(OneInputTable::from_fn((0..8).collect(), |x| x)), None).unwrap();

    let deployment = Deployment::start(lut, CalcConfig::default(), 1);
    let mut client = deployment.client();
    let key_id = client.new_keys(&SMALL_PARAMS).unwrap();

    assert!(matches!(client.submit(key_id, FuncNo::TwoInput, &[1, 2], &mut rng), Err(LutPIRError::Remote(_))));
}

#[test]
fn admission_is_bounded_by_pending_queries() {
    let mut rng = ChaCha8Rng::from_os_rng();
    let lut = LookupTable::new(Some(OneInputTable::from_fn((0..8).collect(), |x| x + 100)), None).unwrap();
    let config = CalcConfig {
        max_concurrent_queries: 2,
        ..CalcConfig::default()
    };

    // No workers, so queries stay pending.
    let deployment = Deployment::start(lut, config, 0);
    let mut client = deployment.client();
    let key_id = client.new_keys(&SMALL_PARAMS).unwrap();

    let first = client.submit(key_id, FuncNo::OneInput, &[1], &mut rng).unwrap();
    let second = client.submit(key_id, FuncNo::OneInput, &[2], &mut rng).unwrap();
    assert_ne!(first, second);

    assert_eq!(client.submit(key_id, FuncNo::OneInput, &[3], &mut rng), Err(LutPIRError::QueryAdmissionRejected));
    assert_eq!(deployment.manager.query_count(), 2);
    assert_eq!(client.try_fetch_result(key_id, first), Ok(None));

    deployment.manager.start_threads::<FheBfv>(1, &deployment.dec_addr).unwrap();
    assert_eq!(client.wait_result(key_id, first, RESULT_TIMEOUT), Ok(101));
    assert_eq!(client.wait_result(key_id, second, RESULT_TIMEOUT), Ok(102));
}

#[test]
fn keys_deleted_before_evaluation_fail_the_query() {
    let mut rng = ChaCha8Rng::from_os_rng();
    let lut = LookupTable::new(Some(OneInputTable::from_fn((0..8).collect(), |x| x)), None).unwrap();

    let deployment = Deployment::start(lut, CalcConfig::default(), 0);
    let mut user = deployment.client();
    let key_id = user.new_keys(&SMALL_PARAMS).unwrap();
    let query_id = user.submit(key_id, FuncNo::OneInput, &[3], &mut rng).unwrap();

    // Drop the bundle on the decryptor while the User still holds its keys.
    let mut other = deployment.client();
    other.delete_keys(key_id).unwrap();

    deployment.manager.start_threads::<FheBfv>(1, &deployment.dec_addr).unwrap();
    assert_eq!(user.wait_result(key_id, query_id, RESULT_TIMEOUT), Err(LutPIRError::QueryFailed(query_id)));

    user.delete_keys(key_id).unwrap_err();
    assert_eq!(user.try_fetch_result(key_id, query_id), Ok(None));
}
