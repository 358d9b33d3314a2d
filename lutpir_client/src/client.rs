use lutpir_common::{
    branch_opt_util,
    error::LutPIRError,
    framing::Connection,
    he::{HeScheme, SchemeParams, Serializable},
    packet::{
        ControlCode, FuncNo, KeyId, NewKeysResponse, QueryId, QueryRequest, ResultRequest, ResultResponse, key_id_to_bytes, query_id_from_bytes,
    },
    params::RetryPolicy,
};
use rand::CryptoRng;
use std::{
    collections::HashMap,
    time::{Duration, Instant},
};
use tracing::{debug, info};

/// Key material a User keeps for one key id.
struct KeySession<S: HeScheme> {
    scheme: S,
    public_key: S::PublicKey,
    secret_key: S::SecretKey,
}

/// User side of LutPIR: obtains keys from the decryptor, submits encrypted lookups to the computation server and
/// decrypts their results.
pub struct Client<S: HeScheme> {
    dec_addr: String,
    cs_addr: String,
    retry: RetryPolicy,
    sessions: HashMap<KeyId, KeySession<S>>,
}

impl<S: HeScheme> Client<S> {
    pub fn new(dec_addr: &str, cs_addr: &str, retry: RetryPolicy) -> Self {
        Client {
            dec_addr: dec_addr.to_string(),
            cs_addr: cs_addr.to_string(),
            retry,
            sessions: HashMap::new(),
        }
    }

    fn session(&self, key_id: KeyId) -> Result<&KeySession<S>, LutPIRError> {
        self.sessions.get(&key_id).ok_or(LutPIRError::KeyNotFound(key_id))
    }

    /// Asks the decryptor for a fresh key bundle under `params` and keeps what is needed to encrypt and decrypt.
    pub fn new_keys(&mut self, params: &SchemeParams) -> Result<KeyId, LutPIRError> {
        let mut conn = Connection::connect(&self.dec_addr, self.retry)?;

        let response = NewKeysResponse::from_bytes(&conn.request(ControlCode::NewKeys, &params.to_bytes())?)?;
        let request = key_id_to_bytes(response.key_id);

        let secret_key = S::SecretKey::from_bytes(&response.secret_key)?;
        let public_key = S::PublicKey::from_bytes(&conn.request(ControlCode::PubKey, &request)?)?;
        let params = SchemeParams::from_bytes(&conn.request(ControlCode::Param, &request)?)?;

        let session = KeySession {
            scheme: S::new(&params)?,
            public_key,
            secret_key,
        };
        self.sessions.insert(response.key_id, session);

        info!(key_id = response.key_id, "obtained key bundle");
        Ok(response.key_id)
    }

    /// Deletes the key bundle on the decryptor and forgets it locally.
    pub fn delete_keys(&mut self, key_id: KeyId) -> Result<(), LutPIRError> {
        let mut conn = Connection::connect(&self.dec_addr, self.retry)?;
        conn.request(ControlCode::DeleteKeys, &key_id_to_bytes(key_id))?;

        self.sessions.remove(&key_id);
        info!(key_id, "deleted key bundle");
        Ok(())
    }

    /// Encrypts every value, replicated across all slots, and submits the lookup.
    ///
    /// # Arguments
    ///
    /// * `key_id` - Key bundle obtained with `new_keys`.
    /// * `func_no` - Table to evaluate; fixes how many values are expected.
    /// * `values` - Plaintext lookup inputs, one per table input.
    /// * `rng` - Encryption randomness.
    ///
    /// # Returns
    ///
    /// Id of the admitted query, to poll for its result with.
    pub fn submit<R: CryptoRng>(&self, key_id: KeyId, func_no: FuncNo, values: &[i64], rng: &mut R) -> Result<QueryId, LutPIRError> {
        if branch_opt_util::unlikely(values.len() != func_no.num_inputs()) {
            return Err(LutPIRError::UnexpectedInputCount {
                expected: func_no.num_inputs(),
                found: values.len(),
            });
        }

        let session = self.session(key_id)?;
        let inputs = values
            .iter()
            .map(|&value| {
                let pt = session.scheme.encode(&vec![value; session.scheme.slot_count()])?;
                Ok(session.scheme.encrypt(&pt, &session.public_key, rng)?.to_bytes())
            })
            .collect::<Result<Vec<_>, LutPIRError>>()?;

        let request = QueryRequest {
            key_id,
            func_no,
            params: *session.scheme.params(),
            inputs,
        };

        let mut conn = Connection::connect(&self.cs_addr, self.retry)?;
        let query_id = query_id_from_bytes(&conn.request(ControlCode::Query, &request.to_bytes())?)?;

        debug!(key_id, query_id, ?func_no, "submitted query");
        Ok(query_id)
    }

    fn fetch(&self, conn: &mut Connection, session: &KeySession<S>, query_id: QueryId, wait: Duration) -> Result<Option<i64>, LutPIRError> {
        let request = ResultRequest {
            query_id,
            wait_msec: wait.as_millis().min(u32::MAX as u128) as u32,
            params: *session.scheme.params(),
        };

        match ResultResponse::from_bytes(&conn.request(ControlCode::Result, &request.to_bytes())?)? {
            ResultResponse::NotReady => Ok(None),
            ResultResponse::Failed => Err(LutPIRError::QueryFailed(query_id)),
            ResultResponse::Ready(ciphertext) => Ok(Some(decode_result(session, &ciphertext)?)),
        }
    }

    /// Polls once. `None` while the result is not ready yet.
    pub fn try_fetch_result(&self, key_id: KeyId, query_id: QueryId) -> Result<Option<i64>, LutPIRError> {
        let session = self.session(key_id)?;
        let mut conn = Connection::connect(&self.cs_addr, self.retry)?;

        self.fetch(&mut conn, session, query_id, Duration::ZERO)
    }

    /// Polls every retry interval until the result is ready or `timeout` elapses.
    pub fn wait_result(&self, key_id: KeyId, query_id: QueryId, timeout: Duration) -> Result<i64, LutPIRError> {
        let session = self.session(key_id)?;
        let mut conn = Connection::connect(&self.cs_addr, self.retry)?;

        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if let Some(value) = self.fetch(&mut conn, session, query_id, remaining.min(self.retry.interval))? {
                return Ok(value);
            }
            if remaining.is_zero() {
                return Err(LutPIRError::ResultNotFound(query_id));
            }
        }
    }
}

/// The selected output sits in one slot of the first row, every other slot is zero; the row sum recovers it.
fn decode_result<S: HeScheme>(session: &KeySession<S>, ciphertext: &[u8]) -> Result<i64, LutPIRError> {
    let scheme = &session.scheme;
    let ct = S::Ciphertext::from_bytes(ciphertext)?;
    let slots = scheme.decode(&scheme.decrypt(&ct, &session.secret_key)?)?;

    let t = scheme.params().plain_modulus as i64;
    let sum = slots.iter().take(scheme.row_size()).fold(0i64, |acc, &v| (acc + v).rem_euclid(t));

    Ok(if sum > t / 2 { sum - t } else { sum })
}

#[cfg(test)]
mod test {
    use super::{Client, KeySession, decode_result};
    use lutpir_common::{
        error::LutPIRError,
        he::{ClearBfv, HeScheme, SchemeParams, Serializable},
        packet::FuncNo,
        params::RetryPolicy,
    };
    use rand::prelude::*;
    use rand_chacha::ChaCha8Rng;
    use test_case::test_case;

    const SMALL_PARAMS: SchemeParams = SchemeParams {
        poly_modulus_degree: 16,
        plain_modulus: 65537,
        coeff_modulus_bits: 109,
    };

    fn session(rng: &mut ChaCha8Rng) -> KeySession<ClearBfv> {
        let scheme = ClearBfv::new(&SMALL_PARAMS).unwrap();
        let bundle = scheme.keygen(rng).unwrap();

        KeySession {
            scheme,
            public_key: bundle.public_key,
            secret_key: bundle.secret_key,
        }
    }

    #[test_case(3, 434 => 434; "Positive output")]
    #[test_case(7, -12 => -12; "Negative output is centered")]
    #[test_case(0, 0 => 0; "Zero output")]
    fn result_is_recovered_from_first_row(col: usize, value: i64) -> i64 {
        let mut rng = ChaCha8Rng::from_os_rng();
        let session = session(&mut rng);

        let mut slots = vec![0i64; session.scheme.slot_count()];
        slots[col] = value;
        // Second row never contributes.
        slots[session.scheme.row_size() + col] = 99;

        let pt = session.scheme.encode(&slots).unwrap();
        let ct = session.scheme.encrypt(&pt, &session.public_key, &mut rng).unwrap();

        decode_result(&session, &ct.to_bytes()).unwrap()
    }

    #[test]
    fn unknown_key_is_rejected_before_any_connection() {
        let client = Client::<ClearBfv>::new("127.0.0.1:1", "127.0.0.1:1", RetryPolicy::default());
        let mut rng = ChaCha8Rng::from_os_rng();

        assert_eq!(client.submit(5, FuncNo::OneInput, &[1], &mut rng), Err(LutPIRError::KeyNotFound(5)));
        assert_eq!(client.try_fetch_result(5, 1), Err(LutPIRError::KeyNotFound(5)));
    }

    #[test]
    fn input_count_must_match_function() {
        let client = Client::<ClearBfv>::new("127.0.0.1:1", "127.0.0.1:1", RetryPolicy::default());
        let mut rng = ChaCha8Rng::from_os_rng();

        assert_eq!(
            client.submit(5, FuncNo::TwoInput, &[1], &mut rng),
            Err(LutPIRError::UnexpectedInputCount { expected: 2, found: 1 })
        );
    }
}
