use lutpir_common::{
    error::LutPIRError,
    framing::Connection,
    he::{SchemeParams, Serializable},
    packet::{ControlCode, KeyId, MidResultRequest, MidResultResponse, key_id_to_bytes},
    params::RetryPolicy,
};
use tracing::debug;

/// Evaluation key material a worker needs for one query, as fetched from the decryptor.
#[derive(Clone, Debug, PartialEq)]
pub struct EvalKeys {
    pub params: SchemeParams,
    pub galois_keys: Vec<u8>,
    pub relin_keys: Vec<u8>,
}

/// Everything the computation server asks of the decryptor.
pub trait DecryptorLink: Send + Sync {
    fn fetch_eval_keys(&self, key_id: KeyId) -> Result<EvalKeys, LutPIRError>;

    /// Hands masked ciphertexts over and receives the encrypted selector pair back.
    fn exchange_mid_result(&self, request: &MidResultRequest) -> Result<MidResultResponse, LutPIRError>;
}

/// TCP link to a decryptor. Each exchange opens a fresh connection, with bounded connect retries, so an
/// unreachable decryptor fails the query instead of stalling the worker.
pub struct DecClient {
    addr: String,
    retry: RetryPolicy,
}

impl DecClient {
    pub fn new(addr: &str, retry: RetryPolicy) -> DecClient {
        DecClient {
            addr: addr.to_string(),
            retry,
        }
    }

    fn connect(&self) -> Result<Connection, LutPIRError> {
        Connection::connect(&self.addr, self.retry)
    }
}

impl DecryptorLink for DecClient {
    fn fetch_eval_keys(&self, key_id: KeyId) -> Result<EvalKeys, LutPIRError> {
        let mut conn = self.connect()?;
        let request = key_id_to_bytes(key_id);

        let params = SchemeParams::from_bytes(&conn.request(ControlCode::Param, &request)?)?;
        let galois_keys = conn.request(ControlCode::GaloisKey, &request)?;
        let relin_keys = conn.request(ControlCode::RelinKey, &request)?;

        debug!(key_id, galois_keys_len = galois_keys.len(), relin_keys_len = relin_keys.len(), "fetched evaluation keys");

        Ok(EvalKeys {
            params,
            galois_keys,
            relin_keys,
        })
    }

    fn exchange_mid_result(&self, request: &MidResultRequest) -> Result<MidResultResponse, LutPIRError> {
        let mut conn = self.connect()?;
        let response = conn.request(ControlCode::MidResult, &request.to_bytes())?;

        MidResultResponse::from_bytes(&response)
    }
}
