use std::time::Duration;

/// Default BFV ring degree; also the number of batching slots.
pub const DEFAULT_POLY_MODULUS_DEGREE: u32 = 4096;
/// Default plaintext modulus. Prime and `1 mod 2 * degree`, so batching is available.
pub const DEFAULT_PLAIN_MODULUS: u64 = 65537;
/// Coefficient modulus bit-length preset at 192-bit security for the default degree.
pub const DEFAULT_COEFF_MODULUS_BITS: u32 = 152;

/// Inclusive range of the per-slot blinding factors applied to masked ciphertexts.
pub const BLINDING_FACTOR_MIN: i64 = 1;
pub const BLINDING_FACTOR_MAX: i64 = 5;

pub const DEFAULT_MAX_CONCURRENT_QUERIES: usize = 128;
pub const DEFAULT_MAX_RESULTS: usize = 128;
pub const DEFAULT_RESULT_LIFETIME: Duration = Duration::from_secs(3600);
pub const DEFAULT_CALC_THREAD_COUNT: usize = 2;
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_millis(100);
pub const DEFAULT_CONNECT_MAX_ATTEMPTS: u32 = 10;

pub const KEYGEN_SEED_BYTE_LEN: usize = 32;
pub const KEY_TAG_BYTE_LEN: usize = 16;

/// Upper bound on a single frame's payload. Payload buffers grow with the bytes actually received, never with the
/// declared length alone.
pub const MAX_FRAME_BYTE_LEN: usize = 1usize << 28;

/// How often a blocked network peer is retried, and how many times, before giving up.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RetryPolicy {
    pub interval: Duration,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            interval: DEFAULT_RETRY_INTERVAL,
            max_attempts: DEFAULT_CONNECT_MAX_ATTEMPTS,
        }
    }
}
