//! Batched BFV backend of the [`HeScheme`] capability interface, built on the `fhe` crate.
//!
//! Slots follow `fhe`'s SIMD encoding: a `2 x row_size` matrix whose rows are rotated by column rotations. Rotation
//! keys are generated for every power of two below `row_size`, and an arbitrary step is applied as a composition of
//! those. The secret key is derived from a 32-byte seed, which is also its serialized form.
//!
//! Every serialized artifact starts with its kind and the [`SchemeParams`] it belongs to, so it can be deserialized
//! without any other context.

use super::{HeScheme, KeyBundle, SchemeParams, Serializable};
use crate::{
    branch_opt_util,
    codec::{ByteReader, ByteWriter, prefixed_len},
    error::LutPIRError,
    params::KEYGEN_SEED_BYTE_LEN,
};
use fhe::bfv;
use fhe_traits::{DeserializeParametrized, FheDecoder, FheDecrypter, FheEncoder, FheEncrypter, Serialize};
use rand::CryptoRng;
use rand_chacha::{ChaCha20Rng as FheRng, rand_core::SeedableRng};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, OnceLock},
};
use tracing::debug;

const ARTIFACT_PUBLIC_KEY: u8 = 0x21;
const ARTIFACT_SECRET_KEY: u8 = 0x22;
const ARTIFACT_GALOIS_KEYS: u8 = 0x23;
const ARTIFACT_RELIN_KEYS: u8 = 0x24;
const ARTIFACT_CIPHERTEXT: u8 = 0x30;

const FRESH_CIPHERTEXT_SIZE: u8 = 2;
const MAX_MODULUS_BITS: u32 = 60;
const MIN_COEFF_MODULUS_BITS: u32 = 40;

#[derive(Clone)]
pub struct FhePublicKey {
    params: SchemeParams,
    key: Arc<bfv::PublicKey>,
}

#[derive(Clone)]
pub struct FheSecretKey {
    params: SchemeParams,
    seed: [u8; KEYGEN_SEED_BYTE_LEN],
    key: Arc<bfv::SecretKey>,
}

#[derive(Clone)]
pub struct FheGaloisKeys {
    params: SchemeParams,
    key: Arc<bfv::EvaluationKey>,
}

#[derive(Clone)]
pub struct FheRelinKeys {
    params: SchemeParams,
    key: Arc<bfv::RelinearizationKey>,
}

#[derive(Clone)]
pub struct FhePlaintext {
    plaintext: bfv::Plaintext,
}

#[derive(Clone)]
pub struct FheCiphertext {
    params: SchemeParams,
    size: u8,
    ciphertext: bfv::Ciphertext,
}

impl FheCiphertext {
    /// Number of polynomial components; anything above two needs relinearization.
    pub fn size(&self) -> u8 {
        self.size
    }
}

pub struct FheBfv {
    params: SchemeParams,
    bfv: Arc<bfv::BfvParameters>,
}

/// Splits the coefficient modulus bit budget into as few, evenly sized, NTT-friendly moduli as possible.
fn moduli_sizes(coeff_modulus_bits: u32) -> Vec<usize> {
    let count = coeff_modulus_bits.div_ceil(MAX_MODULUS_BITS);
    (0..count)
        .map(|i| (coeff_modulus_bits / count + u32::from(i < coeff_modulus_bits % count)) as usize)
        .collect()
}

/// Builds, or fetches from the process-wide cache, the `fhe` parameters for `params`.
fn bfv_parameters(params: &SchemeParams) -> Result<Arc<bfv::BfvParameters>, LutPIRError> {
    static CACHE: OnceLock<Mutex<HashMap<SchemeParams, Arc<bfv::BfvParameters>>>> = OnceLock::new();
    let cache = CACHE.get_or_init(|| Mutex::new(HashMap::new()));

    if let Some(bfv) = cache.lock().ok().and_then(|cached| cached.get(params).cloned()) {
        return Ok(bfv);
    }

    params.check_batching()?;
    if branch_opt_util::unlikely(params.coeff_modulus_bits < MIN_COEFF_MODULUS_BITS) {
        return Err(LutPIRError::InvalidSchemeParams(format!(
            "coefficient modulus must be at least {} bits, found {}",
            MIN_COEFF_MODULUS_BITS, params.coeff_modulus_bits
        )));
    }

    let bfv = bfv::BfvParametersBuilder::new()
        .set_degree(params.poly_modulus_degree as usize)
        .set_plaintext_modulus(params.plain_modulus)
        .set_moduli_sizes(&moduli_sizes(params.coeff_modulus_bits))
        .build_arc()
        .map_err(|e| LutPIRError::InvalidSchemeParams(e.to_string()))?;

    debug!(?params, "built bfv parameters");
    if let Ok(mut cached) = cache.lock() {
        cached.insert(*params, bfv.clone());
    }

    Ok(bfv)
}

/// Seeds the randomness handed to `fhe` from the caller's generator.
fn fhe_rng<R: CryptoRng>(rng: &mut R) -> FheRng {
    let mut seed = [0u8; KEYGEN_SEED_BYTE_LEN];
    rng.fill_bytes(&mut seed);
    FheRng::from_seed(seed)
}

fn secret_key_from_seed(bfv: &Arc<bfv::BfvParameters>, seed: &[u8; KEYGEN_SEED_BYTE_LEN]) -> bfv::SecretKey {
    bfv::SecretKey::random(bfv, &mut FheRng::from_seed(*seed))
}

/// Rotation steps a galois key bundle holds: every power of two below `row_size`.
fn rotation_steps(row_size: usize) -> impl Iterator<Item = usize> {
    (0..usize::BITS).map(|bit| 1usize << bit).take_while(move |&step| step < row_size)
}

impl FheBfv {
    fn check_params(&self, params: &SchemeParams) -> Result<(), LutPIRError> {
        if branch_opt_util::likely(*params == self.params) {
            Ok(())
        } else {
            Err(LutPIRError::SchemeParamsMismatch)
        }
    }

    fn wrap(&self, size: u8, ciphertext: bfv::Ciphertext) -> FheCiphertext {
        FheCiphertext {
            params: self.params,
            size,
            ciphertext,
        }
    }
}

impl HeScheme for FheBfv {
    type PublicKey = FhePublicKey;
    type SecretKey = FheSecretKey;
    type GaloisKeys = FheGaloisKeys;
    type RelinKeys = FheRelinKeys;
    type Plaintext = FhePlaintext;
    type Ciphertext = FheCiphertext;

    fn new(params: &SchemeParams) -> Result<Self, LutPIRError> {
        Ok(FheBfv {
            params: *params,
            bfv: bfv_parameters(params)?,
        })
    }

    fn params(&self) -> &SchemeParams {
        &self.params
    }

    fn slot_count(&self) -> usize {
        self.bfv.degree()
    }

    fn keygen<R: CryptoRng>(&self, rng: &mut R) -> Result<KeyBundle<Self>, LutPIRError> {
        let mut seed = [0u8; KEYGEN_SEED_BYTE_LEN];
        rng.fill_bytes(&mut seed);

        let secret_key = secret_key_from_seed(&self.bfv, &seed);
        let mut rng = fhe_rng(rng);

        let public_key = bfv::PublicKey::new(&secret_key, &mut rng);
        let relin_keys = bfv::RelinearizationKey::new(&secret_key, &mut rng)?;

        let mut builder = bfv::EvaluationKeyBuilder::new(&secret_key)?;
        for step in rotation_steps(self.row_size()) {
            builder.enable_column_rotation(step)?;
        }
        let galois_keys = builder.build(&mut rng)?;

        Ok(KeyBundle {
            public_key: FhePublicKey {
                params: self.params,
                key: Arc::new(public_key),
            },
            secret_key: FheSecretKey {
                params: self.params,
                seed,
                key: Arc::new(secret_key),
            },
            galois_keys: FheGaloisKeys {
                params: self.params,
                key: Arc::new(galois_keys),
            },
            relin_keys: FheRelinKeys {
                params: self.params,
                key: Arc::new(relin_keys),
            },
            params: self.params,
        })
    }

    fn encode(&self, values: &[i64]) -> Result<Self::Plaintext, LutPIRError> {
        let slot_count = self.slot_count();
        if branch_opt_util::unlikely(values.len() > slot_count) {
            return Err(LutPIRError::SlotCountMismatch {
                expected: slot_count,
                found: values.len(),
            });
        }

        let t = self.params.plain_modulus as i64;
        let mut slots = vec![0u64; slot_count];
        slots.iter_mut().zip(values).for_each(|(slot, &v)| {
            *slot = v.rem_euclid(t) as u64;
        });

        let plaintext = bfv::Plaintext::try_encode(slots.as_slice(), bfv::Encoding::simd(), &self.bfv)?;
        Ok(FhePlaintext { plaintext })
    }

    fn decode(&self, plaintext: &Self::Plaintext) -> Result<Vec<i64>, LutPIRError> {
        let t = self.params.plain_modulus;
        let half_t = t / 2;

        let slots = Vec::<u64>::try_decode(&plaintext.plaintext, bfv::Encoding::simd())?;
        Ok(slots
            .into_iter()
            .map(|slot| if slot > half_t { slot as i64 - t as i64 } else { slot as i64 })
            .collect())
    }

    fn encrypt<R: CryptoRng>(&self, plaintext: &Self::Plaintext, public_key: &Self::PublicKey, rng: &mut R) -> Result<Self::Ciphertext, LutPIRError> {
        self.check_params(&public_key.params)?;

        let ciphertext = public_key.key.try_encrypt(&plaintext.plaintext, &mut fhe_rng(rng))?;
        Ok(self.wrap(FRESH_CIPHERTEXT_SIZE, ciphertext))
    }

    fn decrypt(&self, ciphertext: &Self::Ciphertext, secret_key: &Self::SecretKey) -> Result<Self::Plaintext, LutPIRError> {
        self.check_params(&ciphertext.params)?;
        self.check_params(&secret_key.params)?;

        let plaintext = secret_key.key.try_decrypt(&ciphertext.ciphertext)?;
        Ok(FhePlaintext { plaintext })
    }

    fn add(&self, lhs: &Self::Ciphertext, rhs: &Self::Ciphertext) -> Result<Self::Ciphertext, LutPIRError> {
        self.check_params(&lhs.params)?;
        self.check_params(&rhs.params)?;

        Ok(self.wrap(lhs.size.max(rhs.size), &lhs.ciphertext + &rhs.ciphertext))
    }

    fn sub_plain(&self, lhs: &Self::Ciphertext, rhs: &Self::Plaintext) -> Result<Self::Ciphertext, LutPIRError> {
        self.check_params(&lhs.params)?;

        Ok(self.wrap(lhs.size, &lhs.ciphertext - &rhs.plaintext))
    }

    fn multiply(&self, lhs: &Self::Ciphertext, rhs: &Self::Ciphertext) -> Result<Self::Ciphertext, LutPIRError> {
        self.check_params(&lhs.params)?;
        self.check_params(&rhs.params)?;
        if branch_opt_util::unlikely(lhs.size != FRESH_CIPHERTEXT_SIZE || rhs.size != FRESH_CIPHERTEXT_SIZE) {
            return Err(LutPIRError::RelinearizationRequired);
        }

        Ok(self.wrap(lhs.size + rhs.size - 1, &lhs.ciphertext * &rhs.ciphertext))
    }

    fn multiply_plain(&self, lhs: &Self::Ciphertext, rhs: &Self::Plaintext) -> Result<Self::Ciphertext, LutPIRError> {
        self.check_params(&lhs.params)?;

        Ok(self.wrap(lhs.size, &lhs.ciphertext * &rhs.plaintext))
    }

    fn relinearize(&self, ciphertext: &mut Self::Ciphertext, relin_keys: &Self::RelinKeys) -> Result<(), LutPIRError> {
        self.check_params(&ciphertext.params)?;
        self.check_params(&relin_keys.params)?;

        // Fresh ciphertexts are left untouched, `fhe` only relinearizes three components.
        if ciphertext.size != FRESH_CIPHERTEXT_SIZE {
            relin_keys.key.relinearizes(&mut ciphertext.ciphertext)?;
            ciphertext.size = FRESH_CIPHERTEXT_SIZE;
        }

        Ok(())
    }

    fn rotate_rows(&self, ciphertext: &Self::Ciphertext, steps: i32, galois_keys: &Self::GaloisKeys) -> Result<Self::Ciphertext, LutPIRError> {
        self.check_params(&ciphertext.params)?;
        self.check_params(&galois_keys.params)?;
        if branch_opt_util::unlikely(ciphertext.size != FRESH_CIPHERTEXT_SIZE) {
            return Err(LutPIRError::RelinearizationRequired);
        }

        let row_size = self.row_size();
        if branch_opt_util::unlikely(steps.unsigned_abs() as usize >= row_size) {
            return Err(LutPIRError::InvalidRotationStep(steps));
        }

        let shift = (steps as i64).rem_euclid(row_size as i64) as usize;

        let mut rotated = ciphertext.ciphertext.clone();
        for step in rotation_steps(row_size).filter(|&step| shift & step != 0) {
            rotated = galois_keys.key.rotates_columns_by(&rotated, step)?;
        }

        Ok(self.wrap(FRESH_CIPHERTEXT_SIZE, rotated))
    }
}

fn write_artifact(kind: u8, params: &SchemeParams, body: &[u8]) -> Vec<u8> {
    let mut writer = ByteWriter::with_capacity(artifact_len(body.len()));
    writer.put_u8(kind);
    params.write_to(&mut writer);
    writer.put_bytes(body);
    writer.into_bytes()
}

const fn artifact_len(body_len: usize) -> usize {
    1 + SchemeParams::BYTE_LEN + prefixed_len(body_len)
}

/// Returns the parameters an artifact of `kind` was produced under, and its body.
fn read_artifact(kind: u8, bytes: &[u8]) -> Result<(SchemeParams, Arc<bfv::BfvParameters>, Vec<u8>), LutPIRError> {
    let mut reader = ByteReader::new(bytes);
    let found_kind = reader.get_u8()?;
    if branch_opt_util::unlikely(found_kind != kind) {
        return Err(LutPIRError::FailedToDeserialize(format!("expected artifact kind {:#x}, found {:#x}", kind, found_kind)));
    }

    let params = SchemeParams::read_from(&mut reader)?;
    let body = reader.get_bytes()?;
    reader.finish()?;

    Ok((params, bfv_parameters(&params)?, body))
}

fn deserialize_err(e: fhe::Error) -> LutPIRError {
    LutPIRError::FailedToDeserialize(e.to_string())
}

impl Serializable for FhePublicKey {
    fn to_bytes(&self) -> Vec<u8> {
        write_artifact(ARTIFACT_PUBLIC_KEY, &self.params, &self.key.to_bytes())
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self, LutPIRError> {
        let (params, bfv, body) = read_artifact(ARTIFACT_PUBLIC_KEY, bytes)?;
        let key = bfv::PublicKey::from_bytes(&body, &bfv).map_err(deserialize_err)?;

        Ok(FhePublicKey { params, key: Arc::new(key) })
    }

    fn byte_len(&self) -> usize {
        artifact_len(self.key.to_bytes().len())
    }
}

impl Serializable for FheSecretKey {
    fn to_bytes(&self) -> Vec<u8> {
        write_artifact(ARTIFACT_SECRET_KEY, &self.params, &self.seed)
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self, LutPIRError> {
        let (params, bfv, body) = read_artifact(ARTIFACT_SECRET_KEY, bytes)?;
        let seed: [u8; KEYGEN_SEED_BYTE_LEN] = body
            .as_slice()
            .try_into()
            .map_err(|_| LutPIRError::FailedToDeserialize(format!("secret key seed must be {} bytes, found {}", KEYGEN_SEED_BYTE_LEN, body.len())))?;

        Ok(FheSecretKey {
            params,
            seed,
            key: Arc::new(secret_key_from_seed(&bfv, &seed)),
        })
    }

    fn byte_len(&self) -> usize {
        artifact_len(KEYGEN_SEED_BYTE_LEN)
    }
}

impl Serializable for FheGaloisKeys {
    fn to_bytes(&self) -> Vec<u8> {
        write_artifact(ARTIFACT_GALOIS_KEYS, &self.params, &self.key.to_bytes())
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self, LutPIRError> {
        let (params, bfv, body) = read_artifact(ARTIFACT_GALOIS_KEYS, bytes)?;
        let key = bfv::EvaluationKey::from_bytes(&body, &bfv).map_err(deserialize_err)?;

        Ok(FheGaloisKeys { params, key: Arc::new(key) })
    }

    fn byte_len(&self) -> usize {
        artifact_len(self.key.to_bytes().len())
    }
}

impl Serializable for FheRelinKeys {
    fn to_bytes(&self) -> Vec<u8> {
        write_artifact(ARTIFACT_RELIN_KEYS, &self.params, &self.key.to_bytes())
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self, LutPIRError> {
        let (params, bfv, body) = read_artifact(ARTIFACT_RELIN_KEYS, bytes)?;
        let key = bfv::RelinearizationKey::from_bytes(&body, &bfv).map_err(deserialize_err)?;

        Ok(FheRelinKeys { params, key: Arc::new(key) })
    }

    fn byte_len(&self) -> usize {
        artifact_len(self.key.to_bytes().len())
    }
}

impl Serializable for FheCiphertext {
    fn to_bytes(&self) -> Vec<u8> {
        let body = self.ciphertext.to_bytes();

        let mut writer = ByteWriter::with_capacity(1 + artifact_len(body.len()));
        writer.put_u8(ARTIFACT_CIPHERTEXT);
        self.params.write_to(&mut writer);
        writer.put_u8(self.size).put_bytes(&body);
        writer.into_bytes()
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self, LutPIRError> {
        let mut reader = ByteReader::new(bytes);
        let found_kind = reader.get_u8()?;
        if branch_opt_util::unlikely(found_kind != ARTIFACT_CIPHERTEXT) {
            return Err(LutPIRError::FailedToDeserialize(format!("expected ciphertext, found kind {:#x}", found_kind)));
        }

        let params = SchemeParams::read_from(&mut reader)?;
        let size = reader.get_u8()?;
        let body = reader.get_bytes()?;
        reader.finish()?;

        if branch_opt_util::unlikely(size < FRESH_CIPHERTEXT_SIZE) {
            return Err(LutPIRError::FailedToDeserialize(format!("ciphertext size must be at least 2, found {}", size)));
        }

        let bfv = bfv_parameters(&params)?;
        let ciphertext = bfv::Ciphertext::from_bytes(&body, &bfv).map_err(deserialize_err)?;

        Ok(FheCiphertext { params, size, ciphertext })
    }

    fn byte_len(&self) -> usize {
        1 + artifact_len(self.ciphertext.to_bytes().len())
    }
}
