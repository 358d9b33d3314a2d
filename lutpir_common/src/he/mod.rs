//! Capability interface to a batched, leveled homomorphic encryption scheme.
//!
//! The lookup protocol only ever talks to the scheme through [`HeScheme`], so any BFV-style backend offering batch
//! encoding, plaintext/ciphertext arithmetic with explicit relinearization and row rotation can be plugged in.
//! [`FheBfv`] is the backend shipped with this workspace. The `clear_bfv` feature adds `ClearBfv`, a slot-transparent
//! test double with the same algebra.

#[cfg(any(test, feature = "clear_bfv"))]
mod clear_bfv;
mod fhe_bfv;

#[cfg(any(test, feature = "clear_bfv"))]
pub use clear_bfv::{ClearBfv, ClearCiphertext, ClearGaloisKeys, ClearPlaintext, ClearPublicKey, ClearRelinKeys, ClearSecretKey};
pub use fhe_bfv::{FheBfv, FheCiphertext, FheGaloisKeys, FhePlaintext, FhePublicKey, FheRelinKeys, FheSecretKey};

use crate::{
    branch_opt_util,
    codec::{ByteReader, ByteWriter},
    error::LutPIRError,
    params::{DEFAULT_COEFF_MODULUS_BITS, DEFAULT_PLAIN_MODULUS, DEFAULT_POLY_MODULUS_DEGREE},
};
use rand::CryptoRng;

/// Byte encoding of every artifact which crosses a process boundary: keys, ciphertexts and scheme parameters.
pub trait Serializable: Sized {
    fn to_bytes(&self) -> Vec<u8>;
    fn from_bytes(bytes: &[u8]) -> Result<Self, LutPIRError>;

    /// Exact length of `to_bytes()`. Used for pre-sizing network buffers.
    fn byte_len(&self) -> usize;
}

/// Encryption parameters a key bundle is generated under.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SchemeParams {
    pub poly_modulus_degree: u32,
    pub plain_modulus: u64,
    pub coeff_modulus_bits: u32,
}

impl Default for SchemeParams {
    fn default() -> Self {
        SchemeParams {
            poly_modulus_degree: DEFAULT_POLY_MODULUS_DEGREE,
            plain_modulus: DEFAULT_PLAIN_MODULUS,
            coeff_modulus_bits: DEFAULT_COEFF_MODULUS_BITS,
        }
    }
}

impl SchemeParams {
    pub const BYTE_LEN: usize = std::mem::size_of::<u32>() + std::mem::size_of::<u64>() + std::mem::size_of::<u32>();

    pub fn write_to(&self, writer: &mut ByteWriter) {
        writer.put_u32(self.poly_modulus_degree).put_u64(self.plain_modulus).put_u32(self.coeff_modulus_bits);
    }

    pub fn read_from(reader: &mut ByteReader<'_>) -> Result<SchemeParams, LutPIRError> {
        Ok(SchemeParams {
            poly_modulus_degree: reader.get_u32()?,
            plain_modulus: reader.get_u64()?,
            coeff_modulus_bits: reader.get_u32()?,
        })
    }

    /// Checks that the ring degree is a power of two, at least 8, and that the plaintext modulus is a prime
    /// `< 2^32` congruent to `1 mod 2 * degree`, i.e. that batching is available.
    pub fn check_batching(&self) -> Result<(), LutPIRError> {
        let degree = self.poly_modulus_degree as u64;
        if branch_opt_util::unlikely(degree < 8 || !degree.is_power_of_two()) {
            return Err(LutPIRError::InvalidSchemeParams(format!(
                "polynomial modulus degree must be a power of two >= 8, found {}",
                degree
            )));
        }

        let t = self.plain_modulus;
        if branch_opt_util::unlikely(t >= (1u64 << 32) || !is_prime(t)) {
            return Err(LutPIRError::InvalidSchemeParams(format!("plaintext modulus must be a prime < 2^32, found {}", t)));
        }
        if branch_opt_util::unlikely(t % (2 * degree) != 1) {
            return Err(LutPIRError::InvalidSchemeParams(format!(
                "plaintext modulus {} does not support batching for degree {}",
                t, degree
            )));
        }

        Ok(())
    }
}

fn is_prime(n: u64) -> bool {
    if n < 2 {
        return false;
    }

    let mut divisor = 2u64;
    while divisor * divisor <= n {
        if n % divisor == 0 {
            return false;
        }
        divisor += 1;
    }

    true
}

impl Serializable for SchemeParams {
    fn to_bytes(&self) -> Vec<u8> {
        let mut writer = ByteWriter::with_capacity(Self::BYTE_LEN);
        self.write_to(&mut writer);
        writer.into_bytes()
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self, LutPIRError> {
        let mut reader = ByteReader::new(bytes);
        let params = Self::read_from(&mut reader)?;
        reader.finish()?;

        Ok(params)
    }

    fn byte_len(&self) -> usize {
        Self::BYTE_LEN
    }
}

/// The five artifacts the decryptor keeps per key id.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum KeyKind {
    PublicKey,
    SecretKey,
    GaloisKeys,
    RelinKeys,
    Params,
}

impl KeyKind {
    pub const ALL: [KeyKind; 5] = [KeyKind::PublicKey, KeyKind::SecretKey, KeyKind::GaloisKeys, KeyKind::RelinKeys, KeyKind::Params];

    #[inline(always)]
    pub const fn index(self) -> usize {
        match self {
            KeyKind::PublicKey => 0,
            KeyKind::SecretKey => 1,
            KeyKind::GaloisKeys => 2,
            KeyKind::RelinKeys => 3,
            KeyKind::Params => 4,
        }
    }

    pub const fn file_stem(self) -> &'static str {
        match self {
            KeyKind::PublicKey => "pubkey",
            KeyKind::SecretKey => "seckey",
            KeyKind::GaloisKeys => "galoiskey",
            KeyKind::RelinKeys => "relinkey",
            KeyKind::Params => "param",
        }
    }
}

/// Everything `HeScheme::keygen` produces, generated together from one source of randomness.
pub struct KeyBundle<S: HeScheme> {
    pub public_key: S::PublicKey,
    pub secret_key: S::SecretKey,
    pub galois_keys: S::GaloisKeys,
    pub relin_keys: S::RelinKeys,
    pub params: SchemeParams,
}

impl<S: HeScheme> KeyBundle<S> {
    /// Serialized artifacts, indexed by `KeyKind::index`.
    pub fn to_artifacts(&self) -> [Vec<u8>; 5] {
        [
            self.public_key.to_bytes(),
            self.secret_key.to_bytes(),
            self.galois_keys.to_bytes(),
            self.relin_keys.to_bytes(),
            self.params.to_bytes(),
        ]
    }
}

/// Narrow capability interface to a batched homomorphic encryption scheme.
///
/// Slots are laid out as a `2 x row_size` matrix, as BFV batching does. Every ciphertext x ciphertext
/// `multiply` must be followed by `relinearize` before the result is multiplied or rotated again.
pub trait HeScheme: Sized + Send + Sync {
    type PublicKey: Serializable + Clone + Send + Sync;
    type SecretKey: Serializable + Clone + Send + Sync;
    type GaloisKeys: Serializable + Clone + Send + Sync;
    type RelinKeys: Serializable + Clone + Send + Sync;
    type Plaintext: Clone + Send + Sync;
    type Ciphertext: Serializable + Clone + Send + Sync;

    fn new(params: &SchemeParams) -> Result<Self, LutPIRError>;
    fn params(&self) -> &SchemeParams;
    fn slot_count(&self) -> usize;

    #[inline(always)]
    fn row_size(&self) -> usize {
        self.slot_count() / 2
    }

    fn keygen<R: CryptoRng>(&self, rng: &mut R) -> Result<KeyBundle<Self>, LutPIRError>;

    /// Batch-encodes at most `slot_count` signed values, remaining slots are zero.
    fn encode(&self, values: &[i64]) -> Result<Self::Plaintext, LutPIRError>;
    /// Decodes every slot into its centered representative in `(-t/2, t/2]`.
    fn decode(&self, plaintext: &Self::Plaintext) -> Result<Vec<i64>, LutPIRError>;

    fn encrypt<R: CryptoRng>(&self, plaintext: &Self::Plaintext, public_key: &Self::PublicKey, rng: &mut R) -> Result<Self::Ciphertext, LutPIRError>;
    fn decrypt(&self, ciphertext: &Self::Ciphertext, secret_key: &Self::SecretKey) -> Result<Self::Plaintext, LutPIRError>;

    fn add(&self, lhs: &Self::Ciphertext, rhs: &Self::Ciphertext) -> Result<Self::Ciphertext, LutPIRError>;
    fn sub_plain(&self, lhs: &Self::Ciphertext, rhs: &Self::Plaintext) -> Result<Self::Ciphertext, LutPIRError>;
    fn multiply(&self, lhs: &Self::Ciphertext, rhs: &Self::Ciphertext) -> Result<Self::Ciphertext, LutPIRError>;
    fn multiply_plain(&self, lhs: &Self::Ciphertext, rhs: &Self::Plaintext) -> Result<Self::Ciphertext, LutPIRError>;
    fn relinearize(&self, ciphertext: &mut Self::Ciphertext, relin_keys: &Self::RelinKeys) -> Result<(), LutPIRError>;

    /// Cyclically rotates both slot rows by `steps`; positive steps rotate left, i.e. `out[j] = in[(j + steps) mod row_size]`.
    fn rotate_rows(&self, ciphertext: &Self::Ciphertext, steps: i32, galois_keys: &Self::GaloisKeys) -> Result<Self::Ciphertext, LutPIRError>;
}
