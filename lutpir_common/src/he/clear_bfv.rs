//! Slot-transparent reference backend of the [`HeScheme`] capability interface.
//!
//! `ClearBfv` reproduces the observable algebra of batched BFV: a `2 x row_size` slot matrix, arithmetic modulo the
//! plaintext modulus, row-wise rotation, ciphertext growth on multiplication and the need to relinearize, and binding of
//! every ciphertext and evaluation key to the key bundle it was produced under. It does **not** hide slot contents.
//! It exists so the lookup protocol, its queues and its wire format can be unit tested quickly and deterministically;
//! it is only compiled for tests or with the `clear_bfv` feature.

use super::{HeScheme, KeyBundle, SchemeParams, Serializable};
use crate::{
    branch_opt_util,
    codec::{ByteReader, ByteWriter},
    error::LutPIRError,
    params::{KEY_TAG_BYTE_LEN, KEYGEN_SEED_BYTE_LEN},
};
use rand::CryptoRng;
use rayon::prelude::*;
use turboshake::TurboShake128;

const ARTIFACT_PUBLIC_KEY: u8 = 0x01;
const ARTIFACT_SECRET_KEY: u8 = 0x02;
const ARTIFACT_GALOIS_KEYS: u8 = 0x03;
const ARTIFACT_RELIN_KEYS: u8 = 0x04;
const ARTIFACT_CIPHERTEXT: u8 = 0x10;

/// Number of polynomial components of a fresh (or relinearized) ciphertext.
const FRESH_CIPHERTEXT_SIZE: u8 = 2;

type KeyTag = [u8; KEY_TAG_BYTE_LEN];

#[derive(Clone, Debug, PartialEq)]
pub struct ClearSecretKey {
    seed: [u8; KEYGEN_SEED_BYTE_LEN],
}

#[derive(Clone, Debug, PartialEq)]
pub struct ClearPublicKey {
    key_tag: KeyTag,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ClearGaloisKeys {
    key_tag: KeyTag,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ClearRelinKeys {
    key_tag: KeyTag,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ClearPlaintext {
    slots: Vec<u64>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ClearCiphertext {
    key_tag: KeyTag,
    size: u8,
    slots: Vec<u64>,
}

impl ClearCiphertext {
    /// Number of polynomial components; anything above two needs relinearization.
    pub fn size(&self) -> u8 {
        self.size
    }
}

#[derive(Debug)]
pub struct ClearBfv {
    params: SchemeParams,
    slot_count: usize,
}

/// Derives the identifier binding ciphertexts and evaluation keys to one secret key.
fn derive_key_tag(seed: &[u8; KEYGEN_SEED_BYTE_LEN]) -> KeyTag {
    let mut hasher = TurboShake128::default();
    hasher.absorb(b"lutpir/clear-bfv/key-tag");
    hasher.absorb(seed);
    hasher.finalize::<{ TurboShake128::DEFAULT_DOMAIN_SEPARATOR }>();

    let mut key_tag = [0u8; KEY_TAG_BYTE_LEN];
    hasher.squeeze(&mut key_tag);

    key_tag
}

impl ClearBfv {
    #[inline(always)]
    fn plain_modulus(&self) -> u64 {
        self.params.plain_modulus
    }

    #[inline(always)]
    fn add_mod(&self, a: u64, b: u64) -> u64 {
        (a + b) % self.plain_modulus()
    }

    #[inline(always)]
    fn sub_mod(&self, a: u64, b: u64) -> u64 {
        (a + self.plain_modulus() - b) % self.plain_modulus()
    }

    #[inline(always)]
    fn mul_mod(&self, a: u64, b: u64) -> u64 {
        ((a as u128 * b as u128) % self.plain_modulus() as u128) as u64
    }

    fn check_same_key(lhs: &KeyTag, rhs: &KeyTag) -> Result<(), LutPIRError> {
        if branch_opt_util::likely(lhs == rhs) { Ok(()) } else { Err(LutPIRError::KeyMismatch) }
    }

    fn check_slot_count(&self, num_slots: usize) -> Result<(), LutPIRError> {
        if branch_opt_util::likely(num_slots == self.slot_count) {
            Ok(())
        } else {
            Err(LutPIRError::SlotCountMismatch {
                expected: self.slot_count,
                found: num_slots,
            })
        }
    }

    fn zip_slots(&self, lhs: &[u64], rhs: &[u64], op: impl Fn(u64, u64) -> u64 + Sync) -> Vec<u64> {
        lhs.par_iter().zip(rhs.par_iter()).map(|(&a, &b)| op(a, b)).collect()
    }
}

impl HeScheme for ClearBfv {
    type PublicKey = ClearPublicKey;
    type SecretKey = ClearSecretKey;
    type GaloisKeys = ClearGaloisKeys;
    type RelinKeys = ClearRelinKeys;
    type Plaintext = ClearPlaintext;
    type Ciphertext = ClearCiphertext;

    fn new(params: &SchemeParams) -> Result<Self, LutPIRError> {
        params.check_batching()?;

        Ok(ClearBfv {
            params: *params,
            slot_count: params.poly_modulus_degree as usize,
        })
    }

    fn params(&self) -> &SchemeParams {
        &self.params
    }

    fn slot_count(&self) -> usize {
        self.slot_count
    }

    fn keygen<R: CryptoRng>(&self, rng: &mut R) -> Result<KeyBundle<Self>, LutPIRError> {
        let mut seed = [0u8; KEYGEN_SEED_BYTE_LEN];
        rng.fill_bytes(&mut seed);

        let key_tag = derive_key_tag(&seed);

        Ok(KeyBundle {
            public_key: ClearPublicKey { key_tag },
            secret_key: ClearSecretKey { seed },
            galois_keys: ClearGaloisKeys { key_tag },
            relin_keys: ClearRelinKeys { key_tag },
            params: self.params,
        })
    }

    fn encode(&self, values: &[i64]) -> Result<Self::Plaintext, LutPIRError> {
        if branch_opt_util::unlikely(values.len() > self.slot_count) {
            return Err(LutPIRError::SlotCountMismatch {
                expected: self.slot_count,
                found: values.len(),
            });
        }

        let t = self.plain_modulus() as i64;
        let mut slots = vec![0u64; self.slot_count];
        slots.iter_mut().zip(values).for_each(|(slot, &v)| {
            *slot = v.rem_euclid(t) as u64;
        });

        Ok(ClearPlaintext { slots })
    }

    fn decode(&self, plaintext: &Self::Plaintext) -> Result<Vec<i64>, LutPIRError> {
        let t = self.plain_modulus();
        let half_t = t / 2;

        Ok(plaintext
            .slots
            .iter()
            .map(|&slot| if slot > half_t { slot as i64 - t as i64 } else { slot as i64 })
            .collect())
    }

    /// Transparent encryption; `rng` is accepted for interface parity with randomized backends.
    fn encrypt<R: CryptoRng>(&self, plaintext: &Self::Plaintext, public_key: &Self::PublicKey, _rng: &mut R) -> Result<Self::Ciphertext, LutPIRError> {
        self.check_slot_count(plaintext.slots.len())?;

        Ok(ClearCiphertext {
            key_tag: public_key.key_tag,
            size: FRESH_CIPHERTEXT_SIZE,
            slots: plaintext.slots.clone(),
        })
    }

    fn decrypt(&self, ciphertext: &Self::Ciphertext, secret_key: &Self::SecretKey) -> Result<Self::Plaintext, LutPIRError> {
        Self::check_same_key(&ciphertext.key_tag, &derive_key_tag(&secret_key.seed))?;
        self.check_slot_count(ciphertext.slots.len())?;

        Ok(ClearPlaintext {
            slots: ciphertext.slots.clone(),
        })
    }

    fn add(&self, lhs: &Self::Ciphertext, rhs: &Self::Ciphertext) -> Result<Self::Ciphertext, LutPIRError> {
        Self::check_same_key(&lhs.key_tag, &rhs.key_tag)?;
        self.check_slot_count(lhs.slots.len())?;
        self.check_slot_count(rhs.slots.len())?;

        Ok(ClearCiphertext {
            key_tag: lhs.key_tag,
            size: lhs.size.max(rhs.size),
            slots: self.zip_slots(&lhs.slots, &rhs.slots, |a, b| self.add_mod(a, b)),
        })
    }

    fn sub_plain(&self, lhs: &Self::Ciphertext, rhs: &Self::Plaintext) -> Result<Self::Ciphertext, LutPIRError> {
        self.check_slot_count(lhs.slots.len())?;
        self.check_slot_count(rhs.slots.len())?;

        Ok(ClearCiphertext {
            key_tag: lhs.key_tag,
            size: lhs.size,
            slots: self.zip_slots(&lhs.slots, &rhs.slots, |a, b| self.sub_mod(a, b)),
        })
    }

    fn multiply(&self, lhs: &Self::Ciphertext, rhs: &Self::Ciphertext) -> Result<Self::Ciphertext, LutPIRError> {
        Self::check_same_key(&lhs.key_tag, &rhs.key_tag)?;
        if branch_opt_util::unlikely(lhs.size != FRESH_CIPHERTEXT_SIZE || rhs.size != FRESH_CIPHERTEXT_SIZE) {
            return Err(LutPIRError::RelinearizationRequired);
        }
        self.check_slot_count(lhs.slots.len())?;
        self.check_slot_count(rhs.slots.len())?;

        Ok(ClearCiphertext {
            key_tag: lhs.key_tag,
            size: lhs.size + rhs.size - 1,
            slots: self.zip_slots(&lhs.slots, &rhs.slots, |a, b| self.mul_mod(a, b)),
        })
    }

    fn multiply_plain(&self, lhs: &Self::Ciphertext, rhs: &Self::Plaintext) -> Result<Self::Ciphertext, LutPIRError> {
        self.check_slot_count(lhs.slots.len())?;
        self.check_slot_count(rhs.slots.len())?;

        Ok(ClearCiphertext {
            key_tag: lhs.key_tag,
            size: lhs.size,
            slots: self.zip_slots(&lhs.slots, &rhs.slots, |a, b| self.mul_mod(a, b)),
        })
    }

    fn relinearize(&self, ciphertext: &mut Self::Ciphertext, relin_keys: &Self::RelinKeys) -> Result<(), LutPIRError> {
        Self::check_same_key(&ciphertext.key_tag, &relin_keys.key_tag)?;
        ciphertext.size = FRESH_CIPHERTEXT_SIZE;

        Ok(())
    }

    fn rotate_rows(&self, ciphertext: &Self::Ciphertext, steps: i32, galois_keys: &Self::GaloisKeys) -> Result<Self::Ciphertext, LutPIRError> {
        Self::check_same_key(&ciphertext.key_tag, &galois_keys.key_tag)?;
        if branch_opt_util::unlikely(ciphertext.size != FRESH_CIPHERTEXT_SIZE) {
            return Err(LutPIRError::RelinearizationRequired);
        }
        self.check_slot_count(ciphertext.slots.len())?;

        let row_size = self.row_size();
        if branch_opt_util::unlikely(steps.unsigned_abs() as usize >= row_size) {
            return Err(LutPIRError::InvalidRotationStep(steps));
        }

        let shift = (steps as i64).rem_euclid(row_size as i64) as usize;
        let mut slots = ciphertext.slots.clone();
        slots.chunks_exact_mut(row_size).for_each(|row| row.rotate_left(shift));

        Ok(ClearCiphertext {
            key_tag: ciphertext.key_tag,
            size: ciphertext.size,
            slots,
        })
    }
}

fn write_key_tag_artifact(kind: u8, key_tag: &KeyTag) -> Vec<u8> {
    let mut writer = ByteWriter::with_capacity(1 + KEY_TAG_BYTE_LEN);
    writer.put_u8(kind).put_fixed(key_tag);
    writer.into_bytes()
}

fn read_key_tag_artifact(kind: u8, bytes: &[u8]) -> Result<KeyTag, LutPIRError> {
    let mut reader = ByteReader::new(bytes);
    let found_kind = reader.get_u8()?;
    if branch_opt_util::unlikely(found_kind != kind) {
        return Err(LutPIRError::FailedToDeserialize(format!("expected artifact kind {:#x}, found {:#x}", kind, found_kind)));
    }

    let key_tag = reader.get_fixed::<KEY_TAG_BYTE_LEN>()?;
    reader.finish()?;

    Ok(key_tag)
}

impl Serializable for ClearPublicKey {
    fn to_bytes(&self) -> Vec<u8> {
        write_key_tag_artifact(ARTIFACT_PUBLIC_KEY, &self.key_tag)
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self, LutPIRError> {
        Ok(ClearPublicKey {
            key_tag: read_key_tag_artifact(ARTIFACT_PUBLIC_KEY, bytes)?,
        })
    }

    fn byte_len(&self) -> usize {
        1 + KEY_TAG_BYTE_LEN
    }
}

impl Serializable for ClearGaloisKeys {
    fn to_bytes(&self) -> Vec<u8> {
        write_key_tag_artifact(ARTIFACT_GALOIS_KEYS, &self.key_tag)
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self, LutPIRError> {
        Ok(ClearGaloisKeys {
            key_tag: read_key_tag_artifact(ARTIFACT_GALOIS_KEYS, bytes)?,
        })
    }

    fn byte_len(&self) -> usize {
        1 + KEY_TAG_BYTE_LEN
    }
}

impl Serializable for ClearRelinKeys {
    fn to_bytes(&self) -> Vec<u8> {
        write_key_tag_artifact(ARTIFACT_RELIN_KEYS, &self.key_tag)
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self, LutPIRError> {
        Ok(ClearRelinKeys {
            key_tag: read_key_tag_artifact(ARTIFACT_RELIN_KEYS, bytes)?,
        })
    }

    fn byte_len(&self) -> usize {
        1 + KEY_TAG_BYTE_LEN
    }
}

impl Serializable for ClearSecretKey {
    fn to_bytes(&self) -> Vec<u8> {
        let mut writer = ByteWriter::with_capacity(self.byte_len());
        writer.put_u8(ARTIFACT_SECRET_KEY).put_fixed(&self.seed);
        writer.into_bytes()
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self, LutPIRError> {
        let mut reader = ByteReader::new(bytes);
        let found_kind = reader.get_u8()?;
        if branch_opt_util::unlikely(found_kind != ARTIFACT_SECRET_KEY) {
            return Err(LutPIRError::FailedToDeserialize(format!("expected secret key artifact, found kind {:#x}", found_kind)));
        }

        let seed = reader.get_fixed::<KEYGEN_SEED_BYTE_LEN>()?;
        reader.finish()?;

        Ok(ClearSecretKey { seed })
    }

    fn byte_len(&self) -> usize {
        1 + KEYGEN_SEED_BYTE_LEN
    }
}

impl Serializable for ClearCiphertext {
    fn to_bytes(&self) -> Vec<u8> {
        let mut writer = ByteWriter::with_capacity(self.byte_len());
        writer.put_u8(ARTIFACT_CIPHERTEXT).put_fixed(&self.key_tag).put_u8(self.size).put_u64_slice(&self.slots);
        writer.into_bytes()
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self, LutPIRError> {
        let mut reader = ByteReader::new(bytes);
        let found_kind = reader.get_u8()?;
        if branch_opt_util::unlikely(found_kind != ARTIFACT_CIPHERTEXT) {
            return Err(LutPIRError::FailedToDeserialize(format!("expected ciphertext, found kind {:#x}", found_kind)));
        }

        let key_tag = reader.get_fixed::<KEY_TAG_BYTE_LEN>()?;
        let size = reader.get_u8()?;
        let slots = reader.get_u64_vec()?;
        reader.finish()?;

        if branch_opt_util::unlikely(size < FRESH_CIPHERTEXT_SIZE) {
            return Err(LutPIRError::FailedToDeserialize(format!("ciphertext size must be at least 2, found {}", size)));
        }

        Ok(ClearCiphertext { key_tag, size, slots })
    }

    fn byte_len(&self) -> usize {
        1 + KEY_TAG_BYTE_LEN + 1 + std::mem::size_of::<u32>() + self.slots.len() * std::mem::size_of::<u64>()
    }
}

#[cfg(test)]
mod test {
    use super::ClearBfv;
    use crate::{
        error::LutPIRError,
        he::{HeScheme, SchemeParams, Serializable},
    };
    use rand::prelude::*;
    use rand_chacha::ChaCha8Rng;
    use test_case::test_case;

    fn small_params() -> SchemeParams {
        SchemeParams {
            poly_modulus_degree: 16,
            plain_modulus: 65537,
            coeff_modulus_bits: 109,
        }
    }

    #[test_case(16, 65537 => matches Ok(_); "Degree 16 with Fermat prime modulus supports batching")]
    #[test_case(4096, 65537 => matches Ok(_); "Default parameters are valid")]
    #[test_case(12, 65537 => matches Err(LutPIRError::InvalidSchemeParams(_)); "Degree must be a power of two")]
    #[test_case(4, 65537 => matches Err(LutPIRError::InvalidSchemeParams(_)); "Degree must be at least eight")]
    #[test_case(16, 65536 => matches Err(LutPIRError::InvalidSchemeParams(_)); "Plaintext modulus must be prime")]
    #[test_case(16, 65521 => matches Err(LutPIRError::InvalidSchemeParams(_)); "Plaintext modulus must be congruent to one modulo twice the degree")]
    fn scheme_parameter_validation(poly_modulus_degree: u32, plain_modulus: u64) -> Result<ClearBfv, LutPIRError> {
        ClearBfv::new(&SchemeParams {
            poly_modulus_degree,
            plain_modulus,
            coeff_modulus_bits: 109,
        })
    }

    #[test]
    fn encrypt_then_decrypt_recovers_signed_slots() {
        let scheme = ClearBfv::new(&small_params()).unwrap();
        let mut rng = ChaCha8Rng::from_os_rng();
        let keys = scheme.keygen(&mut rng).unwrap();

        let values = (0..16).map(|_| rng.random_range(-30_000i64..=30_000)).collect::<Vec<_>>();
        let ct = scheme.encrypt(&scheme.encode(&values).unwrap(), &keys.public_key, &mut rng).unwrap();
        let decoded = scheme.decode(&scheme.decrypt(&ct, &keys.secret_key).unwrap()).unwrap();

        assert_eq!(values, decoded);
    }

    #[test]
    fn decrypting_under_foreign_key_fails() {
        let scheme = ClearBfv::new(&small_params()).unwrap();
        let mut rng = ChaCha8Rng::from_os_rng();
        let keys = scheme.keygen(&mut rng).unwrap();
        let other_keys = scheme.keygen(&mut rng).unwrap();

        let ct = scheme.encrypt(&scheme.encode(&[1, 2, 3]).unwrap(), &keys.public_key, &mut rng).unwrap();

        assert_eq!(scheme.decrypt(&ct, &other_keys.secret_key), Err(LutPIRError::KeyMismatch));
        assert_eq!(scheme.rotate_rows(&ct, 1, &other_keys.galois_keys), Err(LutPIRError::KeyMismatch));
    }

    #[test]
    fn product_must_be_relinearized_before_further_multiplication() {
        let scheme = ClearBfv::new(&small_params()).unwrap();
        let mut rng = ChaCha8Rng::from_os_rng();
        let keys = scheme.keygen(&mut rng).unwrap();

        let ct = scheme.encrypt(&scheme.encode(&[3; 16]).unwrap(), &keys.public_key, &mut rng).unwrap();
        let mut product = scheme.multiply(&ct, &ct).unwrap();
        assert_eq!(product.size(), 3);

        assert_eq!(scheme.multiply(&product, &ct), Err(LutPIRError::RelinearizationRequired));
        assert_eq!(scheme.rotate_rows(&product, 1, &keys.galois_keys), Err(LutPIRError::RelinearizationRequired));

        scheme.relinearize(&mut product, &keys.relin_keys).unwrap();
        let cube = scheme.multiply(&product, &ct).unwrap();

        let decoded = scheme.decode(&scheme.decrypt(&cube, &keys.secret_key).unwrap()).unwrap();
        assert!(decoded.iter().all(|&v| v == 27));
    }

    #[test]
    fn rotation_is_left_cyclic_within_each_row() {
        let scheme = ClearBfv::new(&small_params()).unwrap();
        let mut rng = ChaCha8Rng::from_os_rng();
        let keys = scheme.keygen(&mut rng).unwrap();

        let values = (0..16).collect::<Vec<i64>>();
        let ct = scheme.encrypt(&scheme.encode(&values).unwrap(), &keys.public_key, &mut rng).unwrap();

        let left = scheme.decode(&scheme.decrypt(&scheme.rotate_rows(&ct, 2, &keys.galois_keys).unwrap(), &keys.secret_key).unwrap()).unwrap();
        assert_eq!(left, vec![2, 3, 4, 5, 6, 7, 0, 1, 10, 11, 12, 13, 14, 15, 8, 9]);

        let right = scheme.decode(&scheme.decrypt(&scheme.rotate_rows(&ct, -1, &keys.galois_keys).unwrap(), &keys.secret_key).unwrap()).unwrap();
        assert_eq!(right, vec![7, 0, 1, 2, 3, 4, 5, 6, 15, 8, 9, 10, 11, 12, 13, 14]);

        assert_eq!(scheme.rotate_rows(&ct, 8, &keys.galois_keys), Err(LutPIRError::InvalidRotationStep(8)));
    }

    #[test]
    fn serialized_length_is_known_upfront() {
        let scheme = ClearBfv::new(&small_params()).unwrap();
        let mut rng = ChaCha8Rng::from_os_rng();
        let keys = scheme.keygen(&mut rng).unwrap();
        let ct = scheme.encrypt(&scheme.encode(&[5; 16]).unwrap(), &keys.public_key, &mut rng).unwrap();

        assert_eq!(keys.public_key.byte_len(), keys.public_key.to_bytes().len());
        assert_eq!(keys.secret_key.byte_len(), keys.secret_key.to_bytes().len());
        assert_eq!(keys.galois_keys.byte_len(), keys.galois_keys.to_bytes().len());
        assert_eq!(keys.relin_keys.byte_len(), keys.relin_keys.to_bytes().len());
        assert_eq!(keys.params.byte_len(), keys.params.to_bytes().len());
        assert_eq!(ct.byte_len(), ct.to_bytes().len());

        // Artifact kinds are not interchangeable.
        assert!(matches!(
            <super::ClearRelinKeys as Serializable>::from_bytes(&keys.galois_keys.to_bytes()),
            Err(LutPIRError::FailedToDeserialize(_))
        ));
    }
}
