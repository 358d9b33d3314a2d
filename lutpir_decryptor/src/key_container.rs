use lutpir_common::{
    branch_opt_util,
    error::LutPIRError,
    he::{HeScheme, KeyKind, SchemeParams, Serializable},
    packet::KeyId,
};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use std::{
    collections::HashMap,
    fs,
    marker::PhantomData,
    path::{Path, PathBuf},
    sync::{Mutex, MutexGuard, PoisonError},
};
use tracing::{info, warn};

/// All five serialized artifacts of one key bundle, indexed by `KeyKind::index`.
type KeyRecord = [Vec<u8>; 5];

/// Owns every key bundle the decryptor has generated.
///
/// A key id is either fully present, with all five artifacts, or fully absent: records are inserted and removed
/// whole, under one lock.
pub struct KeyContainer<S: HeScheme> {
    records: Mutex<HashMap<KeyId, KeyRecord>>,
    rng: Mutex<ChaCha20Rng>,
    debug_dump_dir: Option<PathBuf>,
    _scheme: PhantomData<fn() -> S>,
}

impl<S: HeScheme> Default for KeyContainer<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: HeScheme> KeyContainer<S> {
    /// Container drawing key material and key ids from OS entropy.
    pub fn new() -> Self {
        Self::with_rng(ChaCha20Rng::from_os_rng())
    }

    /// Container whose every draw is reproducible from `seed`.
    pub fn with_seed(seed: u64) -> Self {
        Self::with_rng(ChaCha20Rng::seed_from_u64(seed))
    }

    fn with_rng(rng: ChaCha20Rng) -> Self {
        KeyContainer {
            records: Mutex::new(HashMap::new()),
            rng: Mutex::new(rng),
            debug_dump_dir: None,
            _scheme: PhantomData,
        }
    }

    /// Also writes every generated artifact to `dir` as `<kind>_<key_id>`, removing the files again on deletion.
    /// Debugging aid only; key material lands on disk unprotected.
    pub fn with_debug_dump_dir(mut self, dir: &Path) -> Self {
        self.debug_dump_dir = Some(dir.to_path_buf());
        self
    }

    fn lock_records(&self) -> MutexGuard<'_, HashMap<KeyId, KeyRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Independent generator, seeded from the container's own, for per-request encryption randomness.
    pub fn fork_rng(&self) -> ChaCha20Rng {
        let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
        ChaCha20Rng::from_rng(&mut *rng)
    }

    /// Generates a fresh key bundle under `params` and stores it under a new, random, non-zero key id.
    ///
    /// # Arguments
    ///
    /// * `params` - Encryption parameters, validated by the scheme before any key material is drawn.
    ///
    /// # Returns
    ///
    /// Id of the stored bundle, unique among live bundles, or the scheme's error if `params` are unusable.
    pub fn new_keys(&self, params: &SchemeParams) -> Result<KeyId, LutPIRError> {
        let scheme = S::new(params)?;

        let mut keygen_rng = self.fork_rng();
        let artifacts = scheme.keygen(&mut keygen_rng)?.to_artifacts();

        let key_id = {
            let mut records = self.lock_records();
            let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);

            let key_id = loop {
                let candidate = rng.random::<u32>();
                if candidate != 0 && !records.contains_key(&candidate) {
                    break candidate;
                }
            };

            records.insert(key_id, artifacts.clone());
            key_id
        };

        if let Some(dir) = &self.debug_dump_dir {
            self.dump_artifacts(dir, key_id, &artifacts);
        }

        info!(key_id, degree = params.poly_modulus_degree, "generated key bundle");
        Ok(key_id)
    }

    pub fn get(&self, key_id: KeyId, kind: KeyKind) -> Result<Vec<u8>, LutPIRError> {
        self.lock_records()
            .get(&key_id)
            .map(|record| record[kind.index()].clone())
            .ok_or(LutPIRError::KeyNotFound(key_id))
    }

    /// Length in bytes of what `get` returns for the same arguments.
    pub fn data_size(&self, key_id: KeyId, kind: KeyKind) -> Result<usize, LutPIRError> {
        self.lock_records()
            .get(&key_id)
            .map(|record| record[kind.index()].len())
            .ok_or(LutPIRError::KeyNotFound(key_id))
    }

    /// Removes all five artifacts of `key_id` at once.
    pub fn delete_keys(&self, key_id: KeyId) -> Result<(), LutPIRError> {
        let removed = self.lock_records().remove(&key_id);
        if branch_opt_util::unlikely(removed.is_none()) {
            return Err(LutPIRError::KeyNotFound(key_id));
        }

        if let Some(dir) = &self.debug_dump_dir {
            for kind in KeyKind::ALL {
                if let Err(e) = fs::remove_file(dump_path(dir, kind, key_id)) {
                    warn!(key_id, kind = kind.file_stem(), error = %e, "failed to remove dumped key artifact");
                }
            }
        }

        info!(key_id, "deleted key bundle");
        Ok(())
    }

    pub fn contains(&self, key_id: KeyId) -> bool {
        self.lock_records().contains_key(&key_id)
    }

    pub fn len(&self) -> usize {
        self.lock_records().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock_records().is_empty()
    }

    pub fn public_key(&self, key_id: KeyId) -> Result<S::PublicKey, LutPIRError> {
        S::PublicKey::from_bytes(&self.get(key_id, KeyKind::PublicKey)?)
    }

    pub fn secret_key(&self, key_id: KeyId) -> Result<S::SecretKey, LutPIRError> {
        S::SecretKey::from_bytes(&self.get(key_id, KeyKind::SecretKey)?)
    }

    pub fn params(&self, key_id: KeyId) -> Result<SchemeParams, LutPIRError> {
        SchemeParams::from_bytes(&self.get(key_id, KeyKind::Params)?)
    }

    fn dump_artifacts(&self, dir: &Path, key_id: KeyId, artifacts: &KeyRecord) {
        for kind in KeyKind::ALL {
            if let Err(e) = fs::write(dump_path(dir, kind, key_id), &artifacts[kind.index()]) {
                warn!(key_id, kind = kind.file_stem(), error = %e, "failed to dump key artifact");
            }
        }
    }
}

fn dump_path(dir: &Path, kind: KeyKind, key_id: KeyId) -> PathBuf {
    dir.join(format!("{}_{}", kind.file_stem(), key_id))
}

#[cfg(test)]
mod test {
    use super::KeyContainer;
    use lutpir_common::{
        error::LutPIRError,
        he::{ClearBfv, FheBfv, HeScheme, KeyKind, SchemeParams},
    };
    use rand::prelude::*;
    use rand_chacha::ChaCha8Rng;
    use std::fs;

    const SMALL_PARAMS: SchemeParams = SchemeParams {
        poly_modulus_degree: 16,
        plain_modulus: 65537,
        coeff_modulus_bits: 109,
    };

    #[test]
    fn key_bundle_lifecycle() {
        let keys = KeyContainer::<ClearBfv>::new();
        let key_id = keys.new_keys(&SMALL_PARAMS).unwrap();

        assert_ne!(key_id, 0);
        for kind in KeyKind::ALL {
            let artifact = keys.get(key_id, kind).unwrap();
            assert_eq!(keys.data_size(key_id, kind), Ok(artifact.len()));
        }
        assert_eq!(keys.params(key_id), Ok(SMALL_PARAMS));

        keys.delete_keys(key_id).unwrap();

        for kind in KeyKind::ALL {
            assert_eq!(keys.get(key_id, kind), Err(LutPIRError::KeyNotFound(key_id)));
            assert_eq!(keys.data_size(key_id, kind), Err(LutPIRError::KeyNotFound(key_id)));
        }
        assert_eq!(keys.delete_keys(key_id), Err(LutPIRError::KeyNotFound(key_id)));
        assert!(keys.is_empty());
    }

    #[test]
    fn key_ids_are_distinct() {
        let keys = KeyContainer::<ClearBfv>::with_seed(42);
        let ids = (0..32).map(|_| keys.new_keys(&SMALL_PARAMS).unwrap()).collect::<std::collections::HashSet<_>>();

        assert_eq!(ids.len(), 32);
        assert_eq!(keys.len(), 32);
    }

    #[test]
    fn invalid_params_create_nothing() {
        let keys = KeyContainer::<ClearBfv>::new();
        let params = SchemeParams {
            plain_modulus: 65536,
            ..SMALL_PARAMS
        };

        assert!(matches!(keys.new_keys(&params), Err(LutPIRError::InvalidSchemeParams(_))));
        assert!(keys.is_empty());
    }

    #[test]
    fn debug_dump_follows_key_lifecycle() {
        let dir = std::env::temp_dir().join(format!("lutpir-keydump-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();

        let keys = KeyContainer::<ClearBfv>::new().with_debug_dump_dir(&dir);
        let key_id = keys.new_keys(&SMALL_PARAMS).unwrap();

        let dumped = fs::read(dir.join(format!("galoiskey_{}", key_id))).unwrap();
        assert_eq!(dumped, keys.get(key_id, KeyKind::GaloisKeys).unwrap());

        keys.delete_keys(key_id).unwrap();
        assert!(!dir.join(format!("galoiskey_{}", key_id)).exists());

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn deletion_completes_when_dumped_files_are_already_gone() {
        let dir = std::env::temp_dir().join(format!("lutpir-keydump-gone-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();

        let keys = KeyContainer::<ClearBfv>::new().with_debug_dump_dir(&dir);
        let key_id = keys.new_keys(&SMALL_PARAMS).unwrap();

        fs::remove_file(dir.join(format!("seckey_{}", key_id))).unwrap();

        assert_eq!(keys.delete_keys(key_id), Ok(()));
        assert!(!keys.contains(key_id));
        assert!(!dir.join(format!("pubkey_{}", key_id)).exists());

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn stored_bfv_bundle_encrypts_and_decrypts() {
        let keys = KeyContainer::<FheBfv>::new();
        let key_id = keys.new_keys(&SMALL_PARAMS).unwrap();

        let scheme = FheBfv::new(&keys.params(key_id).unwrap()).unwrap();
        let mut rng = ChaCha8Rng::from_os_rng();

        let pt = scheme.encode(&[12, -5, 0, 9]).unwrap();
        let ct = scheme.encrypt(&pt, &keys.public_key(key_id).unwrap(), &mut rng).unwrap();
        let decoded = scheme.decode(&scheme.decrypt(&ct, &keys.secret_key(key_id).unwrap()).unwrap()).unwrap();

        assert_eq!(decoded[..4], [12, -5, 0, 9]);
    }
}
