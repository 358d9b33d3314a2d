//! Decryptor side of the oblivious lookup: locate the zero slot among the masked candidates and answer with two
//! encrypted selectors, one marking the slot within its row, one encoding the chunk it sits in as a rotation.

use crate::key_container::KeyContainer;
use lutpir_common::{
    branch_opt_util,
    error::LutPIRError,
    he::{HeScheme, Serializable},
    packet::{MidResultRequest, MidResultResponse},
};
use rand::CryptoRng;
use rayon::prelude::*;
use tracing::debug;

/// Flat index `chunk * row_size + slot` of the first zero among the first `domain_size` slots, scanning chunk by
/// chunk, slot by slot. Padding past `domain_size` never matches; with duplicates, the first one scanned wins.
pub fn find_first_zero(decoded_chunks: &[Vec<i64>], row_size: usize, domain_size: usize) -> Option<usize> {
    decoded_chunks
        .iter()
        .enumerate()
        .flat_map(|(i, slots)| slots.iter().take(row_size).enumerate().map(move |(j, &v)| (i * row_size + j, v)))
        .take_while(|&(flat, _)| flat < domain_size)
        .find(|&(_, v)| v == 0)
        .map(|(flat, _)| flat)
}

/// Row-major position in the combined table, the last domain varying fastest.
///
/// # Arguments
///
/// * `positions` - Matched position within each input domain.
/// * `domain_sizes` - Size of each input domain, in the same order.
///
/// # Returns
///
/// The flat target index, or `PIRTargetOutOfRange` if it does not fit a `usize`.
pub fn combine_positions(positions: &[usize], domain_sizes: &[usize]) -> Result<usize, LutPIRError> {
    positions.iter().zip(domain_sizes).try_fold(0usize, |acc, (&pos, &n)| {
        acc.checked_mul(n)
            .and_then(|scaled| scaled.checked_add(pos))
            .ok_or(LutPIRError::PIRTargetOutOfRange { row: acc, row_size: n })
    })
}

/// First slot row of `selector`, cyclically rotated left by `row`; the second row is left zero.
pub fn shift_work(selector: &[i64], row: usize, row_size: usize) -> Vec<i64> {
    let mut shifted = vec![0i64; selector.len()];
    (0..row_size).for_each(|j| {
        shifted[j] = selector[(j + row) % row_size];
    });

    shifted
}

/// Plaintext query and index selectors pointing at `target`.
pub fn build_selectors(target: usize, row_size: usize, slot_count: usize) -> Result<(Vec<i64>, Vec<i64>), LutPIRError> {
    let (row, col) = (target / row_size, target % row_size);
    if branch_opt_util::unlikely(row >= row_size) {
        return Err(LutPIRError::PIRTargetOutOfRange { row, row_size });
    }

    let mut selector = vec![0i64; slot_count];
    selector[col] = 1;

    let index = shift_work(&selector, row, row_size);
    Ok((selector, index))
}

/// Handles one mid-result exchange.
///
/// # Arguments
///
/// * `keys` - Key bundles; the request's key id selects the secret key used to decrypt the masked candidates.
/// * `request` - One group of masked ciphertexts per input domain.
/// * `rng` - Randomness for encrypting the two selectors.
///
/// # Returns
///
/// Encrypted query and index selectors, or `NoMatchingInputMember` if any input domain holds no match.
pub fn calc_pir_queries<S: HeScheme, R: CryptoRng>(keys: &KeyContainer<S>, request: &MidResultRequest, rng: &mut R) -> Result<MidResultResponse, LutPIRError> {
    let scheme = S::new(&keys.params(request.key_id)?)?;
    let secret_key = keys.secret_key(request.key_id)?;
    let public_key = keys.public_key(request.key_id)?;
    let row_size = scheme.row_size();

    if branch_opt_util::unlikely(request.groups.is_empty()) {
        return Err(LutPIRError::NoMatchingInputMember);
    }

    let mut positions = Vec::with_capacity(request.groups.len());
    let mut domain_sizes = Vec::with_capacity(request.groups.len());

    for group in &request.groups {
        let decoded = group
            .ciphertexts
            .par_iter()
            .map(|bytes| {
                let ct = S::Ciphertext::from_bytes(bytes)?;
                scheme.decode(&scheme.decrypt(&ct, &secret_key)?)
            })
            .collect::<Result<Vec<_>, LutPIRError>>()?;

        let domain_size = group.domain_size as usize;
        let position = find_first_zero(&decoded, row_size, domain_size).ok_or(LutPIRError::NoMatchingInputMember)?;

        positions.push(position);
        domain_sizes.push(domain_size);
    }

    let target = combine_positions(&positions, &domain_sizes)?;
    let (selector, index) = build_selectors(target, row_size, scheme.slot_count())?;

    debug!(key_id = request.key_id, query_id = request.query_id, "built selectors");

    let selector = scheme.encrypt(&scheme.encode(&selector)?, &public_key, rng)?;
    let index = scheme.encrypt(&scheme.encode(&index)?, &public_key, rng)?;

    Ok(MidResultResponse {
        selector: selector.to_bytes(),
        index: index.to_bytes(),
    })
}
