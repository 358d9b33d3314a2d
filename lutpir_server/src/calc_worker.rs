//! Computation server side of the oblivious lookup: table shuffling and masking before the decryptor round trip,
//! encrypted selection after it.

use crate::{
    dec_client::DecryptorLink,
    lut::LookupTable,
    query::{Query, QueryQueue},
    result::{QueryResult, ResultQueue},
};
use lutpir_common::{
    branch_opt_util,
    error::LutPIRError,
    he::{HeScheme, Serializable},
    packet::{MaskedGroup, MidResultRequest, QueryId},
    params::{BLINDING_FACTOR_MAX, BLINDING_FACTOR_MIN},
};
use rand::{Rng, seq::SliceRandom};
use rand_chacha::ChaCha20Rng;
use rayon::prelude::*;
use std::{
    marker::PhantomData,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};
use tracing::{debug, info, warn};

/// Lookup table after a fresh secret shuffle of every input domain, cut into slot-row sized chunks.
#[derive(Clone, Debug, PartialEq)]
pub struct PermutedTable {
    /// Per input domain, its shuffled candidates in chunks of `chunk_len`; the last chunk is zero padded.
    pub input_chunks: Vec<Vec<Vec<i64>>>,
    pub domain_sizes: Vec<usize>,
    /// Outputs reordered consistently with the shuffled domains, in chunks of `chunk_len`.
    pub output_chunks: Vec<Vec<i64>>,
}

fn into_chunks(values: &[i64], chunk_len: usize) -> Vec<Vec<i64>> {
    values
        .chunks(chunk_len)
        .map(|chunk| {
            let mut chunk = chunk.to_vec();
            chunk.resize(chunk_len, 0);
            chunk
        })
        .collect()
}

/// Shuffles each input domain with an independent uniform permutation and reorders `outputs` (row-major over the
/// domains) to match, i.e. for two domains `pout[p0 * n1 + p1] = out[perm0[p0] * n1 + perm1[p1]]`.
///
/// # Arguments
///
/// * `domains` - Input domains of the table, in input order.
/// * `outputs` - Table outputs, row-major over `domains`, the last domain varying fastest.
/// * `chunk_len` - Slot row size of the scheme; every chunk is padded to it.
/// * `rng` - Source of the permutations.
///
/// # Returns
///
/// The permuted, chunked table, or `TableTooLargeForSlotCount` if the outputs need more chunks than a row holds.
pub fn permute_table<R: Rng + ?Sized>(domains: &[&[i64]], outputs: &[i64], chunk_len: usize, rng: &mut R) -> Result<PermutedTable, LutPIRError> {
    let domain_sizes = domains.iter().map(|domain| domain.len()).collect::<Vec<_>>();
    let num_combinations = domain_sizes.iter().product::<usize>();
    if branch_opt_util::unlikely(outputs.len() != num_combinations) {
        return Err(LutPIRError::TableSizeMismatch {
            declared: num_combinations,
            found: outputs.len(),
        });
    }

    let num_output_chunks = num_combinations.div_ceil(chunk_len);
    if branch_opt_util::unlikely(num_output_chunks > chunk_len) {
        return Err(LutPIRError::TableTooLargeForSlotCount {
            num_chunks: num_output_chunks,
            row_size: chunk_len,
        });
    }

    let perms = domain_sizes
        .iter()
        .map(|&n| {
            let mut perm = (0..n).collect::<Vec<usize>>();
            perm.shuffle(&mut *rng);
            perm
        })
        .collect::<Vec<_>>();

    let input_chunks = domains
        .iter()
        .zip(&perms)
        .map(|(domain, perm)| {
            let permuted = perm.iter().map(|&idx| domain[idx]).collect::<Vec<_>>();
            into_chunks(&permuted, chunk_len)
        })
        .collect();

    // Row-major strides: the last domain varies fastest.
    let mut strides = vec![1usize; domain_sizes.len()];
    for d in (0..domain_sizes.len().saturating_sub(1)).rev() {
        strides[d] = strides[d + 1] * domain_sizes[d + 1];
    }

    let permuted_outputs = (0..num_combinations)
        .map(|flat| {
            let src = strides
                .iter()
                .zip(&domain_sizes)
                .zip(&perms)
                .map(|((&stride, &n), perm)| perm[(flat / stride) % n] * stride)
                .sum::<usize>();
            outputs[src]
        })
        .collect::<Vec<_>>();

    Ok(PermutedTable {
        input_chunks,
        domain_sizes,
        output_chunks: into_chunks(&permuted_outputs, chunk_len),
    })
}

/// Masks `query - candidate` for every chunk of candidates.
///
/// A slot holding one of the first `domain_size` candidates decrypts to zero exactly where the candidate equals the
/// queried value, and to the difference scaled by a blinding factor in `1..=5` otherwise. Padding slots and the whole
/// second slot row are multiplied by zero.
///
/// # Arguments
///
/// * `scheme` - Scheme the query was encrypted under.
/// * `query` - Encrypted query value, replicated across all slots.
/// * `input_chunks` - Shuffled candidates of one input domain, `row_size` per chunk, the last one zero padded.
/// * `domain_size` - Number of real candidates across `input_chunks`.
/// * `relin_keys` - Relinearization keys of the query's key bundle.
/// * `rng` - Source of the blinding factors.
///
/// # Returns
///
/// One masked ciphertext per chunk, in chunk order.
pub fn compute_masked<S: HeScheme, R: Rng + ?Sized>(
    scheme: &S,
    query: &S::Ciphertext,
    input_chunks: &[Vec<i64>],
    domain_size: usize,
    relin_keys: &S::RelinKeys,
    rng: &mut R,
) -> Result<Vec<S::Ciphertext>, LutPIRError> {
    let row_size = scheme.row_size();

    // Drawn up front and in order, so a seeded worker is reproducible regardless of rayon scheduling.
    let blinding = (0..input_chunks.len())
        .map(|i| {
            let num_candidates = domain_size.saturating_sub(i * row_size).min(row_size);
            let mut factors = vec![0i64; scheme.slot_count()];
            factors[..num_candidates]
                .iter_mut()
                .for_each(|factor| *factor = rng.random_range(BLINDING_FACTOR_MIN..=BLINDING_FACTOR_MAX));
            factors
        })
        .collect::<Vec<_>>();

    input_chunks
        .par_iter()
        .zip(blinding.par_iter())
        .map(|(chunk, blinding)| {
            let mut masked = scheme.sub_plain(query, &scheme.encode(chunk)?)?;
            scheme.relinearize(&mut masked, relin_keys)?;

            let mut masked = scheme.multiply_plain(&masked, &scheme.encode(blinding)?)?;
            scheme.relinearize(&mut masked, relin_keys)?;

            Ok(masked)
        })
        .collect()
}

/// Homomorphically selects the matched output. Term `i` keeps a non-zero slot only if chunk `i` is the one the
/// decryptor located, so the sum carries exactly the selected output at the selector's slot.
pub fn compute_selected<S: HeScheme>(
    scheme: &S,
    selector: &S::Ciphertext,
    index: &S::Ciphertext,
    output_chunks: &[Vec<i64>],
    galois_keys: &S::GaloisKeys,
    relin_keys: &S::RelinKeys,
) -> Result<S::Ciphertext, LutPIRError> {
    let terms = output_chunks
        .par_iter()
        .enumerate()
        .map(|(i, chunk)| {
            let rotated = scheme.rotate_rows(index, -(i as i32), galois_keys)?;

            let mut term = scheme.multiply(&rotated, selector)?;
            scheme.relinearize(&mut term, relin_keys)?;

            let mut term = scheme.multiply_plain(&term, &scheme.encode(chunk)?)?;
            scheme.relinearize(&mut term, relin_keys)?;

            Ok(term)
        })
        .collect::<Result<Vec<_>, LutPIRError>>()?;

    let mut terms = terms.into_iter();
    let mut sum = terms.next().ok_or(LutPIRError::TableSizeMismatch { declared: 1, found: 0 })?;
    for term in terms {
        sum = scheme.add(&sum, &term)?;
        scheme.relinearize(&mut sum, relin_keys)?;
    }

    Ok(sum)
}

/// Runs the complete lookup for one query, with one decryptor round trip in the middle.
pub fn evaluate_query<S: HeScheme, R: Rng + ?Sized>(
    query_id: QueryId,
    query: &Query,
    lut: &LookupTable,
    link: &dyn DecryptorLink,
    rng: &mut R,
) -> Result<Vec<u8>, LutPIRError> {
    let scheme = S::new(&query.params)?;

    let eval_keys = link.fetch_eval_keys(query.key_id)?;
    if branch_opt_util::unlikely(eval_keys.params != query.params) {
        return Err(LutPIRError::SchemeParamsMismatch);
    }
    let galois_keys = S::GaloisKeys::from_bytes(&eval_keys.galois_keys)?;
    let relin_keys = S::RelinKeys::from_bytes(&eval_keys.relin_keys)?;

    let domains = lut.input_domains(query.func_no)?;
    if branch_opt_util::unlikely(query.inputs.len() != domains.len()) {
        return Err(LutPIRError::UnexpectedInputCount {
            expected: domains.len(),
            found: query.inputs.len(),
        });
    }
    let inputs = query
        .inputs
        .iter()
        .map(|bytes| S::Ciphertext::from_bytes(bytes))
        .collect::<Result<Vec<_>, LutPIRError>>()?;

    let table = permute_table(&domains, lut.outputs(query.func_no)?, scheme.row_size(), &mut *rng)?;

    let groups = inputs
        .iter()
        .zip(&table.input_chunks)
        .zip(&table.domain_sizes)
        .map(|((input, chunks), &domain_size)| {
            let masked = compute_masked(&scheme, input, chunks, domain_size, &relin_keys, &mut *rng)?;

            Ok(MaskedGroup {
                domain_size: domain_size as u32,
                ciphertexts: masked.iter().map(|ct| ct.to_bytes()).collect(),
            })
        })
        .collect::<Result<Vec<_>, LutPIRError>>()?;

    debug!(query_id, num_groups = groups.len(), "masked inputs, requesting selectors");
    let response = link.exchange_mid_result(&MidResultRequest {
        key_id: query.key_id,
        query_id,
        groups,
    })?;

    let selector = S::Ciphertext::from_bytes(&response.selector)?;
    let index = S::Ciphertext::from_bytes(&response.index)?;

    let selected = compute_selected(&scheme, &selector, &index, &table.output_chunks, &galois_keys, &relin_keys)?;
    Ok(selected.to_bytes())
}

/// One member of the computation server's worker pool.
pub(crate) struct CalcWorker<S: HeScheme> {
    pub(crate) index: usize,
    pub(crate) queries: Arc<QueryQueue>,
    pub(crate) results: Arc<ResultQueue>,
    pub(crate) lut: Arc<LookupTable>,
    pub(crate) link: Arc<dyn DecryptorLink>,
    pub(crate) stop: Arc<AtomicBool>,
    pub(crate) poll_interval: Duration,
    pub(crate) rng: ChaCha20Rng,
    pub(crate) _scheme: PhantomData<fn() -> S>,
}

impl<S: HeScheme> CalcWorker<S> {
    /// Serves queries until the stop flag is raised. A query in progress is always finished first.
    pub(crate) fn run(mut self) {
        info!(worker = self.index, "calc worker started");

        while !self.stop.load(Ordering::Acquire) {
            let Some((query_id, query)) = self.queries.pop_timeout(self.poll_interval) else {
                continue;
            };

            debug!(worker = self.index, query_id, key_id = query.key_id, func_no = ?query.func_no, "evaluating query");

            let result = match evaluate_query::<S, _>(query_id, &query, &self.lut, self.link.as_ref(), &mut self.rng) {
                Ok(ciphertext) => QueryResult::success(query_id, query.params, ciphertext),
                Err(e) => {
                    warn!(worker = self.index, query_id, error = %e, "query failed");
                    QueryResult::failure(query_id, query.params)
                }
            };

            if let Err(e) = self.results.push(result) {
                warn!(worker = self.index, query_id, error = %e, "dropping result");
            }
        }

        info!(worker = self.index, "calc worker stopped");
    }
}

#[cfg(test)]
mod test {
    use super::{compute_masked, compute_selected, permute_table};
    use lutpir_common::{
        error::LutPIRError,
        he::{ClearBfv, HeScheme, SchemeParams},
    };
    use rand::prelude::*;
    use rand_chacha::ChaCha8Rng;

    fn small_scheme() -> ClearBfv {
        ClearBfv::new(&SchemeParams {
            poly_modulus_degree: 16,
            plain_modulus: 65537,
            coeff_modulus_bits: 109,
        })
        .unwrap()
    }

    #[test]
    fn permutation_keeps_inputs_paired_with_outputs() {
        let mut rng = ChaCha8Rng::from_os_rng();

        let x0 = (0..5).map(|x| x * 3).collect::<Vec<i64>>();
        let x1 = (0..4).map(|x| x - 2).collect::<Vec<i64>>();
        let outputs = x0.iter().flat_map(|&a| x1.iter().map(move |&b| 100 * a + b)).collect::<Vec<_>>();

        let table = permute_table(&[x0.as_slice(), x1.as_slice()], &outputs, 8, &mut rng).unwrap();
        assert_eq!(table.domain_sizes, vec![5, 4]);

        let p0 = table.input_chunks[0].concat();
        let p1 = table.input_chunks[1].concat();
        let pout = table.output_chunks.concat();

        assert_eq!(pout.len(), 24);
        for i0 in 0..5 {
            for i1 in 0..4 {
                assert_eq!(pout[i0 * 4 + i1], 100 * p0[i0] + p1[i1]);
            }
        }

        // Padding sits past each domain.
        assert!(p0[5..].iter().all(|&v| v == 0));
        assert!(pout[20..].iter().all(|&v| v == 0));
    }

    #[test]
    fn table_needing_more_chunks_than_a_row_holds_is_rejected() {
        let mut rng = ChaCha8Rng::from_os_rng();
        let inputs = (0..65).collect::<Vec<i64>>();

        assert_eq!(
            permute_table(&[inputs.as_slice()], &inputs, 8, &mut rng),
            Err(LutPIRError::TableTooLargeForSlotCount { num_chunks: 9, row_size: 8 })
        );
    }

    #[test]
    fn masked_slot_is_zero_only_at_matching_candidate() {
        let scheme = small_scheme();
        let mut rng = ChaCha8Rng::from_os_rng();
        let keys = scheme.keygen(&mut rng).unwrap();

        let chunks = vec![vec![4, 9, 1, 7, 3, 8, 2, 6], vec![5, 11, 13, 0, 0, 0, 0, 0]];
        let query = scheme.encrypt(&scheme.encode(&[13; 16]).unwrap(), &keys.public_key, &mut rng).unwrap();

        let masked = compute_masked(&scheme, &query, &chunks, 11, &keys.relin_keys, &mut rng).unwrap();
        let decoded = masked
            .iter()
            .map(|ct| scheme.decode(&scheme.decrypt(ct, &keys.secret_key).unwrap()).unwrap())
            .collect::<Vec<_>>();

        for (i, row) in decoded.iter().enumerate() {
            for (j, &v) in row[..8].iter().enumerate() {
                let is_candidate = i * 8 + j < 11;
                assert_eq!(v == 0, !is_candidate || (i == 1 && j == 2), "chunk {} slot {}", i, j);
            }
        }
    }

    #[test]
    fn padding_and_second_row_do_not_reveal_the_query() {
        let scheme = small_scheme();
        let mut rng = ChaCha8Rng::from_os_rng();
        let keys = scheme.keygen(&mut rng).unwrap();

        let q = 1000;
        let chunk = vec![3, 9, 1000, 7, 4, 0, 0, 0];
        let query = scheme.encrypt(&scheme.encode(&[q; 16]).unwrap(), &keys.public_key, &mut rng).unwrap();

        let masked = compute_masked(&scheme, &query, &[chunk.clone()], 5, &keys.relin_keys, &mut rng).unwrap();
        let decoded = scheme.decode(&scheme.decrypt(&masked[0], &keys.secret_key).unwrap()).unwrap();

        // Only real candidates carry a value; none of them lets the query be read off as a multiple of it.
        assert!(decoded[5..].iter().all(|&v| v == 0), "{:?}", decoded);
        for (j, &candidate) in chunk[..5].iter().enumerate() {
            let factor = decoded[j] / (q - candidate).max(1);
            if candidate == q {
                assert_eq!(decoded[j], 0);
            } else {
                assert_eq!(decoded[j] % (q - candidate), 0);
                assert!((1..=5).contains(&factor), "slot {} factor {}", j, factor);
                assert_ne!(decoded[j] % q, 0, "slot {}", j);
            }
        }
    }

    #[test]
    fn selection_picks_output_at_rotated_index() {
        let scheme = small_scheme();
        let mut rng = ChaCha8Rng::from_os_rng();
        let keys = scheme.keygen(&mut rng).unwrap();

        let output_chunks = vec![(0..8).map(|v| v * 10).collect::<Vec<i64>>(), (8..16).map(|v| v * 10).collect::<Vec<i64>>()];

        // Target 13: chunk 1, slot 5. The index selector holds its 1 at (5 - 1) mod 8.
        let mut selector = vec![0i64; 16];
        selector[5] = 1;
        let mut index = vec![0i64; 16];
        index[4] = 1;

        let selector = scheme.encrypt(&scheme.encode(&selector).unwrap(), &keys.public_key, &mut rng).unwrap();
        let index = scheme.encrypt(&scheme.encode(&index).unwrap(), &keys.public_key, &mut rng).unwrap();

        let selected = compute_selected(&scheme, &selector, &index, &output_chunks, &keys.galois_keys, &keys.relin_keys).unwrap();
        let decoded = scheme.decode(&scheme.decrypt(&selected, &keys.secret_key).unwrap()).unwrap();

        assert_eq!(decoded[5], 130);
        assert_eq!(decoded.iter().sum::<i64>(), 130);
    }
}
