//! LutPIR computation server: evaluates a User's encrypted lookup against a plaintext function table, without
//! learning the queried value or which table entry was selected.
//!
//! ## How a query is evaluated
//!
//! 1. Every input domain of the table is shuffled with a fresh secret permutation and cut into chunks of one slot row.
//!    For each chunk, `query - candidates` is computed homomorphically and blinded with random non-zero factors, so
//!    a slot decrypts to zero only where the candidate matches.
//! 2. The masked ciphertexts go to the decryptor, which locates the zero slot and answers with two encrypted
//!    selectors: one marking the slot, one encoding the chunk as a rotation.
//! 3. Rotating, multiplying and summing over all output chunks leaves the selected output encrypted under the
//!    User's key; that ciphertext is the query's result.
//!
//! Queries are admitted by a [`CalcManager`], evaluated by its worker pool and polled for by the User, usually
//! through a [`CsServer`].
//!
//! ```rust,no_run
//! use lutpir_common::he::FheBfv;
//! use lutpir_server::{CalcConfig, CalcManager, CsServer, LookupTable, TableFiles};
//! use std::{path::PathBuf, sync::Arc};
//!
//! let files = TableFiles {
//!     one_input: Some(PathBuf::from("lut_one.txt")),
//!     two_input: None,
//! };
//! let lut = Arc::new(LookupTable::load(&files).expect("Failed to load lookup table"));
//!
//! let config = CalcConfig::default();
//! let num_threads = config.thread_count;
//! let manager = Arc::new(CalcManager::new(lut, config));
//! manager.start_threads::<FheBfv>(num_threads, "127.0.0.1:9200").expect("Failed to start workers");
//!
//! let _server = CsServer::bind("127.0.0.1:9100", manager).and_then(CsServer::spawn).expect("Failed to start server");
//! ```

mod calc_manager;
mod calc_worker;
mod dec_client;
mod lut;
mod query;
mod result;
mod srv;

pub use calc_manager::{CalcConfig, CalcManager};
pub use calc_worker::{PermutedTable, compute_masked, compute_selected, evaluate_query, permute_table};
pub use dec_client::{DecClient, DecryptorLink, EvalKeys};
pub use lut::{LookupTable, OneInputTable, TableFiles, TwoInputTable, format_table_text, parse_table_text};
pub use lutpir_common::{error::LutPIRError, listener::ServerHandle};
pub use query::{Query, QueryQueue};
pub use result::{QueryResult, ResultQueue, ResultStatus};
pub use srv::CsServer;
