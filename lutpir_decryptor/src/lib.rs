//! LutPIR decryptor: the only party holding secret keys.
//!
//! It generates key bundles on request of a User, hands evaluation keys to computation servers, and answers their
//! mid-result exchanges: it decrypts the blinded candidate ciphertexts, learns only which slot is zero, and responds
//! with two encrypted selectors. The table itself is never visible to it.
//!
//! ```rust,no_run
//! use lutpir_common::he::FheBfv;
//! use lutpir_decryptor::{DecServer, KeyContainer};
//! use std::sync::Arc;
//!
//! let keys = Arc::new(KeyContainer::<FheBfv>::new());
//! let _server = DecServer::bind("127.0.0.1:9200", keys).and_then(DecServer::spawn).expect("Failed to start decryptor");
//! ```

mod key_container;
mod pir_solver;
mod srv;

pub use key_container::KeyContainer;
pub use lutpir_common::{error::LutPIRError, listener::ServerHandle};
pub use pir_solver::{build_selectors, calc_pir_queries, combine_positions, find_first_zero, shift_work};
pub use srv::DecServer;
