//! LutPIR User client: looks a private value up in a computation server's table without revealing it.
//!
//! A User first obtains a key bundle from the decryptor, keeping the secret key locally, then submits encrypted
//! query values to the computation server and later polls it for the encrypted table output, which only the User
//! can decrypt.
//!
//! ```rust,no_run
//! use lutpir_client::Client;
//! use lutpir_common::{he::{FheBfv, SchemeParams}, packet::FuncNo, params::RetryPolicy};
//! use rand::prelude::*;
//! use rand_chacha::ChaCha8Rng;
//! use std::time::Duration;
//!
//! let mut rng = ChaCha8Rng::from_os_rng();
//! let mut client = Client::<FheBfv>::new("127.0.0.1:9200", "127.0.0.1:9100", RetryPolicy::default());
//!
//! let key_id = client.new_keys(&SchemeParams::default()).expect("Failed to obtain keys");
//! let query_id = client.submit(key_id, FuncNo::OneInput, &[7], &mut rng).expect("Query was not admitted");
//!
//! match client.wait_result(key_id, query_id, Duration::from_secs(10)) {
//!     Ok(value) => println!("f(7) = {}", value),
//!     Err(err) => println!("Lookup failed: {}", err),
//! }
//! ```

mod client;

pub use client::Client;
pub use lutpir_common::{error::LutPIRError, packet::FuncNo};
