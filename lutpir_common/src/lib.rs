//! Common utilities of LutPIR: oblivious lookup-table evaluation over batched homomorphic encryption.
//!
//! This crate is shared by the computation server (`lutpir_server`), the decryptor (`lutpir_decryptor`) and the
//! user-side client (`lutpir_client`). It provides
//!
//! * the error type of the whole workspace,
//! * protocol and default configuration constants,
//! * the capability interface to a batched homomorphic encryption scheme and its `fhe`-backed BFV implementation,
//! * wire packets, length-prefixed framing and a blocking request/response connection,
//! * a thread-per-connection accept loop and per-connection state tracking, used by both servers.

pub mod branch_opt_util;
pub mod codec;
pub mod error;
pub mod framing;
pub mod he;
pub mod listener;
pub mod packet;
pub mod params;
pub mod state;
