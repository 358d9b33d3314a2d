//! End-to-end tests of LutPIR, running a decryptor, a computation server and Users over loopback TCP.

mod test_lutpir;
