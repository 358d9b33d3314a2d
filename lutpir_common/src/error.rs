use std::{error::Error, fmt::Display};

#[derive(Debug, Clone, PartialEq)]
pub enum LutPIRError {
    // Homomorphic encryption scheme
    InvalidSchemeParams(String),
    SlotCountMismatch { expected: usize, found: usize },
    KeyMismatch,
    RelinearizationRequired,
    InvalidRotationStep(i32),
    HeOperationFailed(String),

    // Serialization
    FailedToDeserialize(String),
    UnknownControlCode(u64),
    UnknownStatusCode(u8),
    FrameTooLarge(usize),

    // Lookup table
    TableFileNotFound(String),
    MalformedTableHeader(String),
    InvalidTableValue(String),
    TableSizeMismatch { declared: usize, found: usize },
    NoFunctionTableConfigured,
    FunctionTableNotLoaded(u32),
    TableTooLargeForSlotCount { num_chunks: usize, row_size: usize },

    // Computation server
    UnknownFuncNo(u32),
    UnexpectedInputCount { expected: usize, found: usize },
    QueryAdmissionRejected,
    QueryIdAlreadyExists(u32),
    ResultNotFound(u32),
    QueryFailed(u32),
    SchemeParamsMismatch,

    // Decryptor
    KeyNotFound(u32),
    NoMatchingInputMember,
    PIRTargetOutOfRange { row: usize, row_size: usize },

    // Transport
    Io(String),
    ConnectionFailed { addr: String, attempts: u32 },
    Remote(String),
}

impl Display for LutPIRError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidSchemeParams(e) => write!(f, "Invalid homomorphic encryption scheme parameters: {}", e),
            Self::SlotCountMismatch { expected, found } => write!(f, "Expected at most {} slots, found {}.", expected, found),
            Self::KeyMismatch => write!(f, "Operands were not produced under the same key bundle."),
            Self::RelinearizationRequired => write!(f, "Ciphertext must be relinearized before this operation."),
            Self::InvalidRotationStep(step) => write!(f, "Rotation step '{}' is out of range for the slot row.", step),
            Self::HeOperationFailed(e) => write!(f, "Homomorphic operation failed with: {}", e),

            Self::FailedToDeserialize(e) => write!(f, "Deserialization failed with: {}", e),
            Self::UnknownControlCode(code) => write!(f, "Unknown packet control code '{:#x}'.", code),
            Self::UnknownStatusCode(code) => write!(f, "Unknown response status code '{}'.", code),
            Self::FrameTooLarge(len) => write!(f, "Frame payload of {}B exceeds the allowed maximum.", len),

            Self::TableFileNotFound(path) => write!(f, "Lookup table file '{}' is not found.", path),
            Self::MalformedTableHeader(e) => write!(f, "Lookup table header can't be parsed: {}", e),
            Self::InvalidTableValue(e) => write!(f, "Lookup table entry can't be parsed: {}", e),
            Self::TableSizeMismatch { declared, found } => {
                write!(f, "Lookup table header declares {} entries, but {} were found.", declared, found)
            }
            Self::NoFunctionTableConfigured => write!(f, "At least one lookup table must be configured."),
            Self::FunctionTableNotLoaded(func_no) => write!(f, "No lookup table is loaded for function '{}'.", func_no),
            Self::TableTooLargeForSlotCount { num_chunks, row_size } => {
                write!(f, "Lookup table needs {} chunks, but a slot row only holds {}.", num_chunks, row_size)
            }

            Self::UnknownFuncNo(func_no) => write!(f, "Unknown function number '{}'.", func_no),
            Self::UnexpectedInputCount { expected, found } => write!(f, "Expected {} encrypted inputs, found {}.", expected, found),
            Self::QueryAdmissionRejected => write!(f, "Query was rejected, computation server is at capacity. Retry later."),
            Self::QueryIdAlreadyExists(query_id) => write!(f, "Query id '{}' already exists in the queue.", query_id),
            Self::ResultNotFound(query_id) => write!(f, "No result for query id '{}'.", query_id),
            Self::QueryFailed(query_id) => write!(f, "Computation of query '{}' failed.", query_id),
            Self::SchemeParamsMismatch => write!(f, "Query was encrypted under parameters other than the key bundle's."),

            Self::KeyNotFound(key_id) => write!(f, "No key bundle for key id '{}'.", key_id),
            Self::NoMatchingInputMember => write!(f, "Queried value is not a member of the lookup table's input domain."),
            Self::PIRTargetOutOfRange { row, row_size } => write!(f, "Selected chunk '{}' is out of range of a '{}' slot row.", row, row_size),

            Self::Io(e) => write!(f, "I/O failed with: {}", e),
            Self::ConnectionFailed { addr, attempts } => write!(f, "Failed to connect to '{}' after {} attempts.", addr, attempts),
            Self::Remote(e) => write!(f, "Remote peer reported: {}", e),
        }
    }
}

impl Error for LutPIRError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        None
    }
}

impl From<std::io::Error> for LutPIRError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<fhe::Error> for LutPIRError {
    fn from(err: fhe::Error) -> Self {
        Self::HeOperationFailed(err.to_string())
    }
}
