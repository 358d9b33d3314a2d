//! Wire messages exchanged between User, computation server and decryptor.
//!
//! Every message is a plain struct with `to_bytes`/`from_bytes`, written with [`ByteWriter`] and parsed back with
//! [`ByteReader`]. Framing, i.e. control code and length prefix, lives in [`crate::framing`].

use crate::{
    branch_opt_util,
    codec::{ByteReader, ByteWriter, prefixed_len},
    error::LutPIRError,
    he::SchemeParams,
};

pub type KeyId = u32;
pub type QueryId = u32;

/// Identifies the request (or response) carried by a frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u64)]
pub enum ControlCode {
    NewKeys = 0x01,
    DeleteKeys = 0x02,
    PubKey = 0x03,
    GaloisKey = 0x04,
    RelinKey = 0x05,
    Param = 0x06,
    MidResult = 0x07,
    Query = 0x08,
    Result = 0x09,
    Response = 0x80,
}

impl TryFrom<u64> for ControlCode {
    type Error = LutPIRError;

    fn try_from(code: u64) -> Result<Self, Self::Error> {
        match code {
            0x01 => Ok(ControlCode::NewKeys),
            0x02 => Ok(ControlCode::DeleteKeys),
            0x03 => Ok(ControlCode::PubKey),
            0x04 => Ok(ControlCode::GaloisKey),
            0x05 => Ok(ControlCode::RelinKey),
            0x06 => Ok(ControlCode::Param),
            0x07 => Ok(ControlCode::MidResult),
            0x08 => Ok(ControlCode::Query),
            0x09 => Ok(ControlCode::Result),
            0x80 => Ok(ControlCode::Response),
            _ => Err(LutPIRError::UnknownControlCode(code)),
        }
    }
}

/// First byte of every response payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum StatusCode {
    Ok = 0,
    AdmissionRejected = 1,
    NotFound = 2,
    NoMatchingInput = 3,
    Malformed = 4,
    Internal = 5,
}

impl TryFrom<u8> for StatusCode {
    type Error = LutPIRError;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        match code {
            0 => Ok(StatusCode::Ok),
            1 => Ok(StatusCode::AdmissionRejected),
            2 => Ok(StatusCode::NotFound),
            3 => Ok(StatusCode::NoMatchingInput),
            4 => Ok(StatusCode::Malformed),
            5 => Ok(StatusCode::Internal),
            _ => Err(LutPIRError::UnknownStatusCode(code)),
        }
    }
}

impl StatusCode {
    /// Status a server reports for a failed request.
    pub fn from_error(err: &LutPIRError) -> StatusCode {
        match err {
            LutPIRError::QueryAdmissionRejected => StatusCode::AdmissionRejected,
            LutPIRError::NoMatchingInputMember => StatusCode::NoMatchingInput,
            LutPIRError::KeyNotFound(_) | LutPIRError::ResultNotFound(_) | LutPIRError::FunctionTableNotLoaded(_) => StatusCode::NotFound,
            LutPIRError::FailedToDeserialize(_)
            | LutPIRError::UnknownControlCode(_)
            | LutPIRError::UnknownFuncNo(_)
            | LutPIRError::UnexpectedInputCount { .. }
            | LutPIRError::InvalidSchemeParams(_)
            | LutPIRError::SchemeParamsMismatch
            | LutPIRError::FrameTooLarge(_) => StatusCode::Malformed,
            _ => StatusCode::Internal,
        }
    }

    /// Error a client reconstructs from a non-`Ok` status and the accompanying message.
    pub fn into_error(self, message: String) -> LutPIRError {
        match self {
            StatusCode::AdmissionRejected => LutPIRError::QueryAdmissionRejected,
            StatusCode::NoMatchingInput => LutPIRError::NoMatchingInputMember,
            _ => LutPIRError::Remote(message),
        }
    }
}

/// Which lookup table a query is evaluated against.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum FuncNo {
    OneInput = 1,
    TwoInput = 2,
}

impl FuncNo {
    /// Number of encrypted inputs a query against this table carries.
    pub const fn num_inputs(self) -> usize {
        match self {
            FuncNo::OneInput => 1,
            FuncNo::TwoInput => 2,
        }
    }
}

impl TryFrom<u32> for FuncNo {
    type Error = LutPIRError;

    fn try_from(func_no: u32) -> Result<Self, Self::Error> {
        match func_no {
            1 => Ok(FuncNo::OneInput),
            2 => Ok(FuncNo::TwoInput),
            _ => Err(LutPIRError::UnknownFuncNo(func_no)),
        }
    }
}

/// Payload of requests which carry nothing but a key id: key deletion and key artifact fetches.
pub fn key_id_to_bytes(key_id: KeyId) -> Vec<u8> {
    key_id.to_le_bytes().to_vec()
}

pub fn key_id_from_bytes(bytes: &[u8]) -> Result<KeyId, LutPIRError> {
    let mut reader = ByteReader::new(bytes);
    let key_id = reader.get_u32()?;
    reader.finish()?;

    Ok(key_id)
}

#[derive(Clone, Debug, PartialEq)]
pub struct NewKeysResponse {
    pub key_id: KeyId,
    pub secret_key: Vec<u8>,
}

impl NewKeysResponse {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut writer = ByteWriter::with_capacity(std::mem::size_of::<KeyId>() + prefixed_len(self.secret_key.len()));
        writer.put_u32(self.key_id).put_bytes(&self.secret_key);
        writer.into_bytes()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, LutPIRError> {
        let mut reader = ByteReader::new(bytes);
        let key_id = reader.get_u32()?;
        let secret_key = reader.get_bytes()?;
        reader.finish()?;

        Ok(NewKeysResponse { key_id, secret_key })
    }
}

/// Masked ciphertexts of one input domain, sent from computation server to decryptor.
#[derive(Clone, Debug, PartialEq)]
pub struct MaskedGroup {
    /// Number of genuine candidates; slots at flat index `>= domain_size` are padding.
    pub domain_size: u32,
    pub ciphertexts: Vec<Vec<u8>>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct MidResultRequest {
    pub key_id: KeyId,
    pub query_id: QueryId,
    pub groups: Vec<MaskedGroup>,
}

impl MidResultRequest {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut writer = ByteWriter::new();
        writer.put_u32(self.key_id).put_u32(self.query_id).put_u32(self.groups.len() as u32);

        self.groups.iter().for_each(|group| {
            writer.put_u32(group.domain_size).put_u32(group.ciphertexts.len() as u32);
            group.ciphertexts.iter().for_each(|ct| {
                writer.put_bytes(ct);
            });
        });

        writer.into_bytes()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, LutPIRError> {
        let mut reader = ByteReader::new(bytes);

        let key_id = reader.get_u32()?;
        let query_id = reader.get_u32()?;
        let num_groups = reader.get_u32()?;

        let mut groups = Vec::new();
        for _ in 0..num_groups {
            let domain_size = reader.get_u32()?;
            let num_ciphertexts = reader.get_u32()?;

            let mut ciphertexts = Vec::new();
            for _ in 0..num_ciphertexts {
                ciphertexts.push(reader.get_bytes()?);
            }

            groups.push(MaskedGroup { domain_size, ciphertexts });
        }
        reader.finish()?;

        Ok(MidResultRequest { key_id, query_id, groups })
    }
}

/// Encrypted selector pair returned by the decryptor.
#[derive(Clone, Debug, PartialEq)]
pub struct MidResultResponse {
    pub selector: Vec<u8>,
    pub index: Vec<u8>,
}

impl MidResultResponse {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut writer = ByteWriter::with_capacity(prefixed_len(self.selector.len()) + prefixed_len(self.index.len()));
        writer.put_bytes(&self.selector).put_bytes(&self.index);
        writer.into_bytes()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, LutPIRError> {
        let mut reader = ByteReader::new(bytes);
        let selector = reader.get_bytes()?;
        let index = reader.get_bytes()?;
        reader.finish()?;

        Ok(MidResultResponse { selector, index })
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct QueryRequest {
    pub key_id: KeyId,
    pub func_no: FuncNo,
    pub params: SchemeParams,
    pub inputs: Vec<Vec<u8>>,
}

impl QueryRequest {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut writer = ByteWriter::new();
        writer.put_u32(self.key_id).put_u32(self.func_no as u32);
        self.params.write_to(&mut writer);
        writer.put_u32(self.inputs.len() as u32);
        self.inputs.iter().for_each(|ct| {
            writer.put_bytes(ct);
        });

        writer.into_bytes()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, LutPIRError> {
        let mut reader = ByteReader::new(bytes);

        let key_id = reader.get_u32()?;
        let func_no = FuncNo::try_from(reader.get_u32()?)?;
        let params = SchemeParams::read_from(&mut reader)?;

        let num_inputs = reader.get_u32()? as usize;
        if branch_opt_util::unlikely(num_inputs != func_no.num_inputs()) {
            return Err(LutPIRError::UnexpectedInputCount {
                expected: func_no.num_inputs(),
                found: num_inputs,
            });
        }

        let mut inputs = Vec::with_capacity(num_inputs);
        for _ in 0..num_inputs {
            inputs.push(reader.get_bytes()?);
        }
        reader.finish()?;

        Ok(QueryRequest {
            key_id,
            func_no,
            params,
            inputs,
        })
    }
}

pub fn query_id_to_bytes(query_id: QueryId) -> Vec<u8> {
    query_id.to_le_bytes().to_vec()
}

pub fn query_id_from_bytes(bytes: &[u8]) -> Result<QueryId, LutPIRError> {
    let mut reader = ByteReader::new(bytes);
    let query_id = reader.get_u32()?;
    reader.finish()?;

    Ok(query_id)
}

#[derive(Clone, Debug, PartialEq)]
pub struct ResultRequest {
    pub query_id: QueryId,
    /// How long the server may hold the request waiting for the result; zero polls.
    pub wait_msec: u32,
    /// Parameters the query was encrypted under; the server refuses to hand out a result computed under others.
    pub params: SchemeParams,
}

impl ResultRequest {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut writer = ByteWriter::with_capacity(2 * std::mem::size_of::<u32>() + SchemeParams::BYTE_LEN);
        writer.put_u32(self.query_id).put_u32(self.wait_msec);
        self.params.write_to(&mut writer);
        writer.into_bytes()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, LutPIRError> {
        let mut reader = ByteReader::new(bytes);
        let query_id = reader.get_u32()?;
        let wait_msec = reader.get_u32()?;
        let params = SchemeParams::read_from(&mut reader)?;
        reader.finish()?;

        Ok(ResultRequest { query_id, wait_msec, params })
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum ResultResponse {
    NotReady,
    Failed,
    Ready(Vec<u8>),
}

impl ResultResponse {
    const TAG_NOT_READY: u8 = 0;
    const TAG_FAILED: u8 = 1;
    const TAG_READY: u8 = 2;

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut writer = ByteWriter::new();
        match self {
            ResultResponse::NotReady => {
                writer.put_u8(Self::TAG_NOT_READY);
            }
            ResultResponse::Failed => {
                writer.put_u8(Self::TAG_FAILED);
            }
            ResultResponse::Ready(ct) => {
                writer.put_u8(Self::TAG_READY).put_bytes(ct);
            }
        }

        writer.into_bytes()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, LutPIRError> {
        let mut reader = ByteReader::new(bytes);
        let response = match reader.get_u8()? {
            Self::TAG_NOT_READY => ResultResponse::NotReady,
            Self::TAG_FAILED => ResultResponse::Failed,
            Self::TAG_READY => ResultResponse::Ready(reader.get_bytes()?),
            tag => return Err(LutPIRError::FailedToDeserialize(format!("unknown result status '{}'", tag))),
        };
        reader.finish()?;

        Ok(response)
    }
}
