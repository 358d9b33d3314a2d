//! Length-prefixed framing over blocking byte streams and the request/response convention built on top of it.
//!
//! A frame is `control code (u64 LE) || payload length (u32 LE) || payload`. A response frame's payload starts
//! with a [`StatusCode`] byte; `Ok` is followed by the response body, anything else by a UTF-8 error message.

use crate::{
    branch_opt_util,
    error::LutPIRError,
    packet::{ControlCode, StatusCode},
    params::{MAX_FRAME_BYTE_LEN, RetryPolicy},
};
use std::{
    io::{ErrorKind, Read, Write},
    net::TcpStream,
    thread,
};
use tracing::{debug, warn};

const FRAME_HEADER_BYTE_LEN: usize = std::mem::size_of::<u64>() + std::mem::size_of::<u32>();

pub fn write_frame<W: Write>(writer: &mut W, code: ControlCode, payload: &[u8]) -> Result<(), LutPIRError> {
    if branch_opt_util::unlikely(payload.len() > MAX_FRAME_BYTE_LEN) {
        return Err(LutPIRError::FrameTooLarge(payload.len()));
    }

    let mut header = [0u8; FRAME_HEADER_BYTE_LEN];
    header[..8].copy_from_slice(&(code as u64).to_le_bytes());
    header[8..].copy_from_slice(&(payload.len() as u32).to_le_bytes());

    writer.write_all(&header)?;
    writer.write_all(payload)?;
    writer.flush()?;

    Ok(())
}

/// Reads one frame. Returns `None` if the peer closed the stream cleanly, before the first header byte.
pub fn read_frame<R: Read>(reader: &mut R) -> Result<Option<(ControlCode, Vec<u8>)>, LutPIRError> {
    let mut header = [0u8; FRAME_HEADER_BYTE_LEN];

    let mut filled = 0;
    while filled < header.len() {
        match reader.read(&mut header[filled..]) {
            Ok(0) if filled == 0 => return Ok(None),
            Ok(0) => return Err(LutPIRError::Io("stream closed in the middle of a frame header".to_string())),
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }

    let mut code_bytes = [0u8; 8];
    code_bytes.copy_from_slice(&header[..8]);
    let mut len_bytes = [0u8; 4];
    len_bytes.copy_from_slice(&header[8..]);

    let code = ControlCode::try_from(u64::from_le_bytes(code_bytes))?;
    let payload_len = u32::from_le_bytes(len_bytes) as usize;
    if branch_opt_util::unlikely(payload_len > MAX_FRAME_BYTE_LEN) {
        return Err(LutPIRError::FrameTooLarge(payload_len));
    }

    let mut payload = Vec::new();
    let received = reader.by_ref().take(payload_len as u64).read_to_end(&mut payload)?;
    if branch_opt_util::unlikely(received != payload_len) {
        return Err(LutPIRError::Io(format!("stream closed after {} of {} payload bytes", received, payload_len)));
    }

    Ok(Some((code, payload)))
}

pub fn ok_response(body: &[u8]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(1 + body.len());
    payload.push(StatusCode::Ok as u8);
    payload.extend_from_slice(body);
    payload
}

pub fn error_response(err: &LutPIRError) -> Vec<u8> {
    let message = err.to_string();

    let mut payload = Vec::with_capacity(1 + message.len());
    payload.push(StatusCode::from_error(err) as u8);
    payload.extend_from_slice(message.as_bytes());
    payload
}

/// Splits a response payload into its body, or the error the server reported.
pub fn parse_response(payload: Vec<u8>) -> Result<Vec<u8>, LutPIRError> {
    let (&status, rest) = payload
        .split_first()
        .ok_or_else(|| LutPIRError::FailedToDeserialize("empty response payload".to_string()))?;

    match StatusCode::try_from(status)? {
        StatusCode::Ok => Ok(rest.to_vec()),
        status => Err(status.into_error(String::from_utf8_lossy(rest).into_owned())),
    }
}

/// Client end of a request/response connection to a computation server or decryptor.
pub struct Connection {
    stream: TcpStream,
    peer: String,
}

impl Connection {
    /// Connects to `addr`, retrying at `policy.interval` up to `policy.max_attempts` times.
    pub fn connect(addr: &str, policy: RetryPolicy) -> Result<Connection, LutPIRError> {
        let max_attempts = policy.max_attempts.max(1);

        for attempt in 1..=max_attempts {
            match TcpStream::connect(addr) {
                Ok(stream) => {
                    stream.set_nodelay(true)?;
                    debug!(peer = addr, attempt, "connected");

                    return Ok(Connection {
                        stream,
                        peer: addr.to_string(),
                    });
                }
                Err(e) => {
                    warn!(peer = addr, attempt, max_attempts, error = %e, "connection attempt failed");
                    if attempt < max_attempts {
                        thread::sleep(policy.interval);
                    }
                }
            }
        }

        Err(LutPIRError::ConnectionFailed {
            addr: addr.to_string(),
            attempts: max_attempts,
        })
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Sends one request frame and blocks until its response arrives.
    pub fn request(&mut self, code: ControlCode, payload: &[u8]) -> Result<Vec<u8>, LutPIRError> {
        write_frame(&mut self.stream, code, payload)?;

        match read_frame(&mut self.stream)? {
            Some((ControlCode::Response, response)) => parse_response(response),
            Some((code, _)) => Err(LutPIRError::FailedToDeserialize(format!("expected a response frame, received {:?}", code))),
            None => Err(LutPIRError::Io(format!("'{}' closed the connection before responding", self.peer))),
        }
    }
}
