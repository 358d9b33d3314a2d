use crate::{branch_opt_util, error::LutPIRError};

/// Appends little-endian encoded fields to a growing byte buffer.
///
/// Variable length fields (byte strings, integer vectors) are prefixed with their element count as a `u32`.
#[derive(Default)]
pub struct ByteWriter {
    bytes: Vec<u8>,
}

impl ByteWriter {
    pub fn new() -> ByteWriter {
        ByteWriter::default()
    }

    pub fn with_capacity(capacity: usize) -> ByteWriter {
        ByteWriter {
            bytes: Vec::with_capacity(capacity),
        }
    }

    pub fn put_u8(&mut self, v: u8) -> &mut Self {
        self.bytes.push(v);
        self
    }

    pub fn put_u32(&mut self, v: u32) -> &mut Self {
        self.bytes.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn put_u64(&mut self, v: u64) -> &mut Self {
        self.bytes.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn put_fixed(&mut self, v: &[u8]) -> &mut Self {
        self.bytes.extend_from_slice(v);
        self
    }

    pub fn put_bytes(&mut self, v: &[u8]) -> &mut Self {
        self.put_u32(v.len() as u32);
        self.bytes.extend_from_slice(v);
        self
    }

    pub fn put_u64_slice(&mut self, v: &[u64]) -> &mut Self {
        self.put_u32(v.len() as u32);
        v.iter().for_each(|&elem| {
            self.bytes.extend_from_slice(&elem.to_le_bytes());
        });
        self
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

/// Number of bytes `ByteWriter::put_bytes` emits for a byte string of given length.
#[inline(always)]
pub const fn prefixed_len(num_bytes: usize) -> usize {
    std::mem::size_of::<u32>() + num_bytes
}

/// Reads back fields written by a `ByteWriter`, failing on truncated input instead of panicking.
pub struct ByteReader<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(bytes: &'a [u8]) -> ByteReader<'a> {
        ByteReader { bytes, offset: 0 }
    }

    fn take(&mut self, num_bytes: usize) -> Result<&'a [u8], LutPIRError> {
        let remaining = self.bytes.len() - self.offset;
        if branch_opt_util::unlikely(num_bytes > remaining) {
            return Err(LutPIRError::FailedToDeserialize(format!(
                "needed {} bytes at offset {}, only {} remain",
                num_bytes, self.offset, remaining
            )));
        }

        let taken = &self.bytes[self.offset..self.offset + num_bytes];
        self.offset += num_bytes;

        Ok(taken)
    }

    pub fn get_u8(&mut self) -> Result<u8, LutPIRError> {
        Ok(self.take(1)?[0])
    }

    pub fn get_u32(&mut self) -> Result<u32, LutPIRError> {
        let mut word = [0u8; 4];
        let n = word.len();
        word.copy_from_slice(self.take(n)?);
        Ok(u32::from_le_bytes(word))
    }

    pub fn get_u64(&mut self) -> Result<u64, LutPIRError> {
        let mut word = [0u8; 8];
        let n = word.len();
        word.copy_from_slice(self.take(n)?);
        Ok(u64::from_le_bytes(word))
    }

    pub fn get_fixed<const N: usize>(&mut self) -> Result<[u8; N], LutPIRError> {
        let mut arr = [0u8; N];
        arr.copy_from_slice(self.take(N)?);
        Ok(arr)
    }

    pub fn get_bytes(&mut self) -> Result<Vec<u8>, LutPIRError> {
        let len = self.get_u32()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    pub fn get_u64_vec(&mut self) -> Result<Vec<u64>, LutPIRError> {
        let len = self.get_u32()? as usize;
        let raw = self.take(len * std::mem::size_of::<u64>())?;

        Ok(raw
            .chunks_exact(std::mem::size_of::<u64>())
            .map(|chunk| {
                let mut word = [0u8; 8];
                word.copy_from_slice(chunk);
                u64::from_le_bytes(word)
            })
            .collect())
    }

    /// Fails if any byte was left unread, so trailing garbage is never silently accepted.
    pub fn finish(self) -> Result<(), LutPIRError> {
        if branch_opt_util::likely(self.offset == self.bytes.len()) {
            Ok(())
        } else {
            Err(LutPIRError::FailedToDeserialize(format!("{} trailing bytes", self.bytes.len() - self.offset)))
        }
    }
}
