//! Sequential reader over a frame payload.

/// Cursor over a payload with an internal read offset.
///
/// Every read returns `None` instead of panicking when it would run past the
/// end of the payload; a failed read does not move the offset.
#[derive(Debug, Clone)]
pub struct Payload<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> Payload<'a> {
    /// Wrap `data` with the offset at 0.
    pub fn new(data: &'a [u8]) -> Self {
        Payload { data, offset: 0 }
    }

    /// Current read offset.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Bytes left to read.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.offset
    }

    /// Take the next `n` bytes.
    pub fn read_bytes(&mut self, n: usize) -> Option<&'a [u8]> {
        let end = self.offset.checked_add(n)?;
        let bytes = self.data.get(self.offset..end)?;
        self.offset = end;
        Some(bytes)
    }

    /// Next byte.
    pub fn read_u8(&mut self) -> Option<u8> {
        self.read_bytes(1).map(|b| b[0])
    }

    /// Little-endian u16.
    pub fn read_u16(&mut self) -> Option<u16> {
        self.read_bytes(2).map(|b| u16::from_le_bytes([b[0], b[1]]))
    }

    /// Little-endian u32, low half first.
    pub fn read_u32(&mut self) -> Option<u32> {
        if self.remaining() < 4 {
            return None;
        }
        let low = self.read_u16()? as u32;
        let high = self.read_u16()? as u32;
        Some(low | high << 16)
    }

    /// Read a string of `n` bytes, or a length-prefixed string when `n` is 0.
    ///
    /// Invalid UTF-8 is replaced rather than rejected.
    pub fn read_string(&mut self, n: usize) -> Option<String> {
        let start = self.offset;
        let n = match n {
            0 => self.read_u8()? as usize,
            n => n,
        };
        match self.read_bytes(n) {
            Some(bytes) => Some(String::from_utf8_lossy(bytes).into_owned()),
            None => {
                self.offset = start;
                None
            }
        }
    }
}
