use crate::error::{DecodeError, Result};

/// Byte order of the encoded data.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Endian {
    Little,
    Big,
}

/// Bounds-checked reader over a byte slice.
///
/// `Copy` on purpose: decoders snapshot the cursor to peek ahead at record
/// boundaries without committing the position.
#[derive(Clone, Copy)]
pub struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
    endian: Endian,
}

impl<'a> Cursor<'a> {
    pub fn new(data: &'a [u8], endian: Endian) -> Self {
        Self {
            data,
            pos: 0,
            endian,
        }
    }

    pub fn endian(&self) -> Endian {
        self.endian
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    /// Moves to an absolute position. Positions past the end are allowed and
    /// simply make the cursor finished.
    pub fn set_position(&mut self, pos: usize) {
        self.pos = pos.min(self.data.len());
    }

    pub fn remaining(&self) -> &'a [u8] {
        &self.data[self.pos..]
    }

    pub fn is_finished(&self) -> bool {
        self.pos >= self.data.len()
    }

    pub fn advance(&mut self, amount: usize) -> Result<()> {
        if amount > self.data.len() - self.pos {
            return Err(DecodeError::TruncatedInput { offset: self.pos });
        }
        self.pos += amount;
        Ok(())
    }

    pub fn read_bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        if n > self.data.len() - self.pos {
            return Err(DecodeError::TruncatedInput { offset: self.pos });
        }
        let start = self.pos;
        self.pos += n;
        Ok(&self.data[start..self.pos])
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        if self.pos >= self.data.len() {
            return Err(DecodeError::TruncatedInput { offset: self.pos });
        }
        let value = self.data[self.pos];
        self.pos += 1;
        Ok(value)
    }

    pub fn read_i8(&mut self) -> Result<i8> {
        Ok(self.read_u8()? as i8)
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        Ok(self.read_uint(2)? as u16)
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        Ok(self.read_uint(4)? as u32)
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        self.read_uint(8)
    }

    /// Reads an unsigned integer of `size` bytes, at most eight.
    pub fn read_uint(&mut self, size: usize) -> Result<u64> {
        let bytes = self.read_bytes(size.min(8))?;
        let mut value = 0u64;
        match self.endian {
            Endian::Little => {
                for (i, byte) in bytes.iter().enumerate() {
                    value |= u64::from(*byte) << (8 * i);
                }
            }
            Endian::Big => {
                for byte in bytes {
                    value = value << 8 | u64::from(*byte);
                }
            }
        }
        Ok(value)
    }

    /// Reads a DWARF initial length: a u32, or a u64 after the 0xffffffff
    /// escape. Returns the length and whether the 64-bit format is in use.
    pub fn read_initial_length(&mut self) -> Result<(u64, bool)> {
        let length = self.read_u32()?;
        if length == 0xffff_ffff {
            Ok((self.read_u64()?, true))
        } else {
            Ok((u64::from(length), false))
        }
    }

    pub fn read_uleb128(&mut self) -> Result<u64> {
        let start = self.pos;
        let mut result = 0u64;
        let mut shift = 0u32;
        loop {
            let byte = self.read_u8()?;
            if shift < 64 {
                result |= u64::from(byte & 0x7f) << shift;
            }
            if byte & 0x80 == 0 {
                return Ok(result);
            }
            shift += 7;
            // ten bytes encode the full 64-bit range
            if shift >= 70 {
                return Err(DecodeError::MalformedVarint { offset: start });
            }
        }
    }

    pub fn read_sleb128(&mut self) -> Result<i64> {
        let start = self.pos;
        let mut result = 0i64;
        let mut shift = 0u32;
        loop {
            let byte = self.read_u8()?;
            if shift < 64 {
                result |= i64::from(byte & 0x7f) << shift;
            }
            shift += 7;
            if byte & 0x80 == 0 {
                if shift < 64 && byte & 0x40 != 0 {
                    result |= !0i64 << shift;
                }
                return Ok(result);
            }
            if shift >= 70 {
                return Err(DecodeError::MalformedVarint { offset: start });
            }
        }
    }

    /// Reads a null-terminated byte string, not including the terminator.
    pub fn read_cstr(&mut self) -> Result<&'a [u8]> {
        let start = self.pos;
        while self.pos < self.data.len() && self.data[self.pos] != 0 {
            self.pos += 1;
        }
        if self.pos >= self.data.len() {
            return Err(DecodeError::TruncatedInput { offset: start });
        }
        let end = self.pos;
        self.pos += 1; // skip null terminator
        Ok(&self.data[start..end])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uleb128_single_and_multi_byte() {
        let mut cursor = Cursor::new(&[0x7f, 0xe5, 0x8e, 0x26], Endian::Little);
        assert_eq!(cursor.read_uleb128().unwrap(), 127);
        assert_eq!(cursor.read_uleb128().unwrap(), 624485);
    }

    #[test]
    fn sleb128_negative() {
        let mut cursor = Cursor::new(&[0x7f, 0x9b, 0xf1, 0x59], Endian::Little);
        assert_eq!(cursor.read_sleb128().unwrap(), -1);
        assert_eq!(cursor.read_sleb128().unwrap(), -624485);
    }

    #[test]
    fn uleb128_never_terminating_is_rejected() {
        let bytes = [0x80u8; 16];
        let mut cursor = Cursor::new(&bytes, Endian::Little);
        assert_eq!(
            cursor.read_uleb128(),
            Err(DecodeError::MalformedVarint { offset: 0 })
        );
    }

    #[test]
    fn uint_respects_endianness() {
        let bytes = [0x12, 0x34, 0x56, 0x78];
        let mut le = Cursor::new(&bytes, Endian::Little);
        let mut be = Cursor::new(&bytes, Endian::Big);
        assert_eq!(le.read_u32().unwrap(), 0x78563412);
        assert_eq!(be.read_u32().unwrap(), 0x12345678);
    }

    #[test]
    fn initial_length_escape() {
        let mut bytes = vec![0xff, 0xff, 0xff, 0xff];
        bytes.extend(0x1122334455u64.to_le_bytes());
        let mut cursor = Cursor::new(&bytes, Endian::Little);
        assert_eq!(cursor.read_initial_length().unwrap(), (0x1122334455, true));

        let mut cursor = Cursor::new(&[0x10, 0x00, 0x00, 0x00], Endian::Little);
        assert_eq!(cursor.read_initial_length().unwrap(), (0x10, false));
    }

    #[test]
    fn cstr_requires_terminator() {
        let mut cursor = Cursor::new(b"abc\0def", Endian::Little);
        assert_eq!(cursor.read_cstr().unwrap(), b"abc");
        assert!(matches!(
            cursor.read_cstr(),
            Err(DecodeError::TruncatedInput { .. })
        ));
    }

    #[test]
    fn truncated_reads_report_offset() {
        let mut cursor = Cursor::new(&[0x01, 0x02], Endian::Little);
        cursor.read_u8().unwrap();
        assert_eq!(
            cursor.read_u32(),
            Err(DecodeError::TruncatedInput { offset: 1 })
        );
    }
}
