use crate::error::DecodeError;

/// Bounds-checked reader over `buf[pos..end]`.
///
/// Positions are always absolute indices into `buf`, so offsets reported to
/// a sink stay meaningful after taking a [`sub_cursor`](Self::sub_cursor).
#[derive(Debug, Clone)]
pub struct ByteCursor<'a> {
    buf: &'a [u8],
    pos: usize,
    end: usize,
}

impl<'a> ByteCursor<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self {
            buf,
            pos: 0,
            end: buf.len(),
        }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn end(&self) -> usize {
        self.end
    }

    pub fn remaining(&self) -> usize {
        self.end - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.pos >= self.end
    }

    /// A cursor over the next `len` bytes, clipped to this cursor's end.
    pub fn sub_cursor(&self, len: usize) -> ByteCursor<'a> {
        ByteCursor {
            buf: self.buf,
            pos: self.pos,
            end: self.pos.saturating_add(len).min(self.end),
        }
    }

    /// Like [`sub_cursor`](Self::sub_cursor) but also shrinks the end by `trailer` bytes.
    pub fn without_trailer(&self, trailer: usize) -> ByteCursor<'a> {
        self.sub_cursor(self.remaining().saturating_sub(trailer))
    }

    fn check(&self, needed: usize) -> Result<(), DecodeError> {
        if needed > self.remaining() {
            return Err(DecodeError::Truncated {
                offset: self.pos,
                needed,
                available: self.remaining(),
            });
        }
        Ok(())
    }

    pub fn advance(&mut self, n: usize) -> Result<(), DecodeError> {
        self.check(n)?;
        self.pos += n;
        Ok(())
    }

    /// Advance by up to `n` bytes; returns how many were actually skipped.
    pub fn advance_clamped(&mut self, n: usize) -> usize {
        let step = n.min(self.remaining());
        self.pos += step;
        step
    }

    pub fn read_bytes(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        self.check(n)?;
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        let bytes = self.read_bytes(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(bytes);
        Ok(out)
    }

    /// Everything up to the end; never fails.
    pub fn rest(&mut self) -> &'a [u8] {
        let out = &self.buf[self.pos..self.end];
        self.pos = self.end;
        out
    }

    pub fn read_u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.read_array::<1>()?[0])
    }

    pub fn read_u16_le(&mut self) -> Result<u16, DecodeError> {
        Ok(u16::from_le_bytes(self.read_array()?))
    }

    pub fn read_i32_le(&mut self) -> Result<i32, DecodeError> {
        Ok(i32::from_le_bytes(self.read_array()?))
    }

    pub fn read_u32_le(&mut self) -> Result<u32, DecodeError> {
        Ok(u32::from_le_bytes(self.read_array()?))
    }

    pub fn read_u32_be(&mut self) -> Result<u32, DecodeError> {
        Ok(u32::from_be_bytes(self.read_array()?))
    }

    pub fn read_u24_be(&mut self) -> Result<u32, DecodeError> {
        let [a, b, c] = self.read_array::<3>()?;
        Ok(u32::from_be_bytes([0, a, b, c]))
    }

    pub fn read_i64_le(&mut self) -> Result<i64, DecodeError> {
        Ok(i64::from_le_bytes(self.read_array()?))
    }

    pub fn read_u64_le(&mut self) -> Result<u64, DecodeError> {
        Ok(u64::from_le_bytes(self.read_array()?))
    }

    pub fn read_f64_le(&mut self) -> Result<f64, DecodeError> {
        Ok(f64::from_le_bytes(self.read_array()?))
    }

    pub fn peek_i32_le(&self) -> Result<i32, DecodeError> {
        self.clone().read_i32_le()
    }

    /// NUL-terminated string; returns the bytes without the terminator and
    /// leaves the cursor just past it.
    pub fn read_cstring(&mut self) -> Result<&'a [u8], DecodeError> {
        let window = &self.buf[self.pos..self.end];
        let Some(nul) = window.iter().position(|&b| b == 0) else {
            return Err(DecodeError::UnterminatedString { offset: self.pos });
        };
        let out = &window[..nul];
        self.pos += nul + 1;
        Ok(out)
    }

    /// BSON `string`: i32 length (including the NUL) followed by that many bytes.
    /// Returns the declared length and the raw bytes, terminator included.
    pub fn read_length_prefixed(&mut self) -> Result<(i32, &'a [u8]), DecodeError> {
        let offset = self.pos;
        let len = self.read_i32_le()?;
        if len < 0 {
            self.pos = offset;
            return Err(DecodeError::NegativeLength {
                offset,
                length: len,
            });
        }
        let bytes = self.read_bytes(len as usize)?;
        Ok((len, bytes))
    }
}
