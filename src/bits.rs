use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum BitError {
    #[error("Read of {wanted} bits at bit {pos} overruns the {len} byte buffer")]
    Overrun { pos: usize, wanted: usize, len: usize },
    #[error("Varint at bit {0} is longer than 5 bytes")]
    VarintTooLong(usize),
}

/// LSB-first bit reader as used by Source 2 packet and string table data
pub struct BitReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> BitReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn bits_remaining(&self) -> usize {
        self.data.len() * 8 - self.pos
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    fn ensure(&self, wanted: usize) -> Result<(), BitError> {
        if wanted > self.bits_remaining() {
            return Err(BitError::Overrun {
                pos: self.pos,
                wanted,
                len: self.data.len(),
            });
        }
        Ok(())
    }

    /// reads up to 32 bits
    pub fn read_bits(&mut self, count: usize) -> Result<u32, BitError> {
        debug_assert!(count <= 32);
        self.ensure(count)?;
        let mut out = 0u32;
        let mut written = 0;
        while written < count {
            let byte = self.data[self.pos / 8];
            let bit_off = self.pos % 8;
            let take = (8 - bit_off).min(count - written);
            let chunk = (byte as u32 >> bit_off) & ((1u32 << take) - 1);
            out |= chunk << written;
            written += take;
            self.pos += take;
        }
        Ok(out)
    }

    pub fn read_bit(&mut self) -> Result<bool, BitError> {
        Ok(self.read_bits(1)? == 1)
    }

    pub fn read_byte(&mut self) -> Result<u8, BitError> {
        Ok(self.read_bits(8)? as u8)
    }

    /// Source 2 `UBitVar`: 6 bit prefix, the top two bits select how many more bits follow
    pub fn read_ubitvar(&mut self) -> Result<u32, BitError> {
        let ret = self.read_bits(6)?;
        Ok(match ret & 0x30 {
            0x10 => (ret & 15) | (self.read_bits(4)? << 4),
            0x20 => (ret & 15) | (self.read_bits(8)? << 4),
            0x30 => (ret & 15) | (self.read_bits(28)? << 4),
            _ => ret,
        })
    }

    pub fn read_varint32(&mut self) -> Result<u32, BitError> {
        let start = self.pos;
        let mut result = 0u32;
        for shift in (0..35).step_by(7) {
            let byte = self.read_byte()?;
            result |= ((byte & 0x7F) as u32) << shift;
            if byte & 0x80 == 0 {
                return Ok(result);
            }
        }
        Err(BitError::VarintTooLong(start))
    }

    pub fn read_bytes(&mut self, count: usize) -> Result<Vec<u8>, BitError> {
        self.ensure(count * 8)?;
        if self.pos % 8 == 0 {
            let start = self.pos / 8;
            self.pos += count * 8;
            return Ok(self.data[start..start + count].to_vec());
        }
        (0..count).map(|_| self.read_byte()).collect()
    }

    /// reads `bit_count` bits into bytes, the last byte holds the remaining low bits
    pub fn read_bits_as_bytes(&mut self, bit_count: usize) -> Result<Vec<u8>, BitError> {
        let mut out = self.read_bytes(bit_count / 8)?;
        let rem = bit_count % 8;
        if rem != 0 {
            out.push(self.read_bits(rem)? as u8);
        }
        Ok(out)
    }

    /// null terminated, the terminator is consumed but not returned
    pub fn read_string(&mut self) -> Result<Vec<u8>, BitError> {
        let mut out = Vec::new();
        loop {
            let b = self.read_byte()?;
            if b == 0 {
                return Ok(out);
            }
            out.push(b);
        }
    }
}
