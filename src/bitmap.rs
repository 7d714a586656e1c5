#![allow(dead_code)]
use std::io::Read;


/// Lightweight block-allocation bitmap.
/// Bit order follows the on-disk convention: bit `i` lives at `1 << (i % 8)`
/// of byte `i / 8`; a set bit means the covered block is allocated.
#[derive(Clone, Debug)]
pub struct Bitmap(Vec<u8>);

impl Bitmap {
    pub fn from_bytes(bytes: &[u8]) -> Self
    {
        Self(bytes.to_vec())
    }

    pub fn from_reader<R: Read>(reader: &mut R, size: usize) -> Result<Self, std::io::Error>
    {
        let mut vec = vec![u8::default(); size];
        reader.read_exact(vec.as_mut_slice())?;

        Ok(Self(vec))
    }

    pub fn as_bytes(&self) -> &[u8]
    {
        &self.0
    }

    pub fn test(&self, idx: u64) -> bool
    {
        let byte = self.0[(idx / 8) as usize];

        (byte >> (idx % 8)) & 0x01 == 1
    }

    pub fn set(&mut self, idx: u64)
    {
        self.0[(idx / 8) as usize] |= 1 << (idx % 8);
    }

    pub fn clear(&mut self, idx: u64)
    {
        self.0[(idx / 8) as usize] &= !(1 << (idx % 8));
    }

    /// Counts the unset bits among the first `limit` bits.
    pub fn count_unset(&self, limit: u64) -> u64
    {
        let full_bytes = (limit / 8) as usize;
        let remainder = limit % 8;
        let mut unset = 0;

        for byte in &self.0[..full_bytes] {
            unset += byte.count_zeros() as u64;
        }

        if remainder > 0 {
            let byte = self.0[full_bytes];
            for bit in 0..remainder {
                if (byte >> bit) & 0x01 == 0 {
                    unset += 1;
                }
            }
        }

        unset
    }
}
