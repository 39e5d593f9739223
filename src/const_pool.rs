//! A deduplicating constant pool.

use crate::buffer::CodeOffset;
use rustc_hash::FxHashMap;

/// A pool of constants to be embedded behind a label.
///
/// Equal byte strings share one slot. Each entry is aligned to its own size
/// rounded up to a power of two (capped at 16), and the pool's overall
/// alignment is the largest entry alignment seen, so a pool can be embedded
/// with `embed_const_pool` and addressed with label-relative loads.
#[derive(Debug, Default)]
pub struct ConstPool {
    data: Vec<u8>,
    alignment: u32,
    dedup: FxHashMap<Vec<u8>, CodeOffset>,
}

impl ConstPool {
    pub fn new() -> Self {
        Self { data: Vec::new(), alignment: 1, dedup: FxHashMap::default() }
    }

    /// Insert `bytes` and return their offset from the pool start; a
    /// previously-inserted equal constant shares its offset.
    pub fn add(&mut self, bytes: &[u8]) -> CodeOffset {
        if let Some(&offset) = self.dedup.get(bytes) {
            return offset;
        }
        let align = bytes.len().next_power_of_two().min(16) as u32;
        self.alignment = self.alignment.max(align);
        let misalign = self.data.len() % align as usize;
        if misalign != 0 {
            self.data.resize(self.data.len() + align as usize - misalign, 0);
        }
        let offset = u32::try_from(self.data.len()).unwrap();
        self.data.extend_from_slice(bytes);
        self.dedup.insert(bytes.to_vec(), offset);
        offset
    }

    pub fn add_u32(&mut self, v: u32) -> CodeOffset {
        self.add(&v.to_le_bytes())
    }

    pub fn add_u64(&mut self, v: u64) -> CodeOffset {
        self.add(&v.to_le_bytes())
    }

    pub fn alignment(&self) -> u32 {
        self.alignment
    }

    pub fn len(&self) -> CodeOffset {
        u32::try_from(self.data.len()).unwrap()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedup_and_alignment() {
        let mut pool = ConstPool::new();
        let a = pool.add(&[1]);
        let b = pool.add(&0x1122_3344u32.to_le_bytes());
        let c = pool.add(&0x1122_3344u32.to_le_bytes());
        assert_eq!(a, 0);
        assert_eq!(b, 4, "u32 entry is 4-aligned past the single byte");
        assert_eq!(b, c);
        assert_eq!(pool.alignment(), 4);
        assert_eq!(pool.len(), 8);
    }

    #[test]
    fn empty() {
        let pool = ConstPool::new();
        assert!(pool.is_empty());
        assert_eq!(pool.alignment(), 1);
    }
}
