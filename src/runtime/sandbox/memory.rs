//! Simulated linear memory.
//!
//! Allocations are disjoint blocks addressed by their base pointer. Address 0
//! is never handed out, so it can stand for "null" on every export.

use crate::runtime::error::{Result, RuntimeError};
use std::collections::BTreeMap;

const BASE_ADDRESS: u32 = 16;
const ALIGN: u32 = 8;

#[derive(Debug)]
pub(crate) struct LinearMemory {
    blocks: BTreeMap<u32, Vec<u8>>,
    next: u32,
    used: usize,
    limit: Option<usize>,
}

impl Default for LinearMemory {
    fn default() -> Self {
        Self {
            blocks: BTreeMap::new(),
            next: BASE_ADDRESS,
            used: 0,
            limit: None,
        }
    }
}

impl LinearMemory {
    pub(crate) fn set_limit(&mut self, limit: Option<usize>) {
        self.limit = limit;
    }

    pub(crate) fn used(&self) -> usize {
        self.used
    }

    /// Returns 0 past the memory limit or when the address space is exhausted.
    pub(crate) fn allocate(&mut self, size: u32) -> u32 {
        let size_bytes = size as usize;
        if let Some(limit) = self.limit {
            if self.used + size_bytes > limit {
                tracing::trace!(size, used = self.used, limit, "sandbox allocation refused");
                return 0;
            }
        }
        let span = size.max(1).div_ceil(ALIGN).saturating_mul(ALIGN);
        let Some(end) = self.next.checked_add(span) else {
            return 0;
        };
        let ptr = self.next;
        self.next = end;
        self.blocks.insert(ptr, vec![0; size_bytes]);
        self.used += size_bytes;
        ptr
    }

    pub(crate) fn free(&mut self, ptr: u32) {
        match self.blocks.remove(&ptr) {
            Some(block) => self.used -= block.len(),
            None => tracing::warn!(ptr, "sandbox free of unknown pointer"),
        }
    }

    /// The block containing `ptr` and the offset of `ptr` inside it.
    fn locate(&self, ptr: u32) -> Option<(u32, usize)> {
        let (base, block) = self.blocks.range(..=ptr).next_back()?;
        let offset = (ptr - base) as usize;
        (offset <= block.len()).then_some((*base, offset))
    }

    pub(crate) fn read(&self, ptr: u32, len: u32) -> Result<Vec<u8>> {
        let out_of_bounds = || RuntimeError::foreign("read_bytes", format!("{len} bytes at {ptr:#x} out of bounds"));
        let (base, offset) = self.locate(ptr).ok_or_else(out_of_bounds)?;
        let block = &self.blocks[&base];
        let end = offset + len as usize;
        block
            .get(offset..end)
            .map(<[u8]>::to_vec)
            .ok_or_else(out_of_bounds)
    }

    pub(crate) fn write(&mut self, ptr: u32, bytes: &[u8]) -> Result<()> {
        let out_of_bounds = || {
            RuntimeError::foreign(
                "write_bytes",
                format!("{} bytes at {:#x} out of bounds", bytes.len(), ptr),
            )
        };
        let (base, offset) = self.locate(ptr).ok_or_else(out_of_bounds)?;
        let block = self.blocks.get_mut(&base).ok_or_else(out_of_bounds)?;
        let target = block
            .get_mut(offset..offset + bytes.len())
            .ok_or_else(out_of_bounds)?;
        target.copy_from_slice(bytes);
        Ok(())
    }

    pub(crate) fn read_cstring(&self, ptr: u32) -> Result<String> {
        let (base, offset) = self
            .locate(ptr)
            .ok_or_else(|| RuntimeError::foreign("read_cstring", format!("{ptr:#x} out of bounds")))?;
        let tail = &self.blocks[&base][offset..];
        let nul = tail
            .iter()
            .position(|b| *b == 0)
            .ok_or_else(|| RuntimeError::foreign("read_cstring", "missing NUL terminator"))?;
        String::from_utf8(tail[..nul].to_vec())
            .map_err(|e| RuntimeError::foreign("read_cstring", e.to_string()))
    }

    pub(crate) fn read_u32(&self, ptr: u32) -> Result<u32> {
        let bytes = self.read(ptr, 4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub(crate) fn write_u32(&mut self, ptr: u32, value: u32) -> Result<()> {
        self.write(ptr, &value.to_le_bytes())
    }

    pub(crate) fn read_ptrs(&self, ptr: u32, count: u32) -> Result<Vec<u32>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let bytes = self.read(ptr, count * 4)?;
        Ok(bytes
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect())
    }

    /// Allocate and fill a little-endian `u32` table. Returns 0 on allocation
    /// failure.
    pub(crate) fn write_table(&mut self, words: &[u32]) -> Result<u32> {
        let ptr = self.allocate((words.len() * 4).max(4) as u32);
        if ptr == 0 {
            return Ok(0);
        }
        let bytes: Vec<u8> = words.iter().flat_map(|w| w.to_le_bytes()).collect();
        self.write(ptr, &bytes)?;
        Ok(ptr)
    }

    pub(crate) fn write_cstring(&mut self, s: &str) -> Result<u32> {
        let ptr = self.allocate(s.len() as u32 + 1);
        if ptr == 0 {
            return Ok(0);
        }
        let mut bytes = Vec::with_capacity(s.len() + 1);
        bytes.extend_from_slice(s.as_bytes());
        bytes.push(0);
        self.write(ptr, &bytes)?;
        Ok(ptr)
    }

    pub(crate) fn clear(&mut self) {
        self.blocks.clear();
        self.used = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blocks_are_disjoint_and_bounded() {
        let mut memory = LinearMemory::default();
        let a = memory.allocate(4);
        let b = memory.allocate(4);
        assert_ne!(a, 0);
        assert!(b >= a + 4);

        memory.write_u32(a, 7).unwrap();
        memory.write_u32(b, 9).unwrap();
        assert_eq!(memory.read_u32(a).unwrap(), 7);
        assert!(memory.write(a + 2, &[0; 4]).is_err());
        assert!(memory.read(0, 1).is_err());
    }

    #[test]
    fn test_limit_refuses_allocation() {
        let mut memory = LinearMemory::default();
        memory.set_limit(Some(16));
        let a = memory.allocate(12);
        assert_ne!(a, 0);
        assert_eq!(memory.allocate(8), 0);
        memory.free(a);
        assert_eq!(memory.used(), 0);
        assert_ne!(memory.allocate(8), 0);
    }

    #[test]
    fn test_cstring_round_trip() {
        let mut memory = LinearMemory::default();
        let ptr = memory.write_cstring("naïve").unwrap();
        assert_eq!(memory.read_cstring(ptr).unwrap(), "naïve");
    }
}
