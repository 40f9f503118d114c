use std::mem::size_of;
use std::ops::Range;

use bytemuck::Pod;

use crate::error::MemoryError;

/// Engine-owned bytes at the start of a composite's slot (current child).
pub(crate) const COMPOSITE_HEADER: usize = 4;
/// Engine-owned bytes at the start of a service's slot (time left, time accumulated).
pub(crate) const SERVICE_HEADER: usize = 8;
/// Per-component object index (plus one) of an instanced node.
pub(crate) const INSTANCED_RECORD: usize = 4;

pub(crate) const CHILD_NOT_INITIALIZED: i32 = -1;

/// Where a node's state lives inside an instance's memory buffer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemorySlot {
    pub offset: usize,
    /// Packed (aligned) size of the whole slot.
    pub size: usize,
    /// Engine-owned header bytes, including the instanced record.
    pub header: usize,
    /// Bytes declared by the node behavior.
    pub user: usize,
}

impl MemorySlot {
    pub fn range(&self) -> Range<usize> {
        self.offset..self.offset + self.size
    }

    pub fn user_range(&self) -> Range<usize> {
        let start = self.offset + self.header;
        start..start + self.user
    }

    pub(crate) fn instanced_record_offset(&self) -> usize {
        self.header - INSTANCED_RECORD
    }
}

/// Zero-initialized per-instance byte buffer holding every node's mutable state.
#[derive(Debug, Clone, Default)]
pub struct InstanceMemory {
    bytes: Vec<u8>,
}

impl InstanceMemory {
    pub fn new(size: usize) -> Self {
        Self {
            bytes: vec![0; size],
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn slot(&self, slot: &MemorySlot) -> Result<&[u8], MemoryError> {
        self.bytes
            .get(slot.range())
            .ok_or(MemoryError::OutOfBounds {
                offset: slot.offset,
                len: slot.size,
                slot: self.bytes.len(),
            })
    }

    pub(crate) fn user_region_mut(&mut self, slot: &MemorySlot) -> &mut [u8] {
        match self.bytes.get_mut(slot.user_range()) {
            Some(region) => region,
            None => {
                tracing::error!(offset = slot.offset, size = slot.size, "node slot outside instance memory");
                Default::default()
            }
        }
    }

    /// Reads a header value at `offset` bytes into the slot.
    pub(crate) fn read<T: Pod>(&self, slot: &MemorySlot, offset: usize) -> Result<T, MemoryError> {
        let range = self.checked(slot, offset, size_of::<T>())?;
        Ok(bytemuck::pod_read_unaligned(&self.bytes[range]))
    }

    pub(crate) fn write<T: Pod>(
        &mut self,
        slot: &MemorySlot,
        offset: usize,
        value: T,
    ) -> Result<(), MemoryError> {
        let range = self.checked(slot, offset, size_of::<T>())?;
        self.bytes[range].copy_from_slice(bytemuck::bytes_of(&value));
        Ok(())
    }

    fn checked(&self, slot: &MemorySlot, offset: usize, len: usize) -> Result<Range<usize>, MemoryError> {
        let start = slot.offset + offset;
        if offset + len > slot.size || start + len > self.bytes.len() {
            return Err(MemoryError::OutOfBounds {
                offset,
                len,
                slot: slot.size,
            });
        }
        Ok(start..start + len)
    }
}
