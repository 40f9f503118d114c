//! Dense memory packing shared by blackboard values and behavior tree node memory.
//!
//! Slots are sorted by size (largest first) and laid out back to back. Sizes of 1–2 bytes are
//! kept as-is, everything else is rounded up to a multiple of 4, so every slot of 4+ bytes starts
//! on a 4-byte boundary.

/// Rounds a declared slot size the way the packer stores it.
pub fn aligned_size(size: usize) -> usize {
    if size <= 2 {
        size
    } else {
        (size + 3) & !3
    }
}

/// Result of [`pack`]: one offset per input slot (in input order) and the total buffer size.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PackedLayout {
    pub offsets: Vec<usize>,
    pub sizes: Vec<usize>,
    pub total: usize,
}

impl PackedLayout {
    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    /// Byte range of slot `index` inside the packed buffer.
    pub fn range(&self, index: usize) -> Option<std::ops::Range<usize>> {
        let offset = *self.offsets.get(index)?;
        let size = *self.sizes.get(index)?;
        Some(offset..offset + size)
    }
}

/// Packs `sizes` into one buffer. Ties keep input order.
pub fn pack(sizes: &[usize]) -> PackedLayout {
    let mut order: Vec<usize> = (0..sizes.len()).collect();
    order.sort_by(|&a, &b| aligned_size(sizes[b]).cmp(&aligned_size(sizes[a])));

    let mut offsets = vec![0; sizes.len()];
    let mut aligned = vec![0; sizes.len()];
    let mut cursor = 0usize;
    for index in order {
        let size = aligned_size(sizes[index]);
        offsets[index] = cursor;
        aligned[index] = size;
        cursor += size;
    }

    PackedLayout {
        offsets,
        sizes: aligned,
        total: cursor,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_slots_are_not_padded() {
        assert_eq!(aligned_size(0), 0);
        assert_eq!(aligned_size(1), 1);
        assert_eq!(aligned_size(2), 2);
        assert_eq!(aligned_size(3), 4);
        assert_eq!(aligned_size(12), 12);
        assert_eq!(aligned_size(13), 16);
    }

    #[test]
    fn larger_slots_come_first() {
        let layout = pack(&[1, 12, 4, 2]);
        assert_eq!(layout.offsets, vec![18, 0, 12, 16]);
        assert_eq!(layout.total, 19);
    }
}
