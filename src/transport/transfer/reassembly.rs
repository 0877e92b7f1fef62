//! Ordered reassembly of transfer chunks.

use std::collections::BTreeMap;

use bytes::{Bytes, BytesMut};

/// Chunks of one payload ordered by offset.
#[derive(Debug, Default)]
pub(crate) struct Reassembly {
    chunks: BTreeMap<u32, Bytes>,
    total_length: Option<u32>,
    transferred: u64,
}

impl Reassembly {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a chunk, returns false if it was ignored.
    ///
    /// Chunks overlapping any held chunk, out of bounds, or disagreeing on
    /// the total length are ignored.
    pub fn add(&mut self, start: u32, data: Bytes, total_length: u32) -> bool {
        if *self.total_length.get_or_insert(total_length) != total_length {
            return false;
        }

        let Ok(length) = u32::try_from(data.len()) else {
            return false;
        };
        let Some(end) = start.checked_add(length) else {
            return false;
        };
        if end > total_length || (length == 0 && total_length != 0) {
            return false;
        }

        if self.chunks.contains_key(&start) {
            return false;
        }

        // Only the closest chunk on each side can overlap, since held chunks never overlap.
        if let Some((&before, chunk)) = self.chunks.range(..start).next_back() {
            if before as u64 + chunk.len() as u64 > start as u64 {
                return false;
            }
        }
        if let Some((&after, _)) = self.chunks.range(start..).next() {
            if after < end {
                return false;
            }
        }

        self.transferred += length as u64;
        self.chunks.insert(start, data);

        true
    }

    pub fn total_length(&self) -> Option<u32> {
        self.total_length
    }

    /// Bytes received so far, duplicates not included.
    pub fn transferred(&self) -> u64 {
        self.transferred
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn completeness(&self) -> u8 {
        match self.total_length {
            Some(0) => 100,
            Some(total) => (self.transferred * 100 / total as u64) as u8,
            None => 0,
        }
    }

    /// End of the unbroken run of chunks from offset 0.
    pub fn contiguous_end(&self) -> u32 {
        let mut position = 0;

        for (&start, chunk) in &self.chunks {
            if start != position {
                break;
            }
            position += chunk.len() as u32;
        }

        position
    }

    pub fn is_complete(&self) -> bool {
        !self.chunks.is_empty() && Some(self.contiguous_end()) == self.total_length
    }

    /// Missing ranges as `(start, length)`, lowest offset first.
    pub fn gaps(&self) -> Vec<(u32, u32)> {
        let Some(total_length) = self.total_length else {
            return vec![];
        };

        let mut gaps = vec![];
        let mut position = 0;

        for (&start, chunk) in &self.chunks {
            if start != position {
                gaps.push((position, start - position));
            }
            position = start + chunk.len() as u32;
        }

        if position != total_length {
            gaps.push((position, total_length - position));
        }

        gaps
    }

    /// The complete payload, if every chunk arrived.
    pub fn assemble(&self) -> Option<Bytes> {
        if !self.is_complete() {
            return None;
        }

        if self.chunks.len() == 1 {
            return self.chunks.values().next().cloned();
        }

        let mut payload = BytesMut::with_capacity(self.total_length? as usize);
        for chunk in self.chunks.values() {
            payload.extend_from_slice(chunk);
        }

        Some(payload.freeze())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn chunk(start: u8, len: u8) -> Bytes {
        Bytes::from((start..start + len).collect::<Vec<u8>>())
    }

    #[test]
    fn out_of_order_chunks() {
        let mut reassembly = Reassembly::new();

        assert!(reassembly.add(6, chunk(6, 4), 10));
        assert!(!reassembly.is_complete());
        assert_eq!(reassembly.contiguous_end(), 0);

        assert!(reassembly.add(0, chunk(0, 3), 10));
        assert_eq!(reassembly.contiguous_end(), 3);
        assert_eq!(reassembly.gaps(), vec![(3, 3)]);

        assert!(reassembly.add(3, chunk(3, 3), 10));
        assert!(reassembly.is_complete());
        assert_eq!(reassembly.assemble(), Some(chunk(0, 10)));
    }

    #[test]
    fn duplicate_chunk_is_idempotent() {
        let mut reassembly = Reassembly::new();

        assert!(reassembly.add(0, chunk(0, 5), 10));
        assert!(!reassembly.add(0, chunk(0, 5), 10));
        assert_eq!(reassembly.transferred(), 5);
        assert_eq!(reassembly.completeness(), 50);

        assert!(reassembly.add(5, chunk(5, 5), 10));
        assert_eq!(reassembly.transferred(), 10);
        assert_eq!(reassembly.assemble(), Some(chunk(0, 10)));
    }

    #[test]
    fn overlapping_chunks_ignored() {
        let mut reassembly = Reassembly::new();

        assert!(reassembly.add(4, chunk(4, 4), 20));
        assert!(!reassembly.add(2, chunk(2, 4), 20));
        assert!(!reassembly.add(6, chunk(6, 4), 20));
        assert!(!reassembly.add(18, chunk(18, 4), 20), "out of bounds");
        assert!(!reassembly.add(10, chunk(10, 2), 30), "different total length");

        assert_eq!(reassembly.transferred(), 4);
        assert_eq!(reassembly.gaps(), vec![(0, 4), (8, 12)]);
    }

    #[test]
    fn gaps_lowest_offset_first() {
        let mut reassembly = Reassembly::new();

        reassembly.add(2, chunk(2, 2), 10);
        reassembly.add(6, chunk(6, 2), 10);

        assert_eq!(reassembly.gaps(), vec![(0, 2), (4, 2), (8, 2)]);
    }

    #[test]
    fn empty_payload() {
        let mut reassembly = Reassembly::new();

        assert!(reassembly.add(0, Bytes::new(), 0));
        assert!(reassembly.is_complete());
        assert_eq!(reassembly.completeness(), 100);
        assert_eq!(reassembly.assemble(), Some(Bytes::new()));
        assert!(!reassembly.add(0, Bytes::new(), 0));
    }
}
