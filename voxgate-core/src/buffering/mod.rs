//! Bounded onset buffer for the VAD.
//!
//! `PreBuffer` keeps the most recent raw PCM bytes regardless of speech
//! state so the audio leading up to a confirmed speech onset can be copied
//! into the utterance. Backed by `ringbuf::HeapRb<u8>`: one allocation at
//! session start, oldest bytes evicted first.

pub mod chunk;

use ringbuf::{
    traits::{Consumer, Observer, RingBuffer},
    HeapRb,
};

/// Default capacity: 1 s of PCM16 mono at 16 kHz.
pub const PRE_BUFFER_CAPACITY: usize = 32_000;

pub struct PreBuffer {
    rb: HeapRb<u8>,
}

impl PreBuffer {
    /// `capacity` is rounded up to an even byte count so samples never split.
    pub fn new(capacity: usize) -> Self {
        let capacity = (capacity.max(2) + 1) & !1;
        Self {
            rb: HeapRb::new(capacity),
        }
    }

    /// Append bytes, evicting the oldest ones beyond capacity.
    pub fn push(&mut self, bytes: &[u8]) {
        let capacity = self.capacity();
        if bytes.len() >= capacity {
            self.rb.clear();
            self.rb.push_slice_overwrite(&bytes[bytes.len() - capacity..]);
        } else {
            self.rb.push_slice_overwrite(bytes);
        }
    }

    pub fn len(&self) -> usize {
        self.rb.occupied_len()
    }

    pub fn is_empty(&self) -> bool {
        self.rb.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.rb.capacity().get()
    }

    /// Copy of the most recent `n` bytes, or `None` if fewer are held.
    pub fn tail(&self, n: usize) -> Option<Vec<u8>> {
        let len = self.len();
        if n > len {
            return None;
        }
        Some(self.rb.iter().skip(len - n).copied().collect())
    }

    /// Copy of everything held, oldest first.
    pub fn to_vec(&self) -> Vec<u8> {
        let (head, tail) = self.rb.as_slices();
        let mut out = Vec::with_capacity(head.len() + tail.len());
        out.extend_from_slice(head);
        out.extend_from_slice(tail);
        out
    }

    pub fn clear(&mut self) {
        self.rb.clear();
    }
}

impl std::fmt::Debug for PreBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PreBuffer")
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_is_even() {
        assert_eq!(PreBuffer::new(1_001).capacity(), 1_002);
        assert_eq!(PreBuffer::new(PRE_BUFFER_CAPACITY).capacity(), 32_000);
    }

    #[test]
    fn evicts_oldest_bytes_first() {
        let mut pb = PreBuffer::new(8);
        pb.push(&[1, 2, 3, 4, 5, 6]);
        pb.push(&[7, 8, 9, 10]);
        assert_eq!(pb.len(), 8);
        assert_eq!(pb.to_vec(), vec![3, 4, 5, 6, 7, 8, 9, 10]);
    }

    #[test]
    fn oversized_push_keeps_newest_suffix() {
        let mut pb = PreBuffer::new(4);
        pb.push(&[1, 2]);
        pb.push(&[10, 11, 12, 13, 14, 15, 16]);
        assert_eq!(pb.to_vec(), vec![13, 14, 15, 16]);
    }

    #[test]
    fn never_exceeds_capacity_for_mixed_chunk_sizes() {
        let mut pb = PreBuffer::new(1_000);
        let mut counter = 0u8;
        for size in [1usize, 7, 333, 999, 1_000, 4_096, 2, 640, 1_500] {
            let chunk: Vec<u8> = (0..size)
                .map(|_| {
                    counter = counter.wrapping_add(1);
                    counter
                })
                .collect();
            pb.push(&chunk);
            assert!(pb.len() <= pb.capacity());
        }
        // Last 1000 bytes of the stream, in order.
        let held = pb.to_vec();
        assert_eq!(held.len(), 1_000);
        assert_eq!(*held.last().unwrap(), counter);
        assert!(held.windows(2).all(|w| w[1] == w[0].wrapping_add(1)));
    }

    #[test]
    fn tail_returns_newest_bytes() {
        let mut pb = PreBuffer::new(6);
        pb.push(&[1, 2, 3, 4, 5]);
        assert_eq!(pb.tail(2), Some(vec![4, 5]));
        assert_eq!(pb.tail(6), None);
        pb.clear();
        assert!(pb.is_empty());
    }
}
