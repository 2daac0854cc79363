//! Buffered substream store.
//!
//! Each logical substream accumulates a pair of append-only buffers: 32-bit
//! per-variant size words in variant order, and the concatenated payload
//! bytes. The store treats the words as opaque; key streams pack a presence
//! flag into the high bit, database streams store plain lengths. When the
//! data buffer crosses its threshold the pair is handed off as a package
//! and the buffers restart empty.

/// Flush threshold for ordinary field and database streams.
pub const MAX_BUFFER_SIZE: usize = 8 << 20;

/// Flush threshold for the genotype stream, which benefits from long
/// PBWT runs within one part.
pub const MAX_BUFFER_GT_SIZE: usize = 256 << 20;

/// Per-stream append buffer pair.
#[derive(Debug, Default)]
pub struct StreamBuffer {
    sizes: Vec<u32>,
    data: Vec<u8>,
    max_size: usize,
}

impl StreamBuffer {
    pub fn new(max_size: usize) -> Self {
        Self {
            sizes: Vec::new(),
            data: Vec::new(),
            max_size,
        }
    }

    /// Append one variant's entry: its element count and payload bytes.
    pub fn append(&mut self, size_entry: u32, data: &[u8]) {
        self.sizes.push(size_entry);
        self.data.extend_from_slice(data);
    }

    /// True when the data buffer has crossed the flush threshold.
    pub fn flushed(&self) -> bool {
        self.data.len() >= self.max_size
    }

    pub fn is_empty(&self) -> bool {
        self.sizes.is_empty() && self.data.is_empty()
    }

    /// Hand off both buffers, leaving this stream empty. A prefix sum over
    /// the returned sizes recovers per-variant slices of the data.
    pub fn take(&mut self) -> (Vec<u32>, Vec<u8>) {
        (
            std::mem::take(&mut self.sizes),
            std::mem::take(&mut self.data),
        )
    }

    /// Read-only views for end-of-compression graph discovery.
    pub fn sizes(&self) -> &[u32] {
        &self.sizes
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_take() {
        let mut buf = StreamBuffer::new(MAX_BUFFER_SIZE);
        buf.append(3, b"abc");
        buf.append(0, b"");
        buf.append(2, b"xy");

        let (sizes, data) = buf.take();
        assert_eq!(sizes, vec![3, 0, 2]);
        assert_eq!(data, b"abcxy");
        assert!(buf.is_empty());

        // Prefix-sum reassembly recovers the per-variant slices.
        let mut off = 0usize;
        let slices: Vec<&[u8]> = sizes
            .iter()
            .map(|&s| {
                let sl = &data[off..off + s as usize];
                off += s as usize;
                sl
            })
            .collect();
        assert_eq!(slices, vec![&b"abc"[..], &b""[..], &b"xy"[..]]);
    }

    #[test]
    fn test_flush_threshold() {
        let mut buf = StreamBuffer::new(4);
        buf.append(2, b"ab");
        assert!(!buf.flushed());
        buf.append(2, b"cd");
        assert!(buf.flushed());
        buf.take();
        assert!(!buf.flushed());
    }
}
