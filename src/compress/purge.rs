//! The Purge codec: zero runs are elided from the stored stream as gaps
//! between [`PurgeSegment`] records, and a trailing SHA-1 covers the
//! exception lists plus the reconstructed payload.

use std::{io, mem::size_of};

use sha1::{Digest, Sha1};
use zerocopy::{FromBytes, IntoBytes};

use crate::{
    common::HashBytes,
    compress::DecompressionBuffer,
    format::PurgeSegment,
    util::array_ref,
};

/// End a segment only when the zero run is longer than a fresh segment
/// header.
const MIN_ZERO_RUN: usize = size_of::<PurgeSegment>() * 2;

/// Streaming Purge decoder.
///
/// Assumes `in_bytes_read` on the first call covers the exception-list
/// bytes (including alignment padding), which are folded into the SHA-1.
pub struct PurgeDecompressor {
    decompressed_size: usize,
    segment: PurgeSegment,
    segment_bytes_written: usize,
    have_segment: bool,
    started: bool,
    hasher: Sha1,
    done: bool,
}

impl PurgeDecompressor {
    pub fn new(decompressed_size: usize) -> Self {
        Self {
            decompressed_size,
            segment: PurgeSegment::default(),
            segment_bytes_written: 0,
            have_segment: false,
            started: false,
            hasher: Sha1::new(),
            done: false,
        }
    }

    pub fn done(&self) -> bool { self.done }

    pub fn decompress(
        &mut self,
        input: &DecompressionBuffer,
        in_bytes_read: &mut usize,
        out: &mut DecompressionBuffer,
    ) -> io::Result<()> {
        if self.done {
            return Ok(());
        }
        if !self.started {
            // The exception lists contribute to the hash but not the output
            self.hasher.update(&input.data[..*in_bytes_read]);
            self.started = true;
        }
        let hash_pos = input
            .data
            .len()
            .checked_sub(size_of::<HashBytes>())
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "Purge stream too short"))?;
        loop {
            if *in_bytes_read >= hash_pos {
                // All segments consumed; wait for the trailing hash
                if input.bytes_written < input.data.len() {
                    return Ok(());
                }
                if out.bytes_written > self.decompressed_size {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "Purge output exceeds decompressed size",
                    ));
                }
                // The gap after the last segment is implicit zeroes
                out.bytes_written = self.decompressed_size;
                self.hasher.update(&out.data[..self.decompressed_size]);
                let hash: HashBytes = self.hasher.finalize_reset().into();
                let expected = array_ref![input.data, hash_pos, 20];
                *in_bytes_read = input.data.len();
                if hash != *expected {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "Purge stream hash mismatch",
                    ));
                }
                self.done = true;
                return Ok(());
            }
            if !self.have_segment {
                if input.bytes_written.min(hash_pos) - *in_bytes_read < size_of::<PurgeSegment>() {
                    return Ok(());
                }
                self.segment =
                    PurgeSegment::read_from_bytes(&input.data[*in_bytes_read..][..8]).unwrap();
                *in_bytes_read += size_of::<PurgeSegment>();
                self.segment_bytes_written = 0;
                self.have_segment = true;
                let end = self.segment.offset.get() as usize + self.segment.size.get() as usize;
                if end > self.decompressed_size || end > out.data.len() {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "Purge segment out of bounds",
                    ));
                }
            }
            let remaining = self.segment.size.get() as usize - self.segment_bytes_written;
            let available = input.bytes_written.min(hash_pos) - *in_bytes_read;
            let n = remaining.min(available);
            if n == 0 && remaining > 0 {
                return Ok(());
            }
            let dst =
                self.segment.offset.get() as usize + self.segment_bytes_written;
            out.data[dst..dst + n].copy_from_slice(&input.data[*in_bytes_read..*in_bytes_read + n]);
            *in_bytes_read += n;
            self.segment_bytes_written += n;
            // Gaps before and inside segments are already zero (the output
            // buffer starts zeroed); only the high-water mark moves.
            out.bytes_written = out.bytes_written.max(dst + n);
            if self.segment_bytes_written == self.segment.size.get() as usize {
                self.have_segment = false;
            }
        }
    }
}

/// Purge encoder: builds the segment stream for one group and appends the
/// trailing SHA-1.
pub struct PurgeCompressor {
    buffer: Vec<u8>,
    hasher: Sha1,
    logical_pos: usize,
}

impl PurgeCompressor {
    pub fn new(capacity: usize) -> Self {
        Self { buffer: Vec::with_capacity(capacity), hasher: Sha1::new(), logical_pos: 0 }
    }

    pub fn start(&mut self) {
        self.buffer.clear();
        self.hasher.reset();
        self.logical_pos = 0;
    }

    /// Folds the exception-list bytes into the hash without storing them.
    pub fn add_preceding_data(&mut self, data: &[u8]) { self.hasher.update(data) }

    pub fn compress(&mut self, data: &[u8]) -> io::Result<bool> {
        self.hasher.update(data);
        let mut pos = 0;
        while pos < data.len() {
            // Skip the zero gap, then extend the segment until a zero run
            // long enough to be worth a fresh header
            while pos < data.len() && data[pos] == 0 {
                pos += 1;
            }
            if pos == data.len() {
                break;
            }
            let start = pos;
            let mut end = pos;
            while pos < data.len() {
                if data[pos] != 0 {
                    pos += 1;
                    end = pos;
                    continue;
                }
                let zero_start = pos;
                while pos < data.len() && data[pos] == 0 && pos - zero_start < MIN_ZERO_RUN {
                    pos += 1;
                }
                if pos - zero_start >= MIN_ZERO_RUN {
                    break;
                }
                end = pos;
            }
            let segment = PurgeSegment {
                offset: ((self.logical_pos + start) as u32).into(),
                size: ((end - start) as u32).into(),
            };
            if self.buffer.len() + size_of::<PurgeSegment>() + (end - start)
                > self.buffer.capacity()
            {
                return Ok(false);
            }
            self.buffer.extend_from_slice(segment.as_bytes());
            self.buffer.extend_from_slice(&data[start..end]);
        }
        self.logical_pos += data.len();
        Ok(true)
    }

    pub fn end(&mut self) -> io::Result<bool> {
        let hash: HashBytes = self.hasher.finalize_reset().into();
        if self.buffer.len() + hash.len() > self.buffer.capacity() {
            return Ok(false);
        }
        self.buffer.extend_from_slice(&hash);
        Ok(true)
    }

    pub fn bytes(&self) -> &[u8] { &self.buffer }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(payload: &[u8], preceding: &[u8]) -> Vec<u8> {
        let mut compressor = PurgeCompressor::new(payload.len() + 0x100);
        compressor.start();
        compressor.add_preceding_data(preceding);
        assert!(compressor.compress(payload).unwrap());
        assert!(compressor.end().unwrap());
        let stored = compressor.bytes().to_vec();

        let mut input = DecompressionBuffer::new(preceding.len() + stored.len()).unwrap();
        input.data[..preceding.len()].copy_from_slice(preceding);
        input.data[preceding.len()..].copy_from_slice(&stored);
        input.bytes_written = input.data.len();
        let mut out = DecompressionBuffer::new(payload.len()).unwrap();
        let mut decompressor = PurgeDecompressor::new(payload.len());
        let mut in_bytes_read = preceding.len();
        decompressor.decompress(&input, &mut in_bytes_read, &mut out).unwrap();
        assert!(decompressor.done());
        out.data[..out.bytes_written].to_vec()
    }

    #[test]
    fn test_round_trip_sparse() {
        let mut payload = vec![0u8; 0x1000];
        payload[0x10..0x20].fill(0xAA);
        payload[0x800..0x9FF].fill(0x55);
        payload[0xFFF] = 1;
        assert_eq!(round_trip(&payload, &[]), payload);
    }

    #[test]
    fn test_round_trip_all_zero() {
        let payload = vec![0u8; 0x400];
        assert_eq!(round_trip(&payload, &[0, 0, 0, 0]), payload);
    }

    #[test]
    fn test_round_trip_dense() {
        let payload: Vec<u8> = (0..0x800u32).map(|i| (i % 255) as u8 | 1).collect();
        assert_eq!(round_trip(&payload, &[]), payload);
    }

    #[test]
    fn test_hash_mismatch_detected() {
        let payload = vec![0xABu8; 0x100];
        let mut compressor = PurgeCompressor::new(0x200);
        compressor.start();
        assert!(compressor.compress(&payload).unwrap());
        assert!(compressor.end().unwrap());
        let mut stored = compressor.bytes().to_vec();
        let len = stored.len();
        stored[len - 1] ^= 0xFF;

        let mut input = DecompressionBuffer::new(stored.len()).unwrap();
        input.data.copy_from_slice(&stored);
        input.bytes_written = stored.len();
        let mut out = DecompressionBuffer::new(payload.len()).unwrap();
        let mut decompressor = PurgeDecompressor::new(payload.len());
        let mut in_bytes_read = 0;
        assert!(decompressor.decompress(&input, &mut in_bytes_read, &mut out).is_err());
    }
}
