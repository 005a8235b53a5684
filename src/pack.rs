//! RVZ packing: a lightweight framing applied after decompression that
//! replaces runs of generator junk with their seed.
//!
//! The decompressed stream is a sequence of records: a big-endian `u32`
//! size whose top bit marks a junk run, followed by either a 68-byte
//! generator seed (junk) or that many literal bytes. A junk record never
//! crosses a 32 KiB boundary of the junk position space, since the disc
//! reseeds the generator there.

use std::io;

use crate::{
    compress::{DecompressionBuffer, Decompressor},
    format::SECTOR_SIZE,
    lfg::{LaggedFibonacci, SEED_BYTES, SEED_WORDS},
};

/// Junk-run decoder layered over the container codec.
///
/// Installed by the chunk cache once the exception lists have been
/// consumed; `backlog` holds codec output past the lists.
pub struct RvzPackDecompressor {
    inner: Decompressor,
    backlog: DecompressionBuffer,
    backlog_read: usize,
    data_offset: u64,
    remaining: u32,
    junk: bool,
    need_seed: bool,
    lfg: LaggedFibonacci,
}

impl RvzPackDecompressor {
    pub(crate) fn new(
        inner: Decompressor,
        backlog: DecompressionBuffer,
        backlog_read: usize,
        data_offset: u64,
    ) -> Self {
        Self {
            inner,
            backlog,
            backlog_read,
            data_offset,
            remaining: 0,
            junk: false,
            need_seed: false,
            lfg: LaggedFibonacci::default(),
        }
    }

    #[inline]
    fn available(&self) -> usize { self.backlog.bytes_written - self.backlog_read }

    /// Pulls more codec output into the backlog. Returns whether any new
    /// bytes arrived.
    fn pump(&mut self, input: &DecompressionBuffer, in_bytes_read: &mut usize) -> io::Result<bool> {
        let before = self.backlog.bytes_written;
        self.inner.decompress(input, in_bytes_read, &mut self.backlog)?;
        Ok(self.backlog.bytes_written != before)
    }

    pub(crate) fn decompress(
        &mut self,
        input: &DecompressionBuffer,
        in_bytes_read: &mut usize,
        out: &mut DecompressionBuffer,
    ) -> io::Result<()> {
        loop {
            if self.remaining == 0 && !self.need_seed {
                if self.available() < 4 {
                    if !self.pump(input, in_bytes_read)? {
                        return Ok(());
                    }
                    continue;
                }
                let size = u32::from_be_bytes(
                    self.backlog.data[self.backlog_read..self.backlog_read + 4]
                        .try_into()
                        .unwrap(),
                );
                self.backlog_read += 4;
                self.junk = size & 0x80000000 != 0;
                self.remaining = size & 0x7FFFFFFF;
                self.need_seed = self.junk;
                if self.remaining == 0 {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "Empty RVZ packed record",
                    ));
                }
                if self.remaining as usize > out.space() {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "RVZ packed record exceeds group size",
                    ));
                }
                continue;
            }
            if self.need_seed {
                if self.available() < SEED_BYTES {
                    if !self.pump(input, in_bytes_read)? {
                        return Ok(());
                    }
                    continue;
                }
                let mut seed = &self.backlog.data[self.backlog_read..self.backlog_read + SEED_BYTES];
                self.lfg.init_with_buf(&mut seed)?;
                self.backlog_read += SEED_BYTES;
                self.lfg.skip(
                    ((self.data_offset + out.bytes_written as u64) % SECTOR_SIZE as u64) as usize,
                );
                self.need_seed = false;
                continue;
            }
            if self.junk {
                let n = self.remaining as usize;
                self.lfg.fill(&mut out.data[out.bytes_written..out.bytes_written + n]);
                out.bytes_written += n;
                self.remaining = 0;
            } else {
                let n = (self.remaining as usize).min(self.available());
                if n == 0 {
                    if !self.pump(input, in_bytes_read)? {
                        return Ok(());
                    }
                    continue;
                }
                out.data[out.bytes_written..out.bytes_written + n].copy_from_slice(
                    &self.backlog.data[self.backlog_read..self.backlog_read + n],
                );
                out.bytes_written += n;
                self.backlog_read += n;
                self.remaining -= n as u32;
            }
        }
    }

    pub(crate) fn done(&self) -> bool {
        self.remaining == 0
            && !self.need_seed
            && self.available() == 0
            && self.inner.done()
    }
}

/// Scans a group for junk runs and builds the packed record stream.
/// Returns `None` when no run was found (the group is stored unpacked).
///
/// `data_offset` is the group's offset within the junk position space (raw
/// disc offsets, or partition data offsets counted at 0x7C00 per sector).
/// With `allow_junk_reuse` unset, only runs starting on a 32 KiB boundary
/// of that space are packed.
pub fn rvz_pack(
    data: &[u8],
    data_offset: u64,
    disc_id: [u8; 4],
    disc_num: u8,
    allow_junk_reuse: bool,
    lfg: &mut LaggedFibonacci,
) -> Option<Vec<u8>> {
    // Split at the generator's reseed boundaries
    let mut spans = Vec::new();
    let mut pos = 0usize;
    while pos < data.len() {
        let span_end = (((data_offset + pos as u64) / SECTOR_SIZE as u64 + 1)
            * SECTOR_SIZE as u64
            - data_offset) as usize;
        let end = span_end.min(data.len());
        let junk_pos = data_offset + pos as u64;
        let eligible = allow_junk_reuse || junk_pos % SECTOR_SIZE as u64 == 0;
        // A junk record costs a header and a seed; shorter runs stay literal
        let is_junk = eligible
            && end - pos > SEED_BYTES + 4
            && lfg.check(&data[pos..end], disc_id, disc_num, junk_pos) == end - pos;
        spans.push((pos, end, is_junk));
        pos = end;
    }
    if !spans.iter().any(|&(_, _, junk)| junk) {
        return None;
    }

    let mut out = Vec::with_capacity(data.len() / 2);
    let mut literal_start = None;
    let flush_literal = |out: &mut Vec<u8>, start: Option<usize>, end: usize| {
        if let Some(start) = start {
            out.extend_from_slice(&((end - start) as u32).to_be_bytes());
            out.extend_from_slice(&data[start..end]);
        }
    };
    for &(start, end, is_junk) in &spans {
        if is_junk {
            flush_literal(&mut out, literal_start.take(), start);
            out.extend_from_slice(&(((end - start) as u32) | 0x80000000).to_be_bytes());
            let mut seed = [0u32; SEED_WORDS];
            let sector = ((data_offset + start as u64) / SECTOR_SIZE as u64) as u32;
            LaggedFibonacci::generate_seed_be(&mut seed, disc_id, disc_num, sector);
            out.extend_from_slice(zerocopy::IntoBytes::as_bytes(&seed[..]));
        } else if literal_start.is_none() {
            literal_start = Some(start);
        }
    }
    flush_literal(&mut out, literal_start, data.len());
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::Compression;

    fn unpack(packed: &[u8], data_offset: u64, out_size: usize) -> Vec<u8> {
        let inner = Decompressor::new(Compression::None, &[], out_size).unwrap();
        let backlog = DecompressionBuffer::new(packed.len()).unwrap();
        let mut pack = RvzPackDecompressor::new(inner, backlog, 0, data_offset);
        let mut input = DecompressionBuffer::new(packed.len()).unwrap();
        input.data.copy_from_slice(packed);
        input.bytes_written = packed.len();
        let mut out = DecompressionBuffer::new(out_size).unwrap();
        let mut in_bytes_read = 0usize;
        pack.decompress(&input, &mut in_bytes_read, &mut out).unwrap();
        assert!(pack.done());
        out.filled().to_vec()
    }

    #[test]
    fn test_pack_round_trip_junk_and_literal() {
        let disc_id = [0x52, 0x4D, 0x43, 0x45];
        let mut data = vec![0u8; SECTOR_SIZE * 3];
        // Sector 0: literal, sectors 1-2: junk
        for (i, b) in data[..SECTOR_SIZE].iter_mut().enumerate() {
            *b = (i % 253) as u8;
        }
        let mut lfg = LaggedFibonacci::default();
        for sector in 1..3 {
            lfg.init_with_seed(disc_id, 0, (sector * SECTOR_SIZE) as u64);
            lfg.fill(&mut data[sector * SECTOR_SIZE..(sector + 1) * SECTOR_SIZE]);
        }

        let packed = rvz_pack(&data, 0, disc_id, 0, true, &mut lfg).unwrap();
        // Two junk records replace two sectors of junk
        assert!(packed.len() < SECTOR_SIZE + 2 * (4 + SEED_BYTES) + 8);
        assert_eq!(unpack(&packed, 0, data.len()), data);
    }

    #[test]
    fn test_pack_unaligned_group() {
        let disc_id = [0x52, 0x4D, 0x43, 0x45];
        let data_offset = SECTOR_SIZE as u64 / 2;
        let mut data = vec![0u8; SECTOR_SIZE * 2];
        let mut lfg = LaggedFibonacci::default();
        // Junk spanning the partial leading span and the following sector
        lfg.init_with_seed(disc_id, 0, data_offset);
        lfg.fill(&mut data[..SECTOR_SIZE / 2]);
        lfg.init_with_seed(disc_id, 0, SECTOR_SIZE as u64);
        lfg.fill(&mut data[SECTOR_SIZE / 2..SECTOR_SIZE / 2 + SECTOR_SIZE]);
        for (i, b) in data[SECTOR_SIZE / 2 + SECTOR_SIZE..].iter_mut().enumerate() {
            *b = (i | 1) as u8;
        }

        let packed = rvz_pack(&data, data_offset, disc_id, 0, true, &mut lfg).unwrap();
        assert_eq!(unpack(&packed, data_offset, data.len()), data);
    }

    #[test]
    fn test_no_junk_returns_none() {
        let mut lfg = LaggedFibonacci::default();
        let data = vec![0x42u8; SECTOR_SIZE];
        assert!(rvz_pack(&data, 0, [0x41; 4], 0, true, &mut lfg).is_none());
    }

    #[test]
    fn test_junk_reuse_gate() {
        let disc_id = [0x52, 0x4D, 0x43, 0x45];
        let data_offset = 0x1000u64;
        let mut data = vec![0u8; SECTOR_SIZE - 0x1000];
        let mut lfg = LaggedFibonacci::default();
        lfg.init_with_seed(disc_id, 0, data_offset);
        lfg.fill(&mut data);
        // The run matches but starts mid-sector, so it only packs when junk
        // reuse is allowed
        assert!(rvz_pack(&data, data_offset, disc_id, 0, true, &mut lfg).is_some());
        assert!(rvz_pack(&data, data_offset, disc_id, 0, false, &mut lfg).is_none());
    }
}
